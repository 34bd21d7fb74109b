use log::info;
use rand::RngCore;
use tokio::sync::mpsc::Sender;

use crate::{
    crypt::{Session, forward_messages, padding::pad},
    errors::DecryptError,
    helper::Messages,
    oracle::Oracle,
};

/// Builds a ciphertext `C0 || C1 || ... || Cn` that the oracle's peer decrypts
/// to `pt`.
///
/// `seed` becomes `Cn`; any block works, a random one is drawn when it is
/// absent. Every earlier block is the intermediary of its successor XOR the
/// plaintext block it must produce, so blocks are solved back to front.
pub async fn padding_oracle_forge<O: Oracle>(
    pt: &[u8],
    seed: Option<&[u8]>,
    session: &Session<O>,
    tx: Option<Sender<Messages>>,
) -> Result<Vec<u8>, DecryptError> {
    let blk_size = session.blk_size();
    if pt.is_empty() {
        return Err(DecryptError::InvalidInput(
            "Invalid plaintext length, nothing to forge".into(),
        ));
    }
    let seed = match seed {
        Some(seed) if seed.len() == blk_size => seed.to_vec(),
        Some(seed) => {
            return Err(DecryptError::InvalidInput(format!(
                "seed block is {} bytes, expected {blk_size}",
                seed.len()
            )));
        }
        None => {
            let mut seed = vec![0u8; blk_size];
            rand::rng().fill_bytes(&mut seed);
            seed
        }
    };

    let blocks: Vec<Vec<u8>> = pad(pt, blk_size).chunks(blk_size).map(Vec::from).collect();
    let mut ciphertext_blocks = vec![vec![]; blocks.len() + 1];
    ciphertext_blocks[blocks.len()] = seed;
    for block_index in (0..blocks.len()).rev() {
        let target = blocks[block_index].clone();
        let local_tx = tx.clone().map(|tx| {
            forward_messages(
                tx,
                Box::new(move |msg| match msg {
                    Messages::ByteFound(byte, pos) => {
                        Messages::ByteFound(byte ^ target[pos], block_index * blk_size + pos)
                    }
                    other => other,
                }),
            )
        });
        let intermediary = session
            .decrypt_block(block_index + 1, &ciphertext_blocks[block_index + 1], local_tx)
            .await?;
        ciphertext_blocks[block_index] = intermediary.xor_with(&blocks[block_index]);
        info!(
            "forged block {block_index}: {}",
            hex::encode(&ciphertext_blocks[block_index])
        );
    }
    Ok(ciphertext_blocks.concat())
}
