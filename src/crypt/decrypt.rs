use log::{info, warn};
use tokio::{sync::mpsc::Sender, task::JoinSet};

use crate::{
    crypt::{
        Session, forward_messages,
        padding::{has_valid_padding, strip},
    },
    errors::DecryptError,
    helper::Messages,
    oracle::Oracle,
};

/// Recovers and unpads the plaintext of `ct`, laid out as `C0 || C1 || ... || Cn`
/// with `C0` the IV or the ciphertext block preceding `C1`.
///
/// Padding is stripped once, from the tail of the last block. When it is
/// malformed the returned error carries the unstripped plaintext.
pub async fn padding_oracle_decrypt<O: Oracle>(
    ct: &[u8],
    session: &Session<O>,
    tx: Option<Sender<Messages>>,
) -> Result<Vec<u8>, DecryptError> {
    let plaintext = padding_oracle_decrypt_raw(ct, session, tx).await?;
    let blk_size = session.blk_size();
    if !has_valid_padding(&plaintext[plaintext.len() - blk_size..]) {
        warn!("last block does not end in a uniform padding run");
    }
    strip(&plaintext, blk_size)
}

/// Like [`padding_oracle_decrypt`] but leaves the padding in place.
pub async fn padding_oracle_decrypt_raw<O: Oracle>(
    ct: &[u8],
    session: &Session<O>,
    tx: Option<Sender<Messages>>,
) -> Result<Vec<u8>, DecryptError> {
    let blk_size = session.blk_size();
    if ct.is_empty() || ct.len() % blk_size != 0 {
        return Err(DecryptError::InvalidInput(format!(
            "ciphertext length {} is not a multiple of the block size {blk_size}",
            ct.len()
        )));
    }
    let blocks: Vec<Vec<u8>> = ct.chunks(blk_size).map(Vec::from).collect();
    if blocks.len() < 2 {
        return Err(DecryptError::InvalidInput(
            "Not enough blocks for classic attack, need C0 and at least one more".into(),
        ));
    }

    let mut futures_set = JoinSet::new();
    for block_index in 1..blocks.len() {
        let session = session.clone();
        let preceding = blocks[block_index - 1].clone();
        let fixed = blocks[block_index].clone();
        let local_tx = tx.clone().map(|tx| {
            let preceding = preceding.clone();
            forward_messages(
                tx,
                Box::new(move |msg| match msg {
                    Messages::ByteFound(byte, pos) => {
                        Messages::ByteFound(byte ^ preceding[pos], (block_index - 1) * blk_size + pos)
                    }
                    other => other,
                }),
            )
        });
        // only C(i-1) turns the intermediary into plaintext, the oracle never sees it
        futures_set.spawn(async move {
            let intermediary = session.decrypt_block(block_index, &fixed, local_tx).await?;
            info!(
                "block {block_index} solved, intermediary {}",
                hex::encode(intermediary.as_bytes())
            );
            Ok::<_, DecryptError>((block_index, intermediary.xor_with(&preceding)))
        });
    }

    let mut plaintext_blocks = vec![vec![]; blocks.len() - 1];
    while let Some(res) = futures_set.join_next().await {
        match res {
            Ok(Ok((block_index, plaintext_block))) => {
                plaintext_blocks[block_index - 1] = plaintext_block;
            }
            Ok(Err(e)) => return Err(e),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {}
        }
    }
    Ok(plaintext_blocks.concat())
}
