use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("Oracle unreachable after {attempts} attempts: {reason}")]
    OracleTransport { attempts: usize, reason: String },
    #[error("Could not disambiguate the last byte of block {block} (position {position}): every valid padding vanished on re-verification")]
    OracleAmbiguous { block: usize, position: usize },
    #[error("No candidate produced valid padding for block {block} at position {position}")]
    DecryptionFailed { block: usize, position: usize },
    #[error("Malformed padding: last byte {value:#04x} is outside 1..={block_size}")]
    MalformedPadding {
        value: u8,
        block_size: usize,
        unstripped: Vec<u8>,
    },
    #[error("Block {block} differs from dec_oracle: recovered {recovered}, service says {reported}")]
    VerificationMismatch {
        block: usize,
        recovered: String,
        reported: String,
    },
    #[error("Invalid input when preforming padding oracle attack: {0}")]
    InvalidInput(String),
}
