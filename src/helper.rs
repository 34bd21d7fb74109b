use std::{fs, path::Path, time::Duration};

use base64::prelude::*;
use clap::ValueEnum;
use strum_macros::Display;

use crate::errors::DecryptError;

#[derive(Display, Debug, Clone, ValueEnum, PartialEq)]
pub enum Encoding {
    HEX,
    B64,
}

#[derive(Debug)]
pub enum Messages {
    ByteFound(u8, usize),
    AttackComplete,
}

/// Knobs shared by every oracle query of one attack run.
#[derive(Clone, Debug)]
pub struct Config {
    pub blk_size: usize,
    pub threads: usize,
    pub retry: usize,
    pub timeout: Duration,
    pub keep_alive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blk_size: 8,
            threads: 10,
            retry: 5,
            timeout: Duration::from_millis(5000),
            keep_alive: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), DecryptError> {
        if self.blk_size == 0 || self.blk_size > 255 {
            return Err(DecryptError::InvalidInput(format!(
                "block size {} must be between 1 and 255",
                self.blk_size
            )));
        }
        if self.threads == 0 {
            return Err(DecryptError::InvalidInput("at least one thread is required".into()));
        }
        Ok(())
    }
}

pub fn encode_ct(ct: &[u8], encoding: &Encoding) -> String {
    match encoding {
        Encoding::HEX => format!("0x{}", hex::encode(ct)),
        Encoding::B64 => BASE64_STANDARD.encode(ct),
    }
}

pub fn decode_ct(ct: &str, encoding: &Encoding) -> Result<Vec<u8>, DecryptError> {
    let ct = ct.trim();
    match encoding {
        Encoding::HEX => {
            let digits = ct
                .strip_prefix("0x")
                .or_else(|| ct.strip_prefix("0X"))
                .unwrap_or(ct);
            hex::decode(digits)
                .map_err(|e| DecryptError::InvalidInput(format!("invalid hex string {ct:?}: {e}")))
        }
        Encoding::B64 => BASE64_STANDARD
            .decode(ct)
            .map_err(|e| DecryptError::InvalidInput(format!("invalid b64 string {ct:?}: {e}"))),
    }
}

pub fn xor_bytes(left: &[u8], right: &[u8]) -> Vec<u8> {
    left.iter().zip(right.iter()).map(|(x, y)| x ^ y).collect()
}

/// Reads the oracle port from the first line of `path`.
pub fn read_port_file(path: &Path) -> Result<u16, DecryptError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        DecryptError::InvalidInput(format!("could not read port file {}: {e}", path.display()))
    })?;
    let line = contents.lines().next().unwrap_or("").trim();
    line.parse().map_err(|e| {
        DecryptError::InvalidInput(format!(
            "port file {} does not start with a port number ({line:?}): {e}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("0xebf9cedf", vec![0xeb, 0xf9, 0xce, 0xdf])]
    #[case("EBF9CEDF", vec![0xeb, 0xf9, 0xce, 0xdf])]
    #[case("0X00ff", vec![0x00, 0xff])]
    fn decodes_hex_with_or_without_prefix(#[case] input: &str, #[case] expected: Vec<u8>) {
        assert_eq!(decode_ct(input, &Encoding::HEX).unwrap(), expected);
    }

    #[test]
    fn hex_encoding_is_prefixed_and_zero_padded() {
        assert_eq!(encode_ct(&[0x00, 0x0a, 0xff], &Encoding::HEX), "0x000aff");
    }

    #[test]
    fn b64_decodes() {
        assert_eq!(decode_ct("QUI=", &Encoding::B64).unwrap(), b"AB".to_vec());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            decode_ct("0xzz", &Encoding::HEX),
            Err(DecryptError::InvalidInput(_))
        ));
    }

    #[test]
    fn port_file_reads_first_line() {
        let path = std::env::temp_dir().join(format!("padbreak-port-{}", std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, " 5123 \nignored").unwrap();
        assert_eq!(read_port_file(&path).unwrap(), 5123);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn config_rejects_zero_block_size() {
        let config = Config {
            blk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
