use crate::errors::DecryptError;

/// Plaintext suffix a block must end in for a padding run of length `count`:
/// `count` bytes of value `count`.
pub fn expected_padding(count: u8) -> Vec<u8> {
    vec![count; count as usize]
}

/// Whether `block` ends in a non-empty run of `k` bytes of value `k`.
pub fn has_valid_padding(block: &[u8]) -> bool {
    match block.last() {
        Some(&k) if k >= 1 && k as usize <= block.len() => {
            block[block.len() - k as usize..].iter().all(|&b| b == k)
        }
        _ => false,
    }
}

/// Appends padding so the result is a whole number of blocks. Aligned input
/// gets a full block of padding.
pub fn pad(data: &[u8], blk_size: usize) -> Vec<u8> {
    let pad_byte = blk_size - data.len() % blk_size;
    let mut padded = data.to_vec();
    padded.extend(std::iter::repeat_n(pad_byte as u8, pad_byte));
    padded
}

/// Removes the trailing padding announced by the last byte.
///
/// Only the last byte is consulted. A value of zero, a value above `blk_size`
/// or one longer than the input is rejected with the input handed back
/// untouched inside the error.
pub fn strip(plaintext: &[u8], blk_size: usize) -> Result<Vec<u8>, DecryptError> {
    let value = plaintext.last().copied().unwrap_or(0);
    let len = value as usize;
    if len == 0 || len > blk_size || len > plaintext.len() {
        return Err(DecryptError::MalformedPadding {
            value,
            block_size: blk_size,
            unstripped: plaintext.to_vec(),
        });
    }
    Ok(plaintext[..plaintext.len() - len].to_vec())
}
