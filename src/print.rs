use std::{
    cmp::min,
    collections::HashMap,
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use colored::Colorize;
use tokio::{
    select, spawn,
    sync::{Mutex, mpsc::Receiver},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::helper::Messages;

pub fn fmt_bytes_custom(bytes: &[u8]) -> String {
    let mut base = String::new();
    for &byte in bytes {
        if byte.is_ascii_graphic() || byte == b' ' {
            base.push(byte as char);
        } else {
            base += format!("\\x{:02X}", byte).as_str();
        }
    }
    base
}

/// Recovered plaintext as text when it is clean UTF-8, escaped byte by byte otherwise.
pub fn fmt_plaintext(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t')) => {
            text.to_string()
        }
        _ => fmt_bytes_custom(bytes),
    }
}

/// Spinner glyph that follows `glyph` on the next tick.
fn next_glyph(glyph: u8) -> u8 {
    let loading_map = HashMap::from([(b'|', b'/'), (b'/', b'-'), (b'-', b'\\'), (b'\\', b'|')]);
    *loading_map.get(&glyph).unwrap_or(&b'-')
}

///displays a progress bar on stderr. updates to the bytes are received from rx,
///the returned handle finishes once `Messages::AttackComplete` arrives or every sender is gone
pub fn progress_bar(ct_len: usize, mut rx: Receiver<Messages>) -> JoinHandle<()> {
    let curr_results_shared = Arc::new(Mutex::new(vec![b'-'; ct_len]));
    let curr_results_modified_shared = Arc::new(Mutex::new(vec![false; ct_len]));
    let curr_results_shared_copy = curr_results_shared.clone();
    let curr_results_modified_shared_copy = curr_results_modified_shared.clone();

    let token = CancellationToken::new();
    let cloned_token = token.clone();
    spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                Messages::ByteFound(byte, pos) if pos < ct_len => {
                    curr_results_shared.lock().await[pos] = byte;
                    curr_results_modified_shared.lock().await[pos] = true;
                }
                Messages::ByteFound(..) => {}
                Messages::AttackComplete => break,
            }
        }
        token.cancel();
    });
    spawn(async move {
        let truncate_len = 64;
        loop {
            select! {
                _ = sleep(Duration::from_millis(250)) => {},
                _ = cloned_token.cancelled() => {
                    eprint!("\r\x1B[2K");
                    let _ = io::stderr().flush();
                    return;
                }
            }
            let mut curr_results = curr_results_shared_copy.lock().await;
            let curr_results_modified = curr_results_modified_shared_copy.lock().await;
            for i in 0..curr_results.len() {
                //skip results that have been solved
                if curr_results_modified[i] {
                    continue;
                }
                curr_results[i] = next_glyph(curr_results[i]);
            }
            let working_chunk = curr_results_modified
                .chunks(truncate_len)
                .position(|c| c.contains(&false) && c.contains(&true))
                .unwrap_or(0);

            let end = min((working_chunk + 1) * truncate_len, curr_results.len());
            let byte_string = fmt_bytes_custom(&curr_results[working_chunk * truncate_len..end]);
            eprint!("\r\x1B[2K{}", byte_string.cyan());
            if ct_len > truncate_len {
                eprint!("...");
            }
            let _ = io::stderr().flush();
        }
    })
}
