use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time::{sleep, timeout},
};

use crate::{
    errors::DecryptError,
    helper::{Config, Encoding, decode_ct, encode_ct},
};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// A padding oracle: `true` iff decrypting `fixed` and XOR-ing the result with
/// `candidate` leaves valid trailing padding.
#[async_trait]
pub trait Oracle: 'static + Send + Sync {
    async fn query(&self, candidate: &[u8], fixed: &[u8]) -> Result<bool, DecryptError>;
}

#[async_trait]
impl<O: Oracle> Oracle for Arc<O> {
    async fn query(&self, candidate: &[u8], fixed: &[u8]) -> Result<bool, DecryptError> {
        self.as_ref().query(candidate, fixed).await
    }
}

#[async_trait]
impl<O: Oracle + ?Sized> Oracle for Box<O> {
    async fn query(&self, candidate: &[u8], fixed: &[u8]) -> Result<bool, DecryptError> {
        self.as_ref().query(candidate, fixed).await
    }
}

pub fn pad_request(c0: &[u8], c1: &[u8]) -> String {
    format!(
        "pad_oracle,{},{}\n",
        encode_ct(c0, &Encoding::HEX),
        encode_ct(c1, &Encoding::HEX)
    )
}

pub fn dec_request(c0: &[u8], c1: &[u8]) -> String {
    format!(
        "dec_oracle,{},{}\n",
        encode_ct(c0, &Encoding::HEX),
        encode_ct(c1, &Encoding::HEX)
    )
}

/// Runs `try_func` until it succeeds, at most `retry + 1` times, backing off a
/// little longer after every failure.
async fn with_retry<T, F, Fut>(retry: usize, try_func: F) -> Result<T, DecryptError>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut reason = String::new();
    for attempt in 0..=retry {
        match try_func(attempt).await {
            Ok(val) => return Ok(val),
            Err(e) => {
                warn!("oracle attempt {}/{} failed: {e}", attempt + 1, retry + 1);
                reason = e.to_string();
                if attempt < retry {
                    sleep(RETRY_BACKOFF * (attempt as u32 + 1)).await;
                }
            }
        }
    }
    Err(DecryptError::OracleTransport {
        attempts: retry + 1,
        reason,
    })
}

/// Client for the line-oriented `pad_oracle` / `dec_oracle` service.
pub struct TcpOracle {
    addr: String,
    timeout: Duration,
    retry: usize,
    keep_alive: bool,
    idle: Mutex<Vec<TcpStream>>,
}

impl TcpOracle {
    pub fn new(host: &str, port: u16, config: &Config) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            timeout: config.timeout,
            retry: config.retry,
            keep_alive: config.keep_alive,
            idle: Mutex::new(vec![]),
        }
    }

    /// Asks the service for the raw decryption of `c1` under `c0`.
    /// Diagnostic only, the attack never calls this.
    pub async fn dec_query(&self, c0: &[u8], c1: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let response = self.exchange(&dec_request(c0, c1), 2 + 2 * c1.len()).await?;
        let text = String::from_utf8_lossy(&response);
        decode_ct(&text, &Encoding::HEX)
    }

    async fn exchange(&self, request: &str, response_len: usize) -> Result<Vec<u8>, DecryptError> {
        with_retry(self.retry, |_| self.exchange_timed(request, response_len)).await
    }

    async fn exchange_timed(&self, request: &str, response_len: usize) -> io::Result<Vec<u8>> {
        match timeout(self.timeout, self.exchange_once(request, response_len)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no answer from {} within {:?}", self.addr, self.timeout),
            )),
        }
    }

    /// A pooled stream the service has since closed is replaced by one fresh
    /// connection within the same attempt.
    async fn exchange_once(&self, request: &str, response_len: usize) -> io::Result<Vec<u8>> {
        if self.keep_alive {
            let pooled = self.idle.lock().await.pop();
            if let Some(stream) = pooled {
                match send_request(stream, request, response_len).await {
                    Ok((stream, response)) => {
                        self.idle.lock().await.push(stream);
                        return Ok(response);
                    }
                    Err(e) => debug!("pooled connection to {} went stale: {e}", self.addr),
                }
            }
        }
        let stream = TcpStream::connect(&self.addr).await?;
        let (stream, response) = send_request(stream, request, response_len).await?;
        if self.keep_alive {
            self.idle.lock().await.push(stream);
        }
        Ok(response)
    }
}

async fn send_request(
    mut stream: TcpStream,
    request: &str,
    response_len: usize,
) -> io::Result<(TcpStream, Vec<u8>)> {
    trace!("-> {}", request.trim_end());
    stream.write_all(request.as_bytes()).await?;
    let mut response = vec![0u8; response_len];
    stream.read_exact(&mut response).await?;
    Ok((stream, response))
}

#[async_trait]
impl Oracle for TcpOracle {
    async fn query(&self, candidate: &[u8], fixed: &[u8]) -> Result<bool, DecryptError> {
        let response = self.exchange(&pad_request(candidate, fixed), 1).await?;
        Ok(response[0] == b'1')
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::future::join_all;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    fn test_config(retry: usize) -> Config {
        Config {
            retry,
            timeout: Duration::from_millis(500),
            ..Config::default()
        }
    }

    /// Accepts connections forever, answering each request line with `answer`
    /// except for the first `drop_first` connections which are closed unanswered.
    async fn spawn_stub(answer: &'static [u8], drop_first: usize) -> (u16, Arc<std::sync::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(std::sync::Mutex::new(vec![]));
        let seen_copy = seen.clone();
        let connections = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                if connections.fetch_add(1, Ordering::SeqCst) < drop_first {
                    drop(stream);
                    continue;
                }
                let seen = seen_copy.clone();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();
                    while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                        seen.lock().unwrap().push(line.clone());
                        line.clear();
                        reader.get_mut().write_all(answer).await.unwrap();
                    }
                });
            }
        });
        (port, seen)
    }

    /// Answers exactly one request per connection, then hangs up.
    async fn spawn_one_shot_stub(answer: &'static [u8]) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let answered = Arc::new(AtomicUsize::new(0));
        let answered_copy = answered.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                    reader.get_mut().write_all(answer).await.unwrap();
                    answered_copy.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        (port, answered)
    }

    #[test]
    fn pad_request_matches_wire_format() {
        assert_eq!(
            pad_request(&[0, 0, 0, 0, 0, 0, 0, 0x1f], &[0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]),
            "pad_oracle,0x000000000000001f,0xdeadbeef00010203\n"
        );
        assert_eq!(dec_request(&[1], &[2]), "dec_oracle,0x01,0x02\n");
    }

    #[tokio::test]
    async fn tcp_oracle_reports_valid_padding() {
        let (port, seen) = spawn_stub(b"1", 0).await;
        let oracle = TcpOracle::new("127.0.0.1", port, &test_config(0));
        assert!(oracle.query(&[0u8; 8], &[1u8; 8]).await.unwrap());
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["pad_oracle,0x0000000000000000,0x0101010101010101\n".to_string()]
        );
    }

    #[tokio::test]
    async fn tcp_oracle_reports_invalid_padding() {
        let (port, _) = spawn_stub(b"0", 0).await;
        let oracle = TcpOracle::new("127.0.0.1", port, &test_config(0));
        assert!(!oracle.query(&[0u8; 8], &[1u8; 8]).await.unwrap());
    }

    #[tokio::test]
    async fn tcp_oracle_retries_dropped_connections() {
        let (port, _) = spawn_stub(b"1", 2).await;
        let oracle = TcpOracle::new("127.0.0.1", port, &test_config(3));
        assert!(oracle.query(&[0u8; 8], &[1u8; 8]).await.unwrap());
    }

    #[tokio::test]
    async fn tcp_oracle_gives_up_after_retry_budget() {
        let (port, _) = spawn_stub(b"1", usize::MAX).await;
        let oracle = TcpOracle::new("127.0.0.1", port, &test_config(2));
        let err = oracle.query(&[0u8; 8], &[1u8; 8]).await.unwrap_err();
        assert!(matches!(err, DecryptError::OracleTransport { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn tcp_oracle_reuses_connections_when_kept_alive() {
        let (port, seen) = spawn_stub(b"1", 0).await;
        let config = Config {
            keep_alive: true,
            ..test_config(0)
        };
        let oracle = TcpOracle::new("127.0.0.1", port, &config);
        for _ in 0..3 {
            assert!(oracle.query(&[0u8; 8], &[1u8; 8]).await.unwrap());
        }
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(oracle.idle.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn stale_pooled_connections_do_not_use_up_retries() {
        let (port, answered) = spawn_one_shot_stub(b"1").await;
        let config = Config {
            keep_alive: true,
            ..test_config(0)
        };
        let oracle = TcpOracle::new("127.0.0.1", port, &config);
        let burst = join_all((0..10).map(|_| oracle.query(&[0u8; 8], &[1u8; 8]))).await;
        assert!(burst.into_iter().all(|answer| answer.unwrap()));
        for _ in 0..12 {
            assert!(oracle.query(&[0u8; 8], &[1u8; 8]).await.unwrap());
        }
        assert_eq!(answered.load(Ordering::SeqCst), 22);
    }

    #[tokio::test]
    async fn refused_fresh_connection_still_counts_as_attempt() {
        let (port, _) = spawn_stub(b"1", 1).await;
        let config = Config {
            keep_alive: true,
            ..test_config(0)
        };
        let oracle = TcpOracle::new("127.0.0.1", port, &config);
        let err = oracle.query(&[0u8; 8], &[1u8; 8]).await.unwrap_err();
        assert!(matches!(err, DecryptError::OracleTransport { attempts: 1, .. }));
        assert!(oracle.query(&[0u8; 8], &[1u8; 8]).await.unwrap());
    }

    #[tokio::test]
    async fn dec_query_decodes_hex_block() {
        let (port, _) = spawn_stub(b"0x4142434445464748", 0).await;
        let oracle = TcpOracle::new("127.0.0.1", port, &test_config(0));
        assert_eq!(
            oracle.dec_query(&[0u8; 8], &[1u8; 8]).await.unwrap(),
            b"ABCDEFGH".to_vec()
        );
    }
}
