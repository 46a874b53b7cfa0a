//! Client side of the contract with the external aggregation process.
//!
//! The coordinator opens a TCP connection to the aggregator, which merges the uploaded
//! models and then replies with a single message and closes the connection:
//!
//! ```text
//! Script execution completed. Filename: <global model name>
//! ```

use std::{io, time::Duration};

use async_trait::async_trait;
use futures_retry::{FutureRetry, RetryPolicy};
use thiserror::Error;
use tokio::{io::AsyncReadExt, net::TcpStream};

use crate::{protocol::validate_filename, settings::AggregatorSettings};

/// Marker the aggregator puts in its reply once the global model is available.
pub const COMPLETION_MARKER: &str = "Script execution completed.";

/// Field of the reply carrying the name of the global model.
pub const FILENAME_FIELD: &str = "Filename: ";

/// Longest reply read from the aggregator.
const MAX_RESPONSE_LEN: usize = 64 * 1024;

/// How long to wait for the end of a reply that already names the global model but is not
/// newline terminated.
const REPLY_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("cannot connect to the aggregator: {0}")]
    Connect(#[source] io::Error),
    #[error("i/o error while waiting for the aggregator: {0}")]
    Io(#[source] io::Error),
    #[error("no reply from the aggregator after {0:?}")]
    Timeout(Duration),
    #[error("the aggregator closed the connection without replying")]
    Empty,
    #[error("completion marker missing in aggregator reply {0:?}")]
    MissingMarker(String),
    #[error("filename missing in aggregator reply {0:?}")]
    MissingFilename(String),
    #[error("invalid global model name {0:?}")]
    InvalidFilename(String),
}

#[async_trait]
/// This trait defines how the coordinator triggers an aggregation.
pub trait Aggregator: Send + Sync + 'static {
    /// Runs one aggregation and returns the name of the resulting global model.
    async fn request_round(&self) -> Result<String, AggregatorError>;
}

/// Extracts the global model name from an aggregator reply.
pub fn parse_response(response: &str) -> Result<String, AggregatorError> {
    if !response.contains(COMPLETION_MARKER) {
        return Err(AggregatorError::MissingMarker(response.to_string()));
    }
    let start = response
        .find(FILENAME_FIELD)
        .ok_or_else(|| AggregatorError::MissingFilename(response.to_string()))?;
    let name = response[start + FILENAME_FIELD.len()..]
        .split(&['\r', '\n'][..])
        .next()
        .unwrap_or_default();
    validate_filename(name).map_err(|_| AggregatorError::InvalidFilename(name.to_string()))?;
    Ok(name.to_string())
}

/// Talks to the aggregator over TCP.
#[derive(Debug, Clone)]
pub struct AggregatorClient {
    address: String,
    timeout: Duration,
    connect_retries: usize,
    retry_base_delay: Duration,
}

impl AggregatorClient {
    pub fn new(settings: &AggregatorSettings) -> Self {
        Self {
            address: settings.address.clone(),
            timeout: settings.timeout(),
            connect_retries: settings.connect_retries,
            retry_base_delay: settings.retry_base_delay(),
        }
    }

    /// Connects to the aggregator, retrying with an exponential backoff.
    async fn connect(&self) -> Result<TcpStream, AggregatorError> {
        let address = self.address.clone();
        let retries = self.connect_retries;
        let base_delay = self.retry_base_delay;
        let mut attempt: usize = 0;

        FutureRetry::new(
            move || TcpStream::connect(address.clone()),
            move |e: io::Error| {
                attempt += 1;
                if attempt > retries {
                    return RetryPolicy::ForwardError(e);
                }
                let delay = base_delay.saturating_mul(1 << (attempt - 1).min(16));
                warn!(
                    "cannot connect to the aggregator ({}), retrying in {:?} ({}/{})",
                    e, delay, attempt, retries
                );
                RetryPolicy::WaitRetry(delay)
            },
        )
        .await
        .map(|(stream, _attempts)| stream)
        .map_err(|(e, _attempts)| AggregatorError::Connect(e))
    }

    async fn round_trip(&self) -> Result<String, AggregatorError> {
        let mut stream = self.connect().await?;
        debug!("connected to the aggregator at {}", self.address);

        let reply = read_reply(&mut stream).await?;
        if reply.is_empty() {
            return Err(AggregatorError::Empty);
        }
        let reply = String::from_utf8_lossy(&reply);
        info!("aggregator replied: {}", reply.trim_end());
        parse_response(&reply)
    }
}

/// Reads one reply. The reply ends with the line carrying the filename field, or when the
/// aggregator closes the connection. A reply that names the global model but has no line
/// terminator ends when no more data arrives within [`REPLY_GRACE`].
async fn read_reply(stream: &mut TcpStream) -> Result<Vec<u8>, AggregatorError> {
    let mut reply = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match reply_state(&reply) {
            ReplyState::Complete => break,
            ReplyState::Unterminated => {
                match tokio::time::timeout(REPLY_GRACE, stream.read(&mut chunk)).await {
                    Ok(read) => read.map_err(AggregatorError::Io)?,
                    Err(_) => break,
                }
            }
            ReplyState::Partial => stream.read(&mut chunk).await.map_err(AggregatorError::Io)?,
        };
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&chunk[..n]);
        if reply.len() >= MAX_RESPONSE_LEN {
            reply.truncate(MAX_RESPONSE_LEN);
            break;
        }
    }
    Ok(reply)
}

#[derive(Debug, PartialEq, Eq)]
enum ReplyState {
    /// The filename field has not been received yet.
    Partial,
    /// The filename field was received but its line is not terminated.
    Unterminated,
    Complete,
}

fn reply_state(reply: &[u8]) -> ReplyState {
    let text = String::from_utf8_lossy(reply);
    if !text.contains(COMPLETION_MARKER) {
        return ReplyState::Partial;
    }
    match text.find(FILENAME_FIELD) {
        None => ReplyState::Partial,
        Some(start) if text[start..].contains('\n') => ReplyState::Complete,
        Some(_) => ReplyState::Unterminated,
    }
}

#[async_trait]
impl Aggregator for AggregatorClient {
    async fn request_round(&self) -> Result<String, AggregatorError> {
        tokio::time::timeout(self.timeout, self.round_trip())
            .await
            .map_err(|_| AggregatorError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;

    #[test]
    fn parse() {
        assert_eq!(
            parse_response("Script execution completed. Filename: merged.ckpt").unwrap(),
            "merged.ckpt"
        );
        assert_eq!(
            parse_response("Script execution completed. Filename: merged.ckpt\r\n").unwrap(),
            "merged.ckpt"
        );
        assert!(matches!(
            parse_response("Script execution completed."),
            Err(AggregatorError::MissingFilename(_))
        ));
        assert!(matches!(
            parse_response("Script failed. Filename: merged.ckpt"),
            Err(AggregatorError::MissingMarker(_))
        ));
        assert!(matches!(
            parse_response("Script execution completed. Filename: ../merged.ckpt"),
            Err(AggregatorError::InvalidFilename(_))
        ));
        assert!(matches!(
            parse_response("Script execution completed. Filename: \n"),
            Err(AggregatorError::InvalidFilename(_))
        ));
    }

    fn settings(address: String) -> AggregatorSettings {
        AggregatorSettings {
            address,
            timeout_secs: 5,
            connect_retries: 2,
            retry_base_delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"Script execution completed. Filename: global_3.ckpt")
                .await
                .unwrap();
        });

        let client = AggregatorClient::new(&settings(address));
        assert_eq!(client.request_round().await.unwrap(), "global_3.ckpt");
    }

    #[tokio::test]
    async fn empty_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let client = AggregatorClient::new(&settings(address));
        assert!(matches!(
            client.request_round().await,
            Err(AggregatorError::Empty)
        ));
    }

    #[tokio::test]
    async fn unreachable_aggregator() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = AggregatorClient::new(&settings(address));
        assert!(matches!(
            client.request_round().await,
            Err(AggregatorError::Connect(_))
        ));
    }

    /// Starts an aggregator that sends `reply` and keeps the connection open.
    async fn lingering_aggregator(reply: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(reply).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });
        address
    }

    #[tokio::test]
    async fn reply_on_an_open_connection() {
        let address =
            lingering_aggregator(b"Script execution completed. Filename: merged.ckpt\n").await;
        let client = AggregatorClient::new(&settings(address));

        let started = std::time::Instant::now();
        assert_eq!(client.request_round().await.unwrap(), "merged.ckpt");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unterminated_reply_on_an_open_connection() {
        let address =
            lingering_aggregator(b"Script execution completed. Filename: merged.ckpt").await;
        let client = AggregatorClient::new(&settings(address));

        let started = std::time::Instant::now();
        assert_eq!(client.request_round().await.unwrap(), "merged.ckpt");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn reply_states() {
        assert_eq!(reply_state(b""), ReplyState::Partial);
        assert_eq!(reply_state(b"Running\n"), ReplyState::Partial);
        assert_eq!(
            reply_state(b"Script execution completed. Filename: m"),
            ReplyState::Unterminated
        );
        assert_eq!(
            reply_state(b"Script execution completed. Filename: m.ckpt\r\n"),
            ReplyState::Complete
        );
        assert_eq!(
            parse_response("Script execution completed. Filename: m.ckpt\nextra").unwrap(),
            "m.ckpt"
        );
    }
}

