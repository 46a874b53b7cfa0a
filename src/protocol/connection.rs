use std::{fmt, time::Duration};

use futures::FutureExt;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use super::{bounded, Stage, TransferError, CHUNK_SIZE, MAX_LINE_LEN};
use crate::common::ClientId;

/// A bidirectional byte stream a [`Connection`] can run on.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A connection to exactly one remote client.
///
/// A connection has a single owner at any time (the idle pool, the admission queue, the
/// aggregation buffer, or the task driving a handshake on it) and is moved between them,
/// never shared.
pub struct Connection {
    id: ClientId,
    peer: String,
    stream: BufReader<Box<dyn Io>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.peer)
    }
}

impl Connection {
    pub fn new<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: Io + 'static,
    {
        Self {
            id: ClientId::next(),
            peer: peer.into(),
            stream: BufReader::with_capacity(CHUNK_SIZE, Box::new(stream)),
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            debug!("cannot set TCP_NODELAY for {}: {}", peer, e);
        }
        Self::new(stream, peer)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Checks without blocking whether the peer closed the connection. Data already sent
    /// by the peer stays buffered and is not consumed.
    pub fn is_closed(&mut self) -> bool {
        match self.stream.fill_buf().now_or_never() {
            None => false,
            Some(Ok(buf)) => buf.is_empty(),
            Some(Err(_)) => true,
        }
    }

    /// Reads one line and strips its terminator (`\n` or `\r\n`).
    ///
    /// End-of-stream before a complete line is [`TransferError::Closed`]; a line longer than
    /// [`MAX_LINE_LEN`] is [`TransferError::Unexpected`].
    pub async fn read_line(
        &mut self,
        stage: Stage,
        timeout: Option<Duration>,
    ) -> Result<String, TransferError> {
        let stream = &mut self.stream;
        bounded(timeout, stage, async move {
            let mut line = String::new();
            let n = stream
                .take(MAX_LINE_LEN)
                .read_line(&mut line)
                .await
                .map_err(|e| TransferError::io(stage, e))?;
            if n == 0 {
                return Err(TransferError::Closed(stage));
            }
            if !line.ends_with('\n') {
                if n as u64 >= MAX_LINE_LEN {
                    return Err(TransferError::unexpected(stage, "<line too long>"));
                }
                return Err(TransferError::Closed(stage));
            }
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            Ok(line)
        })
        .await
    }

    /// Writes `line` followed by `\n`.
    pub async fn write_line(
        &mut self,
        line: &str,
        stage: Stage,
        timeout: Option<Duration>,
    ) -> Result<(), TransferError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.write_all(&buf, stage, timeout).await
    }

    /// Writes and flushes `data`.
    pub async fn write_all(
        &mut self,
        data: &[u8],
        stage: Stage,
        timeout: Option<Duration>,
    ) -> Result<(), TransferError> {
        let stream = &mut self.stream;
        bounded(timeout, stage, async move {
            stream
                .write_all(data)
                .await
                .map_err(|e| TransferError::io(stage, e))?;
            stream.flush().await.map_err(|e| TransferError::io(stage, e))
        })
        .await
    }

    /// Reads at most `buf.len()` bytes. Returns `0` only at end-of-stream.
    pub async fn read_chunk(
        &mut self,
        buf: &mut [u8],
        stage: Stage,
        timeout: Option<Duration>,
    ) -> Result<usize, TransferError> {
        let stream = &mut self.stream;
        bounded(timeout, stage, async move {
            stream.read(buf).await.map_err(|e| TransferError::io(stage, e))
        })
        .await
    }

    /// Closes the write half. Errors are ignored: the connection is being dropped anyway.
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn lines() {
        let (local, mut remote) = duplex(1024);
        let mut conn = Connection::new(local, "test");

        remote.write_all(b"HELLO\r\nWORLD\n").await.unwrap();
        assert_eq!(conn.read_line(Stage::Command, None).await.unwrap(), "HELLO");
        assert_eq!(conn.read_line(Stage::Command, None).await.unwrap(), "WORLD");

        conn.write_line("OK", Stage::Reply, None).await.unwrap();
        let mut buf = [0u8; 3];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OK\n");

        // partial line then EOF
        remote.write_all(b"PART").await.unwrap();
        drop(remote);
        assert!(matches!(
            conn.read_line(Stage::Command, None).await,
            Err(TransferError::Closed(Stage::Command))
        ));
    }

    #[tokio::test]
    async fn long_lines_are_rejected() {
        let (local, mut remote) = duplex(2 * MAX_LINE_LEN as usize);
        let mut conn = Connection::new(local, "test");
        remote
            .write_all(&vec![b'a'; MAX_LINE_LEN as usize + 10])
            .await
            .unwrap();
        assert!(matches!(
            conn.read_line(Stage::Filename, None).await,
            Err(TransferError::Unexpected { .. })
        ));
    }

    #[tokio::test]
    async fn read_line_times_out() {
        let (local, _remote) = duplex(64);
        let mut conn = Connection::new(local, "test");
        let res = conn
            .read_line(Stage::FileSize, Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(res, Err(TransferError::Timeout(Stage::FileSize))));
    }

    #[tokio::test]
    async fn detects_closed_peer() {
        let (local, mut remote) = duplex(64);
        let mut conn = Connection::new(local, "test");
        assert!(!conn.is_closed());

        // buffered data is kept for the next read
        remote.write_all(b"SEND_MODEL\n").await.unwrap();
        assert!(!conn.is_closed());
        assert_eq!(
            conn.read_line(Stage::UploadKind, None).await.unwrap(),
            "SEND_MODEL"
        );

        drop(remote);
        assert!(conn.is_closed());
    }

    #[test]
    fn ids_are_unique() {
        let (a, _) = tokio::io::duplex(8);
        let (b, _) = tokio::io::duplex(8);
        let a = Connection::new(a, "a");
        let b = Connection::new(b, "b");
        assert_ne!(a.id(), b.id());
        assert_eq!(b.to_string(), format!("{} (b)", b.id()));
    }
}
