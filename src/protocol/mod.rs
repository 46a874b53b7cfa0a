//! The line oriented protocol spoken with clients, and the file transfer handshakes built
//! on top of it.
//!
//! Every step of a handshake is a blocking round-trip bounded by
//! [`TransferOptions::step_timeout`]. Any failure is terminal for the connection: callers
//! drop it instead of returning it to a pool.

use std::{future::Future, io, time::Duration};

use derive_more::Display;
use thiserror::Error;

mod connection;
mod transfer;

pub use self::{
    connection::{Connection, Io},
    transfer::{receive_model, send_file, ReceivedModel},
};

/// Size of the chunks a payload is read or written in.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Longest line accepted from a client, terminator included.
pub const MAX_LINE_LEN: u64 = 4096;

pub mod messages {
    //! Fixed protocol tokens, without their line terminator.

    pub const RETRAIN: &str = "RETRAIN";
    pub const READY: &str = "READY";
    pub const OK: &str = "OK";
    pub const SIZE_RECEIVED: &str = "SIZE_RECEIVED";
    pub const DATA_COUNT_RECEIVED: &str = "DATA_COUNT_RECEIVED";
    pub const ERROR_FILE_NOT_FOUND: &str = "ERROR_FILE_NOT_FOUND";

    pub const FILE_SIZE_PREFIX: &str = "FILE_SIZE:";
    pub const DATA_COUNT_PREFIX: &str = "DATA_COUNT:";
}

/// A step of a handshake. Used to tell where a transfer failed.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    #[display(fmt = "command")]
    Command,
    #[display(fmt = "retrain")]
    Retrain,
    #[display(fmt = "upload kind")]
    UploadKind,
    #[display(fmt = "ready")]
    Ready,
    #[display(fmt = "filename")]
    Filename,
    #[display(fmt = "filename ack")]
    FilenameAck,
    #[display(fmt = "file size")]
    FileSize,
    #[display(fmt = "size ack")]
    SizeAck,
    #[display(fmt = "payload")]
    Payload,
    #[display(fmt = "payload ack")]
    PayloadAck,
    #[display(fmt = "data count")]
    DataCount,
    #[display(fmt = "data count ack")]
    DataCountAck,
    #[display(fmt = "size announcement")]
    SizeAnnouncement,
    #[display(fmt = "size confirmation")]
    SizeConfirmation,
    #[display(fmt = "reply")]
    Reply,
    #[display(fmt = "client data")]
    ClientData,
}

/// Error returned when a handshake fails. The connection must be discarded.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("i/o error during {stage}: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: io::Error,
    },
    #[error("connection closed during {0}")]
    Closed(Stage),
    #[error("timed out during {0}")]
    Timeout(Stage),
    #[error("unexpected message during {stage}: {line:?}")]
    Unexpected { stage: Stage, line: String },
    #[error("invalid file size {0:?}")]
    InvalidSize(String),
    #[error("announced size of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("transfer ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },
    #[error("invalid filename {0:?}")]
    InvalidFilename(String),
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl TransferError {
    pub(crate) fn io(stage: Stage, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Self::Closed(stage),
            _ => Self::Io { stage, source },
        }
    }

    pub(crate) fn unexpected(stage: Stage, line: impl Into<String>) -> Self {
        Self::Unexpected {
            stage,
            line: line.into(),
        }
    }
}

/// Bounds applied to a transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Timeout of a single step. `None` waits forever.
    pub step_timeout: Option<Duration>,
    /// Largest payload a client may announce.
    pub max_model_size: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            step_timeout: Some(Duration::from_secs(60)),
            max_model_size: 1 << 30,
        }
    }
}

/// Runs `fut`, turning an elapsed `timeout` into [`TransferError::Timeout`].
pub(crate) async fn bounded<T, F>(
    timeout: Option<Duration>,
    stage: Stage,
    fut: F,
) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, TransferError>>,
{
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| TransferError::Timeout(stage))?,
        None => fut.await,
    }
}

/// Checks that `name` is a plain file name that cannot escape the directory it is
/// stored in.
pub fn validate_filename(name: &str) -> Result<(), TransferError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        Err(TransferError::InvalidFilename(name.to_string()))
    } else {
        Ok(())
    }
}
