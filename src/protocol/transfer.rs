use super::{
    messages::*,
    validate_filename,
    Connection,
    Stage,
    TransferError,
    TransferOptions,
    CHUNK_SIZE,
};
use crate::storage::{StagedFile, Store};

/// A model received from a client and persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedModel {
    pub name: String,
    /// Number of payload bytes received. Always equal to the announced size.
    pub size: u64,
    /// The auxiliary record count announced with the model, stored verbatim.
    pub data_count: String,
}

/// Sends `data` to the client.
///
/// ```text
/// server: <size>\n
/// client: OK\n
/// server: <size bytes>
/// ```
///
/// There is no acknowledgement of the payload itself.
pub async fn send_file(
    conn: &mut Connection,
    data: &[u8],
    opts: &TransferOptions,
) -> Result<u64, TransferError> {
    let timeout = opts.step_timeout;
    conn.write_line(&data.len().to_string(), Stage::SizeAnnouncement, timeout)
        .await?;

    let reply = conn.read_line(Stage::SizeConfirmation, timeout).await?;
    if !reply.contains(OK) {
        return Err(TransferError::unexpected(Stage::SizeConfirmation, reply));
    }

    for chunk in data.chunks(CHUNK_SIZE) {
        conn.write_all(chunk, Stage::Payload, timeout).await?;
    }
    debug!("{}: sent {} bytes", conn, data.len());
    Ok(data.len() as u64)
}

/// Receives a model from a client whose upload has been admitted and for which a buffer
/// slot is available, and persists it in `store`.
///
/// ```text
/// server: READY\n
/// client: <filename>\n
/// server: OK\n
/// client: FILE_SIZE:<n>\n
/// server: SIZE_RECEIVED\n
/// client: <n bytes>
/// server: OK\n
/// client: DATA_COUNT:<count>\n
/// server: DATA_COUNT_RECEIVED\n
/// ```
pub async fn receive_model(
    conn: &mut Connection,
    store: &dyn Store,
    opts: &TransferOptions,
) -> Result<ReceivedModel, TransferError> {
    let timeout = opts.step_timeout;

    conn.write_line(READY, Stage::Ready, timeout).await?;

    let name = conn.read_line(Stage::Filename, timeout).await?;
    validate_filename(&name)?;
    debug!("{}: receiving {}", conn, name);
    conn.write_line(OK, Stage::FilenameAck, timeout).await?;

    let size_line = conn.read_line(Stage::FileSize, timeout).await?;
    let size = parse_file_size(&size_line)?;
    if size > opts.max_model_size {
        return Err(TransferError::TooLarge {
            size,
            limit: opts.max_model_size,
        });
    }
    conn.write_line(SIZE_RECEIVED, Stage::SizeAck, timeout)
        .await?;

    let mut model = store
        .stage_model(&name)
        .await
        .map_err(TransferError::Storage)?;
    read_payload(conn, model.as_mut(), size, opts).await?;
    model.commit().await.map_err(TransferError::Storage)?;

    // From here on a failure must not leave an orphaned model behind.
    match finish_upload(conn, store, &name, opts).await {
        Ok(data_count) => {
            debug!("{}: received {} ({} bytes)", conn, name, size);
            Ok(ReceivedModel {
                name,
                size,
                data_count,
            })
        }
        Err(e) => {
            if let Err(discard_err) = store.discard_model(&name).await {
                warn!("cannot discard {}: {:#}", name, discard_err);
            }
            Err(e)
        }
    }
}

fn parse_file_size(line: &str) -> Result<u64, TransferError> {
    let value = line
        .strip_prefix(FILE_SIZE_PREFIX)
        .ok_or_else(|| TransferError::unexpected(Stage::FileSize, line))?;
    // negative sizes are invalid, not unparsable
    match value.trim().parse::<i64>() {
        Ok(n) if n >= 0 => Ok(n as u64),
        _ => Err(TransferError::InvalidSize(value.to_string())),
    }
}

/// Copies exactly `size` payload bytes into `model`, one chunk at a time.
async fn read_payload(
    conn: &mut Connection,
    model: &mut dyn StagedFile,
    size: u64,
    opts: &TransferOptions,
) -> Result<(), TransferError> {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    while received < size {
        let want = ((size - received) as usize).min(CHUNK_SIZE);
        let n = conn
            .read_chunk(&mut chunk[..want], Stage::Payload, opts.step_timeout)
            .await?;
        if n == 0 {
            return Err(TransferError::Truncated {
                expected: size,
                received,
            });
        }
        model
            .append(&chunk[..n])
            .await
            .map_err(TransferError::Storage)?;
        received += n as u64;
    }
    Ok(())
}

async fn finish_upload(
    conn: &mut Connection,
    store: &dyn Store,
    name: &str,
    opts: &TransferOptions,
) -> Result<String, TransferError> {
    let timeout = opts.step_timeout;
    conn.write_line(OK, Stage::PayloadAck, timeout).await?;

    let line = conn.read_line(Stage::DataCount, timeout).await?;
    let data_count = line
        .strip_prefix(DATA_COUNT_PREFIX)
        .ok_or_else(|| TransferError::unexpected(Stage::DataCount, line.as_str()))?
        .to_string();
    store
        .save_data_count(name, &data_count)
        .await
        .map_err(TransferError::Storage)?;

    conn.write_line(DATA_COUNT_RECEIVED, Stage::DataCountAck, timeout)
        .await?;
    Ok(data_count)
}
