//! Commands a newly connected client may send.

use std::sync::Arc;

use super::Context;
use crate::{
    protocol::{
        messages::{ERROR_FILE_NOT_FOUND, OK},
        send_file,
        Connection,
        Stage,
        TransferError,
    },
    storage::Asset,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SendBaseModel,
    SendMinValues,
    SendMaxValues,
    UploadData,
    ListenCommands,
}

impl Command {
    /// Parses the first word of `line`.
    pub fn parse(line: &str) -> Option<Self> {
        match line.split_whitespace().next()? {
            "SEND_BASE_MODEL" => Some(Self::SendBaseModel),
            "SEND_MIN_VALS_FILE" => Some(Self::SendMinValues),
            "SEND_MAX_VALS_FILE" => Some(Self::SendMaxValues),
            "UPLOAD_DATA" => Some(Self::UploadData),
            "LISTEN_COMMANDS" => Some(Self::ListenCommands),
            _ => None,
        }
    }
}

/// Serves the commands of a newly accepted client until it either disconnects or asks to
/// take part in training, in which case it joins the idle pool.
pub async fn serve(ctx: Arc<Context>, mut conn: Connection) {
    info!("{}: connected", conn);
    loop {
        let line = match conn.read_line(Stage::Command, None).await {
            Ok(line) => line,
            Err(TransferError::Closed(_)) => {
                info!("{}: disconnected", conn);
                return;
            }
            Err(e) => {
                warn!("{}: {}", conn, e);
                return;
            }
        };

        let res = match Command::parse(&line) {
            Some(Command::SendBaseModel) => send_asset(&ctx, &mut conn, Asset::BaseModel).await,
            Some(Command::SendMinValues) => send_asset(&ctx, &mut conn, Asset::MinValues).await,
            Some(Command::SendMaxValues) => send_asset(&ctx, &mut conn, Asset::MaxValues).await,
            Some(Command::UploadData) => {
                if let Err(e) = receive_client_data(&ctx, &mut conn).await {
                    warn!("{}: client data upload failed: {}", conn, e);
                }
                return;
            }
            Some(Command::ListenCommands) => {
                ctx.idle.insert(conn).await;
                return;
            }
            None => {
                debug!("{}: ignoring unknown command {:?}", conn, line);
                Ok(())
            }
        };
        if let Err(e) = res {
            warn!("{}: {}", conn, e);
            return;
        }
    }
}

async fn send_asset(
    ctx: &Context,
    conn: &mut Connection,
    asset: Asset,
) -> Result<(), TransferError> {
    let data = ctx.store.asset(asset).await.map_err(TransferError::Storage)?;
    match data {
        Some(data) => {
            send_file(conn, &data, &ctx.transfer).await?;
            info!("{}: sent {}", conn, asset);
        }
        None => {
            warn!("{}: {} requested but not found", conn, asset);
            conn.write_line(ERROR_FILE_NOT_FOUND, Stage::Reply, ctx.transfer.step_timeout)
                .await?;
        }
    }
    Ok(())
}

/// Writes every line received until the client closes the connection to the client data
/// file.
async fn receive_client_data(ctx: &Context, conn: &mut Connection) -> Result<(), TransferError> {
    let timeout = ctx.transfer.step_timeout;
    let limit = ctx.transfer.max_model_size;
    conn.write_line(OK, Stage::Reply, timeout).await?;

    let mut data = ctx
        .store
        .stage_client_data()
        .await
        .map_err(TransferError::Storage)?;
    let mut size: u64 = 0;
    loop {
        let mut line = match conn.read_line(Stage::ClientData, timeout).await {
            Ok(line) => line,
            Err(TransferError::Closed(_)) => break,
            Err(e) => return Err(e),
        };
        line.push('\n');
        size += line.len() as u64;
        if size > limit {
            return Err(TransferError::TooLarge { size, limit });
        }
        data.append(line.as_bytes())
            .await
            .map_err(TransferError::Storage)?;
    }

    data.commit().await.map_err(TransferError::Storage)?;
    info!("{}: stored {} bytes of client data", conn, size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands() {
        assert_eq!(Command::parse("SEND_BASE_MODEL"), Some(Command::SendBaseModel));
        assert_eq!(Command::parse("SEND_MIN_VALS_FILE\r"), Some(Command::SendMinValues));
        assert_eq!(Command::parse("SEND_MAX_VALS_FILE"), Some(Command::SendMaxValues));
        assert_eq!(Command::parse("UPLOAD_DATA"), Some(Command::UploadData));
        assert_eq!(Command::parse("LISTEN_COMMANDS"), Some(Command::ListenCommands));
        assert_eq!(
            Command::parse("SEND_BASE_MODEL please"),
            Some(Command::SendBaseModel)
        );
        assert_eq!(
            Command::parse("  LISTEN_COMMANDS\tnow"),
            Some(Command::ListenCommands)
        );
        assert_eq!(Command::parse("HELLO"), None);
        assert_eq!(Command::parse(""), None);
    }
}
