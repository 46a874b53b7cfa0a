//! The upload flow: from `RETRAIN` to a model sitting in the aggregation buffer.
//!
//! 1. after `RETRAIN` the client trains, then announces its upload (`SEND_MODEL` or
//!    `SEND_WEIGHTS`) and is put in the admission queue
//! 2. the upload worker admits queued clients one at a time, waits for a free buffer slot
//!    and runs the transfer protocol
//! 3. once the model is stored the client joins the aggregation buffer

use std::sync::Arc;

use derive_more::Display;

use super::Context;
use crate::protocol::{receive_model, Connection, Stage, TransferError};

/// Announcement sent by a client that finished training.
pub const SEND_MODEL: &str = "SEND_MODEL";
pub const SEND_WEIGHTS: &str = "SEND_WEIGHTS";
/// Sent instead of an announcement by a client that will not train anymore.
pub const MAX_ROUNDS_REACHED: &str = "MAX_ROUNDS_REACHED";

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    #[display(fmt = "model")]
    Model,
    #[display(fmt = "weights")]
    Weights,
}

impl UploadKind {
    fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            SEND_MODEL => Some(Self::Model),
            SEND_WEIGHTS => Some(Self::Weights),
            _ => None,
        }
    }
}

/// Waits for a retrained client to announce its upload and queues it.
pub async fn await_announcement(ctx: Arc<Context>, mut conn: Connection) {
    let line = match conn
        .read_line(Stage::UploadKind, ctx.training_timeout)
        .await
    {
        Ok(line) => line,
        Err(TransferError::Closed(_)) => {
            info!("{}: disconnected while training", conn);
            return;
        }
        Err(e) => {
            warn!("{}: no upload announced: {}", conn, e);
            return;
        }
    };

    match UploadKind::parse(&line) {
        Some(kind) => {
            ctx.queue.enqueue(conn, kind);
        }
        None if line.trim() == MAX_ROUNDS_REACHED => {
            info!("{}: reached its last round, closing", conn);
            conn.shutdown().await;
        }
        None => {
            warn!("{}: expected an upload announcement, got {:?}", conn, line);
        }
    }
}

/// Serves queued uploads, one at a time, in announcement order.
pub async fn run_uploads(ctx: Arc<Context>) {
    loop {
        let (entry, admission) = ctx.queue.admit_next().await;
        debug!("{}: admitted {}", entry.conn, entry.ticket);

        // no READY before a slot is free: the client waits for it
        ctx.buffer.wait_for_slot().await;
        let mut conn = entry.conn;
        match receive_model(&mut conn, ctx.store.as_ref(), &ctx.transfer).await {
            Ok(model) => {
                info!(
                    "{}: received {} {} ({} bytes, data count {})",
                    conn, entry.kind, model.name, model.size, model.data_count
                );
                if let Err(conn) = ctx.buffer.insert(conn) {
                    // unreachable while this worker is the only inserter
                    error!("{}: aggregation buffer full, dropping", conn);
                }
            }
            Err(e) => warn!("{}: upload failed: {}", conn, e),
        }
        admission.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcements() {
        assert_eq!(UploadKind::parse("SEND_MODEL"), Some(UploadKind::Model));
        assert_eq!(UploadKind::parse("SEND_WEIGHTS "), Some(UploadKind::Weights));
        assert_eq!(UploadKind::parse("MAX_ROUNDS_REACHED"), None);
        assert_eq!(UploadKind::parse(""), None);
    }
}
