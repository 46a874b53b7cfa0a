//! Clients waiting for the next training request.

use std::{mem, time::Duration};

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::protocol::{messages::RETRAIN, Connection, Stage};

/// The set of idle clients. The pool is locked for the whole of a broadcast pass, so
/// clients returned to it during a pass are only considered by the next one.
#[derive(Debug, Default)]
pub struct IdlePool {
    clients: Mutex<Vec<Connection>>,
}

impl IdlePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn: Connection) {
        debug!("{}: idle", conn);
        self.clients.lock().await.push(conn);
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sends `RETRAIN` to every idle client and empties the pool.
    ///
    /// Clients that closed their connection or cannot be written to within `timeout` are
    /// dropped. The others are returned: they are now expected to announce an upload.
    pub async fn broadcast_retrain(&self, timeout: Option<Duration>) -> Vec<Connection> {
        let mut clients = self.clients.lock().await;
        if clients.is_empty() {
            return Vec::new();
        }

        let pending = mem::take(&mut *clients).into_iter().map(|mut conn| async move {
            if conn.is_closed() {
                info!("{}: disconnected while idle", conn);
                return None;
            }
            match conn.write_line(RETRAIN, Stage::Retrain, timeout).await {
                Ok(()) => Some(conn),
                Err(e) => {
                    warn!("{}: failed to send {}: {}", conn, RETRAIN, e);
                    None
                }
            }
        });
        let retrained: Vec<Connection> = join_all(pending).await.into_iter().flatten().collect();
        info!("sent {} to {} clients", RETRAIN, retrained.len());
        retrained
    }
}
