//! FIFO admission of announced uploads.
//!
//! Uploads are served one at a time, in the order they were announced. A worker takes the
//! head of the queue with [`AdmissionQueue::admit_next`] and holds the returned
//! [`Admission`] for the whole upload; the next upload is admitted only once it is
//! released.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::upload::UploadKind;
use crate::{common::Ticket, protocol::Connection};

/// A connection waiting for its upload to be admitted.
#[derive(Debug)]
pub struct QueuedEntry {
    pub ticket: Ticket,
    pub kind: UploadKind,
    pub conn: Connection,
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<QueuedEntry>,
    processing: bool,
}

#[derive(Debug, Default)]
pub struct AdmissionQueue {
    state: Mutex<State>,
    changed: Notify,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `conn` to the tail of the queue.
    pub fn enqueue(&self, conn: Connection, kind: UploadKind) -> Ticket {
        let ticket = Ticket::next();
        let mut state = self.state.lock();
        debug!("{}: queued {} upload as {}", conn, kind, ticket);
        state.entries.push_back(QueuedEntry { ticket, kind, conn });
        self.changed.notify_waiters();
        ticket
    }

    /// Waits until no upload is being processed and the queue is not empty, then removes
    /// the head of the queue and marks an upload as in progress.
    ///
    /// Queued connections whose peer has gone away are dropped on the way.
    pub async fn admit_next(self: &Arc<Self>) -> (QueuedEntry, Admission) {
        loop {
            // registered before checking the state so that a notification sent in between
            // is not lost
            let changed = self.changed.notified();
            if let Some(entry) = self.try_admit() {
                let admission = Admission {
                    queue: Arc::clone(self),
                };
                return (entry, admission);
            }
            changed.await;
        }
    }

    fn try_admit(&self) -> Option<QueuedEntry> {
        let mut state = self.state.lock();
        if state.processing {
            return None;
        }
        while let Some(mut entry) = state.entries.pop_front() {
            if entry.conn.is_closed() {
                info!("{}: closed while queued, dropping {}", entry.conn, entry.ticket);
                continue;
            }
            state.processing = true;
            return Some(entry);
        }
        None
    }

    /// Number of connections waiting for admission.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an upload is currently admitted.
    pub fn is_processing(&self) -> bool {
        self.state.lock().processing
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.processing = false;
        if !state.entries.is_empty() {
            self.changed.notify_waiters();
        }
    }
}

/// The right to run one upload. Dropping it admits the next queued upload.
#[derive(Debug)]
pub struct Admission {
    queue: Arc<AdmissionQueue>,
}

impl Admission {
    pub fn release(self) {}
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.queue.release();
    }
}
