//! Bounded buffer of clients whose model has been received for the current round.

use std::{mem, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::Connection;

#[derive(Debug, Default)]
struct State {
    members: Vec<Connection>,
    /// Slots held by a cohort that is being processed.
    reserved: usize,
}

impl State {
    fn occupancy(&self) -> usize {
        self.members.len() + self.reserved
    }
}

/// Holds at most `capacity` clients. Occupancy counts both buffered clients and the
/// members of a drained [`Cohort`] until that cohort is released, so no slot becomes
/// available while a round is still being processed.
#[derive(Debug)]
pub struct AggregationBuffer {
    capacity: usize,
    state: Mutex<State>,
    slot_freed: Notify,
}

impl AggregationBuffer {
    /// Creates a buffer holding `capacity` clients. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State::default()),
            slot_freed: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current occupancy, reserved slots included.
    pub fn len(&self) -> usize {
        self.state.lock().occupancy()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Waits until occupancy is below capacity.
    ///
    /// This does not reserve the slot: the only caller that inserts is the admitted upload,
    /// so the slot is still free when it inserts.
    pub async fn wait_for_slot(&self) {
        loop {
            let freed = self.slot_freed.notified();
            if !self.is_full() {
                return;
            }
            freed.await;
        }
    }

    /// Adds `conn` to the buffer. The connection is handed back if the buffer is full.
    pub fn insert(&self, conn: Connection) -> Result<(), Connection> {
        let mut state = self.state.lock();
        if state.occupancy() >= self.capacity {
            return Err(conn);
        }
        state.members.push(conn);
        debug!(
            "buffer occupancy: {}/{}",
            state.occupancy(),
            self.capacity
        );
        Ok(())
    }

    /// Removes every buffered client in one step. Their slots stay occupied until the
    /// returned cohort is released.
    pub fn drain_all(self: &Arc<Self>) -> Cohort {
        let mut state = self.state.lock();
        let members = mem::take(&mut state.members);
        state.reserved += members.len();
        Cohort {
            buffer: Arc::clone(self),
            reserved: members.len(),
            members,
        }
    }

    fn free(&self, slots: usize) {
        let mut state = self.state.lock();
        state.reserved -= slots;
        self.slot_freed.notify_waiters();
    }
}

/// The clients of one completed round.
#[derive(Debug)]
pub struct Cohort {
    buffer: Arc<AggregationBuffer>,
    members: Vec<Connection>,
    reserved: usize,
}

impl Cohort {
    /// Number of clients in the cohort.
    pub fn len(&self) -> usize {
        self.reserved
    }

    pub fn is_empty(&self) -> bool {
        self.reserved == 0
    }

    /// Takes the connections out of the cohort. Their slots remain reserved.
    pub fn take_members(&mut self) -> Vec<Connection> {
        mem::take(&mut self.members)
    }

    /// Frees the cohort's slots and wakes the uploads waiting for one.
    pub fn release(self) {}
}

impl Drop for Cohort {
    fn drop(&mut self) {
        self.buffer.free(self.reserved);
    }
}
