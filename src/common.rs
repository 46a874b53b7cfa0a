use derive_more::Display;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display)]
#[display(fmt = "client#{}", _0)]
/// A process-wide client identifier, assigned when a connection is accepted
pub struct ClientId(u64);

impl ClientId {
    /// Return the next client identifier. Identifiers are never reused.
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display)]
#[display(fmt = "ticket#{}", _0)]
/// Position of an entry in the upload admission queue. Only used for
/// diagnostics: ordering is enforced by the queue itself.
pub struct Ticket(u64);

impl Ticket {
    /// Return the next ticket. Tickets are strictly increasing.
    pub fn next() -> Self {
        Self(NEXT_TICKET.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}
