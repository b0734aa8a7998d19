//! Stream identifiers and the per-connection allocation pool.
//!
//! Every in-flight request on a connection is keyed by a 2-byte stream id.
//! The [`SidManager`] hands ids out, takes them back, and quarantines ids
//! whose fate is unknown because the stream broke mid-flight: the server
//! may still answer under that id on a reconnect, so it must not be reused
//! until explicitly reclaimed.

use std::{
    collections::HashSet,
    fmt,
    sync::Mutex,
};

use thiserror::Error;

/// A 2-byte per-connection multiplexing key.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StreamId(pub u16);

impl StreamId {
    /// Big-endian wire bytes of this id.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 2] { self.0.to_be_bytes() }

    /// Decode an id from its big-endian wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 2]) -> Self { Self(u16::from_be_bytes(bytes)) }
}

impl From<u16> for StreamId {
    fn from(value: u16) -> Self { Self(value) }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Errors produced by [`SidManager`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SidError {
    /// All 65535 ids are in use or quarantined.
    #[error("stream id space exhausted")]
    Exhausted,
    /// The id is not currently allocated.
    #[error("stream id {0} is not allocated")]
    NotAllocated(StreamId),
}

#[derive(Debug, Default)]
struct SidPool {
    next: u16,
    free: Vec<u16>,
    allocated: HashSet<u16>,
    timed_out: HashSet<u16>,
}

/// Allocator for the stream-id space of one connection.
///
/// Shared between the connection layer and every handler talking to that
/// endpoint; all operations lock a single mutex, matching the serialised
/// access pattern of the callers.
///
/// # Examples
///
/// ```
/// use rootwire::sid::SidManager;
///
/// let manager = SidManager::new();
/// let sid = manager.allocate().expect("fresh pool");
/// assert_eq!(manager.allocated_count(), 1);
/// manager.release(sid).expect("allocated above");
/// assert_eq!(manager.allocated_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct SidManager {
    pool: Mutex<SidPool>,
}

impl SidManager {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Allocate a fresh stream id.
    ///
    /// # Errors
    ///
    /// Returns [`SidError::Exhausted`] when no id is available.
    pub fn allocate(&self) -> Result<StreamId, SidError> {
        let mut pool = self.pool.lock().expect("sid pool poisoned");
        let id = if let Some(id) = pool.free.pop() {
            id
        } else {
            // Id 0 is never handed out so a zeroed header is visibly unbound.
            loop {
                pool.next = pool.next.wrapping_add(1);
                if pool.next == 0 {
                    return Err(SidError::Exhausted);
                }
                if !pool.allocated.contains(&pool.next) && !pool.timed_out.contains(&pool.next) {
                    break pool.next;
                }
            }
        };
        pool.allocated.insert(id);
        Ok(StreamId(id))
    }

    /// Return an id to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`SidError::NotAllocated`] when the id is not outstanding.
    pub fn release(&self, sid: StreamId) -> Result<(), SidError> {
        let mut pool = self.pool.lock().expect("sid pool poisoned");
        if !pool.allocated.remove(&sid.0) {
            return Err(SidError::NotAllocated(sid));
        }
        pool.free.push(sid.0);
        Ok(())
    }

    /// Quarantine an id whose request may still be answered by the server.
    ///
    /// # Errors
    ///
    /// Returns [`SidError::NotAllocated`] when the id is not outstanding.
    pub fn time_out(&self, sid: StreamId) -> Result<(), SidError> {
        let mut pool = self.pool.lock().expect("sid pool poisoned");
        if !pool.allocated.remove(&sid.0) {
            return Err(SidError::NotAllocated(sid));
        }
        pool.timed_out.insert(sid.0);
        Ok(())
    }

    /// Release every quarantined id, for example after the connection has
    /// been torn down and re-established with a new session.
    pub fn reclaim_timed_out(&self) {
        let mut pool = self.pool.lock().expect("sid pool poisoned");
        let ids: Vec<u16> = pool.timed_out.drain().collect();
        pool.free.extend(ids);
    }

    /// Number of ids currently handed out.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.pool.lock().expect("sid pool poisoned").allocated.len()
    }

    /// Number of ids in quarantine.
    #[must_use]
    pub fn timed_out_count(&self) -> usize {
        self.pool.lock().expect("sid pool poisoned").timed_out.len()
    }
}
