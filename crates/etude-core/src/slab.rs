// src/slab.rs
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use libc::c_int;

use crate::conn::Connection;
use crate::metrics::Metrics;
use crate::sync::Locker;

pub type ConnHandle = Arc<Locker<Connection>>;

struct Entry {
    conn: ConnHandle,
    live: bool,
    next_free: Option<usize>,
}

/// Fixed-capacity table of connections indexed by epoll token.
///
/// Slots are created on first use and recycled through an intrusive free
/// list, so a closed connection's buffers are reused by the next accept.
/// Only the reactor thread allocates and frees.
pub struct ConnectionSlab {
    entries: Vec<Entry>,
    head_free: Option<usize>,
    active_count: usize,
    capacity: usize,
    doc_root: Arc<Path>,
    metrics: Arc<Metrics>,
}

impl ConnectionSlab {
    pub fn new(capacity: usize, doc_root: Arc<Path>, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: Vec::new(),
            head_free: None,
            active_count: 0,
            capacity,
            doc_root,
            metrics,
        }
    }

    /// Binds `fd` to a free slot. Returns `None` when every slot is live;
    /// the caller still owns `fd` in that case.
    pub fn allocate(&mut self, fd: c_int, peer: Option<SocketAddr>) -> Option<usize> {
        let idx = match self.head_free {
            Some(idx) => {
                self.head_free = self.entries[idx].next_free.take();
                idx
            }
            None if self.entries.len() < self.capacity => {
                self.entries.push(Entry {
                    conn: Arc::new(Locker::new(Connection::new(
                        self.doc_root.clone(),
                        self.metrics.clone(),
                    ))),
                    live: false,
                    next_free: None,
                });
                self.entries.len() - 1
            }
            None => return None,
        };

        let entry = &mut self.entries[idx];
        entry.conn.lock().init(fd, peer);
        entry.live = true;
        self.active_count += 1;
        Some(idx)
    }

    /// Closes the connection in `index` and returns the slot to the free
    /// list. Freeing a free slot is a no-op.
    pub fn free(&mut self, index: usize) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        if !entry.live {
            return;
        }

        entry.conn.lock().close(true);
        entry.live = false;
        entry.next_free = self.head_free;
        self.head_free = Some(index);
        self.active_count -= 1;
    }

    /// Handle to a live connection.
    pub fn get(&self, index: usize) -> Option<&ConnHandle> {
        self.entries
            .get(index)
            .filter(|e| e.live)
            .map(|e| &e.conn)
    }

    /// Indices of every live slot.
    pub fn live(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.live)
            .map(|(i, _)| i)
    }

    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
