// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The replay guard's per-source sequence bookkeeping.

use std::net::SocketAddr;

/// Default bound on distinct sources tracked at once.
pub const DEFAULT_MAX_CLIENTS: usize = 16;

struct Entry {
    addr: SocketAddr,
    last_seq: u32,
    last_used_ns: u64,
}

/// Maps a source address to the last sequence number it successfully used.
/// Bounded at `MAX_CLIENTS`; evicts the least-recently-used entry to admit
/// a new source once full.
///
/// A source with no entry yet is in "first contact" standing: its first
/// command is accepted regardless of sequence value (so a detector that
/// rebooted, or a host that restarted its sequence counter, isn't
/// permanently locked out), and that sequence is latched from then on.
pub struct ClientTable {
    entries: Vec<Entry>,
    capacity: usize,
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENTS)
    }
}

impl ClientTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        self.entries.iter().position(|e| e.addr == addr)
    }

    /// Returns `true` if `seq` would be accepted for `addr` (strictly
    /// greater than the stored value, or no value stored yet). Does not
    /// mutate the table; callers must call [`ClientTable::advance`]
    /// themselves once the command has been fully authenticated and
    /// dispatched.
    pub fn would_accept(&self, addr: SocketAddr, seq: u32) -> bool {
        match self.index_of(addr) {
            Some(idx) => seq > self.entries[idx].last_seq,
            None => true,
        }
    }

    /// Records `seq` as the latest accepted sequence for `addr`, inserting
    /// a new entry (evicting the least-recently-used one if the table is
    /// full) if this source hasn't been seen before.
    pub fn advance(&mut self, addr: SocketAddr, seq: u32, now_ns: u64) {
        if let Some(idx) = self.index_of(addr) {
            self.entries[idx].last_seq = seq;
            self.entries[idx].last_used_ns = now_ns;
            return;
        }
        if self.entries.len() >= self.capacity {
            if let Some((idx, _)) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used_ns)
            {
                log::debug!("client table full, evicting {}", self.entries[idx].addr);
                self.entries.remove(idx);
            }
        }
        self.entries.push(Entry {
            addr,
            last_seq: seq,
            last_used_ns: now_ns,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn first_contact_accepts_any_sequence() {
        let table = ClientTable::default();
        assert!(table.would_accept(addr(1), 0));
        assert!(table.would_accept(addr(1), 9999));
    }

    #[test]
    fn replay_is_rejected_after_latching() {
        let mut table = ClientTable::default();
        table.advance(addr(1), 5, 0);
        assert!(!table.would_accept(addr(1), 5));
        assert!(!table.would_accept(addr(1), 4));
        assert!(table.would_accept(addr(1), 6));
    }

    #[test]
    fn full_table_evicts_least_recently_used() {
        let mut table = ClientTable::new(2);
        table.advance(addr(1), 1, 0);
        table.advance(addr(2), 1, 10);
        table.advance(addr(3), 1, 20); // evicts addr(1), used longest ago
        assert_eq!(table.len(), 2);
        assert!(table.would_accept(addr(1), 1)); // forgotten, first-contact again
        assert!(!table.would_accept(addr(2), 1));
    }
}
