// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side reassembly: turns an out-of-order stream of frame transport
//! packets back into [`xrd_csi2::PixelMatrix`] frames.
//!
//! One [`ReassemblySlot`] tracks one in-flight frame id. The table bounds
//! how many frames can be in flight at once (default 8); on overflow the
//! oldest slot by first-seen timestamp is evicted to make room, the same
//! oldest-drop discipline the detector-side ring applies under the
//! opposite kind of pressure.

mod pool;

use std::collections::HashMap;

use xrd_csi2::{MatrixError, PixelMatrix};
use xrd_transport::{decode_packet, TransportError};

pub use pool::BufferPool;

/// Default slot table capacity.
pub const DEFAULT_CAPACITY: usize = 8;

/// Default slot age, in nanoseconds, before an incomplete frame is evicted.
pub const DEFAULT_TIMEOUT_NS: u64 = 500_000_000;

/// Outcome of feeding one packet to a [`ReassemblyTable`].
#[derive(Debug, PartialEq)]
pub enum IngestOutcome {
    /// The packet's header CRC did not validate; the slot table was not
    /// touched.
    CrcError,
    /// The packet was malformed (truncated, bad magic, or a self-inconsistent
    /// `packet_seq`/`total_packets` pair) before any slot lookup happened.
    Invalid,
    /// This `packet_seq` was already recorded for this frame; ignored.
    Duplicate,
    /// `packet_seq` was `>=` the frame's recorded `total_packets`.
    OutOfRange,
    /// A later packet for this `frame_id` disagreed with the `total_packets`
    /// recorded when the slot was allocated; the slot was evicted.
    Inconsistent,
    /// The packet was recorded; the frame is not yet complete.
    Processing,
    /// This was the last missing packet; the frame is complete and has been
    /// removed from the table.
    Complete(PixelMatrix),
}

struct ReassemblySlot {
    frame_id: u32,
    expected: u16,
    pixels_per_packet: usize,
    rows: u16,
    cols: u16,
    bit_depth: u8,
    backing: Vec<u16>,
    received_bitmap: Vec<bool>,
    received_count: u16,
    first_seen_ns: u64,
}

impl ReassemblySlot {
    fn is_complete(&self) -> bool {
        self.received_count == self.expected
    }

    /// Finalizes the slot into a [`PixelMatrix`], returning its backing
    /// buffer's capacity to `pool` for reuse.
    fn into_matrix(self) -> Result<PixelMatrix, MatrixError> {
        let ReassemblySlot {
            rows, cols, bit_depth, mut backing, ..
        } = self;
        backing.truncate(rows as usize * cols as usize);
        PixelMatrix::from_samples_unchecked(rows, cols, bit_depth, backing)
    }
}

/// Bounded table of in-flight reassembly slots, one per frame id currently
/// being assembled.
pub struct ReassemblyTable<const K: usize = DEFAULT_CAPACITY> {
    slots: Vec<ReassemblySlot>,
    pool: BufferPool,
    timeout_ns: u64,
    stats: Stats,
}

/// Counters maintained by a [`ReassemblyTable`], read independently of
/// whatever lock guards the table itself.
#[derive(Default)]
pub struct Stats {
    frames_completed: std::sync::atomic::AtomicU64,
    frames_dropped: std::sync::atomic::AtomicU64,
    crc_errors: std::sync::atomic::AtomicU64,
    duplicates: std::sync::atomic::AtomicU64,
}

/// A torn-read-free snapshot of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub frames_completed: u64,
    pub frames_dropped: u64,
    pub crc_errors: u64,
    pub duplicates: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        use std::sync::atomic::Ordering::Relaxed;
        StatsSnapshot {
            frames_completed: self.frames_completed.load(Relaxed),
            frames_dropped: self.frames_dropped.load(Relaxed),
            crc_errors: self.crc_errors.load(Relaxed),
            duplicates: self.duplicates.load(Relaxed),
        }
    }
}

impl<const K: usize> Default for ReassemblyTable<K> {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_NS)
    }
}

impl<const K: usize> ReassemblyTable<K> {
    pub fn new(timeout_ns: u64) -> Self {
        Self {
            slots: Vec::with_capacity(K),
            pool: BufferPool::new(K),
            timeout_ns,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    fn index_of(&self, frame_id: u32) -> Option<usize> {
        self.slots.iter().position(|s| s.frame_id == frame_id)
    }

    fn evict_oldest(&mut self) {
        if let Some((idx, _)) = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.first_seen_ns)
        {
            let slot = self.slots.remove(idx);
            log::debug!(
                "reassembly table full, evicting frame {} ({}/{} packets)",
                slot.frame_id,
                slot.received_count,
                slot.expected
            );
            self.pool.release(slot.backing);
            self.stats
                .frames_dropped
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Feeds one raw UDP packet (header + payload) to the table.
    pub fn ingest(&mut self, packet: &[u8], now_ns: u64) -> IngestOutcome {
        let (header, payload) = match decode_packet(packet) {
            Ok(parsed) => parsed,
            Err(TransportError::CrcMismatch) => {
                self.stats
                    .crc_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return IngestOutcome::CrcError;
            }
            // A packet whose own header is self-inconsistent (packet_seq
            // past its own total_packets) is reported as out-of-range
            // rather than merely invalid, matching the reassembly state
            // machine's taxonomy even though transport-level decode is
            // what actually catches it.
            Err(TransportError::SeqOutOfRange { .. }) => return IngestOutcome::OutOfRange,
            Err(_) => return IngestOutcome::Invalid,
        };

        let frame_id = header.frame_id();
        let packet_seq = header.packet_seq();
        let total_packets = header.total_packets();

        if let Some(idx) = self.index_of(frame_id) {
            if self.slots[idx].expected != total_packets {
                let slot = self.slots.remove(idx);
                self.pool.release(slot.backing);
                self.stats
                    .frames_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return IngestOutcome::Inconsistent;
            }
        } else {
            if self.slots.len() >= K {
                self.evict_oldest();
            }
            let pixels_per_packet = payload.len() / 2;
            let expected_len = total_packets as usize * pixels_per_packet;
            let mut backing = self.pool.acquire(expected_len);
            backing.resize(expected_len, 0);
            self.slots.push(ReassemblySlot {
                frame_id,
                expected: total_packets,
                pixels_per_packet,
                rows: header.rows(),
                cols: header.cols(),
                bit_depth: header.bit_depth(),
                backing,
                received_bitmap: vec![false; total_packets as usize],
                received_count: 0,
                first_seen_ns: now_ns,
            });
        }

        let idx = self.index_of(frame_id).expect("slot just inserted or matched");

        if packet_seq >= self.slots[idx].expected {
            return IngestOutcome::OutOfRange;
        }
        if self.slots[idx].received_bitmap[packet_seq as usize] {
            self.stats
                .duplicates
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return IngestOutcome::Duplicate;
        }

        let samples: Vec<u16> = payload
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let start = packet_seq as usize * self.slots[idx].pixels_per_packet;
        let end = start + samples.len();
        if end > self.slots[idx].backing.len() {
            return IngestOutcome::Invalid;
        }
        self.slots[idx].backing[start..end].copy_from_slice(&samples);
        self.slots[idx].received_bitmap[packet_seq as usize] = true;
        self.slots[idx].received_count += 1;

        if self.slots[idx].is_complete() {
            let slot = self.slots.remove(idx);
            self.stats
                .frames_completed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            match slot.into_matrix() {
                Ok(matrix) => IngestOutcome::Complete(matrix),
                Err(_) => IngestOutcome::Invalid,
            }
        } else {
            IngestOutcome::Processing
        }
    }

    /// Removes every slot older than `timeout_ns` (this table's configured
    /// timeout), returning the number evicted. Each eviction counts toward
    /// `frames_dropped`.
    pub fn cleanup_expired(&mut self, now_ns: u64) -> usize {
        let timeout_ns = self.timeout_ns;
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| now_ns.saturating_sub(slot.first_seen_ns) > timeout_ns)
            .map(|(idx, _)| idx)
            .collect();
        for &idx in expired.iter().rev() {
            let slot = self.slots.remove(idx);
            log::debug!(
                "frame {} timed out after {} ns with {}/{} packets",
                slot.frame_id,
                now_ns.saturating_sub(slot.first_seen_ns),
                slot.received_count,
                slot.expected
            );
            self.pool.release(slot.backing);
        }
        self.stats
            .frames_dropped
            .fetch_add(expired.len() as u64, std::sync::atomic::Ordering::Relaxed);
        expired.len()
    }

    /// Forces the named frame to completion, zero-filling any packets that
    /// never arrived, for callers that prefer a gapped frame over no frame
    /// at all. Returns `None` if no slot for `frame_id` exists.
    pub fn fill_missing_packets(&mut self, frame_id: u32) -> Option<PixelMatrix> {
        let idx = self.index_of(frame_id)?;
        let slot = self.slots.remove(idx);
        // Missing positions are already zero: the backing buffer is
        // allocated/resized with zeros and never written for packets that
        // never arrived.
        self.stats
            .frames_completed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        slot.into_matrix().ok()
    }
}

/// Keys frames currently in flight by source address, for a host process
/// juggling more than one detector. Most deployments have exactly one
/// table; this wraps the common case of several behind one map without
/// forcing every caller to manage it themselves.
#[derive(Default)]
pub struct ReassemblyBySource<const K: usize = DEFAULT_CAPACITY> {
    tables: HashMap<std::net::SocketAddr, ReassemblyTable<K>>,
    timeout_ns: u64,
}

impl<const K: usize> ReassemblyBySource<K> {
    pub fn new(timeout_ns: u64) -> Self {
        Self {
            tables: HashMap::new(),
            timeout_ns,
        }
    }

    pub fn ingest(
        &mut self,
        source: std::net::SocketAddr,
        packet: &[u8],
        now_ns: u64,
    ) -> IngestOutcome {
        self.tables
            .entry(source)
            .or_insert_with(|| ReassemblyTable::new(self.timeout_ns))
            .ingest(packet, now_ns)
    }

    /// Runs `cleanup_expired` across every source's table, returning the
    /// total number of slots evicted. Tables left empty by the sweep are
    /// dropped, so a source that stops sending doesn't hold a table open
    /// forever.
    pub fn cleanup_expired(&mut self, now_ns: u64) -> usize {
        let mut total = 0;
        self.tables.retain(|_, table| {
            total += table.cleanup_expired(now_ns);
            table.in_flight() > 0
        });
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A 2x4 frame is below the hardware-supported [256, 4096] shape range
    // (spec.md's own worked gap-fill example uses this toy size to keep the
    // byte-level walkthrough readable), so it's built with the unchecked
    // constructor rather than `PixelMatrix::from_samples`.
    fn matrix_2x4() -> PixelMatrix {
        PixelMatrix::from_samples_unchecked(2, 4, 16, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap()
    }

    #[test]
    fn in_order_full_delivery_reassembles_identically() {
        let matrix = matrix_2x4();
        let packets = xrd_transport::fragment_matrix(&matrix, 1, 0, 4);
        let mut table: ReassemblyTable<8> = ReassemblyTable::default();
        let mut last = IngestOutcome::Processing;
        for p in &packets {
            last = table.ingest(p, 0);
        }
        assert_eq!(last, IngestOutcome::Complete(matrix));
    }

    #[test]
    fn out_of_order_delivery_reassembles_identically() {
        let matrix = matrix_2x4();
        let mut packets = xrd_transport::fragment_matrix(&matrix, 2, 0, 4);
        packets.reverse();
        let mut table: ReassemblyTable<8> = ReassemblyTable::default();
        let mut last = IngestOutcome::Processing;
        for p in &packets {
            last = table.ingest(p, 0);
        }
        assert_eq!(last, IngestOutcome::Complete(matrix));
    }

    #[test]
    fn duplicate_packet_is_ignored() {
        let matrix = matrix_2x4();
        let packets = xrd_transport::fragment_matrix(&matrix, 3, 0, 4);
        let mut table: ReassemblyTable<8> = ReassemblyTable::default();
        assert_eq!(table.ingest(&packets[0], 0), IngestOutcome::Processing);
        assert_eq!(table.ingest(&packets[0], 0), IngestOutcome::Duplicate);
    }

    #[test]
    fn gap_then_fill_missing_zero_fills_the_hole() {
        // [[1,2,3,4],[5,6,7,8]] fragmented with payload_size=4 (2 samples
        // per packet) into 4 packets; dropping packet 1 (samples [3,4])
        // and filling should yield [[1,2,0,0],[5,6,7,8]].
        let matrix = matrix_2x4();
        let packets = xrd_transport::fragment_matrix(&matrix, 4, 0, 4);
        let mut table: ReassemblyTable<8> = ReassemblyTable::default();
        for seq in [0usize, 2, 3] {
            table.ingest(&packets[seq], 0);
        }
        let filled = table.fill_missing_packets(4).unwrap();
        assert_eq!(filled.samples(), &[1, 2, 0, 0, 5, 6, 7, 8]);
    }

    #[test]
    fn expired_slot_is_evicted_and_counted_as_dropped() {
        let matrix = matrix_2x4();
        let packets = xrd_transport::fragment_matrix(&matrix, 5, 0, 4);
        let mut table: ReassemblyTable<8> = ReassemblyTable::new(100);
        table.ingest(&packets[0], 0);
        assert_eq!(table.in_flight(), 1);
        let evicted = table.cleanup_expired(1_000);
        assert_eq!(evicted, 1);
        assert_eq!(table.in_flight(), 0);
        assert_eq!(table.stats().snapshot().frames_dropped, 1);
    }

    #[test]
    fn table_overflow_evicts_the_oldest_first_seen_frame() {
        let mut table: ReassemblyTable<2> = ReassemblyTable::default();
        let a = xrd_transport::fragment_matrix(&matrix_2x4(), 10, 0, 4);
        let b = xrd_transport::fragment_matrix(&matrix_2x4(), 11, 0, 4);
        let c = xrd_transport::fragment_matrix(&matrix_2x4(), 12, 0, 4);
        table.ingest(&a[0], 0);
        table.ingest(&b[0], 10);
        assert_eq!(table.in_flight(), 2);
        // Frame 10 is the oldest by first-seen timestamp; a third frame
        // must evict it, not frame 11.
        table.ingest(&c[0], 20);
        assert_eq!(table.in_flight(), 2);
        assert_eq!(table.stats().snapshot().frames_dropped, 1);
        assert!(table.index_of(10).is_none());
        assert!(table.index_of(11).is_some());
    }

    #[test]
    fn inconsistent_total_packets_evicts_the_slot() {
        let matrix = matrix_2x4();
        let mut packets = xrd_transport::fragment_matrix(&matrix, 6, 0, 4);
        let mut table: ReassemblyTable<8> = ReassemblyTable::default();
        table.ingest(&packets[0], 0);
        // Tamper the second packet's `total_packets` field (bytes 14..16)
        // without touching `packet_seq`, then fix its CRC so it still
        // decodes; the table must detect the mismatch against the slot
        // it already opened for frame 6.
        packets[1][14] = 0xFF;
        let crc = xrd_crc::crc16_ccitt(&packets[1][..28]);
        packets[1][28..30].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(table.ingest(&packets[1], 0), IngestOutcome::Inconsistent);
        assert!(table.index_of(6).is_none());
    }

    #[test]
    fn out_of_range_packet_seq_is_dropped_without_touching_the_slot() {
        let matrix = matrix_2x4();
        let packets = xrd_transport::fragment_matrix(&matrix, 7, 0, 4);
        let mut table: ReassemblyTable<8> = ReassemblyTable::default();
        table.ingest(&packets[0], 0);
        // total_packets for this frame is 4; hand-craft a packet claiming
        // seq 4 against the same frame by bumping packet_seq and total_packets
        // together so it decodes cleanly, then forcing table consistency
        // to fail on range instead: we simulate this by checking a seq
        // that's already >= expected via a duplicate of packet 3 relabeled.
        let mut spurious = packets[3].clone();
        spurious[12..14].copy_from_slice(&9u16.to_le_bytes()); // packet_seq = 9
        let crc = xrd_crc::crc16_ccitt(&spurious[..28]);
        spurious[28..30].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(table.ingest(&spurious, 0), IngestOutcome::OutOfRange);
    }

    #[test]
    fn by_source_cleanup_expires_across_every_tracked_source() {
        let matrix = matrix_2x4();
        let a = xrd_transport::fragment_matrix(&matrix, 20, 0, 4);
        let b = xrd_transport::fragment_matrix(&matrix, 21, 0, 4);
        let addr_a: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let addr_b: std::net::SocketAddr = "127.0.0.1:2".parse().unwrap();

        let mut by_source: ReassemblyBySource<8> = ReassemblyBySource::new(100);
        by_source.ingest(addr_a, &a[0], 0);
        by_source.ingest(addr_b, &b[0], 0);

        let evicted = by_source.cleanup_expired(1_000);
        assert_eq!(evicted, 2);
    }
}
