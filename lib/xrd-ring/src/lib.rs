// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-slot frame buffer ring connecting the CSI-2 producer to the
//! transport-side consumer.
//!
//! Each slot moves through `Free -> Filling -> Ready -> Sending -> Free`.
//! When the producer finishes a frame and every slot is either `Filling`
//! (impossible, there is only one producer) or occupied, the oldest
//! `Ready` frame (lowest slot index on a tie) is dropped to make room:
//! detectors cannot apply backpressure to an X-ray source, so a full ring
//! sheds old data rather than stalling acquisition.

use std::sync::atomic::{AtomicU64, Ordering};

use xrd_csi2::PixelMatrix;

/// Number of slots in the ring. Fixed by the hardware FIFO depth this
/// mirrors; not configurable at runtime.
pub const SLOT_COUNT: usize = 4;

/// Lifecycle state of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Filling,
    Ready,
    Sending,
}

struct Slot {
    state: SlotState,
    frame: Option<PixelMatrix>,
    frame_id: u32,
    /// Monotonically increasing generation, used to break ties among
    /// `Ready` slots by age rather than by raw index when ages differ;
    /// the lowest slot index still wins an exact tie (two frames becoming
    /// `Ready` are serialized by the single producer, so generations never
    /// actually tie, but the index tie-break is kept as the documented,
    /// deterministic fallback).
    generation: u64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            frame: None,
            frame_id: 0,
            generation: 0,
        }
    }
}

/// Failure to perform a ring operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingError {
    /// No slot is available to start filling (every slot is `Sending`).
    NoFreeSlot,
    /// `index` is out of range for this ring.
    InvalidSlot(usize),
    /// The referenced slot was not in the state the operation requires.
    WrongState { index: usize, state: SlotState },
}

impl core::fmt::Display for RingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RingError::NoFreeSlot => write!(f, "no free slot available"),
            RingError::InvalidSlot(i) => write!(f, "slot index {i} out of range"),
            RingError::WrongState { index, state } => {
                write!(f, "slot {index} is {state:?}, not valid for this operation")
            }
        }
    }
}

impl std::error::Error for RingError {}

/// Lock-free counters, safe to read from any thread without coordinating
/// with whichever thread holds the ring's mutating lock. Names match the
/// statistics structure named in the frame ring's specification; transport
/// level `packets_sent`/`bytes_sent` are accumulated alongside these by the
/// orchestrator, which sees the fragmented wire form this ring does not.
#[derive(Default)]
pub struct Stats {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    overruns: AtomicU64,
}

/// A torn-read-free snapshot of [`Stats`] at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub overruns: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

/// The frame ring itself. Not `Sync`; callers that share it across the
/// producer and consumer threads wrap it in a `Mutex`.
pub struct FrameRing {
    slots: [Slot; SLOT_COUNT],
    next_generation: u64,
    stats: Stats,
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    pub fn new() -> Self {
        Self {
            slots: [Slot::new(), Slot::new(), Slot::new(), Slot::new()],
            next_generation: 0,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|s| s.state)
    }

    /// Claims a slot for the producer to fill. If no slot is `Free`, drops
    /// the oldest `Ready` frame (lowest slot index among ties) and reuses
    /// its slot. Returns [`RingError::NoFreeSlot`] only when every slot is
    /// `Sending` (the consumer is behind on every single one).
    pub fn get_buffer(&mut self) -> Result<usize, RingError> {
        if let Some(index) = self.slots.iter().position(|s| s.state == SlotState::Free) {
            self.slots[index].state = SlotState::Filling;
            return Ok(index);
        }

        let oldest_ready = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Ready)
            .min_by_key(|(index, s)| (s.generation, *index))
            .map(|(index, _)| index);

        match oldest_ready {
            Some(index) => {
                self.slots[index].frame = None;
                self.slots[index].state = SlotState::Filling;
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                self.stats.overruns.fetch_add(1, Ordering::Relaxed);
                Ok(index)
            }
            None => Err(RingError::NoFreeSlot),
        }
    }

    /// Marks a `Filling` slot `Ready`, handing ownership of `frame` to the
    /// ring.
    pub fn commit_buffer(
        &mut self,
        index: usize,
        frame_id: u32,
        frame: PixelMatrix,
    ) -> Result<(), RingError> {
        let slot = self.slot_mut(index)?;
        if slot.state != SlotState::Filling {
            return Err(RingError::WrongState {
                index,
                state: slot.state,
            });
        }
        slot.frame = Some(frame);
        slot.frame_id = frame_id;
        slot.generation = self.next_generation;
        self.next_generation += 1;
        slot.state = SlotState::Ready;
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the oldest `Ready` slot (lowest slot index on a tie),
    /// transitioning it to `Sending` and handing the caller its frame id
    /// and a reference to its frame.
    pub fn get_ready_buffer(&mut self) -> Option<(usize, u32)> {
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Ready)
            .min_by_key(|(index, s)| (s.generation, *index))
            .map(|(index, _)| index)?;
        let slot = &mut self.slots[index];
        slot.state = SlotState::Sending;
        Some((index, slot.frame_id))
    }

    /// Borrows the frame currently held by a `Sending` slot.
    pub fn peek_frame(&self, index: usize) -> Result<&PixelMatrix, RingError> {
        let slot = self.slots.get(index).ok_or(RingError::InvalidSlot(index))?;
        if slot.state != SlotState::Sending {
            return Err(RingError::WrongState {
                index,
                state: slot.state,
            });
        }
        slot.frame.as_ref().ok_or(RingError::WrongState {
            index,
            state: slot.state,
        })
    }

    /// Releases a `Sending` slot back to `Free`, dropping its frame.
    pub fn release_buffer(&mut self, index: usize) -> Result<(), RingError> {
        let slot = self.slot_mut(index)?;
        if slot.state != SlotState::Sending {
            return Err(RingError::WrongState {
                index,
                state: slot.state,
            });
        }
        slot.frame = None;
        slot.state = SlotState::Free;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot, RingError> {
        self.slots.get_mut(index).ok_or(RingError::InvalidSlot(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_frame() -> PixelMatrix {
        PixelMatrix::zeroed(256, 256, 16).unwrap()
    }

    #[test]
    fn fills_all_slots_then_applies_oldest_drop() {
        let mut ring = FrameRing::new();
        let mut indices = Vec::new();
        for id in 0..4u32 {
            let idx = ring.get_buffer().unwrap();
            ring.commit_buffer(idx, id, tiny_frame()).unwrap();
            indices.push(idx);
        }
        assert_eq!(ring.stats().snapshot().frames_dropped, 0);

        // A 5th frame with all four slots still `Ready` must drop the
        // oldest one (frame_id 0, the lowest-generation, lowest-index
        // slot) rather than block.
        let idx = ring.get_buffer().unwrap();
        ring.commit_buffer(idx, 4, tiny_frame()).unwrap();
        let snap = ring.stats().snapshot();
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.overruns, 1);
        assert_eq!(snap.frames_received, 5);
    }

    #[test]
    fn oldest_drop_prefers_lowest_index_on_tie() {
        let mut ring = FrameRing::new();
        for id in 0..4u32 {
            let idx = ring.get_buffer().unwrap();
            ring.commit_buffer(idx, id, tiny_frame()).unwrap();
        }
        // All four are Ready with generations 0..3; dropping must take
        // generation 0 (slot 0), the true oldest.
        let idx = ring.get_buffer().unwrap();
        assert_eq!(idx, 0);
        ring.commit_buffer(idx, 4, tiny_frame()).unwrap();
    }

    #[test]
    fn full_lifecycle_round_trip() {
        let mut ring = FrameRing::new();
        let idx = ring.get_buffer().unwrap();
        assert_eq!(ring.slot_state(idx), Some(SlotState::Filling));
        ring.commit_buffer(idx, 7, tiny_frame()).unwrap();
        assert_eq!(ring.slot_state(idx), Some(SlotState::Ready));

        let (got_idx, frame_id) = ring.get_ready_buffer().unwrap();
        assert_eq!(got_idx, idx);
        assert_eq!(frame_id, 7);
        assert_eq!(ring.slot_state(idx), Some(SlotState::Sending));

        ring.peek_frame(idx).unwrap();
        ring.release_buffer(idx).unwrap();
        assert_eq!(ring.slot_state(idx), Some(SlotState::Free));
        assert_eq!(ring.stats().snapshot().frames_sent, 1);
    }

    #[test]
    fn oldest_drop_then_consumer_sees_remaining_frames_in_order() {
        let mut ring = FrameRing::new();
        for id in 0..4u32 {
            let idx = ring.get_buffer().unwrap();
            ring.commit_buffer(idx, id, tiny_frame()).unwrap();
        }
        // No consumer has drained anything yet; a 5th commit must drop
        // frame 0 and leave 1, 2, 3, 4 observable in that order.
        let idx = ring.get_buffer().unwrap();
        ring.commit_buffer(idx, 4, tiny_frame()).unwrap();

        let snap = ring.stats().snapshot();
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.overruns, 1);

        let mut seen = Vec::new();
        while let Some((idx, frame_id)) = ring.get_ready_buffer() {
            seen.push(frame_id);
            ring.release_buffer(idx).unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn no_free_slot_when_everything_is_sending() {
        let mut ring = FrameRing::new();
        for id in 0..4u32 {
            let idx = ring.get_buffer().unwrap();
            ring.commit_buffer(idx, id, tiny_frame()).unwrap();
        }
        for _ in 0..4 {
            ring.get_ready_buffer().unwrap();
        }
        assert_eq!(ring.get_buffer(), Err(RingError::NoFreeSlot));
    }

    #[test]
    fn wrong_state_transitions_are_rejected() {
        let mut ring = FrameRing::new();
        let idx = ring.get_buffer().unwrap();
        assert_eq!(
            ring.release_buffer(idx),
            Err(RingError::WrongState {
                index: idx,
                state: SlotState::Filling
            })
        );
    }

    #[test]
    fn invalid_slot_index_is_rejected() {
        let mut ring = FrameRing::new();
        assert_eq!(ring.peek_frame(99), Err(RingError::InvalidSlot(99)));
    }
}
