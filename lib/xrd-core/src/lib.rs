// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wires components A-G (CRC/HMAC, CSI-2 codec, frame ring, transport codec,
//! reassembly engine, scan FSM, command protocol) into the two run loops
//! named by the data flow in the specification: a detector-side
//! [`DetectorCore`] (CSI-2 in, UDP fragments + command responses out) and a
//! host-side [`HostCore`] (UDP fragments in, completed frames out).
//!
//! Neither struct owns a thread or a socket itself; `task/xrd-detector` and
//! `task/xrd-hostd` own those and call into these types from whichever
//! thread their concurrency model assigns the work to, per §5.

pub mod config;
pub mod traits;

pub use config::{Config, ConfigError};
pub use traits::{Clock, Csi2Source, SpiDevice, SystemClock};

use xrd_command::CommandProcessor;
use xrd_csi2::{BuildStep, Csi2FrameBuilder, VirtualChannel};
use xrd_fsm::{FsmCallback, FsmEdge, ScanEvent, ScanFsm};
use xrd_ring::FrameRing;

/// Drives an [`FsmCallback`] edge straight into a [`SpiDevice`], the
/// concrete realization of "the callback is expected to drive SPI writes to
/// the CONTROL register in real deployments". The FSM spec does not mandate
/// a register layout, so this writes one tagged byte per edge kind; a real
/// FPGA register map would replace [`SpiControlCallback::encode`] without
/// touching the FSM or the orchestrator around it.
pub struct SpiControlCallback<D> {
    device: D,
}

impl<D: SpiDevice> SpiControlCallback<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    fn encode(edge: FsmEdge) -> [u8; 2] {
        match edge {
            FsmEdge::OnConfigure(mode) => [0x01, mode as u8],
            FsmEdge::OnArm => [0x02, 0],
            FsmEdge::OnStop => [0x03, 0],
            FsmEdge::OnError { .. } => [0xFF, 0],
        }
    }
}

impl<D: SpiDevice> FsmCallback for SpiControlCallback<D> {
    fn on_edge(&mut self, edge: FsmEdge) {
        let bytes = Self::encode(edge);
        if let Err(err) = self.device.write(&bytes) {
            log::warn!("SPI control write failed for edge {edge:?}: {err}");
        }
    }
}

/// One fragmented frame ready for the transport thread to send: the frame
/// id (for logging/correlation) and the ordered UDP packets `fragment`
/// produced.
pub struct OutgoingFrame {
    pub frame_id: u32,
    pub packets: Vec<Vec<u8>>,
}

/// Aggregate counters surfaced by [`DetectorCore::stats`], one layer above
/// any individual component's own `Stats` (those remain reachable via
/// `ring()`/`command()`/etc. for callers that want the finer breakdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectorStatsSnapshot {
    pub ring: xrd_ring::StatsSnapshot,
    pub command: xrd_command::StatsSnapshot,
    pub csi2_errors: xrd_csi2::Csi2ErrorLatch,
}

/// The detector-side (SoC-resident) half of the core: CSI-2 decode and
/// frame assembly, the frame ring, the scan FSM, and command dispatch, all
/// owned together so one lock (in the multi-threaded binary) guards the
/// lot. Transport fragmentation is stateless and lives in `xrd-transport`
/// directly; `drain_ready_frame` returns packets for the caller to send.
pub struct DetectorCore {
    builder: Csi2FrameBuilder,
    ring: FrameRing,
    fsm: ScanFsm,
    commands: CommandProcessor,
    fragment_payload_size: usize,
    next_frame_id: u32,
}

impl DetectorCore {
    pub fn new(config: &Config, vc: VirtualChannel, bit_depth: u8, fsm: ScanFsm) -> Self {
        Self {
            builder: Csi2FrameBuilder::new(vc, bit_depth),
            ring: FrameRing::new(),
            fsm,
            commands: CommandProcessor::new(config.hmac_key.clone(), config.max_clients),
            fragment_payload_size: config.fragment_payload_size,
            next_frame_id: 0,
        }
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    pub fn fsm(&self) -> &ScanFsm {
        &self.fsm
    }

    pub fn csi2_errors(&self) -> xrd_csi2::Csi2ErrorLatch {
        self.builder.errors()
    }

    pub fn stats(&self) -> DetectorStatsSnapshot {
        DetectorStatsSnapshot {
            ring: self.ring.stats().snapshot(),
            command: self.commands.stats().snapshot(),
            csi2_errors: self.builder.errors(),
        }
    }

    /// Feeds one CSI-2 packet's worth of bytes to the frame builder. When a
    /// frame completes, admits it to the ring and advances the FSM's
    /// `FrameReady` event, assigning the frame the next monotonic frame id
    /// (wrapping at `u32::MAX` per the documented policy in
    /// `xrd-transport::is_newer`).
    pub fn ingest_csi2(&mut self, packet_bytes: &[u8]) {
        if let BuildStep::FrameComplete(matrix) = self.builder.ingest_bytes(packet_bytes) {
            let frame_id = self.next_frame_id;
            self.next_frame_id = self.next_frame_id.wrapping_add(1);
            match self.ring.get_buffer() {
                Ok(slot) => {
                    if let Err(err) = self.ring.commit_buffer(slot, frame_id, matrix) {
                        log::warn!("frame {frame_id} failed to commit: {err}");
                        return;
                    }
                    self.fsm.handle(ScanEvent::FrameReady);
                }
                Err(err) => {
                    log::warn!("frame {frame_id} dropped, no ring slot: {err}");
                }
            }
        }
    }

    /// Drains the oldest ready frame, fragments it into UDP packets, and
    /// releases its ring slot, advancing the FSM's `Complete` event.
    /// Returns `None` if no frame is ready to send.
    pub fn drain_ready_frame(&mut self, now_ns: u64) -> Option<OutgoingFrame> {
        let (slot, frame_id) = self.ring.get_ready_buffer()?;
        let matrix = self.ring.peek_frame(slot).ok()?;
        let packets = xrd_transport::fragment_matrix(matrix, frame_id, now_ns, self.fragment_payload_size);
        if let Err(err) = self.ring.release_buffer(slot) {
            log::warn!("frame {frame_id} failed to release: {err}");
        }
        self.fsm.handle(ScanEvent::Complete);
        self.fsm.tick();
        Some(OutgoingFrame { frame_id, packets })
    }

    /// Processes one received command frame, returning the response bytes
    /// to send back (if the request was well-formed enough to answer).
    pub fn handle_command(&mut self, source: std::net::SocketAddr, raw: &[u8], now_ns: u64) -> Option<Vec<u8>> {
        self.commands.process(source, raw, now_ns, &mut self.fsm, &mut self.ring)
    }
}

/// A completed (or gap-filled) frame the host-side core hands back to its
/// caller, the seam `task/xrd-hostd` uses instead of a TIFF/RAW writer
/// (explicitly out of scope).
pub struct CompletedFrame {
    pub frame_id: u32,
    pub matrix: xrd_csi2::PixelMatrix,
    pub gap_filled: bool,
}

/// The host-side half of the core: reassembles UDP fragments from one (or,
/// via the table-per-source map underneath, several) detector sources back
/// into frames, timing out and gap-filling per the reassembly engine's
/// contract.
pub struct HostCore {
    tables: xrd_reassembly::ReassemblyBySource,
}

impl HostCore {
    pub fn new(timeout_ns: u64) -> Self {
        Self {
            tables: xrd_reassembly::ReassemblyBySource::new(timeout_ns),
        }
    }

    /// Feeds one received UDP packet from `source`. Returns `Some` only
    /// when this packet completed a frame.
    pub fn ingest(&mut self, source: std::net::SocketAddr, packet: &[u8], now_ns: u64) -> Option<CompletedFrame> {
        match self.tables.ingest(source, packet, now_ns) {
            xrd_reassembly::IngestOutcome::Complete(matrix) => Some(CompletedFrame {
                frame_id: header_frame_id(packet),
                matrix,
                gap_filled: false,
            }),
            other => {
                log_non_complete(source, other);
                None
            }
        }
    }

    /// Sweeps every tracked source for slots that have sat in-flight past
    /// the reassembly timeout, returning the number evicted. A real
    /// deployment calls this on a timer between `recv_from` calls so a
    /// source that stops sending mid-frame doesn't hold memory forever.
    pub fn cleanup_expired(&mut self, now_ns: u64) -> usize {
        self.tables.cleanup_expired(now_ns)
    }
}

fn header_frame_id(packet: &[u8]) -> u32 {
    xrd_transport::decode_packet(packet)
        .map(|(header, _)| header.frame_id())
        .unwrap_or(0)
}

fn log_non_complete(source: std::net::SocketAddr, outcome: xrd_reassembly::IngestOutcome) {
    match outcome {
        xrd_reassembly::IngestOutcome::Processing => {}
        xrd_reassembly::IngestOutcome::Duplicate => log::trace!("duplicate packet from {source}"),
        xrd_reassembly::IngestOutcome::CrcError => log::debug!("header CRC error from {source}"),
        xrd_reassembly::IngestOutcome::Invalid => log::debug!("malformed packet from {source}"),
        xrd_reassembly::IngestOutcome::OutOfRange => log::debug!("out-of-range packet_seq from {source}"),
        xrd_reassembly::IngestOutcome::Inconsistent => {
            log::warn!("inconsistent total_packets for in-flight frame from {source}")
        }
        xrd_reassembly::IngestOutcome::Complete(_) => unreachable!("handled by the caller"),
    }
}


#[cfg(test)]
impl DetectorCore {
    /// Test-only escape hatch: the FSM is otherwise only driven by CSI-2
    /// frame completion and command dispatch, but tests need to put a scan
    /// in `Scanning` state before any CSI-2 bytes arrive.
    fn fsm_mut_for_test(&mut self) -> &mut ScanFsm {
        &mut self.fsm
    }
}
