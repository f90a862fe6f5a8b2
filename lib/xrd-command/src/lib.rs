// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host command protocol: a fixed 44-byte authenticated prefix
//! (`magic, sequence, command_id/status, payload_len, hmac`) plus a
//! variable payload, replay-protected per source address and dispatched
//! into the scan FSM and frame ring.

mod clients;

use std::net::SocketAddr;

use xrd_auth::Key;
use xrd_fsm::{ScanEvent, ScanFsm, ScanMode};
use xrd_ring::FrameRing;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub use clients::{ClientTable, DEFAULT_MAX_CLIENTS};

/// Magic identifying a request frame.
pub const REQUEST_MAGIC: u32 = 0xBEEF_CAFE;
/// Magic identifying a response frame.
pub const RESPONSE_MAGIC: u32 = 0xCAFE_BEEF;

/// Bytes before the variable-length payload, in both directions.
pub const PREFIX_LEN: usize = 44;

/// Command identifiers carried in a request's `command_id` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandId {
    SetConfig = 0x10,
    StartScan = 0x11,
    StopScan = 0x12,
    GetStatus = 0x13,
    Reset = 0x14,
}

impl CommandId {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x10 => Some(Self::SetConfig),
            0x11 => Some(Self::StartScan),
            0x12 => Some(Self::StopScan),
            0x13 => Some(Self::GetStatus),
            0x14 => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Status codes carried in a response's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 0x00,
    InvalidCmd = 0x01,
    AuthFailed = 0x02,
    Busy = 0x03,
    Replay = 0x04,
}

/// Failure parsing an incoming command frame, before any response can be
/// built (no sequence number can be trusted yet to mirror back).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer than [`PREFIX_LEN`] bytes, or `payload_len` claims more bytes
    /// than were actually delivered.
    Truncated,
    /// The magic did not match [`REQUEST_MAGIC`].
    BadMagic(u32),
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ParseError::Truncated => write!(f, "command frame truncated"),
            ParseError::BadMagic(m) => write!(f, "bad command magic 0x{m:08x}"),
        }
    }
}

impl std::error::Error for ParseError {}

static_assertions::const_assert_eq!(core::mem::size_of::<FramePrefix>(), PREFIX_LEN);

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Unaligned, KnownLayout, Immutable)]
struct FramePrefix {
    magic: U32<LittleEndian>,
    sequence: U32<LittleEndian>,
    command_id_or_status: U16<LittleEndian>,
    payload_len: U16<LittleEndian>,
    hmac: [u8; 32],
}

/// A parsed, not-yet-authenticated request.
pub struct CommandFrame<'a> {
    raw_prefix: FramePrefix,
    pub payload: &'a [u8],
}

impl<'a> CommandFrame<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ParseError> {
        if bytes.len() < PREFIX_LEN {
            return Err(ParseError::Truncated);
        }
        let prefix = FramePrefix::read_from_bytes(&bytes[..PREFIX_LEN]).map_err(|_| ParseError::Truncated)?;
        if prefix.magic.get() != REQUEST_MAGIC {
            return Err(ParseError::BadMagic(prefix.magic.get()));
        }
        let payload_len = prefix.payload_len.get() as usize;
        let payload = bytes.get(PREFIX_LEN..PREFIX_LEN + payload_len).ok_or(ParseError::Truncated)?;
        Ok(Self { raw_prefix: prefix, payload })
    }

    pub fn sequence(&self) -> u32 {
        self.raw_prefix.sequence.get()
    }

    pub fn command_id(&self) -> u16 {
        self.raw_prefix.command_id_or_status.get()
    }

    pub fn hmac(&self) -> &[u8; 32] {
        &self.raw_prefix.hmac
    }

    /// The bytes HMAC-SHA256 is computed over: the prefix up to (not
    /// including) the `hmac` field, concatenated with the payload.
    fn auth_parts(&self) -> [&[u8]; 2] {
        [&self.raw_prefix.as_bytes()[..12], self.payload]
    }
}

/// Builds the fixed-layout bytes of a response frame, HMAC computed over
/// the same prefix-plus-payload region a request uses.
fn build_response(key: &Key, sequence: u32, status: StatusCode, payload: &[u8]) -> Vec<u8> {
    let mut prefix = FramePrefix {
        magic: U32::new(RESPONSE_MAGIC),
        sequence: U32::new(sequence),
        command_id_or_status: U16::new(status as u16),
        payload_len: U16::new(payload.len() as u16),
        hmac: [0u8; 32],
    };
    let mac = xrd_auth::hmac_sha256(key, &[&prefix.as_bytes()[..12], payload]);
    prefix.hmac = mac;

    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Serialized `GET_STATUS` payload: FSM state/mode/retries plus ring
/// statistics, the concrete realization of "the FSM stuck in ERROR
/// visible via GET_STATUS's state byte".
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Unaligned, KnownLayout, Immutable)]
pub struct StatusPayload {
    pub state: u8,
    pub mode: u8,
    pub retry_count: u8,
    _reserved: u8,
    pub frames_received: zerocopy::byteorder::U64<LittleEndian>,
    pub frames_sent: zerocopy::byteorder::U64<LittleEndian>,
    pub errors: zerocopy::byteorder::U64<LittleEndian>,
    pub retries: zerocopy::byteorder::U64<LittleEndian>,
    pub ring_dropped: zerocopy::byteorder::U64<LittleEndian>,
}

fn scan_state_byte(state: xrd_fsm::ScanState) -> u8 {
    use xrd_fsm::ScanState::*;
    match state {
        Idle => 0,
        Configure => 1,
        Arm => 2,
        Scanning => 3,
        Streaming => 4,
        Complete => 5,
        Error => 6,
    }
}

fn scan_mode_byte(mode: ScanMode) -> u8 {
    match mode {
        ScanMode::Single => 0,
        ScanMode::Continuous => 1,
        ScanMode::Calibration => 2,
    }
}

fn scan_mode_from_byte(b: u8) -> Option<ScanMode> {
    match b {
        0 => Some(ScanMode::Single),
        1 => Some(ScanMode::Continuous),
        2 => Some(ScanMode::Calibration),
        _ => None,
    }
}

/// Counters this crate maintains about its own operation, independent of
/// the FSM's or ring's own statistics.
#[derive(Default)]
pub struct Stats {
    auth_failures: std::sync::atomic::AtomicU64,
    replay_rejected: std::sync::atomic::AtomicU64,
    dispatched: std::sync::atomic::AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub auth_failures: u64,
    pub replay_rejected: u64,
    pub dispatched: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        use std::sync::atomic::Ordering::Relaxed;
        StatsSnapshot {
            auth_failures: self.auth_failures.load(Relaxed),
            replay_rejected: self.replay_rejected.load(Relaxed),
            dispatched: self.dispatched.load(Relaxed),
        }
    }
}

/// Wires the command protocol to the FSM and ring it drives. Owns the
/// replay guard and its own statistics; the HMAC key is shared, read-only,
/// process-wide state per [`xrd_auth::Key`]'s contract.
pub struct CommandProcessor {
    key: Key,
    clients: ClientTable,
    stats: Stats,
}

impl CommandProcessor {
    pub fn new(key: Key, max_clients: usize) -> Self {
        Self {
            key,
            clients: ClientTable::new(max_clients),
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    /// Processes one request end to end (parse, magic, replay, HMAC,
    /// dispatch) and returns the response bytes to send back, or `None`
    /// if the frame was too malformed to trust any field of, including
    /// the sequence number that would need to be mirrored back.
    pub fn process(
        &mut self,
        source: SocketAddr,
        raw: &[u8],
        now_ns: u64,
        fsm: &mut ScanFsm,
        ring: &mut FrameRing,
    ) -> Option<Vec<u8>> {
        let frame = match CommandFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("dropping command from {source}: {e}");
                return None;
            }
        };

        if !self.clients.would_accept(source, frame.sequence()) {
            self.stats.replay_rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            log::debug!("replay rejected from {source}, sequence {}", frame.sequence());
            return Some(build_response(&self.key, frame.sequence(), StatusCode::Replay, &[]));
        }

        if !xrd_auth::verify(&self.key, &frame.auth_parts(), frame.hmac()) {
            self.stats.auth_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            log::warn!("HMAC mismatch from {source}");
            return Some(build_response(&self.key, frame.sequence(), StatusCode::AuthFailed, &[]));
        }

        let (status, response_payload) = self.dispatch(frame.command_id(), frame.payload, fsm, ring);

        if status == StatusCode::Ok {
            self.clients.advance(source, frame.sequence(), now_ns);
            self.stats.dispatched.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        Some(build_response(&self.key, frame.sequence(), status, &response_payload))
    }

    fn dispatch(
        &mut self,
        command_id: u16,
        payload: &[u8],
        fsm: &mut ScanFsm,
        ring: &mut FrameRing,
    ) -> (StatusCode, Vec<u8>) {
        let Some(command) = CommandId::from_u16(command_id) else {
            return (StatusCode::InvalidCmd, Vec::new());
        };

        match command {
            CommandId::StartScan => {
                let Some(mode) = payload.first().copied().and_then(scan_mode_from_byte) else {
                    return (StatusCode::InvalidCmd, Vec::new());
                };
                fsm.handle(ScanEvent::StartScan(mode));
                (StatusCode::Ok, Vec::new())
            }
            CommandId::StopScan => {
                fsm.handle(ScanEvent::StopScan);
                (StatusCode::Ok, Vec::new())
            }
            CommandId::GetStatus => {
                let snap = fsm.snapshot();
                let ring_stats = ring.stats().snapshot();
                let status = StatusPayload {
                    state: scan_state_byte(snap.state),
                    mode: scan_mode_byte(snap.mode),
                    retry_count: snap.retry_count,
                    _reserved: 0,
                    frames_received: zerocopy::byteorder::U64::new(snap.counters.frames_received),
                    frames_sent: zerocopy::byteorder::U64::new(snap.counters.frames_sent),
                    errors: zerocopy::byteorder::U64::new(snap.counters.errors),
                    retries: zerocopy::byteorder::U64::new(snap.counters.retries),
                    ring_dropped: zerocopy::byteorder::U64::new(ring_stats.frames_dropped),
                };
                (StatusCode::Ok, status.as_bytes().to_vec())
            }
            CommandId::SetConfig => {
                // Out of scope beyond the one post-init-mutable knob the
                // data model names; this build has none, so SET_CONFIG is
                // acknowledged but a no-op.
                (StatusCode::Ok, Vec::new())
            }
            CommandId::Reset => {
                fsm.handle(ScanEvent::StopScan);
                *ring = FrameRing::new();
                (StatusCode::Ok, Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key::new([0x11; 32])
    }

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    fn build_request(key: &Key, sequence: u32, command_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut prefix = FramePrefix {
            magic: U32::new(REQUEST_MAGIC),
            sequence: U32::new(sequence),
            command_id_or_status: U16::new(command_id),
            payload_len: U16::new(payload.len() as u16),
            hmac: [0u8; 32],
        };
        let mac = xrd_auth::hmac_sha256(key, &[&prefix.as_bytes()[..12], payload]);
        prefix.hmac = mac;
        let mut out = prefix.as_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn response_status(bytes: &[u8]) -> u16 {
        u16::from_le_bytes([bytes[8], bytes[9]])
    }

    #[test]
    fn happy_path_start_scan_drives_fsm_to_scanning() {
        let key = key();
        let mut proc = CommandProcessor::new(key.clone(), DEFAULT_MAX_CLIENTS);
        let mut fsm = ScanFsm::standalone();
        let mut ring = FrameRing::new();

        let req = build_request(&key, 1, CommandId::StartScan as u16, &[0]); // mode=Single
        let resp = proc.process(addr(), &req, 0, &mut fsm, &mut ring).unwrap();
        assert_eq!(response_status(&resp), StatusCode::Ok as u16);
        assert_eq!(u32::from_le_bytes([resp[0], resp[1], resp[2], resp[3]]), RESPONSE_MAGIC);
        assert_eq!(fsm.state(), xrd_fsm::ScanState::Scanning);
    }

    #[test]
    fn replayed_sequence_is_rejected_without_re_dispatching() {
        let key = key();
        let mut proc = CommandProcessor::new(key.clone(), DEFAULT_MAX_CLIENTS);
        let mut fsm = ScanFsm::standalone();
        let mut ring = FrameRing::new();

        let req = build_request(&key, 1, CommandId::StartScan as u16, &[0]);
        let first = proc.process(addr(), &req, 0, &mut fsm, &mut ring).unwrap();
        assert_eq!(response_status(&first), StatusCode::Ok as u16);

        let second = proc.process(addr(), &req, 0, &mut fsm, &mut ring).unwrap();
        assert_eq!(response_status(&second), StatusCode::Replay as u16);
        assert_eq!(proc.stats().snapshot().replay_rejected, 1);
        assert_eq!(proc.stats().snapshot().auth_failures, 0);
    }

    #[test]
    fn tampered_payload_fails_hmac_and_leaves_fsm_untouched() {
        let key = key();
        let mut proc = CommandProcessor::new(key.clone(), DEFAULT_MAX_CLIENTS);
        let mut fsm = ScanFsm::standalone();
        let mut ring = FrameRing::new();

        let mut req = build_request(&key, 1, CommandId::StartScan as u16, &[0]);
        let last = req.len() - 1;
        req[last] ^= 0xFF; // flip a payload byte, HMAC now stale

        let resp = proc.process(addr(), &req, 0, &mut fsm, &mut ring).unwrap();
        assert_eq!(response_status(&resp), StatusCode::AuthFailed as u16);
        assert_eq!(proc.stats().snapshot().auth_failures, 1);
        assert_eq!(fsm.state(), xrd_fsm::ScanState::Idle);
    }

    #[test]
    fn unknown_command_id_is_reported_without_advancing_replay_guard() {
        let key = key();
        let mut proc = CommandProcessor::new(key.clone(), DEFAULT_MAX_CLIENTS);
        let mut fsm = ScanFsm::standalone();
        let mut ring = FrameRing::new();

        let req = build_request(&key, 1, 0xFF, &[]);
        let resp = proc.process(addr(), &req, 0, &mut fsm, &mut ring).unwrap();
        assert_eq!(response_status(&resp), StatusCode::InvalidCmd as u16);

        // Same sequence again must still be treated as first contact: the
        // unknown command never advanced the stored sequence.
        let resp2 = proc.process(addr(), &req, 0, &mut fsm, &mut ring).unwrap();
        assert_eq!(response_status(&resp2), StatusCode::InvalidCmd as u16);
    }

    #[test]
    fn truncated_frame_is_dropped_with_no_response() {
        let key = key();
        let mut proc = CommandProcessor::new(key, DEFAULT_MAX_CLIENTS);
        let mut fsm = ScanFsm::standalone();
        let mut ring = FrameRing::new();
        assert!(proc.process(addr(), &[0u8; 10], 0, &mut fsm, &mut ring).is_none());
    }

    #[test]
    fn get_status_reports_fsm_state_byte() {
        let key = key();
        let mut proc = CommandProcessor::new(key.clone(), DEFAULT_MAX_CLIENTS);
        let mut fsm = ScanFsm::standalone();
        let mut ring = FrameRing::new();
        for _ in 0..3 {
            fsm.handle(ScanEvent::Error);
            fsm.handle(ScanEvent::ErrorCleared);
        }
        fsm.handle(ScanEvent::Error);
        assert_eq!(fsm.state(), xrd_fsm::ScanState::Error);

        let req = build_request(&key, 1, CommandId::GetStatus as u16, &[]);
        let resp = proc.process(addr(), &req, 0, &mut fsm, &mut ring).unwrap();
        assert_eq!(response_status(&resp), StatusCode::Ok as u16);
        let payload = &resp[PREFIX_LEN..];
        assert_eq!(payload[0], scan_state_byte(xrd_fsm::ScanState::Error));
        assert_eq!(payload[2], 3); // retry_count
    }
}
