// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MIPI CSI-2-style short/long packet codec and pixel-matrix (re)assembly.
//!
//! A scan tick is serialized as one `FrameStart`, one `LineStart`/`LineData`/
//! `LineEnd` triple per row, and one `FrameEnd`, all addressed to a single
//! virtual channel. Short packets (`FrameStart`, `FrameEnd`, `LineStart`,
//! `LineEnd`) are 4 bytes: a 3-byte header (data identifier, word count low,
//! word count high) plus a 6-bit Hamming ECC byte. Long packets
//! (`LineData`) are a 4-byte header of the same shape followed by the
//! payload and a trailing 2-byte CRC-16/CCITT over the payload.

mod ecc;
mod matrix;

pub use matrix::{MatrixError, PixelMatrix, MAX_DIMENSION, MIN_DIMENSION};

/// RAW16 data identifier, used for the frame's pixel payload regardless of
/// the matrix's declared bit depth (sub-16-bit samples are carried in the
/// low bits of each 16-bit word).
pub const DATA_ID_RAW16: u8 = 0x2E;

const DT_FRAME_START: u8 = 0x00;
const DT_FRAME_END: u8 = 0x01;
const DT_LINE_START: u8 = 0x02;
const DT_LINE_END: u8 = 0x03;

/// A virtual channel identifier, 0-3 as in the MIPI CSI-2 header's 2-bit VC
/// field.
pub type VirtualChannel = u8;

/// A single decoded (or to-be-encoded) CSI-2 packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Csi2Packet {
    FrameStart { vc: VirtualChannel },
    FrameEnd { vc: VirtualChannel },
    LineStart { vc: VirtualChannel },
    LineEnd { vc: VirtualChannel },
    /// A line of pixel samples. `line` is not carried on the wire (real
    /// CSI-2 long packets have no line-number field); callers track line
    /// position themselves from the `LineStart`/`LineEnd` bracketing, the
    /// same way [`Csi2FrameBuilder`] does.
    LineData {
        vc: VirtualChannel,
        samples: Vec<u16>,
    },
}

/// Failure decoding a byte stream into a [`Csi2Packet`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Csi2Error {
    /// Fewer than 4 bytes available where a short packet was expected.
    ShortPacketTruncated,
    /// ECC over the header did not match.
    EccMismatch,
    /// CRC-16 over a long packet's payload did not match.
    CrcMismatch,
    /// A long packet's declared word count did not fit the bytes available.
    LongPacketTruncated,
    /// A long packet's word count was odd (pixel samples are 2 bytes each).
    OddWordCount,
    /// The header's data identifier did not match any known packet type.
    UnknownDataType(u8),
    /// A packet arrived out of the expected frame/line bracketing order.
    OutOfSequence,
}

impl core::fmt::Display for Csi2Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Csi2Error::ShortPacketTruncated => write!(f, "short packet truncated"),
            Csi2Error::EccMismatch => write!(f, "header ECC mismatch"),
            Csi2Error::CrcMismatch => write!(f, "payload CRC mismatch"),
            Csi2Error::LongPacketTruncated => write!(f, "long packet truncated"),
            Csi2Error::OddWordCount => write!(f, "odd word count in long packet header"),
            Csi2Error::UnknownDataType(dt) => write!(f, "unknown data type 0x{dt:02x}"),
            Csi2Error::OutOfSequence => write!(f, "packet out of sequence"),
        }
    }
}

impl std::error::Error for Csi2Error {}

fn header_bytes(data_id: u8, word_count: u16) -> [u8; 3] {
    let wc = word_count.to_le_bytes();
    [data_id, wc[0], wc[1]]
}

fn encode_short(data_id: u8, vc: VirtualChannel) -> [u8; 4] {
    // VC occupies the top 2 bits of the data identifier byte on the wire.
    let di = (data_id & 0x3F) | ((vc & 0x03) << 6);
    let header = header_bytes(di, 0);
    let ecc = ecc::compute(header);
    [header[0], header[1], header[2], ecc]
}

/// Encodes a `FrameStart` short packet.
pub fn frame_start(vc: VirtualChannel) -> [u8; 4] {
    encode_short(DT_FRAME_START, vc)
}

/// Encodes a `FrameEnd` short packet.
pub fn frame_end(vc: VirtualChannel) -> [u8; 4] {
    encode_short(DT_FRAME_END, vc)
}

/// Encodes a `LineStart` short packet.
pub fn line_start(vc: VirtualChannel) -> [u8; 4] {
    encode_short(DT_LINE_START, vc)
}

/// Encodes a `LineEnd` short packet.
pub fn line_end(vc: VirtualChannel) -> [u8; 4] {
    encode_short(DT_LINE_END, vc)
}

/// Encodes a `LineData` long packet: a 4-byte header, the little-endian
/// pixel payload, then a trailing 2-byte CRC-16/CCITT over the payload.
///
/// `line` addresses which row of the eventual matrix this packet belongs
/// to; it shapes the caller's own bookkeeping only; it is not part of the
/// wire format.
pub fn line_data(vc: VirtualChannel, pixels: &[u16], _line: u16) -> Vec<u8> {
    let word_count = (pixels.len() * 2) as u16;
    let di = (DATA_ID_RAW16 & 0x3F) | ((vc & 0x03) << 6);
    let header = header_bytes(di, word_count);
    let ecc = ecc::compute(header);

    let mut out = Vec::with_capacity(4 + pixels.len() * 2 + 2);
    out.extend_from_slice(&header);
    out.push(ecc);
    for sample in pixels {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    let crc = xrd_crc::crc16_ccitt(&out[4..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// Emits a complete frame (`FrameStart`, then `LineStart`/`LineData`/
/// `LineEnd` for every row, then `FrameEnd`) as a single concatenated byte
/// stream, exactly as a producer thread would push it packet by packet.
pub fn generate_full_frame(vc: VirtualChannel, matrix: &PixelMatrix) -> Vec<u8> {
    let mut out = Vec::with_capacity(matrix.byte_len() + matrix.rows() as usize * 16 + 16);
    out.extend_from_slice(&frame_start(vc));
    for row in 0..matrix.rows() {
        out.extend_from_slice(&line_start(vc));
        out.extend_from_slice(&line_data(vc, matrix.row(row), row));
        out.extend_from_slice(&line_end(vc));
    }
    out.extend_from_slice(&frame_end(vc));
    out
}

/// Decodes one packet from the front of `bytes`, returning the packet and
/// the number of bytes it consumed.
pub fn decode_packet(bytes: &[u8]) -> Result<(Csi2Packet, usize), Csi2Error> {
    if bytes.len() < 4 {
        return Err(Csi2Error::ShortPacketTruncated);
    }
    let header = [bytes[0], bytes[1], bytes[2]];
    let vc = (header[0] >> 6) & 0x03;
    let data_type = header[0] & 0x3F;
    let word_count = u16::from_le_bytes([header[1], header[2]]);

    match data_type {
        DT_FRAME_START | DT_FRAME_END | DT_LINE_START | DT_LINE_END => {
            if !ecc::verify(header, bytes[3]) {
                return Err(Csi2Error::EccMismatch);
            }
            let packet = match data_type {
                DT_FRAME_START => Csi2Packet::FrameStart { vc },
                DT_FRAME_END => Csi2Packet::FrameEnd { vc },
                DT_LINE_START => Csi2Packet::LineStart { vc },
                _ => Csi2Packet::LineEnd { vc },
            };
            Ok((packet, 4))
        }
        dt if dt == (DATA_ID_RAW16 & 0x3F) => {
            if !ecc::verify(header, bytes[3]) {
                return Err(Csi2Error::EccMismatch);
            }
            if word_count % 2 != 0 {
                return Err(Csi2Error::OddWordCount);
            }
            let payload_len = word_count as usize;
            let total_len = 4 + payload_len + 2;
            if bytes.len() < total_len {
                return Err(Csi2Error::LongPacketTruncated);
            }
            let payload = &bytes[4..4 + payload_len];
            let expected_crc = u16::from_be_bytes([
                bytes[4 + payload_len],
                bytes[4 + payload_len + 1],
            ]);
            if xrd_crc::crc16_ccitt(payload) != expected_crc {
                return Err(Csi2Error::CrcMismatch);
            }
            let samples = payload
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            Ok((Csi2Packet::LineData { vc, samples }, total_len))
        }
        other => Err(Csi2Error::UnknownDataType(other)),
    }
}

/// Sticky error counters for CSI-2 decode failures, latched per
/// `Csi2FrameBuilder` and surfaced in the detector's status telemetry.
/// Errors here are non-fatal: the offending packet is dropped and decoding
/// continues with the next one.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csi2ErrorLatch {
    pub ecc_errors: u32,
    pub crc_errors: u32,
    pub framing_errors: u32,
}

impl Csi2ErrorLatch {
    pub fn record(&mut self, err: Csi2Error) {
        match err {
            Csi2Error::EccMismatch => self.ecc_errors += 1,
            Csi2Error::CrcMismatch => self.crc_errors += 1,
            _ => self.framing_errors += 1,
        }
    }

    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// What a builder did with one input packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStep {
    /// A frame is now fully assembled and ready to hand off.
    FrameComplete(PixelMatrix),
    /// The packet was consumed but the frame is still in progress.
    InProgress,
    /// The packet was out of sequence (e.g. `LineData` before
    /// `FrameStart`) and was dropped.
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderState {
    Idle,
    InFrame,
    InLine,
}

/// Consumes a stream of decoded [`Csi2Packet`]s for a single virtual
/// channel and accumulates them into complete [`PixelMatrix`] frames.
///
/// Bit depth and virtual channel are fixed at construction; rows/cols are
/// inferred from the number of `LineStart`/`LineEnd` brackets and the
/// sample count of the first `LineData` seen in the frame.
pub struct Csi2FrameBuilder {
    vc: VirtualChannel,
    bit_depth: u8,
    state: BuilderState,
    rows: Vec<Vec<u16>>,
    current_row: Option<Vec<u16>>,
    errors: Csi2ErrorLatch,
}

impl Csi2FrameBuilder {
    pub fn new(vc: VirtualChannel, bit_depth: u8) -> Self {
        Self {
            vc,
            bit_depth,
            state: BuilderState::Idle,
            rows: Vec::new(),
            current_row: None,
            errors: Csi2ErrorLatch::default(),
        }
    }

    pub fn errors(&self) -> Csi2ErrorLatch {
        self.errors
    }

    /// Feeds raw bytes containing exactly one packet's worth of data
    /// (callers typically get this framing from the producer thread's
    /// per-packet queue, not a raw byte stream); decode failures are
    /// latched and the packet is dropped.
    pub fn ingest_bytes(&mut self, bytes: &[u8]) -> BuildStep {
        match decode_packet(bytes) {
            Ok((packet, _consumed)) => self.ingest(packet),
            Err(e) => {
                self.errors.record(e);
                BuildStep::Unexpected
            }
        }
    }

    /// Feeds an already-decoded packet.
    pub fn ingest(&mut self, packet: Csi2Packet) -> BuildStep {
        if packet_vc(&packet) != self.vc {
            return BuildStep::Unexpected;
        }
        match (self.state, packet) {
            (BuilderState::Idle, Csi2Packet::FrameStart { .. }) => {
                self.rows.clear();
                self.current_row = None;
                self.state = BuilderState::InFrame;
                BuildStep::InProgress
            }
            (BuilderState::InFrame, Csi2Packet::LineStart { .. }) => {
                self.current_row = Some(Vec::new());
                self.state = BuilderState::InLine;
                BuildStep::InProgress
            }
            (BuilderState::InLine, Csi2Packet::LineData { samples, .. }) => {
                if let Some(row) = &mut self.current_row {
                    row.extend(samples);
                }
                BuildStep::InProgress
            }
            (BuilderState::InLine, Csi2Packet::LineEnd { .. }) => {
                if let Some(row) = self.current_row.take() {
                    self.rows.push(row);
                }
                self.state = BuilderState::InFrame;
                BuildStep::InProgress
            }
            (BuilderState::InFrame, Csi2Packet::FrameEnd { .. }) => {
                self.state = BuilderState::Idle;
                let rows = self.rows.len() as u16;
                let cols = self.rows.first().map(|r| r.len()).unwrap_or(0) as u16;
                let mut flat = Vec::with_capacity(rows as usize * cols as usize);
                for row in self.rows.drain(..) {
                    flat.extend(row);
                }
                match PixelMatrix::from_samples(rows, cols, self.bit_depth, flat) {
                    Ok(matrix) => BuildStep::FrameComplete(matrix),
                    Err(_) => {
                        self.errors.record(Csi2Error::OutOfSequence);
                        BuildStep::Unexpected
                    }
                }
            }
            _ => {
                self.errors.record(Csi2Error::OutOfSequence);
                BuildStep::Unexpected
            }
        }
    }
}

fn packet_vc(packet: &Csi2Packet) -> VirtualChannel {
    match packet {
        Csi2Packet::FrameStart { vc }
        | Csi2Packet::FrameEnd { vc }
        | Csi2Packet::LineStart { vc }
        | Csi2Packet::LineEnd { vc }
        | Csi2Packet::LineData { vc, .. } => *vc,
    }
}
