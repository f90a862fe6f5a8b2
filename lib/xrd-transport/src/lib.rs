// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The UDP frame transport wire format: a fixed 32-byte header per packet,
//! fragmentation of a completed frame's payload into MTU-sized packets on
//! the detector side, and header decoding on the host side.
//!
//! Every multi-byte field is little-endian. The header's `crc16` field
//! covers bytes `0..28` of the header itself (magic through `cols`), not
//! the payload — a detail easy to get backwards, since the CSI-2 codec's
//! long-packet CRC *does* cover a payload. [`FrameHeaderBuilder`] computes
//! the CRC last and makes it impossible to mutate any field after: there is
//! no setter that can run once `crc16` has been written.

use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// 4-byte magic identifying a frame transport packet.
pub const MAGIC: u32 = 0xD7E0_1234;

/// Wire format version.
pub const VERSION: u8 = 0x01;

/// Maximum payload bytes carried by one UDP packet, chosen so a
/// 3072x3072, 16-bit frame (18,874,368 payload bytes) fragments into an
/// exact 2304 packets with no trailing partial-chunk remainder logic
/// needed in the common case (partial final chunks are still handled
/// correctly for other frame sizes).
pub const MAX_PAYLOAD_BYTES: usize = 8192;

bitflags::bitflags! {
    /// Per-packet flag bits (header byte 31).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameHeaderFlags: u8 {
        const LAST_PACKET = 0x01;
        /// Set by the detector side when it is shipping a frame it knows
        /// to be incomplete (e.g. the ring dropped it before transport
        /// ever saw it) — the host's reassembly engine treats this as a
        /// hint, not as a substitute for its own gap detection.
        const FRAME_DROP = 0x02;
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<FrameHeader>(), 32);

/// Fixed 32-byte header prefixed to every frame transport UDP packet, laid
/// out exactly as specified: `magic, version, reserved[3], frame_id,
/// packet_seq, total_packets, timestamp_ns, rows, cols, crc16, bit_depth,
/// flags`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Unaligned, KnownLayout, Immutable)]
pub struct FrameHeader {
    magic: U32<LittleEndian>,
    version: u8,
    _reserved: [u8; 3],
    frame_id: U32<LittleEndian>,
    packet_seq: U16<LittleEndian>,
    total_packets: U16<LittleEndian>,
    timestamp_ns: U64<LittleEndian>,
    rows: U16<LittleEndian>,
    cols: U16<LittleEndian>,
    crc16: U16<LittleEndian>,
    bit_depth: u8,
    flags: u8,
}

/// Header bytes covered by the CRC: everything before the CRC field
/// itself.
const CRC_COVERED_LEN: usize = 28;

impl FrameHeader {
    pub const WIRE_LEN: usize = 32;

    pub fn magic(&self) -> u32 {
        self.magic.get()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn flags(&self) -> FrameHeaderFlags {
        FrameHeaderFlags::from_bits_truncate(self.flags)
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id.get()
    }

    pub fn packet_seq(&self) -> u16 {
        self.packet_seq.get()
    }

    pub fn total_packets(&self) -> u16 {
        self.total_packets.get()
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns.get()
    }

    pub fn rows(&self) -> u16 {
        self.rows.get()
    }

    pub fn cols(&self) -> u16 {
        self.cols.get()
    }

    pub fn crc16(&self) -> u16 {
        self.crc16.get()
    }

    pub fn as_wire_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Builds a [`FrameHeader`]. The CRC is computed over the other fields
/// inside [`FrameHeaderBuilder::finish`], which is the builder's only
/// terminal step: there is no way to obtain a [`FrameHeader`] and then go
/// back and change `timestamp_ns` or `flags` out from under its CRC.
#[allow(clippy::too_many_arguments)]
pub struct FrameHeaderBuilder {
    frame_id: u32,
    packet_seq: u16,
    total_packets: u16,
    timestamp_ns: u64,
    rows: u16,
    cols: u16,
    bit_depth: u8,
    flags: FrameHeaderFlags,
}

impl FrameHeaderBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frame_id: u32,
        packet_seq: u16,
        total_packets: u16,
        timestamp_ns: u64,
        rows: u16,
        cols: u16,
        bit_depth: u8,
        flags: FrameHeaderFlags,
    ) -> Self {
        Self {
            frame_id,
            packet_seq,
            total_packets,
            timestamp_ns,
            rows,
            cols,
            bit_depth,
            flags,
        }
    }

    /// Consumes the builder, computing `crc16` over bytes `0..28` of the
    /// finished header and producing it as the last field written.
    pub fn finish(self) -> FrameHeader {
        let mut header = FrameHeader {
            magic: U32::new(MAGIC),
            version: VERSION,
            _reserved: [0; 3],
            frame_id: U32::new(self.frame_id),
            packet_seq: U16::new(self.packet_seq),
            total_packets: U16::new(self.total_packets),
            timestamp_ns: U64::new(self.timestamp_ns),
            rows: U16::new(self.rows),
            cols: U16::new(self.cols),
            crc16: U16::new(0),
            bit_depth: self.bit_depth,
            flags: self.flags.bits(),
        };
        let crc = xrd_crc::crc16_ccitt(&header.as_bytes()[..CRC_COVERED_LEN]);
        header.crc16 = U16::new(crc);
        header
    }
}

/// Failure decoding or validating a transport packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    /// Fewer than [`FrameHeader::WIRE_LEN`] bytes available.
    Truncated,
    /// The header's magic did not match [`MAGIC`]; the caller should drop
    /// the packet silently rather than report it, per the wire format's
    /// error policy.
    BadMagic(u32),
    /// The header's version is not one this build understands.
    UnsupportedVersion(u8),
    /// The header's own CRC (over bytes 0..28) did not match.
    CrcMismatch,
    /// `packet_seq >= total_packets`.
    SeqOutOfRange { packet_seq: u16, total_packets: u16 },
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportError::Truncated => write!(f, "packet truncated"),
            TransportError::BadMagic(m) => write!(f, "bad magic 0x{m:08x}"),
            TransportError::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
            TransportError::CrcMismatch => write!(f, "header CRC mismatch"),
            TransportError::SeqOutOfRange {
                packet_seq,
                total_packets,
            } => write!(f, "packet_seq {packet_seq} >= total_packets {total_packets}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Splits `payload` into [`MAX_PAYLOAD_BYTES`]-sized chunks, each prefixed
/// with a complete [`FrameHeader`], ready to hand one-by-one to a UDP
/// socket. The last chunk may be shorter than [`MAX_PAYLOAD_BYTES`].
/// `payload_size` lets callers configure the chunk size down from
/// [`MAX_PAYLOAD_BYTES`] (e.g. to stay under a smaller path MTU); passing
/// `0` is treated as [`MAX_PAYLOAD_BYTES`].
#[allow(clippy::too_many_arguments)]
pub fn fragment(
    frame_id: u32,
    timestamp_ns: u64,
    rows: u16,
    cols: u16,
    bit_depth: u8,
    payload: &[u8],
    payload_size: usize,
) -> Vec<Vec<u8>> {
    let chunk_size = if payload_size == 0 { MAX_PAYLOAD_BYTES } else { payload_size };
    let total_packets = payload.chunks(chunk_size).count().max(1) as u16;
    payload
        .chunks(chunk_size)
        .enumerate()
        .map(|(seq, chunk)| {
            let is_last = seq as u16 + 1 == total_packets;
            let flags = if is_last {
                FrameHeaderFlags::LAST_PACKET
            } else {
                FrameHeaderFlags::empty()
            };
            let header = FrameHeaderBuilder::new(
                frame_id,
                seq as u16,
                total_packets,
                timestamp_ns,
                rows,
                cols,
                bit_depth,
                flags,
            )
            .finish();
            let mut packet = Vec::with_capacity(FrameHeader::WIRE_LEN + chunk.len());
            packet.extend_from_slice(header.as_wire_bytes());
            packet.extend_from_slice(chunk);
            packet
        })
        .collect()
}

/// Fragments a complete [`xrd_csi2::PixelMatrix`] into UDP packets, the
/// form spec'd for this component: callers holding a just-committed ring
/// frame pass it here directly instead of serializing to bytes themselves
/// first.
pub fn fragment_matrix(
    matrix: &xrd_csi2::PixelMatrix,
    frame_id: u32,
    timestamp_ns: u64,
    payload_size: usize,
) -> Vec<Vec<u8>> {
    let payload = matrix.to_le_bytes();
    fragment(
        frame_id,
        timestamp_ns,
        matrix.rows(),
        matrix.cols(),
        matrix.bit_depth(),
        &payload,
        payload_size,
    )
}

/// Parses and validates one UDP packet, returning the header and a slice
/// of the remaining payload bytes borrowed from `packet`.
pub fn decode_packet(packet: &[u8]) -> Result<(FrameHeader, &[u8]), TransportError> {
    if packet.len() < FrameHeader::WIRE_LEN {
        return Err(TransportError::Truncated);
    }
    let (header_bytes, payload) = packet.split_at(FrameHeader::WIRE_LEN);
    let header = FrameHeader::read_from_bytes(header_bytes).map_err(|_| TransportError::Truncated)?;

    if header.magic() != MAGIC {
        return Err(TransportError::BadMagic(header.magic()));
    }
    if header.version() != VERSION {
        return Err(TransportError::UnsupportedVersion(header.version()));
    }
    if xrd_crc::crc16_ccitt(&header_bytes[..CRC_COVERED_LEN]) != header.crc16() {
        return Err(TransportError::CrcMismatch);
    }
    if header.packet_seq() >= header.total_packets() {
        return Err(TransportError::SeqOutOfRange {
            packet_seq: header.packet_seq(),
            total_packets: header.total_packets(),
        });
    }
    Ok((header, payload))
}

/// Compares two frame ids under the wraparound rule: `b` is considered
/// newer than `a` if the forward distance from `a` to `b` is less than
/// half the `u32` space, matching TCP sequence-number comparison.
pub fn is_newer(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) != 0 && b.wrapping_sub(a) < u32::MAX / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_wire_bytes() {
        let header = FrameHeaderBuilder::new(42, 1, 5, 1_700_000_000, 3072, 3072, 16, FrameHeaderFlags::empty())
            .finish();
        let bytes = header.as_wire_bytes().to_vec();
        let mut packet = bytes.clone();
        packet.extend_from_slice(b"payload-bytes");
        let (decoded, payload) = decode_packet(&packet).unwrap();
        assert_eq!(decoded.frame_id(), 42);
        assert_eq!(decoded.packet_seq(), 1);
        assert_eq!(decoded.total_packets(), 5);
        assert_eq!(decoded.rows(), 3072);
        assert_eq!(decoded.cols(), 3072);
        assert_eq!(payload, b"payload-bytes");
    }

    #[test]
    fn header_is_exactly_32_bytes_on_the_wire() {
        let header = FrameHeaderBuilder::new(0, 0, 1, 0, 256, 256, 16, FrameHeaderFlags::empty()).finish();
        assert_eq!(header.as_wire_bytes().len(), 32);
    }

    #[test]
    fn crc_covers_header_bytes_not_payload() {
        let header = FrameHeaderBuilder::new(7, 0, 1, 123, 256, 256, 16, FrameHeaderFlags::empty()).finish();
        let bytes = header.as_wire_bytes();
        assert_eq!(
            xrd_crc::crc16_ccitt(&bytes[..28]),
            u16::from_le_bytes([bytes[28], bytes[29]])
        );
        // Corrupting the payload must not affect a header whose CRC never
        // covered it in the first place.
        let mut packet = bytes.to_vec();
        packet.extend_from_slice(&[1, 2, 3, 4]);
        assert!(decode_packet(&packet).is_ok());
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(decode_packet(&packet).is_ok());
    }

    #[test]
    fn fragmenting_a_3072_square_16_bit_frame_yields_2304_packets() {
        let payload = vec![0u8; 3072 * 3072 * 2];
        let packets = fragment(1, 0, 3072, 3072, 16, &payload, MAX_PAYLOAD_BYTES);
        assert_eq!(packets.len(), 2304);
        assert_eq!(packets[0].len(), FrameHeader::WIRE_LEN + MAX_PAYLOAD_BYTES);
        let (last_header, _) = decode_packet(&packets[2303]).unwrap();
        assert!(last_header.flags().contains(FrameHeaderFlags::LAST_PACKET));
        assert_eq!(last_header.total_packets(), 2304);
    }

    #[test]
    fn corrupted_header_fails_crc_check() {
        let mut packets = fragment(1, 0, 256, 256, 16, &[1, 2, 3, 4], MAX_PAYLOAD_BYTES);
        packets[0][16] ^= 0xFF; // inside timestamp_ns, covered by the CRC
        assert_eq!(decode_packet(&packets[0]), Err(TransportError::CrcMismatch));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut packets = fragment(1, 0, 256, 256, 16, &[1, 2, 3, 4], MAX_PAYLOAD_BYTES);
        packets[0][0] ^= 0xFF;
        assert!(matches!(decode_packet(&packets[0]), Err(TransportError::BadMagic(_))));
    }

    #[test]
    fn fragment_matrix_matches_byte_level_fragment() {
        let matrix = xrd_csi2::PixelMatrix::zeroed(256, 256, 16).unwrap();
        let via_matrix = fragment_matrix(&matrix, 9, 0, MAX_PAYLOAD_BYTES);
        let via_bytes = fragment(9, 0, 256, 256, 16, &matrix.to_le_bytes(), MAX_PAYLOAD_BYTES);
        assert_eq!(via_matrix, via_bytes);
    }

    #[test]
    fn configurable_payload_size_changes_fragment_count() {
        let packets = fragment(1, 0, 256, 256, 16, &[0u8; 16], 4);
        assert_eq!(packets.len(), 4);
    }

    #[test]
    fn frame_number_wraparound_is_handled() {
        assert!(is_newer(u32::MAX, 0));
        assert!(is_newer(0, 1));
        assert!(!is_newer(1, 0));
        assert!(!is_newer(5, 5));
    }
}
