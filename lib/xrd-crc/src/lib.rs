// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CRC-16/CCITT, the variant used by both the CSI-2 long-packet payload
//! checksum and the frame transport header checksum: polynomial `0x1021`,
//! initial value `0xFFFF`, no reflection, no final XOR. This is the
//! `CRC_16_IBM_3740` ("CCITT-FALSE") algorithm from the `crc` crate.

#![cfg_attr(not(test), no_std)]

use crc::{Algorithm, Crc, CRC_16_IBM_3740};

/// The algorithm definition, exposed for callers that want to build their
/// own [`crc::Digest`] for incremental use.
pub const ALGORITHM: &Algorithm<u16> = &CRC_16_IBM_3740;

static CRC16: Crc<u16> = Crc::<u16>::new(ALGORITHM);

/// Computes the CRC-16/CCITT checksum of `data` in one shot.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Returns a fresh incremental digest, for callers assembling a checksum
/// over several non-contiguous slices (e.g. a header prefix followed by a
/// payload that hasn't been copied into one contiguous buffer yet).
pub fn digest() -> crc::Digest<'static, u16> {
    CRC16.digest()
}
