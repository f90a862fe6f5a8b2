// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A synthetic CSI-2 byte source standing in for the real MIPI receiver.
//!
//! The panel front-end and the V4L2/DMA glue that would hand us real
//! packets are out of scope (§1); this generates a fresh ramp-pattern frame
//! per scan tick and serves it back one already-framed CSI-2 packet at a
//! time, exactly the granularity [`xrd_core::traits::Csi2Source`] expects.

use std::io;

use xrd_core::traits::Csi2Source;
use xrd_csi2::PixelMatrix;

pub struct SyntheticCsi2Source {
    vc: u8,
    rows: u16,
    cols: u16,
    bit_depth: u8,
    stream: Vec<u8>,
    offset: usize,
    tick: u32,
}

impl SyntheticCsi2Source {
    pub fn new(vc: u8, rows: u16, cols: u16, bit_depth: u8) -> Self {
        let mut source = Self {
            vc,
            rows,
            cols,
            bit_depth,
            stream: Vec::new(),
            offset: 0,
            tick: 0,
        };
        source.regenerate();
        source
    }

    fn regenerate(&mut self) {
        let mask = (1u32 << self.bit_depth) - 1;
        let mut samples = Vec::with_capacity(self.rows as usize * self.cols as usize);
        for r in 0..self.rows {
            for c in 0..self.cols {
                let value = (r as u32)
                    .wrapping_mul(self.cols as u32)
                    .wrapping_add(c as u32)
                    .wrapping_add(self.tick)
                    & mask;
                samples.push(value as u16);
            }
        }
        let matrix = PixelMatrix::from_samples(self.rows, self.cols, self.bit_depth, samples)
            .expect("synthetic frame shape is always within range");
        self.stream = xrd_csi2::generate_full_frame(self.vc, &matrix);
        self.offset = 0;
        self.tick = self.tick.wrapping_add(1);
    }
}

impl Csi2Source for SyntheticCsi2Source {
    /// Copies the next already-framed packet into `buf`, regenerating a
    /// fresh frame once the current one is exhausted.
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.stream.len() {
            self.regenerate();
        }
        let (_, consumed) = xrd_csi2::decode_packet(&self.stream[self.offset..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let packet = &self.stream[self.offset..self.offset + consumed];
        if buf.len() < packet.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "packet buffer too small"));
        }
        buf[..packet.len()].copy_from_slice(packet);
        self.offset += consumed;
        Ok(packet.len())
    }
}
