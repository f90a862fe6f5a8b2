// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A logging stand-in for the real SPI master that would carry FSM control
//! edges to the FPGA's register map (out of scope per §1: "the detailed
//! register map of the SPI slave").

use std::io;

use xrd_core::traits::SpiDevice;

#[derive(Default)]
pub struct LoggingSpiDevice;

impl SpiDevice for LoggingSpiDevice {
    fn write(&mut self, src: &[u8]) -> io::Result<()> {
        log::info!("SPI CONTROL write: {src:02x?}");
        Ok(())
    }

    fn read(&mut self, dest: &mut [u8]) -> io::Result<usize> {
        dest.fill(0);
        Ok(dest.len())
    }
}
