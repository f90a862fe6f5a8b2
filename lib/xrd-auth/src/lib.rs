// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HMAC-SHA256 over the command protocol's prefix-plus-payload region.
//!
//! The pre-shared key is process-wide and immutable after [`Key::new`]; it
//! is never logged or displayed in full.

#![cfg_attr(not(test), no_std)]

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of the HMAC-SHA256 tag.
pub const TAG_LEN: usize = 32;

/// A 32-byte pre-shared key. Initialized once; every subsequent use is a
/// shared, read-only reference.
#[derive(Clone)]
pub struct Key([u8; 32]);

impl Key {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn mac(&self) -> HmacSha256 {
        // A fixed-size key can't fail `new_from_slice`.
        HmacSha256::new_from_slice(&self.0).expect("32-byte key is valid for HMAC-SHA256")
    }
}

impl core::fmt::Debug for Key {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Key").field(&"<redacted>").finish()
    }
}

/// Computes HMAC-SHA256 over the concatenation of `parts`, in order.
pub fn hmac_sha256(key: &Key, parts: &[&[u8]]) -> [u8; TAG_LEN] {
    let mut mac = key.mac();
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Verifies `received` against the HMAC-SHA256 of the concatenation of
/// `parts`, in constant time with respect to the comparison itself (the tag
/// is computed from the trusted key and the received bytes, then compared
/// with [`Mac::verify_slice`], which does not short-circuit on the first
/// differing byte).
///
/// Returns `true` only if `received` is exactly [`TAG_LEN`] bytes and
/// matches.
pub fn verify(key: &Key, parts: &[&[u8]], received: &[u8]) -> bool {
    let mut mac = key.mac();
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(received).is_ok()
}
