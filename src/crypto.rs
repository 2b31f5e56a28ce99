/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! SHA-256 helpers for the LP metadata checksum fields. All payloads are at
//! most a few tens of KiB, so there is no streaming interface.

use ring::digest;
use std::ops::Range;

/// Compute the SHA-256 digest of a byte span.
pub fn sha256(buf: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    try_sha256(buf, &mut out);
    out
}

/// Compute the SHA-256 digest of a byte span into a caller-provided buffer.
pub fn try_sha256(buf: &[u8], out: &mut [u8; 32]) {
    let d = digest::digest(&digest::SHA256, buf);
    out.copy_from_slice(d.as_ref());
}

/// Compute the SHA-256 digest of a byte span with a window zeroed out. This is
/// how the LP geometry and header checksums are defined: the stored digest
/// covers the struct with its own checksum field set to all zeros.
pub fn sha256_with_hole(buf: &[u8], hole: Range<usize>) -> [u8; 32] {
    let mut copy = buf.to_vec();
    copy[hole].fill(0);
    sha256(&copy)
}

#[cfg(test)]
mod tests {
    use super::{sha256, sha256_with_hole};

    // SHA-256 of "foobar".
    const FOOBAR_SHA256: [u8; 32] = [
        0xc3, 0xab, 0x8f, 0xf1, 0x37, 0x20, 0xe8, 0xad, 0x90, 0x47, 0xdd, 0x39, 0x46, 0x6b, 0x3c,
        0x89, 0x74, 0xe5, 0x92, 0xc2, 0xfa, 0x38, 0x3d, 0x4a, 0x39, 0x60, 0x71, 0x4c, 0xae, 0xf0,
        0xc4, 0xf2,
    ];

    #[test]
    fn plain_digest() {
        assert_eq!(sha256(b"foobar"), FOOBAR_SHA256);
    }

    #[test]
    fn digest_with_hole() {
        let buf = *b"foo***";
        assert_ne!(sha256_with_hole(&buf, 3..6), FOOBAR_SHA256);

        let zeroed = *b"foo\0\0\0";
        assert_eq!(sha256_with_hole(&buf, 3..6), sha256(&zeroed));
    }
}
