/*
 * SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a page boundary.
pub fn calc<N: PrimInt>(offset: N, page_size: N) -> N {
    let r = offset % page_size;
    if r == N::zero() {
        N::zero()
    } else {
        page_size - r
    }
}

/// Round to the next multiple of the page size.
pub fn round<N: PrimInt>(offset: N, page_size: N) -> Option<N> {
    let remain = calc(offset, page_size);
    offset.checked_add(&remain)
}

#[cfg(test)]
mod tests {
    #[test]
    fn calc() {
        assert_eq!(super::calc(0u32, 4096), 0);
        assert_eq!(super::calc(1u32, 4096), 4095);
        assert_eq!(super::calc(4095u32, 4096), 1);
        assert_eq!(super::calc(4096u32, 4096), 0);
    }

    #[test]
    fn round() {
        assert_eq!(super::round(0u32, 4096), Some(0));
        assert_eq!(super::round(1u32, 4096), Some(4096));
        assert_eq!(super::round(u32::MAX, 4096), None);
    }
}
