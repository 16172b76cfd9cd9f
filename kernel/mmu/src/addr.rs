/// Type alias for virtual addresses.
///
/// This is used by functions that explicitly interpret addresses as virtual ones.
pub type VAddr = u64;

/// The first address of the upper (kernel) half of a 48-bit address space.
pub const UPPER_HALF_START: VAddr = 0xFFFF_8000_0000_0000;

/// The first address above the lower (user) half of a 48-bit address space.
pub const LOWER_HALF_END: VAddr = 0x0000_8000_0000_0000;

/// Round `addr` down to a multiple of `align` which must be a power of two.
#[inline]
pub const fn align_down(addr: u64, align: u64) -> u64 {
    addr & !(align - 1)
}

/// Round `addr` up to a multiple of `align` which must be a power of two.
///
/// Returns `None` if the result does not fit into 64 bits.
#[inline]
pub const fn align_up(addr: u64, align: u64) -> Option<u64> {
    match addr.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Whether `addr` is a multiple of `align` which must be a power of two.
#[inline]
pub const fn is_aligned(addr: u64, align: u64) -> bool {
    addr & (align - 1) == 0
}

/// Whether `vaddr` is a canonical 48-bit address, i.e. bits 63–48 are copies of bit 47.
#[inline]
pub const fn is_canonical(vaddr: VAddr) -> bool {
    let upper = vaddr >> 47;
    upper == 0 || upper == (1 << 17) - 1
}

/// Whether `vaddr` lies in the upper (kernel) half of the address space.
#[inline]
pub const fn is_upper_half(vaddr: VAddr) -> bool {
    vaddr >= UPPER_HALF_START
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_addresses() {
        assert!(is_canonical(0));
        assert!(is_canonical(LOWER_HALF_END - 1));
        assert!(!is_canonical(LOWER_HALF_END));
        assert!(!is_canonical(0x0001_0000_0000_0000));
        assert!(is_canonical(UPPER_HALF_START));
        assert!(is_canonical(u64::MAX));
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(u64::MAX, 0x1000), None);
        assert!(is_aligned(0x20_0000, 0x20_0000));
        assert!(!is_aligned(0x20_1000, 0x20_0000));
    }
}
