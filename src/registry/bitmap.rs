//! Bit-level helpers over `RTL_BITMAP` buffers.

/// Finds the lowest clear bit within the first `bit_count` bits, sets it, and
/// returns its index.
pub(crate) fn find_clear_bit_and_set(buffer: &mut [u8], bit_count: usize) -> Option<usize> {
    for (byte_index, byte) in buffer.iter_mut().enumerate() {
        if *byte == u8::MAX {
            continue;
        }

        for bit in 0..8 {
            let index = byte_index * 8 + bit;

            if index >= bit_count {
                return None;
            }

            if *byte & (1 << bit) == 0 {
                *byte |= 1 << bit;
                return Some(index);
            }
        }
    }

    None
}

/// Sets one bit.
pub(crate) fn set_bit(buffer: &mut [u8], index: usize) {
    if let Some(byte) = buffer.get_mut(index / 8) {
        *byte |= 1 << (index % 8);
    }
}

/// Clears one bit.
pub(crate) fn clear_bit(buffer: &mut [u8], index: usize) {
    if let Some(byte) = buffer.get_mut(index / 8) {
        *byte &= !(1 << (index % 8));
    }
}
