//! CRC-32 as computed by the STM32 CRC peripheral.
//!
//! Polynomial `0x04C11DB7`, initial value `0xFFFFFFFF`, MSB first with no
//! reflection and no output XOR (CRC-32/MPEG-2). The peripheral consumes whole
//! 32-bit words so frame CRCs are computed over zero padded data.

use ::crc::{Crc, CRC_32_MPEG_2};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Compute the CRC over a byte slice
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Append the CRC of `data` (zero padded to a word boundary) in little-endian
/// order. The padding is only used for the computation and is not retained.
pub fn append_crc(data: &mut Vec<u8>) {
    let len = data.len();

    let padded = (len + 3) & !3;
    data.resize(padded, 0);

    let crc = crc32(data);

    data.truncate(len);
    data.extend_from_slice(&crc.to_le_bytes());
}

/// CRC of an application image as the bootloader computes it in flash.
///
/// The image is padded with erased flash (`0xFF`) up to `region_len` bytes and
/// each 32-bit word is byte swapped to match the order the CRC peripheral
/// reads words from memory.
pub fn target_crc(image: &[u8], region_len: usize) -> u32 {
    let mut buff = image.to_vec();
    if buff.len() < region_len {
        buff.resize(region_len, 0xFF);
    }

    for word in buff.chunks_exact_mut(4) {
        word.reverse();
    }

    crc32(&buff)
}
