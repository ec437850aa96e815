use crc::{Crc, CRC_16_ARC};

/// The FCS is CRC-16 with the reflected polynomial 0xA001 (x^16 + x^15 + x^2 + 1) and an
///  initial value of zero, which is the catalogued CRC-16/ARC
const FCS_ALGORITHM: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

pub const FCS_LEN: usize = std::mem::size_of::<u16>();

pub fn compute_fcs(bytes: &[u8]) -> u16 {
    FCS_ALGORITHM.checksum(bytes)
}

/// `bytes` is a complete PDU with the FCS in its last two bytes (little endian)
pub fn verify_fcs(bytes: &[u8]) -> bool {
    received_and_calculated(bytes)
        .map(|(received, calculated)| received == calculated)
        .unwrap_or(false)
}

/// returns `(received, calculated)` or `None` if the buffer is too short to contain an FCS
pub(crate) fn received_and_calculated(bytes: &[u8]) -> Option<(u16, u16)> {
    if bytes.len() < FCS_LEN {
        return None;
    }
    let (covered, fcs) = bytes.split_at(bytes.len() - FCS_LEN);
    let received = u16::from_le_bytes([fcs[0], fcs[1]]);
    Some((received, compute_fcs(covered)))
}
