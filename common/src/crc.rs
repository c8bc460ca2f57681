use crc::{Crc, CRC_16_IBM_3740};

// Poly 0x1021, init 0xFFFF, no reflection: the "CCITT" variant FRAM headers carry.
const CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub fn crc16_ccitt(data: &[u8]) -> u16 {
    CCITT.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_ccitt_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn empty_input_is_seed() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }
}
