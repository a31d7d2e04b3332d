use crc::{Algorithm, Crc};

/// Polynomial of the serial link's frame checksum
pub const CRC16_POLY: u16 = 0x5935;

/// MSB-first CRC-16 without reflection or final XOR: each input bit is XOR'ed with the bit
///  shifted out of the register, and the polynomial is applied if the result is set.
const FRAME_CRC16: Algorithm<u16> = Algorithm {
    width: 16,
    poly: CRC16_POLY,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0,
    check: 0,
    residue: 0,
};

const HASHER: Crc<u16> = Crc::<u16>::new(&FRAME_CRC16);

/// Continues a running CRC over `data`, starting from `initial`. Feeding the result of one call
///  as `initial` of the next checksums the concatenation of both inputs, so a header and a
///  payload can be checksummed without copying them into a single buffer.
pub fn crc16(data: &[u8], initial: u16) -> u16 {
    let mut digest = HASHER.digest_with_initial(initial);
    digest.update(data);
    digest.finalize()
}
