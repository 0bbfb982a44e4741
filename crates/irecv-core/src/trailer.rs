//! Integrity trailer for control-transfer uploads.
//!
//! The final DFU/WTF chunk carries a 16 byte suffix: a fixed 12 byte
//! template followed by a CRC-32 (reflected, polynomial `0xEDB88320`, seed
//! `0xFFFFFFFF`, no final XOR) over the whole image and the template,
//! stored little-endian.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Algorithm, Crc, Digest};

/// Suffix template: device release `FFFF`, product `FFFF`, vendor `05AC`,
/// DFU version 1.00, `"UFD"` marker, suffix length 16.
pub const TRAILER_TEMPLATE: [u8; 12] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xAC, 0x05, 0x00, 0x01, 0x55, 0x46, 0x44, 0x10,
];

pub const TRAILER_LEN: usize = TRAILER_TEMPLATE.len() + 4;

/// CRC-32/ISO-HDLC without the output inversion.
const DFU_SUFFIX_CRC: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04C1_1DB7,
    init: 0xFFFF_FFFF,
    refin: true,
    refout: true,
    xorout: 0x0000_0000,
    check: 0x340B_C6D9,
    residue: 0x0000_0000,
};

static CRC: Crc<u32> = Crc::<u32>::new(&DFU_SUFFIX_CRC);

/// Rolling checksum over an image, finished by folding the template.
pub struct TrailerCodec {
    digest: Digest<'static, u32>,
}

impl TrailerCodec {
    pub fn new() -> Self {
        Self {
            digest: CRC.digest(),
        }
    }

    /// Fold payload bytes into the accumulator.
    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    /// Fold the template and return the final accumulator.
    pub fn finish(mut self) -> u32 {
        // two six byte passes over the template
        for pass in TRAILER_TEMPLATE.chunks(6) {
            self.digest.update(pass);
        }
        self.digest.finalize()
    }

    /// Template plus checksum, ready to append to the final chunk.
    pub fn finish_trailer(self) -> [u8; TRAILER_LEN] {
        let checksum = self.finish();
        let mut trailer = [0u8; TRAILER_LEN];
        trailer[..TRAILER_TEMPLATE.len()].copy_from_slice(&TRAILER_TEMPLATE);
        LittleEndian::write_u32(&mut trailer[TRAILER_TEMPLATE.len()..], checksum);
        trailer
    }
}

impl Default for TrailerCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of a complete image.
pub fn image_checksum(image: &[u8]) -> u32 {
    let mut codec = TrailerCodec::new();
    codec.update(image);
    codec.finish()
}

/// Trailer bytes for a complete image.
pub fn image_trailer(image: &[u8]) -> [u8; TRAILER_LEN] {
    let mut codec = TrailerCodec::new();
    codec.update(image);
    codec.finish_trailer()
}
