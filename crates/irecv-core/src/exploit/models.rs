//! Per-model heap layout constants for the limera1n sequence.

/// Heap and address constants for one device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    /// Model identifier as reported by the device, e.g. `iPhone3,1`.
    pub identifier: &'static str,
    /// Size of the heap region the filler has to consume.
    pub max_size: u32,
    /// Stack pointer written into every fake heap header.
    pub stack_address: u32,
    /// Entry point of the shellcode once it lands on the heap.
    pub shellcode_address: u32,
}

const S5L8920: (u32, u32, u32) = (0x24000, 0x8403_3FA4, 0x8402_3001);
const S5L8922: (u32, u32, u32) = (0x24000, 0x8403_3F98, 0x8402_3001);
const S5L8930: (u32, u32, u32) = (0x2C000, 0x8403_BF9C, 0x8402_B001);

const fn profile(identifier: &'static str, soc: (u32, u32, u32)) -> ModelProfile {
    ModelProfile {
        identifier,
        max_size: soc.0,
        stack_address: soc.1,
        shellcode_address: soc.2,
    }
}

/// Models the sequence is known to work on.
pub const SUPPORTED_MODELS: &[ModelProfile] = &[
    profile("iPhone2,1", S5L8920),
    profile("iPod3,1", S5L8922),
    profile("iPhone3,1", S5L8930),
    profile("iPad1,1", S5L8930),
    profile("iPod4,1", S5L8930),
    profile("AppleTV2,1", S5L8930),
];

/// Look up a model by its exact identifier.
pub fn lookup(identifier: &str) -> Option<&'static ModelProfile> {
    SUPPORTED_MODELS.iter().find(|m| m.identifier == identifier)
}
