//! CRC-32 accumulation across chunk boundaries.

use std::fmt;

/// CRC-32 (ZIP polynomial) that can be fed incrementally.
#[derive(Clone)]
pub struct RunningCrc {
    hasher: crc32fast::Hasher,
}

impl RunningCrc {
    pub fn new() -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// CRC of everything fed so far.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn reset(&mut self) {
        self.hasher.reset();
    }
}

impl Default for RunningCrc {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RunningCrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunningCrc(0x{:08x})", self.value())
    }
}

/// One-shot CRC-32.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// A declared CRC of zero means "unknown" (streaming archives) and is never
/// compared.
pub fn matches_declared(declared: u32, actual: u32) -> bool {
    declared == 0 || declared == actual
}
