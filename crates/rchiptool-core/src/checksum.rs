//! Checksum helpers
//!
//! CRC-32 comes from `crc32fast`; the byte sum is the accumulating checksum
//! used by simple stop-and-wait bootloaders.

/// CRC-32 (IEEE 802.3) of `data`
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Incremental CRC-32 over several slices
#[derive(Debug, Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    /// Start a new CRC
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish and return the CRC value
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

/// Wrapping 32-bit sum of all bytes in `data`
pub fn sum32(data: &[u8]) -> u32 {
    let mut sum = Sum32::new();
    sum.update(data);
    sum.value()
}

/// Accumulating 32-bit byte sum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sum32(u32);

impl Sum32 {
    /// Start a new sum at zero
    pub fn new() -> Self {
        Self(0)
    }

    /// Add every byte of `data` to the sum
    pub fn update(&mut self, data: &[u8]) {
        self.0 = data
            .iter()
            .fold(self.0, |acc, &b| acc.wrapping_add(b as u32));
    }

    /// Current value
    pub fn value(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        // Standard check value for CRC-32/ISO-HDLC
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_incremental_matches_oneshot() {
        let mut crc = Crc32::new();
        crc.update(b"1234");
        crc.update(b"56789");
        assert_eq!(crc.finalize(), crc32(b"123456789"));
    }

    #[test]
    fn test_sum32_wraps() {
        assert_eq!(sum32(&[0x01, 0x02, 0xFF]), 0x102);
        let mut sum = Sum32(u32::MAX);
        sum.update(&[2]);
        assert_eq!(sum.value(), 1);
    }
}
