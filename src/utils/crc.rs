//! CRC32 as used by MPEG-2 PSI sections (ISO/IEC 13818-1 Annex A).
//!
//! Polynomial 0x04C11DB7, initial value 0xFFFFFFFF, no reflection and no
//! final XOR. A section followed by its own CRC checksums to zero.

const CRC32_MPEG2: u32 = 0x04C11DB7;

/// Table-driven MPEG-2 CRC32 calculator.
#[derive(Clone)]
pub struct Crc32Mpeg2 {
    table: [u32; 256],
}

impl Crc32Mpeg2 {
    /// Builds the lookup table.
    pub fn new() -> Self {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = (i as u32) << 24;
            for _ in 0..8 {
                crc = if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ CRC32_MPEG2
                } else {
                    crc << 1
                };
            }
            *entry = crc;
        }
        Self { table }
    }

    /// Computes the checksum of `data`.
    ///
    /// # Examples
    ///
    /// ```
    /// use vtpio::utils::Crc32Mpeg2;
    ///
    /// let crc = Crc32Mpeg2::new();
    /// assert_eq!(crc.calculate(&[0x01, 0x01]), 0xD66F_B816);
    /// ```
    pub fn calculate(&self, data: &[u8]) -> u32 {
        data.iter().fold(0xFFFF_FFFF, |crc, &byte| {
            let index = ((crc >> 24) ^ byte as u32) & 0xFF;
            (crc << 8) ^ self.table[index as usize]
        })
    }

    /// Appends the big-endian checksum of `section` to it.
    pub fn seal(&self, section: &mut Vec<u8>) {
        let crc = self.calculate(section);
        section.extend_from_slice(&crc.to_be_bytes());
    }
}

impl Default for Crc32Mpeg2 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        let crc = Crc32Mpeg2::new();
        assert_eq!(crc.calculate(&[0x01, 0x01]), 0xD66F_B816);
    }

    #[test]
    fn test_sealed_section_checks_to_zero() {
        let crc = Crc32Mpeg2::new();
        let mut pat = vec![
            0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xE1, 0x00,
        ];
        crc.seal(&mut pat);
        assert_eq!(pat.len(), 16);
        assert_eq!(crc.calculate(&pat), 0);
    }
}
