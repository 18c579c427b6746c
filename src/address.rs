use crate::constants::{QUIRK_OFFSET, SECTOR_WORDS};

/// A detector word address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct WordAddress(pub u32);

impl WordAddress {
    /// First word of sector `index`.
    pub fn sector(index: u32) -> Self {
        Self(index.wrapping_mul(SECTOR_WORDS))
    }

    pub fn sector_offset(self) -> u32 {
        self.0 % SECTOR_WORDS
    }

    pub fn sector_base(self) -> Self {
        Self(self.0 - self.sector_offset())
    }

    pub fn in_quirk_zone(self) -> bool {
        self.sector_offset() >= QUIRK_OFFSET
    }

    /// Words left before the block-read region of this sector ends (0 inside the quirk zone).
    pub fn words_to_quirk_zone(self) -> u32 {
        QUIRK_OFFSET.saturating_sub(self.sector_offset())
    }

    pub fn words_to_sector_end(self) -> u32 {
        SECTOR_WORDS - self.sector_offset()
    }

    pub fn offset(self, words: u32) -> Self {
        Self(self.0.wrapping_add(words))
    }
}

impl From<u32> for WordAddress {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::WordAddress;

    #[test]
    fn sector_math() {
        let a = WordAddress(0x2_FD00);
        assert_eq!(a.sector_offset(), 0xFD00);
        assert_eq!(a.sector_base(), WordAddress::sector(2));
        assert_eq!(a.words_to_quirk_zone(), 0x100);
        assert_eq!(a.words_to_sector_end(), 0x300);
        assert!(!a.in_quirk_zone());

        let q = WordAddress(0xFE10);
        assert!(q.in_quirk_zone());
        assert_eq!(q.words_to_quirk_zone(), 0);
        assert_eq!(q.words_to_sector_end(), 0x1F0);
    }
}
