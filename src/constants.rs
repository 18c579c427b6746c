/// Start of every frame, in both directions (`'~'`).
pub const FRAME_MARKER: u8 = 0x7E;
/// Marker, little-endian length and opcode.
pub const HEADER_SIZE: usize = 4;
pub const CRC_SIZE: usize = 4;
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CRC_SIZE;

pub const MAX_COMMAND_PAYLOAD: usize = 1088;
pub const MAX_RESPONSE_PAYLOAD: usize = 4160;
pub const MAX_COMMAND_FRAME: usize = 64 + MAX_COMMAND_PAYLOAD;
pub const MAX_RESPONSE_FRAME: usize = 64 + MAX_RESPONSE_PAYLOAD;

/// Reported by ping, NUL padded to [`VERSION_TAG_SIZE`].
pub const VERSION_TAG: &str = concat!("detctrl ", env!("CARGO_PKG_VERSION"));
pub const VERSION_TAG_SIZE: usize = 16;

// Detector geometry, in 16-bit words.
pub const SECTOR_WORDS: u32 = 0x1_0000;
pub const SECTOR_COUNT: u32 = 1024;
/// Sector offset where block reads stop being reliable.
pub const QUIRK_OFFSET: u32 = 0xFE00;
pub const PAGE_WORDS: usize = 8;
pub const KPAGE_COUNT: usize = 1024;
pub const PROGRAM_CHUNK_WORDS: usize = 512;

pub const MAX_READ_WORDS: usize = 2048;
pub const WRITE_DATA_WORDS: usize = 512;
pub const READ_WORD_BITS: usize = 16;

/// Set on an address to reach the configuration register space.
pub const CFG_ADDRESS_BIT: u32 = 0x8000_0000;
pub const CFG_FLASH_READ_MAX: usize = 4096;
pub const CFG_FLASH_WRITE_MAX: usize = 1024;
pub const CFG_FLASH_PAGE_SIZE: usize = 256;
/// Three address bytes per command.
pub const CFG_FLASH_ADDRESS_SPACE: u32 = 1 << 24;
pub const CFG_FLASH_POLL_LIMIT: u32 = 100_000;

pub const MAX_FAILURES: usize = 16;
/// Main loop iterations between two mode watchdog checks.
pub const WATCHDOG_PERIOD: u32 = 100;

// Mode machine voltages, in millivolts.
pub const SAFE_LOW_MV: u32 = 0;
pub const SAFE_HIGH_MV: u32 = 3300;
pub const SCAN_PROTECT_MV: u32 = 12_500;
pub const DEFAULT_THRESHOLD_MV: u32 = 3000;

/// Command writes that unlock threshold scan, as `(address, data)`.
pub const SCAN_UNLOCK_SEQUENCE: [(u32, u16); 4] =
    [(0x00, 0x0080), (0x00, 0x0001), (0x00, 0x0080), (8 << 1, 0x0012)];

/// Settling windows used by the mode state machine, in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub selector_settle_us: u32,
    pub enter_settle_us: u32,
    pub threshold_settle_us: u32,
    pub unlock_us: u32,
    pub post_enter_us: u32,
    pub exit_settle_us: u32,
    pub reset_hold_low_us: u32,
    pub reset_hold_high_us: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            selector_settle_us: 10,
            enter_settle_us: 20,
            threshold_settle_us: 100,
            unlock_us: 1,
            post_enter_us: 1,
            exit_settle_us: 1,
            reset_hold_low_us: 100,
            reset_hold_high_us: 100,
        }
    }
}
