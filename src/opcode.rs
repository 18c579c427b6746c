/// Response to a frame whose opcode is not a known command.
pub const UNKNOWN_COMMAND: u8 = 4;
/// Response carrying a failure list instead of the command's own payload.
pub const FAILED_COMMAND: u8 = 5;

/// Command opcodes. The success response of each is the next odd value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Ping = 2,
    VtBitCountKPage = 6,
    EraseChip = 8,
    EraseSector = 10,
    ProgramSector = 12,
    ProgramChip = 14,
    SectorBitCount = 16,
    ReadData = 18,
    WriteData = 20,
    ReadWord = 22,
    ReadCfg = 24,
    WriteCfg = 26,
    CfgFlashEnter = 28,
    CfgFlashExit = 30,
    CfgFlashRead = 32,
    CfgFlashWrite = 34,
    CfgFlashErase = 36,
    CfgFlashInfo = 38,
    GetCalibration = 80,
    SetCalibration = 82,
    SetActiveCounts = 84,
}

/// How the engine runs a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Handled in the receive path, response carries the result.
    Immediate,
    /// Accepted into the pending slot and executed by the next tick.
    Deferred,
}

impl OpCode {
    pub fn from_u8(n: u8) -> Option<OpCode> {
        let opcode = match n {
            2 => OpCode::Ping,
            6 => OpCode::VtBitCountKPage,
            8 => OpCode::EraseChip,
            10 => OpCode::EraseSector,
            12 => OpCode::ProgramSector,
            14 => OpCode::ProgramChip,
            16 => OpCode::SectorBitCount,
            18 => OpCode::ReadData,
            20 => OpCode::WriteData,
            22 => OpCode::ReadWord,
            24 => OpCode::ReadCfg,
            26 => OpCode::WriteCfg,
            28 => OpCode::CfgFlashEnter,
            30 => OpCode::CfgFlashExit,
            32 => OpCode::CfgFlashRead,
            34 => OpCode::CfgFlashWrite,
            36 => OpCode::CfgFlashErase,
            38 => OpCode::CfgFlashInfo,
            80 => OpCode::GetCalibration,
            82 => OpCode::SetCalibration,
            84 => OpCode::SetActiveCounts,
            _ => return None,
        };
        Some(opcode)
    }

    pub fn response(self) -> u8 {
        self as u8 + 1
    }

    pub fn dispatch(self) -> Dispatch {
        match self {
            OpCode::EraseChip
            | OpCode::EraseSector
            | OpCode::ProgramSector
            | OpCode::ProgramChip
            | OpCode::WriteData => Dispatch::Deferred,
            _ => Dispatch::Immediate,
        }
    }

    /// Served even while a deferred command is pending.
    pub fn always_served(self) -> bool {
        matches!(self, OpCode::Ping | OpCode::GetCalibration)
    }

    /// Exact command payload size; any other size is a framing error.
    pub fn payload_size(self) -> usize {
        match self {
            OpCode::Ping
            | OpCode::EraseChip
            | OpCode::CfgFlashEnter
            | OpCode::CfgFlashExit
            | OpCode::CfgFlashInfo => 0,
            OpCode::EraseSector
            | OpCode::ProgramChip
            | OpCode::ReadCfg
            | OpCode::GetCalibration => 4,
            OpCode::VtBitCountKPage
            | OpCode::ProgramSector
            | OpCode::SectorBitCount
            | OpCode::WriteCfg
            | OpCode::CfgFlashRead
            | OpCode::CfgFlashErase
            | OpCode::SetActiveCounts => 8,
            OpCode::SetCalibration => 12,
            OpCode::ReadData | OpCode::ReadWord => 16,
            OpCode::WriteData | OpCode::CfgFlashWrite => 1032,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_COMMAND_PAYLOAD;

    #[test]
    fn codes_round_trip_and_pair() {
        for n in 0..=u8::MAX {
            if let Some(op) = OpCode::from_u8(n) {
                assert_eq!(op as u8, n);
                assert_eq!(n % 2, 0);
                assert_eq!(op.response(), n + 1);
                assert!(op.payload_size() % 4 == 0);
                assert!(op.payload_size() <= MAX_COMMAND_PAYLOAD);
            }
        }
    }

    #[test]
    fn reserved_and_response_codes_are_not_commands() {
        assert_eq!(OpCode::from_u8(0), None);
        assert_eq!(OpCode::from_u8(3), None);
        assert_eq!(OpCode::from_u8(UNKNOWN_COMMAND), None);
        assert_eq!(OpCode::from_u8(FAILED_COMMAND), None);
    }

    #[test]
    fn deferred_set() {
        assert_eq!(OpCode::EraseSector.dispatch(), Dispatch::Deferred);
        assert_eq!(OpCode::WriteData.dispatch(), Dispatch::Deferred);
        assert_eq!(OpCode::ReadData.dispatch(), Dispatch::Immediate);
        assert!(OpCode::Ping.always_served());
        assert!(!OpCode::SetCalibration.always_served());
    }
}
