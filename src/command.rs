use crate::analog::CalibrationPair;
use crate::prelude::*;
use nom::{
    bytes::complete::take,
    combinator::map,
    number::complete::{le_f32, le_u16, le_u32},
    sequence::{pair, tuple},
    IResult,
};

/// A decoded command payload. Bulk data borrows from the received frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command<'a> {
    Ping,
    VtBitCountKPage {
        base: WordAddress,
        mv: u32,
    },
    EraseChip,
    EraseSector(WordAddress),
    ProgramSector {
        sector: WordAddress,
        value: u16,
    },
    ProgramChip {
        value: u16,
    },
    SectorBitCount {
        base: WordAddress,
        mv: u32,
    },
    ReadData {
        base: WordAddress,
        vt: bool,
        mv: u32,
        count: u32,
    },
    /// `data` holds 512 little-endian words of which `count` are used.
    WriteData {
        data: &'a [u8],
        base: WordAddress,
        count: u32,
    },
    ReadWord {
        vt: bool,
        mv: u32,
        addr: WordAddress,
        samples: u32,
    },
    ReadCfg(WordAddress),
    WriteCfg {
        addr: WordAddress,
        data: u32,
    },
    CfgFlashEnter,
    CfgFlashExit,
    CfgFlashRead {
        addr: u32,
        len: u32,
    },
    CfgFlashWrite {
        data: &'a [u8],
        addr: u32,
        len: u32,
    },
    CfgFlashErase {
        kind: u32,
        addr: u32,
    },
    CfgFlashInfo,
    GetCalibration {
        unit: u32,
    },
    SetCalibration {
        unit: u32,
        pair: CalibrationPair,
    },
    SetActiveCounts {
        unit: u32,
        counts: u32,
    },
}

const BULK_SIZE: usize = 1024;

impl<'a> Command<'a> {
    pub const MAX_SIZE: usize = MAX_COMMAND_PAYLOAD;

    fn address(input: &[u8]) -> IResult<&[u8], WordAddress> {
        map(le_u32, WordAddress)(input)
    }

    fn flag(input: &[u8]) -> IResult<&[u8], bool> {
        map(le_u32, |v| v != 0)(input)
    }

    /// A 16-bit value followed by a pad half-word.
    fn padded_u16(input: &[u8]) -> IResult<&[u8], u16> {
        map(pair(le_u16, le_u16), |(value, _)| value)(input)
    }

    fn bit_count(input: &[u8]) -> IResult<&[u8], (WordAddress, u32)> {
        pair(Self::address, le_u32)(input)
    }

    fn program_sector(input: &[u8]) -> IResult<&[u8], Self> {
        map(pair(Self::address, Self::padded_u16), |(sector, value)| {
            Self::ProgramSector { sector, value }
        })(input)
    }

    fn read_data(input: &[u8]) -> IResult<&[u8], Self> {
        map(
            tuple((Self::address, Self::flag, le_u32, le_u32)),
            |(base, vt, mv, count)| Self::ReadData {
                base,
                vt,
                mv,
                count,
            },
        )(input)
    }

    fn write_data(input: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            tuple((take(BULK_SIZE), Self::address, le_u32)),
            |(data, base, count)| Self::WriteData { data, base, count },
        )(input)
    }

    fn read_word(input: &[u8]) -> IResult<&[u8], Self> {
        map(
            tuple((Self::flag, le_u32, Self::address, le_u32)),
            |(vt, mv, addr, samples)| Self::ReadWord {
                vt,
                mv,
                addr,
                samples,
            },
        )(input)
    }

    fn write_cfg(input: &[u8]) -> IResult<&[u8], Self> {
        map(pair(Self::address, le_u32), |(addr, data)| Self::WriteCfg {
            addr,
            data,
        })(input)
    }

    fn cfg_flash_read(input: &[u8]) -> IResult<&[u8], Self> {
        map(pair(le_u32, le_u32), |(addr, len)| Self::CfgFlashRead {
            addr,
            len,
        })(input)
    }

    fn cfg_flash_write(input: &'a [u8]) -> IResult<&'a [u8], Self> {
        map(
            tuple((take(BULK_SIZE), le_u32, le_u32)),
            |(data, addr, len)| Self::CfgFlashWrite { data, addr, len },
        )(input)
    }

    fn cfg_flash_erase(input: &[u8]) -> IResult<&[u8], Self> {
        map(pair(le_u32, le_u32), |(kind, addr)| Self::CfgFlashErase {
            kind,
            addr,
        })(input)
    }

    fn set_calibration(input: &[u8]) -> IResult<&[u8], Self> {
        map(tuple((le_u32, le_f32, le_f32)), |(unit, c0, c1)| {
            Self::SetCalibration {
                unit,
                pair: CalibrationPair { c0, c1 },
            }
        })(input)
    }

    fn set_active_counts(input: &[u8]) -> IResult<&[u8], Self> {
        map(pair(le_u32, le_u32), |(unit, counts)| Self::SetActiveCounts {
            unit,
            counts,
        })(input)
    }

    /// Decodes the payload of a validated frame. The payload must have the
    /// exact size the opcode defines.
    pub fn parse(opcode: OpCode, payload: &'a [u8]) -> Result<Self, ParseError> {
        let expected = opcode.payload_size();
        if payload.len() != expected {
            return Err(ParseError::PayloadSize {
                opcode,
                expected,
                actual: payload.len(),
            });
        }

        let res = payload;
        let ok = |command| Ok((res, command));
        let parsed: IResult<&[u8], Self> = match opcode {
            OpCode::Ping => ok(Self::Ping),
            OpCode::VtBitCountKPage => map(Self::bit_count, |(base, mv)| {
                Self::VtBitCountKPage { base, mv }
            })(res),
            OpCode::EraseChip => ok(Self::EraseChip),
            OpCode::EraseSector => map(Self::address, Self::EraseSector)(res),
            OpCode::ProgramSector => Self::program_sector(res),
            OpCode::ProgramChip => {
                map(Self::padded_u16, |value| Self::ProgramChip { value })(res)
            }
            OpCode::SectorBitCount => map(Self::bit_count, |(base, mv)| {
                Self::SectorBitCount { base, mv }
            })(res),
            OpCode::ReadData => Self::read_data(res),
            OpCode::WriteData => Self::write_data(res),
            OpCode::ReadWord => Self::read_word(res),
            OpCode::ReadCfg => map(Self::address, Self::ReadCfg)(res),
            OpCode::WriteCfg => Self::write_cfg(res),
            OpCode::CfgFlashEnter => ok(Self::CfgFlashEnter),
            OpCode::CfgFlashExit => ok(Self::CfgFlashExit),
            OpCode::CfgFlashRead => Self::cfg_flash_read(res),
            OpCode::CfgFlashWrite => Self::cfg_flash_write(res),
            OpCode::CfgFlashErase => Self::cfg_flash_erase(res),
            OpCode::CfgFlashInfo => ok(Self::CfgFlashInfo),
            OpCode::GetCalibration => map(le_u32, |unit| Self::GetCalibration { unit })(res),
            OpCode::SetCalibration => Self::set_calibration(res),
            OpCode::SetActiveCounts => Self::set_active_counts(res),
        };

        match parsed {
            Ok((rest, command)) if rest.is_empty() => Ok(command),
            _ => Err(ParseError::Malformed { opcode }),
        }
    }
}
