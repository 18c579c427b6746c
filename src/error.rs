use crate::opcode::OpCode;
use snafu::Snafu;

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum DataError {
    #[snafu(display(
        "Buffer of size {} provided while a buffer of size {} was required",
        buf_size,
        required
    ))]
    BufferTooSmall { buf_size: usize, required: usize },
}

/// Why a validated frame could not be turned into a command.
#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[snafu(display(
        "{:?} expects a {} byte payload, got {}",
        opcode,
        expected,
        actual
    ))]
    PayloadSize {
        opcode: OpCode,
        expected: usize,
        actual: usize,
    },
    #[snafu(display("Malformed {:?} payload", opcode))]
    Malformed { opcode: OpCode },
}
