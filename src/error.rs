use std::fmt;

use crate::ops;

/// The specific failure conditions the machine can report.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCode {
    /// Ran out of input mid-operand.
    Truncated,
    /// readline hit end of input before the 0x0a terminator.
    MissingNewline,
    /// FRAME issued while the previous frame window still holds bytes.
    NestedFrame,
    /// A read crossed the end of the active frame window.
    FrameUnderrun,
    /// Frame size exceeds the maximum addressable object size.
    FrameTooLarge(u64),
    /// A counted operand declared more bytes than the platform can address.
    LengthTooLarge(&'static str, u64),
    /// A signed length prefix was negative.
    NegativeLength(&'static str),
    /// Operand bytes did not decode under the expected encoding.
    BadEncoding(String),
    /// STRING operand was missing its outer quotes, or similar.
    BadString(String),
    /// A textual number operand failed to parse.
    BadNumber(String),
    UnknownOpcode(u8),
    UnsupportedProtocol(u8),
    /// PUT-family index was negative.
    NegativeIndex(&'static str),
    /// GET-family lookup missed.
    MemoNotFound(i64),
    StackUnderflow,
    /// A mark-popping opcode ran with an empty metastack.
    UnmatchedMark,
    /// An even number of stack items was required (DICT/SETITEMS).
    OddDictItems(&'static str),
    /// EXT* code was zero or negative.
    ExtCodeOutOfRange(i64),
    /// EXT* code has no entry in the extension registry.
    UnregisteredExtCode(i64),
    /// Module import or attribute lookup failed.
    Resolution(String),
    /// A callable/class raised during REDUCE/NEWOBJ/INST/OBJ/BUILD.
    Construction(String),
    /// Persistent ID encountered and no persistent-load hook is configured.
    UnsupportedPersistentId,
    /// NEXT_BUFFER with no out-of-band buffer source configured.
    NoBuffers,
    /// NEXT_BUFFER after the buffer source ran dry.
    BuffersExhausted,
    /// A value of this kind cannot be a dict key or set element.
    NotHashable(&'static str),
    /// An operand or stack slot had the wrong type for the opcode.
    TypeMismatch(String),
    /// step() after the machine already stopped or failed.
    MachineHalted,
}

/// The §7-style error families, useful for tests and host policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Semantic,
    Resolution,
    Construction,
    Policy,
    Type,
    State,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        use ErrorCode::*;
        match self {
            Truncated | MissingNewline | NestedFrame | FrameUnderrun | FrameTooLarge(_)
            | LengthTooLarge(..) | NegativeLength(_) | BadEncoding(_) | BadString(_)
            | BadNumber(_) | OddDictItems(_) => ErrorKind::Format,
            UnknownOpcode(_) | UnsupportedProtocol(_) | NegativeIndex(_) | MemoNotFound(_)
            | StackUnderflow | UnmatchedMark | ExtCodeOutOfRange(_) | UnregisteredExtCode(_) => {
                ErrorKind::Semantic
            }
            Resolution(_) => ErrorKind::Resolution,
            Construction(_) => ErrorKind::Construction,
            UnsupportedPersistentId | NoBuffers | BuffersExhausted => ErrorKind::Policy,
            NotHashable(_) | TypeMismatch(_) => ErrorKind::Type,
            MachineHalted => ErrorKind::State,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ErrorCode::*;
        match self {
            Truncated => write!(f, "pickle data was truncated"),
            MissingNewline => write!(f, "pickle exhausted before newline"),
            NestedFrame => write!(f, "beginning of a new frame before end of current frame"),
            FrameUnderrun => write!(f, "pickle exhausted before end of frame"),
            FrameTooLarge(n) => write!(f, "frame size > max size: {n}"),
            LengthTooLarge(op, n) => {
                write!(f, "{op} exceeds system's maximum size: {n} bytes")
            }
            NegativeLength(op) => write!(f, "{op} pickle has negative byte count"),
            BadEncoding(msg) => write!(f, "{msg}"),
            BadString(msg) => write!(f, "{msg}"),
            BadNumber(msg) => write!(f, "could not parse number: {msg}"),
            UnknownOpcode(op) => write!(f, "unknown opcode: 0x{op:02x}"),
            UnsupportedProtocol(p) => write!(f, "unsupported pickle protocol: {p}"),
            NegativeIndex(op) => write!(f, "negative {op} argument"),
            MemoNotFound(i) => write!(f, "memo value not found at index {i}"),
            StackUnderflow => write!(f, "pickle stack underflow"),
            UnmatchedMark => write!(f, "no MARK to pop"),
            OddDictItems(op) => write!(f, "odd number of items for {op}"),
            ExtCodeOutOfRange(code) => write!(f, "EXT specifies code <= 0: {code}"),
            UnregisteredExtCode(code) => write!(f, "unregistered extension code {code}"),
            Resolution(msg) => write!(f, "{msg}"),
            Construction(msg) => write!(f, "{msg}"),
            UnsupportedPersistentId => write!(f, "unsupported persistent id encountered"),
            NoBuffers => write!(
                f,
                "pickle stream refers to out-of-band data but no buffers were given"
            ),
            BuffersExhausted => write!(f, "not enough out-of-band buffers"),
            NotHashable(what) => write!(f, "unhashable value: {what}"),
            TypeMismatch(msg) => write!(f, "{msg}"),
            MachineHalted => write!(f, "machine already stopped or failed"),
        }
    }
}

/// An unpickling failure, with the instruction address and opcode byte the
/// engine attaches once they are known.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub code: ErrorCode,
    pub pos: Option<u64>,
    pub opcode: Option<u8>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            pos: None,
            opcode: None,
        }
    }

    /// Attach instruction context. Context already present wins; operand
    /// decoding errors surface through the handler that knows the opcode.
    pub fn at(mut self, pos: u64, opcode: u8) -> Self {
        self.pos.get_or_insert(pos);
        self.opcode.get_or_insert(opcode);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pos, self.opcode) {
            (Some(pos), Some(op)) => {
                let name = ops::mnemonic(op).unwrap_or("?");
                write!(f, "at position {pos}, opcode 0x{op:02x} ({name}): {}", self.code)
            }
            (Some(pos), None) => write!(f, "at position {pos}: {}", self.code),
            _ => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_instruction_context() {
        let err = Error::new(ErrorCode::StackUnderflow).at(7, b'.');
        let msg = err.to_string();
        assert!(msg.contains("position 7"));
        assert!(msg.contains("STOP"));
        assert!(msg.contains("underflow"));
    }

    #[test]
    fn context_is_not_overwritten() {
        let err = Error::new(ErrorCode::Truncated).at(3, b'K').at(9, b'.');
        assert_eq!(err.pos, Some(3));
        assert_eq!(err.opcode, Some(b'K'));
    }

    #[test]
    fn kinds_partition_the_codes() {
        assert_eq!(ErrorCode::NestedFrame.kind(), ErrorKind::Format);
        assert_eq!(ErrorCode::MemoNotFound(3).kind(), ErrorKind::Semantic);
        assert_eq!(ErrorCode::UnsupportedPersistentId.kind(), ErrorKind::Policy);
        assert_eq!(ErrorCode::NotHashable("list").kind(), ErrorKind::Type);
    }
}
