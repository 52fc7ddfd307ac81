//! An interactive debugger for the Python pickle virtual machine.
//!
//! The heart of the crate is [`vm::PickleMachine`], a faithful implementation
//! of the pickle protocol's stack machine (protocols 0 through 5) that can be
//! single-stepped, with the stack, metastack and memo observable after every
//! instruction. Around it sit a disassembler, a byte-literal assembler for
//! authoring streams by hand, and the rendering helpers the `pickledbg`
//! binary uses.
//!
//! Something to get you started:
//!
//! ```rust
//! use std::io::Cursor;
//! use pickledbg::vm::{MachineOptions, PickleMachine, Step};
//!
//! fn main() -> Result<(), pickledbg::Error> {
//!     let pickle = b"\x80\x04K\x2a.";
//!     let mut machine =
//!         PickleMachine::new(Cursor::new(pickle.to_vec()), &MachineOptions::default())?;
//!     loop {
//!         match machine.step()? {
//!             Step::Continue => println!("stack: {:?}", machine.stack()),
//!             Step::Stopped(value) => {
//!                 println!("result: {value}");
//!                 break;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Class and callable resolution is injected through
//! [`resolve::ClassResolver`]; the default resolver synthesizes opaque
//! symbols so arbitrary streams can be stepped without a host environment,
//! and hermetic tests register exactly the symbols they expect.

/// Byte-literal pickle assembly for hand-authoring test streams.
pub mod asm;

/// Operand decoding: long integers, escape formats, legacy string codecs.
pub mod codec;

/// ANSI color helpers for the debugger's state rendering.
pub mod colors;

/// Python 2 to 3 import remapping for protocol < 3 streams.
pub mod compat;

/// The stream disassembler.
pub mod disasm;

/// Error codes and the positioned error type.
pub mod error;

/// The operand stack and the memo table.
pub mod machine;

/// Pickle opcodes: byte constants, the decoded-op enum, mnemonics.
pub mod ops;

/// Parsers for converting `&[u8]` into a list of pickle operations.
pub mod parsers;

/// The byte source contract and the frame-window reader.
pub mod read;

/// Class/callable resolution and the extension-code registry.
pub mod resolve;

/// Python value model: tagged values, shared handles, hashable subset.
pub mod value;

/// The pickle virtual machine itself.
pub mod vm;

pub use crate::disasm::{disassemble, DisasmLine};

pub use crate::error::{Error, ErrorCode, ErrorKind};

pub use crate::parsers::{parse_op, parse_ops};

pub use crate::value::{HashableValue, Value};

pub use crate::vm::{MachineOptions, MachineState, PickleMachine, Step};
