#![allow(non_camel_case_types)]

use num_bigint::BigInt;

#[derive(Debug, Clone, PartialEq)]
/// A decoded pickle instruction with its operand.
///
/// This is the shape the disassembler works with; the virtual machine itself
/// decodes operands handler-by-handler so that framed reads stay exact.
pub enum PickleOp {
    MARK,
    STOP,
    POP,
    POP_MARK,
    DUP,
    FLOAT(String),
    INT(String),
    BININT(i32),
    BININT1(u8),
    LONG(String),
    BININT2(u16),
    NONE,
    PERSID(String),
    BINPERSID,
    REDUCE,
    STRING(String),
    BINSTRING(Vec<u8>),
    SHORT_BINSTRING(Vec<u8>),
    UNICODE(String),
    BINUNICODE(Vec<u8>),
    APPEND,
    BUILD,
    GLOBAL(String, String),
    DICT,
    EMPTY_DICT,
    APPENDS,
    GET(String),
    BINGET(u8),
    INST(String, String),
    LONG_BINGET(u32),
    LIST,
    EMPTY_LIST,
    OBJ,
    PUT(String),
    BINPUT(u8),
    LONG_BINPUT(u32),
    SETITEM,
    TUPLE,
    EMPTY_TUPLE,
    SETITEMS,
    BINFLOAT(f64),
    PROTO(u8),
    NEWOBJ,
    EXT1(u8),
    EXT2(u16),
    EXT4(i32),
    TUPLE1,
    TUPLE2,
    TUPLE3,
    NEWTRUE,
    NEWFALSE,
    LONG1(BigInt),
    LONG4(BigInt),
    BINBYTES(Vec<u8>),
    SHORT_BINBYTES(Vec<u8>),
    SHORT_BINUNICODE(Vec<u8>),
    BINUNICODE8(Vec<u8>),
    BINBYTES8(Vec<u8>),
    EMPTY_SET,
    ADDITEMS,
    FROZENSET,
    NEWOBJ_EX,
    STACK_GLOBAL,
    MEMOIZE,
    FRAME(u64),
    BYTEARRAY8(Vec<u8>),
    NEXT_BUFFER,
    READONLY_BUFFER,
}

impl PickleOp {
    /// The mnemonic pickletools uses for this instruction.
    pub fn mnemonic(&self) -> &'static str {
        use PickleOp::*;
        match self {
            MARK => "MARK",
            STOP => "STOP",
            POP => "POP",
            POP_MARK => "POP_MARK",
            DUP => "DUP",
            FLOAT(_) => "FLOAT",
            INT(_) => "INT",
            BININT(_) => "BININT",
            BININT1(_) => "BININT1",
            LONG(_) => "LONG",
            BININT2(_) => "BININT2",
            NONE => "NONE",
            PERSID(_) => "PERSID",
            BINPERSID => "BINPERSID",
            REDUCE => "REDUCE",
            STRING(_) => "STRING",
            BINSTRING(_) => "BINSTRING",
            SHORT_BINSTRING(_) => "SHORT_BINSTRING",
            UNICODE(_) => "UNICODE",
            BINUNICODE(_) => "BINUNICODE",
            APPEND => "APPEND",
            BUILD => "BUILD",
            GLOBAL(..) => "GLOBAL",
            DICT => "DICT",
            EMPTY_DICT => "EMPTY_DICT",
            APPENDS => "APPENDS",
            GET(_) => "GET",
            BINGET(_) => "BINGET",
            INST(..) => "INST",
            LONG_BINGET(_) => "LONG_BINGET",
            LIST => "LIST",
            EMPTY_LIST => "EMPTY_LIST",
            OBJ => "OBJ",
            PUT(_) => "PUT",
            BINPUT(_) => "BINPUT",
            LONG_BINPUT(_) => "LONG_BINPUT",
            SETITEM => "SETITEM",
            TUPLE => "TUPLE",
            EMPTY_TUPLE => "EMPTY_TUPLE",
            SETITEMS => "SETITEMS",
            BINFLOAT(_) => "BINFLOAT",
            PROTO(_) => "PROTO",
            NEWOBJ => "NEWOBJ",
            EXT1(_) => "EXT1",
            EXT2(_) => "EXT2",
            EXT4(_) => "EXT4",
            TUPLE1 => "TUPLE1",
            TUPLE2 => "TUPLE2",
            TUPLE3 => "TUPLE3",
            NEWTRUE => "NEWTRUE",
            NEWFALSE => "NEWFALSE",
            LONG1(_) => "LONG1",
            LONG4(_) => "LONG4",
            BINBYTES(_) => "BINBYTES",
            SHORT_BINBYTES(_) => "SHORT_BINBYTES",
            SHORT_BINUNICODE(_) => "SHORT_BINUNICODE",
            BINUNICODE8(_) => "BINUNICODE8",
            BINBYTES8(_) => "BINBYTES8",
            EMPTY_SET => "EMPTY_SET",
            ADDITEMS => "ADDITEMS",
            FROZENSET => "FROZENSET",
            NEWOBJ_EX => "NEWOBJ_EX",
            STACK_GLOBAL => "STACK_GLOBAL",
            MEMOIZE => "MEMOIZE",
            FRAME(_) => "FRAME",
            BYTEARRAY8(_) => "BYTEARRAY8",
            NEXT_BUFFER => "NEXT_BUFFER",
            READONLY_BUFFER => "READONLY_BUFFER",
        }
    }
}

/// Look up the mnemonic for a raw opcode byte, if the byte is a known opcode.
pub fn mnemonic(opcode: u8) -> Option<&'static str> {
    Some(match opcode {
        p_op::MARK => "MARK",
        p_op::STOP => "STOP",
        p_op::POP => "POP",
        p_op::POP_MARK => "POP_MARK",
        p_op::DUP => "DUP",
        p_op::FLOAT => "FLOAT",
        p_op::INT => "INT",
        p_op::BININT => "BININT",
        p_op::BININT1 => "BININT1",
        p_op::LONG => "LONG",
        p_op::BININT2 => "BININT2",
        p_op::NONE => "NONE",
        p_op::PERSID => "PERSID",
        p_op::BINPERSID => "BINPERSID",
        p_op::REDUCE => "REDUCE",
        p_op::STRING => "STRING",
        p_op::BINSTRING => "BINSTRING",
        p_op::SHORT_BINSTRING => "SHORT_BINSTRING",
        p_op::UNICODE => "UNICODE",
        p_op::BINUNICODE => "BINUNICODE",
        p_op::APPEND => "APPEND",
        p_op::BUILD => "BUILD",
        p_op::GLOBAL => "GLOBAL",
        p_op::DICT => "DICT",
        p_op::EMPTY_DICT => "EMPTY_DICT",
        p_op::APPENDS => "APPENDS",
        p_op::GET => "GET",
        p_op::BINGET => "BINGET",
        p_op::INST => "INST",
        p_op::LONG_BINGET => "LONG_BINGET",
        p_op::LIST => "LIST",
        p_op::EMPTY_LIST => "EMPTY_LIST",
        p_op::OBJ => "OBJ",
        p_op::PUT => "PUT",
        p_op::BINPUT => "BINPUT",
        p_op::LONG_BINPUT => "LONG_BINPUT",
        p_op::SETITEM => "SETITEM",
        p_op::TUPLE => "TUPLE",
        p_op::EMPTY_TUPLE => "EMPTY_TUPLE",
        p_op::SETITEMS => "SETITEMS",
        p_op::BINFLOAT => "BINFLOAT",
        p_op::PROTO => "PROTO",
        p_op::NEWOBJ => "NEWOBJ",
        p_op::EXT1 => "EXT1",
        p_op::EXT2 => "EXT2",
        p_op::EXT4 => "EXT4",
        p_op::TUPLE1 => "TUPLE1",
        p_op::TUPLE2 => "TUPLE2",
        p_op::TUPLE3 => "TUPLE3",
        p_op::NEWTRUE => "NEWTRUE",
        p_op::NEWFALSE => "NEWFALSE",
        p_op::LONG1 => "LONG1",
        p_op::LONG4 => "LONG4",
        p_op::BINBYTES => "BINBYTES",
        p_op::SHORT_BINBYTES => "SHORT_BINBYTES",
        p_op::SHORT_BINUNICODE => "SHORT_BINUNICODE",
        p_op::BINUNICODE8 => "BINUNICODE8",
        p_op::BINBYTES8 => "BINBYTES8",
        p_op::EMPTY_SET => "EMPTY_SET",
        p_op::ADDITEMS => "ADDITEMS",
        p_op::FROZENSET => "FROZENSET",
        p_op::NEWOBJ_EX => "NEWOBJ_EX",
        p_op::STACK_GLOBAL => "STACK_GLOBAL",
        p_op::MEMOIZE => "MEMOIZE",
        p_op::FRAME => "FRAME",
        p_op::BYTEARRAY8 => "BYTEARRAY8",
        p_op::NEXT_BUFFER => "NEXT_BUFFER",
        p_op::READONLY_BUFFER => "READONLY_BUFFER",
        _ => return None,
    })
}

/// The values for the possible opcodes are in this module.
pub mod p_op {
    pub const MARK: u8 = b'('; // save the stack, start collecting into a fresh one
    pub const STOP: u8 = b'.'; // end of stream; the top of stack is the result
    pub const POP: u8 = b'0'; // drop the top item (a bare mark counts)
    pub const POP_MARK: u8 = b'1'; // throw away everything since the last mark
    pub const DUP: u8 = b'2'; // push the top item a second time
    pub const FLOAT: u8 = b'F'; // float written out as a decimal text line
    pub const INT: u8 = b'I'; // integer text line; 00 and 01 encode the booleans
    pub const BININT: u8 = b'J'; // i32, little-endian
    pub const BININT1: u8 = b'K'; // single unsigned byte
    pub const LONG: u8 = b'L'; // arbitrary-precision integer text line
    pub const BININT2: u8 = b'M'; // u16, little-endian
    pub const NONE: u8 = b'N'; // the None singleton
    pub const PERSID: u8 = b'P'; // persistent reference, id given as a text line
    pub const BINPERSID: u8 = b'Q'; // persistent reference, id popped off the stack
    pub const REDUCE: u8 = b'R'; // call the callable under the argument tuple
    pub const STRING: u8 = b'S'; // legacy string line, quoted and escape-encoded
    pub const BINSTRING: u8 = b'T'; // legacy string, i32 count then raw bytes
    pub const SHORT_BINSTRING: u8 = b'U'; // legacy string, one-byte count then raw bytes
    pub const UNICODE: u8 = b'V'; // text line in raw-unicode-escape form
    pub const BINUNICODE: u8 = b'X'; // UTF-8 text, u32 count
    pub const APPEND: u8 = b'a'; // move the top item into the list below it
    pub const BUILD: u8 = b'b'; // pop a state value and restore it into the instance
    pub const GLOBAL: u8 = b'c'; // resolve module and name given on two text lines
    pub const DICT: u8 = b'd'; // dict from alternating keys/values since the mark
    pub const EMPTY_DICT: u8 = b'}'; // fresh empty dict
    pub const APPENDS: u8 = b'e'; // drain everything since the mark into the list below
    pub const GET: u8 = b'g'; // memo fetch, index as a text line
    pub const BINGET: u8 = b'h'; // memo fetch, one-byte index
    pub const INST: u8 = b'i'; // instance from module/name lines plus marked args
    pub const LONG_BINGET: u8 = b'j'; // memo fetch, u32 index
    pub const LIST: u8 = b'l'; // list from the items since the mark
    pub const EMPTY_LIST: u8 = b']'; // fresh empty list
    pub const OBJ: u8 = b'o'; // instance; class and args both sit above the mark
    pub const PUT: u8 = b'p'; // memo store, index as a text line
    pub const BINPUT: u8 = b'q'; // memo store, one-byte index
    pub const LONG_BINPUT: u8 = b'r'; // memo store, u32 index
    pub const SETITEM: u8 = b's'; // one key/value pair into the dict below
    pub const TUPLE: u8 = b't'; // tuple from the items since the mark
    pub const EMPTY_TUPLE: u8 = b')'; // the empty tuple
    pub const SETITEMS: u8 = b'u'; // key/value pairs since the mark into the dict below
    pub const BINFLOAT: u8 = b'G'; // IEEE-754 double, big-endian

    // Protocol 2
    pub const PROTO: u8 = b'\x80'; // declares the stream's protocol version
    pub const NEWOBJ: u8 = b'\x81'; // allocate through the class with the args tuple
    pub const EXT1: u8 = b'\x82'; // extension-registry reference, one-byte code
    pub const EXT2: u8 = b'\x83'; // extension-registry reference, u16 code
    pub const EXT4: u8 = b'\x84'; // extension-registry reference, i32 code
    pub const TUPLE1: u8 = b'\x85'; // tuple of the top item
    pub const TUPLE2: u8 = b'\x86'; // tuple of the top two items
    pub const TUPLE3: u8 = b'\x87'; // tuple of the top three items
    pub const NEWTRUE: u8 = b'\x88'; // True
    pub const NEWFALSE: u8 = b'\x89'; // False
    pub const LONG1: u8 = b'\x8a'; // signed little-endian integer, one-byte count
    pub const LONG4: u8 = b'\x8b'; // signed little-endian integer, i32 count

    // Protocol 3
    pub const BINBYTES: u8 = b'B'; // byte string, u32 count
    pub const SHORT_BINBYTES: u8 = b'C'; // byte string, one-byte count

    // Protocol 4
    pub const SHORT_BINUNICODE: u8 = b'\x8c'; // UTF-8 text, one-byte count
    pub const BINUNICODE8: u8 = b'\x8d'; // UTF-8 text, u64 count
    pub const BINBYTES8: u8 = b'\x8e'; // byte string, u64 count
    pub const EMPTY_SET: u8 = b'\x8f'; // fresh empty set
    pub const ADDITEMS: u8 = b'\x90'; // items since the mark go into the set below
    pub const FROZENSET: u8 = b'\x91'; // frozenset from the items since the mark
    pub const NEWOBJ_EX: u8 = b'\x92'; // NEWOBJ with an extra keyword-argument dict
    pub const STACK_GLOBAL: u8 = b'\x93'; // resolve module and name popped off the stack
    pub const MEMOIZE: u8 = b'\x94'; // memo store at the next sequential index
    pub const FRAME: u8 = b'\x95'; // open a length-prefixed read window

    // Protocol 5
    pub const BYTEARRAY8: u8 = b'\x96'; // mutable byte buffer, u64 count
    pub const NEXT_BUFFER: u8 = b'\x97'; // take the next out-of-band buffer
    pub const READONLY_BUFFER: u8 = b'\x98'; // freeze the buffer on top of the stack
}
