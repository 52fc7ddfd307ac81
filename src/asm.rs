//! Byte-literal pickle assembly, for authoring streams by hand.
//!
//! Each function returns the exact wire bytes for one instruction, so a
//! stream is just a concatenation:
//!
//! ```rust
//! use pickledbg::asm::*;
//!
//! let pickle = [proto(4), empty_list(), mark(), binint1(1), binint1(2), appends(), stop()]
//!     .concat();
//! ```

use num_bigint::BigInt;

use crate::codec::encode_long;
use crate::ops::p_op;

fn op(opcode: u8) -> Vec<u8> {
    vec![opcode]
}

fn line(opcode: u8, text: &str) -> Vec<u8> {
    let mut out = vec![opcode];
    out.extend_from_slice(text.as_bytes());
    out.push(b'\n');
    out
}

pub fn mark() -> Vec<u8> {
    op(p_op::MARK)
}

pub fn stop() -> Vec<u8> {
    op(p_op::STOP)
}

pub fn pop() -> Vec<u8> {
    op(p_op::POP)
}

pub fn pop_mark() -> Vec<u8> {
    op(p_op::POP_MARK)
}

pub fn dup() -> Vec<u8> {
    op(p_op::DUP)
}

pub fn none() -> Vec<u8> {
    op(p_op::NONE)
}

pub fn newtrue() -> Vec<u8> {
    op(p_op::NEWTRUE)
}

pub fn newfalse() -> Vec<u8> {
    op(p_op::NEWFALSE)
}

pub fn proto(p: u8) -> Vec<u8> {
    vec![p_op::PROTO, p]
}

/// FRAME with its window contents appended, so the payload's instructions
/// follow inline exactly as on the wire.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![p_op::FRAME];
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn int(num: i64) -> Vec<u8> {
    line(p_op::INT, &num.to_string())
}

/// The INT boolean specials: `I01\n` and `I00\n`.
pub fn int_bool(v: bool) -> Vec<u8> {
    if v {
        b"I01\n".to_vec()
    } else {
        b"I00\n".to_vec()
    }
}

pub fn binint(num: i32) -> Vec<u8> {
    let mut out = vec![p_op::BININT];
    out.extend_from_slice(&num.to_le_bytes());
    out
}

pub fn binint1(num: u8) -> Vec<u8> {
    vec![p_op::BININT1, num]
}

pub fn binint2(num: u16) -> Vec<u8> {
    let mut out = vec![p_op::BININT2];
    out.extend_from_slice(&num.to_le_bytes());
    out
}

pub fn long(num: i64) -> Vec<u8> {
    line(p_op::LONG, &format!("{num}L"))
}

pub fn long1(num: &BigInt) -> Vec<u8> {
    let data = encode_long(num);
    assert!(data.len() <= 0xff, "long1() operand must encode in <= 255 bytes");
    let mut out = vec![p_op::LONG1, data.len() as u8];
    out.extend_from_slice(&data);
    out
}

pub fn long4(num: &BigInt) -> Vec<u8> {
    let data = encode_long(num);
    let mut out = vec![p_op::LONG4];
    out.extend_from_slice(&(data.len() as i32).to_le_bytes());
    out.extend_from_slice(&data);
    out
}

pub fn float(num: f64) -> Vec<u8> {
    line(p_op::FLOAT, &num.to_string())
}

pub fn binfloat(num: f64) -> Vec<u8> {
    let mut out = vec![p_op::BINFLOAT];
    out.extend_from_slice(&num.to_be_bytes());
    out
}

/// A double-quoted STRING line. The caller supplies already-escaped contents.
pub fn string(s: &str) -> Vec<u8> {
    line(p_op::STRING, &format!("\"{s}\""))
}

pub fn binstring(s: &[u8]) -> Vec<u8> {
    let mut out = vec![p_op::BINSTRING];
    out.extend_from_slice(&(s.len() as i32).to_le_bytes());
    out.extend_from_slice(s);
    out
}

pub fn short_binstring(s: &[u8]) -> Vec<u8> {
    assert!(s.len() <= 0xff, "short_binstring() argument must be <= 255 bytes");
    let mut out = vec![p_op::SHORT_BINSTRING, s.len() as u8];
    out.extend_from_slice(s);
    out
}

/// A raw-unicode-escape UNICODE line: non-latin-1 characters become
/// `\uXXXX`/`\UXXXXXXXX` escapes.
pub fn unicode(s: &str) -> Vec<u8> {
    let mut text = String::new();
    for ch in s.chars() {
        let cp = ch as u32;
        if cp == b'\\' as u32 || cp == b'\n' as u32 {
            text.push_str(&format!("\\u{cp:04x}"));
        } else if cp <= 0xff {
            text.push(ch);
        } else if cp <= 0xffff {
            text.push_str(&format!("\\u{cp:04x}"));
        } else {
            text.push_str(&format!("\\U{cp:08x}"));
        }
    }
    let mut out = vec![p_op::UNICODE];
    for ch in text.chars() {
        // latin-1 encode
        out.push(ch as u8);
    }
    out.push(b'\n');
    out
}

pub fn binunicode(s: &str) -> Vec<u8> {
    let mut out = vec![p_op::BINUNICODE];
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out
}

pub fn binunicode8(s: &str) -> Vec<u8> {
    let mut out = vec![p_op::BINUNICODE8];
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out
}

pub fn short_binunicode(s: &str) -> Vec<u8> {
    assert!(s.len() <= 0xff, "short_binunicode() argument must be <= 255 bytes");
    let mut out = vec![p_op::SHORT_BINUNICODE, s.len() as u8];
    out.extend_from_slice(s.as_bytes());
    out
}

pub fn binbytes(b: &[u8]) -> Vec<u8> {
    let mut out = vec![p_op::BINBYTES];
    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
    out.extend_from_slice(b);
    out
}

pub fn short_binbytes(b: &[u8]) -> Vec<u8> {
    assert!(b.len() <= 0xff, "short_binbytes() argument must be <= 255 bytes");
    let mut out = vec![p_op::SHORT_BINBYTES, b.len() as u8];
    out.extend_from_slice(b);
    out
}

pub fn binbytes8(b: &[u8]) -> Vec<u8> {
    let mut out = vec![p_op::BINBYTES8];
    out.extend_from_slice(&(b.len() as u64).to_le_bytes());
    out.extend_from_slice(b);
    out
}

pub fn bytearray8(b: &[u8]) -> Vec<u8> {
    let mut out = vec![p_op::BYTEARRAY8];
    out.extend_from_slice(&(b.len() as u64).to_le_bytes());
    out.extend_from_slice(b);
    out
}

pub fn next_buffer() -> Vec<u8> {
    op(p_op::NEXT_BUFFER)
}

pub fn readonly_buffer() -> Vec<u8> {
    op(p_op::READONLY_BUFFER)
}

pub fn empty_tuple() -> Vec<u8> {
    op(p_op::EMPTY_TUPLE)
}

pub fn empty_list() -> Vec<u8> {
    op(p_op::EMPTY_LIST)
}

pub fn empty_dict() -> Vec<u8> {
    op(p_op::EMPTY_DICT)
}

pub fn empty_set() -> Vec<u8> {
    op(p_op::EMPTY_SET)
}

pub fn tuple() -> Vec<u8> {
    op(p_op::TUPLE)
}

pub fn tuple1() -> Vec<u8> {
    op(p_op::TUPLE1)
}

pub fn tuple2() -> Vec<u8> {
    op(p_op::TUPLE2)
}

pub fn tuple3() -> Vec<u8> {
    op(p_op::TUPLE3)
}

pub fn list() -> Vec<u8> {
    op(p_op::LIST)
}

pub fn dict() -> Vec<u8> {
    op(p_op::DICT)
}

pub fn frozenset() -> Vec<u8> {
    op(p_op::FROZENSET)
}

pub fn append() -> Vec<u8> {
    op(p_op::APPEND)
}

pub fn appends() -> Vec<u8> {
    op(p_op::APPENDS)
}

pub fn setitem() -> Vec<u8> {
    op(p_op::SETITEM)
}

pub fn setitems() -> Vec<u8> {
    op(p_op::SETITEMS)
}

pub fn additems() -> Vec<u8> {
    op(p_op::ADDITEMS)
}

pub fn get(i: u32) -> Vec<u8> {
    line(p_op::GET, &i.to_string())
}

pub fn binget(i: u8) -> Vec<u8> {
    vec![p_op::BINGET, i]
}

pub fn long_binget(i: u32) -> Vec<u8> {
    let mut out = vec![p_op::LONG_BINGET];
    out.extend_from_slice(&i.to_le_bytes());
    out
}

pub fn put(i: u32) -> Vec<u8> {
    line(p_op::PUT, &i.to_string())
}

pub fn binput(i: u8) -> Vec<u8> {
    vec![p_op::BINPUT, i]
}

pub fn long_binput(i: u32) -> Vec<u8> {
    let mut out = vec![p_op::LONG_BINPUT];
    out.extend_from_slice(&i.to_le_bytes());
    out
}

pub fn memoize() -> Vec<u8> {
    op(p_op::MEMOIZE)
}

pub fn global(module: &str, name: &str) -> Vec<u8> {
    let mut out = vec![p_op::GLOBAL];
    out.extend_from_slice(module.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(name.as_bytes());
    out.push(b'\n');
    out
}

pub fn stack_global() -> Vec<u8> {
    op(p_op::STACK_GLOBAL)
}

pub fn inst(module: &str, name: &str) -> Vec<u8> {
    let mut out = vec![p_op::INST];
    out.extend_from_slice(module.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(name.as_bytes());
    out.push(b'\n');
    out
}

pub fn obj() -> Vec<u8> {
    op(p_op::OBJ)
}

pub fn newobj() -> Vec<u8> {
    op(p_op::NEWOBJ)
}

pub fn newobj_ex() -> Vec<u8> {
    op(p_op::NEWOBJ_EX)
}

pub fn reduce() -> Vec<u8> {
    op(p_op::REDUCE)
}

pub fn build() -> Vec<u8> {
    op(p_op::BUILD)
}

pub fn persid(id: &str) -> Vec<u8> {
    line(p_op::PERSID, id)
}

pub fn binpersid() -> Vec<u8> {
    op(p_op::BINPERSID)
}

pub fn ext1(code: u8) -> Vec<u8> {
    vec![p_op::EXT1, code]
}

pub fn ext2(code: u16) -> Vec<u8> {
    let mut out = vec![p_op::EXT2];
    out.extend_from_slice(&code.to_le_bytes());
    out
}

pub fn ext4(code: i32) -> Vec<u8> {
    let mut out = vec![p_op::EXT4];
    out.extend_from_slice(&code.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings() {
        assert_eq!(proto(4), b"\x80\x04");
        assert_eq!(binint1(42), b"K\x2a");
        assert_eq!(binint2(1337), b"M\x39\x05");
        assert_eq!(int(7), b"I7\n");
        assert_eq!(int_bool(true), b"I01\n");
        assert_eq!(long(5), b"L5L\n");
        assert_eq!(string("hi"), b"S\"hi\"\n");
        assert_eq!(short_binunicode("foo"), b"\x8c\x03foo");
        assert_eq!(get(2), b"g2\n");
        assert_eq!(stop(), b".");
    }

    #[test]
    fn long1_uses_minimal_twos_complement() {
        assert_eq!(long1(&0.into()), b"\x8a\x00");
        assert_eq!(long1(&255.into()), b"\x8a\x02\xff\x00");
        assert_eq!(long1(&(-1).into()), b"\x8a\x01\xff");
    }

    #[test]
    fn frame_prefixes_length() {
        let body = [binint1(1), stop()].concat();
        let framed = frame(&body);
        assert_eq!(framed[0], 0x95);
        assert_eq!(&framed[1..9], &(body.len() as u64).to_le_bytes());
        assert_eq!(&framed[9..], &body[..]);
    }

    #[test]
    fn unicode_escapes_wide_chars() {
        assert_eq!(unicode("abc"), b"Vabc\n");
        assert_eq!(unicode("\u{1f600}"), b"V\\U0001f600\n");
    }
}
