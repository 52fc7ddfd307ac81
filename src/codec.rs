use num_bigint::BigInt;
use num_traits::Zero;

use crate::error::{Error, ErrorCode, Result};
use crate::value::Value;

/// Decode a little-endian two's-complement integer. Zero-length input is 0.
pub fn decode_long(data: &[u8]) -> Value {
    if data.is_empty() {
        Value::I64(0)
    } else {
        Value::from_bigint(BigInt::from_signed_bytes_le(data))
    }
}

/// Encode an integer as minimal little-endian two's-complement bytes, the
/// layout LONG1/LONG4 carry. Zero encodes as the empty string.
pub fn encode_long(value: &BigInt) -> Vec<u8> {
    if value.is_zero() {
        Vec::new()
    } else {
        value.to_signed_bytes_le()
    }
}

/// Parse a textual integer the way `int(s, 0)` does: optional sign, then a
/// `0x`/`0o`/`0b` radix prefix or decimal digits.
pub fn parse_int_auto(s: &str) -> Result<Value> {
    let s = s.trim();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, digits) = match rest.get(..2) {
        Some("0x") | Some("0X") => (16, &rest[2..]),
        Some("0o") | Some("0O") => (8, &rest[2..]),
        Some("0b") | Some("0B") => (2, &rest[2..]),
        _ => (10, rest),
    };
    let magnitude = BigInt::parse_bytes(digits.as_bytes(), radix)
        .ok_or_else(|| Error::new(ErrorCode::BadNumber(s.to_owned())))?;
    Ok(Value::from_bigint(if negative {
        -magnitude
    } else {
        magnitude
    }))
}

/// Parse a decimal memo index line (GET/PUT).
pub fn parse_index(s: &str) -> Result<i64> {
    s.trim()
        .parse::<i64>()
        .map_err(|_| Error::new(ErrorCode::BadNumber(s.to_owned())))
}

/// Decode C-style backslash escapes in a byte string (the STRING operand
/// contents). Unrecognized escapes are kept literally.
pub fn escape_decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut it = data.iter().copied().peekable();
    while let Some(b) = it.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let esc = it
            .next()
            .ok_or_else(|| Error::new(ErrorCode::BadString("trailing \\ in string".into())))?;
        match esc {
            b'\n' => {}
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'x' => {
                let hi = it.next().and_then(hex_digit);
                let lo = it.next().and_then(hex_digit);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                    _ => {
                        return Err(Error::new(ErrorCode::BadString(
                            "invalid \\x escape".into(),
                        )))
                    }
                }
            }
            b'0'..=b'7' => {
                let mut v = (esc - b'0') as u32;
                for _ in 0..2 {
                    match it.peek() {
                        Some(&d @ b'0'..=b'7') => {
                            v = v * 8 + (d - b'0') as u32;
                            it.next();
                        }
                        _ => break,
                    }
                }
                out.push(v as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode raw-unicode-escape: latin-1 for everything except `\uXXXX` and
/// `\UXXXXXXXX` escapes.
pub fn raw_unicode_escape(data: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b == b'\\' && i + 1 < data.len() && (data[i + 1] == b'u' || data[i + 1] == b'U') {
            let ndigits = if data[i + 1] == b'u' { 4 } else { 8 };
            if i + 2 + ndigits > data.len() {
                return Err(Error::new(ErrorCode::BadEncoding(
                    "truncated \\uXXXX escape".into(),
                )));
            }
            let mut v: u32 = 0;
            for &d in &data[i + 2..i + 2 + ndigits] {
                let d = hex_digit(d).ok_or_else(|| {
                    Error::new(ErrorCode::BadEncoding("invalid \\uXXXX escape".into()))
                })?;
                v = v << 4 | d as u32;
            }
            let ch = char::from_u32(v).ok_or_else(|| {
                Error::new(ErrorCode::BadEncoding(format!(
                    "\\u escape is not a valid character: {v:#x}"
                )))
            })?;
            out.push(ch);
            i += 2 + ndigits;
        } else {
            out.push(b as char);
            i += 1;
        }
    }
    Ok(out)
}

/// Decode counted UTF-8 text (BINUNICODE family). Surrogate passthrough
/// narrows to scalar values here: bytes that do not form valid UTF-8 are a
/// format error.
pub fn decode_utf8(data: Vec<u8>, what: &'static str) -> Result<String> {
    String::from_utf8(data)
        .map_err(|_| Error::new(ErrorCode::BadEncoding(format!("{what} is not valid UTF-8"))))
}

/// How legacy string opcodes (STRING/BINSTRING/SHORT_BINSTRING) decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Ascii,
    Utf8,
    Latin1,
    /// The magic `bytes` encoding: keep legacy strings as byte strings.
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorsPolicy {
    Strict,
    Replace,
    Ignore,
}

/// The `encoding`/`errors` pair configured at machine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextCodec {
    encoding: Encoding,
    errors: ErrorsPolicy,
}

impl TextCodec {
    pub fn new(encoding: &str, errors: &str) -> Result<TextCodec> {
        let encoding = match encoding.to_ascii_lowercase().as_str() {
            "ascii" | "us-ascii" | "646" => Encoding::Ascii,
            "utf-8" | "utf8" => Encoding::Utf8,
            "latin-1" | "latin1" | "iso-8859-1" => Encoding::Latin1,
            "bytes" => Encoding::Bytes,
            other => {
                return Err(Error::new(ErrorCode::BadEncoding(format!(
                    "unknown encoding: {other}"
                ))))
            }
        };
        let errors = match errors {
            "strict" => ErrorsPolicy::Strict,
            "replace" => ErrorsPolicy::Replace,
            "ignore" => ErrorsPolicy::Ignore,
            other => {
                return Err(Error::new(ErrorCode::BadEncoding(format!(
                    "unknown error handler: {other}"
                ))))
            }
        };
        Ok(TextCodec { encoding, errors })
    }

    /// Decode a legacy string operand into a text or bytes value.
    pub fn decode(&self, data: Vec<u8>) -> Result<Value> {
        match self.encoding {
            Encoding::Bytes => Ok(Value::bytes(data)),
            Encoding::Latin1 => Ok(Value::string(
                data.iter().map(|&b| b as char).collect::<String>(),
            )),
            Encoding::Ascii => {
                let mut out = String::with_capacity(data.len());
                for &b in &data {
                    if b < 0x80 {
                        out.push(b as char);
                    } else {
                        match self.errors {
                            ErrorsPolicy::Strict => {
                                return Err(Error::new(ErrorCode::BadEncoding(format!(
                                    "'ascii' codec can't decode byte 0x{b:02x}"
                                ))))
                            }
                            ErrorsPolicy::Replace => out.push('\u{fffd}'),
                            ErrorsPolicy::Ignore => {}
                        }
                    }
                }
                Ok(Value::string(out))
            }
            Encoding::Utf8 => match self.errors {
                ErrorsPolicy::Strict => String::from_utf8(data)
                    .map(Value::string)
                    .map_err(|_| {
                        Error::new(ErrorCode::BadEncoding(
                            "'utf-8' codec can't decode string".into(),
                        ))
                    }),
                ErrorsPolicy::Replace => Ok(Value::string(String::from_utf8_lossy(&data))),
                ErrorsPolicy::Ignore => {
                    let mut out = String::new();
                    let mut rest = &data[..];
                    loop {
                        match std::str::from_utf8(rest) {
                            Ok(s) => {
                                out.push_str(s);
                                break;
                            }
                            Err(e) => {
                                let valid = e.valid_up_to();
                                out.push_str(std::str::from_utf8(&rest[..valid]).unwrap());
                                let skip = e.error_len().unwrap_or(rest.len() - valid);
                                rest = &rest[valid + skip..];
                            }
                        }
                    }
                    Ok(Value::string(out))
                }
            },
        }
    }
}

impl Default for TextCodec {
    fn default() -> Self {
        TextCodec {
            encoding: Encoding::Ascii,
            errors: ErrorsPolicy::Strict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_decode_round_trips() {
        for n in [0i64, 1, -1, 127, 128, -128, -129, 255, 256, i64::MAX, i64::MIN] {
            let big = BigInt::from(n);
            assert_eq!(decode_long(&encode_long(&big)), Value::I64(n), "{n}");
        }
    }

    #[test]
    fn long_decode_beyond_i64() {
        let big: BigInt = BigInt::from(i64::MAX) * 3;
        assert_eq!(decode_long(&encode_long(&big)), Value::Int(big));
    }

    #[test]
    fn empty_long_is_zero() {
        assert_eq!(decode_long(b""), Value::I64(0));
    }

    #[test]
    fn int_parse_detects_base() {
        assert_eq!(parse_int_auto("42").unwrap(), Value::I64(42));
        assert_eq!(parse_int_auto("-0x10").unwrap(), Value::I64(-16));
        assert_eq!(parse_int_auto("0o755").unwrap(), Value::I64(493));
        assert_eq!(parse_int_auto("0b101").unwrap(), Value::I64(5));
        assert!(parse_int_auto("0xzz").is_err());
        assert!(parse_int_auto("").is_err());
    }

    #[test]
    fn escape_decode_handles_common_escapes() {
        assert_eq!(escape_decode(b"a\\nb").unwrap(), b"a\nb");
        assert_eq!(escape_decode(b"\\x41\\x00").unwrap(), b"A\x00");
        assert_eq!(escape_decode(b"\\101").unwrap(), b"A");
        assert_eq!(escape_decode(b"\\q").unwrap(), b"\\q");
        assert!(escape_decode(b"oops\\").is_err());
        assert!(escape_decode(b"\\xg0").is_err());
    }

    #[test]
    fn raw_unicode_escape_decodes_u_escapes() {
        assert_eq!(raw_unicode_escape(b"abc").unwrap(), "abc");
        assert_eq!(raw_unicode_escape(b"\\u00e9").unwrap(), "\u{e9}");
        assert_eq!(raw_unicode_escape(b"\\U0001f600").unwrap(), "\u{1f600}");
        // latin-1 for the rest, backslashes without u/U untouched
        assert_eq!(raw_unicode_escape(b"\xe9\\n").unwrap(), "\u{e9}\\n");
        assert!(raw_unicode_escape(b"\\u12").is_err());
        assert!(raw_unicode_escape(b"\\ud800").is_err());
    }

    #[test]
    fn ascii_codec_is_strict_by_default() {
        let codec = TextCodec::default();
        assert_eq!(codec.decode(b"abc".to_vec()).unwrap(), Value::string("abc"));
        assert!(codec.decode(b"\xff".to_vec()).is_err());
    }

    #[test]
    fn bytes_encoding_keeps_bytes() {
        let codec = TextCodec::new("bytes", "strict").unwrap();
        assert_eq!(
            codec.decode(b"\xff\x00".to_vec()).unwrap(),
            Value::bytes(b"\xff\x00".to_vec())
        );
    }

    #[test]
    fn latin1_maps_all_bytes() {
        let codec = TextCodec::new("latin-1", "strict").unwrap();
        assert_eq!(
            codec.decode(b"\xe9".to_vec()).unwrap(),
            Value::string("\u{e9}")
        );
    }

    #[test]
    fn replace_and_ignore_policies() {
        let codec = TextCodec::new("ascii", "replace").unwrap();
        assert_eq!(
            codec.decode(b"a\xffb".to_vec()).unwrap(),
            Value::string("a\u{fffd}b")
        );
        let codec = TextCodec::new("ascii", "ignore").unwrap();
        assert_eq!(codec.decode(b"a\xffb".to_vec()).unwrap(), Value::string("ab"));
    }

    #[test]
    fn unknown_encoding_rejected() {
        assert!(TextCodec::new("koi8-r", "strict").is_err());
        assert!(TextCodec::new("ascii", "surrogateescape").is_err());
    }
}
