use std::str::Utf8Error;

use nom::{
    bytes::complete::*, combinator::*, error as ne, multi::length_data, number::complete::*,
    sequence::tuple, *,
};
use num_bigint::BigInt;

use crate::error::{Error, ErrorCode};
use crate::ops::{self, *};

fn parse_string_nl<'a, E>(i: &'a [u8]) -> IResult<&'a [u8], String, E>
where
    E: ne::ParseError<&'a [u8]> + ne::FromExternalError<&'a [u8], Utf8Error>,
{
    let (i, s) = map_res(take_till(|c| c == b'\n'), std::str::from_utf8)(i)?;
    let (i, _) = tag(b"\n")(i)?;
    IResult::Ok((i, s.to_owned()))
}

fn twos_complement(b: &[u8]) -> BigInt {
    if b.is_empty() {
        BigInt::from(0)
    } else {
        BigInt::from_signed_bytes_le(b)
    }
}

/// Parse every op up to and including STOP, with stream offsets. This walks
/// the raw bytes flat, so FRAME windows are listed inline the way a
/// disassembly shows them.
pub fn parse_ops(i: &[u8]) -> Result<Vec<(u64, PickleOp)>, Error> {
    let total = i.len();
    let mut rest = i;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let pos = (total - rest.len()) as u64;
        let opcode = rest[0];
        let (next, op) = parse_op::<ne::Error<&[u8]>>(rest).map_err(|_| {
            let code = if ops::mnemonic(opcode).is_none() {
                ErrorCode::UnknownOpcode(opcode)
            } else {
                ErrorCode::Truncated
            };
            Error::new(code).at(pos, opcode)
        })?;
        let done = matches!(op, PickleOp::STOP);
        out.push((pos, op));
        rest = next;
        if done {
            break;
        }
    }
    Ok(out)
}

/// Parse a single op. It's a nom parser.
pub fn parse_op<'a, E>(i: &'a [u8]) -> IResult<&'a [u8], PickleOp>
where
    E: ne::ParseError<&'a [u8]> + ne::FromExternalError<&'a [u8], Utf8Error>,
{
    let (i, opcode) = u8(i)?;
    IResult::Ok((
        i,
        match opcode {
            p_op::MARK => PickleOp::MARK,
            p_op::STOP => PickleOp::STOP,
            p_op::POP => PickleOp::POP,
            p_op::POP_MARK => PickleOp::POP_MARK,
            p_op::DUP => PickleOp::DUP,
            p_op::FLOAT => return map(parse_string_nl, PickleOp::FLOAT)(i),
            p_op::INT => return map(parse_string_nl, PickleOp::INT)(i),
            p_op::BININT => return map(le_i32, PickleOp::BININT)(i),
            p_op::BININT1 => return map(u8, PickleOp::BININT1)(i),
            p_op::LONG => return map(parse_string_nl, PickleOp::LONG)(i),
            p_op::BININT2 => return map(le_u16, PickleOp::BININT2)(i),
            p_op::NONE => PickleOp::NONE,
            p_op::PERSID => return map(parse_string_nl, PickleOp::PERSID)(i),
            p_op::BINPERSID => PickleOp::BINPERSID,
            p_op::REDUCE => PickleOp::REDUCE,
            p_op::STRING => return map(parse_string_nl, PickleOp::STRING)(i),
            p_op::BINSTRING => {
                return map(length_data(le_u32), |b: &[u8]| {
                    PickleOp::BINSTRING(b.to_vec())
                })(i)
            }
            p_op::SHORT_BINSTRING => {
                return map(length_data(u8), |b: &[u8]| {
                    PickleOp::SHORT_BINSTRING(b.to_vec())
                })(i)
            }
            p_op::UNICODE => return map(parse_string_nl, PickleOp::UNICODE)(i),
            p_op::BINUNICODE => {
                return map(length_data(le_u32), |b: &[u8]| {
                    PickleOp::BINUNICODE(b.to_vec())
                })(i)
            }
            p_op::APPEND => PickleOp::APPEND,
            p_op::BUILD => PickleOp::BUILD,
            p_op::GLOBAL => {
                return map(tuple((parse_string_nl, parse_string_nl)), |(mn, gn)| {
                    PickleOp::GLOBAL(mn, gn)
                })(i);
            }
            p_op::DICT => PickleOp::DICT,
            p_op::EMPTY_DICT => PickleOp::EMPTY_DICT,
            p_op::APPENDS => PickleOp::APPENDS,
            p_op::GET => return map(parse_string_nl, PickleOp::GET)(i),
            p_op::BINGET => return map(u8, PickleOp::BINGET)(i),
            p_op::INST => {
                return map(tuple((parse_string_nl, parse_string_nl)), |(mn, cn)| {
                    PickleOp::INST(mn, cn)
                })(i);
            }
            p_op::LONG_BINGET => return map(le_u32, PickleOp::LONG_BINGET)(i),
            p_op::LIST => PickleOp::LIST,
            p_op::EMPTY_LIST => PickleOp::EMPTY_LIST,
            p_op::OBJ => PickleOp::OBJ,
            p_op::PUT => return map(parse_string_nl, PickleOp::PUT)(i),
            p_op::BINPUT => return map(u8, PickleOp::BINPUT)(i),
            p_op::LONG_BINPUT => return map(le_u32, PickleOp::LONG_BINPUT)(i),
            p_op::SETITEM => PickleOp::SETITEM,
            p_op::TUPLE => PickleOp::TUPLE,
            p_op::EMPTY_TUPLE => PickleOp::EMPTY_TUPLE,
            p_op::SETITEMS => PickleOp::SETITEMS,
            p_op::BINFLOAT => return map(be_f64, PickleOp::BINFLOAT)(i),
            p_op::PROTO => return map(u8, PickleOp::PROTO)(i),
            p_op::NEWOBJ => PickleOp::NEWOBJ,
            p_op::EXT1 => return map(u8, PickleOp::EXT1)(i),
            p_op::EXT2 => return map(le_u16, PickleOp::EXT2)(i),
            p_op::EXT4 => return map(le_i32, PickleOp::EXT4)(i),
            p_op::TUPLE1 => PickleOp::TUPLE1,
            p_op::TUPLE2 => PickleOp::TUPLE2,
            p_op::TUPLE3 => PickleOp::TUPLE3,
            p_op::NEWTRUE => PickleOp::NEWTRUE,
            p_op::NEWFALSE => PickleOp::NEWFALSE,
            p_op::LONG1 => {
                return map(length_data(u8), |b: &[u8]| {
                    PickleOp::LONG1(twos_complement(b))
                })(i)
            }
            p_op::LONG4 => {
                return map(length_data(le_u32), |b: &[u8]| {
                    PickleOp::LONG4(twos_complement(b))
                })(i)
            }
            p_op::BINBYTES => {
                return map(length_data(le_u32), |b: &[u8]| {
                    PickleOp::BINBYTES(b.to_vec())
                })(i)
            }
            p_op::BINBYTES8 => {
                return map(length_data(le_u64), |b: &[u8]| {
                    PickleOp::BINBYTES8(b.to_vec())
                })(i)
            }
            p_op::SHORT_BINBYTES => {
                return map(length_data(u8), |b: &[u8]| {
                    PickleOp::SHORT_BINBYTES(b.to_vec())
                })(i)
            }
            p_op::BINUNICODE8 => {
                return map(length_data(le_u64), |b: &[u8]| {
                    PickleOp::BINUNICODE8(b.to_vec())
                })(i)
            }
            p_op::SHORT_BINUNICODE => {
                return map(length_data(u8), |b: &[u8]| {
                    PickleOp::SHORT_BINUNICODE(b.to_vec())
                })(i)
            }
            p_op::EMPTY_SET => PickleOp::EMPTY_SET,
            p_op::ADDITEMS => PickleOp::ADDITEMS,
            p_op::FROZENSET => PickleOp::FROZENSET,
            p_op::NEWOBJ_EX => PickleOp::NEWOBJ_EX,
            p_op::STACK_GLOBAL => PickleOp::STACK_GLOBAL,
            p_op::MEMOIZE => PickleOp::MEMOIZE,
            p_op::FRAME => return map(le_u64, PickleOp::FRAME)(i),
            p_op::BYTEARRAY8 => {
                return map(length_data(le_u64), |b: &[u8]| {
                    PickleOp::BYTEARRAY8(b.to_vec())
                })(i)
            }
            p_op::NEXT_BUFFER => PickleOp::NEXT_BUFFER,
            p_op::READONLY_BUFFER => PickleOp::READONLY_BUFFER,
            _ => return cut(nom::error::context("Bad opcode", fail))(i),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;

    #[test]
    fn offsets_track_operand_widths() {
        let stream = [
            asm::proto(4),
            asm::binint2(1337),
            asm::short_binunicode("foo"),
            asm::stop(),
        ]
        .concat();
        let ops = parse_ops(&stream).unwrap();
        assert_eq!(
            ops,
            vec![
                (0, PickleOp::PROTO(4)),
                (2, PickleOp::BININT2(1337)),
                (5, PickleOp::SHORT_BINUNICODE(b"foo".to_vec())),
                (10, PickleOp::STOP),
            ]
        );
    }

    #[test]
    fn frame_contents_are_listed_inline() {
        let stream = [asm::proto(4), asm::frame(&[asm::none(), asm::stop()].concat())].concat();
        let ops = parse_ops(&stream).unwrap();
        let mnemonics: Vec<_> = ops.iter().map(|(_, op)| op.mnemonic()).collect();
        assert_eq!(mnemonics, vec!["PROTO", "FRAME", "NONE", "STOP"]);
    }

    #[test]
    fn lines_and_globals() {
        let stream = [asm::global("os", "system"), asm::get(12), asm::stop()].concat();
        let ops = parse_ops(&stream).unwrap();
        assert_eq!(ops[0].1, PickleOp::GLOBAL("os".into(), "system".into()));
        assert_eq!(ops[1].1, PickleOp::GET("12".into()));
    }

    #[test]
    fn long1_decodes_signed_value() {
        let stream = [asm::long1(&(-259).into()), asm::stop()].concat();
        let ops = parse_ops(&stream).unwrap();
        assert_eq!(ops[0].1, PickleOp::LONG1((-259).into()));
    }

    #[test]
    fn bad_opcode_is_reported_with_position() {
        let stream = [asm::proto(4), vec![0xff], asm::stop()].concat();
        let err = parse_ops(&stream).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownOpcode(0xff));
        assert_eq!(err.pos, Some(2));
    }

    #[test]
    fn truncated_operand_is_reported() {
        let err = parse_ops(b"K").unwrap_err();
        assert_eq!(err.code, ErrorCode::Truncated);
    }

    #[test]
    fn parsing_stops_after_stop() {
        let stream = [asm::none(), asm::stop(), b"garbage".to_vec()].concat();
        let ops = parse_ops(&stream).unwrap();
        assert_eq!(ops.len(), 2);
    }
}
