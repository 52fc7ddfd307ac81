use crate::error::Result;
use crate::ops::PickleOp;
use crate::parsers::parse_ops;

/// One rendered instruction: its stream address and a `"<address>: ..."` line.
#[derive(Debug, Clone, PartialEq)]
pub struct DisasmLine {
    pub pos: u64,
    pub text: String,
}

/// Render a human-readable listing of a pickle stream. FRAME windows are
/// listed inline, so addresses match what the stepping machine reports.
pub fn disassemble(bytes: &[u8]) -> Result<Vec<DisasmLine>> {
    let ops = parse_ops(bytes)?;
    Ok(ops
        .into_iter()
        .map(|(pos, op)| DisasmLine {
            pos,
            text: format_line(pos, &op),
        })
        .collect())
}

fn format_line(pos: u64, op: &PickleOp) -> String {
    let operand = operand_repr(op);
    if operand.is_empty() {
        format!("{pos}: {}", op.mnemonic())
    } else {
        format!("{pos}: {:<16} {operand}", op.mnemonic())
    }
}

fn operand_repr(op: &PickleOp) -> String {
    use PickleOp::*;
    match op {
        FLOAT(s) | INT(s) | LONG(s) | GET(s) | PUT(s) | PERSID(s) => s.clone(),
        STRING(s) | UNICODE(s) => s.clone(),
        BININT(v) => v.to_string(),
        BININT1(v) => v.to_string(),
        BININT2(v) => v.to_string(),
        BINGET(v) | BINPUT(v) | EXT1(v) | PROTO(v) => v.to_string(),
        LONG_BINGET(v) | LONG_BINPUT(v) => v.to_string(),
        EXT2(v) => v.to_string(),
        EXT4(v) => v.to_string(),
        BINFLOAT(v) => v.to_string(),
        LONG1(v) | LONG4(v) => v.to_string(),
        FRAME(v) => v.to_string(),
        GLOBAL(module, name) | INST(module, name) => format!("{module} {name}"),
        BINSTRING(b) | SHORT_BINSTRING(b) | BINBYTES(b) | SHORT_BINBYTES(b) | BINBYTES8(b)
        | BYTEARRAY8(b) => format!("{:?}", String::from_utf8_lossy(b)),
        BINUNICODE(b) | BINUNICODE8(b) | SHORT_BINUNICODE(b) => {
            format!("{:?}", String::from_utf8_lossy(b))
        }
        _ => String::new(),
    }
}
