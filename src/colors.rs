//! ANSI color helpers and the value colorizer for the debugger's state panes.

use crate::value::{HashableValue, Value};

pub const NORMAL: &str = "\x1b[0m";
pub const GRAY: &str = "\x1b[1;38;5;240m";
pub const LIGHT_GRAY: &str = "\x1b[0;37m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const BLUE: &str = "\x1b[34m";
pub const PINK: &str = "\x1b[35m";
pub const CYAN: &str = "\x1b[36m";
pub const BOLD: &str = "\x1b[1m";

pub fn colorify(text: &str, color: &str) -> String {
    format!("{color}{text}{NORMAL}")
}

pub fn redify(text: &str) -> String {
    colorify(text, RED)
}

pub fn greenify(text: &str) -> String {
    colorify(text, GREEN)
}

pub fn blueify(text: &str) -> String {
    colorify(text, BLUE)
}

pub fn yellowify(text: &str) -> String {
    colorify(text, YELLOW)
}

pub fn grayify(text: &str) -> String {
    colorify(text, GRAY)
}

pub fn light_grayify(text: &str) -> String {
    colorify(text, LIGHT_GRAY)
}

pub fn pinkify(text: &str) -> String {
    colorify(text, PINK)
}

pub fn cyanify(text: &str) -> String {
    colorify(text, CYAN)
}

pub fn boldify(text: &str) -> String {
    colorify(text, BOLD)
}

/// Color one value: strings and bytes pink, numbers cyan, None and booleans
/// blue, containers recursed, everything else yellow.
pub fn colorize_value(value: &Value) -> String {
    match value {
        Value::None | Value::Bool(_) => blueify(&value.to_string()),
        Value::I64(_) | Value::Int(_) | Value::F64(_) => cyanify(&value.to_string()),
        Value::String(_) | Value::Bytes(_) | Value::Bytearray(_) => pinkify(&value.to_string()),
        Value::List(items) => {
            let items = items.inner();
            format!("[{}]", colorize_seq(items.iter()))
        }
        Value::Tuple(items) => {
            let items = items.inner();
            if items.len() == 1 {
                format!("({},)", colorize_value(&items[0]))
            } else {
                format!("({})", colorize_seq(items.iter()))
            }
        }
        Value::Set(items) => {
            let items = items.inner();
            if items.is_empty() {
                cyanify("set()")
            } else {
                format!(
                    "{{{}}}",
                    items
                        .iter()
                        .map(colorize_hashable)
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }
        }
        Value::FrozenSet(items) => {
            let items = items.inner();
            format!(
                "frozenset([{}])",
                items
                    .iter()
                    .map(colorize_hashable)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
        Value::Dict(map) => {
            let map = map.inner();
            let body = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, colorize_value(v)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{body}}}")
        }
        _ => yellowify(&value.to_string()),
    }
}

fn colorize_hashable(value: &HashableValue) -> String {
    colorize_value(&value.clone().into_value())
}

fn colorize_seq<'a>(items: impl Iterator<Item = &'a Value>) -> String {
    items.map(colorize_value).collect::<Vec<_>>().join(", ")
}

/// Render a whole stack the way the debugger shows it.
pub fn colorize_stack(items: &[Value]) -> String {
    format!("[{}]", colorize_seq(items.iter()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_get_their_colors() {
        assert_eq!(colorize_value(&Value::I64(3)), format!("{CYAN}3{NORMAL}"));
        assert_eq!(
            colorize_value(&Value::None),
            format!("{BLUE}None{NORMAL}")
        );
        assert!(colorize_value(&Value::string("x")).starts_with(PINK));
    }

    #[test]
    fn containers_recurse() {
        let v = Value::list(vec![Value::I64(1), Value::string("a")]);
        let s = colorize_value(&v);
        assert!(s.starts_with('['));
        assert!(s.contains(CYAN));
        assert!(s.contains(PINK));
    }
}
