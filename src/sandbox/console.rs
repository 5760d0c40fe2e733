//! 沙箱内的 console：只写缓冲区，不触碰宿主日志

use std::sync::Mutex;

use crate::sandbox::value::{lock, Value};

#[derive(Default)]
pub struct ConsoleBuffer {
    lines: Mutex<Vec<String>>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// console.log / info / warn / error / debug 共用；参数以空格拼接
    pub fn log(&self, args: &[Value]) {
        let line = format_args(args);
        lock(&self.lines).push(line);
    }

    pub fn push_line(&self, line: impl Into<String>) {
        lock(&self.lines).push(line.into());
    }

    pub fn output(&self) -> String {
        lock(&self.lines).join("\n")
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.lines).is_empty()
    }
}

/// 首个参数为字符串时支持 %s %d %i %f %o %O %j 占位符
pub fn format_args(args: &[Value]) -> String {
    let Some((Value::Str(fmt), rest)) = args.split_first() else {
        return join(args);
    };
    if !fmt.contains('%') {
        return join(args);
    }
    let mut out = String::new();
    let mut rest = rest.iter();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(spec @ ('s' | 'd' | 'i' | 'f' | 'o' | 'O' | 'j')) => {
                chars.next();
                match rest.next() {
                    Some(v) => out.push_str(&match spec {
                        's' => v.to_display(),
                        'd' | 'i' => crate::sandbox::value::number_to_string(v.to_number().trunc()),
                        'f' => crate::sandbox::value::number_to_string(v.to_number()),
                        _ => v.inspect(),
                    }),
                    None => {
                        out.push('%');
                        out.push(spec);
                    }
                }
            }
            _ => out.push('%'),
        }
    }
    let tail: Vec<Value> = rest.cloned().collect();
    if !tail.is_empty() {
        out.push(' ');
        out.push_str(&join(&tail));
    }
    out
}

fn join(args: &[Value]) -> String {
    args.iter()
        .map(Value::inspect)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_buffer_joins_lines() {
        let console = ConsoleBuffer::new();
        assert!(console.is_empty());
        console.log(&[Value::str("a"), Value::Number(1.0)]);
        console.log(&[Value::from_json(&json!({"k": [1, 2]}))]);
        assert_eq!(console.output(), "a 1\n{\"k\":[1,2]}");
    }

    #[test]
    fn test_format_placeholders() {
        let out = format_args(&[
            Value::str("%s has %d items (100%%)"),
            Value::str("cart"),
            Value::Number(3.7),
            Value::Bool(true),
        ]);
        assert_eq!(out, "cart has 3 items (100%) true");
    }
}
