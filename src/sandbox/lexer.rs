//! 词法分析：脚本文本 → Token 序列
//!
//! 支持数字、字符串、模板字符串、标识符与常用标点；不支持正则字面量（`/` 一律视为除号）。

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Num(f64),
    Str(String),
    /// 模板字符串：quasis.len() == exprs.len() + 1；表达式保留源码，由 parser 再解析
    Template { quasis: Vec<String>, exprs: Vec<String> },
    Ident(String),
    Punct(&'static str),
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Num(n) => write!(f, "{n}"),
            Tok::Str(s) => write!(f, "\"{s}\""),
            Tok::Template { .. } => write!(f, "template literal"),
            Tok::Ident(s) => write!(f, "{s}"),
            Tok::Punct(p) => write!(f, "{p}"),
            Tok::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    /// 该 token 之前是否有换行（用于 return / ++ 的换行规则）
    pub newline_before: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line {})", self.message, self.line)
    }
}

/// 按长度降序，保证最长匹配
const PUNCTS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "??=", "||=", "&&=", ">>>", "<<=", ">>=", "=>", "==", "!=",
    "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "**", "<<", ">>",
    "&=", "|=", "^=", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*", "/", "%",
    "&", "|", "^", "!", "~", "?", ":", "=", ".",
];

pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;
    let mut newline_before = false;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            newline_before = true;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        // 注释
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                if chars[i] == '\n' {
                    line += 1;
                    newline_before = true;
                }
                i += 1;
            }
            if i >= chars.len() {
                return Err(LexError {
                    message: "Unterminated comment".into(),
                    line,
                });
            }
            i += 2;
            continue;
        }

        let start_line = line;
        let tok = if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let (n, next) = lex_number(&chars, i, line)?;
            i = next;
            Tok::Num(n)
        } else if c == '"' || c == '\'' {
            let (s, next, lines) = lex_string(&chars, i, c, line)?;
            i = next;
            line += lines;
            Tok::Str(s)
        } else if c == '`' {
            let (quasis, exprs, next, lines) = lex_template(&chars, i, line)?;
            i = next;
            line += lines;
            Tok::Template { quasis, exprs }
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            Tok::Ident(chars[start..i].iter().collect())
        } else {
            let Some(p) = match_punct(&chars, i) else {
                return Err(LexError {
                    message: format!("Unexpected character '{c}'"),
                    line,
                });
            };
            i += p.chars().count();
            Tok::Punct(p)
        };
        tokens.push(Token {
            tok,
            line: start_line,
            newline_before,
        });
        newline_before = false;
    }
    tokens.push(Token {
        tok: Tok::Eof,
        line,
        newline_before: true,
    });
    Ok(tokens)
}

fn match_punct(chars: &[char], i: usize) -> Option<&'static str> {
    for p in PUNCTS {
        let len = p.chars().count();
        if i + len > chars.len() {
            continue;
        }
        if p.chars().zip(&chars[i..i + len]).all(|(a, b)| a == *b) {
            // `a ? .5 : 1` 中的 ?. 不是可选链
            if *p == "?." && chars.get(i + 2).is_some_and(|d| d.is_ascii_digit()) {
                continue;
            }
            return Some(p);
        }
    }
    None
}

fn lex_number(chars: &[char], start: usize, line: usize) -> Result<(f64, usize), LexError> {
    let mut i = start;
    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x' | 'X' | 'b' | 'B' | 'o' | 'O')) {
        let radix = match chars[i + 1] {
            'x' | 'X' => 16,
            'b' | 'B' => 2,
            _ => 8,
        };
        i += 2;
        let begin = i;
        while i < chars.len() && (chars[i].is_digit(radix) || chars[i] == '_') {
            i += 1;
        }
        let digits: String = chars[begin..i].iter().filter(|c| **c != '_').collect();
        let n = u64::from_str_radix(&digits, radix).map_err(|_| LexError {
            message: "Invalid number literal".into(),
            line,
        })?;
        return Ok((n as f64, i));
    }
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
        i += 1;
    }
    if i < chars.len() && chars[i] == '.' {
        i += 1;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
    let n = text.parse::<f64>().map_err(|_| LexError {
        message: format!("Invalid number literal '{text}'"),
        line,
    })?;
    Ok((n, i))
}

/// 解析转义序列，返回 (字符, 消耗的字符数)
fn lex_escape(chars: &[char], i: usize) -> Option<(Option<char>, usize)> {
    let c = *chars.get(i)?;
    let simple = match c {
        'n' => Some('\n'),
        't' => Some('\t'),
        'r' => Some('\r'),
        'b' => Some('\u{8}'),
        'f' => Some('\u{c}'),
        'v' => Some('\u{b}'),
        '0' => Some('\0'),
        '\n' => return Some((None, 1)),
        _ => None,
    };
    if let Some(ch) = simple {
        return Some((Some(ch), 1));
    }
    match c {
        'u' => {
            if chars.get(i + 1) == Some(&'{') {
                let end = (i + 2..chars.len()).find(|&j| chars[j] == '}')?;
                let hex: String = chars[i + 2..end].iter().collect();
                let code = u32::from_str_radix(&hex, 16).ok()?;
                Some((char::from_u32(code), end - i + 1))
            } else {
                let hex: String = chars.get(i + 1..i + 5)?.iter().collect();
                let code = u32::from_str_radix(&hex, 16).ok()?;
                Some((Some(char::from_u32(code).unwrap_or('\u{fffd}')), 5))
            }
        }
        'x' => {
            let hex: String = chars.get(i + 1..i + 3)?.iter().collect();
            let code = u32::from_str_radix(&hex, 16).ok()?;
            Some((char::from_u32(code), 3))
        }
        other => Some((Some(other), 1)),
    }
}

fn lex_string(
    chars: &[char],
    start: usize,
    quote: char,
    line: usize,
) -> Result<(String, usize, usize), LexError> {
    let mut i = start + 1;
    let mut out = String::new();
    let mut lines = 0;
    loop {
        let Some(&c) = chars.get(i) else {
            return Err(LexError {
                message: "Unterminated string literal".into(),
                line,
            });
        };
        if c == quote {
            return Ok((out, i + 1, lines));
        }
        if c == '\n' {
            return Err(LexError {
                message: "Unterminated string literal".into(),
                line,
            });
        }
        if c == '\\' {
            let Some((ch, used)) = lex_escape(chars, i + 1) else {
                return Err(LexError {
                    message: "Invalid escape sequence".into(),
                    line,
                });
            };
            if chars.get(i + 1) == Some(&'\n') {
                lines += 1;
            }
            if let Some(ch) = ch {
                out.push(ch);
            }
            i += 1 + used;
            continue;
        }
        out.push(c);
        i += 1;
    }
}

type TemplateParts = (Vec<String>, Vec<String>, usize, usize);

fn lex_template(chars: &[char], start: usize, line: usize) -> Result<TemplateParts, LexError> {
    let mut i = start + 1;
    let mut quasis = Vec::new();
    let mut exprs = Vec::new();
    let mut current = String::new();
    let mut lines = 0;
    loop {
        let Some(&c) = chars.get(i) else {
            return Err(LexError {
                message: "Unterminated template literal".into(),
                line,
            });
        };
        match c {
            '`' => {
                quasis.push(current);
                return Ok((quasis, exprs, i + 1, lines));
            }
            '\\' => {
                let Some((ch, used)) = lex_escape(chars, i + 1) else {
                    return Err(LexError {
                        message: "Invalid escape sequence".into(),
                        line,
                    });
                };
                if let Some(ch) = ch {
                    current.push(ch);
                }
                i += 1 + used;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                quasis.push(std::mem::take(&mut current));
                i += 2;
                let begin = i;
                let mut depth = 1;
                while i < chars.len() {
                    match chars[i] {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        '\n' => lines += 1,
                        '"' | '\'' | '`' => {
                            // 跳过嵌套字符串，避免其中的花括号干扰计数
                            let q = chars[i];
                            i += 1;
                            while i < chars.len() && chars[i] != q {
                                if chars[i] == '\\' {
                                    i += 1;
                                }
                                i += 1;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(LexError {
                        message: "Unterminated template expression".into(),
                        line,
                    });
                }
                exprs.push(chars[begin..i].iter().collect());
                i += 1;
            }
            _ => {
                if c == '\n' {
                    lines += 1;
                }
                current.push(c);
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            toks("const x = await f({a: 1.5});"),
            vec![
                Tok::Ident("const".into()),
                Tok::Ident("x".into()),
                Tok::Punct("="),
                Tok::Ident("await".into()),
                Tok::Ident("f".into()),
                Tok::Punct("("),
                Tok::Punct("{"),
                Tok::Ident("a".into()),
                Tok::Punct(":"),
                Tok::Num(1.5),
                Tok::Punct("}"),
                Tok::Punct(")"),
                Tok::Punct(";"),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_longest_punct_match() {
        assert_eq!(
            toks("a === b ?? c?.d"),
            vec![
                Tok::Ident("a".into()),
                Tok::Punct("==="),
                Tok::Ident("b".into()),
                Tok::Punct("??"),
                Tok::Ident("c".into()),
                Tok::Punct("?."),
                Tok::Ident("d".into()),
                Tok::Eof,
            ]
        );
        assert_eq!(toks("a?.5:1")[1], Tok::Punct("?"));
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(toks(r#"'it\'s' "a\nb" "A""#)[..3], [
            Tok::Str("it's".into()),
            Tok::Str("a\nb".into()),
            Tok::Str("A".into()),
        ]);
    }

    #[test]
    fn test_template_parts() {
        let t = toks("`a ${x + 1} b ${ {k: 1}.k }`");
        assert_eq!(
            t[0],
            Tok::Template {
                quasis: vec!["a ".into(), " b ".into(), "".into()],
                exprs: vec!["x + 1".into(), " {k: 1}.k ".into()],
            }
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let tokens = tokenize("// hi\nx /* multi\nline */ y").unwrap();
        assert_eq!(tokens[0].line, 2);
        assert!(tokens[0].newline_before);
        assert_eq!(tokens[1].line, 3);
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("'abc").unwrap_err();
        assert!(err.message.contains("Unterminated"));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(toks("0x1f 1e3 1_000 .5"), vec![
            Tok::Num(31.0),
            Tok::Num(1000.0),
            Tok::Num(1000.0),
            Tok::Num(0.5),
            Tok::Eof,
        ]);
    }
}
