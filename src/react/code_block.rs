//! 从模型输出中提取脚本
//!
//! 取第一个 ```js / ```ts（语言标记可省略）围栏代码块的内容。
//! 找不到围栏时：Lenient 把整段回复当作脚本；Strict 返回 INVALID_CODE_PATTERN。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{AgentError, AgentErrorCode};

/// 围栏缺失时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeParsePolicy {
    #[default]
    Lenient,
    Strict,
}

const FENCE_PATTERN: &str =
    r"```(?:js|javascript|ts|typescript)?[ \t]*\r?\n?((?s:.*?))\r?\n?[ \t]*```";

static FENCE_RE: OnceLock<Regex> = OnceLock::new();

fn fence_regex() -> &'static Regex {
    FENCE_RE.get_or_init(|| Regex::new(FENCE_PATTERN).unwrap())
}

/// 停止序列会吃掉收尾的 ```，此时取开头围栏之后的全部内容
fn unterminated_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let rest = &text[start + 3..];
    let lang_end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    match &rest[..lang_end] {
        "" | "js" | "javascript" | "ts" | "typescript" => Some(&rest[lang_end..]),
        _ => None,
    }
}

pub fn parse_code_output(text: &str, policy: CodeParsePolicy) -> Result<String, AgentError> {
    let cleaned = text.replace("<end_code>", "");

    if let Some(caps) = fence_regex().captures(&cleaned) {
        if let Some(code) = caps.get(1) {
            return Ok(code.as_str().trim().to_string());
        }
    }
    if let Some(code) = unterminated_block(&cleaned) {
        let code = code.trim();
        if !code.is_empty() {
            return Ok(code.to_string());
        }
    }

    match policy {
        CodeParsePolicy::Lenient => Ok(cleaned.trim().to_string()),
        CodeParsePolicy::Strict => Err(AgentError::new(
            AgentErrorCode::InvalidCodePattern,
            format!(
                "Your code snippet is invalid, because the regex pattern {FENCE_PATTERN} was not found in it.\n\
                 Here is your code snippet:\n{text}\n\
                 Make sure to include code with the correct pattern, for instance:\n\
                 Thought: Your thoughts\n\
                 Code:\n```js\n// Your javascript code here\n```<end_code>"
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fenced_block_wins() {
        let text = "Thought: go\n```js\nconst a = 1\nconsole.log(a)\n```\nmore\n```js\nlater()\n```";
        let code = parse_code_output(text, CodeParsePolicy::Strict).unwrap();
        assert_eq!(code, "const a = 1\nconsole.log(a)");
    }

    #[test]
    fn test_language_tag_optional() {
        let code = parse_code_output("```\nx = 2\n```", CodeParsePolicy::Strict).unwrap();
        assert_eq!(code, "x = 2");
        let code = parse_code_output("```typescript\ny()\n```<end_code>", CodeParsePolicy::Strict).unwrap();
        assert_eq!(code, "y()");
    }

    #[test]
    fn test_unterminated_block_after_stop_sequence() {
        let code = parse_code_output("Thought: t\n```js\nawait finalAnswer({answer: 1})\n", CodeParsePolicy::Strict)
            .unwrap();
        assert_eq!(code, "await finalAnswer({answer: 1})");
    }

    #[test]
    fn test_missing_fence_policies() {
        let raw = "finalAnswer({answer: 'ok'})";
        assert_eq!(parse_code_output(raw, CodeParsePolicy::Lenient).unwrap(), raw);
        let err = parse_code_output(raw, CodeParsePolicy::Strict).unwrap_err();
        assert_eq!(err.code, AgentErrorCode::InvalidCodePattern);
        assert!(err.message.contains(raw));
    }

    #[test]
    fn test_other_language_fence_is_not_code() {
        let err = parse_code_output("```python\nprint(1)", CodeParsePolicy::Strict).unwrap_err();
        assert_eq!(err.code, AgentErrorCode::InvalidCodePattern);
    }
}
