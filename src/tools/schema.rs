//! 能力 Schema 工具：生成、校验、渲染
//!
//! 内置能力的输入 schema 由 schemars 从 Rust 结构体生成；调用前用 jsonschema 编译好的 Validator 校验；
//! 提示词中把 schema 渲染成 TypeScript 风格的函数签名，模型更容易写对参数。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

use crate::core::AgentError;

/// 由 Rust 类型生成 JSON Schema（去掉 $schema / title 等对模型无用的键）
pub fn schema_value<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or(Value::Bool(true));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 编译 schema；无法编译视为构造期错误
pub fn compile_validator(tool: &str, schema: &Value) -> Result<jsonschema::Validator, AgentError> {
    jsonschema::Validator::new(schema).map_err(|e| {
        AgentError::validation(format!("Invalid input schema for capability '{tool}': {e}"))
    })
}

/// 校验失败时返回全部错误文本
pub fn validation_errors(validator: &jsonschema::Validator, input: &Value) -> Option<Vec<String>> {
    if validator.is_valid(input) {
        return None;
    }
    Some(validator.iter_errors(input).map(|e| e.to_string()).collect())
}

/// 列出缺少 description 的原始类型字段（路径形如 `items[].name`）
pub fn undocumented_primitives(schema: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_undocumented(schema, schema, "", &mut out);
    out
}

fn collect_undocumented(schema: &Value, root: &Value, path: &str, out: &mut Vec<String>) {
    let schema = resolve_ref(schema, root);
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, prop) in props {
            let child = if path.is_empty() {
                key.clone()
            } else {
                format!("{path}.{key}")
            };
            let resolved = resolve_ref(prop, root);
            if is_primitive(resolved) && resolved.get("description").is_none() && prop.get("description").is_none() {
                out.push(child.clone());
            }
            collect_undocumented(prop, root, &child, out);
        }
    }
    if let Some(items) = schema.get("items") {
        collect_undocumented(items, root, &format!("{path}[]"), out);
    }
}

fn is_primitive(schema: &Value) -> bool {
    match schema.get("type") {
        Some(Value::String(t)) => matches!(t.as_str(), "string" | "number" | "integer" | "boolean"),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .filter(|t| *t != "null")
            .all(|t| matches!(t, "string" | "number" | "integer" | "boolean")),
        _ => false,
    }
}

fn resolve_ref<'a>(schema: &'a Value, root: &'a Value) -> &'a Value {
    let Some(reference) = schema.get("$ref").and_then(Value::as_str) else {
        return schema;
    };
    let Some(pointer) = reference.strip_prefix('#') else {
        return schema;
    };
    root.pointer(pointer).unwrap_or(schema)
}

/// 渲染为 `async function name(input: {...}): Promise<...>`
pub fn render_signature(name: &str, input: &Value, output: &Value) -> String {
    let input_ts = render_type(input, input, 1);
    let output_ts = render_type(output, output, 1);
    let mut sig = format!("async function {name}(input: {input_ts}): Promise<{output_ts}>");
    if let Some(desc) = output.get("description").and_then(Value::as_str) {
        sig.push_str(&format!(" // returns {desc}"));
    }
    sig
}

fn render_type(schema: &Value, root: &Value, depth: usize) -> String {
    if let Value::Bool(true) = schema {
        return "any".into();
    }
    let schema = resolve_ref(schema, root);
    if let Some(values) = schema.get("enum").and_then(Value::as_array) {
        return values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" | ");
    }
    for key in ["anyOf", "oneOf"] {
        if let Some(variants) = schema.get(key).and_then(Value::as_array) {
            return variants
                .iter()
                .map(|v| render_type(v, root, depth))
                .collect::<Vec<_>>()
                .join(" | ");
        }
    }
    match schema.get("type") {
        Some(Value::String(t)) => render_named_type(t, schema, root, depth),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .map(|t| render_named_type(t, schema, root, depth))
            .collect::<Vec<_>>()
            .join(" | "),
        _ if schema.get("properties").is_some() => render_named_type("object", schema, root, depth),
        _ => "any".into(),
    }
}

fn render_named_type(t: &str, schema: &Value, root: &Value, depth: usize) -> String {
    match t {
        "string" => "string".into(),
        "number" | "integer" => "number".into(),
        "boolean" => "boolean".into(),
        "null" => "null".into(),
        "array" => {
            let item = schema
                .get("items")
                .map(|i| render_type(i, root, depth))
                .unwrap_or_else(|| "any".into());
            if item.contains(' ') {
                format!("({item})[]")
            } else {
                format!("{item}[]")
            }
        }
        "object" => {
            let Some(props) = schema.get("properties").and_then(Value::as_object) else {
                return "Record<string, any>".into();
            };
            if props.is_empty() {
                return "{}".into();
            }
            let required: Vec<&str> = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let pad = "  ".repeat(depth);
            let mut lines = vec!["{".to_string()];
            for (key, prop) in props {
                let optional = if required.contains(&key.as_str()) { "" } else { "?" };
                let ty = render_type(prop, root, depth + 1);
                let desc = prop
                    .get("description")
                    .or_else(|| resolve_ref(prop, root).get("description"))
                    .and_then(Value::as_str);
                match desc {
                    Some(d) => lines.push(format!("{pad}{key}{optional}: {ty}; // {d}")),
                    None => lines.push(format!("{pad}{key}{optional}: {ty};")),
                }
            }
            lines.push(format!("{}}}", "  ".repeat(depth - 1)));
            lines.join("\n")
        }
        _ => "any".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(JsonSchema)]
    #[allow(dead_code)]
    struct SearchInput {
        /// search query
        query: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_schema_value_strips_meta() {
        let schema = schema_value::<SearchInput>();
        assert!(schema.get("$schema").is_none());
        assert_eq!(schema["properties"]["query"]["description"], "search query");
    }

    #[test]
    fn test_undocumented_primitives() {
        let schema = schema_value::<SearchInput>();
        assert_eq!(undocumented_primitives(&schema), vec!["limit".to_string()]);
    }

    #[test]
    fn test_render_signature() {
        let input = json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "what to look for"},
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["query"]
        });
        let sig = render_signature("search", &input, &json!({"type": "string"}));
        assert!(sig.starts_with("async function search(input: {"));
        assert!(sig.contains("query: string; // what to look for"));
        assert!(sig.contains("tags?: string[];"));
        assert!(sig.ends_with("}): Promise<string>"));
    }

    #[test]
    fn test_validator_reports_errors() {
        let schema = json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}},
            "required": ["answer"]
        });
        let validator = compile_validator("finalAnswer", &schema).unwrap();
        assert!(validation_errors(&validator, &json!({"answer": "ok"})).is_none());
        let errors = validation_errors(&validator, &json!({})).unwrap();
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_invalid_schema_is_validation_error() {
        let err = compile_validator("bad", &json!({"type": 12})).unwrap_err();
        assert_eq!(err.code, crate::core::AgentErrorCode::ValidationError);
    }
}
