//! 沙箱运行时值、作用域链与 Promise
//!
//! 数组与对象是引用语义（Arc<Mutex<..>>），与脚本语言一致；
//! 所有类型都是 Send + Sync，解释器 future 可以跨 tokio 任务移动。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::core::{AgentError, RunError};
use crate::sandbox::ast::FunctionDef;

/// 单个字符串的最大长度（UTF-8 字节）；超出抛 RangeError 而不是耗尽宿主内存
pub const MAX_STRING_LENGTH: usize = 1 << 24;
/// 单个数组的最大长度
pub const MAX_ARRAY_LENGTH: usize = 1 << 22;
/// 嵌套值的展开深度；更深的部分（含循环引用）被截断
const MAX_NESTING: usize = 64;

pub type ArrayRef = Arc<Mutex<Vec<Value>>>;
pub type ObjectRef = Arc<Mutex<JsObject>>;

/// 毒化的锁照常使用：沙箱内不存在需要回滚的不变量
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 保持插入顺序的属性表
#[derive(Debug, Default, Clone)]
pub struct JsObject {
    props: Vec<(String, Value)>,
}

impl JsObject {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.props
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.props.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.props.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.props.len();
        self.props.retain(|(k, _)| k != key);
        before != self.props.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.props.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.props.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.props.clone()
    }
}

/// 闭包：函数定义 + 捕获的作用域
pub struct Closure {
    pub def: Arc<FunctionDef>,
    pub env: Arc<Env>,
}

/// 全局命名空间对象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Console,
    Json,
    Math,
    Promise,
    Object,
    Array,
    Number,
    String,
    Boolean,
    Date,
    Error,
}

impl Namespace {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "console" => Self::Console,
            "JSON" => Self::Json,
            "Math" => Self::Math,
            "Promise" => Self::Promise,
            "Object" => Self::Object,
            "Array" => Self::Array,
            "Number" => Self::Number,
            "String" => Self::String,
            "Boolean" => Self::Boolean,
            "Date" => Self::Date,
            "Error" | "TypeError" | "RangeError" | "SyntaxError" => Self::Error,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Json => "JSON",
            Self::Math => "Math",
            Self::Promise => "Promise",
            Self::Object => "Object",
            Self::Array => "Array",
            Self::Number => "Number",
            Self::String => "String",
            Self::Boolean => "Boolean",
            Self::Date => "Date",
            Self::Error => "Error",
        }
    }
}

/// 脚本可见的值
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(ArrayRef),
    Object(ObjectRef),
    Function(Arc<Closure>),
    /// 全局函数或命名空间方法，如 "parseInt"、"Math.max"
    Builtin(String),
    Namespace(Namespace),
    /// 注册表中的能力或子 Agent
    Capability(String),
    Promise(Arc<PromiseCell>),
    /// Date 实例：自 epoch 起的毫秒数（UTC）
    Date(f64),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            other => f.write_str(&other.inspect()),
        }
    }
}

/// 脚本抛出的东西
#[derive(Clone, Debug)]
pub enum Thrown {
    /// 脚本 throw 的值，可被 catch
    Value(Value),
    /// 能力调用的可恢复错误，可被 catch（以错误对象形式）
    Agent(AgentError),
    /// 致命错误，穿透 try/catch
    Fatal(RunError),
    /// 超时或超出操作预算，穿透 try/catch
    Abort(String),
}

impl Thrown {
    pub fn type_error(message: impl Into<String>) -> Self {
        Thrown::Value(Value::error("TypeError", message))
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Thrown::Value(Value::error("RangeError", message))
    }

    /// 新字符串长度超过上限时抛 RangeError
    pub fn check_string_length(len: usize) -> Result<(), Thrown> {
        if len > MAX_STRING_LENGTH {
            return Err(Thrown::range_error("Invalid string length"));
        }
        Ok(())
    }

    /// 新数组长度超过上限时抛 RangeError
    pub fn check_array_length(len: f64) -> Result<usize, Thrown> {
        if len < 0.0 || len.fract() != 0.0 || !len.is_finite() || len > MAX_ARRAY_LENGTH as f64 {
            return Err(Thrown::range_error("Invalid array length"));
        }
        Ok(len as usize)
    }

    pub fn reference_error(name: &str) -> Self {
        Thrown::Value(Value::error(
            "ReferenceError",
            format!("{name} is not defined"),
        ))
    }

    /// catch 可以捕获的形态
    pub fn catchable(&self) -> Option<Value> {
        match self {
            Thrown::Value(v) => Some(v.clone()),
            Thrown::Agent(e) => {
                let err = Value::error("AgentError", e.message.clone());
                if let Value::Object(o) = &err {
                    lock(o).set("code", Value::Str(e.code.as_str().to_string()));
                }
                Some(err)
            }
            Thrown::Fatal(_) | Thrown::Abort(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Thrown::Value(v) => v.error_message(),
            Thrown::Agent(e) => e.message.clone(),
            Thrown::Fatal(e) => e.to_string(),
            Thrown::Abort(msg) => msg.clone(),
        }
    }
}

// ---------- Promise ----------

pub enum PromiseState {
    Pending(JoinHandle<Result<Value, Thrown>>),
    Settled(Result<Value, Thrown>),
}

/// 能力调用产生的 Promise：任务在 tokio 上立即启动，await 时取结果
pub struct PromiseCell {
    label: String,
    state: tokio::sync::Mutex<PromiseState>,
    observed: AtomicBool,
}

impl PromiseCell {
    pub fn pending(label: impl Into<String>, handle: JoinHandle<Result<Value, Thrown>>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            state: tokio::sync::Mutex::new(PromiseState::Pending(handle)),
            observed: AtomicBool::new(false),
        })
    }

    pub fn settled(result: Result<Value, Thrown>) -> Arc<Self> {
        Arc::new(Self {
            label: String::new(),
            state: tokio::sync::Mutex::new(PromiseState::Settled(result)),
            observed: AtomicBool::new(false),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mark_observed(&self) {
        self.observed.store(true, Ordering::SeqCst);
    }

    pub fn is_observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    /// 等待结果；重复 await 得到同一结果
    pub async fn resolve(&self) -> Result<Value, Thrown> {
        self.mark_observed();
        let mut state = self.state.lock().await;
        if let PromiseState::Pending(handle) = &mut *state {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) if e.is_panic() => Err(Thrown::Fatal(RunError::CapabilityPanicked {
                    tool: self.label.clone(),
                    message: panic_message(e.into_panic()),
                })),
                Err(_) => Err(Thrown::Abort(format!("call to {} was cancelled", self.label))),
            };
            *state = PromiseState::Settled(result);
        }
        match &*state {
            PromiseState::Settled(r) => r.clone(),
            PromiseState::Pending(_) => Err(Thrown::Abort("promise still pending".into())),
        }
    }

    pub fn abort(&self) {
        if let Ok(state) = self.state.try_lock() {
            if let PromiseState::Pending(handle) = &*state {
                handle.abort();
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "capability panicked".to_string()
    }
}

// ---------- 作用域 ----------

#[derive(Clone)]
pub struct Binding {
    pub value: Value,
    pub mutable: bool,
}

#[derive(Default)]
pub struct Env {
    vars: Mutex<HashMap<String, Binding>>,
    parent: Option<Arc<Env>>,
}

pub enum AssignResult {
    Assigned,
    Constant,
    Missing,
}

impl Env {
    pub fn root() -> Arc<Env> {
        Arc::new(Env::default())
    }

    pub fn child(parent: &Arc<Env>) -> Arc<Env> {
        Arc::new(Env {
            vars: Mutex::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    pub fn declare(&self, name: impl Into<String>, value: Value, mutable: bool) {
        lock(&self.vars).insert(name.into(), Binding { value, mutable });
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(b) = lock(&self.vars).get(name) {
            return Some(b.value.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    pub fn assign(&self, name: &str, value: Value) -> AssignResult {
        {
            let mut vars = lock(&self.vars);
            if let Some(b) = vars.get_mut(name) {
                if !b.mutable {
                    return AssignResult::Constant;
                }
                b.value = value;
                return AssignResult::Assigned;
            }
        }
        match &self.parent {
            Some(p) => p.assign(name, value),
            None => AssignResult::Missing,
        }
    }

    pub fn has_own(&self, name: &str) -> bool {
        lock(&self.vars).contains_key(name)
    }

    pub fn remove(&self, name: &str) {
        lock(&self.vars).remove(name);
    }

    pub fn clear(&self) {
        lock(&self.vars).clear();
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.vars).keys().cloned().collect()
    }

    pub fn get_own(&self, name: &str) -> Option<Value> {
        lock(&self.vars).get(name).map(|b| b.value.clone())
    }
}

// ---------- 值的转换 ----------

/// 整数不带小数点，其余按最短表示
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{n}")
    }
}

/// 字符串转数字（Number("…") 语义）
pub fn parse_number(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    let radix = |prefix: &str, radix: u32| {
        t.strip_prefix(prefix)
            .map(|digits| i64::from_str_radix(digits, radix).map(|v| v as f64).unwrap_or(f64::NAN))
    };
    if let Some(v) = radix("0x", 16).or_else(|| radix("0X", 16)) {
        return v;
    }
    if let Some(v) = radix("0b", 2).or_else(|| radix("0o", 8)) {
        return v;
    }
    match t {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if t.chars().all(|c| c.is_ascii_digit() || "+-.eE".contains(c)) => {
            t.parse().unwrap_or(f64::NAN)
        }
        _ => f64::NAN,
    }
}

pub fn date_to_iso(ms: f64) -> String {
    if !ms.is_finite() {
        return "Invalid Date".to_string();
    }
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|d| d.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| "Invalid Date".to_string())
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(items)))
    }

    pub fn object(props: Vec<(String, Value)>) -> Value {
        let mut obj = JsObject::default();
        for (k, v) in props {
            obj.set(k, v);
        }
        Value::Object(Arc::new(Mutex::new(obj)))
    }

    pub fn error(name: &str, message: impl Into<String>) -> Value {
        Value::object(vec![
            ("name".into(), Value::str(name)),
            ("message".into(), Value::Str(message.into())),
        ])
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Builtin(_) | Value::Capability(_) | Value::Namespace(_)
        )
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) | Value::Builtin(_) | Value::Capability(_) => "function",
            Value::Namespace(ns) => match ns {
                Namespace::Console | Namespace::Json | Namespace::Math => "object",
                _ => "function",
            },
            Value::Array(_) | Value::Object(_) | Value::Promise(_) | Value::Date(_) => "object",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => parse_number(s),
            Value::Date(ms) => *ms,
            Value::Array(a) => {
                let items = lock(a);
                match items.len() {
                    0 => 0.0,
                    1 => items[0].to_number(),
                    _ => f64::NAN,
                }
            }
            _ => f64::NAN,
        }
    }

    /// String(x) 语义
    pub fn to_display(&self) -> String {
        self.display_depth(0)
    }

    fn display_depth(&self, depth: usize) -> String {
        match self {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::Str(s) => s.clone(),
            Value::Array(_) if depth > MAX_NESTING => String::new(),
            Value::Array(a) => {
                let items = lock(a).clone();
                items
                    .iter()
                    .map(|v| if v.is_nullish() { String::new() } else { v.display_depth(depth + 1) })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Object(o) => {
                let (name, message) = {
                    let obj = lock(o);
                    (obj.get("name"), obj.get("message"))
                };
                match (name, message) {
                    (Some(Value::Str(name)), Some(msg)) if name.ends_with("Error") && depth <= MAX_NESTING => {
                        format!("{name}: {}", msg.display_depth(depth + 1))
                    }
                    _ => "[object Object]".into(),
                }
            }
            Value::Function(c) => format!(
                "function {}() {{ [code] }}",
                c.def.name.clone().unwrap_or_default()
            ),
            Value::Builtin(name) | Value::Capability(name) => {
                format!("function {name}() {{ [native code] }}")
            }
            Value::Namespace(ns) => format!("[object {}]", ns.name()),
            Value::Promise(_) => "[object Promise]".into(),
            Value::Date(ms) => date_to_iso(*ms),
        }
    }

    /// console.log 的格式：字符串原样，其余按 JSON 风格展示
    pub fn inspect(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => {
                if let Value::Object(o) = self {
                    let (name, message) = {
                        let obj = lock(o);
                        (obj.get("name"), obj.get("message"))
                    };
                    if let (Some(Value::Str(name)), Some(msg)) = (name, message) {
                        if name.ends_with("Error") {
                            return format!("{name}: {}", msg.to_display());
                        }
                    }
                }
                serde_json::to_string(&self.to_json()).unwrap_or_else(|_| self.to_display())
            }
            Value::Promise(_) => "Promise { <pending> }".into(),
            Value::Function(c) => format!("[Function: {}]", c.def.name.as_deref().unwrap_or("anonymous")),
            Value::Builtin(name) | Value::Capability(name) => format!("[Function: {name}]"),
            other => other.to_display(),
        }
    }

    /// Error 对象的 message，其余值的字符串形式
    pub fn error_message(&self) -> String {
        if let Value::Object(o) = self {
            if let Some(msg) = lock(o).get("message") {
                return msg.to_display();
            }
        }
        self.to_display()
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(map) => Value::object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_depth(0)
    }

    fn to_json_depth(&self, depth: usize) -> serde_json::Value {
        use serde_json::Value as J;
        // 循环引用在此截断
        if depth > MAX_NESTING {
            return J::Null;
        }
        match self {
            Value::Undefined | Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Number(n) => {
                if n.is_finite() && *n == n.trunc() && n.abs() < 9.0e15 {
                    J::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n).map(J::Number).unwrap_or(J::Null)
                }
            }
            Value::Str(s) => J::String(s.clone()),
            Value::Array(a) => {
                let items = lock(a).clone();
                J::Array(
                    items
                        .iter()
                        .map(|v| match v {
                            v if v.is_callable() => J::Null,
                            v => v.to_json_depth(depth + 1),
                        })
                        .collect(),
                )
            }
            Value::Object(o) => {
                let entries = lock(o).entries();
                let mut map = serde_json::Map::new();
                for (k, v) in entries {
                    if matches!(v, Value::Undefined) || v.is_callable() {
                        continue;
                    }
                    map.insert(k, v.to_json_depth(depth + 1));
                }
                J::Object(map)
            }
            Value::Promise(_) => J::Object(serde_json::Map::new()),
            Value::Date(ms) => J::String(date_to_iso(*ms)),
            _ => J::Null,
        }
    }

    /// 严格相等（===）：对象按引用比较
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Promise(a), Value::Promise(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) | (Value::Capability(a), Value::Capability(b)) => a == b,
            (Value::Namespace(a), Value::Namespace(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            _ => false,
        }
    }

    /// 宽松相等（==）
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::Str(_))
            | (Value::Str(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => self.to_number() == other.to_number(),
            (Value::Str(s), Value::Array(_) | Value::Object(_)) => *s == other.to_display(),
            (Value::Array(_) | Value::Object(_), Value::Str(s)) => self.to_display() == *s,
            _ => self.strict_eq(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(3.0), "3");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 42 "), 42.0);
        assert_eq!(parse_number(""), 0.0);
        assert_eq!(parse_number("0x1f"), 31.0);
        assert!(parse_number("12px").is_nan());
    }

    #[test]
    fn test_json_conversion_preserves_order_and_drops_undefined() {
        let v = Value::from_json(&json!({"b": 1, "a": [true, null, "x"]}));
        if let Value::Object(o) = &v {
            lock(o).set("gone", Value::Undefined);
        }
        let back = v.to_json();
        assert_eq!(back, json!({"b": 1, "a": [true, null, "x"]}));
        assert_eq!(serde_json::to_string(&back).unwrap(), r#"{"b":1,"a":[true,null,"x"]}"#);
    }

    #[test]
    fn test_equality() {
        let a = Value::array(vec![]);
        assert!(a.strict_eq(&a.clone()));
        assert!(!a.strict_eq(&Value::array(vec![])));
        assert!(Value::Number(1.0).loose_eq(&Value::str("1")));
        assert!(Value::Null.loose_eq(&Value::Undefined));
        assert!(!Value::Null.strict_eq(&Value::Undefined));
        assert!(!Value::Number(f64::NAN).strict_eq(&Value::Number(f64::NAN)));
    }

    #[test]
    fn test_display_and_inspect() {
        let arr = Value::from_json(&json!([1, "a", null]));
        assert_eq!(arr.to_display(), "1,a,");
        assert_eq!(arr.inspect(), r#"[1,"a",null]"#);
        assert_eq!(Value::error("TypeError", "bad").to_display(), "TypeError: bad");
        assert_eq!(Value::Undefined.inspect(), "undefined");
    }

    #[test]
    fn test_env_chain() {
        let root = Env::root();
        root.declare("x", Value::Number(1.0), true);
        root.declare("c", Value::Number(2.0), false);
        let child = Env::child(&root);
        child.declare("y", Value::Bool(true), true);
        assert!(matches!(child.lookup("x"), Some(Value::Number(n)) if n == 1.0));
        assert!(matches!(child.assign("x", Value::Number(5.0)), AssignResult::Assigned));
        assert!(matches!(root.lookup("x"), Some(Value::Number(n)) if n == 5.0));
        assert!(matches!(child.assign("c", Value::Null), AssignResult::Constant));
        assert!(matches!(child.assign("nope", Value::Null), AssignResult::Missing));
        assert!(root.lookup("y").is_none());
    }

    #[test]
    fn test_cyclic_array_is_cut_off() {
        let a = Value::array(vec![Value::Number(1.0)]);
        if let Value::Array(items) = &a {
            lock(items).push(a.clone());
        }
        assert!(a.to_display().starts_with("1,1,"));
        assert!(a.to_json().is_array());
    }

    #[test]
    fn test_length_limits() {
        assert!(Thrown::check_string_length(MAX_STRING_LENGTH).is_ok());
        assert!(Thrown::check_string_length(MAX_STRING_LENGTH + 1).is_err());
        assert_eq!(Thrown::check_array_length(3.0).unwrap(), 3);
        assert!(Thrown::check_array_length(-1.0).is_err());
        assert!(Thrown::check_array_length(1e19).is_err());
        assert!(Thrown::check_array_length(f64::INFINITY).is_err());
    }

    #[test]
    fn test_agent_error_is_catchable_object() {
        let thrown = Thrown::Agent(AgentError::new(
            crate::core::AgentErrorCode::InvalidInput,
            "bad input",
        ));
        let v = thrown.catchable().unwrap();
        let Value::Object(o) = v else { panic!("expected object") };
        assert_eq!(lock(&o).get("code").unwrap().to_display(), "INVALID_INPUT");
        assert!(Thrown::Abort("t".into()).catchable().is_none());
    }

    #[tokio::test]
    async fn test_promise_resolves_once() {
        let handle = tokio::spawn(async { Ok(Value::Number(7.0)) });
        let p = PromiseCell::pending("calc", handle);
        assert!(!p.is_observed());
        assert!(matches!(p.resolve().await, Ok(Value::Number(n)) if n == 7.0));
        assert!(matches!(p.resolve().await, Ok(Value::Number(n)) if n == 7.0));
        assert!(p.is_observed());
    }
}
