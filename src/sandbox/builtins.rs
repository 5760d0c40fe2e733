//! 纯内置函数：不需要回调解释器的全局函数、命名空间方法与原始值方法
//!
//! 需要执行脚本回调的方法（map/filter/reduce/sort(cmp) 等）以及 Promise、console
//! 由解释器处理；此处对这类调用返回 None。

use std::sync::Arc;

use crate::sandbox::value::{
    date_to_iso, lock, number_to_string, ArrayRef, Namespace, Thrown, Value, MAX_ARRAY_LENGTH,
};

pub type BuiltinResult = Result<Value, Thrown>;

pub const GLOBAL_FUNCTIONS: &[&str] = &["parseInt", "parseFloat", "isNaN", "isFinite"];

pub fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or(Value::Undefined)
}

fn num_arg(args: &[Value], i: usize) -> Option<f64> {
    args.get(i).filter(|v| !matches!(v, Value::Undefined)).map(Value::to_number)
}

/// slice 风格的相对下标：负数从尾部计，越界夹取
fn rel_index(i: f64, len: usize) -> usize {
    let len_f = len as f64;
    let i = if i.is_nan() { 0.0 } else { i.trunc() };
    if i < 0.0 {
        (len_f + i).max(0.0) as usize
    } else {
        i.min(len_f) as usize
    }
}

fn slice_bounds(args: &[Value], len: usize) -> (usize, usize) {
    let start = num_arg(args, 0).map_or(0, |s| rel_index(s, len));
    let end = num_arg(args, 1).map_or(len, |e| rel_index(e, len));
    (start, end.max(start))
}

/// includes 使用的 SameValueZero
pub fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => a.strict_eq(b),
    }
}

// ---------- 全局函数 ----------

pub fn call_global(name: &str, args: &[Value]) -> BuiltinResult {
    match name {
        "parseInt" => Ok(Value::Number(parse_int(&arg(args, 0).to_display(), num_arg(args, 1)))),
        "parseFloat" => Ok(Value::Number(parse_float(&arg(args, 0).to_display()))),
        "isNaN" => Ok(Value::Bool(arg(args, 0).to_number().is_nan())),
        "isFinite" => Ok(Value::Bool(arg(args, 0).to_number().is_finite())),
        other => Err(Thrown::reference_error(other)),
    }
}

pub fn parse_int(s: &str, radix: Option<f64>) -> f64 {
    let mut t = s.trim();
    let mut sign = 1.0;
    if let Some(rest) = t.strip_prefix('-') {
        sign = -1.0;
        t = rest;
    } else if let Some(rest) = t.strip_prefix('+') {
        t = rest;
    }
    let mut radix = radix.map_or(0, |r| r as u32);
    if radix == 0 || radix == 16 {
        if let Some(rest) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
            t = rest;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let digits: String = t.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = digits
        .chars()
        .filter_map(|c| c.to_digit(radix))
        .fold(0.0, |acc, d| acc * f64::from(radix) + f64::from(d));
    sign * value
}

pub fn parse_float(s: &str) -> f64 {
    let t = s.trim_start();
    for prefix in ["Infinity", "+Infinity"] {
        if t.starts_with(prefix) {
            return f64::INFINITY;
        }
    }
    if t.starts_with("-Infinity") {
        return f64::NEG_INFINITY;
    }
    let bytes = t.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end == digits_start || &t[digits_start..end] == "." {
        return f64::NAN;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    t[..end].parse().unwrap_or(f64::NAN)
}

// ---------- 命名空间 ----------

/// 命名空间上的属性读取：常量或方法引用
pub fn namespace_member(ns: Namespace, name: &str) -> Value {
    let constant = match (ns, name) {
        (Namespace::Math, "PI") => Some(std::f64::consts::PI),
        (Namespace::Math, "E") => Some(std::f64::consts::E),
        (Namespace::Math, "LN2") => Some(std::f64::consts::LN_2),
        (Namespace::Math, "LN10") => Some(std::f64::consts::LN_10),
        (Namespace::Math, "SQRT2") => Some(std::f64::consts::SQRT_2),
        (Namespace::Number, "MAX_SAFE_INTEGER") => Some(9_007_199_254_740_991.0),
        (Namespace::Number, "MIN_SAFE_INTEGER") => Some(-9_007_199_254_740_991.0),
        (Namespace::Number, "EPSILON") => Some(f64::EPSILON),
        (Namespace::Number, "MAX_VALUE") => Some(f64::MAX),
        (Namespace::Number, "MIN_VALUE") => Some(5e-324),
        (Namespace::Number, "POSITIVE_INFINITY") => Some(f64::INFINITY),
        (Namespace::Number, "NEGATIVE_INFINITY") => Some(f64::NEG_INFINITY),
        (Namespace::Number, "NaN") => Some(f64::NAN),
        _ => None,
    };
    match constant {
        Some(n) => Value::Number(n),
        None if name == "name" => Value::str(ns.name()),
        None => Value::Builtin(format!("{}.{name}", ns.name())),
    }
}

/// 不需要解释器的命名空间方法；None 表示交给解释器
pub fn call_namespace(ns: Namespace, method: &str, args: &[Value]) -> Option<BuiltinResult> {
    Some(match ns {
        Namespace::Math => math(method, args),
        Namespace::Json => json(method, args),
        Namespace::Object => object(method, args),
        Namespace::Number => match method {
            "isInteger" => Ok(Value::Bool(matches!(arg(args, 0), Value::Number(n) if n.is_finite() && n == n.trunc()))),
            "isSafeInteger" => Ok(Value::Bool(matches!(arg(args, 0), Value::Number(n) if n == n.trunc() && n.abs() <= 9_007_199_254_740_991.0))),
            "isFinite" => Ok(Value::Bool(matches!(arg(args, 0), Value::Number(n) if n.is_finite()))),
            "isNaN" => Ok(Value::Bool(matches!(arg(args, 0), Value::Number(n) if n.is_nan()))),
            "parseFloat" => call_global("parseFloat", args),
            "parseInt" => call_global("parseInt", args),
            _ => Err(not_a_function(ns, method)),
        },
        Namespace::String => match method {
            "fromCharCode" => Ok(Value::Str(
                args.iter()
                    .filter_map(|v| char::from_u32(v.to_number() as u32))
                    .collect(),
            )),
            _ => Err(not_a_function(ns, method)),
        },
        Namespace::Array => match method {
            "isArray" => Ok(Value::Bool(matches!(arg(args, 0), Value::Array(_)))),
            "of" => Ok(Value::array(args.to_vec())),
            "from" if args.get(1).map_or(true, |f| !f.is_callable()) => array_from(&arg(args, 0)),
            "from" => return None,
            _ => Err(not_a_function(ns, method)),
        },
        Namespace::Date => match method {
            "now" => Ok(Value::Number(now_ms())),
            "parse" => Ok(Value::Number(parse_date(&arg(args, 0).to_display()))),
            _ => Err(not_a_function(ns, method)),
        },
        Namespace::Console | Namespace::Promise => return None,
        Namespace::Boolean | Namespace::Error => Err(not_a_function(ns, method)),
    })
}

fn not_a_function(ns: Namespace, method: &str) -> Thrown {
    Thrown::type_error(format!("{}.{method} is not a function", ns.name()))
}

/// 直接调用命名空间：String(x)、Number(x)、Boolean(x)、Array(n)、Error(msg)…
pub fn call_namespace_as_function(ns: Namespace, args: &[Value]) -> BuiltinResult {
    match ns {
        Namespace::String => Ok(Value::Str(args.first().map_or(String::new(), Value::to_display))),
        Namespace::Number => Ok(Value::Number(args.first().map_or(0.0, Value::to_number))),
        Namespace::Boolean => Ok(Value::Bool(arg(args, 0).truthy())),
        Namespace::Array | Namespace::Error | Namespace::Object => construct(ns, args),
        Namespace::Date => Ok(Value::Str(date_to_iso(now_ms()))),
        _ => Err(Thrown::type_error(format!("{} is not a function", ns.name()))),
    }
}

/// new X(...)
pub fn construct(ns: Namespace, args: &[Value]) -> BuiltinResult {
    match ns {
        Namespace::Date => Ok(Value::Date(match args {
            [] => now_ms(),
            [Value::Str(s)] => parse_date(s),
            [single] => single.to_number(),
            [y, m, rest @ ..] => {
                let nums: Vec<f64> = rest.iter().map(Value::to_number).collect();
                let d = nums.first().copied().unwrap_or(1.0);
                chrono::NaiveDate::from_ymd_opt(y.to_number() as i32, m.to_number() as u32 + 1, d as u32)
                    .and_then(|date| {
                        date.and_hms_opt(
                            nums.get(1).copied().unwrap_or(0.0) as u32,
                            nums.get(2).copied().unwrap_or(0.0) as u32,
                            nums.get(3).copied().unwrap_or(0.0) as u32,
                        )
                    })
                    .map_or(f64::NAN, |dt| dt.and_utc().timestamp_millis() as f64)
            }
        })),
        Namespace::Error => Ok(Value::error(
            "Error",
            args.first().map_or(String::new(), Value::to_display),
        )),
        Namespace::Array => match args {
            [Value::Number(n)] => {
                let len = Thrown::check_array_length(*n)?;
                Ok(Value::array(vec![Value::Undefined; len]))
            }
            _ => Ok(Value::array(args.to_vec())),
        },
        Namespace::Object => match arg(args, 0) {
            v @ (Value::Object(_) | Value::Array(_)) => Ok(v),
            _ => Ok(Value::object(Vec::new())),
        },
        Namespace::String | Namespace::Number | Namespace::Boolean => call_namespace_as_function(ns, args),
        _ => Err(Thrown::type_error(format!("{} is not a constructor", ns.name()))),
    }
}

pub fn array_from(source: &Value) -> BuiltinResult {
    Ok(match source {
        Value::Array(a) => Value::array(lock(a).clone()),
        Value::Str(s) => Value::array(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Object(o) => {
            let len = lock(o).get("length").map_or(0.0, |l| l.to_number());
            let len = if len.is_finite() && len > 0.0 {
                Thrown::check_array_length(len.trunc())?
            } else {
                0
            };
            Value::array(vec![Value::Undefined; len])
        }
        _ => Value::array(Vec::new()),
    })
}

// ---------- Math ----------

fn random() -> f64 {
    let bits = uuid::Uuid::new_v4().as_u128() >> 75;
    bits as f64 / (1u64 << 53) as f64
}

fn math(method: &str, args: &[Value]) -> BuiltinResult {
    let x = || arg(args, 0).to_number();
    let n = match method {
        "abs" => x().abs(),
        "floor" => x().floor(),
        "ceil" => x().ceil(),
        "round" => (x() + 0.5).floor(),
        "trunc" => x().trunc(),
        "sign" => {
            let v = x();
            if v.is_nan() || v == 0.0 { v } else { v.signum() }
        }
        "sqrt" => x().sqrt(),
        "cbrt" => x().cbrt(),
        "exp" => x().exp(),
        "log" => x().ln(),
        "log2" => x().log2(),
        "log10" => x().log10(),
        "sin" => x().sin(),
        "cos" => x().cos(),
        "tan" => x().tan(),
        "asin" => x().asin(),
        "acos" => x().acos(),
        "atan" => x().atan(),
        "atan2" => x().atan2(arg(args, 1).to_number()),
        "pow" => x().powf(arg(args, 1).to_number()),
        "hypot" => args.iter().map(|v| v.to_number().powi(2)).sum::<f64>().sqrt(),
        "random" => random(),
        "max" => args.iter().map(Value::to_number).fold(f64::NEG_INFINITY, |acc, v| {
            if acc.is_nan() || v.is_nan() { f64::NAN } else { acc.max(v) }
        }),
        "min" => args.iter().map(Value::to_number).fold(f64::INFINITY, |acc, v| {
            if acc.is_nan() || v.is_nan() { f64::NAN } else { acc.min(v) }
        }),
        other => return Err(Thrown::type_error(format!("Math.{other} is not a function"))),
    };
    Ok(Value::Number(n))
}

// ---------- JSON ----------

fn json(method: &str, args: &[Value]) -> BuiltinResult {
    match method {
        "stringify" => Ok(json_stringify(&arg(args, 0), &arg(args, 2))),
        "parse" => {
            let text = arg(args, 0).to_display();
            serde_json::from_str::<serde_json::Value>(&text)
                .map(|v| Value::from_json(&v))
                .map_err(|e| Thrown::Value(Value::error("SyntaxError", format!("JSON.parse: {e}"))))
        }
        other => Err(Thrown::type_error(format!("JSON.{other} is not a function"))),
    }
}

pub fn json_stringify(value: &Value, indent: &Value) -> Value {
    if matches!(value, Value::Undefined) || value.is_callable() {
        return Value::Undefined;
    }
    let json = value.to_json();
    let indent = match indent {
        Value::Number(n) if *n >= 1.0 => " ".repeat((*n as usize).min(10)),
        Value::Str(s) => s.chars().take(10).collect(),
        _ => String::new(),
    };
    if indent.is_empty() {
        return Value::Str(serde_json::to_string(&json).unwrap_or_default());
    }
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    match serde::Serialize::serialize(&json, &mut ser) {
        Ok(()) => Value::Str(String::from_utf8_lossy(&buf).into_owned()),
        Err(_) => Value::Undefined,
    }
}

// ---------- Object ----------

fn own_entries(v: &Value) -> Vec<(String, Value)> {
    match v {
        Value::Object(o) => lock(o).entries(),
        Value::Array(a) => lock(a)
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        Value::Str(s) => s
            .chars()
            .enumerate()
            .map(|(i, c)| (i.to_string(), Value::Str(c.to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn own_keys(v: &Value) -> Vec<String> {
    own_entries(v).into_iter().map(|(k, _)| k).collect()
}

fn object(method: &str, args: &[Value]) -> BuiltinResult {
    let target = arg(args, 0);
    match method {
        "keys" => Ok(Value::array(own_keys(&target).into_iter().map(Value::Str).collect())),
        "values" => Ok(Value::array(own_entries(&target).into_iter().map(|(_, v)| v).collect())),
        "entries" => Ok(Value::array(
            own_entries(&target)
                .into_iter()
                .map(|(k, v)| Value::array(vec![Value::Str(k), v]))
                .collect(),
        )),
        "fromEntries" => {
            let Value::Array(pairs) = &target else {
                return Err(Thrown::type_error("Object.fromEntries expects an array of pairs"));
            };
            let pairs = lock(pairs).clone();
            let props = pairs
                .iter()
                .filter_map(|pair| match pair {
                    Value::Array(kv) => {
                        let kv = lock(kv);
                        Some((
                            kv.first().map_or_else(|| "undefined".into(), Value::to_display),
                            kv.get(1).cloned().unwrap_or_default(),
                        ))
                    }
                    _ => None,
                })
                .collect();
            Ok(Value::object(props))
        }
        "assign" => {
            let Value::Object(t) = &target else {
                return Err(Thrown::type_error("Object.assign target must be an object"));
            };
            for source in args.iter().skip(1) {
                let entries = own_entries(source);
                let mut t = lock(t);
                for (k, v) in entries {
                    t.set(k, v);
                }
            }
            Ok(target)
        }
        "freeze" | "seal" => Ok(target),
        other => Err(Thrown::type_error(format!("Object.{other} is not a function"))),
    }
}

// ---------- 属性读写 ----------

fn index_of_key(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    key.parse().ok()
}

pub fn get_property(target: &Value, key: &str) -> BuiltinResult {
    Ok(match target {
        Value::Undefined | Value::Null => {
            return Err(Thrown::type_error(format!(
                "Cannot read properties of {} (reading '{key}')",
                target.to_display()
            )))
        }
        Value::Str(s) => match key {
            "length" => Value::Number(s.chars().count() as f64),
            _ => index_of_key(key)
                .and_then(|i| s.chars().nth(i))
                .map_or(Value::Undefined, |c| Value::Str(c.to_string())),
        },
        Value::Array(a) => {
            let items = lock(a);
            match key {
                "length" => Value::Number(items.len() as f64),
                _ => index_of_key(key)
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or_default(),
            }
        }
        Value::Object(o) => lock(o).get(key).unwrap_or_default(),
        Value::Namespace(ns) => namespace_member(*ns, key),
        Value::Function(c) => match key {
            "name" => Value::Str(c.def.name.clone().unwrap_or_default()),
            "length" => Value::Number(c.def.params.iter().filter(|p| !p.rest && p.default.is_none()).count() as f64),
            _ => Value::Undefined,
        },
        Value::Capability(name) | Value::Builtin(name) if key == "name" => Value::Str(name.clone()),
        _ => Value::Undefined,
    })
}

pub fn set_property(target: &Value, key: &str, value: Value) -> Result<(), Thrown> {
    match target {
        Value::Undefined | Value::Null => Err(Thrown::type_error(format!(
            "Cannot set properties of {} (setting '{key}')",
            target.to_display()
        ))),
        Value::Object(o) => {
            lock(o).set(key, value);
            Ok(())
        }
        Value::Array(a) => {
            let mut items = lock(a);
            if key == "length" {
                let n = Thrown::check_array_length(value.to_number())?;
                items.resize(n, Value::Undefined);
            } else if let Some(i) = index_of_key(key) {
                if i >= items.len() {
                    let n = Thrown::check_array_length(i as f64 + 1.0)?;
                    items.resize(n, Value::Undefined);
                }
                items[i] = value;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn delete_property(target: &Value, key: &str) -> bool {
    match target {
        Value::Object(o) => lock(o).remove(key),
        Value::Array(a) => {
            if let Some(i) = index_of_key(key) {
                if let Some(slot) = lock(a).get_mut(i) {
                    *slot = Value::Undefined;
                }
            }
            true
        }
        _ => true,
    }
}

/// `key in target`
pub fn has_property(target: &Value, key: &str) -> Result<bool, Thrown> {
    match target {
        Value::Object(o) => Ok(lock(o).contains(key)),
        Value::Array(a) => Ok(key == "length" || index_of_key(key).is_some_and(|i| i < lock(a).len())),
        other => Err(Thrown::type_error(format!(
            "Cannot use 'in' operator to search for '{key}' in {}",
            other.to_display()
        ))),
    }
}

// ---------- 字符串方法 ----------

fn chars_of(s: &str) -> Vec<char> {
    s.chars().collect()
}

fn char_index_of(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(from.min(hay.len()));
    }
    (from..=hay.len().saturating_sub(needle.len())).find(|&i| hay[i..].starts_with(needle))
}

pub fn string_method(s: &str, method: &str, args: &[Value]) -> Option<BuiltinResult> {
    let chars = chars_of(s);
    let str_arg = |i: usize| arg(args, i).to_display();
    let out = match method {
        "toUpperCase" | "toLocaleUpperCase" => Value::Str(s.to_uppercase()),
        "toLowerCase" | "toLocaleLowerCase" => Value::Str(s.to_lowercase()),
        "trim" => Value::str(s.trim()),
        "trimStart" => Value::str(s.trim_start()),
        "trimEnd" => Value::str(s.trim_end()),
        "toString" | "valueOf" => Value::str(s),
        "includes" => Value::Bool(s.contains(&str_arg(0))),
        "startsWith" => {
            let from = num_arg(args, 1).map_or(0, |n| rel_index(n.max(0.0), chars.len()));
            Value::Bool(chars[from..].starts_with(&chars_of(&str_arg(0))))
        }
        "endsWith" => {
            let end = num_arg(args, 1).map_or(chars.len(), |n| rel_index(n.max(0.0), chars.len()));
            Value::Bool(chars[..end].ends_with(&chars_of(&str_arg(0))))
        }
        "indexOf" => {
            let from = num_arg(args, 1).map_or(0, |n| rel_index(n.max(0.0), chars.len()));
            Value::Number(char_index_of(&chars, &chars_of(&str_arg(0)), from).map_or(-1.0, |i| i as f64))
        }
        "lastIndexOf" => {
            let needle = chars_of(&str_arg(0));
            let found = (0..=chars.len().saturating_sub(needle.len()))
                .rev()
                .find(|&i| chars[i..].starts_with(&needle));
            Value::Number(found.map_or(-1.0, |i| i as f64))
        }
        "slice" => {
            let (start, end) = slice_bounds(args, chars.len());
            Value::Str(chars[start..end].iter().collect())
        }
        "substring" => {
            let clamp = |v: Option<f64>, default: usize| {
                v.map_or(default, |n| if n.is_nan() { 0 } else { n.max(0.0).min(chars.len() as f64) as usize })
            };
            let a = clamp(num_arg(args, 0), 0);
            let b = clamp(num_arg(args, 1), chars.len());
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            Value::Str(chars[lo..hi].iter().collect())
        }
        "substr" => {
            let start = num_arg(args, 0).map_or(0, |n| rel_index(n, chars.len()));
            let len = num_arg(args, 1).map_or(chars.len(), |n| n.max(0.0) as usize);
            Value::Str(chars[start..].iter().take(len).collect())
        }
        "charAt" => {
            let i = num_arg(args, 0).unwrap_or(0.0);
            Value::Str(
                (i >= 0.0)
                    .then(|| chars.get(i as usize))
                    .flatten()
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
            )
        }
        "charCodeAt" | "codePointAt" => {
            let i = num_arg(args, 0).unwrap_or(0.0);
            Value::Number(
                (i >= 0.0)
                    .then(|| chars.get(i as usize))
                    .flatten()
                    .map_or(f64::NAN, |c| f64::from(u32::from(*c))),
            )
        }
        "at" => {
            let i = num_arg(args, 0).unwrap_or(0.0).trunc();
            let idx = if i < 0.0 { chars.len() as f64 + i } else { i };
            if idx < 0.0 {
                Value::Undefined
            } else {
                chars.get(idx as usize).map_or(Value::Undefined, |c| Value::Str(c.to_string()))
            }
        }
        "split" => {
            let limit = num_arg(args, 1).map_or(usize::MAX, |n| n.max(0.0) as usize);
            let parts: Vec<Value> = match arg(args, 0) {
                Value::Undefined => vec![Value::str(s)],
                sep => {
                    let sep = sep.to_display();
                    if sep.is_empty() {
                        chars.iter().map(|c| Value::Str(c.to_string())).collect()
                    } else {
                        s.split(sep.as_str()).map(Value::str).collect()
                    }
                }
            };
            Value::array(parts.into_iter().take(limit).collect())
        }
        "replace" | "replaceAll" => {
            if args.get(1).is_some_and(Value::is_callable) {
                return None;
            }
            let pattern = str_arg(0);
            let replacement = str_arg(1);
            if method == "replace" {
                Value::Str(s.replacen(&pattern, &replacement, 1))
            } else {
                Value::Str(s.replace(&pattern, &replacement))
            }
        }
        "repeat" => {
            let n = num_arg(args, 0).unwrap_or(0.0);
            if n < 0.0 || !n.is_finite() {
                return Some(Err(Thrown::range_error("Invalid count value")));
            }
            let count = n as usize;
            if let Err(e) = Thrown::check_string_length(s.len().saturating_mul(count)) {
                return Some(Err(e));
            }
            Value::Str(s.repeat(count))
        }
        "padStart" | "padEnd" => {
            let target = num_arg(args, 0).unwrap_or(0.0).max(0.0) as usize;
            if let Err(e) = Thrown::check_string_length(target) {
                return Some(Err(e));
            }
            let fill = match arg(args, 1) {
                Value::Undefined => " ".to_string(),
                v => v.to_display(),
            };
            if target <= chars.len() || fill.is_empty() {
                Value::str(s)
            } else {
                let pad: String = fill.chars().cycle().take(target - chars.len()).collect();
                if method == "padStart" {
                    Value::Str(pad + s)
                } else {
                    Value::Str(format!("{s}{pad}"))
                }
            }
        }
        "concat" => {
            let joined = args.iter().fold(s.to_string(), |acc, v| acc + &v.to_display());
            if let Err(e) = Thrown::check_string_length(joined.len()) {
                return Some(Err(e));
            }
            Value::Str(joined)
        }
        "localeCompare" => {
            let other = str_arg(0);
            Value::Number(match s.cmp(other.as_str()) {
                std::cmp::Ordering::Less => -1.0,
                std::cmp::Ordering::Equal => 0.0,
                std::cmp::Ordering::Greater => 1.0,
            })
        }
        other => {
            return Some(Err(Thrown::type_error(format!(
                "\"{}\".{other} is not a function",
                s.chars().take(20).collect::<String>()
            ))))
        }
    };
    Some(Ok(out))
}

// ---------- 数字方法 ----------

fn to_radix(n: f64, radix: u32) -> String {
    if !n.is_finite() || n.fract() != 0.0 {
        return number_to_string(n);
    }
    let negative = n < 0.0;
    let mut v = n.abs() as u128;
    if v == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while v > 0 {
        let d = (v % u128::from(radix)) as u32;
        digits.push(char::from_digit(d, radix).unwrap_or('?'));
        v /= u128::from(radix);
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

fn group_thousands(int_part: &str) -> String {
    let (sign, digits) = int_part
        .strip_prefix('-')
        .map_or(("", int_part), |d| ("-", d));
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    format!("{sign}{out}")
}

pub fn number_method(n: f64, method: &str, args: &[Value]) -> Option<BuiltinResult> {
    let out = match method {
        "toFixed" => {
            let digits = num_arg(args, 0).unwrap_or(0.0).clamp(0.0, 100.0) as usize;
            if n.is_finite() {
                Value::Str(format!("{n:.digits$}"))
            } else {
                Value::Str(number_to_string(n))
            }
        }
        "toString" => {
            let radix = num_arg(args, 0).unwrap_or(10.0) as u32;
            if !(2..=36).contains(&radix) {
                return Some(Err(Thrown::Value(Value::error(
                    "RangeError",
                    "toString() radix must be between 2 and 36",
                ))));
            }
            Value::Str(if radix == 10 { number_to_string(n) } else { to_radix(n, radix) })
        }
        "toPrecision" => match num_arg(args, 0) {
            None => Value::Str(number_to_string(n)),
            Some(p) if n.is_finite() && n != 0.0 => {
                let p = p.clamp(1.0, 100.0) as i32;
                let magnitude = n.abs().log10().floor() as i32;
                let decimals = (p - 1 - magnitude).max(0) as usize;
                Value::Str(format!("{n:.decimals$}"))
            }
            Some(_) => Value::Str(number_to_string(n)),
        },
        "toLocaleString" => {
            if !n.is_finite() {
                Value::Str(number_to_string(n))
            } else {
                let rounded = (n * 1000.0).round() / 1000.0;
                let text = number_to_string(rounded);
                let (int_part, frac) = text.split_once('.').map_or((text.as_str(), None), |(a, b)| (a, Some(b)));
                let grouped = group_thousands(int_part);
                Value::Str(match frac {
                    Some(f) => format!("{grouped}.{f}"),
                    None => grouped,
                })
            }
        }
        "valueOf" => Value::Number(n),
        other => {
            return Some(Err(Thrown::type_error(format!(
                "{}.{other} is not a function",
                number_to_string(n)
            ))))
        }
    };
    Some(Ok(out))
}

// ---------- Date 方法 ----------

pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

fn parse_date(s: &str) -> f64 {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return dt.timestamp_millis() as f64;
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d
            .and_hms_opt(0, 0, 0)
            .map_or(f64::NAN, |dt| dt.and_utc().timestamp_millis() as f64);
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map_or(f64::NAN, |dt| dt.and_utc().timestamp_millis() as f64)
}

pub fn date_method(ms: f64, method: &str) -> Option<BuiltinResult> {
    use chrono::{Datelike, Timelike};

    if matches!(method, "getTime" | "valueOf") {
        return Some(Ok(Value::Number(ms)));
    }
    if matches!(method, "toISOString" | "toJSON" | "toString" | "toUTCString") {
        return Some(Ok(Value::Str(date_to_iso(ms))));
    }
    let Some(dt) = chrono::DateTime::from_timestamp_millis(ms as i64).filter(|_| ms.is_finite()) else {
        return Some(Ok(Value::Number(f64::NAN)));
    };
    let n = match method {
        "getFullYear" | "getUTCFullYear" => f64::from(dt.year()),
        "getMonth" | "getUTCMonth" => f64::from(dt.month0()),
        "getDate" | "getUTCDate" => f64::from(dt.day()),
        "getDay" | "getUTCDay" => f64::from(dt.weekday().num_days_from_sunday()),
        "getHours" | "getUTCHours" => f64::from(dt.hour()),
        "getMinutes" | "getUTCMinutes" => f64::from(dt.minute()),
        "getSeconds" | "getUTCSeconds" => f64::from(dt.second()),
        "getMilliseconds" | "getUTCMilliseconds" => f64::from(dt.timestamp_subsec_millis()),
        "toLocaleDateString" | "toDateString" => {
            return Some(Ok(Value::Str(dt.format("%Y-%m-%d").to_string())))
        }
        other => return Some(Err(Thrown::type_error(format!("Date.{other} is not a function")))),
    };
    Some(Ok(Value::Number(n)))
}

// ---------- 数组方法（无回调） ----------

pub fn default_sort_key(v: &Value) -> Option<String> {
    (!matches!(v, Value::Undefined)).then(|| v.to_display())
}

/// 已在展开路径上的数组不再展开，循环引用按元素原样保留
fn flatten_into(out: &mut Vec<Value>, items: &[Value], depth: f64, path: &mut Vec<ArrayRef>) -> Result<(), Thrown> {
    for item in items {
        match item {
            Value::Array(inner) if depth >= 1.0 && !path.iter().any(|p| Arc::ptr_eq(p, inner)) => {
                let nested = lock(inner).clone();
                path.push(inner.clone());
                flatten_into(out, &nested, depth - 1.0, path)?;
                path.pop();
            }
            other => {
                if out.len() >= MAX_ARRAY_LENGTH {
                    return Err(Thrown::range_error("Invalid array length"));
                }
                out.push(other.clone());
            }
        }
    }
    Ok(())
}

pub fn array_method(arr: &ArrayRef, method: &str, args: &[Value]) -> Option<BuiltinResult> {
    let out = match method {
        "push" => {
            let mut items = lock(arr);
            if let Err(e) = Thrown::check_array_length((items.len() + args.len()) as f64) {
                return Some(Err(e));
            }
            items.extend(args.iter().cloned());
            Value::Number(items.len() as f64)
        }
        "pop" => lock(arr).pop().unwrap_or_default(),
        "shift" => {
            let mut items = lock(arr);
            if items.is_empty() {
                Value::Undefined
            } else {
                items.remove(0)
            }
        }
        "unshift" => {
            let mut items = lock(arr);
            for (i, v) in args.iter().enumerate() {
                items.insert(i, v.clone());
            }
            Value::Number(items.len() as f64)
        }
        "slice" => {
            let items = lock(arr);
            let (start, end) = slice_bounds(args, items.len());
            Value::array(items[start..end].to_vec())
        }
        "splice" => {
            let mut items = lock(arr);
            let len = items.len();
            let start = num_arg(args, 0).map_or(0, |s| rel_index(s, len));
            let delete = match args.get(1) {
                None => len - start,
                Some(v) => (v.to_number().max(0.0) as usize).min(len - start),
            };
            let inserted: Vec<Value> = args.iter().skip(2).cloned().collect();
            let removed: Vec<Value> = items.splice(start..start + delete, inserted).collect();
            Value::array(removed)
        }
        "concat" => {
            let mut items = lock(arr).clone();
            for a in args {
                match a {
                    Value::Array(other) => {
                        let other = lock(other).clone();
                        if let Err(e) = Thrown::check_array_length((items.len() + other.len()) as f64) {
                            return Some(Err(e));
                        }
                        items.extend(other);
                    }
                    v => items.push(v.clone()),
                }
            }
            Value::array(items)
        }
        "join" => {
            let sep = match arg(args, 0) {
                Value::Undefined => ",".to_string(),
                v => v.to_display(),
            };
            let items = lock(arr).clone();
            let parts: Vec<String> = items
                .iter()
                .map(|v| if v.is_nullish() { String::new() } else { v.to_display() })
                .collect();
            let total = parts.iter().map(String::len).sum::<usize>()
                + sep.len().saturating_mul(parts.len().saturating_sub(1));
            if let Err(e) = Thrown::check_string_length(total) {
                return Some(Err(e));
            }
            Value::Str(parts.join(&sep))
        }
        "toString" => Value::Str(Value::Array(arr.clone()).to_display()),
        "includes" => {
            let needle = arg(args, 0);
            Value::Bool(lock(arr).iter().any(|v| same_value_zero(v, &needle)))
        }
        "indexOf" => {
            let needle = arg(args, 0);
            Value::Number(
                lock(arr)
                    .iter()
                    .position(|v| v.strict_eq(&needle))
                    .map_or(-1.0, |i| i as f64),
            )
        }
        "lastIndexOf" => {
            let needle = arg(args, 0);
            Value::Number(
                lock(arr)
                    .iter()
                    .rposition(|v| v.strict_eq(&needle))
                    .map_or(-1.0, |i| i as f64),
            )
        }
        "reverse" => {
            lock(arr).reverse();
            Value::Array(arr.clone())
        }
        "at" => {
            let items = lock(arr);
            let i = num_arg(args, 0).unwrap_or(0.0).trunc();
            let idx = if i < 0.0 { items.len() as f64 + i } else { i };
            if idx < 0.0 {
                Value::Undefined
            } else {
                items.get(idx as usize).cloned().unwrap_or_default()
            }
        }
        "flat" => {
            let depth = num_arg(args, 0).unwrap_or(1.0);
            let items = lock(arr).clone();
            let mut out = Vec::new();
            let mut path = vec![arr.clone()];
            if let Err(e) = flatten_into(&mut out, &items, depth, &mut path) {
                return Some(Err(e));
            }
            Value::array(out)
        }
        "fill" => {
            let mut items = lock(arr);
            let len = items.len();
            let value = arg(args, 0);
            let (start, end) = slice_bounds(&args[args.len().min(1)..], len);
            if let Value::Str(text) = &value {
                if let Err(e) = Thrown::check_string_length(text.len().saturating_mul(end - start)) {
                    return Some(Err(e));
                }
            }
            for slot in &mut items[start..end] {
                *slot = value.clone();
            }
            drop(items);
            Value::Array(arr.clone())
        }
        "sort" if args.first().map_or(true, |f| !f.is_callable()) => {
            let mut items = lock(arr);
            items.sort_by(|a, b| match (default_sort_key(a), default_sort_key(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });
            drop(items);
            Value::Array(arr.clone())
        }
        "keys" => Value::array((0..lock(arr).len()).map(|i| Value::Number(i as f64)).collect()),
        "values" => Value::array(lock(arr).clone()),
        "entries" => Value::array(
            lock(arr)
                .iter()
                .enumerate()
                .map(|(i, v)| Value::array(vec![Value::Number(i as f64), v.clone()]))
                .collect(),
        ),
        _ => return None,
    };
    Some(Ok(out))
}

/// 解释器负责的回调型数组方法
pub const CALLBACK_ARRAY_METHODS: &[&str] = &[
    "map", "filter", "forEach", "reduce", "reduceRight", "find", "findIndex", "findLast",
    "findLastIndex", "some", "every", "flatMap", "sort",
];
