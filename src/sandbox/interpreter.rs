//! 树遍历解释器
//!
//! 求值是递归的 BoxFuture：`await` 是真实的挂起点，能力调用在 tokio 上立即启动，
//! 因而 `Promise.all([...])` 中的调用会并发执行。解释器以 &self 运行，可变状态
//! （操作计数、console、调用日志、Promise 列表）全部是内部可变的。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::core::{RunError, StepFailure, CallScheduler};
use crate::sandbox::ast::*;
use crate::sandbox::builtins::{self, arg, BuiltinResult, CALLBACK_ARRAY_METHODS, GLOBAL_FUNCTIONS};
use crate::sandbox::console::ConsoleBuffer;
use crate::sandbox::value::{
    lock, AssignResult, Closure, Env, Namespace, PromiseCell, Thrown, Value,
};
use crate::tools::{AgentContext, ToolInvoker, ToolKind};

const MAX_CALL_DEPTH: usize = 100;
const YIELD_EVERY: u64 = 256;

pub type EvalResult<T> = Result<T, Thrown>;

/// 一次成功的能力调用（按完成顺序追加）
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub tool: String,
    pub kind: Option<ToolKind>,
    pub return_value: serde_json::Value,
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

#[derive(Clone, Copy)]
enum BindMode {
    Declare { mutable: bool },
    Assign,
}

pub struct Interpreter {
    invoker: Arc<ToolInvoker>,
    ctx: Arc<AgentContext>,
    scheduler: CallScheduler,
    globals: Arc<Env>,
    callables: HashSet<String>,
    console: ConsoleBuffer,
    call_log: Arc<Mutex<Vec<CallRecord>>>,
    promises: Mutex<Vec<Arc<PromiseCell>>>,
    ops: AtomicU64,
    max_ops: u64,
    depth: AtomicUsize,
    invocations: AtomicUsize,
    terminate_invoked: AtomicBool,
}

impl Interpreter {
    pub fn new(
        invoker: Arc<ToolInvoker>,
        ctx: AgentContext,
        scheduler: CallScheduler,
        globals: Arc<Env>,
        max_ops: u64,
    ) -> Self {
        let callables = invoker.registry().callable_names().into_iter().collect();
        Self {
            invoker,
            ctx: Arc::new(ctx),
            scheduler,
            globals,
            callables,
            console: ConsoleBuffer::new(),
            call_log: Arc::new(Mutex::new(Vec::new())),
            promises: Mutex::new(Vec::new()),
            ops: AtomicU64::new(0),
            max_ops,
            depth: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
            terminate_invoked: AtomicBool::new(false),
        }
    }

    pub fn console(&self) -> &ConsoleBuffer {
        &self.console
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.call_log).clone()
    }

    /// terminate 是否与其它能力调用同处一个脚本
    pub fn terminate_not_alone(&self) -> bool {
        self.terminate_invoked.load(Ordering::SeqCst) && self.invocations.load(Ordering::SeqCst) > 1
    }

    /// 执行整段脚本；顶层 return 的值作为结果
    pub async fn run_program(&self, program: &[Stmt]) -> EvalResult<Option<Value>> {
        match self.exec_block(program, &self.globals).await? {
            Flow::Return(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// 脚本结束后处理从未被 await 的 Promise：在宽限期内拒绝的写入输出，其余中止
    pub async fn settle_unobserved(&self, grace: Duration) -> Result<(), RunError> {
        let pending: Vec<Arc<PromiseCell>> = lock(&self.promises)
            .iter()
            .filter(|p| !p.is_observed())
            .cloned()
            .collect();
        let deadline = tokio::time::Instant::now() + grace;
        for cell in pending {
            match tokio::time::timeout_at(deadline, cell.resolve()).await {
                Ok(Ok(_)) => {}
                Ok(Err(Thrown::Fatal(e))) => return Err(e),
                Ok(Err(thrown)) => self
                    .console
                    .push_line(format!("UnhandledPromiseRejection: {}", thrown.describe())),
                Err(_) => cell.abort(),
            }
        }
        Ok(())
    }

    pub fn abort_all(&self) {
        for cell in lock(&self.promises).iter() {
            cell.abort();
        }
    }

    async fn tick(&self) -> EvalResult<()> {
        let n = self.ops.fetch_add(1, Ordering::Relaxed) + 1;
        if n > self.max_ops {
            return Err(Thrown::Abort(format!(
                "Script exceeded the maximum number of operations ({})",
                self.max_ops
            )));
        }
        if n % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn track(&self, cell: &Arc<PromiseCell>) {
        lock(&self.promises).push(cell.clone());
    }

    // ---------- 语句 ----------

    fn exec_block<'a>(&'a self, stmts: &'a [Stmt], env: &'a Arc<Env>) -> BoxFuture<'a, EvalResult<Flow>> {
        Box::pin(async move {
            for stmt in stmts {
                if let Stmt::Function(def) = stmt {
                    if let Some(name) = &def.name {
                        env.declare(name.clone(), self.closure(def, env), true);
                    }
                }
            }
            for stmt in stmts {
                match self.exec(stmt, env).await? {
                    Flow::Normal => {}
                    flow => return Ok(flow),
                }
            }
            Ok(Flow::Normal)
        })
    }

    fn exec<'a>(&'a self, stmt: &'a Stmt, env: &'a Arc<Env>) -> BoxFuture<'a, EvalResult<Flow>> {
        Box::pin(async move {
            self.tick().await?;
            match stmt {
                Stmt::Expr(e) => {
                    self.eval(e, env).await?;
                    Ok(Flow::Normal)
                }
                Stmt::Decl { kind, decls } => {
                    // 顶层声明进入跨步骤共享的全局表，一律可重新赋值；块内 const 仍不可变
                    let mutable = *kind != DeclKind::Const || Arc::ptr_eq(env, &self.globals);
                    for (pattern, init) in decls {
                        let value = match init {
                            Some(e) => self.eval(e, env).await?,
                            None => Value::Undefined,
                        };
                        self.bind(pattern, value, env, BindMode::Declare { mutable }).await?;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Function(_) | Stmt::Empty => Ok(Flow::Normal),
                Stmt::If { test, cons, alt } => {
                    if self.eval(test, env).await?.truthy() {
                        self.exec(cons, env).await
                    } else if let Some(alt) = alt {
                        self.exec(alt, env).await
                    } else {
                        Ok(Flow::Normal)
                    }
                }
                Stmt::For {
                    init,
                    test,
                    update,
                    body,
                } => {
                    let loop_env = Env::child(env);
                    if let Some(init) = init {
                        self.exec(init, &loop_env).await?;
                    }
                    loop {
                        self.tick().await?;
                        if let Some(test) = test {
                            if !self.eval(test, &loop_env).await?.truthy() {
                                break;
                            }
                        }
                        match self.exec(body, &loop_env).await? {
                            Flow::Break => break,
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                            Flow::Continue | Flow::Normal => {}
                        }
                        if let Some(update) = update {
                            self.eval(update, &loop_env).await?;
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::ForEach {
                    kind,
                    pattern,
                    iterable,
                    keys,
                    body,
                } => {
                    let source = self.eval(iterable, env).await?;
                    let items = if *keys {
                        builtins::own_keys(&source).into_iter().map(Value::Str).collect()
                    } else {
                        iterate(&source)?
                    };
                    for item in items {
                        self.tick().await?;
                        let iter_env = Env::child(env);
                        let mode = match kind {
                            Some(k) => BindMode::Declare {
                                mutable: *k != DeclKind::Const,
                            },
                            None => BindMode::Assign,
                        };
                        self.bind(pattern, item, &iter_env, mode).await?;
                        match self.exec(body, &iter_env).await? {
                            Flow::Break => break,
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                            Flow::Continue | Flow::Normal => {}
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::While { test, body } => {
                    while self.eval(test, env).await?.truthy() {
                        self.tick().await?;
                        match self.exec(body, env).await? {
                            Flow::Break => break,
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                            Flow::Continue | Flow::Normal => {}
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::DoWhile { body, test } => {
                    loop {
                        self.tick().await?;
                        match self.exec(body, env).await? {
                            Flow::Break => break,
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                            Flow::Continue | Flow::Normal => {}
                        }
                        if !self.eval(test, env).await?.truthy() {
                            break;
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Block(stmts) => {
                    let block_env = Env::child(env);
                    self.exec_block(stmts, &block_env).await
                }
                Stmt::Return(e) => {
                    let value = match e {
                        Some(e) => self.eval(e, env).await?,
                        None => Value::Undefined,
                    };
                    Ok(Flow::Return(value))
                }
                Stmt::Break => Ok(Flow::Break),
                Stmt::Continue => Ok(Flow::Continue),
                Stmt::Throw(e) => Err(Thrown::Value(self.eval(e, env).await?)),
                Stmt::Try {
                    block,
                    param,
                    handler,
                    finalizer,
                } => {
                    let try_env = Env::child(env);
                    let mut result = self.exec_block(block, &try_env).await;
                    let caught = match &result {
                        Err(thrown) if handler.is_some() => thrown.catchable(),
                        _ => None,
                    };
                    if let (Some(caught), Some(handler)) = (caught, handler) {
                        let catch_env = Env::child(env);
                        if let Some(param) = param {
                            self.bind(param, caught, &catch_env, BindMode::Declare { mutable: true })
                                .await?;
                        }
                        result = self.exec_block(handler, &catch_env).await;
                    }
                    if let Some(finalizer) = finalizer {
                        let finally_env = Env::child(env);
                        match self.exec_block(finalizer, &finally_env).await? {
                            Flow::Normal => {}
                            flow => return Ok(flow),
                        }
                    }
                    result
                }
            }
        })
    }

    // ---------- 绑定 ----------

    fn bind<'a>(
        &'a self,
        pattern: &'a Pattern,
        value: Value,
        env: &'a Arc<Env>,
        mode: BindMode,
    ) -> BoxFuture<'a, EvalResult<()>> {
        Box::pin(async move {
            match pattern {
                Pattern::Ident(name) => match mode {
                    BindMode::Declare { mutable } => {
                        env.declare(name.clone(), value, mutable);
                        Ok(())
                    }
                    BindMode::Assign => self.assign_ident(name, value, env),
                },
                Pattern::Object { props, rest } => {
                    if value.is_nullish() {
                        return Err(Thrown::type_error(format!(
                            "Cannot destructure '{}' as it is {}.",
                            value.to_display(),
                            value.to_display()
                        )));
                    }
                    for prop in props {
                        let mut v = builtins::get_property(&value, &prop.key)?;
                        if matches!(v, Value::Undefined) {
                            if let Some(default) = &prop.default {
                                v = self.eval(default, env).await?;
                            }
                        }
                        self.bind(&prop.value, v, env, mode).await?;
                    }
                    if let Some(rest) = rest {
                        let used: HashSet<&str> = props.iter().map(|p| p.key.as_str()).collect();
                        let remaining = match &value {
                            Value::Object(o) => lock(o)
                                .entries()
                                .into_iter()
                                .filter(|(k, _)| !used.contains(k.as_str()))
                                .collect(),
                            _ => Vec::new(),
                        };
                        self.bind(&Pattern::Ident(rest.clone()), Value::object(remaining), env, mode)
                            .await?;
                    }
                    Ok(())
                }
                Pattern::Array { elems, rest } => {
                    let items = iterate(&value)?;
                    for (i, elem) in elems.iter().enumerate() {
                        let Some(elem) = elem else { continue };
                        let mut v = items.get(i).cloned().unwrap_or_default();
                        if matches!(v, Value::Undefined) {
                            if let Some(default) = &elem.default {
                                v = self.eval(default, env).await?;
                            }
                        }
                        self.bind(&elem.pattern, v, env, mode).await?;
                    }
                    if let Some(rest) = rest {
                        let tail = items.get(elems.len()..).map(<[Value]>::to_vec).unwrap_or_default();
                        self.bind(&Pattern::Ident(rest.clone()), Value::array(tail), env, mode)
                            .await?;
                    }
                    Ok(())
                }
            }
        })
    }

    fn assign_ident(&self, name: &str, value: Value, env: &Arc<Env>) -> EvalResult<()> {
        match env.assign(name, value.clone()) {
            AssignResult::Assigned => Ok(()),
            AssignResult::Constant => Err(Thrown::type_error("Assignment to constant variable.")),
            // 未声明的赋值落到全局
            AssignResult::Missing => {
                self.globals.declare(name, value, true);
                Ok(())
            }
        }
    }

    fn closure(&self, def: &Arc<FunctionDef>, env: &Arc<Env>) -> Value {
        Value::Function(Arc::new(Closure {
            def: def.clone(),
            env: env.clone(),
        }))
    }

    fn lookup(&self, name: &str, env: &Arc<Env>) -> EvalResult<Value> {
        if let Some(v) = env.lookup(name) {
            return Ok(v);
        }
        if self.callables.contains(name) {
            return Ok(Value::Capability(name.to_string()));
        }
        if let Some(ns) = Namespace::from_name(name) {
            return Ok(Value::Namespace(ns));
        }
        if GLOBAL_FUNCTIONS.contains(&name) {
            return Ok(Value::Builtin(name.to_string()));
        }
        match name {
            "NaN" => Ok(Value::Number(f64::NAN)),
            "Infinity" => Ok(Value::Number(f64::INFINITY)),
            _ => Err(Thrown::reference_error(name)),
        }
    }

    // ---------- 表达式 ----------

    pub fn eval<'a>(&'a self, expr: &'a Expr, env: &'a Arc<Env>) -> BoxFuture<'a, EvalResult<Value>> {
        Box::pin(async move {
            match expr {
                Expr::Num(n) => Ok(Value::Number(*n)),
                Expr::Str(s) => Ok(Value::Str(s.clone())),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Null => Ok(Value::Null),
                Expr::Undefined => Ok(Value::Undefined),
                Expr::Template { quasis, exprs } => {
                    let mut out = String::new();
                    for (i, quasi) in quasis.iter().enumerate() {
                        out.push_str(quasi);
                        if let Some(e) = exprs.get(i) {
                            out.push_str(&self.eval(e, env).await?.to_display());
                            Thrown::check_string_length(out.len())?;
                        }
                    }
                    Ok(Value::Str(out))
                }
                Expr::Ident(name) => self.lookup(name, env),
                Expr::Array(elems) => {
                    let mut items = Vec::with_capacity(elems.len());
                    for elem in elems {
                        match elem {
                            ArrayElem::Item(e) => items.push(self.eval(e, env).await?),
                            ArrayElem::Spread(e) => {
                                let v = self.eval(e, env).await?;
                                let spread = iterate(&v)?;
                                Thrown::check_array_length((items.len() + spread.len()) as f64)?;
                                items.extend(spread);
                            }
                            ArrayElem::Hole => items.push(Value::Undefined),
                        }
                    }
                    Ok(Value::array(items))
                }
                Expr::Object(props) => {
                    let mut out = Vec::with_capacity(props.len());
                    for prop in props {
                        match prop {
                            ObjProp::KeyValue(key, value) => {
                                let key = match key {
                                    PropKey::Named(k) => k.clone(),
                                    PropKey::Computed(e) => self.eval(e, env).await?.to_display(),
                                };
                                let value = self.eval(value, env).await?;
                                out.retain(|(k, _): &(String, Value)| *k != key);
                                out.push((key, value));
                            }
                            ObjProp::Spread(e) => {
                                let v = self.eval(e, env).await?;
                                let entries = match &v {
                                    Value::Object(o) => lock(o).entries(),
                                    Value::Array(_) | Value::Str(_) => builtins::own_keys(&v)
                                        .into_iter()
                                        .map(|k| {
                                            let item = builtins::get_property(&v, &k).unwrap_or_default();
                                            (k, item)
                                        })
                                        .collect(),
                                    _ => Vec::new(),
                                };
                                for (k, item) in entries {
                                    out.retain(|(existing, _): &(String, Value)| *existing != k);
                                    out.push((k, item));
                                }
                            }
                        }
                    }
                    Ok(Value::object(out))
                }
                Expr::Function(def) => Ok(self.closure(def, env)),
                Expr::Unary { op, arg } => {
                    if *op == UnaryOp::Typeof {
                        if let Expr::Ident(name) = &**arg {
                            return Ok(Value::str(
                                self.lookup(name, env).map_or("undefined", |v| v.type_of()),
                            ));
                        }
                    }
                    let v = self.eval(arg, env).await?;
                    Ok(match op {
                        UnaryOp::Not => Value::Bool(!v.truthy()),
                        UnaryOp::Neg => Value::Number(-v.to_number()),
                        UnaryOp::Plus => Value::Number(v.to_number()),
                        UnaryOp::BitNot => Value::Number(f64::from(!to_int32(v.to_number()))),
                        UnaryOp::Typeof => Value::str(v.type_of()),
                        UnaryOp::Void => Value::Undefined,
                    })
                }
                Expr::Update {
                    increment,
                    prefix,
                    target,
                } => {
                    let old = self.eval(target, env).await?.to_number();
                    let new = if *increment { old + 1.0 } else { old - 1.0 };
                    self.write_target(target, Value::Number(new), env).await?;
                    Ok(Value::Number(if *prefix { new } else { old }))
                }
                Expr::Binary { op, left, right } => {
                    let l = self.eval(left, env).await?;
                    let r = self.eval(right, env).await?;
                    binary_op(*op, &l, &r)
                }
                Expr::Logical { op, left, right } => {
                    let l = self.eval(left, env).await?;
                    let take_left = match op {
                        LogicalOp::And => !l.truthy(),
                        LogicalOp::Or => l.truthy(),
                        LogicalOp::Nullish => !l.is_nullish(),
                    };
                    if take_left {
                        Ok(l)
                    } else {
                        self.eval(right, env).await
                    }
                }
                Expr::Assign { op, target, value } => match op {
                    AssignOp::Assign => {
                        let v = self.eval(value, env).await?;
                        self.write_target(target, v.clone(), env).await?;
                        Ok(v)
                    }
                    AssignOp::Binary(bin) => {
                        let current = self.eval(target, env).await?;
                        let rhs = self.eval(value, env).await?;
                        let v = binary_op(*bin, &current, &rhs)?;
                        self.write_target(target, v.clone(), env).await?;
                        Ok(v)
                    }
                    AssignOp::Logical(logical) => {
                        let current = self.eval(target, env).await?;
                        let keep = match logical {
                            LogicalOp::And => !current.truthy(),
                            LogicalOp::Or => current.truthy(),
                            LogicalOp::Nullish => !current.is_nullish(),
                        };
                        if keep {
                            return Ok(current);
                        }
                        let v = self.eval(value, env).await?;
                        self.write_target(target, v.clone(), env).await?;
                        Ok(v)
                    }
                },
                Expr::AssignPattern { pattern, value } => {
                    let v = self.eval(value, env).await?;
                    self.bind(pattern, v.clone(), env, BindMode::Assign).await?;
                    Ok(v)
                }
                Expr::Conditional { test, cons, alt } => {
                    if self.eval(test, env).await?.truthy() {
                        self.eval(cons, env).await
                    } else {
                        self.eval(alt, env).await
                    }
                }
                Expr::Member { .. } | Expr::Call { .. } => {
                    Ok(self.eval_chain(expr, env).await?.unwrap_or_default())
                }
                Expr::New { callee, args } => {
                    let callee = self.eval(callee, env).await?;
                    let args = self.eval_args(args, env).await?;
                    match callee {
                        Value::Namespace(Namespace::Promise) => Err(Thrown::type_error(
                            "Promise constructor is not supported; use async functions instead",
                        )),
                        Value::Namespace(ns) => builtins::construct(ns, &args),
                        Value::Function(c) => {
                            let out = self.call_closure(c, args).await?;
                            Ok(match out {
                                v @ (Value::Object(_) | Value::Array(_)) => v,
                                _ => Value::object(Vec::new()),
                            })
                        }
                        other => Err(Thrown::type_error(format!(
                            "{} is not a constructor",
                            other.to_display()
                        ))),
                    }
                }
                Expr::Await(inner) => {
                    let v = self.eval(inner, env).await?;
                    self.await_value(v).await
                }
                Expr::Sequence(items) => {
                    let mut last = Value::Undefined;
                    for e in items {
                        last = self.eval(e, env).await?;
                    }
                    Ok(last)
                }
            }
        })
    }

    async fn await_value(&self, v: Value) -> EvalResult<Value> {
        match v {
            Value::Promise(p) => p.resolve().await,
            other => Ok(other),
        }
    }

    async fn member_key(&self, prop: &MemberProp, env: &Arc<Env>) -> EvalResult<String> {
        Ok(match prop {
            MemberProp::Named(name) => name.clone(),
            MemberProp::Computed(e) => self.eval(e, env).await?.to_display(),
        })
    }

    /// 可选链求值：None 表示链被 `?.` 短路
    fn eval_chain<'a>(&'a self, expr: &'a Expr, env: &'a Arc<Env>) -> BoxFuture<'a, EvalResult<Option<Value>>> {
        Box::pin(async move {
            match expr {
                Expr::Member {
                    object,
                    property,
                    optional,
                } => {
                    let Some(obj) = self.eval_chain(object, env).await? else {
                        return Ok(None);
                    };
                    if *optional && obj.is_nullish() {
                        return Ok(None);
                    }
                    let key = self.member_key(property, env).await?;
                    Ok(Some(builtins::get_property(&obj, &key)?))
                }
                Expr::Call {
                    callee,
                    args,
                    optional,
                } => {
                    if let Expr::Member {
                        object,
                        property,
                        optional: member_optional,
                    } = &**callee
                    {
                        let Some(obj) = self.eval_chain(object, env).await? else {
                            return Ok(None);
                        };
                        if *member_optional && obj.is_nullish() {
                            return Ok(None);
                        }
                        let key = self.member_key(property, env).await?;
                        if *optional {
                            let own = match &obj {
                                Value::Object(o) => Some(lock(o).get(&key).unwrap_or_default()),
                                Value::Undefined | Value::Null => Some(Value::Undefined),
                                _ => None,
                            };
                            if own.is_some_and(|v| v.is_nullish()) {
                                return Ok(None);
                            }
                        }
                        let args = self.eval_args(args, env).await?;
                        return Ok(Some(self.call_method(obj, &key, args).await?));
                    }
                    let Some(f) = self.eval_chain(callee, env).await? else {
                        return Ok(None);
                    };
                    if *optional && f.is_nullish() {
                        return Ok(None);
                    }
                    let args = self.eval_args(args, env).await?;
                    Ok(Some(self.call_value(f, args).await?))
                }
                other => Ok(Some(self.eval(other, env).await?)),
            }
        })
    }

    async fn eval_args(&self, args: &[Arg], env: &Arc<Env>) -> EvalResult<Vec<Value>> {
        let mut out = Vec::with_capacity(args.len());
        for a in args {
            match a {
                Arg::Item(e) => out.push(self.eval(e, env).await?),
                Arg::Spread(e) => {
                    let v = self.eval(e, env).await?;
                    out.extend(iterate(&v)?);
                }
            }
        }
        Ok(out)
    }

    async fn write_target(&self, target: &Expr, value: Value, env: &Arc<Env>) -> EvalResult<()> {
        match target {
            Expr::Ident(name) => self.assign_ident(name, value, env),
            Expr::Member {
                object, property, ..
            } => {
                let obj = self.eval(object, env).await?;
                let key = self.member_key(property, env).await?;
                builtins::set_property(&obj, &key, value)
            }
            _ => Err(Thrown::Value(Value::error(
                "SyntaxError",
                "Invalid left-hand side in assignment",
            ))),
        }
    }

    // ---------- 调用 ----------

    fn call_value(&self, f: Value, args: Vec<Value>) -> BoxFuture<'_, EvalResult<Value>> {
        Box::pin(async move {
            self.tick().await?;
            match f {
                Value::Function(c) => self.call_closure(c, args).await,
                Value::Capability(name) => self.call_capability(&name, args),
                Value::Namespace(ns) => builtins::call_namespace_as_function(ns, &args),
                Value::Builtin(name) => match name.split_once('.') {
                    Some((ns, method)) => match Namespace::from_name(ns) {
                        Some(ns) => self.call_method(Value::Namespace(ns), method, args).await,
                        None => Err(Thrown::type_error(format!("{name} is not a function"))),
                    },
                    None => builtins::call_global(&name, &args),
                },
                other => Err(Thrown::type_error(format!(
                    "{} is not a function",
                    other.inspect()
                ))),
            }
        })
    }

    fn call_closure(&self, c: Arc<Closure>, args: Vec<Value>) -> BoxFuture<'_, EvalResult<Value>> {
        Box::pin(async move {
            if self.depth.fetch_add(1, Ordering::SeqCst) >= MAX_CALL_DEPTH {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                return Err(Thrown::Value(Value::error(
                    "RangeError",
                    "Maximum call stack size exceeded",
                )));
            }
            let result = self.invoke_closure(&c, args).await;
            self.depth.fetch_sub(1, Ordering::SeqCst);

            if !c.def.is_async {
                return result;
            }
            // async 函数：结果包装成已完成的 Promise
            match result {
                Ok(v @ Value::Promise(_)) => Ok(v),
                Ok(v) => Ok(Value::Promise(PromiseCell::settled(Ok(v)))),
                Err(e @ (Thrown::Value(_) | Thrown::Agent(_))) => {
                    let cell = PromiseCell::settled(Err(e));
                    self.track(&cell);
                    Ok(Value::Promise(cell))
                }
                Err(e) => Err(e),
            }
        })
    }

    async fn invoke_closure(&self, c: &Closure, args: Vec<Value>) -> EvalResult<Value> {
        let env = Env::child(&c.env);
        for (i, param) in c.def.params.iter().enumerate() {
            let value = if param.rest {
                Value::array(args.get(i..).map(<[Value]>::to_vec).unwrap_or_default())
            } else {
                let mut v = args.get(i).cloned().unwrap_or_default();
                if matches!(v, Value::Undefined) {
                    if let Some(default) = &param.default {
                        v = self.eval(default, &env).await?;
                    }
                }
                v
            };
            self.bind(&param.pattern, value, &env, BindMode::Declare { mutable: true })
                .await?;
        }
        match &c.def.body {
            FunctionBody::Block(stmts) => match self.exec_block(stmts, &env).await? {
                Flow::Return(v) => Ok(v),
                _ => Ok(Value::Undefined),
            },
            FunctionBody::Expr(e) => self.eval(e, &env).await,
        }
    }

    /// 能力调用：在 tokio 上立即启动，返回 Promise；成功时按完成顺序写入调用日志
    fn call_capability(&self, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        let input = match args.first() {
            None | Some(Value::Undefined) => serde_json::json!({}),
            Some(v) => v.to_json(),
        };
        let kind = self.invoker.registry().kind_of(name);
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if kind == Some(ToolKind::Terminate) {
            self.terminate_invoked.store(true, Ordering::SeqCst);
        }

        let invoker = self.invoker.clone();
        let ctx = self.ctx.clone();
        let scheduler = self.scheduler.clone();
        let call_log = self.call_log.clone();
        let tool = name.to_string();
        let handle = tokio::spawn(async move {
            let _permit = match scheduler.acquire().await {
                Ok(permit) => permit,
                Err(e) => return Err(Thrown::Fatal(e)),
            };
            match invoker.invoke(&tool, input, &ctx).await {
                Ok(out) => {
                    let value = Value::from_json(&out);
                    lock(&call_log).push(CallRecord {
                        tool,
                        kind,
                        return_value: out,
                    });
                    Ok(value)
                }
                Err(StepFailure::Recoverable(e)) => Err(Thrown::Agent(e)),
                Err(StepFailure::Fatal(e)) => Err(Thrown::Fatal(e)),
            }
        });
        let cell = PromiseCell::pending(name, handle);
        self.track(&cell);
        Ok(Value::Promise(cell))
    }

    fn call_method(&self, obj: Value, key: &str, args: Vec<Value>) -> BoxFuture<'_, EvalResult<Value>> {
        let key = key.to_string();
        Box::pin(async move {
            match &obj {
                Value::Undefined | Value::Null => Err(Thrown::type_error(format!(
                    "Cannot read properties of {} (reading '{key}')",
                    obj.to_display()
                ))),
                Value::Object(o) => {
                    let prop = lock(o).get(&key);
                    match prop {
                        Some(f) if f.is_callable() => self.call_value(f, args).await,
                        Some(v) if !matches!(v, Value::Undefined) => Err(Thrown::type_error(format!(
                            "{key} is not a function"
                        ))),
                        _ => match key.as_str() {
                            "hasOwnProperty" => {
                                let k = arg(&args, 0).to_display();
                                Ok(Value::Bool(lock(o).contains(&k)))
                            }
                            "toString" => Ok(Value::str(obj.to_display())),
                            _ => Err(Thrown::type_error(format!("obj.{key} is not a function"))),
                        },
                    }
                }
                Value::Array(a) => {
                    if CALLBACK_ARRAY_METHODS.contains(&key.as_str())
                        && !(key == "sort" && args.first().map_or(true, |f| !f.is_callable()))
                    {
                        return self.array_callback(a, &key, args).await;
                    }
                    builtins::array_method(a, &key, &args).unwrap_or_else(|| {
                        Err(Thrown::type_error(format!("array.{key} is not a function")))
                    })
                }
                Value::Str(s) => {
                    if let Some(r) = builtins::string_method(s, &key, &args) {
                        return r;
                    }
                    self.replace_with_callback(s, &key, args).await
                }
                Value::Number(n) => builtins::number_method(*n, &key, &args).unwrap_or_else(|| {
                    Err(Thrown::type_error(format!("number.{key} is not a function")))
                }),
                Value::Bool(b) => match key.as_str() {
                    "toString" => Ok(Value::Str(b.to_string())),
                    "valueOf" => Ok(Value::Bool(*b)),
                    _ => Err(Thrown::type_error(format!("boolean.{key} is not a function"))),
                },
                Value::Date(ms) => builtins::date_method(*ms, &key).unwrap_or_else(|| {
                    Err(Thrown::type_error(format!("date.{key} is not a function")))
                }),
                Value::Namespace(ns) => self.call_namespace(*ns, &key, args).await,
                Value::Promise(p) => self.promise_method(p.clone(), &key, args).await,
                Value::Function(_) | Value::Builtin(_) | Value::Capability(_) => match key.as_str() {
                    "call" => self.call_value(obj.clone(), args.into_iter().skip(1).collect()).await,
                    "apply" => {
                        let list = iterate(&arg(&args, 1)).unwrap_or_default();
                        self.call_value(obj.clone(), list).await
                    }
                    "bind" => Ok(obj.clone()),
                    "toString" => Ok(Value::str(obj.to_display())),
                    _ => Err(Thrown::type_error(format!("{key} is not a function"))),
                },
            }
        })
    }

    async fn call_namespace(&self, ns: Namespace, method: &str, args: Vec<Value>) -> EvalResult<Value> {
        match ns {
            Namespace::Console => match method {
                "log" | "info" | "warn" | "error" | "debug" | "trace" | "table" | "dir" => {
                    self.console.log(&args);
                    Ok(Value::Undefined)
                }
                other => Err(Thrown::type_error(format!("console.{other} is not a function"))),
            },
            Namespace::Promise => self.promise_static(method, args).await,
            Namespace::Array if method == "from" => {
                let Value::Array(items) = builtins::array_from(&arg(&args, 0))? else {
                    return Ok(Value::array(Vec::new()));
                };
                self.array_callback(&items, "map", args.into_iter().skip(1).collect())
                    .await
            }
            _ => builtins::call_namespace(ns, method, &args).unwrap_or_else(|| {
                Err(Thrown::type_error(format!("{}.{method} is not a function", ns.name())))
            }),
        }
    }

    // ---------- Promise ----------

    fn rejected(&self, reason: Thrown) -> Value {
        let cell = PromiseCell::settled(Err(reason));
        self.track(&cell);
        Value::Promise(cell)
    }

    async fn promise_static(&self, method: &str, args: Vec<Value>) -> EvalResult<Value> {
        let items = || iterate(&arg(&args, 0));
        match method {
            "resolve" => Ok(match arg(&args, 0) {
                v @ Value::Promise(_) => v,
                v => Value::Promise(PromiseCell::settled(Ok(v))),
            }),
            "reject" => Ok(self.rejected(Thrown::Value(arg(&args, 0)))),
            "all" => {
                let items = items()?;
                for item in &items {
                    if let Value::Promise(p) = item {
                        p.mark_observed();
                    }
                }
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match self.await_value(item).await {
                        Ok(v) => out.push(v),
                        Err(e @ (Thrown::Fatal(_) | Thrown::Abort(_))) => return Err(e),
                        Err(e) => return Ok(self.rejected(e)),
                    }
                }
                Ok(Value::Promise(PromiseCell::settled(Ok(Value::array(out)))))
            }
            "allSettled" => {
                let mut out = Vec::new();
                for item in items()? {
                    let entry = match self.await_value(item).await {
                        Ok(v) => vec![("status".into(), Value::str("fulfilled")), ("value".into(), v)],
                        Err(e) => match e.catchable() {
                            Some(reason) => {
                                vec![("status".into(), Value::str("rejected")), ("reason".into(), reason)]
                            }
                            None => return Err(e),
                        },
                    };
                    out.push(Value::object(entry));
                }
                Ok(Value::Promise(PromiseCell::settled(Ok(Value::array(out)))))
            }
            "race" | "any" => {
                let items = items()?;
                let cells: Vec<Arc<PromiseCell>> = items
                    .iter()
                    .filter_map(|v| match v {
                        Value::Promise(p) => Some(p.clone()),
                        _ => None,
                    })
                    .collect();
                if let Some(plain) = items.iter().find(|v| !matches!(v, Value::Promise(_))) {
                    return Ok(Value::Promise(PromiseCell::settled(Ok(plain.clone()))));
                }
                if cells.is_empty() {
                    return Ok(Value::Promise(PromiseCell::settled(Ok(Value::Undefined))));
                }
                for c in &cells {
                    c.mark_observed();
                }
                let futures = cells.iter().map(|c| Box::pin(c.resolve()));
                let (first, _, _) = futures_util::future::select_all(futures).await;
                Ok(match first {
                    Ok(v) => Value::Promise(PromiseCell::settled(Ok(v))),
                    Err(e @ (Thrown::Fatal(_) | Thrown::Abort(_))) => return Err(e),
                    Err(e) => self.rejected(e),
                })
            }
            other => Err(Thrown::type_error(format!("Promise.{other} is not a function"))),
        }
    }

    async fn promise_method(&self, p: Arc<PromiseCell>, method: &str, args: Vec<Value>) -> EvalResult<Value> {
        let outcome = p.resolve().await;
        let (on_ok, on_err) = match method {
            "then" => (arg(&args, 0), arg(&args, 1)),
            "catch" => (Value::Undefined, arg(&args, 0)),
            "finally" => {
                let f = arg(&args, 0);
                if f.is_callable() {
                    let v = self.call_value(f, Vec::new()).await?;
                    self.await_value(v).await?;
                }
                return Ok(Value::Promise(p));
            }
            other => return Err(Thrown::type_error(format!("promise.{other} is not a function"))),
        };
        let next = match outcome {
            Ok(v) if on_ok.is_callable() => self.call_value(on_ok, vec![v]).await,
            Ok(v) => Ok(v),
            Err(e) => match e.catchable() {
                Some(reason) if on_err.is_callable() => self.call_value(on_err, vec![reason]).await,
                _ => Err(e),
            },
        };
        match next {
            Ok(v) => match self.await_value(v).await {
                Ok(v) => Ok(Value::Promise(PromiseCell::settled(Ok(v)))),
                Err(e) => self.reject_or_raise(e),
            },
            Err(e) => self.reject_or_raise(e),
        }
    }

    fn reject_or_raise(&self, e: Thrown) -> EvalResult<Value> {
        match e {
            Thrown::Fatal(_) | Thrown::Abort(_) => Err(e),
            e => Ok(self.rejected(e)),
        }
    }

    // ---------- 回调型方法 ----------

    async fn array_callback(
        &self,
        arr: &crate::sandbox::value::ArrayRef,
        method: &str,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        let f = arg(&args, 0);
        if !f.is_callable() {
            return Err(Thrown::type_error(format!("{} is not a function", f.inspect())));
        }
        let items = lock(arr).clone();
        let this = Value::Array(arr.clone());
        let call = |v: Value, i: usize| {
            self.call_value(f.clone(), vec![v, Value::Number(i as f64), this.clone()])
        };
        match method {
            "map" => {
                let mut out = Vec::with_capacity(items.len());
                for (i, v) in items.into_iter().enumerate() {
                    out.push(call(v, i).await?);
                }
                Ok(Value::array(out))
            }
            "flatMap" => {
                let mut out = Vec::new();
                for (i, v) in items.into_iter().enumerate() {
                    match call(v, i).await? {
                        Value::Array(inner) => out.extend(lock(&inner).clone()),
                        other => out.push(other),
                    }
                }
                Ok(Value::array(out))
            }
            "filter" => {
                let mut out = Vec::new();
                for (i, v) in items.into_iter().enumerate() {
                    if call(v.clone(), i).await?.truthy() {
                        out.push(v);
                    }
                }
                Ok(Value::array(out))
            }
            "forEach" => {
                for (i, v) in items.into_iter().enumerate() {
                    call(v, i).await?;
                }
                Ok(Value::Undefined)
            }
            "find" | "findIndex" => {
                for (i, v) in items.into_iter().enumerate() {
                    if call(v.clone(), i).await?.truthy() {
                        return Ok(if method == "find" { v } else { Value::Number(i as f64) });
                    }
                }
                Ok(if method == "find" { Value::Undefined } else { Value::Number(-1.0) })
            }
            "findLast" | "findLastIndex" => {
                for (i, v) in items.into_iter().enumerate().rev() {
                    if call(v.clone(), i).await?.truthy() {
                        return Ok(if method == "findLast" { v } else { Value::Number(i as f64) });
                    }
                }
                Ok(if method == "findLast" { Value::Undefined } else { Value::Number(-1.0) })
            }
            "some" => {
                for (i, v) in items.into_iter().enumerate() {
                    if call(v, i).await?.truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            "every" => {
                for (i, v) in items.into_iter().enumerate() {
                    if !call(v, i).await?.truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "reduce" | "reduceRight" => {
                let mut indexed: Vec<(usize, Value)> = items.into_iter().enumerate().collect();
                if method == "reduceRight" {
                    indexed.reverse();
                }
                let mut iter = indexed.into_iter();
                let mut acc = match args.get(1) {
                    Some(init) => init.clone(),
                    None => match iter.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(Thrown::type_error(
                                "Reduce of empty array with no initial value",
                            ))
                        }
                    },
                };
                for (i, v) in iter {
                    acc = self
                        .call_value(f.clone(), vec![acc, v, Value::Number(i as f64), this.clone()])
                        .await?;
                }
                Ok(acc)
            }
            "sort" => {
                let sorted = self.merge_sort(items, &f).await?;
                *lock(arr) = sorted;
                Ok(this)
            }
            other => Err(Thrown::type_error(format!("array.{other} is not a function"))),
        }
    }

    /// 自底向上归并排序，比较函数是脚本回调（稳定排序）
    async fn merge_sort(&self, mut items: Vec<Value>, cmp: &Value) -> EvalResult<Vec<Value>> {
        let n = items.len();
        let mut width = 1;
        while width < n {
            let mut merged = Vec::with_capacity(n);
            let mut start = 0;
            while start < n {
                let mid = (start + width).min(n);
                let end = (start + 2 * width).min(n);
                let (mut i, mut j) = (start, mid);
                while i < mid && j < end {
                    let order = self
                        .call_value(cmp.clone(), vec![items[j].clone(), items[i].clone()])
                        .await?
                        .to_number();
                    // items[j] 严格小于 items[i] 时才先取右侧，保持稳定
                    if order < 0.0 {
                        merged.push(items[j].clone());
                        j += 1;
                    } else {
                        merged.push(items[i].clone());
                        i += 1;
                    }
                }
                merged.extend_from_slice(&items[i..mid]);
                merged.extend_from_slice(&items[j..end]);
                start = end;
            }
            items = merged;
            width *= 2;
        }
        Ok(items)
    }

    async fn replace_with_callback(&self, s: &str, method: &str, args: Vec<Value>) -> EvalResult<Value> {
        let pattern = arg(&args, 0).to_display();
        let f = arg(&args, 1);
        let mut out = String::new();
        let mut rest = s;
        let mut offset = 0;
        loop {
            let Some(pos) = rest.find(&pattern).filter(|_| !pattern.is_empty()) else {
                break;
            };
            out.push_str(&rest[..pos]);
            let replacement = self
                .call_value(
                    f.clone(),
                    vec![
                        Value::str(pattern.clone()),
                        Value::Number(s[..offset + pos].chars().count() as f64),
                        Value::str(s),
                    ],
                )
                .await?;
            out.push_str(&replacement.to_display());
            rest = &rest[pos + pattern.len()..];
            offset += pos + pattern.len();
            if method == "replace" {
                break;
            }
        }
        out.push_str(rest);
        Ok(Value::Str(out))
    }
}

/// 可迭代值展开为数组
fn iterate(v: &Value) -> EvalResult<Vec<Value>> {
    match v {
        Value::Array(a) => Ok(lock(a).clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        other => Err(Thrown::type_error(format!(
            "{} is not iterable",
            other.inspect()
        ))),
    }
}

fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64 as u64 & 0xFFFF_FFFF) as u32 as i32
}

fn binary_op(op: BinOp, l: &Value, r: &Value) -> BuiltinResult {
    let num = |f: fn(f64, f64) -> f64| Ok(Value::Number(f(l.to_number(), r.to_number())));
    let int = |f: fn(i32, i32) -> i32| {
        Ok(Value::Number(f64::from(f(to_int32(l.to_number()), to_int32(r.to_number())))))
    };
    let compare = |f: fn(std::cmp::Ordering) -> bool| {
        let ordering = match (l, r) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => l.to_number().partial_cmp(&r.to_number()),
        };
        Ok(Value::Bool(ordering.is_some_and(f)))
    };
    match op {
        BinOp::Add => {
            let is_text = |v: &Value| {
                matches!(
                    v,
                    Value::Str(_) | Value::Array(_) | Value::Object(_) | Value::Date(_)
                )
            };
            if is_text(l) || is_text(r) {
                let text = l.to_display() + &r.to_display();
                Thrown::check_string_length(text.len())?;
                Ok(Value::Str(text))
            } else {
                num(|a, b| a + b)
            }
        }
        BinOp::Sub => num(|a, b| a - b),
        BinOp::Mul => num(|a, b| a * b),
        BinOp::Div => num(|a, b| a / b),
        BinOp::Mod => num(|a, b| a % b),
        BinOp::Pow => num(f64::powf),
        BinOp::Eq => Ok(Value::Bool(l.loose_eq(r))),
        BinOp::NotEq => Ok(Value::Bool(!l.loose_eq(r))),
        BinOp::StrictEq => Ok(Value::Bool(l.strict_eq(r))),
        BinOp::StrictNotEq => Ok(Value::Bool(!l.strict_eq(r))),
        BinOp::Lt => compare(|o| o.is_lt()),
        BinOp::Gt => compare(|o| o.is_gt()),
        BinOp::LtEq => compare(|o| o.is_le()),
        BinOp::GtEq => compare(|o| o.is_ge()),
        BinOp::BitAnd => int(|a, b| a & b),
        BinOp::BitOr => int(|a, b| a | b),
        BinOp::BitXor => int(|a, b| a ^ b),
        BinOp::Shl => int(|a, b| a.wrapping_shl(b as u32 & 31)),
        BinOp::Shr => int(|a, b| a.wrapping_shr(b as u32 & 31)),
        BinOp::UShr => {
            let a = to_int32(l.to_number()) as u32;
            let b = to_int32(r.to_number()) as u32 & 31;
            Ok(Value::Number(f64::from(a >> b)))
        }
        BinOp::In => Ok(Value::Bool(builtins::has_property(r, &l.to_display())?)),
        BinOp::InstanceOf => Ok(Value::Bool(match r {
            Value::Namespace(Namespace::Array) => matches!(l, Value::Array(_)),
            Value::Namespace(Namespace::Object) => {
                matches!(l, Value::Object(_) | Value::Array(_) | Value::Date(_))
            }
            Value::Namespace(Namespace::Date) => matches!(l, Value::Date(_)),
            Value::Namespace(Namespace::Promise) => matches!(l, Value::Promise(_)),
            Value::Namespace(Namespace::Error) => match l {
                Value::Object(o) => {
                    matches!(lock(o).get("name"), Some(Value::Str(n)) if n.ends_with("Error"))
                }
                _ => false,
            },
            Value::Function(_) | Value::Namespace(_) => false,
            other => {
                return Err(Thrown::type_error(format!(
                    "Right-hand side of 'instanceof' is not callable: {}",
                    other.inspect()
                )))
            }
        })),
    }
}
