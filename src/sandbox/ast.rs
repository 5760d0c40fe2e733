//! 脚本语法树

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Let,
    Const,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(Expr),
    Decl {
        kind: DeclKind,
        decls: Vec<(Pattern, Option<Expr>)>,
    },
    Function(Arc<FunctionDef>),
    If {
        test: Expr,
        cons: Box<Stmt>,
        alt: Option<Box<Stmt>>,
    },
    For {
        init: Option<Box<Stmt>>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    ForEach {
        kind: Option<DeclKind>,
        pattern: Pattern,
        iterable: Expr,
        /// true 为 for…in（遍历键），false 为 for…of（遍历值）
        keys: bool,
        body: Box<Stmt>,
    },
    While {
        test: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        test: Expr,
    },
    Block(Vec<Stmt>),
    Return(Option<Expr>),
    Break,
    Continue,
    Throw(Expr),
    Try {
        block: Vec<Stmt>,
        param: Option<Pattern>,
        handler: Option<Vec<Stmt>>,
        finalizer: Option<Vec<Stmt>>,
    },
    Empty,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Ident(String),
    Object {
        props: Vec<PatternProp>,
        rest: Option<String>,
    },
    Array {
        elems: Vec<Option<PatternElem>>,
        rest: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct PatternProp {
    pub key: String,
    pub value: Pattern,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct PatternElem {
    pub pattern: Pattern,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub pattern: Pattern,
    pub default: Option<Expr>,
    pub rest: bool,
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Block(Vec<Stmt>),
    Expr(Box<Expr>),
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<Param>,
    pub body: FunctionBody,
    pub is_async: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    BitNot,
    Typeof,
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    In,
    InstanceOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Binary(BinOp),
    Logical(LogicalOp),
}

#[derive(Debug, Clone)]
pub enum MemberProp {
    Named(String),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum ArrayElem {
    Item(Expr),
    Spread(Expr),
    Hole,
}

#[derive(Debug, Clone)]
pub enum PropKey {
    Named(String),
    Computed(Expr),
}

#[derive(Debug, Clone)]
pub enum ObjProp {
    KeyValue(PropKey, Expr),
    Spread(Expr),
}

#[derive(Debug, Clone)]
pub enum Arg {
    Item(Expr),
    Spread(Expr),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Num(f64),
    Str(String),
    Template {
        quasis: Vec<String>,
        exprs: Vec<Expr>,
    },
    Bool(bool),
    Null,
    Undefined,
    Ident(String),
    Array(Vec<ArrayElem>),
    Object(Vec<ObjProp>),
    Function(Arc<FunctionDef>),
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Update {
        increment: bool,
        prefix: bool,
        target: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    /// 解构赋值：[a, b] = ... / ({a} = ...)
    AssignPattern {
        pattern: Pattern,
        value: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        cons: Box<Expr>,
        alt: Box<Expr>,
    },
    Member {
        object: Box<Expr>,
        property: MemberProp,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
        optional: bool,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Arg>,
    },
    Await(Box<Expr>),
    Sequence(Vec<Expr>),
}
