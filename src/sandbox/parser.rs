//! 语法分析：Token 序列 → 语法树
//!
//! 递归下降 + 优先级爬升。分号可省略（遇到无法继续的 token 即结束语句）；
//! `return` 后紧跟换行时视为无返回值，后缀 `++/--` 前不能换行。

use std::fmt;
use std::sync::Arc;

use crate::sandbox::ast::*;
use crate::sandbox::lexer::{tokenize, LexError, Tok, Token};

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyntaxError: {} (line {})", self.message, self.line)
    }
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        Self {
            message: e.message,
            line: e.line,
        }
    }
}

type PResult<T> = Result<T, ParseError>;

/// 语句、表达式与成员/运算链的最大嵌套层数；更深的输入报 SyntaxError 而不是耗尽栈
const MAX_NESTING: usize = 100;

const RESERVED: &[&str] = &[
    "break", "case", "catch", "const", "continue", "default", "do", "else", "finally", "for",
    "if", "let", "return", "switch", "throw", "try", "var", "while", "class", "import", "export",
];

pub fn parse_program(src: &str) -> PResult<Vec<Stmt>> {
    let mut parser = Parser::new(tokenize(src)?);
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(body)
}

/// 解析单个表达式（模板字符串插值使用）
pub fn parse_expression(src: &str) -> PResult<Expr> {
    parse_expression_at(src, 0)
}

fn parse_expression_at(src: &str, depth: usize) -> PResult<Expr> {
    let mut parser = Parser::new(tokenize(src)?);
    parser.depth = depth;
    let expr = parser.expression()?;
    if !parser.at_eof() {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// 进入一层嵌套；失败时 depth 不回退，整个解析随之失败
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        self.check_depth(1)?;
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// 左结合链（a.b.c、1+2+3）的每一环也算一层
    fn check_depth(&self, extra: usize) -> PResult<()> {
        if self.depth + extra > MAX_NESTING {
            return Err(self.error(format!("Nesting exceeds {MAX_NESTING} levels")));
        }
        Ok(())
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].tok
    }

    fn token(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn line(&self) -> usize {
        self.token().line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Tok::Eof)
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Tok::Punct(q) if *q == p)
    }

    fn is_ident(&self, name: &str) -> bool {
        matches!(self.peek(), Tok::Ident(s) if s == name)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, name: &str) -> bool {
        if self.is_ident(name) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> PResult<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error(format!("Expected '{p}' but found {}", self.peek())))
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            line: self.line(),
        }
    }

    fn unexpected(&self) -> ParseError {
        self.error(format!("Unexpected token {}", self.peek()))
    }

    fn ident_name(&mut self) -> PResult<String> {
        match self.advance() {
            Tok::Ident(name) => Ok(name),
            other => Err(self.error(format!("Expected identifier but found {other}"))),
        }
    }

    fn binding_name(&mut self) -> PResult<String> {
        let name = self.ident_name()?;
        if RESERVED.contains(&name.as_str()) {
            return Err(self.error(format!("Unexpected reserved word '{name}'")));
        }
        Ok(name)
    }

    fn consume_semicolon(&mut self) {
        self.eat_punct(";");
    }

    // ---------- 语句 ----------

    fn statement(&mut self) -> PResult<Stmt> {
        self.nested(Self::statement_inner)
    }

    fn statement_inner(&mut self) -> PResult<Stmt> {
        match self.peek().clone() {
            Tok::Punct("{") => {
                self.advance();
                Ok(Stmt::Block(self.block_rest()?))
            }
            Tok::Punct(";") => {
                self.advance();
                Ok(Stmt::Empty)
            }
            Tok::Ident(word) => match word.as_str() {
                "var" | "let" | "const" => {
                    let stmt = self.declaration()?;
                    self.consume_semicolon();
                    Ok(stmt)
                }
                "function" => {
                    self.advance();
                    Ok(Stmt::Function(self.function_rest(true, false)?))
                }
                "async" if matches!(self.peek_at(1), Tok::Ident(s) if s == "function") => {
                    self.advance();
                    self.advance();
                    Ok(Stmt::Function(self.function_rest(true, true)?))
                }
                "if" => self.if_statement(),
                "for" => self.for_statement(),
                "while" => {
                    self.advance();
                    self.expect_punct("(")?;
                    let test = self.expression()?;
                    self.expect_punct(")")?;
                    let body = Box::new(self.statement()?);
                    Ok(Stmt::While { test, body })
                }
                "do" => {
                    self.advance();
                    let body = Box::new(self.statement()?);
                    if !self.eat_ident("while") {
                        return Err(self.unexpected());
                    }
                    self.expect_punct("(")?;
                    let test = self.expression()?;
                    self.expect_punct(")")?;
                    self.consume_semicolon();
                    Ok(Stmt::DoWhile { body, test })
                }
                "return" => {
                    self.advance();
                    let ends = self.token().newline_before
                        || self.is_punct(";")
                        || self.is_punct("}")
                        || self.at_eof();
                    let value = if ends { None } else { Some(self.expression()?) };
                    self.consume_semicolon();
                    Ok(Stmt::Return(value))
                }
                "break" => {
                    self.advance();
                    self.consume_semicolon();
                    Ok(Stmt::Break)
                }
                "continue" => {
                    self.advance();
                    self.consume_semicolon();
                    Ok(Stmt::Continue)
                }
                "throw" => {
                    self.advance();
                    let value = self.expression()?;
                    self.consume_semicolon();
                    Ok(Stmt::Throw(value))
                }
                "try" => self.try_statement(),
                "switch" | "class" | "import" | "export" => {
                    Err(self.error(format!("'{word}' is not supported in this sandbox")))
                }
                _ => self.expression_statement(),
            },
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> PResult<Stmt> {
        let expr = self.expression()?;
        if !(self.eat_punct(";")
            || self.token().newline_before
            || self.is_punct("}")
            || self.at_eof())
        {
            return Err(self.unexpected());
        }
        Ok(Stmt::Expr(expr))
    }

    fn block_rest(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.error("Unexpected end of input, expected '}'".into()));
            }
            body.push(self.statement()?);
        }
        self.advance();
        Ok(body)
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_punct("{")?;
        self.block_rest()
    }

    fn decl_kind(&mut self) -> PResult<DeclKind> {
        match self.ident_name()?.as_str() {
            "var" => Ok(DeclKind::Var),
            "let" => Ok(DeclKind::Let),
            "const" => Ok(DeclKind::Const),
            other => Err(self.error(format!("Unexpected '{other}'"))),
        }
    }

    fn declaration(&mut self) -> PResult<Stmt> {
        let kind = self.decl_kind()?;
        let mut decls = Vec::new();
        loop {
            let pattern = self.binding_pattern()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push((pattern, init));
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(Stmt::Decl { kind, decls })
    }

    fn binding_pattern(&mut self) -> PResult<Pattern> {
        if self.eat_punct("{") {
            let mut props = Vec::new();
            let mut rest = None;
            while !self.eat_punct("}") {
                if self.eat_punct("...") {
                    rest = Some(self.binding_name()?);
                } else {
                    let key = match self.advance() {
                        Tok::Ident(s) | Tok::Str(s) => s,
                        Tok::Num(n) => crate::sandbox::value::number_to_string(n),
                        other => return Err(self.error(format!("Unexpected {other} in pattern"))),
                    };
                    let value = if self.eat_punct(":") {
                        self.binding_pattern()?
                    } else {
                        Pattern::Ident(key.clone())
                    };
                    let default = if self.eat_punct("=") {
                        Some(self.assignment()?)
                    } else {
                        None
                    };
                    props.push(PatternProp {
                        key,
                        value,
                        default,
                    });
                }
                if !self.is_punct("}") {
                    self.expect_punct(",")?;
                }
            }
            return Ok(Pattern::Object { props, rest });
        }
        if self.eat_punct("[") {
            let mut elems = Vec::new();
            let mut rest = None;
            while !self.eat_punct("]") {
                if self.is_punct(",") {
                    self.advance();
                    elems.push(None);
                    continue;
                }
                if self.eat_punct("...") {
                    rest = Some(self.binding_name()?);
                } else {
                    let pattern = self.binding_pattern()?;
                    let default = if self.eat_punct("=") {
                        Some(self.assignment()?)
                    } else {
                        None
                    };
                    elems.push(Some(PatternElem { pattern, default }));
                }
                if !self.is_punct("]") {
                    self.expect_punct(",")?;
                }
            }
            return Ok(Pattern::Array { elems, rest });
        }
        Ok(Pattern::Ident(self.binding_name()?))
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        self.advance();
        self.expect_punct("(")?;
        let test = self.expression()?;
        self.expect_punct(")")?;
        let cons = Box::new(self.statement()?);
        let alt = if self.eat_ident("else") {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If { test, cons, alt })
    }

    fn for_statement(&mut self) -> PResult<Stmt> {
        self.advance();
        if self.is_ident("await") {
            return Err(self.error("'for await' is not supported in this sandbox".into()));
        }
        self.expect_punct("(")?;

        let mut init = None;
        if matches!(self.peek(), Tok::Ident(s) if s == "var" || s == "let" || s == "const") {
            let kind = self.decl_kind()?;
            let pattern = self.binding_pattern()?;
            if self.is_ident("of") || self.is_ident("in") {
                return self.for_each_rest(Some(kind), pattern);
            }
            let mut decls = Vec::new();
            let first_init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push((pattern, first_init));
            while self.eat_punct(",") {
                let pattern = self.binding_pattern()?;
                let value = if self.eat_punct("=") {
                    Some(self.assignment()?)
                } else {
                    None
                };
                decls.push((pattern, value));
            }
            init = Some(Box::new(Stmt::Decl { kind, decls }));
        } else if let Tok::Ident(name) = self.peek().clone() {
            if matches!(self.peek_at(1), Tok::Ident(s) if s == "of" || s == "in") {
                self.advance();
                return self.for_each_rest(None, Pattern::Ident(name));
            }
        }
        if init.is_none() && !self.is_punct(";") {
            init = Some(Box::new(Stmt::Expr(self.expression()?)));
        }
        self.expect_punct(";")?;
        let test = if self.is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn for_each_rest(&mut self, kind: Option<DeclKind>, pattern: Pattern) -> PResult<Stmt> {
        let keys = self.ident_name()? == "in";
        let iterable = self.expression()?;
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::ForEach {
            kind,
            pattern,
            iterable,
            keys,
            body,
        })
    }

    fn try_statement(&mut self) -> PResult<Stmt> {
        self.advance();
        let block = self.block()?;
        let mut param = None;
        let mut handler = None;
        let mut finalizer = None;
        if self.eat_ident("catch") {
            if self.eat_punct("(") {
                param = Some(self.binding_pattern()?);
                self.expect_punct(")")?;
            }
            handler = Some(self.block()?);
        }
        if self.eat_ident("finally") {
            finalizer = Some(self.block()?);
        }
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error("Missing catch or finally after try".into()));
        }
        Ok(Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    // ---------- 函数 ----------

    fn function_rest(&mut self, named: bool, is_async: bool) -> PResult<Arc<FunctionDef>> {
        let name = if named || matches!(self.peek(), Tok::Ident(_)) {
            Some(self.binding_name()?)
        } else {
            None
        };
        self.expect_punct("(")?;
        let params = self.params_rest()?;
        let body = FunctionBody::Block(self.block()?);
        Ok(Arc::new(FunctionDef {
            name,
            params,
            body,
            is_async,
        }))
    }

    /// 已消费 "("，解析到 ")" 为止
    fn params_rest(&mut self) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        while !self.eat_punct(")") {
            let rest = self.eat_punct("...");
            let pattern = self.binding_pattern()?;
            let default = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            params.push(Param {
                pattern,
                default,
                rest,
            });
            if !self.is_punct(")") {
                self.expect_punct(",")?;
            }
        }
        Ok(params)
    }

    /// 从 pos 处的 "(" 起找到匹配的 ")"，判断其后是否紧跟 "=>"
    fn is_arrow_ahead(&self, offset: usize) -> bool {
        let mut depth = 0usize;
        let mut i = self.pos + offset;
        while i < self.tokens.len() {
            match &self.tokens[i].tok {
                Tok::Punct("(") | Tok::Punct("[") | Tok::Punct("{") => depth += 1,
                Tok::Punct(")") | Tok::Punct("]") | Tok::Punct("}") => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return matches!(self.tokens.get(i + 1).map(|t| &t.tok), Some(Tok::Punct("=>")));
                    }
                }
                Tok::Eof => return false,
                _ => {}
            }
            i += 1;
        }
        false
    }

    fn arrow_body(&mut self, params: Vec<Param>, is_async: bool) -> PResult<Expr> {
        self.expect_punct("=>")?;
        let body = if self.is_punct("{") {
            FunctionBody::Block(self.block()?)
        } else {
            FunctionBody::Expr(Box::new(self.assignment()?))
        };
        Ok(Expr::Function(Arc::new(FunctionDef {
            name: None,
            params,
            body,
            is_async,
        })))
    }

    fn try_arrow(&mut self) -> PResult<Option<Expr>> {
        let simple_param = |name: String| Param {
            pattern: Pattern::Ident(name),
            default: None,
            rest: false,
        };
        match (self.peek().clone(), self.peek_at(1).clone()) {
            (Tok::Ident(name), Tok::Punct("=>")) => {
                self.advance();
                Ok(Some(self.arrow_body(vec![simple_param(name)], false)?))
            }
            (Tok::Ident(a), Tok::Ident(name))
                if a == "async" && matches!(self.peek_at(2), Tok::Punct("=>")) =>
            {
                self.advance();
                self.advance();
                Ok(Some(self.arrow_body(vec![simple_param(name)], true)?))
            }
            (Tok::Ident(a), Tok::Punct("(")) if a == "async" && self.is_arrow_ahead(1) => {
                self.advance();
                self.advance();
                let params = self.params_rest()?;
                Ok(Some(self.arrow_body(params, true)?))
            }
            (Tok::Punct("("), _) if self.is_arrow_ahead(0) => {
                self.advance();
                let params = self.params_rest()?;
                Ok(Some(self.arrow_body(params, false)?))
            }
            _ => Ok(None),
        }
    }

    // ---------- 表达式 ----------

    fn expression(&mut self) -> PResult<Expr> {
        let first = self.assignment()?;
        if !self.is_punct(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            items.push(self.assignment()?);
        }
        Ok(Expr::Sequence(items))
    }

    fn assignment(&mut self) -> PResult<Expr> {
        self.nested(Self::assignment_inner)
    }

    fn assignment_inner(&mut self) -> PResult<Expr> {
        if let Some(arrow) = self.try_arrow()? {
            return Ok(arrow);
        }
        let left = self.conditional()?;
        let op = match self.peek() {
            Tok::Punct("=") => AssignOp::Assign,
            Tok::Punct("+=") => AssignOp::Binary(BinOp::Add),
            Tok::Punct("-=") => AssignOp::Binary(BinOp::Sub),
            Tok::Punct("*=") => AssignOp::Binary(BinOp::Mul),
            Tok::Punct("/=") => AssignOp::Binary(BinOp::Div),
            Tok::Punct("%=") => AssignOp::Binary(BinOp::Mod),
            Tok::Punct("**=") => AssignOp::Binary(BinOp::Pow),
            Tok::Punct("&=") => AssignOp::Binary(BinOp::BitAnd),
            Tok::Punct("|=") => AssignOp::Binary(BinOp::BitOr),
            Tok::Punct("^=") => AssignOp::Binary(BinOp::BitXor),
            Tok::Punct("<<=") => AssignOp::Binary(BinOp::Shl),
            Tok::Punct(">>=") => AssignOp::Binary(BinOp::Shr),
            Tok::Punct(">>>=") => AssignOp::Binary(BinOp::UShr),
            Tok::Punct("&&=") => AssignOp::Logical(LogicalOp::And),
            Tok::Punct("||=") => AssignOp::Logical(LogicalOp::Or),
            Tok::Punct("??=") => AssignOp::Logical(LogicalOp::Nullish),
            _ => return Ok(left),
        };
        self.advance();
        let value = Box::new(self.assignment()?);
        match left {
            Expr::Ident(_) | Expr::Member { optional: false, .. } => Ok(Expr::Assign {
                op,
                target: Box::new(left),
                value,
            }),
            Expr::Array(_) | Expr::Object(_) if op == AssignOp::Assign => Ok(Expr::AssignPattern {
                pattern: self.expr_to_pattern(left)?,
                value,
            }),
            _ => Err(self.error("Invalid left-hand side in assignment".into())),
        }
    }

    fn expr_to_pattern(&self, expr: Expr) -> PResult<Pattern> {
        match expr {
            Expr::Ident(name) => Ok(Pattern::Ident(name)),
            Expr::Array(elems) => {
                let mut out = Vec::new();
                let mut rest = None;
                for elem in elems {
                    match elem {
                        ArrayElem::Hole => out.push(None),
                        ArrayElem::Spread(Expr::Ident(name)) => rest = Some(name),
                        ArrayElem::Item(Expr::Assign {
                            op: AssignOp::Assign,
                            target,
                            value,
                        }) => out.push(Some(PatternElem {
                            pattern: self.expr_to_pattern(*target)?,
                            default: Some(*value),
                        })),
                        ArrayElem::Item(e) => out.push(Some(PatternElem {
                            pattern: self.expr_to_pattern(e)?,
                            default: None,
                        })),
                        ArrayElem::Spread(_) => {
                            return Err(self.error("Invalid rest element".into()))
                        }
                    }
                }
                Ok(Pattern::Array { elems: out, rest })
            }
            Expr::Object(props) => {
                let mut out = Vec::new();
                let mut rest = None;
                for prop in props {
                    match prop {
                        ObjProp::Spread(Expr::Ident(name)) => rest = Some(name),
                        ObjProp::KeyValue(PropKey::Named(key), value) => out.push(PatternProp {
                            key,
                            value: self.expr_to_pattern(value)?,
                            default: None,
                        }),
                        _ => return Err(self.error("Invalid destructuring target".into())),
                    }
                }
                Ok(Pattern::Object { props: out, rest })
            }
            _ => Err(self.error("Invalid destructuring target".into())),
        }
    }

    fn conditional(&mut self) -> PResult<Expr> {
        let test = self.binary(0)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let cons = self.assignment()?;
        self.expect_punct(":")?;
        let alt = self.assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            cons: Box::new(cons),
            alt: Box::new(alt),
        })
    }

    fn binary_op(&self) -> Option<(u8, Result<BinOp, LogicalOp>)> {
        let op = match self.peek() {
            Tok::Punct(p) => *p,
            Tok::Ident(s) if s == "in" => return Some((7, Ok(BinOp::In))),
            Tok::Ident(s) if s == "instanceof" => return Some((7, Ok(BinOp::InstanceOf))),
            _ => return None,
        };
        Some(match op {
            "??" => (1, Err(LogicalOp::Nullish)),
            "||" => (1, Err(LogicalOp::Or)),
            "&&" => (2, Err(LogicalOp::And)),
            "|" => (3, Ok(BinOp::BitOr)),
            "^" => (4, Ok(BinOp::BitXor)),
            "&" => (5, Ok(BinOp::BitAnd)),
            "==" => (6, Ok(BinOp::Eq)),
            "!=" => (6, Ok(BinOp::NotEq)),
            "===" => (6, Ok(BinOp::StrictEq)),
            "!==" => (6, Ok(BinOp::StrictNotEq)),
            "<" => (7, Ok(BinOp::Lt)),
            ">" => (7, Ok(BinOp::Gt)),
            "<=" => (7, Ok(BinOp::LtEq)),
            ">=" => (7, Ok(BinOp::GtEq)),
            "<<" => (8, Ok(BinOp::Shl)),
            ">>" => (8, Ok(BinOp::Shr)),
            ">>>" => (8, Ok(BinOp::UShr)),
            "+" => (9, Ok(BinOp::Add)),
            "-" => (9, Ok(BinOp::Sub)),
            "*" => (10, Ok(BinOp::Mul)),
            "/" => (10, Ok(BinOp::Div)),
            "%" => (10, Ok(BinOp::Mod)),
            "**" => (11, Ok(BinOp::Pow)),
            _ => return None,
        })
    }

    fn binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut left = self.unary()?;
        let mut chain = 0;
        while let Some((prec, op)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            chain += 1;
            self.check_depth(chain)?;
            self.advance();
            // ** 右结合
            let next_min = if op == Ok(BinOp::Pow) { prec } else { prec + 1 };
            let right = Box::new(self.binary(next_min)?);
            left = match op {
                Ok(op) => Expr::Binary {
                    op,
                    left: Box::new(left),
                    right,
                },
                Err(op) => Expr::Logical {
                    op,
                    left: Box::new(left),
                    right,
                },
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> PResult<Expr> {
        self.nested(Self::unary_inner)
    }

    fn unary_inner(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Tok::Punct("!") => Some(UnaryOp::Not),
            Tok::Punct("-") => Some(UnaryOp::Neg),
            Tok::Punct("+") => Some(UnaryOp::Plus),
            Tok::Punct("~") => Some(UnaryOp::BitNot),
            Tok::Ident(s) if s == "typeof" => Some(UnaryOp::Typeof),
            Tok::Ident(s) if s == "void" => Some(UnaryOp::Void),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let arg = Box::new(self.unary()?);
            return Ok(Expr::Unary { op, arg });
        }
        if self.eat_ident("await") {
            return Ok(Expr::Await(Box::new(self.unary()?)));
        }
        if self.is_punct("++") || self.is_punct("--") {
            let increment = self.is_punct("++");
            self.advance();
            let target = self.unary()?;
            self.check_update_target(&target)?;
            return Ok(Expr::Update {
                increment,
                prefix: true,
                target: Box::new(target),
            });
        }
        self.postfix()
    }

    fn check_update_target(&self, target: &Expr) -> PResult<()> {
        match target {
            Expr::Ident(_) | Expr::Member { optional: false, .. } => Ok(()),
            _ => Err(self.error("Invalid update target".into())),
        }
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let expr = self.call_member()?;
        if (self.is_punct("++") || self.is_punct("--")) && !self.token().newline_before {
            let increment = self.is_punct("++");
            self.advance();
            self.check_update_target(&expr)?;
            return Ok(Expr::Update {
                increment,
                prefix: false,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn arguments_rest(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                args.push(Arg::Spread(self.assignment()?));
            } else {
                args.push(Arg::Item(self.assignment()?));
            }
            if !self.is_punct(")") {
                self.expect_punct(",")?;
            }
        }
        Ok(args)
    }

    fn call_member(&mut self) -> PResult<Expr> {
        let mut expr = if self.eat_ident("new") {
            let callee = self.primary()?;
            let callee = self.member_only(callee)?;
            let args = if self.eat_punct("(") {
                self.arguments_rest()?
            } else {
                Vec::new()
            };
            Expr::New {
                callee: Box::new(callee),
                args,
            }
        } else {
            self.primary()?
        };
        let mut chain = 0;
        loop {
            chain += 1;
            self.check_depth(chain)?;
            if self.eat_punct(".") {
                let name = self.ident_name()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberProp::Named(name),
                    optional: false,
                };
            } else if self.eat_punct("?.") {
                if self.eat_punct("(") {
                    let args = self.arguments_rest()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        optional: true,
                    };
                } else if self.eat_punct("[") {
                    let key = self.expression()?;
                    self.expect_punct("]")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: MemberProp::Computed(Box::new(key)),
                        optional: true,
                    };
                } else {
                    let name = self.ident_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: MemberProp::Named(name),
                        optional: true,
                    };
                }
            } else if self.is_punct("[") {
                self.advance();
                let key = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberProp::Computed(Box::new(key)),
                    optional: false,
                };
            } else if self.is_punct("(") {
                self.advance();
                let args = self.arguments_rest()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    optional: false,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// new 的 callee 只吃成员访问，不吃调用
    fn member_only(&mut self, mut expr: Expr) -> PResult<Expr> {
        while self.eat_punct(".") {
            let name = self.ident_name()?;
            expr = Expr::Member {
                object: Box::new(expr),
                property: MemberProp::Named(name),
                optional: false,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let line = self.line();
        match self.advance() {
            Tok::Num(n) => Ok(Expr::Num(n)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::Template { quasis, exprs } => {
                let exprs = exprs
                    .iter()
                    .map(|src| {
                        parse_expression_at(src, self.depth + 1).map_err(|e| ParseError {
                            message: e.message,
                            line,
                        })
                    })
                    .collect::<PResult<Vec<_>>>()?;
                Ok(Expr::Template { quasis, exprs })
            }
            Tok::Punct("(") => {
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Tok::Punct("[") => self.array_literal(),
            Tok::Punct("{") => self.object_literal(),
            Tok::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "undefined" => Ok(Expr::Undefined),
                "function" => Ok(Expr::Function(self.function_rest(false, false)?)),
                "async" if self.is_ident("function") => {
                    self.advance();
                    Ok(Expr::Function(self.function_rest(false, true)?))
                }
                w if RESERVED.contains(&w) => Err(ParseError {
                    message: format!("Unexpected token {w}"),
                    line,
                }),
                _ => Ok(Expr::Ident(word)),
            },
            other => Err(ParseError {
                message: format!("Unexpected token {other}"),
                line,
            }),
        }
    }

    fn array_literal(&mut self) -> PResult<Expr> {
        let mut elems = Vec::new();
        while !self.eat_punct("]") {
            if self.is_punct(",") {
                self.advance();
                elems.push(ArrayElem::Hole);
                continue;
            }
            if self.eat_punct("...") {
                elems.push(ArrayElem::Spread(self.assignment()?));
            } else {
                elems.push(ArrayElem::Item(self.assignment()?));
            }
            if !self.is_punct("]") {
                self.expect_punct(",")?;
            }
        }
        Ok(Expr::Array(elems))
    }

    fn object_literal(&mut self) -> PResult<Expr> {
        let mut props = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                props.push(ObjProp::Spread(self.assignment()?));
            } else {
                let is_async = self.is_ident("async")
                    && !matches!(self.peek_at(1), Tok::Punct(":" | "," | "}" | "("));
                if is_async {
                    self.advance();
                }
                let key = match self.advance() {
                    Tok::Ident(s) | Tok::Str(s) => PropKey::Named(s),
                    Tok::Num(n) => PropKey::Named(crate::sandbox::value::number_to_string(n)),
                    Tok::Punct("[") => {
                        let e = self.assignment()?;
                        self.expect_punct("]")?;
                        PropKey::Computed(e)
                    }
                    other => return Err(self.error(format!("Unexpected {other} in object literal"))),
                };
                if self.eat_punct(":") {
                    props.push(ObjProp::KeyValue(key, self.assignment()?));
                } else if self.eat_punct("(") {
                    let params = self.params_rest()?;
                    let body = FunctionBody::Block(self.block()?);
                    let name = match &key {
                        PropKey::Named(n) => Some(n.clone()),
                        PropKey::Computed(_) => None,
                    };
                    props.push(ObjProp::KeyValue(
                        key,
                        Expr::Function(Arc::new(FunctionDef {
                            name,
                            params,
                            body,
                            is_async,
                        })),
                    ));
                } else {
                    let PropKey::Named(name) = key else {
                        return Err(self.unexpected());
                    };
                    props.push(ObjProp::KeyValue(PropKey::Named(name.clone()), Expr::Ident(name)));
                }
            }
            if !self.is_punct("}") {
                self.expect_punct(",")?;
            }
        }
        Ok(Expr::Object(props))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declarations_and_calls() {
        let prog = parse_program("const x = await finalAnswer({answer: 'ok'});\nconsole.log(x)").unwrap();
        assert_eq!(prog.len(), 2);
        let Stmt::Decl { kind, decls } = &prog[0] else {
            panic!("expected declaration");
        };
        assert_eq!(*kind, DeclKind::Const);
        assert!(matches!(decls[0].1, Some(Expr::Await(_))));
    }

    #[test]
    fn test_missing_semicolons() {
        let prog = parse_program("a = 1\nb = 2\nc = a + b").unwrap();
        assert_eq!(prog.len(), 3);
    }

    #[test]
    fn test_return_newline_rule() {
        let prog = parse_program("function f() { return\n1 }").unwrap();
        let Stmt::Function(def) = &prog[0] else {
            panic!("expected function");
        };
        let FunctionBody::Block(body) = &def.body else {
            panic!("expected block body");
        };
        assert!(matches!(body[0], Stmt::Return(None)));
    }

    #[test]
    fn test_arrows() {
        for src in [
            "x => x * 2",
            "(a, b) => a + b",
            "async (q) => { return await search({q}) }",
            "async x => x",
            "({a, b = 2}, ...rest) => a",
            "() => ({k: 1})",
        ] {
            let expr = parse_expression(src).unwrap_or_else(|e| panic!("{src}: {e}"));
            assert!(matches!(expr, Expr::Function(_)), "{src}");
        }
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("1 + 2 * 3 ** 2 ** 1").unwrap();
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(*right, Expr::Binary { op: BinOp::Mul, .. }));

        let expr = parse_expression("a ?? b || c").unwrap();
        assert!(matches!(expr, Expr::Logical { .. }));
    }

    #[test]
    fn test_loops_and_try() {
        let src = r#"
            for (let i = 0; i < 3; i++) { total += i }
            for (const [k, v] of Object.entries(obj)) console.log(k, v)
            for (key in obj) {}
            while (n > 0) n--
            try { risky() } catch (e) { console.log(e.message) } finally { done = true }
        "#;
        let prog = parse_program(src).unwrap();
        assert_eq!(prog.len(), 5);
        assert!(matches!(prog[1], Stmt::ForEach { keys: false, .. }));
        assert!(matches!(prog[2], Stmt::ForEach { keys: true, kind: None, .. }));
    }

    #[test]
    fn test_optional_chaining_and_templates() {
        parse_expression("a?.b?.[0]?.(1)").unwrap();
        let expr = parse_expression("`n=${n + 1}`").unwrap();
        assert!(matches!(expr, Expr::Template { .. }));
    }

    #[test]
    fn test_destructuring_assignment() {
        let expr = parse_expression("[a, b] = [b, a]").unwrap();
        assert!(matches!(expr, Expr::AssignPattern { .. }));
    }

    #[test]
    fn test_syntax_errors_carry_line() {
        let err = parse_program("x = 1\ny = (2 +\n").unwrap_err();
        assert!(err.line >= 2);
        let err = parse_program("class A {}").unwrap_err();
        assert!(err.message.contains("not supported"));
        assert!(parse_program("1 = 2").is_err());
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let src = format!("return {}1{}", "(".repeat(3000), ")".repeat(3000));
        let err = parse_program(&src).unwrap_err();
        assert!(err.message.contains("Nesting"));

        let src = format!("{}x = 1{}", "{".repeat(500), "}".repeat(500));
        assert!(parse_program(&src).is_err());

        let src = format!("x = 1{}", " + 1".repeat(5000));
        assert!(parse_program(&src).is_err());

        // 常见深度不受影响
        let src = format!("x = {}1{}", "(".repeat(20), ")".repeat(20));
        assert!(parse_program(&src).is_ok());
    }

    #[test]
    fn test_object_literal_forms() {
        let expr = parse_expression("{a, 'b': 1, [k]: 2, ...rest, m(x) { return x }, async n() {}}").unwrap();
        let Expr::Object(props) = expr else {
            panic!("expected object");
        };
        assert_eq!(props.len(), 6);
    }
}
