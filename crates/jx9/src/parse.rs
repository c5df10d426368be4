//! Token stream → expression trees and statement forms.
//!
//! Recursive descent with the usual precedence ladder. Every node is a
//! closed tagged variant: the code generator dispatches by pattern match
//! rather than through per-node callbacks. Parse errors accumulate (up to
//! the compile-error cap) and the parser re-synchronizes at the next `;` or
//! `}` so one mistake does not drown the whole listing.

use crate::{
    bytecode::TypeHint,
    error::{COMPILE_ERROR_LIMIT, CompileError},
    lexer::{Kw, Tok, Token},
};

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnOp {
    Neg,
    Pos,
    Not,
    BitNot,
}

/// Binary operators (short-circuit `And`/`Or` included; the generator turns
/// those into jump chains).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Cat,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Neq,
    Teq,
    Tne,
    Band,
    Bxor,
    Bor,
    And,
    Or,
}

/// Assignment operators (`=` and the compound family).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Cat,
    Shl,
    Shr,
    Band,
    Bor,
    Bxor,
}

/// Cast targets for the prefix `(type)` operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CastKind {
    Int,
    Real,
    Str,
    Bool,
    Array,
}

/// One entry of a map literal; `key` is `None` for positional array values.
#[derive(Debug)]
pub(crate) struct MapEntry {
    pub key: Option<Expr>,
    pub value: Expr,
}

/// An expression tree node.
#[derive(Debug)]
pub(crate) enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    /// Double-quoted string parts, concatenated at runtime.
    Interp(Vec<Expr>),
    /// Bare identifier: a constant-expansion candidate.
    Ident(String),
    Var(String),
    MapLit {
        entries: Vec<MapEntry>,
        object: bool,
    },
    /// Anonymous function; named `[lambda_N]` by the generator.
    Anon(Box<FuncDecl>),
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    IncDec {
        decr: bool,
        post: bool,
        target: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    Index {
        base: Box<Expr>,
        /// `None` is the append form `$a[]`, legal on the store path only.
        index: Option<Box<Expr>>,
    },
    Member {
        base: Box<Expr>,
        name: String,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Cast {
        to: CastKind,
        expr: Box<Expr>,
    },
    /// `__LINE__`, resolved at parse time.
    MagicLine(u32),
    /// `__FUNCTION__`, resolved by the generator.
    MagicFunc,
}

/// Formal argument declaration.
#[derive(Debug)]
pub(crate) struct ArgDecl {
    pub name: String,
    pub hint: Option<TypeHint>,
    pub default: Option<Expr>,
}

/// A function declaration (named or anonymous).
#[derive(Debug)]
pub(crate) struct FuncDecl {
    pub name: String,
    pub args: Vec<ArgDecl>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

/// One `switch` arm; `guard` is `None` for `default`.
#[derive(Debug)]
pub(crate) struct SwitchArm {
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
}

/// A statement form.
#[derive(Debug)]
pub(crate) enum Stmt {
    Expr(Expr),
    Print(Vec<Expr>),
    If {
        arms: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        init: Option<Expr>,
        cond: Option<Expr>,
        post: Option<Expr>,
        body: Vec<Stmt>,
    },
    Foreach {
        subject: Expr,
        key: Option<String>,
        value: String,
        body: Vec<Stmt>,
    },
    Switch {
        subject: Expr,
        arms: Vec<SwitchArm>,
    },
    Break {
        levels: u32,
        line: u32,
    },
    Continue {
        levels: u32,
        line: u32,
    },
    Return(Option<Expr>),
    /// `die` / `exit`.
    Halt(Option<Expr>),
    Static {
        name: String,
        init: Option<Expr>,
        line: u32,
    },
    Const {
        name: String,
        value: Expr,
        line: u32,
    },
    Uplink {
        names: Vec<String>,
        line: u32,
    },
    Func(FuncDecl),
    Block(Vec<Stmt>),
}

/// Parses a whole program, returning the statement list and every diagnostic
/// collected along the way.
pub(crate) fn parse_program(tokens: &[Token]) -> (Vec<Stmt>, Vec<CompileError>) {
    let mut parser = Parser {
        toks: tokens,
        pos: 0,
        errors: Vec::new(),
    };
    let body = parser.statements_until(None);
    (body, parser.errors)
}

/// Parses one expression from an embedded slice (double-quoted string
/// interpolation). Returns `None` when the slice does not lex or parse.
pub(crate) fn parse_embedded_expr(src: &str) -> Option<Expr> {
    let tokens = crate::lexer::tokenize(src).ok()?;
    let mut parser = Parser {
        toks: &tokens,
        pos: 0,
        errors: Vec::new(),
    };
    let expr = parser.expr()?;
    if parser.errors.is_empty() && parser.pos == tokens.len() {
        Some(expr)
    } else {
        None
    }
}

struct Parser<'t> {
    toks: &'t [Token],
    pos: usize,
    errors: Vec<CompileError>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.toks.get(self.pos + offset).map(|t| &t.tok)
    }

    fn line(&self) -> u32 {
        self.toks
            .get(self.pos.min(self.toks.len().saturating_sub(1)))
            .map_or(1, |t| t.line)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.toks.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> bool {
        if self.eat(tok) {
            return true;
        }
        self.error(format!("expected {what}"));
        false
    }

    fn error(&mut self, message: String) {
        if self.errors.len() < COMPILE_ERROR_LIMIT {
            let line = self.line();
            self.errors.push(CompileError::new(line, message));
        }
    }

    /// Skips to the next statement boundary after an error.
    fn synchronize(&mut self) {
        while let Some(tok) = self.peek() {
            match tok {
                Tok::Semi => {
                    self.pos += 1;
                    return;
                }
                Tok::RBrace => return,
                _ => self.pos += 1,
            }
        }
    }

    // ----------------------------------------------------------------
    // Statements
    // ----------------------------------------------------------------

    /// Parses statements until the closer (or end of input for `None`).
    fn statements_until(&mut self, closer: Option<&Tok>) -> Vec<Stmt> {
        let mut out = Vec::new();
        loop {
            if self.errors.len() >= COMPILE_ERROR_LIMIT {
                // Error cap reached; refuse further work.
                self.pos = self.toks.len();
                return out;
            }
            match self.peek() {
                None => {
                    if let Some(c) = closer {
                        self.error(format!("unexpected end of input, expected {c:?}"));
                    }
                    return out;
                }
                Some(tok) if Some(tok) == closer => {
                    self.pos += 1;
                    return out;
                }
                _ => {}
            }
            if let Some(stmt) = self.statement() {
                out.push(stmt);
            }
        }
    }

    fn statement(&mut self) -> Option<Stmt> {
        match self.peek()? {
            Tok::Semi => {
                self.pos += 1;
                None
            }
            Tok::LBrace if self.brace_opens_block() => {
                self.pos += 1;
                Some(Stmt::Block(self.statements_until(Some(&Tok::RBrace))))
            }
            Tok::Kw(kw) => {
                let kw = *kw;
                self.keyword_statement(kw)
            }
            _ => self.expr_statement(),
        }
    }

    /// In statement position `{` is a block — except when it reads as a JSON
    /// object literal starting an expression statement (e.g. `{a:1} + ...`),
    /// which in practice means: a block, unless the brace is immediately
    /// closed or followed by `key :`.
    fn brace_opens_block(&self) -> bool {
        match self.peek_at(1) {
            Some(Tok::RBrace) => false,
            Some(Tok::Ident(_) | Tok::SingleStr(_) | Tok::DoubleStr(_) | Tok::Int(_)) => {
                !matches!(self.peek_at(2), Some(Tok::Colon))
            }
            _ => true,
        }
    }

    fn keyword_statement(&mut self, kw: Kw) -> Option<Stmt> {
        match kw {
            Kw::If => self.if_statement(),
            Kw::While => self.while_statement(),
            Kw::For => self.for_statement(),
            Kw::Foreach => self.foreach_statement(),
            Kw::Switch => self.switch_statement(),
            Kw::Break | Kw::Continue => self.break_continue(kw),
            Kw::Return => {
                self.pos += 1;
                let value = if self.peek() == Some(&Tok::Semi) { None } else { self.expr() };
                self.eat(&Tok::Semi);
                Some(Stmt::Return(value))
            }
            Kw::Die | Kw::Exit => {
                self.pos += 1;
                let value = if matches!(self.peek(), Some(Tok::Semi) | None) {
                    None
                } else {
                    self.expr()
                };
                self.eat(&Tok::Semi);
                Some(Stmt::Halt(value))
            }
            Kw::Static => self.static_statement(),
            Kw::Const => self.const_statement(),
            Kw::Uplink => self.uplink_statement(),
            Kw::Function => {
                let line = self.line();
                self.pos += 1;
                let Some(Tok::Ident(name)) = self.peek().cloned() else {
                    self.error("expected function name".to_string());
                    self.synchronize();
                    return None;
                };
                self.pos += 1;
                let decl = self.function_rest(name, line)?;
                Some(Stmt::Func(decl))
            }
            Kw::Print => {
                self.pos += 1;
                let mut args = vec![self.expr()?];
                while self.eat(&Tok::Comma) {
                    args.push(self.expr()?);
                }
                self.eat(&Tok::Semi);
                Some(Stmt::Print(args))
            }
            Kw::Else | Kw::Elseif | Kw::Case | Kw::Default | Kw::As => {
                self.error(format!("unexpected '{}'", kw.to_string().to_lowercase()));
                self.pos += 1;
                self.synchronize();
                None
            }
            Kw::Int | Kw::Float | Kw::String | Kw::Bool => self.expr_statement(),
        }
    }

    fn expr_statement(&mut self) -> Option<Stmt> {
        let Some(expr) = self.expr() else {
            self.synchronize();
            return None;
        };
        self.eat(&Tok::Semi);
        Some(Stmt::Expr(expr))
    }

    /// A loop/branch body: either a braced block or a single statement.
    fn body(&mut self) -> Vec<Stmt> {
        if self.eat(&Tok::LBrace) {
            return self.statements_until(Some(&Tok::RBrace));
        }
        self.statement().into_iter().collect()
    }

    fn paren_expr(&mut self) -> Option<Expr> {
        self.expect(&Tok::LParen, "'('");
        let expr = self.expr();
        self.expect(&Tok::RParen, "')'");
        expr
    }

    fn if_statement(&mut self) -> Option<Stmt> {
        self.pos += 1; // 'if'
        let mut arms = Vec::new();
        let cond = self.paren_expr()?;
        arms.push((cond, self.body()));
        let mut otherwise = None;
        loop {
            if self.eat(&Tok::Kw(Kw::Elseif)) {
                let cond = self.paren_expr()?;
                arms.push((cond, self.body()));
                continue;
            }
            if self.peek() == Some(&Tok::Kw(Kw::Else)) && self.peek_at(1) == Some(&Tok::Kw(Kw::If)) {
                self.pos += 2;
                let cond = self.paren_expr()?;
                arms.push((cond, self.body()));
                continue;
            }
            if self.eat(&Tok::Kw(Kw::Else)) {
                otherwise = Some(self.body());
            }
            break;
        }
        Some(Stmt::If { arms, otherwise })
    }

    fn while_statement(&mut self) -> Option<Stmt> {
        self.pos += 1;
        let cond = self.paren_expr()?;
        Some(Stmt::While { cond, body: self.body() })
    }

    fn for_statement(&mut self) -> Option<Stmt> {
        self.pos += 1;
        self.expect(&Tok::LParen, "'(' after 'for'");
        let init = if self.peek() == Some(&Tok::Semi) { None } else { self.expr() };
        self.expect(&Tok::Semi, "';' after for-initializer");
        let cond = if self.peek() == Some(&Tok::Semi) { None } else { self.expr() };
        self.expect(&Tok::Semi, "';' after for-condition");
        let post = if self.peek() == Some(&Tok::RParen) { None } else { self.expr() };
        self.expect(&Tok::RParen, "')'");
        Some(Stmt::For {
            init,
            cond,
            post,
            body: self.body(),
        })
    }

    fn foreach_statement(&mut self) -> Option<Stmt> {
        self.pos += 1;
        self.expect(&Tok::LParen, "'(' after 'foreach'");
        let subject = self.expr()?;
        self.expect(&Tok::Kw(Kw::As), "'as'");
        let first = self.loop_variable()?;
        let (key, value) = if self.eat(&Tok::Comma) {
            let second = self.loop_variable()?;
            (Some(first), second)
        } else {
            (None, first)
        };
        self.expect(&Tok::RParen, "')'");
        Some(Stmt::Foreach {
            subject,
            key,
            value,
            body: self.body(),
        })
    }

    /// Foreach capture targets must be assignable variables.
    fn loop_variable(&mut self) -> Option<String> {
        if let Some(Tok::Var(name)) = self.peek().cloned() {
            self.pos += 1;
            return Some(name);
        }
        self.error("foreach target must be a variable".to_string());
        self.synchronize();
        None
    }

    fn switch_statement(&mut self) -> Option<Stmt> {
        self.pos += 1;
        let subject = self.paren_expr()?;
        self.expect(&Tok::LBrace, "'{' after switch subject");
        let mut arms: Vec<SwitchArm> = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::RBrace) => {
                    self.pos += 1;
                    break;
                }
                Some(Tok::Kw(Kw::Case)) => {
                    self.pos += 1;
                    let guard = self.expr()?;
                    self.expect(&Tok::Colon, "':' after case expression");
                    arms.push(SwitchArm {
                        guard: Some(guard),
                        body: Vec::new(),
                    });
                }
                Some(Tok::Kw(Kw::Default)) => {
                    self.pos += 1;
                    self.expect(&Tok::Colon, "':' after 'default'");
                    arms.push(SwitchArm {
                        guard: None,
                        body: Vec::new(),
                    });
                }
                Some(_) => {
                    if arms.is_empty() {
                        self.error("statement outside any switch case".to_string());
                        self.synchronize();
                        continue;
                    }
                    if let Some(stmt) = self.statement() {
                        arms.last_mut().expect("checked non-empty").body.push(stmt);
                    }
                }
                None => {
                    self.error("unterminated switch body".to_string());
                    break;
                }
            }
        }
        Some(Stmt::Switch { subject, arms })
    }

    fn break_continue(&mut self, kw: Kw) -> Option<Stmt> {
        let line = self.line();
        self.pos += 1;
        let levels = if let Some(Tok::Int(n)) = self.peek() {
            let n = u32::try_from(*n).unwrap_or(0).max(1);
            self.pos += 1;
            n
        } else {
            1
        };
        self.eat(&Tok::Semi);
        Some(if kw == Kw::Break {
            Stmt::Break { levels, line }
        } else {
            Stmt::Continue { levels, line }
        })
    }

    fn static_statement(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.pos += 1;
        let Some(Tok::Var(name)) = self.peek().cloned() else {
            self.error("expected variable after 'static'".to_string());
            self.synchronize();
            return None;
        };
        self.pos += 1;
        let init = if self.eat(&Tok::Assign) { self.expr() } else { None };
        self.eat(&Tok::Semi);
        Some(Stmt::Static { name, init, line })
    }

    fn const_statement(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.pos += 1;
        let Some(Tok::Ident(name)) = self.peek().cloned() else {
            self.error("expected constant name after 'const'".to_string());
            self.synchronize();
            return None;
        };
        self.pos += 1;
        if !self.expect(&Tok::Assign, "'=' after constant name") {
            self.synchronize();
            return None;
        }
        let value = self.expr()?;
        self.eat(&Tok::Semi);
        Some(Stmt::Const { name, value, line })
    }

    fn uplink_statement(&mut self) -> Option<Stmt> {
        let line = self.line();
        self.pos += 1;
        let mut names = Vec::new();
        loop {
            let Some(Tok::Var(name)) = self.peek().cloned() else {
                self.error("expected variable in uplink list".to_string());
                break;
            };
            self.pos += 1;
            names.push(name);
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.eat(&Tok::Semi);
        if names.is_empty() {
            self.synchronize();
            return None;
        }
        Some(Stmt::Uplink { names, line })
    }

    /// Parses `(args) { body }` after the function name (or after the
    /// `function` keyword for anonymous functions).
    fn function_rest(&mut self, name: String, line: u32) -> Option<FuncDecl> {
        self.expect(&Tok::LParen, "'(' after function name");
        let mut args = Vec::new();
        if !self.eat(&Tok::RParen) {
            loop {
                let hint = self.type_hint();
                let Some(Tok::Var(arg_name)) = self.peek().cloned() else {
                    self.error("expected argument variable".to_string());
                    self.synchronize();
                    return None;
                };
                self.pos += 1;
                let default = if self.eat(&Tok::Assign) { self.expr() } else { None };
                args.push(ArgDecl {
                    name: arg_name,
                    hint,
                    default,
                });
                if self.eat(&Tok::Comma) {
                    continue;
                }
                self.expect(&Tok::RParen, "')' after argument list");
                break;
            }
        }
        self.expect(&Tok::LBrace, "'{' opening function body");
        let body = self.statements_until(Some(&Tok::RBrace));
        Some(FuncDecl { name, args, body, line })
    }

    fn type_hint(&mut self) -> Option<TypeHint> {
        let hint = match self.peek()? {
            Tok::Kw(Kw::Int) => TypeHint::Int,
            Tok::Kw(Kw::Float) => TypeHint::Real,
            Tok::Kw(Kw::String) => TypeHint::Str,
            Tok::Kw(Kw::Bool) => TypeHint::Bool,
            _ => return None,
        };
        self.pos += 1;
        Some(hint)
    }

    // ----------------------------------------------------------------
    // Expressions
    // ----------------------------------------------------------------

    fn expr(&mut self) -> Option<Expr> {
        self.assign()
    }

    fn assign(&mut self) -> Option<Expr> {
        let lhs = self.ternary()?;
        let op = match self.peek() {
            Some(Tok::Assign) => AssignOp::Assign,
            Some(Tok::PlusEq) => AssignOp::Add,
            Some(Tok::MinusEq) => AssignOp::Sub,
            Some(Tok::StarEq) => AssignOp::Mul,
            Some(Tok::SlashEq) => AssignOp::Div,
            Some(Tok::PercentEq) => AssignOp::Mod,
            Some(Tok::DotEq) => AssignOp::Cat,
            Some(Tok::ShlEq) => AssignOp::Shl,
            Some(Tok::ShrEq) => AssignOp::Shr,
            Some(Tok::AmpEq) => AssignOp::Band,
            Some(Tok::PipeEq) => AssignOp::Bor,
            Some(Tok::CaretEq) => AssignOp::Bxor,
            _ => return Some(lhs),
        };
        self.pos += 1;
        if !is_lvalue(&lhs) {
            self.error("invalid assignment target".to_string());
        }
        let value = self.assign()?;
        Some(Expr::Assign {
            op,
            target: Box::new(lhs),
            value: Box::new(value),
        })
    }

    fn ternary(&mut self) -> Option<Expr> {
        let cond = self.logic_or()?;
        if !self.eat(&Tok::Question) {
            return Some(cond);
        }
        let then = self.expr()?;
        self.expect(&Tok::Colon, "':' in conditional expression");
        let els = self.ternary()?;
        Some(Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            els: Box::new(els),
        })
    }

    fn logic_or(&mut self) -> Option<Expr> {
        let mut lhs = self.logic_and()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.logic_and()?;
            lhs = bin(BinOp::Or, lhs, rhs);
        }
        Some(lhs)
    }

    fn logic_and(&mut self) -> Option<Expr> {
        let mut lhs = self.bit_or()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.bit_or()?;
            lhs = bin(BinOp::And, lhs, rhs);
        }
        Some(lhs)
    }

    fn bit_or(&mut self) -> Option<Expr> {
        let mut lhs = self.bit_xor()?;
        while self.eat(&Tok::Pipe) {
            let rhs = self.bit_xor()?;
            lhs = bin(BinOp::Bor, lhs, rhs);
        }
        Some(lhs)
    }

    fn bit_xor(&mut self) -> Option<Expr> {
        let mut lhs = self.bit_and()?;
        while self.eat(&Tok::Caret) {
            let rhs = self.bit_and()?;
            lhs = bin(BinOp::Bxor, lhs, rhs);
        }
        Some(lhs)
    }

    fn bit_and(&mut self) -> Option<Expr> {
        let mut lhs = self.equality()?;
        while self.eat(&Tok::Amp) {
            let rhs = self.equality()?;
            lhs = bin(BinOp::Band, lhs, rhs);
        }
        Some(lhs)
    }

    fn equality(&mut self) -> Option<Expr> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Tok::EqEq) => BinOp::Eq,
                Some(Tok::NotEq) => BinOp::Neq,
                Some(Tok::EqEqEq) => BinOp::Teq,
                Some(Tok::NotEqEq) => BinOp::Tne,
                _ => return Some(lhs),
            };
            self.pos += 1;
            let rhs = self.relational()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    fn relational(&mut self) -> Option<Expr> {
        let mut lhs = self.shift()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => BinOp::Lt,
                Some(Tok::Le) => BinOp::Le,
                Some(Tok::Gt) => BinOp::Gt,
                Some(Tok::Ge) => BinOp::Ge,
                _ => return Some(lhs),
            };
            self.pos += 1;
            let rhs = self.shift()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    fn shift(&mut self) -> Option<Expr> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Shl) => BinOp::Shl,
                Some(Tok::Shr) => BinOp::Shr,
                _ => return Some(lhs),
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    fn additive(&mut self) -> Option<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                // '.' not followed by an identifier concatenates; the
                // member-access reading is consumed by the postfix loop.
                Some(Tok::Dot) => BinOp::Cat,
                _ => return Some(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    fn term(&mut self) -> Option<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Mod,
                _ => return Some(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = bin(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Option<Expr> {
        if let Some(cast) = self.try_cast() {
            let expr = self.unary()?;
            return Some(Expr::Cast {
                to: cast,
                expr: Box::new(expr),
            });
        }
        let op = match self.peek() {
            Some(Tok::Minus) => Some(UnOp::Neg),
            Some(Tok::Plus) => Some(UnOp::Pos),
            Some(Tok::Not) => Some(UnOp::Not),
            Some(Tok::Tilde) => Some(UnOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let expr = self.unary()?;
            // Fold signs into numeric literals.
            if op == UnOp::Neg {
                if let Expr::Int(n) = expr {
                    return Some(Expr::Int(n.wrapping_neg()));
                }
                if let Expr::Real(r) = expr {
                    return Some(Expr::Real(-r));
                }
            }
            return Some(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        if self.eat(&Tok::PlusPlus) {
            let target = self.unary()?;
            return Some(Expr::IncDec {
                decr: false,
                post: false,
                target: Box::new(target),
            });
        }
        if self.eat(&Tok::MinusMinus) {
            let target = self.unary()?;
            return Some(Expr::IncDec {
                decr: true,
                post: false,
                target: Box::new(target),
            });
        }
        self.postfix()
    }

    /// Recognizes `(int)`, `(float)`, `(string)`, `(bool)`, `(array)`.
    fn try_cast(&mut self) -> Option<CastKind> {
        if self.peek() != Some(&Tok::LParen) {
            return None;
        }
        let kind = match self.peek_at(1)? {
            Tok::Kw(Kw::Int) => CastKind::Int,
            Tok::Kw(Kw::Float) => CastKind::Real,
            Tok::Kw(Kw::String) => CastKind::Str,
            Tok::Kw(Kw::Bool) => CastKind::Bool,
            Tok::Ident(name) if name == "array" => CastKind::Array,
            _ => return None,
        };
        if self.peek_at(2) != Some(&Tok::RParen) {
            return None;
        }
        self.pos += 3;
        Some(kind)
    }

    fn postfix(&mut self) -> Option<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Tok::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !self.eat(&Tok::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if self.eat(&Tok::Comma) {
                                continue;
                            }
                            self.expect(&Tok::RParen, "')' after call arguments");
                            break;
                        }
                    }
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    if self.eat(&Tok::RBracket) {
                        expr = Expr::Index {
                            base: Box::new(expr),
                            index: None,
                        };
                        continue;
                    }
                    let index = self.expr()?;
                    self.expect(&Tok::RBracket, "']'");
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index: Some(Box::new(index)),
                    };
                }
                // Member access: '.' immediately followed by an identifier.
                Some(Tok::Dot) => {
                    let Some(Tok::Ident(name)) = self.peek_at(1) else {
                        break;
                    };
                    let name = name.clone();
                    self.pos += 2;
                    expr = Expr::Member {
                        base: Box::new(expr),
                        name,
                    };
                }
                Some(Tok::PlusPlus) if is_lvalue(&expr) => {
                    self.pos += 1;
                    expr = Expr::IncDec {
                        decr: false,
                        post: true,
                        target: Box::new(expr),
                    };
                }
                Some(Tok::MinusMinus) if is_lvalue(&expr) => {
                    self.pos += 1;
                    expr = Expr::IncDec {
                        decr: true,
                        post: true,
                        target: Box::new(expr),
                    };
                }
                _ => break,
            }
        }
        Some(expr)
    }

    fn primary(&mut self) -> Option<Expr> {
        let line = self.line();
        let tok = self.peek()?.clone();
        match tok {
            Tok::Int(n) => {
                self.pos += 1;
                Some(Expr::Int(n))
            }
            Tok::Real(r) => {
                self.pos += 1;
                Some(Expr::Real(r))
            }
            Tok::SingleStr(s) | Tok::Nowdoc(s) => {
                self.pos += 1;
                Some(Expr::Str(s))
            }
            Tok::DoubleStr(raw) => {
                self.pos += 1;
                Some(resolve_double_quoted(&raw))
            }
            Tok::Var(name) => {
                self.pos += 1;
                Some(Expr::Var(name))
            }
            Tok::Ident(name) => {
                self.pos += 1;
                // Reserved literals resolve here, case-insensitively.
                if name.eq_ignore_ascii_case("null") {
                    return Some(Expr::Null);
                }
                if name.eq_ignore_ascii_case("true") {
                    return Some(Expr::Bool(true));
                }
                if name.eq_ignore_ascii_case("false") {
                    return Some(Expr::Bool(false));
                }
                if name == "__LINE__" {
                    return Some(Expr::MagicLine(line));
                }
                if name == "__FUNCTION__" {
                    return Some(Expr::MagicFunc);
                }
                Some(Expr::Ident(name))
            }
            Tok::Kw(Kw::Function) => {
                self.pos += 1;
                let decl = self.function_rest(String::new(), line)?;
                Some(Expr::Anon(Box::new(decl)))
            }
            Tok::LParen => {
                self.pos += 1;
                let expr = self.expr();
                self.expect(&Tok::RParen, "')'");
                expr
            }
            Tok::LBracket => {
                self.pos += 1;
                let mut entries = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        let value = self.expr()?;
                        entries.push(MapEntry { key: None, value });
                        if self.eat(&Tok::Comma) {
                            continue;
                        }
                        self.expect(&Tok::RBracket, "']' closing array literal");
                        break;
                    }
                }
                Some(Expr::MapLit { entries, object: false })
            }
            Tok::LBrace => {
                self.pos += 1;
                let mut entries = Vec::new();
                if !self.eat(&Tok::RBrace) {
                    loop {
                        let key = self.object_key()?;
                        self.expect(&Tok::Colon, "':' after object key");
                        let value = self.expr()?;
                        entries.push(MapEntry {
                            key: Some(key),
                            value,
                        });
                        if self.eat(&Tok::Comma) {
                            continue;
                        }
                        self.expect(&Tok::RBrace, "'}' closing object literal");
                        break;
                    }
                }
                Some(Expr::MapLit { entries, object: true })
            }
            other => {
                self.error(format!("unexpected token {other:?} in expression"));
                self.bump();
                None
            }
        }
    }

    /// Object-literal keys: identifiers mean their own name; anything else
    /// is an ordinary expression coerced to a key at runtime.
    fn object_key(&mut self) -> Option<Expr> {
        if let Some(Tok::Ident(name)) = self.peek() {
            let name = name.clone();
            self.pos += 1;
            return Some(Expr::Str(name));
        }
        self.expr()
    }
}

fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// Anything that can sit on the left of an assignment.
pub(crate) fn is_lvalue(expr: &Expr) -> bool {
    matches!(expr, Expr::Var(_) | Expr::Index { .. } | Expr::Member { .. })
}

/// Resolves a raw double-quoted body into literal and embedded-expression
/// parts: C-style escapes plus `$name` references with optional `.member`
/// and `[index]` trails, and the `${name}` form.
fn resolve_double_quoted(raw: &str) -> Expr {
    let bytes = raw.as_bytes();
    let mut parts: Vec<Expr> = Vec::new();
    let mut lit = String::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => {
                let (ch, used) = resolve_escape(&raw[i + 1..]);
                lit.push_str(&ch);
                i += 1 + used;
            }
            b'$' => {
                let rest = &raw[i + 1..];
                if let Some((expr_src, used)) = embedded_reference(rest) {
                    if let Some(expr) = crate::parse::parse_embedded_expr(&expr_src) {
                        if !lit.is_empty() {
                            parts.push(Expr::Str(std::mem::take(&mut lit)));
                        }
                        parts.push(expr);
                        i += 1 + used;
                        continue;
                    }
                }
                lit.push('$');
                i += 1;
            }
            b if b < 0x80 => {
                lit.push(char::from(b));
                i += 1;
            }
            _ => {
                let ch = raw[i..].chars().next().expect("valid UTF-8 source");
                lit.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    if !lit.is_empty() {
        parts.push(Expr::Str(lit));
    }
    match parts.len() {
        0 => Expr::Str(String::new()),
        1 if matches!(parts[0], Expr::Str(_)) => parts.pop().expect("checked length"),
        _ => Expr::Interp(parts),
    }
}

/// Resolves one backslash escape, returning the replacement text and the
/// number of source bytes consumed after the backslash.
fn resolve_escape(rest: &str) -> (String, usize) {
    let bytes = rest.as_bytes();
    match bytes[0] {
        b'n' => ("\n".to_string(), 1),
        b't' => ("\t".to_string(), 1),
        b'r' => ("\r".to_string(), 1),
        b'f' => ("\u{c}".to_string(), 1),
        b'v' => ("\u{b}".to_string(), 1),
        b'0'..=b'7' => {
            let mut value = 0u32;
            let mut used = 0;
            while used < 3 && used < bytes.len() && (b'0'..=b'7').contains(&bytes[used]) {
                value = value * 8 + u32::from(bytes[used] - b'0');
                used += 1;
            }
            let ch = char::from_u32(value).unwrap_or('\u{0}');
            (ch.to_string(), used)
        }
        b'x' => {
            let mut value = 0u32;
            let mut used = 1;
            while used < 3 && used < bytes.len() && bytes[used].is_ascii_hexdigit() {
                value = value * 16 + u32::from((rest.as_bytes()[used] as char).to_digit(16).unwrap_or(0));
                used += 1;
            }
            if used == 1 {
                ("x".to_string(), 1)
            } else {
                (char::from_u32(value).unwrap_or('\u{0}').to_string(), used)
            }
        }
        b'\\' => ("\\".to_string(), 1),
        b'"' => ("\"".to_string(), 1),
        b'$' => ("$".to_string(), 1),
        b'\'' => ("'".to_string(), 1),
        other => {
            // Unknown escapes keep the backslash, matching the scanner's
            // single-quote policy.
            (format!("\\{}", char::from(other)), 1)
        }
    }
}

/// Extracts the source of one embedded `$` reference: `name`, `name.attr`,
/// `name[expr]` chains, or `{name}`. Returns the expression source (with the
/// leading `$` restored) and the bytes consumed after the `$`.
fn embedded_reference(rest: &str) -> Option<(String, usize)> {
    let bytes = rest.as_bytes();
    if bytes.is_empty() {
        return None;
    }
    if bytes[0] == b'{' {
        let end = rest.find('}')?;
        let name = &rest[1..end];
        if name.is_empty() {
            return None;
        }
        return Some((format!("${name}"), end + 1));
    }
    let mut i = 0;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] >= 0x80) {
        i += 1;
    }
    if i == 0 {
        return None;
    }
    // Swallow `.member` and `[index]` trails.
    loop {
        if i + 1 < bytes.len() && bytes[i] == b'.' && (bytes[i + 1].is_ascii_alphabetic() || bytes[i + 1] == b'_') {
            i += 1;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            continue;
        }
        if i < bytes.len() && bytes[i] == b'[' {
            let mut depth = 1;
            let mut j = i + 1;
            while j < bytes.len() && depth > 0 {
                match bytes[j] {
                    b'[' => depth += 1,
                    b']' => depth -= 1,
                    _ => {}
                }
                j += 1;
            }
            if depth != 0 {
                break;
            }
            i = j;
            continue;
        }
        break;
    }
    Some((format!("${}", &rest[..i]), i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse(src: &str) -> Vec<Stmt> {
        let toks = tokenize(src).unwrap();
        let (stmts, errors) = parse_program(&toks);
        assert!(errors.is_empty(), "unexpected parse errors: {errors:?}");
        stmts
    }

    #[test]
    fn dot_is_member_before_identifier() {
        let stmts = parse("$a.users[0].name = 1;");
        let Stmt::Expr(Expr::Assign { target, .. }) = &stmts[0] else {
            panic!("expected assignment, got {stmts:?}");
        };
        let Expr::Member { base, name } = target.as_ref() else {
            panic!("expected member target");
        };
        assert_eq!(name, "name");
        assert!(matches!(base.as_ref(), Expr::Index { .. }));
    }

    #[test]
    fn dot_is_concat_before_string() {
        let stmts = parse("print $k.'='.$v.'|';");
        let Stmt::Print(args) = &stmts[0] else {
            panic!("expected print");
        };
        assert!(matches!(&args[0], Expr::Binary { op: BinOp::Cat, .. }));
    }

    #[test]
    fn precedence_mul_over_add() {
        let stmts = parse("$x = 1 + 2 * 3;");
        let Stmt::Expr(Expr::Assign { value, .. }) = &stmts[0] else {
            panic!("expected assignment");
        };
        let Expr::Binary { op: BinOp::Add, rhs, .. } = value.as_ref() else {
            panic!("expected addition at the top");
        };
        assert!(matches!(rhs.as_ref(), Expr::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn assignment_is_right_associative() {
        let stmts = parse("$a = $b = 1;");
        let Stmt::Expr(Expr::Assign { value, .. }) = &stmts[0] else {
            panic!("expected assignment");
        };
        assert!(matches!(value.as_ref(), Expr::Assign { .. }));
    }

    #[test]
    fn object_literal_keys() {
        let stmts = parse("$m = {a: 1, 'b c': 2};");
        let Stmt::Expr(Expr::Assign { value, .. }) = &stmts[0] else {
            panic!("expected assignment");
        };
        let Expr::MapLit { entries, object: true } = value.as_ref() else {
            panic!("expected object literal");
        };
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].key.as_ref().unwrap(), Expr::Str(s) if s == "a"));
    }

    #[test]
    fn switch_arms_in_order() {
        let stmts = parse("switch($x){ case 1: print 1; case 2: break; default: print 3; }");
        let Stmt::Switch { arms, .. } = &stmts[0] else {
            panic!("expected switch");
        };
        assert_eq!(arms.len(), 3);
        assert!(arms[0].guard.is_some());
        assert!(arms[2].guard.is_none());
    }

    #[test]
    fn interpolation_splits_parts() {
        let expr = resolve_double_quoted(r"hello $name\n");
        let Expr::Interp(parts) = expr else {
            panic!("expected interpolation");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], Expr::Str(s) if s == "hello "));
        assert!(matches!(&parts[1], Expr::Var(v) if v == "name"));
        assert!(matches!(&parts[2], Expr::Str(s) if s == "\n"));
    }

    #[test]
    fn interpolation_supports_paths() {
        let expr = resolve_double_quoted("$user.name and $a[0]");
        let Expr::Interp(parts) = expr else {
            panic!("expected interpolation");
        };
        assert!(matches!(&parts[0], Expr::Member { .. }));
        assert!(matches!(&parts[2], Expr::Index { .. }));
    }

    #[test]
    fn function_with_hints_and_defaults() {
        let stmts = parse("function foo(int $a, string $b = 'x') { return $a; }");
        let Stmt::Func(decl) = &stmts[0] else {
            panic!("expected function");
        };
        assert_eq!(decl.args.len(), 2);
        assert_eq!(decl.args[0].hint, Some(TypeHint::Int));
        assert!(decl.args[1].default.is_some());
    }

    #[test]
    fn error_recovery_keeps_going() {
        let toks = tokenize("$a = ; $b = 2;").unwrap();
        let (stmts, errors) = parse_program(&toks);
        assert!(!errors.is_empty());
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn anonymous_function_in_expression() {
        let stmts = parse("$f = function($x) { return $x; };");
        let Stmt::Expr(Expr::Assign { value, .. }) = &stmts[0] else {
            panic!("expected assignment");
        };
        assert!(matches!(value.as_ref(), Expr::Anon(_)));
    }
}
