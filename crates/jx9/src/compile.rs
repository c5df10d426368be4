//! Code generator: statement forms and expression trees → bytecode.
//!
//! One container per compilation unit: the generator swaps containers when it
//! enters a function body, a default-argument expression, a static
//! initializer or a case guard, and restores on exit. Forward jumps are
//! recorded in the enclosing block record and patched when the block
//! resolves. Compile errors accumulate up to a soft cap, after which the
//! generator refuses further work.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    bytecode::{Chunk, ForeachBind, FuncArg, JumpLabel, Opcode, P3, StaticVar, SwitchCase, SwitchTable, VmFunc},
    error::{COMPILE_ERROR_LIMIT, CompileError},
    lexer,
    parse::{self, AssignOp, BinOp, CastKind, Expr, FuncDecl, Stmt, SwitchArm, UnOp},
    value::Value,
};

/// Literal-pool index of the reserved `null` constant.
pub(crate) const LIT_NULL: u32 = 0;
/// Literal-pool index of the reserved `true` constant.
pub(crate) const LIT_TRUE: u32 = 1;
/// Literal-pool index of the reserved `false` constant.
pub(crate) const LIT_FALSE: u32 = 2;

/// String literals up to this many bytes are deduplicated in the pool.
const LITERAL_DEDUP_MAX: usize = 64;

/// Everything one compilation produces.
#[derive(Debug)]
pub(crate) struct CompileOutput {
    pub main: Chunk,
    pub funcs: Vec<VmFunc>,
    /// `const` declarations: name plus the deferred value expression.
    pub consts: Vec<(Rc<str>, Chunk)>,
    /// The literal pool, extended from whatever was passed in.
    pub literals: Vec<Value>,
    /// Next anonymous-function ordinal (carried across `include`).
    pub lambda_next: u32,
}

/// Compiles a source buffer.
///
/// `literals` seeds the pool (pass the VM's pool when compiling an included
/// file so indices keep lining up); `lambda_start` continues the anonymous
/// function numbering.
pub(crate) fn compile_source(
    src: &str,
    literals: Vec<Value>,
    lambda_start: u32,
) -> Result<CompileOutput, Vec<CompileError>> {
    let tokens = match lexer::tokenize(src) {
        Ok(tokens) => tokens,
        Err((line, message)) => return Err(vec![CompileError::new(line, message)]),
    };
    let (stmts, mut errors) = parse::parse_program(&tokens);
    let mut gen = Generator::new(literals, lambda_start);
    gen.stmts(&stmts);
    gen.chunk.emit(Opcode::Done, 0, 0, P3::None);
    errors.extend(gen.errors);
    if errors.is_empty() {
        Ok(CompileOutput {
            main: gen.chunk,
            funcs: gen.funcs,
            consts: gen.consts,
            literals: gen.literals,
            lambda_next: gen.lambda_counter,
        })
    } else {
        errors.truncate(COMPILE_ERROR_LIMIT);
        Err(errors)
    }
}

/// Kinds of resolvable blocks on the generator's block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Loop,
    Switch,
}

/// One loop/switch block: pending jumps to fix when the block resolves.
#[derive(Debug)]
struct Block {
    kind: BlockKind,
    breaks: Vec<JumpLabel>,
    /// Pending `continue` jumps; patched at the loop's continuation point
    /// (deferred for `for`, whose post-expression offset is known late).
    continues: Vec<JumpLabel>,
    /// Continuation target when it is known at entry (while/foreach).
    continue_target: Option<u32>,
}

/// Per-function compile context (statics, name for `__FUNCTION__`).
#[derive(Debug, Default)]
struct FuncCtx {
    name: Rc<str>,
    statics: Vec<StaticVar>,
}

struct Generator {
    chunk: Chunk,
    literals: Vec<Value>,
    dedup: AHashMap<String, u32>,
    funcs: Vec<VmFunc>,
    consts: Vec<(Rc<str>, Chunk)>,
    errors: Vec<CompileError>,
    blocks: Vec<Block>,
    func_stack: Vec<FuncCtx>,
    lambda_counter: u32,
}

impl Generator {
    fn new(mut literals: Vec<Value>, lambda_start: u32) -> Self {
        if literals.is_empty() {
            literals.push(Value::Null);
            literals.push(Value::Bool(true));
            literals.push(Value::Bool(false));
        }
        let mut dedup = AHashMap::new();
        for (idx, lit) in literals.iter().enumerate() {
            if let Value::Str(s) = lit {
                if s.len() <= LITERAL_DEDUP_MAX {
                    dedup.entry(s.clone())
                        .or_insert(u32::try_from(idx).expect("literal pool exceeds u32"));
                }
            }
        }
        Self {
            chunk: Chunk::new(),
            literals,
            dedup,
            funcs: Vec::new(),
            consts: Vec::new(),
            errors: Vec::new(),
            blocks: Vec::new(),
            func_stack: Vec::new(),
            lambda_counter: lambda_start,
        }
    }

    fn error(&mut self, line: u32, message: impl Into<String>) {
        if self.errors.len() < COMPILE_ERROR_LIMIT {
            self.errors.push(CompileError::new(line, message.into()));
        }
    }

    // ----------------------------------------------------------------
    // Literal pool
    // ----------------------------------------------------------------

    fn add_literal(&mut self, value: Value) -> u32 {
        if let Value::Str(s) = &value {
            if s.len() <= LITERAL_DEDUP_MAX {
                if let Some(&idx) = self.dedup.get(s.as_str()) {
                    return idx;
                }
                let idx = u32::try_from(self.literals.len()).expect("literal pool exceeds u32");
                self.dedup.insert(s.clone(), idx);
                self.literals.push(value);
                return idx;
            }
        }
        let idx = u32::try_from(self.literals.len()).expect("literal pool exceeds u32");
        self.literals.push(value);
        idx
    }

    fn emit_str_literal(&mut self, s: &str) {
        let idx = self.add_literal(Value::Str(s.to_string()));
        self.chunk.emit(Opcode::Loadc, 0, idx, P3::None);
    }

    // ----------------------------------------------------------------
    // Statements
    // ----------------------------------------------------------------

    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if self.errors.len() >= COMPILE_ERROR_LIMIT {
                return;
            }
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Expr(expr) => {
                self.expr(expr);
                self.chunk.emit(Opcode::Pop, 1, 0, P3::None);
            }
            Stmt::Print(args) => {
                for arg in args {
                    self.expr(arg);
                    self.chunk.emit(Opcode::Consume, 1, 0, P3::None);
                }
            }
            Stmt::Block(body) => self.stmts(body),
            Stmt::If { arms, otherwise } => self.if_stmt(arms, otherwise.as_deref()),
            Stmt::While { cond, body } => self.while_stmt(cond, body),
            Stmt::For { init, cond, post, body } => self.for_stmt(init.as_ref(), cond.as_ref(), post.as_ref(), body),
            Stmt::Foreach {
                subject,
                key,
                value,
                body,
            } => self.foreach_stmt(subject, key.as_deref(), value, body),
            Stmt::Switch { subject, arms } => self.switch_stmt(subject, arms),
            Stmt::Break { levels, line } => self.break_stmt(*levels, *line),
            Stmt::Continue { levels, line } => self.continue_stmt(*levels, *line),
            Stmt::Return(value) => {
                let p1 = i32::from(value.is_some());
                if let Some(value) = value {
                    self.expr(value);
                }
                self.chunk.emit(Opcode::Done, p1, 0, P3::None);
            }
            Stmt::Halt(value) => {
                let p1 = i32::from(value.is_some());
                if let Some(value) = value {
                    self.expr(value);
                }
                self.chunk.emit(Opcode::Halt, p1, 0, P3::None);
            }
            Stmt::Static { name, init, line } => self.static_stmt(name, init.as_ref(), *line),
            Stmt::Const { name, value, line } => self.const_stmt(name, value, *line),
            Stmt::Uplink { names, .. } => {
                for name in names {
                    self.emit_str_literal(name);
                }
                self.chunk
                    .emit(Opcode::Uplink, i32::try_from(names.len()).unwrap_or(0), 0, P3::None);
            }
            Stmt::Func(decl) => {
                let name: Rc<str> = decl.name.as_str().into();
                self.function(decl, &name);
            }
        }
    }

    fn if_stmt(&mut self, arms: &[(Expr, Vec<Stmt>)], otherwise: Option<&[Stmt]>) {
        let mut end_jumps = Vec::new();
        for (idx, (cond, body)) in arms.iter().enumerate() {
            let false_jump = self.cond_jump(cond);
            self.stmts(body);
            let is_last = idx + 1 == arms.len() && otherwise.is_none();
            if !is_last {
                end_jumps.push(self.chunk.emit_jump(Opcode::Jmp, 0));
            }
            self.chunk.patch_jump(false_jump);
        }
        if let Some(body) = otherwise {
            self.stmts(body);
        }
        for jump in end_jumps {
            self.chunk.patch_jump(jump);
        }
    }

    fn while_stmt(&mut self, cond: &Expr, body: &[Stmt]) {
        let cond_start = self.chunk.next_offset();
        let exit_jump = self.cond_jump(cond);
        self.blocks.push(Block {
            kind: BlockKind::Loop,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_target: Some(cond_start),
        });
        self.stmts(body);
        let block = self.blocks.pop().expect("loop block pushed above");
        self.emit_jmp_to(cond_start);
        self.chunk.patch_jump(exit_jump);
        for label in block.breaks {
            self.chunk.patch_jump(label);
        }
    }

    fn for_stmt(&mut self, init: Option<&Expr>, cond: Option<&Expr>, post: Option<&Expr>, body: &[Stmt]) {
        if let Some(init) = init {
            self.expr(init);
            self.chunk.emit(Opcode::Pop, 1, 0, P3::None);
        }
        let cond_start = self.chunk.next_offset();
        let exit_jump = cond.map(|c| self.cond_jump(c));
        self.blocks.push(Block {
            kind: BlockKind::Loop,
            breaks: Vec::new(),
            continues: Vec::new(),
            // The continuation point is the post-expression, not known yet.
            continue_target: None,
        });
        self.stmts(body);
        let block = self.blocks.pop().expect("loop block pushed above");
        // `continue` lands here, on the post-expression.
        for label in block.continues {
            self.chunk.patch_jump(label);
        }
        if let Some(post) = post {
            self.expr(post);
            self.chunk.emit(Opcode::Pop, 1, 0, P3::None);
        }
        self.emit_jmp_to(cond_start);
        if let Some(label) = exit_jump {
            self.chunk.patch_jump(label);
        }
        for label in block.breaks {
            self.chunk.patch_jump(label);
        }
    }

    fn foreach_stmt(&mut self, subject: &Expr, key: Option<&str>, value: &str, body: &[Stmt]) {
        self.expr(subject);
        let bind = Rc::new(ForeachBind {
            key_var: key.map(Into::into),
            value_var: value.into(),
        });
        let init_idx = self.chunk.emit(Opcode::ForeachInit, 0, u32::MAX, P3::Foreach(Rc::clone(&bind)));
        let step_at = self.chunk.next_offset();
        let step_idx = self.chunk.emit(Opcode::ForeachStep, 0, u32::MAX, P3::Foreach(bind));
        self.blocks.push(Block {
            kind: BlockKind::Loop,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_target: Some(step_at),
        });
        self.stmts(body);
        let block = self.blocks.pop().expect("loop block pushed above");
        self.emit_jmp_to(step_at);
        let exit = self.chunk.next_offset();
        self.chunk.patch_jump_to(JumpLabel(init_idx), exit);
        self.chunk.patch_jump_to(JumpLabel(step_idx), exit);
        for label in block.breaks {
            self.chunk.patch_jump(label);
        }
    }

    fn switch_stmt(&mut self, subject: &Expr, arms: &[SwitchArm]) {
        self.expr(subject);
        let switch_idx = self.chunk.emit(Opcode::Switch, 0, u32::MAX, P3::None);
        self.blocks.push(Block {
            kind: BlockKind::Switch,
            breaks: Vec::new(),
            continues: Vec::new(),
            continue_target: None,
        });
        let mut cases = Vec::new();
        let mut default_target = None;
        for arm in arms {
            let target = self.chunk.next_offset();
            match &arm.guard {
                Some(guard) => {
                    let saved = std::mem::take(&mut self.chunk);
                    self.expr(guard);
                    self.chunk.emit(Opcode::Done, 1, 0, P3::None);
                    let guard_chunk = std::mem::replace(&mut self.chunk, saved);
                    cases.push(SwitchCase {
                        guard: guard_chunk,
                        target,
                    });
                }
                None => {
                    if default_target.is_some() {
                        self.error(0, "switch with more than one default case");
                    }
                    default_target = Some(target);
                }
            }
            self.stmts(&arm.body);
        }
        let block = self.blocks.pop().expect("switch block pushed above");
        let exit = self.chunk.next_offset();
        // No arm matched (and no default): fall out past the last body.
        self.chunk.patch_jump_to(JumpLabel(switch_idx), exit);
        self.chunk.set_p3(
            switch_idx,
            P3::Switch(Rc::new(SwitchTable {
                cases,
                default_target,
            })),
        );
        for label in block.breaks {
            self.chunk.patch_jump(label);
        }
    }

    fn break_stmt(&mut self, levels: u32, line: u32) {
        let mut remaining = levels;
        for depth in (0..self.blocks.len()).rev() {
            remaining -= 1;
            if remaining == 0 {
                let label = self.chunk.emit_jump(Opcode::Jmp, 0);
                self.blocks[depth].breaks.push(label);
                return;
            }
        }
        self.error(line, "break used outside of a loop or switch");
    }

    fn continue_stmt(&mut self, levels: u32, line: u32) {
        let mut remaining = levels;
        for depth in (0..self.blocks.len()).rev() {
            if self.blocks[depth].kind != BlockKind::Loop {
                continue;
            }
            remaining -= 1;
            if remaining == 0 {
                if let Some(target) = self.blocks[depth].continue_target {
                    self.emit_jmp_to(target);
                } else {
                    let label = self.chunk.emit_jump(Opcode::Jmp, 0);
                    self.blocks[depth].continues.push(label);
                }
                return;
            }
        }
        self.error(line, "continue used outside of a loop");
    }

    fn static_stmt(&mut self, name: &str, init: Option<&Expr>, line: u32) {
        let saved = std::mem::take(&mut self.chunk);
        match init {
            Some(expr) => {
                self.expr(expr);
            }
            None => {
                self.chunk.emit(Opcode::Loadc, 0, LIT_NULL, P3::None);
            }
        }
        self.chunk.emit(Opcode::Done, 1, 0, P3::None);
        let init_chunk = std::mem::replace(&mut self.chunk, saved);
        let Some(ctx) = self.func_stack.last_mut() else {
            self.error(line, "static declaration outside of a function body");
            return;
        };
        ctx.statics.push(StaticVar {
            name: name.into(),
            init: init_chunk,
            slot: std::cell::Cell::new(crate::bytecode::STATIC_SLOT_UNSET),
        });
    }

    fn const_stmt(&mut self, name: &str, value: &Expr, line: u32) {
        if name.is_empty() {
            self.error(line, "empty constant name");
            return;
        }
        let saved = std::mem::take(&mut self.chunk);
        self.expr(value);
        self.chunk.emit(Opcode::Done, 1, 0, P3::None);
        let chunk = std::mem::replace(&mut self.chunk, saved);
        self.consts.push((name.into(), chunk));
    }

    /// Compiles a function declaration into its own containers and registers
    /// it. Same-named registrations become overloads, resolved by signature
    /// at call time.
    fn function(&mut self, decl: &FuncDecl, name: &Rc<str>) {
        let mut args = Vec::new();
        for arg in &decl.args {
            let default = arg.default.as_ref().map(|expr| {
                let saved = std::mem::take(&mut self.chunk);
                self.expr(expr);
                self.chunk.emit(Opcode::Done, 1, 0, P3::None);
                std::mem::replace(&mut self.chunk, saved)
            });
            args.push(FuncArg {
                name: arg.name.as_str().into(),
                hint: arg.hint,
                default,
            });
        }
        let saved_chunk = std::mem::take(&mut self.chunk);
        let saved_blocks = std::mem::take(&mut self.blocks);
        self.func_stack.push(FuncCtx {
            name: Rc::clone(name),
            statics: Vec::new(),
        });
        self.stmts(&decl.body);
        self.chunk.emit(Opcode::Done, 0, 0, P3::None);
        let body = std::mem::replace(&mut self.chunk, saved_chunk);
        self.blocks = saved_blocks;
        let ctx = self.func_stack.pop().expect("pushed above");
        let signature = VmFunc::signature_of(&args);
        self.funcs.push(VmFunc {
            name: Rc::clone(name),
            args,
            statics: ctx.statics,
            body,
            signature,
        });
    }

    // ----------------------------------------------------------------
    // Expressions
    // ----------------------------------------------------------------

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Null => {
                self.chunk.emit(Opcode::Loadc, 0, LIT_NULL, P3::None);
            }
            Expr::Bool(true) => {
                self.chunk.emit(Opcode::Loadc, 0, LIT_TRUE, P3::None);
            }
            Expr::Bool(false) => {
                self.chunk.emit(Opcode::Loadc, 0, LIT_FALSE, P3::None);
            }
            Expr::Int(n) => {
                let idx = self.add_literal(Value::Int(*n));
                self.chunk.emit(Opcode::Loadc, 0, idx, P3::None);
            }
            Expr::Real(r) => {
                let idx = self.add_literal(Value::Real(*r));
                self.chunk.emit(Opcode::Loadc, 0, idx, P3::None);
            }
            Expr::Str(s) => self.emit_str_literal(s),
            Expr::MagicLine(line) => {
                let idx = self.add_literal(Value::Int(i64::from(*line)));
                self.chunk.emit(Opcode::Loadc, 0, idx, P3::None);
            }
            Expr::MagicFunc => match self.func_stack.last() {
                Some(ctx) => {
                    let name = ctx.name.to_string();
                    self.emit_str_literal(&name);
                }
                None => {
                    self.chunk.emit(Opcode::Loadc, 0, LIT_NULL, P3::None);
                }
            },
            Expr::Ident(name) => {
                // Constant-expansion candidate, resolved at execution time.
                let idx = self.add_literal(Value::Str(name.clone()));
                self.chunk.emit(Opcode::Loadc, 1, idx, P3::None);
            }
            Expr::Var(name) => {
                self.chunk.emit(Opcode::Load, 0, 0, P3::Name(name.as_str().into()));
            }
            Expr::Interp(parts) => {
                for part in parts {
                    self.expr(part);
                }
                self.chunk
                    .emit(Opcode::Cat, i32::try_from(parts.len()).unwrap_or(0), 0, P3::None);
            }
            Expr::MapLit { entries, object } => {
                for entry in entries {
                    if *object {
                        if let Some(key) = &entry.key {
                            self.expr(key);
                        } else {
                            self.chunk.emit(Opcode::Loadc, 0, LIT_NULL, P3::None);
                        }
                    }
                    self.expr(&entry.value);
                }
                let count = entries.len() * if *object { 2 } else { 1 };
                self.chunk.emit(
                    Opcode::LoadMap,
                    i32::try_from(count).unwrap_or(0),
                    u32::from(*object),
                    P3::None,
                );
            }
            Expr::Anon(decl) => {
                let name: Rc<str> = format!("[lambda_{}]", self.lambda_counter).into();
                self.lambda_counter += 1;
                self.function(decl, &name);
                self.emit_str_literal(&name);
            }
            Expr::Unary { op, expr } => {
                self.expr(expr);
                let opcode = match op {
                    UnOp::Neg => Opcode::Uminus,
                    UnOp::Pos => Opcode::Uplus,
                    UnOp::Not => Opcode::Lnot,
                    UnOp::BitNot => Opcode::BitNot,
                };
                self.chunk.emit(opcode, 0, 0, P3::None);
            }
            Expr::Binary { op: BinOp::And, lhs, rhs } => {
                self.expr(lhs);
                let end = self.chunk.emit_jump(Opcode::Jz, 1);
                self.chunk.emit(Opcode::Pop, 1, 0, P3::None);
                self.expr(rhs);
                self.chunk.patch_jump(end);
                self.chunk.emit(Opcode::CvtBool, 0, 0, P3::None);
            }
            Expr::Binary { op: BinOp::Or, lhs, rhs } => {
                self.expr(lhs);
                let end = self.chunk.emit_jump(Opcode::Jnz, 1);
                self.chunk.emit(Opcode::Pop, 1, 0, P3::None);
                self.expr(rhs);
                self.chunk.patch_jump(end);
                self.chunk.emit(Opcode::CvtBool, 0, 0, P3::None);
            }
            Expr::Binary { op, lhs, rhs } => {
                self.expr(lhs);
                self.expr(rhs);
                if *op == BinOp::Cat {
                    self.chunk.emit(Opcode::Cat, 2, 0, P3::None);
                } else {
                    self.chunk.emit(binary_opcode(*op), 0, 0, P3::None);
                }
            }
            Expr::Assign { op, target, value } => self.assign(*op, target, value),
            Expr::IncDec { decr, post, target } => self.inc_dec(*decr, *post, target),
            Expr::Ternary { cond, then, els } => {
                let else_jump = self.cond_jump(cond);
                self.expr(then);
                let end_jump = self.chunk.emit_jump(Opcode::Jmp, 0);
                self.chunk.patch_jump(else_jump);
                self.expr(els);
                self.chunk.patch_jump(end_jump);
            }
            Expr::Index { base, index } => {
                self.expr(base);
                match index {
                    Some(index) => {
                        self.expr(index);
                        self.chunk.emit(Opcode::LoadIdx, 1, 0, P3::None);
                    }
                    None => {
                        self.error(0, "cannot use the append form [] in a read context");
                    }
                }
            }
            Expr::Member { base, name } => {
                self.expr(base);
                self.emit_str_literal(name);
                self.chunk.emit(Opcode::Member, 0, 0, P3::None);
            }
            Expr::Call { callee, args } => {
                for arg in args {
                    self.expr(arg);
                }
                match callee.as_ref() {
                    // A bare name is the common case: load it as a plain
                    // string so a same-named constant cannot shadow it.
                    Expr::Ident(name) => self.emit_str_literal(name),
                    other => self.expr(other),
                }
                self.chunk
                    .emit(Opcode::Call, i32::try_from(args.len()).unwrap_or(0), 0, P3::None);
            }
            Expr::Cast { to, expr } => {
                self.expr(expr);
                let opcode = match to {
                    CastKind::Int => Opcode::CvtInt,
                    CastKind::Real => Opcode::CvtReal,
                    CastKind::Str => Opcode::CvtStr,
                    CastKind::Bool => Opcode::CvtBool,
                    CastKind::Array => Opcode::CvtArray,
                };
                self.chunk.emit(opcode, 0, 0, P3::None);
            }
        }
    }

    /// Compiles a condition and emits the jump taken when it is false.
    ///
    /// Comparison nodes fuse into the comparison opcodes' jump form (the
    /// operator is inverted so the jump fires when the original condition
    /// fails); anything else evaluates and tests with `Jz`.
    fn cond_jump(&mut self, cond: &Expr) -> JumpLabel {
        if let Expr::Binary { op, lhs, rhs } = cond {
            if let Some(inverted) = invert_comparison(*op) {
                self.expr(lhs);
                self.expr(rhs);
                let idx = self.chunk.emit(binary_opcode(inverted), 0, u32::MAX, P3::None);
                return JumpLabel(idx);
            }
        }
        self.expr(cond);
        self.chunk.emit_jump(Opcode::Jz, 0)
    }

    fn assign(&mut self, op: AssignOp, target: &Expr, value: &Expr) {
        // The rvalue always evaluates first.
        self.expr(value);
        match target {
            Expr::Var(name) => {
                let p3 = P3::Name(name.as_str().into());
                match assign_opcode(op) {
                    None => {
                        self.chunk.emit(Opcode::Store, 0, 0, p3);
                    }
                    Some(opcode) => {
                        self.chunk.emit(opcode, 0, 0, p3);
                    }
                }
            }
            Expr::Index { base, index } => {
                self.lvalue_base(base);
                match index {
                    Some(index) => {
                        self.expr(index);
                        match assign_opcode(op) {
                            None => {
                                self.chunk.emit(Opcode::StoreIdx, 1, 0, P3::None);
                            }
                            Some(opcode) => {
                                self.chunk.emit(opcode, 0, 1, P3::None);
                            }
                        }
                    }
                    None => {
                        if assign_opcode(op).is_some() {
                            self.error(0, "compound assignment cannot use the append form []");
                            return;
                        }
                        self.chunk.emit(Opcode::StoreIdx, 0, 0, P3::None);
                    }
                }
            }
            Expr::Member { base, name } => {
                self.lvalue_base(base);
                self.emit_str_literal(name);
                match assign_opcode(op) {
                    None => {
                        self.chunk.emit(Opcode::StoreIdx, 1, 0, P3::None);
                    }
                    Some(opcode) => {
                        self.chunk.emit(opcode, 0, 1, P3::None);
                    }
                }
            }
            _ => self.error(0, "invalid assignment target"),
        }
    }

    /// Compiles the container part of a store chain: each link loads with
    /// the create flag so missing entries autovivify.
    fn lvalue_base(&mut self, base: &Expr) {
        match base {
            Expr::Var(name) => {
                self.chunk.emit(Opcode::Load, 0, 1, P3::Name(name.as_str().into()));
            }
            Expr::Index { base, index } => {
                self.lvalue_base(base);
                match index {
                    Some(index) => {
                        self.expr(index);
                        self.chunk.emit(Opcode::LoadIdx, 1, 1, P3::None);
                    }
                    None => self.error(0, "cannot chain through the append form []"),
                }
            }
            Expr::Member { base, name } => {
                self.lvalue_base(base);
                self.emit_str_literal(name);
                self.chunk.emit(Opcode::Member, 0, 1, P3::None);
            }
            other => self.expr(other),
        }
    }

    fn inc_dec(&mut self, decr: bool, post: bool, target: &Expr) {
        let opcode = if decr { Opcode::Decr } else { Opcode::Incr };
        match target {
            Expr::Var(name) => {
                self.chunk
                    .emit(opcode, i32::from(post), 0, P3::Name(name.as_str().into()));
            }
            Expr::Index {
                base,
                index: Some(index),
            } => {
                self.lvalue_base(base);
                self.expr(index);
                self.chunk.emit(opcode, i32::from(post), 1, P3::None);
            }
            Expr::Member { base, name } => {
                self.lvalue_base(base);
                self.emit_str_literal(name);
                self.chunk.emit(opcode, i32::from(post), 1, P3::None);
            }
            _ => self.error(0, "increment target must be assignable"),
        }
    }

    fn emit_jmp_to(&mut self, target: u32) {
        self.chunk.emit(Opcode::Jmp, 0, target, P3::None);
    }
}

/// Maps a comparison operator to its negation for jump fusion.
fn invert_comparison(op: BinOp) -> Option<BinOp> {
    Some(match op {
        BinOp::Eq => BinOp::Neq,
        BinOp::Neq => BinOp::Eq,
        BinOp::Teq => BinOp::Tne,
        BinOp::Tne => BinOp::Teq,
        BinOp::Lt => BinOp::Ge,
        BinOp::Le => BinOp::Gt,
        BinOp::Gt => BinOp::Le,
        BinOp::Ge => BinOp::Lt,
        _ => return None,
    })
}

fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::Shl => Opcode::Shl,
        BinOp::Shr => Opcode::Shr,
        BinOp::Lt => Opcode::Lt,
        BinOp::Le => Opcode::Le,
        BinOp::Gt => Opcode::Gt,
        BinOp::Ge => Opcode::Ge,
        BinOp::Eq => Opcode::Eq,
        BinOp::Neq => Opcode::Neq,
        BinOp::Teq => Opcode::Teq,
        BinOp::Tne => Opcode::Tne,
        BinOp::Band => Opcode::Band,
        BinOp::Bxor => Opcode::Bxor,
        BinOp::Bor => Opcode::Bor,
        BinOp::And => Opcode::Land,
        BinOp::Or => Opcode::Lor,
        BinOp::Cat => Opcode::Cat,
    }
}

/// Compound-assignment opcode, or `None` for plain `=`.
fn assign_opcode(op: AssignOp) -> Option<Opcode> {
    Some(match op {
        AssignOp::Assign => return None,
        AssignOp::Add => Opcode::AddStore,
        AssignOp::Sub => Opcode::SubStore,
        AssignOp::Mul => Opcode::MulStore,
        AssignOp::Div => Opcode::DivStore,
        AssignOp::Mod => Opcode::ModStore,
        AssignOp::Cat => Opcode::CatStore,
        AssignOp::Shl => Opcode::ShlStore,
        AssignOp::Shr => Opcode::ShrStore,
        AssignOp::Band => Opcode::BandStore,
        AssignOp::Bor => Opcode::BorStore,
        AssignOp::Bxor => Opcode::BxorStore,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> CompileOutput {
        compile_source(src, Vec::new(), 0).expect("compiles")
    }

    fn ops(chunk: &Chunk) -> Vec<Opcode> {
        (0..chunk.len()).map(|i| chunk.get(i).op).collect()
    }

    #[test]
    fn print_consumes_each_argument() {
        let out = compile("print 1, 2;");
        assert_eq!(
            ops(&out.main),
            vec![
                Opcode::Loadc,
                Opcode::Consume,
                Opcode::Loadc,
                Opcode::Consume,
                Opcode::Done
            ]
        );
    }

    #[test]
    fn string_literals_dedup() {
        let out = compile("print 'x'; print 'x';");
        // Pool: null, true, false, "x" (once).
        assert_eq!(out.literals.len(), 4);
    }

    #[test]
    fn if_condition_fuses_comparison() {
        let out = compile("if ($a == 1) { print 1; }");
        let ops = ops(&out.main);
        // The fused form jumps on inequality; no separate Jz appears.
        assert!(ops.contains(&Opcode::Neq));
        assert!(!ops.contains(&Opcode::Jz));
    }

    #[test]
    fn short_circuit_and_keeps_operand() {
        let out = compile("$x = $a && $b;");
        let ops = ops(&out.main);
        let jz_pos = ops.iter().position(|&op| op == Opcode::Jz).expect("Jz emitted");
        assert_eq!(out.main.get(jz_pos).p1, 1, "operand stays on the stack");
    }

    #[test]
    fn functions_are_collected_with_signatures() {
        let out = compile("function foo(int $a) { return $a; } function foo(string $a) { return $a; }");
        assert_eq!(out.funcs.len(), 2);
        assert_eq!(out.funcs[0].signature, "i");
        assert_eq!(out.funcs[1].signature, "s");
    }

    #[test]
    fn lambda_names_are_sequential() {
        let out = compile("$f = function() { return 1; }; $g = function() { return 2; };");
        assert_eq!(&*out.funcs[0].name, "[lambda_0]");
        assert_eq!(&*out.funcs[1].name, "[lambda_1]");
    }

    #[test]
    fn switch_table_covers_arms() {
        let out = compile("switch($x){ case 1: print 1; break; default: print 2; }");
        let switch_idx = (0..out.main.len())
            .find(|&i| out.main.get(i).op == Opcode::Switch)
            .expect("switch emitted");
        let P3::Switch(table) = &out.main.get(switch_idx).p3 else {
            panic!("switch table missing");
        };
        assert_eq!(table.cases.len(), 1);
        assert!(table.default_target.is_some());
    }

    #[test]
    fn compound_index_assign_uses_store_form() {
        let out = compile("$a[0] += 2;");
        let ops = ops(&out.main);
        assert!(ops.contains(&Opcode::AddStore));
        // The rvalue comes first, then the lvalue chain.
        assert_eq!(ops[0], Opcode::Loadc);
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let err = compile_source("break;", Vec::new(), 0).unwrap_err();
        assert!(err[0].message.contains("break"));
    }

    #[test]
    fn error_cap_stops_compilation() {
        let src = "$a = ;".repeat(40);
        let err = compile_source(&src, Vec::new(), 0).unwrap_err();
        assert!(err.len() <= COMPILE_ERROR_LIMIT);
    }
}
