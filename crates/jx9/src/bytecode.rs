//! Bytecode representation: opcodes, instructions, containers.
//!
//! Instructions are dense structs, not packed bytes: an 8-bit opcode plus a
//! signed `p1`, an unsigned `p2` (usually a jump target or flag) and an
//! optional `p3` payload (a name, a foreach binding, a switch table). Each
//! compilation unit — top-level program, function body, default-argument
//! expression, static initializer, case guard — owns one [`Chunk`].

use std::{cell::Cell, rc::Rc};

use strum::{Display, EnumIter, IntoStaticStr};

/// The instruction set.
///
/// No opcode grows the operand stack by more than one slot; the VM relies on
/// that to pre-size each frame's stack to `chunk.len() + guard`. The
/// `max_push` table is the authoritative record and is checked exhaustively
/// by a test, so a new opcode cannot be added without classifying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, IntoStaticStr)]
pub(crate) enum Opcode {
    /// End of the unit. `p1` = 1 when a return value is on the stack.
    Done,
    /// Script termination (`die`/`exit`). `p1` = 1 when an operand is on the
    /// stack: an integer exit status or a final message.
    Halt,
    /// Unconditional jump to instruction `p2`.
    Jmp,
    /// Jump to `p2` when the popped top is falsy. `p1` = 1 keeps the operand
    /// on the stack when the jump is taken (short-circuit evaluation).
    Jz,
    /// Jump to `p2` when the popped top is truthy. `p1` as for `Jz`.
    Jnz,
    Noop,
    /// Pop and release `p1` values.
    Pop,
    /// Push the value of the variable named by `p3`. `p1` = 1 is a plain
    /// lookup that loads null when the variable is missing; `p1` = 0 creates
    /// the variable (store path). `p2` = 1 requests a map for indexed stores:
    /// a null slot autovivifies to an empty array.
    Load,
    /// Push literal-pool entry `p2`. `p1` = 1 marks the literal as a
    /// constant-expansion candidate (bare identifier).
    Loadc,
    /// Pop key and map, push `map[key]`. With no key (`p1` = 0 pops only the
    /// map: append form, store path only). `p2` = 1 creates the entry (and
    /// intermediate map) when absent, for write chains.
    LoadIdx,
    /// Allocate a map from the top `p1` stack values. `p2` = 1 builds a JSON
    /// object from key/value pairs; otherwise values get automatic indices.
    LoadMap,
    /// Store the top of stack into the variable named by `p3`, leaving the
    /// value on the stack.
    Store,
    /// Pop key and map (append form when `p1` = 0: pop just the map), store
    /// the next value into the entry, leaving the value on the stack.
    StoreIdx,
    /// Pop attribute name and map, push the member value. `p2` = 1 creates
    /// missing members as empty objects (write chains).
    Member,
    CvtInt,
    CvtReal,
    CvtStr,
    CvtBool,
    CvtNull,
    /// Numeric promotion (int or real, whichever fits the operand).
    CvtNumc,
    CvtArray,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// Compound-assign forms: `p2` = 0 targets the variable named by `p3`,
    /// `p2` = 1 targets a map entry (stack: rvalue, map, key).
    AddStore,
    SubStore,
    MulStore,
    DivStore,
    ModStore,
    /// Pop `p1` values, concatenate their string images left to right, push.
    Cat,
    CatStore,
    Band,
    Bor,
    Bxor,
    Shl,
    Shr,
    BandStore,
    BorStore,
    BxorStore,
    ShlStore,
    ShrStore,
    /// Non-short-circuit logical forms (the compiler prefers `Jz`/`Jnz`
    /// chains for `&&`/`||`; these serve computed logic).
    Land,
    Lor,
    Lxor,
    Lnot,
    BitNot,
    Uminus,
    Uplus,
    /// `++`/`--`. `p1` = 1 for the postfix flavor (pushes the old value),
    /// `p2` as for the `*Store` family, `p3` the variable name when `p2`=0.
    Incr,
    Decr,
    /// Comparisons. When `p2` != 0 the truth outcome takes the jump to `p2`
    /// instead of pushing a boolean.
    Eq,
    Neq,
    Teq,
    Tne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Pop the foreach target, validate it, allocate the step cursor bound to
    /// `p3`; jumps to `p2` when the target is not a usable map.
    ForeachInit,
    /// Advance the cursor from `p3`: bind key/value variables and fall
    /// through, or free the cursor and jump to `p2` when exhausted.
    ForeachStep,
    /// Evaluate the case guards of the `p3` table in order against the popped
    /// subject; jump to the matching case, the default, or `p2` (exit).
    Switch,
    /// Call the callee under the top `p1` argument values with those
    /// arguments (pushed bottom-up); push the result.
    Call,
    /// Pop `p1` names and alias them into the parent frame (creating there
    /// when absent).
    Uplink,
    /// Pop `p1` values, string-coerce, hand to the output consumer in source
    /// order.
    Consume,
}

impl Opcode {
    /// Maximum net number of slots the opcode can push (0 or 1).
    ///
    /// The exhaustive match is intentional: adding an opcode forces an entry
    /// here, preserving the stack-sizing invariant.
    pub(crate) fn max_push(self) -> usize {
        match self {
            Self::Done
            | Self::Halt
            | Self::Jmp
            | Self::Jz
            | Self::Jnz
            | Self::Noop
            | Self::Pop
            | Self::Store
            | Self::CvtInt
            | Self::CvtReal
            | Self::CvtStr
            | Self::CvtBool
            | Self::CvtNull
            | Self::CvtNumc
            | Self::CvtArray
            | Self::Lnot
            | Self::BitNot
            | Self::Uminus
            | Self::Uplus
            | Self::ForeachInit
            | Self::Switch
            | Self::Uplink
            | Self::Consume => 0,
            Self::Load
            | Self::Loadc
            | Self::LoadIdx
            | Self::LoadMap
            | Self::StoreIdx
            | Self::Member
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Mod
            | Self::AddStore
            | Self::SubStore
            | Self::MulStore
            | Self::DivStore
            | Self::ModStore
            | Self::Cat
            | Self::CatStore
            | Self::Band
            | Self::Bor
            | Self::Bxor
            | Self::Shl
            | Self::Shr
            | Self::BandStore
            | Self::BorStore
            | Self::BxorStore
            | Self::ShlStore
            | Self::ShrStore
            | Self::Land
            | Self::Lor
            | Self::Lxor
            | Self::Incr
            | Self::Decr
            | Self::Eq
            | Self::Neq
            | Self::Teq
            | Self::Tne
            | Self::Lt
            | Self::Le
            | Self::Gt
            | Self::Ge
            | Self::ForeachStep
            | Self::Call => 1,
        }
    }
}

/// Variable binding of one `foreach` loop.
///
/// The `Rc` identity of this record doubles as the loop-site key for the
/// frame's cursor table (`FOREACH_INIT` and `FOREACH_STEP` of one loop share
/// the same allocation), so cursors stay distinct across separately
/// compiled units that execute in one frame.
#[derive(Debug)]
pub(crate) struct ForeachBind {
    /// Optional `$k` capture.
    pub key_var: Option<Rc<str>>,
    /// The `$v` capture.
    pub value_var: Rc<str>,
}

/// One `case` arm: a guard expression in its own container plus the
/// instruction index of the arm's body.
#[derive(Debug)]
pub(crate) struct SwitchCase {
    pub guard: Chunk,
    pub target: u32,
}

/// Dispatch table of one `switch` statement.
#[derive(Debug)]
pub(crate) struct SwitchTable {
    pub cases: Vec<SwitchCase>,
    pub default_target: Option<u32>,
}

/// Opaque third operand.
#[derive(Debug, Clone, Default)]
pub(crate) enum P3 {
    #[default]
    None,
    Name(Rc<str>),
    Foreach(Rc<ForeachBind>),
    Switch(Rc<SwitchTable>),
}

/// One instruction.
#[derive(Debug, Clone)]
pub(crate) struct Instr {
    pub op: Opcode,
    pub p1: i32,
    pub p2: u32,
    pub p3: P3,
}

/// Label of a forward jump whose target is patched when known.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JumpLabel(pub usize);

/// An append-only instruction container for one compilation unit.
#[derive(Debug, Default)]
pub(crate) struct Chunk {
    instrs: Vec<Instr>,
}

impl Chunk {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.instrs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub(crate) fn get(&self, idx: usize) -> &Instr {
        &self.instrs[idx]
    }

    /// Index the next emitted instruction will occupy.
    pub(crate) fn next_offset(&self) -> u32 {
        u32::try_from(self.instrs.len()).expect("chunk exceeds u32 instructions")
    }

    /// Appends an instruction and returns its index.
    pub(crate) fn emit(&mut self, op: Opcode, p1: i32, p2: u32, p3: P3) -> usize {
        self.instrs.push(Instr { op, p1, p2, p3 });
        self.instrs.len() - 1
    }

    /// Emits a forward jump with a placeholder target.
    #[must_use]
    pub(crate) fn emit_jump(&mut self, op: Opcode, p1: i32) -> JumpLabel {
        let idx = self.emit(op, p1, u32::MAX, P3::None);
        JumpLabel(idx)
    }

    /// Points a previously emitted jump at the current end of the chunk.
    pub(crate) fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.next_offset();
        self.instrs[label.0].p2 = target;
    }

    /// Points a previously emitted jump at an explicit instruction index.
    pub(crate) fn patch_jump_to(&mut self, label: JumpLabel, target: u32) {
        self.instrs[label.0].p2 = target;
    }

    /// Replaces the `p3` payload of an instruction (switch tables are built
    /// after their instruction is emitted).
    pub(crate) fn set_p3(&mut self, idx: usize, p3: P3) {
        self.instrs[idx].p3 = p3;
    }
}

/// Formal argument of a compiled function.
#[derive(Debug)]
pub(crate) struct FuncArg {
    pub name: Rc<str>,
    /// Coercion applied when the caller's value has a different type.
    pub hint: Option<TypeHint>,
    /// Default-value expression, compiled into its own container and
    /// evaluated lazily when the caller passes null or nothing.
    pub default: Option<Chunk>,
}

/// Type hints accepted in formal argument lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeHint {
    Int,
    Real,
    Str,
    Bool,
}

impl TypeHint {
    /// Signature character used for overload resolution.
    pub(crate) fn sig_char(self) -> u8 {
        match self {
            Self::Int => b'i',
            Self::Real => b'f',
            Self::Str => b's',
            Self::Bool => b'b',
        }
    }
}

/// A per-function persistent local, initialized on first entry.
#[derive(Debug)]
pub(crate) struct StaticVar {
    pub name: Rc<str>,
    pub init: Chunk,
    /// Global-pool slot, assigned lazily; `u32::MAX` = not yet installed.
    pub slot: Cell<u32>,
}

pub(crate) const STATIC_SLOT_UNSET: u32 = u32::MAX;

/// A compiled function: metadata plus its bytecode container.
#[derive(Debug)]
pub(crate) struct VmFunc {
    pub name: Rc<str>,
    pub args: Vec<FuncArg>,
    pub statics: Vec<StaticVar>,
    pub body: Chunk,
    /// One character per formal argument (`i`/`f`/`s`/`b`, `n` = unhinted),
    /// matched against the caller's argument types for overload resolution.
    pub signature: String,
}

impl VmFunc {
    pub(crate) fn signature_of(args: &[FuncArg]) -> String {
        args.iter()
            .map(|a| a.hint.map_or('n', |h| char::from(h.sig_char())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn no_opcode_pushes_more_than_one_slot() {
        for op in Opcode::iter() {
            assert!(op.max_push() <= 1, "{op} violates the single-push stack invariant");
        }
    }

    #[test]
    fn forward_jump_patches_to_end() {
        let mut chunk = Chunk::new();
        let jump = chunk.emit_jump(Opcode::Jmp, 0);
        chunk.emit(Opcode::Noop, 0, 0, P3::None);
        chunk.patch_jump(jump);
        assert_eq!(chunk.get(0).p2, 2);
    }

    #[test]
    fn signature_string_reflects_hints() {
        let args = vec![
            FuncArg {
                name: "a".into(),
                hint: Some(TypeHint::Int),
                default: None,
            },
            FuncArg {
                name: "b".into(),
                hint: None,
                default: None,
            },
        ];
        assert_eq!(VmFunc::signature_of(&args), "in");
    }
}
