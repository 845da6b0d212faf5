//! The LIR: a small SSA program representation that the analyses and the
//! guard-insertion transformation operate on.
//!
//! Programs have a textual format (see `fromstr_impl`) and the `Display`
//! impls round-trip it, which is what the optimization tests rely on.

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt::{self, Display};

use hashconsing::{consign, HConsed, HashConsign};

use crate::commons::{Valid, ValidationError};

mod fromstr_impl;
pub mod cfg_dump_impl;

pub use fromstr_impl::ParseError;

// SECTION: types

/// An interned LIR type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Type(pub HConsed<LirType>);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LirType {
    Int,
    Flt,
    Pointer(Type),
    Vector(Type, usize),
}

consign! {
    // The global type interner.
    let TYPES = consign(37) for LirType;
}

pub fn int_ty() -> Type {
    Type(TYPES.mk(LirType::Int))
}

pub fn flt_ty() -> Type {
    Type(TYPES.mk(LirType::Flt))
}

pub fn ptr_ty(inner: Type) -> Type {
    Type(TYPES.mk(LirType::Pointer(inner)))
}

pub fn vec_ty(elem: Type, lanes: usize) -> Type {
    Type(TYPES.mk(LirType::Vector(elem, lanes)))
}

impl Type {
    pub fn is_int(&self) -> bool {
        *self.0 == LirType::Int
    }

    pub fn is_flt(&self) -> bool {
        *self.0 == LirType::Flt
    }

    pub fn is_ptr(&self) -> bool {
        matches!(&*self.0, LirType::Pointer(_))
    }

    pub fn is_vector(&self) -> bool {
        matches!(&*self.0, LirType::Vector(..))
    }

    // the pointed-to type, if this is a pointer type.
    pub fn pointee(&self) -> Option<Type> {
        match &*self.0 {
            LirType::Pointer(inner) => Some(inner.clone()),
            _ => None,
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            LirType::Int => write!(f, "int"),
            LirType::Flt => write!(f, "flt"),
            LirType::Pointer(inner) => write!(f, "&{inner}"),
            LirType::Vector(elem, lanes) => write!(f, "vec<{elem}, {lanes}>"),
        }
    }
}

// SECTION: identifiers

/// A variable, together with its declared type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId {
    name: String,
    typ: Type,
}

pub fn var_id(name: &str, typ: Type) -> VarId {
    VarId {
        name: name.to_string(),
        typ,
    }
}

impl VarId {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn typ(&self) -> Type {
        self.typ.clone()
    }
}

impl Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A basic block label.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BbId(String);

pub fn bb_id(name: &str) -> BbId {
    BbId(name.to_string())
}

impl BbId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Display for BbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A function name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(String);

pub fn func_id(name: &str) -> FuncId {
    FuncId(name.to_string())
}

impl Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// SECTION: operands and operators

/// An instruction operand: a variable or a literal constant.
#[derive(Clone, Debug)]
pub enum Operand {
    Var(VarId),
    CInt(i64),
    CFlt(f64),
}

impl Operand {
    pub fn typ(&self) -> Type {
        match self {
            Operand::Var(v) => v.typ(),
            Operand::CInt(_) => int_ty(),
            Operand::CFlt(_) => flt_ty(),
        }
    }

    pub fn as_var(&self) -> Option<&VarId> {
        match self {
            Operand::Var(v) => Some(v),
            _ => None,
        }
    }
}

// Float literals are compared by bit pattern so that operands can live in
// ordered containers.
impl PartialEq for Operand {
    fn eq(&self, other: &Self) -> bool {
        use Operand::*;
        match (self, other) {
            (Var(a), Var(b)) => a == b,
            (CInt(a), CInt(b)) => a == b,
            (CFlt(a), CFlt(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Operand {}

impl PartialOrd for Operand {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Operand {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use Operand::*;
        fn rank(op: &Operand) -> u8 {
            match op {
                Var(_) => 0,
                CInt(_) => 1,
                CFlt(_) => 2,
            }
        }
        match (self, other) {
            (Var(a), Var(b)) => a.cmp(b),
            (CInt(a), CInt(b)) => a.cmp(b),
            (CFlt(a), CFlt(b)) => a.to_bits().cmp(&b.to_bits()),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(v) => write!(f, "{v}"),
            Operand::CInt(n) => write!(f, "{n}"),
            Operand::CFlt(x) => write!(f, "{x:?}"),
        }
    }
}

/// Arithmetic operators.  The f-prefixed ones operate on `flt` operands,
/// mirroring how the tracked-opcode table distinguishes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Aop {
    Add,
    Sub,
    Mul,
    Div,
    Xor,
    FAdd,
    FSub,
    FMul,
}

impl Aop {
    pub fn is_float(&self) -> bool {
        matches!(self, Aop::FAdd | Aop::FSub | Aop::FMul)
    }
}

impl Display for Aop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Aop::Add => "add",
            Aop::Sub => "sub",
            Aop::Mul => "mul",
            Aop::Div => "div",
            Aop::Xor => "xor",
            Aop::FAdd => "fadd",
            Aop::FSub => "fsub",
            Aop::FMul => "fmul",
        };
        write!(f, "{s}")
    }
}

/// Comparison operators.  `Fone` is the ordered not-equal used for guards
/// over floating-point values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rop {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Fone,
}

impl Display for Rop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rop::Eq => "eq",
            Rop::Neq => "neq",
            Rop::Lt => "lt",
            Rop::Lte => "lte",
            Rop::Gt => "gt",
            Rop::Gte => "gte",
            Rop::Fone => "fone",
        };
        write!(f, "{s}")
    }
}

// SECTION: instructions and terminals

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Instruction {
    Arith {
        lhs: VarId,
        aop: Aop,
        op1: Operand,
        op2: Operand,
    },
    Cmp {
        lhs: VarId,
        rop: Rop,
        op1: Operand,
        op2: Operand,
    },
    Copy {
        lhs: VarId,
        op: Operand,
    },
    Load {
        lhs: VarId,
        src: VarId,
    },
    Store {
        dst: VarId,
        op: Operand,
    },
    Gep {
        lhs: VarId,
        src: VarId,
        idx: Operand,
    },
    Phi {
        lhs: VarId,
        ops: Vec<Operand>,
    },
    CallExt {
        lhs: Option<VarId>,
        ext_callee: String,
        args: Vec<Operand>,
    },
}

impl Instruction {
    /// The variable this instruction defines, if any (stores and void
    /// external calls define nothing).
    pub fn lhs(&self) -> Option<&VarId> {
        use Instruction::*;
        match self {
            Arith { lhs, .. } | Cmp { lhs, .. } | Copy { lhs, .. } | Load { lhs, .. }
            | Gep { lhs, .. } | Phi { lhs, .. } => Some(lhs),
            CallExt { lhs, .. } => lhs.as_ref(),
            Store { .. } => None,
        }
    }

    /// All operands read by this instruction.
    pub fn operands(&self) -> Vec<&Operand> {
        use Instruction::*;
        match self {
            Arith { op1, op2, .. } | Cmp { op1, op2, .. } => vec![op1, op2],
            Copy { op, .. } => vec![op],
            Load { .. } => vec![],
            Store { op, .. } => vec![op],
            Gep { idx, .. } => vec![idx],
            Phi { ops, .. } => ops.iter().collect(),
            CallExt { args, .. } => args.iter().collect(),
        }
    }

    /// All variables read by this instruction, including the address
    /// operands of loads, stores and geps.
    pub fn used_vars(&self) -> Vec<&VarId> {
        use Instruction::*;
        let mut vars: Vec<&VarId> = self.operands().iter().filter_map(|op| op.as_var()).collect();
        match self {
            Load { src, .. } | Gep { src, .. } => vars.push(src),
            Store { dst, .. } => vars.push(dst),
            _ => {}
        }
        vars
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match self {
            Arith { lhs, aop, op1, op2 } => write!(f, "{lhs} = $arith {aop} {op1} {op2}"),
            Cmp { lhs, rop, op1, op2 } => write!(f, "{lhs} = $cmp {rop} {op1} {op2}"),
            Copy { lhs, op } => write!(f, "{lhs} = $copy {op}"),
            Load { lhs, src } => write!(f, "{lhs} = $load {src}"),
            Store { dst, op } => write!(f, "$store {dst} {op}"),
            Gep { lhs, src, idx } => write!(f, "{lhs} = $gep {src} {idx}"),
            Phi { lhs, ops } => {
                write!(f, "{lhs} = $phi(")?;
                for (i, op) in ops.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{op}")?;
                }
                write!(f, ")")
            }
            CallExt {
                lhs,
                ext_callee,
                args,
            } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                write!(f, "$call_ext {ext_callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Terminal {
    Branch { cond: Operand, tt: BbId, ff: BbId },
    Jump(BbId),
    Ret(Option<Operand>),
}

impl Terminal {
    pub fn used_vars(&self) -> Vec<&VarId> {
        match self {
            Terminal::Branch { cond, .. } => cond.as_var().into_iter().collect(),
            Terminal::Ret(Some(op)) => op.as_var().into_iter().collect(),
            _ => vec![],
        }
    }
}

impl Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminal::Branch { cond, tt, ff } => write!(f, "$branch {cond} {tt} {ff}"),
            Terminal::Jump(bb) => write!(f, "$jump {bb}"),
            Terminal::Ret(Some(op)) => write!(f, "$ret {op}"),
            Terminal::Ret(None) => write!(f, "$ret"),
        }
    }
}

// SECTION: blocks, functions, programs

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BbId,
    pub insts: Vec<Instruction>,
    pub term: Terminal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub id: FuncId,
    pub params: Vec<VarId>,
    pub ret_ty: Option<Type>,
    pub locals: Set<VarId>,
    pub body: Map<BbId, BasicBlock>,
}

impl Function {
    /// The location `(block, index)` of the instruction defining `v`, if `v`
    /// is defined by an instruction (as opposed to being a parameter).
    pub fn def_site(&self, v: &VarId) -> Option<(BbId, usize)> {
        for (bbid, bb) in &self.body {
            for (idx, inst) in bb.insts.iter().enumerate() {
                if inst.lhs() == Some(v) {
                    return Some((bbid.clone(), idx));
                }
            }
        }
        None
    }

    /// All instruction locations that read `v`.  Terminal reads are reported
    /// with index `usize::MAX`.
    pub fn use_sites(&self, v: &VarId) -> Vec<(BbId, usize)> {
        let mut uses = vec![];
        for (bbid, bb) in &self.body {
            for (idx, inst) in bb.insts.iter().enumerate() {
                if inst.used_vars().contains(&v) {
                    uses.push((bbid.clone(), idx));
                }
            }
            if bb.term.used_vars().contains(&v) {
                uses.push((bbid.clone(), usize::MAX));
            }
        }
        uses
    }

    // a variable name that doesn't collide with any declared variable.
    pub fn fresh_var(&self, prefix: &str, typ: Type) -> VarId {
        let taken: Set<&str> = self
            .params
            .iter()
            .chain(self.locals.iter())
            .map(|v| v.name())
            .collect();
        let mut n = 0;
        loop {
            let name = format!("{prefix}{n}");
            if !taken.contains(name.as_str()) {
                return var_id(&name, typ);
            }
            n += 1;
        }
    }

    // a block label that doesn't collide with any existing block.
    pub fn fresh_bb(&self, prefix: &str) -> BbId {
        let mut n = 0;
        loop {
            let id = bb_id(&format!("{prefix}{n}"));
            if !self.body.contains_key(&id) {
                return id;
            }
            n += 1;
        }
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.id)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", p, p.typ())?;
        }
        write!(f, ") -> ")?;
        match &self.ret_ty {
            Some(t) => writeln!(f, "{t} {{")?,
            None => writeln!(f, "_ {{")?,
        }
        if !self.locals.is_empty() {
            write!(f, "let ")?;
            for (i, v) in self.locals.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}:{}", v, v.typ())?;
            }
            writeln!(f)?;
        }
        // entry first, then the rest in label order.
        let entry = bb_id("entry");
        let mut order: Vec<&BbId> = vec![&entry];
        order.extend(self.body.keys().filter(|id| **id != entry));
        for bbid in order {
            let bb = &self.body[bbid];
            writeln!(f, "{bbid}:")?;
            for inst in &bb.insts {
                writeln!(f, "  {inst}")?;
            }
            writeln!(f, "  {}", bb.term)?;
        }
        writeln!(f, "}}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    pub functions: Map<FuncId, Function>,
}

impl Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for func in self.functions.values() {
            writeln!(f, "{func}")?;
        }
        Ok(())
    }
}

// SECTION: validation

impl Program {
    /// Check the structural invariants every analysis assumes: each function
    /// has an entry block and exactly one returning block, every branch
    /// target exists, every used variable is declared, and every variable is
    /// defined by at most one instruction (SSA).
    pub fn validate(self) -> Result<Valid<Program>, ValidationError> {
        for f in self.functions.values() {
            validate_function(f)?;
        }
        Ok(Valid(self))
    }
}

fn validate_function(f: &Function) -> Result<(), ValidationError> {
    let err = |msg: String| Err(ValidationError(format!("{}: {msg}", f.id)));

    if !f.body.contains_key(&bb_id("entry")) {
        return err("no entry block".to_string());
    }

    let mut ret_blocks = 0;
    for (bbid, bb) in &f.body {
        if bb.id != *bbid {
            return err(format!("block {bbid} disagrees with its own label"));
        }
        match &bb.term {
            Terminal::Branch { tt, ff, .. } => {
                for target in [tt, ff] {
                    if !f.body.contains_key(target) {
                        return err(format!("{bbid} branches to nonexistent {target}"));
                    }
                }
            }
            Terminal::Jump(target) => {
                if !f.body.contains_key(target) {
                    return err(format!("{bbid} jumps to nonexistent {target}"));
                }
            }
            Terminal::Ret(_) => ret_blocks += 1,
        }
    }
    if ret_blocks != 1 {
        // a unique exit block keeps the post-dominator tree rooted.
        return err(format!("expected exactly one $ret block, found {ret_blocks}"));
    }

    let declared: Set<&VarId> = f.params.iter().chain(f.locals.iter()).collect();
    let mut defined: Set<&VarId> = Set::new();
    for bb in f.body.values() {
        for inst in &bb.insts {
            if let Some(lhs) = inst.lhs() {
                if !declared.contains(lhs) {
                    return err(format!("assignment to undeclared variable {lhs}"));
                }
                if !defined.insert(lhs) {
                    return err(format!("{lhs} is defined more than once"));
                }
            }
            for v in inst.used_vars() {
                if !declared.contains(v) {
                    return err(format!("use of undeclared variable {v}"));
                }
            }
        }
        for v in bb.term.used_vars() {
            if !declared.contains(v) {
                return err(format!("use of undeclared variable {v}"));
            }
        }
    }

    Ok(())
}
