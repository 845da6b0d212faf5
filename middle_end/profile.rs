//! Dynamic identity counters.
//!
//! An instrumented run of the target program reports every execution of a
//! tracked arithmetic instruction here; we classify it as an *identity
//! execution* (the result equals one of the operands, because the other
//! operand is the operation's identity element) and accumulate per-opcode
//! counts.  The dump is consumed offline when deciding which store sites
//! are worth guarding.
//!
//! The counters live in an explicit context object with an init/flush
//! lifecycle; the instrumented target is assumed to be single-threaded, so
//! no synchronization is provided.

use std::collections::BTreeMap as Map;
use std::fmt::{self, Display};
use std::io::Write;

use derive_more::Display as DeriveDisplay;
use serde::{Deserialize, Serialize};

use super::lir::Aop;

/// The tracked arithmetic opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Opcode {
    Add,
    FAdd,
    Sub,
    FSub,
    Mul,
    FMul,
    Xor,
}

/// The fixed table of tracked opcodes.  Slot lookup is a linear scan; the
/// table is seven entries long and lookup cost is dominated by the
/// instrumented workload.
pub const TRACKED: [Opcode; 7] = [
    Opcode::Add,
    Opcode::FAdd,
    Opcode::Sub,
    Opcode::FSub,
    Opcode::Mul,
    Opcode::FMul,
    Opcode::Xor,
];

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Add => "Add",
            Opcode::FAdd => "FAdd",
            Opcode::Sub => "Sub",
            Opcode::FSub => "FSub",
            Opcode::Mul => "Mul",
            Opcode::FMul => "FMul",
            Opcode::Xor => "Xor",
        }
    }

    pub fn from_name(name: &str) -> Option<Opcode> {
        TRACKED.iter().copied().find(|op| op.name() == name)
    }

    /// The tracked opcode for an LIR arithmetic operator, if it is tracked
    /// (`div` is not).
    pub fn from_aop(aop: Aop) -> Option<Opcode> {
        match aop {
            Aop::Add => Some(Opcode::Add),
            Aop::FAdd => Some(Opcode::FAdd),
            Aop::Sub => Some(Opcode::Sub),
            Aop::FSub => Some(Opcode::FSub),
            Aop::Mul => Some(Opcode::Mul),
            Aop::FMul => Some(Opcode::FMul),
            Aop::Xor => Some(Opcode::Xor),
            Aop::Div => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Opcode::FAdd | Opcode::FSub | Opcode::FMul)
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A dynamic operand value as seen by the instrumented program.
#[derive(Clone, Copy, Debug)]
pub enum OperandValue {
    Int(i64),
    Flt(f64),
}

/// Which operand supplied the identity value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IdentitySide {
    A,
    B,
}

/// The four counters of one opcode slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub total_exec: u64,
    pub identity_exec: u64,
    /// identity executions where operand `a` supplied the identity.
    pub a: u64,
    /// identity executions where operand `b` supplied the identity.
    pub b: u64,
}

/// The per-process accumulation context.  Created once at program start and
/// flushed once at exit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCounters {
    slots: [Slot; 7],
}

/// An error reading a counter dump back in.
#[derive(Clone, Debug, DeriveDisplay, Eq, PartialEq)]
pub struct CounterParseError(pub String);
impl std::error::Error for CounterParseError {}

impl IdentityCounters {
    pub fn new() -> Self {
        Self::default()
    }

    // linear lookup over the fixed table.
    fn index_of(opcode: Opcode) -> usize {
        TRACKED
            .iter()
            .position(|op| *op == opcode)
            .expect("opcode missing from the tracked table")
    }

    pub fn slot(&self, opcode: Opcode) -> &Slot {
        &self.slots[Self::index_of(opcode)]
    }

    /// Record one dynamic execution of `opcode` with operands `a` and `b`.
    pub fn record_arith(&mut self, opcode: Opcode, a: OperandValue, b: OperandValue) {
        let slot = &mut self.slots[Self::index_of(opcode)];
        slot.total_exec += 1;
        match identity_side(opcode, a, b) {
            Some(IdentitySide::A) => {
                slot.identity_exec += 1;
                slot.a += 1;
            }
            Some(IdentitySide::B) => {
                slot.identity_exec += 1;
                slot.b += 1;
            }
            None => {}
        }
    }

    /// The fraction of executions of `opcode` that were identities, or 0.0
    /// if it never executed.  Exposed for offline interpretation of the
    /// dump; the worth-transforming decision does not consult it.
    pub fn identity_ratio(&self, opcode: Opcode) -> f64 {
        let slot = self.slot(opcode);
        if slot.total_exec == 0 {
            0.0
        } else {
            slot.identity_exec as f64 / slot.total_exec as f64
        }
    }

    /// The flat text dump: one line per tracked opcode with the opcode name
    /// and the four counters.  Human-readable and unversioned; any reader
    /// must fully re-parse.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, opcode) in TRACKED.iter().enumerate() {
            let s = &self.slots[i];
            out.push_str(&format!(
                "{} {} {} {} {}\n",
                opcode.name(),
                s.total_exec,
                s.identity_exec,
                s.a,
                s.b
            ));
        }
        out
    }

    /// Flush the counters to a file.  The process calls this exactly once,
    /// at exit.
    pub fn dump_to(&self, path: &str) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(self.dump().as_bytes())
    }

    /// Re-read a flat text dump.  Lines may appear in any order; unknown
    /// opcode names are an error.
    pub fn parse(text: &str) -> Result<IdentityCounters, CounterParseError> {
        let mut seen: Map<Opcode, Slot> = Map::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(CounterParseError(format!(
                    "expected 5 fields, got {}: `{line}`",
                    fields.len()
                )));
            }
            let opcode = Opcode::from_name(fields[0])
                .ok_or_else(|| CounterParseError(format!("unknown opcode `{}`", fields[0])))?;
            let parse = |s: &str| {
                s.parse::<u64>()
                    .map_err(|e| CounterParseError(format!("bad counter `{s}`: {e}")))
            };
            seen.insert(
                opcode,
                Slot {
                    total_exec: parse(fields[1])?,
                    identity_exec: parse(fields[2])?,
                    a: parse(fields[3])?,
                    b: parse(fields[4])?,
                },
            );
        }

        let mut counters = IdentityCounters::new();
        for (opcode, slot) in seen {
            counters.slots[Self::index_of(opcode)] = slot;
        }
        Ok(counters)
    }
}

// Classify one execution: does the result equal an operand because the
// other operand is the identity element?  Zero for add and xor (either
// side) and for sub (right side only: `a - 0 = a`, but `0 - b != b`); one
// for mul (either side).  When both operands are the identity, side `a` is
// credited.
fn identity_side(opcode: Opcode, a: OperandValue, b: OperandValue) -> Option<IdentitySide> {
    use OperandValue::*;

    let int_is = |v: OperandValue, id: i64| matches!(v, Int(n) if n == id);
    let flt_is = |v: OperandValue, id: f64| matches!(v, Flt(x) if x == id);

    match opcode {
        Opcode::Add | Opcode::Xor => {
            if int_is(a, 0) {
                Some(IdentitySide::A)
            } else if int_is(b, 0) {
                Some(IdentitySide::B)
            } else {
                None
            }
        }
        Opcode::Sub => int_is(b, 0).then_some(IdentitySide::B),
        Opcode::Mul => {
            if int_is(a, 1) {
                Some(IdentitySide::A)
            } else if int_is(b, 1) {
                Some(IdentitySide::B)
            } else {
                None
            }
        }
        Opcode::FAdd => {
            if flt_is(a, 0.0) {
                Some(IdentitySide::A)
            } else if flt_is(b, 0.0) {
                Some(IdentitySide::B)
            } else {
                None
            }
        }
        Opcode::FSub => flt_is(b, 0.0).then_some(IdentitySide::B),
        Opcode::FMul => {
            if flt_is(a, 1.0) {
                Some(IdentitySide::A)
            } else if flt_is(b, 1.0) {
                Some(IdentitySide::B)
            } else {
                None
            }
        }
    }
}
