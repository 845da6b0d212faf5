//! Code motion around a candidate store: block splitting, guard insertion
//! and relocation of the store's closure into the guarded block.
//!
//! Every structural edit reports the CFG edges it changed as a list of
//! [`EdgeDelta`]s plus the blocks it created, so the caller can patch its
//! dominator tree and loop info instead of recomputing them.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::middle_end::analysis::dominators::EdgeDelta;
use crate::middle_end::analysis::InstId;
use crate::middle_end::lir::*;

/// What a structural edit did to the CFG: the edge changes to replay into
/// the incremental analyses, and `(new_block, origin_block)` pairs for loop
/// membership updates.
#[derive(Clone, Debug, Default)]
pub struct GuardOutcome {
    pub deltas: Vec<EdgeDelta>,
    pub new_blocks: Vec<(BbId, BbId)>,
    pub then_bb: Option<BbId>,
}

impl GuardOutcome {
    pub fn merge(&mut self, other: GuardOutcome) {
        self.deltas.extend(other.deltas);
        self.new_blocks.extend(other.new_blocks);
        if other.then_bb.is_some() {
            self.then_bb = other.then_bb;
        }
    }
}

fn successors(term: &Terminal) -> Vec<BbId> {
    match term {
        Terminal::Branch { tt, ff, .. } => vec![tt.clone(), ff.clone()],
        Terminal::Jump(bb) => vec![bb.clone()],
        Terminal::Ret(_) => vec![],
    }
}

// splits `bb` so that instructions `[at..]` and the old terminal land in a
// fresh block, with `bb` jumping to it.
fn split_at(f: &mut Function, bb: &BbId, at: usize) -> (BbId, GuardOutcome) {
    let new_id = f.fresh_bb("split");
    let block = f.body.get_mut(bb).expect("split_at: unknown block");
    let tail = block.insts.split_off(at);
    let old_term = std::mem::replace(&mut block.term, Terminal::Jump(new_id.clone()));

    let mut deltas = vec![EdgeDelta::Insert(bb.clone(), new_id.clone())];
    for succ in successors(&old_term) {
        deltas.push(EdgeDelta::Delete(bb.clone(), succ.clone()));
        deltas.push(EdgeDelta::Insert(new_id.clone(), succ));
    }
    f.body.insert(
        new_id.clone(),
        BasicBlock {
            id: new_id.clone(),
            insts: tail,
            term: old_term,
        },
    );

    let outcome = GuardOutcome {
        deltas,
        new_blocks: vec![(new_id.clone(), bb.clone())],
        then_bb: None,
    };
    (new_id, outcome)
}

/// Splits a block right after the instruction at `loc`, leaving `loc` as
/// the last instruction of its block.  Returns the new successor block.
pub fn split_after(f: &mut Function, loc: &InstId) -> (BbId, GuardOutcome) {
    split_at(f, &loc.0, loc.1 + 1)
}

/// If `bb` starts with `$phi` instructions, splits the phis off into their
/// own header so the remainder of the block can be restructured freely.
/// Returns the block now holding the non-phi instructions.
pub fn split_phi_header(f: &mut Function, bb: &BbId) -> Option<(BbId, GuardOutcome)> {
    let block = &f.body[bb];
    if !matches!(block.insts.first(), Some(Instruction::Phi { .. })) {
        return None;
    }
    let first_non_phi = block
        .insts
        .iter()
        .position(|i| !matches!(i, Instruction::Phi { .. }))
        .unwrap_or(block.insts.len());
    Some(split_at(f, bb, first_non_phi))
}

// the transitive operand chain of `roots`, over instruction-defined
// variables.  Anything here must stay where the comparison can read it.
fn operand_chain(f: &Function, roots: &[&Operand]) -> Set<VarId> {
    let mut chain: Set<VarId> = Set::new();
    let mut stack: Vec<VarId> = roots.iter().filter_map(|op| op.as_var().cloned()).collect();
    while let Some(v) = stack.pop() {
        let Some((bb, idx)) = f.def_site(&v) else {
            continue;
        };
        if !chain.insert(v) {
            continue;
        }
        for used in f.body[&bb].insts[idx].used_vars() {
            stack.push(used.clone());
        }
    }
    chain
}

/// Rewrites `store_bb`, which must end with the candidate store followed by
/// an unconditional jump, into a guarded form:
///
/// ```text
///   store_bb:  cmp0 = $cmp <rop> lhs rhs    then0:  <closure members>
///              $branch cmp0 then0 merge             $store ...
///                                                   $jump merge
/// ```
///
/// Closure members (identified by the variables they define, in discovery
/// order) are relocated into the then block in reversed discovery order so
/// definitions precede uses.  Members the comparison operands transitively
/// depend on are left in place.  Precondition violations panic; this
/// function is only called on geometry the driver has already validated.
pub fn insert_guard(
    f: &mut Function,
    store_bb: &BbId,
    cmp_lhs: Operand,
    cmp_rhs: Operand,
    closure: &[VarId],
) -> GuardOutcome {
    assert_eq!(
        cmp_lhs.typ(),
        cmp_rhs.typ(),
        "insert_guard: comparison operands must agree on type"
    );
    let rop = if cmp_lhs.typ().is_flt() { Rop::Fone } else { Rop::Neq };
    let pinned = operand_chain(f, &[&cmp_lhs, &cmp_rhs]);

    let cmp_var = f.fresh_var("cmp", int_ty());
    let then_id = f.fresh_bb("then");

    let block = f.body.get_mut(store_bb).expect("insert_guard: unknown block");
    let store = block
        .insts
        .pop()
        .expect("insert_guard: block must end with the candidate store");
    assert!(
        matches!(store, Instruction::Store { .. }),
        "insert_guard: block must end with the candidate store"
    );
    let Terminal::Jump(merge_id) = block.term.clone() else {
        panic!("insert_guard: store block must fall through to the merge block");
    };

    block.insts.push(Instruction::Cmp {
        lhs: cmp_var.clone(),
        rop,
        op1: cmp_lhs,
        op2: cmp_rhs,
    });
    block.term = Terminal::Branch {
        cond: Operand::Var(cmp_var.clone()),
        tt: then_id.clone(),
        ff: merge_id.clone(),
    };
    f.locals.insert(cmp_var);

    // pull the movable members out of the store block, keeping everything
    // else in order.
    let movable: Set<&VarId> = closure.iter().filter(|v| !pinned.contains(*v)).collect();
    let block = f.body.get_mut(store_bb).expect("insert_guard: unknown block");
    let mut extracted: Map<VarId, Instruction> = Map::new();
    let mut kept = Vec::with_capacity(block.insts.len());
    for inst in block.insts.drain(..) {
        match inst.lhs() {
            Some(lhs) if movable.contains(lhs) => {
                extracted.insert(lhs.clone(), inst);
            }
            _ => kept.push(inst),
        }
    }
    block.insts = kept;

    let mut then_insts: Vec<Instruction> = closure
        .iter()
        .rev()
        .filter_map(|v| extracted.remove(v))
        .collect();
    then_insts.push(store);
    f.body.insert(
        then_id.clone(),
        BasicBlock {
            id: then_id.clone(),
            insts: then_insts,
            term: Terminal::Jump(merge_id.clone()),
        },
    );

    move_from_prev_to_then(f, store_bb, &then_id);

    GuardOutcome {
        deltas: vec![
            EdgeDelta::Insert(store_bb.clone(), then_id.clone()),
            EdgeDelta::Insert(then_id.clone(), merge_id),
        ],
        new_blocks: vec![(then_id.clone(), store_bb.clone())],
        then_bb: Some(then_id),
    }
}

/// Sinks instructions of `prev_bb` whose every user now resides in
/// `then_bb` down into the guarded block.  Scans backward so a sink can
/// enable the one before it; relative order of sunk instructions is kept.
pub fn move_from_prev_to_then(f: &mut Function, prev_bb: &BbId, then_bb: &BbId) {
    let mut idx = f.body[prev_bb].insts.len();
    while idx > 0 {
        idx -= 1;
        let inst = &f.body[prev_bb].insts[idx];
        if matches!(inst, Instruction::Phi { .. }) {
            continue;
        }
        let Some(lhs) = inst.lhs() else {
            continue;
        };
        let uses = f.use_sites(lhs);
        if uses.is_empty() || !uses.iter().all(|(bb, _)| bb == then_bb) {
            continue;
        }
        let inst = f.body.get_mut(prev_bb).unwrap().insts.remove(idx);
        f.body.get_mut(then_bb).unwrap().insts.insert(0, inst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle_end::analysis::Cfg;
    use pretty_assertions::assert_eq;

    fn parse_fn(input: &str) -> Function {
        let program = input.parse::<Program>().unwrap().validate().unwrap().0;
        program.functions.values().next().unwrap().clone()
    }

    #[test]
    fn split_after_rewires_edges() {
        let mut f = parse_fn(
            r#"
        fn main(p:&int, b:int, c:int) -> _ {
        let x:int, y:int
        entry:
          x = $load p
          y = $arith add x b
          $store p y
          $branch c bb1 bb2
        bb1:
          $jump bb2
        bb2:
          $ret
        }
        "#,
        );
        let (new_bb, outcome) = split_after(&mut f, &(bb_id("entry"), 2));
        assert_eq!(new_bb, bb_id("split0"));
        assert_eq!(f.body[&bb_id("entry")].insts.len(), 3);
        assert_eq!(f.body[&bb_id("entry")].term, Terminal::Jump(new_bb.clone()));
        assert!(matches!(f.body[&new_bb].term, Terminal::Branch { .. }));
        assert_eq!(
            outcome.deltas,
            vec![
                EdgeDelta::Insert(bb_id("entry"), new_bb.clone()),
                EdgeDelta::Delete(bb_id("entry"), bb_id("bb1")),
                EdgeDelta::Insert(new_bb.clone(), bb_id("bb1")),
                EdgeDelta::Delete(bb_id("entry"), bb_id("bb2")),
                EdgeDelta::Insert(new_bb.clone(), bb_id("bb2")),
            ]
        );
        // the split function is still well formed.
        let mut program = Program { functions: Map::new() };
        program.functions.insert(f.id.clone(), f);
        program.validate().unwrap();
    }

    #[test]
    fn split_phi_header_peels_phis() {
        let mut f = parse_fn(
            r#"
        fn main(p:&int, c:int) -> _ {
        let i:int, i2:int, x:int, y:int
        entry:
          $jump head
        head:
          i = $phi(0, i2)
          x = $load p
          y = $arith add x i
          $store p y
          i2 = $arith add i 1
          $branch c head done
        done:
          $ret
        }
        "#,
        );
        let (rest, _) = split_phi_header(&mut f, &bb_id("head")).unwrap();
        assert_eq!(f.body[&bb_id("head")].insts.len(), 1);
        assert!(matches!(
            f.body[&bb_id("head")].insts[0],
            Instruction::Phi { .. }
        ));
        assert_eq!(f.body[&rest].insts.len(), 4);
        // a phi-free block is left untouched.
        assert!(split_phi_header(&mut f, &rest).is_none());
    }

    #[test]
    fn guard_keeps_comparison_operands_in_place() {
        let mut f = parse_fn(
            r#"
        fn main(p:&int, b:int) -> _ {
        let x:int, y:int
        entry:
          x = $load p
          y = $arith add x b
          $store p y
          $ret
        }
        "#,
        );
        let (_, _) = split_after(&mut f, &(bb_id("entry"), 2));
        let closure = vec![
            var_id("y", int_ty()),
            var_id("x", int_ty()),
        ];
        let outcome = insert_guard(
            &mut f,
            &bb_id("entry"),
            Operand::Var(var_id("y", int_ty())),
            Operand::Var(var_id("x", int_ty())),
            &closure,
        );
        let then_bb = outcome.then_bb.unwrap();

        // y != x pins the whole chain; only the store moves.
        let entry = &f.body[&bb_id("entry")];
        assert_eq!(entry.insts.len(), 3);
        assert!(matches!(entry.insts[2], Instruction::Cmp { rop: Rop::Neq, .. }));
        let then = &f.body[&then_bb];
        assert_eq!(then.insts.len(), 1);
        assert!(matches!(then.insts[0], Instruction::Store { .. }));
        assert_eq!(then.term, Terminal::Jump(bb_id("split0")));
    }

    #[test]
    fn guard_relocates_free_closure_members() {
        let mut f = parse_fn(
            r#"
        fn main(base:&int, i:int, b:int) -> _ {
        let p:&int, x:int, y:int
        entry:
          p = $gep base i
          x = $load p
          y = $arith add x b
          $store p y
          $ret
        }
        "#,
        );
        let (_, _) = split_after(&mut f, &(bb_id("entry"), 3));
        let closure = vec![
            var_id("y", int_ty()),
            var_id("x", int_ty()),
            var_id("p", ptr_ty(int_ty())),
        ];
        // comparing b against a constant leaves the whole chain free.
        let outcome = insert_guard(
            &mut f,
            &bb_id("entry"),
            Operand::Var(var_id("b", int_ty())),
            Operand::CInt(0),
            &closure,
        );
        let then_bb = outcome.then_bb.unwrap();

        let entry = &f.body[&bb_id("entry")];
        assert_eq!(entry.insts.len(), 1);
        assert!(matches!(entry.insts[0], Instruction::Cmp { .. }));

        // definitions precede uses in the guarded block, store last.
        let then: Vec<String> = f.body[&then_bb]
            .insts
            .iter()
            .map(|i| i.to_string())
            .collect();
        assert_eq!(
            then,
            vec![
                "p = $gep base i",
                "x = $load p",
                "y = $arith add x b",
                "$store p y",
            ]
        );
    }

    #[test]
    fn float_guard_uses_ordered_comparison() {
        let mut f = parse_fn(
            r#"
        fn main(p:&flt, b:flt) -> _ {
        let x:flt, y:flt
        entry:
          x = $load p
          y = $arith fadd x b
          $store p y
          $ret
        }
        "#,
        );
        let (_, _) = split_after(&mut f, &(bb_id("entry"), 2));
        insert_guard(
            &mut f,
            &bb_id("entry"),
            Operand::Var(var_id("y", flt_ty())),
            Operand::Var(var_id("x", flt_ty())),
            &[],
        );
        let entry = &f.body[&bb_id("entry")];
        assert!(matches!(
            entry.insts.last(),
            Some(Instruction::Cmp { rop: Rop::Fone, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "comparison operands must agree on type")]
    fn mismatched_guard_operands_panic() {
        let mut f = parse_fn(
            r#"
        fn main(p:&int) -> _ {
        let x:int
        entry:
          x = $load p
          $store p x
          $ret
        }
        "#,
        );
        let (_, _) = split_after(&mut f, &(bb_id("entry"), 1));
        insert_guard(
            &mut f,
            &bb_id("entry"),
            Operand::Var(var_id("x", int_ty())),
            Operand::CFlt(0.0),
            &[],
        );
    }

    #[test]
    fn deltas_reproduce_the_new_cfg() {
        let mut f = parse_fn(
            r#"
        fn main(p:&int, b:int) -> _ {
        let x:int, y:int
        entry:
          x = $load p
          y = $arith add x b
          $store p y
          $ret
        }
        "#,
        );
        let before = Cfg::new(&f);
        let mut outcome = GuardOutcome::default();
        let (_, o) = split_after(&mut f, &(bb_id("entry"), 2));
        outcome.merge(o);
        let o = insert_guard(
            &mut f,
            &bb_id("entry"),
            Operand::Var(var_id("y", int_ty())),
            Operand::Var(var_id("x", int_ty())),
            &[],
        );
        outcome.merge(o);

        let mut patched = before;
        for delta in &outcome.deltas {
            match delta {
                EdgeDelta::Insert(u, v) => patched.insert_edge(u, v),
                EdgeDelta::Delete(u, v) => patched.delete_edge(u, v),
            }
        }
        let recomputed = Cfg::new(&f);
        for bb in recomputed.blocks() {
            let succs: Vec<&BbId> = recomputed.succ(bb).collect();
            let preds: Vec<&BbId> = recomputed.pred(bb).collect();
            assert_eq!(patched.succ(bb).collect::<Vec<_>>(), succs, "succ({bb})");
            assert_eq!(patched.pred(bb).collect::<Vec<_>>(), preds, "pred({bb})");
        }
    }
}
