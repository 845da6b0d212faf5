//! The pass driver: discover candidate sites, decide which are worth
//! rewriting, and apply the configured rewrite to each in discovery order.
//!
//! Structural edits report their CFG edge changes, which are replayed into
//! the dominator tree and loop info instead of recomputing either from
//! scratch after every site.  Candidate locations go stale as soon as the
//! first site is rewritten, so each site re-resolves its geometry through
//! the SSA names before touching anything; a site whose shape no longer
//! holds is skipped silently.

use crate::commons::Valid;
use crate::front_end::identify::{instructions_of_interest, Candidate};
use crate::middle_end::analysis::dominators::{DomTree, PostDomTree};
use crate::middle_end::analysis::loops::LoopInfo;
use crate::middle_end::analysis::pdg::{ProgramDependenceGraph, ValueKey};
use crate::middle_end::analysis::{Cfg, InstId};
use crate::middle_end::lir::*;
use crate::middle_end::profile::{Opcode, TRACKED};

use super::closure::{ClosurePolicy, SinglePass};
use super::insert_guard::{insert_guard, split_after, split_phi_header, GuardOutcome};
use super::{DagOpts, OptType};

/// One unit of work: a candidate plus the closure that may travel with its
/// store.
#[derive(Clone, Debug)]
pub struct ReachableNodes {
    pub candidate: Candidate,
    pub closure: Vec<VarId>,
}

/// Runs the configured rewrite over every function of the program.  The
/// result is re-validated; a transformation that breaks well-formedness is
/// a bug in the pass, not an input error.
pub fn run_dag_opt(valid: Valid<Program>, opts: &DagOpts) -> Valid<Program> {
    let mut program = valid.0;
    for f in program.functions.values_mut() {
        run_on_function(f, opts);
    }
    program
        .validate()
        .expect("transformed program must stay well formed")
}

/// Runs the pass on a single function.  Returns the incrementally
/// maintained dominator tree and loop info so callers can compare them
/// against a from-scratch recomputation.
pub fn run_on_function(f: &mut Function, opts: &DagOpts) -> (DomTree, LoopInfo) {
    let cfg = Cfg::new(f);
    let mut dt = DomTree::new(&cfg);
    let mut li = LoopInfo::new(&cfg, &dt);

    let reachables = collect_reachables(f, &cfg, &dt, &li, opts);

    match opts.opt {
        OptType::StoreElimination => {
            for r in &reachables {
                store_elimination(f, &mut dt, &mut li, r);
            }
        }
        OptType::LoadElimination => {
            for r in &reachables {
                load_elimination(f, &mut dt, &mut li, r);
            }
        }
        OptType::IntraProfiling => {
            for (static_id, r) in reachables.iter().enumerate() {
                instrument_site(f, static_id, r);
            }
        }
        OptType::InterProfiling => {
            for (static_id, r) in reachables.iter().enumerate() {
                instrument_site(f, static_id, r);
            }
            if f.id == func_id("main") {
                add_lifecycle_calls(f);
            }
        }
    }

    (dt, li)
}

// discover candidates and keep the ones worth rewriting, with their
// closures.  Closures are computed up front, against the untouched body.
fn collect_reachables(
    f: &Function,
    cfg: &Cfg,
    dt: &DomTree,
    li: &LoopInfo,
    opts: &DagOpts,
) -> Vec<ReachableNodes> {
    let candidates = instructions_of_interest(f, li);
    if candidates.is_empty() {
        return vec![];
    }

    let mut pdg = ProgramDependenceGraph::new(f, cfg, PostDomTree::new(cfg));
    pdg.compute_dependences(dt);

    let policy = SinglePass;
    candidates
        .into_iter()
        .filter(|c| worth_insert_if(c, opts))
        .filter(|c| {
            // the stored value must provably depend on the loaded one.
            pdg.get_all_dependences(&ValueKey::Var(c.computed.clone()))
                .contains(&ValueKey::Var(c.loaded.clone()))
        })
        .map(|c| {
            let closure = policy.closure_of(f, &c.store);
            ReachableNodes {
                candidate: c,
                closure,
            }
        })
        .collect()
}

// a guard only pays off where the store sits inside enough loop nesting.
fn worth_insert_if(c: &Candidate, opts: &DagOpts) -> bool {
    c.get_loop_depth() >= opts.loop_threshold
}

// Re-resolve the candidate's geometry against the current body.  Earlier
// rewrites move instructions around; the SSA names are the stable handle.
fn resolve_site(f: &Function, c: &Candidate) -> Option<InstId> {
    let (store_bb, store_idx) = find_store(f, c)?;
    let (load_bb, load_idx) = f.def_site(&c.loaded)?;
    let (arith_bb, arith_idx) = f.def_site(&c.computed)?;
    if load_bb != store_bb || arith_bb != store_bb {
        return None;
    }
    if !(load_idx < arith_idx && arith_idx < store_idx) {
        return None;
    }
    Some((store_bb, store_idx))
}

fn find_store(f: &Function, c: &Candidate) -> Option<InstId> {
    for (bbid, bb) in &f.body {
        for (idx, inst) in bb.insts.iter().enumerate() {
            if let Instruction::Store { dst, op } = inst {
                if *dst == c.addr && op.as_var() == Some(&c.computed) {
                    return Some((bbid.clone(), idx));
                }
            }
        }
    }
    None
}

// isolate the store at the end of its own fall-through block, peeling any
// leading phis off into a header first.  Returns the store's block.
fn isolate_store(f: &mut Function, store_loc: &InstId, outcome: &mut GuardOutcome) -> BbId {
    let (_, o) = split_after(f, store_loc);
    outcome.merge(o);

    let mut store_bb = store_loc.0.clone();
    if let Some((rest, o)) = split_phi_header(f, &store_bb) {
        store_bb = rest;
        outcome.merge(o);
    }
    store_bb
}

fn store_elimination(f: &mut Function, dt: &mut DomTree, li: &mut LoopInfo, r: &ReachableNodes) {
    let c = &r.candidate;
    let Some(store_loc) = resolve_site(f, c) else {
        return;
    };

    let mut outcome = GuardOutcome::default();
    let store_bb = isolate_store(f, &store_loc, &mut outcome);
    let o = insert_guard(
        f,
        &store_bb,
        Operand::Var(c.computed.clone()),
        Operand::Var(c.loaded.clone()),
        &r.closure,
    );
    outcome.merge(o);
    update_passes(dt, li, &outcome);
}

fn load_elimination(f: &mut Function, dt: &mut DomTree, li: &mut LoopInfo, r: &ReachableNodes) {
    let c = &r.candidate;
    let Some(identity) = identity_operand(c.aop) else {
        return;
    };
    // subtraction only has a right identity, so the loaded value must be
    // the left operand.
    if matches!(c.aop, Aop::Sub | Aop::FSub) && c.operand_pos != 0 {
        return;
    }
    let Some(store_loc) = resolve_site(f, c) else {
        return;
    };

    // the non-loaded operand of the arithmetic instruction.
    let other = {
        let (arith_bb, arith_idx) = f.def_site(&c.computed).expect("resolved above");
        let Instruction::Arith { op1, op2, .. } = &f.body[&arith_bb].insts[arith_idx] else {
            return;
        };
        if c.operand_pos == 0 { op2.clone() } else { op1.clone() }
    };

    let mut outcome = GuardOutcome::default();
    let store_bb = isolate_store(f, &store_loc, &mut outcome);
    let o = insert_guard(f, &store_bb, other, identity, &r.closure);
    outcome.merge(o);
    update_passes(dt, li, &outcome);
}

// the value that makes `loaded aop other` a no-op, as a constant operand.
fn identity_operand(aop: Aop) -> Option<Operand> {
    use Aop::*;
    match aop {
        Add | Sub | Xor => Some(Operand::CInt(0)),
        Mul => Some(Operand::CInt(1)),
        FAdd | FSub => Some(Operand::CFlt(0.0)),
        FMul => Some(Operand::CFlt(1.0)),
        Div => None,
    }
}

// insert a recording call right before the triggering arithmetic.
fn instrument_site(f: &mut Function, static_id: usize, r: &ReachableNodes) {
    let c = &r.candidate;
    let Some((bb, idx)) = f.def_site(&c.computed) else {
        return;
    };
    let (callee, opcode, op1, op2) = {
        let Instruction::Arith { aop, op1, op2, .. } = &f.body[&bb].insts[idx] else {
            return;
        };
        let Some(opcode) = Opcode::from_aop(*aop) else {
            return;
        };
        let callee = if aop.is_float() {
            "record_arith_flt"
        } else {
            "record_arith_int"
        };
        (callee, opcode, op1.clone(), op2.clone())
    };
    let opcode_idx = TRACKED
        .iter()
        .position(|o| *o == opcode)
        .expect("tracked opcode");

    let call = Instruction::CallExt {
        lhs: None,
        ext_callee: callee.to_string(),
        args: vec![
            Operand::CInt(opcode_idx as i64),
            Operand::CInt(static_id as i64),
            op1,
            op2,
        ],
    };
    f.body.get_mut(&bb).expect("resolved above").insts.insert(idx, call);
}

// inter-procedural profiling brackets main with the counter runtime's
// lifecycle entry points.
fn add_lifecycle_calls(f: &mut Function) {
    let entry = f
        .body
        .get_mut(&bb_id("entry"))
        .expect("validated function has an entry block");
    entry.insts.insert(
        0,
        Instruction::CallExt {
            lhs: None,
            ext_callee: "init_instrumentation".to_string(),
            args: vec![],
        },
    );

    let exit = f
        .body
        .values_mut()
        .find(|bb| matches!(bb.term, Terminal::Ret(_)))
        .expect("validated function has a return block");
    exit.insts.push(Instruction::CallExt {
        lhs: None,
        ext_callee: "dump_txt".to_string(),
        args: vec![],
    });
}

// replay the structural edits into the incrementally maintained analyses.
fn update_passes(dt: &mut DomTree, li: &mut LoopInfo, outcome: &GuardOutcome) {
    dt.apply(&outcome.deltas);
    for (new_bb, origin) in &outcome.new_blocks {
        li.add_block_to_loop(new_bb, origin);
    }
}
