//! Closure (reachability) analysis: which instructions may accompany a
//! store into a guarded block.
//!
//! Starting from the store's operands, we grow a marked set backward across
//! the operand chain.  An instruction joins only when every one of its uses
//! is outside the store's block or already marked, so the whole set can be
//! relocated together without breaking any use-before-def property.  The
//! set never leaves the store's block: cross-block relocation cannot, in
//! general, preserve a single dominance-respecting insertion point, and
//! control-flow merge (`$phi`) nodes are never enqueued.

use std::collections::{BTreeSet as Set, VecDeque};

use crate::middle_end::analysis::InstId;
use crate::middle_end::lir::*;

/// The growth policy.  The default is a single backward pass that may
/// under-approximate the maximal closure; it is a trait so a fixed-point
/// variant can be substituted without touching the rest of the pipeline.
pub trait ClosurePolicy {
    /// The closure of `store_loc`, as the variables defined by its members
    /// in discovery order.  The store itself is an implicit first member.
    fn closure_of(&self, f: &Function, store_loc: &InstId) -> Vec<VarId>;
}

/// Single backward pass, evaluated eagerly: an instruction whose
/// containment check fails is simply skipped.  It can be re-examined only
/// if another member's operand scan reaches it again.
pub struct SinglePass;

impl ClosurePolicy for SinglePass {
    fn closure_of(&self, f: &Function, store_loc: &InstId) -> Vec<VarId> {
        let (bb, store_idx) = store_loc;
        let block = &f.body[bb];
        let store = &block.insts[*store_idx];
        assert!(
            matches!(store, Instruction::Store { .. }),
            "closure_of: expected a store at {bb}[{store_idx}]"
        );

        // marked locations, for the containment check; the store counts.
        let mut marked_locs: Set<InstId> = [store_loc.clone()].into();
        let mut members: Vec<VarId> = vec![];

        let mut q: VecDeque<usize> = VecDeque::new();
        let enqueue_defs = |q: &mut VecDeque<usize>, inst: &Instruction| {
            for v in inst.used_vars() {
                let Some((def_bb, def_idx)) = f.def_site(v) else {
                    continue;
                };
                // restrict ourselves to instructions in the same block.
                if def_bb != *bb {
                    continue;
                }
                if matches!(f.body[&def_bb].insts[def_idx], Instruction::Phi { .. }) {
                    continue;
                }
                q.push_back(def_idx);
            }
        };
        enqueue_defs(&mut q, store);

        while let Some(idx) = q.pop_front() {
            if marked_locs.contains(&(bb.clone(), idx)) {
                continue;
            }
            let inst = &block.insts[idx];
            let lhs = inst.lhs().expect("non-store closure candidate defines a value");

            // every use must be outside this block or already marked.
            let all_marked = f
                .use_sites(lhs)
                .into_iter()
                .all(|(ubb, uidx)| ubb != *bb || marked_locs.contains(&(ubb, uidx)));
            if !all_marked {
                continue;
            }

            marked_locs.insert((bb.clone(), idx));
            members.push(lhs.clone());
            enqueue_defs(&mut q, inst);
        }

        members
    }
}
