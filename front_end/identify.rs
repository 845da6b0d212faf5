//! Candidate recognition: find `load → arith → store` shapes.
//!
//! A candidate site is a store whose value was produced by an arithmetic
//! instruction with the loaded prior value of the same address as one
//! operand — the `*p = *p op b` pattern.  The pass itself treats this
//! module as a black box yielding geometry descriptors.

use std::collections::BTreeMap as Map;

use crate::middle_end::analysis::loops::LoopInfo;
use crate::middle_end::analysis::InstId;
use crate::middle_end::lir::*;
use crate::middle_end::profile::Opcode;

/// The geometry of one candidate site.  Locations are valid for the
/// function as it was when the candidate was discovered; a pass that
/// mutates the function must re-resolve them (the variables are stable
/// under SSA, the indices are not).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// The triggering arithmetic instruction.
    pub inst: InstId,
    /// The load feeding it.
    pub load: InstId,
    /// The store consuming it.
    pub store: InstId,
    /// The arithmetic operator, always one of the tracked opcodes.
    pub aop: Aop,
    /// Which operand of the arithmetic instruction is the loaded value
    /// (0 or 1).
    pub operand_pos: usize,
    /// The address being loaded and stored.
    pub addr: VarId,
    /// The loaded prior value.
    pub loaded: VarId,
    /// The computed value the store writes.
    pub computed: VarId,
    /// Static loop nesting depth of the store's block at discovery time.
    pub loop_depth: usize,
}

impl Candidate {
    pub fn get_loop_depth(&self) -> usize {
        self.loop_depth
    }
}

/// Scan the function for candidate sites, in block order then instruction
/// order.  All three instructions of a candidate must live in the same
/// block; vector-typed addresses are rejected here.
pub fn instructions_of_interest(f: &Function, li: &LoopInfo) -> Vec<Candidate> {
    let mut candidates = vec![];

    for (bbid, bb) in &f.body {
        // defs of this block, so the pattern check stays local.
        let defs: Map<&VarId, usize> = bb
            .insts
            .iter()
            .enumerate()
            .filter_map(|(idx, inst)| inst.lhs().map(|lhs| (lhs, idx)))
            .collect();

        for (store_idx, inst) in bb.insts.iter().enumerate() {
            let Instruction::Store { dst, op } = inst else {
                continue;
            };
            let Some(computed) = op.as_var() else {
                continue;
            };
            let Some(&arith_idx) = defs.get(computed) else {
                continue;
            };
            let Instruction::Arith { aop, op1, op2, .. } = &bb.insts[arith_idx] else {
                continue;
            };
            if Opcode::from_aop(*aop).is_none() {
                continue;
            }

            // one operand must be a load of the stored-to address, in this
            // block.
            let mut found = None;
            for (pos, op) in [op1, op2].into_iter().enumerate() {
                let Some(v) = op.as_var() else {
                    continue;
                };
                let Some(&load_idx) = defs.get(v) else {
                    continue;
                };
                if let Instruction::Load { lhs, src } = &bb.insts[load_idx] {
                    if src == dst {
                        found = Some((pos, load_idx, lhs.clone()));
                        break;
                    }
                }
            }
            let Some((operand_pos, load_idx, loaded)) = found else {
                continue;
            };

            // sanity: loads must precede the arith, the arith the store.
            if !(load_idx < arith_idx && arith_idx < store_idx) {
                continue;
            }

            // vector candidacy is excluded outright.
            let pointee = dst.typ().pointee();
            if pointee.as_ref().map(Type::is_vector).unwrap_or(true) {
                continue;
            }

            candidates.push(Candidate {
                inst: (bbid.clone(), arith_idx),
                load: (bbid.clone(), load_idx),
                store: (bbid.clone(), store_idx),
                aop: *aop,
                operand_pos,
                addr: dst.clone(),
                loaded,
                computed: computed.clone(),
                loop_depth: li.depth(bbid),
            });
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle_end::analysis::dominators::DomTree;
    use crate::middle_end::analysis::Cfg;
    use pretty_assertions::assert_eq;

    fn candidates_of(input: &str) -> (Function, Vec<Candidate>) {
        let program = input.parse::<Program>().unwrap().validate().unwrap().0;
        let f = program.functions.values().next().unwrap().clone();
        let cfg = Cfg::new(&f);
        let dt = DomTree::new(&cfg);
        let li = LoopInfo::new(&cfg, &dt);
        let cs = instructions_of_interest(&f, &li);
        (f, cs)
    }

    #[test]
    fn finds_simple_pattern() {
        let (_, cs) = candidates_of(
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
        assert_eq!(cs.len(), 1);
        let c = &cs[0];
        assert_eq!(c.aop, Aop::Add);
        assert_eq!(c.operand_pos, 0);
        assert_eq!(c.loop_depth, 0);
        assert_eq!(c.load, (bb_id("entry"), 0));
        assert_eq!(c.inst, (bb_id("entry"), 1));
        assert_eq!(c.store, (bb_id("entry"), 2));
    }

    #[test]
    fn operand_position_is_reported() {
        let (_, cs) = candidates_of(
            r#"
        fn main(p:&int, b:int) -> _ {
        let x:int, y:int
        entry:
          x = $load p
          y = $arith add b x
          $store p y
          $ret
        }
        "#,
        );
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].operand_pos, 1);
    }

    #[test]
    fn loop_depth_is_recorded() {
        let (_, cs) = candidates_of(
            r#"
        fn main(p:&int, b:int, n:int) -> _ {
        let x:int, y:int, i:int, i2:int, c:int
        entry:
          $jump head
        head:
          i = $phi(0, i2)
          c = $cmp lt i n
          $branch c body done
        body:
          x = $load p
          y = $arith add x b
          $store p y
          i2 = $arith add i 1
          $jump head
        done:
          $ret
        }
        "#,
        );
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].loop_depth, 1);
    }

    #[test]
    fn untracked_operator_is_skipped() {
        let (_, cs) = candidates_of(
            r#"
        fn main(p:&int, b:int) -> _ {
        let x:int, y:int
        entry:
          x = $load p
          y = $arith div x b
          $store p y
          $ret
        }
        "#,
        );
        assert_eq!(cs.len(), 0);
    }

    #[test]
    fn vector_address_is_rejected() {
        let (_, cs) = candidates_of(
            r#"
        fn main(p:&vec<int, 4>, b:vec<int, 4>) -> _ {
        let x:vec<int, 4>, y:vec<int, 4>
        entry:
          x = $load p
          y = $arith add x b
          $store p y
          $ret
        }
        "#,
        );
        assert_eq!(cs.len(), 0);
    }

    #[test]
    fn cross_block_shape_is_not_a_candidate() {
        let (_, cs) = candidates_of(
            r#"
        fn main(p:&int, b:int) -> _ {
        let x:int, y:int
        entry:
          x = $load p
          $jump bb1
        bb1:
          y = $arith add x b
          $store p y
          $ret
        }
        "#,
        );
        assert_eq!(cs.len(), 0);
    }
}
