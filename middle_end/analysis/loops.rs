//! Natural loops: membership, nesting depth, and the mutator the pass uses
//! to register the blocks it creates inside an existing loop.

use super::dominators::DomTree;
use super::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loop {
    pub header: BbId,
    pub body: Set<BbId>,
}

#[derive(Clone, Debug, Default)]
pub struct LoopInfo {
    loops: Vec<Loop>,
}

impl LoopInfo {
    /// Find the natural loops of the CFG: one per back edge target, where a
    /// back edge is an edge `latch → header` with the header dominating the
    /// latch.  Back edges sharing a header contribute to the same loop.
    pub fn new(cfg: &Cfg, dt: &DomTree) -> Self {
        let mut loops: Map<BbId, Set<BbId>> = Map::new();

        for latch in cfg.blocks() {
            for header in cfg.succ(latch) {
                if !dt.contains(latch) || !dt.dominates(header, latch) {
                    continue;
                }
                // walk backward from the latch collecting the loop body.
                let body = loops.entry(header.clone()).or_default();
                body.insert(header.clone());
                let mut worklist = vec![latch.clone()];
                while let Some(bb) = worklist.pop() {
                    if !body.insert(bb.clone()) {
                        continue;
                    }
                    for p in cfg.pred(&bb) {
                        worklist.push(p.clone());
                    }
                }
            }
        }

        LoopInfo {
            loops: loops
                .into_iter()
                .map(|(header, body)| Loop { header, body })
                .collect(),
        }
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// The innermost loop containing `bb`, i.e. the smallest loop body.
    pub fn loop_for(&self, bb: &BbId) -> Option<&Loop> {
        self.loops
            .iter()
            .filter(|l| l.body.contains(bb))
            .min_by_key(|l| l.body.len())
    }

    /// The nesting depth of `bb`: the number of loops containing it.  Blocks
    /// outside every loop have depth 0.
    pub fn depth(&self, bb: &BbId) -> usize {
        self.loops.iter().filter(|l| l.body.contains(bb)).count()
    }

    /// Register a new block as a member of every loop that contains `like`.
    /// Used when a transformation splits a block inside a loop: the new
    /// halves belong to the same loops as the original.
    pub fn add_block_to_loop(&mut self, bb: &BbId, like: &BbId) {
        for l in self.loops.iter_mut() {
            if l.body.contains(like) {
                l.body.insert(bb.clone());
            }
        }
    }
}
