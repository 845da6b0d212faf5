//! Static analyses of LIR functions: the control-flow graph, dominator and
//! post-dominator trees, natural loops, and the program dependence graph.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use super::lir::*;

pub mod dominators;
pub mod loops;
pub mod pdg;


/// Instruction IDs: a combination of the basic block ID and the index of the
/// instruction in the block.  Only stable as long as the function is not
/// mutated.
pub type InstId = (BbId, usize);

/// The control-flow graph for a function, abstracted so that we can easily
/// get successors and predecessors, and also run backward analyses by
/// reversing the edges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cfg {
    pub entry: BbId,
    pub exit: BbId,
    succ_edges: Map<BbId, Set<BbId>>,
    pred_edges: Map<BbId, Set<BbId>>,
}

impl Cfg {
    // construct a Cfg from the given function's basic blocks.
    pub fn new(function: &Function) -> Self {
        let entry = bb_id("entry");
        let mut exit = entry.clone();
        let mut succ_edges: Map<BbId, Set<BbId>> = Map::new();
        let mut pred_edges: Map<BbId, Set<BbId>> = Map::new();

        for bbid in function.body.keys() {
            succ_edges.insert(bbid.clone(), Set::new());
            pred_edges.insert(bbid.clone(), Set::new());
        }

        fn insert_edge(map: &mut Map<BbId, Set<BbId>>, key: &BbId, value: &BbId) {
            map.entry(key.clone()).or_default().insert(value.clone());
        }

        for (bbid, bb) in &function.body {
            match &bb.term {
                Terminal::Branch { cond: _, tt, ff } => {
                    insert_edge(&mut succ_edges, bbid, tt);
                    insert_edge(&mut succ_edges, bbid, ff);
                    insert_edge(&mut pred_edges, tt, bbid);
                    insert_edge(&mut pred_edges, ff, bbid);
                }
                Terminal::Jump(next_bb) => {
                    insert_edge(&mut succ_edges, bbid, next_bb);
                    insert_edge(&mut pred_edges, next_bb, bbid);
                }
                Terminal::Ret(_) => {
                    exit = bbid.clone();
                }
            }
        }

        Cfg {
            entry,
            exit,
            succ_edges,
            pred_edges,
        }
    }

    // an iterator over the successor edges of bb.
    pub fn succ(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.succ_edges[bb].iter()
    }

    // an iterator over the predecessor edges of bb.
    pub fn pred(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.pred_edges[bb].iter()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BbId> {
        self.succ_edges.keys()
    }

    pub fn contains(&self, bb: &BbId) -> bool {
        self.succ_edges.contains_key(bb)
    }

    /// The same graph with every edge flipped; entry and exit swap roles.
    /// Running a dominator computation on the reversed graph yields
    /// post-dominators.
    pub fn reversed(&self) -> Cfg {
        Cfg {
            entry: self.exit.clone(),
            exit: self.entry.clone(),
            succ_edges: self.pred_edges.clone(),
            pred_edges: self.succ_edges.clone(),
        }
    }

    // edge patching, used to keep the graph in sync with an in-progress
    // transformation.

    pub fn insert_edge(&mut self, from: &BbId, to: &BbId) {
        self.succ_edges.entry(from.clone()).or_default();
        self.pred_edges.entry(from.clone()).or_default();
        self.succ_edges.entry(to.clone()).or_default();
        self.pred_edges.entry(to.clone()).or_default();
        self.succ_edges.get_mut(from).unwrap().insert(to.clone());
        self.pred_edges.get_mut(to).unwrap().insert(from.clone());
    }

    pub fn delete_edge(&mut self, from: &BbId, to: &BbId) {
        if let Some(succs) = self.succ_edges.get_mut(from) {
            succs.remove(to);
        }
        if let Some(preds) = self.pred_edges.get_mut(to) {
            preds.remove(from);
        }
    }
}
