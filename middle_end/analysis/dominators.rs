//! Dominator and post-dominator trees, with incremental repair.
//!
//! The trees support a small patch API (`insert_edge`, `delete_edge`,
//! `apply`) so a transformation that rewires a handful of CFG edges can keep
//! the tree valid without a from-scratch recomputation.  The repair is a
//! worklist that re-derives the immediate dominator of each affected block
//! as the nearest common ancestor of its predecessors and propagates along
//! successor edges until nothing changes.

use super::*;

/// One CFG edge rewrite performed by a transformation.  The transformer
/// logs these and the pass replays them against the dominator tree and the
/// loop info.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgeDelta {
    Insert(BbId, BbId),
    Delete(BbId, BbId),
}

/// For every reachable block, the set of blocks that dominate it.
/// Iterative dataflow: dom(b) = {b} ∪ ⋂ dom(preds).
pub fn dominator_sets(cfg: &Cfg) -> Map<BbId, Set<BbId>> {
    let reachable = reachable_from(cfg, &cfg.entry);
    let full: Set<BbId> = reachable.clone();

    let mut dom: Map<BbId, Set<BbId>> = Map::new();
    for bb in &reachable {
        if *bb == cfg.entry {
            dom.insert(bb.clone(), [bb.clone()].into());
        } else {
            dom.insert(bb.clone(), full.clone());
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for bb in &reachable {
            if *bb == cfg.entry {
                continue;
            }
            let mut new_set: Option<Set<BbId>> = None;
            for p in cfg.pred(bb).filter(|p| reachable.contains(*p)) {
                let pdom = &dom[p];
                new_set = Some(match new_set {
                    None => pdom.clone(),
                    Some(s) => s.intersection(pdom).cloned().collect(),
                });
            }
            let mut new_set = new_set.unwrap_or_default();
            new_set.insert(bb.clone());
            if new_set != dom[bb] {
                dom.insert(bb.clone(), new_set);
                changed = true;
            }
        }
    }

    dom
}

fn reachable_from(cfg: &Cfg, start: &BbId) -> Set<BbId> {
    let mut visited = Set::new();
    let mut worklist = vec![start.clone()];
    while let Some(bb) = worklist.pop() {
        if !visited.insert(bb.clone()) {
            continue;
        }
        for s in cfg.succ(&bb) {
            worklist.push(s.clone());
        }
    }
    visited
}

/// The dominator tree of a CFG.  Holds a mirror of the CFG edges so that
/// patches can be replayed against it.
#[derive(Clone, Debug)]
pub struct DomTree {
    entry: BbId,
    idom: Map<BbId, BbId>,
    children: Map<BbId, Set<BbId>>,
    cfg: Cfg,
}

impl DomTree {
    pub fn new(cfg: &Cfg) -> Self {
        let dom = dominator_sets(cfg);

        let mut idom: Map<BbId, BbId> = Map::new();
        for (bb, doms) in &dom {
            if *bb == cfg.entry {
                continue;
            }
            // the immediate dominator is the strict dominator dominated by
            // every other strict dominator, i.e. the one with the largest
            // dominator set.
            let strict: Vec<&BbId> = doms.iter().filter(|d| *d != bb).collect();
            let best = strict
                .iter()
                .max_by_key(|d| dom[**d].len())
                .expect("non-entry reachable block with no strict dominator");
            idom.insert(bb.clone(), (*best).clone());
        }

        let mut children: Map<BbId, Set<BbId>> = Map::new();
        for (bb, parent) in &idom {
            children.entry(parent.clone()).or_default().insert(bb.clone());
        }

        DomTree {
            entry: cfg.entry.clone(),
            idom,
            children,
            cfg: cfg.clone(),
        }
    }

    pub fn root(&self) -> &BbId {
        &self.entry
    }

    /// Whether the tree knows about `bb` (i.e. it is reachable).
    pub fn contains(&self, bb: &BbId) -> bool {
        *bb == self.entry || self.idom.contains_key(bb)
    }

    pub fn idom(&self, bb: &BbId) -> Option<&BbId> {
        self.idom.get(bb)
    }

    /// The immediate-dominator map, for comparison against a from-scratch
    /// recomputation.
    pub fn idoms(&self) -> &Map<BbId, BbId> {
        &self.idom
    }

    pub fn children(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.children.get(bb).into_iter().flatten()
    }

    fn depth(&self, bb: &BbId) -> usize {
        let mut d = 0;
        let mut cur = bb;
        while let Some(parent) = self.idom.get(cur) {
            d += 1;
            cur = parent;
        }
        d
    }

    /// Does `a` dominate `b`?  Reflexive.
    pub fn dominates(&self, a: &BbId, b: &BbId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom.get(cur) {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
    }

    /// Nearest common ancestor of two blocks in the tree.
    pub fn nca(&self, a: &BbId, b: &BbId) -> Option<BbId> {
        if !self.contains(a) || !self.contains(b) {
            return None;
        }
        let mut x = a;
        let mut y = b;
        let mut dx = self.depth(x);
        let mut dy = self.depth(y);
        while dx > dy {
            x = &self.idom[x];
            dx -= 1;
        }
        while dy > dx {
            y = &self.idom[y];
            dy -= 1;
        }
        while x != y {
            x = &self.idom[x];
            y = &self.idom[y];
        }
        Some(x.clone())
    }

    pub fn insert_edge(&mut self, from: &BbId, to: &BbId) {
        self.apply(&[EdgeDelta::Insert(from.clone(), to.clone())]);
    }

    pub fn delete_edge(&mut self, from: &BbId, to: &BbId) {
        self.apply(&[EdgeDelta::Delete(from.clone(), to.clone())]);
    }

    /// Replay a batch of edge rewrites.  All edges are patched into the
    /// mirror CFG first, then a single repair pass runs from the affected
    /// targets.
    pub fn apply(&mut self, deltas: &[EdgeDelta]) {
        let mut seeds: Vec<BbId> = vec![];
        for delta in deltas {
            match delta {
                EdgeDelta::Insert(from, to) => {
                    self.cfg.insert_edge(from, to);
                    seeds.push(to.clone());
                }
                EdgeDelta::Delete(from, to) => {
                    self.cfg.delete_edge(from, to);
                    seeds.push(to.clone());
                }
            }
        }
        self.repair(seeds);
    }

    // re-derive idoms starting from the given blocks, following successor
    // edges while anything changes.
    fn repair(&mut self, seeds: Vec<BbId>) {
        let mut worklist: std::collections::VecDeque<BbId> = seeds.into();
        while let Some(bb) = worklist.pop_front() {
            if bb == self.entry {
                continue;
            }

            // the new idom is the nearest common ancestor of all currently
            // reachable predecessors.
            let preds: Vec<BbId> = self.cfg.pred(&bb).cloned().collect();
            let mut new_idom: Option<BbId> = None;
            for p in preds.iter().filter(|p| self.contains(p) && **p != bb) {
                new_idom = Some(match new_idom {
                    None => p.clone(),
                    Some(c) => match self.nca(&c, p) {
                        Some(n) => n,
                        None => c,
                    },
                });
            }

            match new_idom {
                Some(ni) => {
                    if self.idom.get(&bb) != Some(&ni) {
                        self.set_idom(&bb, Some(ni));
                        for s in self.cfg.succ(&bb).cloned().collect::<Vec<_>>() {
                            worklist.push_back(s);
                        }
                    }
                }
                None => {
                    // bb became unreachable; drop it and let its successors
                    // re-derive their own idoms.
                    if self.idom.contains_key(&bb) {
                        self.set_idom(&bb, None);
                        for s in self.cfg.succ(&bb).cloned().collect::<Vec<_>>() {
                            worklist.push_back(s);
                        }
                    }
                }
            }
        }
    }

    fn set_idom(&mut self, bb: &BbId, new_parent: Option<BbId>) {
        if let Some(old) = self.idom.get(bb) {
            if let Some(siblings) = self.children.get_mut(old) {
                siblings.remove(bb);
            }
        }
        match new_parent {
            Some(parent) => {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .insert(bb.clone());
                self.idom.insert(bb.clone(), parent);
            }
            None => {
                self.idom.remove(bb);
            }
        }
    }
}

/// The post-dominator tree: the dominator tree of the reversed CFG, rooted
/// at the exit block.
#[derive(Clone, Debug)]
pub struct PostDomTree(pub DomTree);

impl PostDomTree {
    pub fn new(cfg: &Cfg) -> Self {
        PostDomTree(DomTree::new(&cfg.reversed()))
    }

    /// Does `a` post-dominate `b`?
    pub fn postdominates(&self, a: &BbId, b: &BbId) -> bool {
        self.0.dominates(a, b)
    }

    pub fn ipdom(&self, bb: &BbId) -> Option<&BbId> {
        self.0.idom(bb)
    }

    pub fn root(&self) -> &BbId {
        self.0.root()
    }

    pub fn children(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.0.children(bb)
    }
}
