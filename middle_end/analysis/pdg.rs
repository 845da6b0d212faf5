//! The program dependence graph: for every value in a function, which other
//! values it reads (data dependences) and which branch predicates decide
//! whether it executes at all (control dependences).
//!
//! Nodes are integer handles into an arena, assigned in discovery order;
//! edges are `(source, target, kind)` triples.  Edge ordering and equality
//! deliberately consider only the target node: two edges from different
//! sources (or of different kinds) to the same target collapse into one
//! under a single source's edge set.  This mirrors the behavior of the
//! system this was ported from; widening the key would change which
//! dependences `get_all_dependences` reports.

use super::dominators::{DomTree, PostDomTree};
use super::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DepKind {
    Data,
    Control,
}

/// Handle of a dependence node, assigned in discovery order.
pub type NodeId = usize;

/// A stable, orderable identity for the program value a node wraps.
/// Instructions that define a variable are keyed by that variable (the
/// program is SSA); stores define nothing and are keyed by location.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueKey {
    Var(VarId),
    StoreAt(BbId, usize),
}

#[derive(Clone, Debug)]
pub struct NodeData {
    pub key: ValueKey,
    /// The owning basic block; `None` for non-instruction values
    /// (parameters).
    pub block: Option<BbId>,
    /// Textual rendering of the wrapped value, for diagnostics.
    pub label: String,
}

#[derive(Clone, Debug)]
pub struct Edge {
    pub u: NodeId,
    pub v: NodeId,
    pub kind: DepKind,
}

// ordering by target only; see the module comment.
impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.v == other.v
    }
}
impl Eq for Edge {}
impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Edge {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.v.cmp(&other.v)
    }
}

/// The node arena plus per-source edge sets.
#[derive(Clone, Debug, Default)]
pub struct DependenceGraph {
    nodes: Vec<NodeData>,
    ids: Map<ValueKey, NodeId>,
    edges: Map<NodeId, Set<Edge>>,
}

impl DependenceGraph {
    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id]
    }

    pub fn node_id(&self, key: &ValueKey) -> Option<NodeId> {
        self.ids.get(key).copied()
    }

    pub fn nodes(&self) -> &[NodeData] {
        &self.nodes
    }

    pub fn edges_from(&self, u: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.get(&u).into_iter().flatten()
    }

    fn assign_id(&mut self, key: ValueKey, block: Option<BbId>, label: String) -> NodeId {
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        let id = self.nodes.len();
        self.nodes.push(NodeData {
            key: key.clone(),
            block,
            label,
        });
        self.ids.insert(key, id);
        id
    }

    pub fn add_edge(&mut self, u: NodeId, v: NodeId, kind: DepKind) {
        self.edges.entry(u).or_default().insert(Edge { u, v, kind });
    }

    /// Render the graph in DOT format, grouping instruction nodes by their
    /// owning basic block.
    pub fn to_dot(&self, name: &str) -> String {
        let mut by_block: Map<Option<BbId>, Vec<NodeId>> = Map::new();
        for (id, data) in self.nodes.iter().enumerate() {
            by_block.entry(data.block.clone()).or_default().push(id);
        }

        let mut node_str = String::new();
        for (block, ids) in &by_block {
            if let Some(bb) = block {
                node_str.push_str(&format!("subgraph cluster_{bb} {{\nlabel = \"{bb}\";\n"));
            }
            for id in ids {
                let label = self.nodes[*id].label.replace('"', "\\\"");
                node_str.push_str(&format!("n{id} [label = \"{label}\"];\n"));
            }
            if block.is_some() {
                node_str.push_str("}\n");
            }
        }

        let mut edge_str = String::new();
        for edges in self.edges.values() {
            for e in edges {
                let style = match e.kind {
                    DepKind::Data => "color=black",
                    DepKind::Control => "color=gray style=dashed",
                };
                edge_str.push_str(&format!("n{} -> n{} [{style}];\n", e.u, e.v));
            }
        }

        format!(
            r#"digraph {name} {{
node [shape=box nojustify=true];
{node_str}
{edge_str}}}
"#
        )
    }
}

/// Builder and query interface over one function's dependence graph.
///
/// `compute_dependences` must run before any query; querying first is a
/// contract violation and panics.
pub struct ProgramDependenceGraph<'a> {
    f: &'a Function,
    cfg: Cfg,
    pdt: PostDomTree,
    dg: DependenceGraph,
    /// Per block, the predicate value guarding its execution.
    predicates: Map<BbId, Operand>,
    computed: bool,
}

impl<'a> ProgramDependenceGraph<'a> {
    pub fn new(f: &'a Function, cfg: &Cfg, pdt: PostDomTree) -> Self {
        ProgramDependenceGraph {
            f,
            cfg: cfg.clone(),
            pdt,
            dg: DependenceGraph::default(),
            predicates: Map::new(),
            computed: false,
        }
    }

    /// Build all data and control dependence edges for the function.  Call
    /// once, before any query.
    pub fn compute_dependences(&mut self, dt: &DomTree) {
        self.compute_data_dependences();
        self.compute_control_dependences(dt);
        self.computed = true;
    }

    pub fn graph(&self) -> &DependenceGraph {
        assert!(self.computed, "compute_dependences must be called first");
        &self.dg
    }

    /// The predicate value guarding `bb`, if `bb` executes conditionally.
    pub fn get_predicate(&self, bb: &BbId) -> Option<&Operand> {
        assert!(self.computed, "compute_dependences must be called first");
        self.predicates.get(bb)
    }

    /// The closed set of values that `start` transitively depends on,
    /// through data and control edges alike.  Unordered; uniqueness is by
    /// node, not by path.
    pub fn get_all_dependences(&self, start: &ValueKey) -> Set<ValueKey> {
        assert!(self.computed, "compute_dependences must be called first");

        let mut result = Set::new();
        let Some(start_id) = self.dg.node_id(start) else {
            return result;
        };
        let mut worklist = vec![start_id];
        let mut visited: Set<NodeId> = Set::new();
        while let Some(id) = worklist.pop() {
            if !visited.insert(id) {
                continue;
            }
            for e in self.dg.edges_from(id) {
                if visited.contains(&e.v) {
                    continue;
                }
                result.insert(self.dg.node(e.v).key.clone());
                worklist.push(e.v);
            }
        }
        result
    }

    // SECTION: data dependences

    // one edge per operand that is itself an instruction.
    fn compute_data_dependences(&mut self) {
        let f = self.f;
        for (bbid, bb) in &f.body {
            for (idx, inst) in bb.insts.iter().enumerate() {
                let u = self.inst_node(bbid, idx, inst);
                for v in inst.used_vars() {
                    if let Some(vid) = self.def_node(v) {
                        self.dg.add_edge(u, vid, DepKind::Data);
                    }
                }
            }
        }
    }

    // the node for an instruction: keyed by its lhs if it defines one,
    // otherwise by its location.
    fn inst_node(&mut self, bbid: &BbId, idx: usize, inst: &Instruction) -> NodeId {
        let key = match inst.lhs() {
            Some(lhs) => ValueKey::Var(lhs.clone()),
            None => ValueKey::StoreAt(bbid.clone(), idx),
        };
        self.dg.assign_id(key, Some(bbid.clone()), inst.to_string())
    }

    // the node for the definition of `v`, if `v` is defined by an
    // instruction.  Parameters are values but not instructions; they get a
    // node with no owning block and no outgoing data edges.
    fn def_node(&mut self, v: &VarId) -> Option<NodeId> {
        let f = self.f;
        if let Some((bbid, idx)) = f.def_site(v) {
            let inst = &f.body[&bbid].insts[idx];
            Some(self.inst_node(&bbid, idx, inst))
        } else if f.params.contains(v) {
            Some(
                self.dg
                    .assign_id(ValueKey::Var(v.clone()), None, v.to_string()),
            )
        } else {
            None
        }
    }

    // SECTION: control dependences

    // A block Y is control-dependent on a branching block X when X has a
    // successor that does not post-dominate X but leads to Y.  We record,
    // for every dependent block, the branch's predicate value, then walk the
    // dominator tree so descendants of a conditionally-executed block
    // collapse onto their nearest enclosing predicate.
    fn compute_control_dependences(&mut self, dt: &DomTree) {
        // dominance-frontier-style walk seeded at every branch.
        let blocks: Vec<BbId> = self.cfg.blocks().cloned().collect();
        for x in &blocks {
            let f = self.f;
            let Terminal::Branch { cond, .. } = &f.body[x].term else {
                continue;
            };
            let cond = cond.clone();
            let stop = self.pdt.ipdom(x).cloned();
            for s in self.cfg.succ(x).cloned().collect::<Vec<_>>() {
                if self.pdt.postdominates(&s, x) {
                    continue;
                }
                // walk up the post-dominator tree from the successor until
                // reaching X's own post-dominator.
                let mut cur = Some(s);
                while let Some(y) = cur {
                    if Some(&y) == stop.as_ref() {
                        break;
                    }
                    self.record_predicate(&y, &cond);
                    cur = self.pdt.ipdom(&y).cloned();
                }
            }
        }

        // propagate predicates down the dominator tree: a block with no
        // recorded predicate of its own executes under its parent's.
        self.propagate_predicates(dt, dt.root(), None);

        // with predicates assigned, every instruction in a guarded block
        // depends on the guarding value.
        for (bbid, pred) in self.predicates.clone() {
            self.create_control_edges(&bbid, &pred);
        }
    }

    fn record_predicate(&mut self, y: &BbId, pred: &Operand) {
        // first branch reaching the block wins; chained control dependences
        // reuse the recorded value rather than re-deriving it.
        self.predicates.entry(y.clone()).or_insert_with(|| pred.clone());
    }

    fn propagate_predicates(&mut self, dt: &DomTree, x: &BbId, inherited: Option<&Operand>) {
        let here = match self.predicates.get(x) {
            Some(p) => Some(p.clone()),
            None => {
                if let Some(p) = inherited {
                    self.predicates.insert(x.clone(), p.clone());
                }
                inherited.cloned()
            }
        };
        for child in dt.children(x).cloned().collect::<Vec<_>>() {
            self.propagate_predicates(dt, &child, here.as_ref());
        }
    }

    fn create_control_edges(&mut self, y: &BbId, pred: &Operand) {
        let Some(pred_var) = pred.as_var() else {
            // constant predicates generate no edges.
            return;
        };
        let Some(v) = self.def_node(&pred_var.clone()) else {
            return;
        };
        let f = self.f;
        for (idx, inst) in f.body[y].insts.iter().enumerate() {
            let u = self.inst_node(y, idx, inst);
            self.dg.add_edge(u, v, DepKind::Control);
        }
    }
}
