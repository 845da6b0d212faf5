//! Graphviz rendering of a function's control-flow graph, used to eyeball
//! the block structure before and after guard insertion.

use super::*;
use crate::middle_end::analysis::Cfg;

/// Render one function's CFG.  Blocks created by the pass (`then*` holds a
/// guarded store, `split*` is a remainder of a split) are shaded so the
/// inserted structure stands out.
pub fn dump_cfg(cfg: &Cfg, f: &Function, graph_type_and_name: &str) -> String {
    let f_id = &f.id;
    let mut node_str = String::new();
    let mut edge_str = String::new();

    let mut worklist = vec![cfg.entry.clone()];
    let mut visited = Set::<BbId>::new();

    while let Some(bb) = worklist.pop() {
        if !visited.insert(bb.clone()) {
            continue;
        }

        let block = &f.body[&bb];
        let mut label = format!("{bb}:\\l");
        for inst in &block.insts {
            label.push_str(&format!("  {inst}\\l"));
        }
        label.push_str(&format!("  {}\\l", block.term));

        let style = if bb.name().starts_with("then") {
            " style=filled fillcolor=lightyellow"
        } else if bb.name().starts_with("split") {
            " style=filled fillcolor=lightgray"
        } else {
            ""
        };
        node_str.push_str(&format!("{f_id}__{bb} [label = \"{label}\"{style}];\n"));

        for next in cfg.succ(&bb) {
            edge_str.push_str(&format!("{f_id}__{bb} -> {f_id}__{next};\n"));
            worklist.push(next.clone());
        }
    }

    format!(
        "{graph_type_and_name} {{\nlabel = \"{f_id}\";\nnode [shape=box nojustify=true];\n{node_str}{edge_str}}}\n"
    )
}

pub fn dump_cfg_of_main(program: &Program) -> String {
    let f = &program.functions[&func_id("main")];
    dump_cfg(&Cfg::new(f), f, "digraph main")
}

pub fn dump_cfg_of_whole_program(program: &Program) -> String {
    let mut g = "digraph G {\n".to_string();
    for (id, f) in &program.functions {
        g.push_str(&dump_cfg(&Cfg::new(f), f, &format!("subgraph cluster_{id}")));
    }
    g.push_str("}\n");
    g
}
