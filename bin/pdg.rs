// Dump the program dependence graph (or, with `cfg`, the control-flow
// graph) of one function as graphviz.
//
// Usage: pdg <file.lir> [function] [cfg]

use silent_store::middle_end::analysis::dominators::{DomTree, PostDomTree};
use silent_store::middle_end::analysis::pdg::ProgramDependenceGraph;
use silent_store::middle_end::analysis::Cfg;
use silent_store::middle_end::lir::*;

pub fn main() {
    let args: Vec<String> = std::env::args().collect();
    let Some(path) = args.get(1) else {
        panic!("usage: pdg <file.lir> [function] [cfg]");
    };
    let function = args.get(2).map(String::as_str).unwrap_or("main");

    let input = read_from(path);
    let program = input
        .parse::<Program>()
        .unwrap_or_else(|e| panic!("Syntax error: {e}"))
        .validate()
        .unwrap_or_else(|e| panic!("Invalid program: {e}"));

    let f = program
        .0
        .functions
        .get(&func_id(function))
        .unwrap_or_else(|| panic!("no function named {function}"));
    let cfg = Cfg::new(f);

    if args.get(3).map(String::as_str) == Some("cfg") {
        println!("{}", cfg_dump_impl::dump_cfg(&cfg, f, "digraph cfg"));
        return;
    }

    let dt = DomTree::new(&cfg);
    let mut pdg = ProgramDependenceGraph::new(f, &cfg, PostDomTree::new(&cfg));
    pdg.compute_dependences(&dt);
    println!("{}", pdg.graph().to_dot(function));
}

fn read_from(path: &str) -> String {
    String::from_utf8(
        std::fs::read(path).unwrap_or_else(|_| panic!("Could not read the input file {path}")),
    )
    .expect("The input file does not contain valid utf-8 text")
}
