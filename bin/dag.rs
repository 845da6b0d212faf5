// Run the guard-insertion pass over an LIR file and print the transformed
// program.
//
// Usage: dag <file.lir> [eae|alp|plp|ess] [loop-threshold]

use silent_store::middle_end::lir::Program;
use silent_store::middle_end::optimization::silent_store::run_dag_opt;
use silent_store::middle_end::optimization::{DagOpts, OptType};

pub fn main() {
    let args: Vec<String> = std::env::args().collect();
    let Some(path) = args.get(1) else {
        panic!("usage: dag <file.lir> [eae|alp|plp|ess] [loop-threshold]");
    };

    let mut opts = DagOpts::default();
    if let Some(flag) = args.get(2) {
        opts.opt = OptType::from_flag(flag)
            .unwrap_or_else(|| panic!("unknown mode `{flag}`, expected eae, alp, plp or ess"));
    }
    if let Some(t) = args.get(3) {
        opts.loop_threshold = t
            .parse()
            .unwrap_or_else(|_| panic!("loop-threshold must be a number, got `{t}`"));
    }

    let input = read_from(path);
    let program = input
        .parse::<Program>()
        .unwrap_or_else(|e| panic!("Syntax error: {e}"))
        .validate()
        .unwrap_or_else(|e| panic!("Invalid program: {e}"));

    let optimized = run_dag_opt(program, &opts);
    print!("{}", optimized.0);
}

fn read_from(path: &str) -> String {
    String::from_utf8(
        std::fs::read(path).unwrap_or_else(|_| panic!("Could not read the input file {path}")),
    )
    .expect("The input file does not contain valid utf-8 text")
}
