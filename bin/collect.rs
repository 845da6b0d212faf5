// Replay a trace of recorded arithmetic operations into the identity
// counters and print the aggregate, as flat text or as JSON.
//
// Each trace line is `<opcode> <a> <b>`, e.g. `Add 3 0` or `FMul 2.5 1.0`.
//
// Usage: collect <trace.txt> [json]

use silent_store::middle_end::profile::{IdentityCounters, Opcode, OperandValue};

pub fn main() {
    let args: Vec<String> = std::env::args().collect();
    let Some(path) = args.get(1) else {
        panic!("usage: collect <trace.txt> [json]");
    };

    let input = read_from(path);
    let mut counters = IdentityCounters::new();

    for (lineno, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap();
        let opcode = Opcode::from_name(name)
            .unwrap_or_else(|| panic!("line {}: unknown opcode `{name}`", lineno + 1));
        let a = operand(opcode, parts.next(), lineno);
        let b = operand(opcode, parts.next(), lineno);
        counters.record_arith(opcode, a, b);
    }

    if args.get(2).map(String::as_str) == Some("json") {
        println!("{}", serde_json::to_string_pretty(&counters).unwrap());
    } else {
        print!("{}", counters.dump());
    }
}

fn operand(opcode: Opcode, text: Option<&str>, lineno: usize) -> OperandValue {
    let text = text.unwrap_or_else(|| panic!("line {}: missing operand", lineno + 1));
    if opcode.is_float() {
        let x = text
            .parse()
            .unwrap_or_else(|_| panic!("line {}: bad float operand `{text}`", lineno + 1));
        OperandValue::Flt(x)
    } else {
        let n = text
            .parse()
            .unwrap_or_else(|_| panic!("line {}: bad int operand `{text}`", lineno + 1));
        OperandValue::Int(n)
    }
}

fn read_from(path: &str) -> String {
    String::from_utf8(
        std::fs::read(path).unwrap_or_else(|_| panic!("Could not read the input file {path}")),
    )
    .expect("The input file does not contain valid utf-8 text")
}
