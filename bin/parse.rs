// Parse and validate an LIR file, then print it back in canonical form.

use std::io::Read;

use silent_store::middle_end::lir::Program;

pub fn main() {
    let args: Vec<String> = std::env::args().collect();

    let input = match args.get(1) {
        Some(path) => read_from(path),
        None => {
            let mut s = String::new();
            std::io::stdin().read_to_string(&mut s).unwrap();
            s
        }
    };

    let program = input
        .parse::<Program>()
        .unwrap_or_else(|e| panic!("Syntax error: {e}"))
        .validate()
        .unwrap_or_else(|e| panic!("Invalid program: {e}"));

    print!("{}", program.0);
}

fn read_from(path: &str) -> String {
    String::from_utf8(
        std::fs::read(path).unwrap_or_else(|_| panic!("Could not read the input file {path}")),
    )
    .expect("The input file does not contain valid utf-8 text")
}
