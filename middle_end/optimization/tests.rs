use pretty_assertions::assert_eq;

use crate::middle_end::analysis::dominators::DomTree;
use crate::middle_end::analysis::loops::LoopInfo;
use crate::middle_end::analysis::Cfg;
use crate::middle_end::lir::*;

use super::silent_store::{run_dag_opt, run_on_function};
use super::{DagOpts, OptType};

// run the pass and compare against the expected program.  Both sides are
// printed through `Display` so formatting and block order are canonical.
fn optimizes_to(opts: &DagOpts, input: &str, expected: &str) {
    let program = input.parse::<Program>().unwrap().validate().unwrap();
    let optimized = run_dag_opt(program, opts);
    let expected = expected.parse::<Program>().unwrap();
    assert_eq!(optimized.0.to_string(), expected.to_string());
}

fn ess() -> DagOpts {
    DagOpts::default()
}

fn with_mode(opt: OptType) -> DagOpts {
    DagOpts {
        opt,
        ..DagOpts::default()
    }
}

const LOOP_INPUT: &str = r#"
fn main(p:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, x:int, y:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  y = $arith add x b
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#;

const NESTED_LOOP_INPUT: &str = r#"
fn main(p:&int, b:int, n:int, m:int) -> _ {
let i:int, i2:int, j:int, j2:int, ci:int, cj:int, x:int, y:int
entry:
  $jump outer
outer:
  i = $phi(0, i2)
  $jump inner
inner:
  j = $phi(0, j2)
  x = $load p
  y = $arith add x b
  $store p y
  j2 = $arith add j 1
  cj = $cmp lt j2 m
  $branch cj inner next
next:
  i2 = $arith add i 1
  ci = $cmp lt i2 n
  $branch ci outer done
done:
  $ret
}
"#;

#[test]
fn store_elimination_guards_a_loop_store() {
    optimizes_to(
        &ess(),
        LOOP_INPUT,
        r#"
fn main(p:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, cmp0:int, x:int, y:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  $jump split1
split1:
  x = $load p
  y = $arith add x b
  cmp0 = $cmp neq y x
  $branch cmp0 then0 split0
then0:
  $store p y
  $jump split0
split0:
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#,
    );
}

#[test]
fn load_elimination_moves_the_whole_chain() {
    optimizes_to(
        &with_mode(OptType::LoadElimination),
        LOOP_INPUT,
        r#"
fn main(p:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, cmp0:int, x:int, y:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  $jump split1
split1:
  cmp0 = $cmp neq b 0
  $branch cmp0 then0 split0
then0:
  x = $load p
  y = $arith add x b
  $store p y
  $jump split0
split0:
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#,
    );
}

#[test]
fn store_outside_a_loop_is_left_alone() {
    let input = r#"
fn main(p:&int, b:int) -> _ {
let x:int, y:int
entry:
  x = $load p
  y = $arith add x b
  $store p y
  $ret
}
"#;
    optimizes_to(&ess(), input, input);
}

#[test]
fn threshold_above_depth_skips_the_site() {
    let opts = DagOpts {
        loop_threshold: 2,
        ..DagOpts::default()
    };
    optimizes_to(&opts, LOOP_INPUT, LOOP_INPUT);
}

#[test]
fn division_is_not_a_candidate() {
    let input = r#"
fn main(p:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, x:int, y:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  y = $arith div x b
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#;
    optimizes_to(&ess(), input, input);
}

#[test]
fn subtraction_from_the_right_has_no_identity() {
    // `*p = b - *p` cannot be guarded on `b != 0`.
    let input = r#"
fn main(p:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, x:int, y:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  y = $arith sub b x
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#;
    optimizes_to(&with_mode(OptType::LoadElimination), input, input);
}

#[test]
fn float_store_gets_an_ordered_guard() {
    optimizes_to(
        &ess(),
        r#"
fn main(p:&flt, b:flt, n:int) -> _ {
let i:int, i2:int, c:int, x:flt, y:flt
entry:
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  y = $arith fadd x b
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#,
        r#"
fn main(p:&flt, b:flt, n:int) -> _ {
let i:int, i2:int, c:int, cmp0:int, x:flt, y:flt
entry:
  $jump head
head:
  i = $phi(0, i2)
  $jump split1
split1:
  x = $load p
  y = $arith fadd x b
  cmp0 = $cmp fone y x
  $branch cmp0 then0 split0
then0:
  $store p y
  $jump split0
split0:
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#,
    );
}

#[test]
fn two_candidates_in_one_block() {
    optimizes_to(
        &ess(),
        r#"
fn main(p:&int, q:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, x1:int, y1:int, x2:int, y2:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  x1 = $load p
  y1 = $arith add x1 b
  $store p y1
  x2 = $load q
  y2 = $arith add x2 b
  $store q y2
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#,
        r#"
fn main(p:&int, q:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, cmp0:int, cmp1:int, x1:int, y1:int, x2:int, y2:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  $jump split1
split1:
  x1 = $load p
  y1 = $arith add x1 b
  cmp0 = $cmp neq y1 x1
  $branch cmp0 then0 split0
then0:
  $store p y1
  $jump split0
split0:
  x2 = $load q
  y2 = $arith add x2 b
  cmp1 = $cmp neq y2 x2
  $branch cmp1 then1 split2
then1:
  $store q y2
  $jump split2
split2:
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#,
    );
}

#[test]
fn store_elimination_is_idempotent() {
    let program = LOOP_INPUT.parse::<Program>().unwrap().validate().unwrap();
    let once = run_dag_opt(program, &ess());
    let twice = run_dag_opt(once.0.clone().validate().unwrap(), &ess());
    assert_eq!(once.0.to_string(), twice.0.to_string());
}

#[test]
fn intra_profiling_instruments_the_arithmetic() {
    optimizes_to(
        &with_mode(OptType::IntraProfiling),
        LOOP_INPUT,
        r#"
fn main(p:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, x:int, y:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  $call_ext record_arith_int(0, 0, x, b)
  y = $arith add x b
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#,
    );
}

#[test]
fn inter_profiling_brackets_main() {
    optimizes_to(
        &with_mode(OptType::InterProfiling),
        LOOP_INPUT,
        r#"
fn main(p:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, x:int, y:int
entry:
  $call_ext init_instrumentation()
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  $call_ext record_arith_int(0, 0, x, b)
  y = $arith add x b
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $call_ext dump_txt()
  $ret
}
"#,
    );
}

#[test]
fn inter_profiling_leaves_other_functions_unbracketed() {
    let input = r#"
fn bump(p:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, x:int, y:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  y = $arith add x b
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#;
    let expected = r#"
fn bump(p:&int, b:int, n:int) -> _ {
let i:int, i2:int, c:int, x:int, y:int
entry:
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  $call_ext record_arith_int(0, 0, x, b)
  y = $arith add x b
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#;
    optimizes_to(&with_mode(OptType::InterProfiling), input, expected);
}

#[test]
fn profiling_distinguishes_float_arithmetic() {
    // fmul is opcode index 5 in the tracked table.
    optimizes_to(
        &with_mode(OptType::IntraProfiling),
        r#"
fn main(p:&flt, b:flt, n:int) -> _ {
let i:int, i2:int, c:int, x:flt, y:flt
entry:
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  y = $arith fmul x b
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#,
        r#"
fn main(p:&flt, b:flt, n:int) -> _ {
let i:int, i2:int, c:int, x:flt, y:flt
entry:
  $jump head
head:
  i = $phi(0, i2)
  x = $load p
  $call_ext record_arith_flt(5, 0, x, b)
  y = $arith fmul x b
  $store p y
  i2 = $arith add i 1
  c = $cmp lt i2 n
  $branch c head done
done:
  $ret
}
"#,
    );
}

#[test]
fn patched_analyses_match_a_recomputation() {
    let mut f = LOOP_INPUT
        .parse::<Program>()
        .unwrap()
        .validate()
        .unwrap()
        .0
        .functions
        .values()
        .next()
        .unwrap()
        .clone();
    let (dt, li) = run_on_function(&mut f, &ess());

    let cfg = Cfg::new(&f);
    let fresh_dt = DomTree::new(&cfg);
    let fresh_li = LoopInfo::new(&cfg, &fresh_dt);

    assert_eq!(dt.idoms(), fresh_dt.idoms());
    for bb in cfg.blocks() {
        assert_eq!(li.depth(bb), fresh_li.depth(bb), "loop depth of {bb}");
    }
}

#[test]
fn depth_two_store_is_guarded_and_analyses_stay_consistent() {
    let opts = DagOpts {
        loop_threshold: 2,
        ..DagOpts::default()
    };
    optimizes_to(
        &opts,
        NESTED_LOOP_INPUT,
        r#"
fn main(p:&int, b:int, n:int, m:int) -> _ {
let i:int, i2:int, j:int, j2:int, ci:int, cj:int, cmp0:int, x:int, y:int
entry:
  $jump outer
outer:
  i = $phi(0, i2)
  $jump inner
inner:
  j = $phi(0, j2)
  $jump split1
split1:
  x = $load p
  y = $arith add x b
  cmp0 = $cmp neq y x
  $branch cmp0 then0 split0
then0:
  $store p y
  $jump split0
split0:
  j2 = $arith add j 1
  cj = $cmp lt j2 m
  $branch cj inner next
next:
  i2 = $arith add i 1
  ci = $cmp lt i2 n
  $branch ci outer done
done:
  $ret
}
"#,
    );

    let mut f = NESTED_LOOP_INPUT
        .parse::<Program>()
        .unwrap()
        .validate()
        .unwrap()
        .0
        .functions
        .values()
        .next()
        .unwrap()
        .clone();
    let (dt, li) = run_on_function(&mut f, &opts);

    let cfg = Cfg::new(&f);
    let fresh_dt = DomTree::new(&cfg);
    let fresh_li = LoopInfo::new(&cfg, &fresh_dt);

    assert_eq!(dt.idoms(), fresh_dt.idoms());
    for bb in cfg.blocks() {
        assert_eq!(li.depth(bb), fresh_li.depth(bb), "loop depth of {bb}");
    }
    for bb in ["split1", "then0", "split0"] {
        assert_eq!(li.depth(&bb_id(bb)), 2, "new block {bb} belongs to both loops");
    }
}

#[test]
fn guarded_store_dominance_holds() {
    // every variable used in the then block is defined there or in a
    // dominating block.
    let program = LOOP_INPUT.parse::<Program>().unwrap().validate().unwrap();
    let optimized = run_dag_opt(program, &ess()).0;
    let f = optimized.functions.values().next().unwrap();
    let cfg = Cfg::new(f);
    let dt = DomTree::new(&cfg);

    for (bbid, bb) in &f.body {
        for (idx, inst) in bb.insts.iter().enumerate() {
            // phi operands flow in along edges, not from dominators.
            if matches!(inst, Instruction::Phi { .. }) {
                continue;
            }
            for v in inst.used_vars() {
                let Some((def_bb, def_idx)) = f.def_site(v) else {
                    continue; // parameter
                };
                if def_bb == *bbid {
                    assert!(def_idx < idx, "{v} used before its definition in {bbid}");
                } else {
                    assert!(
                        dt.dominates(&def_bb, bbid),
                        "{def_bb} must dominate {bbid} for {v}"
                    );
                }
            }
        }
    }
}
