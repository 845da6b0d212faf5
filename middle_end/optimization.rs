//! The guard-insertion pass: wrap candidate stores (and optionally their
//! feeding computation) in a runtime test so redundant work is skipped, or
//! instrument the candidates to measure how often the test would fire.

pub mod closure;
pub mod insert_guard;
pub mod silent_store;

#[cfg(test)]
mod tests;

/// Which rewrite the pass performs at each candidate site.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OptType {
    /// `eae`: guard on the non-loaded operand being the identity, skipping
    /// the load, the arithmetic and the store together.
    LoadElimination,
    /// `alp`: insert a recording call before each candidate arithmetic.
    IntraProfiling,
    /// `plp`: `alp` plus counter lifecycle calls bracketing `main`.
    InterProfiling,
    /// `ess`: guard on the computed value differing from the loaded one,
    /// skipping only the store.
    #[default]
    StoreElimination,
}

impl OptType {
    pub fn from_flag(flag: &str) -> Option<OptType> {
        match flag {
            "eae" => Some(OptType::LoadElimination),
            "alp" => Some(OptType::IntraProfiling),
            "plp" => Some(OptType::InterProfiling),
            "ess" => Some(OptType::StoreElimination),
            _ => None,
        }
    }

    pub fn flag(&self) -> &'static str {
        match self {
            OptType::LoadElimination => "eae",
            OptType::IntraProfiling => "alp",
            OptType::InterProfiling => "plp",
            OptType::StoreElimination => "ess",
        }
    }
}

/// Pass configuration.
#[derive(Clone, Debug)]
pub struct DagOpts {
    pub opt: OptType,
    /// Minimum static loop depth of a store for its site to be rewritten.
    pub loop_threshold: usize,
}

impl Default for DagOpts {
    fn default() -> Self {
        DagOpts {
            opt: OptType::default(),
            loop_threshold: 1,
        }
    }
}
