pub mod analysis;
pub mod lir;
pub mod optimization;
pub mod profile;
