//! Definitions shared by the front end and the middle end.

use derive_more::Display;

/// A validation error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ValidationError(pub String);
impl std::error::Error for ValidationError {}

/// A witness that a value passed validation.  Analyses and transformations
/// only accept validated programs, so that they can assume structural
/// invariants (blocks exist, every variable has a single definition, and so
/// on) instead of re-checking them.
#[derive(Clone, Debug)]
pub struct Valid<T>(pub T);
