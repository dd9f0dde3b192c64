//! Package data model.
//!
//! Identity (`PackageRef`), version constraints, typed option values and the
//! declared requirements that recipes hand to the requirement graph.

mod types;

pub use types::*;
