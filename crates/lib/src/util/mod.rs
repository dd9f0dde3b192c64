//! Shared utilities.
//!
//! Content hashing for cache integrity checks, plus test helpers.

pub mod hash;

#[cfg(test)]
pub mod testutil;
