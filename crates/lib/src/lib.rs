//! pkgweave-lib: dependency resolution and build orchestration for native packages
//!
//! This crate provides the core of a native package builder:
//! - `graph`: transitive requirement graph with cycle and version conflict detection
//! - `options`: option resolution with explicit override precedence
//! - `fingerprint`: content-addressed identity of each buildable configuration
//! - `cache`: content-addressed package cache with per-fingerprint reservations
//! - `execute`: parallel lifecycle execution in dependency order
//! - `export`: consumable build metadata for downstream packages
//! - `session`: the root `plan` / `build` / `export` API
//!
//! Fetching sources, running toolchains and laying out packages belong to
//! [`recipe::Recipe`] implementations.

pub mod cache;
pub mod consts;
pub mod execute;
pub mod export;
pub mod fingerprint;
pub mod graph;
pub mod options;
pub mod package;
pub mod recipe;
pub mod session;
pub mod util;

pub use package::{OptionSet, OptionValue, PackageRef, Requirement, VersionConstraint};
pub use recipe::{Recipe, RecipeRegistry, RecipeSource};
pub use session::{BuildError, BuildOptions, ExportedGraph, PlanError, PlanReport, Session};
