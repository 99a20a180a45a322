//! Dependency resolution for workstreams.
//!
//! Builds a graph from the normalised dependency lists of one feature's
//! units and produces a deterministic execution order, or reports the units
//! stuck on a cycle.
//!
//! ## Example
//!
//! ```
//! use conductor::dag::resolve;
//! use conductor::manifest::WorkUnit;
//!
//! let units = vec![
//!     WorkUnit::new("A", "checkout", vec![]),
//!     WorkUnit::new("B", "checkout", vec!["A".to_string()]),
//!     WorkUnit::new("C", "checkout", vec!["A".to_string()]),
//! ];
//!
//! let order = resolve(&units).unwrap();
//! assert_eq!(order, vec!["A", "B", "C"]);
//! ```

mod builder;

pub use builder::{DependencyGraph, UnitIndex, resolve};
