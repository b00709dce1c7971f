//! Loom Dependency Graph
//!
//! Directed graph of artifact IDs. An edge `from -> to` means `to` is derived
//! from `from`.
//!
//! # Core Concepts
//!
//! - [`DependencyGraph`]: Edge list plus upstream/downstream indexes
//! - [`DependencyGraph::get_derivation_order`]: What must re-run after a change, in order
//! - [`DependencyGraph::detect_cycle`]: Cycles are reported, never resolved
//!
//! # Example
//!
//! ```rust
//! use loom_graph::{DependencyGraph, EdgeType};
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_edge("US-ORD-001", "AC-ORD-001", EdgeType::Derives);
//! graph.add_edge("AC-ORD-001", "TC-AC-ORD-001-P01", EdgeType::Derives);
//!
//! let order = graph.get_derivation_order(&["AC-ORD-001"]).unwrap();
//! assert_eq!(order, vec!["AC-ORD-001", "TC-AC-ORD-001-P01"]);
//! ```

#![warn(unreachable_pub)]

mod error;
mod graph;

pub use error::GraphError;
pub use graph::{DependencyEdge, DependencyGraph, EdgeType};
