//! Lazily evaluated, dependency-tracked values.
//!
//! # Primary API
//!
//! - [`ValueNode`]: one memoized value, computed on first read and shared by
//!   concurrent readers (single flight)
//! - [`ComputationGraph`]: named registry of nodes with cycle checks at wiring
//!   time and a stable topological order
//!
//! Invalidation is pull-based. Changing an input marks everything downstream
//! dirty; nothing recomputes until the next read.
//!
//! # Example
//!
//! ```
//! use remora_core::ComputationGraph;
//!
//! let graph = ComputationGraph::new();
//! let port = graph.input_with("port", 5556u16).unwrap();
//! let p = port.clone();
//! let control = graph
//!     .derive("control_port", &["port"], move || Ok(p.get()? + 2))
//!     .unwrap();
//!
//! assert_eq!(control.get().unwrap(), 5558);
//! port.set(6000).unwrap();
//! assert_eq!(control.get().unwrap(), 6002);
//! ```

pub mod error;
pub use error::{BoxError, Error, Result};

mod node;
pub use node::{link, Dependent, InvalidationListener, ListenerId, NodeId, ValueNode};

mod graph;
pub use graph::ComputationGraph;

pub mod prelude {
    pub use crate::{ComputationGraph, Dependent, Error, NodeId, Result, ValueNode};
}
