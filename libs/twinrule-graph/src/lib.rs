//! Twin graph and formula binding
//!
//! - [`RelationRegistry`]: context-owned, append-only table of `(name, substance)` relations
//! - [`TwinGraph`]: arena graph rebuilt per generation from a [`TwinSnapshot`]
//! - [`TwinSource`]: where snapshots come from (file, static, or an external directory)
//! - [`Binder`]: resolves `[dtmi:...]`, `[Id]` and `OPTION(..)` against the graph

pub mod binder;
pub mod error;
pub mod graph;
pub mod relation;
pub mod source;

pub use binder::{Binder, BinderConfig, BoundFormula, OptionPolicy};
pub use error::{GraphError, Result};
pub use graph::{Neighbor, NodeHandle, RelationshipRecord, TwinGraph, TwinNode, TwinSnapshot};
pub use relation::{Relation, RelationId, RelationRegistry};
pub use source::{parse_snapshot, FileTwinSource, StaticTwinSource, TwinSource};
