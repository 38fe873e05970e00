//! # fluxframe
//!
//! A distributed, in-memory, columnar data frame store. A cluster of nodes
//! holds frames cut into compressed chunks spread over every node, and runs
//! group-by and merge as map/reduce jobs that process each chunk on the node
//! that owns it.
//!
//! ## Architecture
//! From the bottom up:
//!
//! - [`network`]: registration `Server`, TCP `Client` and an in-process
//!   `LocalNetwork`, behind the [`Transport`] trait
//! - [`kv`]: the `Directory`, a versioned key-value store partitioned by the
//!   home node of every key, with a cache of remote values and optimistic
//!   compare-and-swap writes
//! - [`chunk`]: column values and the compressed `Chunk`s storing them
//! - [`frame`]: `Vector`s (columns) and `Frame`s (tables) tying chunks
//!   together, and the operations that build and slice them
//! - [`engine`]: distributed jobs, per-chunk tasks on every node's cores,
//!   group-by and merge
//! - [`synopsis`]: metadata summaries of frames
//! - [`node`]: `FluxNode`, which puts it all together, and `LocalCluster`
//!
//! ## Example
//! ```rust,no_run
//! use fluxframe::{AggKind, Aggregate, LocalCluster, NamedColumn, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fluxframe::StoreError> {
//!     let cluster = LocalCluster::new(3, NodeConfig::default());
//!     let node = cluster.node(1);
//!     let trips = node
//!         .write_frame(
//!             "trips",
//!             vec![
//!                 NamedColumn::categorical_from_labels("day", &[Some("mon"), Some("tue"), None]),
//!                 NamedColumn::numeric("duration", vec![Some(3.0), Some(4.5), Some(1.0)]),
//!             ],
//!         )
//!         .await?;
//!     let by_day = node
//!         .group_by(&trips, &["day"], &[Aggregate::new(AggKind::Count, "duration")])
//!         .await?;
//!     println!("{:?}", node.synopsis(&by_day).await?);
//!     Ok(())
//! }
//! ```
//!
//! [`Transport`]: network::Transport
pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod kv;
pub mod network;
pub mod node;
pub mod synopsis;

pub use chunk::{ColumnData, Data, ElementKind};
pub use config::NodeConfig;
pub use engine::{AggKind, Aggregate, JobHandle, MergeOptions, NaMode};
pub use error::StoreError;
pub use frame::NamedColumn;
pub use kv::{Key, KeyKind};
pub use node::{FluxNode, LocalCluster};
pub use synopsis::Synopsis;
