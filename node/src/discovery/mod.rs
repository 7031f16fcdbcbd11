//! Service announcement and discovery over the coordination store.
//!
//! A node announces each registered entry under a lease-bound key:
//!
//! ```text
//! rpc-entry/<entry>/$/<node>   {"host": "...", "schemaHash": "...", "weight": 2}
//! rpc-proto/<hash>/<node>      <schema JSON>
//! ```
//!
//! Callers watch `rpc-entry/<entry>/$/` to keep a live target set per entry
//! and pick among the targets by weight. When the node stops renewing its
//! lease the store drops its keys and watchers see the deletes.

/// Lease-bound announcement of a node's entries.
pub mod announcer;
pub mod balancer;
pub mod keys;
/// Live provider sets per entry, fed by store watches.
pub mod resolver;
/// Schemas by content hash, shared by every caller of a node.
pub mod schemas;

pub use announcer::Announcer;
pub use balancer::{pick, RandomSource, SeededRandom, ThreadRandom};
pub use keys::{Announcement, KeyLayout, Target};
pub use resolver::{Discovery, Resolver};
pub use schemas::SchemaCache;
