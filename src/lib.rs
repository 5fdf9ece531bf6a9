//! Event batching for bidirectional filesystem/object-store sync.
//!
//! `sync-batcher` sits between a raw change-event producer (a filesystem
//! watcher, an object-store notification client, or a full scan) and the
//! applier that mutates the other side of a sync. Raw events arrive out of
//! order, with duplicates, under concurrent mutation, and without enough
//! information to tell "delete `/a` + create `/b`" apart from "`/a` was
//! renamed to `/b`". The batcher aggregates each burst into a coherent
//! [`Batch`] and reinterprets it so the applier performs the minimum
//! correct set of mutations.
//!
//! # Architecture
//!
//! - **[`EventsBatcher`]**: selector loop routing incoming events into
//!   producer-declared session buffers or an anonymous time-windowed
//!   buffer, flushing on session close or quiescence
//! - **Batch filter**: per-flush reinterpretation of a batch — node
//!   enrichment through endpoint probes, folder and file move detection
//!   (stable identity first, then content fingerprint with closest-path
//!   arbitration), phantom create/delete cancellation, delete subtree
//!   pruning
//! - **[`SyncEndpoint`]**: the probe capability the batcher consumes; it
//!   knows nothing else about either side of the sync
//! - **[`BatcherNotification`]**: `filter:start` / `filter:end` lifecycle
//!   fan-out to registered observers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sync_batcher::{BatcherConfig, EventsBatcher};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(source: Arc<dyn sync_batcher::SyncEndpoint>, target: Arc<dyn sync_batcher::SyncEndpoint>) {
//! let (events_tx, events_rx) = mpsc::channel(64);
//! let (batches_tx, mut batches_rx) = mpsc::channel(1);
//!
//! let mut batcher = EventsBatcher::new(
//!     source,
//!     target,
//!     CancellationToken::new(),
//!     BatcherConfig::default(),
//! );
//! batcher.start(events_rx, batches_tx);
//!
//! // feed events_tx from a watcher; the applier drains batches_rx
//! while let Some(batch) = batches_rx.recv().await {
//!     for (destination, moved) in batch.file_moves() {
//!         println!("move {} -> {destination}", moved.node().unwrap().path);
//!     }
//! }
//! # }
//! ```

mod batch;
mod batcher;
mod config;
mod endpoint;
mod error;
mod event;
mod filter;
mod moves;
mod node;

pub use batch::{Batch, BatchedEvent};
pub use batcher::{BatcherNotification, EventsBatcher};
pub use config::BatcherConfig;
pub use endpoint::SyncEndpoint;
pub use error::{BatcherError, EndpointError};
pub use event::{EventKind, RawEvent, SESSION_CLOSE_PREFIX, SESSION_METADATA_KEY};
pub use filter::HIDDEN_META_FILENAME;
pub use node::Node;
