use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
	endpoint::SyncEndpoint,
	event::{EventKind, RawEvent},
	node::Node,
};

/// A raw event promoted into a [`Batch`], carrying everything the filter
/// and the downstream applier need to act on it.
///
/// The `key` is the event path at insertion time and is never rewritten,
/// even when filtering resolves the entry to a node living at a different
/// path (a move keeps the destination path as its key while its node
/// carries the origin path).
#[derive(Clone)]
pub struct BatchedEvent {
	pub(crate) key: String,
	pub(crate) event: RawEvent,
	pub(crate) source: Arc<dyn SyncEndpoint>,
	pub(crate) target: Arc<dyn SyncEndpoint>,
	pub(crate) node: Option<Node>,
}

impl BatchedEvent {
	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn event(&self) -> &RawEvent {
		&self.event
	}

	/// Node resolved during filtering. For surviving creates this is the
	/// source-side node; for deletes and moves, the target-side node.
	pub fn node(&self) -> Option<&Node> {
		self.node.as_ref()
	}

	pub fn source(&self) -> &Arc<dyn SyncEndpoint> {
		&self.source
	}

	pub fn target(&self) -> &Arc<dyn SyncEndpoint> {
		&self.target
	}
}

impl fmt::Debug for BatchedEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BatchedEvent")
			.field("key", &self.key)
			.field("event", &self.event)
			.field("node", &self.node)
			.finish_non_exhaustive()
	}
}

/// One flush worth of events, keyed by path at insertion.
///
/// A batch starts out as a raw aggregation of creates and deletes; the
/// filter then reinterprets it in place, populating `file_moves` and
/// pruning redundant entries, until the four primary collections are
/// disjoint by key and every surviving entry carries a resolved node.
#[derive(Debug, Clone, Default)]
pub struct Batch {
	pub(crate) create_files: HashMap<String, BatchedEvent>,
	pub(crate) create_folders: HashMap<String, BatchedEvent>,
	pub(crate) deletes: HashMap<String, BatchedEvent>,
	pub(crate) file_moves: HashMap<String, BatchedEvent>,
	pub(crate) refresh_files_uuid: HashMap<String, BatchedEvent>,
	pub(crate) as_session: bool,
}

impl Batch {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a raw event under the population rules: creates and renames
	/// land in the create collections split by folderness, deletes in the
	/// delete collection. Last writer wins per key.
	///
	/// A snapshot-sourced delete adopts its snapshot node right away;
	/// creates are enriched later by the filter.
	pub(crate) fn push(
		&mut self,
		event: RawEvent,
		source: Arc<dyn SyncEndpoint>,
		target: Arc<dyn SyncEndpoint>,
	) {
		let key = event.path.clone();
		let kind = event.kind;
		let folder = event.folder;
		let node = match kind {
			EventKind::Delete => event.scan_node.clone(),
			_ => None,
		};
		let batched = BatchedEvent {
			key: key.clone(),
			event,
			source,
			target,
			node,
		};
		match kind {
			EventKind::Create | EventKind::Rename => {
				if folder {
					self.create_folders.insert(key, batched);
				} else {
					self.create_files.insert(key, batched);
				}
			}
			EventKind::Delete => {
				self.deletes.insert(key, batched);
			}
		}
	}

	/// Leaf creations that survived filtering as genuine creates.
	pub fn create_files(&self) -> &HashMap<String, BatchedEvent> {
		&self.create_files
	}

	/// Folder creations that survived filtering as genuine creates.
	pub fn create_folders(&self) -> &HashMap<String, BatchedEvent> {
		&self.create_folders
	}

	/// Deletions; after filtering, minimal (no entry is covered by an
	/// ancestor entry) and all resolved against the target.
	pub fn deletes(&self) -> &HashMap<String, BatchedEvent> {
		&self.deletes
	}

	/// Moves detected by the filter, keyed by destination path. Each
	/// entry's node is the pre-existing target-side node, so its path is
	/// the origin of the move. Holds file and folder moves alike.
	pub fn file_moves(&self) -> &HashMap<String, BatchedEvent> {
		&self.file_moves
	}

	/// Created files whose loaded node carries no stable identity yet and
	/// will need a later identity-assigning probe.
	pub fn refresh_files_uuid(&self) -> &HashMap<String, BatchedEvent> {
		&self.refresh_files_uuid
	}

	/// Whether the batch was flushed on behalf of a producer-declared
	/// session rather than the anonymous time window. Advisory; appliers
	/// may use it to bracket their own work.
	pub fn as_session(&self) -> bool {
		self.as_session
	}

	/// Whether `key` is present in any of the four primary collections.
	pub fn contains_key(&self, key: &str) -> bool {
		self.create_files.contains_key(key)
			|| self.create_folders.contains_key(key)
			|| self.deletes.contains_key(key)
			|| self.file_moves.contains_key(key)
	}

	/// Total number of entries across the four primary collections.
	pub fn len(&self) -> usize {
		self.create_files.len() + self.create_folders.len() + self.deletes.len() + self.file_moves.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
