use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::node::Node;

/// Metadata key carrying the session tag of an event.
pub const SESSION_METADATA_KEY: &str = "X-Pydio-Session";

/// Prefix on a session tag value signalling that the session closes with
/// this event.
pub const SESSION_CLOSE_PREFIX: &str = "close-";

/// What happened to the entry at the event path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	Create,
	Rename,
	Delete,
}

/// A normalized low-level change event, as emitted by a filesystem
/// watcher, an object-store notification client, or a full scan.
///
/// Paths are slash-separated and absolute within the source namespace.
/// Scan events may carry a pre-loaded [`Node`] snapshot so that later
/// enrichment does not have to probe the source again.
#[derive(Debug, Clone)]
pub struct RawEvent {
	pub kind: EventKind,
	pub path: String,
	pub folder: bool,
	pub scan_event: bool,
	pub scan_node: Option<Node>,
	pub operation_id: String,
	pub metadata: HashMap<String, String>,
}

impl RawEvent {
	pub fn new(kind: EventKind, path: impl Into<String>) -> Self {
		Self {
			kind,
			path: path.into(),
			folder: false,
			scan_event: false,
			scan_node: None,
			operation_id: String::new(),
			metadata: HashMap::new(),
		}
	}

	/// An event produced by a full scan, carrying the scanned node.
	pub fn from_scan(kind: EventKind, node: Node) -> Self {
		let mut event = Self::new(kind, node.path.clone());
		event.folder = !node.leaf;
		event.scan_event = true;
		event.scan_node = Some(node);
		event
	}

	pub fn with_folder(mut self) -> Self {
		self.folder = true;
		self
	}

	pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
		self.operation_id = operation_id.into();
		self
	}

	/// Tags the event with a session, the way producers bracket bursts of
	/// related events.
	pub fn with_session(mut self, tag: impl Into<String>) -> Self {
		self.metadata
			.insert(SESSION_METADATA_KEY.to_string(), tag.into());
		self
	}

	/// Session tag carried in the event metadata, if any.
	pub fn session_tag(&self) -> Option<&str> {
		self.metadata
			.get(SESSION_METADATA_KEY)
			.map(String::as_str)
			.filter(|tag| !tag.is_empty())
	}

	/// Derives the operation context for work done on behalf of this
	/// event. Cancelling `parent` cancels every context derived from it.
	pub fn operation_token(&self, parent: &CancellationToken) -> CancellationToken {
		parent.child_token()
	}
}
