use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A filesystem or object-store entry as seen by one endpoint.
///
/// Nodes are immutable value objects inside the batcher: probes produce
/// them, batched events own them. The `uuid` is the stable identity
/// assigned by the target index (`None` on a freshly discovered entry);
/// the `etag` is an opaque content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
	pub path: String,
	pub uuid: Option<Uuid>,
	pub etag: Option<String>,
	pub leaf: bool,
	pub size: u64,
	pub mtime: DateTime<Utc>,
}

impl Node {
	pub fn file(path: impl Into<String>, size: u64, mtime: DateTime<Utc>) -> Self {
		Self {
			path: path.into(),
			uuid: None,
			etag: None,
			leaf: true,
			size,
			mtime,
		}
	}

	pub fn folder(path: impl Into<String>, mtime: DateTime<Utc>) -> Self {
		Self {
			path: path.into(),
			uuid: None,
			etag: None,
			leaf: false,
			size: 0,
			mtime,
		}
	}

	pub fn with_uuid(mut self, uuid: Uuid) -> Self {
		self.uuid = Some(uuid);
		self
	}

	/// Attaches a content fingerprint. Empty fingerprints are normalized
	/// away so that two fingerprint-less nodes never compare equal on etag.
	pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
		let etag = etag.into();
		self.etag = (!etag.is_empty()).then_some(etag);
		self
	}

	pub fn is_leaf(&self) -> bool {
		self.leaf
	}

	/// Final path segment.
	pub fn base_name(&self) -> &str {
		self.path.rsplit('/').next().unwrap_or(self.path.as_str())
	}
}
