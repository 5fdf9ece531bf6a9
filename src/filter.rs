//! Batch reinterpretation: enrichment, move detection, pruning.
//!
//! The filter rewrites a freshly populated [`Batch`] in place so that the
//! downstream applier performs the minimum correct set of mutations: raw
//! create/delete pairs that describe a rename collapse into a single move,
//! deletes already covered by a deleted ancestor disappear, and every
//! surviving entry carries the node it refers to.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
	batch::Batch,
	batcher::{BatcherNotification, Shared},
	moves::{self, Move},
};

/// Reserved name of the per-folder metadata file. Such entries never carry
/// a stable identity, so their missing identity must not schedule a
/// refresh probe.
pub const HIDDEN_META_FILENAME: &str = ".pydio";

/// Runs the full filtering pipeline over `batch`, notifying registered
/// observers at entry and exit.
///
/// Every input yields a valid batch: probe failures discard the entries
/// they concern and the rest of the batch proceeds. Filtering an
/// already-filtered batch is a no-op as long as the endpoints answer the
/// same way.
pub(crate) async fn filter_batch(shared: &Shared, batch: &mut Batch) {
	shared
		.notify(BatcherNotification::FilterStart(Arc::new(batch.clone())))
		.await;

	enrich_create_files(shared, batch).await;
	enrich_create_folders(shared, batch).await;
	moves::detect_folder_moves(batch, &shared.target, &shared.context).await;
	let candidates = detect_file_moves(shared, batch).await;
	commit_closest_moves(batch, candidates);
	prune_deletes(batch);

	shared
		.notify(BatcherNotification::FilterEnd(Arc::new(batch.clone())))
		.await;
}

/// Attaches a node to every created file, probing the source unless the
/// event is a scan event that already carries its node. A create that can
/// no longer be probed is discarded together with any same-key delete:
/// whatever was created there has already vanished again.
async fn enrich_create_files(shared: &Shared, batch: &mut Batch) {
	let keys: Vec<String> = batch.create_files.keys().cloned().collect();

	for key in keys {
		let Some(entry) = batch.create_files.get(&key) else {
			continue;
		};
		let scan_node = entry
			.event
			.scan_node
			.clone()
			.filter(|_| entry.event.scan_event);
		let ctx = entry.event.operation_token(&shared.context);

		let loaded = match scan_node {
			Some(node) => {
				trace!(path = %key, "adopting scan node for created file");
				Ok(Some(node))
			}
			None => shared.source.load_node(&ctx, &key, None).await,
		};

		match loaded {
			Ok(Some(node)) => {
				let needs_refresh =
					node.uuid.is_none() && node.base_name() != HIDDEN_META_FILENAME;
				if let Some(entry) = batch.create_files.get_mut(&key) {
					entry.node = Some(node);
					if needs_refresh {
						batch.refresh_files_uuid.insert(key.clone(), entry.clone());
					}
				}
			}
			Ok(None) | Err(_) => {
				debug!(path = %key, "created file not probeable on source, discarding create story");
				batch.create_files.remove(&key);
				batch.refresh_files_uuid.remove(&key);
				batch.deletes.remove(&key);
			}
		}
	}
}

/// Same enrichment for created folders, minus the identity refresh set.
async fn enrich_create_folders(shared: &Shared, batch: &mut Batch) {
	let keys: Vec<String> = batch.create_folders.keys().cloned().collect();

	for key in keys {
		let Some(entry) = batch.create_folders.get(&key) else {
			continue;
		};
		let scan_node = entry
			.event
			.scan_node
			.clone()
			.filter(|_| entry.event.scan_event);
		let ctx = entry.event.operation_token(&shared.context);

		let loaded = match scan_node {
			Some(node) => Ok(Some(node)),
			None => shared.source.load_node(&ctx, &key, Some(false)).await,
		};

		match loaded {
			Ok(Some(node)) => {
				if let Some(entry) = batch.create_folders.get_mut(&key) {
					trace!(path = %key, "created folder enriched");
					entry.node = Some(node);
				}
			}
			Ok(None) | Err(_) => {
				debug!(path = %key, "created folder not probeable on source, discarding create story");
				batch.create_folders.remove(&key);
				batch.deletes.remove(&key);
			}
		}
	}
}

/// Resolves every remaining delete against the target and pairs leaf
/// deletes with created files referring to the same node.
///
/// A stable-identity match commits a move immediately. Content-fingerprint
/// matches only yield candidates, possibly several per delete, which the
/// closest-move arbitration settles afterwards. A delete with no
/// target-side node never reaches the applier: either it cancels a
/// same-key create (when the source confirms nothing is left at the path)
/// or it is dropped alone.
async fn detect_file_moves(shared: &Shared, batch: &mut Batch) -> Vec<Move> {
	let mut candidates = Vec::new();
	let keys: Vec<String> = batch.deletes.keys().cloned().collect();

	for key in keys {
		let (attached, ctx) = match batch.deletes.get(&key) {
			Some(entry) => (entry.node.clone(), entry.event.operation_token(&shared.context)),
			None => continue,
		};

		let db_node = match attached {
			Some(node) => Some(node),
			None => match shared.target.load_node(&ctx, &key, None).await {
				Ok(node) => node,
				Err(e) => {
					debug!(path = %key, "target probe failed while resolving delete: {e}");
					None
				}
			},
		};

		let Some(db_node) = db_node else {
			resolve_unindexed_delete(shared, batch, &key, &ctx).await;
			continue;
		};

		if let Some(entry) = batch.deletes.get_mut(&key) {
			entry.node = Some(db_node.clone());
		}
		if !db_node.is_leaf() {
			continue;
		}

		// Stable identity first; it cannot be fooled by equal content.
		let uuid_match = db_node.uuid.and_then(|uuid| {
			batch
				.create_files
				.iter()
				.find(|(_, create)| {
					create
						.node
						.as_ref()
						.and_then(|node| node.uuid)
						.is_some_and(|candidate| candidate == uuid)
				})
				.map(|(create_key, _)| create_key.clone())
		});
		if let Some(create_key) = uuid_match {
			debug!(from = %key, to = %create_key, "leaf with matching identity, safe move");
			moves::promote_file_move(batch, &key, &create_key, db_node);
			continue;
		}

		if let Some(etag) = db_node.etag.as_deref() {
			for (create_key, create) in &batch.create_files {
				let same_content = create
					.node
					.as_ref()
					.and_then(|node| node.etag.as_deref())
					.is_some_and(|candidate| candidate == etag);
				if same_content {
					trace!(from = %key, to = %create_key, "leaf with matching content, possible move");
					candidates.push(Move {
						delete_key: key.clone(),
						create_key: create_key.clone(),
						db_node: db_node.clone(),
					});
				}
			}
		}
	}

	candidates
}

/// A delete whose path the target has never indexed. When the same batch
/// also created the path, arrival order is unknown, so the source decides:
/// if nothing is there anymore, the create goes too. The delete itself is
/// always dropped; there is nothing on the target to delete.
async fn resolve_unindexed_delete(
	shared: &Shared,
	batch: &mut Batch,
	key: &str,
	ctx: &tokio_util::sync::CancellationToken,
) {
	let create_file = batch.create_files.contains_key(key);
	let create_folder = batch.create_folders.contains_key(key);

	if create_file || create_folder {
		let exists = shared
			.source
			.load_node(ctx, key, Some(create_file))
			.await
			.ok()
			.flatten();
		if exists.is_none() {
			debug!(path = %key, "created then deleted and gone from source, ignoring entirely");
			if create_file {
				batch.create_files.remove(key);
				batch.refresh_files_uuid.remove(key);
			}
			if create_folder {
				batch.create_folders.remove(key);
			}
		}
	}

	batch.deletes.remove(key);
}

/// Settles content-fingerprint candidates greedily by path proximity. A
/// candidate commits only while both of its endpoints are still unclaimed;
/// the rest dissolve back into independent creates and deletes.
fn commit_closest_moves(batch: &mut Batch, mut candidates: Vec<Move>) {
	moves::sort_closest_moves(&mut candidates);

	for candidate in candidates {
		if batch.deletes.contains_key(&candidate.delete_key)
			&& batch.create_files.contains_key(&candidate.create_key)
		{
			debug!(
				from = %candidate.delete_key,
				to = %candidate.create_key,
				"picked closest move"
			);
			moves::promote_file_move(
				batch,
				&candidate.delete_key,
				&candidate.create_key,
				candidate.db_node,
			);
		}
	}
}

/// Drops every delete whose node lives under another deleted node; the
/// applier removes whole subtrees through their root.
fn prune_deletes(batch: &mut Batch) {
	let mut by_path: Vec<(String, String)> = batch
		.deletes
		.iter()
		.filter_map(|(key, entry)| {
			entry
				.node
				.as_ref()
				.map(|node| (key.clone(), node.path.clone()))
		})
		.collect();
	by_path.sort_by_key(|(_, path)| path.len());

	let mut kept: Vec<String> = Vec::new();
	for (key, path) in by_path {
		if kept.iter().any(|root| moves::is_strict_ancestor(root, &path)) {
			trace!(path = %path, "delete covered by deleted ancestor, pruning");
			batch.deletes.remove(&key);
		} else {
			kept.push(path);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::{HashMap, HashSet};

	use async_trait::async_trait;
	use chrono::Utc;
	use tokio_util::sync::CancellationToken;
	use uuid::Uuid;

	use super::*;
	use crate::{
		endpoint::SyncEndpoint,
		error::EndpointError,
		event::{EventKind, RawEvent},
		node::Node,
	};

	/// Endpoint answering probes from a fixed set of nodes.
	#[derive(Default)]
	struct StaticEndpoint {
		nodes: HashMap<String, Node>,
		failures: HashSet<String>,
	}

	impl StaticEndpoint {
		fn new() -> Self {
			Self::default()
		}

		fn with_node(mut self, node: Node) -> Self {
			self.nodes.insert(node.path.clone(), node);
			self
		}

		fn failing_on(mut self, path: &str) -> Self {
			self.failures.insert(path.to_string());
			self
		}
	}

	#[async_trait]
	impl SyncEndpoint for StaticEndpoint {
		async fn load_node(
			&self,
			_ctx: &CancellationToken,
			path: &str,
			_leaf_hint: Option<bool>,
		) -> Result<Option<Node>, EndpointError> {
			if self.failures.contains(path) {
				return Err(EndpointError::Endpoint(format!("probe refused for {path}")));
			}
			Ok(self.nodes.get(path).cloned())
		}
	}

	fn shared(source: StaticEndpoint, target: StaticEndpoint) -> Shared {
		Shared::new(
			Arc::new(source),
			Arc::new(target),
			CancellationToken::new(),
		)
	}

	fn batch_of(shared: &Shared, events: Vec<RawEvent>) -> Batch {
		let mut batch = Batch::new();
		for event in events {
			batch.push(event, shared.source.clone(), shared.target.clone());
		}
		batch
	}

	fn sorted_keys(collection: &HashMap<String, crate::batch::BatchedEvent>) -> Vec<String> {
		let mut keys: Vec<String> = collection.keys().cloned().collect();
		keys.sort();
		keys
	}

	fn assert_disjoint(batch: &Batch) {
		let collections = [
			batch.create_files(),
			batch.create_folders(),
			batch.deletes(),
			batch.file_moves(),
		];
		let mut seen = HashSet::new();
		for collection in collections {
			for key in collection.keys() {
				assert!(seen.insert(key.clone()), "key {key} appears twice");
			}
		}
	}

	fn assert_nodes_resolved(batch: &Batch) {
		for collection in [
			batch.create_files(),
			batch.create_folders(),
			batch.deletes(),
			batch.file_moves(),
		] {
			for (key, entry) in collection {
				assert!(entry.node().is_some(), "entry {key} has no node");
			}
		}
	}

	#[tokio::test]
	async fn rename_detected_by_identity() {
		let uuid = Uuid::new_v4();
		let scanned = Node::file("/b", 10, Utc::now())
			.with_uuid(uuid)
			.with_etag("e1");
		let indexed = Node::file("/a", 10, Utc::now())
			.with_uuid(uuid)
			.with_etag("e0");

		let shared = shared(
			StaticEndpoint::new(),
			StaticEndpoint::new().with_node(indexed),
		);
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::from_scan(EventKind::Create, scanned),
				RawEvent::new(EventKind::Delete, "/a"),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert!(batch.create_files().is_empty());
		assert!(batch.deletes().is_empty());
		let moved = &batch.file_moves()["/b"];
		let node = moved.node().expect("move carries a node");
		assert_eq!(node.path, "/a");
		assert_eq!(node.uuid, Some(uuid));
		assert_disjoint(&batch);
		assert_nodes_resolved(&batch);
	}

	#[tokio::test]
	async fn snapshot_sourced_delete_needs_no_target_probe() {
		let uuid = Uuid::new_v4();
		let snapshot = Node::file("/a", 10, Utc::now()).with_uuid(uuid);
		let scanned = Node::file("/b", 10, Utc::now()).with_uuid(uuid);

		// The target knows nothing; the delete resolves from its snapshot.
		let shared = shared(StaticEndpoint::new(), StaticEndpoint::new());
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::from_scan(EventKind::Create, scanned),
				RawEvent::from_scan(EventKind::Delete, snapshot),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert!(batch.deletes().is_empty());
		assert_eq!(
			batch.file_moves()["/b"].node().map(|n| n.path.as_str()),
			Some("/a")
		);
	}

	#[tokio::test]
	async fn rename_by_content_picks_closest_create() {
		let n2 = Node::file("/x/n2", 5, Utc::now()).with_etag("e");
		let n3 = Node::file("/x/n3", 5, Utc::now()).with_etag("e");
		let indexed = Node::file("/x/n1", 5, Utc::now())
			.with_uuid(Uuid::new_v4())
			.with_etag("e");

		let shared = shared(
			StaticEndpoint::new(),
			StaticEndpoint::new().with_node(indexed.clone()),
		);
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::from_scan(EventKind::Create, n2),
				RawEvent::from_scan(EventKind::Create, n3),
				RawEvent::new(EventKind::Delete, "/x/n1"),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert_eq!(sorted_keys(batch.file_moves()), vec!["/x/n2"]);
		assert_eq!(
			batch.file_moves()["/x/n2"].node().map(|n| n.path.as_str()),
			Some("/x/n1")
		);
		assert_eq!(sorted_keys(batch.create_files()), vec!["/x/n3"]);
		assert!(batch.deletes().is_empty());
		assert_disjoint(&batch);
	}

	#[tokio::test]
	async fn create_then_delete_of_phantom_vanishes() {
		let shared = shared(StaticEndpoint::new(), StaticEndpoint::new());
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::new(EventKind::Create, "/p"),
				RawEvent::new(EventKind::Delete, "/p"),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert!(batch.is_empty());
		assert!(batch.refresh_files_uuid().is_empty());
	}

	#[tokio::test]
	async fn create_then_delete_still_on_source_keeps_create() {
		let node = Node::file("/q", 2, Utc::now()).with_etag("e");
		let shared = shared(
			StaticEndpoint::new().with_node(node.clone()),
			StaticEndpoint::new(),
		);
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::from_scan(EventKind::Create, node),
				RawEvent::new(EventKind::Delete, "/q"),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert_eq!(sorted_keys(batch.create_files()), vec!["/q"]);
		assert!(batch.deletes().is_empty());
	}

	#[tokio::test]
	async fn deletes_collapse_into_subtree_root() {
		let now = Utc::now();
		let target = StaticEndpoint::new()
			.with_node(Node::folder("/a", now).with_uuid(Uuid::new_v4()))
			.with_node(Node::folder("/a/b", now).with_uuid(Uuid::new_v4()))
			.with_node(Node::file("/a/b/c", 1, now).with_uuid(Uuid::new_v4()));

		let shared = shared(StaticEndpoint::new(), target);
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::new(EventKind::Delete, "/a"),
				RawEvent::new(EventKind::Delete, "/a/b"),
				RawEvent::new(EventKind::Delete, "/a/b/c"),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert_eq!(sorted_keys(batch.deletes()), vec!["/a"]);
		assert_nodes_resolved(&batch);
	}

	#[tokio::test]
	async fn sibling_with_shared_prefix_is_not_pruned() {
		let now = Utc::now();
		let target = StaticEndpoint::new()
			.with_node(Node::folder("/a", now))
			.with_node(Node::folder("/ab", now));

		let shared = shared(StaticEndpoint::new(), target);
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::new(EventKind::Delete, "/a"),
				RawEvent::new(EventKind::Delete, "/ab"),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert_eq!(sorted_keys(batch.deletes()), vec!["/a", "/ab"]);
	}

	#[tokio::test]
	async fn folder_move_detected_by_identity() {
		let uuid = Uuid::new_v4();
		let now = Utc::now();
		let scanned = Node::folder("/new", now).with_uuid(uuid);
		let indexed = Node::folder("/old", now).with_uuid(uuid);

		let shared = shared(
			StaticEndpoint::new(),
			StaticEndpoint::new().with_node(indexed),
		);
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::from_scan(EventKind::Create, scanned),
				RawEvent::new(EventKind::Delete, "/old").with_folder(),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert!(batch.create_folders().is_empty());
		assert!(batch.deletes().is_empty());
		let moved = &batch.file_moves()["/new"];
		let node = moved.node().expect("move carries a node");
		assert_eq!(node.path, "/old");
		assert_eq!(node.uuid, Some(uuid));
	}

	#[tokio::test]
	async fn ambiguous_folder_identity_leaves_pair_untouched() {
		let uuid = Uuid::new_v4();
		let now = Utc::now();

		let shared = shared(
			StaticEndpoint::new(),
			StaticEndpoint::new().with_node(Node::folder("/old", now).with_uuid(uuid)),
		);
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::from_scan(EventKind::Create, Node::folder("/n1", now).with_uuid(uuid)),
				RawEvent::from_scan(EventKind::Create, Node::folder("/n2", now).with_uuid(uuid)),
				RawEvent::new(EventKind::Delete, "/old").with_folder(),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert!(batch.file_moves().is_empty());
		assert_eq!(sorted_keys(batch.create_folders()), vec!["/n1", "/n2"]);
		assert_eq!(sorted_keys(batch.deletes()), vec!["/old"]);
	}

	#[tokio::test]
	async fn source_probe_failure_discards_create_and_companion_delete() {
		let now = Utc::now();
		let source = StaticEndpoint::new()
			.with_node(Node::file("/ok", 1, now).with_uuid(Uuid::new_v4()))
			.failing_on("/broken");
		let shared = shared(source, StaticEndpoint::new());
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::new(EventKind::Create, "/broken"),
				RawEvent::new(EventKind::Delete, "/broken"),
				RawEvent::new(EventKind::Create, "/ok"),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert_eq!(sorted_keys(batch.create_files()), vec!["/ok"]);
		assert!(batch.deletes().is_empty());
	}

	#[tokio::test]
	async fn missing_identity_schedules_refresh_except_hidden_meta() {
		let now = Utc::now();
		let plain = Node::file("/dir/report", 1, now);
		let meta = Node::file("/dir/.pydio", 1, now);

		let shared = shared(StaticEndpoint::new(), StaticEndpoint::new());
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::from_scan(EventKind::Create, plain),
				RawEvent::from_scan(EventKind::Create, meta),
			],
		);

		filter_batch(&shared, &mut batch).await;

		assert_eq!(sorted_keys(batch.refresh_files_uuid()), vec!["/dir/report"]);
		assert_eq!(
			sorted_keys(batch.create_files()),
			vec!["/dir/.pydio", "/dir/report"]
		);
	}

	#[tokio::test]
	async fn filtering_twice_is_a_fixpoint() {
		let uuid = Uuid::new_v4();
		let now = Utc::now();
		let target = StaticEndpoint::new()
			.with_node(Node::file("/x/n1", 5, now).with_uuid(uuid).with_etag("e"))
			.with_node(Node::folder("/gone", now))
			.with_node(Node::folder("/gone/sub", now));

		let shared = shared(StaticEndpoint::new(), target);
		let mut batch = batch_of(
			&shared,
			vec![
				RawEvent::from_scan(EventKind::Create, Node::file("/x/n2", 5, now).with_etag("e")),
				RawEvent::new(EventKind::Delete, "/x/n1"),
				RawEvent::new(EventKind::Delete, "/gone"),
				RawEvent::new(EventKind::Delete, "/gone/sub"),
			],
		);

		filter_batch(&shared, &mut batch).await;

		let snapshot = |batch: &Batch| {
			(
				sorted_keys(batch.create_files()),
				sorted_keys(batch.create_folders()),
				sorted_keys(batch.deletes()),
				sorted_keys(batch.file_moves()),
				sorted_keys(batch.refresh_files_uuid()),
			)
		};
		let first = snapshot(&batch);

		filter_batch(&shared, &mut batch).await;

		assert_eq!(first, snapshot(&batch));
		assert_eq!(sorted_keys(batch.file_moves()), vec!["/x/n2"]);
		assert_eq!(sorted_keys(batch.deletes()), vec!["/gone"]);
		assert_disjoint(&batch);
		assert_nodes_resolved(&batch);
	}
}
