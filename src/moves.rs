//! Move detection helpers: pairing deletes with creates that refer to the
//! same underlying node, and ranking ambiguous pairings by path proximity.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{batch::Batch, endpoint::SyncEndpoint, node::Node};

/// A candidate (delete, create) pairing produced by the content-match
/// pass, awaiting closest-move arbitration.
#[derive(Debug, Clone)]
pub(crate) struct Move {
	pub(crate) delete_key: String,
	pub(crate) create_key: String,
	pub(crate) db_node: Node,
}

/// Final path segment.
pub(crate) fn base_name(path: &str) -> &str {
	path.rsplit('/').next().unwrap_or(path)
}

/// Everything before the final path segment.
pub(crate) fn dir_name(path: &str) -> &str {
	match path.rfind('/') {
		Some(idx) => &path[..idx],
		None => "",
	}
}

pub(crate) fn depth(path: &str) -> usize {
	path.split('/').filter(|segment| !segment.is_empty()).count()
}

/// Whether `parent` strictly contains `child`. Guarded on the separator so
/// that `/a` does not claim `/ab`.
pub(crate) fn is_strict_ancestor(parent: &str, child: &str) -> bool {
	child.len() > parent.len()
		&& child.starts_with(parent)
		&& child.as_bytes()[parent.len()] == b'/'
}

/// Orders move candidates from most to least plausible: a pair sharing its
/// parent directory beats one that does not, then smaller basename edit
/// distance wins, then smaller depth delta, with the (delete, create) path
/// pair as the final lexicographic tie-break.
pub(crate) fn sort_closest_moves(candidates: &mut [Move]) {
	fn rank(candidate: &Move) -> (bool, usize, usize, &str, &str) {
		(
			dir_name(&candidate.delete_key) != dir_name(&candidate.create_key),
			strsim::levenshtein(
				base_name(&candidate.delete_key),
				base_name(&candidate.create_key),
			),
			depth(&candidate.delete_key).abs_diff(depth(&candidate.create_key)),
			candidate.delete_key.as_str(),
			candidate.create_key.as_str(),
		)
	}

	candidates.sort_by(|a, b| rank(a).cmp(&rank(b)));
}

/// Reclassifies a (delete, create-file) pair as a single move keyed by the
/// destination path. The entry keeps the target-side node so the move
/// preserves the pre-existing identity, and no longer needs an
/// identity-assigning refresh.
pub(crate) fn promote_file_move(batch: &mut Batch, delete_key: &str, create_key: &str, db_node: Node) {
	if let Some(mut create) = batch.create_files.remove(create_key) {
		create.node = Some(db_node);
		batch.refresh_files_uuid.remove(create_key);
		batch.file_moves.insert(create_key.to_string(), create);
		batch.deletes.remove(delete_key);
	}
}

/// Same bookkeeping for a (delete, create-folder) pair.
pub(crate) fn promote_folder_move(
	batch: &mut Batch,
	delete_key: &str,
	create_key: &str,
	db_node: Node,
) {
	if let Some(mut create) = batch.create_folders.remove(create_key) {
		create.node = Some(db_node);
		batch.file_moves.insert(create_key.to_string(), create);
		batch.deletes.remove(delete_key);
	}
}

/// Reassigns create-folder/delete pairs that refer to the same target-side
/// folder into explicit moves.
///
/// Every delete entry is resolved against the target here (probing only
/// when the event carries no snapshot node) and the resolved node is
/// attached, so the later file pass reuses it instead of probing again. A
/// non-leaf resolved node is then matched against the create-folder
/// entries by stable identity; only a unique match commits a move, an
/// ambiguous one leaves both sides for the file passes to treat as
/// unrelated create and delete.
pub(crate) async fn detect_folder_moves(
	batch: &mut Batch,
	target: &Arc<dyn SyncEndpoint>,
	context: &CancellationToken,
) {
	let delete_keys: Vec<String> = batch.deletes.keys().cloned().collect();

	for key in delete_keys {
		let (attached, ctx) = match batch.deletes.get(&key) {
			Some(entry) => (entry.node.clone(), entry.event.operation_token(context)),
			None => continue,
		};

		let db_node = match attached {
			Some(node) => Some(node),
			None => match target.load_node(&ctx, &key, None).await {
				Ok(node) => node,
				Err(e) => {
					debug!(path = %key, "target probe failed while resolving delete: {e}");
					None
				}
			},
		};

		// Unresolved deletes are the business of the file pass.
		let Some(db_node) = db_node else { continue };

		if let Some(entry) = batch.deletes.get_mut(&key) {
			entry.node = Some(db_node.clone());
		}

		if db_node.is_leaf() {
			continue;
		}
		let Some(uuid) = db_node.uuid else { continue };

		let mut matches = batch
			.create_folders
			.iter()
			.filter(|(_, create)| {
				create
					.node
					.as_ref()
					.and_then(|node| node.uuid)
					.is_some_and(|candidate| candidate == uuid)
			})
			.map(|(create_key, _)| create_key.clone());

		let create_key = match (matches.next(), matches.next()) {
			(Some(create_key), None) => create_key,
			(Some(first), Some(_)) => {
				trace!(
					from = %key,
					candidate = %first,
					"several folder creates share the deleted folder's identity, leaving pair untouched"
				);
				continue;
			}
			_ => continue,
		};
		drop(matches);

		debug!(from = %key, to = %create_key, "folder with matching identity, safe move");
		promote_folder_move(batch, &key, &create_key, db_node);
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;

	use super::*;

	#[test]
	fn strict_ancestor_requires_separator() {
		assert!(is_strict_ancestor("/a", "/a/b"));
		assert!(is_strict_ancestor("/a", "/a/b/c"));
		assert!(!is_strict_ancestor("/a", "/ab"));
		assert!(!is_strict_ancestor("/a", "/a"));
		assert!(!is_strict_ancestor("/a/b", "/a"));
	}

	#[test]
	fn path_helpers() {
		assert_eq!(base_name("/x/n1"), "n1");
		assert_eq!(dir_name("/x/n1"), "/x");
		assert_eq!(dir_name("n1"), "");
		assert_eq!(depth("/a/b/c"), 3);
		assert_eq!(depth("/a"), 1);
	}

	fn candidate(delete: &str, create: &str) -> Move {
		Move {
			delete_key: delete.to_string(),
			create_key: create.to_string(),
			db_node: Node::file(delete, 0, Utc::now()),
		}
	}

	#[test]
	fn same_parent_beats_smaller_edit_distance() {
		let mut candidates = vec![
			candidate("/x/n1", "/y/n1"),
			candidate("/x/n1", "/x/other"),
		];
		sort_closest_moves(&mut candidates);
		assert_eq!(candidates[0].create_key, "/x/other");
	}

	#[test]
	fn edit_distance_orders_within_same_parent() {
		let mut candidates = vec![
			candidate("/x/report-final", "/x/draft"),
			candidate("/x/report-final", "/x/report-final2"),
		];
		sort_closest_moves(&mut candidates);
		assert_eq!(candidates[0].create_key, "/x/report-final2");
	}

	#[test]
	fn depth_delta_breaks_distance_ties() {
		let mut candidates = vec![
			candidate("/x/n1", "/q/w/e/n2"),
			candidate("/x/n1", "/q/w/n3"),
		];
		sort_closest_moves(&mut candidates);
		assert_eq!(candidates[0].create_key, "/q/w/n3");
	}

	#[test]
	fn lexicographic_pair_is_final_tie_break() {
		let mut candidates = vec![
			candidate("/x/n1", "/x/n3"),
			candidate("/x/n1", "/x/n2"),
		];
		sort_closest_moves(&mut candidates);
		assert_eq!(candidates[0].create_key, "/x/n2");
		assert_eq!(candidates[1].create_key, "/x/n3");
	}
}
