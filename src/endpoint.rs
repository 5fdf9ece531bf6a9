use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{error::EndpointError, node::Node};

/// Probe capability of a sync endpoint (source or target).
///
/// This is everything the batcher knows about either side of the sync: it
/// can ask an endpoint what lives at a path, and nothing else. Applying
/// mutations is the business of the downstream applier.
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
	/// Looks up the entry at `path`.
	///
	/// `Ok(None)` means the entry does not exist; it is never an error.
	/// `leaf_hint` tells endpoints that cannot autodetect whether the
	/// caller expects a file (`Some(true)`) or a folder (`Some(false)`);
	/// `None` means autodetect.
	async fn load_node(
		&self,
		ctx: &CancellationToken,
		path: &str,
		leaf_hint: Option<bool>,
	) -> Result<Option<Node>, EndpointError>;
}
