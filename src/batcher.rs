//! The events batcher: groups raw change events into producer-declared
//! sessions or time-sliced windows, runs each flushed batch through the
//! filter on its own task, and hands the result to the downstream applier.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, PoisonError, RwLock,
	},
	time::Duration,
};

use tokio::{
	runtime::Handle,
	select,
	sync::mpsc,
	task::{block_in_place, JoinHandle},
	time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
	batch::Batch,
	config::BatcherConfig,
	endpoint::SyncEndpoint,
	error::BatcherError,
	event::{RawEvent, SESSION_CLOSE_PREFIX},
	filter,
};

/// Lifecycle notification delivered to registered observers around each
/// filtering run. Observers receive the batch behind an [`Arc`] and must
/// not assume it is still being worked on: the `FilterStart` snapshot is
/// the raw aggregation, the `FilterEnd` snapshot the applier-ready result.
#[derive(Debug, Clone)]
pub enum BatcherNotification {
	FilterStart(Arc<Batch>),
	FilterEnd(Arc<Batch>),
}

impl BatcherNotification {
	/// Reserved discriminant literal, stable across releases.
	pub fn kind(&self) -> &'static str {
		match self {
			Self::FilterStart(_) => "filter:start",
			Self::FilterEnd(_) => "filter:end",
		}
	}

	pub fn batch(&self) -> &Arc<Batch> {
		match self {
			Self::FilterStart(batch) | Self::FilterEnd(batch) => batch,
		}
	}
}

struct SessionBuffer {
	events: Vec<RawEvent>,
	last_event: Instant,
}

impl SessionBuffer {
	fn new() -> Self {
		Self {
			events: Vec::new(),
			last_event: Instant::now(),
		}
	}
}

/// State shared between the selector loop, the spawned filter tasks and
/// the [`EventsBatcher`] handle.
pub(crate) struct Shared {
	pub(crate) source: Arc<dyn SyncEndpoint>,
	pub(crate) target: Arc<dyn SyncEndpoint>,
	pub(crate) context: CancellationToken,
	notifiers: RwLock<Vec<mpsc::Sender<BatcherNotification>>>,
	sessions: Mutex<HashMap<String, SessionBuffer>>,
	ignored_events: AtomicU64,
}

impl Shared {
	pub(crate) fn new(
		source: Arc<dyn SyncEndpoint>,
		target: Arc<dyn SyncEndpoint>,
		context: CancellationToken,
	) -> Self {
		Self {
			source,
			target,
			context,
			notifiers: RwLock::new(Vec::new()),
			sessions: Mutex::new(HashMap::new()),
			ignored_events: AtomicU64::new(0),
		}
	}

	/// Delivers a notification to every registered observer, in
	/// registration order, awaiting each send. A slow observer therefore
	/// stalls the filter task it is observing, never the selector loop.
	pub(crate) async fn notify(&self, notification: BatcherNotification) {
		let channels = self
			.notifiers
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();
		for channel in channels {
			if channel.send(notification.clone()).await.is_err() {
				warn!(kind = notification.kind(), "notification observer went away");
			}
		}
	}
}

/// Aggregates a stream of raw change events into [`Batch`]es.
///
/// Events tagged with a session buffer under that session until the
/// producer closes it (inline `close-` tag or [`force_close_session`]);
/// free events buffer anonymously and flush when the quiescence window
/// elapses. Every flush is filtered on its own task before being sent to
/// the output channel, so a slow probe or applier never blocks ingestion.
///
/// [`force_close_session`]: EventsBatcher::force_close_session
pub struct EventsBatcher {
	shared: Arc<Shared>,
	config: BatcherConfig,
	close_session_tx: mpsc::Sender<String>,
	close_session_rx: Option<mpsc::Receiver<String>>,
	handle: Option<JoinHandle<()>>,
}

impl EventsBatcher {
	/// Creates a batcher probing `source` and `target`. `context` is the
	/// parent of every operation context the batcher derives; cancelling
	/// it cancels in-flight probes and stops the selector loop.
	pub fn new(
		source: Arc<dyn SyncEndpoint>,
		target: Arc<dyn SyncEndpoint>,
		context: CancellationToken,
		config: BatcherConfig,
	) -> Self {
		let (close_session_tx, close_session_rx) = mpsc::channel(1);
		Self {
			shared: Arc::new(Shared::new(source, target, context.child_token())),
			config,
			close_session_tx,
			close_session_rx: Some(close_session_rx),
			handle: None,
		}
	}

	/// Registers an observer for `filter:start` / `filter:end`
	/// notifications. Delivery blocks on the observer's channel, so
	/// observers must consume promptly.
	pub fn register_notification_channel(&self, channel: mpsc::Sender<BatcherNotification>) {
		self.shared
			.notifiers
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(channel);
	}

	/// Spawns the selector loop consuming `input` and producing filtered
	/// batches on `output`. The loop exits when the input stream closes or
	/// the parent context is cancelled.
	pub fn start(&mut self, input: mpsc::Receiver<RawEvent>, output: mpsc::Sender<Batch>) {
		let Some(close_session_rx) = self.close_session_rx.take() else {
			warn!("events batcher already started, ignoring");
			return;
		};
		self.handle = Some(tokio::spawn(Self::run(
			self.shared.clone(),
			self.config.clone(),
			input,
			output,
			close_session_rx,
		)));
	}

	/// Flushes and removes the named session buffer, if present. Sessions
	/// normally close inline through a `close-` tagged event; this is the
	/// out-of-band path for producers that lost track of one.
	pub async fn force_close_session(&self, session: impl Into<String>) -> Result<(), BatcherError> {
		self.close_session_tx
			.send(session.into())
			.await
			.map_err(Into::into)
	}

	/// Events dropped because they carried an operation id but no session
	/// tag. Such events are the producer's responsibility to pair with a
	/// later session close; the count is exposed for observability.
	pub fn ignored_events(&self) -> u64 {
		self.shared.ignored_events.load(Ordering::Relaxed)
	}

	/// Runs the filtering pipeline over an externally held batch. The
	/// selector loop does this on its own for every flush; re-running it
	/// on an already filtered batch is a fixpoint.
	pub async fn filter_batch(&self, batch: &mut Batch) {
		filter::filter_batch(&self.shared, batch).await;
	}

	/// Cancels the selector loop and waits for it to exit.
	pub async fn shutdown(&mut self) {
		self.shared.context.cancel();
		if let Some(handle) = self.handle.take() {
			if let Err(e) = handle.await {
				error!("Failed to join batcher loop: {e:#?}");
			}
		}
	}

	async fn run(
		shared: Arc<Shared>,
		config: BatcherConfig,
		mut input: mpsc::Receiver<RawEvent>,
		output: mpsc::Sender<Batch>,
		mut close_session_rx: mpsc::Receiver<String>,
	) {
		// Anonymous buffer; owned by the loop, no lock needed.
		let mut pending: Vec<RawEvent> = Vec::new();

		// Restartable deadline: the window counts from the previous fire,
		// not from the latest event, so a steady trickle of events still
		// flushes at least once per window.
		let timer = time::sleep(config.quiescence_window);
		tokio::pin!(timer);

		loop {
			select! {
				maybe_event = input.recv() => {
					match maybe_event {
						Some(event) => Self::ingest(&shared, &output, &mut pending, event),
						None => {
							debug!("event stream closed, winding down batcher loop");
							if !pending.is_empty() {
								Self::dispatch(shared.clone(), std::mem::take(&mut pending), output.clone(), false);
							}
							break;
						}
					}
				}

				Some(session) = close_session_rx.recv() => {
					let drained = shared
						.sessions
						.lock()
						.unwrap_or_else(PoisonError::into_inner)
						.remove(&session);
					if let Some(buffer) = drained {
						debug!(session = %session, count = buffer.events.len(), "force closing session");
						Self::dispatch(shared.clone(), buffer.events, output.clone(), true);
					}
				}

				() = &mut timer => {
					if !pending.is_empty() {
						debug!(count = pending.len(), "flushing anonymous buffer after quiescence window");
						Self::dispatch(shared.clone(), std::mem::take(&mut pending), output.clone(), false);
					}
					if let Some(idle) = config.session_idle_timeout {
						Self::sweep_idle_sessions(&shared, &output, idle);
					}
					timer.as_mut().reset(Instant::now() + config.quiescence_window);
				}

				() = shared.context.cancelled() => {
					debug!("context cancelled, stopping batcher loop");
					break;
				}
			}
		}
	}

	/// Classifies one incoming event: session events buffer under their
	/// tag (a `close-` prefixed tag flushes the session inline), free
	/// events buffer anonymously, operation-bound events without a session
	/// are dropped and counted.
	fn ingest(
		shared: &Arc<Shared>,
		output: &mpsc::Sender<Batch>,
		pending: &mut Vec<RawEvent>,
		event: RawEvent,
	) {
		if event.path.is_empty() {
			trace!("dropping event without a path");
			return;
		}

		let session_tag = event.session_tag().map(str::to_string);
		if let Some(tag) = session_tag {
			if let Some(session) = tag.strip_prefix(SESSION_CLOSE_PREFIX) {
				let events = {
					let mut sessions = shared
						.sessions
						.lock()
						.unwrap_or_else(PoisonError::into_inner);
					let mut events = sessions
						.remove(session)
						.map(|buffer| buffer.events)
						.unwrap_or_default();
					events.push(event);
					events
				};
				debug!(session = %session, count = events.len(), "session closed inline, dispatching");
				Self::dispatch(shared.clone(), events, output.clone(), true);
			} else {
				trace!(session = %tag, path = %event.path, "buffering event in session");
				let mut sessions = shared
					.sessions
					.lock()
					.unwrap_or_else(PoisonError::into_inner);
				let buffer = sessions.entry(tag).or_insert_with(SessionBuffer::new);
				buffer.events.push(event);
				buffer.last_event = Instant::now();
			}
		} else if event.scan_event || event.operation_id.is_empty() {
			trace!(path = %event.path, "buffering free event");
			pending.push(event);
		} else {
			trace!(
				operation_id = %event.operation_id,
				path = %event.path,
				"dropping operation-bound event without session"
			);
			shared.ignored_events.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Sessions are normally closed by their producer; when an idle
	/// timeout is configured, buffers that stopped receiving events are
	/// flushed as if their session had been force-closed.
	fn sweep_idle_sessions(shared: &Arc<Shared>, output: &mpsc::Sender<Batch>, idle: Duration) {
		let expired: Vec<(String, Vec<RawEvent>)> = {
			let mut sessions = shared
				.sessions
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			let tags: Vec<String> = sessions
				.iter()
				.filter(|(_, buffer)| buffer.last_event.elapsed() >= idle)
				.map(|(tag, _)| tag.clone())
				.collect();
			tags.into_iter()
				.filter_map(|tag| {
					sessions
						.remove(&tag)
						.map(|buffer| (tag, buffer.events))
				})
				.collect()
		};

		for (tag, events) in expired {
			warn!(session = %tag, count = events.len(), "session idle past timeout, force flushing");
			Self::dispatch(shared.clone(), events, output.clone(), true);
		}
	}

	/// Hands one flush worth of events to a fresh task: populate a batch,
	/// filter it, send it downstream. Sending blocks until the applier
	/// accepts; only batch delivery is serialized on the output channel,
	/// ingestion keeps going.
	fn dispatch(
		shared: Arc<Shared>,
		events: Vec<RawEvent>,
		output: mpsc::Sender<Batch>,
		as_session: bool,
	) {
		tokio::spawn(async move {
			Self::process_events(shared, events, output, as_session).await;
		});
	}

	async fn process_events(
		shared: Arc<Shared>,
		events: Vec<RawEvent>,
		output: mpsc::Sender<Batch>,
		as_session: bool,
	) {
		debug!(count = events.len(), as_session, "processing events");

		let mut batch = Batch::new();
		batch.as_session = as_session;
		for event in events {
			trace!(kind = ?event.kind, path = %event.path, "batching event");
			batch.push(event, shared.source.clone(), shared.target.clone());
		}

		filter::filter_batch(&shared, &mut batch).await;

		if output.send(batch).await.is_err() {
			error!("Batch output channel closed, dropping filtered batch");
		}
	}
}

impl Drop for EventsBatcher {
	fn drop(&mut self) {
		// Stops the loop and in-flight probes; filter tasks already
		// dispatched run to completion.
		self.shared.context.cancel();

		// FIXME: change this Drop to async drop in the future
		if let Some(handle) = self.handle.take() {
			if let Err(e) =
				block_in_place(move || Handle::current().block_on(async move { handle.await }))
			{
				error!("Failed to join batcher loop: {e:#?}");
			}
		}
	}
}
