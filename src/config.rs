use std::time::Duration;

/// Tuning knobs for an [`EventsBatcher`](crate::EventsBatcher).
#[derive(Debug, Clone)]
pub struct BatcherConfig {
	/// Maximum wall-clock interval between flushes of the anonymous
	/// buffer while events are flowing. The deadline restarts when the
	/// timer fires, so a steady trickle of events cannot postpone a flush
	/// forever.
	pub quiescence_window: Duration,

	/// When set, session buffers that have received no event for at least
	/// this long are force-flushed on the next quiescence tick, so a
	/// producer that never closes its session cannot leak events forever.
	/// When unset, sessions live until explicitly closed.
	pub session_idle_timeout: Option<Duration>,
}

impl Default for BatcherConfig {
	fn default() -> Self {
		Self {
			quiescence_window: Duration::from_secs(1),
			session_idle_timeout: None,
		}
	}
}
