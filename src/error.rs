use thiserror::Error;
use tokio::{io, sync::mpsc};

/// Failure of an endpoint probe.
///
/// A probe that finds nothing at the requested path is *not* an error; it
/// reports `Ok(None)` instead.
#[derive(Error, Debug)]
pub enum EndpointError {
	#[error("probe was cancelled before completion")]
	Cancelled,
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
	#[error("endpoint failure: {0}")]
	Endpoint(String),
}

#[derive(Error, Debug)]
pub enum BatcherError {
	#[error("Unable to send session close signal to batcher loop: (error: {0})")]
	SessionCloseSend(#[from] mpsc::error::SendError<String>),
}
