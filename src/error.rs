use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
	/// The remote side sent something we can't make sense of.
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("transport error: {0}")]
	Transport(#[from] std::io::Error),

	/// The transcoder failed to start or exited unexpectedly.
	#[error("upstream media error: {0}")]
	UpstreamMedia(String),

	#[error("invalid request: {0}")]
	Validation(String),

	/// A packet was about to be sent without an encryption key or ssrc.
	#[error("no encryption key or ssrc available for sending")]
	MissingKeys,

	#[error("not ready: {0}")]
	NotReady(&'static str),

	#[error("{0} is closed")]
	Closed(&'static str),
}
