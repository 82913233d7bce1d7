use std::{path::{Component, Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::{config::MediaConfig, error::StreamError};

#[derive(Debug, Deserialize)]
struct RawRequest {
	event: String,
	#[serde(default)]
	data: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
	Movie,
	Tvshow,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
	#[serde(rename = "type")]
	pub media_type: MediaType,
	#[serde(default)]
	pub start_time: Option<String>,
	pub media_path: String,
	pub channel_id: String,
	pub guild_id: String,
}

impl StartRequest {
	/// Resolve the requested file inside the movies or series root.
	pub fn resolve_path(&self, media: &MediaConfig) -> Result<PathBuf, StreamError> {
		let relative = Path::new(&self.media_path);
		if !relative.components().all(|component| matches!(component, Component::Normal(_))) {
			return Err(StreamError::Validation(format!("media path must be relative: {}", self.media_path)));
		}

		let root = match self.media_type {
			MediaType::Movie => &media.movies,
			MediaType::Tvshow => &media.series,
		};

		Ok(MediaConfig::expand(root).join(relative))
	}

	pub fn start_time(&self) -> Result<Duration, StreamError> {
		match &self.start_time {
			Some(start_time) => parse_timestamp(start_time),
			None => Ok(Duration::ZERO),
		}
	}
}

/// A message received on the control channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
	/// Join the channel, stream the file and stop when it's done.
	Start(Result<StartRequest, String>),
	Stop,
	Pause,
	Resume,
	/// Stop, wait a moment, then start again.
	Restart(Result<StartRequest, String>),
	Leave,
}

impl Request {
	/// Parse a request. The payload of start and restart is validated separately, so a bad
	/// payload can be acknowledged per event.
	pub fn parse(text: &str) -> Result<Self, StreamError> {
		let request: RawRequest = serde_json::from_str(text)
			.map_err(|e| StreamError::Validation(format!("malformed request: {e}")))?;

		let start = |data: Value| serde_json::from_value::<StartRequest>(data).map_err(|e| e.to_string());

		match request.event.as_str() {
			"start" => Ok(Request::Start(start(request.data))),
			"stop" => Ok(Request::Stop),
			"pause" => Ok(Request::Pause),
			"resume" => Ok(Request::Resume),
			"restart" => Ok(Request::Restart(start(request.data))),
			"leave" => Ok(Request::Leave),
			event => Err(StreamError::Validation(format!("unknown event '{event}'"))),
		}
	}
}

/// Acknowledgement sent back to the control client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ack {
	pub event: String,
	pub succeeded: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<String>,
}

impl Ack {
	pub fn new(event: &str, succeeded: bool) -> Self {
		Self { event: event.to_string(), succeeded, data: None }
	}

	pub fn with_data(event: &str, succeeded: bool, data: impl Into<String>) -> Self {
		Self { event: event.to_string(), succeeded, data: Some(data.into()) }
	}

	pub fn invalid_message() -> Self {
		Self::with_data("payload_error", false, "invalid_message")
	}

	pub fn progress(position: Duration) -> Self {
		Self::with_data("progress", true, position.as_millis().to_string())
	}
}

/// Parse `h:m:s`, `m:s` or `s`, every part may be fractional.
pub fn parse_timestamp(timestamp: &str) -> Result<Duration, StreamError> {
	let invalid = || StreamError::Validation(format!("invalid timestamp '{timestamp}'"));

	let parts: Vec<&str> = timestamp.trim().split(':').collect();
	if parts.len() > 3 {
		return Err(invalid());
	}

	let mut seconds = 0.0;
	for (part, multiplier) in parts.iter().rev().zip([1.0, 60.0, 3600.0]) {
		let value: f64 = part.trim().parse().map_err(|_| invalid())?;
		if !value.is_finite() || value < 0.0 {
			return Err(invalid());
		}
		seconds += value * multiplier;
	}

	Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

/// Lets through at most one progress report per interval.
pub struct ProgressLimiter {
	interval: Duration,
	last: Option<Instant>,
}

impl ProgressLimiter {
	pub fn new(interval: Duration) -> Self {
		Self { interval, last: None }
	}

	pub fn should_send(&mut self) -> bool {
		let now = Instant::now();
		match self.last {
			Some(last) if now.duration_since(last) < self.interval => false,
			_ => {
				self.last = Some(now);
				true
			},
		}
	}
}
