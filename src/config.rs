use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// Token used to authenticate with the gateway.
	pub token: String,

	/// Address to bind the control channel to.
	pub address: String,

	/// Configuration for the control channel.
	#[serde(default)]
	pub control: ControlConfig,

	/// Configuration for the outgoing stream.
	#[serde(default)]
	pub stream: StreamConfig,

	/// Where to find media files.
	#[serde(default)]
	pub media: MediaConfig,

	/// Configuration for the transcoder process.
	#[serde(default)]
	pub transcoder: TranscoderConfig,

	/// Configuration for the voice and stream connections.
	#[serde(default)]
	pub connection: ConnectionConfig,

	/// Configuration for the gateway connection.
	#[serde(default)]
	pub gateway: GatewayConfig,
}

impl Config {
	#[allow(clippy::result_unit_err)]
	pub fn read_from_file<P: AsRef<Path>>(file: P) -> Result<Config, ()> {
		let config = std::fs::read_to_string(file)
			.map_err(|e| tracing::error!("Failed to open configuration file: {e}"))?;
		let config: Config = toml::from_str(&config)
			.map_err(|e| tracing::error!("Failed to parse configuration file: {e}"))?;

		Ok(config)
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			token: String::new(),
			address: "0.0.0.0".to_string(),
			control: Default::default(),
			stream: Default::default(),
			media: Default::default(),
			transcoder: Default::default(),
			connection: Default::default(),
			gateway: Default::default(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlConfig {
	/// Port of the control channel websocket server.
	pub port: u16,

	/// Minimum time in milliseconds between two progress messages.
	pub progress_interval_ms: u64,
}

impl Default for ControlConfig {
	fn default() -> Self {
		Self {
			port: 3000,
			progress_interval_ms: 10_000,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
	/// Width of the outgoing video.
	pub width: u32,

	/// Height of the outgoing video.
	pub height: u32,

	/// Framerate of the outgoing video.
	pub fps: u32,

	/// Maximum bitrate of the outgoing video in kbps.
	pub max_bitrate_kbps: u32,

	/// Whether to stream the audio track too.
	pub include_audio: bool,

	/// Let the transcoder use hardware decoding when available.
	pub hardware_acceleration: bool,

	/// If set, the oldest frames are dropped when more than this many frames are waiting to be sent.
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub max_queued_frames: Option<usize>,
}

impl Default for StreamConfig {
	fn default() -> Self {
		Self {
			width: 1920,
			height: 1080,
			fps: 30,
			max_bitrate_kbps: 5000,
			include_audio: true,
			hardware_acceleration: false,
			max_queued_frames: None,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaConfig {
	/// Directory containing movies.
	pub movies: PathBuf,

	/// Directory containing TV shows.
	pub series: PathBuf,
}

impl MediaConfig {
	/// Expand `~` and environment variables in a media root.
	pub fn expand(root: &Path) -> PathBuf {
		let root = root.to_string_lossy();
		match shellexpand::full(&root) {
			Ok(expanded) => PathBuf::from(expanded.as_ref()),
			Err(e) => {
				tracing::warn!("Failed to expand media path '{root}': {e}");
				PathBuf::from(root.as_ref())
			},
		}
	}
}

impl Default for MediaConfig {
	fn default() -> Self {
		Self {
			movies: "$HOME/Videos/Movies".into(),
			series: "$HOME/Videos/Series".into(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscoderConfig {
	/// Path to the ffmpeg binary.
	pub ffmpeg: String,

	/// Extra arguments passed to ffmpeg before the input, split like a shell would.
	#[serde(default)]
	pub extra_input_args: String,
}

impl Default for TranscoderConfig {
	fn default() -> Self {
		Self {
			ffmpeg: "ffmpeg".to_string(),
			extra_input_args: String::new(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Time in milliseconds to wait for the IP discovery reply.
	pub discovery_timeout_ms: u64,

	/// Time in milliseconds to wait for a websocket connection to open.
	pub connect_timeout_ms: u64,

	/// Number of consecutive reconnect attempts before a connection is abandoned.
	pub reconnect_attempts: u32,

	/// Delay in milliseconds before the first reconnect attempt, doubled after every failed attempt.
	pub reconnect_backoff_ms: u64,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			discovery_timeout_ms: 2000,
			connect_timeout_ms: 10_000,
			reconnect_attempts: 5,
			reconnect_backoff_ms: 500,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
	/// Websocket URL of the gateway.
	pub url: String,

	/// Gateway intents to identify with.
	pub intents: u64,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			url: "wss://gateway.discord.gg/?v=9&encoding=json".to_string(),
			// GUILDS | GUILD_VOICE_STATES
			intents: 1 | 1 << 7,
		}
	}
}
