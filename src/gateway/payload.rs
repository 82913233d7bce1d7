use std::{fmt, str::FromStr};

use serde::Deserialize;
use serde_json::{json, Value};

pub const DISPATCH: u8 = 0;
pub const HEARTBEAT: u8 = 1;
pub const IDENTIFY: u8 = 2;
pub const VOICE_STATE_UPDATE: u8 = 4;
pub const RECONNECT: u8 = 7;
pub const INVALID_SESSION: u8 = 9;
pub const HELLO: u8 = 10;
pub const HEARTBEAT_ACK: u8 = 11;
pub const STREAM_CREATE: u8 = 18;
pub const STREAM_DELETE: u8 = 19;
pub const STREAM_SET_PAUSED: u8 = 22;

#[derive(Debug, Deserialize)]
pub struct GatewayMessage {
	pub op: u8,
	#[serde(default)]
	pub d: Value,
	#[serde(default)]
	pub s: Option<u64>,
	#[serde(default)]
	pub t: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Hello {
	pub heartbeat_interval: u64,
}

/// Identifies a screen share: `guild:{guild_id}:{channel_id}:{user_id}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamKey {
	pub guild_id: String,
	pub channel_id: String,
	pub user_id: String,
}

impl fmt::Display for StreamKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "guild:{}:{}:{}", self.guild_id, self.channel_id, self.user_id)
	}
}

impl FromStr for StreamKey {
	type Err = ();

	fn from_str(key: &str) -> Result<Self, Self::Err> {
		let mut parts = key.split(':');
		match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
			(Some("guild"), Some(guild_id), Some(channel_id), Some(user_id), None) => Ok(Self {
				guild_id: guild_id.to_string(),
				channel_id: channel_id.to_string(),
				user_id: user_id.to_string(),
			}),
			_ => Err(()),
		}
	}
}

/// Dispatch events the streamer cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayEvent {
	Ready { user_id: String },
	VoiceStateUpdate { user_id: String, session_id: String },
	VoiceServerUpdate { guild_id: String, endpoint: String, token: String },
	StreamCreate { stream_key: StreamKey, rtc_server_id: String },
	StreamServerUpdate { stream_key: StreamKey, endpoint: String, token: String },
}

#[derive(Deserialize)]
struct User {
	id: String,
}

#[derive(Deserialize)]
struct ReadyData {
	user: User,
}

#[derive(Deserialize)]
struct VoiceStateData {
	user_id: String,
	session_id: String,
}

#[derive(Deserialize)]
struct ServerUpdateData {
	#[serde(default)]
	guild_id: Option<String>,
	#[serde(default)]
	stream_key: Option<String>,
	endpoint: Option<String>,
	token: String,
}

#[derive(Deserialize)]
struct StreamCreateData {
	stream_key: String,
	rtc_server_id: String,
}

impl GatewayEvent {
	/// Parse a dispatch event, returns `None` for events we don't handle.
	pub fn parse(name: &str, data: Value) -> Result<Option<Self>, serde_json::Error> {
		let event = match name {
			"READY" => {
				let ready: ReadyData = serde_json::from_value(data)?;
				Some(Self::Ready { user_id: ready.user.id })
			},
			"VOICE_STATE_UPDATE" => {
				let state: VoiceStateData = serde_json::from_value(data)?;
				Some(Self::VoiceStateUpdate { user_id: state.user_id, session_id: state.session_id })
			},
			"VOICE_SERVER_UPDATE" => {
				let update: ServerUpdateData = serde_json::from_value(data)?;
				match (update.guild_id, update.endpoint) {
					(Some(guild_id), Some(endpoint)) => Some(Self::VoiceServerUpdate { guild_id, endpoint, token: update.token }),
					_ => {
						tracing::debug!("Ignoring voice server update without guild or endpoint.");
						None
					},
				}
			},
			"STREAM_CREATE" => {
				let create: StreamCreateData = serde_json::from_value(data)?;
				match create.stream_key.parse() {
					Ok(stream_key) => Some(Self::StreamCreate { stream_key, rtc_server_id: create.rtc_server_id }),
					Err(()) => {
						tracing::debug!("Ignoring stream create for unsupported stream key {}.", create.stream_key);
						None
					},
				}
			},
			"STREAM_SERVER_UPDATE" => {
				let update: ServerUpdateData = serde_json::from_value(data)?;
				let stream_key = update.stream_key.as_deref().and_then(|key| key.parse().ok());
				match (stream_key, update.endpoint) {
					(Some(stream_key), Some(endpoint)) => Some(Self::StreamServerUpdate { stream_key, endpoint, token: update.token }),
					_ => {
						tracing::debug!("Ignoring stream server update without stream key or endpoint.");
						None
					},
				}
			},
			_ => None,
		};

		Ok(event)
	}
}

/// Requests the streamer sends over the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayCommand {
	/// Join a voice channel, or leave when both ids are `None`.
	VoiceStateUpdate {
		guild_id: Option<String>,
		channel_id: Option<String>,
		self_mute: bool,
		self_deaf: bool,
	},
	StreamCreate { guild_id: String, channel_id: String },
	StreamSetPaused { stream_key: StreamKey, paused: bool },
	StreamDelete { stream_key: StreamKey },
}

impl GatewayCommand {
	pub fn to_json(&self) -> Value {
		match self {
			GatewayCommand::VoiceStateUpdate { guild_id, channel_id, self_mute, self_deaf } => json!({
				"op": VOICE_STATE_UPDATE,
				"d": {
					"guild_id": guild_id,
					"channel_id": channel_id,
					"self_mute": self_mute,
					"self_deaf": self_deaf,
					"self_video": false,
				},
			}),
			GatewayCommand::StreamCreate { guild_id, channel_id } => json!({
				"op": STREAM_CREATE,
				"d": {
					"type": "guild",
					"guild_id": guild_id,
					"channel_id": channel_id,
					"preferred_region": null,
				},
			}),
			GatewayCommand::StreamSetPaused { stream_key, paused } => json!({
				"op": STREAM_SET_PAUSED,
				"d": {
					"stream_key": stream_key.to_string(),
					"paused": paused,
				},
			}),
			GatewayCommand::StreamDelete { stream_key } => json!({
				"op": STREAM_DELETE,
				"d": {
					"stream_key": stream_key.to_string(),
				},
			}),
		}
	}
}

pub fn identify(token: &str, intents: u64) -> Value {
	json!({
		"op": IDENTIFY,
		"d": {
			"token": token,
			"intents": intents,
			"properties": {
				"os": std::env::consts::OS,
				"browser": env!("CARGO_PKG_NAME"),
				"device": env!("CARGO_PKG_NAME"),
			},
		},
	})
}

pub fn heartbeat(sequence: Option<u64>) -> Value {
	json!({ "op": HEARTBEAT, "d": sequence })
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key() -> StreamKey {
		StreamKey { guild_id: "1".to_string(), channel_id: "2".to_string(), user_id: "3".to_string() }
	}

	#[test]
	fn stream_key() {
		assert_eq!(key().to_string(), "guild:1:2:3");
		assert_eq!("guild:1:2:3".parse::<StreamKey>(), Ok(key()));
		assert!("call:2:3".parse::<StreamKey>().is_err());
		assert!("guild:1:2:3:4".parse::<StreamKey>().is_err());
	}

	#[test]
	fn parse_events() {
		let event = GatewayEvent::parse("READY", json!({ "user": { "id": "42", "username": "bot" }, "v": 9 })).unwrap();
		assert_eq!(event, Some(GatewayEvent::Ready { user_id: "42".to_string() }));

		let event = GatewayEvent::parse("VOICE_STATE_UPDATE", json!({
			"user_id": "42",
			"session_id": "abc",
			"channel_id": "2",
		})).unwrap();
		assert_eq!(event, Some(GatewayEvent::VoiceStateUpdate { user_id: "42".to_string(), session_id: "abc".to_string() }));

		let event = GatewayEvent::parse("STREAM_CREATE", json!({
			"stream_key": "guild:1:2:3",
			"rtc_server_id": "999",
			"viewer_ids": [],
		})).unwrap();
		assert_eq!(event, Some(GatewayEvent::StreamCreate { stream_key: key(), rtc_server_id: "999".to_string() }));

		let event = GatewayEvent::parse("STREAM_SERVER_UPDATE", json!({
			"stream_key": "guild:1:2:3",
			"endpoint": "media.example:443",
			"token": "t",
		})).unwrap();
		assert_eq!(event, Some(GatewayEvent::StreamServerUpdate {
			stream_key: key(),
			endpoint: "media.example:443".to_string(),
			token: "t".to_string(),
		}));
	}

	#[test]
	fn skip_unusable_events() {
		let event = GatewayEvent::parse("VOICE_SERVER_UPDATE", json!({ "guild_id": "1", "endpoint": null, "token": "t" })).unwrap();
		assert_eq!(event, None);

		assert_eq!(GatewayEvent::parse("MESSAGE_CREATE", json!({})).unwrap(), None);
		assert!(GatewayEvent::parse("VOICE_STATE_UPDATE", json!({ "user_id": 5 })).is_err());
	}

	#[test]
	fn serialize_commands() {
		let join = GatewayCommand::VoiceStateUpdate {
			guild_id: Some("1".to_string()),
			channel_id: Some("2".to_string()),
			self_mute: false,
			self_deaf: true,
		}.to_json();
		assert_eq!(join, json!({
			"op": 4,
			"d": { "guild_id": "1", "channel_id": "2", "self_mute": false, "self_deaf": true, "self_video": false },
		}));

		let leave = GatewayCommand::VoiceStateUpdate { guild_id: None, channel_id: None, self_mute: true, self_deaf: false }.to_json();
		assert_eq!(leave["d"]["guild_id"], Value::Null);
		assert_eq!(leave["d"]["self_mute"], true);

		let create = GatewayCommand::StreamCreate { guild_id: "1".to_string(), channel_id: "2".to_string() }.to_json();
		assert_eq!(create["op"], 18);
		assert_eq!(create["d"]["type"], "guild");
		assert_eq!(create["d"]["preferred_region"], Value::Null);

		let paused = GatewayCommand::StreamSetPaused { stream_key: key(), paused: false }.to_json();
		assert_eq!(paused, json!({ "op": 22, "d": { "stream_key": "guild:1:2:3", "paused": false } }));

		let delete = GatewayCommand::StreamDelete { stream_key: key() }.to_json();
		assert_eq!(delete, json!({ "op": 19, "d": { "stream_key": "guild:1:2:3" } }));
	}

	#[test]
	fn heartbeat_sequence() {
		assert_eq!(heartbeat(None), json!({ "op": 1, "d": null }));
		assert_eq!(heartbeat(Some(7)), json!({ "op": 1, "d": 7 }));
	}
}
