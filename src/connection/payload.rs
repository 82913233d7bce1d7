use std::net::SocketAddrV4;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::StreamConfig;

use super::udp::Ssrcs;

pub const IDENTIFY: u16 = 0;
pub const SELECT_PROTOCOL: u16 = 1;
pub const READY: u16 = 2;
pub const HEARTBEAT: u16 = 3;
pub const SESSION_DESCRIPTION: u16 = 4;
pub const SPEAKING: u16 = 5;
pub const HEARTBEAT_ACK: u16 = 6;
pub const RESUME: u16 = 7;
pub const HELLO: u16 = 8;
pub const RESUMED: u16 = 9;
pub const VIDEO: u16 = 12;

/// Encryption mode negotiated during protocol selection.
pub const ENCRYPTION_MODE: &str = "xsalsa20_poly1305_lite";

#[derive(Debug, Deserialize)]
pub struct VoiceMessage {
	pub op: u16,
	#[serde(default)]
	pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct Hello {
	pub heartbeat_interval: f64,
}

#[derive(Debug, Deserialize)]
pub struct Ready {
	pub ssrc: u32,
	pub ip: String,
	pub port: u16,
	#[serde(default)]
	pub modes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionDescription {
	pub secret_key: Vec<u8>,
	#[serde(default)]
	pub mode: Option<String>,
}

pub struct Identify<'a> {
	pub server_id: &'a str,
	pub user_id: &'a str,
	pub session_id: &'a str,
	pub token: &'a str,
}

impl Identify<'_> {
	pub fn to_json(&self) -> Value {
		json!({
			"op": IDENTIFY,
			"d": {
				"server_id": self.server_id,
				"user_id": self.user_id,
				"session_id": self.session_id,
				"token": self.token,
				"video": true,
				"streams": [{ "type": "screen", "rid": "100", "quality": 100 }],
			},
		})
	}
}

pub fn resume(server_id: &str, session_id: &str, token: &str) -> Value {
	json!({
		"op": RESUME,
		"d": {
			"server_id": server_id,
			"session_id": session_id,
			"token": token,
		},
	})
}

pub fn heartbeat(nonce: u64) -> Value {
	json!({ "op": HEARTBEAT, "d": nonce })
}

pub fn select_protocol(address: SocketAddrV4) -> Value {
	json!({
		"op": SELECT_PROTOCOL,
		"d": {
			"protocol": "udp",
			"codecs": [
				{ "name": "opus", "type": "audio", "priority": 1000, "payload_type": 120 },
				{
					"name": "H264",
					"type": "video",
					"priority": 1000,
					"payload_type": 101,
					"rtx_payload_type": 102,
					"encode": true,
					"decode": true,
				},
			],
			"data": {
				"address": address.ip().to_string(),
				"port": address.port(),
				"mode": ENCRYPTION_MODE,
			},
		},
	})
}

pub fn speaking(speaking: u8, ssrc: u32) -> Value {
	json!({
		"op": SPEAKING,
		"d": {
			"delay": 0,
			"speaking": speaking,
			"ssrc": ssrc,
		},
	})
}

/// Announce whether we are sending video, and with which parameters.
pub fn video(ssrcs: Ssrcs, enabled: bool, stream: &StreamConfig) -> Value {
	let (video_ssrc, rtx_ssrc) = if enabled { (ssrcs.video, ssrcs.rtx) } else { (0, 0) };

	json!({
		"op": VIDEO,
		"d": {
			"audio_ssrc": ssrcs.audio,
			"video_ssrc": video_ssrc,
			"rtx_ssrc": rtx_ssrc,
			"streams": [{
				"type": "video",
				"rid": "100",
				"ssrc": video_ssrc,
				"active": true,
				"quality": 100,
				"rtx_ssrc": rtx_ssrc,
				"max_bitrate": u64::from(stream.max_bitrate_kbps) * 1000,
				"max_framerate": stream.fps,
				"max_resolution": {
					"type": "fixed",
					"width": stream.width,
					"height": stream.height,
				},
			}],
		},
	})
}
