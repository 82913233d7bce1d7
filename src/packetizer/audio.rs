use crate::error::StreamError;

use super::{PacketSealer, RtpPacketizer};

const PAYLOAD_TYPE: u8 = 0x78;
const SAMPLE_RATE: u32 = 48000;

/// Timestamp increment per 20ms Opus frame.
const TIMESTAMP_INCREMENT: u32 = (SAMPLE_RATE / 100) * 2;

pub struct AudioPacketizer {
	rtp: RtpPacketizer,
}

impl AudioPacketizer {
	pub fn new() -> Self {
		Self { rtp: RtpPacketizer::new(PAYLOAD_TYPE, false) }
	}

	/// Wrap a single Opus frame in one sealed RTP packet.
	pub fn packetize<S: PacketSealer>(&mut self, frame: &[u8], ssrc: u32, sealer: &S) -> Result<Vec<u8>, StreamError> {
		if frame.len() > self.rtp.mtu() {
			tracing::warn!("Opus frame of {} bytes exceeds the MTU, sending it anyway.", frame.len());
		}

		let packet = self.rtp.packet(ssrc, true, frame, sealer)?;
		self.rtp.advance_timestamp(TIMESTAMP_INCREMENT);

		Ok(packet)
	}
}

impl Default for AudioPacketizer {
	fn default() -> Self {
		Self::new()
	}
}
