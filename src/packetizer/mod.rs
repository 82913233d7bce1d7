use crate::error::StreamError;

pub use self::{
	audio::AudioPacketizer,
	video::VideoPacketizer,
};

mod audio;
mod video;

/// Largest media payload carried in a single RTP packet.
pub const MTU: usize = 1200;

/// Size of the fixed RTP header.
pub const RTP_HEADER_SIZE: usize = 12;

/// One-byte header extension with profile 0xBEDE and a single element (id 5, length 2, value 0).
const HEADER_EXTENSION: [u8; 8] = [0xBE, 0xDE, 0x00, 0x01, (5 << 4) | (2 - 1), 0x00, 0x00, 0x00];

/// Encrypts packet payloads before they go on the wire.
pub trait PacketSealer {
	/// Seal `payload` and append the result to `packet`, which already contains the RTP header.
	fn seal(&self, packet: &mut Vec<u8>, payload: &[u8]) -> Result<(), StreamError>;
}

#[derive(Debug)]
#[repr(C)]
struct RtpHeader {
	header: u8,
	packet_type: u8,
	sequence_number: u16,
	timestamp: u32,
	ssrc: u32,
}

impl RtpHeader {
	fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(self.header.to_be_bytes());
		buffer.extend(self.packet_type.to_be_bytes());
		buffer.extend(self.sequence_number.to_be_bytes());
		buffer.extend(self.timestamp.to_be_bytes());
		buffer.extend(self.ssrc.to_be_bytes());
	}
}

/// Sequence and timestamp bookkeeping shared by the audio and video packetizers.
#[derive(Debug)]
pub struct RtpPacketizer {
	payload_type: u8,
	extension: bool,
	sequence: u16,
	timestamp: u32,
	mtu: usize,
}

impl RtpPacketizer {
	pub fn new(payload_type: u8, extension: bool) -> Self {
		Self {
			payload_type,
			extension,
			sequence: 0,
			timestamp: 0,
			mtu: MTU,
		}
	}

	pub fn mtu(&self) -> usize {
		self.mtu
	}

	/// Returns the sequence number for the next packet and advances the counter.
	pub fn next_sequence(&mut self) -> u16 {
		let sequence = self.sequence;
		self.sequence = self.sequence.wrapping_add(1);
		sequence
	}

	pub fn timestamp(&self) -> u32 {
		self.timestamp
	}

	pub fn advance_timestamp(&mut self, increment: u32) {
		self.timestamp = self.timestamp.wrapping_add(increment);
	}

	/// Build a single sealed packet: RTP header followed by the encrypted (extension + payload).
	pub fn packet<S: PacketSealer>(
		&mut self,
		ssrc: u32,
		marker: bool,
		payload: &[u8],
		sealer: &S,
	) -> Result<Vec<u8>, StreamError> {
		let header = RtpHeader {
			header: 2 << 6 | u8::from(self.extension) << 4,
			packet_type: if marker { self.payload_type | 0x80 } else { self.payload_type },
			sequence_number: self.next_sequence(),
			timestamp: self.timestamp,
			ssrc,
		};

		let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + HEADER_EXTENSION.len() + payload.len() + 32);
		header.serialize(&mut packet);

		if self.extension {
			let plaintext = [&HEADER_EXTENSION[..], payload].concat();
			sealer.seal(&mut packet, &plaintext)?;
		} else {
			sealer.seal(&mut packet, payload)?;
		}

		Ok(packet)
	}
}

/// Appends payloads without encrypting them, so tests can inspect what went on the wire.
#[cfg(test)]
pub(crate) struct PlainSealer;

#[cfg(test)]
impl PacketSealer for PlainSealer {
	fn seal(&self, packet: &mut Vec<u8>, payload: &[u8]) -> Result<(), StreamError> {
		packet.extend_from_slice(payload);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_layout() {
		let mut packetizer = RtpPacketizer::new(101, true);
		packetizer.timestamp = 0x01020304;
		let packet = packetizer.packet(0xAABBCCDD, true, &[0x65], &PlainSealer).unwrap();

		assert_eq!(packet[0], 0x90);
		assert_eq!(packet[1], 0x80 | 101);
		assert_eq!(&packet[2..4], &[0, 0]);
		assert_eq!(&packet[4..8], &[1, 2, 3, 4]);
		assert_eq!(&packet[8..12], &[0xAA, 0xBB, 0xCC, 0xDD]);
		assert_eq!(&packet[12..20], &HEADER_EXTENSION);
		assert_eq!(&packet[20..], &[0x65]);
	}

	#[test]
	fn no_extension() {
		let mut packetizer = RtpPacketizer::new(120, false);
		let packet = packetizer.packet(1, false, &[1, 2, 3], &PlainSealer).unwrap();

		assert_eq!(packet[0], 0x80);
		assert_eq!(packet[1], 120);
		assert_eq!(&packet[RTP_HEADER_SIZE..], &[1, 2, 3]);
	}

	#[test]
	fn sequence_wraps() {
		let mut packetizer = RtpPacketizer::new(120, false);
		packetizer.sequence = u16::MAX - 1;

		assert_eq!(packetizer.next_sequence(), u16::MAX - 1);
		assert_eq!(packetizer.next_sequence(), u16::MAX);
		assert_eq!(packetizer.next_sequence(), 0);
		assert_eq!(packetizer.next_sequence(), 1);
	}

	#[test]
	fn timestamp_wraps() {
		let mut packetizer = RtpPacketizer::new(120, false);
		packetizer.timestamp = u32::MAX - 959;

		packetizer.advance_timestamp(960);
		assert_eq!(packetizer.timestamp(), 0);
		packetizer.advance_timestamp(960);
		assert_eq!(packetizer.timestamp(), 960);
	}

	#[test]
	fn sequence_increases_per_packet() {
		let mut packetizer = RtpPacketizer::new(120, false);
		let mut previous = None;
		for _ in 0..5 {
			let packet = packetizer.packet(1, true, &[0], &PlainSealer).unwrap();
			let sequence = u16::from_be_bytes([packet[2], packet[3]]);
			if let Some(previous) = previous {
				assert_eq!(sequence, u16::wrapping_add(previous, 1));
			}
			previous = Some(sequence);
		}
	}
}
