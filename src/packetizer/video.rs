use byteorder::{BigEndian, ReadBytesExt};

use crate::error::StreamError;

use super::{PacketSealer, RtpPacketizer};

const PAYLOAD_TYPE: u8 = 0x65;

/// NAL unit type used for FU-A fragments.
const FU_A: u8 = 28;

const CLOCK_RATE: u32 = 90000;

/// Packetizes length-prefixed H.264 access units, fragmenting large NAL units with FU-A.
pub struct VideoPacketizer {
	rtp: RtpPacketizer,
	fps: u32,
}

impl VideoPacketizer {
	pub fn new(fps: u32) -> Self {
		Self {
			rtp: RtpPacketizer::new(PAYLOAD_TYPE, true),
			fps: fps.max(1),
		}
	}

	pub fn set_fps(&mut self, fps: u32) {
		self.fps = fps.max(1);
	}

	pub fn packetize<S: PacketSealer>(
		&mut self,
		access_unit: &[u8],
		ssrc: u32,
		sealer: &S,
	) -> Result<Vec<Vec<u8>>, StreamError> {
		let nalus = split_access_unit(access_unit)?;
		let mtu = self.rtp.mtu();

		let mut packets = Vec::with_capacity(nalus.len());
		for (index, nalu) in nalus.iter().enumerate() {
			let last_nalu = index == nalus.len() - 1;

			if nalu.len() <= mtu {
				packets.push(self.rtp.packet(ssrc, last_nalu, nalu, sealer)?);
				continue;
			}

			let indicator = (nalu[0] & 0xE0) | FU_A;
			let nal_type = nalu[0] & 0x1F;
			let chunks: Vec<&[u8]> = nalu[1..].chunks(mtu).collect();
			tracing::trace!("Fragmenting NAL unit of {} bytes into {} packets.", nalu.len(), chunks.len());

			for (chunk_index, chunk) in chunks.iter().enumerate() {
				let first = chunk_index == 0;
				let last = chunk_index == chunks.len() - 1;

				let mut header = nal_type;
				if first {
					header |= 0x80;
				}
				if last {
					header |= 0x40;
				}

				let mut payload = Vec::with_capacity(2 + chunk.len());
				payload.push(indicator);
				payload.push(header);
				payload.extend_from_slice(chunk);

				packets.push(self.rtp.packet(ssrc, last_nalu && last, &payload, sealer)?);
			}
		}

		self.rtp.advance_timestamp(CLOCK_RATE / self.fps);

		Ok(packets)
	}
}

/// Split a buffer of `[u32 BE length][NAL unit]` records into its NAL units.
fn split_access_unit(mut data: &[u8]) -> Result<Vec<&[u8]>, StreamError> {
	let mut nalus = Vec::new();
	while !data.is_empty() {
		let length = data.read_u32::<BigEndian>()
			.map_err(|_| StreamError::Protocol("truncated NAL unit length in access unit".to_string()))? as usize;
		if length > data.len() {
			return Err(StreamError::Protocol(format!(
				"NAL unit length {length} exceeds the remaining {} bytes of the access unit",
				data.len(),
			)));
		}

		let (nalu, rest) = data.split_at(length);
		if !nalu.is_empty() {
			nalus.push(nalu);
		}
		data = rest;
	}

	Ok(nalus)
}
