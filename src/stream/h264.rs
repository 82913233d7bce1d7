use bytes::{Buf, BytesMut};

const NAL_TYPE_SEI: u8 = 6;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_ACCESS_UNIT_DELIMITER: u8 = 9;

/// Regroups an Annex-B H.264 byte stream into access units.
///
/// Each emitted access unit is a sequence of `[u32 BE length][NAL unit]` records. Access units are
/// delimited by the access unit delimiters the encoder inserts, which themselves are not forwarded.
#[derive(Default)]
pub struct NalDemuxer {
	/// Bytes received that are not yet part of a complete NAL unit.
	buffer: BytesMut,

	/// The access unit that is being built, already length-prefixed.
	access_unit: Vec<u8>,
}

impl NalDemuxer {
	pub fn new() -> Self {
		Default::default()
	}

	/// Feed the next chunk of the byte stream, returning every access unit it completed.
	pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
		self.buffer.extend_from_slice(chunk);

		let mut access_units = Vec::new();
		while let Some(nalu) = self.next_nal() {
			if let Some(access_unit) = self.process(&nalu) {
				access_units.push(access_unit);
			}
		}

		access_units
	}

	/// Treat the remaining bytes as the last NAL unit and emit the pending access unit, if any.
	pub fn flush(&mut self) -> Option<Vec<u8>> {
		let mut remaining = std::mem::take(&mut self.buffer);
		if let Some(start) = find_start_code(&remaining, 0) {
			remaining.advance(start);
			remaining.advance(start_code_length(&remaining));

			if let Some(access_unit) = self.process(&remaining) {
				// An access unit delimiter as the very last NAL unit closes the previous access unit.
				return Some(access_unit);
			}
		}

		if self.access_unit.is_empty() {
			None
		} else {
			Some(std::mem::take(&mut self.access_unit))
		}
	}

	/// Split the next complete NAL unit (without its start code) off the buffer.
	fn next_nal(&mut self) -> Option<BytesMut> {
		loop {
			let Some(first) = find_start_code(&self.buffer, 0) else {
				// Keep enough bytes around to detect a start code split over two chunks.
				if self.buffer.len() > 3 {
					let skip = self.buffer.len() - 3;
					tracing::trace!("Discarding {skip} bytes preceding the first start code.");
					self.buffer.advance(skip);
				}
				return None;
			};

			if first > 0 {
				tracing::trace!("Discarding {first} bytes preceding the first start code.");
				self.buffer.advance(first);
			}

			let start_length = start_code_length(&self.buffer);
			let end = find_start_code(&self.buffer, start_length)?;

			let mut nalu = self.buffer.split_to(end);
			nalu.advance(start_length);
			if !nalu.is_empty() {
				return Some(nalu);
			}
		}
	}

	fn process(&mut self, nalu: &[u8]) -> Option<Vec<u8>> {
		let nal_type = nalu.first()? & 0x1F;

		match nal_type {
			NAL_TYPE_ACCESS_UNIT_DELIMITER => {
				if self.access_unit.is_empty() {
					None
				} else {
					Some(std::mem::take(&mut self.access_unit))
				}
			},
			NAL_TYPE_SPS | NAL_TYPE_SEI => {
				self.append(&remove_emulation_prevention(nalu));
				None
			},
			_ => {
				self.append(nalu);
				None
			},
		}
	}

	fn append(&mut self, nalu: &[u8]) {
		self.access_unit.extend((nalu.len() as u32).to_be_bytes());
		self.access_unit.extend_from_slice(nalu);
	}
}

/// Position of the first 3 or 4 byte start code at or after `from`.
fn find_start_code(buffer: &[u8], from: usize) -> Option<usize> {
	let position = buffer.get(from..)?
		.windows(3)
		.position(|window| window == [0, 0, 1])? + from;

	if position > from && buffer[position - 1] == 0 {
		Some(position - 1)
	} else {
		Some(position)
	}
}

/// Length of the start code at the beginning of `buffer`, which must start with one.
fn start_code_length(buffer: &[u8]) -> usize {
	if buffer.get(2) == Some(&1) {
		3
	} else {
		4
	}
}

/// Strip emulation prevention bytes: every `00 00 03 xx` with `xx <= 3` loses its `03`.
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
	let mut output = Vec::with_capacity(data.len());

	let mut i = 0;
	while i < data.len() {
		if i + 3 < data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 3 && data[i + 3] <= 3 {
			output.extend_from_slice(&[0, 0]);
			i += 3;
		} else {
			output.push(data[i]);
			i += 1;
		}
	}

	output
}
