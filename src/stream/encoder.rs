use byteorder::{ByteOrder, LittleEndian};
use tokio::{io::{AsyncRead, AsyncReadExt}, sync::mpsc};

use crate::error::StreamError;

pub const SAMPLE_RATE: u32 = 48000;
const CHANNELS: usize = 2;

/// Samples per channel in a single 20ms frame.
const FRAME_SAMPLES: usize = SAMPLE_RATE as usize / 50;

/// Size of a single frame of interleaved 16-bit PCM.
const FRAME_BYTES: usize = FRAME_SAMPLES * CHANNELS * 2;

const MAX_PACKET_SIZE: usize = 4000;

pub struct AudioEncoder {
	encoder: opus::Encoder,
}

impl AudioEncoder {
	pub fn new() -> Result<Self, StreamError> {
		let encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Stereo, opus::Application::Audio)
			.map_err(|e| StreamError::UpstreamMedia(format!("failed to create audio encoder: {e}")))?;

		Ok(Self { encoder })
	}

	/// Encode one frame of interleaved stereo samples.
	pub fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>, StreamError> {
		self.encoder.encode_vec(samples, MAX_PACKET_SIZE)
			.map_err(|e| StreamError::UpstreamMedia(format!("failed to encode audio frame: {e}")))
	}
}

/// Read 48kHz stereo s16le PCM from `input` and send one Opus frame per 20ms of audio.
///
/// A trailing partial frame is dropped.
pub async fn encode_pcm<R: AsyncRead + Unpin>(mut input: R, frame_tx: mpsc::Sender<Vec<u8>>) -> Result<(), StreamError> {
	let mut encoder = AudioEncoder::new()?;
	let mut buffer = vec![0u8; FRAME_BYTES];
	let mut samples = vec![0i16; FRAME_SAMPLES * CHANNELS];

	loop {
		match input.read_exact(&mut buffer).await {
			Ok(_) => {},
			Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
			Err(e) => return Err(e.into()),
		}

		LittleEndian::read_i16_into(&buffer, &mut samples);
		let frame = encoder.encode(&samples)?;

		if frame_tx.send(frame).await.is_err() {
			tracing::debug!("Audio frame channel closed.");
			break;
		}
	}

	tracing::debug!("Finished encoding audio.");
	Ok(())
}
