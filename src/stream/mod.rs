use std::{future::Future, path::Path, sync::Arc, time::Duration};

use async_shutdown::ShutdownManager;
use tokio::{io::{AsyncRead, AsyncReadExt}, sync::{mpsc, watch}, task::JoinHandle};

use crate::{
	config::{StreamConfig, TranscoderConfig},
	connection::UdpTransport,
	error::StreamError,
	packetizer::{AudioPacketizer, VideoPacketizer},
};

use self::{h264::NalDemuxer, sink::PacedSink, transcoder::Transcoder};

pub mod encoder;
pub mod h264;
pub mod sink;
pub mod transcoder;

/// The transport media is currently sent over, if any.
pub type TransportReceiver = watch::Receiver<Option<Arc<UdpTransport>>>;

pub const AUDIO_FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Frames buffered between two stages of the pipeline.
const FRAME_QUEUE_SIZE: usize = 16;

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub fn frame_interval(fps: u32) -> Duration {
	Duration::from_secs(1) / fps.max(1)
}

/// A media file being transcoded, paced and sent to the current transport.
pub struct MediaStream {
	video_sink: PacedSink,
	audio_sink: Option<PacedSink>,
	fps_tx: watch::Sender<u32>,
	shutdown: ShutdownManager<()>,
}

impl MediaStream {
	/// Start streaming `input` from `start_time`.
	///
	/// The returned handle resolves when the file finished playing, the stream was stopped or
	/// something failed. Every tick of the video sink is reported on `progress_tx`.
	pub async fn start(
		input: &Path,
		start_time: Duration,
		stream: &StreamConfig,
		transcoder: &TranscoderConfig,
		transport_rx: TransportReceiver,
		progress_tx: mpsc::UnboundedSender<Duration>,
	) -> Result<(Self, JoinHandle<Result<(), StreamError>>), StreamError> {
		let (transcoder, outputs) = Transcoder::spawn(transcoder, stream, input, start_time).await?;
		Ok(Self::with_source(
			outputs.video,
			outputs.audio,
			stream,
			transport_rx,
			progress_tx,
			|shutdown| async move { transcoder.wait(shutdown.wait_shutdown_triggered()).await },
		))
	}

	/// Stream from already opened video and audio outputs.
	///
	/// `source` produces a future that resolves when whatever writes the outputs has finished,
	/// it should stop writing once the given shutdown manager is triggered.
	pub fn with_source<V, A, S, F>(
		video: V,
		audio: Option<A>,
		stream: &StreamConfig,
		transport_rx: TransportReceiver,
		progress_tx: mpsc::UnboundedSender<Duration>,
		source: S,
	) -> (Self, JoinHandle<Result<(), StreamError>>)
	where
		V: AsyncRead + Unpin + Send + 'static,
		A: AsyncRead + Unpin + Send + 'static,
		S: FnOnce(ShutdownManager<()>) -> F,
		F: Future<Output = Result<(), StreamError>> + Send + 'static,
	{
		let shutdown = ShutdownManager::new();
		let mut tasks = Vec::new();
		let mut sinks = Vec::new();

		let (fps_tx, fps_rx) = watch::channel(stream.fps);
		let (access_unit_tx, access_unit_rx) = mpsc::channel(FRAME_QUEUE_SIZE);
		let (video_tx, video_rx) = mpsc::channel(FRAME_QUEUE_SIZE);
		tasks.push(spawn_task("video demuxer", &shutdown, demux_video(video, access_unit_tx)));
		let (video_sink, handle) = PacedSink::new(
			"video",
			frame_interval(stream.fps),
			stream.max_queued_frames,
			access_unit_rx,
			video_tx,
			Some(progress_tx),
		);
		sinks.push(handle);
		tasks.push(spawn_task("video sender", &shutdown, send_video(video_rx, transport_rx.clone(), fps_rx)));

		let audio_sink = match audio {
			Some(audio) => {
				let (encoded_tx, encoded_rx) = mpsc::channel(FRAME_QUEUE_SIZE);
				let (audio_tx, audio_rx) = mpsc::channel(FRAME_QUEUE_SIZE);
				tasks.push(spawn_task("audio encoder", &shutdown, encoder::encode_pcm(audio, encoded_tx)));
				let (audio_sink, handle) = PacedSink::new(
					"audio",
					AUDIO_FRAME_INTERVAL,
					stream.max_queued_frames,
					encoded_rx,
					audio_tx,
					None,
				);
				sinks.push(handle);
				tasks.push(spawn_task("audio sender", &shutdown, send_audio(audio_rx, transport_rx)));
				Some(audio_sink)
			},
			None => None,
		};

		let source = source(shutdown.clone());
		let handle = tokio::spawn(run(source, tasks, sinks, shutdown.clone()));

		(Self { video_sink, audio_sink, fps_tx, shutdown }, handle)
	}

	/// Hold all frames until the stream is resumed.
	pub async fn pause(&self) -> Result<(), StreamError> {
		self.video_sink.pause().await?;
		if let Some(audio_sink) = &self.audio_sink {
			audio_sink.pause().await?;
		}
		Ok(())
	}

	pub async fn resume(&self) -> Result<(), StreamError> {
		self.video_sink.resume().await?;
		if let Some(audio_sink) = &self.audio_sink {
			audio_sink.resume().await?;
		}
		Ok(())
	}

	pub async fn set_frame_rate(&self, fps: u32) -> Result<(), StreamError> {
		self.fps_tx.send_replace(fps);
		self.video_sink.set_interval(frame_interval(fps)).await
	}

	/// Kill the transcoder and stop all tasks. Stopping twice is harmless.
	pub fn stop(&self) {
		if self.shutdown.trigger_shutdown(()).is_ok() {
			tracing::debug!("Stopping media stream.");
		}
	}
}

/// Run a pipeline task that stops the whole pipeline when it fails.
fn spawn_task<F>(name: &'static str, shutdown: &ShutdownManager<()>, task: F) -> JoinHandle<Result<(), StreamError>>
where
	F: std::future::Future<Output = Result<(), StreamError>> + Send + 'static,
{
	let shutdown = shutdown.clone();
	tokio::spawn(async move {
		match shutdown.wrap_cancel(task).await {
			Ok(Ok(())) => {
				tracing::debug!("The {name} finished.");
				Ok(())
			},
			Ok(Err(e)) => {
				tracing::error!("The {name} failed: {e}");
				let _ = shutdown.trigger_shutdown(());
				Err(e)
			},
			Err(()) => Ok(()),
		}
	})
}

async fn run(
	source: impl Future<Output = Result<(), StreamError>>,
	tasks: Vec<JoinHandle<Result<(), StreamError>>>,
	sinks: Vec<JoinHandle<()>>,
	shutdown: ShutdownManager<()>,
) -> Result<(), StreamError> {
	let mut result = source.await;
	if let Err(e) = &result {
		tracing::error!("Media source failed: {e}");
		let _ = shutdown.trigger_shutdown(());
	}

	// Sinks keep draining after the source finished, unless we are stopping.
	let sink_abort_handles: Vec<_> = sinks.iter().map(JoinHandle::abort_handle).collect();
	tokio::select! {
		_ = futures::future::join_all(sinks) => {},
		_ = shutdown.wait_shutdown_triggered() => {
			for handle in sink_abort_handles {
				handle.abort();
			}
		},
	}

	for task in futures::future::join_all(tasks).await {
		match task {
			Ok(Ok(())) => {},
			Ok(Err(e)) => {
				if result.is_ok() {
					result = Err(e);
				}
			},
			Err(e) => tracing::error!("Media task panicked: {e}"),
		}
	}

	let _ = shutdown.trigger_shutdown(());
	tracing::info!("Media stream finished.");
	result
}

async fn demux_video<R: AsyncRead + Unpin>(mut input: R, access_unit_tx: mpsc::Sender<Vec<u8>>) -> Result<(), StreamError> {
	let mut demuxer = NalDemuxer::new();
	let mut buffer = vec![0u8; READ_BUFFER_SIZE];

	loop {
		let len = input.read(&mut buffer).await?;
		if len == 0 {
			break;
		}

		for access_unit in demuxer.push(&buffer[..len]) {
			if access_unit_tx.send(access_unit).await.is_err() {
				tracing::debug!("Access unit channel closed.");
				return Ok(());
			}
		}
	}

	if let Some(access_unit) = demuxer.flush() {
		let _ = access_unit_tx.send(access_unit).await;
	}

	Ok(())
}

/// The current transport, if it is ready to send media.
fn ready_transport(transport_rx: &TransportReceiver) -> Option<Arc<UdpTransport>> {
	transport_rx.borrow()
		.as_ref()
		.filter(|transport| transport.is_ready())
		.cloned()
}

async fn send_video(
	mut frame_rx: mpsc::Receiver<Vec<u8>>,
	transport_rx: TransportReceiver,
	fps_rx: watch::Receiver<u32>,
) -> Result<(), StreamError> {
	let mut packetizer = VideoPacketizer::new(*fps_rx.borrow());

	while let Some(access_unit) = frame_rx.recv().await {
		let Some(transport) = ready_transport(&transport_rx) else {
			tracing::trace!("Dropping video frame, the transport is not ready.");
			continue;
		};

		packetizer.set_fps(*fps_rx.borrow());
		let packets = packetizer.packetize(&access_unit, transport.ssrcs().video, transport.as_ref())?;
		for packet in packets {
			transport.send(&packet).await?;
		}
	}

	Ok(())
}

async fn send_audio(mut frame_rx: mpsc::Receiver<Vec<u8>>, transport_rx: TransportReceiver) -> Result<(), StreamError> {
	let mut packetizer = AudioPacketizer::new();

	while let Some(frame) = frame_rx.recv().await {
		let Some(transport) = ready_transport(&transport_rx) else {
			tracing::trace!("Dropping audio frame, the transport is not ready.");
			continue;
		};

		let packet = packetizer.packetize(&frame, transport.ssrcs().audio, transport.as_ref())?;
		transport.send(&packet).await?;
	}

	Ok(())
}
