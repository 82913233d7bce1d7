use std::{collections::HashMap, future::Future, path::PathBuf, sync::Arc, time::Duration};

use tokio::{sync::{mpsc, oneshot, watch}, task::JoinHandle};

use crate::{
	config::Config,
	connection::{ConnectionIdentity, ConnectionKind, MediaConnection, UdpTransport},
	error::StreamError,
	gateway::{GatewayCommand, GatewayEvent, StreamKey},
	stream::MediaStream,
};

/// How long to wait for a voice or stream connection to complete its handshake.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = oneshot::Sender<Result<(), StreamError>>;

enum StreamerCommand {
	JoinVoice { guild_id: String, channel_id: String, reply: Reply },
	CreateStream(Reply),
	StartStream { path: PathBuf, start_time: Duration, reply: Reply },
	PauseStream(Reply),
	ResumeStream(Reply),
	StopStream(oneshot::Sender<()>),
	LeaveVoice(oneshot::Sender<()>),
}

/// Events produced by tasks the streamer spawned.
enum StreamerEvent {
	ConnectionReady { kind: ConnectionKind, generation: u64, transport: Arc<UdpTransport> },
	ConnectionFailed { kind: ConnectionKind, generation: u64 },
	MediaStarted { generation: u64, media: MediaStream },
	MediaFinished { generation: u64, result: Result<(), StreamError> },
}

/// Drives the voice connection, the stream connection and the media pipeline.
#[derive(Clone)]
pub struct Streamer {
	command_tx: mpsc::Sender<StreamerCommand>,
	position_rx: watch::Receiver<Option<Duration>>,
}

impl Streamer {
	pub fn new(
		config: Config,
		gateway_tx: mpsc::Sender<GatewayCommand>,
		gateway_event_rx: mpsc::Receiver<GatewayEvent>,
	) -> Self {
		let (command_tx, command_rx) = mpsc::channel(10);
		let (inner, event_rx) = StreamerInner::new(config, gateway_tx);
		let position_rx = inner.position_tx.subscribe();
		tokio::spawn(inner.run(command_rx, event_rx, gateway_event_rx));

		Self { command_tx, position_rx }
	}

	/// Join a voice channel, resolves once the voice connection is ready.
	pub async fn join_voice(&self, guild_id: String, channel_id: String) -> Result<(), StreamError> {
		let (reply, result) = oneshot::channel();
		self.send(StreamerCommand::JoinVoice { guild_id, channel_id, reply }).await?;
		wait_ready(result, "voice connection").await
	}

	/// Start a screen share in the joined voice channel, resolves once the stream connection is ready.
	pub async fn create_stream(&self) -> Result<(), StreamError> {
		let (reply, result) = oneshot::channel();
		self.send(StreamerCommand::CreateStream(reply)).await?;
		wait_ready(result, "stream connection").await
	}

	/// Stream a media file, resolves when playback finished or was stopped.
	pub async fn start_stream(&self, path: PathBuf, start_time: Duration) -> Result<(), StreamError> {
		let (reply, result) = oneshot::channel();
		self.send(StreamerCommand::StartStream { path, start_time, reply }).await?;
		result.await.map_err(|_| StreamError::Closed("streamer"))?
	}

	pub async fn pause_stream(&self) -> Result<(), StreamError> {
		let (reply, result) = oneshot::channel();
		self.send(StreamerCommand::PauseStream(reply)).await?;
		result.await.map_err(|_| StreamError::Closed("streamer"))?
	}

	/// Recreate the stream connection and continue where playback was paused.
	pub async fn resume_stream(&self) -> Result<(), StreamError> {
		let (reply, result) = oneshot::channel();
		self.send(StreamerCommand::ResumeStream(reply)).await?;
		wait_ready(result, "stream connection").await
	}

	/// Stop playback and the stream connection. Stopping when nothing plays is not an error.
	pub async fn stop_stream(&self) {
		let (reply, result) = oneshot::channel();
		if self.send(StreamerCommand::StopStream(reply)).await.is_ok() {
			let _ = result.await;
		}
	}

	/// Stop everything and leave the voice channel. Leaving twice is not an error.
	pub async fn leave_voice(&self) {
		let (reply, result) = oneshot::channel();
		if self.send(StreamerCommand::LeaveVoice(reply)).await.is_ok() {
			let _ = result.await;
		}
	}

	/// Playback position, `None` when nothing plays.
	pub fn position(&self) -> watch::Receiver<Option<Duration>> {
		self.position_rx.clone()
	}

	async fn send(&self, command: StreamerCommand) -> Result<(), StreamError> {
		self.command_tx.send(command).await
			.map_err(|_| StreamError::Closed("streamer"))
	}
}

async fn wait_ready(result: oneshot::Receiver<Result<(), StreamError>>, what: &'static str) -> Result<(), StreamError> {
	match tokio::time::timeout(READY_TIMEOUT, result).await {
		Ok(Ok(result)) => result,
		Ok(Err(_)) => Err(StreamError::Closed("streamer")),
		Err(_) => Err(StreamError::NotReady(what)),
	}
}

/// A connection and whoever waits for it to become ready.
struct Connection {
	handle: MediaConnection,
	generation: u64,
	transport: Option<Arc<UdpTransport>>,
	waiters: Vec<Reply>,
}

struct VoiceState {
	guild_id: String,
	channel_id: String,
	session_id: Option<String>,
	connection: Connection,
}

struct Playback {
	generation: u64,
	media: Option<MediaStream>,
	position: Duration,
	progress_rx: mpsc::UnboundedReceiver<Duration>,
	paused: bool,

	/// Resume requests waiting for the new stream connection.
	resumes: Vec<Reply>,
}

struct StreamerInner {
	config: Config,
	gateway_tx: mpsc::Sender<GatewayCommand>,
	event_tx: mpsc::UnboundedSender<StreamerEvent>,
	position_tx: watch::Sender<Option<Duration>>,

	/// The transport the media pipeline sends to.
	transport_tx: watch::Sender<Option<Arc<UdpTransport>>>,

	user_id: Option<String>,
	generation: u64,
	voice: Option<VoiceState>,
	stream: Option<Connection>,
	playback: Option<Playback>,

	/// Callers of start_stream, answered when their playback finishes.
	start_replies: HashMap<u64, Reply>,
}

impl StreamerInner {
	fn new(config: Config, gateway_tx: mpsc::Sender<GatewayCommand>) -> (Self, mpsc::UnboundedReceiver<StreamerEvent>) {
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let (position_tx, _) = watch::channel(None);
		let (transport_tx, _) = watch::channel(None);

		let inner = Self {
			config,
			gateway_tx,
			event_tx,
			position_tx,
			transport_tx,
			user_id: None,
			generation: 0,
			voice: None,
			stream: None,
			playback: None,
			start_replies: HashMap::new(),
		};

		(inner, event_rx)
	}

	async fn run(
		mut self,
		mut command_rx: mpsc::Receiver<StreamerCommand>,
		mut event_rx: mpsc::UnboundedReceiver<StreamerEvent>,
		mut gateway_event_rx: mpsc::Receiver<GatewayEvent>,
	) {
		let mut gateway_closed = false;

		loop {
			tokio::select! {
				biased;

				event = gateway_event_rx.recv(), if !gateway_closed => {
					match event {
						Some(event) => self.handle_gateway_event(event).await,
						None => {
							tracing::warn!("Gateway event channel closed.");
							gateway_closed = true;
						},
					}
				},

				Some(event) = event_rx.recv() => self.handle_event(event).await,

				progress = next_progress(&mut self.playback) => {
					if let Some(playback) = &mut self.playback {
						playback.position += progress;
						self.position_tx.send_replace(Some(playback.position));
					}
				},

				command = command_rx.recv() => {
					let Some(command) = command else {
						tracing::debug!("All streamer handles are gone.");
						self.leave_voice().await;
						break;
					};

					match command {
						StreamerCommand::JoinVoice { guild_id, channel_id, reply } => self.join_voice(guild_id, channel_id, reply).await,
						StreamerCommand::CreateStream(reply) => {
							match self.create_stream().await {
								Ok(()) => self.wait_for_stream(reply),
								Err(e) => { let _ = reply.send(Err(e)); },
							}
						},
						StreamerCommand::StartStream { path, start_time, reply } => self.start_stream(path, start_time, reply).await,
						StreamerCommand::PauseStream(reply) => {
							let _ = reply.send(self.pause_stream().await);
						},
						StreamerCommand::ResumeStream(reply) => self.resume_stream(reply).await,
						StreamerCommand::StopStream(reply) => {
							self.stop_stream().await;
							let _ = reply.send(());
						},
						StreamerCommand::LeaveVoice(reply) => {
							self.leave_voice().await;
							let _ = reply.send(());
						},
					}
				},
			}
		}

		tracing::debug!("Streamer stopped.");
	}

	fn next_generation(&mut self) -> u64 {
		self.generation += 1;
		self.generation
	}

	/// Identity and stream key for a stream in the joined voice channel.
	fn stream_identity(&self) -> Result<(ConnectionIdentity, StreamKey), &'static str> {
		let voice = self.voice.as_ref().ok_or("voice connection")?;
		let user_id = self.user_id.clone().ok_or("gateway")?;

		let stream_key = StreamKey {
			guild_id: voice.guild_id.clone(),
			channel_id: voice.channel_id.clone(),
			user_id: user_id.clone(),
		};
		let identity = ConnectionIdentity {
			guild_id: voice.guild_id.clone(),
			channel_id: voice.channel_id.clone(),
			user_id,
		};

		Ok((identity, stream_key))
	}

	/// Create a connection and report back once it's ready, and again for every new handshake.
	fn connect(&mut self, kind: ConnectionKind, identity: ConnectionIdentity) -> Connection {
		let generation = self.next_generation();
		let (handle, ready_rx) = MediaConnection::new(
			kind,
			identity,
			self.config.stream.clone(),
			self.config.connection.clone(),
		);

		let event_tx = self.event_tx.clone();
		let mut transports = handle.transports();
		tokio::spawn(async move {
			let Ok(mut current) = ready_rx.await else {
				let _ = event_tx.send(StreamerEvent::ConnectionFailed { kind, generation });
				return;
			};
			if event_tx.send(StreamerEvent::ConnectionReady { kind, generation, transport: current.clone() }).is_err() {
				return;
			}

			// A server that moved hands out a new transport, which media has to follow.
			while transports.changed().await.is_ok() {
				let transport = transports.borrow_and_update().clone();
				let Some(transport) = transport.filter(|transport| !Arc::ptr_eq(transport, &current)) else {
					continue;
				};

				current = transport.clone();
				if event_tx.send(StreamerEvent::ConnectionReady { kind, generation, transport }).is_err() {
					return;
				}
			}
		});

		Connection { handle, generation, transport: None, waiters: Vec::new() }
	}

	async fn send_gateway(&self, command: GatewayCommand) {
		if self.gateway_tx.send(command).await.is_err() {
			tracing::error!("Failed to send gateway command, the gateway client is gone.");
		}
	}

	async fn join_voice(&mut self, guild_id: String, channel_id: String, reply: Reply) {
		if let Some(voice) = &mut self.voice {
			if voice.guild_id == guild_id && voice.channel_id == channel_id {
				if voice.connection.transport.is_some() {
					let _ = reply.send(Ok(()));
				} else {
					voice.connection.waiters.push(reply);
				}
				return;
			}

			tracing::info!("Switching from voice channel {} to {channel_id}.", voice.channel_id);
			self.leave_voice().await;
		}

		let Some(user_id) = self.user_id.clone() else {
			let _ = reply.send(Err(StreamError::NotReady("gateway")));
			return;
		};

		tracing::info!("Joining voice channel {channel_id} in guild {guild_id}.");
		let identity = ConnectionIdentity { guild_id: guild_id.clone(), channel_id: channel_id.clone(), user_id };
		let mut connection = self.connect(ConnectionKind::Voice, identity);
		connection.waiters.push(reply);

		self.voice = Some(VoiceState {
			guild_id: guild_id.clone(),
			channel_id: channel_id.clone(),
			session_id: None,
			connection,
		});

		self.send_gateway(GatewayCommand::VoiceStateUpdate {
			guild_id: Some(guild_id),
			channel_id: Some(channel_id),
			self_mute: false,
			self_deaf: true,
		}).await;
	}

	/// Ask the gateway for a stream and connect to it, unless a stream connection already exists.
	async fn create_stream(&mut self) -> Result<(), StreamError> {
		if self.stream.is_some() {
			return Ok(());
		}

		let (identity, stream_key) = self.stream_identity().map_err(StreamError::NotReady)?;

		tracing::info!("Creating stream {stream_key}.");
		self.send_gateway(GatewayCommand::StreamCreate {
			guild_id: identity.guild_id.clone(),
			channel_id: identity.channel_id.clone(),
		}).await;
		self.send_gateway(GatewayCommand::StreamSetPaused { stream_key, paused: false }).await;

		self.stream = Some(self.connect(ConnectionKind::Stream, identity));
		Ok(())
	}

	/// Answer `reply` once the stream connection is ready.
	fn wait_for_stream(&mut self, reply: Reply) {
		match &mut self.stream {
			Some(stream) if stream.transport.is_some() => { let _ = reply.send(Ok(())); },
			Some(stream) => stream.waiters.push(reply),
			None => { let _ = reply.send(Err(StreamError::NotReady("stream connection"))); },
		}
	}

	async fn start_stream(&mut self, path: PathBuf, start_time: Duration, reply: Reply) {
		let Some((generation, transport_rx, progress_tx)) = self.begin_playback(start_time, reply).await else {
			return;
		};

		tracing::info!("Starting stream of {} at {start_time:?}.", path.display());
		let stream_config = self.config.stream.clone();
		let transcoder_config = self.config.transcoder.clone();
		self.spawn_media(generation, async move {
			MediaStream::start(&path, start_time, &stream_config, &transcoder_config, transport_rx, progress_tx).await
		});
	}

	/// Claim a new playback on the ready stream connection, or answer `reply` with the reason why not.
	async fn begin_playback(
		&mut self,
		start_time: Duration,
		reply: Reply,
	) -> Option<(u64, watch::Receiver<Option<Arc<UdpTransport>>>, mpsc::UnboundedSender<Duration>)> {
		if self.playback.is_some() {
			let _ = reply.send(Err(StreamError::Validation("a stream is already playing".to_string())));
			return None;
		}

		let Some((connection, transport)) = self.stream.as_ref()
			.and_then(|stream| Some((stream.handle.clone(), stream.transport.clone()?)))
		else {
			let _ = reply.send(Err(StreamError::NotReady("stream connection")));
			return None;
		};

		if let Err(e) = set_media_flags(&connection, true).await {
			let _ = reply.send(Err(e));
			return None;
		}
		self.transport_tx.send_replace(Some(transport));

		let generation = self.next_generation();
		let (progress_tx, progress_rx) = mpsc::unbounded_channel();
		self.playback = Some(Playback {
			generation,
			media: None,
			position: start_time,
			progress_rx,
			paused: false,
			resumes: Vec::new(),
		});
		self.position_tx.send_replace(Some(start_time));
		self.start_replies.insert(generation, reply);

		Some((generation, self.transport_tx.subscribe(), progress_tx))
	}

	/// Report when the media pipeline of `generation` started and when it finished.
	fn spawn_media<F>(&self, generation: u64, start: F)
	where
		F: Future<Output = Result<(MediaStream, JoinHandle<Result<(), StreamError>>), StreamError>> + Send + 'static,
	{
		let event_tx = self.event_tx.clone();
		tokio::spawn(async move {
			let handle = match start.await {
				Ok((media, handle)) => {
					let _ = event_tx.send(StreamerEvent::MediaStarted { generation, media });
					handle
				},
				Err(e) => {
					let _ = event_tx.send(StreamerEvent::MediaFinished { generation, result: Err(e) });
					return;
				},
			};

			let result = match handle.await {
				Ok(result) => result,
				Err(e) => Err(StreamError::UpstreamMedia(format!("media pipeline panicked: {e}"))),
			};
			let _ = event_tx.send(StreamerEvent::MediaFinished { generation, result });
		});
	}

	/// Hold playback and tear down the stream connection, the voice connection stays.
	async fn pause_stream(&mut self) -> Result<(), StreamError> {
		let Some(playback) = &mut self.playback else {
			return Err(StreamError::NotReady("stream"));
		};
		if playback.paused {
			return Ok(());
		}
		let Some(media) = &playback.media else {
			return Err(StreamError::NotReady("stream"));
		};

		media.pause().await?;
		playback.paused = true;
		tracing::info!("Paused stream at {:?}.", playback.position);

		self.transport_tx.send_replace(None);
		self.close_stream_connection().await;
		Ok(())
	}

	async fn resume_stream(&mut self, reply: Reply) {
		match &mut self.playback {
			Some(playback) if playback.paused => playback.resumes.push(reply),
			_ => {
				let _ = reply.send(Err(StreamError::NotReady("paused stream")));
				return;
			},
		}

		if let Err(e) = self.create_stream().await {
			tracing::warn!("Failed to recreate stream for resuming: {e}");
			if let Some(playback) = &mut self.playback {
				for reply in playback.resumes.drain(..) {
					let _ = reply.send(Err(StreamError::NotReady("stream connection")));
				}
			}
			return;
		}

		// The stream connection may still be up if resume was requested twice.
		if let Some(transport) = self.stream.as_ref().and_then(|stream| stream.transport.clone()) {
			self.finish_resume(transport).await;
		}
	}

	/// Move running media over to the new transport of a stream connection that completed another handshake.
	async fn swap_transport(&mut self, transport: Arc<UdpTransport>) {
		if !self.playback.as_ref().is_some_and(|playback| !playback.paused) {
			return;
		}

		tracing::info!("The stream connection moved, continuing playback on the new transport.");
		if let Some(stream) = &self.stream {
			if let Err(e) = set_media_flags(&stream.handle, true).await {
				tracing::warn!("Failed to announce media on the moved stream connection: {e}");
			}
		}
		self.transport_tx.send_replace(Some(transport));
	}

	async fn finish_resume(&mut self, transport: Arc<UdpTransport>) {
		let Some(playback) = &mut self.playback else {
			return;
		};
		if playback.resumes.is_empty() {
			return;
		}

		let mut result = Ok(());
		if let Some(stream) = &self.stream {
			result = set_media_flags(&stream.handle, true).await;
		}
		if result.is_ok() {
			self.transport_tx.send_replace(Some(transport));
			if let Some(media) = &playback.media {
				result = media.resume().await;
			}
		}

		match &result {
			Ok(()) => {
				playback.paused = false;
				tracing::info!("Resumed stream at {:?}.", playback.position);
			},
			Err(e) => tracing::warn!("Failed to resume stream: {e}"),
		}

		for reply in playback.resumes.drain(..) {
			let _ = reply.send(result.as_ref().map(|_| ()).map_err(|_| StreamError::NotReady("stream connection")));
		}
	}

	/// Stop playback and the stream connection, then forget all playback state.
	async fn stop_stream(&mut self) {
		if let Some(playback) = self.playback.take() {
			tracing::info!("Stopping stream.");
			if let Some(media) = &playback.media {
				media.stop();
			}
			for reply in playback.resumes {
				let _ = reply.send(Err(StreamError::Closed("stream")));
			}
		}

		self.transport_tx.send_replace(None);
		self.position_tx.send_replace(None);
		self.close_stream_connection().await;
	}

	async fn close_stream_connection(&mut self) {
		let Some(stream) = self.stream.take() else {
			return;
		};

		stream.handle.stop().await;
		for reply in stream.waiters {
			let _ = reply.send(Err(StreamError::Closed("stream connection")));
		}

		if let Ok((_, stream_key)) = self.stream_identity() {
			self.send_gateway(GatewayCommand::StreamDelete { stream_key }).await;
		}
	}

	async fn leave_voice(&mut self) {
		self.stop_stream().await;

		let Some(voice) = self.voice.take() else {
			return;
		};

		tracing::info!("Leaving voice channel {}.", voice.channel_id);
		voice.connection.handle.stop().await;
		for reply in voice.connection.waiters {
			let _ = reply.send(Err(StreamError::Closed("voice connection")));
		}

		self.send_gateway(GatewayCommand::VoiceStateUpdate {
			guild_id: None,
			channel_id: None,
			self_mute: true,
			self_deaf: false,
		}).await;
	}

	async fn handle_event(&mut self, event: StreamerEvent) {
		match event {
			StreamerEvent::ConnectionReady { kind, generation, transport } => {
				let connection = match kind {
					ConnectionKind::Voice => self.voice.as_mut().map(|voice| &mut voice.connection),
					ConnectionKind::Stream => self.stream.as_mut(),
				};
				let Some(connection) = connection.filter(|connection| connection.generation == generation) else {
					tracing::debug!("Ignoring ready {kind} connection that was already stopped.");
					return;
				};

				let moved = connection.transport.replace(transport.clone()).is_some();
				for reply in connection.waiters.drain(..) {
					let _ = reply.send(Ok(()));
				}

				if kind == ConnectionKind::Stream {
					if moved {
						self.swap_transport(transport.clone()).await;
					}
					self.finish_resume(transport).await;
				}
			},
			StreamerEvent::ConnectionFailed { kind, generation } => {
				let current = match kind {
					ConnectionKind::Voice => self.voice.as_ref().map(|voice| voice.connection.generation),
					ConnectionKind::Stream => self.stream.as_ref().map(|stream| stream.generation),
				};
				if current != Some(generation) {
					return;
				}

				tracing::warn!("The {kind} connection closed before it was ready.");
				match kind {
					ConnectionKind::Voice => self.leave_voice().await,
					ConnectionKind::Stream => {
						if let Some(playback) = &mut self.playback {
							for reply in playback.resumes.drain(..) {
								let _ = reply.send(Err(StreamError::Closed("stream connection")));
							}
						}
						self.close_stream_connection().await;
					},
				}
			},
			StreamerEvent::MediaStarted { generation, media } => {
				match &mut self.playback {
					Some(playback) if playback.generation == generation => playback.media = Some(media),
					_ => {
						tracing::debug!("Stopping media stream that started after it was stopped.");
						media.stop();
					},
				}
			},
			StreamerEvent::MediaFinished { generation, result } => {
				match &result {
					Ok(()) => tracing::info!("Playback finished."),
					Err(e) => tracing::error!("Playback failed: {e}"),
				}

				// Only the current playback owns the stream, an older one finishing late leaves it alone.
				if self.playback.as_ref().is_some_and(|playback| playback.generation == generation) {
					if let Some(stream) = &self.stream {
						let _ = set_media_flags(&stream.handle, false).await;
					}
					self.stop_stream().await;
				}

				if let Some(reply) = self.start_replies.remove(&generation) {
					let _ = reply.send(result);
				}
			},
		}
	}

	async fn handle_gateway_event(&mut self, event: GatewayEvent) {
		match event {
			GatewayEvent::Ready { user_id } => self.user_id = Some(user_id),
			GatewayEvent::VoiceStateUpdate { user_id, session_id } => {
				if self.user_id.as_deref() != Some(user_id.as_str()) {
					return;
				}
				let Some(voice) = &mut self.voice else {
					return;
				};

				voice.session_id = Some(session_id.clone());
				if let Err(e) = voice.connection.handle.set_session(session_id).await {
					tracing::warn!("Failed to pass session to voice connection: {e}");
				}
			},
			GatewayEvent::VoiceServerUpdate { guild_id, endpoint, token } => {
				let Some(voice) = self.voice.as_ref().filter(|voice| voice.guild_id == guild_id) else {
					return;
				};

				if let Err(e) = voice.connection.handle.set_tokens(endpoint, token).await {
					tracing::warn!("Failed to pass tokens to voice connection: {e}");
				}
			},
			GatewayEvent::StreamCreate { stream_key, rtc_server_id } => {
				if !self.is_own_stream(&stream_key) {
					return;
				}
				let (Some(stream), Some(session_id)) = (&self.stream, self.voice.as_ref().and_then(|voice| voice.session_id.clone())) else {
					return;
				};

				let result = async {
					stream.handle.set_server_id(rtc_server_id).await?;
					stream.handle.set_session(session_id).await
				}.await;
				if let Err(e) = result {
					tracing::warn!("Failed to pass session to stream connection: {e}");
				}
			},
			GatewayEvent::StreamServerUpdate { stream_key, endpoint, token } => {
				if !self.is_own_stream(&stream_key) {
					return;
				}
				let Some(stream) = &self.stream else {
					return;
				};

				if let Err(e) = stream.handle.set_tokens(endpoint, token).await {
					tracing::warn!("Failed to pass tokens to stream connection: {e}");
				}
			},
		}
	}

	fn is_own_stream(&self, stream_key: &StreamKey) -> bool {
		self.voice.as_ref().is_some_and(|voice| voice.guild_id == stream_key.guild_id)
			&& self.user_id.as_deref() == Some(stream_key.user_id.as_str())
	}
}

async fn set_media_flags(connection: &MediaConnection, enabled: bool) -> Result<(), StreamError> {
	connection.set_speaking(enabled).await?;
	connection.set_video_status(enabled).await
}

async fn next_progress(playback: &mut Option<Playback>) -> Duration {
	match playback {
		Some(playback) => match playback.progress_rx.recv().await {
			Some(progress) => progress,
			None => std::future::pending().await,
		},
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use tokio::{io::{AsyncWriteExt, DuplexStream}, net::UdpSocket};

	use crate::{config::StreamConfig, connection::Ssrcs};

	use super::*;

	fn streamer() -> (Streamer, mpsc::Sender<GatewayEvent>, mpsc::Receiver<GatewayCommand>) {
		let (gateway_tx, gateway_rx) = mpsc::channel(10);
		let (event_tx, event_rx) = mpsc::channel(10);
		let streamer = Streamer::new(Config::default(), gateway_tx, event_rx);
		(streamer, event_tx, gateway_rx)
	}

	async fn logged_in() -> (Streamer, mpsc::Sender<GatewayEvent>, mpsc::Receiver<GatewayCommand>) {
		let (streamer, event_tx, gateway_rx) = streamer();
		event_tx.send(GatewayEvent::Ready { user_id: "3".to_string() }).await.unwrap();
		(streamer, event_tx, gateway_rx)
	}

	fn key() -> StreamKey {
		StreamKey { guild_id: "1".to_string(), channel_id: "2".to_string(), user_id: "3".to_string() }
	}

	#[tokio::test]
	async fn join_requires_login() {
		let (streamer, _event_tx, mut gateway_rx) = streamer();
		assert!(matches!(streamer.join_voice("1".to_string(), "2".to_string()).await, Err(StreamError::NotReady("gateway"))));
		assert!(gateway_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn stream_requires_voice() {
		let (streamer, _event_tx, mut gateway_rx) = logged_in().await;
		assert!(matches!(streamer.create_stream().await, Err(StreamError::NotReady(_))));
		assert!(matches!(streamer.start_stream("movie.mkv".into(), Duration::ZERO).await, Err(StreamError::NotReady(_))));
		assert!(matches!(streamer.pause_stream().await, Err(StreamError::NotReady(_))));
		assert!(matches!(streamer.resume_stream().await, Err(StreamError::NotReady(_))));
		assert!(gateway_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn join_and_leave() {
		let (streamer, _event_tx, mut gateway_rx) = logged_in().await;

		let join = tokio::spawn({
			let streamer = streamer.clone();
			async move { streamer.join_voice("1".to_string(), "2".to_string()).await }
		});

		assert_eq!(gateway_rx.recv().await, Some(GatewayCommand::VoiceStateUpdate {
			guild_id: Some("1".to_string()),
			channel_id: Some("2".to_string()),
			self_mute: false,
			self_deaf: true,
		}));

		streamer.leave_voice().await;
		assert!(matches!(join.await.unwrap(), Err(StreamError::Closed(_))));
		assert_eq!(gateway_rx.recv().await, Some(GatewayCommand::VoiceStateUpdate {
			guild_id: None,
			channel_id: None,
			self_mute: true,
			self_deaf: false,
		}));

		streamer.leave_voice().await;
		assert!(gateway_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn create_and_stop_stream() {
		let (streamer, _event_tx, mut gateway_rx) = logged_in().await;

		tokio::spawn({
			let streamer = streamer.clone();
			async move { streamer.join_voice("1".to_string(), "2".to_string()).await }
		});
		assert!(matches!(gateway_rx.recv().await, Some(GatewayCommand::VoiceStateUpdate { .. })));

		let create = tokio::spawn({
			let streamer = streamer.clone();
			async move { streamer.create_stream().await }
		});
		assert_eq!(gateway_rx.recv().await, Some(GatewayCommand::StreamCreate {
			guild_id: "1".to_string(),
			channel_id: "2".to_string(),
		}));
		assert_eq!(gateway_rx.recv().await, Some(GatewayCommand::StreamSetPaused { stream_key: key(), paused: false }));

		streamer.stop_stream().await;
		assert!(matches!(create.await.unwrap(), Err(StreamError::Closed(_))));
		assert_eq!(gateway_rx.recv().await, Some(GatewayCommand::StreamDelete { stream_key: key() }));
		assert_eq!(*streamer.position().borrow(), None);

		streamer.stop_stream().await;
		assert!(gateway_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn switching_channels_leaves_first() {
		let (streamer, _event_tx, mut gateway_rx) = logged_in().await;

		for channel_id in ["2", "5"] {
			tokio::spawn({
				let streamer = streamer.clone();
				async move { streamer.join_voice("1".to_string(), channel_id.to_string()).await }
			});
			let command = gateway_rx.recv().await.unwrap();
			if channel_id == "5" {
				assert!(matches!(command, GatewayCommand::VoiceStateUpdate { channel_id: None, .. }));
				let command = gateway_rx.recv().await.unwrap();
				assert!(matches!(command, GatewayCommand::VoiceStateUpdate { channel_id: Some(ref id), .. } if id == "5"));
			}
		}
	}

	#[tokio::test]
	async fn ignores_foreign_events() {
		let (streamer, event_tx, mut gateway_rx) = logged_in().await;

		// Events for other users or without a voice connection are harmless.
		event_tx.send(GatewayEvent::VoiceStateUpdate { user_id: "9".to_string(), session_id: "s".to_string() }).await.unwrap();
		event_tx.send(GatewayEvent::StreamCreate { stream_key: key(), rtc_server_id: "7".to_string() }).await.unwrap();
		event_tx.send(GatewayEvent::VoiceServerUpdate {
			guild_id: "1".to_string(),
			endpoint: "media.example".to_string(),
			token: "t".to_string(),
		}).await.unwrap();

		streamer.stop_stream().await;
		assert!(gateway_rx.try_recv().is_err());
		assert_eq!(*streamer.position().borrow(), None);
	}

	async fn transport(audio_ssrc: u32) -> (Arc<UdpTransport>, UdpSocket) {
		let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let transport = UdpTransport::connect(server.local_addr().unwrap(), Ssrcs::from_audio(audio_ssrc)).await.unwrap();
		transport.install_key(&[7u8; 32]).unwrap();
		transport.set_ready(true).unwrap();
		(Arc::new(transport), server)
	}

	/// A frame holding one NAL unit, completed by the delimiter and start code that follow it.
	fn frame(nal_type: u8) -> Vec<u8> {
		vec![nal_type, 0xAA, 0, 0, 0, 1, 0x09, 0xF0, 0, 0, 0, 1]
	}

	/// Sequence number and ssrc of the next video packet.
	async fn received(server: &UdpSocket) -> (u16, u32) {
		let mut buffer = [0u8; 2048];
		tokio::time::timeout(Duration::from_secs(5), server.recv(&mut buffer)).await.unwrap().unwrap();
		(
			u16::from_be_bytes([buffer[2], buffer[3]]),
			u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]),
		)
	}

	async fn nothing_received(server: &UdpSocket) -> bool {
		let mut buffer = [0u8; 2048];
		tokio::time::timeout(Duration::from_millis(200), server.recv(&mut buffer)).await.is_err()
	}

	/// A streamer in a voice channel with a stream connection that isn't ready yet.
	async fn with_stream() -> (StreamerInner, mpsc::UnboundedReceiver<StreamerEvent>, mpsc::Receiver<GatewayCommand>) {
		let (gateway_tx, mut gateway_rx) = mpsc::channel(10);
		let (mut inner, event_rx) = StreamerInner::new(Config::default(), gateway_tx);
		inner.user_id = Some("3".to_string());

		let identity = ConnectionIdentity { guild_id: "1".to_string(), channel_id: "2".to_string(), user_id: "3".to_string() };
		let connection = inner.connect(ConnectionKind::Voice, identity);
		inner.voice = Some(VoiceState {
			guild_id: "1".to_string(),
			channel_id: "2".to_string(),
			session_id: Some("session".to_string()),
			connection,
		});

		inner.create_stream().await.unwrap();
		assert!(matches!(gateway_rx.recv().await, Some(GatewayCommand::StreamCreate { .. })));
		assert!(matches!(gateway_rx.recv().await, Some(GatewayCommand::StreamSetPaused { paused: false, .. })));

		(inner, event_rx, gateway_rx)
	}

	async fn stream_ready(inner: &mut StreamerInner, transport: Arc<UdpTransport>) {
		let generation = inner.stream.as_ref().unwrap().generation;
		inner.handle_event(StreamerEvent::ConnectionReady { kind: ConnectionKind::Stream, generation, transport }).await;
	}

	/// Start playback of whatever is written to the returned stream, until the media is stopped.
	async fn play(
		inner: &mut StreamerInner,
		event_rx: &mut mpsc::UnboundedReceiver<StreamerEvent>,
	) -> (DuplexStream, oneshot::Receiver<Result<(), StreamError>>) {
		let (reply, finished) = oneshot::channel();
		let (generation, transport_rx, progress_tx) = inner.begin_playback(Duration::ZERO, reply).await.unwrap();

		let (mut writer, video) = tokio::io::duplex(4096);
		writer.write_all(&[0, 0, 0, 1]).await.unwrap();

		let stream = StreamConfig { include_audio: false, ..Default::default() };
		inner.spawn_media(generation, async move {
			Ok(MediaStream::with_source(video, None::<DuplexStream>, &stream, transport_rx, progress_tx, |shutdown| async move {
				shutdown.wait_shutdown_triggered().await;
				Ok(())
			}))
		});
		handle_media_event(inner, event_rx).await;

		(writer, finished)
	}

	/// Handle events until one from the media pipeline was handled.
	async fn handle_media_event(inner: &mut StreamerInner, event_rx: &mut mpsc::UnboundedReceiver<StreamerEvent>) {
		loop {
			let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv()).await.unwrap().unwrap();
			let media = matches!(event, StreamerEvent::MediaStarted { .. } | StreamerEvent::MediaFinished { .. });
			inner.handle_event(event).await;
			if media {
				return;
			}
		}
	}

	#[tokio::test]
	async fn pause_and_resume_playback() {
		let (mut inner, mut event_rx, mut gateway_rx) = with_stream().await;
		let (first, first_server) = transport(40).await;
		stream_ready(&mut inner, first).await;

		let (mut video, finished) = play(&mut inner, &mut event_rx).await;
		video.write_all(&frame(0x65)).await.unwrap();
		assert_eq!(received(&first_server).await, (0, 41));

		inner.pause_stream().await.unwrap();
		assert_eq!(gateway_rx.recv().await, Some(GatewayCommand::StreamDelete { stream_key: key() }));
		assert!(inner.transport_tx.borrow().is_none());
		assert!(inner.stream.is_none());

		// Frames are held while paused.
		video.write_all(&frame(0x41)).await.unwrap();
		assert!(nothing_received(&first_server).await);

		let (reply, resumed) = oneshot::channel();
		inner.resume_stream(reply).await;
		assert!(matches!(gateway_rx.recv().await, Some(GatewayCommand::StreamCreate { .. })));
		assert_eq!(gateway_rx.recv().await, Some(GatewayCommand::StreamSetPaused { stream_key: key(), paused: false }));

		let (second, second_server) = transport(50).await;
		stream_ready(&mut inner, second).await;
		resumed.await.unwrap().unwrap();

		// The next frame releases the held one on the new transport.
		video.write_all(&frame(0x41)).await.unwrap();
		assert_eq!(received(&second_server).await, (1, 51));
		assert!(nothing_received(&first_server).await);

		inner.stop_stream().await;
		assert_eq!(gateway_rx.recv().await, Some(GatewayCommand::StreamDelete { stream_key: key() }));
		assert!(inner.playback.is_none());
		assert_eq!(*inner.position_tx.borrow(), None);

		handle_media_event(&mut inner, &mut event_rx).await;
		assert!(finished.await.unwrap().is_ok());
	}

	#[tokio::test]
	async fn moved_stream_server_swaps_transport() {
		let (mut inner, mut event_rx, _gateway_rx) = with_stream().await;
		let (first, first_server) = transport(40).await;
		stream_ready(&mut inner, first).await;

		let (mut video, _finished) = play(&mut inner, &mut event_rx).await;
		video.write_all(&frame(0x65)).await.unwrap();
		assert_eq!(received(&first_server).await, (0, 41));

		// The same connection completed a new handshake with another server.
		let (second, second_server) = transport(60).await;
		stream_ready(&mut inner, second.clone()).await;
		assert!(inner.transport_tx.borrow().as_ref().is_some_and(|transport| Arc::ptr_eq(transport, &second)));

		video.write_all(&frame(0x41)).await.unwrap();
		assert_eq!(received(&second_server).await, (1, 61));
		assert!(nothing_received(&first_server).await);

		inner.stop_stream().await;
	}

	#[tokio::test]
	async fn finished_playback_ends_its_own_stream() {
		let (mut inner, mut event_rx, mut gateway_rx) = with_stream().await;
		let (first, _first_server) = transport(40).await;
		stream_ready(&mut inner, first).await;

		let (video, finished) = play(&mut inner, &mut event_rx).await;
		let generation = inner.playback.as_ref().unwrap().generation;

		// An older playback finishing late leaves the current one alone.
		let (reply, stale) = oneshot::channel();
		inner.start_replies.insert(generation - 1, reply);
		inner.handle_event(StreamerEvent::MediaFinished { generation: generation - 1, result: Ok(()) }).await;
		assert!(stale.await.unwrap().is_ok());
		assert!(inner.stream.is_some());
		assert!(inner.playback.is_some());
		assert!(gateway_rx.try_recv().is_err());

		// The pipeline ending on its own finishes the current playback, which ends the stream.
		drop(video);
		let playback = inner.playback.as_ref().unwrap();
		if let Some(media) = &playback.media {
			media.stop();
		}
		handle_media_event(&mut inner, &mut event_rx).await;
		assert!(finished.await.unwrap().is_ok());
		assert!(inner.stream.is_none());
		assert!(inner.playback.is_none());
		assert_eq!(*inner.position_tx.borrow(), None);
		assert_eq!(gateway_rx.recv().await, Some(GatewayCommand::StreamDelete { stream_key: key() }));
	}
}
