use std::{collections::VecDeque, fmt, future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::{mpsc, oneshot, watch}, time::Interval};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{config::{ConnectionConfig, StreamConfig}, error::StreamError};

use self::{
	payload::{Hello, Identify, Ready, SessionDescription, VoiceMessage},
	state::{Action, ConnectionEvent, ConnectionState},
};

pub use self::udp::{Ssrcs, UdpTransport};

mod payload;
mod state;
mod udp;

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A websocket connection attempt, including the backoff before it.
type PendingConnect = Pin<Box<dyn Future<Output = Result<WebSocket, String>> + Send>>;

/// Close code used when the socket went away without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
	/// The voice channel connection.
	Voice,

	/// The screen share connection, which runs next to the voice connection.
	Stream,
}

impl ConnectionKind {
	fn speaking_flag(&self) -> u8 {
		match self {
			ConnectionKind::Voice => 1,
			ConnectionKind::Stream => 2,
		}
	}
}

impl fmt::Display for ConnectionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConnectionKind::Voice => write!(f, "voice"),
			ConnectionKind::Stream => write!(f, "stream"),
		}
	}
}

/// Who we are and where we are connecting to.
#[derive(Clone, Debug)]
pub struct ConnectionIdentity {
	pub guild_id: String,
	pub channel_id: String,
	pub user_id: String,
}

enum ConnectionCommand {
	SetSession(String),
	SetTokens { endpoint: String, token: String },
	SetServerId(String),
	SetSpeaking(bool),
	SetVideoStatus(bool),
	Stop(oneshot::Sender<()>),
}

/// Handle to a signaling connection with a media server.
#[derive(Clone)]
pub struct MediaConnection {
	kind: ConnectionKind,
	command_tx: mpsc::Sender<ConnectionCommand>,
	transport_rx: watch::Receiver<Option<Arc<UdpTransport>>>,
}

impl MediaConnection {
	/// Start a connection, the returned receiver resolves with the transport once the handshake completed.
	///
	/// Voice connections use the guild as server id, stream connections get theirs from the gateway.
	pub fn new(
		kind: ConnectionKind,
		identity: ConnectionIdentity,
		stream: StreamConfig,
		config: ConnectionConfig,
	) -> (Self, oneshot::Receiver<Arc<UdpTransport>>) {
		let (command_tx, command_rx) = mpsc::channel(10);
		let (ready_tx, ready_rx) = oneshot::channel();
		let (transport_tx, transport_rx) = watch::channel(None);

		let server_id = match kind {
			ConnectionKind::Voice => Some(identity.guild_id.clone()),
			ConnectionKind::Stream => None,
		};

		let inner = MediaConnectionInner {
			kind,
			identity,
			stream,
			config,
			server_id,
			session_id: None,
			endpoint: None,
			token: None,
			state: ConnectionState::default(),
			socket: None,
			connecting: None,
			heartbeat: None,
			transport: None,
			ready_tx: Some(ready_tx),
			transport_tx,
			pending_ready: None,
			pending_key: None,
			reconnect_attempts: 0,
		};
		tokio::spawn(inner.run(command_rx));

		(Self { kind, command_tx, transport_rx }, ready_rx)
	}

	pub fn kind(&self) -> ConnectionKind {
		self.kind
	}

	/// The transport of the most recent handshake.
	///
	/// Changes whenever the connection completes a new handshake, for example after the server moved.
	pub fn transports(&self) -> watch::Receiver<Option<Arc<UdpTransport>>> {
		self.transport_rx.clone()
	}

	pub async fn set_session(&self, session_id: String) -> Result<(), StreamError> {
		self.send(ConnectionCommand::SetSession(session_id)).await
	}

	pub async fn set_tokens(&self, endpoint: String, token: String) -> Result<(), StreamError> {
		self.send(ConnectionCommand::SetTokens { endpoint, token }).await
	}

	pub async fn set_server_id(&self, server_id: String) -> Result<(), StreamError> {
		self.send(ConnectionCommand::SetServerId(server_id)).await
	}

	pub async fn set_speaking(&self, speaking: bool) -> Result<(), StreamError> {
		self.send(ConnectionCommand::SetSpeaking(speaking)).await
	}

	pub async fn set_video_status(&self, enabled: bool) -> Result<(), StreamError> {
		self.send(ConnectionCommand::SetVideoStatus(enabled)).await
	}

	/// Close the connection. Stopping a connection that already stopped is not an error.
	pub async fn stop(&self) {
		tracing::debug!("Stopping {} connection.", self.kind);
		let (result_tx, result_rx) = oneshot::channel();
		if self.command_tx.send(ConnectionCommand::Stop(result_tx)).await.is_ok() {
			let _ = result_rx.await;
		}
	}

	async fn send(&self, command: ConnectionCommand) -> Result<(), StreamError> {
		self.command_tx.send(command).await
			.map_err(|_| StreamError::Closed("media connection"))
	}
}

struct MediaConnectionInner {
	kind: ConnectionKind,
	identity: ConnectionIdentity,
	stream: StreamConfig,
	config: ConnectionConfig,

	server_id: Option<String>,
	session_id: Option<String>,
	endpoint: Option<String>,
	token: Option<String>,

	state: ConnectionState,
	socket: Option<WebSocket>,
	connecting: Option<PendingConnect>,
	heartbeat: Option<Interval>,
	transport: Option<Arc<UdpTransport>>,
	ready_tx: Option<oneshot::Sender<Arc<UdpTransport>>>,
	transport_tx: watch::Sender<Option<Arc<UdpTransport>>>,

	pending_ready: Option<Ready>,
	pending_key: Option<Vec<u8>>,
	reconnect_attempts: u32,
}

impl MediaConnectionInner {
	async fn run(mut self, mut command_rx: mpsc::Receiver<ConnectionCommand>) {
		loop {
			tokio::select! {
				command = command_rx.recv() => {
					let Some(command) = command else {
						tracing::debug!("All handles to the {} connection are gone.", self.kind);
						self.apply(ConnectionEvent::Stop).await;
						break;
					};

					match command {
						ConnectionCommand::SetSession(session_id) => {
							self.session_id = Some(session_id);
							self.apply(ConnectionEvent::SessionReceived).await;
						},
						ConnectionCommand::SetTokens { endpoint, token } => {
							self.endpoint = Some(endpoint);
							self.token = Some(token);
							self.apply(ConnectionEvent::TokensReceived).await;
						},
						ConnectionCommand::SetServerId(server_id) => {
							self.server_id = Some(server_id);
						},
						ConnectionCommand::SetSpeaking(speaking) => {
							self.send_speaking(speaking).await;
						},
						ConnectionCommand::SetVideoStatus(enabled) => {
							self.send_video_status(enabled).await;
						},
						ConnectionCommand::Stop(result_tx) => {
							self.apply(ConnectionEvent::Stop).await;
							let _ = result_tx.send(());
							break;
						},
					}
				},

				result = next_connect(&mut self.connecting) => {
					self.connecting = None;
					let event = match result {
						Ok(socket) => {
							self.socket = Some(socket);
							ConnectionEvent::SocketOpened
						},
						Err(e) => {
							tracing::warn!("Failed to open {} connection: {e}", self.kind);
							ConnectionEvent::SocketClosed(ABNORMAL_CLOSURE)
						},
					};
					self.apply(event).await;
				},

				message = next_message(&mut self.socket) => {
					let event = match message {
						Some(Ok(message)) => self.handle_message(message),
						Some(Err(e)) => {
							tracing::warn!("Error on {} connection websocket: {e}", self.kind);
							Some(ConnectionEvent::SocketClosed(ABNORMAL_CLOSURE))
						},
						None => Some(ConnectionEvent::SocketClosed(ABNORMAL_CLOSURE)),
					};

					if let Some(event) = event {
						if let ConnectionEvent::SocketClosed(code) = event {
							tracing::info!("The {} connection websocket closed with code {code}.", self.kind);
							self.socket = None;
						}
						self.apply(event).await;
					}
				},

				_ = next_heartbeat(&mut self.heartbeat) => {
					let nonce = std::time::SystemTime::now()
						.duration_since(std::time::UNIX_EPOCH)
						.map(|duration| duration.as_millis() as u64)
						.unwrap_or_default();
					self.send_json(payload::heartbeat(nonce)).await;
				},
			}
		}

		tracing::info!("The {} connection stopped.", self.kind);
	}

	/// Feed an event through the state machine and perform the resulting actions.
	async fn apply(&mut self, event: ConnectionEvent) {
		let mut events = VecDeque::from([event]);
		while let Some(event) = events.pop_front() {
			let (state, actions) = state::transition(self.state, event);
			tracing::debug!("The {} connection received {event:?}, {:?} -> {state:?}.", self.kind, self.state);
			self.state = state;

			for action in actions {
				if let Some(event) = self.perform(action).await {
					events.push_back(event);
				}
			}
		}
	}

	async fn perform(&mut self, action: Action) -> Option<ConnectionEvent> {
		match action {
			Action::OpenSocket => return self.open_socket(),
			Action::CloseSocket => {
				self.connecting = None;
				if let Some(mut socket) = self.socket.take() {
					if let Err(e) = socket.close(None).await {
						tracing::debug!("Failed to close {} connection websocket: {e}", self.kind);
					}
				}
			},
			Action::SendIdentify => self.send_identify().await,
			Action::SendResume => {
				if let (Some(server_id), Some(session_id), Some(token)) = (&self.server_id, &self.session_id, &self.token) {
					let message = payload::resume(server_id, session_id, token);
					self.send_json(message).await;
				}
			},
			Action::StartHeartbeat(interval) => {
				let period = Duration::from_millis(interval);
				tracing::debug!("Sending heartbeats on {} connection every {period:?}.", self.kind);
				self.heartbeat = Some(tokio::time::interval_at(tokio::time::Instant::now() + period, period));
			},
			Action::StopHeartbeat => self.heartbeat = None,
			Action::Discover => {
				if let Err(e) = self.discover().await {
					tracing::error!("Failed to discover external address for {} connection: {e}", self.kind);
					return Some(ConnectionEvent::Stop);
				}
			},
			Action::InstallKey => {
				let result = match (&self.transport, self.pending_key.take()) {
					(Some(transport), Some(key)) => transport.install_key(&key),
					_ => Err(StreamError::MissingKeys),
				};

				if let Err(e) = result {
					tracing::error!("Failed to install secret key for {} connection: {e}", self.kind);
					return Some(ConnectionEvent::Stop);
				}
			},
			Action::MarkTransportReady => {
				self.reconnect_attempts = 0;
				if let Some(transport) = &self.transport {
					if let Err(e) = transport.set_ready(true) {
						tracing::error!("Failed to mark {} transport as ready: {e}", self.kind);
						return Some(ConnectionEvent::Stop);
					}
				}
			},
			Action::MarkTransportNotReady => {
				if let Some(transport) = &self.transport {
					transport.stop();
				}
			},
			Action::NotifyReady => {
				let Some(transport) = &self.transport else {
					return None;
				};

				match self.ready_tx.take() {
					Some(ready_tx) => {
						tracing::info!("The {} connection is ready.", self.kind);
						let _ = ready_tx.send(transport.clone());
					},
					None => tracing::info!("The {} connection completed a new handshake.", self.kind),
				}
				self.transport_tx.send_replace(Some(transport.clone()));
			},
			Action::StopTransport => {
				if let Some(transport) = &self.transport {
					transport.stop();
				}
				self.ready_tx = None;
			},
		}

		None
	}

	/// Start connecting the websocket, the result arrives in the run loop.
	fn open_socket(&mut self) -> Option<ConnectionEvent> {
		let endpoint = self.endpoint.clone()?;

		if self.reconnect_attempts > 0 && self.reconnect_attempts >= self.config.reconnect_attempts {
			tracing::error!("Giving up on {} connection after {} reconnect attempts.", self.kind, self.reconnect_attempts);
			return Some(ConnectionEvent::Stop);
		}

		let backoff = match self.reconnect_attempts {
			0 => Duration::ZERO,
			attempts => Duration::from_millis(self.config.reconnect_backoff_ms.saturating_mul(1 << (attempts - 1).min(6))),
		};
		self.reconnect_attempts += 1;

		let kind = self.kind;
		let url = format!("wss://{endpoint}/?v=7");
		let timeout = Duration::from_millis(self.config.connect_timeout_ms);
		let connect: PendingConnect = Box::pin(async move {
			if !backoff.is_zero() {
				tracing::debug!("Reconnecting {kind} connection in {backoff:?}.");
				tokio::time::sleep(backoff).await;
			}

			crate::tls::install_crypto_provider();
			tracing::debug!("Opening {kind} connection to {url}.");
			match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
				Ok(Ok((socket, _response))) => Ok(socket),
				Ok(Err(e)) => Err(format!("failed to connect to {url}: {e}")),
				Err(_) => Err(format!("timed out connecting to {url}")),
			}
		});
		self.connecting = Some(connect);

		None
	}

	fn handle_message(&mut self, message: Message) -> Option<ConnectionEvent> {
		let text = match message {
			Message::Text(text) => text,
			Message::Close(frame) => {
				let code = frame.map(|frame| u16::from(frame.code)).unwrap_or(ABNORMAL_CLOSURE);
				return Some(ConnectionEvent::SocketClosed(code));
			},
			_ => return None,
		};

		let message: VoiceMessage = match serde_json::from_str(text.as_str()) {
			Ok(message) => message,
			Err(e) => {
				tracing::warn!("Received malformed message on {} connection: {e}", self.kind);
				return None;
			},
		};

		match message.op {
			payload::HELLO => {
				let hello: Hello = self.parse(message.d)?;
				Some(ConnectionEvent::Hello(hello.heartbeat_interval as u64))
			},
			payload::READY => {
				self.pending_ready = Some(self.parse(message.d)?);
				Some(ConnectionEvent::Ready)
			},
			payload::SESSION_DESCRIPTION => {
				let description: SessionDescription = self.parse(message.d)?;
				if let Some(mode) = &description.mode {
					tracing::debug!("Media server selected encryption mode {mode}.");
				}
				self.pending_key = Some(description.secret_key);
				Some(ConnectionEvent::SessionDescription)
			},
			payload::RESUMED => Some(ConnectionEvent::Resumed),
			payload::HEARTBEAT_ACK => {
				tracing::trace!("Received heartbeat acknowledgement on {} connection.", self.kind);
				None
			},
			op if op >= 4000 => {
				tracing::error!("Received error opcode {op} on {} connection: {}", self.kind, message.d);
				None
			},
			op => {
				tracing::trace!("Ignoring opcode {op} on {} connection.", self.kind);
				None
			},
		}
	}

	fn parse<T: serde::de::DeserializeOwned>(&self, data: serde_json::Value) -> Option<T> {
		serde_json::from_value(data)
			.map_err(|e| tracing::warn!("Received malformed payload on {} connection: {e}", self.kind))
			.ok()
	}

	async fn send_identify(&mut self) {
		let (Some(server_id), Some(session_id), Some(token)) = (&self.server_id, &self.session_id, &self.token) else {
			tracing::error!("Can't identify {} connection without server id, session id and token.", self.kind);
			return;
		};

		let message = Identify {
			server_id,
			user_id: &self.identity.user_id,
			session_id,
			token,
		}.to_json();
		self.send_json(message).await;
	}

	async fn discover(&mut self) -> Result<(), StreamError> {
		let ready = self.pending_ready.take()
			.ok_or_else(|| StreamError::Protocol("no ready message to discover with".to_string()))?;

		if !ready.modes.is_empty() && !ready.modes.iter().any(|mode| mode == payload::ENCRYPTION_MODE) {
			return Err(StreamError::Protocol(format!("media server doesn't support {}", payload::ENCRYPTION_MODE)));
		}

		let remote: SocketAddr = format!("{}:{}", ready.ip, ready.port).parse()
			.map_err(|e| StreamError::Protocol(format!("invalid media server address {}:{}: {e}", ready.ip, ready.port)))?;

		let transport = UdpTransport::connect(remote, Ssrcs::from_audio(ready.ssrc)).await?;
		let external = transport.discover(Duration::from_millis(self.config.discovery_timeout_ms)).await?;
		self.transport = Some(Arc::new(transport));

		self.send_json(payload::select_protocol(external)).await;
		self.send_video_status(false).await;

		Ok(())
	}

	async fn send_speaking(&mut self, speaking: bool) {
		let Some(transport) = &self.transport else {
			tracing::warn!("Can't set speaking state on {} connection before the handshake.", self.kind);
			return;
		};

		let flag = if speaking { self.kind.speaking_flag() } else { 0 };
		let message = payload::speaking(flag, transport.ssrcs().audio);
		self.send_json(message).await;
	}

	async fn send_video_status(&mut self, enabled: bool) {
		let Some(transport) = &self.transport else {
			tracing::warn!("Can't set video state on {} connection before the handshake.", self.kind);
			return;
		};

		let message = payload::video(transport.ssrcs(), enabled, &self.stream);
		self.send_json(message).await;
	}

	async fn send_json(&mut self, message: serde_json::Value) {
		let Some(socket) = self.socket.as_mut() else {
			tracing::debug!("Not sending message on {} connection, the websocket is closed.", self.kind);
			return;
		};

		if let Err(e) = socket.send(Message::Text(message.to_string().into())).await {
			tracing::warn!("Failed to send message on {} connection: {e}", self.kind);
		}
	}
}

async fn next_message(socket: &mut Option<WebSocket>) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
	match socket {
		Some(socket) => socket.next().await,
		None => std::future::pending().await,
	}
}

async fn next_connect(connecting: &mut Option<PendingConnect>) -> Result<WebSocket, String> {
	match connecting {
		Some(connecting) => connecting.await,
		None => std::future::pending().await,
	}
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
	match heartbeat {
		Some(heartbeat) => { heartbeat.tick().await; },
		None => std::future::pending().await,
	}
}
