use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time::Interval};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{config::GatewayConfig, error::StreamError};

use self::payload::{GatewayMessage, Hello};

pub use self::payload::{GatewayCommand, GatewayEvent, StreamKey};

mod payload;

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay between reconnects, doubling after every attempt that never got ready.
#[derive(Debug)]
struct Backoff {
	next: Duration,
}

impl Default for Backoff {
	fn default() -> Self {
		Self { next: INITIAL_BACKOFF }
	}
}

impl Backoff {
	fn next(&mut self) -> Duration {
		let delay = self.next;
		self.next = (self.next * 2).min(MAX_BACKOFF);
		delay
	}

	fn reset(&mut self) {
		self.next = INITIAL_BACKOFF;
	}
}

/// Client for the main gateway: forwards dispatch events and sends the streamer's commands.
pub struct GatewayClient {
	config: GatewayConfig,
	token: String,
	event_tx: mpsc::Sender<GatewayEvent>,

	/// Last sequence number received, echoed in heartbeats.
	sequence: Option<u64>,

	/// Whether the current connection received READY.
	ready: bool,
}

impl GatewayClient {
	pub fn new(config: GatewayConfig, token: String, event_tx: mpsc::Sender<GatewayEvent>) -> Self {
		Self { config, token, event_tx, sequence: None, ready: false }
	}

	/// Stay connected until the command channel closes, reconnecting with backoff.
	pub async fn run(mut self, mut command_rx: mpsc::Receiver<GatewayCommand>) {
		let mut backoff = Backoff::default();

		loop {
			tracing::info!("Connecting to gateway at {}.", self.config.url);

			match self.connect_and_run(&mut command_rx).await {
				Ok(()) => {
					tracing::debug!("Command channel closed, disconnecting from gateway.");
					break;
				},
				Err(e) => tracing::warn!("Gateway connection failed: {e}"),
			}

			// A session that got ready was healthy, so start over with a short delay.
			if std::mem::take(&mut self.ready) {
				backoff.reset();
			}
			self.sequence = None;

			let delay = backoff.next();
			tracing::info!("Reconnecting to gateway in {delay:?}.");
			tokio::time::sleep(delay).await;
		}
	}

	/// Returns `Ok` when the command channel closed, errors otherwise.
	async fn connect_and_run(&mut self, command_rx: &mut mpsc::Receiver<GatewayCommand>) -> Result<(), StreamError> {
		crate::tls::install_crypto_provider();
		let (mut socket, _response) = tokio_tungstenite::connect_async(self.config.url.as_str()).await
			.map_err(|e| StreamError::Protocol(format!("failed to connect to gateway: {e}")))?;
		tracing::debug!("Connected to gateway.");

		let mut heartbeat: Option<Interval> = None;

		loop {
			tokio::select! {
				message = socket.next() => {
					match message {
						Some(Ok(Message::Text(text))) => self.handle_message(text.as_str(), &mut socket, &mut heartbeat).await?,
						Some(Ok(Message::Close(frame))) => {
							return Err(StreamError::Protocol(format!("gateway closed the connection: {frame:?}")));
						},
						Some(Ok(_)) => {},
						Some(Err(e)) => return Err(StreamError::Protocol(format!("gateway websocket error: {e}"))),
						None => return Err(StreamError::Protocol("gateway closed the connection".to_string())),
					}
				},

				_ = next_heartbeat(&mut heartbeat) => {
					send_json(&mut socket, payload::heartbeat(self.sequence)).await?;
				},

				command = command_rx.recv(), if heartbeat.is_some() => {
					let Some(command) = command else {
						let _ = socket.close(None).await;
						return Ok(());
					};

					tracing::debug!("Sending gateway command {command:?}.");
					send_json(&mut socket, command.to_json()).await?;
				},
			}
		}
	}

	async fn handle_message(
		&mut self,
		text: &str,
		socket: &mut WebSocket,
		heartbeat: &mut Option<Interval>,
	) -> Result<(), StreamError> {
		let message: GatewayMessage = serde_json::from_str(text)
			.map_err(|e| StreamError::Protocol(format!("malformed gateway message: {e}")))?;

		if message.s.is_some() {
			self.sequence = message.s;
		}

		match message.op {
			payload::HELLO => {
				let hello: Hello = serde_json::from_value(message.d)
					.map_err(|e| StreamError::Protocol(format!("malformed gateway hello: {e}")))?;
				let period = Duration::from_millis(hello.heartbeat_interval);
				tracing::debug!("Sending gateway heartbeats every {period:?}.");
				*heartbeat = Some(tokio::time::interval_at(tokio::time::Instant::now() + period, period));

				send_json(socket, payload::identify(&self.token, self.config.intents)).await?;
			},
			payload::HEARTBEAT => send_json(socket, payload::heartbeat(self.sequence)).await?,
			payload::HEARTBEAT_ACK => tracing::trace!("Received gateway heartbeat acknowledgement."),
			payload::RECONNECT => return Err(StreamError::Protocol("gateway requested a reconnect".to_string())),
			payload::INVALID_SESSION => return Err(StreamError::Protocol("gateway invalidated the session".to_string())),
			payload::DISPATCH => {
				let Some(name) = message.t else {
					return Ok(());
				};

				match GatewayEvent::parse(&name, message.d) {
					Ok(Some(event)) => {
						if let GatewayEvent::Ready { user_id } = &event {
							tracing::info!("Logged in to gateway as {user_id}.");
							self.ready = true;
						}
						if self.event_tx.send(event).await.is_err() {
							tracing::debug!("Gateway event channel closed.");
						}
					},
					Ok(None) => tracing::trace!("Ignoring gateway event {name}."),
					Err(e) => tracing::warn!("Received malformed {name} event: {e}"),
				}
			},
			op => tracing::trace!("Ignoring gateway opcode {op}."),
		}

		Ok(())
	}
}

async fn send_json(socket: &mut WebSocket, message: serde_json::Value) -> Result<(), StreamError> {
	socket.send(Message::Text(message.to_string().into())).await
		.map_err(|e| StreamError::Protocol(format!("failed to send gateway message: {e}")))
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
	match heartbeat {
		Some(heartbeat) => { heartbeat.tick().await; },
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use tokio::net::TcpListener;

	use super::*;

	#[test]
	fn backoff_doubles_until_reset() {
		let mut backoff = Backoff::default();
		let delays: Vec<_> = (0..7).map(|_| backoff.next().as_secs()).collect();
		assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

		backoff.reset();
		assert_eq!(backoff.next(), INITIAL_BACKOFF);
	}

	#[tokio::test]
	async fn ready_session_is_marked() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let config = GatewayConfig {
			url: format!("ws://{}", listener.local_addr().unwrap()),
			..Default::default()
		};

		let server = tokio::spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
			socket.send(Message::Text(json!({ "op": 10, "d": { "heartbeat_interval": 45000 } }).to_string().into())).await.unwrap();

			let identify = socket.next().await.unwrap().unwrap();
			let identify: serde_json::Value = serde_json::from_str(identify.to_text().unwrap()).unwrap();
			assert_eq!(identify["op"], 2);
			assert_eq!(identify["d"]["token"], "secret");

			let ready = json!({ "op": 0, "t": "READY", "s": 1, "d": { "user": { "id": "42" } } });
			socket.send(Message::Text(ready.to_string().into())).await.unwrap();
			socket.close(None).await.unwrap();
		});

		let (event_tx, mut event_rx) = mpsc::channel(10);
		let (_command_tx, mut command_rx) = mpsc::channel(10);
		let mut client = GatewayClient::new(config, "secret".to_string(), event_tx);

		assert!(client.connect_and_run(&mut command_rx).await.is_err());
		assert!(client.ready);
		assert_eq!(client.sequence, Some(1));
		assert_eq!(event_rx.recv().await, Some(GatewayEvent::Ready { user_id: "42".to_string() }));

		server.await.unwrap();
	}
}
