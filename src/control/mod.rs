use std::{net::{SocketAddr, ToSocketAddrs}, time::Duration};

use async_shutdown::ShutdownManager;
use futures::{SinkExt, StreamExt};
use tokio::{net::{TcpListener, TcpStream}, sync::{mpsc, watch}};
use tokio_tungstenite::tungstenite::{
	handshake::server::{ErrorResponse, Request as HandshakeRequest, Response},
	http::StatusCode,
	Message,
};

use crate::{config::{Config, MediaConfig}, error::StreamError, streamer::Streamer};

pub use self::message::{parse_timestamp, Ack, MediaType, ProgressLimiter, Request, StartRequest};

mod message;

const CONTROL_PATH: &str = "/stream";

/// Pause between stopping and starting again on a restart request.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// WebSocket server that lets a client start and control streams.
#[derive(Clone)]
pub struct ControlServer {
	config: Config,
	streamer: Streamer,
}

impl ControlServer {
	pub fn new(config: Config, streamer: Streamer, shutdown: ShutdownManager<i32>) -> Self {
		let server = Self { config, streamer };

		tokio::spawn({
			let server = server.clone();
			async move {
				let _ = shutdown.wrap_cancel(shutdown.wrap_trigger_shutdown(3, server.run())).await;
				tracing::debug!("Control server shutting down.");
			}
		});

		server
	}

	async fn run(self) -> Result<(), ()> {
		let address = (self.config.address.as_str(), self.config.control.port).to_socket_addrs()
			.map_err(|e| tracing::error!("Failed to resolve address {}:{}: {e}", self.config.address, self.config.control.port))?
			.next()
			.ok_or_else(|| tracing::error!("Failed to resolve address {}:{}", self.config.address, self.config.control.port))?;
		let listener = TcpListener::bind(address)
			.await
			.map_err(|e| tracing::error!("Failed to bind to address {address}: {e}"))?;

		tracing::info!("Control server listening on ws://{address}{CONTROL_PATH}");
		self.serve(listener).await
	}

	async fn serve(self, listener: TcpListener) -> Result<(), ()> {
		loop {
			let (connection, address) = listener.accept()
				.await
				.map_err(|e| tracing::error!("Failed to accept connection: {e}"))?;
			tracing::trace!("Accepted connection from {address}");

			tokio::spawn({
				let server = self.clone();
				async move {
					let _ = server.handle_connection(connection, address).await;
				}
			});
		}
	}

	async fn handle_connection(self, connection: TcpStream, address: SocketAddr) -> Result<(), ()> {
		let socket = tokio_tungstenite::accept_hdr_async(connection, check_path)
			.await
			.map_err(|e| tracing::debug!("Rejected control connection from {address}: {e}"))?;
		tracing::info!("Control client {address} connected.");

		let (mut write, mut read) = socket.split();
		let (ack_tx, mut ack_rx) = mpsc::channel::<Ack>(32);

		tokio::spawn(async move {
			while let Some(ack) = ack_rx.recv().await {
				let text = match serde_json::to_string(&ack) {
					Ok(text) => text,
					Err(e) => {
						tracing::error!("Failed to serialize acknowledgement: {e}");
						continue;
					},
				};

				if let Err(e) = write.send(Message::Text(text.into())).await {
					tracing::debug!("Failed to send acknowledgement to {address}: {e}");
					break;
				}
			}
		});

		let progress = tokio::spawn(report_progress(
			self.streamer.position(),
			ack_tx.clone(),
			Duration::from_millis(self.config.control.progress_interval_ms),
		));

		while let Some(message) = read.next().await {
			let text = match message {
				Ok(Message::Text(text)) => text,
				Ok(Message::Close(_)) => break,
				Ok(_) => continue,
				Err(e) => {
					tracing::debug!("Error on control connection from {address}: {e}");
					break;
				},
			};

			// Requests may take as long as playback does, so each one gets its own task.
			tokio::spawn({
				let streamer = self.streamer.clone();
				let media = self.config.media.clone();
				let ack_tx = ack_tx.clone();
				async move {
					let ack = match Request::parse(text.as_str()) {
						Ok(request) => handle_request(&streamer, &media, request).await,
						Err(e) => {
							tracing::warn!("Invalid control message: {e}");
							Ack::invalid_message()
						},
					};
					let _ = ack_tx.send(ack).await;
				}
			});
		}

		progress.abort();
		tracing::info!("Control client {address} disconnected.");
		Ok(())
	}
}

#[allow(clippy::result_large_err)]
fn check_path(request: &HandshakeRequest, response: Response) -> Result<Response, ErrorResponse> {
	if request.uri().path() == CONTROL_PATH {
		return Ok(response);
	}

	let mut error = ErrorResponse::new(Some(format!("no control channel at {}", request.uri().path())));
	*error.status_mut() = StatusCode::NOT_FOUND;
	Err(error)
}

async fn report_progress(
	mut position_rx: watch::Receiver<Option<Duration>>,
	ack_tx: mpsc::Sender<Ack>,
	interval: Duration,
) {
	let mut limiter = ProgressLimiter::new(interval);

	while position_rx.changed().await.is_ok() {
		let Some(position) = *position_rx.borrow_and_update() else {
			continue;
		};

		if limiter.should_send() && ack_tx.send(Ack::progress(position)).await.is_err() {
			break;
		}
	}
}

/// Run a request to completion and produce its acknowledgement.
pub async fn handle_request(streamer: &Streamer, media: &MediaConfig, request: Request) -> Ack {
	match request {
		Request::Start(request) => {
			let request = match validate_start(request, media) {
				Ok(request) => request,
				Err(e) => {
					tracing::warn!("Invalid start payload: {e}");
					return Ack::with_data("payload_error", false, "invalid_start_payload");
				},
			};

			Ack::new("start", start(streamer, request).await)
		},
		Request::Stop => {
			streamer.stop_stream().await;
			Ack::with_data("stop", true, "stop_succeeded")
		},
		Request::Pause => match streamer.pause_stream().await {
			Ok(()) => Ack::with_data("pause", true, "pause_succeeded"),
			Err(e) => {
				tracing::warn!("Failed to pause stream: {e}");
				Ack::with_data("pause", false, "pause_failed")
			},
		},
		Request::Resume => match streamer.resume_stream().await {
			Ok(()) => Ack::with_data("resume", true, "resume_succeeded"),
			Err(e) => {
				tracing::warn!("Failed to resume stream: {e}");
				Ack::with_data("resume", false, "resume_failed")
			},
		},
		Request::Restart(request) => {
			let request = match validate_start(request, media) {
				Ok(request) => request,
				Err(e) => {
					tracing::warn!("Invalid restart payload: {e}");
					return Ack::new("payload_error", false);
				},
			};

			streamer.stop_stream().await;
			tokio::time::sleep(RESTART_DELAY).await;
			Ack::new("restart", start(streamer, request).await)
		},
		Request::Leave => {
			streamer.stop_stream().await;
			streamer.leave_voice().await;
			Ack::with_data("leave", true, "leave_succeeded")
		},
	}
}

/// A start request with its file and offset resolved.
struct ValidStart {
	guild_id: String,
	channel_id: String,
	path: std::path::PathBuf,
	start_time: Duration,
}

fn validate_start(request: Result<StartRequest, String>, media: &MediaConfig) -> Result<ValidStart, StreamError> {
	let request = request.map_err(StreamError::Validation)?;

	Ok(ValidStart {
		path: request.resolve_path(media)?,
		start_time: request.start_time()?,
		guild_id: request.guild_id,
		channel_id: request.channel_id,
	})
}

/// Join and stream the file until it ends. Returns whether playback succeeded.
///
/// The streamer ends the stream itself when playback finishes, only a half created stream is cleaned up here.
async fn start(streamer: &Streamer, request: ValidStart) -> bool {
	let connected = async {
		streamer.join_voice(request.guild_id, request.channel_id).await?;
		streamer.create_stream().await
	}.await;

	let result = match connected {
		Ok(()) => streamer.start_stream(request.path, request.start_time).await,
		Err(e) => {
			streamer.stop_stream().await;
			Err(e)
		},
	};

	match result {
		Ok(()) => true,
		Err(e) => {
			tracing::error!("Failed to stream: {e}");
			false
		},
	}
}

#[cfg(test)]
mod tests {
	use tokio_tungstenite::tungstenite::Message;

	use crate::gateway::{GatewayCommand, GatewayEvent};

	use super::*;

	fn streamer() -> (Streamer, mpsc::Sender<GatewayEvent>, mpsc::Receiver<GatewayCommand>) {
		let (gateway_tx, gateway_rx) = mpsc::channel(10);
		let (event_tx, event_rx) = mpsc::channel(10);
		(Streamer::new(Config::default(), gateway_tx, event_rx), event_tx, gateway_rx)
	}

	fn start_payload(data: &str) -> Request {
		Request::parse(&format!(r#"{{"event":"start","data":{data}}}"#)).unwrap()
	}

	#[tokio::test]
	async fn simple_requests() {
		let (streamer, _event_tx, _gateway_rx) = streamer();
		let media = MediaConfig::default();

		assert_eq!(handle_request(&streamer, &media, Request::Stop).await, Ack::with_data("stop", true, "stop_succeeded"));
		assert_eq!(handle_request(&streamer, &media, Request::Stop).await, Ack::with_data("stop", true, "stop_succeeded"));
		assert_eq!(handle_request(&streamer, &media, Request::Pause).await, Ack::with_data("pause", false, "pause_failed"));
		assert_eq!(handle_request(&streamer, &media, Request::Resume).await, Ack::with_data("resume", false, "resume_failed"));
		assert_eq!(handle_request(&streamer, &media, Request::Leave).await, Ack::with_data("leave", true, "leave_succeeded"));
		assert_eq!(*streamer.position().borrow(), None);
	}

	#[tokio::test]
	async fn invalid_start_payloads() {
		let (streamer, _event_tx, mut gateway_rx) = streamer();
		let media = MediaConfig::default();

		let ack = handle_request(&streamer, &media, start_payload(r#"{"type":"movie"}"#)).await;
		assert_eq!(ack, Ack::with_data("payload_error", false, "invalid_start_payload"));

		let ack = handle_request(&streamer, &media, start_payload(
			r#"{"type":"movie","mediaPath":"a.mkv","channelId":"2","guildId":"1","startTime":"soon"}"#,
		)).await;
		assert_eq!(ack, Ack::with_data("payload_error", false, "invalid_start_payload"));

		let restart = Request::parse(r#"{"event":"restart","data":{"type":"movie","mediaPath":"../a.mkv","channelId":"2","guildId":"1"}}"#).unwrap();
		assert_eq!(handle_request(&streamer, &media, restart).await, Ack::new("payload_error", false));

		assert!(gateway_rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn start_fails_before_login() {
		let (streamer, _event_tx, _gateway_rx) = streamer();
		let request = start_payload(r#"{"type":"tvshow","mediaPath":"a.mkv","channelId":"2","guildId":"1"}"#);
		assert_eq!(handle_request(&streamer, &MediaConfig::default(), request).await, Ack::new("start", false));
	}

	#[tokio::test]
	async fn websocket_round_trip() {
		let (streamer, _event_tx, _gateway_rx) = streamer();
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();
		let server = ControlServer { config: Config::default(), streamer };
		tokio::spawn(server.serve(listener));

		assert!(tokio_tungstenite::connect_async(format!("ws://{address}/elsewhere")).await.is_err());

		let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{address}/stream")).await.unwrap();

		socket.send(Message::Text("{ not json".into())).await.unwrap();
		let Some(Ok(Message::Text(text))) = socket.next().await else {
			panic!("expected an acknowledgement");
		};
		let ack: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
		assert_eq!(ack, serde_json::json!({ "event": "payload_error", "succeeded": false, "data": "invalid_message" }));

		socket.send(Message::Text(r#"{"event":"stop"}"#.into())).await.unwrap();
		let Some(Ok(Message::Text(text))) = socket.next().await else {
			panic!("expected an acknowledgement");
		};
		let ack: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
		assert_eq!(ack, serde_json::json!({ "event": "stop", "succeeded": true, "data": "stop_succeeded" }));
	}
}
