use std::{future::Future, path::{Path, PathBuf}, process::{ExitStatus, Stdio}, time::Duration};

use tokio::{net::{UnixListener, UnixStream}, process::{Child, Command}};

use crate::{config::{StreamConfig, TranscoderConfig}, error::StreamError};

/// Exit code ffmpeg uses when it is interrupted.
const INTERRUPTED_EXIT_CODE: i32 = 255;

/// Raw outputs of a running transcoder.
pub struct TranscoderOutputs {
	/// Annex-B H.264 with an access unit delimiter in front of every frame.
	pub video: UnixStream,

	/// 48kHz stereo s16le PCM, if audio was requested.
	pub audio: Option<UnixStream>,
}

/// An ffmpeg process that decodes a media file and re-encodes it for streaming.
pub struct Transcoder {
	child: Child,
	_sockets: SocketPaths,
}

/// Socket files that are removed again when dropped.
struct SocketPaths(Vec<PathBuf>);

impl Drop for SocketPaths {
	fn drop(&mut self) {
		for socket in &self.0 {
			let _ = std::fs::remove_file(socket);
		}
	}
}

impl Transcoder {
	pub async fn spawn(
		config: &TranscoderConfig,
		stream: &StreamConfig,
		input: &Path,
		start_time: Duration,
	) -> Result<(Self, TranscoderOutputs), StreamError> {
		let id = uuid::Uuid::new_v4();
		let video_path = std::env::temp_dir().join(format!("stagecast-{id}-video.sock"));
		let audio_path = std::env::temp_dir().join(format!("stagecast-{id}-audio.sock"));

		let mut sockets = SocketPaths(vec![video_path.clone()]);
		let video_listener = UnixListener::bind(&video_path)?;
		let audio_listener = if stream.include_audio {
			sockets.0.push(audio_path.clone());
			Some(UnixListener::bind(&audio_path)?)
		} else {
			None
		};

		let audio_path = stream.include_audio.then_some(audio_path.as_path());
		let arguments = arguments(config, stream, input, start_time, &video_path, audio_path)?;
		let program = shellexpand::full(&config.ffmpeg)
			.map(|program| program.into_owned())
			.unwrap_or_else(|_| config.ffmpeg.clone());

		tracing::debug!("Running transcoder: {program} {arguments:?}");
		let child = Command::new(&program)
			.args(&arguments)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| StreamError::UpstreamMedia(format!("failed to start {program}: {e}")))?;

		let mut transcoder = Self { child, _sockets: sockets };

		let video = transcoder.accept(&video_listener).await?;
		let audio = match &audio_listener {
			Some(listener) => Some(transcoder.accept(listener).await?),
			None => None,
		};

		tracing::info!("Transcoding {}.", input.display());
		Ok((transcoder, TranscoderOutputs { video, audio }))
	}

	/// Wait for an output connection, or fail if the transcoder exits first.
	async fn accept(&mut self, listener: &UnixListener) -> Result<UnixStream, StreamError> {
		tokio::select! {
			connection = listener.accept() => Ok(connection?.0),
			status = self.child.wait() => {
				let status = status?;
				Err(StreamError::UpstreamMedia(format!("transcoder exited before producing output ({status})")))
			},
		}
	}

	/// Wait for the transcoder to finish, or kill it when `stop` resolves.
	///
	/// A transcoder that was killed or interrupted is not an error.
	pub async fn wait<F: Future>(mut self, stop: F) -> Result<(), StreamError> {
		tokio::select! {
			status = self.child.wait() => check_exit_status(status?),
			_ = stop => {
				tracing::debug!("Stopping transcoder.");
				if let Err(e) = self.child.kill().await {
					tracing::warn!("Failed to kill transcoder: {e}");
				}
				Ok(())
			},
		}
	}
}

fn check_exit_status(status: ExitStatus) -> Result<(), StreamError> {
	if status.success() || status.code() == Some(INTERRUPTED_EXIT_CODE) {
		tracing::debug!("Transcoder finished ({status}).");
		Ok(())
	} else {
		Err(StreamError::UpstreamMedia(format!("transcoder exited with {status}")))
	}
}

fn arguments(
	config: &TranscoderConfig,
	stream: &StreamConfig,
	input: &Path,
	start_time: Duration,
	video_path: &Path,
	audio_path: Option<&Path>,
) -> Result<Vec<String>, StreamError> {
	let mut arguments: Vec<String> = ["-loglevel", "0", "-fflags", "nobuffer", "-analyzeduration", "0"]
		.iter()
		.map(|argument| argument.to_string())
		.collect();

	if stream.hardware_acceleration {
		arguments.extend(["-hwaccel".to_string(), "auto".to_string()]);
	}

	let extra = shlex::split(&config.extra_input_args)
		.ok_or_else(|| StreamError::Validation(format!("invalid transcoder arguments: {}", config.extra_input_args)))?;
	arguments.extend(extra);

	if !start_time.is_zero() {
		arguments.extend(["-ss".to_string(), format!("{:.3}", start_time.as_secs_f64())]);
	}
	arguments.extend(["-i".to_string(), input.to_string_lossy().into_owned()]);

	let fps = stream.fps.max(1).to_string();
	let bitrate = format!("{}k", stream.max_bitrate_kbps);
	arguments.extend([
		"-an", "-c:v", "libx264",
		"-tune", "zerolatency",
		"-pix_fmt", "yuv420p",
		"-profile:v", "baseline",
		"-preset", "ultrafast",
		"-bsf:v", "h264_metadata=aud=insert",
	].iter().map(|argument| argument.to_string()));
	arguments.extend([
		"-g".to_string(), fps.clone(),
		"-x264-params".to_string(), format!("keyint={fps}:min-keyint={fps}"),
		"-r".to_string(), fps,
		"-vf".to_string(), format!("scale={}:{}", stream.width, stream.height),
		"-b:v".to_string(), bitrate.clone(),
		"-maxrate".to_string(), bitrate.clone(),
		"-bufsize".to_string(), bitrate,
		"-f".to_string(), "h264".to_string(),
		format!("unix:{}", video_path.display()),
	]);

	if let Some(audio_path) = audio_path {
		arguments.extend([
			"-vn", "-ac", "2", "-ar", "48000", "-f", "s16le",
		].iter().map(|argument| argument.to_string()));
		arguments.push(format!("unix:{}", audio_path.display()));
	}

	Ok(arguments)
}
