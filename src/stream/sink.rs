use std::{collections::VecDeque, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use crate::error::StreamError;

enum PacedSinkCommand {
	Pause,
	Resume,
	SetInterval(Duration),
}

/// Releases frames downstream at a fixed real-time cadence.
///
/// Every tick takes at most one frame from the input and releases the oldest queued frame, unless
/// the sink is paused, in which case frames accumulate until it is resumed. Once the input is
/// exhausted the sink keeps ticking until its queue is drained.
#[derive(Clone)]
pub struct PacedSink {
	command_tx: mpsc::Sender<PacedSinkCommand>,
}

impl PacedSink {
	pub fn new(
		name: &'static str,
		interval: Duration,
		max_queued_frames: Option<usize>,
		input_rx: mpsc::Receiver<Vec<u8>>,
		output_tx: mpsc::Sender<Vec<u8>>,
		progress_tx: Option<mpsc::UnboundedSender<Duration>>,
	) -> (Self, JoinHandle<()>) {
		let (command_tx, command_rx) = mpsc::channel(10);
		let inner = PacedSinkInner {
			name,
			interval,
			max_queued_frames: max_queued_frames.map(|max| max.max(1)),
			queue: VecDeque::new(),
			paused: false,
			start: None,
			written: 0,
			output_tx,
			progress_tx,
		};
		let handle = tokio::spawn(inner.run(command_rx, input_rx));

		(Self { command_tx }, handle)
	}

	pub async fn pause(&self) -> Result<(), StreamError> {
		self.send(PacedSinkCommand::Pause).await
	}

	pub async fn resume(&self) -> Result<(), StreamError> {
		self.send(PacedSinkCommand::Resume).await
	}

	/// Change the cadence, for example when the framerate changes.
	pub async fn set_interval(&self, interval: Duration) -> Result<(), StreamError> {
		self.send(PacedSinkCommand::SetInterval(interval)).await
	}

	async fn send(&self, command: PacedSinkCommand) -> Result<(), StreamError> {
		self.command_tx.send(command).await
			.map_err(|_| StreamError::Closed("paced sink"))
	}
}

struct PacedSinkInner {
	name: &'static str,
	interval: Duration,
	max_queued_frames: Option<usize>,
	queue: VecDeque<Vec<u8>>,
	paused: bool,

	/// When the first tick of the current timing base happened.
	start: Option<Instant>,

	/// Number of ticks since `start`.
	written: u32,

	output_tx: mpsc::Sender<Vec<u8>>,
	progress_tx: Option<mpsc::UnboundedSender<Duration>>,
}

impl PacedSinkInner {
	async fn run(
		mut self,
		mut command_rx: mpsc::Receiver<PacedSinkCommand>,
		mut input_rx: mpsc::Receiver<Vec<u8>>,
	) {
		let mut input_closed = false;
		let mut next_tick: Option<Instant> = None;

		loop {
			if input_closed && self.queue.is_empty() && next_tick.is_none() {
				break;
			}

			let drain = input_closed && next_tick.is_none() && !self.paused && !self.queue.is_empty();

			tokio::select! {
				biased;

				command = command_rx.recv() => {
					match command {
						Some(PacedSinkCommand::Pause) => {
							tracing::debug!("Pausing {} sink with {} queued frames.", self.name, self.queue.len());
							self.paused = true;
						},
						Some(PacedSinkCommand::Resume) => {
							if self.paused {
								tracing::debug!("Resuming {} sink with {} queued frames.", self.name, self.queue.len());
								self.paused = false;
								self.reset_timing();
							}
						},
						Some(PacedSinkCommand::SetInterval(interval)) => {
							tracing::debug!("Changing {} sink interval to {interval:?}.", self.name);
							self.interval = interval;
							self.reset_timing();
						},
						None => {
							tracing::debug!("Command channel of {} sink closed.", self.name);
							break;
						},
					}
				},

				_ = tokio::time::sleep_until(next_tick.unwrap_or_else(Instant::now)), if next_tick.is_some() => {
					next_tick = None;
				},

				frame = input_rx.recv(), if next_tick.is_none() && !input_closed => {
					match frame {
						Some(frame) => {
							self.push(frame);
							match self.tick().await {
								Ok(deadline) => next_tick = Some(deadline),
								Err(()) => break,
							}
						},
						None => {
							tracing::debug!("Input of {} sink ended, draining {} queued frames.", self.name, self.queue.len());
							input_closed = true;
						},
					}
				},

				_ = std::future::ready(()), if drain => {
					match self.tick().await {
						Ok(deadline) => next_tick = Some(deadline),
						Err(()) => break,
					}
				},
			}
		}

		tracing::debug!("The {} sink stopped.", self.name);
	}

	fn push(&mut self, frame: Vec<u8>) {
		if let Some(max_queued_frames) = self.max_queued_frames {
			while self.queue.len() >= max_queued_frames {
				self.queue.pop_front();
				tracing::warn!("Dropping oldest frame from {} sink, more than {max_queued_frames} frames are queued.", self.name);
			}
		}

		self.queue.push_back(frame);
	}

	/// Release one frame if not paused, returns when the next tick is due.
	async fn tick(&mut self) -> Result<Instant, ()> {
		let start = *self.start.get_or_insert_with(Instant::now);

		if !self.paused {
			if let Some(frame) = self.queue.pop_front() {
				self.output_tx.send(frame).await
					.map_err(|_| tracing::debug!("Output of {} sink closed.", self.name))?;

				if let Some(progress_tx) = &self.progress_tx {
					let _ = progress_tx.send(self.interval);
				}
			}
		}

		self.written = self.written.saturating_add(1);
		Ok(start + self.interval * self.written)
	}

	fn reset_timing(&mut self) {
		self.start = None;
		self.written = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const INTERVAL: Duration = Duration::from_millis(20);

	fn sink(max_queued_frames: Option<usize>) -> (
		PacedSink,
		JoinHandle<()>,
		mpsc::Sender<Vec<u8>>,
		mpsc::Receiver<Vec<u8>>,
		mpsc::UnboundedReceiver<Duration>,
	) {
		let (input_tx, input_rx) = mpsc::channel(64);
		let (output_tx, output_rx) = mpsc::channel(64);
		let (progress_tx, progress_rx) = mpsc::unbounded_channel();
		let (sink, handle) = PacedSink::new("test", INTERVAL, max_queued_frames, input_rx, output_tx, Some(progress_tx));
		(sink, handle, input_tx, output_rx, progress_rx)
	}

	#[tokio::test(start_paused = true)]
	async fn releases_at_fixed_cadence() {
		let (_sink, handle, input_tx, mut output_rx, _progress_rx) = sink(None);
		for i in 0..5u8 {
			input_tx.send(vec![i]).await.unwrap();
		}
		drop(input_tx);

		let start = Instant::now();
		for i in 0..5u8 {
			assert_eq!(output_rx.recv().await, Some(vec![i]));
			let elapsed = start.elapsed();
			assert!(elapsed >= INTERVAL * u32::from(i), "frame {i} released after {elapsed:?}");
			assert!(elapsed < INTERVAL * u32::from(i) + Duration::from_millis(5), "frame {i} released after {elapsed:?}");
		}

		assert_eq!(output_rx.recv().await, None);
		handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn pause_retains_and_resume_drains_in_order() {
		let (sink, handle, input_tx, mut output_rx, mut progress_rx) = sink(None);
		for i in 0..6u8 {
			input_tx.send(vec![i]).await.unwrap();
		}
		drop(input_tx);

		for i in 0..3u8 {
			assert_eq!(output_rx.recv().await, Some(vec![i]));
		}

		sink.pause().await.unwrap();
		assert!(tokio::time::timeout(Duration::from_millis(500), output_rx.recv()).await.is_err());

		let mut reports = 0;
		while progress_rx.try_recv().is_ok() {
			reports += 1;
		}
		assert_eq!(reports, 3);

		sink.resume().await.unwrap();
		for i in 3..6u8 {
			assert_eq!(output_rx.recv().await, Some(vec![i]));
		}
		assert_eq!(output_rx.recv().await, None);
		handle.await.unwrap();

		while progress_rx.try_recv().is_ok() {
			reports += 1;
		}
		assert_eq!(reports, 6);
	}

	#[tokio::test(start_paused = true)]
	async fn drops_oldest_when_bounded() {
		let (sink, handle, input_tx, mut output_rx, _progress_rx) = sink(Some(2));
		sink.pause().await.unwrap();
		for i in 0..5u8 {
			input_tx.send(vec![i]).await.unwrap();
		}
		drop(input_tx);

		tokio::time::sleep(INTERVAL * 10).await;
		sink.resume().await.unwrap();

		assert_eq!(output_rx.recv().await, Some(vec![3]));
		assert_eq!(output_rx.recv().await, Some(vec![4]));
		assert_eq!(output_rx.recv().await, None);
		handle.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn set_interval_changes_cadence() {
		let (sink, _handle, input_tx, mut output_rx, _progress_rx) = sink(None);
		sink.set_interval(Duration::from_millis(50)).await.unwrap();
		for i in 0..3u8 {
			input_tx.send(vec![i]).await.unwrap();
		}

		let start = Instant::now();
		for i in 0..3u32 {
			output_rx.recv().await.unwrap();
			assert!(start.elapsed() >= Duration::from_millis(50) * i);
		}
		assert!(start.elapsed() < Duration::from_millis(105));
	}
}
