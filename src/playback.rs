// src/playback.rs

use crate::canvas::fit_to_canvas;
use crate::config::CanvasSize;
use crate::error::{Result, VqError};
use crate::source::{Frame, FrameSource};
use image::RgbImage;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One reference/distorted pair, both already fitted to the canvas.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub sequence: u64,
    pub reference: RgbImage,
    pub distorted: RgbImage,
}

/// Receives frame pairs from the playback worker.
///
/// `present` is called on the worker thread and must not block: a sink that
/// cannot keep up drops stale pairs instead of queueing them.
pub trait PresentationSink: Send + Sync {
    fn present(&self, pair: FramePair);

    /// Both streams were rewound after one of them ran out; playback is paused.
    fn playback_ended(&self) {}
}

/// Discards everything. Valid for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PresentationSink for NullSink {
    fn present(&self, _pair: FramePair) {}
}

/// Single-slot handoff holding only the newest undelivered pair.
#[derive(Debug, Default)]
pub struct LatestFrameSlot {
    slot: Mutex<Option<FramePair>>,
    ended: AtomicBool,
    overwritten: AtomicU64,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the pending pair, leaving the slot empty.
    pub fn take(&self) -> Option<FramePair> {
        lock(&self.slot).take()
    }

    /// Returns and clears the end-of-stream notification.
    pub fn take_ended(&self) -> bool {
        self.ended.swap(false, Ordering::SeqCst)
    }

    /// Pairs replaced before anyone took them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl PresentationSink for LatestFrameSlot {
    fn present(&self, pair: FramePair) {
        if lock(&self.slot).replace(pair).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn playback_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    pub canvas: CanvasSize,
    pub autoplay: bool,
    /// Used for the worker thread name and log lines.
    pub label: String,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            canvas: CanvasSize::default(),
            autoplay: false,
            label: "playback".to_string(),
        }
    }
}

struct SourcePair {
    reference: Box<dyn FrameSource>,
    distorted: Box<dyn FrameSource>,
}

impl SourcePair {
    fn read(&mut self) -> Result<Option<(Frame, Frame)>> {
        let Some(reference) = self.reference.next_frame()? else {
            return Ok(None);
        };
        let Some(distorted) = self.distorted.next_frame()? else {
            return Ok(None);
        };
        Ok(Some((reference, distorted)))
    }

    fn rewind(&mut self) -> Result<()> {
        self.reference.rewind()?;
        self.distorted.rewind()
    }

    fn close(&mut self) {
        self.reference.close();
        self.distorted.close();
    }
}

struct Control {
    playing: bool,
    stop: bool,
    /// Rewind requested by the control context, applied by the worker.
    restart: bool,
}

/// State shared with the worker. Only the worker touches `sources` while it
/// runs, so the control context never waits on a decoder.
struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    sources: Mutex<SourcePair>,
    positions: [AtomicU64; 2],
    presented: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set_playing(&self, playing: bool) {
        lock(&self.control).playing = playing;
        self.wake.notify_all();
    }

    fn publish_positions(&self, sources: &SourcePair) {
        self.positions[0].store(sources.reference.position(), Ordering::Release);
        self.positions[1].store(sources.distorted.position(), Ordering::Release);
    }

    fn record_failure(&self, e: &VqError) {
        *lock(&self.last_error) = Some(e.to_string());
    }
}

enum Step {
    Frames(Frame, Frame),
    Ended,
    Failed(VqError),
}

/// Plays two sources in lock-step at the slower of their two frame rates.
///
/// Owns one background thread for its whole life. Build one per trial and
/// call [`Synchronizer::stop`] before opening the next trial's sources.
pub struct Synchronizer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    shared_rate: f64,
    label: String,
}

impl Synchronizer {
    pub fn start(
        reference: Box<dyn FrameSource>,
        distorted: Box<dyn FrameSource>,
        sink: Arc<dyn PresentationSink>,
        options: PlaybackOptions,
    ) -> Result<Self> {
        let shared_rate = reference.frame_rate().min(distorted.frame_rate());
        let interval = Duration::from_secs_f64(1.0 / shared_rate);
        info!(
            "Starting playback '{}': {} @ {:.3} fps vs {} @ {:.3} fps, shared rate {:.3} fps",
            options.label,
            reference.path().display(),
            reference.frame_rate(),
            distorted.path().display(),
            distorted.frame_rate(),
            shared_rate
        );

        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                playing: options.autoplay,
                stop: false,
                restart: false,
            }),
            wake: Condvar::new(),
            positions: [
                AtomicU64::new(reference.position()),
                AtomicU64::new(distorted.position()),
            ],
            sources: Mutex::new(SourcePair { reference, distorted }),
            presented: AtomicU64::new(0),
            last_error: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let canvas = options.canvas;
        let spawned = thread::Builder::new()
            .name(format!("playback-{}", options.label))
            .spawn(move || playback_loop(worker_shared, sink, canvas, interval));
        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                lock(&shared.sources).close();
                return Err(VqError::Playback(format!("failed to spawn playback thread: {}", e)));
            }
        };

        Ok(Self {
            shared,
            worker: Some(worker),
            shared_rate,
            label: options.label,
        })
    }

    pub fn shared_rate(&self) -> f64 {
        self.shared_rate
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.shared_rate)
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.shared.control).playing
    }

    pub fn play(&self) {
        self.shared.set_playing(true);
    }

    pub fn pause(&self) {
        self.shared.set_playing(false);
    }

    /// Flips play/pause and returns whether playback is now running.
    pub fn toggle(&self) -> bool {
        let playing = {
            let mut control = lock(&self.shared.control);
            control.playing = !control.playing;
            control.playing
        };
        self.shared.wake.notify_all();
        playing
    }

    /// Asks the worker to rewind both streams to their first frame, keeping
    /// the play state. Returns without waiting for the rewind; a failed rewind
    /// shows up in [`Synchronizer::last_error`].
    pub fn restart(&self) -> Result<()> {
        debug!("Restarting playback '{}'", self.label);
        {
            let mut control = lock(&self.shared.control);
            if control.stop {
                return Err(VqError::Playback(format!("playback '{}' has stopped", self.label)));
            }
            control.restart = true;
        }
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Read positions of the reference and distorted streams, as last
    /// published by the worker.
    pub fn positions(&self) -> (u64, u64) {
        (
            self.shared.positions[0].load(Ordering::Acquire),
            self.shared.positions[1].load(Ordering::Acquire),
        )
    }

    pub fn presented_frames(&self) -> u64 {
        self.shared.presented.load(Ordering::Relaxed)
    }

    /// Most recent decode failure seen by the worker, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Stops the worker, waits for it to exit, then closes both sources.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        {
            let mut control = lock(&self.shared.control);
            control.stop = true;
            control.playing = false;
        }
        self.shared.wake.notify_all();
        let joined = worker.join();
        lock(&self.shared.sources).close();
        info!(
            "Stopped playback '{}' after {} frame pairs",
            self.label,
            self.presented_frames()
        );
        joined.map_err(|_| VqError::Playback(format!("playback thread '{}' panicked", self.label)))
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("{}", e);
        }
    }
}

fn playback_loop(
    shared: Arc<Shared>,
    sink: Arc<dyn PresentationSink>,
    canvas: CanvasSize,
    interval: Duration,
) {
    let mut next_deadline: Option<Instant> = None;
    loop {
        let restart = {
            let mut control = lock(&shared.control);
            while !control.playing && !control.stop && !control.restart {
                next_deadline = None;
                control = shared.wake.wait(control).unwrap_or_else(PoisonError::into_inner);
            }
            if control.stop {
                break;
            }
            std::mem::take(&mut control.restart)
        };

        if restart {
            let mut sources = lock(&shared.sources);
            if let Err(e) = sources.rewind() {
                error!("Restart failed: {}", e);
                shared.record_failure(&e);
            }
            shared.publish_positions(&sources);
            next_deadline = None;
            continue;
        }

        let step = {
            let mut sources = lock(&shared.sources);
            let step = match sources.read() {
                Ok(Some((reference, distorted))) => Step::Frames(reference, distorted),
                Ok(None) => match sources.rewind() {
                    Ok(()) => Step::Ended,
                    Err(e) => Step::Failed(e),
                },
                Err(e) => {
                    if let Err(rewind_err) = sources.rewind() {
                        warn!("Rewind after decode failure also failed: {}", rewind_err);
                    }
                    Step::Failed(e)
                }
            };
            shared.publish_positions(&sources);
            step
        };

        match step {
            Step::Frames(reference, distorted) => {
                let pair = FramePair {
                    sequence: reference.index,
                    reference: fit_to_canvas(&reference.pixels, canvas),
                    distorted: fit_to_canvas(&distorted.pixels, canvas),
                };
                sink.present(pair);
                shared.presented.fetch_add(1, Ordering::Relaxed);
            }
            Step::Ended => {
                info!("End of stream reached, rewound to frame 0 and paused");
                shared.set_playing(false);
                sink.playback_ended();
                continue;
            }
            Step::Failed(e) => {
                error!("Playback decode failed: {}", e);
                shared.record_failure(&e);
                shared.set_playing(false);
                sink.playback_ended();
                continue;
            }
        }

        // Pace against a running deadline so per-frame overhead does not accumulate.
        let now = Instant::now();
        let deadline = match next_deadline {
            Some(d) if d + interval > now => d + interval,
            Some(_) => {
                debug!("Playback fell behind, resynchronising clock");
                now + interval
            }
            None => now + interval,
        };
        next_deadline = Some(deadline);

        let control = lock(&shared.control);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let _ = shared
            .wake
            .wait_timeout_while(control, remaining, |c| c.playing && !c.stop && !c.restart)
            .unwrap_or_else(PoisonError::into_inner);
    }
    debug!("Playback worker exiting");
}
