//! # Playback Sink
//!
//! Moves decoded packets from the [`PcmQueue`] into a fixed set of device buffers.
//!
//! The feeder thread wakes every `feed_interval`, reclaims buffers the device has
//! finished, refills them from the queue and restarts the device if it starved while
//! playback is wanted. A seek calls [`PlaybackSink::clear_buffer`], which empties both
//! queues without touching the play/pause intent.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::audio::{BufferId, DeviceState, PlaybackDevice};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::pcm_queue::{PcmPacket, PcmQueue};

/// Reported from the feeder thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// Production ended and the device played everything
    Drained,
    Failed(String),
}

pub type SinkEventFn = Box<dyn Fn(SinkEvent) + Send + Sync>;

/// What one feed pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub reclaimed: usize,
    pub uploaded: usize,
    pub restarted: bool,
    pub drained: bool,
}

struct SinkShared {
    device: Mutex<Box<dyn PlaybackDevice>>,
    queue: Arc<PcmQueue>,
    buffers: Vec<BufferId>,
    /// Device buffers not currently queued on the device
    free: Mutex<Vec<BufferId>>,
    sample_rate: u32,
    channels: u16,
    feed_interval: Duration,
    /// Play/pause intent, survives flushes
    playing: AtomicBool,
    drained_reported: AtomicBool,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

pub struct PlaybackSink {
    shared: Arc<SinkShared>,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackSink {
    pub fn new(
        mut device: Box<dyn PlaybackDevice>,
        queue: Arc<PcmQueue>,
        config: &SessionConfig,
    ) -> Result<Self> {
        let buffers = device.generate_buffers(config.hardware_buffers)?;
        device.set_gain(config.volume)?;
        tracing::debug!("Sink created with {} device buffers", buffers.len());

        Ok(Self {
            shared: Arc::new(SinkShared {
                device: Mutex::new(device),
                queue,
                free: Mutex::new(buffers.iter().rev().copied().collect()),
                buffers,
                sample_rate: config.sample_rate,
                channels: config.channels,
                feed_interval: config.feed_interval(),
                playing: AtomicBool::new(true),
                drained_reported: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
            feeder: Mutex::new(None),
        })
    }

    pub fn queue(&self) -> &Arc<PcmQueue> {
        &self.shared.queue
    }

    /// Spawn the feeder thread: fill, start the device, then feed until disposed
    pub fn start(&self, events: SinkEventFn) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("mkstream-feeder".into())
            .spawn(move || shared.run(events))?;
        *self.feeder.lock() = Some(handle);
        Ok(())
    }

    /// Upload up to one packet per device buffer, then start the device
    pub fn fill(&self) -> Result<usize> {
        self.shared.fill()
    }

    pub fn feed_once(&self) -> Result<FeedReport> {
        self.shared.feed_once()
    }

    /// Stop the device, drop every queued buffer and packet, keep the play/pause intent
    pub fn clear_buffer(&self) -> Result<usize> {
        self.shared.clear_buffer()
    }

    pub fn pause(&self) -> Result<()> {
        self.shared.playing.store(false, Ordering::SeqCst);
        self.shared.device.lock().pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.shared.playing.store(true, Ordering::SeqCst);
        let mut device = self.shared.device.lock();
        match device.state() {
            DeviceState::Paused => device.play(),
            DeviceState::Initial | DeviceState::Stopped if device.queued() > 0 => device.play(),
            _ => Ok(()),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.shared.device.lock().set_gain(volume.clamp(0.0, 1.0))
    }

    pub fn device_state(&self) -> DeviceState {
        self.shared.device.lock().state()
    }

    /// Stop the feeder, return every pooled buffer, delete the device buffers
    pub fn dispose(&self) -> Result<()> {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.cancel.cancel();
        self.shared.queue.wake_all();
        if let Some(handle) = self.feeder.lock().take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("Feeder thread panicked");
            }
        }

        let mut device = self.shared.device.lock();
        device.stop()?;
        device.unqueue_all()?;
        self.shared.queue.flush();
        device.delete_buffers(&self.shared.buffers)?;
        self.shared.free.lock().clear();
        tracing::debug!("Sink disposed");
        Ok(())
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!("Sink dispose failed: {}", e);
        }
    }
}

impl SinkShared {
    fn run(&self, events: SinkEventFn) {
        if let Err(e) = self.fill() {
            tracing::error!("Initial fill failed: {}", e);
            events(SinkEvent::Failed(e.to_string()));
            return;
        }

        while !self.cancel.is_cancelled() {
            match self.feed_once() {
                Ok(report) => {
                    if report.drained {
                        events(SinkEvent::Drained);
                    }
                }
                Err(e) => {
                    tracing::error!("Feeding the device failed: {}", e);
                    events(SinkEvent::Failed(e.to_string()));
                    return;
                }
            }
            thread::park_timeout(self.feed_interval);
        }
        tracing::debug!("Feeder stopped");
    }

    fn fill(&self) -> Result<usize> {
        let wanted = self.free.lock().len();
        let mut uploaded = 0;
        while uploaded < wanted && !self.cancel.is_cancelled() {
            match self.queue.pop_blocking(self.feed_interval) {
                Some(packet) => {
                    if self.upload(packet)? {
                        uploaded += 1;
                    }
                }
                None if self.queue.is_end_of_stream() => break,
                None => continue,
            }
        }

        let mut device = self.device.lock();
        if self.playing.load(Ordering::SeqCst) && device.queued() > 0 {
            device.play()?;
        }
        tracing::info!("Prefilled {} device buffers", uploaded);
        Ok(uploaded)
    }

    fn feed_once(&self) -> Result<FeedReport> {
        let mut report = FeedReport::default();

        let free_count = {
            let mut device = self.device.lock();
            let processed = device.processed()?;
            if processed > 0 {
                let reclaimed = device.unqueue(processed)?;
                report.reclaimed = reclaimed.len();
                self.free.lock().extend(reclaimed);
            }
            self.free.lock().len()
        };

        let deadline = Instant::now() + self.feed_interval;
        for _ in 0..free_count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(packet) = self.queue.pop_blocking(remaining) else {
                break;
            };
            if self.upload(packet)? {
                report.uploaded += 1;
            }
        }

        let mut device = self.device.lock();
        let state = device.state();
        if self.playing.load(Ordering::SeqCst)
            && matches!(state, DeviceState::Initial | DeviceState::Stopped)
            && device.queued() > 0
        {
            tracing::debug!("Device starved, restarting with {} buffers", device.queued());
            device.play()?;
            report.restarted = true;
        }

        let all_played = device.queued() == 0
            || (state == DeviceState::Stopped && device.processed()? == device.queued());
        if all_played
            && self.queue.is_drained()
            && !self.drained_reported.swap(true, Ordering::SeqCst)
        {
            tracing::info!("Playback drained");
            report.drained = true;
        }
        Ok(report)
    }

    /// Returns false when the packet was stale or no buffer was free
    fn upload(&self, packet: PcmPacket) -> Result<bool> {
        let mut device = self.device.lock();
        // A flush may have run between pop and lock
        if packet.generation != self.queue.generation() {
            return Ok(false);
        }
        let Some(id) = self.free.lock().pop() else {
            return Ok(false);
        };
        let result = device
            .upload(id, packet.bytes(), self.sample_rate, self.channels)
            .and_then(|()| device.queue(&[id]));
        if let Err(e) = result {
            self.free.lock().push(id);
            return Err(e);
        }
        Ok(true)
    }

    fn clear_buffer(&self) -> Result<usize> {
        let mut device = self.device.lock();
        device.stop()?;
        device.unqueue_all()?;
        *self.free.lock() = self.buffers.iter().rev().copied().collect();
        let drained = self.queue.flush();
        self.drained_reported.store(false, Ordering::SeqCst);
        tracing::debug!(
            "Cleared device queue and {} packets, playing={}",
            drained,
            self.playing.load(Ordering::SeqCst)
        );
        Ok(drained)
    }
}
