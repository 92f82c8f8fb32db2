// Playback devices
// A buffer-queue model: the sink uploads PCM into device buffers, queues them,
// and later unqueues the ones the device has finished playing.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, StreamError};

// ============================================================================
// Types
// ============================================================================

pub type BufferId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// Hardware queue of PCM buffers.
///
/// A playing device that runs out of queued audio moves to `Stopped` on its own;
/// calling `play` again resumes with whatever is queued by then.
pub trait PlaybackDevice: Send {
    fn generate_buffers(&mut self, count: usize) -> Result<Vec<BufferId>>;
    fn delete_buffers(&mut self, ids: &[BufferId]) -> Result<()>;
    /// Copy interleaved 16-bit LE PCM into a buffer that is not queued
    fn upload(&mut self, id: BufferId, pcm: &[u8], sample_rate: u32, channels: u16) -> Result<()>;
    fn queue(&mut self, ids: &[BufferId]) -> Result<()>;
    /// Number of queued buffers that have finished playing
    fn processed(&mut self) -> Result<usize>;
    /// Remove `count` processed buffers from the head of the queue
    fn unqueue(&mut self, count: usize) -> Result<Vec<BufferId>>;
    /// Remove every queued buffer; the device must be stopped
    fn unqueue_all(&mut self) -> Result<Vec<BufferId>>;
    fn queued(&self) -> usize;
    fn state(&mut self) -> DeviceState;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn set_gain(&mut self, gain: f32) -> Result<()>;
}

// ============================================================================
// Buffer Queue Core
// ============================================================================

/// State shared by every device implementation
#[derive(Debug)]
struct QueueCore {
    buffers: HashMap<BufferId, Vec<i16>>,
    queue: VecDeque<BufferId>,
    /// Leading entries of `queue` already played
    processed: usize,
    /// Samples consumed from `queue[processed]`
    offset: usize,
    state: DeviceState,
    gain: f32,
    next_id: BufferId,
    sample_rate: u32,
    channels: u16,
    played_samples: u64,
}

impl QueueCore {
    fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            buffers: HashMap::new(),
            queue: VecDeque::new(),
            processed: 0,
            offset: 0,
            state: DeviceState::Initial,
            gain: 1.0,
            next_id: 1,
            sample_rate,
            channels,
            played_samples: 0,
        }
    }

    fn generate(&mut self, count: usize) -> Vec<BufferId> {
        (0..count)
            .map(|_| {
                let id = self.next_id;
                self.next_id += 1;
                self.buffers.insert(id, Vec::new());
                id
            })
            .collect()
    }

    fn delete(&mut self, ids: &[BufferId]) -> Result<()> {
        if let Some(id) = ids.iter().find(|id| self.queue.contains(id)) {
            return Err(StreamError::Device(format!("buffer {} is still queued", id)));
        }
        for id in ids {
            self.buffers.remove(id);
        }
        Ok(())
    }

    fn upload(&mut self, id: BufferId, pcm: &[u8], sample_rate: u32, channels: u16) -> Result<()> {
        if self.queue.contains(&id) {
            return Err(StreamError::Device(format!("buffer {} is queued", id)));
        }
        let data = self
            .buffers
            .get_mut(&id)
            .ok_or_else(|| StreamError::Device(format!("unknown buffer {}", id)))?;
        data.clear();
        data.extend(
            pcm.chunks_exact(2)
                .map(|bytes| i16::from_le_bytes([bytes[0], bytes[1]])),
        );
        self.sample_rate = sample_rate;
        self.channels = channels;
        Ok(())
    }

    fn enqueue(&mut self, ids: &[BufferId]) -> Result<()> {
        if let Some(id) = ids.iter().find(|id| !self.buffers.contains_key(id)) {
            return Err(StreamError::Device(format!("unknown buffer {}", id)));
        }
        self.queue.extend(ids.iter().copied());
        Ok(())
    }

    fn unqueue(&mut self, count: usize) -> Result<Vec<BufferId>> {
        if count > self.processed {
            return Err(StreamError::Device(format!(
                "cannot unqueue {} buffers, {} processed",
                count, self.processed
            )));
        }
        self.processed -= count;
        Ok(self.queue.drain(..count).collect())
    }

    fn unqueue_all(&mut self) -> Result<Vec<BufferId>> {
        if matches!(self.state, DeviceState::Playing | DeviceState::Paused) {
            return Err(StreamError::Device("unqueue_all on a running device".into()));
        }
        self.processed = 0;
        self.offset = 0;
        Ok(self.queue.drain(..).collect())
    }

    /// Continues after the last processed buffer; a starved queue never replays
    fn play(&mut self) {
        self.state = DeviceState::Playing;
    }

    fn stop(&mut self) {
        self.state = DeviceState::Stopped;
        self.processed = self.queue.len();
        self.offset = 0;
    }

    fn samples_in(&self, duration: Duration) -> usize {
        let frames = duration.as_nanos() * self.sample_rate as u128 / 1_000_000_000;
        frames as usize * self.channels.max(1) as usize
    }

    /// Consume up to `count` samples, handing each to `sink`. Returns samples consumed.
    fn pull<F: FnMut(i16)>(&mut self, count: usize, mut sink: F) -> usize {
        if self.state != DeviceState::Playing {
            return 0;
        }
        let mut consumed = 0;
        while consumed < count {
            let Some(&id) = self.queue.get(self.processed) else {
                self.state = DeviceState::Stopped;
                break;
            };
            let data = self.buffers.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let take = (count - consumed).min(data.len() - self.offset.min(data.len()));
            for &sample in &data[self.offset..self.offset + take] {
                sink(sample);
            }
            consumed += take;
            self.offset += take;
            if self.offset >= data.len() {
                self.processed += 1;
                self.offset = 0;
            }
        }
        if self.state == DeviceState::Playing && self.processed == self.queue.len() {
            self.state = DeviceState::Stopped;
        }
        self.played_samples += consumed as u64;
        consumed
    }
}

// ============================================================================
// Null Device
// ============================================================================

/// Plays into nowhere at real-time pace, or only when told to (`manual`)
pub struct NullDevice {
    core: Arc<Mutex<QueueCore>>,
    /// `None` for a manually clocked device
    tick: Option<Instant>,
}

/// Inspect and drive a `NullDevice` from outside the sink
#[derive(Clone)]
pub struct NullDeviceHandle {
    core: Arc<Mutex<QueueCore>>,
}

impl NullDevice {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            core: Arc::new(Mutex::new(QueueCore::new(sample_rate, channels))),
            tick: Some(Instant::now()),
        }
    }

    /// A device that consumes audio only through `NullDeviceHandle::advance`
    pub fn manual(sample_rate: u32, channels: u16) -> Self {
        Self {
            core: Arc::new(Mutex::new(QueueCore::new(sample_rate, channels))),
            tick: None,
        }
    }

    pub fn handle(&self) -> NullDeviceHandle {
        NullDeviceHandle {
            core: Arc::clone(&self.core),
        }
    }

    fn advance_clock(&mut self) {
        let Some(tick) = self.tick else {
            return;
        };
        let mut core = self.core.lock();
        if core.state != DeviceState::Playing {
            self.tick = Some(Instant::now());
            return;
        }
        let rate = core.sample_rate.max(1) as u128;
        let frames = tick.elapsed().as_nanos() * rate / 1_000_000_000;
        if frames == 0 {
            return;
        }
        self.tick = Some(tick + Duration::from_nanos((frames * 1_000_000_000 / rate) as u64));
        let samples = frames as usize * core.channels.max(1) as usize;
        core.pull(samples, |_| {});
    }
}

impl NullDeviceHandle {
    /// Play `duration` worth of queued audio
    pub fn advance(&self, duration: Duration) -> usize {
        let mut core = self.core.lock();
        let samples = core.samples_in(duration);
        core.pull(samples, |_| {})
    }

    /// Like `advance`, returning the interleaved samples that were played
    pub fn capture(&self, duration: Duration) -> Vec<i16> {
        let mut core = self.core.lock();
        let samples = core.samples_in(duration);
        let mut played = Vec::with_capacity(samples);
        core.pull(samples, |sample| played.push(sample));
        played
    }

    pub fn state(&self) -> DeviceState {
        self.core.lock().state
    }

    pub fn queued(&self) -> usize {
        self.core.lock().queue.len()
    }

    pub fn gain(&self) -> f32 {
        self.core.lock().gain
    }

    /// Interleaved samples consumed since creation
    pub fn played_samples(&self) -> u64 {
        self.core.lock().played_samples
    }

    /// Buffers that currently exist on the device
    pub fn allocated_buffers(&self) -> usize {
        self.core.lock().buffers.len()
    }
}

impl PlaybackDevice for NullDevice {
    fn generate_buffers(&mut self, count: usize) -> Result<Vec<BufferId>> {
        Ok(self.core.lock().generate(count))
    }

    fn delete_buffers(&mut self, ids: &[BufferId]) -> Result<()> {
        self.core.lock().delete(ids)
    }

    fn upload(&mut self, id: BufferId, pcm: &[u8], sample_rate: u32, channels: u16) -> Result<()> {
        self.core.lock().upload(id, pcm, sample_rate, channels)
    }

    fn queue(&mut self, ids: &[BufferId]) -> Result<()> {
        self.core.lock().enqueue(ids)
    }

    fn processed(&mut self) -> Result<usize> {
        self.advance_clock();
        Ok(self.core.lock().processed)
    }

    fn unqueue(&mut self, count: usize) -> Result<Vec<BufferId>> {
        self.core.lock().unqueue(count)
    }

    fn unqueue_all(&mut self) -> Result<Vec<BufferId>> {
        self.core.lock().unqueue_all()
    }

    fn queued(&self) -> usize {
        self.core.lock().queue.len()
    }

    fn state(&mut self) -> DeviceState {
        self.advance_clock();
        self.core.lock().state
    }

    fn play(&mut self) -> Result<()> {
        self.advance_clock();
        self.core.lock().play();
        if self.tick.is_some() {
            self.tick = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.advance_clock();
        let mut core = self.core.lock();
        if core.state == DeviceState::Playing {
            core.state = DeviceState::Paused;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.core.lock().stop();
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) -> Result<()> {
        self.core.lock().gain = gain.clamp(0.0, 1.0);
        Ok(())
    }
}

// ============================================================================
// cpal Device
// ============================================================================

#[cfg(feature = "audio")]
pub use self::cpal_device::CpalDevice;

#[cfg(feature = "audio")]
mod cpal_device {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream, StreamConfig};
    use std::sync::mpsc;
    use std::thread;

    /// Default output device driven by cpal.
    ///
    /// `cpal::Stream` is not Send, so it lives on its own thread for the lifetime of
    /// the device; the audio callback pulls from the shared queue.
    pub struct CpalDevice {
        core: Arc<Mutex<QueueCore>>,
        shutdown: Option<mpsc::Sender<()>>,
        owner: Option<thread::JoinHandle<()>>,
    }

    impl CpalDevice {
        pub fn open_default(sample_rate: u32, channels: u16) -> Result<Self> {
            let core = Arc::new(Mutex::new(QueueCore::new(sample_rate, channels)));
            let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

            let stream_core = Arc::clone(&core);
            let owner = thread::Builder::new()
                .name("mkstream-cpal".into())
                .spawn(move || {
                    let stream = match build_stream(stream_core, sample_rate, channels) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(StreamError::Device(format!(
                            "failed to start stream: {}",
                            e
                        ))));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until the device is dropped
                    let _ = shutdown_rx.recv();
                    drop(stream);
                })
                .map_err(StreamError::Io)?;

            ready_rx
                .recv()
                .map_err(|_| StreamError::Device("audio thread exited during setup".into()))??;

            tracing::info!("Opened cpal output at {}Hz/{}ch", sample_rate, channels);
            Ok(Self {
                core,
                shutdown: Some(shutdown_tx),
                owner: Some(owner),
            })
        }
    }

    fn build_stream(core: Arc<Mutex<QueueCore>>, sample_rate: u32, channels: u16) -> Result<Stream> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| StreamError::Device("no default output device".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| StreamError::Device(format!("failed to get output config: {}", e)))?;

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let err_fn = |err| tracing::error!("Audio stream error: {}", err);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let wanted = data.len();
                    let mut core = core.lock();
                    let gain = core.gain;
                    let mut out = data.iter_mut();
                    core.pull(wanted, |sample| {
                        if let Some(slot) = out.next() {
                            *slot = sample as f32 / 32768.0 * gain;
                        }
                    });
                    for slot in out {
                        *slot = 0.0;
                    }
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let wanted = data.len();
                    let mut core = core.lock();
                    let gain = core.gain;
                    let mut out = data.iter_mut();
                    core.pull(wanted, |sample| {
                        if let Some(slot) = out.next() {
                            *slot = (sample as f32 * gain) as i16;
                        }
                    });
                    for slot in out {
                        *slot = 0;
                    }
                },
                err_fn,
                None,
            ),
            other => {
                return Err(StreamError::Device(format!(
                    "unsupported sample format {:?}",
                    other
                )))
            }
        };

        stream.map_err(|e| StreamError::Device(format!("failed to build stream: {}", e)))
    }

    impl PlaybackDevice for CpalDevice {
        fn generate_buffers(&mut self, count: usize) -> Result<Vec<BufferId>> {
            Ok(self.core.lock().generate(count))
        }

        fn delete_buffers(&mut self, ids: &[BufferId]) -> Result<()> {
            self.core.lock().delete(ids)
        }

        fn upload(&mut self, id: BufferId, pcm: &[u8], sample_rate: u32, channels: u16) -> Result<()> {
            self.core.lock().upload(id, pcm, sample_rate, channels)
        }

        fn queue(&mut self, ids: &[BufferId]) -> Result<()> {
            self.core.lock().enqueue(ids)
        }

        fn processed(&mut self) -> Result<usize> {
            Ok(self.core.lock().processed)
        }

        fn unqueue(&mut self, count: usize) -> Result<Vec<BufferId>> {
            self.core.lock().unqueue(count)
        }

        fn unqueue_all(&mut self) -> Result<Vec<BufferId>> {
            self.core.lock().unqueue_all()
        }

        fn queued(&self) -> usize {
            self.core.lock().queue.len()
        }

        fn state(&mut self) -> DeviceState {
            self.core.lock().state
        }

        fn play(&mut self) -> Result<()> {
            self.core.lock().play();
            Ok(())
        }

        fn pause(&mut self) -> Result<()> {
            let mut core = self.core.lock();
            if core.state == DeviceState::Playing {
                core.state = DeviceState::Paused;
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.core.lock().stop();
            Ok(())
        }

        fn set_gain(&mut self, gain: f32) -> Result<()> {
            self.core.lock().gain = gain.clamp(0.0, 1.0);
            Ok(())
        }
    }

    impl Drop for CpalDevice {
        fn drop(&mut self) {
            self.shutdown.take();
            if let Some(owner) = self.owner.take() {
                let _ = owner.join();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
