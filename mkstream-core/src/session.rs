//! # Streaming Session
//!
//! Wires the pipeline for one song:
//!
//! ```text
//! ByteRangeSource ─► MatroskaDemuxer ─► FrameDecoder ─► PcmQueue ─► PlaybackSink ─► device
//!                    └────────── producer thread ──────────┘          └─ feeder thread ─┘
//! ```
//!
//! The producer walks clusters from the current seek target. A seek records the new
//! target, flushes the sink and cancels the running walk; the producer notices the
//! cancelled inner token and starts over. Disposing cancels the outer token, which
//! ends both threads.

use parking_lot::Mutex;
use std::io::{Read, Seek};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;

use crate::audio::PlaybackDevice;
use crate::config::SessionConfig;
use crate::decode::{decoder_for, FrameDecoder};
use crate::error::{Result, StreamError};
use crate::mkv::{AudioTrackDescriptor, MatroskaDemuxer, MkvInfo, SeekControl};
use crate::pcm_queue::{BufferPool, PcmQueue, PushOutcome};
use crate::range_source::{ByteRangeSource, HttpRangeFetcher, RangeFetch, ResourceLocator};
use crate::sink::{PlaybackSink, SinkEvent};

/// How often a finished producer checks for a seek
const PARKED_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Streaming,
    /// Every cluster has been decoded; published once per session
    Finished,
    /// Finished and the device played the last buffer
    Drained,
    Failed(String),
    Stopped,
}

pub struct Session {
    control: Arc<SeekControl>,
    sink: Arc<PlaybackSink>,
    queue: Arc<PcmQueue>,
    pool: BufferPool,
    producer: Mutex<Option<JoinHandle<()>>>,
    current_ms: Arc<AtomicU64>,
    status: Arc<watch::Sender<SessionStatus>>,
    info: MkvInfo,
    track: AudioTrackDescriptor,
    disposed: AtomicBool,
}

impl Session {
    /// Open `locator` over HTTP range requests and start playing into `device`
    pub fn open(
        locator: &dyn ResourceLocator,
        device: Box<dyn PlaybackDevice>,
        config: SessionConfig,
    ) -> Result<Self> {
        let source = http_source(locator, &config)?;
        tracing::info!(
            "Opening {} ({} bytes)",
            locator.resource_url(),
            locator.resource_size()
        );
        Self::open_with(source, device, config)
    }

    /// Read the container header and index of `locator` without starting playback
    pub fn inspect(locator: &dyn ResourceLocator, config: &SessionConfig) -> Result<MkvInfo> {
        let source = http_source(locator, config)?;
        Self::inspect_with(source, config)
    }

    /// Header and index only; no threads are started and no clusters are fetched
    pub fn inspect_with<F: RangeFetch>(
        source: ByteRangeSource<F>,
        config: &SessionConfig,
    ) -> Result<MkvInfo> {
        config.validate()?;
        let demuxer = MatroskaDemuxer::open(source, &config.doc_types)?;
        Ok(demuxer.info())
    }

    /// Open with any range fetcher
    pub fn open_with<F>(
        source: ByteRangeSource<F>,
        device: Box<dyn PlaybackDevice>,
        config: SessionConfig,
    ) -> Result<Self>
    where
        F: RangeFetch + 'static,
    {
        config.validate()?;
        let mut demuxer = MatroskaDemuxer::open(source, &config.doc_types)?;
        let fetches = demuxer.reader_mut().get_ref().fetch_count();
        demuxer.reader_mut().get_mut().set_chunk_size(config.chunk_size);
        tracing::debug!("Index loaded with {} range requests", fetches);

        let track = demuxer.audio_track().clone();
        let info = demuxer.info();
        let pool = BufferPool::new();
        let decoder = FrameDecoder::new(decoder_for(&track, &config)?, pool.clone(), config.channels);

        let queue = Arc::new(PcmQueue::new(config.queue_capacity));
        let sink = Arc::new(PlaybackSink::new(device, Arc::clone(&queue), &config)?);
        let control = Arc::new(SeekControl::new(demuxer.duration_ms()));
        let (status, _) = watch::channel(SessionStatus::Streaming);
        let status = Arc::new(status);
        let current_ms = Arc::new(AtomicU64::new(0));

        let sink_status = Arc::clone(&status);
        sink.start(Box::new(move |event| match event {
            SinkEvent::Drained => {
                // The queue only closes once the walk is done, so this may beat Finished
                sink_status.send_if_modified(|status| {
                    if matches!(status, SessionStatus::Streaming | SessionStatus::Finished) {
                        *status = SessionStatus::Drained;
                        return true;
                    }
                    false
                });
            }
            SinkEvent::Failed(reason) => {
                sink_status.send_replace(SessionStatus::Failed(reason));
            }
        }))?;

        let producer = Producer {
            demuxer,
            decoder,
            queue: Arc::clone(&queue),
            control: Arc::clone(&control),
            current_ms: Arc::clone(&current_ms),
            status: Arc::clone(&status),
            finished: false,
        };
        let handle = thread::Builder::new()
            .name("mkstream-producer".into())
            .spawn(move || producer.run())?;

        tracing::info!(
            "Session started: {} {}Hz/{}ch, {}ms",
            track.codec_id,
            track.sample_rate,
            track.channels,
            info.duration_ms
        );

        Ok(Self {
            control,
            sink,
            queue,
            pool,
            producer: Mutex::new(Some(handle)),
            current_ms,
            status,
            info,
            track,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &MkvInfo {
        &self.info
    }

    pub fn track(&self) -> &AudioTrackDescriptor {
        &self.track
    }

    /// Time of the most recently queued block
    pub fn current_time(&self) -> Duration {
        Duration::from_millis(self.current_ms.load(Ordering::Relaxed))
    }

    pub fn total_time(&self) -> Duration {
        Duration::from_millis(self.control.total_ms())
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Jump to `time`; false when it lies outside the song
    pub fn seek(&self, time: Duration) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        let time_ms = time.as_millis() as u64;
        let result = self
            .control
            .seek_with(time_ms, || self.sink.clear_buffer().map(|_| ()));
        match result {
            Ok(()) => {}
            Err(StreamError::OutOfRange { .. }) => return false,
            Err(e) => tracing::warn!("Flush during seek failed: {}", e),
        }

        self.current_ms.store(time_ms, Ordering::Relaxed);
        self.status.send_if_modified(|status| {
            if *status == SessionStatus::Drained {
                *status = SessionStatus::Finished;
                return true;
            }
            false
        });
        tracing::info!("Seeked to {}ms", time_ms);
        true
    }

    pub fn pause(&self) -> Result<()> {
        self.sink.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.sink.resume()
    }

    pub fn is_paused(&self) -> bool {
        !self.sink.is_playing()
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.sink.set_volume(volume)
    }

    /// Pooled buffers currently held by the pipeline
    pub fn outstanding_buffers(&self) -> usize {
        self.pool.outstanding()
    }

    /// Stop both threads and release every buffer. Idempotent.
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.control.cancel_all();
        self.queue.wake_all();
        if let Some(handle) = self.producer.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Producer thread panicked");
            }
        }
        self.sink.dispose()?;

        self.status.send_if_modified(|status| {
            if matches!(status, SessionStatus::Failed(_)) {
                return false;
            }
            *status = SessionStatus::Stopped;
            true
        });
        tracing::info!("Session disposed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!("Session dispose failed: {}", e);
        }
    }
}

fn http_source(
    locator: &dyn ResourceLocator,
    config: &SessionConfig,
) -> Result<ByteRangeSource<HttpRangeFetcher>> {
    config.validate()?;
    let fetcher = HttpRangeFetcher::new(locator, config)?;
    Ok(ByteRangeSource::new(
        fetcher,
        locator.resource_size(),
        config.header_chunk_size,
    ))
}

// ============================================================================
// Producer
// ============================================================================

struct Producer<S: Read + Seek> {
    demuxer: MatroskaDemuxer<S>,
    decoder: FrameDecoder,
    queue: Arc<PcmQueue>,
    control: Arc<SeekControl>,
    current_ms: Arc<AtomicU64>,
    status: Arc<watch::Sender<SessionStatus>>,
    finished: bool,
}

impl<S: Read + Seek> Producer<S> {
    fn run(mut self) {
        loop {
            if self.control.outer().is_cancelled() {
                break;
            }

            let queue = Arc::clone(&self.queue);
            let (token, target, generation) = self.control.begin_run(|| queue.generation());
            self.current_ms.store(target, Ordering::Relaxed);

            let decoder = &mut self.decoder;
            let current_ms = &self.current_ms;
            let result = self.demuxer.walk(target, &token, |timed| {
                for frame in &timed.block.frames {
                    let packet = decoder.decode(frame, timed.time_ms, generation)?;
                    match queue.push_blocking(packet, &token) {
                        PushOutcome::Queued => current_ms.store(timed.time_ms, Ordering::Relaxed),
                        PushOutcome::Stale | PushOutcome::Cancelled => {
                            return Err(StreamError::Cancelled)
                        }
                    }
                }
                Ok(())
            });

            match result {
                Ok(()) => {
                    queue.close_generation(generation);
                    self.mark_finished();
                    // Parked until a seek restarts the walk or the session ends
                    while !token.is_cancelled() {
                        thread::sleep(PARKED_POLL);
                    }
                }
                Err(StreamError::Cancelled) => {
                    if self.control.outer().is_cancelled() {
                        break;
                    }
                    self.demuxer.mark_seeking();
                    tracing::debug!("Walk cancelled, restarting from {}ms", self.control.target_ms());
                }
                Err(e) if token.is_cancelled() => {
                    tracing::debug!("Ignoring error from cancelled walk: {}", e);
                }
                Err(e) => {
                    tracing::error!("Streaming failed: {}", e);
                    queue.close_generation(generation);
                    self.status.send_replace(SessionStatus::Failed(e.to_string()));
                    break;
                }
            }
        }
        tracing::debug!("Producer stopped");
    }

    fn mark_finished(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::info!("All clusters decoded");
        self.status.send_if_modified(|status| {
            if *status == SessionStatus::Streaming {
                *status = SessionStatus::Finished;
                return true;
            }
            false
        });
    }
}
