//! # Byte Range Source
//!
//! A seekable `Read` over a remote resource that downloads lazily in fixed-size
//! range requests. Seeking only records the new position; the next read opens a
//! fresh range starting there. Sequential reads inside a chunk reuse the open
//! response body.

use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RangeStyle, SessionConfig};
use crate::error::{Result, StreamError};

// ============================================================================
// Resource Locator
// ============================================================================

/// Where the bytes live and how many there are
pub trait ResourceLocator: Send + Sync {
    fn resource_url(&self) -> &str;
    fn resource_size(&self) -> u64;
}

/// Locator whose URL and size are already known
#[derive(Debug, Clone)]
pub struct StaticResource {
    url: String,
    size: u64,
}

impl StaticResource {
    pub fn new(url: impl Into<String>, size: u64) -> Self {
        Self {
            url: url.into(),
            size,
        }
    }
}

impl ResourceLocator for StaticResource {
    fn resource_url(&self) -> &str {
        &self.url
    }

    fn resource_size(&self) -> u64 {
        self.size
    }
}

/// Locator that learns the size from the server
#[derive(Debug, Clone)]
pub struct HttpResource {
    url: String,
    size: u64,
}

impl HttpResource {
    /// HEAD the resource for its Content-Length, falling back to a one byte
    /// ranged GET and its Content-Range total.
    pub fn probe(url: &str, config: &SessionConfig) -> Result<Self> {
        url::Url::parse(url).map_err(|e| StreamError::Config(format!("bad url {}: {}", url, e)))?;
        let agent = build_agent(config);

        let size = match agent.head(url).call() {
            Ok(head) => head
                .header("Content-Length")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|size| *size > 0),
            Err(e) => {
                tracing::debug!("HEAD {} failed: {}", url, e);
                None
            }
        };

        let size = match size {
            Some(size) => size,
            None => {
                tracing::debug!("No usable Content-Length, probing with a ranged GET");
                let response = agent
                    .get(url)
                    .set("Range", "bytes=0-0")
                    .call()
                    .map_err(http_error)?;
                response
                    .header("Content-Range")
                    .and_then(parse_content_range_total)
                    .ok_or_else(|| {
                        StreamError::Io(io::Error::new(
                            ErrorKind::InvalidData,
                            "server reports neither Content-Length nor Content-Range",
                        ))
                    })?
            }
        };

        tracing::info!("Resource {} is {} bytes", url, size);
        Ok(Self {
            url: url.to_string(),
            size,
        })
    }
}

impl ResourceLocator for HttpResource {
    fn resource_url(&self) -> &str {
        &self.url
    }

    fn resource_size(&self) -> u64 {
        self.size
    }
}

/// `bytes 0-0/12345` -> 12345
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

// ============================================================================
// Range Fetchers
// ============================================================================

pub type RangeBody = Box<dyn Read + Send + Sync>;

/// Opens the byte range `[start, end]` (inclusive) of a resource
pub trait RangeFetch: Send {
    fn fetch(&mut self, start: u64, end: u64) -> io::Result<RangeBody>;
}

pub struct HttpRangeFetcher {
    agent: ureq::Agent,
    url: url::Url,
    style: RangeStyle,
    retries: u32,
    backoff: Duration,
}

impl HttpRangeFetcher {
    pub fn new(locator: &dyn ResourceLocator, config: &SessionConfig) -> Result<Self> {
        let url = url::Url::parse(locator.resource_url()).map_err(|e| {
            StreamError::Config(format!("bad url {}: {}", locator.resource_url(), e))
        })?;
        Ok(Self {
            agent: build_agent(config),
            url,
            style: config.range_style,
            retries: config.fetch_retries,
            backoff: config.retry_backoff(),
        })
    }

    fn request(&self, start: u64, end: u64) -> io::Result<RangeBody> {
        let response = match self.style {
            RangeStyle::Query => {
                let url = with_range_query(&self.url, start, end);
                self.agent.request_url("GET", &url).call()
            }
            RangeStyle::Header => self
                .agent
                .request_url("GET", &self.url)
                .set("Range", &format!("bytes={}-{}", start, end))
                .call(),
        };
        let response = response.map_err(|e| io::Error::new(ErrorKind::Other, e.to_string()))?;
        Ok(response.into_reader())
    }
}

impl RangeFetch for HttpRangeFetcher {
    fn fetch(&mut self, start: u64, end: u64) -> io::Result<RangeBody> {
        let mut attempt = 0;
        loop {
            match self.request(start, end) {
                Ok(body) => {
                    tracing::trace!("Opened range {}-{}", start, end);
                    return Ok(body);
                }
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Range {}-{} failed ({}), retry {}/{}",
                        start,
                        end,
                        e,
                        attempt,
                        self.retries
                    );
                    std::thread::sleep(self.backoff * attempt);
                }
                Err(e) => {
                    tracing::error!("Range {}-{} failed: {}", start, end, e);
                    return Err(e);
                }
            }
        }
    }
}

/// Replace any existing `range` query parameter
fn with_range_query(base: &url::Url, start: u64, end: u64) -> url::Url {
    let mut url = base.clone();
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != "range")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (key, value) in &kept {
            query.append_pair(key, value);
        }
        query.append_pair("range", &format!("{}-{}", start, end));
    }
    url
}

fn build_agent(config: &SessionConfig) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(config.http_timeout())
        .timeout_read(config.http_timeout())
        .build()
}

fn http_error(err: ureq::Error) -> StreamError {
    StreamError::Io(io::Error::new(ErrorKind::Other, err.to_string()))
}

/// Serves ranges out of a shared in-memory copy of the resource
#[derive(Debug, Clone)]
pub struct InMemoryFetcher {
    data: Arc<Vec<u8>>,
}

impl InMemoryFetcher {
    pub fn new(data: impl Into<Arc<Vec<u8>>>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct SharedSlice {
    data: Arc<Vec<u8>>,
    pos: usize,
    end: usize,
}

impl Read for SharedSlice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.end - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl RangeFetch for InMemoryFetcher {
    fn fetch(&mut self, start: u64, end: u64) -> io::Result<RangeBody> {
        let len = self.data.len();
        let start = (start as usize).min(len);
        let end = (end as usize).saturating_add(1).min(len).max(start);
        Ok(Box::new(SharedSlice {
            data: Arc::clone(&self.data),
            pos: start,
            end,
        }))
    }
}

// ============================================================================
// Byte Range Source
// ============================================================================

pub struct ByteRangeSource<F: RangeFetch> {
    fetcher: F,
    len: u64,
    chunk_size: u64,
    pos: u64,
    body: Option<RangeBody>,
    /// Exclusive end of the range the open body covers
    body_end: u64,
    fetches: u64,
}

impl<F: RangeFetch> ByteRangeSource<F> {
    pub fn new(fetcher: F, len: u64, chunk_size: u64) -> Self {
        Self {
            fetcher,
            len,
            chunk_size: chunk_size.max(1),
            pos: 0,
            body: None,
            body_end: 0,
            fetches: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Number of range requests issued so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches
    }

    /// Applies to the next range opened
    pub fn set_chunk_size(&mut self, chunk_size: u64) {
        self.chunk_size = chunk_size.max(1);
    }

    fn open_chunk(&mut self) -> io::Result<()> {
        let end = self.pos.saturating_add(self.chunk_size).min(self.len);
        self.body = None;
        let body = self.fetcher.fetch(self.pos, end - 1)?;
        self.fetches += 1;
        self.body = Some(body);
        self.body_end = end;
        Ok(())
    }
}

impl<F: RangeFetch> Read for ByteRangeSource<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() && self.pos < self.len {
            if self.body.is_none() || self.pos >= self.body_end {
                if let Err(e) = self.open_chunk() {
                    return partial_or(filled, e);
                }
            }
            let want = (buf.len() - filled).min((self.body_end - self.pos) as usize);
            let body = match self.body.as_mut() {
                Some(body) => body,
                None => break,
            };

            let n = match body.read(&mut buf[filled..filled + want]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.body = None;
                    return partial_or(filled, e);
                }
            };
            if n == 0 {
                self.body = None;
                let e = io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("range body ended at {} before {}", self.pos, self.body_end),
                );
                return partial_or(filled, e);
            }
            filled += n;
            self.pos += n as u64;
        }
        Ok(filled)
    }
}

/// Bytes already copied count as a short read; the error resurfaces on the next call
fn partial_or(filled: usize, e: io::Error) -> io::Result<usize> {
    if filled > 0 {
        Ok(filled)
    } else {
        Err(e)
    }
}

impl<F: RangeFetch> Seek for ByteRangeSource<F> {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let target = match from {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, "seek before the start of the resource")
        })?;

        if target != self.pos {
            self.pos = target;
            self.body = None;
        }
        Ok(self.pos)
    }
}

impl<F: RangeFetch> Write for ByteRangeSource<F> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(ErrorKind::Unsupported, "range source is read-only"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(ErrorKind::Unsupported, "range source is read-only"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every range it is asked for
    struct RecordingFetcher {
        inner: InMemoryFetcher,
        requests: Arc<Mutex<Vec<(u64, u64)>>>,
        /// Bytes to cut off the end of every body
        short_by: usize,
    }

    impl RangeFetch for RecordingFetcher {
        fn fetch(&mut self, start: u64, end: u64) -> io::Result<RangeBody> {
            self.requests.lock().push((start, end));
            let end = end.saturating_sub(self.short_by as u64);
            self.inner.fetch(start, end)
        }
    }

    fn source(len: usize, chunk: u64) -> (ByteRangeSource<RecordingFetcher>, Arc<Mutex<Vec<(u64, u64)>>>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let fetcher = RecordingFetcher {
            inner: InMemoryFetcher::new(data),
            requests: Arc::clone(&requests),
            short_by: 0,
        };
        (ByteRangeSource::new(fetcher, len as u64, chunk), requests)
    }

    #[test]
    fn test_read_spans_chunks() {
        let (mut src, requests) = source(100, 30);
        let mut buf = vec![0u8; 70];
        assert_eq!(src.read(&mut buf).expect("read"), 70);
        assert_eq!(buf[69], 69);
        assert_eq!(src.position(), 70);
        assert_eq!(*requests.lock(), vec![(0, 29), (30, 59), (60, 89)]);
    }

    #[test]
    fn test_short_read_at_end() {
        let (mut src, requests) = source(50, 40);
        src.seek(SeekFrom::Start(45)).expect("seek");
        let mut buf = [0u8; 10];
        assert_eq!(src.read(&mut buf).expect("read"), 5);
        assert_eq!(src.read(&mut buf).expect("read"), 0);
        assert_eq!(*requests.lock(), vec![(45, 49)]);
    }

    #[test]
    fn test_seek_to_current_position_keeps_body() {
        let (mut src, requests) = source(100, 64);
        let mut buf = [0u8; 10];
        src.read_exact(&mut buf).expect("read");
        assert_eq!(src.seek(SeekFrom::Current(0)).expect("seek"), 10);
        src.read_exact(&mut buf).expect("read");
        assert_eq!(buf[0], 10);
        assert_eq!(requests.lock().len(), 1);
    }

    #[test]
    fn test_seek_reissues_range() {
        let (mut src, requests) = source(200, 64);
        let mut buf = [0u8; 4];
        src.read_exact(&mut buf).expect("read");
        src.seek(SeekFrom::Start(150)).expect("seek");
        src.read_exact(&mut buf).expect("read");
        assert_eq!(buf, [150, 151, 152, 153]);
        assert_eq!(src.seek(SeekFrom::End(-10)).expect("seek"), 190);
        assert_eq!(*requests.lock(), vec![(0, 63), (150, 199)]);
        assert_eq!(src.fetch_count(), 2);
    }

    #[test]
    fn test_seek_before_start_fails() {
        let (mut src, _) = source(10, 4);
        let err = src.seek(SeekFrom::Current(-1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_truncated_body_is_unexpected_eof() {
        let (mut src, _) = source(100, 50);
        src.fetcher.short_by = 5;
        let mut buf = [0u8; 60];
        // The bytes that did arrive are handed out before the error
        assert_eq!(src.read(&mut buf).expect("partial read"), 45);
        assert_eq!(src.position(), 45);
        let err = src.read_exact(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    /// Yields `good` bytes, then fails
    struct FailingBody {
        good: usize,
    }

    impl Read for FailingBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.good == 0 {
                return Err(io::Error::new(ErrorKind::ConnectionReset, "reset"));
            }
            let n = buf.len().min(self.good);
            buf[..n].fill(0x5A);
            self.good -= n;
            Ok(n)
        }
    }

    struct FailingFetcher {
        requests: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    impl RangeFetch for FailingFetcher {
        fn fetch(&mut self, start: u64, end: u64) -> io::Result<RangeBody> {
            self.requests.lock().push((start, end));
            Ok(Box::new(FailingBody { good: 6 }))
        }
    }

    #[test]
    fn test_body_error_keeps_position_in_step() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let fetcher = FailingFetcher {
            requests: Arc::clone(&requests),
        };
        let mut src = ByteRangeSource::new(fetcher, 100, 50);
        let mut buf = [0u8; 10];

        assert_eq!(src.read(&mut buf).expect("partial read"), 6);
        assert_eq!(src.position(), 6);
        assert_eq!(src.stream_position().expect("position"), 6);

        // The next read starts a fresh range where the last one broke off
        assert_eq!(src.read(&mut buf).expect("partial read"), 6);
        assert_eq!(src.position(), 12);
        assert_eq!(*requests.lock(), vec![(0, 49), (6, 55)]);
    }

    #[test]
    fn test_write_is_unsupported() {
        let (mut src, _) = source(10, 4);
        let err = src.write(b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_range_query_replaces_existing() {
        let base = url::Url::parse("https://host/videoplayback?id=7&range=0-1&mime=audio").expect("url");
        let url = with_range_query(&base, 100, 199);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("id".to_string(), "7".to_string()),
                ("mime".to_string(), "audio".to_string()),
                ("range".to_string(), "100-199".to_string()),
            ]
        );
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes */*"), None);
    }
}
