//! Range requests against a mock HTTP server.

mod common;

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Fixture;
use mkstream_core::audio::NullDevice;
use mkstream_core::range_source::{
    ByteRangeSource, HttpRangeFetcher, HttpResource, RangeFetch, ResourceLocator, StaticResource,
};
use mkstream_core::{RangeStyle, Session, SessionConfig, SessionStatus};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves `start-end` from the `range` query parameter or a `Range` header
struct RangeResponder {
    data: Arc<Vec<u8>>,
}

impl RangeResponder {
    fn requested_range(request: &Request) -> Option<(usize, usize)> {
        let raw = request
            .url
            .query_pairs()
            .find(|(key, _)| key == "range")
            .map(|(_, value)| value.into_owned())
            .or_else(|| {
                request
                    .headers
                    .get("range")
                    .and_then(|value| value.to_str().ok())
                    .map(|value| value.trim_start_matches("bytes=").to_string())
            })?;
        let (start, end) = raw.split_once('-')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.data.len();
        match Self::requested_range(request) {
            Some((start, end)) if start < len => {
                let end = end.min(len - 1);
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {}-{}/{}", start, end, len).as_str())
                    .set_body_bytes(self.data[start..=end].to_vec())
            }
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(self.data.as_slice()),
        }
    }
}

async fn serve(data: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/song.webm"))
        .respond_with(RangeResponder {
            data: Arc::new(data),
        })
        .mount(&server)
        .await;
    server
}

fn config(style: RangeStyle) -> SessionConfig {
    SessionConfig {
        sample_rate: 8000,
        channels: 1,
        hardware_buffers: 8,
        queue_capacity: 16,
        feed_interval_ms: 10,
        chunk_size: 16 * 1024,
        header_chunk_size: 2048,
        range_style: style,
        retry_backoff_ms: 10,
        http_timeout_ms: 5000,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_probe_falls_back_to_ranged_get() {
    let data = Fixture::small().build();
    let expected = data.len() as u64;
    let server = serve(data).await;
    let url = format!("{}/song.webm", server.uri());

    let resource = tokio::task::spawn_blocking(move || {
        HttpResource::probe(&url, &config(RangeStyle::Query))
    })
    .await
    .expect("join")
    .expect("probe");
    assert_eq!(resource.resource_size(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetcher_uses_range_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/song.webm"))
        .and(query_param("token", "abc"))
        .and(query_param("range", "10-19"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![7u8; 10]))
        .expect(1)
        .mount(&server)
        .await;

    // A stale range parameter on the locator URL gets replaced
    let url = format!("{}/song.webm?token=abc&range=0-1", server.uri());
    let body = tokio::task::spawn_blocking(move || {
        let locator = StaticResource::new(url, 100);
        let mut fetcher = HttpRangeFetcher::new(&locator, &config(RangeStyle::Query))?;
        let mut body = Vec::new();
        fetcher.fetch(10, 19)?.read_to_end(&mut body)?;
        Ok::<_, mkstream_core::StreamError>(body)
    })
    .await
    .expect("join")
    .expect("fetch");
    assert_eq!(body, vec![7u8; 10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetcher_retries_failed_range() {
    let data: Vec<u8> = (0..=255u8).collect();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("range", "0-63"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder {
            data: Arc::new(data.clone()),
        })
        .with_priority(2)
        .mount(&server)
        .await;

    let url = format!("{}/song.webm", server.uri());
    let started = Instant::now();
    let body = tokio::task::spawn_blocking(move || {
        let locator = StaticResource::new(url, 256);
        let mut fetcher = HttpRangeFetcher::new(&locator, &config(RangeStyle::Query))?;
        let mut body = Vec::new();
        fetcher.fetch(0, 63)?.read_to_end(&mut body)?;
        Ok::<_, mkstream_core::StreamError>(body)
    })
    .await
    .expect("join")
    .expect("fetch after retries");

    assert_eq!(body, data[..64].to_vec());
    // Linear backoff: 10 ms then 20 ms
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetcher_gives_up_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let url = format!("{}/song.webm", server.uri());
    let result = tokio::task::spawn_blocking(move || {
        let locator = StaticResource::new(url, 256);
        let mut fetcher = HttpRangeFetcher::new(&locator, &config(RangeStyle::Query))
            .expect("fetcher");
        fetcher.fetch(0, 63).map(|_| ())
    })
    .await
    .expect("join");
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ranged_read_through_http() {
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let server = serve(data.clone()).await;
    let url = format!("{}/song.webm", server.uri());

    let read = tokio::task::spawn_blocking(move || {
        use std::io::{Seek, SeekFrom};
        let locator = StaticResource::new(url, 10_000);
        let fetcher = HttpRangeFetcher::new(&locator, &config(RangeStyle::Header))?;
        let mut source = ByteRangeSource::new(fetcher, 10_000, 4096);
        source.seek(SeekFrom::Start(9000))?;
        let mut tail = Vec::new();
        source.read_to_end(&mut tail)?;
        Ok::<_, mkstream_core::StreamError>((tail, source.fetch_count()))
    })
    .await
    .expect("join")
    .expect("read");

    assert_eq!(read.0, data[9000..].to_vec());
    assert_eq!(read.1, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_streams_over_http() {
    let fixture = Fixture::small();
    let expected_samples = fixture.samples_after(2000);
    let server = serve(fixture.build()).await;
    let url = format!("{}/song.webm", server.uri());

    let played = tokio::task::spawn_blocking(move || {
        let config = config(RangeStyle::Query);
        let resource = HttpResource::probe(&url, &config)?;
        let device = NullDevice::manual(8000, 1);
        let handle = device.handle();
        let session = Session::open(&resource, Box::new(device), config)?;
        assert!(session.seek(Duration::from_millis(2000)));

        let status = session.status();
        let deadline = Instant::now() + Duration::from_secs(20);
        while *status.borrow() != SessionStatus::Drained {
            if let SessionStatus::Failed(reason) = &*status.borrow() {
                panic!("session failed: {}", reason);
            }
            assert!(Instant::now() < deadline, "session never drained");
            handle.advance(Duration::from_millis(100));
            std::thread::sleep(Duration::from_millis(5));
        }
        session.dispose()?;
        assert_eq!(session.outstanding_buffers(), 0);
        Ok::<_, mkstream_core::StreamError>(handle.played_samples())
    })
    .await
    .expect("join")
    .expect("session");
    assert_eq!(played, expected_samples);

    let requests = server.received_requests().await.expect("recording enabled");
    let ranged = requests
        .iter()
        .filter(|request| request.url.query_pairs().any(|(key, _)| key == "range"))
        .count();
    assert!(ranged >= 2, "{} ranged requests", ranged);
}
