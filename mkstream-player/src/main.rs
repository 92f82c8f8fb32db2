//! # mkstream
//!
//! Command line player: stream the audio of a WebM/Matroska URL through the
//! default output device.
//!
//! ```text
//! mkstream <url> [--config file.json] [--seek ms] [--volume 0.0-1.0]
//!                [--header-style] [--null-output] [--info] [--verbose]
//! ```

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use mkstream_core::audio::{NullDevice, PlaybackDevice};
use mkstream_core::mkv::MkvInfo;
use mkstream_core::range_source::{HttpResource, ResourceLocator};
use mkstream_core::{RangeStyle, Session, SessionConfig, SessionStatus};

/// Interval between progress lines
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
struct PlayerOptions {
    url: String,
    config: Option<PathBuf>,
    seek_ms: Option<u64>,
    volume: Option<f32>,
    header_style: bool,
    null_output: bool,
    info_only: bool,
    verbose: bool,
}

impl PlayerOptions {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut url: Option<String> = None;
        let mut config = None;
        let mut seek_ms = None;
        let mut volume = None;
        let mut header_style = false;
        let mut null_output = false;
        let mut info_only = false;
        let mut verbose = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" | "-c" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("Missing value for --config"))?;
                    config = Some(PathBuf::from(value));
                    i += 2;
                }
                "--seek" | "-s" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("Missing value for --seek"))?;
                    seek_ms = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| anyhow::anyhow!("Invalid --seek value: {}", value))?,
                    );
                    i += 2;
                }
                "--volume" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("Missing value for --volume"))?;
                    volume = Some(
                        value
                            .parse::<f32>()
                            .map_err(|_| anyhow::anyhow!("Invalid --volume value: {}", value))?,
                    );
                    i += 2;
                }
                "--header-style" => {
                    header_style = true;
                    i += 1;
                }
                "--null-output" => {
                    null_output = true;
                    i += 1;
                }
                "--info" => {
                    info_only = true;
                    i += 1;
                }
                "--verbose" | "-v" => {
                    verbose = true;
                    i += 1;
                }
                other if other.starts_with('-') => {
                    return Err(anyhow::anyhow!("Unknown option: {}", other));
                }
                other => {
                    if url.is_some() {
                        return Err(anyhow::anyhow!("Unexpected argument: {}", other));
                    }
                    url = Some(other.to_string());
                    i += 1;
                }
            }
        }

        let url = url.ok_or_else(|| {
            anyhow::anyhow!(
                "Usage: mkstream <url> [--config file.json] [--seek ms] [--volume v] \
                 [--header-style] [--null-output] [--info] [--verbose]"
            )
        })?;

        Ok(Self {
            url,
            config,
            seek_ms,
            volume,
            header_style,
            null_output,
            info_only,
            verbose,
        })
    }

    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_json_file(path)?,
            None => SessionConfig::default(),
        };
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
        if self.header_style {
            config.range_style = RangeStyle::Header;
        }
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Output Device
// ============================================================================

fn open_device(options: &PlayerOptions, config: &SessionConfig) -> Box<dyn PlaybackDevice> {
    if options.null_output {
        return Box::new(NullDevice::new(config.sample_rate, config.channels));
    }

    #[cfg(feature = "audio")]
    {
        use mkstream_core::audio::CpalDevice;
        match CpalDevice::open_default(config.sample_rate, config.channels) {
            Ok(device) => return Box::new(device),
            Err(e) => tracing::warn!("No output device ({}), playing silently", e),
        }
    }

    #[cfg(not(feature = "audio"))]
    tracing::warn!("Built without the audio feature, playing silently");

    Box::new(NullDevice::new(config.sample_rate, config.channels))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = PlayerOptions::from_args(&args)?;

    let filter = if options.verbose {
        "mkstream=debug,mkstream_core=debug"
    } else {
        "mkstream=info,mkstream_core=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("mkstream v{}", mkstream_core::VERSION);

    let config = options.session_config()?;

    if options.info_only {
        let url = options.url.clone();
        let info = tokio::task::spawn_blocking(move || -> Result<MkvInfo> {
            let resource = HttpResource::probe(&url, &config)?;
            Ok(Session::inspect(&resource, &config)?)
        })
        .await??;
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let device = open_device(&options, &config);
    let url = options.url.clone();
    let session = tokio::task::spawn_blocking(move || -> Result<Session> {
        let resource = HttpResource::probe(&url, &config)?;
        tracing::info!("{} is {} bytes", resource.resource_url(), resource.resource_size());
        Ok(Session::open(&resource, device, config)?)
    })
    .await??;

    if let Some(seek_ms) = options.seek_ms {
        if !session.seek(Duration::from_millis(seek_ms)) {
            tracing::warn!(
                "Seek to {}ms ignored, song is {}ms long",
                seek_ms,
                session.total_time().as_millis()
            );
        }
    }

    let outcome = wait_for_end(&session).await;
    tracing::info!(
        "Stopped at {:.1}s of {:.1}s",
        session.current_time().as_secs_f64(),
        session.total_time().as_secs_f64()
    );

    tokio::task::spawn_blocking(move || session.dispose()).await??;
    outcome
}

/// Wait for Ctrl-C or the end of the song
async fn wait_for_end(session: &Session) -> Result<()> {
    let mut status = session.status();
    let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
    progress.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = status.borrow_and_update().clone();
                match current {
                    SessionStatus::Streaming => {}
                    SessionStatus::Finished => tracing::debug!("Download finished, draining"),
                    SessionStatus::Drained => {
                        tracing::info!("Playback complete");
                        return Ok(());
                    }
                    SessionStatus::Stopped => return Ok(()),
                    SessionStatus::Failed(reason) => {
                        return Err(anyhow::anyhow!("Playback failed: {}", reason));
                    }
                }
            }
            _ = progress.tick() => {
                tracing::info!(
                    "{:.1}s / {:.1}s ({} buffers in flight)",
                    session.current_time().as_secs_f64(),
                    session.total_time().as_secs_f64(),
                    session.outstanding_buffers()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("mkstream")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_url_only() {
        let options = PlayerOptions::from_args(&args(&["http://host/song.webm"])).unwrap();
        assert_eq!(options.url, "http://host/song.webm");
        assert!(options.seek_ms.is_none());
        assert!(!options.null_output);
    }

    #[test]
    fn test_parse_flags() {
        let options = PlayerOptions::from_args(&args(&[
            "--seek",
            "3000",
            "http://host/song.webm",
            "--null-output",
            "--volume",
            "0.8",
            "--header-style",
        ]))
        .unwrap();
        assert_eq!(options.seek_ms, Some(3000));
        assert_eq!(options.volume, Some(0.8));
        assert!(options.null_output);

        let config = options.session_config().unwrap();
        assert_eq!(config.range_style, RangeStyle::Header);
        assert!((config.volume - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_errors() {
        assert!(PlayerOptions::from_args(&args(&[])).is_err());
        assert!(PlayerOptions::from_args(&args(&["http://a", "--seek"])).is_err());
        assert!(PlayerOptions::from_args(&args(&["http://a", "--seek", "soon"])).is_err());
        assert!(PlayerOptions::from_args(&args(&["http://a", "--bogus"])).is_err());
        assert!(PlayerOptions::from_args(&args(&["http://a", "http://b"])).is_err());
    }

    #[test]
    fn test_volume_out_of_range_rejected() {
        let options =
            PlayerOptions::from_args(&args(&["http://a", "--volume", "3.5"])).unwrap();
        assert!(options.session_config().is_err());
    }
}
