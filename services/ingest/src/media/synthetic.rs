//! Synthetic camera for `stub://` addresses.
//!
//! Address form: `stub://<name>?width=W&height=H&fps=F&frames=N&repeat=R`.
//! All parameters are optional. `frames` makes the source finite (and
//! seekable); `repeat` holds each generated scene for R consecutive frames so
//! downstream deduplication has something to do; `fps=0` disables pacing.

use super::{CaptureBackend, MediaError, StreamInfo, VideoCapture};
use crate::frame::FrameImage;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

pub const SCHEME: &str = "stub://";

/// Parameters of a synthetic stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames: Option<u64>,
    pub repeat: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            fps: 30.0,
            frames: None,
            repeat: 1,
        }
    }
}

impl SyntheticConfig {
    /// Parse the query portion of a `stub://` address.
    pub fn parse(address: &str) -> Result<Self, MediaError> {
        let rest = address
            .strip_prefix(SCHEME)
            .ok_or_else(|| open_error(address, "missing stub:// scheme"))?;

        let mut config = Self::default();
        let query = match rest.split_once('?') {
            Some((_, query)) => query,
            None => return Ok(config),
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| open_error(address, &format!("malformed parameter '{pair}'")))?;
            let bad = || open_error(address, &format!("invalid value for {key}: '{value}'"));

            match key {
                "width" => config.width = value.parse().map_err(|_| bad())?,
                "height" => config.height = value.parse().map_err(|_| bad())?,
                "fps" => config.fps = value.parse().map_err(|_| bad())?,
                "frames" => config.frames = Some(value.parse().map_err(|_| bad())?),
                "repeat" => config.repeat = value.parse().map_err(|_| bad())?,
                _ => return Err(open_error(address, &format!("unknown parameter '{key}'"))),
            }
        }

        if config.width == 0 || config.height == 0 {
            return Err(open_error(address, "width and height must be positive"));
        }
        if !config.fps.is_finite() || config.fps < 0.0 {
            return Err(open_error(address, "fps must be a non-negative number"));
        }
        config.repeat = config.repeat.max(1);

        Ok(config)
    }
}

fn open_error(address: &str, message: &str) -> MediaError {
    MediaError::OpenFailed {
        address: address.to_string(),
        message: message.to_string(),
    }
}

/// Backend that opens [`SyntheticCapture`] handles.
#[derive(Debug, Default, Clone)]
pub struct SyntheticBackend;

impl CaptureBackend for SyntheticBackend {
    fn open(&self, address: &str) -> Result<Box<dyn VideoCapture>, MediaError> {
        let config = SyntheticConfig::parse(address)?;
        debug!(address = %address, "Opened synthetic source");
        Ok(Box::new(SyntheticCapture::new(config)))
    }
}

/// Generates RGB test patterns at a steady rate.
pub struct SyntheticCapture {
    config: SyntheticConfig,
    position: u64,
    next_due: Option<Instant>,
}

impl SyntheticCapture {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            position: 0,
            next_due: None,
        }
    }

    fn render(&self, position: u64) -> Result<FrameImage, MediaError> {
        let scene = position / self.config.repeat;
        let len = FrameImage::payload_len(self.config.width, self.config.height, 3);
        let pixels: Vec<u8> = (0..len as u64)
            .map(|i| ((i / 3 + scene * 13) % 251) as u8)
            .collect();
        Ok(FrameImage::new(
            self.config.width,
            self.config.height,
            3,
            pixels,
        )?)
    }

    fn pace(&mut self) {
        if self.config.fps <= 0.0 {
            return;
        }
        let Ok(interval) = Duration::try_from_secs_f64(1.0 / self.config.fps) else {
            return;
        };
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_due = Some(self.next_due.unwrap_or(now).max(now) + interval);
    }
}

impl VideoCapture for SyntheticCapture {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            total_frames: self.config.frames,
        }
    }

    fn read(&mut self) -> Result<Option<FrameImage>, MediaError> {
        if let Some(total) = self.config.frames {
            if self.position >= total {
                return Ok(None);
            }
        }

        self.pace();
        let image = self.render(self.position)?;
        self.position += 1;
        Ok(Some(image))
    }

    fn seek(&mut self, position: u64) -> Result<(), MediaError> {
        match self.config.frames {
            Some(total) if position < total => {
                self.position = position;
                Ok(())
            }
            Some(_) => Err(MediaError::SeekFailed(position)),
            None => Err(MediaError::Unsupported(
                "seek on an unbounded synthetic stream".to_string(),
            )),
        }
    }
}
