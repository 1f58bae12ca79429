//! GStreamer capture and writer backends.
//!
//! Sources are decoded with `uridecodebin` into packed RGB and pulled from an
//! appsink. Output files are encoded by pushing RGB buffers into an appsrc
//! followed by an encoder/muxer pair chosen from the codec and format.

use super::{CaptureBackend, MediaError, StreamInfo, VideoCapture, VideoWriter, WriterBackend, WriterSettings};
use crate::frame::FrameImage;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::Path;
use tracing::{debug, warn};

const STATE_TIMEOUT_SECS: u64 = 10;
const PULL_TIMEOUT_SECS: u64 = 5;

fn init() -> Result<(), MediaError> {
    gst::init().map_err(|e| MediaError::Unsupported(format!("GStreamer init failed: {e}")))
}

/// Turn a bare file path into a `file://` URI; URIs pass through.
fn to_uri(address: &str) -> Result<String, MediaError> {
    if address.contains("://") {
        return Ok(address.to_string());
    }
    let path = std::fs::canonicalize(address).map_err(|e| MediaError::OpenFailed {
        address: address.to_string(),
        message: e.to_string(),
    })?;
    gst::glib::filename_to_uri(&path, None)
        .map(|uri| uri.to_string())
        .map_err(|e| MediaError::OpenFailed {
            address: address.to_string(),
            message: e.to_string(),
        })
}

fn launch(description: &str) -> Result<gst::Pipeline, String> {
    gst::parse::launch(description)
        .map_err(|e| e.to_string())?
        .downcast::<gst::Pipeline>()
        .map_err(|_| "Failed to cast to Pipeline".to_string())
}

/// Opens sources through `uridecodebin`.
#[derive(Debug, Clone)]
pub struct GstCaptureBackend;

impl GstCaptureBackend {
    pub fn new() -> Result<Self, MediaError> {
        init()?;
        Ok(Self)
    }
}

impl CaptureBackend for GstCaptureBackend {
    fn open(&self, address: &str) -> Result<Box<dyn VideoCapture>, MediaError> {
        Ok(Box::new(GstCapture::open(address)?))
    }
}

pub struct GstCapture {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    info: StreamInfo,
    pending: Option<gst::Sample>,
}

impl GstCapture {
    pub fn open(address: &str) -> Result<Self, MediaError> {
        let open_failed = |message: String| MediaError::OpenFailed {
            address: address.to_string(),
            message,
        };

        let uri = to_uri(address)?;
        let description = format!(
            "uridecodebin uri=\"{uri}\" ! videoconvert \
             ! video/x-raw,format=RGB \
             ! appsink name=sink sync=false max-buffers=4"
        );
        debug!(pipeline = %description, "Creating capture pipeline");

        let pipeline = launch(&description).map_err(open_failed)?;
        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_failed("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_failed("Could not cast to AppSink".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_failed(e.to_string()))?;
        let (result, _state, _pending) =
            pipeline.state(gst::ClockTime::from_seconds(STATE_TIMEOUT_SECS));
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_failed("Timeout waiting for pipeline to start".to_string()));
        }

        // The first sample carries the negotiated caps.
        let first = match appsink.try_pull_sample(gst::ClockTime::from_seconds(PULL_TIMEOUT_SECS)) {
            Some(sample) => sample,
            None => {
                let _ = pipeline.set_state(gst::State::Null);
                return Err(open_failed("No frames received".to_string()));
            }
        };
        let video_info = sample_info(&first).map_err(open_failed)?;

        let fps = match video_info.fps() {
            f if f.denom() > 0 && f.numer() > 0 => f.numer() as f64 / f.denom() as f64,
            _ => 0.0,
        };
        let total_frames = pipeline
            .query_duration::<gst::ClockTime>()
            .filter(|_| fps > 0.0)
            .map(|d| (d.nseconds() as f64 / 1e9 * fps).round() as u64);

        Ok(Self {
            pipeline,
            appsink,
            info: StreamInfo {
                width: video_info.width(),
                height: video_info.height(),
                fps,
                total_frames,
            },
            pending: Some(first),
        })
    }
}

fn sample_info(sample: &gst::Sample) -> Result<gst_video::VideoInfo, String> {
    let caps = sample.caps().ok_or_else(|| "sample has no caps".to_string())?;
    gst_video::VideoInfo::from_caps(caps).map_err(|e| e.to_string())
}

/// Copy an RGB sample into a tightly packed payload, dropping row padding.
fn sample_to_image(sample: &gst::Sample) -> Result<FrameImage, MediaError> {
    let info = sample_info(sample).map_err(MediaError::ReadFailed)?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| MediaError::ReadFailed("sample has no buffer".to_string()))?;
    let map = buffer
        .map_readable()
        .map_err(|e| MediaError::ReadFailed(e.to_string()))?;

    let (width, height) = (info.width(), info.height());
    let row = width as usize * 3;
    let stride = info.stride()[0] as usize;
    let data = map.as_slice();

    let mut pixels = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let line = data
            .get(start..start + row)
            .ok_or_else(|| MediaError::ReadFailed("truncated frame buffer".to_string()))?;
        pixels.extend_from_slice(line);
    }

    Ok(FrameImage::new(width, height, 3, pixels)?)
}

impl VideoCapture for GstCapture {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn read(&mut self) -> Result<Option<FrameImage>, MediaError> {
        if let Some(sample) = self.pending.take() {
            return sample_to_image(&sample).map(Some);
        }

        match self
            .appsink
            .try_pull_sample(gst::ClockTime::from_seconds(PULL_TIMEOUT_SECS))
        {
            Some(sample) => sample_to_image(&sample).map(Some),
            None if self.appsink.is_eos() => Ok(None),
            None => Err(MediaError::ReadFailed("Timed out waiting for frame".to_string())),
        }
    }

    fn seek(&mut self, position: u64) -> Result<(), MediaError> {
        if self.info.fps <= 0.0 || self.info.total_frames.is_none() {
            return Err(MediaError::Unsupported("seek on a live source".to_string()));
        }
        let target = gst::ClockTime::from_nseconds((position as f64 / self.info.fps * 1e9) as u64);
        self.pending = None;
        self.pipeline
            .seek_simple(gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE, target)
            .map_err(|_| MediaError::SeekFailed(position))
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Opens encoders through an appsrc pipeline.
#[derive(Debug, Clone)]
pub struct GstWriterBackend;

impl GstWriterBackend {
    pub fn new() -> Result<Self, MediaError> {
        init()?;
        Ok(Self)
    }
}

impl WriterBackend for GstWriterBackend {
    fn open(
        &self,
        path: &Path,
        settings: &WriterSettings,
    ) -> Result<Box<dyn VideoWriter>, MediaError> {
        Ok(Box::new(GstWriter::open(path, settings)?))
    }
}

fn encoder_for(codec: &str) -> Option<&'static str> {
    match codec.to_ascii_lowercase().as_str() {
        "avc1" | "h264" | "x264" => Some("x264enc tune=zerolatency"),
        "mp4v" => Some("avenc_mpeg4"),
        "mjpg" => Some("jpegenc"),
        _ => None,
    }
}

fn muxer_for(format: &str) -> Option<&'static str> {
    match format.to_ascii_lowercase().as_str() {
        "mp4" => Some("mp4mux"),
        "mkv" => Some("matroskamux"),
        "avi" => Some("avimux"),
        _ => None,
    }
}

pub struct GstWriter {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    frame_duration: gst::ClockTime,
    frames_written: u64,
    closed: bool,
}

impl GstWriter {
    pub fn open(path: &Path, settings: &WriterSettings) -> Result<Self, MediaError> {
        let open_failed = |message: String| MediaError::WriterOpenFailed {
            path: path.to_path_buf(),
            message,
        };

        let encoder = encoder_for(&settings.codec)
            .ok_or_else(|| open_failed(format!("unsupported codec '{}'", settings.codec)))?;
        let muxer = muxer_for(&settings.format)
            .ok_or_else(|| open_failed(format!("unsupported format '{}'", settings.format)))?;
        if settings.fps <= 0.0 {
            return Err(open_failed("fps must be positive".to_string()));
        }

        let framerate = (settings.fps * 1000.0).round() as i64;
        let description = format!(
            "appsrc name=src format=time \
             caps=video/x-raw,format=RGB,width={w},height={h},framerate={framerate}/1000 \
             ! videoconvert ! {encoder} ! {muxer} ! filesink location=\"{location}\"",
            w = settings.width,
            h = settings.height,
            location = path.display(),
        );
        debug!(pipeline = %description, "Creating writer pipeline");

        let pipeline = launch(&description).map_err(open_failed)?;
        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| open_failed("appsrc not found".to_string()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| open_failed("Could not cast to AppSrc".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_failed(e.to_string()))?;

        Ok(Self {
            pipeline,
            appsrc,
            frame_duration: gst::ClockTime::from_nseconds((1e9 / settings.fps) as u64),
            frames_written: 0,
            closed: false,
        })
    }
}

impl VideoWriter for GstWriter {
    fn write(&mut self, image: &FrameImage) -> Result<(), MediaError> {
        if self.closed {
            return Err(MediaError::WriteFailed("writer is closed".to_string()));
        }
        if image.channels() != 3 {
            return Err(MediaError::WriteFailed(format!(
                "expected RGB frame, got {} channels",
                image.channels()
            )));
        }

        let mut buffer = gst::Buffer::from_slice(image.data().clone());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(self.frame_duration * self.frames_written);
            buffer.set_duration(self.frame_duration);
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| MediaError::WriteFailed(format!("{e:?}")))?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), MediaError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let _ = self.appsrc.end_of_stream();
        if let Some(bus) = self.pipeline.bus() {
            let message = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(STATE_TIMEOUT_SECS),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
            if let Some(message) = message {
                if let gst::MessageView::Error(err) = message.view() {
                    warn!(error = %err.error(), "Encoder reported error while finalizing");
                }
            }
        }

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| MediaError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}

impl Drop for GstWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
