//! Uncompressed, seekable frame container (`.vraw`).
//!
//! Layout: a 32-byte little-endian header followed by fixed-size frames.
//!
//! ```text
//! 0   magic "VRAW"
//! 4   version   u16
//! 6   channels  u16
//! 8   width     u32
//! 12  height    u32
//! 16  fps       f64
//! 24  reserved  [u8; 8]
//! ```
//!
//! Because every frame has the same size, the frame count follows from the
//! file length and seeking is a single file offset computation.

use super::{CaptureBackend, MediaError, StreamInfo, VideoCapture, VideoWriter, WriterBackend, WriterSettings};
use crate::frame::FrameImage;
use bytes::{Buf, BufMut, BytesMut};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const EXTENSION: &str = "vraw";

const MAGIC: &[u8; 4] = b"VRAW";
const VERSION: u16 = 1;
const HEADER_LEN: u64 = 32;
const DEFAULT_CHANNELS: u8 = 3;

/// Whether an address names a `.vraw` file.
pub fn is_raw_path(address: &str) -> bool {
    Path::new(address)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(EXTENSION))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Header {
    channels: u8,
    width: u32,
    height: u32,
    fps: f64,
}

impl Header {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN as usize);
        buf.put_slice(MAGIC);
        buf.put_u16_le(VERSION);
        buf.put_u16_le(self.channels as u16);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_f64_le(self.fps);
        buf.put_bytes(0, 8);
        buf
    }

    fn decode(mut raw: &[u8]) -> Result<Self, String> {
        if raw.len() < HEADER_LEN as usize || &raw[..4] != MAGIC {
            return Err("not a vraw file".to_string());
        }
        raw.advance(4);

        let version = raw.get_u16_le();
        if version != VERSION {
            return Err(format!("unsupported vraw version {version}"));
        }
        let channels = raw.get_u16_le();
        let width = raw.get_u32_le();
        let height = raw.get_u32_le();
        let fps = raw.get_f64_le();

        if width == 0 || height == 0 || channels == 0 || channels > 4 {
            return Err(format!("invalid frame shape {width}x{height}x{channels}"));
        }

        Ok(Self {
            channels: channels as u8,
            width,
            height,
            fps,
        })
    }

    fn frame_len(&self) -> u64 {
        FrameImage::payload_len(self.width, self.height, self.channels) as u64
    }
}

/// Opens `.vraw` files for reading.
#[derive(Debug, Default, Clone)]
pub struct RawCaptureBackend;

impl CaptureBackend for RawCaptureBackend {
    fn open(&self, address: &str) -> Result<Box<dyn VideoCapture>, MediaError> {
        Ok(Box::new(RawCapture::open(Path::new(address))?))
    }
}

/// Sequential and random-access reader over a `.vraw` file.
pub struct RawCapture {
    reader: BufReader<File>,
    header: Header,
    total_frames: u64,
}

impl RawCapture {
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        let open_failed = |message: String| MediaError::OpenFailed {
            address: path.display().to_string(),
            message,
        };

        let file = File::open(path).map_err(|e| open_failed(e.to_string()))?;
        let file_len = file.metadata().map_err(|e| open_failed(e.to_string()))?.len();
        let mut reader = BufReader::new(file);

        let mut raw = [0u8; HEADER_LEN as usize];
        reader
            .read_exact(&mut raw)
            .map_err(|e| open_failed(e.to_string()))?;
        let header = Header::decode(&raw).map_err(open_failed)?;
        let total_frames = (file_len - HEADER_LEN) / header.frame_len();

        debug!(
            path = %path.display(),
            width = header.width,
            height = header.height,
            total_frames,
            "Opened vraw file"
        );

        Ok(Self {
            reader,
            header,
            total_frames,
        })
    }
}

impl VideoCapture for RawCapture {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            width: self.header.width,
            height: self.header.height,
            fps: self.header.fps,
            total_frames: Some(self.total_frames),
        }
    }

    fn read(&mut self) -> Result<Option<FrameImage>, MediaError> {
        let mut pixels = vec![0u8; self.header.frame_len() as usize];
        match self.reader.read_exact(&mut pixels) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(MediaError::ReadFailed(e.to_string())),
        }

        Ok(Some(FrameImage::new(
            self.header.width,
            self.header.height,
            self.header.channels,
            pixels,
        )?))
    }

    fn seek(&mut self, position: u64) -> Result<(), MediaError> {
        if position >= self.total_frames {
            return Err(MediaError::SeekFailed(position));
        }
        let offset = HEADER_LEN + position * self.header.frame_len();
        self.reader.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

/// Creates `.vraw` files.
#[derive(Debug, Default, Clone)]
pub struct RawWriterBackend;

impl WriterBackend for RawWriterBackend {
    fn open(
        &self,
        path: &Path,
        settings: &WriterSettings,
    ) -> Result<Box<dyn VideoWriter>, MediaError> {
        Ok(Box::new(RawWriter::create(path, settings)?))
    }
}

/// Appends frames to a `.vraw` file.
///
/// The header is written with the first frame so it can record that frame's
/// channel count; an empty file gets a three-channel header on close.
pub struct RawWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    width: u32,
    height: u32,
    fps: f64,
    channels: Option<u8>,
    frames_written: u64,
}

impl RawWriter {
    pub fn create(path: &Path, settings: &WriterSettings) -> Result<Self, MediaError> {
        let file = File::create(path).map_err(|e| MediaError::WriterOpenFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            width: settings.width,
            height: settings.height,
            fps: settings.fps,
            channels: None,
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn write_header(&mut self, channels: u8) -> Result<(), MediaError> {
        let header = Header {
            channels,
            width: self.width,
            height: self.height,
            fps: self.fps,
        };
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| MediaError::WriteFailed("writer is closed".to_string()))?;
        writer.write_all(&header.encode())?;
        self.channels = Some(channels);
        Ok(())
    }
}

impl VideoWriter for RawWriter {
    fn write(&mut self, image: &FrameImage) -> Result<(), MediaError> {
        if image.width() != self.width || image.height() != self.height {
            return Err(MediaError::WriteFailed(format!(
                "frame is {}x{}, writer expects {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            )));
        }

        match self.channels {
            None => self.write_header(image.channels())?,
            Some(channels) if channels != image.channels() => {
                return Err(MediaError::WriteFailed(format!(
                    "frame has {} channels, file has {channels}",
                    image.channels()
                )))
            }
            Some(_) => {}
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| MediaError::WriteFailed("writer is closed".to_string()))?;
        writer.write_all(image.as_slice())?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), MediaError> {
        if self.writer.is_none() {
            return Ok(());
        }
        if self.channels.is_none() {
            self.write_header(DEFAULT_CHANNELS)?;
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        debug!(path = %self.path.display(), frames = self.frames_written, "Closed vraw file");
        Ok(())
    }
}

impl Drop for RawWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Write a whole clip to `path` in one go.
pub fn write_clip(path: &Path, fps: f64, frames: &[FrameImage]) -> Result<(), MediaError> {
    let (width, height) = frames
        .first()
        .map(|f| (f.width(), f.height()))
        .ok_or_else(|| MediaError::WriteFailed("empty clip".to_string()))?;

    let settings = WriterSettings {
        width,
        height,
        fps,
        codec: "raw".to_string(),
        format: EXTENSION.to_string(),
    };
    let mut writer = RawWriter::create(path, &settings)?;
    for frame in frames {
        writer.write(frame)?;
    }
    writer.close()
}
