//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
const MAX_DEVICE_INDEX: u32 = 16;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb24,
    /// 8-bit grayscale (common IR camera output).
    Grey,
}

/// V4L2 camera device handle. The device is closed on drop.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

/// Format the driver agreed to.
struct Negotiated {
    width: u32,
    height: u32,
    fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a capture device by path, e.g. `/dev/video0`, and negotiate an
    /// RGB-convertible format.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(EBUSY) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let negotiated = negotiate(&device)?;
        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?negotiated.pixel_format,
            "camera ready"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format: negotiated.pixel_format,
        })
    }

    /// Start streaming. Frames are pulled with [`FrameStream::next_frame`].
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("mmap stream: {e}")))?;
        Ok(FrameStream {
            camera: self,
            stream,
        })
    }

    /// Capture a single frame on a short-lived stream.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        self.stream()?.next_frame()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn to_rgb(&self, buf: &[u8]) -> Result<RgbImage, CameraError> {
        let (w, h) = (self.width, self.height);
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, w, h),
            PixelFormat::Rgb24 => frame::rgb24_to_rgb(buf, w, h),
            PixelFormat::Grey => frame::grey_to_rgb(buf, w, h),
        }
        .map_err(|e| CameraError::CaptureFailed(format!("{:?} frame: {e}", self.pixel_format)))
    }

    /// Enumerate `/dev/video0` through `/dev/video15`, keeping devices that
    /// can capture video.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_DEVICE_INDEX)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

/// Request YUYV at the preferred size; the driver may substitute another
/// format, which is accepted when it is one [`PixelFormat`] covers.
fn negotiate(device: &Device) -> Result<Negotiated, CameraError> {
    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = REQUESTED_WIDTH;
    fmt.height = REQUESTED_HEIGHT;

    let fmt = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

    let pixel_format = pixel_format_for(fmt.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "driver chose {:?}; supported are YUYV, RGB3 and GREY",
            fmt.fourcc
        ))
    })?;

    Ok(Negotiated {
        width: fmt.width,
        height: fmt.height,
        fourcc: fmt.fourcc,
        pixel_format,
    })
}

/// An active memory-mapped capture stream borrowed from a [`Camera`].
pub struct FrameStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameStream<'_> {
    /// Block until the next frame is available and convert it to RGB.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;

        let image = self.camera.to_rgb(buf)?;

        Ok(Frame {
            image,
            sequence: meta.sequence,
        })
    }
}

fn pixel_format_for(fourcc: FourCC) -> Option<PixelFormat> {
    if fourcc == FourCC::new(b"YUYV") {
        Some(PixelFormat::Yuyv)
    } else if fourcc == FourCC::new(b"RGB3") {
        Some(PixelFormat::Rgb24)
    } else if fourcc == FourCC::new(b"GREY") {
        Some(PixelFormat::Grey)
    } else {
        None
    }
}
