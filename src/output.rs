// Corrected frame sink on a v4l2loopback device
//
// Frames are written with plain write() calls on a non-blocking descriptor.
// The device format is negotiated on the first frame and again whenever
// the frame size changes (the output size is a runtime knob).

use image::RgbImage;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::undistort::FrameSize;

/// Pixel formats the sink can negotiate, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFormat {
    Yuyv,
    Rgb24,
}

impl SinkFormat {
    const PREFERENCE: [SinkFormat; 2] = [SinkFormat::Yuyv, SinkFormat::Rgb24];

    fn fourcc(&self) -> u32 {
        match self {
            SinkFormat::Yuyv => u32::from_le_bytes(*b"YUYV"),
            SinkFormat::Rgb24 => u32::from_le_bytes(*b"RGB3"),
        }
    }

    fn bytes_per_pixel(&self) -> u32 {
        match self {
            SinkFormat::Yuyv => 2,
            SinkFormat::Rgb24 => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SinkFormat::Yuyv => "YUYV",
            SinkFormat::Rgb24 => "RGB24",
        }
    }

    /// Bytes per line and per frame for `size`
    fn layout(&self, size: FrameSize) -> io::Result<(u32, u32)> {
        let bytesperline = size.width.checked_mul(self.bytes_per_pixel());
        match bytesperline.and_then(|b| Some((b, b.checked_mul(size.height)?))) {
            Some(layout) => Ok(layout),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} frame of {} does not fit the device format", self.name(), size),
            )),
        }
    }

    /// Pack an RGB frame into this format
    pub fn pack(&self, frame: &RgbImage) -> Vec<u8> {
        match self {
            SinkFormat::Yuyv => rgb_to_yuyv(frame),
            SinkFormat::Rgb24 => frame.as_raw().clone(),
        }
    }
}

const VIDIOC_S_FMT: libc::c_ulong = 0xc0d05605;
const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
const V4L2_FIELD_NONE: u32 = 1;

#[repr(C)]
struct PixFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    enc: u32,
    quantization: u32,
    xfer_func: u32,
}

/// `struct v4l2_format` with the 200-byte union, 8-byte aligned
#[repr(C)]
struct Format {
    type_: u32,
    _align: u32,
    pix: PixFormat,
    _union_rest: [u8; 200 - std::mem::size_of::<PixFormat>()],
}

/// Writer for a v4l2loopback output device
pub struct LoopbackSink {
    device_path: String,
    file: Option<File>,
    format: SinkFormat,
    size: Option<FrameSize>,
    written: u64,
    dropped: u64,
    last_drop_warn: Option<Instant>,
}

impl LoopbackSink {
    /// Prepare a sink for `device_path`. The device must exist; the format
    /// is set once the first frame arrives.
    pub fn open(device_path: &str) -> io::Result<Self> {
        if !Path::new(device_path).exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Output device {} not found. Is v4l2loopback loaded?", device_path),
            ));
        }

        info!("Output device: {}", device_path);
        Ok(Self {
            device_path: device_path.to_string(),
            file: None,
            format: SinkFormat::Yuyv,
            size: None,
            written: 0,
            dropped: 0,
            last_drop_warn: None,
        })
    }

    /// Write one frame, renegotiating the device format if its size changed.
    /// A full device buffer drops the frame without error.
    pub fn write_frame(&mut self, frame: &RgbImage) -> io::Result<()> {
        let size = FrameSize::new(frame.width(), frame.height());
        if self.size != Some(size) || self.file.is_none() {
            self.negotiate(size)?;
        }

        let data = self.format.pack(frame);
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "Output device not open"));
        };

        match file.write_all(&data) {
            Ok(()) => {
                self.written += 1;
                if self.written % 100 == 0 {
                    debug!("Written {} frames to {}", self.written, self.device_path);
                }
                Ok(())
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)) => {
                self.record_drop();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn negotiate(&mut self, size: FrameSize) -> io::Result<()> {
        // The old descriptor keeps the old format; reopen for the new one
        self.file = None;
        self.size = None;

        let mut last_err = None;
        for format in SinkFormat::PREFERENCE {
            match self.open_with_format(format, size) {
                Ok(file) => {
                    info!("Output {} set to {} {}", self.device_path, size, format.name());
                    self.file = Some(file);
                    self.format = format;
                    self.size = Some(size);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Output format {} rejected: {}", format.name(), e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no output format accepted")
        }))
    }

    fn open_with_format(&self, format: SinkFormat, size: FrameSize) -> io::Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.device_path)?;

        let (bytesperline, sizeimage) = format.layout(size)?;
        let mut fmt = Format {
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            _align: 0,
            pix: PixFormat {
                width: size.width,
                height: size.height,
                pixelformat: format.fourcc(),
                field: V4L2_FIELD_NONE,
                bytesperline,
                sizeimage,
                colorspace: 0,
                priv_: 0,
                flags: 0,
                enc: 0,
                quantization: 0,
                xfer_func: 0,
            },
            _union_rest: [0u8; 200 - std::mem::size_of::<PixFormat>()],
        };

        // SAFETY: `fmt` matches the kernel's struct v4l2_format layout and
        // outlives the call.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), VIDIOC_S_FMT, &mut fmt as *mut Format) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        if fmt.pix.width != size.width || fmt.pix.height != size.height {
            warn!(
                "Output accepted {}x{} instead of {}",
                fmt.pix.width, fmt.pix.height, size
            );
        }

        Ok(file)
    }

    fn record_drop(&mut self) {
        self.dropped += 1;
        let due = self
            .last_drop_warn
            .map_or(true, |last| last.elapsed() >= Duration::from_secs(5));
        if due {
            warn!(
                "Output buffer full, frame dropped (dropped: {}, written: {})",
                self.dropped, self.written
            );
            self.last_drop_warn = Some(Instant::now());
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Drop for LoopbackSink {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            info!("Output {} closed after {} frames", self.device_path, self.written);
        }
    }
}

/// Pack RGB into YUYV 4:2:2 (BT.601, studio range). Chroma is the average
/// of each horizontal pixel pair; an odd last column is paired with itself.
pub fn rgb_to_yuyv(frame: &RgbImage) -> Vec<u8> {
    let (w, h) = (frame.width(), frame.height());
    let mut out = Vec::with_capacity(((w + 1) / 2 * 2 * h * 2) as usize);

    for y in 0..h {
        for x in (0..w).step_by(2) {
            let [r1, g1, b1] = frame.get_pixel(x, y).0.map(i32::from);
            let [r2, g2, b2] = frame.get_pixel((x + 1).min(w - 1), y).0.map(i32::from);

            let luma = |r: i32, g: i32, b: i32| ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            let (r, g, b) = ((r1 + r2) / 2, (g1 + g2) / 2, (b1 + b2) / 2);
            let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
            let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;

            out.extend_from_slice(&[
                luma(r1, g1, b1).clamp(0, 255) as u8,
                u.clamp(0, 255) as u8,
                luma(r2, g2, b2).clamp(0, 255) as u8,
                v.clamp(0, 255) as u8,
            ]);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_fourcc() {
        assert_eq!(SinkFormat::Yuyv.fourcc(), 0x56595559);
        assert_eq!(SinkFormat::Rgb24.fourcc(), 0x33424752);
    }

    #[test]
    fn test_format_struct_size() {
        assert_eq!(std::mem::size_of::<PixFormat>(), 48);
        assert_eq!(std::mem::size_of::<Format>(), 208);
    }

    #[test]
    fn test_yuyv_gray_and_white() {
        let gray = RgbImage::from_pixel(2, 1, Rgb([128, 128, 128]));
        let yuyv = rgb_to_yuyv(&gray);
        assert_eq!(yuyv.len(), 4);
        assert_eq!(yuyv[1], 128);
        assert_eq!(yuyv[3], 128);
        assert_eq!(yuyv[0], yuyv[2]);

        let white = rgb_to_yuyv(&RgbImage::from_pixel(2, 1, Rgb([255, 255, 255])));
        assert_eq!(white[0], 235);
        let black = rgb_to_yuyv(&RgbImage::new(2, 1));
        assert_eq!(black[0], 16);
    }

    #[test]
    fn test_yuyv_odd_width() {
        let frame = RgbImage::from_pixel(3, 2, Rgb([10, 200, 30]));
        assert_eq!(rgb_to_yuyv(&frame).len(), 2 * 2 * 4);
    }

    #[test]
    fn test_pack_rgb24() {
        let frame = RgbImage::from_fn(2, 2, |x, y| Rgb([x as u8, y as u8, 9]));
        assert_eq!(SinkFormat::Rgb24.pack(&frame), frame.as_raw().clone());
        assert_eq!(SinkFormat::Yuyv.pack(&frame).len(), 8);
    }

    #[test]
    fn test_layout_overflow_rejected() {
        let (line, frame) = SinkFormat::Yuyv.layout(FrameSize::new(640, 480)).unwrap();
        assert_eq!((line, frame), (1280, 614400));

        let huge = FrameSize::new(u32::MAX, u32::MAX);
        let err = SinkFormat::Rgb24.layout(huge).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(SinkFormat::Yuyv.layout(FrameSize::new(60_000, 60_000)).is_err());
    }

    #[test]
    fn test_missing_device() {
        let err = LoopbackSink::open("/nonexistent/video99").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
