//! Frame source: V4L2 capture loop
//!
//! Captures from a V4L2 device, decodes each buffer into a frame, runs it
//! through the [`FramePipeline`] and hands the result to the loopback sink.
//!
//! MJPEG is decoded with turbojpeg (libjpeg-turbo, SIMD) and falls back to
//! jpeg-decoder. Raw Bayer and GREY buffers become single-channel frames so
//! the corrector can demosaic them.

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GrayImage, RgbImage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::config::{CaptureFormat, VideoConfig};
use crate::demosaic::BayerPattern;
use crate::output::LoopbackSink;
use crate::pipeline::FramePipeline;
use crate::server::AppState;
use crate::undistort::FrameSize;

thread_local! {
    static JPEG_DECOMPRESSOR: std::cell::RefCell<Option<turbojpeg::Decompressor>> =
        std::cell::RefCell::new(turbojpeg::Decompressor::new().ok());
}

const COMPRESSED_FORMATS: &[&[u8; 4]] = &[b"MJPG", b"YUYV", b"RGB3", b"BGR3"];
const UNCOMPRESSED_FORMATS: &[&[u8; 4]] = &[b"YUYV", b"MJPG", b"RGB3", b"BGR3"];
const RAW_FORMATS: &[&[u8; 4]] = &[b"BA81", b"GBRG", b"GRBG", b"RGGB", b"GREY", b"MJPG", b"YUYV"];

/// Capture formats to try, in order, for the configured preference
fn preferred_formats(format: CaptureFormat) -> &'static [&'static [u8; 4]] {
    match format {
        CaptureFormat::Mjpeg => COMPRESSED_FORMATS,
        CaptureFormat::Yuyv => UNCOMPRESSED_FORMATS,
        CaptureFormat::Bayer => RAW_FORMATS,
    }
}

/// Filter layout implied by an 8-bit Bayer fourcc
pub fn fourcc_pattern(fourcc: &[u8; 4]) -> Option<BayerPattern> {
    match fourcc {
        b"BA81" => Some(BayerPattern::Bggr),
        b"GBRG" => Some(BayerPattern::Gbrg),
        b"GRBG" => Some(BayerPattern::Grbg),
        b"RGGB" => Some(BayerPattern::Rggb),
        _ => None,
    }
}

/// Minimum time between repeated per-frame warnings
const WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Run the capture loop until the quit flag is set or a fatal error occurs
pub fn run_capture(
    video: &VideoConfig,
    bayer_pattern: BayerPattern,
    mut pipeline: FramePipeline,
    state: Arc<AppState>,
) -> Result<()> {
    info!("Input device: {}", video.input_device);
    info!("Requested resolution: {}x{} @ {} fps", video.width, video.height, video.fps);

    let dev = Device::with_path(&video.input_device)
        .with_context(|| format!("Failed to open input device: {}", video.input_device))?;

    let caps = dev.query_caps().context("Failed to query device capabilities")?;
    info!("Camera: {} (driver: {})", caps.card, caps.driver);

    let format = configure_capture_format(&dev, video)?;
    let fourcc = format.fourcc.repr;
    info!(
        "Capture format: {}x{} {}",
        format.width,
        format.height,
        String::from_utf8_lossy(&fourcc)
    );

    if let Some(pattern) = fourcc_pattern(&fourcc) {
        if pattern != bayer_pattern {
            warn!(
                "Camera delivers {} data but processing is set to {}",
                pattern.as_str(),
                bayer_pattern.as_str()
            );
        }
    }

    if let Err(e) = set_frame_rate(&dev, video.fps) {
        warn!("Could not set frame rate to {} fps: {}", video.fps, e);
    }

    let mut sink = match &video.output_device {
        Some(path) => Some(
            LoopbackSink::open(path)
                .with_context(|| format!("Failed to open output device: {}", path))?,
        ),
        None => {
            warn!("No output device configured, incoming frames are not processed");
            None
        }
    };

    let mut stream = Stream::with_buffers(&dev, Type::VideoCapture, 4)
        .context("Failed to create capture stream")?;

    info!("Starting capture loop...");

    let (width, height) = (format.width, format.height);
    let mut frame_count = 0u64;
    let mut last_stats_time = Instant::now();
    let stats_interval = Duration::from_secs(10);
    let mut last_warn: Option<Instant> = None;

    loop {
        if state.quit_requested() {
            info!("Quit requested, stopping capture loop");
            return Ok(());
        }

        let (buf, _meta) = stream.next().context("Failed to capture frame")?;

        let Some(sink) = sink.as_mut() else {
            continue;
        };

        let frame = match decode_frame(&fourcc, buf, width, height) {
            Ok(frame) => frame,
            Err(e) => {
                warn_limited(&mut last_warn, format_args!("Failed to decode frame: {}", e));
                continue;
            }
        };
        let input_size = FrameSize::new(frame.width(), frame.height());

        let corrected = match pipeline.process(&frame) {
            Ok(corrected) => corrected,
            Err(e) if e.is_fatal() => {
                error!("{}", e);
                return Err(e.into());
            }
            Err(e) => {
                warn_limited(&mut last_warn, format_args!("Frame dropped: {}", e));
                continue;
            }
        };

        if let Err(e) = sink.write_frame(&corrected) {
            warn_limited(&mut last_warn, format_args!("Failed to write to output: {}", e));
        }

        state.record_frame(input_size);
        frame_count += 1;
        if frame_count % 3 == 0 {
            state.update_preview(&corrected);
        }

        if last_stats_time.elapsed() >= stats_interval {
            let elapsed = last_stats_time.elapsed().as_secs_f64();
            info!(
                "Performance: {:.1} fps ({} frames in {:.1}s, {} total, {} written, {} dropped)",
                frame_count as f64 / elapsed,
                frame_count,
                elapsed,
                pipeline.processed(),
                sink.written(),
                sink.dropped()
            );
            frame_count = 0;
            last_stats_time = Instant::now();
        }
    }
}

fn warn_limited(last: &mut Option<Instant>, message: std::fmt::Arguments) {
    if last.map_or(true, |t| t.elapsed() >= WARN_INTERVAL) {
        warn!("{}", message);
        *last = Some(Instant::now());
    } else {
        debug!("{}", message);
    }
}

/// Configure the capture format, trying preferred formats in order
fn configure_capture_format(dev: &Device, video: &VideoConfig) -> Result<v4l::Format> {
    let formats = dev.enum_formats().context("Failed to enumerate formats")?;

    info!("Available formats:");
    for fmt in &formats {
        info!("  {}: {}", String::from_utf8_lossy(&fmt.fourcc.repr), fmt.description);
    }

    for preferred in preferred_formats(video.format) {
        let fourcc = FourCC::new(preferred);
        if !formats.iter().any(|f| f.fourcc == fourcc) {
            continue;
        }

        let mut format = dev.format().context("Failed to get current format")?;
        format.width = video.width;
        format.height = video.height;
        format.fourcc = fourcc;

        match dev.set_format(&format) {
            Ok(actual) => return Ok(actual),
            Err(e) => warn!(
                "Could not set format {} at {}x{}: {}",
                String::from_utf8_lossy(*preferred),
                video.width,
                video.height,
                e
            ),
        }
    }

    let current = dev.format().context("Failed to get device format")?;
    warn!(
        "No preferred format accepted, using device format {}x{} {}",
        current.width,
        current.height,
        String::from_utf8_lossy(&current.fourcc.repr)
    );
    Ok(current)
}

fn set_frame_rate(dev: &Device, fps: u32) -> Result<()> {
    let mut params = dev.params().context("Failed to get parameters")?;
    params.interval = v4l::Fraction::new(1, fps);
    dev.set_params(&params).context("Failed to set parameters")?;

    let actual = dev.params().context("Failed to read back parameters")?;
    info!(
        "Frame interval {}/{} ({:.1} fps, requested {})",
        actual.interval.numerator,
        actual.interval.denominator,
        actual.interval.denominator as f64 / actual.interval.numerator.max(1) as f64,
        fps
    );
    Ok(())
}

/// Decode one capture buffer into a frame
pub fn decode_frame(fourcc: &[u8; 4], buf: &[u8], width: u32, height: u32) -> Result<DynamicImage> {
    let (w, h) = (width as usize, height as usize);
    match fourcc {
        b"MJPG" | b"JPEG" => decode_mjpeg(buf),
        b"YUYV" => {
            ensure_len(buf, w * h * 2)?;
            Ok(DynamicImage::ImageRgb8(yuyv_to_rgb(buf, width, height)))
        }
        b"RGB3" => {
            ensure_len(buf, w * h * 3)?;
            rgb_image(width, height, buf[..w * h * 3].to_vec())
        }
        b"BGR3" => {
            ensure_len(buf, w * h * 3)?;
            let rgb = buf[..w * h * 3]
                .chunks_exact(3)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect();
            rgb_image(width, height, rgb)
        }
        b"BA81" | b"GBRG" | b"GRBG" | b"RGGB" | b"GREY" => {
            ensure_len(buf, w * h)?;
            GrayImage::from_raw(width, height, buf[..w * h].to_vec())
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| anyhow!("Failed to create {}x{} frame", width, height))
        }
        other => Err(anyhow!("Unsupported capture format {}", String::from_utf8_lossy(other))),
    }
}

fn ensure_len(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(anyhow!("Short buffer: {} bytes, expected {}", buf.len(), expected));
    }
    Ok(())
}

fn rgb_image(width: u32, height: u32, data: Vec<u8>) -> Result<DynamicImage> {
    RgbImage::from_raw(width, height, data)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| anyhow!("Failed to create {}x{} frame", width, height))
}

/// Decode MJPEG with turbojpeg, falling back to jpeg-decoder. The frame
/// size comes from the JPEG header.
fn decode_mjpeg(data: &[u8]) -> Result<DynamicImage> {
    let turbo = JPEG_DECOMPRESSOR.with(|decomp| {
        let mut decomp = decomp.borrow_mut();
        let decompressor = decomp.as_mut()?;
        let header = decompressor.read_header(data).ok()?;
        let mut pixels = vec![0u8; header.width * header.height * 3];
        let image = turbojpeg::Image {
            pixels: pixels.as_mut_slice(),
            width: header.width,
            pitch: header.width * 3,
            height: header.height,
            format: turbojpeg::PixelFormat::RGB,
        };
        decompressor.decompress(data, image).ok()?;
        RgbImage::from_raw(header.width as u32, header.height as u32, pixels)
    });

    match turbo {
        Some(rgb) => Ok(DynamicImage::ImageRgb8(rgb)),
        None => decode_mjpeg_software(data),
    }
}

fn decode_mjpeg_software(data: &[u8]) -> Result<DynamicImage> {
    let mut decoder = jpeg_decoder::Decoder::new(std::io::Cursor::new(data));
    let pixels = decoder.decode().context("JPEG decode failed")?;
    let info = decoder.info().ok_or_else(|| anyhow!("JPEG without header"))?;
    let (width, height) = (info.width as u32, info.height as u32);

    match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => rgb_image(width, height, pixels),
        jpeg_decoder::PixelFormat::L8 => GrayImage::from_raw(width, height, pixels)
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(|| anyhow!("Failed to create {}x{} frame", width, height)),
        other => Err(anyhow!("Unsupported JPEG pixel format {:?}", other)),
    }
}

/// Convert YUYV to RGB using fixed-point BT.601
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> RgbImage {
    let mut rgb = RgbImage::new(width, height);
    let pixels = (width * height) as usize;

    for (pair, chunk) in rgb.chunks_exact_mut(6).zip(yuyv.chunks_exact(4)).take(pixels / 2) {
        let y0 = chunk[0] as i32;
        let u = chunk[1] as i32 - 128;
        let y1 = chunk[2] as i32;
        let v = chunk[3] as i32 - 128;

        let v_r = (359 * v) >> 8;
        let uv_g = (88 * u + 183 * v) >> 8;
        let u_b = (454 * u) >> 8;

        for (i, y) in [y0, y1].into_iter().enumerate() {
            pair[i * 3] = (y + v_r).clamp(0, 255) as u8;
            pair[i * 3 + 1] = (y - uv_g).clamp(0, 255) as u8;
            pair[i * 3 + 2] = (y + u_b).clamp(0, 255) as u8;
        }
    }

    rgb
}
