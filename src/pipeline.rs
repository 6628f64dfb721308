//! Per-frame entry point
//!
//! Frames go through the installed calibration tool. Without one, they are
//! forwarded unchanged.

use image::{DynamicImage, RgbImage};
use std::time::Instant;
use tracing::{debug, info};

use crate::corrector::CalibTool;
use crate::error::CalibError;

pub struct FramePipeline {
    tool: Option<Box<dyn CalibTool>>,
    verbose: bool,
    last_arrival: Option<Instant>,
    processed: u64,
}

impl FramePipeline {
    pub fn new(tool: Option<Box<dyn CalibTool>>, verbose: bool) -> Self {
        Self {
            tool,
            verbose,
            last_arrival: None,
            processed: 0,
        }
    }

    /// Name of the active projection, `None` in pass-through mode
    pub fn projection(&self) -> Option<&'static str> {
        self.tool.as_ref().map(|t| t.name())
    }

    /// Frames successfully handed out so far
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Correct one frame, or convert it to RGB when no tool is installed
    pub fn process(&mut self, frame: &DynamicImage) -> Result<RgbImage, CalibError> {
        let start = Instant::now();
        if self.verbose {
            if let Some(last) = self.last_arrival {
                let interval = start.duration_since(last).as_secs_f64() * 1000.0;
                debug!("Frame interval {:.2} ms", interval);
            }
        }
        self.last_arrival = Some(start);

        let out = match self.tool.as_mut() {
            Some(tool) => tool.apply(frame)?,
            None => frame.to_rgb8(),
        };

        self.processed += 1;
        if self.verbose {
            info!(
                "Frame {} {}x{} processed in {:.2} ms",
                self.processed,
                out.width(),
                out.height(),
                start.elapsed().as_secs_f64() * 1000.0
            );
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrector::{open_calib_tool, CorrectorOptions};
    use crate::knobs::{Knobs, RuntimeKnobs};
    use crate::params::tests::sample_group;
    use image::{GrayImage, Luma, Rgb};
    use std::sync::Arc;

    #[test]
    fn test_pass_through_without_tool() {
        let mut pipeline = FramePipeline::new(None, false);
        assert_eq!(pipeline.projection(), None);

        let rgb = RgbImage::from_fn(6, 4, |x, y| Rgb([x as u8, y as u8, 7]));
        let out = pipeline.process(&DynamicImage::ImageRgb8(rgb.clone())).unwrap();
        assert_eq!(out, rgb);
        assert_eq!(pipeline.processed(), 1);
    }

    #[test]
    fn test_gray_pass_through_expands_to_rgb() {
        let mut pipeline = FramePipeline::new(None, true);
        let gray = GrayImage::from_pixel(3, 3, Luma([42]));
        let out = pipeline.process(&DynamicImage::ImageLuma8(gray)).unwrap();
        assert!(out.pixels().all(|p| p.0 == [42, 42, 42]));
    }

    #[test]
    fn test_tool_applied() {
        let knobs = Arc::new(RuntimeKnobs::new(Knobs {
            output_width: 16,
            output_height: 12,
            ..Default::default()
        }));
        let tool = open_calib_tool(&sample_group(), knobs, CorrectorOptions::default()).unwrap();
        let mut pipeline = FramePipeline::new(tool, true);
        assert_eq!(pipeline.projection(), Some("pinhole"));

        let frame = DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 24, Luma([128])));
        let out = pipeline.process(&frame).unwrap();
        assert_eq!(out.dimensions(), (16, 12));
        pipeline.process(&frame).unwrap();
        assert_eq!(pipeline.processed(), 2);
    }

    #[test]
    fn test_failed_frame_not_counted() {
        let knobs = Arc::new(RuntimeKnobs::default());
        let tool = open_calib_tool(&sample_group(), knobs, CorrectorOptions::default()).unwrap();
        let mut pipeline = FramePipeline::new(tool, false);
        let result = pipeline.process(&DynamicImage::ImageLuma8(GrayImage::new(0, 0)));
        assert!(matches!(result, Err(CalibError::EmptyFrame)));
        assert_eq!(pipeline.processed(), 0);
    }
}
