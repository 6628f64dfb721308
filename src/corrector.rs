//! Per-frame image correction
//!
//! A [`CalibTool`] turns one raw camera frame into one corrected RGB frame.
//! The pinhole tool undistorts with a lazily built lookup table and then
//! runs the fixed adjustment chain:
//! demosaic -> remap -> resize -> saturation -> sharpen -> cross-hair.

use image::{DynamicImage, GrayImage, RgbImage};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::demosaic::{demosaic, BayerPattern, DemosaicMethod};
use crate::enhance;
use crate::error::CalibError;
use crate::knobs::RuntimeKnobs;
use crate::params::PinholeParams;
use crate::undistort::{FrameSize, Intrinsics, UndistortMap};

/// Projection used when the group does not name one
pub const DEFAULT_PROJECTION: &str = "pinhole";

/// An image calibration stage
pub trait CalibTool: Send {
    /// Projection name this tool implements
    fn name(&self) -> &'static str;

    /// Correct a single frame
    fn apply(&mut self, frame: &DynamicImage) -> Result<RgbImage, CalibError>;
}

/// Options that are fixed for the lifetime of a tool
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrectorOptions {
    pub bayer_pattern: BayerPattern,
    pub demosaic: DemosaicMethod,
}

/// Create the calibration tool named by the group's `projection` key.
///
/// Returns `Ok(None)` for projections with no implementation, in which case
/// frames pass through untouched. Parameter errors abort activation.
pub fn open_calib_tool(
    group: &toml::Table,
    knobs: Arc<RuntimeKnobs>,
    options: CorrectorOptions,
) -> Result<Option<Box<dyn CalibTool>>, CalibError> {
    let projection = group
        .get("projection")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_PROJECTION);

    match projection {
        "pinhole" => {
            let params = PinholeParams::from_group(group)?;
            info!(
                "Pinhole calibration for {} (bayer {}, {:?} demosaic)",
                params.calib_size,
                options.bayer_pattern.as_str(),
                options.demosaic
            );
            Ok(Some(Box::new(PinholeCorrector::new(params, knobs, options))))
        }
        other => {
            warn!("No calibration tool for projection \"{}\", frames pass through", other);
            Ok(None)
        }
    }
}

/// Undistortion for a pinhole camera with radial/tangential distortion
pub struct PinholeCorrector {
    params: PinholeParams,
    knobs: Arc<RuntimeKnobs>,
    options: CorrectorOptions,
    /// Intrinsics scaled to the last seen frame size
    scaled: Intrinsics,
    /// None until the first frame, and again after reconfiguration
    map: Option<UndistortMap>,
    last_size: Option<FrameSize>,
}

impl PinholeCorrector {
    pub fn new(params: PinholeParams, knobs: Arc<RuntimeKnobs>, options: CorrectorOptions) -> Self {
        Self {
            scaled: params.intrinsics,
            params,
            knobs,
            options,
            map: None,
            last_size: None,
        }
    }

    /// Rebuild the lookup table if there is none or the frame size changed
    fn ensure_map(&mut self, size: FrameSize) -> Result<&UndistortMap, CalibError> {
        let map = match self.map.take() {
            Some(map) if self.last_size == Some(size) && map.size() == size => map,
            _ => {
                debug!(
                    "Building undistortion map for {} (calibrated at {})",
                    size, self.params.calib_size
                );
                let scaled = self.params.intrinsics.scaled(size, self.params.calib_size);
                let map = UndistortMap::build(&scaled, &self.params.distortion, size)?;
                self.scaled = scaled;
                map
            }
        };

        Ok(&*self.map.insert(map))
    }
}

#[cfg(test)]
impl PinholeCorrector {
    fn params(&self) -> &PinholeParams {
        &self.params
    }

    /// Intrinsics in effect for the current frame size
    fn scaled_intrinsics(&self) -> &Intrinsics {
        &self.scaled
    }

    fn has_map(&self) -> bool {
        self.map.is_some()
    }
}

impl CalibTool for PinholeCorrector {
    fn name(&self) -> &'static str {
        "pinhole"
    }

    fn apply(&mut self, frame: &DynamicImage) -> Result<RgbImage, CalibError> {
        let size = FrameSize::new(frame.width(), frame.height());
        if size.is_empty() {
            return Err(CalibError::EmptyFrame);
        }

        let knobs = self.knobs.snapshot();
        let options = self.options;
        let map = self.ensure_map(size)?;

        // Colour frames are reduced to one channel and treated as Bayer data too
        let raw: Cow<GrayImage> = match frame {
            DynamicImage::ImageLuma8(gray) => Cow::Borrowed(gray),
            other => Cow::Owned(enhance::to_gray(other)),
        };
        let color = demosaic(&raw, options.bayer_pattern, options.demosaic);
        let remapped = map.remap(&color)?;

        let mut out = match knobs.output_size() {
            Some(out_size) => enhance::resize(&remapped, out_size)?,
            None => remapped,
        };

        if knobs.saturation != 0.0 {
            enhance::shift_saturation(&mut out, knobs.saturation);
        }

        if knobs.sharpen != 0.0 {
            out = enhance::sharpen(&out, knobs.sharpen);
        }

        if self.params.draw_center_cross {
            enhance::draw_center_cross(&mut out, self.scaled.cx as i32, self.scaled.cy as i32);
        }

        self.last_size = Some(size);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knobs::{Knobs, KnobsUpdate};
    use crate::params::tests::sample_group;
    use crate::params::REQUIRED_KEYS;
    use crate::undistort::Distortion;
    use image::{Luma, Rgb};

    fn neutral_knobs() -> Arc<RuntimeKnobs> {
        Arc::new(RuntimeKnobs::new(Knobs { saturation: 0.0, ..Default::default() }))
    }

    fn flat_params() -> PinholeParams {
        PinholeParams {
            calib_size: FrameSize::new(32, 24),
            intrinsics: Intrinsics { fx: 40.0, fy: 40.0, cx: 16.0, cy: 12.0 },
            distortion: Distortion::default(),
            draw_center_cross: false,
        }
    }

    fn pinhole(params: PinholeParams, knobs: Arc<RuntimeKnobs>) -> PinholeCorrector {
        PinholeCorrector::new(params, knobs, CorrectorOptions::default())
    }

    fn bayer_frame(w: u32, h: u32) -> DynamicImage {
        let gray = GrayImage::from_fn(w, h, |x, y| Luma([((x * 7 + y * 13) % 251) as u8]));
        DynamicImage::ImageLuma8(gray)
    }

    #[test]
    fn test_factory_builds_pinhole() {
        let tool = open_calib_tool(&sample_group(), neutral_knobs(), CorrectorOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(tool.name(), "pinhole");
    }

    #[test]
    fn test_factory_missing_key_installs_nothing() {
        for key in REQUIRED_KEYS {
            let mut group = sample_group();
            group.remove(key);
            let result = open_calib_tool(&group, neutral_knobs(), CorrectorOptions::default());
            assert!(matches!(result, Err(CalibError::MissingKey(k)) if k == key));
        }
    }

    #[test]
    fn test_factory_unknown_projection_passes_through() {
        let mut group = sample_group();
        group.insert("projection".into(), toml::Value::String("spherical".into()));
        let tool = open_calib_tool(&group, neutral_knobs(), CorrectorOptions::default()).unwrap();
        assert!(tool.is_none());
    }

    #[test]
    fn test_map_built_lazily_and_rebuilt_on_resize() {
        let mut corrector = pinhole(flat_params(), neutral_knobs());
        assert!(!corrector.has_map());

        corrector.apply(&bayer_frame(32, 24)).unwrap();
        assert!(corrector.has_map());
        assert_eq!(corrector.scaled_intrinsics(), &flat_params().intrinsics);

        corrector.apply(&bayer_frame(64, 24)).unwrap();
        let scaled = corrector.scaled_intrinsics();
        assert_eq!(scaled.fx, 80.0);
        assert_eq!(scaled.cx, 32.0);
        assert_eq!(scaled.fy, 40.0);
        assert_eq!(scaled.cy, 12.0);
        assert_eq!(corrector.params().distortion, Distortion::default());
    }

    #[test]
    fn test_output_size_follows_knobs() {
        let knobs = neutral_knobs();
        let mut corrector = pinhole(flat_params(), knobs.clone());

        let out = corrector.apply(&bayer_frame(32, 24)).unwrap();
        assert_eq!(out.dimensions(), (32, 24));

        let update = KnobsUpdate {
            output_width: Some(50),
            output_height: Some(30),
            ..Default::default()
        };
        knobs.apply(&update).unwrap();
        let out = corrector.apply(&bayer_frame(32, 24)).unwrap();
        assert_eq!(out.dimensions(), (50, 30));
        let out = corrector.apply(&bayer_frame(64, 48)).unwrap();
        assert_eq!(out.dimensions(), (50, 30));
    }

    #[test]
    fn test_oversized_output_drops_frame() {
        let knobs = Knobs {
            saturation: 0.0,
            output_width: u32::MAX,
            output_height: u32::MAX,
            sharpen: 0.0,
        };
        let mut corrector = pinhole(flat_params(), Arc::new(RuntimeKnobs::new(knobs)));
        let result = corrector.apply(&bayer_frame(32, 24));
        match result {
            Err(e @ CalibError::OutputTooLarge(_)) => assert!(!e.is_fatal()),
            other => panic!("unexpected {:?}", other.map(|img| img.dimensions())),
        }
    }

    #[test]
    fn test_neutral_knobs_match_demosaic_and_remap() {
        let options = CorrectorOptions::default();
        let mut corrector = pinhole(flat_params(), neutral_knobs());
        let frame = bayer_frame(32, 24);
        let out = corrector.apply(&frame).unwrap();

        let raw = frame.as_luma8().unwrap();
        let expected = demosaic(raw, options.bayer_pattern, options.demosaic);
        let size = FrameSize::new(32, 24);
        let map = UndistortMap::build(&flat_params().intrinsics, &Distortion::default(), size)
            .unwrap();
        assert_eq!(out, map.remap(&expected).unwrap());
    }

    #[test]
    fn test_color_frame_goes_through_grayscale() {
        let mut corrector = pinhole(flat_params(), neutral_knobs());
        let rgb = RgbImage::from_pixel(32, 24, Rgb([90, 90, 90]));
        let out = corrector.apply(&DynamicImage::ImageRgb8(rgb)).unwrap();
        assert!(out.pixels().all(|p| p.0 == [90, 90, 90]));

        // BT.601 weights: pure green reduces to 150 on every site
        let green = RgbImage::from_pixel(32, 24, Rgb([0, 255, 0]));
        let out = corrector.apply(&DynamicImage::ImageRgb8(green)).unwrap();
        assert!(out.pixels().all(|p| p.0 == [150, 150, 150]));
    }

    #[test]
    fn test_saturation_and_sharpen_change_output() {
        let knobs = neutral_knobs();
        let mut corrector = pinhole(flat_params(), knobs.clone());
        let frame = bayer_frame(32, 24);
        let plain = corrector.apply(&frame).unwrap();

        knobs.set_saturation(-255.0);
        let gray = corrector.apply(&frame).unwrap();
        assert!(gray.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));

        knobs.set_saturation(0.0);
        knobs.set_sharpen(2.0);
        let sharp = corrector.apply(&frame).unwrap();
        assert_ne!(sharp, plain);
    }

    #[test]
    fn test_center_cross_at_scaled_principal_point() {
        let mut params = flat_params();
        params.draw_center_cross = true;
        let mut corrector = pinhole(params, neutral_knobs());
        let frame = DynamicImage::ImageLuma8(GrayImage::new(64, 48));
        let out = corrector.apply(&frame).unwrap();
        assert_eq!(out.get_pixel(32, 24).0, [255, 255, 255]);
        assert_eq!(out.get_pixel(40, 24).0, [255, 255, 255]);
        assert_eq!(out.get_pixel(16, 12).0, [0, 0, 0]);
    }

    #[test]
    fn test_empty_frame_rejected() {
        let mut corrector = pinhole(flat_params(), neutral_knobs());
        let frame = DynamicImage::ImageLuma8(GrayImage::new(0, 10));
        assert!(matches!(corrector.apply(&frame), Err(CalibError::EmptyFrame)));
        assert!(!corrector.has_map());
    }
}
