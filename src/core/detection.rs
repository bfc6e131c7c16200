use crate::core::contour::{find_external_contours, Contour};
use crate::core::filters::{
    bitwise_or, gaussian_blur, in_range, open_3x3, resize_cubic, rgb_to_hsv, threshold,
    ChannelRange,
};
use crate::types::{FireError, FireResult, GeoTransform, RasterTile, RgbImage};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Colour band selection for the fire mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    /// Per-channel distance to reference RGB colours
    Rgb,
    /// HSV range tables
    #[default]
    Hsv,
    /// Union of the HSV and RGB bands
    Combined,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionMethod::Rgb => write!(f, "rgb"),
            DetectionMethod::Hsv => write!(f, "hsv"),
            DetectionMethod::Combined => write!(f, "combined"),
        }
    }
}

impl FromStr for DetectionMethod {
    type Err = FireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rgb" => Ok(DetectionMethod::Rgb),
            "hsv" => Ok(DetectionMethod::Hsv),
            "combined" => Ok(DetectionMethod::Combined),
            _ => Err(FireError::InvalidConfig(format!(
                "Invalid detection method: {} (expected rgb, hsv or combined)",
                s
            ))),
        }
    }
}

/// HSV bands of the fire-temperature RGB composite: hot cores render white,
/// then yellow, cooler fronts orange.
pub const HSV_WHITE: ChannelRange = ChannelRange::new([0, 0, 200], [180, 50, 255]);
pub const HSV_YELLOW: ChannelRange = ChannelRange::new([20, 100, 100], [40, 255, 255]);
pub const HSV_ORANGE: ChannelRange = ChannelRange::new([5, 100, 100], [25, 255, 255]);

/// Reference colours for the RGB distance test
pub const RGB_WHITE: [u8; 3] = [255, 255, 255];
pub const RGB_YELLOW: [u8; 3] = [255, 255, 0];
pub const RGB_ORANGE: [u8; 3] = [255, 165, 0];

/// Anomaly detection and polygon filtering parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    pub method: DetectionMethod,
    /// Sub-pixel resampling factor (>= 1)
    pub upscale_factor: usize,
    /// Gaussian sigma applied to the soft mask, in upscaled pixels
    pub blur_sigma: f32,
    /// Cutoff in [0, 1] applied after blurring
    pub threshold_value: f32,
    /// Per-channel RGB tolerance
    pub tol: u8,
    /// Smallest polygon kept, hectares
    pub min_area_ha: f64,
    /// Simplification tolerance in degrees (0.001 ~ 100 m)
    pub simplify_tolerance: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            method: DetectionMethod::Hsv,
            upscale_factor: 4,
            blur_sigma: 3.0,
            threshold_value: 0.8,
            tol: 40,
            min_area_ha: 1.0,
            simplify_tolerance: 0.001,
        }
    }
}

impl DetectionParams {
    pub fn validate(&self) -> FireResult<()> {
        if self.upscale_factor == 0 {
            return Err(FireError::InvalidConfig("upscale_factor must be at least 1".to_string()));
        }
        if !(self.blur_sigma.is_finite() && self.blur_sigma > 0.0) {
            return Err(FireError::InvalidConfig(format!(
                "blur_sigma must be positive, got {}",
                self.blur_sigma
            )));
        }
        if !(0.0..=1.0).contains(&self.threshold_value) {
            return Err(FireError::InvalidConfig(format!(
                "threshold_value must lie in [0, 1], got {}",
                self.threshold_value
            )));
        }
        if !(self.min_area_ha.is_finite() && self.min_area_ha >= 0.0) {
            return Err(FireError::InvalidConfig(format!(
                "min_area_ha must be non-negative, got {}",
                self.min_area_ha
            )));
        }
        if !(self.simplify_tolerance.is_finite() && self.simplify_tolerance >= 0.0) {
            return Err(FireError::InvalidConfig(format!(
                "simplify_tolerance must be non-negative, got {}",
                self.simplify_tolerance
            )));
        }
        Ok(())
    }
}

/// Contours of one tile, in pixel space of the upscaled mask
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub contours: Vec<Contour>,
    /// Transform for the upscaled mask grid
    pub transform: GeoTransform,
    /// Final binary mask (0/1)
    pub mask: Array2<u8>,
}

/// Thermal anomaly detector
pub struct AnomalyDetector {
    params: DetectionParams,
}

impl AnomalyDetector {
    pub fn new(params: DetectionParams) -> FireResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Union of the selected colour bands, cleaned with a 3x3 opening
    pub fn color_mask(&self, rgb: &RgbImage) -> Array2<u8> {
        let (rows, cols, _) = rgb.dim();
        let mut mask = Array2::<u8>::zeros((rows, cols));

        if matches!(self.params.method, DetectionMethod::Hsv | DetectionMethod::Combined) {
            let hsv = rgb_to_hsv(rgb);
            for band in [HSV_WHITE, HSV_YELLOW, HSV_ORANGE] {
                mask = bitwise_or(&mask, &in_range(&hsv, &band));
            }
        }

        if matches!(self.params.method, DetectionMethod::Rgb | DetectionMethod::Combined) {
            for colour in [RGB_WHITE, RGB_YELLOW, RGB_ORANGE] {
                let band = ChannelRange::around(colour, self.params.tol);
                mask = bitwise_or(&mask, &in_range(rgb, &band));
            }
        }

        open_3x3(&mask)
    }

    /// Normalise, upscale, blur and re-threshold a 0/255 mask
    pub fn refine_mask(&self, mask: &Array2<u8>) -> Array2<u8> {
        let soft = mask.mapv(|v| f32::from(v) / 255.0);
        let soft = resize_cubic(&soft, self.params.upscale_factor);
        let soft = gaussian_blur(&soft, self.params.blur_sigma);
        threshold(&soft, self.params.threshold_value)
    }

    pub fn detect(&self, tile: &RasterTile) -> FireResult<DetectionResult> {
        let (rows, cols, bands) = (tile.height(), tile.width(), tile.pixels.dim().2);
        if bands != 3 {
            return Err(FireError::Decode(format!("Expected 3 bands, got {}", bands)));
        }
        log::debug!(
            "Detecting anomalies on {}x{} tile (method={}, upscale={})",
            cols, rows, self.params.method, self.params.upscale_factor
        );

        let mask = self.color_mask(&tile.pixels);
        let candidates = mask.iter().filter(|&&v| v > 0).count();
        log::debug!("{} candidate fire pixels after opening", candidates);

        let mask = if candidates == 0 {
            let f = self.params.upscale_factor;
            Array2::<u8>::zeros((rows * f, cols * f))
        } else {
            self.refine_mask(&mask)
        };

        let contours = if candidates == 0 { Vec::new() } else { find_external_contours(&mask) };

        Ok(DetectionResult {
            contours,
            transform: tile.transform.scaled(self.params.upscale_factor),
            mask,
        })
    }
}
