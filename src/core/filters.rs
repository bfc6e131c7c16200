//! Pixel-level building blocks for the anomaly detector: colour space
//! conversion, range masks, morphology, resampling and smoothing.
//!
//! Conventions follow the 8-bit OpenCV ones the fire-temperature colour
//! tables were tuned against: hue in `[0, 180)`, saturation and value in
//! `[0, 255]`.

use crate::types::RgbImage;
use ndarray::{Array2, Array3, Axis, Zip};

/// Binary mask value for "set"
pub const MASK_ON: u8 = 255;

/// Inclusive per-channel bounds for a 3-channel range test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl ChannelRange {
    pub const fn new(lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { lower, upper }
    }

    /// Box of half-width `tol` around `center`, clamped to the u8 range
    pub fn around(center: [u8; 3], tol: u8) -> Self {
        let mut lower = [0u8; 3];
        let mut upper = [0u8; 3];
        for c in 0..3 {
            lower[c] = center[c].saturating_sub(tol);
            upper[c] = center[c].saturating_add(tol);
        }
        Self { lower, upper }
    }

    #[inline]
    fn contains(&self, px: [u8; 3]) -> bool {
        (0..3).all(|c| px[c] >= self.lower[c] && px[c] <= self.upper[c])
    }
}

/// Convert one RGB pixel to 8-bit HSV
#[inline]
pub fn rgb_to_hsv_pixel(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (ri, gi, bi) = (i32::from(r), i32::from(g), i32::from(b));
    let v = ri.max(gi).max(bi);
    let vmin = ri.min(gi).min(bi);
    let diff = v - vmin;

    let s = if v == 0 {
        0
    } else {
        (f64::from(diff) * 255.0 / f64::from(v)).round() as i32
    };

    let h = if diff == 0 {
        0
    } else {
        let num = if v == ri {
            gi - bi
        } else if v == gi {
            bi - ri + 2 * diff
        } else {
            ri - gi + 4 * diff
        };
        let mut h = (f64::from(num) * 30.0 / f64::from(diff)).round() as i32;
        if h < 0 {
            h += 180;
        }
        h.min(179)
    };

    [h as u8, s as u8, v as u8]
}

pub fn rgb_to_hsv(rgb: &RgbImage) -> Array3<u8> {
    let mut hsv = Array3::<u8>::zeros(rgb.raw_dim());
    Zip::from(hsv.lanes_mut(Axis(2)))
        .and(rgb.lanes(Axis(2)))
        .for_each(|mut out, px| {
            let converted = rgb_to_hsv_pixel(px[0], px[1], px[2]);
            out[0] = converted[0];
            out[1] = converted[1];
            out[2] = converted[2];
        });
    hsv
}

/// 255 where every channel lies inside `range`, 0 elsewhere
pub fn in_range(image: &Array3<u8>, range: &ChannelRange) -> Array2<u8> {
    let (rows, cols, _) = image.dim();
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        let px = [image[[i, j, 0]], image[[i, j, 1]], image[[i, j, 2]]];
        if range.contains(px) {
            MASK_ON
        } else {
            0
        }
    })
}

pub fn bitwise_or(a: &Array2<u8>, b: &Array2<u8>) -> Array2<u8> {
    Zip::from(a).and(b).map_collect(|&x, &y| x | y)
}

fn morph_3x3(mask: &Array2<u8>, erode: bool) -> Array2<u8> {
    let (rows, cols) = mask.dim();
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        let mut acc = if erode { u8::MAX } else { 0 };
        for di in -1i64..=1 {
            for dj in -1i64..=1 {
                let ii = i as i64 + di;
                let jj = j as i64 + dj;
                // Out-of-bounds neighbours never affect the result
                if ii < 0 || jj < 0 || ii >= rows as i64 || jj >= cols as i64 {
                    continue;
                }
                let v = mask[[ii as usize, jj as usize]];
                acc = if erode { acc.min(v) } else { acc.max(v) };
            }
        }
        acc
    })
}

/// Morphological opening (erode then dilate) with a 3x3 square element
pub fn open_3x3(mask: &Array2<u8>) -> Array2<u8> {
    morph_3x3(&morph_3x3(mask, true), false)
}

/// Cubic convolution weights (a = -0.75) for an offset `t` in `[0, 1)`
#[inline]
fn cubic_weights(t: f32) -> [f32; 4] {
    const A: f32 = -0.75;
    let w0 = ((A * (t + 1.0) - 5.0 * A) * (t + 1.0) + 8.0 * A) * (t + 1.0) - 4.0 * A;
    let w1 = ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0;
    let w2 = ((A + 2.0) * (1.0 - t) - (A + 3.0)) * (1.0 - t) * (1.0 - t) + 1.0;
    let w3 = 1.0 - w0 - w1 - w2;
    [w0, w1, w2, w3]
}

/// Evaluate `f` at every index of a new array, across rows in parallel when
/// the `parallel` feature is enabled
fn fill_indexed<F>(shape: (usize, usize), f: F) -> Array2<f32>
where
    F: Fn((usize, usize)) -> f32 + Send + Sync,
{
    let mut out = Array2::<f32>::zeros(shape);
    #[cfg(feature = "parallel")]
    Zip::indexed(&mut out).par_for_each(|idx, v| *v = f(idx));
    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut out).for_each(|idx, v| *v = f(idx));
    out
}

fn cubic_resample_axis(src: &Array2<f32>, factor: usize, axis: Axis) -> Array2<f32> {
    let (rows, cols) = src.dim();
    let n_src = src.len_of(axis);
    let n_dst = n_src * factor;
    let scale = factor as f32;

    // Per destination index: four clamped source taps and their weights
    let taps: Vec<([usize; 4], [f32; 4])> = (0..n_dst)
        .map(|d| {
            let s = (d as f32 + 0.5) / scale - 0.5;
            let base = s.floor();
            let w = cubic_weights(s - base);
            let base = base as i64;
            let mut idx = [0usize; 4];
            for (k, slot) in idx.iter_mut().enumerate() {
                *slot = (base - 1 + k as i64).clamp(0, n_src as i64 - 1) as usize;
            }
            (idx, w)
        })
        .collect();

    let shape = if axis == Axis(0) { (n_dst, cols) } else { (rows, n_dst) };
    fill_indexed(shape, |(i, j)| {
        let (d, other) = if axis == Axis(0) { (i, j) } else { (j, i) };
        let (idx, w) = &taps[d];
        (0..4)
            .map(|k| {
                let v = if axis == Axis(0) { src[[idx[k], other]] } else { src[[other, idx[k]]] };
                v * w[k]
            })
            .sum()
    })
}

/// Bicubic upsampling by an integer factor in both axes
pub fn resize_cubic(src: &Array2<f32>, factor: usize) -> Array2<f32> {
    if factor <= 1 || src.is_empty() {
        return src.clone();
    }
    let horizontal = cubic_resample_axis(src, factor, Axis(1));
    cubic_resample_axis(&horizontal, factor, Axis(0))
}

/// Normalised 1-D Gaussian kernel; radius is `round(4 * sigma)`
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let ksize = ((sigma * 8.0 + 1.0).round() as usize) | 1;
    let half = (ksize / 2) as f32;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..ksize)
        .map(|i| {
            let x = i as f32 - half;
            (-(x * x) / denom).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// Mirror an index into `[0, n)` without repeating the edge sample
#[inline]
fn reflect101(mut i: i64, n: usize) -> usize {
    let n = n as i64;
    if n == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}

fn convolve_axis(src: &Array2<f32>, kernel: &[f32], axis: Axis) -> Array2<f32> {
    let n = src.len_of(axis);
    let half = (kernel.len() / 2) as i64;
    fill_indexed(src.dim(), |(i, j)| {
        let center = (if axis == Axis(0) { i } else { j }) as i64;
        kernel
            .iter()
            .enumerate()
            .map(|(k, w)| {
                let s = reflect101(center + k as i64 - half, n);
                let v = if axis == Axis(0) { src[[s, j]] } else { src[[i, s]] };
                v * w
            })
            .sum()
    })
}

/// Isotropic Gaussian blur
pub fn gaussian_blur(src: &Array2<f32>, sigma: f32) -> Array2<f32> {
    if src.is_empty() {
        return src.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let horizontal = convolve_axis(src, &kernel, Axis(1));
    convolve_axis(&horizontal, &kernel, Axis(0))
}

/// 1 where `value > threshold`, 0 elsewhere
pub fn threshold(src: &Array2<f32>, threshold: f32) -> Array2<u8> {
    src.mapv(|v| u8::from(v > threshold))
}
