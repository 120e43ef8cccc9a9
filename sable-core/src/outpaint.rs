//! Outpainting seed noise: synthesizes fill noise whose spatial-frequency
//! spectrum and per-channel color distribution match the unmasked region of
//! a source image, so diffusion in the masked zone stays coherent with the
//! surrounding content.

use std::cmp::Ordering;

use ndarray::{Array2, Array3, ArrayView2};
use num_complex::Complex;
use rand::Rng;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Spectral envelope applied to the raw noise before reshaping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    Gaussian,
    #[default]
    Rational,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct NoiseMatchOptions {
    /// Exponent on the source spectral magnitude; lower values keep more
    /// high-frequency detail. Must be > 0.
    pub noise_q: f64,
    /// 0 blends the starting noise fully to greyscale, 1 keeps it colored.
    pub color_variation: f64,
    pub window_mode: WindowMode,
}

impl Default for NoiseMatchOptions {
    fn default() -> Self {
        Self { noise_q: 1.0, color_variation: 0.01, window_mode: WindowMode::default() }
    }
}

impl NoiseMatchOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.noise_q > 0.0) {
            return Err(Error::config(format!("noise_q must be > 0, got {}", self.noise_q)));
        }
        if !(0.0..=1.0).contains(&self.color_variation) {
            return Err(Error::config(format!(
                "color_variation must be within [0, 1], got {}",
                self.color_variation
            )));
        }
        Ok(())
    }
}

/// Cyclic shift of a 2-D complex array by `(dy, dx)`.
fn roll2(data: &Array2<Complex<f64>>, dy: usize, dx: usize) -> Array2<Complex<f64>> {
    let (h, w) = data.dim();
    Array2::from_shape_fn((h, w), |(y, x)| data[((y + h - dy) % h, (x + w - dx) % w)])
}

fn fftshift(data: &Array2<Complex<f64>>) -> Array2<Complex<f64>> {
    let (h, w) = data.dim();
    roll2(data, h / 2, w / 2)
}

fn ifftshift(data: &Array2<Complex<f64>>) -> Array2<Complex<f64>> {
    let (h, w) = data.dim();
    roll2(data, h - h / 2, w - w / 2)
}

/// Ortho-normalized centered 2-D FFT: shift, transform rows then columns,
/// scale by `1/sqrt(N)`, unshift.
fn fft2(data: &Array2<Complex<f64>>, inverse: bool) -> Array2<Complex<f64>> {
    let (h, w) = data.dim();
    let mut planner = FftPlanner::new();
    let row_fft = if inverse { planner.plan_fft_inverse(w) } else { planner.plan_fft_forward(w) };
    let col_fft = if inverse { planner.plan_fft_inverse(h) } else { planner.plan_fft_forward(h) };

    let shifted = fftshift(data);
    let mut rows: Vec<Complex<f64>> = shifted.iter().copied().collect();
    for row in rows.chunks_exact_mut(w) {
        row_fft.process(row);
    }
    let mut out = Array2::from_shape_vec((h, w), rows).expect("row-major fft buffer");
    let mut column = vec![Complex::new(0.0, 0.0); h];
    for x in 0..w {
        for y in 0..h {
            column[y] = out[(y, x)];
        }
        col_fft.process(&mut column);
        for y in 0..h {
            out[(y, x)] = column[y];
        }
    }
    let scale = 1.0 / ((h * w) as f64).sqrt();
    out.mapv_inplace(|v| v * scale);
    ifftshift(&out)
}

fn fft2_real(data: ArrayView2<'_, f64>) -> Array2<Complex<f64>> {
    let complex = data.mapv(|v| Complex::new(v, 0.0));
    fft2(&complex, false)
}

fn ifft2_real(data: &Array2<Complex<f64>>) -> Array2<f64> {
    fft2(data, true).mapv(|v| v.re)
}

/// Radially symmetric window over normalized frequency coordinates.
fn radial_window(h: usize, w: usize, std: f64, mode: WindowMode) -> Array2<f64> {
    let min_dim = h.min(w) as f64;
    let scale_x = w as f64 / min_dim;
    let scale_y = h as f64 / min_dim;
    Array2::from_shape_fn((h, w), |(y, x)| {
        let fx = (x as f64 / w as f64 * 2.0 - 1.0) * scale_x;
        let fy = (y as f64 / h as f64 * 2.0 - 1.0) * scale_y;
        match mode {
            WindowMode::Gaussian => (-(fx * fx + fy * fy) * std).exp(),
            WindowMode::Rational => {
                (1.0 / ((fx * fx + 1.0) * (fy * fy + 1.0))).powf(std / 3.14)
            }
        }
    })
}

/// Quantile-map `values` onto the distribution of `reference`, in place.
fn match_histogram(values: &mut [f64], reference: &[f64]) {
    if values.is_empty() || reference.is_empty() {
        return;
    }
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal));
    let mut sorted_ref = reference.to_vec();
    sorted_ref.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let last_ref = sorted_ref.len() - 1;
    for (rank, &idx) in order.iter().enumerate() {
        let q = if values.len() == 1 {
            0.5
        } else {
            rank as f64 / (values.len() - 1) as f64
        };
        let pos = q * last_ref as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let frac = pos - lo as f64;
        values[idx] = sorted_ref[lo] * (1.0 - frac) + sorted_ref[hi] * frac;
    }
}

/// Produce replacement noise for the masked region of `src` whose spectrum
/// and color statistics match the unmasked remainder.
///
/// `src` and `mask` are H x W x 3 arrays with values in [0, 1]; mask value 1
/// marks a pixel to be regenerated. The unmasked region is returned
/// untouched; a mask covering the whole image leaves no reference statistics
/// and is rejected.
pub fn matched_noise(
    src: &Array3<f64>,
    mask: &Array3<f64>,
    opts: &NoiseMatchOptions,
    rng: &mut impl Rng,
) -> Result<Array3<f64>> {
    opts.validate()?;
    if src.dim() != mask.dim() {
        return Err(Error::invalid(format!(
            "mask dimensions {:?} do not match source dimensions {:?}",
            mask.dim(),
            src.dim()
        )));
    }
    let (h, w, channels) = src.dim();
    if channels != 3 {
        return Err(Error::invalid(format!("expected an RGB image, got {channels} channels")));
    }

    let mask_grey = Array2::from_shape_fn((h, w), |(y, x)| {
        (mask[(y, x, 0)] + mask[(y, x, 1)] + mask[(y, x, 2)]) / 3.0
    });
    let img_mask = mask_grey.mapv(|v| v > 1e-6);
    let ref_mask = mask_grey.mapv(|v| v < 1e-3);
    let masked_count = img_mask.iter().filter(|&&m| m).count();
    let ref_count = ref_mask.iter().filter(|&&m| m).count();
    if masked_count == 0 {
        return Ok(src.clone());
    }
    if ref_count == 0 {
        return Err(Error::invalid(
            "mask covers the entire image; no reference region to match against",
        ));
    }

    // Fill the masked area with the average source color before taking the
    // spectrum; a hard zero hole rings badly in frequency space.
    let src_avg = src.sum() / (h * w * channels) as f64;
    let mut windowed = Array3::from_shape_fn((h, w, channels), |(y, x, c)| {
        src[(y, x, c)] * (1.0 - mask[(y, x, c)])
    });
    let max = windowed.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    if max > 0.0 {
        windowed.mapv_inplace(|v| v / max);
    }
    for ((y, x, c), v) in windowed.indexed_iter_mut() {
        *v += src_avg * mask[(y, x, c)];
    }

    // Uniform noise, blended toward greyscale by the color_variation amount.
    let mut noise = Array3::from_shape_fn((h, w, channels), |_| rng.gen::<f64>());
    let noise_grey = Array2::from_shape_fn((h, w), |(y, x)| {
        (noise[(y, x, 0)] + noise[(y, x, 1)] + noise[(y, x, 2)]) / 3.0
    });
    for ((y, x, _c), v) in noise.indexed_iter_mut() {
        *v = *v * opts.color_variation + (1.0 - opts.color_variation) * noise_grey[(y, x)];
    }

    let window = radial_window(h, w, 3.14, opts.window_mode);
    let mut shaped = Array3::<f64>::zeros((h, w, channels));
    for c in 0..channels {
        let src_fft = fft2_real(windowed.slice(ndarray::s![.., .., c]));
        let src_dist = src_fft.mapv(|v| v.norm());
        let src_phase = Array2::from_shape_fn((h, w), |(y, x)| {
            let dist = src_dist[(y, x)];
            if dist > 0.0 { src_fft[(y, x)] / dist } else { Complex::new(0.0, 0.0) }
        });

        let mut noise_fft = fft2_real(noise.slice(ndarray::s![.., .., c]));
        for ((y, x), v) in noise_fft.indexed_iter_mut() {
            *v *= window[(y, x)];
        }
        let windowed_noise = ifft2_real(&noise_fft);

        let mut shaped_fft = fft2_real(windowed_noise.view());
        for ((y, x), v) in shaped_fft.indexed_iter_mut() {
            let magnitude = v.norm();
            *v = src_phase[(y, x)]
                * magnitude
                * magnitude
                * src_dist[(y, x)].powf(opts.noise_q);
        }
        let spatial = ifft2_real(&shaped_fft);
        for ((y, x), v) in spatial.indexed_iter() {
            shaped[(y, x, c)] = *v;
        }
    }

    // Normalize to [0, 1] before histogram matching.
    let min = shaped.fold(f64::INFINITY, |acc, &v| acc.min(v));
    shaped.mapv_inplace(|v| v - min);
    let max = shaped.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    if max > 0.0 {
        shaped.mapv_inplace(|v| v / max);
    }

    // Match the masked region's per-channel distribution to the reference.
    for c in 0..channels {
        let mut values = Vec::with_capacity(masked_count);
        let mut positions = Vec::with_capacity(masked_count);
        let mut reference = Vec::with_capacity(ref_count);
        for y in 0..h {
            for x in 0..w {
                if img_mask[(y, x)] {
                    positions.push((y, x));
                    values.push(shaped[(y, x, c)]);
                }
                if ref_mask[(y, x)] {
                    reference.push(src[(y, x, c)]);
                }
            }
        }
        match_histogram(&mut values, &reference);
        for (&(y, x), &v) in positions.iter().zip(values.iter()) {
            shaped[(y, x, c)] = v;
        }
    }

    let out = Array3::from_shape_fn((h, w, channels), |(y, x, c)| {
        let m = mask[(y, x, c)];
        (src[(y, x, c)] * (1.0 - m) + shaped[(y, x, c)] * m).clamp(0.0, 1.0)
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient_image(h: usize, w: usize) -> Array3<f64> {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
            ((x + y) as f64 / (h + w) as f64 + c as f64 * 0.1).min(1.0)
        })
    }

    fn half_mask(h: usize, w: usize) -> Array3<f64> {
        Array3::from_shape_fn((h, w, 3), |(_, x, _)| if x >= w / 2 { 1.0 } else { 0.0 })
    }

    #[test]
    fn unmasked_image_passes_through() {
        let src = gradient_image(16, 16);
        let mask = Array3::zeros((16, 16, 3));
        let mut rng = StdRng::seed_from_u64(0);
        let out = matched_noise(&src, &mask, &NoiseMatchOptions::default(), &mut rng).unwrap();
        for (a, b) in src.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn fully_masked_image_is_rejected() {
        let src = gradient_image(16, 16);
        let mask = Array3::from_elem((16, 16, 3), 1.0);
        let mut rng = StdRng::seed_from_u64(0);
        let res = matched_noise(&src, &mask, &NoiseMatchOptions::default(), &mut rng);
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let src = gradient_image(8, 8);
        let mask = half_mask(8, 8);
        let mut rng = StdRng::seed_from_u64(0);
        let bad_q = NoiseMatchOptions { noise_q: 0.0, ..Default::default() };
        assert!(matches!(
            matched_noise(&src, &mask, &bad_q, &mut rng),
            Err(Error::Configuration(_))
        ));
        let bad_color = NoiseMatchOptions { color_variation: 1.5, ..Default::default() };
        assert!(matches!(
            matched_noise(&src, &mask, &bad_color, &mut rng),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let src = gradient_image(8, 8);
        let mask = half_mask(8, 16);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            matched_noise(&src, &mask, &NoiseMatchOptions::default(), &mut rng),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn unmasked_region_is_preserved_and_output_bounded() {
        let src = gradient_image(16, 16);
        let mask = half_mask(16, 16);
        let mut rng = StdRng::seed_from_u64(7);
        let out = matched_noise(&src, &mask, &NoiseMatchOptions::default(), &mut rng).unwrap();
        for y in 0..16 {
            for x in 0..8 {
                for c in 0..3 {
                    assert!((out[(y, x, c)] - src[(y, x, c)].clamp(0.0, 1.0)).abs() < 1e-12);
                }
            }
        }
        assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn deterministic_under_a_fixed_rng() {
        let src = gradient_image(12, 12);
        let mask = half_mask(12, 12);
        let a = matched_noise(
            &src,
            &mask,
            &NoiseMatchOptions::default(),
            &mut StdRng::seed_from_u64(42),
        )
        .unwrap();
        let b = matched_noise(
            &src,
            &mask,
            &NoiseMatchOptions::default(),
            &mut StdRng::seed_from_u64(42),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn histogram_match_maps_quantiles() {
        let mut values = vec![0.9, 0.1, 0.5];
        let reference = vec![10.0, 20.0, 30.0];
        match_histogram(&mut values, &reference);
        assert_eq!(values, vec![30.0, 10.0, 20.0]);
    }
}
