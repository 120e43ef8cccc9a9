//! Image-side collaborators: tensor conversion, metadata-carrying save
//! paths, output sequence numbering, contact-sheet grids, and resizing.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::{DynamicImage, GenericImage, GenericImageView, Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Converts a tensor with shape (3, height, width) into an image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        return Err(Error::invalid("tensor_to_image expects an image with 3 channels"));
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::invalid("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts a batch of decoded samples (b, 3, h, w) in [0, 1] to images.
pub fn tensor_batch_to_images(batch: &Tensor) -> Result<Vec<DynamicImage>> {
    let (b, _c, _h, _w) = batch.dims4()?;
    let scaled = (batch.clamp(0.0, 1.0)? * 255.0)?.to_dtype(DType::U8)?;
    let mut images = Vec::with_capacity(b);
    for i in 0..b {
        images.push(tensor_to_image(&scaled.i(i)?)?);
    }
    Ok(images)
}

/// Converts an image to a (1, 3, h, w) tensor in [-1, 1] for VAE encoding.
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let data: Vec<f32> = rgb.into_raw().iter().map(|&v| v as f32 / 255.0).collect();
    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)?;
    Ok(tensor.affine(2.0, -1.0)?)
}

/// Downscale a greyscale mask to latent resolution as a (1, 1, h, w) tensor
/// in [0, 1], optionally pre-blurred to soften the seam.
pub fn mask_to_latent_tensor(
    mask: &DynamicImage,
    latent_w: usize,
    latent_h: usize,
    blur_sigma: f32,
    device: &Device,
) -> Result<Tensor> {
    let mask = if blur_sigma > 0.0 { mask.blur(blur_sigma) } else { mask.clone() };
    let grey = mask
        .resize_exact(latent_w as u32, latent_h as u32, image::imageops::FilterType::Lanczos3)
        .to_luma8();
    let data: Vec<f32> = grey.into_raw().iter().map(|&v| v as f32 / 255.0).collect();
    Ok(Tensor::from_vec(data, (1, 1, latent_h, latent_w), device)?)
}

pub fn image_to_array3(img: &DynamicImage) -> Array3<f64> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        rgb.get_pixel(x as u32, y as u32)[c] as f64 / 255.0
    })
}

pub fn array3_to_image(arr: &Array3<f64>) -> DynamicImage {
    let (h, w, _c) = arr.dim();
    let mut rgb = RgbImage::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let px = Rgb([
                (arr[(y, x, 0)].clamp(0.0, 1.0) * 255.0) as u8,
                (arr[(y, x, 1)].clamp(0.0, 1.0) * 255.0) as u8,
                (arr[(y, x, 2)].clamp(0.0, 1.0) * 255.0) as u8,
            ]);
            rgb.put_pixel(x as u32, y as u32, px);
        }
    }
    DynamicImage::ImageRgb8(rgb)
}

/// Output encoding, parsed from strings like `png`, `jpg:90` or `webp:-100`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveFormat {
    Png,
    Jpeg { quality: u8 },
    Webp { lossless: bool },
}

impl Default for SaveFormat {
    fn default() -> Self {
        Self::Png
    }
}

impl SaveFormat {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split(':');
        let kind = parts.next().unwrap_or_default().to_lowercase();
        let quality: i32 = parts.next().and_then(|q| q.parse().ok()).unwrap_or(100);
        match kind.as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg { quality: quality.clamp(1, 100) as u8 }),
            "webp" => Ok(Self::Webp { lossless: quality < 0 }),
            other => Err(Error::config(format!("unknown save format: {other}"))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg { .. } => "jpg",
            Self::Webp { .. } => "webp",
        }
    }
}

/// Everything recorded alongside a saved sample, embedded in the image file
/// and optionally mirrored to a YAML sidecar.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SampleMetadata {
    pub target: String,
    pub prompt: String,
    pub ddim_steps: usize,
    pub toggles: Vec<u8>,
    pub sampler_name: String,
    pub ddim_eta: f64,
    pub n_iter: usize,
    pub batch_size: usize,
    pub cfg_scale: f64,
    pub seed: u32,
    pub width: usize,
    pub height: usize,
    pub normalize_prompt_weights: bool,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize_mode: Option<String>,
}

impl SampleMetadata {
    /// Flat key/value view for embedding as PNG text chunks.
    fn text_pairs(&self) -> Vec<(String, String)> {
        let value = serde_json::to_value(self).unwrap_or_default();
        match value {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let text = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, text)
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Write one sample to `dir/filename.<ext>`. PNG output carries the metadata
/// as `sable:`-prefixed text chunks; `write_info_file` additionally writes a
/// YAML sidecar next to the image.
pub fn save_sample(
    image: &DynamicImage,
    dir: &Path,
    filename: &str,
    format: SaveFormat,
    metadata: &SampleMetadata,
    embed_metadata: bool,
    write_info_file: bool,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{filename}.{}", format.extension()));

    match format {
        SaveFormat::Png => {
            let rgb = image.to_rgb8();
            let file = File::create(&path)?;
            let mut encoder = png::Encoder::new(BufWriter::new(file), rgb.width(), rgb.height());
            encoder.set_color(png::ColorType::Rgb);
            encoder.set_depth(png::BitDepth::Eight);
            if embed_metadata {
                for (key, text) in metadata.text_pairs() {
                    encoder
                        .add_text_chunk(format!("sable:{key}"), text)
                        .map_err(|e| Error::invalid(format!("png text chunk: {e}")))?;
                }
            }
            let mut writer = encoder
                .write_header()
                .map_err(|e| Error::invalid(format!("png encoding: {e}")))?;
            writer
                .write_image_data(rgb.as_raw())
                .map_err(|e| Error::invalid(format!("png encoding: {e}")))?;
        }
        SaveFormat::Jpeg { quality } => {
            let file = File::create(&path)?;
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(BufWriter::new(file), quality);
            image.to_rgb8().write_with_encoder(encoder)?;
        }
        SaveFormat::Webp { .. } => {
            let file = File::create(&path)?;
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(BufWriter::new(file));
            image.to_rgb8().write_with_encoder(encoder)?;
        }
    }

    if write_info_file {
        let yaml = serde_yaml::to_string(metadata)
            .map_err(|e| Error::invalid(format!("metadata serialization: {e}")))?;
        std::fs::write(dir.join(format!("{filename}.yaml")), yaml)?;
    }
    Ok(path)
}

/// Next numeric filename prefix in `path`, considering files matching
/// `prefix` with a known image extension. The sequence starts at 0.
pub fn next_sequence_number(path: &Path, prefix: &str) -> Result<u32> {
    let mut result: i64 = -1;
    if !path.exists() {
        return Ok(0);
    }
    for entry in std::fs::read_dir(path)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let known_ext = [".png", ".jpg", ".jpeg", ".webp"].iter().any(|ext| name.ends_with(ext));
        if !known_ext || !name.starts_with(prefix) {
            continue;
        }
        let tail = &name[prefix.len()..];
        if let Ok(n) = tail.split('-').next().unwrap_or_default().parse::<i64>() {
            result = result.max(n);
        }
    }
    Ok((result + 1) as u32)
}

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// First usable caption font on this host, if any. Grids render without
/// captions when no font is found; callers treat that as non-fatal.
pub fn load_font() -> Option<FontArc> {
    for path in FONT_CANDIDATES {
        if let Ok(bytes) = std::fs::read(path) {
            if let Ok(font) = FontArc::try_from_vec(bytes) {
                return Some(font);
            }
        }
    }
    None
}

fn draw_outlined_text(img: &mut RgbImage, font: &FontArc, scale: PxScale, x: i32, y: i32, text: &str) {
    for (dx, dy) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
        draw_text_mut(img, Rgb([0, 0, 0]), x + dx, y + dy, scale, font, text);
    }
    draw_text_mut(img, Rgb([255, 255, 255]), x, y, scale, font, text);
}

/// Compose images into a contact sheet with `rows` rows, drawing one caption
/// per cell when a font is available.
pub fn image_grid(imgs: &[DynamicImage], rows: usize, captions: &[String]) -> Result<DynamicImage> {
    let first = imgs.first().ok_or_else(|| Error::invalid("cannot build a grid of 0 images"))?;
    let (w, h) = first.dimensions();
    let rows = rows.clamp(1, imgs.len());
    let cols = imgs.len().div_ceil(rows);
    let mut grid = RgbImage::new(cols as u32 * w, rows as u32 * h);

    let font = load_font();
    let scale = PxScale::from(30.0);
    for (i, img) in imgs.iter().enumerate() {
        let cell_x = (i % cols) as u32 * w;
        let cell_y = (i / cols) as u32 * h;
        image::imageops::replace(&mut grid, &img.to_rgb8(), cell_x as i64, cell_y as i64);
        if let (Some(font), Some(caption)) = (font.as_ref(), captions.get(i)) {
            let lines: Vec<&str> = caption.lines().collect();
            let line_height = scale.y as i32 + 4;
            let mut y = cell_y as i32 + h as i32 - line_height * lines.len() as i32 - 4;
            for line in lines {
                let (tw, _th) = text_size(scale, font, line);
                let x = cell_x as i32 + (w as i32 - tw as i32) / 2;
                draw_outlined_text(&mut grid, font, scale, x.max(0), y, line);
                y += line_height;
            }
        }
    }
    Ok(DynamicImage::ImageRgb8(grid))
}

/// Interleave a combining long-stroke character to strike text through.
fn strike_through(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 3);
    for ch in text.chars() {
        out.push(ch);
        out.push('\u{0336}');
    }
    out
}

/// Label a prompt-matrix grid: column headers along the top and row headers
/// along the left, striking through the clauses a cell does not include.
pub fn draw_prompt_matrix(
    grid: &DynamicImage,
    cell_w: usize,
    cell_h: usize,
    parts: &[String],
) -> Result<DynamicImage> {
    let font = load_font()
        .ok_or_else(|| Error::invalid("no usable caption font found on this host"))?;
    let fontsize = ((cell_w + cell_h) / 25).max(12) as f32;
    let scale = PxScale::from(fontsize);
    let line_spacing = (fontsize / 2.0) as i32;

    let prompts = &parts[1..];
    let pad_top = cell_h / 4;
    let pad_left = if prompts.len() > 2 { cell_w * 3 / 4 } else { 0 };

    let (gw, gh) = grid.dimensions();
    let cols = gw as usize / cell_w;
    let rows = gh as usize / cell_h;

    let mut out = RgbImage::from_pixel(
        gw + pad_left as u32,
        gh + pad_top as u32,
        Rgb([255, 255, 255]),
    );
    out.copy_from(&grid.to_rgb8(), pad_left as u32, pad_top as u32)?;

    let boundary = prompts.len().div_ceil(2);
    let horiz = &prompts[..boundary];
    let vert = &prompts[boundary..];

    let active_color = Rgb([0, 0, 0]);
    let inactive_color = Rgb([153, 153, 153]);
    let mut draw_labels = |pos: usize, x0: i32, y0: i32, texts: &[String]| {
        let mut y = y0;
        for (i, text) in texts.iter().enumerate() {
            let active = pos & (1 << i) != 0;
            let label = if active { text.clone() } else { strike_through(text) };
            let (tw, th) = text_size(scale, &font, &label);
            let color = if active { active_color } else { inactive_color };
            draw_text_mut(&mut out, color, x0 - tw as i32 / 2, y, scale, &font, &label);
            y += th as i32 + line_spacing;
        }
    };

    for col in 0..cols {
        let x = pad_left as i32 + (cell_w * col + cell_w / 2) as i32;
        draw_labels(col, x, line_spacing, horiz);
    }
    for row in 0..rows {
        let y = pad_top as i32 + (cell_h * row + cell_h / 4) as i32;
        draw_labels(row, pad_left as i32 / 2, y, vert);
    }
    Ok(DynamicImage::ImageRgb8(out))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    /// Stretch to the exact target dimensions.
    #[default]
    Stretch,
    /// Scale to cover and center-crop.
    Crop,
    /// Scale to fit and pad with stretched edge strips.
    Pad,
}

pub fn resize_image(mode: ResizeMode, img: &DynamicImage, width: usize, height: usize) -> DynamicImage {
    let (w, h) = (width as u32, height as u32);
    let filter = image::imageops::FilterType::Lanczos3;
    match mode {
        ResizeMode::Stretch => img.resize_exact(w, h, filter),
        ResizeMode::Crop => img.resize_to_fill(w, h, filter),
        ResizeMode::Pad => {
            let fitted = img.resize(w, h, filter);
            let (fw, fh) = fitted.dimensions();
            let mut canvas = RgbImage::new(w, h);
            let off_x = (w - fw) / 2;
            let off_y = (h - fh) / 2;
            let rgb = fitted.to_rgb8();
            if off_y > 0 {
                // stretch the first and last rows over the vertical padding
                let top = DynamicImage::ImageRgb8(rgb.clone()).crop_imm(0, 0, fw, 1);
                let bottom = DynamicImage::ImageRgb8(rgb.clone()).crop_imm(0, fh - 1, fw, 1);
                let top = top.resize_exact(fw, off_y, filter).to_rgb8();
                let bottom = bottom.resize_exact(fw, h - off_y - fh, filter).to_rgb8();
                image::imageops::replace(&mut canvas, &top, off_x as i64, 0);
                image::imageops::replace(&mut canvas, &bottom, off_x as i64, (off_y + fh) as i64);
            }
            if off_x > 0 {
                let left = DynamicImage::ImageRgb8(rgb.clone()).crop_imm(0, 0, 1, fh);
                let right = DynamicImage::ImageRgb8(rgb.clone()).crop_imm(fw - 1, 0, 1, fh);
                let left = left.resize_exact(off_x, fh, filter).to_rgb8();
                let right = right.resize_exact(w - off_x - fw, fh, filter).to_rgb8();
                image::imageops::replace(&mut canvas, &left, 0, off_y as i64);
                image::imageops::replace(&mut canvas, &right, (off_x + fw) as i64, off_y as i64);
            }
            image::imageops::replace(&mut canvas, &rgb, off_x as i64, off_y as i64);
            DynamicImage::ImageRgb8(canvas)
        }
    }
}

/// Scale an image down so it fits within the given bounds, keeping aspect.
pub fn constrain_image(img: &DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    let ratio = (img.width() as f64 / max_width as f64)
        .max(img.height() as f64 / max_height as f64);
    if ratio <= 1.0 {
        return img.clone();
    }
    img.resize(
        (img.width() as f64 / ratio) as u32,
        (img.height() as f64 / ratio) as u32,
        image::imageops::FilterType::Lanczos3,
    )
}

/// Composite the original image back over the result where the mask is
/// transparent, after blurring the mask edge.
pub fn restore_unmasked(
    result: &DynamicImage,
    init_img: &DynamicImage,
    mask: &DynamicImage,
    blur_sigma: f32,
) -> DynamicImage {
    let mask = if blur_sigma > 0.0 { mask.blur(blur_sigma) } else { mask.clone() };
    let mask = mask.resize_exact(result.width(), result.height(), image::imageops::FilterType::Lanczos3);
    let init =
        init_img.resize_exact(result.width(), result.height(), image::imageops::FilterType::Lanczos3);
    let mask_grey = mask.to_luma8();
    let mut out = result.to_rgb8();
    let init_rgb = init.to_rgb8();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let alpha = mask_grey.get_pixel(x, y)[0] as f32 / 255.0;
        let orig = init_rgb.get_pixel(x, y);
        for c in 0..3 {
            let blended = orig[c] as f32 * (1.0 - alpha) + pixel[c] as f32 * alpha;
            pixel[c] = blended.round() as u8;
        }
    }
    DynamicImage::ImageRgb8(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sable-test-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn checker(w: u32, h: u32) -> DynamicImage {
        let mut img = RgbImage::new(w, h);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = if (x + y) % 2 == 0 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) };
        }
        DynamicImage::ImageRgb8(img)
    }

    fn metadata() -> SampleMetadata {
        SampleMetadata {
            target: "txt2img".into(),
            prompt: "test".into(),
            ddim_steps: 20,
            toggles: vec![1, 5],
            sampler_name: "ddim".into(),
            ddim_eta: 0.0,
            n_iter: 1,
            batch_size: 1,
            cfg_scale: 7.5,
            seed: 123,
            width: 8,
            height: 8,
            normalize_prompt_weights: true,
            model_name: "Stable Diffusion v1.4".into(),
            denoising_strength: None,
            resize_mode: None,
        }
    }

    #[test]
    fn save_format_parsing() {
        assert_eq!(SaveFormat::parse("png").unwrap(), SaveFormat::Png);
        assert_eq!(SaveFormat::parse("jpg:85").unwrap(), SaveFormat::Jpeg { quality: 85 });
        assert_eq!(SaveFormat::parse("webp:-100").unwrap(), SaveFormat::Webp { lossless: true });
        assert!(matches!(SaveFormat::parse("tiff"), Err(Error::Configuration(_))));
    }

    #[test]
    fn save_sample_writes_image_and_yaml_sidecar() {
        let dir = temp_dir("save");
        let img = checker(8, 8);
        let path =
            save_sample(&img, &dir, "00000-20_ddim_123", SaveFormat::Png, &metadata(), true, true)
                .unwrap();
        assert!(path.exists());
        let yaml = std::fs::read_to_string(dir.join("00000-20_ddim_123.yaml")).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(value["seed"].as_u64(), Some(123));
        assert_eq!(value["ddim_steps"].as_u64(), Some(20));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn sequence_numbers_scan_matching_prefix() {
        let dir = temp_dir("seq");
        assert_eq!(next_sequence_number(&dir, "").unwrap(), 0);
        std::fs::write(dir.join("00003-20_ddim_1.png"), b"x").unwrap();
        std::fs::write(dir.join("00007-20_ddim_2.png"), b"x").unwrap();
        std::fs::write(dir.join("notanumber.png"), b"x").unwrap();
        std::fs::write(dir.join("00012.txt"), b"x").unwrap();
        assert_eq!(next_sequence_number(&dir, "").unwrap(), 8);
        std::fs::write(dir.join("grid-00002.png"), b"x").unwrap();
        assert_eq!(next_sequence_number(&dir, "grid-").unwrap(), 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn grid_dimensions() {
        let imgs: Vec<DynamicImage> = (0..4).map(|_| checker(8, 8)).collect();
        let grid = image_grid(&imgs, 2, &[]).unwrap();
        assert_eq!(grid.dimensions(), (16, 16));
        let grid = image_grid(&imgs, 1, &[]).unwrap();
        assert_eq!(grid.dimensions(), (32, 8));
    }

    #[test]
    fn resize_modes_hit_target_dimensions() {
        let img = checker(16, 8);
        for mode in [ResizeMode::Stretch, ResizeMode::Crop, ResizeMode::Pad] {
            let out = resize_image(mode, &img, 32, 32);
            assert_eq!(out.dimensions(), (32, 32), "{mode:?}");
        }
    }

    #[test]
    fn constrain_only_shrinks() {
        let img = checker(64, 32);
        let same = constrain_image(&img, 100, 100);
        assert_eq!(same.dimensions(), (64, 32));
        let smaller = constrain_image(&img, 32, 32);
        assert_eq!(smaller.dimensions(), (32, 16));
    }

    #[test]
    fn tensor_image_roundtrip() {
        let device = Device::Cpu;
        let data: Vec<u8> = (0..3 * 4 * 4).map(|v| v as u8).collect();
        let tensor = Tensor::from_vec(data.clone(), (3, 4, 4), &device).unwrap();
        let img = tensor_to_image(&tensor).unwrap();
        assert_eq!(img.dimensions(), (4, 4));
        // channel-first 0..16 becomes the red plane
        assert_eq!(img.to_rgb8().get_pixel(1, 0)[0], 1);
    }

    #[test]
    fn strike_through_interleaves_overlay() {
        assert_eq!(strike_through("ab"), "a\u{0336}b\u{0336}");
    }
}
