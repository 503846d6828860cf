//! Out-of-process image transform worker. See spec §4.6.
//!
//! Reads one JSON job per line from stdin, applies the requested transform
//! to the file in place, and writes one JSON result per line to stdout.
//! Deliberately has no dependency on the rest of this crate's async
//! runtime: it's spawned and recycled by the resize pool manager, and
//! talks to it purely over stdio.

use image::codecs::gif::GifDecoder;
use image::{imageops::FilterType, AnimationDecoder, DynamicImage, ImageFormat, ImageReader, Rgba};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct Job {
    path: PathBuf,
    still: bool,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Success {
    ok: bool,
    new_length: u64,
}

#[derive(Debug, Serialize)]
struct Failure {
    ok: bool,
    error: String,
}

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let mut out = stdout.lock();
        match serde_json::from_str::<Job>(&line).map_err(|e| e.to_string()).and_then(run_job) {
            Ok(new_length) => {
                let _ = writeln!(out, "{}", serde_json::to_string(&Success { ok: true, new_length }).unwrap());
            }
            Err(error) => {
                let _ = writeln!(out, "{}", serde_json::to_string(&Failure { ok: false, error }).unwrap());
            }
        }
        let _ = out.flush();
    }
}

fn run_job(job: Job) -> Result<u64, String> {
    let reader = ImageReader::open(&job.path)
        .map_err(|e| e.to_string())?
        .with_guessed_format()
        .map_err(|e| e.to_string())?;
    let format = reader.format().ok_or_else(|| "unrecognized image format".to_string())?;

    let mut img = if job.still && format == ImageFormat::Gif {
        let (frame, multi_frame) = load_first_gif_frame(&job.path)?;
        let mut frame = frame;
        if multi_frame {
            composite_play_overlay(&mut frame);
        }
        frame
    } else {
        let mut decoder = reader.into_decoder().map_err(|e| e.to_string())?;
        let orientation = image::ImageDecoder::orientation(&mut decoder).map_err(|e| e.to_string())?;
        let mut img = DynamicImage::from_decoder(decoder).map_err(|e| e.to_string())?;
        img.apply_orientation(orientation);
        img
    };

    if job.width.is_some() || job.height.is_some() {
        img = shrink_to_fit(img, job.width, job.height);
    }

    img.save_with_format(&job.path, format).map_err(|e| e.to_string())?;
    let new_length = std::fs::metadata(&job.path).map_err(|e| e.to_string())?.len();
    Ok(new_length)
}

/// Decodes a GIF frame-by-frame, keeping only the first frame. Returns
/// whether the source had more than one frame, so the caller knows whether
/// a "play" overlay belongs on the retained frame.
fn load_first_gif_frame(path: &Path) -> Result<(DynamicImage, bool), String> {
    let file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let decoder = GifDecoder::new(BufReader::new(file)).map_err(|e| e.to_string())?;
    let frames = decoder.into_frames().collect_frames().map_err(|e| e.to_string())?;
    let multi_frame = frames.len() > 1;
    let first = frames.into_iter().next().ok_or_else(|| "empty gif".to_string())?;
    Ok((DynamicImage::ImageRgba8(first.into_buffer()), multi_frame))
}

/// Marks a retained still frame as extracted from an animation: a dark
/// translucent disc with a white play triangle, centered on the image.
fn composite_play_overlay(img: &mut DynamicImage) {
    let mut rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let cx = w as f32 / 2.0;
    let cy = h as f32 / 2.0;
    let radius = w.min(h) as f32 * 0.2;

    let tri = [
        (cx - radius * 0.45, cy - radius * 0.6),
        (cx - radius * 0.45, cy + radius * 0.6),
        (cx + radius * 0.7, cy),
    ];

    for y in 0..h {
        for x in 0..w {
            let px = (x as f32, y as f32);
            let dist = ((px.0 - cx).powi(2) + (px.1 - cy).powi(2)).sqrt();
            if dist <= radius {
                blend_pixel(rgba.get_pixel_mut(x, y), [0, 0, 0], 140);
            }
            if point_in_triangle(px, tri[0], tri[1], tri[2]) {
                blend_pixel(rgba.get_pixel_mut(x, y), [255, 255, 255], 230);
            }
        }
    }

    *img = DynamicImage::ImageRgba8(rgba);
}

fn blend_pixel(pixel: &mut Rgba<u8>, color: [u8; 3], alpha: u8) {
    let a = alpha as f32 / 255.0;
    for (channel, c) in pixel.0.iter_mut().zip(color).take(3) {
        *channel = (c as f32 * a + *channel as f32 * (1.0 - a)).round() as u8;
    }
    pixel.0[3] = 255;
}

fn edge(p: (f32, f32), a: (f32, f32), b: (f32, f32)) -> f32 {
    (p.0 - b.0) * (a.1 - b.1) - (a.0 - b.0) * (p.1 - b.1)
}

fn point_in_triangle(p: (f32, f32), a: (f32, f32), b: (f32, f32), c: (f32, f32)) -> bool {
    let d1 = edge(p, a, b);
    let d2 = edge(p, b, c);
    let d3 = edge(p, c, a);
    let has_neg = d1 < 0.0 || d2 < 0.0 || d3 < 0.0;
    let has_pos = d1 > 0.0 || d2 > 0.0 || d3 > 0.0;
    !(has_neg && has_pos)
}

/// Proportional resize with an only-shrink rule: never upscale, and an
/// absent dimension is treated as unconstrained (scale governed by the
/// other one).
fn shrink_to_fit(img: DynamicImage, width: Option<u32>, height: Option<u32>) -> DynamicImage {
    let (orig_w, orig_h) = (img.width() as f64, img.height() as f64);
    if orig_w == 0.0 || orig_h == 0.0 {
        return img;
    }

    let ratio_w = width.map(|w| w as f64 / orig_w).unwrap_or(f64::INFINITY);
    let ratio_h = height.map(|h| h as f64 / orig_h).unwrap_or(f64::INFINITY);
    let ratio = ratio_w.min(ratio_h);

    if !ratio.is_finite() || ratio >= 1.0 {
        return img; // already smaller than the requested bounds
    }

    let target_w = ((orig_w * ratio).round() as u32).max(1);
    let target_h = ((orig_h * ratio).round() as u32).max(1);
    img.resize_exact(target_w, target_h, FilterType::Lanczos3)
}
