//! Special-eye overlay textures (star, heart, hau, hachume, nagomi), drawn
//! procedurally and written into the model's `tex/` directory.

use std::{f32::consts::PI, io, path::Path};

use image::{ImageError, ImageFormat, Rgba, RgbaImage};
use nalgebra::Vector2;

use crate::error::{ConvertError, ConvertResult};

const SIZE: u32 = 128;

type Shape = fn(Vector2<f32>) -> Option<Rgba<u8>>;

/// File name and pixel shader of every special-eye texture, in output order.
pub(crate) const EYE_TEXTURES: [(&str, Shape); 5] = [
    ("eye_star.png", star),
    ("eye_heart.png", heart),
    ("eye_hau.png", hau),
    ("eye_hachume.png", hachume),
    ("eye_nagomi.png", nagomi),
];

const STAR_COLOR: Rgba<u8> = Rgba([255, 236, 120, 255]);
const HEART_COLOR: Rgba<u8> = Rgba([255, 96, 150, 255]);
const LINE_COLOR: Rgba<u8> = Rgba([40, 28, 36, 255]);

fn segment_distance(p: Vector2<f32>, a: Vector2<f32>, b: Vector2<f32>) -> f32 {
    let ab = b - a;
    let t = ((p - a).dot(&ab) / ab.norm_squared()).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

fn polyline_hit(p: Vector2<f32>, points: &[Vector2<f32>], width: f32) -> bool {
    points
        .windows(2)
        .any(|pair| segment_distance(p, pair[0], pair[1]) <= width)
}

/// Point-in-polygon by ray crossing.
fn polygon_hit(p: Vector2<f32>, points: &[Vector2<f32>]) -> bool {
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (a, b) = (points[i], points[j]);
        if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn star(p: Vector2<f32>) -> Option<Rgba<u8>> {
    let points: Vec<Vector2<f32>> = (0..10)
        .map(|k| {
            let radius = if k % 2 == 0 { 0.9 } else { 0.38 };
            let angle = PI / 2.0 + k as f32 * PI / 5.0;
            Vector2::new(angle.cos(), angle.sin()) * radius
        })
        .collect();
    polygon_hit(p, &points).then_some(STAR_COLOR)
}

fn heart(p: Vector2<f32>) -> Option<Rgba<u8>> {
    let (x, y) = (p.x * 1.25, p.y * 1.25 + 0.15);
    let value = (x * x + y * y - 1.0).powi(3) - x * x * y.powi(3);
    (value <= 0.0).then_some(HEART_COLOR)
}

fn hau(p: Vector2<f32>) -> Option<Rgba<u8>> {
    let chevron = [
        Vector2::new(-0.6, 0.6),
        Vector2::new(0.6, 0.0),
        Vector2::new(-0.6, -0.6),
    ];
    polyline_hit(p, &chevron, 0.1).then_some(LINE_COLOR)
}

fn hachume(p: Vector2<f32>) -> Option<Rgba<u8>> {
    let slant = [Vector2::new(-0.7, -0.1), Vector2::new(0.7, 0.35)];
    polyline_hit(p, &slant, 0.09).then_some(LINE_COLOR)
}

fn nagomi(p: Vector2<f32>) -> Option<Rgba<u8>> {
    let arc: Vec<Vector2<f32>> = (0..=16)
        .map(|k| {
            let angle = PI * k as f32 / 16.0;
            Vector2::new(-0.7 * angle.cos(), 0.45 * angle.sin() - 0.2)
        })
        .collect();
    polyline_hit(p, &arc, 0.08).then_some(LINE_COLOR)
}

/// Rasterize a shape into a transparent square texture.
pub(crate) fn render(shape: Shape) -> RgbaImage {
    RgbaImage::from_fn(SIZE, SIZE, |x, y| {
        let half = SIZE as f32 / 2.0;
        let p = Vector2::new(
            (x as f32 + 0.5 - half) / half,
            (half - y as f32 - 0.5) / half,
        );
        shape(p).unwrap_or(Rgba([0, 0, 0, 0]))
    })
}

fn image_error(path: &Path, err: ImageError) -> ConvertError {
    match err {
        ImageError::IoError(source) => ConvertError::io(path, source),
        other => ConvertError::io(path, io::Error::other(other)),
    }
}

/// Write every special-eye texture into `tex_dir`, skipping files that
/// already exist. Returns the file names in catalogue order.
pub(crate) fn write_eye_textures(tex_dir: &Path) -> ConvertResult<Vec<&'static str>> {
    for (file_name, shape) in EYE_TEXTURES {
        let path = tex_dir.join(file_name);
        if path.exists() {
            continue;
        }
        render(shape)
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|err| image_error(&path, err))?;
    }
    Ok(EYE_TEXTURES.iter().map(|(file_name, _)| *file_name).collect())
}
