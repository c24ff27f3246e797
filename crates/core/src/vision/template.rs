use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Result};
use image::GrayImage;

use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub found: bool,
    pub score: f32,
    /// Absolute centre of the best match, only set when `found`.
    pub center: Option<Point>,
}

impl MatchResult {
    pub fn miss() -> Self {
        Self { found: false, score: 0.0, center: None }
    }
}

/// Locates a reference image inside a larger one.
pub trait TemplateMatcher {
    /// Best score and top-left corner of `template` in `image`. `None` when the template
    /// does not fit inside the image.
    fn best_match(&self, image: &GrayImage, template: &GrayImage) -> Option<(f32, Point)>;
}

/// Zero-mean normalised cross-correlation (OpenCV's TM_CCOEFF_NORMED) on grayscale pixels.
pub struct NccMatcher;

impl TemplateMatcher for NccMatcher {
    fn best_match(&self, image: &GrayImage, template: &GrayImage) -> Option<(f32, Point)> {
        let (iw, ih) = image.dimensions();
        let (tw, th) = template.dimensions();
        if tw == 0 || th == 0 || tw > iw || th > ih {
            return None;
        }

        let n = (tw * th) as f64;
        let t_mean = template.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n;
        let t_zero: Vec<f64> = template.as_raw().iter().map(|&v| v as f64 - t_mean).collect();
        let t_norm: f64 = t_zero.iter().map(|v| v * v).sum();

        // Integral images of I and I² give each window's mean/variance in O(1).
        let stride = (iw + 1) as usize;
        let mut sum = vec![0f64; stride * (ih + 1) as usize];
        let mut sq = vec![0f64; stride * (ih + 1) as usize];
        let raw = image.as_raw();
        for y in 0..ih as usize {
            let (mut row, mut row_sq) = (0f64, 0f64);
            for x in 0..iw as usize {
                let v = raw[y * iw as usize + x] as f64;
                row += v;
                row_sq += v * v;
                let i = (y + 1) * stride + x + 1;
                sum[i] = sum[i - stride] + row;
                sq[i] = sq[i - stride] + row_sq;
            }
        }
        let window = |tab: &[f64], x: usize, y: usize| {
            let (x1, y1) = (x + tw as usize, y + th as usize);
            tab[y1 * stride + x1] - tab[y * stride + x1] - tab[y1 * stride + x] + tab[y * stride + x]
        };

        let mut best = (f32::MIN, Point::default());
        for y in 0..=(ih - th) as usize {
            for x in 0..=(iw - tw) as usize {
                let s = window(&sum, x, y);
                let i_var = window(&sq, x, y) - s * s / n;
                let denom = (i_var.max(0.0) * t_norm).sqrt();
                let score = if denom <= f64::EPSILON {
                    0.0
                } else {
                    let mut cross = 0.0;
                    for ty in 0..th as usize {
                        let row = (y + ty) * iw as usize + x;
                        let trow = ty * tw as usize;
                        for tx in 0..tw as usize {
                            cross += raw[row + tx] as f64 * t_zero[trow + tx];
                        }
                    }
                    (cross / denom).clamp(-1.0, 1.0)
                };
                if score as f32 > best.0 {
                    best = (score as f32, Point::new(x as i32, y as i32));
                }
            }
        }
        Some(best)
    }
}

/// Match once and translate the hit centre by `offset` into absolute coordinates.
pub fn match_template(
    matcher: &dyn TemplateMatcher,
    image: &GrayImage,
    template: &GrayImage,
    threshold: f32,
    offset: Point,
) -> MatchResult {
    let Some((score, loc)) = matcher.best_match(image, template) else {
        return MatchResult::miss();
    };
    if score < threshold {
        return MatchResult { found: false, score, center: None };
    }
    let cx = loc.x as f64 + template.width() as f64 / 2.0 + offset.x as f64;
    let cy = loc.y as f64 + template.height() as f64 / 2.0 + offset.y as f64;
    MatchResult {
        found: true,
        score,
        center: Some(Point::new(cx as i32, cy as i32)),
    }
}

/// Decoded template images, loaded once per path.
#[derive(Default)]
pub struct TemplateCache {
    images: RefCell<HashMap<PathBuf, Rc<GrayImage>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Result<Rc<GrayImage>> {
        if let Some(img) = self.images.borrow().get(path) {
            return Ok(Rc::clone(img));
        }
        if !path.is_file() {
            return Err(anyhow!("template not found: {}", path.display()));
        }
        let img = image::open(path)
            .map_err(|e| anyhow!("cannot decode template {}: {}", path.display(), e))?
            .to_luma8();
        let img = Rc::new(img);
        self.images.borrow_mut().insert(path.to_path_buf(), Rc::clone(&img));
        Ok(img)
    }

    pub fn len(&self) -> usize {
        self.images.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| image::Luma([((x * 37 + y * 91 + x * y) % 251) as u8]))
    }

    fn crop(img: &GrayImage, x: u32, y: u32, w: u32, h: u32) -> GrayImage {
        image::imageops::crop_imm(img, x, y, w, h).to_image()
    }

    #[test]
    fn finds_exact_patch() {
        let img = textured(60, 40);
        let tpl = crop(&img, 17, 9, 12, 8);
        let (score, loc) = NccMatcher.best_match(&img, &tpl).unwrap();
        assert!(score > 0.999, "score {}", score);
        assert_eq!(loc, Point::new(17, 9));
    }

    #[test]
    fn center_includes_offset() {
        let img = textured(60, 40);
        let tpl = crop(&img, 10, 10, 10, 6);
        let r = match_template(&NccMatcher, &img, &tpl, 0.9, Point::new(100, 200));
        assert!(r.found);
        assert_eq!(r.center, Some(Point::new(115, 213)));
    }

    #[test]
    fn oversized_or_flat_template_never_matches() {
        let img = textured(20, 20);
        let big = textured(30, 10);
        assert!(NccMatcher.best_match(&img, &big).is_none());
        assert_eq!(match_template(&NccMatcher, &img, &big, 0.5, Point::default()), MatchResult::miss());

        let flat = GrayImage::from_pixel(5, 5, image::Luma([9]));
        let r = match_template(&NccMatcher, &img, &flat, 0.5, Point::default());
        assert!(!r.found);
    }

    #[test]
    fn cache_loads_each_path_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("title.png");
        textured(8, 8).save(&path).unwrap();
        let cache = TemplateCache::new();
        let a = cache.get(&path).unwrap();
        let b = cache.get(&path).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&dir.path().join("missing.png")).is_err());
    }
}
