use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::types::*;

#[derive(Debug, Deserialize)]
struct RoiFile {
    #[serde(default)]
    rois: Vec<RoiEntry>,
}

#[derive(Debug, Deserialize)]
struct RoiEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    w: f64,
    #[serde(default)]
    h: f64,
}

impl RoiEntry {
    // Width/height round up so a fractional ROI never loses its last pixel.
    fn rect(&self) -> ScreenRect {
        ScreenRect::new(
            self.x.floor() as i32,
            self.y.floor() as i32,
            self.w.ceil() as i32,
            self.h.ceil() as i32,
        )
    }
}

/// Named window-relative rectangles loaded from a `roi.json`.
#[derive(Debug, Clone, Default)]
pub struct RoiSet {
    entries: Vec<(String, ScreenRect)>,
}

impl RoiSet {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("ROI file not found: {}", path.display()));
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: RoiFile = serde_json::from_str(text)?;
        let entries = file
            .rois
            .iter()
            .filter_map(|e| {
                let name = e.name.as_deref().filter(|n| !n.is_empty())?;
                Some((name.to_string(), e.rect()))
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Result<ScreenRect> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| *r)
            .ok_or_else(|| anyhow!("ROI not found: {}", name))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Names from `required` that this set lacks, sorted.
    pub fn missing(&self, required: &[&str]) -> Vec<String> {
        let mut missing: Vec<String> = required
            .iter()
            .filter(|r| !self.entries.iter().any(|(n, _)| n == *r))
            .map(|r| r.to_string())
            .collect();
        missing.sort();
        missing
    }
}

pub fn load_roi_region(path: &Path, name: &str) -> Result<ScreenRect> {
    RoiSet::load(path)?.get(name)
}

pub fn list_roi_names(path: &Path) -> Result<Vec<String>> {
    Ok(RoiSet::load(path)?.names())
}

/// Centre of `roi` shifted by `offset` (usually the window origin).
pub fn roi_center(roi: ScreenRect, offset: Point) -> Point {
    let x = roi.left as f64 + roi.width as f64 / 2.0 + offset.x as f64;
    let y = roi.top as f64 + roi.height as f64 / 2.0 + offset.y as f64;
    Point::new(x as i32, y as i32)
}

/// Grow `roi` by `ratio` of its size on every side, then clamp into `bounds` (width, height).
pub fn expand_roi_region(roi: ScreenRect, ratio: f64, bounds: (i32, i32)) -> ScreenRect {
    let ratio = ratio.max(0.0);
    let ew = (roi.width as f64 * ratio) as i32;
    let eh = (roi.height as f64 * ratio) as i32;
    let (max_w, max_h) = bounds;
    let x = (roi.left - ew).min(max_w).max(0);
    let y = (roi.top - eh).min(max_h).max(0);
    let w = (roi.width + ew * 2).min(max_w - x).max(1);
    let h = (roi.height + eh * 2).min(max_h - y).max(1);
    ScreenRect::new(x, y, w, h)
}
