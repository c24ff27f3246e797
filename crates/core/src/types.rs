use std::fmt;

use serde::{Deserialize, Serialize};

/// Window identifier (HWND on Windows, synthetic id on the stub platform)
pub type WindowId = u64;

/// Absolute desktop coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Integer pixel rectangle in absolute desktop coordinates.
///
/// Width and height are never negative; constructors clamp them at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct ScreenRect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl ScreenRect {
    pub fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width: width.max(0),
            height: height.max(0),
        }
    }

    /// Build from edge coordinates as reported by Win32 `RECT`.
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, right - left, bottom - top)
    }

    pub fn right(&self) -> i32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.top + self.height
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    pub fn size(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    pub fn center(&self) -> Point {
        Point::new(self.left + self.width / 2, self.top + self.height / 2)
    }

    /// Half-open containment: the right and bottom edges are outside.
    pub fn contains(&self, p: Point) -> bool {
        self.left <= p.x && p.x < self.right() && self.top <= p.y && p.y < self.bottom()
    }

    pub fn intersect(&self, other: &ScreenRect) -> Option<ScreenRect> {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return None;
        }
        Some(ScreenRect::from_edges(left, top, right, bottom))
    }

    /// Shrink inward by `pad` on every side. Degenerate results collapse to zero size.
    pub fn shrink(&self, pad: i32) -> ScreenRect {
        ScreenRect::new(
            self.left + pad,
            self.top + pad,
            self.width - pad * 2,
            self.height - pad * 2,
        )
    }

    /// Translate a window-relative rectangle into absolute coordinates.
    pub fn translate(&self, dx: i32, dy: i32) -> ScreenRect {
        ScreenRect::new(self.left + dx, self.top + dy, self.width, self.height)
    }
}

impl fmt::Display for ScreenRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.left, self.top, self.width, self.height)
    }
}

/// Raw screenshot pixel data (BGRA)
#[derive(Debug, Clone)]
pub struct Capture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
}

impl Capture {
    /// Solid-colour capture, handy for fakes.
    pub fn filled(width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&bgra);
        }
        Self { data, width, height, bytes_per_row: width * 4 }
    }

    /// Copy out a sub-rectangle (capture-relative). Out-of-range parts are clipped.
    pub fn crop(&self, rect: ScreenRect) -> Capture {
        let x0 = (rect.left.max(0) as u32).min(self.width);
        let y0 = (rect.top.max(0) as u32).min(self.height);
        let x1 = (rect.right().max(0) as u32).min(self.width);
        let y1 = (rect.bottom().max(0) as u32).min(self.height);
        let w = x1.saturating_sub(x0);
        let h = y1.saturating_sub(y0);
        if w == 0 || h == 0 {
            return Capture { data: Vec::new(), width: 0, height: 0, bytes_per_row: 0 };
        }
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in y0..y0 + h {
            let start = (y * self.bytes_per_row + x0 * 4) as usize;
            data.extend_from_slice(&self.data[start..start + (w * 4) as usize]);
        }
        Capture { data, width: w, height: h, bytes_per_row: w * 4 }
    }

    pub fn to_luma(&self) -> image::GrayImage {
        image::GrayImage::from_fn(self.width, self.height, |x, y| {
            let idx = (y * self.bytes_per_row + x * 4) as usize;
            let b = self.data[idx] as u32;
            let g = self.data[idx + 1] as u32;
            let r = self.data[idx + 2] as u32;
            image::Luma([((r * 299 + g * 587 + b * 114) / 1000) as u8])
        })
    }

    pub fn to_rgba(&self) -> image::RgbaImage {
        image::RgbaImage::from_fn(self.width, self.height, |x, y| {
            let idx = (y * self.bytes_per_row + x * 4) as usize;
            let px = &self.data[idx..idx + 4];
            image::Rgba([px[2], px[1], px[0], 255])
        })
    }
}

/// One recognised text fragment. `bbox` absent means the item cannot be clicked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrItem {
    pub text: String,
    pub score: Option<f32>,
    pub bbox: Option<ScreenRect>,
}

impl OcrItem {
    /// Unscored items count as fully confident.
    pub fn effective_score(&self) -> f32 {
        self.score.unwrap_or(1.0)
    }
}
