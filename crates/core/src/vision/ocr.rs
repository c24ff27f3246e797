use anyhow::Result;
use image::RgbaImage;
use thiserror::Error;

use crate::logger;
use crate::platform::Platform;
use crate::types::*;

/// Text recognition backend. Bounding boxes are relative to the image passed in.
pub trait TextRecognizer {
    fn recognize(&self, image: &RgbaImage) -> Result<Vec<OcrItem>>;
}

#[derive(Debug, Error)]
pub enum OcrInitError {
    #[error("no OCR backend available")]
    Unavailable,
    #[error("OCR backend failed to start: {0}")]
    Backend(String),
}

/// Recognizer handle, built once at startup.
pub struct OcrEngine {
    recognizer: Box<dyn TextRecognizer>,
}

impl OcrEngine {
    pub fn init<F>(factory: F) -> Result<Self, OcrInitError>
    where
        F: FnOnce() -> Result<Box<dyn TextRecognizer>, OcrInitError>,
    {
        let recognizer = factory()?;
        Ok(Self { recognizer })
    }

    /// Build the engine at startup, or log once that OCR recovery is off.
    pub fn start<F>(factory: F) -> Option<Self>
    where
        F: FnOnce() -> Result<Box<dyn TextRecognizer>, OcrInitError>,
    {
        match Self::init(factory) {
            Ok(engine) => Some(engine),
            Err(e) => {
                logger::warn_p("ocr", &format!("text recognizer unavailable: {}", e));
                logger::info_p("ocr", "OCR recovery is off: keyword scans and OCR click fallback are skipped");
                None
            }
        }
    }

    pub fn from_recognizer(recognizer: Box<dyn TextRecognizer>) -> Self {
        Self { recognizer }
    }

    pub fn recognize(&self, image: &RgbaImage) -> Result<Vec<OcrItem>> {
        self.recognizer.recognize(image)
    }
}

/// Centred sub-rectangle covering `ratio` of each dimension (ratio clamped to [0.1, 1]).
/// `size` is (width, height); the result is relative to the same origin.
pub fn center_region(size: (i32, i32), ratio: f64) -> ScreenRect {
    let (width, height) = size;
    let ratio = ratio.clamp(0.1, 1.0);
    let rw = (width as f64 * ratio) as i32;
    let rh = (height as f64 * ratio) as i32;
    let left = ((width - rw) / 2).max(0);
    let top = ((height - rh) / 2).max(0);
    let right = width.min(left + rw);
    let bottom = height.min(top + rh);
    ScreenRect::from_edges(left, top, right, bottom)
}

/// Recognise text in the centre of a window. Capture or recognition failures yield no items;
/// bounding boxes come back in absolute screen coordinates.
pub fn window_items(
    platform: &dyn Platform,
    engine: Option<&OcrEngine>,
    title: &str,
    ratio: f64,
) -> Vec<OcrItem> {
    let Some(engine) = engine else {
        return Vec::new();
    };
    let rect = match platform.windows().rect_of(title) {
        Ok(r) => r,
        Err(e) => {
            logger::warn_p("ocr", &format!("window rect failed: {}", e));
            return Vec::new();
        }
    };
    let capture = match platform.screen().capture(rect) {
        Ok(c) => c,
        Err(e) => {
            logger::warn_p("ocr", &format!("capture failed: {}", e));
            return Vec::new();
        }
    };
    let region = center_region(rect.size(), ratio);
    let image = capture.crop(region).to_rgba();
    match engine.recognize(&image) {
        Ok(items) => items
            .into_iter()
            .map(|mut item| {
                item.bbox = item
                    .bbox
                    .map(|b| b.translate(rect.left + region.left, rect.top + region.top));
                item
            })
            .collect(),
        Err(e) => {
            logger::warn_p("ocr", &format!("recognition failed: {}", e));
            Vec::new()
        }
    }
}

pub fn flatten_text(items: &[OcrItem]) -> String {
    items.iter().map(|i| i.text.as_str()).collect()
}

/// Items whose text contains any keyword (case-sensitive) with score at least `min_score`.
pub fn find_keyword_items(items: &[OcrItem], keywords: &[String], min_score: f32) -> Vec<OcrItem> {
    if keywords.is_empty() {
        return Vec::new();
    }
    items
        .iter()
        .filter(|i| i.effective_score() >= min_score)
        .filter(|i| keywords.iter().any(|k| !k.is_empty() && i.text.contains(k.as_str())))
        .cloned()
        .collect()
}

/// Sort by confidence, highest first. Stable, so equal scores keep recognition order.
pub fn sort_by_score(items: &mut [OcrItem]) {
    items.sort_by(|a, b| b.effective_score().total_cmp(&a.effective_score()));
}

/// Distinct matched texts for logging.
pub fn matched_texts(items: &[OcrItem]) -> String {
    let mut texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
    texts.sort();
    texts.dedup();
    texts.join(" / ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::stub::StubPlatform;

    fn item(text: &str, score: Option<f32>, bbox: Option<ScreenRect>) -> OcrItem {
        OcrItem { text: text.into(), score, bbox }
    }

    struct Fixed(Vec<OcrItem>);

    #[test]
    fn missing_backend_logs_ocr_off_at_info() {
        let dir = tempfile::tempdir().unwrap();
        logger::init(dir.path(), false).unwrap();
        assert!(OcrEngine::start(|| Err(OcrInitError::Unavailable)).is_none());

        let mut text = String::new();
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            text.push_str(&std::fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        let off: Vec<_> = text.lines().filter(|l| l.contains("OCR recovery is off")).collect();
        assert_eq!(off.len(), 1, "{}", text);
        assert!(off[0].contains("[INFO] [ocr]"), "{}", off[0]);
    }

    impl TextRecognizer for Fixed {
        fn recognize(&self, _image: &RgbaImage) -> Result<Vec<OcrItem>> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl TextRecognizer for Broken {
        fn recognize(&self, _image: &RgbaImage) -> Result<Vec<OcrItem>> {
            Err(anyhow::anyhow!("model crashed"))
        }
    }

    #[test]
    fn center_region_clamps_ratio() {
        assert_eq!(center_region((1000, 800), 0.6), ScreenRect::new(200, 160, 600, 480));
        assert_eq!(center_region((1000, 800), 5.0), ScreenRect::new(0, 0, 1000, 800));
        assert_eq!(center_region((1000, 800), 0.0), ScreenRect::new(450, 360, 100, 80));
    }

    #[test]
    fn keyword_filter_treats_unscored_as_confident() {
        let items = vec![
            item("连接失败", Some(0.3), None),
            item("网络错误", None, None),
            item("确认", Some(0.9), None),
        ];
        let kw = vec!["失败".to_string(), "错误".to_string()];
        let hits = find_keyword_items(&items, &kw, 0.5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "网络错误");
        assert!(find_keyword_items(&items, &[], 0.0).is_empty());
    }

    #[test]
    fn sort_puts_unscored_first_among_lower_scores() {
        let mut items = vec![item("a", Some(0.4), None), item("b", None, None), item("c", Some(0.8), None)];
        sort_by_score(&mut items);
        let order: Vec<_> = items.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert_eq!(flatten_text(&items), "bca");
    }

    #[test]
    fn window_items_shift_boxes_to_screen() {
        let p = StubPlatform::new();
        p.add_window("DNF Taiwan", ScreenRect::new(100, 50, 1000, 800));
        let engine = OcrEngine::from_recognizer(Box::new(Fixed(vec![item(
            "确认",
            Some(0.9),
            Some(ScreenRect::new(10, 20, 40, 20)),
        )])));
        let items = window_items(&p, Some(&engine), "DNF Taiwan", 0.6);
        assert_eq!(items[0].bbox, Some(ScreenRect::new(310, 230, 40, 20)));
    }

    #[test]
    fn window_items_degrade_to_empty() {
        let p = StubPlatform::new();
        p.add_window("DNF Taiwan", ScreenRect::new(0, 0, 100, 100));
        assert!(window_items(&p, None, "DNF Taiwan", 0.6).is_empty());
        let broken = OcrEngine::from_recognizer(Box::new(Broken));
        assert!(window_items(&p, Some(&broken), "DNF Taiwan", 0.6).is_empty());
        let ok = OcrEngine::from_recognizer(Box::new(Fixed(vec![item("x", None, None)])));
        assert!(window_items(&p, Some(&ok), "missing", 0.6).is_empty());
    }

    #[test]
    fn init_surfaces_factory_error() {
        let r = OcrEngine::init(|| Err(OcrInitError::Unavailable));
        assert!(matches!(r, Err(OcrInitError::Unavailable)));
    }
}
