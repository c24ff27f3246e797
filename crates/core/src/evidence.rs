use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use regex::Regex;
use serde_json::json;

use crate::logger;
use crate::platform::Platform;
use crate::types::*;
use crate::vision::ocr::{self, OcrEngine};

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Where failures leave their evidence.
pub trait EvidenceSink {
    /// Record one bundle. Never fails the caller; returns the bundle path when written.
    fn record(&self, tag: &str, window_title: Option<&str>, error: &str, extra: serde_json::Value) -> Option<PathBuf>;
}

/// Writes `<dir>/<tag>_<YYYYmmdd_HHMMSS>/` bundles: screenshot, OCR text, context and error.
pub struct EvidenceRecorder<'a> {
    dir: PathBuf,
    platform: &'a dyn Platform,
    ocr: Option<&'a OcrEngine>,
    ocr_ratio: f64,
}

impl<'a> EvidenceRecorder<'a> {
    pub fn new(dir: &Path, platform: &'a dyn Platform, ocr: Option<&'a OcrEngine>, ocr_ratio: f64) -> Self {
        Self { dir: dir.to_path_buf(), platform, ocr, ocr_ratio }
    }

    fn screenshot(&self, window_title: Option<&str>) -> Option<Capture> {
        let screen = self.platform.screen();
        if let Some(title) = window_title {
            match self.platform.windows().rect_of(title).and_then(|r| screen.capture(r)) {
                Ok(c) => return Some(c),
                Err(e) => logger::warn_p("evidence", &format!("window capture failed: {}", e)),
            }
        }
        match screen.capture(self.platform.windows().virtual_screen()) {
            Ok(c) => Some(c),
            Err(e) => {
                logger::warn_p("evidence", &format!("screen capture failed: {}", e));
                None
            }
        }
    }

    pub fn save(
        &self,
        tag: &str,
        window_title: Option<&str>,
        error: &str,
        extra: serde_json::Value,
    ) -> Result<PathBuf> {
        let stamp = Local::now().format(STAMP_FORMAT).to_string();
        let out = self.dir.join(format!("{}_{}", tag, stamp));
        fs::create_dir_all(&out).with_context(|| format!("creating {}", out.display()))?;

        if let Some(capture) = self.screenshot(window_title) {
            if let Err(e) = capture.to_rgba().save(out.join("screenshot.png")) {
                logger::warn_p("evidence", &format!("writing screenshot failed: {}", e));
            }
        }

        if let Some(title) = window_title {
            let items = ocr::window_items(self.platform, self.ocr, title, self.ocr_ratio);
            let text = ocr::flatten_text(&items);
            if !text.is_empty() {
                fs::write(out.join("ocr.txt"), text)?;
            }
        }

        let context = json!({
            "tag": tag,
            "timestamp": stamp,
            "window_title": window_title,
            "extra": extra,
        });
        fs::write(out.join("context.json"), serde_json::to_string_pretty(&context)?)?;
        if !error.is_empty() {
            fs::write(out.join("error.txt"), error)?;
        }
        Ok(out)
    }
}

impl EvidenceSink for EvidenceRecorder<'_> {
    fn record(&self, tag: &str, window_title: Option<&str>, error: &str, extra: serde_json::Value) -> Option<PathBuf> {
        match self.save(tag, window_title, error, extra) {
            Ok(path) => {
                logger::info_p("evidence", &format!("saved {}", path.display()));
                Some(path)
            }
            Err(e) => {
                logger::error_p("evidence", &format!("saving {} failed: {:#}", tag, e));
                None
            }
        }
    }
}

/// Delete bundles whose name timestamp is more than `retention_days` before `now`.
/// Directories not named like a bundle are left alone. Returns how many were removed.
pub fn prune(dir: &Path, retention_days: u32, now: NaiveDateTime) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let Ok(pattern) = Regex::new(r"^(?P<tag>.+)_(?P<ts>\d{8}_\d{6})$") else {
        return 0;
    };
    let cutoff = now - chrono::Duration::days(retention_days as i64);
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(ts) = pattern.captures(&name).and_then(|c| c.name("ts")) else {
            continue;
        };
        let Ok(stamp) = NaiveDateTime::parse_from_str(ts.as_str(), STAMP_FORMAT) else {
            continue;
        };
        if stamp >= cutoff {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => logger::warn_p("evidence", &format!("removing {} failed: {}", path.display(), e)),
        }
    }
    if removed > 0 {
        logger::info_p("evidence", &format!("pruned {} bundles older than {} days", removed, retention_days));
    }
    removed
}
