pub mod ocr;
pub mod roi;
pub mod template;

use std::path::Path;

use anyhow::Result;

use crate::logger;
use crate::platform::Platform;
use crate::types::*;
use self::roi::{expand_roi_region, load_roi_region};
use self::template::{match_template, MatchResult, NccMatcher, TemplateCache, TemplateMatcher};

/// Window capture plus template matching against window-relative regions.
pub struct Vision<'a> {
    platform: &'a dyn Platform,
    matcher: Box<dyn TemplateMatcher>,
    templates: TemplateCache,
}

impl<'a> Vision<'a> {
    pub fn new(platform: &'a dyn Platform) -> Self {
        Self::with_matcher(platform, Box::new(NccMatcher))
    }

    pub fn with_matcher(platform: &'a dyn Platform, matcher: Box<dyn TemplateMatcher>) -> Self {
        Self { platform, matcher, templates: TemplateCache::new() }
    }

    pub fn capture_window(&self, title: &str) -> Result<(Capture, ScreenRect)> {
        let rect = self.platform.windows().rect_of(title)?;
        let capture = self.platform.screen().capture(rect)?;
        Ok((capture, rect))
    }

    /// Match `template` inside the window-relative `region` of the window titled `title`.
    /// A region smaller than the template is logged and reported as a miss.
    pub fn match_in_region(
        &self,
        template: &Path,
        region: ScreenRect,
        title: &str,
        threshold: f32,
        label: &str,
    ) -> Result<MatchResult> {
        let tpl = self.templates.get(template)?;
        let (capture, window) = self.capture_window(title)?;
        let crop = capture.crop(region);
        if crop.width < tpl.width() || crop.height < tpl.height() {
            logger::error_p(
                "vision",
                &format!(
                    "{}: region smaller than template, image={}x{}, template={}x{}",
                    label,
                    crop.width,
                    crop.height,
                    tpl.width(),
                    tpl.height()
                ),
            );
            return Ok(MatchResult::miss());
        }
        let offset = Point::new(window.left + region.left.max(0), window.top + region.top.max(0));
        let result = match_template(self.matcher.as_ref(), &crop.to_luma(), &tpl, threshold, offset);
        logger::debug_p("vision", &format!("{} score={:.3}", label, result.score));
        Ok(result)
    }

    pub fn match_in_roi(
        &self,
        template: &Path,
        roi_path: &Path,
        roi_name: &str,
        title: &str,
        threshold: f32,
        label: &str,
    ) -> Result<MatchResult> {
        let region = load_roi_region(roi_path, roi_name)?;
        self.match_in_region(template, region, title, threshold, label)
    }

    /// The named ROI grown by `ratio` and clamped into the current window size.
    pub fn expanded_roi(
        &self,
        roi_path: &Path,
        roi_name: &str,
        title: &str,
        ratio: f64,
    ) -> Result<ScreenRect> {
        let region = load_roi_region(roi_path, roi_name)?;
        let window = self.platform.windows().rect_of(title)?;
        Ok(expand_roi_region(region, ratio, window.size()))
    }
}
