use serde::Serialize;
use thiserror::Error;

use crate::config::RecoverConfig;
use crate::logger;
use crate::platform::WindowLocator;
use crate::sleep::Clock;
use crate::types::*;

/// Result of one attempt to pull a window back inside its visible area.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoverOutcome {
    pub success: bool,
    pub window: Option<WindowId>,
    pub before_rect: Option<ScreenRect>,
    pub after_rect: Option<ScreenRect>,
    pub visible_rect: ScreenRect,
    pub reason: String,
}

impl RecoverOutcome {
    fn failed(window: Option<WindowId>, visible_rect: ScreenRect, reason: String) -> Self {
        Self {
            success: false,
            window,
            before_rect: None,
            after_rect: None,
            visible_rect,
            reason,
        }
    }
}

/// Share of `window` inside `visible`, in [0, 1]. Empty windows count as invisible.
pub fn compute_visible_ratio(window: ScreenRect, visible: ScreenRect) -> f64 {
    if window.area() <= 0 {
        return 0.0;
    }
    let shown = window.intersect(&visible).map(|r| r.area()).unwrap_or(0);
    (shown as f64 / window.area() as f64).clamp(0.0, 1.0)
}

pub fn is_point_in_rect(point: Point, rect: ScreenRect) -> bool {
    rect.contains(point)
}

/// Inside `rect` and, when the rect is large enough, also inside it shrunk by `guard` px.
/// A rect no larger than `2 * guard` in either dimension ignores the guard.
pub fn is_point_clickable(point: Point, rect: ScreenRect, guard: i32) -> bool {
    if !rect.contains(point) {
        return false;
    }
    if guard <= 0 || rect.width <= guard * 2 || rect.height <= guard * 2 {
        return true;
    }
    rect.shrink(guard).contains(point)
}

/// Target geometry for a window that should sit inside `visible` minus `padding`.
///
/// With `allow_resize` the window shrinks to fit the padded area (never below 1px).
/// When it still cannot fit along an axis it is anchored to the visible origin on that axis.
pub fn clamp_to_visible(
    window: ScreenRect,
    visible: ScreenRect,
    padding: i32,
    allow_resize: bool,
) -> ScreenRect {
    let pad = padding.max(0);
    let (mut width, mut height) = window.size();
    if allow_resize {
        width = width.min(visible.width - pad * 2).max(1);
        height = height.min(visible.height - pad * 2).max(1);
    }
    let clamp_axis = |pos: i32, size: i32, start: i32, end: i32| {
        let lo = start + pad;
        let hi = end - pad - size;
        if hi < lo {
            start
        } else {
            pos.clamp(lo, hi)
        }
    };
    ScreenRect::new(
        clamp_axis(window.left, width, visible.left, visible.right()),
        clamp_axis(window.top, height, visible.top, visible.bottom()),
        width,
        height,
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityReport {
    /// False when the check is disabled in config.
    pub checked: bool,
    pub ratio: f64,
    pub recovered: bool,
}

#[derive(Debug, Error)]
pub enum VisibilityError {
    #[error("window visibility check failed: {0}")]
    Measure(String),
    #[error("window visible ratio too low: {ratio:.3} < {min:.3}")]
    Insufficient {
        ratio: f64,
        min: f64,
        window: ScreenRect,
        visible: ScreenRect,
        last_outcome: Option<RecoverOutcome>,
    },
}

/// Keeps target windows inside the usable desktop.
pub struct WindowRecovery<'a> {
    windows: &'a dyn WindowLocator,
    clock: &'a dyn Clock,
}

impl<'a> WindowRecovery<'a> {
    pub fn new(windows: &'a dyn WindowLocator, clock: &'a dyn Clock) -> Self {
        Self { windows, clock }
    }

    /// Work area of the monitor nearest the window, else the whole virtual screen.
    pub fn visible_rect(&self, title: &str) -> ScreenRect {
        self.windows
            .find(title)
            .and_then(|id| self.windows.work_area(id))
            .unwrap_or_else(|| self.windows.virtual_screen())
    }

    pub fn recover(&self, title: &str, padding: i32, allow_resize: bool) -> RecoverOutcome {
        let Some(id) = self.windows.find(title) else {
            return RecoverOutcome::failed(None, self.windows.virtual_screen(), "window_not_found".into());
        };
        if let Err(e) = self.windows.activate(id) {
            logger::warn_p("window", &format!("activate before recover failed: {}", e));
        }
        let visible = self
            .windows
            .work_area(id)
            .unwrap_or_else(|| self.windows.virtual_screen());

        let before = match self.windows.rect(id) {
            Ok(r) => r,
            Err(e) => {
                return RecoverOutcome::failed(Some(id), visible, format!("read_before_rect_failed:{}", e))
            }
        };
        let target = clamp_to_visible(before, visible, padding, allow_resize);
        if let Err(e) = self.windows.set_rect(id, target) {
            return RecoverOutcome {
                before_rect: Some(before),
                ..RecoverOutcome::failed(Some(id), visible, format!("set_window_pos_failed:{}", e))
            };
        }
        let after = match self.windows.rect(id) {
            Ok(r) => r,
            Err(e) => {
                return RecoverOutcome {
                    before_rect: Some(before),
                    ..RecoverOutcome::failed(Some(id), visible, format!("read_after_rect_failed:{}", e))
                }
            }
        };
        logger::info_p(
            "window",
            &format!("recovered {}: {} -> {} within {}", title, before, after, visible),
        );
        RecoverOutcome {
            success: true,
            window: Some(id),
            before_rect: Some(before),
            after_rect: Some(after),
            visible_rect: visible,
            reason: "ok".into(),
        }
    }

    fn measure(&self, title: &str) -> Result<(ScreenRect, ScreenRect, f64), VisibilityError> {
        let window = self
            .windows
            .rect_of(title)
            .map_err(|e| VisibilityError::Measure(e.to_string()))?;
        let visible = self.visible_rect(title);
        Ok((window, visible, compute_visible_ratio(window, visible)))
    }

    /// Visibility gate run before waits and clicks. `auto_recover` says whether this window
    /// kind may be moved; with it off a low ratio fails straight away.
    pub fn ensure_visible(
        &self,
        title: &str,
        cfg: &RecoverConfig,
        auto_recover: bool,
    ) -> Result<VisibilityReport, VisibilityError> {
        if !cfg.visibility_check_enabled {
            return Ok(VisibilityReport { checked: false, ratio: 1.0, recovered: false });
        }
        let (mut window, mut visible, mut ratio) = self.measure(title)?;
        if ratio >= cfg.visible_ratio_min {
            return Ok(VisibilityReport { checked: true, ratio, recovered: false });
        }

        let mut last_outcome = None;
        if auto_recover {
            let attempts = cfg.attempts();
            for attempt in 1..=attempts {
                let outcome = self.recover(title, cfg.padding(), cfg.allow_resize);
                logger::warn_p(
                    "window",
                    &format!(
                        "visible ratio {:.3} below {:.3}, recover {}/{}: {}",
                        ratio, cfg.visible_ratio_min, attempt, attempts, outcome.reason
                    ),
                );
                last_outcome = Some(outcome);
                self.clock.sleep(cfg.cooldown());
                (window, visible, ratio) = self.measure(title)?;
                if ratio >= cfg.visible_ratio_min {
                    logger::info_p("window", &format!("{} visible again, ratio={:.3}", title, ratio));
                    return Ok(VisibilityReport { checked: true, ratio, recovered: true });
                }
            }
        }
        Err(VisibilityError::Insufficient {
            ratio,
            min: cfg.visible_ratio_min,
            window,
            visible,
            last_outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::stub::StubPlatform;
    use crate::sleep::{ms, ManualClock};

    fn r(l: i32, t: i32, w: i32, h: i32) -> ScreenRect {
        ScreenRect::new(l, t, w, h)
    }

    #[test]
    fn clamp_moves_offscreen_window_inside_padding() {
        let got = clamp_to_visible(r(-300, -200, 1000, 800), r(0, 0, 1920, 1080), 24, false);
        assert_eq!(got, r(24, 24, 1000, 800));
    }

    #[test]
    fn clamp_resizes_oversized_window() {
        let got = clamp_to_visible(r(0, 0, 3000, 2000), r(0, 0, 1920, 1080), 24, true);
        assert_eq!(got, r(24, 24, 1872, 1032));
    }

    #[test]
    fn clamp_anchors_oversized_window_to_origin() {
        let visible = r(-1920, 0, 1920, 1080);
        let got = clamp_to_visible(r(-1000, 300, 3000, 500), visible, 24, false);
        assert_eq!(got, r(-1920, 300, 3000, 500));
    }

    #[test]
    fn clamp_is_deterministic_and_contained() {
        let visible = r(-1280, 40, 1280, 984);
        for (i, win) in [r(-5000, -5000, 300, 200), r(4000, 900, 640, 480), r(-700, 500, 1200, 400)]
            .into_iter()
            .enumerate()
        {
            let pad = 8 * i as i32;
            let a = clamp_to_visible(win, visible, pad, false);
            assert_eq!(a, clamp_to_visible(win, visible, pad, false));
            assert!(a.left >= visible.left + pad && a.right() <= visible.right() - pad);
            assert!(a.top >= visible.top + pad && a.bottom() <= visible.bottom() - pad);
            assert_eq!(a.size(), win.size());
        }
    }

    #[test]
    fn visible_ratio_counts_intersection() {
        let ratio = compute_visible_ratio(r(-200, 0, 1000, 800), r(0, 0, 1920, 1080));
        assert!((ratio - 0.8).abs() < 1e-9);
        assert_eq!(compute_visible_ratio(r(5000, 0, 10, 10), r(0, 0, 1920, 1080)), 0.0);
        assert_eq!(compute_visible_ratio(r(0, 0, 0, 10), r(0, 0, 1920, 1080)), 0.0);
    }

    #[test]
    fn guard_padding_shrinks_clickable_area() {
        let rect = r(0, 0, 200, 100);
        assert!(is_point_clickable(Point::new(10, 10), rect, 0));
        assert!(!is_point_clickable(Point::new(10, 10), rect, 20));
        assert!(is_point_clickable(Point::new(20, 20), rect, 20));
        assert!(!is_point_clickable(Point::new(180, 50), rect, 20));
        assert!(!is_point_clickable(Point::new(200, 50), rect, 0));
    }

    #[test]
    fn guard_ignored_for_small_rect() {
        let rect = r(0, 0, 40, 300);
        assert!(is_point_clickable(Point::new(1, 1), rect, 20));
        assert!(!is_point_clickable(Point::new(40, 1), rect, 20));
    }

    #[test]
    fn recover_moves_stub_window() {
        let p = StubPlatform::with_screen(r(0, 0, 1920, 1080), Some(r(0, 0, 1920, 1040)));
        let id = p.add_window("DNF Taiwan", r(-300, -200, 1000, 800));
        let clock = ManualClock::new();
        let wr = WindowRecovery::new(&p, &clock);
        let out = wr.recover("DNF Taiwan", 24, false);
        assert!(out.success, "{}", out.reason);
        assert_eq!(out.before_rect, Some(r(-300, -200, 1000, 800)));
        assert_eq!(out.after_rect, Some(r(24, 24, 1000, 800)));
        assert_eq!(out.visible_rect, r(0, 0, 1920, 1040));
        assert_eq!(p.window_rect(id), Some(r(24, 24, 1000, 800)));
        assert_eq!(p.foreground_title().as_deref(), Some("DNF Taiwan"));
    }

    #[test]
    fn recover_missing_window() {
        let p = StubPlatform::new();
        let clock = ManualClock::new();
        let out = WindowRecovery::new(&p, &clock).recover("nope", 0, false);
        assert!(!out.success);
        assert_eq!(out.reason, "window_not_found");
        assert_eq!(out.visible_rect, r(0, 0, 1920, 1080));
    }

    #[test]
    fn visible_rect_falls_back_to_virtual_screen() {
        let p = StubPlatform::new();
        p.add_window("DNF Taiwan", r(0, 0, 10, 10));
        let clock = ManualClock::new();
        assert_eq!(WindowRecovery::new(&p, &clock).visible_rect("DNF Taiwan"), r(0, 0, 1920, 1080));
    }

    #[test]
    fn ensure_visible_recovers_when_allowed() {
        let p = StubPlatform::new();
        p.add_window("DNF Taiwan", r(-600, 0, 1000, 800));
        let clock = ManualClock::new();
        let wr = WindowRecovery::new(&p, &clock);
        let cfg = RecoverConfig { cooldown_ms: 300, ..RecoverConfig::default() };

        match wr.ensure_visible("DNF Taiwan", &cfg, false) {
            Err(VisibilityError::Insufficient { ratio, last_outcome, .. }) => {
                assert!((ratio - 0.4).abs() < 1e-9);
                assert!(last_outcome.is_none());
            }
            other => panic!("expected insufficient, got {:?}", other),
        }

        let report = wr.ensure_visible("DNF Taiwan", &cfg, true).unwrap();
        assert!(report.recovered);
        assert_eq!(report.ratio, 1.0);
        assert_eq!(clock.sleeps(), vec![ms(300)]);
    }

    #[test]
    fn ensure_visible_skips_when_disabled_and_errors_without_window() {
        let p = StubPlatform::new();
        let clock = ManualClock::new();
        let wr = WindowRecovery::new(&p, &clock);
        let off = RecoverConfig { visibility_check_enabled: false, ..RecoverConfig::default() };
        assert!(!wr.ensure_visible("x", &off, true).unwrap().checked);
        assert!(matches!(
            wr.ensure_visible("x", &RecoverConfig::default(), true),
            Err(VisibilityError::Measure(_))
        ));
    }
}
