use std::fmt;
use std::path::Path;
use std::time::SystemTime;

use anyhow::Result;
use serde_json::json;

use crate::config::{ClickConfig, RecoverConfig, SceneConfig};
use crate::logger;
use crate::platform::Platform;
use crate::sleep::{ms, Clock};
use crate::types::*;
use crate::vision::ocr::{self, OcrEngine};
use crate::vision::roi::{load_roi_region, roi_center};
use crate::window_recovery::{is_point_clickable, WindowRecovery};

/// `offset_index` of attempts that failed before any candidate was tried.
pub const ROUND_LEVEL: i32 = -1;
/// `offset_index` of the OCR fallback attempt.
pub const FALLBACK: i32 = -2;

/// Why an attempt ended the way it did. `Display` renders the stable wire string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickReason {
    ActivateOrForegroundCheckFailed,
    ResolveBasePointFailed(String),
    BasePointOutsideWorkRect { point: Point, visible: ScreenRect, guard: i32 },
    CandidateOutsideWorkRect { visible: ScreenRect, guard: i32 },
    ClickFailed(String),
    ForegroundLostAfterClick,
    VerifyFailed,
    VerifyError(String),
    OkVerified,
    OkWithoutVerify,
    OcrFallbackSuccess,
    OcrFallbackError(String),
    /// Direct path only: the point provider failed.
    ResolvePointFailed(String),
    NoAttempt,
}

impl ClickReason {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ClickReason::OkVerified | ClickReason::OkWithoutVerify | ClickReason::OcrFallbackSuccess
        )
    }
}

impl fmt::Display for ClickReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClickReason::ActivateOrForegroundCheckFailed => f.write_str("activate_or_foreground_check_failed"),
            ClickReason::ResolveBasePointFailed(e) => write!(f, "resolve_base_point_failed:{}", e),
            ClickReason::BasePointOutsideWorkRect { point, visible, guard } => write!(
                f,
                "base_point_outside_work_rect:point={},visible_rect={},guard={}",
                point, visible, guard
            ),
            ClickReason::CandidateOutsideWorkRect { visible, guard } => {
                write!(f, "candidate_outside_work_rect:visible_rect={},guard={}", visible, guard)
            }
            ClickReason::ClickFailed(e) => write!(f, "click_failed:{}", e),
            ClickReason::ForegroundLostAfterClick => f.write_str("foreground_lost_after_click"),
            ClickReason::VerifyFailed => f.write_str("verify_failed"),
            ClickReason::VerifyError(e) => write!(f, "verify_error:{}", e),
            ClickReason::OkVerified => f.write_str("ok_verified"),
            ClickReason::OkWithoutVerify => f.write_str("ok_without_verify"),
            ClickReason::OcrFallbackSuccess => f.write_str("ocr_fallback_success"),
            ClickReason::OcrFallbackError(e) => write!(f, "ocr_fallback_error:{}", e),
            ClickReason::ResolvePointFailed(e) => write!(f, "resolve_point_failed:{}", e),
            ClickReason::NoAttempt => f.write_str("click_no_attempt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClickAttempt {
    pub point: Point,
    /// 1-based.
    pub round_index: u32,
    /// Index into the candidate list, or [`ROUND_LEVEL`] / [`FALLBACK`].
    pub offset_index: i32,
    pub success: bool,
    pub reason: ClickReason,
}

#[derive(Debug, Clone)]
pub struct ClickResult {
    pub success: bool,
    pub attempts: Vec<ClickAttempt>,
    pub final_reason: ClickReason,
    pub success_point: Option<Point>,
    pub success_time: Option<SystemTime>,
}

impl ClickResult {
    fn failed(attempts: Vec<ClickAttempt>) -> Self {
        let final_reason = attempts
            .last()
            .map(|a| a.reason.clone())
            .unwrap_or(ClickReason::NoAttempt);
        Self { success: false, attempts, final_reason, success_point: None, success_time: None }
    }

    /// Attempt trace in the shape written to evidence bundles.
    pub fn attempts_json(&self) -> serde_json::Value {
        self.attempts
            .iter()
            .map(|a| {
                json!({
                    "success": a.success,
                    "point": [a.point.x, a.point.y],
                    "round_index": a.round_index,
                    "offset_index": a.offset_index,
                    "reason": a.reason.to_string(),
                })
            })
            .collect()
    }
}

/// Who is being clicked, for logs and recovery decisions.
#[derive(Debug, Clone, Copy)]
pub struct ClickTarget<'t> {
    pub title: &'t str,
    pub stage: &'t str,
    pub name: &'t str,
    pub recover_enabled: bool,
}

pub type PointProvider<'p> = dyn FnMut() -> Result<Point> + 'p;
pub type VerifyAction<'v> = dyn FnMut(Point, SystemTime) -> Result<bool> + 'v;
pub type FallbackAction<'f> = dyn FnMut() -> Result<bool> + 'f;

/// Turns a nominal target point into a verified, retried click.
pub struct ClickStrategy<'a> {
    platform: &'a dyn Platform,
    recovery: WindowRecovery<'a>,
    clock: &'a dyn Clock,
    cfg: &'a ClickConfig,
    recover_cfg: &'a RecoverConfig,
}

impl<'a> ClickStrategy<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        clock: &'a dyn Clock,
        cfg: &'a ClickConfig,
        recover_cfg: &'a RecoverConfig,
    ) -> Self {
        Self {
            platform,
            recovery: WindowRecovery::new(platform.windows(), clock),
            clock,
            cfg,
            recover_cfg,
        }
    }

    /// Click the centre of a named ROI, re-reading the window origin every round.
    pub fn click_roi(
        &self,
        target: &ClickTarget,
        roi_path: &Path,
        roi_name: &str,
        verify: Option<&mut VerifyAction>,
        fallback: Option<&mut FallbackAction>,
    ) -> ClickResult {
        let windows = self.platform.windows();
        let mut provider = || -> Result<Point> {
            let window = windows.rect_of(target.title)?;
            let roi = load_roi_region(roi_path, roi_name)?;
            Ok(roi_center(roi, Point::new(window.left, window.top)))
        };
        self.click(target, &mut provider, verify, fallback)
    }

    pub fn click(
        &self,
        target: &ClickTarget,
        point: &mut PointProvider,
        mut verify: Option<&mut VerifyAction>,
        fallback: Option<&mut FallbackAction>,
    ) -> ClickResult {
        if !self.cfg.strategy_enabled {
            return self.click_direct(point, verify);
        }

        let rounds = self.cfg.attempts();
        let guard = self.cfg.guard();
        let offsets = self.cfg.offsets();
        let mut attempts = Vec::new();
        let fail = |round: u32, offset: i32, point: Point, reason: ClickReason| ClickAttempt {
            point,
            round_index: round,
            offset_index: offset,
            success: false,
            reason,
        };

        for round in 1..=rounds {
            if !self.activate(target.title) {
                attempts.push(fail(round, ROUND_LEVEL, Point::default(), ClickReason::ActivateOrForegroundCheckFailed));
                self.backoff(round);
                continue;
            }

            let (base, visible) = match self.resolve_base_point(target, point) {
                Ok(v) => v,
                Err(reason) => {
                    attempts.push(fail(round, ROUND_LEVEL, Point::default(), reason));
                    self.backoff(round);
                    continue;
                }
            };

            for (index, &(dx, dy)) in offsets.iter().enumerate() {
                let index = index as i32;
                let candidate = base.offset(dx, dy);
                if !is_point_clickable(candidate, visible, guard) {
                    attempts.push(fail(round, index, candidate, ClickReason::CandidateOutsideWorkRect { visible, guard }));
                    continue;
                }

                let click_time = self.clock.wall();
                if let Err(e) = self.platform.input().click(candidate) {
                    attempts.push(fail(round, index, candidate, ClickReason::ClickFailed(e.to_string())));
                    continue;
                }
                self.clock.sleep(ms(self.cfg.post_check_delay_ms));

                if self.cfg.verify_foreground && !self.platform.windows().is_foreground(target.title) {
                    attempts.push(fail(round, index, candidate, ClickReason::ForegroundLostAfterClick));
                    continue;
                }

                let reason = match verify.as_deref_mut() {
                    None => ClickReason::OkWithoutVerify,
                    Some(check) => match check(candidate, click_time) {
                        Ok(true) => ClickReason::OkVerified,
                        Ok(false) => {
                            attempts.push(fail(round, index, candidate, ClickReason::VerifyFailed));
                            continue;
                        }
                        Err(e) => {
                            attempts.push(fail(round, index, candidate, ClickReason::VerifyError(e.to_string())));
                            continue;
                        }
                    },
                };
                logger::info_p(
                    "click",
                    &format!(
                        "{} stage={} target={} round={} offset={} point={}",
                        reason, target.stage, target.name, round, index, candidate
                    ),
                );
                attempts.push(ClickAttempt {
                    point: candidate,
                    round_index: round,
                    offset_index: index,
                    success: reason.is_success(),
                    reason: reason.clone(),
                });
                return ClickResult {
                    success: true,
                    attempts,
                    final_reason: reason,
                    success_point: Some(candidate),
                    success_time: Some(click_time),
                };
            }
            self.backoff(round);
        }

        if let (true, Some(fallback)) = (self.cfg.ocr_fallback_enabled, fallback) {
            let recovered = match fallback() {
                Ok(ok) => ok,
                Err(e) => {
                    attempts.push(fail(rounds, FALLBACK, Point::default(), ClickReason::OcrFallbackError(e.to_string())));
                    false
                }
            };
            if recovered && self.reverify_fallback(target, verify) {
                logger::warn_p(
                    "click",
                    &format!("OCR fallback succeeded: stage={} target={}", target.stage, target.name),
                );
                attempts.push(ClickAttempt {
                    point: Point::default(),
                    round_index: rounds,
                    offset_index: FALLBACK,
                    success: true,
                    reason: ClickReason::OcrFallbackSuccess,
                });
                return ClickResult {
                    success: true,
                    attempts,
                    final_reason: ClickReason::OcrFallbackSuccess,
                    success_point: None,
                    success_time: None,
                };
            }
        }

        let result = ClickResult::failed(attempts);
        logger::warn_p(
            "click",
            &format!(
                "click failed: stage={} target={} attempts={} reason={}",
                target.stage,
                target.name,
                result.attempts.len(),
                result.final_reason
            ),
        );
        result
    }

    fn reverify_fallback(&self, target: &ClickTarget, verify: Option<&mut VerifyAction>) -> bool {
        if !self.cfg.fallback_reverify {
            return true;
        }
        let Some(check) = verify else {
            return true;
        };
        match check(Point::default(), self.clock.wall()) {
            Ok(ok) => ok,
            Err(e) => {
                logger::warn_p("click", &format!("verify after OCR fallback failed (stage={}): {}", target.stage, e));
                false
            }
        }
    }

    /// Resolve once, click once, verify once.
    fn click_direct(&self, point: &mut PointProvider, verify: Option<&mut VerifyAction>) -> ClickResult {
        let target = match point() {
            Ok(p) => p,
            Err(e) => {
                return ClickResult {
                    success: false,
                    attempts: Vec::new(),
                    final_reason: ClickReason::ResolvePointFailed(e.to_string()),
                    success_point: None,
                    success_time: None,
                }
            }
        };
        let single = |success: bool, reason: ClickReason| ClickAttempt {
            point: target,
            round_index: 1,
            offset_index: 0,
            success,
            reason,
        };
        if let Err(e) = self.platform.input().click(target) {
            return ClickResult::failed(vec![single(false, ClickReason::ClickFailed(e.to_string()))]);
        }
        let click_time = self.clock.wall();
        let reason = match verify {
            None => ClickReason::OkWithoutVerify,
            Some(check) => match check(target, click_time) {
                Ok(true) => ClickReason::OkVerified,
                Ok(false) => return ClickResult::failed(vec![single(false, ClickReason::VerifyFailed)]),
                Err(e) => {
                    return ClickResult::failed(vec![single(false, ClickReason::VerifyError(e.to_string()))])
                }
            },
        };
        ClickResult {
            success: true,
            attempts: vec![single(reason.is_success(), reason.clone())],
            final_reason: reason,
            success_point: Some(target),
            success_time: Some(click_time),
        }
    }

    fn activate(&self, title: &str) -> bool {
        let windows = self.platform.windows();
        let Some(id) = windows.find(title) else {
            logger::warn_p("click", &format!("target window not found: {}", title));
            return false;
        };
        if let Err(e) = windows.activate(id) {
            logger::warn_p("click", &format!("activate failed: {}", e));
            return false;
        }
        self.clock.sleep(ms(self.cfg.foreground_wait_ms));
        if self.cfg.verify_foreground && !windows.is_foreground(title) {
            logger::warn_p("click", &format!("foreground window is not {}", title));
            return false;
        }
        true
    }

    /// Resolve the base point, recovering the window between re-resolves while it stays
    /// outside the visible rect.
    fn resolve_base_point(
        &self,
        target: &ClickTarget,
        point: &mut PointProvider,
    ) -> Result<(Point, ScreenRect), ClickReason> {
        let guard = self.cfg.guard();
        let max_recover = self.recover_cfg.attempts();
        let mut recovered = 0;
        loop {
            let base = point().map_err(|e| ClickReason::ResolveBasePointFailed(e.to_string()))?;
            let visible = self.recovery.visible_rect(target.title);
            if is_point_clickable(base, visible, guard) {
                return Ok((base, visible));
            }
            let reason = ClickReason::BasePointOutsideWorkRect { point: base, visible, guard };
            if !target.recover_enabled || recovered >= max_recover {
                return Err(reason);
            }
            recovered += 1;
            let outcome = self.recovery.recover(
                target.title,
                self.recover_cfg.padding(),
                self.recover_cfg.allow_resize,
            );
            logger::warn_p(
                "click",
                &format!(
                    "point outside work area, recovering window: stage={} target={} attempt={}/{} point={} visible_rect={} reason={}",
                    target.stage, target.name, recovered, max_recover, base, visible, outcome.reason
                ),
            );
            self.clock.sleep(self.recover_cfg.cooldown());
        }
    }

    fn backoff(&self, round: u32) {
        if let Some(d) = self.cfg.backoff_after(round) {
            self.clock.sleep(d);
        }
    }
}

/// Fallback click: OCR the window centre and click the most confident clickable keyword.
pub fn click_ocr_keyword(
    platform: &dyn Platform,
    engine: Option<&OcrEngine>,
    clock: &dyn Clock,
    scene: &SceneConfig,
    title: &str,
    stage: &str,
) -> Result<bool> {
    if scene.clickable_keywords.is_empty() {
        return Ok(false);
    }
    let items = ocr::window_items(platform, engine, title, scene.ocr_region_ratio);
    let mut clickable = ocr::find_keyword_items(&items, &scene.clickable_keywords, scene.ocr_keyword_min_score);
    if clickable.is_empty() {
        logger::warn_p("click", &format!("OCR fallback found no keyword (stage={})", stage));
        return Ok(false);
    }
    ocr::sort_by_score(&mut clickable);
    let Some((text, bbox)) = clickable.iter().find_map(|i| i.bbox.map(|b| (&i.text, b))) else {
        logger::warn_p("click", &format!("OCR fallback keywords have no box (stage={})", stage));
        return Ok(false);
    };
    platform.input().click(bbox.center())?;
    logger::warn_p("click", &format!("OCR fallback clicked {} (stage={})", text, stage));
    clock.sleep(ms(300));
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::platform::stub::StubPlatform;
    use crate::platform::WindowLocator;
    use crate::sleep::ManualClock;

    const TITLE: &str = "DNF Taiwan";

    fn target(recover: bool) -> ClickTarget<'static> {
        ClickTarget { title: TITLE, stage: "test", name: "button", recover_enabled: recover }
    }

    fn stub_with_window(rect: ScreenRect) -> StubPlatform {
        let p = StubPlatform::new();
        p.add_window(TITLE, rect);
        p
    }

    #[test]
    fn exhaustion_is_round_major_and_skips_last_backoff() {
        let p = stub_with_window(ScreenRect::new(0, 0, 800, 600));
        let clock = ManualClock::new();
        let cfg = ClickConfig { candidates: vec![(0, 0), (5, 0)], ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let mut provider = || -> Result<Point> { Ok(Point::new(100, 100)) };
        let mut verify = |_p: Point, _t: SystemTime| -> Result<bool> { Ok(false) };
        let r = strategy.click(&target(false), &mut provider, Some(&mut verify), None);

        assert!(!r.success);
        assert_eq!(r.final_reason, ClickReason::VerifyFailed);
        let order: Vec<_> = r.attempts.iter().map(|a| (a.round_index, a.offset_index)).collect();
        assert_eq!(order, vec![(1, 0), (1, 1), (2, 0), (2, 1), (3, 0), (3, 1)]);
        assert_eq!(p.clicks().len(), 6);
        assert_eq!(clock.sleeps(), vec![ms(100), ms(250)]);
    }

    #[test]
    fn fallback_rescues_failed_verify() {
        let p = stub_with_window(ScreenRect::new(0, 0, 800, 600));
        let clock = ManualClock::new();
        let cfg = ClickConfig { max_attempts: 1, ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let mut provider = || -> Result<Point> { Ok(Point::new(50, 50)) };
        let mut verify = |_p: Point, _t: SystemTime| -> Result<bool> { Ok(false) };
        let mut fallback = || -> Result<bool> { Ok(true) };
        let r = strategy.click(&target(false), &mut provider, Some(&mut verify), Some(&mut fallback));

        assert!(r.success);
        assert_eq!(r.final_reason.to_string(), "ocr_fallback_success");
        assert_eq!(r.attempts.len(), 2);
        assert_eq!(r.attempts[1].offset_index, FALLBACK);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn fallback_reverify_can_reject() {
        let p = stub_with_window(ScreenRect::new(0, 0, 800, 600));
        let clock = ManualClock::new();
        let cfg = ClickConfig { max_attempts: 1, fallback_reverify: true, ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let calls = Cell::new(0);
        let mut provider = || -> Result<Point> { Ok(Point::new(50, 50)) };
        let mut verify = |_p: Point, _t: SystemTime| -> Result<bool> {
            calls.set(calls.get() + 1);
            Ok(false)
        };
        let mut fallback = || -> Result<bool> { Ok(true) };
        let r = strategy.click(&target(false), &mut provider, Some(&mut verify), Some(&mut fallback));
        assert!(!r.success);
        assert_eq!(r.final_reason, ClickReason::VerifyFailed);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn fallback_error_is_recorded() {
        let p = stub_with_window(ScreenRect::new(0, 0, 800, 600));
        let clock = ManualClock::new();
        let cfg = ClickConfig { max_attempts: 1, ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let mut provider = || -> Result<Point> { Ok(Point::new(50, 50)) };
        let mut verify = |_p: Point, _t: SystemTime| -> Result<bool> { Ok(false) };
        let mut fallback = || -> Result<bool> { Err(anyhow::anyhow!("ocr down")) };
        let r = strategy.click(&target(false), &mut provider, Some(&mut verify), Some(&mut fallback));
        assert!(!r.success);
        assert_eq!(r.final_reason.to_string(), "ocr_fallback_error:ocr down");
    }

    #[test]
    fn verify_picks_second_offset() {
        let p = stub_with_window(ScreenRect::new(0, 0, 800, 600));
        let clock = ManualClock::new();
        let cfg = ClickConfig { candidates: vec![(0, 0), (3, 3)], ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let mut provider = || -> Result<Point> { Ok(Point::new(100, 100)) };
        let mut verify = |p: Point, _t: SystemTime| -> Result<bool> { Ok(p == Point::new(103, 103)) };
        let r = strategy.click(&target(false), &mut provider, Some(&mut verify), None);
        assert!(r.success);
        assert_eq!(r.final_reason, ClickReason::OkVerified);
        assert_eq!(r.success_point, Some(Point::new(103, 103)));
        assert_eq!(r.attempts.len(), 2);
        assert!(r.success_time.is_some());
    }

    #[test]
    fn click_failure_moves_to_next_offset() {
        let p = stub_with_window(ScreenRect::new(0, 0, 800, 600));
        p.fail_clicks(1);
        let clock = ManualClock::new();
        let cfg = ClickConfig { candidates: vec![(0, 0), (1, 0)], ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let mut provider = || -> Result<Point> { Ok(Point::new(10, 10)) };
        let r = strategy.click(&target(false), &mut provider, None, None);
        assert!(r.success);
        assert_eq!(r.attempts[0].reason.to_string(), "click_failed:injected click failure");
        assert_eq!(r.final_reason, ClickReason::OkWithoutVerify);
        assert_eq!(p.clicks(), vec![Point::new(11, 10)]);
    }

    #[test]
    fn verify_error_is_a_failure() {
        let p = stub_with_window(ScreenRect::new(0, 0, 800, 600));
        let clock = ManualClock::new();
        let cfg = ClickConfig { max_attempts: 1, ocr_fallback_enabled: false, ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let mut provider = || -> Result<Point> { Ok(Point::new(10, 10)) };
        let mut verify = |_p: Point, _t: SystemTime| -> Result<bool> { Err(anyhow::anyhow!("boom")) };
        let mut fallback = || -> Result<bool> { Ok(true) };
        let r = strategy.click(&target(false), &mut provider, Some(&mut verify), Some(&mut fallback));
        assert!(!r.success);
        assert_eq!(r.final_reason.to_string(), "verify_error:boom");
    }

    #[test]
    fn missing_window_fails_every_round_with_backoff() {
        let p = StubPlatform::new();
        let clock = ManualClock::new();
        let cfg = ClickConfig { backoff_ms: vec![100, 200], ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let mut provider = || -> Result<Point> { Ok(Point::new(10, 10)) };
        let r = strategy.click(&target(false), &mut provider, None, None);
        assert_eq!(r.attempts.len(), 3);
        assert!(r.attempts.iter().all(|a| a.offset_index == ROUND_LEVEL));
        assert_eq!(r.final_reason, ClickReason::ActivateOrForegroundCheckFailed);
        assert_eq!(clock.sleeps(), vec![ms(100), ms(200)]);
    }

    #[test]
    fn offscreen_point_without_recovery() {
        let p = stub_with_window(ScreenRect::new(-300, -200, 1000, 800));
        let clock = ManualClock::new();
        let cfg = ClickConfig { max_attempts: 1, ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let windows: &dyn WindowLocator = &p;
        let mut provider = || -> Result<Point> { Ok(windows.rect_of(TITLE)?.center().offset(-550, -450)) };
        let r = strategy.click(&target(false), &mut provider, None, None);
        assert!(!r.success);
        assert_eq!(
            r.final_reason.to_string(),
            "base_point_outside_work_rect:point=(-350, -250),visible_rect=(0, 0, 1920, 1080),guard=0"
        );
        assert!(p.clicks().is_empty());
    }

    #[test]
    fn recovery_brings_point_back_on_screen() {
        let p = stub_with_window(ScreenRect::new(-300, -200, 1000, 800));
        let clock = ManualClock::new();
        let cfg = ClickConfig::default();
        let rc = RecoverConfig { cooldown_ms: 50, padding_px: 24, ..RecoverConfig::default() };
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let windows: &dyn WindowLocator = &p;
        let mut provider = || -> Result<Point> {
            let w = windows.rect_of(TITLE)?;
            Ok(Point::new(w.left + 100, w.top + 100))
        };
        let r = strategy.click(&target(true), &mut provider, None, None);
        assert!(r.success);
        assert_eq!(r.attempts.len(), 1);
        assert_eq!(p.clicks(), vec![Point::new(124, 124)]);
        assert_eq!(clock.sleeps(), vec![ms(50)]);
    }

    #[test]
    fn recovery_that_cannot_reach_point_gives_up() {
        let p = stub_with_window(ScreenRect::new(-300, -200, 1000, 800));
        let clock = ManualClock::new();
        let cfg = ClickConfig { max_attempts: 1, ..ClickConfig::default() };
        let rc = RecoverConfig { max_attempts: 3, cooldown_ms: 50, padding_px: 24, ..RecoverConfig::default() };
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        // Fixed off-screen point: no window move can bring it into view.
        let resolves = Cell::new(0);
        let mut provider = || -> Result<Point> {
            resolves.set(resolves.get() + 1);
            Ok(Point::new(-50, -50))
        };
        let r = strategy.click(&target(true), &mut provider, None, None);
        assert!(!r.success);
        assert!(!r.final_reason.is_success());
        assert!(r.final_reason.to_string().starts_with("base_point_outside_work_rect"), "{}", r.final_reason);
        assert_eq!(r.attempts.len(), 1);
        // One cooldown per recover call, one re-resolve after each.
        assert_eq!(clock.sleeps(), vec![ms(50); 3]);
        assert_eq!(resolves.get(), 4);
        assert!(p.clicks().is_empty());
    }

    #[test]
    fn guard_rejects_edge_candidate() {
        let p = stub_with_window(ScreenRect::new(0, 0, 800, 600));
        let clock = ManualClock::new();
        let cfg = ClickConfig {
            max_attempts: 1,
            guard_padding_px: 10,
            candidates: vec![(-15, 0), (0, 0)],
            ..ClickConfig::default()
        };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let mut provider = || -> Result<Point> { Ok(Point::new(20, 300)) };
        let r = strategy.click(&target(false), &mut provider, None, None);
        assert!(r.success);
        assert_eq!(
            r.attempts[0].reason.to_string(),
            "candidate_outside_work_rect:visible_rect=(0, 0, 1920, 1080),guard=10"
        );
        assert_eq!(p.clicks(), vec![Point::new(20, 300)]);
    }

    #[test]
    fn direct_path_clicks_roi_center_once() {
        let dir = tempfile::tempdir().unwrap();
        let roi = dir.path().join("roi.json");
        std::fs::write(&roi, r#"{"rois": [{"name": "button_startgame", "x": 10, "y": 20, "w": 100, "h": 40}]}"#).unwrap();
        let p = stub_with_window(ScreenRect::new(100, 200, 800, 600));
        let clock = ManualClock::new();
        let cfg = ClickConfig { strategy_enabled: false, ..ClickConfig::default() };
        let rc = RecoverConfig::default();
        let strategy = ClickStrategy::new(&p, &clock, &cfg, &rc);

        let r = strategy.click_roi(&target(false), &roi, "button_startgame", None, None);
        assert!(r.success);
        assert_eq!(r.final_reason, ClickReason::OkWithoutVerify);
        assert_eq!(p.clicks(), vec![Point::new(160, 240)]);

        let r = strategy.click_roi(&target(false), &roi, "missing", None, None);
        assert!(!r.success);
        assert!(r.attempts.is_empty());
        assert!(r.final_reason.to_string().starts_with("resolve_point_failed:"));
    }

    #[test]
    fn attempts_serialize_reason_strings() {
        let r = ClickResult::failed(vec![ClickAttempt {
            point: Point::new(1, 2),
            round_index: 1,
            offset_index: ROUND_LEVEL,
            success: false,
            reason: ClickReason::ForegroundLostAfterClick,
        }]);
        let v = r.attempts_json();
        assert_eq!(v[0]["reason"], "foreground_lost_after_click");
        assert_eq!(v[0]["point"], json!([1, 2]));
        assert_eq!(ClickResult::failed(vec![]).final_reason.to_string(), "click_no_attempt");
    }
}
