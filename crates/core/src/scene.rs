use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::SceneConfig;
use crate::logger;
use crate::platform::Platform;
use crate::sleep::{ms, Clock};
use crate::types::*;
use crate::vision::ocr::{self, OcrEngine};

/// Named, side-effect-free test for "scene X is on screen".
pub struct SceneChecker<'c> {
    pub name: String,
    predicate: Box<dyn Fn() -> Result<bool> + 'c>,
}

impl<'c> SceneChecker<'c> {
    pub fn new(name: impl Into<String>, predicate: impl Fn() -> Result<bool> + 'c) -> Self {
        Self { name: name.into(), predicate: Box::new(predicate) }
    }

    pub fn check(&self) -> Result<bool> {
        (self.predicate)()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneWaitResult {
    /// `None` means the wait timed out with nothing recognised.
    pub scene: Option<String>,
    pub is_expected: bool,
}

impl SceneWaitResult {
    pub fn hit(scene: &str, expected: &str) -> Self {
        Self { scene: Some(scene.to_string()), is_expected: scene == expected }
    }

    pub fn timeout() -> Self {
        Self { scene: None, is_expected: false }
    }

    pub fn is(&self, name: &str) -> bool {
        self.scene.as_deref() == Some(name)
    }
}

pub fn find_scene_index(checkers: &[SceneChecker], name: &str) -> Option<usize> {
    checkers.iter().position(|c| c.name == name)
}

/// First checker among `indices` that matches. Predicate errors count as no match.
pub fn scan_scenes(checkers: &[SceneChecker], indices: &[usize]) -> Option<String> {
    for &i in indices {
        let Some(checker) = checkers.get(i) else {
            continue;
        };
        match checker.check() {
            Ok(true) => return Some(checker.name.clone()),
            Ok(false) => {}
            Err(e) => logger::debug_p("scene", &format!("{} check failed: {}", checker.name, e)),
        }
    }
    None
}

pub fn detect_scene(checkers: &[SceneChecker]) -> Option<String> {
    let all: Vec<usize> = (0..checkers.len()).collect();
    scan_scenes(checkers, &all)
}

/// `k, k+1, ..., n-1`
pub fn forward_indices(k: usize, n: usize) -> Vec<usize> {
    (k..n).collect()
}

/// `k, k-1, ..., 0`
pub fn backward_indices(k: usize) -> Vec<usize> {
    (0..=k).rev().collect()
}

/// Look for drift away from `expected`: scan forward (skipped ahead) then backward
/// (kicked back) from its index, for `rounds` rounds. Unknown `expected` starts at 0.
pub fn template_exception_scan(expected: &str, checkers: &[SceneChecker], rounds: u32) -> Option<String> {
    if checkers.is_empty() || rounds == 0 {
        return None;
    }
    let k = find_scene_index(checkers, expected).unwrap_or(0);
    let forward = forward_indices(k, checkers.len());
    let backward = backward_indices(k);
    for round in 1..=rounds {
        if let Some(scene) = scan_scenes(checkers, &forward) {
            logger::info_p("scene", &format!("drift scan hit {} (forward, round {})", scene, round));
            return Some(scene);
        }
        if let Some(scene) = scan_scenes(checkers, &backward) {
            logger::info_p("scene", &format!("drift scan hit {} (backward, round {})", scene, round));
            return Some(scene);
        }
    }
    None
}

/// Poll until one of `targets` is recognised.
pub fn wait_scene_hit(
    checkers: &[SceneChecker],
    targets: &[&str],
    timeout: Duration,
    poll: Duration,
    clock: &dyn Clock,
) -> bool {
    if timeout.is_zero() {
        return false;
    }
    let indices: Vec<usize> = checkers
        .iter()
        .enumerate()
        .filter(|(_, c)| targets.contains(&c.name.as_str()))
        .map(|(i, _)| i)
        .collect();
    if indices.is_empty() {
        return false;
    }
    let deadline = clock.now() + timeout;
    while clock.now() < deadline {
        if scan_scenes(checkers, &indices).is_some() {
            return true;
        }
        clock.sleep(poll.max(ms(50)));
    }
    false
}

/// Parameters of one scene wait.
#[derive(Debug, Clone, Copy)]
pub struct SceneWait<'s> {
    pub expected: &'s str,
    pub timeout: Duration,
    /// Recovery scans only start once more than this much time has passed.
    pub exception_delay: Duration,
    pub poll: Duration,
}

/// Scene waits with template-drift and OCR exception recovery.
pub struct SceneDetector<'a> {
    platform: &'a dyn Platform,
    ocr: Option<&'a OcrEngine>,
    clock: &'a dyn Clock,
    cfg: &'a SceneConfig,
    title: &'a str,
}

impl<'a> SceneDetector<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        ocr: Option<&'a OcrEngine>,
        clock: &'a dyn Clock,
        cfg: &'a SceneConfig,
        title: &'a str,
    ) -> Self {
        Self { platform, ocr, clock, cfg, title }
    }

    /// Poll `detect` for the expected scene. After the exception delay, interleave a drift
    /// scan (at most once per max(1s, poll)) and an OCR exception scan (at most once per
    /// `ocr_interval_seconds`). Probe errors propagate; timeouts do not.
    pub fn wait_for_scene(
        &self,
        wait: SceneWait,
        detect: &mut dyn FnMut() -> Result<bool>,
        checkers: &[SceneChecker],
    ) -> Result<SceneWaitResult> {
        let start = self.clock.now();
        let deadline = start + wait.timeout;
        let drift_every = wait.poll.max(Duration::from_secs(1));
        let ocr_every = Duration::from_secs(self.cfg.ocr_interval_seconds);
        let mut last_drift: Option<Instant> = None;
        let mut last_ocr: Option<Instant> = None;
        let due = |last: Option<Instant>, now: Instant, every: Duration| last.map_or(true, |t| now - t >= every);

        while self.clock.now() < deadline {
            if detect()? {
                logger::info_p("scene", &format!("{} matched", wait.expected));
                return Ok(SceneWaitResult::hit(wait.expected, wait.expected));
            }

            let now = self.clock.now();
            if !checkers.is_empty() && now - start > wait.exception_delay {
                if due(last_drift, now, drift_every) {
                    last_drift = Some(now);
                    let rounds = self.cfg.template_exception_rounds;
                    if let Some(scene) = template_exception_scan(wait.expected, checkers, rounds) {
                        return Ok(SceneWaitResult::hit(&scene, wait.expected));
                    }
                }
                if self.cfg.ocr_interval_seconds > 0 && due(last_ocr, now, ocr_every) {
                    last_ocr = Some(now);
                    if let Some(scene) = self.ocr_exception_scan(wait.expected, checkers) {
                        return Ok(SceneWaitResult::hit(&scene, wait.expected));
                    }
                }
            }
            self.clock.sleep(wait.poll);
        }
        logger::warn_p("scene", &format!("timed out waiting for {}", wait.expected));
        Ok(SceneWaitResult::timeout())
    }

    fn exception_items(&self) -> Option<(Vec<OcrItem>, Vec<OcrItem>)> {
        if self.cfg.exception_keywords.is_empty() {
            return None;
        }
        let items = ocr::window_items(self.platform, self.ocr, self.title, self.cfg.ocr_region_ratio);
        let matched =
            ocr::find_keyword_items(&items, &self.cfg.exception_keywords, self.cfg.ocr_keyword_min_score);
        if matched.is_empty() {
            return None;
        }
        logger::warn_p("scene", &format!("exception keywords on screen: {}", ocr::matched_texts(&matched)));
        Some((items, matched))
    }

    /// Click the most confident clickable keyword. Returns whether a click happened.
    fn click_best_keyword(&self, items: &[OcrItem]) -> bool {
        let mut clickable =
            ocr::find_keyword_items(items, &self.cfg.clickable_keywords, self.cfg.ocr_keyword_min_score);
        ocr::sort_by_score(&mut clickable);
        let Some(target) = clickable.first() else {
            return false;
        };
        let Some(bbox) = target.bbox else {
            logger::warn_p("scene", &format!("keyword {} has no box, not clicking", target.text));
            return false;
        };
        if let Err(e) = self.platform.input().click(bbox.center()) {
            logger::warn_p("scene", &format!("exception click failed: {}", e));
            return false;
        }
        logger::info_p("scene", &format!("clicked exception keyword {}", target.text));
        self.clock.sleep(ms(self.cfg.exception_click_pause_ms));
        true
    }

    fn mailbox_overlay(&self, matched: &[OcrItem]) -> bool {
        matched.iter().any(|item| {
            let text: String = item.text.split_whitespace().collect();
            self.cfg.mailbox_markers.iter().any(|m| text.contains(m.as_str()))
        })
    }

    /// OCR the window centre; if an exception prompt is showing, try to dismiss it and
    /// report the scene found afterwards.
    pub fn ocr_exception_scan(&self, expected: &str, checkers: &[SceneChecker]) -> Option<String> {
        let (items, matched) = self.exception_items()?;

        if expected == self.cfg.in_game_scene && self.mailbox_overlay(&matched) {
            logger::info_p("scene", &format!("mailbox overlay, treating as {}", expected));
            return Some(expected.to_string());
        }

        let windows = self.platform.windows();
        if let Some(id) = windows.find(self.title) {
            if let Err(e) = windows.activate(id) {
                logger::warn_p("scene", &format!("activate failed: {}", e));
            }
        }

        if self.cfg.keyboard_recovery_enabled {
            for key in &self.cfg.keyboard_recovery_keys {
                if let Err(e) = self.platform.input().press_key(key) {
                    logger::warn_p("scene", &format!("press {} failed: {}", key, e));
                    continue;
                }
                logger::info_p("scene", &format!("exception recovery key: {}", key));
                self.clock.sleep(ms(self.cfg.exception_click_pause_ms));
                if let Some(scene) = template_exception_scan(expected, checkers, 1) {
                    return Some(scene);
                }
            }
        }

        if self.cfg.clickable_keywords.is_empty() || !self.click_best_keyword(&items) {
            return None;
        }
        let scene = template_exception_scan(expected, checkers, 1);
        if let Some(s) = &scene {
            logger::info_p("scene", &format!("exception handled, now on {}", s));
        }
        scene
    }

    /// Dismiss an exception prompt without rescanning scenes. True when one was showing.
    pub fn dismiss_exception_prompt(&self) -> bool {
        let Some((items, _)) = self.exception_items() else {
            return false;
        };
        self.click_best_keyword(&items);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::platform::stub::StubPlatform;
    use crate::sleep::ManualClock;
    use crate::vision::ocr::TextRecognizer;

    const TITLE: &str = "DNF Taiwan";

    struct Fixed(Vec<OcrItem>);

    impl TextRecognizer for Fixed {
        fn recognize(&self, _image: &image::RgbaImage) -> Result<Vec<OcrItem>> {
            Ok(self.0.clone())
        }
    }

    fn item(text: &str, score: f32, bbox: Option<ScreenRect>) -> OcrItem {
        OcrItem { text: text.into(), score: Some(score), bbox }
    }

    fn recording<'c>(names: &[&str], visits: &'c RefCell<Vec<usize>>) -> Vec<SceneChecker<'c>> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                SceneChecker::new(*n, move || {
                    visits.borrow_mut().push(i);
                    Ok(false)
                })
            })
            .collect()
    }

    fn wait(expected: &str, timeout: u64, delay: u64) -> SceneWait<'_> {
        SceneWait {
            expected,
            timeout: Duration::from_secs(timeout),
            exception_delay: Duration::from_secs(delay),
            poll: Duration::from_secs(1),
        }
    }

    #[test]
    fn drift_scan_visits_forward_then_backward() {
        assert_eq!(forward_indices(1, 3), vec![1, 2]);
        assert_eq!(backward_indices(1), vec![1, 0]);

        let visits = RefCell::new(Vec::new());
        let checkers = recording(&["channel", "character", "in_game"], &visits);
        assert_eq!(template_exception_scan("character", &checkers, 2), None);
        assert_eq!(*visits.borrow(), vec![1, 2, 1, 0, 1, 2, 1, 0]);

        visits.borrow_mut().clear();
        template_exception_scan("unknown", &checkers, 1);
        assert_eq!(*visits.borrow(), vec![0, 1, 2, 0]);
    }

    #[test]
    fn failing_predicate_is_no_match() {
        let checkers = vec![
            SceneChecker::new("broken", || Err(anyhow::anyhow!("template missing"))),
            SceneChecker::new("character", || Ok(true)),
        ];
        assert_eq!(detect_scene(&checkers).as_deref(), Some("character"));
        assert_eq!(scan_scenes(&checkers, &[0]), None);
    }

    #[test]
    fn wait_returns_expected_when_scene_matches() {
        let p = StubPlatform::new();
        let clock = ManualClock::new();
        let cfg = SceneConfig::default();
        let det = SceneDetector::new(&p, None, &clock, &cfg, TITLE);
        let polls = Cell::new(0);
        let mut detect = || -> Result<bool> {
            polls.set(polls.get() + 1);
            Ok(polls.get() == 3)
        };
        let r = det.wait_for_scene(wait("channel", 10, 5), &mut detect, &[]).unwrap();
        assert_eq!(r, SceneWaitResult::hit("channel", "channel"));
        assert!(r.is_expected);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1); 2]);
    }

    #[test]
    fn drift_detected_only_after_exception_delay() {
        let p = StubPlatform::new();
        let clock = ManualClock::new();
        let cfg = SceneConfig { ocr_interval_seconds: 0, ..SceneConfig::default() };
        let det = SceneDetector::new(&p, None, &clock, &cfg, TITLE);
        let checkers = vec![
            SceneChecker::new("channel", || Ok(false)),
            SceneChecker::new("character", || Ok(true)),
        ];
        let mut detect = || -> Result<bool> { Ok(false) };
        let r = det.wait_for_scene(wait("channel", 30, 3), &mut detect, &checkers).unwrap();
        assert_eq!(r.scene.as_deref(), Some("character"));
        assert!(!r.is_expected);
        // Elapsed time must exceed the delay, so the scan at exactly 3s is skipped.
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn timeout_yields_no_scene() {
        let p = StubPlatform::new();
        let clock = ManualClock::new();
        let cfg = SceneConfig::default();
        let det = SceneDetector::new(&p, None, &clock, &cfg, TITLE);
        let checkers = vec![SceneChecker::new("channel", || Ok(false))];
        let mut detect = || -> Result<bool> { Ok(false) };
        let r = det.wait_for_scene(wait("channel", 5, 0), &mut detect, &checkers).unwrap();
        assert_eq!(r, SceneWaitResult::timeout());

        let mut failing = || -> Result<bool> { Err(anyhow::anyhow!("roi.json missing")) };
        assert!(det.wait_for_scene(wait("channel", 5, 0), &mut failing, &checkers).is_err());
    }

    #[test]
    fn mailbox_overlay_counts_as_in_game() {
        let p = StubPlatform::new();
        p.add_window(TITLE, ScreenRect::new(0, 0, 1000, 800));
        let clock = ManualClock::new();
        let cfg = SceneConfig::default();
        let engine = OcrEngine::from_recognizer(Box::new(Fixed(vec![item("发送 邮件", 0.9, None)])));
        let det = SceneDetector::new(&p, Some(&engine), &clock, &cfg, TITLE);
        let checkers = vec![SceneChecker::new("in_game", || Ok(false))];
        let mut detect = || -> Result<bool> { Ok(false) };
        let r = det.wait_for_scene(wait("in_game", 30, 0), &mut detect, &checkers).unwrap();
        assert_eq!(r, SceneWaitResult::hit("in_game", "in_game"));
        assert!(p.clicks().is_empty());

        assert_eq!(det.ocr_exception_scan("channel", &checkers), None);
    }

    #[test]
    fn ocr_clicks_most_confident_keyword_then_rescans() {
        let p = StubPlatform::new();
        p.add_window(TITLE, ScreenRect::new(0, 0, 1000, 800));
        let clock = ManualClock::new();
        let cfg = SceneConfig::default();
        let engine = OcrEngine::from_recognizer(Box::new(Fixed(vec![
            item("网络错误", 0.9, Some(ScreenRect::new(0, 0, 100, 20))),
            item("确认", 0.8, Some(ScreenRect::new(100, 100, 40, 20))),
            item("确定", 0.95, Some(ScreenRect::new(300, 300, 40, 20))),
        ])));
        let det = SceneDetector::new(&p, Some(&engine), &clock, &cfg, TITLE);
        let checkers = vec![
            SceneChecker::new("channel", || Ok(false)),
            SceneChecker::new("character", || Ok(!p.clicks().is_empty())),
        ];
        let mut detect = || -> Result<bool> { Ok(false) };
        let r = det.wait_for_scene(wait("channel", 30, 0), &mut detect, &checkers).unwrap();
        assert_eq!(r.scene.as_deref(), Some("character"));
        assert_eq!(p.clicks(), vec![Point::new(520, 470)]);
        assert!(p.keys().is_empty());
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), ms(500)]);
    }

    #[test]
    fn keyboard_recovery_runs_only_when_enabled() {
        let p = StubPlatform::new();
        p.add_window(TITLE, ScreenRect::new(0, 0, 1000, 800));
        let clock = ManualClock::new();
        let cfg = SceneConfig { keyboard_recovery_enabled: true, ..SceneConfig::default() };
        let engine = OcrEngine::from_recognizer(Box::new(Fixed(vec![item("连接失败", 0.9, None)])));
        let det = SceneDetector::new(&p, Some(&engine), &clock, &cfg, TITLE);
        let checkers = vec![
            SceneChecker::new("channel", || Ok(false)),
            SceneChecker::new("character", || Ok(!p.keys().is_empty())),
        ];
        assert_eq!(det.ocr_exception_scan("channel", &checkers).as_deref(), Some("character"));
        assert_eq!(p.keys(), vec!["esc".to_string()]);
    }

    #[test]
    fn dismiss_prompt_reports_presence() {
        let p = StubPlatform::new();
        p.add_window(TITLE, ScreenRect::new(0, 0, 1000, 800));
        let clock = ManualClock::new();
        let cfg = SceneConfig::default();
        let none = OcrEngine::from_recognizer(Box::new(Fixed(vec![item("频道1", 0.9, None)])));
        assert!(!SceneDetector::new(&p, Some(&none), &clock, &cfg, TITLE).dismiss_exception_prompt());
        let prompt = OcrEngine::from_recognizer(Box::new(Fixed(vec![item("提示", 0.9, None)])));
        assert!(SceneDetector::new(&p, Some(&prompt), &clock, &cfg, TITLE).dismiss_exception_prompt());
        assert!(p.clicks().is_empty());
    }

    #[test]
    fn scene_hit_polls_only_targets() {
        let clock = ManualClock::new();
        let polls = Cell::new(0);
        let checkers = vec![
            SceneChecker::new("channel", || Ok(true)),
            SceneChecker::new("character", || {
                polls.set(polls.get() + 1);
                Ok(polls.get() >= 2)
            }),
        ];
        let poll = Duration::from_millis(200);
        assert!(wait_scene_hit(&checkers, &["character"], Duration::from_secs(2), poll, &clock));
        assert_eq!(clock.sleeps(), vec![poll]);
        assert!(!wait_scene_hit(&checkers, &["in_game"], Duration::from_secs(2), poll, &clock));
        assert!(!wait_scene_hit(&checkers, &["channel"], Duration::ZERO, poll, &clock));
    }
}
