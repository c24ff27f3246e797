use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use rand::seq::SliceRandom;
use serde_json::json;

use crate::anchors::{self, AnchorResolver, CHANNEL_DIR, CHARACTER_DIR, IN_GAME_DIR};
use crate::click::{click_ocr_keyword, ClickStrategy, ClickTarget, VerifyAction};
use crate::config::{Account, AppConfig, ErrorPolicy};
use crate::evidence::EvidenceSink;
use crate::logger;
use crate::login::LoginDriver;
use crate::orchestrator::{step_failure, AccountSession, StepFailure, StepRunner};
use crate::platform::Platform;
use crate::scene::{detect_scene, wait_scene_hit, SceneChecker, SceneDetector, SceneWait, SceneWaitResult};
use crate::sleep::{jitter_secs, ms, Clock};
use crate::types::*;
use crate::vision::ocr::OcrEngine;
use crate::vision::Vision;
use crate::window_recovery::WindowRecovery;

pub const CHANNEL: &str = "channel";
pub const CHARACTER: &str = "character";
pub const IN_GAME: &str = "in_game";

const EXPAND_RATIO: f64 = 2.0;

fn secs(v: u64) -> Duration {
    Duration::from_secs(v)
}

fn past_channel(scene: &str) -> bool {
    scene == CHARACTER || scene == IN_GAME
}

struct ChannelHit {
    name: String,
    center: Point,
    score: f32,
    root: PathBuf,
}

/// Channel select → character select → in game, on top of the click, scene and
/// window-recovery engines.
pub struct GameFlow<'a> {
    platform: &'a dyn Platform,
    clock: &'a dyn Clock,
    cfg: &'a AppConfig,
    ocr: Option<&'a OcrEngine>,
    evidence: &'a dyn EvidenceSink,
    vision: Vision<'a>,
    recovery: WindowRecovery<'a>,
    clicker: ClickStrategy<'a>,
    scenes: SceneDetector<'a>,
    channel_anchors: AnchorResolver,
    character_anchors: AnchorResolver,
    in_game_anchors: AnchorResolver,
}

impl<'a> GameFlow<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        clock: &'a dyn Clock,
        cfg: &'a AppConfig,
        ocr: Option<&'a OcrEngine>,
        evidence: &'a dyn EvidenceSink,
    ) -> Self {
        let title = cfg.launcher.game_window_title_keyword.as_str();
        let root = cfg.paths.anchors.as_path();
        Self {
            platform,
            clock,
            cfg,
            ocr,
            evidence,
            vision: Vision::new(platform),
            recovery: WindowRecovery::new(platform.windows(), clock),
            clicker: ClickStrategy::new(platform, clock, &cfg.click, &cfg.recover),
            scenes: SceneDetector::new(platform, ocr, clock, &cfg.scene, title),
            channel_anchors: AnchorResolver::channel(root, cfg.flow.channel_random_range),
            character_anchors: AnchorResolver::character(root),
            in_game_anchors: AnchorResolver::in_game(root),
        }
    }

    fn title(&self) -> &str {
        &self.cfg.launcher.game_window_title_keyword
    }

    fn fail(&self, stage: &str, reason: &str, extra: serde_json::Value) -> anyhow::Error {
        step_failure(self.evidence, self.cfg.flow.error_policy, self.title(), stage, reason, extra).into()
    }

    fn anchor_root(&self, resolver: &AnchorResolver) -> Result<PathBuf> {
        let size = self.platform.windows().rect_of(self.title())?.size();
        resolver.resolve(size)
    }

    fn roi_file(&self, resolver: &AnchorResolver, dir: &str) -> Result<PathBuf> {
        Ok(self.anchor_root(resolver)?.join(dir).join("roi.json"))
    }

    /// Window visibility gate; a window that stays off-screen fails the step.
    pub fn ensure_visible(&self, stage: &str) -> Result<()> {
        let auto = self.cfg.should_auto_recover(self.title());
        match self.recovery.ensure_visible(self.title(), &self.cfg.recover, auto) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(
                stage,
                &e.to_string(),
                json!({ "check": "window_visibility", "recover_enabled": auto, "detail": format!("{:?}", e) }),
            )),
        }
    }

    fn match_scene_once(
        &self,
        resolver: &AnchorResolver,
        dir: &str,
        template: &str,
        roi_name: &str,
        threshold: f32,
        expand: Option<f64>,
    ) -> Result<bool> {
        let root = self.anchor_root(resolver)?.join(dir);
        let (tpl, roi) = (root.join(template), root.join("roi.json"));
        let label = format!("{}/{}", dir, template);
        if self.vision.match_in_roi(&tpl, &roi, roi_name, self.title(), threshold, &label)?.found {
            return Ok(true);
        }
        let Some(ratio) = expand else {
            return Ok(false);
        };
        let region = self.vision.expanded_roi(&roi, roi_name, self.title(), ratio)?;
        Ok(self.vision.match_in_region(&tpl, region, self.title(), threshold, &label)?.found)
    }

    pub fn channel_visible(&self) -> Result<bool> {
        let t = self.cfg.scene.template_threshold;
        self.match_scene_once(&self.channel_anchors, CHANNEL_DIR, "title.png", "title", t, None)
    }

    pub fn character_visible(&self, expand: Option<f64>) -> Result<bool> {
        let t = self.cfg.scene.template_threshold;
        self.match_scene_once(&self.character_anchors, CHARACTER_DIR, "title.png", "title", t, expand)
    }

    /// Both in-game markers must match.
    pub fn in_game_visible(&self) -> Result<bool> {
        let flow = &self.cfg.flow;
        let r = &self.in_game_anchors;
        Ok(self.match_scene_once(r, IN_GAME_DIR, "name_cecilia.png", "name_cecilia", flow.in_game_name_threshold, None)?
            && self.match_scene_once(r, IN_GAME_DIR, "title_duel.png", "title_duel", flow.in_game_title_threshold, None)?)
    }

    /// Checkers in forward scene order.
    pub fn scene_checkers(&self, with_channel: bool) -> Vec<SceneChecker<'_>> {
        let mut checkers = Vec::new();
        if with_channel {
            checkers.push(SceneChecker::new(CHANNEL, move || self.channel_visible()));
        }
        checkers.push(SceneChecker::new(CHARACTER, move || self.character_visible(Some(EXPAND_RATIO))));
        checkers.push(SceneChecker::new(IN_GAME, move || self.in_game_visible()));
        checkers
    }

    pub fn wait_game_window(&self, timeout: Duration) -> Result<()> {
        let windows = self.platform.windows();
        let deadline = self.clock.now() + timeout;
        loop {
            if let Some(id) = windows.find(self.title()) {
                if let Err(e) = windows.activate(id) {
                    logger::warn_p("flow", &format!("activate game window failed: {}", e));
                }
                logger::info_p("flow", "game window ready");
                return self.ensure_visible("wait game window");
            }
            if self.clock.now() >= deadline {
                bail!("game window {} not found within {}s", self.title(), timeout.as_secs());
            }
            self.clock.sleep(secs(1));
        }
    }

    fn wait_gated(
        &self,
        wait: SceneWait,
        detect: &mut dyn FnMut() -> Result<bool>,
        checkers: &[SceneChecker],
    ) -> Result<SceneWaitResult> {
        let stage = format!("wait {}", wait.expected);
        let mut gated = || -> Result<bool> {
            self.ensure_visible(&stage)?;
            detect()
        };
        self.scenes.wait_for_scene(wait, &mut gated, checkers)
    }

    pub fn wait_channel_select(&self, timeout: Duration, checkers: &[SceneChecker]) -> Result<SceneWaitResult> {
        let s = &self.cfg.scene;
        let wait = SceneWait {
            expected: CHANNEL,
            timeout,
            exception_delay: secs(s.template_fallback_delay_seconds.max(s.channel_exception_delay_seconds)),
            poll: s.poll_interval(),
        };
        self.wait_gated(wait, &mut || self.channel_visible(), checkers)
    }

    /// Waits on the title ROI, then once more on the ROI expanded by [`EXPAND_RATIO`].
    pub fn wait_character_select(&self, timeout: Duration, checkers: &[SceneChecker]) -> Result<SceneWaitResult> {
        let wait = SceneWait {
            expected: CHARACTER,
            timeout,
            exception_delay: secs(self.cfg.scene.template_fallback_delay_seconds),
            poll: self.cfg.scene.poll_interval(),
        };
        let first = self.wait_gated(wait, &mut || self.character_visible(None), checkers)?;
        if first.scene.is_some() {
            return Ok(first);
        }
        logger::warn_p("flow", "character select not matched, retrying with expanded ROI");
        self.wait_gated(wait, &mut || self.character_visible(Some(EXPAND_RATIO)), checkers)
    }

    pub fn wait_in_game(&self, timeout: Duration, checkers: &[SceneChecker]) -> Result<SceneWaitResult> {
        let wait = SceneWait {
            expected: IN_GAME,
            timeout,
            exception_delay: secs(self.cfg.scene.template_fallback_delay_seconds),
            poll: self.cfg.scene.poll_interval().min(ms(500)),
        };
        self.wait_gated(wait, &mut || self.in_game_visible(), checkers)
    }

    /// Click a named ROI button with the full click strategy and OCR fallback.
    pub fn click_roi_button(
        &self,
        roi_path: &Path,
        roi_name: &str,
        stage: &str,
        verify: Option<&mut VerifyAction>,
    ) -> Result<()> {
        self.ensure_visible(stage)?;
        let name = format!("roi:{}", roi_name);
        let target = ClickTarget {
            title: self.title(),
            stage,
            name: &name,
            recover_enabled: self.cfg.should_auto_recover(self.title()),
        };
        let mut fallback = || -> Result<bool> {
            click_ocr_keyword(self.platform, self.ocr, self.clock, &self.cfg.scene, self.title(), stage)
        };
        let result = self.clicker.click_roi(&target, roi_path, roi_name, verify, Some(&mut fallback));
        if result.success {
            logger::info_p(
                "flow",
                &format!("clicked {} at {:?} ({})", roi_name, result.success_point, result.final_reason),
            );
            return Ok(());
        }
        Err(self.fail(
            stage,
            &format!("button click failed: {}, {}", roi_name, result.final_reason),
            json!({ "check": "click_strategy", "roi_name": roi_name, "click_attempts": result.attempts_json() }),
        ))
    }

    /// Click a matched point; failures are reported, not raised.
    fn click_point(&self, point: Point, stage: &str, name: &str) -> bool {
        let target = ClickTarget {
            title: self.title(),
            stage,
            name,
            recover_enabled: self.cfg.should_auto_recover(self.title()),
        };
        let mut provider = || -> Result<Point> { Ok(point) };
        let mut fallback = || -> Result<bool> {
            click_ocr_keyword(self.platform, self.ocr, self.clock, &self.cfg.scene, self.title(), stage)
        };
        let result = self.clicker.click(&target, &mut provider, None, Some(&mut fallback));
        if !result.success {
            logger::warn_p(
                "flow",
                &format!("{} click failed: reason={} attempts={}", name, result.final_reason, result.attempts.len()),
            );
        }
        result.success
    }

    /// With the restart policy, press "end game" and close the client; then fail the step.
    fn end_game_and_fail(&self, resolver: &AnchorResolver, dir: &str, stage: &str, reason: &str) -> anyhow::Error {
        if self.cfg.flow.error_policy == ErrorPolicy::Restart {
            let roi = match self.roi_file(resolver, dir) {
                Ok(r) => r,
                Err(e) => return e,
            };
            if let Err(e) = self.click_roi_button(&roi, "button_endgame", "end game button", None) {
                return e;
            }
            if let Err(e) = self.force_exit_game() {
                logger::warn_p("flow", &format!("force exit failed: {:#}", e));
            }
        }
        self.fail(stage, reason, json!({}))
    }

    fn find_channels(&self) -> Result<Vec<ChannelHit>> {
        let flow = &self.cfg.flow;
        let deadline = self.clock.now() + secs(flow.channel_search_timeout_seconds);
        while self.clock.now() < deadline {
            let root = self.anchor_root(&self.channel_anchors)?;
            let roi = root.join(CHANNEL_DIR).join("roi.json");
            let mut hits = Vec::new();
            for i in 1..=flow.channel_random_range {
                let name = format!("channel_{}", i);
                let tpl = anchors::channel_template(&root, i);
                let m = self.vision.match_in_roi(
                    &tpl,
                    &roi,
                    "channel_region",
                    self.title(),
                    self.cfg.scene.template_threshold,
                    &name,
                )?;
                if let (true, Some(center)) = (m.found, m.center) {
                    hits.push(ChannelHit { name, center, score: m.score, root: root.clone() });
                }
            }
            if !hits.is_empty() {
                return Ok(hits);
            }
            self.clock.sleep(ms(500));
        }
        Ok(Vec::new())
    }

    /// Pick a random visible channel and press start; refresh the list when none shows.
    pub fn select_channel_with_refresh(&self, checkers: &[SceneChecker]) -> Result<()> {
        let flow = &self.cfg.flow;
        let limit = flow.channel_refresh_max_retry;
        let mut refresh = 0;
        loop {
            let hits = self.find_channels()?;
            if let Some(hit) = hits.choose(&mut rand::thread_rng()) {
                logger::info_p(
                    "flow",
                    &format!("{} channels visible, picked {} score={:.3}", hits.len(), hit.name, hit.score),
                );
                if self.click_point(hit.center, "channel click", &hit.name) {
                    self.clock.sleep(ms(500));
                    let roi = hit.root.join(CHANNEL_DIR).join("roi.json");
                    let mut verify = |_p: Point, _t: SystemTime| -> Result<bool> {
                        Ok(wait_scene_hit(checkers, &[CHARACTER, IN_GAME], secs(2), ms(200), self.clock))
                    };
                    return self.click_roi_button(&roi, "button_startgame", "channel start button", Some(&mut verify));
                }
                logger::warn_p("flow", &format!("channel {} click failed, refreshing", hit.name));
            }

            if refresh >= limit {
                return Err(self.end_game_and_fail(
                    &self.channel_anchors,
                    CHANNEL_DIR,
                    "channel select",
                    "no selectable channel found",
                ));
            }
            if self.scenes.dismiss_exception_prompt() {
                logger::info_p("flow", "channel exception prompt handled");
            }
            refresh += 1;
            logger::warn_p("flow", &format!("no channel found, refreshing {}/{}", refresh, limit));
            let roi = self.roi_file(&self.channel_anchors, CHANNEL_DIR)?;
            self.click_roi_button(&roi, "button_refresh", "channel refresh button", None)?;
            self.clock.sleep(ms(flow.channel_refresh_delay_ms));
        }
    }

    pub fn enter_channel_to_character(&self, timeout: Duration) -> Result<()> {
        let checkers = self.scene_checkers(true);
        let retries = self.cfg.flow.channel_startgame_retry;
        for attempt in 1..=retries {
            if let Some(scene) = detect_scene(&checkers).filter(|s| past_channel(s)) {
                logger::info_p("flow", &format!("already on {}, skipping channel select", scene));
                return Ok(());
            }
            let waited = self.wait_channel_select(timeout, &checkers)?;
            match waited.scene.as_deref() {
                None => {
                    if let Some(scene) = detect_scene(&checkers).filter(|s| past_channel(s)) {
                        logger::info_p("flow", &format!("already on {}, skipping channel select", scene));
                        return Ok(());
                    }
                    logger::warn_p("flow", &format!("channel select timed out, retry {}/{}", attempt, retries));
                    continue;
                }
                Some(scene) if !waited.is_expected => {
                    logger::info_p("flow", &format!("scene changed to {} while waiting for channel select", scene));
                    if past_channel(scene) {
                        return Ok(());
                    }
                    continue;
                }
                Some(_) => {}
            }

            self.select_channel_with_refresh(&checkers)?;
            let character = self.wait_character_select(timeout, &checkers)?;
            if character.is(CHARACTER) || character.is(IN_GAME) {
                logger::info_p("flow", &format!("reached {}", character.scene.as_deref().unwrap_or(CHARACTER)));
                return Ok(());
            }
            if character.scene.is_none() && self.in_game_visible()? {
                logger::info_p("flow", "already in game, skipping character select");
                return Ok(());
            }
            logger::warn_p("flow", &format!("character select not reached, retry {}/{}", attempt, retries));
        }
        Err(self.end_game_and_fail(
            &self.channel_anchors,
            CHANNEL_DIR,
            "channel select",
            "could not reach character select after retries",
        ))
    }

    fn find_character(&self, timeout: Duration, expand: Option<f64>) -> Result<Option<(Point, f32, PathBuf)>> {
        let deadline = self.clock.now() + timeout;
        while self.clock.now() < deadline {
            let root = self.anchor_root(&self.character_anchors)?;
            let dir = root.join(CHARACTER_DIR);
            let (tpl, roi) = (dir.join("character_1.png"), dir.join("roi.json"));
            let threshold = self.cfg.scene.template_threshold;
            let m = match expand {
                None => self.vision.match_in_roi(&tpl, &roi, "character_region", self.title(), threshold, "character_1")?,
                Some(ratio) => {
                    let region = self.vision.expanded_roi(&roi, "character_region", self.title(), ratio)?;
                    self.vision.match_in_region(&tpl, region, self.title(), threshold, "character_1")?
                }
            };
            if let (true, Some(center)) = (m.found, m.center) {
                return Ok(Some((center, m.score, root)));
            }
            self.clock.sleep(ms(500));
        }
        Ok(None)
    }

    /// Click the first character slot, then the start button. False when the slot is not found
    /// or cannot be clicked.
    pub fn select_character_and_start(&self, timeout: Duration) -> Result<bool> {
        let found = match self.find_character(timeout, None)? {
            Some(hit) => Some(hit),
            None => {
                logger::warn_p("flow", "character slot not matched, retrying with expanded ROI");
                self.find_character(timeout, Some(EXPAND_RATIO))?
            }
        };
        let Some((center, score, root)) = found else {
            return Ok(false);
        };
        if !self.click_point(center, "character click", "character_1") {
            return Ok(false);
        }
        logger::info_p("flow", &format!("selected character_1 score={:.3} at {}", score, center));
        self.clock.sleep(secs(1));
        let roi = root.join(CHARACTER_DIR).join("roi.json");
        self.click_roi_button(&roi, "button_startgame", "character start button", None)?;
        Ok(true)
    }

    pub fn enter_character_to_in_game(&self, timeout: Duration, in_game_timeout: Duration) -> Result<()> {
        let checkers = self.scene_checkers(false);
        let retries = self.cfg.flow.channel_startgame_retry;
        for attempt in 1..=retries {
            if self.in_game_visible()? {
                logger::info_p("flow", "already in game, skipping character select");
                return Ok(());
            }
            let character = self.wait_character_select(timeout, &checkers)?;
            if character.scene.is_none() {
                logger::warn_p("flow", &format!("character select timed out, retry {}/{}", attempt, retries));
                if self.in_game_visible()? {
                    return Ok(());
                }
                continue;
            }
            if character.is(IN_GAME) {
                return Ok(());
            }
            if !self.select_character_and_start(timeout)? {
                logger::warn_p("flow", &format!("character slot not found, retry {}/{}", attempt, retries));
                if self.in_game_visible()? {
                    return Ok(());
                }
                continue;
            }
            let game = self.wait_in_game(in_game_timeout, &checkers)?;
            if game.is(IN_GAME) {
                return Ok(());
            }
            if let Some(scene) = &game.scene {
                logger::info_p("flow", &format!("scene changed to {} while entering the game", scene));
            }
            logger::warn_p("flow", &format!("game not entered, retry {}/{}", attempt, retries));
        }
        Err(self.end_game_and_fail(
            &self.character_anchors,
            CHARACTER_DIR,
            "enter game",
            "could not enter the game after retries",
        ))
    }

    /// Stay in game for the configured time with jitter.
    pub fn dwell_in_game(&self) {
        let flow = &self.cfg.flow;
        let wait = jitter_secs(flow.enter_game_wait_seconds, flow.enter_game_wait_seconds_random_range);
        logger::info_p(
            "flow",
            &format!(
                "in game, leaving in {}s (base={} range=±{})",
                wait.as_secs(),
                flow.enter_game_wait_seconds,
                flow.enter_game_wait_seconds_random_range
            ),
        );
        self.clock.sleep(wait);
    }

    /// Close the game window, then kill the process if it lingers.
    pub fn force_exit_game(&self) -> Result<()> {
        let process = &self.cfg.launcher.game_process_name;
        let procs = self.platform.processes();
        let windows = self.platform.windows();
        let exit_timeout = secs(10).min(self.cfg.flow.step_timeout());
        if let Some(id) = windows.find(self.title()) {
            match windows.close(id) {
                Ok(()) => {
                    if procs.wait_exit(process, exit_timeout, self.clock) {
                        logger::info_p("flow", "game exited");
                        return Ok(());
                    }
                }
                Err(e) => logger::warn_p("flow", &format!("closing game window failed: {}", e)),
            }
        }
        if !self.cfg.flow.force_kill_on_exit_fail {
            logger::warn_p("flow", &format!("force kill disabled, {} still running", process));
            return Ok(());
        }
        let killed = procs.kill(process);
        logger::info_p("flow", &format!("killed {} {} process(es)", killed, process));
        if !procs.wait_exit(process, secs(5), self.clock) {
            bail!("{} still running after kill", process);
        }
        Ok(())
    }
}

/// Login followed by the game flow, one step per phase.
pub struct GameSession<'a> {
    flow: GameFlow<'a>,
    login: &'a dyn LoginDriver,
}

impl<'a> GameSession<'a> {
    pub fn new(flow: GameFlow<'a>, login: &'a dyn LoginDriver) -> Self {
        Self { flow, login }
    }
}

impl AccountSession for GameSession<'_> {
    fn run(&mut self, account: &Account, steps: &StepRunner) -> Result<(), StepFailure> {
        let flow = &self.flow;
        steps.run("launch", |p| self.login.login(account, p.timeout))?;
        steps.run("wait_game_window", |p| flow.wait_game_window(p.timeout))?;

        let scene = steps.run("wait_channel_select", |p| {
            let checkers = flow.scene_checkers(true);
            match flow.wait_channel_select(p.timeout, &checkers)?.scene {
                Some(scene) => Ok(scene),
                None => detect_scene(&checkers).ok_or_else(|| anyhow::anyhow!("no known scene after {}s", p.timeout.as_secs())),
            }
        })?;
        if scene == CHANNEL {
            steps.run("click_channel", |p| flow.enter_channel_to_character(p.timeout))?;
        }

        let scene = steps.run("wait_role_select", |p| {
            let checkers = flow.scene_checkers(false);
            match flow.wait_character_select(p.timeout, &checkers)?.scene {
                Some(scene) => Ok(scene),
                None if flow.in_game_visible()? => Ok(IN_GAME.to_string()),
                None => bail!("character select not reached after {}s", p.timeout.as_secs()),
            }
        })?;
        if scene == CHARACTER {
            let in_game_timeout = steps.policy("wait_in_game").timeout;
            steps.run("click_role", |p| flow.enter_character_to_in_game(p.timeout, in_game_timeout))?;
        }

        steps.run("wait_in_game", |p| {
            if !flow.in_game_visible()? && !flow.wait_in_game(p.timeout, &flow.scene_checkers(false))?.is(IN_GAME) {
                bail!("in-game markers not found after {}s", p.timeout.as_secs());
            }
            Ok(())
        })?;
        flow.dwell_in_game();
        steps.run("exit_game", |_| flow.force_exit_game())?;
        logger::info_p("flow", &format!("account finished: {}", account.username));
        Ok(())
    }

    fn force_exit(&mut self) {
        if let Err(e) = self.flow.force_exit_game() {
            logger::warn_p("flow", &format!("cleanup after failure: {:#}", e));
        }
    }
}
