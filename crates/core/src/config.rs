use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_EXCEPTION_KEYWORDS: &[&str] =
    &["信息失败", "失败", "错误", "重试", "提示", "邮件", "邮箱", "公告"];
pub const DEFAULT_CLICKABLE_KEYWORDS: &[&str] = &["确认", "确定", "OK", "好的", "是", "继续"];
pub const DEFAULT_MAILBOX_MARKERS: &[&str] = &["发送邮件", "邮件保管箱"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Click execution strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickConfig {
    /// When false every click resolves once, clicks once and verifies once.
    pub strategy_enabled: bool,
    pub max_attempts: u32,
    /// Offsets applied to the base point, first to last priority.
    pub candidates: Vec<(i32, i32)>,
    /// Sleep after failed round N is `backoff_ms[N-1]`, last value reused.
    pub backoff_ms: Vec<u64>,
    pub post_check_delay_ms: u64,
    pub verify_foreground: bool,
    pub foreground_wait_ms: u64,
    pub guard_padding_px: i32,
    pub ocr_fallback_enabled: bool,
    /// Re-run `verify` after a successful OCR fallback.
    pub fallback_reverify: bool,
}

impl Default for ClickConfig {
    fn default() -> Self {
        Self {
            strategy_enabled: true,
            max_attempts: 3,
            candidates: vec![(0, 0)],
            backoff_ms: vec![100, 250, 500],
            post_check_delay_ms: 0,
            verify_foreground: true,
            foreground_wait_ms: 0,
            guard_padding_px: 0,
            ocr_fallback_enabled: true,
            fallback_reverify: false,
        }
    }
}

impl ClickConfig {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn offsets(&self) -> Vec<(i32, i32)> {
        if self.candidates.is_empty() {
            vec![(0, 0)]
        } else {
            self.candidates.clone()
        }
    }

    /// Backoff before round `round + 1` (1-based `round`); `None` after the final round.
    pub fn backoff_after(&self, round: u32) -> Option<Duration> {
        if round >= self.attempts() {
            return None;
        }
        let ms = match self.backoff_ms.as_slice() {
            [] => 0,
            list => list[(round as usize - 1).min(list.len() - 1)],
        };
        Some(Duration::from_millis(ms))
    }

    pub fn guard(&self) -> i32 {
        self.guard_padding_px.max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Game,
    Launcher,
    Browser,
}

/// Window visibility gate and off-screen recovery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverConfig {
    pub visibility_check_enabled: bool,
    pub visible_ratio_min: f64,
    pub auto_recover_enabled: bool,
    pub targets: Vec<WindowKind>,
    pub max_attempts: u32,
    pub cooldown_ms: u64,
    pub padding_px: i32,
    pub allow_resize: bool,
}

impl Default for RecoverConfig {
    fn default() -> Self {
        Self {
            visibility_check_enabled: true,
            visible_ratio_min: 0.85,
            auto_recover_enabled: false,
            targets: vec![WindowKind::Game],
            max_attempts: 1,
            cooldown_ms: 0,
            padding_px: 0,
            allow_resize: false,
        }
    }
}

impl RecoverConfig {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn padding(&self) -> i32 {
        self.padding_px.max(0)
    }
}

/// Scene detection and exception recovery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub template_threshold: f32,
    pub poll_interval_ms: u64,
    pub template_exception_rounds: u32,
    pub template_fallback_delay_seconds: u64,
    pub channel_exception_delay_seconds: u64,
    /// Zero disables the OCR exception scan.
    pub ocr_interval_seconds: u64,
    pub ocr_region_ratio: f64,
    pub exception_keywords: Vec<String>,
    pub clickable_keywords: Vec<String>,
    pub ocr_keyword_min_score: f32,
    /// OCR text that means "mailbox overlay", not an error, while waiting for in-game.
    pub mailbox_markers: Vec<String>,
    /// Name of the terminal scene the mailbox rule applies to.
    pub in_game_scene: String,
    pub exception_click_pause_ms: u64,
    pub keyboard_recovery_enabled: bool,
    pub keyboard_recovery_keys: Vec<String>,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            template_threshold: 0.86,
            poll_interval_ms: 1000,
            template_exception_rounds: 2,
            template_fallback_delay_seconds: 10,
            channel_exception_delay_seconds: 20,
            ocr_interval_seconds: 10,
            ocr_region_ratio: 0.6,
            exception_keywords: strings(DEFAULT_EXCEPTION_KEYWORDS),
            clickable_keywords: strings(DEFAULT_CLICKABLE_KEYWORDS),
            ocr_keyword_min_score: 0.5,
            mailbox_markers: strings(DEFAULT_MAILBOX_MARKERS),
            in_game_scene: "in_game".into(),
            exception_click_pause_ms: 500,
            keyboard_recovery_enabled: false,
            keyboard_recovery_keys: vec!["esc".into(), "enter".into()],
        }
    }
}

impl SceneConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Force-exit the game and let the account loop retry.
    Restart,
    /// Halt the whole run and wait for an operator.
    Manual,
}

/// Orchestration parameters for the login → channel → character → in-game flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub step_timeout_seconds: u64,
    pub click_retry: u32,
    pub error_policy: ErrorPolicy,
    pub account_max_retry: u32,
    pub wait_next_account_seconds: u64,
    pub enter_game_wait_seconds: u64,
    pub enter_game_wait_seconds_random_range: u64,
    pub channel_random_range: u32,
    pub channel_search_timeout_seconds: u64,
    pub channel_refresh_max_retry: u32,
    pub channel_refresh_delay_ms: u64,
    pub channel_startgame_retry: u32,
    pub in_game_match_timeout_seconds: u64,
    pub in_game_name_threshold: f32,
    pub in_game_title_threshold: f32,
    pub force_kill_on_exit_fail: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: 120,
            click_retry: 3,
            error_policy: ErrorPolicy::Restart,
            account_max_retry: 2,
            wait_next_account_seconds: 10,
            enter_game_wait_seconds: 60,
            enter_game_wait_seconds_random_range: 15,
            channel_random_range: 3,
            channel_search_timeout_seconds: 5,
            channel_refresh_max_retry: 3,
            channel_refresh_delay_ms: 5000,
            channel_startgame_retry: 3,
            in_game_match_timeout_seconds: 7,
            in_game_name_threshold: 0.6,
            in_game_title_threshold: 0.86,
            force_kill_on_exit_fail: true,
        }
    }
}

impl FlowConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub exe_path: Option<PathBuf>,
    pub launcher_process_name: Option<String>,
    pub launcher_window_title_keyword: String,
    pub game_process_name: String,
    pub game_window_title_keyword: String,
    pub browser_window_title_keyword: Option<String>,
    pub login_timeout_seconds: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            exe_path: None,
            launcher_process_name: None,
            launcher_window_title_keyword: "启动器".into(),
            game_process_name: "DNF.exe".into(),
            game_window_title_keyword: "DNF Taiwan".into(),
            browser_window_title_keyword: None,
            login_timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    pub pool: Vec<Account>,
}

impl AccountsConfig {
    pub fn enabled(&self) -> Vec<Account> {
        self.pool.iter().filter(|a| a.enabled).cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub dir: PathBuf,
    pub retention_days: u32,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("evidence"), retention_days: 7 }
    }
}

/// Filesystem locations, relative to the base directory unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub anchors: PathBuf,
    pub checkpoint: PathBuf,
    pub stop_flag: PathBuf,
    pub run_lock: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            anchors: PathBuf::from("anchors"),
            checkpoint: PathBuf::from("logs/state.json"),
            stop_flag: PathBuf::from("stop.flag"),
            run_lock: PathBuf::from("logs/run.lock"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub launcher: LauncherConfig,
    pub accounts: AccountsConfig,
    pub click: ClickConfig,
    pub recover: RecoverConfig,
    pub scene: SceneConfig,
    pub flow: FlowConfig,
    pub evidence: EvidenceConfig,
    pub paths: PathsConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let mut config: AppConfig = serde_json::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Trim keyword lists and drop blank entries.
    pub fn normalize(&mut self) {
        for list in [
            &mut self.scene.exception_keywords,
            &mut self.scene.clickable_keywords,
            &mut self.scene.mailbox_markers,
        ] {
            *list = list
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let f = &self.flow;
        if f.step_timeout_seconds == 0
            || f.click_retry == 0
            || f.account_max_retry == 0
            || f.channel_random_range == 0
            || f.channel_search_timeout_seconds == 0
            || f.channel_startgame_retry == 0
            || f.in_game_match_timeout_seconds == 0
        {
            return invalid("flow timeouts and retry counts must be greater than 0");
        }
        let s = &self.scene;
        if s.template_exception_rounds == 0 {
            return invalid("scene.template_exception_rounds must be greater than 0");
        }
        if !(s.ocr_region_ratio > 0.0 && s.ocr_region_ratio <= 1.0) {
            return invalid("scene.ocr_region_ratio must be in (0, 1]");
        }
        for t in [s.template_threshold, f.in_game_name_threshold, f.in_game_title_threshold] {
            if !(t > 0.0 && t <= 1.0) {
                return invalid("template thresholds must be in (0, 1]");
            }
        }
        if !(0.0..=1.0).contains(&s.ocr_keyword_min_score) {
            return invalid("scene.ocr_keyword_min_score must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.recover.visible_ratio_min) {
            return invalid("recover.visible_ratio_min must be in [0, 1]");
        }
        if self.evidence.retention_days == 0 {
            return invalid("evidence.retention_days must be greater than 0");
        }
        if self.accounts.enabled().is_empty() {
            return invalid("accounts.pool has no enabled account");
        }
        Ok(())
    }

    /// Resolve every relative path against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.evidence.dir);
        resolve(&mut self.paths.anchors);
        resolve(&mut self.paths.checkpoint);
        resolve(&mut self.paths.stop_flag);
        resolve(&mut self.paths.run_lock);
        if let Some(exe) = self.launcher.exe_path.as_mut() {
            resolve(exe);
        }
    }

    pub fn window_kind(&self, title: &str) -> Option<WindowKind> {
        let l = &self.launcher;
        if title == l.game_window_title_keyword {
            return Some(WindowKind::Game);
        }
        if title == l.launcher_window_title_keyword {
            return Some(WindowKind::Launcher);
        }
        if l.browser_window_title_keyword.as_deref() == Some(title) {
            return Some(WindowKind::Browser);
        }
        None
    }

    /// Auto-recovery only applies to known window kinds listed in `recover.targets`.
    pub fn should_auto_recover(&self, title: &str) -> bool {
        if !self.recover.auto_recover_enabled {
            return false;
        }
        self.window_kind(title)
            .is_some_and(|kind| self.recover.targets.contains(&kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_account() -> AppConfig {
        let mut c = AppConfig::default();
        c.accounts.pool.push(Account {
            username: "alice".into(),
            password: "pw".into(),
            enabled: true,
        });
        c
    }

    #[test]
    fn partial_json_fills_named_defaults() {
        let json = r#"{
            "accounts": {"pool": [{"username": "a"}]},
            "click": {"max_attempts": 5}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.click.max_attempts, 5);
        assert_eq!(config.click.backoff_ms, vec![100, 250, 500]);
        assert_eq!(config.flow.error_policy, ErrorPolicy::Restart);
        assert!(config.accounts.pool[0].enabled);
        assert!(!config.scene.keyboard_recovery_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backoff_reuses_last_value_and_skips_final_round() {
        let click = ClickConfig {
            max_attempts: 5,
            backoff_ms: vec![100, 200],
            ..ClickConfig::default()
        };
        let got: Vec<_> = (1..=5).map(|r| click.backoff_after(r)).collect();
        assert_eq!(
            got,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(200)),
                None,
            ]
        );
    }

    #[test]
    fn empty_candidates_fall_back_to_center() {
        let click = ClickConfig { candidates: vec![], ..ClickConfig::default() };
        assert_eq!(click.offsets(), vec![(0, 0)]);
    }

    #[test]
    fn validate_rejects_bad_ratio_and_empty_pool() {
        let mut c = with_account();
        c.scene.ocr_region_ratio = 1.5;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let c = AppConfig::default();
        assert!(c.validate().is_err());
    }

    #[test]
    fn normalize_drops_blank_keywords() {
        let mut c = with_account();
        c.scene.clickable_keywords = vec![" 确认 ".into(), "  ".into()];
        c.normalize();
        assert_eq!(c.scene.clickable_keywords, vec!["确认".to_string()]);
    }

    #[test]
    fn auto_recover_requires_known_target_kind() {
        let mut c = with_account();
        assert!(!c.should_auto_recover("DNF Taiwan"));
        c.recover.auto_recover_enabled = true;
        assert!(c.should_auto_recover("DNF Taiwan"));
        assert!(!c.should_auto_recover(&c.launcher.launcher_window_title_keyword.clone()));
        assert!(!c.should_auto_recover("Notepad"));
    }

    #[test]
    fn resolve_paths_keeps_absolute() {
        let mut c = with_account();
        let abs = std::env::temp_dir().join("ev");
        c.evidence.dir = abs.clone();
        c.resolve_paths(Path::new("/base"));
        assert_eq!(c.evidence.dir, abs);
        assert_eq!(c.paths.checkpoint, Path::new("/base").join("logs/state.json"));
    }
}
