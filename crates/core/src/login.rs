use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::{Account, LauncherConfig};
use crate::logger;
use crate::platform::Platform;
use crate::sleep::Clock;

/// Everything between "nothing running" and "game window exists" for one account.
pub trait LoginDriver {
    fn login(&self, account: &Account, timeout: Duration) -> Result<()>;
}

/// Starts the launcher if configured and waits for the game window; the operator
/// (or an external tool) completes the login itself.
pub struct WindowWaitLogin<'a> {
    platform: &'a dyn Platform,
    clock: &'a dyn Clock,
    launcher: &'a LauncherConfig,
}

impl<'a> WindowWaitLogin<'a> {
    pub fn new(platform: &'a dyn Platform, clock: &'a dyn Clock, launcher: &'a LauncherConfig) -> Self {
        Self { platform, clock, launcher }
    }

    fn start_launcher(&self) -> Result<()> {
        let Some(exe) = self.launcher.exe_path.as_deref() else {
            return Ok(());
        };
        let procs = self.platform.processes();
        if let Some(name) = self.launcher.launcher_process_name.as_deref() {
            if procs.is_running(name) {
                logger::info_p("login", &format!("launcher already running: {}", name));
                return Ok(());
            }
        }
        let mut cmd = Command::new(exe);
        if let Some(dir) = exe.parent() {
            cmd.current_dir(dir);
        }
        cmd.spawn().with_context(|| format!("starting {}", exe.display()))?;
        logger::info_p("login", &format!("started {}", exe.display()));
        Ok(())
    }
}

impl LoginDriver for WindowWaitLogin<'_> {
    fn login(&self, account: &Account, timeout: Duration) -> Result<()> {
        let title = &self.launcher.game_window_title_keyword;
        if self.platform.windows().find(title).is_some() {
            logger::info_p("login", "game window already open");
            return Ok(());
        }
        self.start_launcher()?;
        logger::info_p("login", &format!("waiting up to {}s for {} ({})", timeout.as_secs(), title, account.username));
        let deadline = self.clock.now() + timeout;
        while self.clock.now() < deadline {
            if self.platform.windows().find(title).is_some() {
                return Ok(());
            }
            self.clock.sleep(Duration::from_secs(1));
        }
        bail!("game window {} did not appear within {}s", title, timeout.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::stub::StubPlatform;
    use crate::sleep::ManualClock;
    use crate::types::ScreenRect;

    fn account() -> Account {
        Account { username: "alice".into(), password: String::new(), enabled: true }
    }

    #[test]
    fn open_window_needs_no_wait() {
        let p = StubPlatform::new();
        p.add_window("DNF Taiwan", ScreenRect::new(0, 0, 800, 600));
        let clock = ManualClock::new();
        let cfg = LauncherConfig::default();
        WindowWaitLogin::new(&p, &clock, &cfg).login(&account(), Duration::from_secs(5)).unwrap();
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn missing_window_times_out() {
        let p = StubPlatform::new();
        let clock = ManualClock::new();
        let cfg = LauncherConfig::default();
        let err = WindowWaitLogin::new(&p, &clock, &cfg)
            .login(&account(), Duration::from_secs(3))
            .unwrap_err();
        assert!(err.to_string().contains("did not appear within 3s"));
        assert_eq!(clock.sleeps().len(), 3);
    }
}
