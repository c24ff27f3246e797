pub mod process;
pub mod stub;

#[cfg(target_os = "windows")]
pub mod win32;

use std::time::Duration;

use anyhow::Result;

use crate::types::*;

/// Window lookup and geometry.
pub trait WindowLocator {
    /// Resolve a window whose title contains `title`, preferring the foreground window.
    fn find(&self, title: &str) -> Option<WindowId>;
    fn rect(&self, id: WindowId) -> Result<ScreenRect>;
    /// Restore and bring to the foreground.
    fn activate(&self, id: WindowId) -> Result<()>;
    fn foreground_title(&self) -> Option<String>;
    /// Work area of the monitor nearest the window, if per-monitor info is available.
    fn work_area(&self, id: WindowId) -> Option<ScreenRect>;
    fn virtual_screen(&self) -> ScreenRect;
    fn set_rect(&self, id: WindowId, rect: ScreenRect) -> Result<()>;
    /// Ask the window to close (WM_CLOSE).
    fn close(&self, id: WindowId) -> Result<()>;

    /// Rect of the first window matching `title`.
    fn rect_of(&self, title: &str) -> Result<ScreenRect> {
        let id = self
            .find(title)
            .ok_or_else(|| anyhow::anyhow!("window not found: {}", title))?;
        self.rect(id)
    }

    fn is_foreground(&self, title: &str) -> bool {
        self.foreground_title().is_some_and(|t| t.contains(title))
    }
}

/// Pixel capture of an absolute screen rectangle.
pub trait ScreenCapture {
    fn capture(&self, rect: ScreenRect) -> Result<Capture>;
}

/// OS-level input injection at absolute coordinates.
pub trait InputInjector {
    fn click(&self, point: Point) -> Result<()>;
    fn press_key(&self, key: &str) -> Result<()>;
}

/// Process inspection and termination by executable name.
pub trait ProcessControl {
    fn is_running(&self, name: &str) -> bool;
    /// Kill every matching process, returning how many were killed.
    fn kill(&self, name: &str) -> usize;

    fn wait_exit(&self, name: &str, timeout: Duration, clock: &dyn crate::sleep::Clock) -> bool {
        let deadline = clock.now() + timeout;
        while clock.now() < deadline {
            if !self.is_running(name) {
                return true;
            }
            clock.sleep(Duration::from_secs(1));
        }
        !self.is_running(name)
    }
}

/// Every OS collaborator behind one handle.
pub trait Platform {
    fn windows(&self) -> &dyn WindowLocator;
    fn screen(&self) -> &dyn ScreenCapture;
    fn input(&self) -> &dyn InputInjector;
    fn processes(&self) -> &dyn ProcessControl;
}

impl<T: WindowLocator + ScreenCapture + InputInjector + ProcessControl> Platform for T {
    fn windows(&self) -> &dyn WindowLocator {
        self
    }

    fn screen(&self) -> &dyn ScreenCapture {
        self
    }

    fn input(&self) -> &dyn InputInjector {
        self
    }

    fn processes(&self) -> &dyn ProcessControl {
        self
    }
}

/// Create the platform appropriate for the current OS.
pub fn create_platform(force_stub: bool) -> Box<dyn Platform> {
    if force_stub {
        return Box::new(stub::StubPlatform::new());
    }
    #[cfg(target_os = "windows")]
    {
        return Box::new(win32::Win32Platform::new());
    }
    #[cfg(not(target_os = "windows"))]
    {
        crate::logger::warn("no native platform for this OS, using stub");
        Box::new(stub::StubPlatform::new())
    }
}
