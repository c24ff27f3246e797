use std::cell::RefCell;

use anyhow::{anyhow, Result};

use crate::logger;
use crate::types::*;
use super::process::process_name_matches;
use super::{InputInjector, ProcessControl, ScreenCapture, WindowLocator};

struct StubWindow {
    id: WindowId,
    title: String,
    rect: ScreenRect,
}

#[derive(Default)]
struct StubState {
    windows: Vec<StubWindow>,
    foreground: Option<WindowId>,
    clicks: Vec<Point>,
    keys: Vec<String>,
    processes: Vec<String>,
    click_failures: u32,
    next_id: WindowId,
}

/// In-memory desktop: windows keep their geometry, input is recorded, nothing touches the OS.
pub struct StubPlatform {
    screen: ScreenRect,
    work_area: Option<ScreenRect>,
    state: RefCell<StubState>,
    /// `(clicks, frame)`: the frame shown once at least `clicks` clicks have landed.
    frames: RefCell<Vec<(usize, Capture)>>,
}

impl StubPlatform {
    pub fn new() -> Self {
        Self::with_screen(ScreenRect::new(0, 0, 1920, 1080), None)
    }

    pub fn with_screen(screen: ScreenRect, work_area: Option<ScreenRect>) -> Self {
        Self {
            screen,
            work_area,
            state: RefCell::new(StubState { next_id: 10001, ..StubState::default() }),
            frames: RefCell::new(Vec::new()),
        }
    }

    pub fn add_window(&self, title: &str, rect: ScreenRect) -> WindowId {
        let mut s = self.state.borrow_mut();
        let id = s.next_id;
        s.next_id += 1;
        s.windows.push(StubWindow { id, title: title.to_string(), rect });
        id
    }

    pub fn add_process(&self, name: &str) {
        self.state.borrow_mut().processes.push(name.to_string());
    }

    /// Make the next `n` clicks fail.
    pub fn fail_clicks(&self, n: u32) {
        self.state.borrow_mut().click_failures = n;
    }

    pub fn clicks(&self) -> Vec<Point> {
        self.state.borrow().clicks.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.borrow().keys.clone()
    }

    /// Desktop pixels returned by `capture`, anchored at the virtual screen origin.
    pub fn set_frame(&self, frame: Capture) {
        *self.frames.borrow_mut() = vec![(0, frame)];
    }

    /// Show `frame` once `clicks` clicks have landed, so scripted screens can react to input.
    pub fn set_frame_after_clicks(&self, clicks: usize, frame: Capture) {
        let mut frames = self.frames.borrow_mut();
        frames.push((clicks, frame));
        frames.sort_by_key(|(n, _)| *n);
    }

    pub fn window_rect(&self, id: WindowId) -> Option<ScreenRect> {
        self.state.borrow().windows.iter().find(|w| w.id == id).map(|w| w.rect)
    }
}

/// Deterministic grayscale noise. Different seeds give uncorrelated images, so crops of
/// one make templates that never match another.
pub fn noise_frame(width: u32, height: u32, seed: u32) -> Capture {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let mut h = x.wrapping_mul(0x9E37_79B1) ^ y.wrapping_mul(0x85EB_CA77) ^ seed.wrapping_mul(0xC2B2_AE3D);
            h ^= h >> 15;
            h = h.wrapping_mul(0x2C1B_3C6D);
            h ^= h >> 12;
            let v = (h & 0xff) as u8;
            data.extend_from_slice(&[v, v, v, 255]);
        }
    }
    Capture { data, width, height, bytes_per_row: width * 4 }
}

impl Default for StubPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowLocator for StubPlatform {
    fn find(&self, title: &str) -> Option<WindowId> {
        let s = self.state.borrow();
        if let Some(fg) = s.foreground {
            if s.windows.iter().any(|w| w.id == fg && w.title.contains(title)) {
                return Some(fg);
            }
        }
        s.windows.iter().find(|w| w.title.contains(title)).map(|w| w.id)
    }

    fn rect(&self, id: WindowId) -> Result<ScreenRect> {
        self.window_rect(id).ok_or_else(|| anyhow!("stub window {} gone", id))
    }

    fn activate(&self, id: WindowId) -> Result<()> {
        logger::debug_p("stub", &format!("activate({})", id));
        let mut s = self.state.borrow_mut();
        if !s.windows.iter().any(|w| w.id == id) {
            return Err(anyhow!("stub window {} gone", id));
        }
        s.foreground = Some(id);
        Ok(())
    }

    fn foreground_title(&self) -> Option<String> {
        let s = self.state.borrow();
        let fg = s.foreground?;
        s.windows.iter().find(|w| w.id == fg).map(|w| w.title.clone())
    }

    fn work_area(&self, _id: WindowId) -> Option<ScreenRect> {
        self.work_area
    }

    fn virtual_screen(&self) -> ScreenRect {
        self.screen
    }

    fn set_rect(&self, id: WindowId, rect: ScreenRect) -> Result<()> {
        logger::info_p("stub", &format!("set_rect({}, {})", id, rect));
        let mut s = self.state.borrow_mut();
        let win = s
            .windows
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| anyhow!("stub window {} gone", id))?;
        win.rect = rect;
        Ok(())
    }

    fn close(&self, id: WindowId) -> Result<()> {
        logger::info_p("stub", &format!("close({})", id));
        let mut s = self.state.borrow_mut();
        s.windows.retain(|w| w.id != id);
        if s.foreground == Some(id) {
            s.foreground = None;
        }
        Ok(())
    }
}

impl ScreenCapture for StubPlatform {
    fn capture(&self, rect: ScreenRect) -> Result<Capture> {
        logger::debug_p("stub", &format!("capture({})", rect));
        let clicks = self.state.borrow().clicks.len();
        let frames = self.frames.borrow();
        match frames.iter().rev().find(|(n, _)| *n <= clicks) {
            Some((_, frame)) => Ok(frame.crop(rect.translate(-self.screen.left, -self.screen.top))),
            None => Ok(Capture::filled(rect.width as u32, rect.height as u32, [32, 32, 32, 255])),
        }
    }
}

impl InputInjector for StubPlatform {
    fn click(&self, point: Point) -> Result<()> {
        logger::info_p("stub", &format!("click{}", point));
        let mut s = self.state.borrow_mut();
        if s.click_failures > 0 {
            s.click_failures -= 1;
            return Err(anyhow!("injected click failure"));
        }
        s.clicks.push(point);
        Ok(())
    }

    fn press_key(&self, key: &str) -> Result<()> {
        logger::info_p("stub", &format!("press_key(\"{}\")", key));
        self.state.borrow_mut().keys.push(key.to_string());
        Ok(())
    }
}

impl ProcessControl for StubPlatform {
    fn is_running(&self, name: &str) -> bool {
        self.state.borrow().processes.iter().any(|p| process_name_matches(name, p))
    }

    fn kill(&self, name: &str) -> usize {
        let mut s = self.state.borrow_mut();
        let before = s.processes.len();
        s.processes.retain(|p| !process_name_matches(name, p));
        before - s.processes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_prefers_foreground_match() {
        let p = StubPlatform::new();
        let a = p.add_window("DNF Taiwan #1", ScreenRect::new(0, 0, 100, 100));
        let b = p.add_window("DNF Taiwan #2", ScreenRect::new(0, 0, 100, 100));
        assert_eq!(p.find("DNF Taiwan"), Some(a));
        p.activate(b).unwrap();
        assert_eq!(p.find("DNF Taiwan"), Some(b));
        assert!(p.is_foreground("DNF"));
    }

    #[test]
    fn capture_crops_the_frame() {
        let p = StubPlatform::new();
        assert_eq!(p.capture(ScreenRect::new(5, 5, 4, 3)).unwrap().width, 4);
        p.set_frame(Capture::filled(100, 100, [0, 0, 0, 255]));
        let c = p.capture(ScreenRect::new(90, 90, 20, 20)).unwrap();
        assert_eq!((c.width, c.height), (10, 10));
    }

    #[test]
    fn staged_frames_follow_click_count() {
        let p = StubPlatform::new();
        p.set_frame(Capture::filled(10, 10, [1, 1, 1, 255]));
        p.set_frame_after_clicks(1, Capture::filled(10, 10, [9, 9, 9, 255]));
        let rect = ScreenRect::new(0, 0, 2, 2);
        assert_eq!(p.capture(rect).unwrap().data[0], 1);
        p.click(Point::new(1, 1)).unwrap();
        assert_eq!(p.capture(rect).unwrap().data[0], 9);
    }

    #[test]
    fn noise_seeds_differ() {
        let a = noise_frame(16, 16, 1);
        assert_eq!(a.data, noise_frame(16, 16, 1).data);
        assert_ne!(a.data, noise_frame(16, 16, 2).data);
    }

    #[test]
    fn kill_removes_matching_processes() {
        let p = StubPlatform::new();
        p.add_process("DNF.exe");
        p.add_process("launcher.exe");
        assert_eq!(p.kill("dnf"), 1);
        assert!(!p.is_running("DNF.exe"));
        assert!(p.is_running("launcher"));
    }
}
