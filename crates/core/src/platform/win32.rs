use std::ffi::c_void;
use std::mem::size_of;
use std::time::Duration;

use anyhow::{anyhow, Result};
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, RECT, WPARAM};
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDC, GetDIBits,
    GetMonitorInfoW, MonitorFromWindow, ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER,
    BI_RGB, DIB_RGB_COLORS, MONITORINFO, MONITOR_DEFAULTTONEAREST, SRCCOPY,
};
use windows::Win32::UI::Input::KeyboardAndMouse::{
    SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, INPUT_MOUSE, KEYBDINPUT, KEYBD_EVENT_FLAGS,
    KEYEVENTF_KEYUP, MOUSEEVENTF_ABSOLUTE, MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP,
    MOUSEEVENTF_MOVE, MOUSEINPUT, MOUSE_EVENT_FLAGS, VIRTUAL_KEY, VK_BACK, VK_DOWN, VK_ESCAPE,
    VK_LEFT, VK_RETURN, VK_RIGHT, VK_SPACE, VK_TAB, VK_UP,
};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetForegroundWindow, GetSystemMetrics, GetWindowRect, GetWindowTextW,
    IsWindowVisible, PostMessageW, SetForegroundWindow, SetWindowPos, ShowWindow, SM_CXSCREEN,
    SM_CXVIRTUALSCREEN, SM_CYSCREEN, SM_CYVIRTUALSCREEN, SM_XVIRTUALSCREEN, SM_YVIRTUALSCREEN,
    SWP_NOACTIVATE, SWP_NOZORDER, SW_RESTORE, WM_CLOSE,
};

use crate::logger;
use crate::types::*;
use super::process::SysProcesses;
use super::{InputInjector, ProcessControl, ScreenCapture, WindowLocator};

const PRESS_DELAY: Duration = Duration::from_millis(20);

fn virtual_key(key: &str) -> Option<VIRTUAL_KEY> {
    match key {
        "enter" | "return" => Some(VK_RETURN),
        "escape" | "esc" => Some(VK_ESCAPE),
        "delete" | "backspace" => Some(VK_BACK),
        "tab" => Some(VK_TAB),
        "space" => Some(VK_SPACE),
        "up" => Some(VK_UP),
        "down" => Some(VK_DOWN),
        "left" => Some(VK_LEFT),
        "right" => Some(VK_RIGHT),
        _ => None,
    }
}

fn to_hwnd(id: WindowId) -> HWND {
    HWND(id as usize as *mut c_void)
}

fn to_id(hwnd: HWND) -> WindowId {
    hwnd.0 as usize as WindowId
}

fn window_text(hwnd: HWND) -> String {
    let mut buf = [0u16; 512];
    let n = unsafe { GetWindowTextW(hwnd, &mut buf) };
    String::from_utf16_lossy(&buf[..n.max(0) as usize])
}

unsafe extern "system" fn collect_windows(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let out = &mut *(lparam.0 as *mut Vec<HWND>);
    out.push(hwnd);
    BOOL(1)
}

fn visible_windows() -> Vec<HWND> {
    let mut all: Vec<HWND> = Vec::new();
    unsafe {
        if EnumWindows(Some(collect_windows), LPARAM(&mut all as *mut Vec<HWND> as isize)).is_err() {
            logger::warn_p("win32", "EnumWindows failed");
        }
    }
    all.into_iter()
        .filter(|h| unsafe { IsWindowVisible(*h) }.as_bool())
        .collect()
}

pub struct Win32Platform {
    processes: SysProcesses,
}

impl Win32Platform {
    pub fn new() -> Self {
        Win32Platform { processes: SysProcesses }
    }

    fn send_mouse(&self, flags: MOUSE_EVENT_FLAGS, dx: i32, dy: i32) -> Result<()> {
        let input = INPUT {
            r#type: INPUT_MOUSE,
            Anonymous: INPUT_0 {
                mi: MOUSEINPUT {
                    dx,
                    dy,
                    mouseData: 0,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        };
        let sent = unsafe { SendInput(&[input], size_of::<INPUT>() as i32) };
        if sent == 0 {
            return Err(anyhow!("SendInput rejected flags {:#x}", flags.0));
        }
        Ok(())
    }

    fn send_key(&self, vk: VIRTUAL_KEY, flags: KEYBD_EVENT_FLAGS) -> Result<()> {
        let input = INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT {
                    wVk: vk,
                    wScan: 0,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        };
        let sent = unsafe { SendInput(&[input], size_of::<INPUT>() as i32) };
        if sent == 0 {
            return Err(anyhow!("SendInput rejected key {:#x}", vk.0));
        }
        Ok(())
    }
}

impl Default for Win32Platform {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowLocator for Win32Platform {
    fn find(&self, title: &str) -> Option<WindowId> {
        let fg = unsafe { GetForegroundWindow() };
        if !fg.is_invalid() && window_text(fg).contains(title) {
            return Some(to_id(fg));
        }
        visible_windows()
            .into_iter()
            .find(|h| window_text(*h).contains(title))
            .map(to_id)
    }

    fn rect(&self, id: WindowId) -> Result<ScreenRect> {
        let mut rect = RECT::default();
        unsafe { GetWindowRect(to_hwnd(id), &mut rect) }
            .map_err(|e| anyhow!("GetWindowRect: {}", e))?;
        Ok(ScreenRect::from_edges(rect.left, rect.top, rect.right, rect.bottom))
    }

    fn activate(&self, id: WindowId) -> Result<()> {
        let hwnd = to_hwnd(id);
        unsafe {
            let _ = ShowWindow(hwnd, SW_RESTORE);
            if !SetForegroundWindow(hwnd).as_bool() {
                return Err(anyhow!("SetForegroundWindow refused for {:#x}", id));
            }
        }
        Ok(())
    }

    fn foreground_title(&self) -> Option<String> {
        let fg = unsafe { GetForegroundWindow() };
        if fg.is_invalid() {
            return None;
        }
        Some(window_text(fg))
    }

    fn work_area(&self, id: WindowId) -> Option<ScreenRect> {
        unsafe {
            let monitor = MonitorFromWindow(to_hwnd(id), MONITOR_DEFAULTTONEAREST);
            if monitor.is_invalid() {
                return None;
            }
            let mut info = MONITORINFO {
                cbSize: size_of::<MONITORINFO>() as u32,
                ..Default::default()
            };
            if !GetMonitorInfoW(monitor, &mut info).as_bool() {
                return None;
            }
            let w = info.rcWork;
            Some(ScreenRect::from_edges(w.left, w.top, w.right, w.bottom))
        }
    }

    fn virtual_screen(&self) -> ScreenRect {
        unsafe {
            ScreenRect::new(
                GetSystemMetrics(SM_XVIRTUALSCREEN),
                GetSystemMetrics(SM_YVIRTUALSCREEN),
                GetSystemMetrics(SM_CXVIRTUALSCREEN),
                GetSystemMetrics(SM_CYVIRTUALSCREEN),
            )
        }
    }

    fn set_rect(&self, id: WindowId, rect: ScreenRect) -> Result<()> {
        unsafe {
            SetWindowPos(
                to_hwnd(id),
                HWND::default(),
                rect.left,
                rect.top,
                rect.width,
                rect.height,
                SWP_NOZORDER | SWP_NOACTIVATE,
            )
        }
        .map_err(|e| anyhow!("SetWindowPos: {}", e))
    }

    fn close(&self, id: WindowId) -> Result<()> {
        unsafe { PostMessageW(to_hwnd(id), WM_CLOSE, WPARAM(0), LPARAM(0)) }
            .map_err(|e| anyhow!("PostMessageW(WM_CLOSE): {}", e))
    }
}

impl ScreenCapture for Win32Platform {
    fn capture(&self, rect: ScreenRect) -> Result<Capture> {
        if rect.width <= 0 || rect.height <= 0 {
            return Err(anyhow!("empty capture rect {}", rect));
        }
        let (w, h) = (rect.width, rect.height);
        unsafe {
            let screen_dc = GetDC(HWND::default());
            let mem_dc = CreateCompatibleDC(screen_dc);
            let bitmap = CreateCompatibleBitmap(screen_dc, w, h);
            let previous = SelectObject(mem_dc, bitmap);

            let blit = BitBlt(mem_dc, 0, 0, w, h, screen_dc, rect.left, rect.top, SRCCOPY);

            let mut info = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: w,
                    // Negative height: top-down rows
                    biHeight: -h,
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            let mut data = vec![0u8; (w * h * 4) as usize];
            let lines = GetDIBits(
                mem_dc,
                bitmap,
                0,
                h as u32,
                Some(data.as_mut_ptr() as *mut c_void),
                &mut info,
                DIB_RGB_COLORS,
            );

            SelectObject(mem_dc, previous);
            let _ = DeleteObject(bitmap);
            let _ = DeleteDC(mem_dc);
            ReleaseDC(HWND::default(), screen_dc);

            blit.map_err(|e| anyhow!("BitBlt: {}", e))?;
            if lines == 0 {
                return Err(anyhow!("GetDIBits returned no lines"));
            }
            Ok(Capture {
                data,
                width: w as u32,
                height: h as u32,
                bytes_per_row: (w * 4) as u32,
            })
        }
    }
}

impl InputInjector for Win32Platform {
    fn click(&self, point: Point) -> Result<()> {
        let (sw, sh) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
        if sw <= 1 || sh <= 1 {
            return Err(anyhow!("bad screen size {}x{}", sw, sh));
        }
        let abs_x = (point.x as i64 * 65535 / (sw as i64 - 1)) as i32;
        let abs_y = (point.y as i64 * 65535 / (sh as i64 - 1)) as i32;

        self.send_mouse(MOUSEEVENTF_MOVE | MOUSEEVENTF_ABSOLUTE, abs_x, abs_y)?;
        self.send_mouse(MOUSEEVENTF_LEFTDOWN | MOUSEEVENTF_ABSOLUTE, abs_x, abs_y)?;
        std::thread::sleep(PRESS_DELAY);
        self.send_mouse(MOUSEEVENTF_LEFTUP | MOUSEEVENTF_ABSOLUTE, abs_x, abs_y)?;
        logger::debug_p("win32", &format!("click{}", point));
        Ok(())
    }

    fn press_key(&self, key: &str) -> Result<()> {
        let vk = virtual_key(&key.to_lowercase()).ok_or_else(|| anyhow!("unknown key {}", key))?;
        self.send_key(vk, KEYBD_EVENT_FLAGS(0))?;
        std::thread::sleep(PRESS_DELAY);
        self.send_key(vk, KEYEVENTF_KEYUP)
    }
}

impl ProcessControl for Win32Platform {
    fn is_running(&self, name: &str) -> bool {
        self.processes.is_running(name)
    }

    fn kill(&self, name: &str) -> usize {
        self.processes.kill(name)
    }
}
