use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::Local;

static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();
static MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

struct Logger {
    dir: PathBuf,
    day: String,
    file: File,
    echo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

fn open_day_file(dir: &Path, day: &str) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}.log", day)))
}

/// Initialize the global logger. One file per day (`YYYY-MM-DD.log`), appended.
pub fn init(log_dir: &Path, echo: bool) -> std::io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let day = Local::now().format("%Y-%m-%d").to_string();
    let file = open_day_file(log_dir, &day)?;
    LOGGER
        .set(Mutex::new(Logger { dir: log_dir.to_path_buf(), day, file, echo }))
        .ok();
    Ok(())
}

pub fn set_level(level: Level) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn write_log(level: Level, prefix: &str, msg: &str) {
    if (level as u8) < MIN_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let Some(logger) = LOGGER.get() else { return };

    let now = Local::now();
    let ts = now.format("%H:%M:%S").to_string();
    let line = if prefix.is_empty() {
        format!("[{}] [{}] {}", ts, level.label(), msg)
    } else {
        format!("[{}] [{}] [{}] {}", ts, level.label(), prefix, msg)
    };

    let mut l = logger.lock().unwrap();
    // Roll over at midnight for long-lived schedulers
    let day = now.format("%Y-%m-%d").to_string();
    if day != l.day {
        if let Ok(f) = open_day_file(&l.dir, &day) {
            l.file = f;
            l.day = day;
        }
    }
    writeln!(l.file, "{}", line).ok();
    if l.echo {
        eprintln!("{}", line);
    }
}

pub fn debug(msg: &str) {
    write_log(Level::Debug, "", msg);
}

pub fn info(msg: &str) {
    write_log(Level::Info, "", msg);
}

pub fn warn(msg: &str) {
    write_log(Level::Warn, "", msg);
}

pub fn error(msg: &str) {
    write_log(Level::Error, "", msg);
}

/// Log with a subsystem prefix (`click`, `window`, `scene`, ...).
pub fn debug_p(prefix: &str, msg: &str) {
    write_log(Level::Debug, prefix, msg);
}

pub fn info_p(prefix: &str, msg: &str) {
    write_log(Level::Info, prefix, msg);
}

pub fn warn_p(prefix: &str, msg: &str) {
    write_log(Level::Warn, prefix, msg);
}

pub fn error_p(prefix: &str, msg: &str) {
    write_log(Level::Error, prefix, msg);
}
