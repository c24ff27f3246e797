use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Local;

use relogin_core::checkpoint::RunStatus;
use relogin_core::config::AppConfig;
use relogin_core::evidence::{self, EvidenceRecorder};
use relogin_core::flow::{GameFlow, GameSession};
use relogin_core::logger;
use relogin_core::login::WindowWaitLogin;
use relogin_core::orchestrator::{AccountRunner, RunSummary};
use relogin_core::platform::create_platform;
use relogin_core::run_guard::RunGuard;
use relogin_core::sleep::SystemClock;
use relogin_core::vision::ocr::{OcrEngine, OcrInitError};

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).cloned()
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let base = arg_value(&args, "--base")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if let Err(e) = logger::init(&base.join("logs"), true) {
        eprintln!("cannot open log directory: {}", e);
    }
    if args.iter().any(|a| a == "--debug") {
        logger::set_level(logger::Level::Debug);
    }

    match run(&args, &base) {
        Ok(None) => ExitCode::SUCCESS,
        Ok(Some(summary)) if summary.status == RunStatus::Manual => ExitCode::from(2),
        Ok(Some(_)) => ExitCode::SUCCESS,
        Err(e) => {
            logger::error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String], base: &Path) -> Result<Option<RunSummary>> {
    let force_stub = args.iter().any(|a| a == "--stub");
    let config_path = arg_value(args, "--config")
        .map(PathBuf::from)
        .unwrap_or_else(|| base.join("config.json"));

    let mut cfg = AppConfig::load(&config_path).context("loading configuration")?;
    cfg.resolve_paths(base);
    logger::info(&format!("config loaded from {}", config_path.display()));
    logger::debug(&format!("resolved paths: {:?}", cfg.paths));

    let pruned = evidence::prune(&cfg.evidence.dir, cfg.evidence.retention_days, Local::now().naive_local());
    if pruned > 0 {
        logger::info(&format!("removed {} expired evidence bundle(s)", pruned));
    }

    let Some(_guard) = RunGuard::try_acquire(&cfg.paths.run_lock) else {
        return Ok(None);
    };

    let platform = create_platform(force_stub);
    let ocr = OcrEngine::start(|| Err(OcrInitError::Unavailable));
    let clock = SystemClock;
    let recorder = EvidenceRecorder::new(&cfg.evidence.dir, platform.as_ref(), ocr.as_ref(), cfg.scene.ocr_region_ratio);
    let flow = GameFlow::new(platform.as_ref(), &clock, &cfg, ocr.as_ref(), &recorder);
    let login = WindowWaitLogin::new(platform.as_ref(), &clock, &cfg.launcher);
    let mut session = GameSession::new(flow, &login);

    logger::info("relogin started");
    let summary = AccountRunner::new(&cfg, &recorder, &clock).run_all(&mut session)?;
    logger::info(&format!(
        "summary: status={:?} ok={} failed={} total={}",
        summary.status, summary.succeeded, summary.failed, summary.total
    ));
    Ok(Some(summary))
}
