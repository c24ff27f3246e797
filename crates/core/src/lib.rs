pub mod anchors;
pub mod checkpoint;
pub mod click;
pub mod config;
pub mod evidence;
pub mod flow;
pub mod logger;
pub mod login;
pub mod orchestrator;
pub mod platform;
pub mod run_guard;
pub mod scene;
pub mod sleep;
pub mod types;
pub mod vision;
pub mod window_recovery;
