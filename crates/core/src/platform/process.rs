use sysinfo::{ProcessesToUpdate, System};

use crate::logger;
use super::ProcessControl;

/// `DNF.exe`, `dnf`, ` Dnf.EXE ` all name the same process.
pub fn normalize_process_name(name: &str) -> String {
    let value = name.trim().to_lowercase();
    match value.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => value,
    }
}

pub fn process_name_matches(target: &str, actual: &str) -> bool {
    !actual.is_empty() && normalize_process_name(target) == normalize_process_name(actual)
}

/// Process table backed by `sysinfo`.
pub struct SysProcesses;

impl SysProcesses {
    fn snapshot() -> System {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys
    }

    pub fn pid_alive(pid: u32) -> bool {
        let sys = Self::snapshot();
        sys.process(sysinfo::Pid::from_u32(pid)).is_some()
    }
}

impl ProcessControl for SysProcesses {
    fn is_running(&self, name: &str) -> bool {
        Self::snapshot()
            .processes()
            .values()
            .any(|p| process_name_matches(name, &p.name().to_string_lossy()))
    }

    fn kill(&self, name: &str) -> usize {
        let sys = Self::snapshot();
        let mut matched = 0;
        let mut killed = 0;
        for p in sys.processes().values() {
            if !process_name_matches(name, &p.name().to_string_lossy()) {
                continue;
            }
            matched += 1;
            if p.kill() {
                killed += 1;
            }
        }
        if matched == 0 {
            logger::warn_p("process", &format!("no process named {}", name));
        }
        killed
    }
}
