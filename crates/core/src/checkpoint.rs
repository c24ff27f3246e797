use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::config::Account;
use crate::logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
    Manual,
}

/// Progress of a multi-account run. `next_index` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub accounts_hash: String,
    pub total: usize,
    pub next_index: usize,
    pub status: RunStatus,
    pub updated_at: String,
}

/// Identity of the account list; any reorder or edit invalidates old checkpoints.
pub fn accounts_hash(accounts: &[Account]) -> String {
    let raw = accounts
        .iter()
        .map(|a| a.username.as_str())
        .collect::<Vec<_>>()
        .join("|");
    blake3::hash(raw.as_bytes()).to_hex().to_string()
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unreadable or malformed files read as no checkpoint.
    pub fn load(&self) -> Option<Checkpoint> {
        if !self.path.is_file() {
            return None;
        }
        let parsed = fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|text| Ok(serde_json::from_str::<Checkpoint>(&text)?));
        match parsed {
            Ok(c) => Some(c),
            Err(e) => {
                logger::warn_p("checkpoint", &format!("reading {} failed: {}", self.path.display(), e));
                None
            }
        }
    }

    pub fn save(&self, accounts: &[Account], next_index: usize, status: RunStatus) -> Result<Checkpoint> {
        let total = accounts.len();
        let next_index = match status {
            RunStatus::Completed => total + 1,
            _ => next_index.max(1),
        };
        let checkpoint = Checkpoint {
            accounts_hash: accounts_hash(accounts),
            total,
            next_index,
            status,
            updated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&checkpoint)?)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(checkpoint)
    }

    /// Zero-based index of the first account to run.
    pub fn resolve_start_index(&self, accounts: &[Account]) -> usize {
        let Some(state) = self.load() else {
            return 0;
        };
        if state.accounts_hash != accounts_hash(accounts) {
            logger::info_p("checkpoint", "account list changed, starting from the first account");
            return 0;
        }
        let total = accounts.len();
        if state.status == RunStatus::Completed || state.next_index > total {
            logger::info_p("checkpoint", "previous run completed, starting over");
            return 0;
        }
        if state.next_index <= 1 {
            return 0;
        }
        logger::info_p("checkpoint", &format!("resuming at account {}/{}", state.next_index, total));
        state.next_index - 1
    }
}
