use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug)]
pub struct RunJournal {
    path: PathBuf,
    guard: Mutex<()>,
}

impl RunJournal {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            path: logs_dir.join("runs.log"),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, level: &str, event: &str, detail: serde_json::Value) {
        let Ok(_guard) = self.guard.lock() else {
            return;
        };
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "event": event,
            "detail": detail,
        });

        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => {
                if let Err(error) = writeln!(file, "{payload}") {
                    warn!(%error, path = %self.path.display(), "failed to append run journal");
                }
            }
            Err(error) => warn!(%error, path = %self.path.display(), "failed to open run journal"),
        }
    }
}
