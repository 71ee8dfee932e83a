//! Rolling health log
//!
//! ```text
//! === 2024-05-01T10:00:00Z cycle 3 ===
//! 2024-05-01T10:00:00Z OK bluealsa: active (pid 412)
//! 2024-05-01T10:00:00Z FAIL ingest: exited with code 1
//! 2024-05-01T10:00:03Z RECOVERED ingest: running after restart
//! ```
//!
//! The tags are a stable prefix for external monitoring.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTag {
    Ok,
    Fail,
    Recovered,
    Error,
    Warn,
}

impl fmt::Display for HealthTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::Fail => "FAIL",
            Self::Recovered => "RECOVERED",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEntry {
    pub at: DateTime<Utc>,
    pub tag: HealthTag,
    pub subject: String,
    pub message: String,
}

impl fmt::Display for HealthEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {}",
            rfc3339(&self.at),
            self.tag,
            self.subject,
            self.message
        )
    }
}

fn rfc3339(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Entries of one cycle, echoed to the tracing log as they are added
#[derive(Debug)]
pub struct HealthBlock {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<HealthEntry>,
}

impl HealthBlock {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            started_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, tag: HealthTag, subject: impl Into<String>, message: impl Into<String>) {
        let entry = HealthEntry {
            at: Utc::now(),
            tag,
            subject: subject.into(),
            message: message.into(),
        };
        match tag {
            HealthTag::Ok | HealthTag::Recovered => {
                info!("{} {}: {}", tag, entry.subject, entry.message)
            }
            HealthTag::Fail | HealthTag::Warn => {
                warn!("{} {}: {}", tag, entry.subject, entry.message)
            }
            HealthTag::Error => error!("{} {}: {}", tag, entry.subject, entry.message),
        }
        self.entries.push(entry);
    }

    pub fn count(&self, tag: HealthTag) -> usize {
        self.entries.iter().filter(|e| e.tag == tag).count()
    }

    pub fn render(&self) -> String {
        let mut out = format!("=== {} cycle {} ===\n", rfc3339(&self.started_at), self.cycle);
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }
}

/// Append-only log rotated to `<file>.1` past `max_bytes`
#[derive(Debug, Clone)]
pub struct HealthLog {
    path: PathBuf,
    max_bytes: u64,
}

impl HealthLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, block: &HealthBlock) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.rotate_if_needed().await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(block.render().as_bytes()).await?;
        file.flush().await
    }

    async fn rotate_if_needed(&self) -> std::io::Result<()> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if self.max_bytes == 0 || len <= self.max_bytes {
            return Ok(());
        }

        let mut rotated = self.path.clone().into_os_string();
        rotated.push(".1");
        info!("Rotating health log {} ({} bytes)", self.path.display(), len);
        tokio::fs::rename(&self.path, PathBuf::from(rotated)).await
    }
}
