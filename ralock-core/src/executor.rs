//! The work done while holding the resource.

use std::fs::OpenOptions;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::ExecutorError;
use crate::infrastructure::AccessLog;
use crate::types::NodeId;

/// Zone used for access-log timestamps unless configured otherwise.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Sao_Paulo;

/// How long [`LoggedAccess`] holds the resource unless configured otherwise.
pub const DEFAULT_HOLD: Duration = Duration::from_secs(10);

/// Runs while the coordinator holds quorum. Never invoked concurrently with
/// itself on the same node; the coordinator guarantees that, not this trait.
pub trait CriticalSection: Send + Sync {
    fn enter(&self, node: NodeId) -> impl Future<Output = Result<(), ExecutorError>> + Send;
}

/// Writes one access line, then holds the resource for a fixed time.
pub struct LoggedAccess<L> {
    log: L,
    hold: Duration,
    timezone: Tz,
}

impl<L: AccessLog> LoggedAccess<L> {
    pub fn new(log: L) -> Self {
        Self {
            log,
            hold: DEFAULT_HOLD,
            timezone: DEFAULT_TIMEZONE,
        }
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn log(&self) -> &L {
        &self.log
    }
}

impl<L: AccessLog> CriticalSection for LoggedAccess<L> {
    async fn enter(&self, node: NodeId) -> Result<(), ExecutorError> {
        let now = Utc::now().with_timezone(&self.timezone);
        self.log.append_line(&access_line(node, &now)).await?;

        tracing::info!(node = %node, "Using the shared resource");
        tokio::time::sleep(self.hold).await;
        tracing::info!(node = %node, "Finished using the shared resource");
        Ok(())
    }
}

pub fn access_line<Z: TimeZone>(node: NodeId, at: &DateTime<Z>) -> String
where
    Z::Offset: std::fmt::Display,
{
    format!(
        "Node {node} accessed the shared resource at {}",
        at.format("%Y-%m-%d %H:%M:%S")
    )
}

pub fn parse_timezone(name: &str) -> Result<Tz, ExecutorError> {
    name.parse::<Tz>()
        .map_err(|_| ExecutorError::UnknownTimezone(name.to_string()))
}

/// Append-only text file shared by every node on the host (or volume).
///
/// Each append takes an exclusive OS lock on a sibling lock file, so
/// concurrent writers from other processes are serialized.
#[derive(Debug, Clone)]
pub struct FileAccessLog {
    log_path: PathBuf,
    lock_path: PathBuf,
}

impl FileAccessLog {
    pub fn new(log_path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            lock_path: lock_path.into(),
        }
    }

    /// Uses `<log_path>.lock` as the lock file.
    pub fn beside(log_path: impl Into<PathBuf>) -> Self {
        let log_path = log_path.into();
        let mut lock_path = log_path.clone().into_os_string();
        lock_path.push(".lock");
        Self::new(log_path, lock_path)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl AccessLog for FileAccessLog {
    async fn append_line(&self, line: &str) -> Result<(), ExecutorError> {
        let log_path = self.log_path.clone();
        let lock_path = self.lock_path.clone();
        let line = line.to_string();

        tokio::task::spawn_blocking(move || append_locked(&log_path, &lock_path, &line)).await??;
        Ok(())
    }
}

fn append_locked(log_path: &Path, lock_path: &Path, line: &str) -> io::Result<()> {
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    lock.lock()?;

    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .and_then(|mut file| writeln!(file, "{line}"));

    lock.unlock()?;
    result
}
