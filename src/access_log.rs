//! Append-only access log with reopen-on-SIGHUP for rotation.

use http::{Method, StatusCode, Uri};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tracing::{info, warn};

/// Destination for access-log lines: standard output or an append-mode
/// file that can be reopened while the proxy is running.
pub struct AccessLog {
    path: Option<PathBuf>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl AccessLog {
    /// Open the access log. `-` selects standard output.
    pub fn open(path: &str) -> std::io::Result<Self> {
        if path == "-" {
            return Ok(Self {
                path: None,
                writer: Mutex::new(Box::new(std::io::stdout())),
            });
        }
        let file = open_append(Path::new(path))?;
        Ok(Self {
            path: Some(PathBuf::from(path)),
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Reopen the log file, e.g. after it was rotated away. A no-op for
    /// standard output. On failure the previous handle keeps working.
    pub fn reopen(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = open_append(path)?;
        *self.lock() = Box::new(file);
        Ok(())
    }

    /// Write one completed-request line. Failures are logged, never fatal.
    pub fn record(&self, remote: SocketAddr, method: &Method, uri: &Uri, status: StatusCode) {
        let timestamp = humantime::format_rfc3339_seconds(SystemTime::now());
        let line = format!(
            "{} - - [{}] \"{} {} HTTP/1.1\" {}\n",
            remote.ip(),
            timestamp,
            method,
            uri,
            status.as_u16(),
        );
        let mut writer = self.lock();
        if let Err(err) = writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.flush())
        {
            warn!(error = %err, "failed to write access log line");
        }
    }

    /// Reopen the log on every SIGHUP. No-op on non-unix platforms.
    pub fn watch_hangup(self: &Arc<Self>) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let log = Arc::clone(self);
            tokio::spawn(async move {
                let mut hangup = match signal(SignalKind::hangup()) {
                    Ok(hangup) => hangup,
                    Err(err) => {
                        warn!(error = %err, "failed to install SIGHUP handler");
                        return;
                    }
                };
                while hangup.recv().await.is_some() {
                    match log.reopen() {
                        Ok(()) => info!("access log reopened"),
                        Err(err) => warn!(error = %err, "failed to reopen access log"),
                    }
                }
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn Write + Send>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
