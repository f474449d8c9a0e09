//! Shared logging setup for Anzu binaries.
//!
//! Two layers: a size-capped file sink under the Anzu home directory and a
//! stderr sink. The env filter applies to both; without `--verbose` the
//! console only shows warnings.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use anzu_protocol::config::anzu_home;

const DEFAULT_LOG_FILTER: &str =
    "anzu_director=info,anzu_backends=info,anzu_learning=info,anzu_db=info,anzu_events=info";
/// Archived log generations kept per binary.
const KEEP_ARCHIVES: usize = 4;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with the rotating file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let dir = logs_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    let sink = LogSink::open(dir, config.app_name)
        .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(sink)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Logs directory: ~/.anzu/logs
pub fn logs_dir() -> PathBuf {
    anzu_home().join("logs")
}

struct SinkState {
    file: File,
    written: u64,
}

/// Size-capped log sink. When the active file exceeds the cap it is
/// archived under a numbered suffix and the oldest archives are pruned.
/// Clones share one underlying file, so every tracing layer writer goes
/// through the same lock.
#[derive(Clone)]
pub struct LogSink {
    dir: PathBuf,
    base: String,
    state: Arc<Mutex<SinkState>>,
}

impl LogSink {
    fn open(dir: PathBuf, app_name: &str) -> io::Result<Self> {
        let base: String = app_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", base)))?;
        let written = file.metadata()?.len();
        Ok(LogSink {
            dir,
            base,
            state: Arc::new(Mutex::new(SinkState { file, written })),
        })
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base))
    }

    /// Archive the active file as `<base>.log.<n>` with the next free
    /// index, then prune down to KEEP_ARCHIVES.
    fn rotate(&self, state: &mut SinkState) -> io::Result<()> {
        state.file.flush()?;

        let mut indices = self.archive_indices()?;
        let next = indices.iter().copied().max().unwrap_or(0) + 1;
        fs::rename(self.active_path(), self.archive_path(next))?;
        indices.push(next);

        indices.sort_unstable();
        while indices.len() > KEEP_ARCHIVES {
            let oldest = indices.remove(0);
            let _ = fs::remove_file(self.archive_path(oldest));
        }

        state.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        state.written = 0;
        Ok(())
    }

    fn archive_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base, index))
    }

    fn archive_indices(&self) -> io::Result<Vec<u64>> {
        let prefix = format!("{}.log.", self.base);
        let mut indices = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(suffix) = name.to_string_lossy().strip_prefix(&prefix) {
                if let Ok(index) = suffix.parse::<u64>() {
                    indices.push(index);
                }
            }
        }
        Ok(indices)
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink lock poisoned"))?;
        if state.written + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate(&mut state)?;
        }
        let written = state.file.write(buf)?;
        state.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink lock poisoned"))?;
        state.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_sink(dir: &std::path::Path) -> LogSink {
        LogSink::open(dir.to_path_buf(), "director").unwrap()
    }

    #[test]
    fn test_rotation_archives_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = tiny_sink(dir.path());

        // Force several rotations well past the keep limit.
        for _ in 0..(KEEP_ARCHIVES + 3) {
            {
                let mut state = sink.state.lock().unwrap();
                state.written = MAX_LOG_FILE_SIZE;
            }
            sink.write_all(b"line\n").unwrap();
        }
        sink.flush().unwrap();

        let archives = sink.archive_indices().unwrap();
        assert!(archives.len() <= KEEP_ARCHIVES);
        assert!(dir.path().join("director.log").exists());
        // Newest archives survive pruning.
        let max = archives.iter().max().copied().unwrap();
        assert_eq!(max as usize, KEEP_ARCHIVES + 3);
    }

    #[test]
    fn test_app_name_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path().to_path_buf(), "anzu director/1").unwrap();
        assert!(sink.active_path().ends_with("anzu_director_1.log"));
    }

    #[test]
    fn test_clones_share_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = tiny_sink(dir.path());
        let mut b = a.clone();
        a.write_all(b"one\n").unwrap();
        b.write_all(b"two\n").unwrap();
        a.flush().unwrap();

        let contents = fs::read_to_string(dir.path().join("director.log")).unwrap();
        assert!(contents.contains("one"));
        assert!(contents.contains("two"));
    }
}
