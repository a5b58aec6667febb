//! Process-wide `tracing` setup shared by the index and worker binaries.
//!
//! Events always go to stdout. With a log directory configured they are also
//! appended to `relay-<component>-<name>.log` inside it.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::ENV_LOG_LEVEL;
use crate::sync::locked;

#[derive(Debug, Clone)]
pub struct LogSettings {
    /// `index` or `worker`; part of the log file name.
    pub component: String,
    pub name: String,
    pub log_dir: String,
    pub debug: bool,
}

impl LogSettings {
    /// Where events are appended, if file logging is on.
    pub fn file_path(&self) -> Option<PathBuf> {
        let dir = self.log_dir.trim();
        if dir.is_empty() {
            return None;
        }
        let name: String = self.name.chars().map(file_safe).collect();
        Some(Path::new(dir).join(format!("relay-{}-{name}.log", self.component)))
    }

    /// `RUST_LOG` wins; otherwise `--debug`, then `RELAY_LOG_LEVEL`, then info.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = match (self.debug, std::env::var(ENV_LOG_LEVEL)) {
                (true, _) => "debug".to_string(),
                (false, Ok(level)) if !level.trim().is_empty() => level,
                _ => "info".to_string(),
            };
            EnvFilter::new(level)
        })
    }
}

fn file_safe(c: char) -> char {
    match c {
        'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
        _ => '_',
    }
}

/// Shared append handle on the log file.
#[derive(Clone)]
struct LogFile(Arc<Mutex<File>>);

impl LogFile {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self(Arc::new(Mutex::new(file))))
    }
}

/// Keeps the log file open for as long as the process logs.
pub struct LogGuard {
    path: Option<PathBuf>,
    _file: Option<LogFile>,
}

impl LogGuard {
    pub fn has_file(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Installs the global subscriber. Returns None if one was already installed.
/// A log file that cannot be opened is reported on stderr and skipped.
pub fn init_logging(settings: &LogSettings) -> Option<LogGuard> {
    let (path, file) = match settings.file_path() {
        Some(path) => match LogFile::open(&path) {
            Ok(file) => (Some(path), Some(file)),
            Err(err) => {
                eprintln!("log_file_error: {}: {err}", path.display());
                (None, None)
            }
        },
        None => (None, None),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(settings.filter())
        .with_writer(Tee { file: file.clone() })
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;

    if let Some(path) = &path {
        info!(event = "log_file", path = %path.display());
    }
    Some(LogGuard { path, _file: file })
}

/// Hands the subscriber a writer that copies each event to stdout and the
/// optional log file.
#[derive(Clone)]
struct Tee {
    file: Option<LogFile>,
}

impl<'a> MakeWriter<'a> for Tee {
    type Writer = TeeWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            stdout: io::stdout(),
            file: self.file.as_ref(),
        }
    }
}

struct TeeWriter<'a> {
    stdout: io::Stdout,
    file: Option<&'a LogFile>,
}

impl Write for TeeWriter<'_> {
    // Logging never fails the caller; a broken sink just loses the line.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.lock().write_all(buf);
        if let Some(LogFile(file)) = self.file {
            let _ = locked(file).write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(LogFile(file)) = self.file {
            let _ = locked(file).flush();
        }
        Ok(())
    }
}
