//! Per-run log files.
//!
//! Every run gets its own file at
//! `<base>/.logs/<program>/<program>_<YYYY-MM-DD_HH-MM-SS>_log.txt`, where
//! `<base>` is the directory holding the executable unless [`LogConfig`]
//! overrides it. Records are written through a `tracing` dispatcher that
//! tees each line to the file and to stdout.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{Dispatch, Subscriber};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

use crate::program;

/// Target used by every record this crate emits.
pub const LOG_TARGET: &str = "runwrap";
/// Name of the hidden directory created next to the executable.
pub const LOGS_DIR_NAME: &str = ".logs";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
pub const DEFAULT_FILTER: &str = "info";
const IDLE_FILTER: &str = "off";

#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("resolve executable path: {source}")]
    Executable {
        #[source]
        source: io::Error,
    },
    #[error("create log directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("open log file {}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SetupError {
    /// The path computed before setup failed, if it got that far.
    pub fn path(&self) -> Option<&Path> {
        match self {
            SetupError::Executable { .. } => None,
            SetupError::CreateDir { path, .. } | SetupError::OpenFile { path, .. } => Some(path),
        }
    }
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("read log file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("remove empty log file {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("close log file {}: {source}", path.display())]
    Close {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CleanupError {
    /// An unreadable log means the state of the run is unknown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CleanupError::Read { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Options for opening a [`LogSession`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory that replaces the executable's directory as the base.
    pub root: Option<PathBuf>,
    /// Program name used instead of the executable's file name.
    pub program_name: Option<String>,
    /// Echo records to stdout as well as the file.
    pub console: bool,
    pub format: LogFormat,
    /// Filter directive applied when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            root: None,
            program_name: None,
            console: true,
            format: LogFormat::Text,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl LogConfig {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_program_name(mut self, name: impl Into<String>) -> Self {
        self.program_name = Some(name.into());
        self
    }

    pub fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Creates the log directory and opens this run's log file.
    pub fn open(&self) -> Result<LogSession, SetupError> {
        let stamp = format_timestamp(&Local::now());

        let base = match &self.root {
            Some(root) => root.clone(),
            None => {
                let exe = program::executable_path()
                    .map_err(|source| SetupError::Executable { source })?;
                exe.parent().map(Path::to_path_buf).unwrap_or_default()
            }
        };

        let name = match &self.program_name {
            Some(name) => name.clone(),
            None => program::program_name().map_err(|source| SetupError::Executable { source })?,
        };

        let dir = log_dir(&base, &name);
        create_log_dir(&dir).map_err(|source| SetupError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(log_file_name(&name, &stamp));
        let file = open_log_file(&path).map_err(|source| SetupError::OpenFile {
            path: path.clone(),
            source,
        })?;

        Ok(LogSession {
            file: Arc::new(file),
            path,
            console: self.console,
            format: self.format,
            filter: self.filter.clone(),
        })
    }
}

/// Opens this run's log file with the default [`LogConfig`].
pub fn setup_log() -> Result<LogSession, SetupError> {
    LogConfig::default().open()
}

pub fn format_timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn log_dir(base: &Path, program: &str) -> PathBuf {
    base.join(LOGS_DIR_NAME).join(program)
}

pub fn log_file_name(program: &str, timestamp: &str) -> String {
    format!("{program}_{timestamp}_log.txt")
}

pub fn log_file_path(base: &Path, program: &str, timestamp: &str) -> PathBuf {
    log_dir(base, program).join(log_file_name(program, timestamp))
}

fn create_log_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder.create(dir)
}

fn open_log_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }
    options.open(path)
}

/// The open log file of one run.
#[derive(Debug)]
pub struct LogSession {
    file: Arc<File>,
    path: PathBuf,
    console: bool,
    format: LogFormat,
    filter: String,
}

impl LogSession {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn writer(&self) -> SessionWriter {
        SessionWriter {
            file: Arc::clone(&self.file),
            console: self.console,
        }
    }

    /// Builds a dispatcher that sends records to this session's file and,
    /// when enabled, to stdout.
    pub fn dispatch(&self) -> Dispatch {
        bridge_log_records();
        Dispatch::new(
            tracing_subscriber::registry()
                .with(self.filter())
                .with(self.layer::<Layered<EnvFilter, Registry>>()),
        )
    }

    /// Routes records from every thread that has no dispatcher of its own
    /// into this session until the returned guard is dropped.
    ///
    /// Returns `None` when another session currently holds the process sink,
    /// or when a global default was installed by someone else.
    pub fn activate(&self) -> Option<ActiveSink> {
        let sink = process_sink()?;
        if sink
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let active = ActiveSink { sink };
        if let Err(err) = sink.layer.reload(Some(self.layer())) {
            tracing::warn!(target: LOG_TARGET, event = "sink_reload_failed", error = %err);
            return None;
        }
        if let Err(err) = sink.filter.reload(self.filter()) {
            tracing::warn!(target: LOG_TARGET, event = "sink_reload_failed", error = %err);
            return None;
        }
        Some(active)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.filter))
    }

    fn layer<S>(&self) -> BoxedLayer<S>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
    {
        let writer = self.writer();
        let layer = tracing_subscriber::fmt::layer::<S>()
            .with_ansi(false)
            .with_target(false)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(move || writer.clone());

        match self.format {
            LogFormat::Text => Box::new(layer),
            LogFormat::Json => Box::new(layer.json()),
        }
    }

    /// Makes this session the process-wide default sink. Fails if a global
    /// default has already been set.
    pub fn install_global(&self) -> Result<(), tracing::dispatcher::SetGlobalDefaultError> {
        tracing::dispatcher::set_global_default(self.dispatch())
    }

    /// Flushes the file to disk and releases this handle, returning the path.
    pub fn close(self) -> Result<PathBuf, CleanupError> {
        let LogSession { file, path, .. } = self;
        match file.sync_all() {
            Ok(()) => Ok(path),
            Err(source) => Err(CleanupError::Close { path, source }),
        }
    }
}

/// Writer handed to the formatter: each buffer goes to the file, then stdout.
#[derive(Debug, Clone)]
pub struct SessionWriter {
    file: Arc<File>,
    console: bool,
}

impl Write for SessionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.file).write_all(buf)?;
        if self.console {
            io::stdout().lock().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.file).flush()?;
        if self.console {
            io::stdout().lock().flush()?;
        }
        Ok(())
    }
}

/// Routes `log` crate records into whichever `tracing` dispatcher is active.
fn bridge_log_records() {
    static BRIDGE: OnceCell<()> = OnceCell::new();
    BRIDGE.get_or_init(|| {
        let _ = tracing_log::LogTracer::init();
    });
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;
type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;

/// Global subscriber whose filter and output are swapped per session.
struct ProcessSink {
    filter: reload::Handle<EnvFilter, Registry>,
    layer: reload::Handle<Option<BoxedLayer<FilteredRegistry>>, FilteredRegistry>,
    claimed: AtomicBool,
}

/// Installs the process sink on first use. `None` if a global default was
/// already set elsewhere.
fn process_sink() -> Option<&'static ProcessSink> {
    static SINK: OnceCell<Option<ProcessSink>> = OnceCell::new();
    SINK.get_or_init(|| {
        bridge_log_records();
        let (filter, filter_handle) = reload::Layer::new(EnvFilter::new(IDLE_FILTER));
        let (layer, layer_handle) = reload::Layer::new(None::<BoxedLayer<FilteredRegistry>>);
        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        match tracing::subscriber::set_global_default(subscriber) {
            Ok(()) => Some(ProcessSink {
                filter: filter_handle,
                layer: layer_handle,
                claimed: AtomicBool::new(false),
            }),
            Err(_) => None,
        }
    })
    .as_ref()
}

/// Holds the process sink for one session; see [`LogSession::activate`].
///
/// Dropping it silences the process sink and releases the session's file.
#[must_use = "the session stops receiving records when the guard is dropped"]
pub struct ActiveSink {
    sink: &'static ProcessSink,
}

impl fmt::Debug for ActiveSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSink").finish_non_exhaustive()
    }
}

impl Drop for ActiveSink {
    fn drop(&mut self) {
        let _ = self.sink.layer.reload(None);
        let _ = self.sink.filter.reload(EnvFilter::new(IDLE_FILTER));
        self.sink.claimed.store(false, Ordering::Release);
    }
}

/// Removes the log file when nothing but whitespace was written to it.
///
/// Returns whether the file was removed. A read failure is fatal to the run
/// (see [`CleanupError::is_fatal`]); a failed removal is not.
pub fn delete_empty_log_file(path: &Path) -> Result<bool, CleanupError> {
    let bytes = fs::read(path).map_err(|source| CleanupError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    if !String::from_utf8_lossy(&bytes).trim().is_empty() {
        return Ok(false);
    }

    fs::remove_file(path).map_err(|source| CleanupError::Remove {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(target: LOG_TARGET, event = "empty_log_removed", path = %path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn timestamp_has_second_resolution() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_opt(7, 5, 4))
            .expect("valid date")
            .and_utc();
        assert_eq!(format_timestamp(&at), "2024-03-09_07-05-04");
    }

    #[test]
    fn path_follows_layout() {
        let path = log_file_path(Path::new("/opt/tools"), "sync", "2024-03-09_07-05-04");
        assert_eq!(
            path,
            PathBuf::from("/opt/tools/.logs/sync/sync_2024-03-09_07-05-04_log.txt")
        );
    }

    proptest! {
        #[test]
        fn path_shape_for_any_program(
            name in "[A-Za-z0-9_-]{1,24}",
            secs in 0i64..4_102_444_800,
        ) {
            let at = Utc.timestamp_opt(secs, 0).single().expect("in range");
            let stamp = format_timestamp(&at);
            let path = log_file_path(Path::new("base"), &name, &stamp);

            let expected_name = format!("{name}_{stamp}_log.txt");
            let expected_dir = Path::new("base").join(".logs").join(&name);
            prop_assert_eq!(
                path.file_name().and_then(|n| n.to_str()),
                Some(expected_name.as_str())
            );
            prop_assert_eq!(path.parent(), Some(expected_dir.as_path()));
            prop_assert_eq!(stamp.len(), "YYYY-MM-DD_HH-MM-SS".len());
        }
    }

    #[test]
    fn whitespace_only_log_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quiet_log.txt");
        fs::write(&path, " \n\t\r\n").unwrap();

        assert!(delete_empty_log_file(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn log_with_content_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("busy_log.txt");
        fs::write(&path, "\n  x \n").unwrap();

        assert!(!delete_empty_log_file(&path).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "\n  x \n");
    }

    #[test]
    fn unreadable_log_is_fatal() {
        let dir = tempdir().unwrap();
        let err = delete_empty_log_file(&dir.path().join("missing.txt")).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, CleanupError::Read { .. }));
    }

    #[test]
    fn setup_error_reports_partial_path() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();

        let err = LogConfig::default()
            .with_root(&blocker)
            .with_program_name("tool")
            .open()
            .unwrap_err();
        assert!(matches!(err, SetupError::CreateDir { .. }));
        assert_eq!(err.path(), Some(blocker.join(".logs").join("tool").as_path()));
    }
}
