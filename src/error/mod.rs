use std::any::Any;
use std::cell::RefCell;
use std::error::Error as StdError;
use std::fmt;

use once_cell::sync::OnceCell;

use crate::logging::{CleanupError, SetupError, LOG_TARGET};

mod crash_id;

pub use crash_id::CrashId;

/// Boxed error accepted from caller code. `anyhow::Error` and every
/// `std::error::Error + Send + Sync` type convert into it.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Source position recorded where an error was wrapped or a value was logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    file: &'static str,
    line: u32,
}

impl Location {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Location { file, line }
    }

    /// Location of the caller of the enclosing `#[track_caller]` function.
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Location::new(location.file(), location.line())
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.file, self.line)
    }
}

/// An error annotated with where it was wrapped and, optionally, what the
/// program was doing at the time.
///
/// The wrapped error is kept as-is and returned by [`StdError::source`], so
/// callers walking the chain reach the original value one level down.
#[derive(Debug)]
pub struct WrappedError {
    location: Location,
    context: Vec<String>,
    source: BoxError,
}

impl WrappedError {
    pub fn new(err: impl Into<BoxError>, location: Location) -> Self {
        WrappedError {
            location,
            context: Vec::new(),
            source: err.into(),
        }
    }

    /// Appends one context line.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    /// Appends context lines in iteration order.
    pub fn with_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context.extend(contexts.into_iter().map(Into::into));
        self
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn context(&self) -> &[String] {
        &self.context
    }

    /// The wrapped error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.source
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }

    pub fn into_inner(self) -> BoxError {
        self.source
    }
}

impl fmt::Display for WrappedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:\n\t", self.location)?;
        for line in &self.context {
            write!(f, "{line}\n\t")?;
        }
        write!(f, "{}", self.source)
    }
}

impl StdError for WrappedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.source)
    }
}

/// Wraps the error side of a `Result` with the caller's location.
pub trait ResultExt<T> {
    fn wrap_err(self) -> Result<T, WrappedError>;

    fn wrap_err_with<I, S>(self, context: I) -> Result<T, WrappedError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    #[track_caller]
    fn wrap_err(self) -> Result<T, WrappedError> {
        let location = Location::caller();
        self.map_err(|err| WrappedError::new(err, location))
    }

    #[track_caller]
    fn wrap_err_with<I, S>(self, context: I) -> Result<T, WrappedError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let location = Location::caller();
        self.map_err(|err| WrappedError::new(err, location).with_contexts(context))
    }
}

/// Wraps an error with the location of the macro invocation and optional
/// context lines.
///
/// ```ignore
/// let err = runwrap::wrap_err!(io_err, "connecting", "timeout");
/// ```
#[macro_export]
macro_rules! wrap_err {
    ($err:expr $(,)?) => {
        $crate::error::WrappedError::new(
            $err,
            $crate::error::Location::new(file!(), line!()),
        )
    };
    ($err:expr, $($context:expr),+ $(,)?) => {
        $crate::error::WrappedError::new(
            $err,
            $crate::error::Location::new(file!(), line!()),
        )
        $(.with_context($context))+
    };
}

/// Logs a formatted value prefixed with the location of the macro invocation.
#[macro_export]
macro_rules! log_here {
    ($($arg:tt)+) => {
        $crate::error::log_located(
            $crate::error::Location::new(file!(), line!()),
            format_args!($($arg)+),
        )
    };
}

/// Message text used by [`log_here!`].
pub fn located_message(location: Location, value: impl fmt::Display) -> String {
    format!(":\n\t{location}:\n\t{value}")
}

#[doc(hidden)]
pub fn log_located(location: Location, value: fmt::Arguments<'_>) {
    tracing::info!(target: LOG_TARGET, "{}", located_message(location, value));
}

/// Failure of a whole run, as produced by [`crate::run::Runner::run`].
#[derive(Debug)]
pub enum RunError {
    /// The log session could not be opened; the program logic never ran.
    Setup(SetupError),
    /// The program logic returned an error.
    Operation(BoxError),
    /// The program logic panicked.
    Panic {
        message: String,
        location: Option<String>,
        crash_id: CrashId,
    },
    /// Closing or removing the log failed after the program logic finished.
    Cleanup(CleanupError),
}

impl RunError {
    pub fn operation(err: impl Into<BoxError>) -> Self {
        RunError::Operation(err.into())
    }

    pub fn crash_id(&self) -> Option<&CrashId> {
        match self {
            RunError::Panic { crash_id, .. } => Some(crash_id),
            _ => None,
        }
    }

    /// True when the run state can no longer be trusted and the process
    /// should terminate with a failure status.
    pub fn is_fatal(&self) -> bool {
        match self {
            RunError::Cleanup(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Operation(_) => 1,
            RunError::Setup(_) => 2,
            RunError::Cleanup(_) => 3,
            RunError::Panic { .. } => 101,
        }
    }

    pub fn log_with_event(&self, event: &'static str) {
        match self {
            RunError::Panic {
                message,
                location,
                crash_id,
            } => tracing::error!(
                target: LOG_TARGET,
                event = event,
                crash_id = %crash_id,
                location = location.as_deref().unwrap_or("unknown"),
                "{message}"
            ),
            other => tracing::error!(target: LOG_TARGET, event = event, "{other}"),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Setup(err) => fmt::Display::fmt(err, f),
            RunError::Operation(err) => fmt::Display::fmt(err, f),
            RunError::Panic {
                message,
                location: Some(location),
                crash_id,
            } => write!(f, "{location}:\n\tpanic: {message}\n\tcrash id: {crash_id}"),
            RunError::Panic {
                message, crash_id, ..
            } => write!(f, "panic: {message}\n\tcrash id: {crash_id}"),
            RunError::Cleanup(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl StdError for RunError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RunError::Setup(err) => err.source(),
            RunError::Operation(err) => err.source(),
            RunError::Panic { .. } => None,
            RunError::Cleanup(err) => err.source(),
        }
    }
}

impl From<SetupError> for RunError {
    fn from(err: SetupError) -> Self {
        RunError::Setup(err)
    }
}

impl From<CleanupError> for RunError {
    fn from(err: CleanupError) -> Self {
        RunError::Cleanup(err)
    }
}

/// What the panic hook saw for the most recent panic on this thread.
#[derive(Debug, Clone)]
pub(crate) struct PanicRecord {
    pub(crate) crash_id: CrashId,
    pub(crate) location: Option<String>,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicRecord>> = const { RefCell::new(None) };
}

static PANIC_HOOK: OnceCell<()> = OnceCell::new();

/// Extracts the message of a panic payload.
pub fn panic_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}

/// Installs, once per process, a panic hook that assigns a crash id, logs
/// the panic with its location and then defers to the previous hook.
pub fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let crash_id = CrashId::new();
            let location = info
                .location()
                .map(|location| format!("[{}][{}]", location.file(), location.line()));
            tracing::error!(
                target: LOG_TARGET,
                event = "panic",
                crash_id = %crash_id,
                location = location.as_deref().unwrap_or("unknown"),
                "{}",
                panic_payload(info.payload())
            );
            LAST_PANIC.with(|slot| {
                *slot.borrow_mut() = Some(PanicRecord { crash_id, location });
            });
            previous(info);
        }));
    });
}

/// Takes the record left by the panic hook on this thread, if any.
pub(crate) fn take_panic_record() -> Option<PanicRecord> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn display_without_context() {
        let err = WrappedError::new(
            io::Error::new(io::ErrorKind::NotFound, "missing"),
            Location::new("src/main.rs", 12),
        );
        assert_eq!(err.to_string(), "[src/main.rs][12]:\n\tmissing");
    }

    #[test]
    fn display_with_context_lines_in_order() {
        let err = WrappedError::new("refused", Location::new("src/net.rs", 7))
            .with_contexts(["connecting", "timeout"]);
        assert_eq!(
            err.to_string(),
            "[src/net.rs][7]:\n\tconnecting\n\ttimeout\n\trefused"
        );
        assert_eq!(err.context(), ["connecting", "timeout"]);
    }

    #[test]
    fn macro_records_invocation_site() {
        let line = line!() + 1;
        let err = crate::wrap_err!(io::Error::new(io::ErrorKind::Other, "boom"), "ctx");
        assert_eq!(err.location().file(), file!());
        assert_eq!(err.location().line(), line);
        assert!(err.to_string().ends_with("\n\tctx\n\tboom"));
    }

    #[test]
    fn result_ext_records_caller() {
        let result: Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::Other, "nope"));
        let line = line!() + 1;
        let err = result.wrap_err_with(["reading config"]).unwrap_err();
        assert_eq!(err.location(), Location::new(file!(), line));
        assert_eq!(err.context(), ["reading config"]);
    }

    #[test]
    fn source_is_the_wrapped_error() {
        let err = crate::wrap_err!(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        let source = err.source().expect("source present");
        let io_err = source.downcast_ref::<io::Error>().expect("io error");
        assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
        assert!(err.downcast_ref::<io::Error>().is_some());
    }

    #[test]
    fn located_message_shape() {
        let message = located_message(Location::new("a.rs", 3), "value");
        assert_eq!(message, ":\n\t[a.rs][3]:\n\tvalue");
    }

    #[test]
    fn panic_payload_variants() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_payload(text.as_ref()), "boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_payload(owned.as_ref()), "kaboom");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_payload(other.as_ref()), "unknown panic payload");
    }

    #[test]
    fn exit_codes_by_kind() {
        assert_eq!(RunError::operation("failed").exit_code(), 1);
        let panic = RunError::Panic {
            message: "boom".into(),
            location: None,
            crash_id: CrashId::new(),
        };
        assert_eq!(panic.exit_code(), 101);
        assert!(panic.crash_id().is_some());
        assert!(!panic.is_fatal());
        assert!(panic.to_string().starts_with("panic: boom\n\tcrash id: "));
    }

    #[test]
    fn operation_display_passes_through() {
        let inner = crate::wrap_err!("cause", "step");
        let expected = inner.to_string();
        let err = RunError::operation(inner);
        assert_eq!(err.to_string(), expected);
    }
}
