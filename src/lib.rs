//! Standard startup for command-line programs: a timestamped log file per
//! run, errors annotated with where they were wrapped, and failure reports
//! sent by email.
//!
//! - [`logging`] creates the run's log file and the `tracing` sink over it.
//! - [`error`] wraps errors with their call site and defines run failures.
//! - [`notify`] formats and sends failure emails through an [`Account`].
//! - [`run`] ties them together around the program's own logic.
//! - [`pause`] keeps a console window open after a failure.

pub mod error;
pub mod logging;
pub mod notify;
pub mod pause;
pub mod program;
pub mod run;
pub mod util;

pub use error::{BoxError, CrashId, Location, ResultExt, RunError, WrappedError};
pub use logging::{
    delete_empty_log_file, setup_log, ActiveSink, CleanupError, LogConfig, LogFormat, LogSession,
    SetupError,
};
pub use notify::{email, Account, MailError, RecordingAccount, SendmailAccount, SentMail};
pub use pause::{pause_exit, pause_exit_with};
pub use program::program_name;
pub use run::{default_setup, Runner};
