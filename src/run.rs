//! Top-level runner: log session, panic fence, failure email, log cleanup.

use std::process::ExitCode;

use crate::error::{install_panic_hook, BoxError, RunError};
use crate::logging::{delete_empty_log_file, LogConfig, LogSession, LOG_TARGET};
use crate::notify::{email, Account};
use crate::util::dispatch_with_fence;

/// Runs program logic with logging and failure notification.
pub struct Runner<'a> {
    account: &'a dyn Account,
    recipients: Vec<String>,
    config: LogConfig,
}

impl<'a> Runner<'a> {
    pub fn new(account: &'a dyn Account) -> Self {
        Runner {
            account,
            recipients: Vec::new(),
            config: LogConfig::default(),
        }
    }

    /// Recipients for failures of the program logic. Setup failures are
    /// always sent without recipients, leaving delivery to the account.
    pub fn recipients<I, S>(mut self, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = to.into_iter().map(Into::into).collect();
        self
    }

    pub fn log_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Opens the log session, runs `f` with the session as the active sink,
    /// reports any failure by email and then closes the log, removing it if
    /// nothing was written.
    ///
    /// The session receives records from the calling thread and, unless
    /// another run or a foreign global subscriber holds it, from every other
    /// thread as well.
    ///
    /// Returns the failure that decides the exit status: a fatal cleanup
    /// error if there was one, otherwise the failure of `f`.
    pub fn run<F, E>(&self, f: F) -> Result<(), RunError>
    where
        F: FnOnce() -> Result<(), E>,
        E: Into<BoxError>,
    {
        let session = match self.config.open() {
            Ok(session) => session,
            Err(err) => {
                let err = RunError::Setup(err);
                self.notify(&err, &[]);
                return Err(err);
            }
        };

        let dispatch = session.dispatch();
        let active = session.activate();
        let primary = tracing::dispatcher::with_default(&dispatch, || {
            install_panic_hook();

            let failure = match dispatch_with_fence(f) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(RunError::Operation(err.into())),
                Err(panic) => Some(panic),
            };
            if let Some(err) = &failure {
                self.notify(err, &self.recipients);
            }
            failure
        });
        drop(active);
        drop(dispatch);

        let fatal = self.cleanup(session);
        match (fatal, primary) {
            (Some(fatal), _) => Err(fatal),
            (None, Some(primary)) => Err(primary),
            (None, None) => Ok(()),
        }
    }

    /// Closes the session and removes an empty log. Non-fatal failures are
    /// emailed here; a fatal one is returned.
    fn cleanup(&self, session: LogSession) -> Option<RunError> {
        let path = session.path().to_path_buf();

        match dispatch_with_fence(|| session.close()) {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => self.notify(&RunError::Cleanup(err), &self.recipients),
            Err(panic) => self.notify(&panic, &self.recipients),
        }

        match dispatch_with_fence(|| delete_empty_log_file(&path)) {
            Ok(Ok(_)) => None,
            Ok(Err(err)) if err.is_fatal() => {
                let err = RunError::Cleanup(err);
                err.log_with_event("log_state_unknown");
                Some(err)
            }
            Ok(Err(err)) => {
                self.notify(&RunError::Cleanup(err), &self.recipients);
                None
            }
            Err(panic) => {
                self.notify(&panic, &self.recipients);
                None
            }
        }
    }

    /// Emails `err`. A failing or panicking account is logged, never raised.
    fn notify(&self, err: &RunError, to: &[String]) {
        let error = match dispatch_with_fence(|| email(err, self.account, to)) {
            Ok(Ok(())) => return,
            Ok(Err(mail_err)) => mail_err.to_string(),
            Err(panic) => panic.to_string(),
        };
        tracing::warn!(
            target: LOG_TARGET,
            event = "notification_failed",
            error = %error,
            "could not email failure report"
        );
    }
}

/// Runs `f` with the default log layout and no explicit recipients, and
/// converts the outcome into a process exit status.
pub fn default_setup<F, E>(account: &dyn Account, f: F) -> ExitCode
where
    F: FnOnce() -> Result<(), E>,
    E: Into<BoxError>,
{
    exit_code(&Runner::new(account).run(f))
}

pub fn exit_code(result: &Result<(), RunError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => ExitCode::from(err.exit_code()),
    }
}
