//! Failure notification by email.
//!
//! Delivery goes through an [`Account`]. [`SendmailAccount`] hands the message
//! to a local `sendmail`-compatible binary; [`RecordingAccount`] keeps it in
//! memory.

use std::error::Error as StdError;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use thiserror::Error;

use crate::logging::LOG_TARGET;
use crate::program;

pub const SUBJECT_PREFIX: &str = "Program Error - ";
pub const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("no recipients to deliver to")]
    NoRecipients,
    #[error("start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write message to {}: {source}", program.display())]
    Write {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} exited with {status}", program.display())]
    Status { program: PathBuf, status: ExitStatus },
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Something that can deliver one email.
pub trait Account {
    fn send(&self, subject: &str, body: &str, to: &[String]) -> Result<(), MailError>;
}

impl<A: Account + ?Sized> Account for &A {
    fn send(&self, subject: &str, body: &str, to: &[String]) -> Result<(), MailError> {
        (**self).send(subject, body, to)
    }
}

impl<A: Account + ?Sized> Account for Box<A> {
    fn send(&self, subject: &str, body: &str, to: &[String]) -> Result<(), MailError> {
        (**self).send(subject, body, to)
    }
}

pub fn subject(program_name: &str) -> String {
    format!("{SUBJECT_PREFIX}{program_name}")
}

pub fn body(err: &dyn StdError) -> String {
    format!("{err}\n")
}

/// Logs `err` and emails it through `account`.
///
/// An empty `to` is passed through as-is; whether that reaches anyone is up
/// to the account. The delivery result is returned unchanged.
pub fn email(err: &dyn StdError, account: &dyn Account, to: &[String]) -> Result<(), MailError> {
    let name = program::program_name()
        .unwrap_or_else(|e| format!("couldn't get program name: {e}"));

    tracing::error!(target: LOG_TARGET, event = "error_reported", recipients = to.len(), "{err}");

    account.send(&subject(&name), &body(err), to)
}

/// Delivers through a `sendmail`-compatible binary (`sendmail -i -- <rcpt>...`).
#[derive(Debug, Clone)]
pub struct SendmailAccount {
    program: PathBuf,
    from: Option<String>,
    default_to: Vec<String>,
}

impl Default for SendmailAccount {
    fn default() -> Self {
        SendmailAccount {
            program: PathBuf::from(DEFAULT_SENDMAIL),
            from: None,
            default_to: Vec::new(),
        }
    }
}

impl SendmailAccount {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        SendmailAccount {
            program: program.into(),
            ..SendmailAccount::default()
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Recipients used when a notification names none.
    pub fn with_default_recipients<I, S>(mut self, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_to = to.into_iter().map(Into::into).collect();
        self
    }

    fn message(&self, subject: &str, body: &str, to: &[String]) -> String {
        let mut message = String::new();
        if let Some(from) = &self.from {
            message.push_str(&format!("From: {}\r\n", header_value(from)));
        }
        message.push_str(&format!("To: {}\r\n", header_value(&to.join(", "))));
        message.push_str(&format!("Subject: {}\r\n", header_value(subject)));
        message.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        message.push_str(body);
        message
    }
}

/// Folds a header value onto one line and encodes non-ASCII text as an
/// RFC 2047 encoded word.
fn header_value(value: &str) -> String {
    let line: String = value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    if line.is_ascii() {
        line
    } else {
        format!("=?utf-8?B?{}?=", STANDARD.encode(line.as_bytes()))
    }
}

impl Account for SendmailAccount {
    fn send(&self, subject: &str, body: &str, to: &[String]) -> Result<(), MailError> {
        let to = if to.is_empty() { &self.default_to[..] } else { to };
        if to.is_empty() {
            return Err(MailError::NoRecipients);
        }

        let mut child = Command::new(&self.program)
            .arg("-i")
            .arg("--")
            .args(to)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| MailError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let message = self.message(subject, body, to);
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(message.as_bytes()),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin not captured")),
        };

        let status = child.wait().map_err(|source| MailError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        written.map_err(|source| MailError::Write {
            program: self.program.clone(),
            source,
        })?;

        if status.success() {
            tracing::debug!(target: LOG_TARGET, event = "mail_sent", recipients = to.len());
            Ok(())
        } else {
            Err(MailError::Status {
                program: self.program.clone(),
                status,
            })
        }
    }
}

/// One message captured by [`RecordingAccount`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMail {
    pub subject: String,
    pub body: String,
    pub to: Vec<String>,
}

/// Keeps every message in memory instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordingAccount {
    sent: Mutex<Vec<SentMail>>,
    failure: Option<String>,
}

impl RecordingAccount {
    pub fn new() -> Self {
        RecordingAccount::default()
    }

    /// Records messages but reports every delivery as failed with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        RecordingAccount {
            sent: Mutex::default(),
            failure: Some(reason.into()),
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Account for RecordingAccount {
    fn send(&self, subject: &str, body: &str, to: &[String]) -> Result<(), MailError> {
        let mail = SentMail {
            subject: subject.to_string(),
            body: body.to_string(),
            to: to.to_vec(),
        };
        match self.sent.lock() {
            Ok(mut sent) => sent.push(mail),
            Err(poisoned) => poisoned.into_inner().push(mail),
        }
        match &self.failure {
            Some(reason) => Err(MailError::Delivery(reason.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_and_body_format() {
        assert_eq!(subject("sync"), "Program Error - sync");
        let err = io::Error::new(io::ErrorKind::Other, "disk full");
        assert_eq!(body(&err), "disk full\n");
    }

    #[test]
    fn sendmail_message_headers() {
        let account = SendmailAccount::default().with_from("robot@example.com");
        let message = account.message("Program Error - x", "boom\n", &["a@example.com".into()]);
        assert!(message.starts_with("From: robot@example.com\r\nTo: a@example.com\r\n"));
        assert!(message.contains("Subject: Program Error - x\r\n"));
        assert!(message.ends_with("\r\n\r\nboom\n"));
    }

    #[test]
    fn header_values_stay_on_one_line() {
        let account = SendmailAccount::default();
        let message = account.message("Program Error - x\r\nBcc: evil@example.com", "b", &[]);
        assert!(message.contains("Subject: Program Error - x  Bcc: evil@example.com\r\n"));
        assert!(!message.contains("\r\nBcc:"));
    }

    #[test]
    fn non_ascii_subject_is_encoded() {
        let account = SendmailAccount::default();
        let message = account.message("Program Error - zähler", "b", &[]);
        let encoded = STANDARD.encode("Program Error - zähler");
        assert!(message.contains(&format!("Subject: =?utf-8?B?{encoded}?=\r\n")));
        assert!(message.is_ascii());
    }

    #[test]
    fn sendmail_without_any_recipient_fails() {
        let account = SendmailAccount::new("/nonexistent/sendmail");
        let err = account.send("s", "b", &[]).unwrap_err();
        assert!(matches!(err, MailError::NoRecipients));
    }

    #[test]
    fn sendmail_missing_binary_is_spawn_error() {
        let account = SendmailAccount::new("/nonexistent/sendmail")
            .with_default_recipients(["ops@example.com"]);
        let err = account.send("s", "b", &[]).unwrap_err();
        assert!(matches!(err, MailError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn sendmail_nonzero_exit_is_reported() {
        let account = SendmailAccount::new("false");
        let err = account
            .send("s", "b", &["ops@example.com".to_string()])
            .unwrap_err();
        assert!(matches!(err, MailError::Status { .. } | MailError::Write { .. }));
    }

    #[test]
    fn recording_account_keeps_messages() {
        let account = RecordingAccount::new();
        account.send("one", "body\n", &[]).unwrap();
        let sent = account.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "one");
        assert!(sent[0].to.is_empty());
    }
}
