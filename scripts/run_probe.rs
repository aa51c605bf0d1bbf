use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use runwrap::{Account, LogConfig, LogFormat, MailError, Runner, SentMail};

#[derive(Debug, Parser)]
#[command(name = "run_probe", about = "Run canned program behaviours through the runner")]
struct Cli {
    /// Behaviour of the program logic.
    #[arg(long, value_enum, default_value_t = Mode::Ok)]
    mode: Mode,

    /// Directory used instead of the executable's directory for `.logs/`.
    #[arg(long, value_name = "PATH")]
    log_root: Option<PathBuf>,

    /// Append each outgoing mail as a JSON line to this file.
    #[arg(long, value_name = "PATH")]
    outbox: Option<PathBuf>,

    #[arg(long = "to", value_name = "ADDR")]
    to: Vec<String>,

    /// Write JSON log lines instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Succeed without logging anything.
    Ok,
    /// Succeed after one `tracing` record.
    Log,
    /// Succeed after one `log` crate record.
    LogCrate,
    /// Fail with a wrapped error.
    Fail,
    Panic,
}

struct OutboxAccount {
    path: Option<PathBuf>,
}

impl OutboxAccount {
    fn append(&self, mail: &SentMail) -> io::Result<()> {
        let line = serde_json::to_string(mail)?;
        match &self.path {
            Some(path) => {
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(file, "{line}")
            }
            None => writeln!(io::stderr(), "{line}"),
        }
    }
}

impl Account for OutboxAccount {
    fn send(&self, subject: &str, body: &str, to: &[String]) -> Result<(), MailError> {
        let mail = SentMail {
            subject: subject.to_string(),
            body: body.to_string(),
            to: to.to_vec(),
        };
        self.append(&mail)
            .map_err(|err| MailError::Delivery(err.to_string()))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = LogConfig::default();
    if let Some(root) = cli.log_root {
        config = config.with_root(root);
    }
    if cli.json {
        config = config.with_format(LogFormat::Json);
    }

    let account = OutboxAccount { path: cli.outbox };
    let runner = Runner::new(&account).recipients(cli.to).log_config(config);
    let mode = cli.mode;
    let result = runner.run(|| probe(mode));
    runwrap::run::exit_code(&result)
}

fn probe(mode: Mode) -> anyhow::Result<()> {
    match mode {
        Mode::Ok => Ok(()),
        Mode::Log => {
            tracing::info!(event = "probe", "probe marker");
            Ok(())
        }
        Mode::LogCrate => {
            log::info!("probe marker via log");
            Ok(())
        }
        Mode::Fail => {
            let cause = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
            Err(runwrap::wrap_err!(cause, "connecting", "timeout").into())
        }
        Mode::Panic => panic!("probe panic"),
    }
}
