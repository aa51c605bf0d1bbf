#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::error::Error as _;
use std::io;

use runwrap::{wrap_err, ResultExt, WrappedError};

#[derive(Debug, PartialEq, Eq)]
struct BaseError(u32);

impl std::fmt::Display for BaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "base error {}", self.0)
    }
}

impl std::error::Error for BaseError {}

#[test]
fn unwrapping_once_yields_the_original() {
    let wrapped = wrap_err!(BaseError(7));
    let source = wrapped.source().expect("wrapped error has a source");
    assert_eq!(source.downcast_ref::<BaseError>(), Some(&BaseError(7)));
    assert!(source.source().is_none());

    let inner = wrapped.into_inner();
    assert_eq!(inner.downcast_ref::<BaseError>(), Some(&BaseError(7)));
}

#[test]
fn context_lines_keep_their_order() {
    let line = line!() + 1;
    let wrapped = wrap_err!(BaseError(1), "a", "b");
    let expected = format!("[{}][{}]:\n\ta\n\tb\n\tbase error 1", file!(), line);
    assert_eq!(wrapped.to_string(), expected);
}

#[test]
fn no_context_omits_the_segment() {
    let line = line!() + 1;
    let wrapped = wrap_err!(BaseError(2));
    assert_eq!(
        wrapped.to_string(),
        format!("[{}][{}]:\n\tbase error 2", file!(), line)
    );
}

#[test]
fn nested_wraps_chain_back_to_the_root() {
    let inner = wrap_err!(io::Error::new(io::ErrorKind::TimedOut, "timed out"), "dial");
    let outer = wrap_err!(inner, "sync");

    let first = outer.source().unwrap();
    assert!(first.downcast_ref::<WrappedError>().is_some());
    let root = first.source().unwrap();
    assert_eq!(
        root.downcast_ref::<io::Error>().map(io::Error::kind),
        Some(io::ErrorKind::TimedOut)
    );
    assert!(outer.to_string().contains("\n\tsync\n\t["));
    assert!(outer.to_string().ends_with("\n\tdial\n\ttimed out"));
}

fn read_settings() -> Result<String, WrappedError> {
    let result: Result<String, io::Error> =
        Err(io::Error::new(io::ErrorKind::NotFound, "settings.toml"));
    result.wrap_err_with(["loading settings"])
}

#[test]
fn result_ext_records_the_calling_line() {
    let err = read_settings().unwrap_err();
    assert_eq!(err.location().file(), file!());
    assert_eq!(err.context(), ["loading settings"]);
    assert!(err.to_string().ends_with("\n\tloading settings\n\tsettings.toml"));
}

#[test]
fn anyhow_errors_can_be_wrapped() {
    let err = anyhow::anyhow!("upstream failed");
    let wrapped = wrap_err!(err, "fetching");
    assert!(wrapped.to_string().ends_with("\n\tfetching\n\tupstream failed"));
}
