use std::io;
use std::path::{Path, PathBuf};

use crate::logging::LOG_TARGET;

pub fn executable_path() -> io::Result<PathBuf> {
    std::env::current_exe()
}

/// File name of the running executable, without its directory.
pub fn program_name() -> io::Result<String> {
    match executable_path().and_then(|path| program_name_from(&path)) {
        Ok(name) => Ok(name),
        Err(err) => {
            tracing::error!(target: LOG_TARGET, event = "program_name_unavailable", error = %err);
            Err(err)
        }
    }
}

pub fn program_name_from(path: &Path) -> io::Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("executable path has no file name: {}", path.display()),
            )
        })
}
