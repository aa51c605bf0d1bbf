use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// Time-ordered id shared by a panic's log records and its failure email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CrashId(Uuid);

impl CrashId {
    pub(crate) fn new() -> Self {
        CrashId(Uuid::now_v7())
    }
}

impl fmt::Display for CrashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
