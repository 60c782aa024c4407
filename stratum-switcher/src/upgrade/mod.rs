//! Live upgrade hand-off.
//!
//! On upgrade the running process detaches every proxied session, marks the
//! listener and session sockets inheritable, writes a [`RuntimeData`] sidecar
//! and execs the new binary with `--runtime=<sidecar>`. The new process
//! reads the sidecar, adopts the inherited sockets and replays each
//! session's handshake through the normal code path.

#[cfg(unix)]
mod unix;
#[cfg(not(unix))]
mod unsupported;

#[cfg(unix)]
pub(crate) use unix::*;
#[cfg(not(unix))]
pub(crate) use unsupported::*;

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::session::SessionSnapshot;

/// Command-line flag naming the sidecar in the replacement process.
pub const RUNTIME_FLAG: &str = "--runtime";

/// Sidecar file written next to the working directory.
pub const RUNTIME_FILE: &str = "runtime.json";

pub const UPGRADE_ACTION: &str = "upgrade";

/// How a live upgrade that returned went wrong.
#[derive(Debug)]
pub enum HandoffFailed {
    /// Nothing was handed over and the store session is untouched.
    Prepare(Error),
    /// The store session was closed, then exec failed.
    Exec(Error),
}

/// Everything the replacement process needs to take over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeData {
    #[serde(rename = "Action")]
    pub action: String,

    #[serde(rename = "ServerID")]
    pub server_id: u8,

    #[serde(rename = "TCPListenerFD", default)]
    pub listener_fd: Option<i32>,

    #[serde(rename = "SessionDatas", default)]
    pub sessions: Vec<SessionSnapshot>,
}

impl RuntimeData {
    pub fn new(server_id: u8) -> Self {
        Self {
            action: UPGRADE_ACTION.to_string(),
            server_id,
            listener_fd: None,
            sessions: Vec::new(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Upgrade(format!("reading {}: {}", path.display(), e)))?;
        let data: Self = serde_json::from_str(&json)?;
        if data.action != UPGRADE_ACTION {
            return Err(Error::Upgrade(format!("unknown action {:?}", data.action)));
        }
        Ok(data)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::Upgrade(format!("writing {}: {}", path.display(), e)))
    }
}

/// Arguments for the replacement process: the current ones minus any
/// previous runtime flag, plus one pointing at `runtime`.
pub fn upgrade_args<I>(args: I, runtime: &Path) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut kept = Vec::new();
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        let text = arg.to_string_lossy();
        if text == RUNTIME_FLAG {
            skip_value = true;
            continue;
        }
        if text.starts_with(&format!("{}=", RUNTIME_FLAG)) {
            continue;
        }
        kept.push(arg);
    }

    let mut flag = OsString::from(format!("{}=", RUNTIME_FLAG));
    flag.push(runtime.as_os_str());
    kept.push(flag);
    kept
}

/// Where the sidecar goes.
pub fn runtime_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(RUNTIME_FILE)
}
