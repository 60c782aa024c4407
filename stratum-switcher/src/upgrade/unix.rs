//! File-descriptor inheritance and exec.

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::execv;
use std::ffi::{CString, OsString};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, Signal, SignalKind};

use super::{runtime_path, upgrade_args, HandoffFailed, RuntimeData};
use crate::error::{Error, Result};
use crate::session::DetachedSession;
use crate::tracing::prelude::*;
use crate::watch::WatchStore;

/// SIGUSR2, the upgrade trigger.
pub struct UpgradeSignal(Signal);

impl UpgradeSignal {
    pub fn new() -> Result<Self> {
        Ok(Self(signal(SignalKind::user_defined2())?))
    }

    pub async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

fn set_inheritable(fd: RawFd, inheritable: bool) -> Result<()> {
    let errno = |e: nix::errno::Errno| Error::Upgrade(format!("fcntl on fd {}: {}", fd, e));
    let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).map_err(errno)?);
    flags.set(FdFlag::FD_CLOEXEC, !inheritable);
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(errno)?;
    Ok(())
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|e| Error::Upgrade(e.to_string()))
}

/// Replace this process with the current executable. Only returns on
/// failure.
fn exec(args: Vec<OsString>) -> Error {
    let program = match std::env::current_exe() {
        Ok(program) => program,
        Err(e) => return Error::Upgrade(format!("locating executable: {}", e)),
    };

    let argv: Result<Vec<CString>> = args.iter().map(|a| cstring(a.as_bytes())).collect();
    let (program, argv) = match (cstring(program.as_os_str().as_bytes()), argv) {
        (Ok(program), Ok(argv)) => (program, argv),
        (Err(e), _) | (_, Err(e)) => return e,
    };

    info!(program = ?program, args = ?argv, "Executing new binary.");
    match execv(&program, &argv) {
        Ok(never) => match never {},
        Err(e) => Error::Upgrade(format!("exec: {}", e)),
    }
}

/// Hand the listener and `sessions` to a fresh copy of this executable.
///
/// The store session is closed just before exec, so that the ephemeral
/// nodes of this process are gone by the time the new one starts.
///
/// Only returns if the hand-off failed, in which case every descriptor is
/// close-on-exec again and the caller still owns the sockets.
pub async fn handoff(
    listener: &TcpListener,
    sessions: &mut [DetachedSession],
    server_id: u8,
    store: &dyn WatchStore,
) -> HandoffFailed {
    let mut runtime = RuntimeData::new(server_id);
    let listener_fd = listener.as_raw_fd();
    runtime.listener_fd = Some(listener_fd);

    let mut fds = vec![listener_fd];
    for session in sessions.iter_mut() {
        session.snapshot.client_fd = session.client.as_raw_fd();
        session.snapshot.server_fd = session.server.as_raw_fd();
        fds.push(session.snapshot.client_fd);
        fds.push(session.snapshot.server_fd);
        runtime.sessions.push(session.snapshot.clone());
    }

    let prepare = || -> Result<std::path::PathBuf> {
        for fd in &fds {
            set_inheritable(*fd, true)?;
        }
        let path = runtime_path();
        runtime.save_to(&path)?;
        info!(path = %path.display(), sessions = runtime.sessions.len(), "Saved runtime data.");
        Ok(path)
    };

    let failed = match prepare() {
        Ok(path) => {
            if let Err(e) = store.close().await {
                warn!(error = %e, "Closing the store session failed; upgrading anyway.");
            }
            HandoffFailed::Exec(exec(upgrade_args(std::env::args_os(), &path)))
        }
        Err(e) => HandoffFailed::Prepare(e),
    };

    for fd in fds {
        let _ = set_inheritable(fd, false);
    }
    failed
}

fn adopt_fd(fd: i32) -> Result<RawFd> {
    if fd < 0 {
        return Err(Error::Upgrade(format!("invalid fd {}", fd)));
    }
    set_inheritable(fd, false)?;
    Ok(fd)
}

/// Take ownership of an inherited listening socket.
pub fn adopt_listener(fd: i32) -> Result<std::net::TcpListener> {
    let fd = adopt_fd(fd)?;
    // SAFETY: the descriptor was inherited across exec for exactly this use
    // and nothing else in this process owns it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.local_addr()?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Take ownership of an inherited connected socket.
pub fn adopt_stream(fd: i32) -> Result<std::net::TcpStream> {
    let fd = adopt_fd(fd)?;
    // SAFETY: as for `adopt_listener`.
    let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
    stream.peer_addr()?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
