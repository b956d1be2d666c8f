//! Listening sockets for the server under test.

use boxcat_core::error::{BoxcatError, Result};
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};

/// Descriptor number the child sees the inherited listener on.
pub const INHERITED_FD: RawFd = 3;

const LOOPBACK: &str = "127.0.0.1:0";

/// A bound listener whose descriptor is handed to the child process.
pub struct InheritedListener {
    listener: TcpListener,
    port: u16,
}

impl InheritedListener {
    pub fn bind() -> Result<Self> {
        let listener = TcpListener::bind(LOOPBACK)
            .map_err(|e| BoxcatError::Launch(format!("error opening a random port: {e}")))?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// Find a free port by binding and immediately releasing it.
///
/// Another process may take the port before the server binds it; callers
/// retry the launch when that happens.
pub fn ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind(LOOPBACK)
        .map_err(|e| BoxcatError::Launch(format!("error opening a random port: {e}")))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Runs in the forked child before exec: place `fd` at [`INHERITED_FD`]
/// without close-on-exec.
pub(crate) fn inherit_listener(fd: RawFd) -> std::io::Result<()> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    if fd == INHERITED_FD {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        // dup2 leaves the new descriptor without FD_CLOEXEC
        nix::unistd::dup2(fd, INHERITED_FD)?;
    }
    Ok(())
}
