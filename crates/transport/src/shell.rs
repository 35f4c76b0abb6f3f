//! Remote-shell tunnel backend.
//!
//! The association is not a socket: the client side spawns a remote-shell
//! command (an external secure-shell client by default) that runs this same
//! daemon as a sub-daemon on the remote host, and the two ends exchange the
//! multiplexed channel framing over the subprocess pipe pair. The inbound
//! side therefore serves directly over its own inherited stdin/stdout.
//!
//! Unlike the TCP backend, this one does not want the end-of-transaction
//! marker on the packet channel; the asymmetry is a fixed per-backend policy.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::process::{Command, Stdio};

use tracing::info;

use crate::mux::{ChildEndpoint, MuxConnection, MuxEndpoint};
use crate::{Accepted, Connection, DriverError, Listener};

/// Remote-shell invocation settings.
#[derive(Clone, Debug)]
pub struct ShellConfig {
    /// The local tunnel command, `ssh` unless configured otherwise.
    pub command: String,
    /// Remote account to log in as, when not the invoking user.
    pub remote_user: Option<String>,
    /// Program to execute on the remote host.
    pub remote_program: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: "ssh".to_owned(),
            remote_user: None,
            remote_program: "arkd".to_owned(),
        }
    }
}

/// Opens an outbound tunnel association to `host`.
///
/// Spawns the configured shell command with forwarding disabled and batch
/// mode on, running the remote daemon in tunnel mode. The subprocess pipe
/// pair becomes the association; tearing the connection down reclaims the
/// child.
pub fn connect(host: &str, config: &ShellConfig) -> Result<Box<dyn Connection>, DriverError> {
    let mut command = Command::new(&config.command);
    command
        .arg("-x")
        .arg("-o")
        .arg("BatchMode=yes");
    if let Some(user) = config.remote_user.as_deref() {
        command.arg("-l").arg(user);
    }
    command
        .arg(host)
        .arg(&config.remote_program)
        .arg("--auth")
        .arg("shell")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let child = command.spawn().map_err(|source| DriverError::Spawn {
        command: config.command.clone(),
        source,
    })?;
    info!(host, command = %config.command, "spawned remote-shell tunnel");

    let endpoint = ChildEndpoint::new(child)?;
    let peer = match config.remote_user.as_deref() {
        Some(user) => format!("{user}@{host}"),
        None => host.to_owned(),
    };

    Ok(Box::new(MuxConnection::outbound(
        MuxEndpoint::Child(endpoint),
        peer,
        config.remote_user.clone(),
        false,
    )))
}

/// Inbound side of the tunnel: the daemon was started by a remote-shell
/// session and serves one association over its inherited stdio.
pub struct StdioListener {
    expected_user: Option<String>,
    accepted: bool,
}

impl StdioListener {
    /// Creates the listener; `expected_user` is the identity the tunnel
    /// authenticated, used to cross-check any `SECURITY USER` claim.
    #[must_use]
    pub fn new(expected_user: Option<String>) -> Self {
        Self {
            expected_user,
            accepted: false,
        }
    }
}

impl Listener for StdioListener {
    fn open(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn fd(&self) -> RawFd {
        libc::STDIN_FILENO
    }

    fn accept(&mut self) -> Result<Option<Accepted>, DriverError> {
        if self.accepted {
            // One association per tunnel invocation; readiness after the
            // transaction means the remote side hung up.
            return Ok(None);
        }
        self.accepted = true;

        let input = dup_fd(libc::STDIN_FILENO)?;
        let output = dup_fd(libc::STDOUT_FILENO)?;
        let connection =
            MuxConnection::inbound_stdio(input, output, self.expected_user.clone());

        Ok(Some(Accepted {
            connection: Box::new(connection),
            initial: Vec::new(),
        }))
    }

    fn single_shot(&self) -> bool {
        true
    }
}

/// Duplicates `fd` into an owned [`File`] so the connection can close its
/// copy without disturbing the process-level descriptor.
fn dup_fd(fd: RawFd) -> io::Result<File> {
    // SAFETY: `dup` returns a fresh descriptor we immediately take unique
    // ownership of; the original remains owned by the process.
    let duped = unsafe { libc::dup(fd) };
    if duped < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `duped` is a valid descriptor owned by no other object.
    Ok(unsafe { File::from_raw_fd(duped) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_ssh_in_batch_mode() {
        let config = ShellConfig::default();
        assert_eq!(config.command, "ssh");
        assert_eq!(config.remote_program, "arkd");
        assert!(config.remote_user.is_none());
    }

    #[test]
    fn stdio_listener_accepts_exactly_once() {
        let mut listener = StdioListener::new(Some("backup".to_owned()));
        listener.open().expect("open");
        assert_eq!(listener.fd(), libc::STDIN_FILENO);

        let first = listener.accept().expect("accept");
        assert!(first.is_some());
        let second = listener.accept().expect("accept again");
        assert!(second.is_none());
    }

    #[test]
    fn connect_failure_reports_the_command() {
        let config = ShellConfig {
            command: "/nonexistent/shell-client".to_owned(),
            ..ShellConfig::default()
        };
        let err = connect("backup.example.org", &config).unwrap_err();
        match err {
            DriverError::Spawn { command, .. } => {
                assert_eq!(command, "/nonexistent/shell-client");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
