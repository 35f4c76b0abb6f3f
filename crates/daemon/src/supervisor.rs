//! Subprocess supervision.
//!
//! Services run as child processes wired up before spawn: stdin carries the
//! request argument blob, stdout is the reply pipe, stderr feeds the daemon
//! log, and the auxiliary data channels occupy a contiguous reserved
//! descriptor range the remote dumper programs expect. All descriptor
//! renumbering happens in one `pre_exec` block — the only place such
//! plumbing is allowed to live.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::TxnError;

/// Number of auxiliary data channels every service is wired with.
pub const CHANNEL_COUNT: usize = 3;

/// Channel names, in descriptor order.
pub const CHANNEL_NAMES: [&str; CHANNEL_COUNT] = ["DATA", "MESG", "INDEX"];

/// Index of the reserved primary data channel.
pub const PRIMARY_DATA_CHANNEL: usize = 0;

/// Index of the control/message channel the sentinel is scanned on.
pub const CONTROL_CHANNEL: usize = 1;

/// First descriptor of the reserved range in the child: channel `i` reads
/// from `AUX_FD_BASE + 2*i` and writes to `AUX_FD_BASE + 2*i + 1`.
pub const AUX_FD_BASE: RawFd = 50;

/// Environment variable carrying the authenticated peer identity into the
/// service.
pub const PEER_NAME_ENV: &str = "ARKD_PEER_NAME";

/// How long a terminated child is given to exit before the supervisor gives
/// up and merely logs it.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const TERMINATE_POLL: Duration = Duration::from_millis(100);

/// Parent-side ends of one auxiliary channel.
#[derive(Debug)]
pub struct AuxPipes {
    /// Read side: what the child writes on its odd descriptor.
    pub from_child: Option<File>,
    /// Write side: what the child reads on its even descriptor.
    pub to_child: Option<File>,
}

/// A launched service subprocess and its parent-side pipe ends.
#[derive(Debug)]
pub struct ServiceProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    aux: Vec<AuxPipes>,
}

impl ServiceProcess {
    /// Process id of the child.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Writes the request argument blob to the child's stdin and closes it,
    /// signalling end of arguments.
    ///
    /// The blob is bounded by the packet size limit, well under the pipe
    /// buffer, so the write cannot stall on an idle child.
    pub fn write_request(&mut self, blob: &str) -> io::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.write_all(blob.as_bytes())?;
            stdin.flush()?;
        }
        Ok(())
    }

    /// Descriptor of the reply pipe (child stdout).
    #[must_use]
    pub fn stdout_fd(&self) -> RawFd {
        self.stdout.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// Descriptor of the child's stderr.
    #[must_use]
    pub fn stderr_fd(&self) -> RawFd {
        self.stderr.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    /// Reads one chunk from the reply pipe. Zero means EOF.
    pub fn read_reply_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }

    /// Reads one chunk from the child's stderr. Zero means EOF.
    pub fn read_stderr_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stderr.as_mut() {
            Some(stderr) => stderr.read(buf),
            None => Ok(0),
        }
    }

    /// Drops the stderr handle once it has reached EOF.
    pub fn close_stderr(&mut self) {
        self.stderr = None;
    }

    /// Moves the parent-side pipe ends of channel `index` out of the
    /// process, leaving an empty pair behind.
    pub fn take_aux(&mut self, index: usize) -> AuxPipes {
        let slot = &mut self.aux[index];
        AuxPipes {
            from_child: slot.from_child.take(),
            to_child: slot.to_child.take(),
        }
    }

    /// Best-effort drain of whatever the child has written to stderr,
    /// feeding complete output to `sink`. Never blocks.
    pub fn drain_stderr<F: FnMut(&str)>(&mut self, mut sink: F) {
        let Some(stderr) = self.stderr.as_mut() else {
            return;
        };
        let fd = stderr.as_raw_fd();
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        while readable_now(fd) {
            match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        if !collected.is_empty() {
            for line in String::from_utf8_lossy(&collected).lines() {
                sink(line);
            }
        }
    }
}

/// Launch guard enforcing the single-active-transaction invariant and
/// owning the soft-teardown policy.
#[derive(Debug, Default)]
pub struct Supervisor {
    active: Option<Pid>,
}

impl Supervisor {
    /// Creates an idle supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a service subprocess is currently registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Spawns `path` with the full channel wiring and a minimal environment
    /// carrying the authenticated `peer_name`.
    pub fn launch(&mut self, path: &Path, peer_name: &str) -> Result<ServiceProcess, TxnError> {
        if self.active.is_some() {
            return Err(TxnError::Busy);
        }

        let mut wiring = ChannelWiring::create().map_err(|source| TxnError::Launch { source })?;
        let child_fds = wiring.child_fd_array();

        let mut command = Command::new(path);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .env(PEER_NAME_ENV, peer_name);
        for key in ["PATH", "TZ"] {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        // SAFETY: the pre_exec block runs in the forked child before exec
        // and only calls async-signal-safe descriptor syscalls; the fd array
        // is captured by value so nothing allocates after the fork.
        unsafe {
            command.pre_exec(move || remap_child_descriptors(child_fds));
        }

        let mut child = command
            .spawn()
            .map_err(|source| TxnError::Launch { source })?;
        wiring.close_child_ends();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let process = ServiceProcess {
            child,
            stdin,
            stdout,
            stderr,
            aux: wiring.into_parent_ends(),
        };

        debug!(pid = process.pid(), path = %path.display(), "service launched");
        self.active = Some(Pid::from_raw(process.pid() as libc::pid_t));
        Ok(process)
    }

    /// Reclaims a finished transaction's subprocess.
    ///
    /// Drains stderr best-effort, then waits without blocking; a child that
    /// is still running gets a graceful terminate signal and a bounded
    /// grace period. A child that outlives the grace period is logged and
    /// left alone rather than hard-killed.
    pub fn release(&mut self, mut process: ServiceProcess) -> Option<TxnError> {
        self.active = None;
        let pid = process.pid();
        process.drain_stderr(|line| warn!(pid, line, "service stderr"));

        match process.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = process.pid(), %status, "service exited");
                if status.success() {
                    None
                } else {
                    Some(TxnError::AbnormalExit {
                        status: status.to_string(),
                    })
                }
            }
            Ok(None) => {
                let pid = Pid::from_raw(process.pid() as libc::pid_t);
                debug!(%pid, "service still running at teardown, sending SIGTERM");
                let _ = kill(pid, Signal::SIGTERM);

                let deadline = Instant::now() + TERMINATE_GRACE;
                while Instant::now() < deadline {
                    std::thread::sleep(TERMINATE_POLL);
                    match process.child.try_wait() {
                        Ok(Some(status)) => {
                            debug!(pid = process.pid(), %status, "service exited after SIGTERM");
                            return None;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(pid = process.pid(), %err, "wait failed during teardown");
                            return None;
                        }
                    }
                }
                warn!(
                    pid = process.pid(),
                    "service ignored SIGTERM; leaving it to finish on its own"
                );
                None
            }
            Err(err) => {
                warn!(pid = process.pid(), %err, "wait failed during teardown");
                None
            }
        }
    }
}

/// The 2·N auxiliary pipe pairs created before spawning.
struct ChannelWiring {
    /// Child-side ends, in target-descriptor order.
    child_ends: Vec<OwnedFd>,
    /// Parent-side ends, per channel.
    parent_ends: Vec<AuxPipes>,
}

impl ChannelWiring {
    fn create() -> io::Result<Self> {
        let mut child_ends = Vec::with_capacity(CHANNEL_COUNT * 2);
        let mut parent_ends = Vec::with_capacity(CHANNEL_COUNT);

        for _ in 0..CHANNEL_COUNT {
            // Channel read direction: parent writes, child reads on the
            // even descriptor.
            let (child_read, parent_write) = pipe_cloexec()?;
            // Channel write direction: child writes on the odd descriptor,
            // parent reads.
            let (parent_read, child_write) = pipe_cloexec()?;

            child_ends.push(child_read);
            child_ends.push(child_write);
            parent_ends.push(AuxPipes {
                from_child: Some(File::from(parent_read)),
                to_child: Some(File::from(parent_write)),
            });
        }

        Ok(Self {
            child_ends,
            parent_ends,
        })
    }

    fn child_fd_array(&self) -> [RawFd; CHANNEL_COUNT * 2] {
        let mut fds = [0 as RawFd; CHANNEL_COUNT * 2];
        for (slot, end) in fds.iter_mut().zip(&self.child_ends) {
            *slot = end.as_raw_fd();
        }
        fds
    }

    fn close_child_ends(&mut self) {
        self.child_ends.clear();
    }

    fn into_parent_ends(self) -> Vec<AuxPipes> {
        self.parent_ends
    }
}

/// Remaps the child-side pipe ends onto the reserved descriptor range.
///
/// Runs post-fork, so it must not allocate: any inherited descriptor that
/// already sits inside the target range is first duplicated above it,
/// otherwise a later `dup2` would clobber a source that is still needed.
fn remap_child_descriptors(mut sources: [RawFd; CHANNEL_COUNT * 2]) -> io::Result<()> {
    let range_end = AUX_FD_BASE + sources.len() as RawFd;

    for src in &mut sources {
        if *src >= AUX_FD_BASE && *src < range_end {
            // SAFETY: fcntl(F_DUPFD_CLOEXEC) is async-signal-safe.
            let moved = unsafe { libc::fcntl(*src, libc::F_DUPFD_CLOEXEC, range_end) };
            if moved < 0 {
                return Err(io::Error::last_os_error());
            }
            *src = moved;
        }
    }

    for (offset, src) in sources.iter().enumerate() {
        let target = AUX_FD_BASE + offset as RawFd;
        // SAFETY: dup2 is async-signal-safe; target is outside the stdio
        // range and the sources have been moved clear of the targets.
        if unsafe { libc::dup2(*src, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element array for pipe2 to fill.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 returned two fresh descriptors we now uniquely own.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn readable_now(fd: RawFd) -> bool {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: `pollfd` is a valid single-element array; timeout zero makes
    // the call non-blocking.
    unsafe { libc::poll(&mut pollfd, 1, 0) > 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_test_support::service_script;

    #[test]
    fn launch_wires_stdin_to_the_request_blob() {
        let script = service_script(
            "echo-args",
            "#!/bin/sh\ncat\n",
        );
        let mut supervisor = Supervisor::new();
        let mut process = supervisor
            .launch(script.path(), "backup@client")
            .expect("launch");
        process.write_request("disk1 0\n").expect("write request");

        let mut reply = String::new();
        process
            .stdout
            .as_mut()
            .expect("stdout piped")
            .read_to_string(&mut reply)
            .expect("read stdout");
        assert_eq!(reply, "disk1 0\n");
        assert!(supervisor.release(process).is_none());
        assert!(!supervisor.is_active());
    }

    #[test]
    fn child_sees_aux_channels_at_the_reserved_descriptors() {
        let script = service_script(
            "fd-probe",
            &format!(
                "#!/bin/sh\nprintf hello >&{write_fd}\nread line <&{read_fd}\nprintf \"%s\" \"$line\" >&{write_fd}\n",
                read_fd = AUX_FD_BASE,
                write_fd = AUX_FD_BASE + 1,
            ),
        );
        let mut supervisor = Supervisor::new();
        let mut process = supervisor
            .launch(script.path(), "backup@client")
            .expect("launch");
        process.write_request("").expect("close stdin");

        let mut aux = process.take_aux(PRIMARY_DATA_CHANNEL);
        let mut greeting = [0u8; 5];
        aux.from_child
            .as_mut()
            .expect("read end")
            .read_exact(&mut greeting)
            .expect("read greeting");
        assert_eq!(&greeting, b"hello");

        aux.to_child
            .as_mut()
            .expect("write end")
            .write_all(b"pong\n")
            .expect("write to child");
        drop(aux.to_child.take());

        let mut echoed = [0u8; 4];
        aux.from_child
            .as_mut()
            .expect("read end")
            .read_exact(&mut echoed)
            .expect("read echo");
        assert_eq!(&echoed, b"pong");

        assert!(supervisor.release(process).is_none());
    }

    #[test]
    fn descriptor_collisions_inside_the_reserved_range_are_remapped() {
        // Occupy descriptors up past the reserved range, then free exactly
        // the range itself so the channel pipes are allocated inside it and
        // the pre-exec remap has to move them out of its own way.
        let range_end = AUX_FD_BASE + (CHANNEL_COUNT as RawFd) * 2;
        let mut hold = Vec::new();
        loop {
            let file = File::open("/dev/null").expect("open /dev/null");
            let done = file.as_raw_fd() >= range_end;
            hold.push(file);
            if done {
                break;
            }
        }
        hold.retain(|file| {
            let fd = file.as_raw_fd();
            !(AUX_FD_BASE..range_end).contains(&fd)
        });

        let script = service_script(
            "fd-probe",
            &format!(
                "#!/bin/sh\nprintf hello >&{write_fd}\n",
                write_fd = AUX_FD_BASE + 1,
            ),
        );
        let mut supervisor = Supervisor::new();
        let mut process = supervisor
            .launch(script.path(), "backup@client")
            .expect("launch");
        process.write_request("").expect("close stdin");

        let mut aux = process.take_aux(PRIMARY_DATA_CHANNEL);
        let mut greeting = [0u8; 5];
        aux.from_child
            .as_mut()
            .expect("read end")
            .read_exact(&mut greeting)
            .expect("read greeting");
        assert_eq!(&greeting, b"hello");
        assert!(supervisor.release(process).is_none());
        drop(hold);
    }

    #[test]
    fn environment_is_minimal_and_carries_the_peer() {
        let script = service_script(
            "env-probe",
            "#!/bin/sh\nenv | sort\n",
        );
        let mut supervisor = Supervisor::new();
        let mut process = supervisor
            .launch(script.path(), "backup@client")
            .expect("launch");
        process.write_request("").expect("close stdin");

        let mut output = String::new();
        process
            .stdout
            .as_mut()
            .expect("stdout piped")
            .read_to_string(&mut output)
            .expect("read env");

        assert!(output.contains("ARKD_PEER_NAME=backup@client"));
        for line in output.lines() {
            let key = line.split('=').next().unwrap_or("");
            assert!(
                ["ARKD_PEER_NAME", "PATH", "TZ", "PWD", "SHLVL", "_"].contains(&key),
                "unexpected environment variable {line:?}"
            );
        }
        assert!(supervisor.release(process).is_none());
    }

    #[test]
    fn second_launch_while_active_is_refused() {
        let script = service_script("noop", "#!/bin/sh\nexit 0\n");
        let mut supervisor = Supervisor::new();
        let process = supervisor
            .launch(script.path(), "backup@client")
            .expect("launch");
        assert!(matches!(
            supervisor.launch(script.path(), "backup@client"),
            Err(TxnError::Busy)
        ));
        supervisor.release(process);
    }

    #[test]
    fn abnormal_exit_is_reported_at_release() {
        let script = service_script("failing", "#!/bin/sh\nexit 3\n");
        let mut supervisor = Supervisor::new();
        let mut process = supervisor
            .launch(script.path(), "backup@client")
            .expect("launch");
        process.write_request("").expect("close stdin");

        // Let the reply pipe reach EOF so the child has surely exited.
        let mut sink = Vec::new();
        process
            .stdout
            .as_mut()
            .expect("stdout piped")
            .read_to_end(&mut sink)
            .expect("drain stdout");

        assert!(matches!(
            supervisor.release(process),
            Some(TxnError::AbnormalExit { .. })
        ));
    }

    #[test]
    fn release_terminates_a_lingering_child_gracefully() {
        let script = service_script(
            "sleeper",
            "#!/bin/sh\ntrap 'exit 0' TERM\nwhile :; do sleep 1; done\n",
        );
        let mut supervisor = Supervisor::new();
        let mut process = supervisor
            .launch(script.path(), "backup@client")
            .expect("launch");
        process.write_request("").expect("close stdin");

        let started = Instant::now();
        assert!(supervisor.release(process).is_none());
        assert!(started.elapsed() < TERMINATE_GRACE);
        assert!(!supervisor.is_active());
    }
}
