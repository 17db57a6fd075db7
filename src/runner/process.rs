//! Process-group spawning and signalling.
//!
//! Unix: the child leads its own process group, so signals sent to `-pgid`
//! reach whatever helpers the tool spawned. Windows: the child gets a new
//! process group and tree termination goes through `taskkill /T`.

use std::io;
use std::process::{Child, Command};

/// Put the child in its own process group.
#[cfg(unix)]
pub(crate) fn configure(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
pub(crate) fn configure(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

/// Ask the whole group to exit.
#[cfg(unix)]
pub(crate) fn terminate_group(child: &Child) -> io::Result<()> {
    signal_group(child.id(), libc::SIGTERM)
}

#[cfg(windows)]
pub(crate) fn terminate_group(child: &Child) -> io::Result<()> {
    taskkill(child.id(), false)
}

/// Kill the whole group, then make sure the direct child is gone too.
pub(crate) fn kill_group(child: &mut Child) -> io::Result<()> {
    let group = force_group(child.id());
    match child.kill() {
        Ok(()) => {}
        // Already exited (or already reaped).
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    group
}

/// Kill the group led by `pid`, even if the leader itself is already gone.
pub(crate) fn kill_group_of(pid: u32) -> io::Result<()> {
    force_group(pid)
}

#[cfg(unix)]
fn force_group(pid: u32) -> io::Result<()> {
    signal_group(pid, libc::SIGKILL)
}

#[cfg(windows)]
fn force_group(pid: u32) -> io::Result<()> {
    taskkill(pid, true)
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group led by the child.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Group already gone.
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> io::Result<()> {
    use std::process::Stdio;

    let mut cmd = Command::new("taskkill");
    cmd.arg("/T");
    if force {
        cmd.arg("/F");
    }
    cmd.arg("/PID")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let status = cmd.status()?;
    // 128: no such process.
    if status.success() || status.code() == Some(128) {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}
