//! PTY plumbing: allocate the master/slave pair, spawn the child on the
//! slave side, and push window-size changes to the master.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, Winsize};
use tokio::process::{Child, Command};

/// Both ends of an allocated pseudo-terminal.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn window_size(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Open a PTY pair sized to the requested terminal dimensions.
pub fn allocate_pty(cols: u16, rows: u16) -> Result<PtyPair, nix::Error> {
    let pty = openpty(&window_size(cols, rows), None)?;
    Ok(PtyPair {
        master: pty.master,
        slave: pty.slave,
    })
}

/// Spawn a command with the PTY slave as its controlling terminal.
///
/// With `use_shell` the command line runs under `/bin/sh -c`; otherwise the
/// first element is exec'd with the rest as arguments. The child is placed
/// in its own session, so signals addressed to the negated pid reach its
/// whole process tree.
pub fn spawn_in_pty(
    pty: &PtyPair,
    command: &[String],
    working_dir: &str,
    env: &HashMap<String, String>,
    use_shell: bool,
) -> std::io::Result<Child> {
    if command.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        ));
    }

    let mut cmd = if use_shell {
        let mut c = Command::new("/bin/sh");
        c.arg("-c").arg(command.join(" "));
        c
    } else {
        let mut c = Command::new(&command[0]);
        c.args(&command[1..]);
        c
    };
    cmd.current_dir(working_dir).kill_on_drop(true);

    // Stdio is rewired to the slave inside pre_exec; null placeholders keep
    // tokio from allocating pipes nothing would ever read.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    cmd.envs(env);

    let slave_fd = pty.slave.as_raw_fd();
    // SAFETY: the closure runs between fork and exec and restricts itself to
    // async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(move || {
            // New session first; TIOCSCTTY refuses callers that are not a
            // session leader.
            if libc::setsid() < 0 || libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            for stdio_fd in 0..=2 {
                if libc::dup2(slave_fd, stdio_fd) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Update the PTY's window size. Repeating the current size is harmless.
pub fn resize_pty(master: &OwnedFd, cols: u16, rows: u16) -> Result<(), nix::Error> {
    nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
    let size = window_size(cols, rows);
    // SAFETY: TIOCSWINSZ reads one Winsize through the pointer, nothing more.
    unsafe { tiocswinsz(master.as_raw_fd(), &size) }.map(drop)
}
