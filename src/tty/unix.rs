// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TTY related functionality.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::{env, ptr};

use libc::{c_int, winsize};
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::size::WindowSize;
use crate::tty::command::{self, CStringArray};
use crate::tty::{
    environment, read_range, write_range, Error, Options, PtySession, Result, WAIT_FAILED,
};

/// Signal used to forcefully terminate the child.
pub const SIGKILL: i32 = libc::SIGKILL;

/// `waitpid` flag for polling the child without blocking.
pub const WNOHANG: i32 = libc::WNOHANG;

/// Exit status of a child that could not be set up or executed.
const EXEC_FAILED: c_int = 127;

/// Upper bound of descriptors closed one by one when `close_range` is unavailable.
const MAX_FALLBACK_FDS: libc::c_long = 65536;

/// Used when neither `$SHELL` nor the password database name a shell.
const FALLBACK_SHELL: &str = "/bin/sh";

mod ioctl {
    nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, libc::winsize);
    nix::ioctl_read_bad!(window_size, libc::TIOCGWINSZ, libc::winsize);
}

/// Login shell of the current user.
///
/// Looks at `$SHELL` before falling back on `passwd`.
pub fn default_shell() -> String {
    match env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => match passwd_shell() {
            Ok(shell) if !shell.is_empty() => shell,
            Ok(_) => FALLBACK_SHELL.to_owned(),
            Err(err) => {
                debug!("Unable to read shell from passwd: {}", err);
                FALLBACK_SHELL.to_owned()
            },
        },
    }
}

fn passwd_shell() -> io::Result<String> {
    let mut buf = [0 as c_char; 1024];
    let mut entry: MaybeUninit<libc::passwd> = MaybeUninit::uninit();
    let mut res: *mut libc::passwd = ptr::null_mut();

    // Try and read the pw file.
    let uid = unsafe { libc::getuid() };
    let status = unsafe {
        libc::getpwuid_r(uid, entry.as_mut_ptr(), buf.as_mut_ptr(), buf.len(), &mut res)
    };

    if status != 0 {
        return Err(io::Error::from_raw_os_error(status));
    }

    if res.is_null() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "pw not found"));
    }

    // The entry is initialized whenever `res` points at it.
    let entry = unsafe { entry.assume_init() };
    if entry.pw_shell.is_null() {
        return Ok(String::new());
    }

    Ok(unsafe { CStr::from_ptr(entry.pw_shell) }.to_string_lossy().into_owned())
}

/// Types that can produce a `libc::winsize`.
pub trait ToWinsize {
    /// Get a `libc::winsize`.
    fn to_winsize(self) -> winsize;
}

impl ToWinsize for WindowSize {
    fn to_winsize(self) -> winsize {
        winsize {
            ws_row: self.rows,
            ws_col: self.columns,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

impl From<winsize> for WindowSize {
    fn from(win: winsize) -> Self {
        WindowSize::with_pixels(win.ws_col, win.ws_row, win.ws_xpixel, win.ws_ypixel)
    }
}

/// Session backed by a `forkpty` master descriptor.
pub struct Pty {
    child: Option<Child>,
}

struct Child {
    master: File,
    pid: Pid,

    /// Status collected by `waitpid`; the child can only be reaped once.
    status: Option<c_int>,
}

impl Child {
    fn is_alive(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }

        let mut status: c_int = 0;
        match unsafe { libc::waitpid(self.pid.as_raw(), &mut status, WNOHANG) } {
            0 => true,
            pid if pid == self.pid.as_raw() => {
                self.status = Some(status);
                false
            },
            _ => false,
        }
    }

    fn wait(&mut self) -> c_int {
        if let Some(status) = self.status {
            return status;
        }

        let mut status: c_int = 0;
        loop {
            match unsafe { libc::waitpid(self.pid.as_raw(), &mut status, 0) } {
                pid if pid == self.pid.as_raw() => {
                    self.status = Some(status);
                    return status;
                },
                _ if Errno::last() == Errno::EINTR => continue,
                _ => {
                    warn!("waitpid for {} failed: {}", self.pid, Errno::last());
                    return WAIT_FAILED;
                },
            }
        }
    }

    fn signal(&self, signal: Signal) -> bool {
        match kill(self.pid, signal) {
            Ok(()) => true,
            Err(err) => {
                warn!("Unable to send {} to {}: {}", signal, self.pid, err);
                false
            },
        }
    }
}

impl Pty {
    /// Process ID of the child, while the session is open.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|child| child.pid.as_raw() as u32)
    }

    /// PTY master descriptor, while the session is open.
    pub fn master_fd(&self) -> Option<RawFd> {
        self.child.as_ref().map(|child| child.master.as_raw_fd())
    }
}

/// Create a new TTY and spawn `options.program` on it.
pub fn new(options: &Options) -> Result<Pty> {
    // Everything the child needs is allocated before forking.
    let program = CString::new(options.program.as_bytes())
        .map_err(|err| Error::InvalidInput(err.to_string()))?;
    let argv = CStringArray::new(command::argv(&options.program, &options.args))?;
    let envp = options.env.as_ref().map(environment::envp).transpose()?;
    let working_directory = options
        .working_directory
        .as_ref()
        .map(|dir| CString::new(dir.as_os_str().as_bytes()))
        .transpose()
        .map_err(|err| Error::InvalidInput(err.to_string()))?;

    let mut window_size = options.window_size.map(ToWinsize::to_winsize);
    let winp: *mut winsize = window_size.as_mut().map_or(ptr::null_mut(), |win| win as *mut _);

    let termp = ptr::null_mut::<libc::termios>();
    let mut master: c_int = -1;
    let pid = unsafe { libc::forkpty(&mut master, ptr::null_mut(), termp, winp) };

    if pid < 0 {
        return Err(Error::open("forkpty failed", &io::Error::last_os_error()));
    }

    if pid == 0 {
        unsafe {
            exec_child(
                &program,
                &argv,
                envp.as_ref(),
                working_directory.as_deref(),
                window_size.as_ref(),
            )
        }
    }

    // The child is running from here on, failures below leave it alone.
    if master < 0 {
        return Err(Error::Open { reason: "forkpty returned no master descriptor", code: -1 });
    }

    let master = unsafe { File::from_raw_fd(master) };
    set_nonblocking(master.as_raw_fd(), false).map_err(|err| Error::Open {
        reason: "unable to make PTY master blocking",
        code: err as i32,
    })?;

    // Keep the master out of processes spawned later.
    if let Err(err) = fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
        warn!("Unable to set FD_CLOEXEC on PTY master: {}", err);
    }

    let pid = Pid::from_raw(pid);
    debug!("Spawned {} (pid {}) on PTY master {}", options.program, pid, master.as_raw_fd());

    Ok(Pty { child: Some(Child { master, pid, status: None }) })
}

/// Child side of the fork.
///
/// Applies the window size and working directory, drops inherited descriptors, then replaces the
/// process image. Nothing here allocates or returns; any failure ends the process with status 127.
unsafe fn exec_child(
    program: &CStr,
    argv: &CStringArray,
    envp: Option<&CStringArray>,
    working_directory: Option<&CStr>,
    window_size: Option<&winsize>,
) -> ! {
    if let Some(window_size) = window_size {
        if ioctl::set_window_size(libc::STDIN_FILENO, window_size).is_err() {
            abort_child(b"pty_session: failed to set window size\0");
        }
    }

    // Reset signals the parent may have changed.
    let signals =
        [libc::SIGCHLD, libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM, libc::SIGALRM];
    for sig in signals {
        libc::signal(sig, libc::SIG_DFL);
    }

    if let Some(working_directory) = working_directory {
        if libc::chdir(working_directory.as_ptr()) < 0 {
            abort_child(b"pty_session: chdir failed\0");
        }
    }

    close_inherited_fds();

    match envp {
        Some(envp) => libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr()),
        None => libc::execv(program.as_ptr(), argv.as_ptr()),
    };

    abort_child(b"pty_session: exec failed\0")
}

/// Close every descriptor above stderr.
///
/// `forkpty` does not create its descriptors close-on-exec, so sessions opened concurrently from
/// other threads would otherwise leak their master and slave into this child.
unsafe fn close_inherited_fds() {
    let first = libc::STDERR_FILENO + 1;

    #[cfg(target_os = "linux")]
    {
        let last = libc::c_uint::MAX;
        if libc::syscall(libc::SYS_close_range, first as libc::c_uint, last, 0) == 0 {
            return;
        }
    }

    let max = match libc::sysconf(libc::_SC_OPEN_MAX) {
        max if max > 0 => max.min(MAX_FALLBACK_FDS) as c_int,
        _ => MAX_FALLBACK_FDS as c_int,
    };
    for fd in first..max {
        libc::close(fd);
    }
}

/// Report `errno` on stderr and leave the forked child.
unsafe fn abort_child(msg: &[u8]) -> ! {
    libc::perror(msg.as_ptr() as *const c_char);
    libc::_exit(EXEC_FAILED)
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let flags = if nonblocking { flags | OFlag::O_NONBLOCK } else { flags & !OFlag::O_NONBLOCK };
    fcntl(fd, FcntlArg::F_SETFL(flags)).map(drop)
}

/// Linux reports a master whose slave side is gone as `EIO` instead of a zero-byte read.
fn is_hang_up(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

impl PtySession for Pty {
    fn read(&mut self, buf: &mut [u8], offset: usize, length: usize) -> Result<isize> {
        let child = self.child.as_mut().ok_or(Error::Closed)?;
        read_range(&mut child.master, buf, offset, length, is_hang_up)
    }

    fn write(&mut self, buf: &[u8], offset: usize, length: usize) -> Result<usize> {
        let child = self.child.as_mut().ok_or(Error::Closed)?;
        write_range(&mut child.master, buf, offset, length)
    }

    fn close(&mut self, terminate_child: bool) {
        let mut child = match self.child.take() {
            Some(child) => child,
            None => return,
        };

        // Don't hang on anything still queued once the child is gone.
        if let Err(err) = set_nonblocking(child.master.as_raw_fd(), true) {
            warn!("Unable to make PTY master non-blocking: {}", err);
        }

        if terminate_child && child.is_alive() {
            child.signal(Signal::SIGKILL);
        }

        trace!("Closing PTY master {} of pid {}", child.master.as_raw_fd(), child.pid);
        mem::drop(child);
    }

    fn is_alive(&mut self) -> bool {
        self.child.as_mut().is_some_and(Child::is_alive)
    }

    fn wait_for(&mut self) -> i32 {
        self.child.as_mut().map_or(WAIT_FAILED, Child::wait)
    }

    fn interrupt(&mut self) -> bool {
        self.child.as_ref().is_some_and(|child| child.signal(Signal::SIGINT))
    }

    fn destroy(&mut self) -> bool {
        self.child.as_ref().is_some_and(|child| child.signal(Signal::SIGKILL))
    }

    fn win_size(&self) -> Result<WindowSize> {
        let child = self.child.as_ref().ok_or(Error::State)?;

        let mut win: winsize = unsafe { mem::zeroed() };
        unsafe { ioctl::window_size(child.master.as_raw_fd(), &mut win) }
            .map_err(|err| Error::Io { reason: "ioctl TIOCGWINSZ failed", code: err as i32 })?;

        Ok(WindowSize::from(win))
    }

    fn set_win_size(&mut self, size: WindowSize) -> Result<()> {
        let child = self.child.as_ref().ok_or(Error::State)?;

        let win = size.to_winsize();
        unsafe { ioctl::set_window_size(child.master.as_raw_fd(), &win) }
            .map(drop)
            .map_err(|err| Error::Io { reason: "ioctl TIOCSWINSZ failed", code: err as i32 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winsize_round_trip() {
        let size = WindowSize::with_pixels(132, 43, 1056, 688);
        let win = size.to_winsize();

        assert_eq!((win.ws_col, win.ws_row, win.ws_xpixel, win.ws_ypixel), (132, 43, 1056, 688));
        assert_eq!(WindowSize::from(win), size);
    }

    #[test]
    fn default_shell_is_set() {
        assert!(!default_shell().is_empty());
    }

    #[test]
    fn eio_means_hang_up() {
        assert!(is_hang_up(&io::Error::from_raw_os_error(libc::EIO)));
        assert!(!is_hang_up(&io::Error::from_raw_os_error(libc::EBADF)));
    }

    #[test]
    fn exec_failure_exits_with_127() {
        let mut pty = new(&Options::new("/nonexistent/program")).unwrap();
        let status = pty.wait_for();

        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), EXEC_FAILED);
        pty.close(true);
    }

    #[test]
    fn chdir_failure_exits_with_127() {
        let options = Options::new("/bin/sh").working_directory("/nonexistent/directory");
        let mut pty = new(&options).unwrap();
        let status = pty.wait_for();

        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), EXEC_FAILED);
        pty.close(true);
    }

    #[test]
    fn interior_nul_is_rejected_before_fork() {
        let options = Options::new("/bin/sh").args(["-c", "echo\0"]);
        assert!(matches!(new(&options), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn pid_and_fd_disappear_on_close() {
        let mut pty = new(&Options::new("/bin/sh").args(["-c", "sleep 5"])).unwrap();
        assert!(pty.pid().is_some());
        assert!(pty.master_fd().is_some());

        pty.close(true);

        assert!(pty.pid().is_none());
        assert!(pty.master_fd().is_none());
    }
}
