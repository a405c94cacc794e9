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

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use serde::Deserialize;

use crate::size::WindowSize;

mod command;
mod environment;

#[cfg(not(windows))]
mod unix;
#[cfg(not(windows))]
pub use self::unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;

/// Returned by [`PtySession::read`] once the other side of the channel is gone.
pub const END_OF_STREAM: isize = -1;

/// Returned by [`PtySession::wait_for`] when the session no longer owns the child.
pub const WAIT_FAILED: i32 = -1;

/// Everything needed to start a child process on a fresh pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Program to execute.
    ///
    /// On POSIX this is handed to `execve` as is, so it has to be a path; `PATH` is not searched.
    pub program: String,

    /// Arguments, optionally starting with `program` itself.
    pub args: Vec<String>,

    /// Complete child environment. `None` inherits the environment of this process.
    pub env: Option<HashMap<String, String>>,

    /// Directory the child starts in. `None` keeps the current directory.
    pub working_directory: Option<PathBuf>,

    /// Initial terminal size.
    ///
    /// POSIX leaves the kernel default in place when this is `None`, Windows uses 80x24.
    pub window_size: Option<WindowSize>,
}

impl Default for Options {
    fn default() -> Self {
        Self::new(default_shell())
    }
}

impl Options {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: None,
            working_directory: None,
            window_size: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(env.into_iter().map(|(key, value)| (key.into(), value.into())).collect());
        self
    }

    pub fn working_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn window_size(mut self, size: WindowSize) -> Self {
        self.window_size = Some(size);
        self
    }
}

/// Create a pseudo-terminal and spawn `options.program` attached to it.
///
/// Either the child is running and the returned session owns every OS resource involved, or
/// nothing is left behind. The one exception is POSIX: when a step after the fork fails, the
/// already spawned child keeps running and is not reaped.
pub fn open(options: &Options) -> Result<Pty> {
    new(options)
}

/// Operations available on a live pseudo-terminal session.
///
/// A session is `Open` until [`close`](PtySession::close) moves it to `Closed`, which is final.
/// After that `read`/`write` fail with [`Error::Closed`], window size access fails with
/// [`Error::State`], and the remaining operations return their failure value.
///
/// Calls block the calling thread. There is no way to cancel a pending `read` or `write` other
/// than terminating the child, and even that is platform dependent.
pub trait PtySession {
    /// Read up to `length` bytes into `buf[offset..]`.
    ///
    /// Blocks until at least one byte is available. Returns [`END_OF_STREAM`] once the child side
    /// of the channel is gone.
    fn read(&mut self, buf: &mut [u8], offset: usize, length: usize) -> Result<isize>;

    /// Write all of `buf[offset..offset + length]`, retrying short writes.
    ///
    /// Returns `length` on success.
    fn write(&mut self, buf: &[u8], offset: usize, length: usize) -> Result<usize>;

    /// Release every resource of the session, killing the child first if `terminate_child` is set
    /// and it is still running.
    ///
    /// Closing an already closed session does nothing. A killed child is not reaped here, call
    /// [`wait_for`](PtySession::wait_for) first when it must not linger as a zombie.
    fn close(&mut self, terminate_child: bool);

    /// Whether the child has not exited yet.
    fn is_alive(&mut self) -> bool;

    /// Block until the child exits and return its raw exit representation.
    ///
    /// On POSIX this is the undecoded `waitpid` status, on Windows the process exit code. Must be
    /// called before [`close`](PtySession::close) to get a real value, afterwards it is always
    /// [`WAIT_FAILED`].
    fn wait_for(&mut self) -> i32;

    /// Ask the child to stop (`SIGINT`, or a console break event on Windows).
    ///
    /// Returns whether the OS accepted the request, not whether the child stopped.
    fn interrupt(&mut self) -> bool;

    /// Forcefully terminate the child.
    ///
    /// Returns whether the OS accepted the request.
    fn destroy(&mut self) -> bool;

    /// Current terminal size.
    fn win_size(&self) -> Result<WindowSize>;

    /// Resize the terminal.
    fn set_win_size(&mut self, size: WindowSize) -> Result<()>;
}

impl Read for Pty {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let length = buf.len();
        match PtySession::read(self, buf, 0, length) {
            Ok(END_OF_STREAM) => Ok(0),
            Ok(read) => Ok(read as usize),
            Err(err) => Err(err.into()),
        }
    }
}

impl Write for Pty {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PtySession::write(self, buf, 0, buf.len()).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.close(false);
    }
}

/// Result of pseudo-terminal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors occurring while opening or driving a session.
#[derive(Debug)]
pub enum Error {
    /// Creating the terminal or spawning the child failed.
    Open { reason: &'static str, code: i32 },

    /// An OS call on a live session failed.
    Io { reason: &'static str, code: i32 },

    /// I/O was attempted on a closed session.
    Closed,

    /// The window size was accessed on a closed session.
    State,

    /// The requested buffer range does not fit into the buffer.
    InvalidRange { offset: usize, length: usize, capacity: usize },

    /// A value cannot be passed to the OS, usually because of an interior NUL.
    InvalidInput(String),
}

impl Error {
    /// OS error code behind `Open` and `Io` failures.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Open { code, .. } | Error::Io { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn open(reason: &'static str, err: &io::Error) -> Self {
        Error::Open { reason, code: err.raw_os_error().unwrap_or(-1) }
    }

    pub(crate) fn io(reason: &'static str, err: &io::Error) -> Self {
        Error::Io { reason, code: err.raw_os_error().unwrap_or(-1) }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Open { reason, code } => {
                write!(f, "Unable to open PTY: {} (code {})", reason, code)
            },
            Error::Io { reason, code } => write!(f, "PTY I/O failed: {} (code {})", reason, code),
            Error::Closed => write!(f, "PTY is closed"),
            Error::State => write!(f, "PTY is closed, window size is unavailable"),
            Error::InvalidRange { offset, length, capacity } => write!(
                f,
                "Invalid buffer range: offset {} with length {} exceeds {} bytes",
                offset, length, capacity
            ),
            Error::InvalidInput(msg) => write!(f, "Invalid spawn parameter: {}", msg),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Open { code, .. } | Error::Io { code, .. } if code > 0 => {
                io::Error::from_raw_os_error(code)
            },
            Error::Closed | Error::State => io::Error::new(io::ErrorKind::NotConnected, err),
            Error::InvalidRange { .. } | Error::InvalidInput(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            },
            err => io::Error::new(io::ErrorKind::Other, err),
        }
    }
}

fn check_range(capacity: usize, offset: usize, length: usize) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::InvalidRange { offset, length, capacity }),
    }
}

/// Single read of `buf[offset..offset + length]`.
///
/// `hung_up` recognizes the platform's way of reporting that the writing side is gone.
fn read_range<R, F>(
    reader: &mut R,
    buf: &mut [u8],
    offset: usize,
    length: usize,
    hung_up: F,
) -> Result<isize>
where
    R: Read,
    F: Fn(&io::Error) -> bool,
{
    check_range(buf.len(), offset, length)?;

    if length == 0 {
        return Ok(0);
    }

    match reader.read(&mut buf[offset..offset + length]) {
        Ok(0) => Ok(END_OF_STREAM),
        Ok(read) => Ok(read as isize),
        Err(err) if hung_up(&err) => Ok(END_OF_STREAM),
        Err(err) => Err(Error::io("read failed", &err)),
    }
}

/// Write `buf[offset..offset + length]` completely.
fn write_range<W>(writer: &mut W, buf: &[u8], offset: usize, length: usize) -> Result<usize>
where
    W: Write,
{
    check_range(buf.len(), offset, length)?;

    let mut pending = &buf[offset..offset + length];
    while !pending.is_empty() {
        match writer.write(pending) {
            Ok(0) => return Err(Error::Io { reason: "write accepted no bytes", code: 0 }),
            Ok(written) => pending = &pending[written..],
            Err(err) => return Err(Error::io("write failed", &err)),
        }
    }

    Ok(length)
}

/// Apply `size` through `resize` and store it in `cache` only once that succeeded.
#[cfg(any(windows, test))]
fn resize_cached<F>(cache: &mut WindowSize, size: WindowSize, resize: F) -> Result<()>
where
    F: FnOnce(WindowSize) -> io::Result<()>,
{
    resize(size).map_err(|err| Error::io("resize failed", &err))?;
    *cache = size;
    Ok(())
}
