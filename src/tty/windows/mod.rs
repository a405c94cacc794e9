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

use std::env;
use std::ffi::OsStr;
use std::io;
use std::iter::once;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::path::PathBuf;

use log::{trace, warn};
use miow::pipe::{AnonRead, AnonWrite};
use winapi::shared::minwindef::DWORD;
use winapi::shared::winerror::ERROR_BROKEN_PIPE;
use winapi::um::processthreadsapi::{GetExitCodeProcess, TerminateProcess};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
use winapi::um::winnt::HANDLE;

use crate::size::WindowSize;
use crate::tty::{
    read_range, resize_cached, write_range, Error, Options, PtySession, Result, WAIT_FAILED,
};

mod conpty;

use conpty::Conpty as Backend;

/// Unix signal number of `SIGKILL`, for callers sharing code with POSIX.
pub const SIGKILL: i32 = 9;

/// Unix `WNOHANG`, for callers sharing code with POSIX.
pub const WNOHANG: i32 = 1;

/// `GetExitCodeProcess` result while the process is running.
const STILL_ACTIVE: DWORD = 259;

/// Exit code given to a forcefully terminated child.
const TERMINATED_EXIT_CODE: u32 = 1;

/// Shell used when no program was configured.
pub fn default_shell() -> String {
    let root = env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
    let mut shell = PathBuf::from(root);
    shell.extend(["System32", "WindowsPowerShell", "v1.0", "powershell.exe"]);
    shell.to_string_lossy().into_owned()
}

/// Session backed by a pseudo console.
pub struct Pty {
    session: Option<Session>,
}

struct Session {
    conin: AnonWrite,
    conout: AnonRead,
    thread: OwnedHandle,
    process: OwnedHandle,
    pid: u32,
    size: WindowSize,

    // Must stay the last field, the pseudo console is released after the pipes and the process.
    backend: Backend,
}

/// Create a new pseudo console and spawn `options.program` on it.
pub fn new(options: &Options) -> Result<Pty> {
    conpty::new(options)
}

impl Pty {
    fn new(session: Session) -> Self {
        Self { session: Some(session) }
    }

    /// Process ID of the child, while the session is open.
    pub fn pid(&self) -> Option<u32> {
        self.session.as_ref().map(|session| session.pid)
    }
}

impl Session {
    fn process(&self) -> HANDLE {
        self.process.as_raw_handle() as HANDLE
    }

    fn exit_code(&self) -> io::Result<DWORD> {
        let mut code: DWORD = 0;
        if unsafe { GetExitCodeProcess(self.process(), &mut code) } == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(code)
    }

    fn is_alive(&self) -> bool {
        matches!(self.exit_code(), Ok(STILL_ACTIVE))
    }

    fn wait(&self) -> i32 {
        if unsafe { WaitForSingleObject(self.process(), INFINITE) } != WAIT_OBJECT_0 {
            warn!("Waiting for pid {} failed: {}", self.pid, io::Error::last_os_error());
            return WAIT_FAILED;
        }

        match self.exit_code() {
            Ok(code) => code as i32,
            Err(err) => {
                warn!("Unable to get exit code of pid {}: {}", self.pid, err);
                WAIT_FAILED
            },
        }
    }

    fn terminate(&self) -> bool {
        if unsafe { TerminateProcess(self.process(), TERMINATED_EXIT_CODE) } == 0 {
            warn!("Unable to terminate pid {}: {}", self.pid, io::Error::last_os_error());
            return false;
        }

        true
    }
}

/// The console host reports a closed output pipe as `ERROR_BROKEN_PIPE`.
fn is_broken_pipe(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32)
}

impl PtySession for Pty {
    fn read(&mut self, buf: &mut [u8], offset: usize, length: usize) -> Result<isize> {
        let session = self.session.as_mut().ok_or(Error::Closed)?;
        read_range(&mut session.conout, buf, offset, length, is_broken_pipe)
    }

    fn write(&mut self, buf: &[u8], offset: usize, length: usize) -> Result<usize> {
        let session = self.session.as_mut().ok_or(Error::Closed)?;
        write_range(&mut session.conin, buf, offset, length)
    }

    fn close(&mut self, terminate_child: bool) {
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };

        if terminate_child && session.is_alive() {
            session.terminate();
        }

        trace!("Releasing pseudo console of pid {}", session.pid);

        let Session { conin, conout, thread, process, backend, .. } = session;
        drop(conin);
        drop(conout);
        drop(thread);
        drop(process);
        drop(backend);
    }

    fn is_alive(&mut self) -> bool {
        self.session.as_ref().is_some_and(Session::is_alive)
    }

    fn wait_for(&mut self) -> i32 {
        self.session.as_ref().map_or(WAIT_FAILED, Session::wait)
    }

    fn interrupt(&mut self) -> bool {
        let session = match self.session.as_ref() {
            Some(session) => session,
            None => return false,
        };

        // Only break events can be targeted at a process group.
        if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, session.pid) } == 0 {
            warn!("Unable to interrupt pid {}: {}", session.pid, io::Error::last_os_error());
            return false;
        }

        true
    }

    fn destroy(&mut self) -> bool {
        self.session.as_ref().is_some_and(Session::terminate)
    }

    fn win_size(&self) -> Result<WindowSize> {
        self.session.as_ref().map(|session| session.size).ok_or(Error::State)
    }

    fn set_win_size(&mut self, size: WindowSize) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::State)?;
        let backend = &session.backend;
        resize_cached(&mut session.size, size, |size| backend.resize(size))
    }
}

/// Converts the string slice into a Windows-standard representation for "W"-
/// suffixed function variants, which accept UTF-16 encoded string values.
pub fn win32_string<S: AsRef<OsStr> + ?Sized>(value: &S) -> Vec<u16> {
    OsStr::new(value).encode_wide().chain(once(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn win32_string_is_nul_terminated() {
        assert_eq!(win32_string("cmd"), vec![b'c' as u16, b'm' as u16, b'd' as u16, 0]);
    }

    #[test]
    fn default_shell_is_powershell() {
        assert!(default_shell().ends_with("powershell.exe"));
    }

    #[test]
    fn broken_pipe_means_end_of_stream() {
        assert!(is_broken_pipe(&io::Error::from_raw_os_error(109)));
        assert!(!is_broken_pipe(&io::Error::from_raw_os_error(5)));
    }
}
