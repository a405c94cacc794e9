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

use std::io;
use std::mem;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::ptr;

use log::debug;
use miow::pipe::{AnonRead, AnonWrite};
use winapi::shared::basetsd::{DWORD_PTR, SIZE_T};
use winapi::shared::minwindef::{BYTE, DWORD, FALSE, LPVOID};
use winapi::shared::winerror::S_OK;
use winapi::um::consoleapi::{ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole};
use winapi::um::processthreadsapi::{
    CreateProcessW, DeleteProcThreadAttributeList, InitializeProcThreadAttributeList,
    UpdateProcThreadAttribute, LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION,
};
use winapi::um::winbase::{
    CREATE_NEW_PROCESS_GROUP, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT,
    STARTF_USESTDHANDLES, STARTUPINFOEXW,
};
use winapi::um::wincontypes::{COORD, HPCON};
use winapi::um::winnt::HANDLE;

use crate::size::WindowSize;
use crate::tty::windows::{win32_string, Pty, Session};
use crate::tty::{command, environment, Error, Options, Result};

/// `PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE`.
const PSEUDOCONSOLE_ATTRIBUTE: DWORD_PTR = 22 | 0x0002_0000;

/// RAII Pseudoconsole.
pub struct Conpty {
    handle: HPCON,
}

impl Conpty {
    /// Create a pseudo console reading from `input` and writing to `output`.
    ///
    /// The console duplicates both handles, so the caller is free to close its copies.
    fn new(size: WindowSize, input: &AnonRead, output: &AnonWrite) -> Result<Self> {
        let mut handle: HPCON = ptr::null_mut();
        let result = unsafe {
            CreatePseudoConsole(
                coord(size),
                input.as_raw_handle() as HANDLE,
                output.as_raw_handle() as HANDLE,
                0,
                &mut handle,
            )
        };

        if result != S_OK {
            return Err(Error::Open { reason: "CreatePseudoConsole failed", code: result });
        }

        Ok(Self { handle })
    }

    pub fn resize(&self, size: WindowSize) -> io::Result<()> {
        let result = unsafe { ResizePseudoConsole(self.handle, coord(size)) };
        if result != S_OK {
            return Err(io::Error::from_raw_os_error(result));
        }

        Ok(())
    }
}

impl Drop for Conpty {
    fn drop(&mut self) {
        // XXX: On older Windows builds this blocks until the console host has flushed its last
        // frame into the output pipe.
        unsafe { ClosePseudoConsole(self.handle) }
    }
}

// The ConPTY handle can be sent between threads.
unsafe impl Send for Conpty {}

/// Process thread attribute list holding a single pseudo console attribute.
struct AttributeList {
    buf: Box<[BYTE]>,
}

impl AttributeList {
    fn new(count: DWORD) -> io::Result<Self> {
        let mut size: SIZE_T = 0;

        // The sizing call is expected to fail, only `size` matters.
        unsafe { InitializeProcThreadAttributeList(ptr::null_mut(), count, 0, &mut size) };
        if size == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut buf: Box<[BYTE]> = vec![0; size].into_boxed_slice();

        // Lint failure is spurious; winapi declares PROC_THREAD_ATTRIBUTE_LIST as one pointer in
        // size, but the real list is opaque and byte addressed.
        #[allow(clippy::cast_ptr_alignment)]
        let list = buf.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST;
        if unsafe { InitializeProcThreadAttributeList(list, count, 0, &mut size) } == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { buf })
    }

    #[allow(clippy::cast_ptr_alignment)]
    fn as_mut_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.buf.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }

    fn set_pseudo_console(&mut self, console: &Conpty) -> io::Result<()> {
        let success = unsafe {
            UpdateProcThreadAttribute(
                self.as_mut_ptr(),
                0,
                PSEUDOCONSOLE_ATTRIBUTE,
                console.handle,
                mem::size_of::<HPCON>(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };

        if success == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        unsafe { DeleteProcThreadAttributeList(self.as_mut_ptr()) }
    }
}

/// Spawn `options.program` attached to a new pseudo console.
///
/// Every acquired resource is owned by a local, so an early return releases whatever exists at
/// that point in reverse order of acquisition.
pub fn new(options: &Options) -> Result<Pty> {
    let size = options.window_size.unwrap_or_default();

    let cmdline = command::cmdline(&options.program, &options.args);
    if cmdline.contains('\0') {
        return Err(Error::InvalidInput(format!("command line {:?} contains NUL", cmdline)));
    }
    let mut cmdline = win32_string(&cmdline);

    let mut env = options.env.as_ref().map(environment::block).transpose()?;

    let cwd = match &options.working_directory {
        Some(dir) if dir.to_string_lossy().contains('\0') => {
            return Err(Error::InvalidInput(format!("working directory {:?} contains NUL", dir)));
        },
        Some(dir) => Some(win32_string(dir)),
        None => None,
    };

    // Passing 0 as the size parameter allows the "system default" buffer size to be used.
    let (conout, conout_pty_handle) = miow::pipe::anonymous(0)
        .map_err(|err| Error::open("unable to create output pipe", &err))?;
    let (conin_pty_handle, conin) = miow::pipe::anonymous(0)
        .map_err(|err| Error::open("unable to create input pipe", &err))?;

    let backend = Conpty::new(size, &conin_pty_handle, &conout_pty_handle)?;
    drop(conin_pty_handle);
    drop(conout_pty_handle);

    let mut attributes = AttributeList::new(1)
        .map_err(|err| Error::open("unable to initialize attribute list", &err))?;
    attributes
        .set_pseudo_console(&backend)
        .map_err(|err| Error::open("unable to attach pseudo console", &err))?;

    let mut startup_info_ex: STARTUPINFOEXW = Default::default();
    startup_info_ex.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;

    // Setting this flag but leaving all the handles as default (null) ensures the
    // child does not inherit any standard handles from this process.
    startup_info_ex.StartupInfo.dwFlags |= STARTF_USESTDHANDLES;
    startup_info_ex.lpAttributeList = attributes.as_mut_ptr();

    let mut flags = EXTENDED_STARTUPINFO_PRESENT | CREATE_NEW_PROCESS_GROUP;
    if env.is_some() {
        flags |= CREATE_UNICODE_ENVIRONMENT;
    }

    let mut proc_info: PROCESS_INFORMATION = Default::default();
    let success = unsafe {
        CreateProcessW(
            ptr::null(),
            cmdline.as_mut_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            FALSE,
            flags,
            env.as_mut().map_or(ptr::null_mut(), |block| block.as_mut_ptr() as LPVOID),
            cwd.as_ref().map_or_else(ptr::null, |cwd| cwd.as_ptr()),
            &mut startup_info_ex.StartupInfo,
            &mut proc_info,
        )
    };
    let spawned = if success == 0 { Err(io::Error::last_os_error()) } else { Ok(proc_info) };

    // The list is only needed during process creation.
    drop(attributes);

    let proc_info = spawned.map_err(|err| Error::open("CreateProcessW failed", &err))?;
    let process = unsafe { OwnedHandle::from_raw_handle(proc_info.hProcess as _) };
    let thread = unsafe { OwnedHandle::from_raw_handle(proc_info.hThread as _) };

    debug!("Spawned {} (pid {}) on a pseudo console", options.program, proc_info.dwProcessId);

    Ok(Pty::new(Session {
        conin,
        conout,
        thread,
        process,
        pid: proc_info.dwProcessId,
        size,
        backend,
    }))
}

/// Console coordinates for `size`.
///
/// `COORD` is signed, values above `i16::MAX` wrap and are refused by the console.
fn coord(size: WindowSize) -> COORD {
    COORD { X: size.columns as i16, Y: size.rows as i16 }
}
