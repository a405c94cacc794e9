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
//
//! Child processes attached to a pseudo-terminal.
//!
//! On POSIX targets a session is a `forkpty` master descriptor plus the child pid. On Windows it
//! is a pseudo console (ConPTY), the two pipes feeding it and the child's process handles. Both
//! are exposed through the same [`PtySession`] contract.
#![deny(clippy::all, clippy::if_not_else, clippy::enum_glob_use)]

pub mod config;
pub mod size;
pub mod tty;

pub use crate::size::WindowSize;
pub use crate::tty::{open, Error, Options, Pty, PtySession, Result};
