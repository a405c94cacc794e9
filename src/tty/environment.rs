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

//! Child environment representations.
//!
//! Entries are emitted in key order so the result does not depend on map iteration order. Not
//! supplying an environment at all makes the child inherit ours on every platform.

use std::collections::HashMap;

#[cfg(any(unix, test))]
use crate::tty::command::CStringArray;
#[cfg(any(windows, test))]
use crate::tty::Error;
use crate::tty::Result;

fn sorted(env: &HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut entries: Vec<_> = env.iter().collect();
    entries.sort();
    entries
}

/// `KEY=VALUE` array for `execve`.
#[cfg(any(unix, test))]
pub(crate) fn envp(env: &HashMap<String, String>) -> Result<CStringArray> {
    CStringArray::new(sorted(env).into_iter().map(|(key, value)| format!("{}={}", key, value)))
}

/// UTF-16 environment block for `CreateProcessW` with `CREATE_UNICODE_ENVIRONMENT`.
///
/// Every entry is NUL terminated and the block ends with one more NUL.
#[cfg(any(windows, test))]
pub(crate) fn block(env: &HashMap<String, String>) -> Result<Vec<u16>> {
    let mut block = Vec::new();
    for (key, value) in sorted(env) {
        if key.contains('\0') || value.contains('\0') {
            return Err(Error::InvalidInput(format!("environment entry {:?} contains NUL", key)));
        }

        block.extend(key.encode_utf16());
        block.push(u16::from(b'='));
        block.extend(value.encode_utf16());
        block.push(0);
    }

    // An empty block still needs both terminators.
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);

    Ok(block)
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;

    use super::*;

    fn env(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries.iter().map(|(key, value)| (key.to_string(), value.to_string())).collect()
    }

    #[test]
    fn envp_entries() {
        let array = envp(&env(&[("TERM", "xterm"), ("HOME", "/root")])).unwrap();

        unsafe {
            let pointers = array.as_ptr();
            assert_eq!(CStr::from_ptr(*pointers).to_str().unwrap(), "HOME=/root");
            assert_eq!(CStr::from_ptr(*pointers.add(1)).to_str().unwrap(), "TERM=xterm");
            assert!((*pointers.add(2)).is_null());
        }
    }

    #[test]
    fn envp_rejects_nul() {
        assert!(envp(&env(&[("BAD", "a\0b")])).is_err());
    }

    #[test]
    fn block_is_double_nul_terminated() {
        let block = block(&env(&[("B", "2"), ("A", "1")])).unwrap();
        let expected: Vec<u16> = "A=1\0B=2\0\0".encode_utf16().collect();
        assert_eq!(block, expected);
    }

    #[test]
    fn block_keeps_non_ascii() {
        let block = block(&env(&[("GREETING", "grüße")])).unwrap();
        let text = String::from_utf16(&block).unwrap();
        assert_eq!(text, "GREETING=grüße\0\0");
    }

    #[test]
    fn empty_block() {
        assert_eq!(block(&HashMap::new()).unwrap(), vec![0, 0]);
    }

    #[test]
    fn block_rejects_nul() {
        assert!(matches!(block(&env(&[("BAD", "a\0b")])), Err(Error::InvalidInput(_))));
    }
}
