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

//! Turning a program and its arguments into what the process creation call expects.

#[cfg(any(unix, test))]
use std::ffi::CString;
#[cfg(any(unix, test))]
use std::os::raw::c_char;
#[cfg(any(unix, test))]
use std::ptr;

#[cfg(any(unix, test))]
use crate::tty::{Error, Result};

/// Argument vector with `program` as its first element.
///
/// Callers may pass the program name as the first argument themselves, in which case the
/// arguments are used unchanged.
pub(crate) fn argv<'a>(program: &'a str, args: &'a [String]) -> Vec<&'a str> {
    match args.first() {
        Some(first) if first == program => args.iter().map(String::as_str).collect(),
        _ => std::iter::once(program).chain(args.iter().map(String::as_str)).collect(),
    }
}

/// NULL terminated array of C strings, as taken by `execve`.
///
/// The pointers borrow from the owned strings, so both live and die together.
#[cfg(any(unix, test))]
pub(crate) struct CStringArray {
    _strings: Vec<CString>,
    pointers: Vec<*const c_char>,
}

#[cfg(any(unix, test))]
impl CStringArray {
    pub fn new<I, S>(items: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        let strings = items
            .into_iter()
            .map(|item| CString::new(item).map_err(|err| Error::InvalidInput(err.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let pointers =
            strings.iter().map(|string| string.as_ptr()).chain(Some(ptr::null())).collect();

        Ok(Self { _strings: strings, pointers })
    }

    pub fn as_ptr(&self) -> *const *const c_char {
        self.pointers.as_ptr()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pointers.len() - 1
    }
}

/// Single command line string for `CreateProcessW`.
///
/// Arguments are quoted so that the usual `CommandLineToArgvW` splitting gives them back
/// unchanged.
#[cfg(any(windows, test))]
pub(crate) fn cmdline(program: &str, args: &[String]) -> String {
    argv(program, args).into_iter().map(quote).collect::<Vec<_>>().join(" ")
}

#[cfg(any(windows, test))]
fn quote(arg: &str) -> String {
    if arg.is_empty() {
        return String::from("\"\"");
    }

    if !arg.contains(|c| c == ' ' || c == '\t' || c == '"') {
        return arg.to_owned();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');

    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // Escape the pending backslashes and the quote itself.
                push_backslashes(&mut quoted, backslashes * 2 + 1);
                quoted.push('"');
                backslashes = 0;
            },
            c => {
                push_backslashes(&mut quoted, backslashes);
                quoted.push(c);
                backslashes = 0;
            },
        }
    }

    // Backslashes in front of the closing quote must not escape it.
    push_backslashes(&mut quoted, backslashes * 2);
    quoted.push('"');

    quoted
}

#[cfg(any(windows, test))]
fn push_backslashes(target: &mut String, count: usize) {
    target.extend(std::iter::repeat('\\').take(count));
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;

    use super::*;

    /// Splits a command line with the rules of `CommandLineToArgvW` for non-initial arguments.
    fn split(cmdline: &str) -> Vec<String> {
        let mut args = Vec::new();
        let mut chars = cmdline.chars().peekable();

        loop {
            while matches!(chars.peek(), Some(' ') | Some('\t')) {
                chars.next();
            }

            if chars.peek().is_none() {
                return args;
            }

            let mut arg = String::new();
            let mut quoted = false;
            loop {
                match chars.next() {
                    None => break,
                    Some(' ') | Some('\t') if !quoted => break,
                    Some('\\') => {
                        let mut backslashes = 1;
                        while chars.peek() == Some(&'\\') {
                            chars.next();
                            backslashes += 1;
                        }

                        if chars.peek() == Some(&'"') {
                            arg.extend(std::iter::repeat('\\').take(backslashes / 2));
                            if backslashes % 2 == 1 {
                                chars.next();
                                arg.push('"');
                            }
                        } else {
                            arg.extend(std::iter::repeat('\\').take(backslashes));
                        }
                    },
                    Some('"') if quoted && chars.peek() == Some(&'"') => {
                        chars.next();
                        arg.push('"');
                    },
                    Some('"') => quoted = !quoted,
                    Some(c) => arg.push(c),
                }
            }

            args.push(arg);
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn argv_without_arguments() {
        assert_eq!(argv("/bin/sh", &[]), vec!["/bin/sh"]);
    }

    #[test]
    fn argv_prepends_program() {
        assert_eq!(argv("/bin/sh", &strings(&["-l"])), vec!["/bin/sh", "-l"]);
    }

    #[test]
    fn argv_keeps_leading_program() {
        let args = strings(&["/bin/sh", "-c", "exit 0"]);
        assert_eq!(argv("/bin/sh", &args), vec!["/bin/sh", "-c", "exit 0"]);
    }

    #[test]
    fn argv_only_checks_first_argument() {
        let args = strings(&["-c", "/bin/sh"]);
        assert_eq!(argv("/bin/sh", &args), vec!["/bin/sh", "-c", "/bin/sh"]);
    }

    #[test]
    fn cstring_array_is_null_terminated() {
        let array = CStringArray::new(vec!["/bin/sh", "-l"]).unwrap();
        assert_eq!(array.len(), 2);

        unsafe {
            let pointers = array.as_ptr();
            assert_eq!(CStr::from_ptr(*pointers).to_str().unwrap(), "/bin/sh");
            assert_eq!(CStr::from_ptr(*pointers.add(1)).to_str().unwrap(), "-l");
            assert!((*pointers.add(2)).is_null());
        }
    }

    #[test]
    fn cstring_array_rejects_interior_nul() {
        assert!(matches!(CStringArray::new(vec!["a\0b"]), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn quote_plain_arguments_unchanged() {
        assert_eq!(quote("powershell.exe"), "powershell.exe");
        assert_eq!(quote(r"C:\dir\file"), r"C:\dir\file");
        assert_eq!(quote(r"trailing\"), r"trailing\");
    }

    #[test]
    fn quote_special_cases() {
        assert_eq!(quote(""), "\"\"");
        assert_eq!(quote("a b"), "\"a b\"");
        assert_eq!(quote("a\tb"), "\"a\tb\"");
        assert_eq!(quote(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote(r#"a\"b"#), r#""a\\\"b""#);
        assert_eq!(quote(r"dir with space\"), r#""dir with space\\""#);
    }

    #[test]
    fn cmdline_joins_with_spaces() {
        let line = cmdline("cmd.exe", &strings(&["/c", "echo hi"]));
        assert_eq!(line, r#"cmd.exe /c "echo hi""#);
    }

    #[test]
    fn cmdline_round_trips_through_splitter() {
        let args = strings(&[
            "plain",
            "with space",
            "",
            r#"embedded "quote""#,
            r"trailing\",
            r"spaced trailing\\",
            r#"backslash before \"quote"#,
            "tab\there",
            r"C:\Program Files\app",
            "\"",
            r"\\server\share",
        ]);

        let line = cmdline("prog.exe", &args);
        let mut expected = vec![String::from("prog.exe")];
        expected.extend(args);

        assert_eq!(split(&line), expected);
    }
}
