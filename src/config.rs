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

//! Loading session options from YAML files.
//!
//! ```yaml
//! program: /bin/bash
//! args: ["-l"]
//! env:
//!   TERM: xterm-256color
//! working_directory: /tmp
//! window_size:
//!   columns: 120
//!   rows: 40
//! ```
//!
//! Missing keys keep their [`Options::default`] values.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::Path;

use log::error;

use crate::tty::Options;

/// Result from config loading.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors occurring during config loading.
#[derive(Debug)]
pub enum Error {
    /// Config file not found.
    NotFound,

    /// io error reading file.
    Io(io::Error),

    /// Not valid yaml or missing parameters.
    Yaml(serde_yaml::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::NotFound => None,
            Error::Io(err) => Some(err),
            Error::Yaml(err) => Some(err),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "Unable to locate config file"),
            Error::Io(err) => write!(f, "Error reading config file: {}", err),
            Error::Yaml(err) => write!(f, "Problem with config: {}", err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(val: io::Error) -> Self {
        if val.kind() == io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            Error::Io(val)
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(val: serde_yaml::Error) -> Self {
        Error::Yaml(val)
    }
}

/// Read session options from the YAML file at `path`.
pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Options> {
    let path = path.as_ref();
    match read_config(path) {
        Ok(options) => Ok(options),
        Err(err) => {
            error!("Unable to load config {:?}: {}", path, err);
            Err(err)
        },
    }
}

fn read_config(path: &Path) -> Result<Options> {
    let mut contents = fs::read_to_string(path)?;

    // Remove UTF-8 BOM.
    if contents.starts_with('\u{FEFF}') {
        contents = contents.split_off(3);
    }

    parse_config(&contents)
}

fn parse_config(contents: &str) -> Result<Options> {
    // An empty or fully commented out file is not an error.
    let blank = |line: &str| line.is_empty() || line.starts_with('#');
    if contents.lines().map(str::trim).all(blank) {
        return Ok(Options::default());
    }

    Ok(serde_yaml::from_str(contents)?)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::size::WindowSize;

    #[test]
    fn parse_full_options() {
        let options = parse_config(
            "program: /bin/bash\nargs: [\"-l\"]\nenv:\n  TERM: xterm-256color\nworking_directory: \
             /tmp\nwindow_size:\n  columns: 120\n  rows: 40\n",
        )
        .unwrap();

        assert_eq!(options.program, "/bin/bash");
        assert_eq!(options.args, vec!["-l"]);
        assert_eq!(options.env.unwrap()["TERM"], "xterm-256color");
        assert_eq!(options.working_directory, Some(PathBuf::from("/tmp")));
        assert_eq!(options.window_size, Some(WindowSize::new(120, 40)));
    }

    #[test]
    fn missing_keys_use_defaults() {
        let options = parse_config("args: [\"-c\", \"true\"]\n").unwrap();

        assert_eq!(options.program, Options::default().program);
        assert_eq!(options.args, vec!["-c", "true"]);
        assert!(options.env.is_none());
        assert!(options.window_size.is_none());
    }

    #[test]
    fn empty_config_is_default() {
        assert_eq!(parse_config("").unwrap(), Options::default());
        assert_eq!(parse_config("# program: /bin/zsh\n\n").unwrap(), Options::default());
    }

    #[test]
    fn invalid_yaml_is_reported() {
        assert!(matches!(parse_config("args: 3\n"), Err(Error::Yaml(_))));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load_from("/nonexistent/pty_session.yml").unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }
}
