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

//! Terminal dimensions.

use serde::Deserialize;

/// Columns used when no size was requested and the platform needs one.
pub const DEFAULT_COLUMNS: u16 = 80;

/// Rows used when no size was requested and the platform needs one.
pub const DEFAULT_ROWS: u16 = 24;

/// Size of the terminal in character cells and pixels.
///
/// Every field is 16 bits wide because that is what both `struct winsize` and the console `COORD`
/// carry. Pixel dimensions are informational and may be left at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
    #[serde(default)]
    pub pixel_width: u16,
    #[serde(default)]
    pub pixel_height: u16,
}

impl WindowSize {
    pub const fn new(columns: u16, rows: u16) -> Self {
        Self { columns, rows, pixel_width: 0, pixel_height: 0 }
    }

    pub const fn with_pixels(columns: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self { columns, rows, pixel_width, pixel_height }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(DEFAULT_COLUMNS, DEFAULT_ROWS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_eighty_by_twenty_four() {
        let size = WindowSize::default();
        assert_eq!((size.columns, size.rows), (80, 24));
        assert_eq!((size.pixel_width, size.pixel_height), (0, 0));
    }

    #[test]
    fn deserialize_without_pixels() {
        let size: WindowSize = serde_yaml::from_str("columns: 120\nrows: 40").unwrap();
        assert_eq!(size, WindowSize::new(120, 40));
    }

    #[test]
    fn deserialize_rejects_out_of_range() {
        assert!(serde_yaml::from_str::<WindowSize>("columns: 70000\nrows: 40").is_err());
    }
}
