use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TerminalError;

/// Named arrangement of terminals on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutType {
    #[default]
    Horizontal,
    Vertical,
    Grid,
}

impl LayoutType {
    pub const ALL: [LayoutType; 3] = [Self::Horizontal, Self::Vertical, Self::Grid];

    pub fn terminal_count(self) -> usize {
        match self {
            Self::Horizontal | Self::Vertical => 2,
            Self::Grid => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Horizontal => "horizontal",
            Self::Vertical => "vertical",
            Self::Grid => "grid",
        }
    }

    /// Layout used when only a terminal count is known.
    pub fn for_terminal_count(count: usize) -> Self {
        if count > 2 { Self::Grid } else { Self::Horizontal }
    }
}

impl fmt::Display for LayoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayoutType {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "horizontal" => Ok(Self::Horizontal),
            "vertical" => Ok(Self::Vertical),
            "grid" => Ok(Self::Grid),
            other => Err(TerminalError::InvalidLayout(other.to_string())),
        }
    }
}
