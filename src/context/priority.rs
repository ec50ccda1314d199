//! Request prioritization.

use serde::{Deserialize, Serialize};

/// Priority level for image requests.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
}

impl Priority {
    /// The higher of two priorities.
    pub fn higher(a: Self, b: Self) -> Self {
        a.max(b)
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Low,
            1 => Self::Medium,
            _ => Self::High,
        }
    }
}
