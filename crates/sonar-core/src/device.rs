//! Device identifier normalization.
//!
//! Two device names that differ only by case or surrounding whitespace are
//! the same subscription target. A [`DeviceName`] can only be built through
//! [`DeviceName::normalize`], so every value in circulation is already in
//! canonical form and never empty.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceName(String);

impl DeviceName {
    /// Trim and case-fold a raw device name. Returns `None` when nothing is left.
    pub fn normalize(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_lowercase()))
    }

    /// Normalize a list of raw names, dropping empties and duplicates.
    pub fn normalize_all<I, S>(raw: I) -> BTreeSet<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raw.into_iter()
            .filter_map(|name| Self::normalize(name.as_ref()))
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
