//! Request keys: unordered, non-empty sets of identifiers.

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    #[error("request key must contain at least one identifier")]
    Empty,
}

/// The identity of a coalesced request.
///
/// Two keys are equal iff they hold exactly the same identifiers. Insertion
/// order and duplicates are irrelevant; comparison is case-sensitive and
/// performs no normalization.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    ids: BTreeSet<String>,
}

impl RequestKey {
    pub fn new<I, T>(ids: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let ids: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self { ids })
    }

    pub fn single(id: impl Into<String>) -> Self {
        Self {
            ids: BTreeSet::from([id.into()]),
        }
    }

    /// Identifiers in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

impl TryFrom<Vec<String>> for RequestKey {
    type Error = KeyError;

    fn try_from(ids: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(ids)
    }
}

impl TryFrom<&[&str]> for RequestKey {
    type Error = KeyError;

    fn try_from(ids: &[&str]) -> Result<Self, Self::Error> {
        Self::new(ids.iter().copied())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, id) in self.ids.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(id)?;
        }
        f.write_str("}")
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestKey{}", self)
    }
}
