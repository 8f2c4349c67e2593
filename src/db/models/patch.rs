use serde::{Deserialize, Deserializer};

/// Three-state field for partial updates: leave alone, clear, or set.
///
/// Use with `#[serde(default)]` so a missing field stays [`Patch::Unset`]
/// while an explicit `null` becomes [`Patch::Null`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch<T> {
    Unset,
    Null,
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Unset
    }
}

impl<T> Patch<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Patch::Unset)
    }

    /// Resolve against the current value.
    pub fn apply(self, current: Option<T>) -> Option<T> {
        match self {
            Patch::Unset => current,
            Patch::Null => None,
            Patch::Set(v) => Some(v),
        }
    }
}

impl<'de, T> Deserialize<'de> for Patch<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Patch::Set(v),
            None => Patch::Null,
        })
    }
}
