//! Three-state field values.
//!
//! A plain `Option` cannot tell "the user never set this" apart from "the
//! server has not told us yet". Both matter for diffing: the first may accept
//! whatever the server chose, the second always forces a change.

use serde::{Deserialize, Serialize};

/// A value that is unset, known, or awaiting server assignment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Slot<T> {
    /// Not declared by the user
    #[default]
    Unset,
    /// A concrete value
    Known(T),
    /// Will only be known once the server has processed a request
    Pending,
}

impl<T> Slot<T> {
    /// Check if the slot holds a concrete value.
    pub fn is_known(&self) -> bool {
        matches!(self, Slot::Known(_))
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Slot::Unset)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending)
    }

    /// Borrow the concrete value, if any.
    pub fn known(&self) -> Option<&T> {
        match self {
            Slot::Known(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Slot<&T> {
        match self {
            Slot::Unset => Slot::Unset,
            Slot::Known(value) => Slot::Known(value),
            Slot::Pending => Slot::Pending,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Slot<U> {
        match self {
            Slot::Unset => Slot::Unset,
            Slot::Known(value) => Slot::Known(f(value)),
            Slot::Pending => Slot::Pending,
        }
    }
}

impl Slot<String> {
    /// The value as a non-empty string.
    ///
    /// Remote identifiers use this: an empty id is no better than no id.
    pub fn non_empty(&self) -> Option<&str> {
        match self {
            Slot::Known(value) if !value.is_empty() => Some(value.as_str()),
            _ => None,
        }
    }
}

impl<T> From<Option<T>> for Slot<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Slot::Known(value),
            None => Slot::Unset,
        }
    }
}
