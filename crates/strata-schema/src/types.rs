//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }

            /// Whether the id can be used as a single file name inside the store.
            pub fn is_path_safe(&self) -> bool {
                !self.0.is_empty()
                    && self.0.len() <= 128
                    && !self.0.starts_with('.')
                    && self
                        .0
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Opaque identifier of a machine. Primary key for state, leases and events.
    MachineId
);

string_newtype!(
    /// Identifier of one build run, used to address its event stream.
    RunId
);

impl RunId {
    /// Derive the run id for `operation` on `machine_id`, e.g. `build-m1`.
    pub fn derive(operation: &str, machine_id: &MachineId) -> Self {
        Self(format!("{operation}-{machine_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_display_and_as_ref() {
        let id = MachineId::new("m-123");
        assert_eq!(id.to_string(), "m-123");
        assert_eq!(id.as_str(), "m-123");
        assert_eq!(AsRef::<str>::as_ref(&id), "m-123");
    }

    #[test]
    fn machine_id_serializes_as_plain_string() {
        let id = MachineId::new("deadbeef");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: MachineId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn run_id_derived_from_operation_and_machine() {
        let run = RunId::derive("build", &MachineId::new("m1"));
        assert_eq!(run, "build-m1");
    }

    #[test]
    fn path_safety() {
        assert!(MachineId::new("vm_01-a.b").is_path_safe());
        assert!(!MachineId::new("").is_path_safe());
        assert!(!MachineId::new("../etc").is_path_safe());
        assert!(!MachineId::new("a/b").is_path_safe());
        assert!(!MachineId::new(".hidden").is_path_safe());
        assert!(!MachineId::new("x".repeat(129)).is_path_safe());
    }
}
