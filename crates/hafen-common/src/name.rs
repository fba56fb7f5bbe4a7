//! Container name validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{HafenError, HafenResult};

/// A validated container name.
///
/// Container names must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(String);

impl ContainerName {
    /// Maximum length of a container name.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new container name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name format is invalid.
    pub fn new(name: impl Into<String>) -> HafenResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the container name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate a container name string.
    fn validate(name: &str) -> HafenResult<()> {
        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(HafenError::InvalidContainerName {
                name: name.to_string(),
            });
        }

        let first_char = name.chars().next().unwrap();
        if !first_char.is_ascii_alphanumeric() {
            return Err(HafenError::InvalidContainerName {
                name: name.to_string(),
            });
        }

        for c in name.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
                return Err(HafenError::InvalidContainerName {
                    name: name.to_string(),
                });
            }
        }

        Ok(())
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerName {
    type Err = HafenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_container_names() {
        assert!(ContainerName::new("web1").is_ok());
        assert!(ContainerName::new("my-container").is_ok());
        assert!(ContainerName::new("my_container").is_ok());
        assert!(ContainerName::new("Container-123_test").is_ok());
    }

    #[test]
    fn invalid_container_names() {
        assert!(ContainerName::new("").is_err());
        assert!(ContainerName::new("-invalid").is_err());
        assert!(ContainerName::new("_invalid").is_err());
        assert!(ContainerName::new("invalid!").is_err());
        assert!(ContainerName::new("web 1").is_err());
        assert!(ContainerName::new("a".repeat(65)).is_err());
    }

    #[test]
    fn display_round_trip() {
        let name = ContainerName::new("web1").unwrap();
        assert_eq!(name.to_string(), "web1");
        assert_eq!(name.as_str(), "web1");
    }

    proptest! {
        #[test]
        fn parse_display_round_trip(s in "[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}") {
            let name: ContainerName = s.parse().unwrap();
            prop_assert_eq!(name.to_string(), s);
        }
    }
}
