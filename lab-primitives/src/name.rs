//! Validated names for datasets and capabilities.

use std::borrow::Borrow;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_DATASET_NAME_LEN: usize = 64;
const MAX_CAPABILITY_NAME_LEN: usize = 48;

/// Name of a dataset held by the registry.
///
/// Dataset names double as relational table names and as identifiers inside
/// an execution scope, so they are restricted to ASCII letters, digits, and
/// underscores, and must not start with a digit.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetName(String);

impl DatasetName {
    /// Creates a dataset name after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidName`] if the name is empty, too long, starts
    /// with a digit, or contains unsupported characters.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name, MAX_DATASET_NAME_LEN, |c| {
            c.is_ascii_alphanumeric() || c == '_'
        })?;
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DatasetName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DatasetName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DatasetName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DatasetName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for DatasetName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DatasetName> for String {
    fn from(value: DatasetName) -> Self {
        value.0
    }
}

/// Name under which a capability (or a denied identifier) is bound in an
/// execution scope.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityName(String);

impl CapabilityName {
    /// Creates a capability name after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidName`] if the supplied name is empty, too long,
    /// or contains characters other than lowercase alphanumerics and
    /// underscores.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name, MAX_CAPABILITY_NAME_LEN, |c| {
            matches!(c, 'a'..='z' | '0'..='9' | '_')
        })?;
        Ok(Self(name))
    }

    /// Returns the capability name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CapabilityName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CapabilityName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CapabilityName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<CapabilityName> for String {
    fn from(value: CapabilityName) -> Self {
        value.0
    }
}

fn validate_identifier(name: &str, max_len: usize, allowed: impl Fn(char) -> bool) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: String::new(),
            reason: "name cannot be empty".into(),
        });
    }

    if name.len() > max_len {
        return Err(Error::InvalidName {
            name: name.into(),
            reason: format!("name length must be <= {max_len}"),
        });
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(Error::InvalidName {
            name: name.into(),
            reason: "name cannot start with a digit".into(),
        });
    }

    if !name.chars().all(allowed) {
        return Err(Error::InvalidName {
            name: name.into(),
            reason: "name contains unsupported characters".into(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_table_like_dataset_names() {
        for name in ["sales", "Events_2024", "_scratch"] {
            assert_eq!(DatasetName::new(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn rejects_injection_shaped_dataset_names() {
        for name in ["", "1sales", "sales;drop", "a b", "naïve", "x\"y"] {
            let err = DatasetName::new(name).expect_err(name);
            assert!(matches!(err, Error::InvalidName { .. }));
        }
    }

    #[test]
    fn capability_names_are_lowercase() {
        assert!(CapabilityName::new("write_csv").is_ok());
        assert!(CapabilityName::new("WriteCsv").is_err());
        assert!(CapabilityName::new("x".repeat(49)).is_err());
    }

    #[test]
    fn dataset_name_deserialization_validates() {
        let ok: DatasetName = serde_json::from_str("\"logs\"").unwrap();
        assert_eq!(ok.as_str(), "logs");
        assert!(serde_json::from_str::<DatasetName>("\"drop table\"").is_err());
    }
}
