//! Envelope addressing.
//!
//! An address names a route inside a service group:
//!
//! ```text
//! [<instance_id>@]<service_name>:/<path>
//! ```
//!
//! Without an instance id the address names *any* live instance of the
//! service; with one it names exactly that instance.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a service name or instance id.
pub const MAX_NAME_LENGTH: usize = 256;

/// Separator between the service name and the path.
const PATH_SEPARATOR: &str = ":/";

/// Address errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The address does not follow the grammar.
    #[error("Malformed address '{address}': {reason}")]
    Malformed {
        /// The offending input.
        address: String,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl AddressError {
    fn malformed(address: &str, reason: &'static str) -> Self {
        AddressError::Malformed {
            address: address.to_string(),
            reason,
        }
    }
}

/// Validate a service name or instance id.
///
/// # Errors
///
/// Returns a reason string if the name is invalid.
pub fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err("name too long");
    }
    if name
        .chars()
        .any(|c| c == ':' || c == '@' || c.is_whitespace() || c.is_control())
    {
        return Err("name contains reserved characters");
    }
    Ok(())
}

/// A parsed envelope address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Target instance, or `None` for any instance of the service.
    pub instance_id: Option<String>,
    /// Target service group.
    pub service_name: String,
    /// Route inside the service, always starting with `/`.
    pub path: String,
}

impl Address {
    /// Address any instance of a service.
    #[must_use]
    pub fn service(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            instance_id: None,
            service_name: service_name.into(),
            path: normalize_path(path.into()),
        }
    }

    /// Address one specific instance.
    #[must_use]
    pub fn instance(
        instance_id: impl Into<String>,
        service_name: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            service_name: service_name.into(),
            path: normalize_path(path.into()),
        }
    }

    /// Parse an address string.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::Malformed`] if the input does not follow the
    /// address grammar.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let split = address
            .find(PATH_SEPARATOR)
            .ok_or_else(|| AddressError::malformed(address, "missing ':/' separator"))?;

        let head = &address[..split];
        // Keep the leading slash.
        let path = &address[split + 1..];

        let (instance_id, service_name) = match head.split_once('@') {
            Some((instance, service)) => {
                if instance.is_empty() {
                    return Err(AddressError::malformed(address, "empty instance id"));
                }
                validate_name(instance).map_err(|r| AddressError::malformed(address, r))?;
                (Some(instance.to_string()), service)
            }
            None => (None, head),
        };

        if service_name.is_empty() {
            return Err(AddressError::malformed(address, "empty service name"));
        }
        validate_name(service_name).map_err(|r| AddressError::malformed(address, r))?;

        Ok(Self {
            instance_id,
            service_name: service_name.to_string(),
            path: path.to_string(),
        })
    }

    /// Check if this address names a specific instance.
    #[must_use]
    pub fn is_instance(&self) -> bool {
        self.instance_id.is_some()
    }

    /// Re-target this address at one instance, keeping service and path.
    #[must_use]
    pub fn with_instance(&self, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            service_name: self.service_name.clone(),
            path: self.path.clone(),
        }
    }
}

fn normalize_path(path: String) -> String {
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(instance) = &self.instance_id {
            write!(f, "{instance}@")?;
        }
        write!(f, "{}:{}", self.service_name, self.path)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}
