use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address format: {0}")]
    InvalidFormat(String),
    #[error("address has an empty domain: {0}")]
    EmptyDomain(String),
}

/// An XMPP address (`local@domain/resource`).
///
/// A *bare* address has no resource; a *full* address identifies one
/// connected device of an account. Sessions are keyed by the full address of
/// the peer device, proposals by the bare address of the peer account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub local: Option<String>,
    pub domain: String,
    pub resource: Option<String>,
}

impl Address {
    pub fn new(local: &str, domain: &str) -> Self {
        Self {
            local: (!local.is_empty()).then(|| local.to_string()),
            domain: domain.to_string(),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = (!resource.is_empty()).then(|| resource.to_string());
        self
    }

    /// The address stripped of its resource.
    pub fn bare(&self) -> Self {
        Self {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// True when both addresses belong to the same account.
    pub fn is_same_account(&self, other: &Address) -> bool {
        self.local == other.local && self.domain == other.domain
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match s.split_once('/') {
            Some((b, r)) => (b, Some(r)),
            None => (s, None),
        };
        let (local, domain) = match bare.split_once('@') {
            Some((l, d)) => (Some(l), d),
            None => (None, bare),
        };
        if domain.is_empty() {
            return Err(AddressError::EmptyDomain(s.to_string()));
        }
        if local.is_some_and(str::is_empty) || resource.is_some_and(str::is_empty) {
            return Err(AddressError::InvalidFormat(s.to_string()));
        }
        Ok(Self {
            local: local.map(str::to_string),
            domain: domain.to_string(),
            resource: resource.map(str::to_string),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{local}@")?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::from_str(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_address() {
        let addr: Address = "juliet@capulet.lit/balcony".parse().unwrap();
        assert_eq!(addr.local.as_deref(), Some("juliet"));
        assert_eq!(addr.domain, "capulet.lit");
        assert_eq!(addr.resource.as_deref(), Some("balcony"));
        assert!(addr.is_full());
        assert_eq!(addr.to_string(), "juliet@capulet.lit/balcony");
    }

    #[test]
    fn test_resource_may_contain_separators() {
        let addr: Address = "romeo@montague.lit/orchard/a@b".parse().unwrap();
        assert_eq!(addr.resource.as_deref(), Some("orchard/a@b"));
        assert_eq!(addr.bare().to_string(), "romeo@montague.lit");
    }

    #[test]
    fn test_domain_only() {
        let addr: Address = "montague.lit".parse().unwrap();
        assert!(addr.local.is_none());
        assert!(addr.is_bare());
        assert_eq!(addr.to_string(), "montague.lit");
    }

    #[test]
    fn test_invalid_addresses() {
        assert!("@montague.lit".parse::<Address>().is_err());
        assert!("romeo@".parse::<Address>().is_err());
        assert!("romeo@montague.lit/".parse::<Address>().is_err());
    }

    #[test]
    fn test_same_account() {
        let phone: Address = "romeo@montague.lit/phone".parse().unwrap();
        let laptop: Address = "romeo@montague.lit/laptop".parse().unwrap();
        assert!(phone.is_same_account(&laptop));
        assert_ne!(phone, laptop);
        assert_eq!(phone.bare(), laptop.bare());
    }
}
