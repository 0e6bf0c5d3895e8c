//! Peer address validation.
//!
//! Peers are addressed by Tor v3 hidden-service hostnames: 56 base32
//! characters followed by `.onion`. Name resolution happens inside the
//! SOCKS proxy, so the dialer also tolerates arbitrary domain strings up
//! to the SOCKS limit of 255 bytes; the strict v3 check applies only
//! when the string claims to be an onion address.

use crate::error::{Error, Result};
use std::fmt;

/// Length of the base32 part of a v3 onion hostname.
const ONION_V3_LEN: usize = 56;

/// SOCKS5 domain names carry a one-byte length prefix.
const MAX_DOMAIN_LEN: usize = 255;

/// A validated peer address, dialable through the SOCKS proxy.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HiddenAddress(String);

impl HiddenAddress {
    /// Parse and validate a peer address string.
    ///
    /// Addresses ending in `.onion` must be well-formed v3 hostnames
    /// (56 base32 characters, lowercased on the wire). Anything else is
    /// accepted as an opaque domain as long as it fits in a SOCKS5
    /// domain field.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();

        if s.is_empty() {
            return Err(Error::Address("empty address".into()));
        }
        if s.len() > MAX_DOMAIN_LEN {
            return Err(Error::Address("address exceeds 255 bytes".into()));
        }

        if s.to_ascii_lowercase().ends_with(".onion") {
            if s.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(Error::Address("onion address must be lowercase".into()));
            }
            let base = &s[..s.len() - ".onion".len()];
            if base.len() != ONION_V3_LEN {
                return Err(Error::Address("v3 address must be 56 characters".into()));
            }
            if base32::decode(
                base32::Alphabet::Rfc4648 { padding: false },
                &base.to_uppercase(),
            )
            .is_none()
            {
                return Err(Error::Address("invalid base32 encoding".into()));
            }
        }

        Ok(Self(s))
    }

    /// The full address as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a hidden-service address rather than a plain domain.
    pub fn is_onion(&self) -> bool {
        self.0.ends_with(".onion")
    }
}

impl fmt::Display for HiddenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for HiddenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HiddenAddress({})", self.0)
    }
}
