//! Call sign handling.
//!
//! A call sign is up to six characters of `[A-Z0-9/]`, optionally followed
//! by `-` and a numeric SSID in 0..=15. `N0CALL` and `n0call` are the same
//! station; everything is canonicalized to upper case on construction so
//! that no lowercase call ever reaches the wire.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A station address: base call sign plus SSID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    base: String,
    ssid: u8,
}

impl Addr {
    /// Parse and validate a call sign, with or without `-SSID` suffix.
    pub fn new(s: &str) -> Result<Self> {
        let bad = |reason| Error::BadCallSign {
            call: s.to_string(),
            reason,
        };
        let (base, ssid) = match s.split_once('-') {
            None => (s, 0u8),
            Some((base, ssid)) => {
                let ssid: u8 = ssid.parse().map_err(|_| bad("SSID is not a number"))?;
                if ssid > 15 {
                    return Err(bad("SSID out of range 0-15"));
                }
                (base, ssid)
            }
        };
        if base.is_empty() {
            return Err(bad("empty call sign"));
        }
        if base.len() > 6 {
            return Err(bad("more than six characters"));
        }
        let base = base.to_ascii_uppercase();
        if !base
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'/')
        {
            return Err(bad("characters outside A-Z, 0-9 and /"));
        }
        Ok(Self { base, ssid })
    }

    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    #[must_use]
    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// The canonical string form, `BASE` or `BASE-SSID`.
    #[must_use]
    pub fn call(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.base)
        } else {
            write!(f, "{}-{}", self.base, self.ssid)
        }
    }
}

impl FromStr for Addr {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Addr::new(s)
    }
}
