//! Flight categories and airport identifiers.

use std::fmt;

use serde::{Serialize, Serializer};

/// Coarse ceiling/visibility classification of a METAR.
///
/// Ordered from "no data" through worst to best conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Category {
    #[default]
    Unknown,
    Lifr,
    Ifr,
    Mvfr,
    Vfr,
    /// Locate/override marker set by the painting layer; never produced by a fetch.
    Identify,
}

impl Category {
    /// Parse an upstream category string (case-insensitive, surrounding whitespace ignored).
    ///
    /// Anything other than the four flight categories maps to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("VFR") {
            Category::Vfr
        } else if raw.eq_ignore_ascii_case("MVFR") {
            Category::Mvfr
        } else if raw.eq_ignore_ascii_case("IFR") {
            Category::Ifr
        } else if raw.eq_ignore_ascii_case("LIFR") {
            Category::Lifr
        } else {
            Category::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Unknown => "UNKNOWN",
            Category::Lifr => "LIFR",
            Category::Ifr => "IFR",
            Category::Mvfr => "MVFR",
            Category::Vfr => "VFR",
            Category::Identify => "IDENTIFY",
        }
    }

    /// True for the four flight categories.
    pub fn is_known(self) -> bool {
        matches!(
            self,
            Category::Lifr | Category::Ifr | Category::Mvfr | Category::Vfr
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A 4-character ICAO airport identifier, stored upper-case.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Icao([u8; 4]);

impl Icao {
    /// Normalize and validate a raw identifier.
    ///
    /// Trims whitespace and upper-cases; returns `None` unless exactly four
    /// ASCII alphanumerics remain.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().as_bytes();
        if raw.len() != 4 {
            return None;
        }

        let mut code = [0u8; 4];
        for (slot, byte) in code.iter_mut().zip(raw) {
            if !byte.is_ascii_alphanumeric() {
                return None;
            }
            *slot = byte.to_ascii_uppercase();
        }

        Some(Self(code))
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII alphanumerics are ever stored.
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Display for Icao {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Icao {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Icao({})", self.as_str())
    }
}

impl Serialize for Icao {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_categories_round_trip() {
        for cat in [Category::Vfr, Category::Mvfr, Category::Ifr, Category::Lifr] {
            assert_eq!(Category::parse(cat.as_str()), cat);
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Category::parse("ifr"), Category::Ifr);
        assert_eq!(Category::parse(" Mvfr "), Category::Mvfr);
    }

    #[test]
    fn unrecognized_category_is_unknown() {
        assert_eq!(Category::parse("SVFR"), Category::Unknown);
        assert_eq!(Category::parse(""), Category::Unknown);
        assert_eq!(Category::parse("SVFR").as_str(), "UNKNOWN");
        // The override marker is never accepted from upstream.
        assert_eq!(Category::parse("IDENTIFY"), Category::Unknown);
    }

    #[test]
    fn only_flight_categories_are_known() {
        assert!(Category::Vfr.is_known());
        assert!(!Category::Unknown.is_known());
        assert!(!Category::Identify.is_known());
    }

    #[test]
    fn icao_normalizes_case_and_whitespace() {
        let icao = Icao::parse(" khio ").unwrap();

        assert_eq!(icao.as_str(), "KHIO");
    }

    #[test]
    fn icao_rejects_wrong_length_and_symbols() {
        assert!(Icao::parse("PDX").is_none());
        assert!(Icao::parse("KPDXX").is_none());
        assert!(Icao::parse("KP-X").is_none());
        assert!(Icao::parse("").is_none());
    }
}
