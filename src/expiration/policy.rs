// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Expire spec grammar.
//!
//! ```text
//! spec  := [sign] digits [unit]
//! sign  := "+"            one-shot: armed on writes, never re-armed by reads
//!        | "-"            forced override: replaces any armed proxy
//! unit  := "ms" | "s" | "m" | "h" | "d"     (default: seconds)
//!
//! "3600"  → Sliding(1h)      "+30m" → OneShot(30m)
//! "-5s"   → ForcedOverride   "0"    → NoExpiration
//! ```

use std::time::Duration;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirePolicy {
    Sliding(Duration),
    OneShot(Duration),
    ForcedOverride(Duration),
    NoExpiration,
}

impl ExpirePolicy {
    /// Parse a spec; an empty spec falls back to `default`.
    pub fn resolve(spec: &str, default: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            Self::parse(default)
        } else {
            Self::parse(spec)
        }
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let invalid = || EngineError::bad_request(format!("invalid expire spec '{}'", spec));

        let (sign, rest) = match spec.as_bytes().first() {
            Some(b'+') => (Some('+'), &spec[1..]),
            Some(b'-') => (Some('-'), &spec[1..]),
            Some(_) => (None, spec),
            None => return Err(invalid()),
        };

        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (digits, unit) = rest.split_at(digits_end);
        if digits.is_empty() {
            return Err(invalid());
        }
        let magnitude: u64 = digits.parse().map_err(|_| invalid())?;

        let millis_per_unit: u64 = match unit {
            "ms" => 1,
            "" | "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => return Err(invalid()),
        };
        let millis = magnitude.checked_mul(millis_per_unit).ok_or_else(invalid)?;
        if millis == 0 {
            return Ok(Self::NoExpiration);
        }

        let duration = Duration::from_millis(millis);
        Ok(match sign {
            None => Self::Sliding(duration),
            Some('+') => Self::OneShot(duration),
            Some(_) => Self::ForcedOverride(duration),
        })
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Sliding(d) | Self::OneShot(d) | Self::ForcedOverride(d) => Some(*d),
            Self::NoExpiration => None,
        }
    }

    /// Signed specs replace an already armed proxy.
    pub fn replaces_existing(&self) -> bool {
        matches!(self, Self::OneShot(_) | Self::ForcedOverride(_))
    }
}

/// Drop the sign of a spec: `"-5m"` → `"5m"`.
pub fn unsigned_spec(spec: &str) -> &str {
    let spec = spec.trim();
    spec.strip_prefix(['+', '-']).unwrap_or(spec)
}
