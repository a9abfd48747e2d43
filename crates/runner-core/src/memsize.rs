//! Parsing and canonical formatting for the memory-size grammar used
//! throughout the config file: `\d+(\.\d+)?\s*(B|kB|MB|...|Ki|Mi|...)?`.
//!
//! A bare number (no suffix) is interpreted as a byte count.

use crate::error::ConfigError;

const DECIMAL_UNITS: &[(&str, u64)] = &[
    ("EB", 1_000_000_000_000_000_000),
    ("PB", 1_000_000_000_000_000),
    ("TB", 1_000_000_000_000),
    ("GB", 1_000_000_000),
    ("MB", 1_000_000),
    ("kB", 1_000),
    ("B", 1),
];

const BINARY_UNITS: &[(&str, u64)] = &[
    ("EiB", 1u64 << 60),
    ("PiB", 1u64 << 50),
    ("TiB", 1u64 << 40),
    ("GiB", 1u64 << 30),
    ("MiB", 1u64 << 20),
    ("KiB", 1u64 << 10),
    ("Ei", 1u64 << 60),
    ("Pi", 1u64 << 50),
    ("Ti", 1u64 << 40),
    ("Gi", 1u64 << 30),
    ("Mi", 1u64 << 20),
    ("Ki", 1u64 << 10),
];

/// Parse a memory-size string (e.g. `"2 GiB"`, `"4GB"`, `"1048576"`) into a
/// byte count. Units are matched longest-first so `"MiB"` is not mistaken
/// for `"Mi"` with a trailing `B`.
pub fn parse_bytes(raw: &str) -> Result<u64, ConfigError> {
    let trimmed = raw.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number_part, rest) = trimmed.split_at(digits_end);
    if number_part.is_empty() {
        return Err(invalid(raw, "missing numeric component"));
    }
    let number: f64 = number_part
        .parse()
        .map_err(|_| invalid(raw, "unparseable numeric component"))?;

    let unit_part = rest.trim_start();
    if unit_part.is_empty() {
        if number.fract() != 0.0 {
            return Err(invalid(raw, "fractional byte counts require a unit"));
        }
        return Ok(number as u64);
    }

    let mut units: Vec<&(&str, u64)> = DECIMAL_UNITS.iter().chain(BINARY_UNITS.iter()).collect();
    units.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));

    for (name, multiplier) in units {
        if *name == unit_part {
            let bytes = number * (*multiplier as f64);
            if bytes < 0.0 || bytes > u64::MAX as f64 {
                return Err(invalid(raw, "value out of range"));
            }
            return Ok(bytes.round() as u64);
        }
    }

    Err(invalid(raw, &format!("unrecognized unit `{unit_part}`")))
}

fn invalid(raw: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidMemorySize {
        raw: raw.to_string(),
        detail: detail.to_string(),
    }
}

/// Render a byte count using the canonical binary (`GiB`/`MiB`/...) unit
/// that evenly divides it, falling back to plain bytes. Used for
/// round-tripping configuration values back into rendered templates and
/// status fields.
pub fn format_bytes(bytes: u64) -> String {
    for (name, multiplier) in BINARY_UNITS.iter().filter(|(n, _)| n.ends_with("iB")) {
        if bytes != 0 && bytes % multiplier == 0 {
            return format!("{} {name}", bytes / multiplier);
        }
    }
    format!("{bytes} B")
}

/// Serde helpers so `Config` fields can be declared as plain `u64` while the
/// YAML source carries a string like `"2 GiB"`.
pub mod serde_bytes {
    use std::fmt;

    use serde::{Deserializer, de::Visitor};

    struct BytesVisitor;

    impl Visitor<'_> for BytesVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte count, optionally suffixed with an SI/IEC unit")
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<u64, E> {
            super::parse_bytes(v).map_err(serde::de::Error::custom)
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| serde::de::Error::custom("negative byte count"))
        }

        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<u64, E> {
            Ok(v as u64)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_number_is_bytes() {
        assert_eq!(parse_bytes("2147483648").unwrap(), 2_147_483_648);
    }

    #[test]
    fn binary_suffixes() {
        assert_eq!(parse_bytes("2 GiB").unwrap(), 2u64 << 30);
        assert_eq!(parse_bytes("1024MiB").unwrap(), 1024 * (1u64 << 20));
        assert_eq!(parse_bytes("4Gi").unwrap(), 4u64 << 30);
    }

    #[test]
    fn decimal_suffixes() {
        assert_eq!(parse_bytes("1 GB").unwrap(), 1_000_000_000);
        assert_eq!(parse_bytes("1kB").unwrap(), 1_000);
    }

    #[test]
    fn fractional_with_unit() {
        assert_eq!(parse_bytes("1.5 GiB").unwrap(), (1.5 * (1u64 << 30) as f64) as u64);
    }

    #[test]
    fn rejects_fractional_bytes_without_unit() {
        assert!(parse_bytes("1.5").is_err());
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_bytes("5 XB").is_err());
    }

    #[test]
    fn idempotent_on_canonical_forms() {
        for canonical in ["1 GiB", "512 MiB", "2048 KiB"] {
            let bytes = parse_bytes(canonical).unwrap();
            let rendered = format_bytes(bytes);
            let reparsed = parse_bytes(&rendered).unwrap();
            assert_eq!(bytes, reparsed);
        }
    }

    #[test]
    fn format_prefers_largest_exact_unit() {
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1 GiB");
        assert_eq!(format_bytes(1024 * 1024), "1 MiB");
        assert_eq!(format_bytes(3), "3 B");
    }
}
