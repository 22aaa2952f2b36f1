//! Syntax check for version constraints such as `>=1.2.0, <2`, `~1.4`,
//! `1.x || 2.0.0 - 2.3.0`.
//!
//! The constraint is evaluated by the cluster; this only rejects strings the
//! cluster would refuse, before anything is written.

use crate::{Error, Result};

const OPERATORS: &[&str] = &[">=", "<=", "!=", "~>", "=>", "=<", ">", "<", "=", "~", "^"];

pub fn validate(input: &str) -> Result<()> {
    let invalid = |reason: &str| Error::Validation(format!("invalid version range {input:?}: {reason}"));

    if input.trim().is_empty() {
        return Err(invalid("empty"));
    }

    for alternative in input.split("||") {
        let alternative = alternative.trim();
        if alternative.is_empty() {
            return Err(invalid("empty alternative"));
        }

        if let Some((low, high)) = alternative.split_once(" - ") {
            version(low.trim()).map_err(|r| invalid(&r))?;
            version(high.trim()).map_err(|r| invalid(&r))?;
            continue;
        }

        for term in alternative.split(|c: char| c == ',' || c.is_whitespace()) {
            if term.is_empty() {
                continue;
            }
            let rest = OPERATORS
                .iter()
                .find_map(|op| term.strip_prefix(op))
                .unwrap_or(term);
            version(rest).map_err(|r| invalid(&r))?;
        }
    }
    Ok(())
}

/// `1`, `1.2`, `1.2.3`, with `x`/`X`/`*` wildcards and an optional
/// pre-release or build suffix.
fn version(s: &str) -> std::result::Result<(), String> {
    let s = s.strip_prefix('v').unwrap_or(s);
    if s.is_empty() {
        return Err("missing version".to_string());
    }

    let core_end = s.find(['-', '+']).unwrap_or(s.len());
    let (core, suffix) = s.split_at(core_end);

    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 {
        return Err(format!("{s:?} has more than three components"));
    }
    for part in &parts {
        let wildcard = matches!(*part, "x" | "X" | "*");
        if !wildcard && (part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit())) {
            return Err(format!("{s:?} is not a version"));
        }
    }

    if suffix.len() == 1 {
        return Err(format!("{s:?} has an empty pre-release or build"));
    }
    if !suffix
        .chars()
        .skip(1)
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+'))
    {
        return Err(format!("{s:?} has an invalid pre-release or build"));
    }
    Ok(())
}
