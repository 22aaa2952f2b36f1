//! Label selector strings (`app=x,tier in (a,b),!legacy`) to `LabelSelector`.
//!
//! Selectors handed to list calls are passed through to the API server as
//! strings. Selectors stored on objects are parsed here and compared in a
//! normalized form so that equivalent spellings never count as a change.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::{Error, Result};

pub fn parse(input: &str) -> Result<LabelSelector> {
    let mut match_labels = BTreeMap::new();
    let mut match_expressions = Vec::new();

    for term in split_terms(input)? {
        let term = term.trim();
        if term.is_empty() {
            return Err(invalid(input, "empty requirement"));
        }

        if let Some(key) = term.strip_prefix('!') {
            match_expressions.push(requirement(input, key, "DoesNotExist", None)?);
        } else if let Some((key, values)) = split_set(term, " notin ") {
            match_expressions.push(requirement(input, key, "NotIn", Some(parse_values(input, values)?))?);
        } else if let Some((key, values)) = split_set(term, " in ") {
            match_expressions.push(requirement(input, key, "In", Some(parse_values(input, values)?))?);
        } else if let Some((key, value)) = term.split_once("!=") {
            match_expressions.push(requirement(input, key, "NotIn", Some(vec![value.trim().to_string()]))?);
        } else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
            let key = validate_key(input, key)?;
            match_labels.insert(key, value.trim().to_string());
        } else {
            match_expressions.push(requirement(input, term, "Exists", None)?);
        }
    }

    Ok(LabelSelector {
        match_labels: (!match_labels.is_empty()).then_some(match_labels),
        match_expressions: (!match_expressions.is_empty()).then_some(match_expressions),
    })
}

/// Order-independent view of a selector, for equality checks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedSelector {
    labels: BTreeMap<String, String>,
    expressions: BTreeSet<(String, String, Vec<String>)>,
}

pub fn normalize(selector: Option<&LabelSelector>) -> NormalizedSelector {
    let Some(selector) = selector else {
        return NormalizedSelector::default();
    };

    let labels = selector.match_labels.clone().unwrap_or_default();
    let expressions = selector
        .match_expressions
        .iter()
        .flatten()
        .map(|req| {
            let mut values = req.values.clone().unwrap_or_default();
            values.sort();
            values.dedup();
            (req.key.clone(), req.operator.clone(), values)
        })
        .collect();

    NormalizedSelector { labels, expressions }
}

/// Splits on commas that are not inside a parenthesised value set.
fn split_terms(input: &str) -> Result<Vec<&str>> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| invalid(input, "unbalanced parenthesis"))?;
            }
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(invalid(input, "unbalanced parenthesis"));
    }
    terms.push(&input[start..]);
    Ok(terms)
}

fn split_set<'a>(term: &'a str, operator: &str) -> Option<(&'a str, &'a str)> {
    let (key, rest) = term.split_once(operator)?;
    Some((key, rest.trim()))
}

fn parse_values(input: &str, set: &str) -> Result<Vec<String>> {
    let inner = set
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| invalid(input, "value set must be parenthesised"))?;

    let values: Vec<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();

    if values.is_empty() {
        return Err(invalid(input, "value set is empty"));
    }
    Ok(values)
}

fn requirement(
    input: &str,
    key: &str,
    operator: &str,
    values: Option<Vec<String>>,
) -> Result<LabelSelectorRequirement> {
    Ok(LabelSelectorRequirement {
        key: validate_key(input, key)?,
        operator: operator.to_string(),
        values,
    })
}

fn validate_key(input: &str, key: &str) -> Result<String> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(invalid(input, &format!("invalid label key {key:?}")));
    }
    Ok(key.to_string())
}

fn invalid(input: &str, reason: &str) -> Error {
    Error::Validation(format!("invalid label selector {input:?}: {reason}"))
}
