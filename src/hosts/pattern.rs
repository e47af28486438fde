//! Host pattern expansion
//!
//! Expands bracketed host patterns like `web[01-03].idc[1,3]` into concrete
//! host names. Expansion is deterministic: groups multiply left-to-right and
//! the output order is the Cartesian product order.

use crate::error::{Result, RunnerError};
use std::collections::HashSet;

/// One parsed segment of a pattern: a literal run or an expanded group.
enum Segment {
    Literal(String),
    Group(Vec<String>),
}

/// Expand a single host pattern into concrete host names.
///
/// A bracket group has the grammar `[ ITEM ("," ITEM)* ]` where each ITEM is
/// either a plain token or a numeric range `A-B` with A <= B. When A or B is
/// zero-padded, produced values are padded to the wider of the two.
///
/// Errors on unbalanced brackets, an empty group, or a reversed range.
pub fn expand(pattern: &str) -> Result<Vec<String>> {
    let segments = parse_segments(pattern)?;

    let mut hosts = vec![String::new()];
    for segment in &segments {
        match segment {
            Segment::Literal(text) => {
                for host in &mut hosts {
                    host.push_str(text);
                }
            }
            Segment::Group(items) => {
                let mut next = Vec::with_capacity(hosts.len() * items.len());
                for host in &hosts {
                    for item in items {
                        let mut combined = host.clone();
                        combined.push_str(item);
                        next.push(combined);
                    }
                }
                hosts = next;
            }
        }
    }

    if hosts.iter().any(|h| h.is_empty()) {
        return Err(RunnerError::pattern(pattern, "expansion produced an empty host"));
    }

    Ok(hosts)
}

/// Expand a list of patterns and deduplicate the concatenation, preserving
/// first-seen order.
pub fn expand_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();

    for pattern in patterns {
        for host in expand(pattern.as_ref())? {
            if seen.insert(host.clone()) {
                hosts.push(host);
            }
        }
    }

    Ok(hosts)
}

fn parse_segments(pattern: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '[' => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }

                let mut body = String::new();
                let mut closed = false;
                for g in chars.by_ref() {
                    match g {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '[' => {
                            return Err(RunnerError::pattern(pattern, "nested '[' in group"));
                        }
                        other => body.push(other),
                    }
                }
                if !closed {
                    return Err(RunnerError::pattern(pattern, "unbalanced '['"));
                }

                segments.push(Segment::Group(expand_group(pattern, &body)?));
            }
            ']' => {
                return Err(RunnerError::pattern(pattern, "unbalanced ']'"));
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    Ok(segments)
}

/// Expand the comma-separated body of one bracket group.
fn expand_group(pattern: &str, body: &str) -> Result<Vec<String>> {
    if body.trim().is_empty() {
        return Err(RunnerError::pattern(pattern, "empty group"));
    }

    let mut items = Vec::new();
    for item in body.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(RunnerError::pattern(pattern, "empty item in group"));
        }

        match parse_numeric_range(item) {
            Some((start, end, width)) => {
                if start > end {
                    return Err(RunnerError::pattern(
                        pattern,
                        format!("reversed range '{item}'"),
                    ));
                }
                for n in start..=end {
                    items.push(format!("{n:0width$}"));
                }
            }
            // Tokens pass through untouched, including ones containing '-'.
            None => items.push(item.to_string()),
        }
    }

    Ok(items)
}

/// Parse `A-B` where both sides are decimal. Returns `(A, B, pad_width)`;
/// the width is 1 (no padding) unless a side carries leading zeros, in which
/// case it is the wider of the two notations.
fn parse_numeric_range(item: &str) -> Option<(u64, u64, usize)> {
    let (a, b) = item.split_once('-')?;
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if !a.bytes().all(|c| c.is_ascii_digit()) || !b.bytes().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let start: u64 = a.parse().ok()?;
    let end: u64 = b.parse().ok()?;

    let zero_padded = |s: &str| s.len() > 1 && s.starts_with('0');
    let width = if zero_padded(a) || zero_padded(b) {
        a.len().max(b.len())
    } else {
        1
    };

    Some((start, end, width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_literal_passthrough() {
        assert_eq!(expand("db01.example.com").unwrap(), vec!["db01.example.com"]);
    }

    #[test]
    fn test_padded_range_with_list_group() {
        let hosts = expand("foo[01-03].idc[1,3].bar").unwrap();
        assert_eq!(
            hosts,
            vec![
                "foo01.idc1.bar",
                "foo01.idc3.bar",
                "foo02.idc1.bar",
                "foo02.idc3.bar",
                "foo03.idc1.bar",
                "foo03.idc3.bar",
            ]
        );
    }

    #[test]
    fn test_cartesian_order() {
        let hosts = expand("foo[01-03].idc[1-2]").unwrap();
        assert_eq!(
            hosts,
            vec![
                "foo01.idc1",
                "foo01.idc2",
                "foo02.idc1",
                "foo02.idc2",
                "foo03.idc1",
                "foo03.idc2",
            ]
        );
    }

    #[test]
    fn test_unpadded_range() {
        let hosts = expand("n[8-11]").unwrap();
        assert_eq!(hosts, vec!["n8", "n9", "n10", "n11"]);
    }

    #[test]
    fn test_mixed_tokens_and_ranges() {
        let hosts = expand("[web,db]0[1-2]").unwrap();
        assert_eq!(hosts, vec!["web01", "web02", "db01", "db02"]);
    }

    #[test]
    fn test_token_with_dash_is_not_a_range() {
        let hosts = expand("[us-east,eu-west].node").unwrap();
        assert_eq!(hosts, vec!["us-east.node", "eu-west.node"]);
    }

    #[test]
    fn test_unbalanced_brackets() {
        assert!(expand("web[1-3").is_err());
        assert!(expand("web1-3]").is_err());
        assert!(expand("web[[1]]").is_err());
    }

    #[test]
    fn test_empty_group() {
        assert!(expand("web[]").is_err());
        assert!(expand("web[1,,3]").is_err());
    }

    #[test]
    fn test_reversed_range() {
        assert!(expand("web[5-2]").is_err());
    }

    #[test]
    fn test_expand_all_dedup_is_stable() {
        let hosts = expand_all(&["10.0.0.[1-2]", "10.0.0.1"]).unwrap();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_expand_all_preserves_first_seen_order() {
        let hosts = expand_all(&["b", "a[1-2]", "b", "a1"]).unwrap();
        assert_eq!(hosts, vec!["b", "a1", "a2"]);
    }

    proptest! {
        /// Output length equals the product of group sizes.
        #[test]
        fn prop_expansion_count(a in 1u64..20, b in 1u64..10) {
            let pattern = format!("h[1-{a}].d[1-{b}]");
            let hosts = expand(&pattern).unwrap();
            prop_assert_eq!(hosts.len() as u64, a * b);
        }

        /// Expansion of a range pattern never produces duplicates.
        #[test]
        fn prop_expansion_unique(a in 1u64..30) {
            let pattern = format!("h[1-{a}]");
            let hosts = expand(&pattern).unwrap();
            let unique: std::collections::HashSet<_> = hosts.iter().collect();
            prop_assert_eq!(unique.len(), hosts.len());
        }
    }
}
