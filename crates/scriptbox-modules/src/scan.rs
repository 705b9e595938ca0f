// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lexical scanning for module specifiers.
//!
//! This is a pattern match over source text, not a parse: occurrences inside
//! comments or string literals are matched too.

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

/// One specifier occurrence and its byte range (quotes excluded)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecifierRef {
    pub specifier: String,
    pub range: Range<usize>,
}

fn specifier_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // import x from '…' / export { y } from '…'
            Regex::new(r#"\bfrom\s*(?:'([^'\r\n]+)'|"([^"\r\n]+)")"#).unwrap(),
            // import '…'
            Regex::new(r#"\bimport\s*(?:'([^'\r\n]+)'|"([^"\r\n]+)")"#).unwrap(),
            // import('…')
            Regex::new(r#"\bimport\s*\(\s*(?:'([^'\r\n]+)'|"([^"\r\n]+)")\s*\)"#).unwrap(),
        ]
    })
}

fn module_syntax_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)^[ \t]*(?:import[\s{*'\x22]|export\s)").unwrap())
}

/// All specifier occurrences in source order
pub fn scan_specifiers(source: &str) -> Vec<SpecifierRef> {
    let mut refs: Vec<SpecifierRef> = specifier_patterns()
        .iter()
        .flat_map(|pattern| pattern.captures_iter(source))
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| SpecifierRef {
            specifier: m.as_str().to_string(),
            range: m.range(),
        })
        .collect();
    refs.sort_by_key(|r| r.range.start);
    refs.dedup_by_key(|r| r.range.start);
    refs
}

/// Distinct specifiers in first-encountered order
pub fn unique_specifiers(refs: &[SpecifierRef]) -> Vec<&str> {
    let mut seen = Vec::new();
    for r in refs {
        if !seen.contains(&r.specifier.as_str()) {
            seen.push(r.specifier.as_str());
        }
    }
    seen
}

/// Replace each occurrence for which `replacement` returns a value
pub fn rewrite<F>(source: &str, refs: &[SpecifierRef], mut replacement: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for r in refs {
        if let Some(new) = replacement(&r.specifier) {
            out.push_str(&source[cursor..r.range.start]);
            out.push_str(&new);
            cursor = r.range.end;
        }
    }
    out.push_str(&source[cursor..]);
    out
}

/// True when the source appears to use module-dialect syntax
pub fn looks_like_module_syntax(source: &str) -> bool {
    module_syntax_pattern().is_match(source)
}
