//! Lightweight Julia signature scanning.
//!
//! Not a parser: recognises `function name(args)` and the short form
//! `name(args) = expr`, which covers the snippets stored in practice.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionParameter {
    pub name: String,
    pub type_annotation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: String,
    pub parameters: Vec<FunctionParameter>,
    /// Zero-based line index of the declaration.
    pub line: usize,
}

static LONG_FORM_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*function\s+([A-Za-z_][A-Za-z0-9_!]*)\s*\(([^)]*)\)")
        .expect("hardcoded long-form signature regex")
});

static SHORT_FORM_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_!]*)\s*\(([^)]*)\)\s*=([^=]|$)")
        .expect("hardcoded short-form signature regex")
});

/// Every declaration found in `code`, in source order.
pub fn scan_signatures(code: &str) -> Vec<FunctionSignature> {
    code.lines()
        .enumerate()
        .filter_map(|(line, text)| {
            let captures = LONG_FORM_REGEX
                .captures(text)
                .or_else(|| SHORT_FORM_REGEX.captures(text))?;
            Some(FunctionSignature {
                name: captures[1].to_string(),
                parameters: parse_parameters(&captures[2]),
                line,
            })
        })
        .collect()
}

/// The first declaration in `code`.
pub fn parse_signature(code: &str) -> Option<FunctionSignature> {
    scan_signatures(code).into_iter().next()
}

/// Splits a raw parameter list, dropping defaults, splats and keyword arguments.
pub fn parse_parameters(raw: &str) -> Vec<FunctionParameter> {
    let positional = raw.split(';').next().unwrap_or_default();
    positional
        .split(',')
        .filter_map(|piece| {
            let without_default = piece.split('=').next().unwrap_or_default();
            let mut parts = without_default.splitn(2, "::");
            let name = parts.next().unwrap_or_default().trim().trim_end_matches("...");
            let type_annotation = parts
                .next()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty());
            is_identifier(name).then(|| FunctionParameter {
                name: name.to_string(),
                type_annotation,
            })
        })
        .collect()
}

fn is_identifier(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_alphanumeric() || ch == '_' || ch == '!')
}
