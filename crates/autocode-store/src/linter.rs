//! Julia compatibility linter.
//!
//! Two rules: JS-style regex literals (`/.../u`) and parameters that shadow
//! Julia builtins. Only the shadowing rule has an automatic fix.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::signature::{parse_parameters, scan_signatures};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LintSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintIssue {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    /// One-based.
    pub line: usize,
    pub column: usize,
    pub severity: LintSeverity,
    pub can_fix: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintReport {
    pub issues: Vec<LintIssue>,
    pub fixed_code: Option<String>,
    pub success: bool,
}

impl LintReport {
    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == LintSeverity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == LintSeverity::Warning)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinterConfig {
    pub shadow_suffix: String,
    pub block_unsafe: bool,
    pub allow_warnings: bool,
    pub auto_fix: bool,
    pub strict_mode: bool,
}

impl Default for LinterConfig {
    fn default() -> Self {
        Self {
            shadow_suffix: "_".to_string(),
            block_unsafe: true,
            allow_warnings: true,
            auto_fix: true,
            strict_mode: false,
        }
    }
}

/// Gatekeeper for code entering the store.
pub trait CodeLinter: Send + Sync {
    fn lint(&self, code: &str, fix: bool) -> LintReport;
}

const JULIA_BUILTINS: &[&str] = &[
    "Int", "Float64", "String", "Bool", "Char", "Array", "Vector", "Matrix", "Dict", "Set",
    "Tuple", "Union", "Any", "Nothing", "Missing", "print", "println", "length", "size", "sum",
    "prod", "min", "max", "sort", "filter", "map", "reduce", "findfirst", "findall", "replace",
    "split", "join", "strip", "parse", "string", "convert", "typeof", "isa", "eltype",
];

const JS_ONLY_REGEX_FLAGS: &[char] = &['u', 'y'];

static JS_REGEX_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/((?:[^/\\\n]|\\.)+)/([A-Za-z]+)").expect("hardcoded js regex literal regex")
});

static ANONYMOUS_PARAMETERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^()]*)\)\s*->").expect("hardcoded lambda regex"));

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:[^"\\]|\\.)*""#).expect("hardcoded string literal regex"));

#[derive(Debug, Clone)]
pub struct CompatibilityLinter {
    config: LinterConfig,
    builtins: BTreeSet<&'static str>,
}

impl Default for CompatibilityLinter {
    fn default() -> Self {
        Self::new(LinterConfig::default())
    }
}

impl CompatibilityLinter {
    pub fn new(config: LinterConfig) -> Self {
        Self {
            config,
            builtins: JULIA_BUILTINS.iter().copied().collect(),
        }
    }

    pub fn config(&self) -> &LinterConfig {
        &self.config
    }

    fn regex_literal_issues(&self, code: &str) -> Vec<LintIssue> {
        let mut issues = Vec::new();
        for (index, line) in code.lines().enumerate() {
            for captures in JS_REGEX_LITERAL.captures_iter(line) {
                let Some(whole) = captures.get(0) else {
                    continue;
                };
                if is_division_context(&line[..whole.start()]) {
                    continue;
                }
                let flags = &captures[2];
                let (kind, severity, detail) = if flags.contains(JS_ONLY_REGEX_FLAGS) {
                    (
                        "unsupported_regex_flags",
                        LintSeverity::Error,
                        "uses flags not supported in Julia. Use r\"pattern\"flags syntax instead.",
                    )
                } else {
                    (
                        "js_regex_syntax",
                        LintSeverity::Warning,
                        "should be converted to Julia r\"pattern\"flags syntax.",
                    )
                };
                issues.push(LintIssue {
                    kind: kind.to_string(),
                    message: format!("JS-style regex '{}' {detail}", whole.as_str()),
                    line: index + 1,
                    column: whole.start(),
                    severity,
                    can_fix: false,
                    fix_suggestion: None,
                });
            }
        }
        issues
    }

    fn shadowing_issues(&self, code: &str) -> Vec<LintIssue> {
        let mut seen = BTreeSet::new();
        let mut issues = Vec::new();
        let mut record = |line: usize, column: usize, name: String| {
            if !self.builtins.contains(name.as_str()) || !seen.insert((line, name.clone())) {
                return;
            }
            issues.push(LintIssue {
                kind: "parameter_shadowing".to_string(),
                message: format!("Parameter '{name}' shadows Julia built-in. Consider renaming."),
                line,
                column,
                severity: LintSeverity::Warning,
                can_fix: true,
                fix_suggestion: Some(format!(
                    "Rename parameter to '{name}{}'",
                    self.config.shadow_suffix
                )),
            });
        };

        for signature in scan_signatures(code) {
            for parameter in signature.parameters {
                record(signature.line + 1, 0, parameter.name);
            }
        }
        for (index, line) in code.lines().enumerate() {
            for captures in ANONYMOUS_PARAMETERS.captures_iter(line) {
                let column = captures.get(1).map(|group| group.start()).unwrap_or(0);
                for parameter in parse_parameters(&captures[1]) {
                    record(index + 1, column, parameter.name);
                }
            }
        }
        issues
    }

    /// Renames each shadowing parameter within its function: the signature line
    /// through the matching `end`, or just the line for one-line forms.
    fn apply_fixes(&self, code: &str, issues: &[LintIssue]) -> String {
        let mut lines = code.lines().map(str::to_string).collect::<Vec<_>>();
        for issue in issues.iter().filter(|issue| issue.can_fix) {
            let Some(old_name) = quoted_name(&issue.message) else {
                continue;
            };
            let new_name = format!("{old_name}{}", self.config.shadow_suffix);
            let start = issue.line.saturating_sub(1);
            if start >= lines.len() {
                continue;
            }
            let end = function_end(&lines, start);
            for line in lines.iter_mut().take(end + 1).skip(start) {
                *line = rename_identifier(line, old_name, &new_name);
            }
        }
        let mut fixed = lines.join("\n");
        if code.ends_with('\n') {
            fixed.push('\n');
        }
        fixed
    }
}

impl CodeLinter for CompatibilityLinter {
    fn lint(&self, code: &str, fix: bool) -> LintReport {
        let mut issues = self.regex_literal_issues(code);
        issues.extend(self.shadowing_issues(code));

        let fixed_code = (fix && self.config.auto_fix && issues.iter().any(|issue| issue.can_fix))
            .then(|| self.apply_fixes(code, &issues));

        let mut report = LintReport {
            issues,
            fixed_code,
            success: true,
        };
        let has_errors = report.has_errors();
        let has_warnings = report.has_warnings();
        report.success = !((self.config.block_unsafe && has_errors)
            || (!self.config.allow_warnings && has_warnings)
            || (self.config.strict_mode && (has_errors || has_warnings)));
        report
    }
}

// `a / b / c` is arithmetic, not a regex literal.
fn is_division_context(prefix: &str) -> bool {
    prefix
        .trim_end()
        .chars()
        .last()
        .is_some_and(|ch| ch.is_alphanumeric() || matches!(ch, '_' | ')' | ']' | '.'))
}

fn quoted_name(message: &str) -> Option<&str> {
    let start = message.find('\'')? + 1;
    let len = message[start..].find('\'')?;
    Some(&message[start..start + len])
}

fn function_end(lines: &[String], start: usize) -> usize {
    let header = lines[start].trim_start();
    if !header.starts_with("function ") {
        return start;
    }
    let indent = lines[start].len() - header.len();
    lines
        .iter()
        .enumerate()
        .skip(start + 1)
        .find(|(_, line)| line.trim() == "end" && line.len() - line.trim_start().len() == indent)
        .map(|(index, _)| index)
        .unwrap_or(lines.len().saturating_sub(1))
}

/// Word-boundary rename outside string literals, leaving calls (`name(`) alone
/// so builtin invocations inside the body keep working.
fn rename_identifier(line: &str, old_name: &str, new_name: &str) -> String {
    let Ok(word) = Regex::new(&format!(r"\b{}\b", regex::escape(old_name))) else {
        return line.to_string();
    };
    let mut output = String::with_capacity(line.len() + new_name.len());
    let mut cursor = 0;
    for literal in STRING_LITERAL.find_iter(line) {
        output.push_str(&rename_segment(&word, &line[cursor..literal.start()], new_name));
        output.push_str(literal.as_str());
        cursor = literal.end();
    }
    output.push_str(&rename_segment(&word, &line[cursor..], new_name));
    output
}

fn rename_segment(word: &Regex, segment: &str, new_name: &str) -> String {
    let mut output = String::with_capacity(segment.len());
    let mut cursor = 0;
    for found in word.find_iter(segment) {
        let is_call = segment[found.end()..].trim_start().starts_with('(');
        output.push_str(&segment[cursor..found.start()]);
        output.push_str(if is_call { found.as_str() } else { new_name });
        cursor = found.end();
    }
    output.push_str(&segment[cursor..]);
    output
}
