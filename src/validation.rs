//! Dry-run validation: security screen, structural analysis and a light
//! style pass over code that is never executed.

use crate::analyzer::{AnalysisResult, StaticAnalyzer};
use crate::policy::Severity;
use crate::security::{mask_literals, SecurityReport, SecurityValidator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_LINE_LENGTH: usize = 120;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    pub code: String,
    /// Medium findings and syntax errors also make the code invalid
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub include_warnings: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StyleIssue {
    pub code: String,
    pub message: String,
    pub line: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StyleReport {
    pub issues: Vec<StyleIssue>,
    /// 100 minus a penalty per issue, floored at 0
    pub score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub security: SecurityReport,
    pub analysis: AnalysisResult,
    pub style: StyleReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

struct StylePatterns {
    wildcard_import: Regex,
    bare_except: Regex,
    semicolon: Regex,
    compare_none: Regex,
}

impl StylePatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            wildcard_import: Regex::new(r"^\s*from\s+[\w.]+\s+import\s+\*")?,
            bare_except: Regex::new(r"^\s*except\s*:")?,
            semicolon: Regex::new(r";\s*\S")?,
            compare_none: Regex::new(r"[=!]=\s*None\b")?,
        })
    }
}

pub struct CodeValidator {
    security: Arc<SecurityValidator>,
    analyzer: Arc<StaticAnalyzer>,
    patterns: Option<StylePatterns>,
}

impl CodeValidator {
    pub fn new(security: Arc<SecurityValidator>, analyzer: Arc<StaticAnalyzer>) -> Self {
        Self {
            security,
            analyzer,
            patterns: StylePatterns::new().ok(),
        }
    }

    pub fn validate(&self, request: &ValidationRequest) -> ValidationReport {
        let security = self.security.validate_code(&request.code);
        let analysis = self.analyzer.analyze(&request.code);
        let style = self.check_style(&request.code);

        let mut valid = security.allowed && !analysis.has_high_risk_patterns;
        if request.strict {
            let medium_risk = analysis
                .risks
                .iter()
                .any(|r| r.severity == Severity::Medium);
            valid = valid
                && security.warnings.is_empty()
                && !medium_risk
                && analysis.syntax_error.is_none();
        }

        let warnings = request.include_warnings.then(|| {
            let mut warnings = security.warnings.clone();
            warnings.extend(
                analysis
                    .risks
                    .iter()
                    .filter(|r| r.severity != Severity::High)
                    .map(|r| format!("line {}: {}", r.line, r.description)),
            );
            if let Some(error) = &analysis.syntax_error {
                warnings.push(format!("syntax: {error}"));
            }
            warnings.extend(
                style
                    .issues
                    .iter()
                    .map(|i| format!("line {}: {} ({})", i.line, i.message, i.code)),
            );
            warnings
        });

        ValidationReport {
            valid,
            security,
            analysis,
            style,
            warnings,
        }
    }

    /// Line-oriented lint using pycodestyle/pyflakes codes.
    pub fn check_style(&self, code: &str) -> StyleReport {
        let masked = mask_literals(code);
        let mut issues = Vec::new();
        let mut push = |code: &str, message: &str, line: usize| {
            issues.push(StyleIssue {
                code: code.to_string(),
                message: message.to_string(),
                line,
            })
        };

        let mut indent_kinds = (false, false);
        for (idx, (raw, masked_line)) in code.lines().zip(masked.lines()).enumerate() {
            let line = idx + 1;
            if raw.chars().count() > MAX_LINE_LENGTH {
                push("E501", "line too long", line);
            }
            if raw.ends_with(' ') || raw.ends_with('\t') {
                push("W291", "trailing whitespace", line);
            }
            let indent: String = raw.chars().take_while(|c| c.is_whitespace()).collect();
            if indent.contains('\t') {
                indent_kinds.0 = true;
                if indent.contains(' ') {
                    push("E101", "indentation contains mixed spaces and tabs", line);
                } else {
                    push("W191", "indentation contains tabs", line);
                }
            } else if !indent.is_empty() {
                indent_kinds.1 = true;
            }

            let Some(patterns) = &self.patterns else {
                continue;
            };
            if patterns.wildcard_import.is_match(masked_line) {
                push("F403", "wildcard import", line);
            }
            if patterns.bare_except.is_match(masked_line) {
                push("E722", "do not use bare 'except'", line);
            }
            if patterns.semicolon.is_match(masked_line) {
                push("E702", "multiple statements on one line (semicolon)", line);
            }
            if patterns.compare_none.is_match(masked_line) {
                push("E711", "comparison to None should be 'is' or 'is not'", line);
            }
        }
        if indent_kinds.0 && indent_kinds.1 {
            push("W191", "file mixes tab and space indentation", 0);
        }
        if !code.is_empty() && !code.ends_with('\n') && code.lines().count() > 1 {
            push("W292", "no newline at end of file", code.lines().count());
        }

        let penalty = (issues.len() as u32).saturating_mul(5);
        StyleReport {
            score: 100u32.saturating_sub(penalty),
            issues,
        }
    }
}
