//! Static screening of submitted code against the active [`SecurityPolicy`].

use crate::errors::{Result, SandboxError};
use crate::policy::{RiskLevel, SecurityPolicy, Severity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One matched rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFinding {
    pub pattern: String,
    pub description: String,
    pub severity: Severity,
    /// 1-based source line
    pub line: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    /// False iff any finding is HIGH
    pub allowed: bool,
    pub risk_level: RiskLevel,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub findings: Vec<SecurityFinding>,
}

#[derive(Debug, Clone)]
pub struct SecurityValidator {
    policy: Arc<SecurityPolicy>,
}

impl SecurityValidator {
    pub fn new(policy: Arc<SecurityPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Screen code text. Pure: the same code always yields the same report.
    pub fn validate_code(&self, code: &str) -> SecurityReport {
        let masked = mask_literals(code);
        let mut findings = Vec::new();

        for (line, module) in imported_modules(&masked) {
            if let Some((severity, reason)) = self.policy.classify_module(&module) {
                findings.push(SecurityFinding {
                    pattern: format!("import {}", module),
                    description: format!("import of '{}': {}", module, reason),
                    severity,
                    line,
                });
            }
        }

        for pattern in self.policy.call_patterns() {
            for m in pattern.regex.find_iter(&masked) {
                let line = line_of(&masked, m.start());
                if let Some(description) = escalation(pattern.name, &masked, m.end()) {
                    findings.push(SecurityFinding {
                        pattern: pattern.name.to_string(),
                        description: description.to_string(),
                        severity: Severity::High,
                        line,
                    });
                    continue;
                }
                findings.push(SecurityFinding {
                    pattern: pattern.name.to_string(),
                    description: pattern.description.to_string(),
                    severity: pattern.severity,
                    line,
                });
            }
        }

        findings.sort_by(|a, b| a.line.cmp(&b.line).then(b.severity.cmp(&a.severity)));

        let risk_level = findings
            .iter()
            .map(|f| RiskLevel::from(f.severity))
            .max()
            .unwrap_or_default();

        let describe = |f: &SecurityFinding| format!("line {}: {}", f.line, f.description);
        let violations: Vec<String> = findings
            .iter()
            .filter(|f| f.severity == Severity::High)
            .map(describe)
            .collect();
        let warnings: Vec<String> = findings
            .iter()
            .filter(|f| f.severity != Severity::High)
            .map(describe)
            .collect();

        SecurityReport {
            allowed: violations.is_empty(),
            risk_level,
            violations,
            warnings,
            findings,
        }
    }

    /// Reject malformed or blocked package specifiers.
    pub fn validate_packages(&self, packages: &[String]) -> Result<()> {
        if let Some(bad) = packages.iter().find(|p| !is_valid_package_spec(p)) {
            return Err(SandboxError::InvalidRequest(format!(
                "invalid package specifier: {:?}",
                bad
            )));
        }
        let blocked: Vec<String> = packages
            .iter()
            .filter(|p| self.policy.is_package_blocked(p))
            .cloned()
            .collect();
        if blocked.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::PackageBlocked(blocked))
        }
    }
}

/// Accepts `name`, `name[extra]` and version specifiers; never pip options.
pub fn is_valid_package_spec(spec: &str) -> bool {
    let spec = spec.trim();
    let Some(first) = spec.chars().next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && spec.len() <= 200
        && spec.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '.' | '_' | '-' | '[' | ']' | ',' | '=' | '<' | '>' | '!' | '~' | '*' | '+')
        })
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

/// Root-qualified modules named by `import` / `from ... import` statements,
/// with their 1-based line numbers. Expects literal-masked source.
pub(crate) fn imported_modules(masked: &str) -> Vec<(usize, String)> {
    let mut modules = Vec::new();
    for (idx, raw_line) in masked.lines().enumerate() {
        for statement in raw_line.split(';') {
            let statement = statement.trim();
            if let Some(rest) = statement.strip_prefix("from ") {
                let module = rest.split_whitespace().next().unwrap_or("");
                // Relative imports stay inside the user's own package.
                if !module.is_empty() && !module.starts_with('.') {
                    modules.push((idx + 1, module.to_string()));
                }
            } else if let Some(rest) = statement.strip_prefix("import ") {
                for part in rest.split(',') {
                    if let Some(name) = part.split_whitespace().next() {
                        let name = name.trim_matches(|c| c == '(' || c == ')');
                        if !name.is_empty() {
                            modules.push((idx + 1, name.to_string()));
                        }
                    }
                }
            }
        }
    }
    modules
}

/// Dynamic attribute and namespace access that can reach a blocked module
/// without naming it. `open` is the offset just past the call's `(`.
fn escalation(pattern: &str, masked: &str, open: usize) -> Option<&'static str> {
    let (args, end) = call_arguments(masked, open)?;
    match pattern {
        "dynamic_attribute" => args
            .get(1)
            .filter(|name| !is_plain_name(name))
            .map(|_| "dynamic attribute access with a computed name"),
        "namespace_introspection" => masked[end..]
            .trim_start()
            .starts_with('[')
            .then_some("namespace lookup by key"),
        _ => None,
    }
}

/// Top-level arguments of the call opened just before `open`, and the
/// offset just past its closing parenthesis. Expects literal-masked source.
fn call_arguments(masked: &str, open: usize) -> Option<(Vec<&str>, usize)> {
    let bytes = masked.as_bytes();
    let mut args = Vec::new();
    let mut start = open;
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' if depth > 0 => depth -= 1,
            b')' => {
                args.push(masked[start..i].trim());
                return Some((args, i + 1));
            }
            b',' if depth == 0 => {
                args.push(masked[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    None
}

/// A single non-f-string literal, or a bare (possibly dotted) name.
fn is_plain_name(arg: &str) -> bool {
    let literal = arg.trim_start_matches(['r', 'R', 'b', 'B', 'u', 'U']);
    if let Some(quote) = literal.chars().next().filter(|c| *c == '\'' || *c == '"') {
        let run = literal.chars().take_while(|c| *c == quote).count().min(3);
        let run = if run == 2 { 1 } else { run };
        let body = &literal[run..];
        return body.len() >= run
            && body.ends_with(&literal[..run])
            && !body[..body.len() - run].contains(quote);
    }
    !arg.is_empty()
        && arg
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_'))
        && !arg.starts_with(|c: char| c.is_ascii_digit())
}

/// Blank out comment text and string-literal contents, keeping quotes,
/// newlines and byte offsets intact so that findings keep their line numbers.
pub fn mask_literals(code: &str) -> String {
    let bytes = code.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    out.push(b' ');
                    i += 1;
                }
            }
            b'\'' | b'"' => {
                let triple = i + 2 < bytes.len() && bytes[i + 1] == b && bytes[i + 2] == b;
                let quote_len = if triple { 3 } else { 1 };
                out.extend_from_slice(&bytes[i..i + quote_len]);
                i += quote_len;
                loop {
                    if i >= bytes.len() {
                        break;
                    }
                    let c = bytes[i];
                    if c == b'\\' {
                        out.push(b' ');
                        i += 1;
                        if i < bytes.len() {
                            out.push(if bytes[i] == b'\n' { b'\n' } else { b' ' });
                            i += 1;
                        }
                        continue;
                    }
                    if triple {
                        if c == b && i + 2 < bytes.len() && bytes[i + 1] == b && bytes[i + 2] == b {
                            out.extend_from_slice(&bytes[i..i + 3]);
                            i += 3;
                            break;
                        }
                    } else if c == b {
                        out.push(c);
                        i += 1;
                        break;
                    } else if c == b'\n' {
                        // Unterminated single-line string
                        break;
                    }
                    out.push(if c == b'\n' { b'\n' } else { b' ' });
                    i += 1;
                }
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }

    // Multi-byte characters inside literals were replaced byte-for-byte with
    // spaces; everything outside literals was copied verbatim.
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SecurityValidator {
        SecurityValidator::new(Arc::new(SecurityPolicy::balanced()))
    }

    #[test]
    fn os_system_is_rejected() {
        let report = validator().validate_code("import os\nos.system('ls')");
        assert!(!report.allowed);
        assert_eq!(report.risk_level, RiskLevel::High);
        assert!(report.violations.iter().any(|v| v.contains("'os'")));
        assert!(report
            .findings
            .iter()
            .any(|f| f.pattern == "os_process" && f.line == 2));
    }

    #[test]
    fn plain_arithmetic_is_clean() {
        let report = validator().validate_code("x = 1 + 1\nprint(x)");
        assert!(report.allowed);
        assert_eq!(report.risk_level, RiskLevel::None);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn dynamic_evaluation_is_high() {
        for code in ["eval('1+1')", "exec(src)", "__import__('os')", "compile(s, 'x', 'exec')"] {
            let report = validator().validate_code(code);
            assert!(!report.allowed, "{code} should be rejected");
        }
    }

    #[test]
    fn attribute_calls_do_not_match_builtins() {
        let code = "import re\npat = re.compile(r'a+')\nfrom PIL import Image\nimg = Image.open('a.png')";
        let report = validator().validate_code(code);
        assert!(report.allowed, "{:?}", report.findings);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn strings_and_comments_are_ignored() {
        let code = "msg = \"os.system('rm -rf /')\"\n# eval(x)\ns = '''\nimport subprocess\n'''";
        let report = validator().validate_code(code);
        assert!(report.allowed, "{:?}", report.findings);
    }

    #[test]
    fn medium_findings_are_warnings() {
        let report = validator().validate_code("with open('data.csv') as f:\n    rows = f.read()");
        assert!(report.allowed);
        assert_eq!(report.risk_level, RiskLevel::Medium);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("line 1"));
    }

    #[test]
    fn dunder_escape_is_rejected() {
        let report = validator().validate_code("().__class__.__bases__[0].__subclasses__()");
        assert!(!report.allowed);
    }

    #[test]
    fn computed_attribute_names_are_rejected() {
        let code = "import pathlib\ngetattr(getattr(pathlib,'o'+'s'),'sys'+'tem')('id')";
        let report = validator().validate_code(code);
        assert!(!report.allowed);
        assert!(report
            .findings
            .iter()
            .any(|f| f.pattern == "dynamic_attribute" && f.severity == Severity::High && f.line == 2));

        for code in [
            "setattr(obj, ''.join(parts), 1)",
            "getattr(mod, f'{a}{b}')",
            "delattr(obj, names[0])",
            "getattr(mod, chr(111) + chr(115))",
            "vars(pathlib)['os']",
            "globals() ['__builtins__']",
        ] {
            assert!(!validator().validate_code(code).allowed, "{code} should be rejected");
        }
    }

    #[test]
    fn literal_attribute_names_stay_warnings() {
        for code in [
            "getattr(obj, 'shape')",
            "getattr(self.model, \"weights\", None)",
            "setattr(cfg, name, value)",
            "getattr(row, field.key)",
            "print(vars(obj))",
        ] {
            let report = validator().validate_code(code);
            assert!(report.allowed, "{code}: {:?}", report.findings);
            assert_eq!(report.risk_level, RiskLevel::Medium, "{code}");
        }
    }

    #[test]
    fn call_arguments_split_at_top_level() {
        let masked = mask_literals("getattr(f(a, b), 'x,y') + 1");
        let (args, end) = call_arguments(&masked, 8).unwrap();
        assert_eq!(args, vec!["f(a, b)", "'   '"]);
        assert_eq!(&masked[end..], " + 1");
        assert!(is_plain_name("'   '"));
        assert!(is_plain_name("r"));
        assert!(!is_plain_name("' ' + ' '"));
        assert!(!is_plain_name("f'  '"));
    }

    #[test]
    fn from_imports_and_aliases() {
        let modules = imported_modules("from os import path\nimport numpy as np, socket\nfrom . import x");
        let names: Vec<&str> = modules.iter().map(|(_, m)| m.as_str()).collect();
        assert_eq!(names, vec!["os", "numpy", "socket"]);
    }

    #[test]
    fn mask_preserves_offsets() {
        let code = "a = 'é' # ç\nb = 2";
        let masked = mask_literals(code);
        assert_eq!(masked.len(), code.len());
        assert_eq!(masked.lines().nth(1), Some("b = 2"));
    }

    #[test]
    fn package_validation() {
        let v = validator();
        assert!(v.validate_packages(&["numpy".into(), "pandas>=2".into()]).is_ok());
        assert!(matches!(
            v.validate_packages(&["requests".into()]),
            Err(SandboxError::PackageBlocked(p)) if p == vec!["requests".to_string()]
        ));
        assert!(matches!(
            v.validate_packages(&["--index-url=http://evil".into()]),
            Err(SandboxError::InvalidRequest(_))
        ));
    }
}
