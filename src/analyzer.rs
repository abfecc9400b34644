//! Structural analysis of submitted Python.
//!
//! The primary path walks a tree-sitter parse tree. Code that does not parse
//! cleanly is classified with line-oriented heuristics instead, so callers
//! always get a best-effort result.

use crate::policy::Severity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};
use tree_sitter::{Node, Parser};

/// Upper bound reported for estimated wall time, in seconds
pub const MAX_ESTIMATED_SECONDS: f64 = 30.0;
/// Upper bound reported for estimated memory, in MB
pub const MAX_ESTIMATED_MEMORY_MB: f64 = 512.0;

const ITERATION_WARNING: u128 = 10_000_000;
const ITERATION_LIMIT: u128 = 1_000_000_000;
const ALLOCATION_LIMIT: u128 = 100_000_000;
const NESTING_WARNING: usize = 4;
/// Parse trees deeper than this are refused before any recursive walk.
const MAX_SYNTAX_DEPTH: usize = 256;

const BASE_SECONDS: f64 = 0.1;
const BASE_MEMORY_MB: f64 = 10.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    Structural,
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRisk {
    pub kind: String,
    pub severity: Severity,
    pub description: String,
    pub line: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub complexity: u32,
    pub lines_of_code: usize,
    pub imports: Vec<String>,
    pub functions: Vec<String>,
    pub variables: Vec<String>,
    pub classes: Vec<String>,
    pub loops: u32,
    pub recursive_functions: Vec<String>,
    pub has_high_risk_patterns: bool,
    pub risks: Vec<AnalysisRisk>,
    /// Seconds
    pub estimated_execution_time: f64,
    /// MB
    pub memory_estimate: f64,
    pub parse_mode: ParseMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syntax_error: Option<String>,
}

impl AnalysisResult {
    pub fn high_risks(&self) -> Vec<String> {
        self.risks
            .iter()
            .filter(|r| r.severity == Severity::High)
            .map(|r| format!("line {}: {}", r.line, r.description))
            .collect()
    }
}

/// Accumulates facts while walking either representation.
#[derive(Default)]
struct Facts {
    complexity: u32,
    imports: Vec<String>,
    functions: Vec<String>,
    variables: BTreeSet<String>,
    classes: Vec<String>,
    loops: u32,
    recursive: BTreeSet<String>,
    risks: Vec<AnalysisRisk>,
    seconds: f64,
    memory_mb: f64,
}

impl Facts {
    fn new() -> Self {
        Self {
            complexity: 1,
            seconds: BASE_SECONDS,
            memory_mb: BASE_MEMORY_MB,
            ..Default::default()
        }
    }

    fn risk(&mut self, kind: &str, severity: Severity, description: String, line: usize) {
        self.risks.push(AnalysisRisk {
            kind: kind.to_string(),
            severity,
            description,
            line,
        });
    }

    fn add_import(&mut self, module: &str) {
        let (seconds, memory) = import_cost(module);
        self.seconds += seconds;
        self.memory_mb += memory;
        self.imports.push(module.to_string());
    }

    fn note_iterations(&mut self, count: u128, line: usize) {
        self.seconds += count as f64 / 1.0e7;
        if count >= ITERATION_LIMIT {
            self.risk(
                "excessive_iteration",
                Severity::High,
                format!("range of {} iterations", count),
                line,
            );
        } else if count >= ITERATION_WARNING {
            self.risk(
                "large_iteration",
                Severity::Medium,
                format!("range of {} iterations", count),
                line,
            );
        }
    }

    fn note_allocation(&mut self, elements: u128, line: usize) {
        self.memory_mb += elements as f64 * 8.0 / (1024.0 * 1024.0);
        if elements >= ALLOCATION_LIMIT {
            self.risk(
                "excessive_allocation",
                Severity::High,
                format!("sequence repetition of {} elements", elements),
                line,
            );
        }
    }

    fn finish(self, code: &str, parse_mode: ParseMode, syntax_error: Option<String>) -> AnalysisResult {
        let has_high_risk_patterns = self.risks.iter().any(|r| r.severity == Severity::High);
        AnalysisResult {
            complexity: self.complexity,
            lines_of_code: count_lines_of_code(code),
            imports: self.imports,
            functions: self.functions,
            variables: self.variables.into_iter().collect(),
            classes: self.classes,
            loops: self.loops,
            recursive_functions: self.recursive.into_iter().collect(),
            has_high_risk_patterns,
            risks: self.risks,
            estimated_execution_time: self.seconds.min(MAX_ESTIMATED_SECONDS),
            memory_estimate: self.memory_mb.min(MAX_ESTIMATED_MEMORY_MB),
            parse_mode,
            syntax_error,
        }
    }
}

fn import_cost(module: &str) -> (f64, f64) {
    match module.split('.').next().unwrap_or(module) {
        "pandas" => (0.5, 60.0),
        "numpy" => (0.2, 25.0),
        "matplotlib" | "seaborn" | "plotly" => (0.8, 40.0),
        "scipy" => (0.5, 40.0),
        "sklearn" => (1.0, 80.0),
        "statsmodels" => (0.8, 50.0),
        "sympy" => (0.6, 40.0),
        _ => (0.0, 0.0),
    }
}

fn call_cost(callee: &str) -> (f64, f64) {
    let method = callee.rsplit('.').next().unwrap_or(callee);
    match method {
        "read_csv" | "read_excel" | "read_json" | "read_parquet" | "read_sql" => (2.0, 50.0),
        "to_csv" | "to_excel" | "to_json" | "to_parquet" => (0.5, 10.0),
        "plot" | "scatter" | "bar" | "barh" | "hist" | "imshow" | "pie" | "boxplot"
        | "heatmap" | "subplots" | "figure" => (0.5, 10.0),
        "savefig" | "show" => (0.5, 5.0),
        "fit" | "fit_transform" | "train" => (5.0, 100.0),
        "predict" | "transform" | "score" => (1.0, 20.0),
        "groupby" | "merge" | "join" | "pivot_table" | "apply" | "resample" => (0.5, 20.0),
        _ => (0.0, 0.0),
    }
}

fn count_lines_of_code(code: &str) -> usize {
    code.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .count()
}

fn parse_int_literal(text: &str) -> Option<u128> {
    let cleaned = text.replace('_', "").to_ascii_lowercase();
    if let Some(hex) = cleaned.strip_prefix("0x") {
        u128::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = cleaned.strip_prefix("0o") {
        u128::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = cleaned.strip_prefix("0b") {
        u128::from_str_radix(bin, 2).ok()
    } else {
        cleaned.parse().ok()
    }
}

struct HeuristicPatterns {
    def: Regex,
    class: Regex,
    assign: Regex,
    loop_kw: Regex,
    branch_kw: Regex,
    infinite_loop: Regex,
    range_call: Regex,
    call: Regex,
}

impl HeuristicPatterns {
    fn compile() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            def: Regex::new(r"(?m)^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)")?,
            class: Regex::new(r"(?m)^\s*class\s+([A-Za-z_]\w*)")?,
            assign: Regex::new(r"(?m)^([A-Za-z_]\w*)\s*(?:\+|-|\*|/)?=[^=]")?,
            loop_kw: Regex::new(r"(?m)^\s*(?:for|while)\b")?,
            branch_kw: Regex::new(r"(?m)^\s*(?:if|elif|except)\b|\bif\b.*\belse\b")?,
            infinite_loop: Regex::new(r"(?m)^\s*while\s+(?:True|1)\s*:")?,
            range_call: Regex::new(r"\brange\s*\(\s*([0-9_]+)\s*\)")?,
            call: Regex::new(r"([A-Za-z_][\w.]*)\s*\(")?,
        })
    }
}

/// Static analyzer; cheap to construct, safe to share.
pub struct StaticAnalyzer {
    heuristics: Option<HeuristicPatterns>,
}

impl Default for StaticAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticAnalyzer {
    pub fn new() -> Self {
        let heuristics = match HeuristicPatterns::compile() {
            Ok(patterns) => Some(patterns),
            Err(e) => {
                warn!("[ANALYZER] Heuristic patterns unavailable: {}", e);
                None
            }
        };
        Self { heuristics }
    }

    pub fn analyze(&self, code: &str) -> AnalysisResult {
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
            warn!("[ANALYZER] Python grammar unavailable: {}", e);
            return self.analyze_heuristic(code, Some(e.to_string()));
        }

        let Some(tree) = parser.parse(code, None) else {
            return self.analyze_heuristic(code, Some("parser produced no tree".to_string()));
        };

        let root = tree.root_node();
        // Every walk below recurses once per tree level.
        if let Some(node) = node_beyond_depth(root, MAX_SYNTAX_DEPTH) {
            let line = node.start_position().row + 1;
            debug!("[ANALYZER] Syntax nested past {} levels at line {}", MAX_SYNTAX_DEPTH, line);
            let mut result = self.analyze_heuristic(code, None);
            result.risks.push(AnalysisRisk {
                kind: "excessive_nesting".to_string(),
                severity: Severity::High,
                description: format!("syntax nested deeper than {} levels", MAX_SYNTAX_DEPTH),
                line,
            });
            result.has_high_risk_patterns = true;
            return result;
        }
        if root.has_error() {
            let message = first_error(root)
                .map(|n| format!("invalid syntax at line {}", n.start_position().row + 1))
                .unwrap_or_else(|| "invalid syntax".to_string());
            debug!("[ANALYZER] Falling back to heuristics: {}", message);
            return self.analyze_heuristic(code, Some(message));
        }

        let mut walker = TreeWalker {
            source: code.as_bytes(),
            facts: Facts::new(),
            function_stack: Vec::new(),
            loop_depth: 0,
            deepest_nesting_reported: false,
        };
        walker.walk(root);
        walker.facts.finish(code, ParseMode::Structural, None)
    }

    fn analyze_heuristic(&self, code: &str, syntax_error: Option<String>) -> AnalysisResult {
        let mut facts = Facts::new();
        let masked = crate::security::mask_literals(code);

        for (_, module) in crate::security::imported_modules(&masked) {
            facts.add_import(&module);
        }

        let Some(patterns) = &self.heuristics else {
            return facts.finish(code, ParseMode::Heuristic, syntax_error);
        };

        for caps in patterns.def.captures_iter(&masked) {
            facts.functions.push(caps[1].to_string());
            facts.complexity += 1;
        }
        for caps in patterns.class.captures_iter(&masked) {
            facts.classes.push(caps[1].to_string());
            facts.complexity += 1;
        }
        for caps in patterns.assign.captures_iter(&masked) {
            facts.variables.insert(caps[1].to_string());
        }
        let loops = patterns.loop_kw.find_iter(&masked).count() as u32;
        facts.loops += loops;
        facts.complexity += loops;
        facts.complexity += patterns.branch_kw.find_iter(&masked).count() as u32;

        if patterns.infinite_loop.is_match(&masked)
            && !masked.contains("break")
            && !masked.contains("return")
        {
            let line = patterns
                .infinite_loop
                .find(&masked)
                .map(|m| masked[..m.start()].matches('\n').count() + 1)
                .unwrap_or(1);
            facts.risk(
                "infinite_loop",
                Severity::High,
                "unconditional loop without an exit".to_string(),
                line,
            );
        }

        for caps in patterns.range_call.captures_iter(&masked) {
            if let Some(count) = parse_int_literal(&caps[1]) {
                let line = caps
                    .get(0)
                    .map(|m| masked[..m.start()].matches('\n').count() + 1)
                    .unwrap_or(1);
                facts.note_iterations(count, line);
            }
        }

        for caps in patterns.call.captures_iter(&masked) {
            let (seconds, memory) = call_cost(&caps[1]);
            facts.seconds += seconds;
            facts.memory_mb += memory;
        }

        for name in &facts.functions.clone() {
            // A function mentioned at least twice (its def plus a call) inside
            // its own body is treated as recursive.
            if let Some(body) = function_body_text(&masked, name) {
                if body.contains(&format!("{}(", name)) {
                    facts.recursive.insert(name.clone());
                }
            }
        }
        for name in facts.recursive.clone() {
            facts.risk(
                "recursion",
                Severity::Medium,
                format!("recursive function '{}'", name),
                1,
            );
        }

        facts.finish(code, ParseMode::Heuristic, syntax_error)
    }
}

/// Text of a `def name` block: the lines after it that are indented deeper.
fn function_body_text(code: &str, name: &str) -> Option<String> {
    let mut lines = code.lines();
    let header_indent = loop {
        let line = lines.next()?;
        let trimmed = line.trim_start();
        let rest = trimmed.strip_prefix("async ").unwrap_or(trimmed);
        if let Some(after) = rest.strip_prefix("def ") {
            if after.trim_start().starts_with(&format!("{}(", name)) {
                break line.len() - trimmed.len();
            }
        }
    };
    let mut body = String::new();
    for line in lines {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        if line.len() - trimmed.len() <= header_indent {
            break;
        }
        body.push_str(trimmed);
        body.push('\n');
    }
    Some(body)
}

fn first_error(root: Node) -> Option<Node> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            return Some(node);
        }
        if node.has_error() && cursor.goto_first_child() {
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

/// First node found more than `limit` levels below `root`, if any.
fn node_beyond_depth(root: Node, limit: usize) -> Option<Node> {
    let mut cursor = root.walk();
    let mut depth = 0usize;
    loop {
        if depth > limit {
            return Some(cursor.node());
        }
        if cursor.goto_first_child() {
            depth += 1;
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return None;
            }
            depth -= 1;
        }
    }
}

struct TreeWalker<'a> {
    source: &'a [u8],
    facts: Facts,
    function_stack: Vec<String>,
    loop_depth: usize,
    deepest_nesting_reported: bool,
}

impl<'a> TreeWalker<'a> {
    fn text(&self, node: Node) -> &'a str {
        node.utf8_text(self.source).unwrap_or("")
    }

    fn line(node: Node) -> usize {
        node.start_position().row + 1
    }

    fn walk_children(&mut self, node: Node) {
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        for child in children {
            self.walk(child);
        }
    }

    fn walk(&mut self, node: Node) {
        match node.kind() {
            "import_statement" => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    let module = match child.kind() {
                        "aliased_import" => child.child_by_field_name("name"),
                        "dotted_name" => Some(child),
                        _ => None,
                    };
                    if let Some(module) = module {
                        let name = self.text(module).to_string();
                        self.facts.add_import(&name);
                    }
                }
            }
            "import_from_statement" => {
                if let Some(module) = node.child_by_field_name("module_name") {
                    if module.kind() == "dotted_name" {
                        let name = self.text(module).to_string();
                        self.facts.add_import(&name);
                    }
                }
            }
            "function_definition" => {
                let name = node
                    .child_by_field_name("name")
                    .map(|n| self.text(n).to_string())
                    .unwrap_or_default();
                self.facts.complexity += 1;
                self.facts.functions.push(name.clone());
                self.function_stack.push(name);
                // Loop depth does not carry into a nested def.
                let saved_depth = std::mem::take(&mut self.loop_depth);
                if let Some(body) = node.child_by_field_name("body") {
                    self.walk(body);
                }
                self.loop_depth = saved_depth;
                self.function_stack.pop();
            }
            "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let name = self.text(name).to_string();
                    self.facts.classes.push(name);
                }
                self.facts.complexity += 1;
                if let Some(body) = node.child_by_field_name("body") {
                    // Class-level assignments are attributes, not session variables.
                    self.function_stack.push(String::new());
                    self.walk(body);
                    self.function_stack.pop();
                }
            }
            "assignment" | "augmented_assignment" => {
                if self.function_stack.is_empty() {
                    if let Some(left) = node.child_by_field_name("left") {
                        self.collect_targets(left);
                    }
                }
                self.walk_children(node);
            }
            "for_statement" | "while_statement" => {
                self.facts.loops += 1;
                self.facts.complexity += 1;
                if node.kind() == "while_statement" {
                    self.check_unbounded_while(node);
                }
                self.loop_depth += 1;
                if self.loop_depth >= NESTING_WARNING && !self.deepest_nesting_reported {
                    self.deepest_nesting_reported = true;
                    self.facts.risk(
                        "deep_nesting",
                        Severity::Medium,
                        format!("loops nested {} deep", self.loop_depth),
                        Self::line(node),
                    );
                }
                self.walk_children(node);
                self.loop_depth -= 1;
            }
            "for_in_clause" => {
                self.facts.loops += 1;
                self.facts.complexity += 1;
                self.walk_children(node);
            }
            "if_statement" | "elif_clause" | "conditional_expression" | "except_clause" => {
                self.facts.complexity += 1;
                self.walk_children(node);
            }
            "call" => {
                self.inspect_call(node);
                self.walk_children(node);
            }
            "binary_operator" => {
                self.inspect_repetition(node);
                self.walk_children(node);
            }
            _ => self.walk_children(node),
        }
    }

    fn collect_targets(&mut self, target: Node) {
        match target.kind() {
            "identifier" => {
                let name = self.text(target).to_string();
                self.facts.variables.insert(name);
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" => {
                let mut cursor = target.walk();
                let children: Vec<Node> = target.named_children(&mut cursor).collect();
                for child in children {
                    self.collect_targets(child);
                }
            }
            _ => {}
        }
    }

    fn check_unbounded_while(&mut self, node: Node) {
        let Some(condition) = node.child_by_field_name("condition") else {
            return;
        };
        let always_true = match condition.kind() {
            "true" => true,
            "integer" => parse_int_literal(self.text(condition)).is_some_and(|v| v != 0),
            _ => false,
        };
        let has_exit = node
            .child_by_field_name("body")
            .is_some_and(|body| contains_loop_exit(body));
        if always_true && !has_exit {
            self.facts.risk(
                "infinite_loop",
                Severity::High,
                "unconditional loop without an exit".to_string(),
                Self::line(node),
            );
        }
    }

    fn inspect_call(&mut self, node: Node) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let callee = self.text(function);

        if function.kind() == "identifier" {
            if let Some(current) = self.function_stack.last() {
                if !current.is_empty() && current == callee {
                    let name = current.clone();
                    if self.facts.recursive.insert(name.clone()) {
                        self.facts.risk(
                            "recursion",
                            Severity::Medium,
                            format!("recursive function '{}'", name),
                            Self::line(node),
                        );
                    }
                }
            }
        }

        let (seconds, memory) = call_cost(callee);
        self.facts.seconds += seconds;
        self.facts.memory_mb += memory;

        let Some(arguments) = node.child_by_field_name("arguments") else {
            return;
        };
        let mut cursor = arguments.walk();
        let args: Vec<Node> = arguments.named_children(&mut cursor).collect();

        match callee {
            "range" => {
                // range(stop) / range(start, stop[, step])
                let bound = match args.as_slice() {
                    [stop] => self.literal_int(*stop),
                    [start, stop, ..] => match (self.literal_int(*start), self.literal_int(*stop)) {
                        (Some(a), Some(b)) => Some(b.saturating_sub(a)),
                        (None, stop) => stop,
                        _ => None,
                    },
                    _ => None,
                };
                if let Some(count) = bound {
                    self.facts.note_iterations(count, Self::line(node));
                }
            }
            "time.sleep" | "sleep" => {
                if let Some(seconds) = args.first().and_then(|a| self.literal_int(*a)) {
                    self.facts.seconds += seconds as f64;
                }
            }
            _ => {}
        }
    }

    fn inspect_repetition(&mut self, node: Node) {
        let is_mul = node
            .child_by_field_name("operator")
            .is_some_and(|op| op.kind() == "*");
        if !is_mul {
            return;
        }
        let (Some(left), Some(right)) = (
            node.child_by_field_name("left"),
            node.child_by_field_name("right"),
        ) else {
            return;
        };
        let is_sequence = |n: Node| matches!(n.kind(), "list" | "string" | "tuple");
        let count = if is_sequence(left) {
            self.literal_int(right)
        } else if is_sequence(right) {
            self.literal_int(left)
        } else {
            None
        };
        if let Some(count) = count {
            self.facts.note_allocation(count, Self::line(node));
        }
    }

    /// Evaluate integer literals and `*`/`**` products of them.
    fn literal_int(&self, node: Node) -> Option<u128> {
        match node.kind() {
            "integer" => parse_int_literal(self.text(node)),
            "parenthesized_expression" => node.named_child(0).and_then(|n| self.literal_int(n)),
            "binary_operator" => {
                let op = node.child_by_field_name("operator")?.kind();
                let left = self.literal_int(node.child_by_field_name("left")?)?;
                let right = self.literal_int(node.child_by_field_name("right")?)?;
                match op {
                    "*" => Some(left.saturating_mul(right)),
                    "**" => {
                        let exp = u32::try_from(right).ok()?;
                        Some(left.checked_pow(exp).unwrap_or(u128::MAX))
                    }
                    "+" => Some(left.saturating_add(right)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Whether a loop body can leave the loop. Breaks inside nested loops do not count.
fn contains_loop_exit(node: Node) -> bool {
    match node.kind() {
        "break_statement" | "return_statement" | "raise_statement" => true,
        "for_statement" | "while_statement" | "function_definition" | "class_definition" => {
            // A return inside a nested loop still exits the outer one.
            let mut cursor = node.walk();
            let children: Vec<Node> = node.children(&mut cursor).collect();
            children.into_iter().any(contains_return)
        }
        _ => {
            let mut cursor = node.walk();
            let children: Vec<Node> = node.children(&mut cursor).collect();
            children.into_iter().any(contains_loop_exit)
        }
    }
}

fn contains_return(node: Node) -> bool {
    match node.kind() {
        "return_statement" | "raise_statement" => true,
        "function_definition" | "class_definition" => false,
        _ => {
            let mut cursor = node.walk();
            let children: Vec<Node> = node.children(&mut cursor).collect();
            children.into_iter().any(contains_return)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(code: &str) -> AnalysisResult {
        StaticAnalyzer::new().analyze(code)
    }

    #[test]
    fn extracts_structure() {
        let code = r#"
import numpy as np
from collections import Counter

class Point:
    scale = 2

def area(w, h):
    local = w * h
    return local

total = 0
a, b = 1, 2
for i in range(10):
    if i % 2:
        total += i
"#;
        let result = analyze(code);
        assert_eq!(result.parse_mode, ParseMode::Structural);
        assert_eq!(result.imports, vec!["numpy", "collections"]);
        assert_eq!(result.functions, vec!["area"]);
        assert_eq!(result.classes, vec!["Point"]);
        assert_eq!(result.variables, vec!["a", "b", "total"]);
        assert_eq!(result.loops, 1);
        // base + class + def + for + if
        assert_eq!(result.complexity, 5);
        assert!(!result.has_high_risk_patterns);
    }

    #[test]
    fn flags_unbounded_while() {
        let result = analyze("while True:\n    x = 1\n");
        assert!(result.has_high_risk_patterns);
        assert_eq!(result.risks[0].kind, "infinite_loop");

        let result = analyze("while True:\n    if done():\n        break\n");
        assert!(!result.has_high_risk_patterns);
    }

    #[test]
    fn nested_break_does_not_exit_outer_loop() {
        let code = "while 1:\n    for i in range(3):\n        break\n";
        assert!(analyze(code).has_high_risk_patterns);
    }

    #[test]
    fn flags_recursion_as_medium() {
        let code = "def fact(n):\n    return 1 if n <= 1 else n * fact(n - 1)\n";
        let result = analyze(code);
        assert_eq!(result.recursive_functions, vec!["fact"]);
        assert!(!result.has_high_risk_patterns);
        assert!(result.risks.iter().any(|r| r.kind == "recursion"));
    }

    #[test]
    fn huge_literals_are_high_risk() {
        assert!(analyze("for i in range(10**10):\n    pass\n").has_high_risk_patterns);
        assert!(analyze("data = [0] * 1_000_000_000\n").has_high_risk_patterns);
        let medium = analyze("for i in range(50_000_000):\n    pass\n");
        assert!(!medium.has_high_risk_patterns);
        assert!(medium.risks.iter().any(|r| r.kind == "large_iteration"));
    }

    #[test]
    fn estimates_are_capped() {
        let code = "import pandas as pd\n".to_string()
            + &"df = pd.read_csv('a.csv')\nmodel.fit(df)\n".repeat(20);
        let result = analyze(&code);
        assert_eq!(result.estimated_execution_time, MAX_ESTIMATED_SECONDS);
        assert_eq!(result.memory_estimate, MAX_ESTIMATED_MEMORY_MB);

        let trivial = analyze("x = 1 + 1");
        assert!(trivial.estimated_execution_time < 1.0);
        assert_eq!(trivial.variables, vec!["x"]);
    }

    #[test]
    fn broken_code_falls_back_to_heuristics() {
        let code = "import pandas\ndef broken(:\n    pass\nwhile True:\n    y = 2\n";
        let result = analyze(code);
        assert_eq!(result.parse_mode, ParseMode::Heuristic);
        assert!(result.syntax_error.is_some());
        assert_eq!(result.imports, vec!["pandas"]);
        assert!(result.has_high_risk_patterns);
    }

    #[test]
    fn deep_nesting_is_reported_once() {
        let code = "for a in x:\n for b in x:\n  for c in x:\n   for d in x:\n    for e in x:\n     pass\n";
        let result = analyze(code);
        let nesting: Vec<_> = result.risks.iter().filter(|r| r.kind == "deep_nesting").collect();
        assert_eq!(nesting.len(), 1);
        assert_eq!(result.loops, 5);
    }

    #[test]
    fn deeply_nested_syntax_is_refused_without_recursing() {
        let code = format!("x = {}1{}", "(".repeat(20_000), ")".repeat(20_000));
        let result = std::thread::Builder::new()
            .stack_size(512 * 1024)
            .spawn(move || analyze(&code))
            .unwrap()
            .join()
            .unwrap();
        assert!(result.has_high_risk_patterns);
        assert!(result.risks.iter().any(|r| r.kind == "excessive_nesting"));
        assert_eq!(result.parse_mode, ParseMode::Heuristic);

        let ordinary = (0..20)
            .map(|i| format!("{}if x{}:\n", " ".repeat(i), i))
            .collect::<String>()
            + &" ".repeat(20)
            + "pass\n";
        let result = analyze(&ordinary);
        assert_eq!(result.parse_mode, ParseMode::Structural);
        assert!(!result.risks.iter().any(|r| r.kind == "excessive_nesting"));
    }
}
