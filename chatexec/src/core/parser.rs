//! Reply parser: recovers block declarations and the execute directive
//! from free-form model output.
//!
//! The markup is a pair of structural HTML comments around a fenced code
//! block, plus a single `Cmd-Exec` comment selecting one block by name:
//!
//! ```text
//! <!-- Block-Start: {"name": "abc", "version": 1, "path": "main.py"} -->
//! (a fenced code block)
//! <!-- Block-End: {"name": "abc"} -->
//! <!-- Cmd-Exec: {"name": "abc"} -->
//! ```
//!
//! Parsing is tolerant per declaration: a malformed marker fails that
//! declaration only and the rest of the reply is still processed. Any
//! collected issue downgrades the whole reply to `ParseOutcome::Errors` —
//! a usable directive is never returned alongside errors.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::blocks::{BlockRegistry, CodeBlock, DeclareOutcome};

static DECLARATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<!--\s*Block-Start:\s*(\{[^\n]*?\})\s*-->\s*```([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)\r?\n?```[ \t]*\r?\n?\s*<!--\s*Block-End:\s*(\{[^\n]*?\})\s*-->",
    )
    .expect("declaration regex")
});

static BLOCK_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*Block-Start:\s*(\{[^\n]*?\})\s*-->").expect("block-start regex")
});

static CMD_EXEC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<!--\s*Cmd-Exec:\s*(\{[^\n]*?\})\s*-->"#).expect("cmd-exec regex")
});

/// Attributes carried by a `Block-Start` marker.
#[derive(Debug, Deserialize)]
struct StartAttrs {
    name: String,
    version: Option<u32>,
    path: Option<String>,
}

/// Attributes carried by a `Block-End` or `Cmd-Exec` marker.
#[derive(Debug, Deserialize)]
struct NameAttrs {
    name: String,
}

/// One problem found while parsing a reply. Serialized into the error
/// feedback sent back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    pub error: String,
}

impl ParseIssue {
    fn new(block: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            block: block.map(str::to_string),
            error: error.into(),
        }
    }
}

/// A tool-invocation reply: a single JSON object instead of block markup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub action: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// Discriminated result of parsing one reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// At least one protocol error; nothing may be executed this round.
    Errors(Vec<ParseIssue>),
    /// Declarations (possibly none) and no directive: nothing to run.
    Declarations { declared: usize },
    /// Exactly one directive, resolved to the named block's latest version.
    Exec(CodeBlock),
    /// The reply was a tool invocation (tool mode only).
    ToolCall(ToolCall),
}

/// Parse a reply, merging valid declarations into `registry`.
///
/// Declarations that parse cleanly are merged even when other parts of the
/// reply fail; a duplicate `(name, version)` with differing content is
/// rejected and reported, never silently overwritten.
pub fn parse_reply(registry: &mut BlockRegistry, text: &str, tool_mode: bool) -> ParseOutcome {
    if tool_mode && let Some(outcome) = parse_tool_call(text) {
        return outcome;
    }

    let mut issues = Vec::new();
    let mut declared = 0usize;
    let mut matched_starts = Vec::new();

    for caps in DECLARATION_RE.captures_iter(text) {
        let whole = caps.get(0).expect("match");
        let start_json = caps.get(1).expect("start attrs").as_str();
        let lang = caps.get(2).expect("lang").as_str();
        let body = caps.get(3).expect("body").as_str();
        let end_json = caps.get(4).expect("end attrs").as_str();
        matched_starts.push(whole.start()..whole.end());

        let attrs: StartAttrs = match serde_json::from_str(start_json) {
            Ok(attrs) => attrs,
            Err(err) => {
                issues.push(ParseIssue::new(
                    None,
                    format!("malformed Block-Start attributes {start_json}: {err}"),
                ));
                continue;
            }
        };
        match serde_json::from_str::<NameAttrs>(end_json) {
            Ok(end) if end.name == attrs.name => {}
            Ok(end) => {
                issues.push(ParseIssue::new(
                    Some(attrs.name.as_str()),
                    format!(
                        "Block-End name '{}' does not match Block-Start name '{}'",
                        end.name, attrs.name
                    ),
                ));
                continue;
            }
            Err(err) => {
                issues.push(ParseIssue::new(
                    Some(attrs.name.as_str()),
                    format!("malformed Block-End attributes {end_json}: {err}"),
                ));
                continue;
            }
        }

        let version = attrs.version.unwrap_or_else(|| registry.next_version(&attrs.name));
        if version == 0 {
            issues.push(ParseIssue::new(Some(attrs.name.as_str()), "version must be >= 1"));
            continue;
        }
        let block = CodeBlock {
            name: attrs.name.clone(),
            version,
            lang: lang.to_string(),
            code: body.to_string(),
            path: attrs.path,
        };
        match registry.declare(block) {
            DeclareOutcome::Inserted | DeclareOutcome::Identical => declared += 1,
            DeclareOutcome::Conflict => issues.push(ParseIssue::new(
                Some(attrs.name.as_str()),
                format!("version {version} already declared with different content"),
            )),
        }
    }

    // A Block-Start marker outside any complete declaration means the fence
    // or end marker is missing or out of order.
    for caps in BLOCK_START_RE.captures_iter(text) {
        let marker = caps.get(0).expect("match");
        let covered = matched_starts
            .iter()
            .any(|range| range.contains(&marker.start()));
        if !covered {
            issues.push(ParseIssue::new(
                None,
                format!(
                    "Block-Start {} has no matching fenced body and Block-End",
                    caps.get(1).expect("attrs").as_str()
                ),
            ));
        }
    }

    let directive = parse_directive(registry, text, &mut issues);

    if !issues.is_empty() {
        return ParseOutcome::Errors(issues);
    }
    match directive {
        Some(block) => ParseOutcome::Exec(block),
        None => ParseOutcome::Declarations { declared },
    }
}

fn parse_directive(
    registry: &BlockRegistry,
    text: &str,
    issues: &mut Vec<ParseIssue>,
) -> Option<CodeBlock> {
    let markers: Vec<&str> = CMD_EXEC_RE
        .captures_iter(text)
        .map(|caps| caps.get(1).expect("attrs").as_str())
        .collect();
    match markers.as_slice() {
        [] => None,
        [attrs_json] => {
            let attrs: NameAttrs = match serde_json::from_str(attrs_json) {
                Ok(attrs) => attrs,
                Err(err) => {
                    issues.push(ParseIssue::new(
                        None,
                        format!("malformed Cmd-Exec attributes {attrs_json}: {err}"),
                    ));
                    return None;
                }
            };
            match registry.latest(&attrs.name) {
                Some(block) => Some(block.clone()),
                None => {
                    issues.push(ParseIssue::new(
                        Some(attrs.name.as_str()),
                        "Cmd-Exec references an unknown block name",
                    ));
                    None
                }
            }
        }
        _ => {
            issues.push(ParseIssue::new(
                None,
                format!(
                    "a reply may contain at most one Cmd-Exec marker, found {}",
                    markers.len()
                ),
            ));
            None
        }
    }
}

/// Name referenced by the first `Cmd-Exec` marker in a message, if any.
///
/// Used by history repair to match past assistant turns to blocks.
pub fn directive_name(text: &str) -> Option<String> {
    let attrs_json = CMD_EXEC_RE.captures(text)?.get(1)?.as_str();
    serde_json::from_str::<NameAttrs>(attrs_json)
        .ok()
        .map(|attrs| attrs.name)
}

/// Recognize a reply that is a single tool-call JSON object.
fn parse_tool_call(text: &str) -> Option<ParseOutcome> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let call: ToolCall = serde_json::from_str(trimmed).ok()?;
    if !call.arguments.is_object() {
        return None;
    }
    if let Some(action) = &call.action
        && action != "call_tool"
    {
        return Some(ParseOutcome::Errors(vec![ParseIssue::new(
            None,
            format!("unknown tool action '{action}'"),
        )]));
    }
    Some(ParseOutcome::ToolCall(call))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declaration(name: &str, version: u32, body: &str) -> String {
        format!(
            "<!-- Block-Start: {{\"name\": \"{name}\", \"version\": {version}}} -->\n```python\n{body}\n```\n<!-- Block-End: {{\"name\": \"{name}\"}} -->\n"
        )
    }

    fn exec(name: &str) -> String {
        format!("<!-- Cmd-Exec: {{\"name\": \"{name}\"}} -->\n")
    }

    #[test]
    fn declaration_and_directive_resolve_to_latest() {
        let mut registry = BlockRegistry::new();
        let reply = format!(
            "Here is the plan.\n{}{}and now run it:\n{}",
            declaration("calc", 1, "x = 1"),
            declaration("calc", 2, "x = 2"),
            exec("calc")
        );

        let outcome = parse_reply(&mut registry, &reply, false);
        match outcome {
            ParseOutcome::Exec(block) => {
                assert_eq!(block.name, "calc");
                assert_eq!(block.version, 2);
                assert_eq!(block.code, "x = 2");
            }
            other => panic!("expected exec outcome, got {other:?}"),
        }
    }

    #[test]
    fn declarations_without_directive_are_nothing_to_run() {
        let mut registry = BlockRegistry::new();
        let reply = declaration("notes", 1, "pass");
        let outcome = parse_reply(&mut registry, &reply, false);
        assert_eq!(outcome, ParseOutcome::Declarations { declared: 1 });
        assert!(registry.contains("notes"));
    }

    #[test]
    fn missing_version_defaults_past_current_max() {
        let mut registry = BlockRegistry::new();
        let first = "<!-- Block-Start: {\"name\": \"a\"} -->\n```python\nx = 1\n```\n<!-- Block-End: {\"name\": \"a\"} -->";
        parse_reply(&mut registry, first, false);
        assert_eq!(registry.latest("a").expect("latest").version, 1);

        let second = "<!-- Block-Start: {\"name\": \"a\"} -->\n```python\nx = 2\n```\n<!-- Block-End: {\"name\": \"a\"} -->";
        parse_reply(&mut registry, second, false);
        assert_eq!(registry.latest("a").expect("latest").version, 2);
    }

    #[test]
    fn malformed_marker_json_fails_that_declaration_only() {
        let mut registry = BlockRegistry::new();
        let reply = format!(
            "<!-- Block-Start: {{broken json}} -->\n```python\nx = 1\n```\n<!-- Block-End: {{\"name\": \"a\"}} -->\n{}",
            declaration("ok", 1, "y = 2")
        );

        let outcome = parse_reply(&mut registry, &reply, false);
        match outcome {
            ParseOutcome::Errors(issues) => {
                assert_eq!(issues.len(), 1);
                assert!(issues[0].error.contains("malformed Block-Start"));
            }
            other => panic!("expected errors, got {other:?}"),
        }
        // The well-formed declaration was still merged.
        assert!(registry.contains("ok"));
    }

    #[test]
    fn two_directives_are_a_protocol_error() {
        let mut registry = BlockRegistry::new();
        let reply = format!("{}{}{}", declaration("a", 1, "pass"), exec("a"), exec("a"));
        let outcome = parse_reply(&mut registry, &reply, false);
        match outcome {
            ParseOutcome::Errors(issues) => {
                assert!(issues[0].error.contains("at most one Cmd-Exec"));
            }
            other => panic!("expected errors, got {other:?}"),
        }
    }

    #[test]
    fn directive_for_unknown_name_is_an_error() {
        let mut registry = BlockRegistry::new();
        let outcome = parse_reply(&mut registry, &exec("ghost"), false);
        match outcome {
            ParseOutcome::Errors(issues) => {
                assert_eq!(issues[0].block.as_deref(), Some("ghost"));
                assert!(issues[0].error.contains("unknown block name"));
            }
            other => panic!("expected errors, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_version_with_different_body_is_rejected() {
        let mut registry = BlockRegistry::new();
        parse_reply(&mut registry, &declaration("a", 1, "x = 1"), false);

        let outcome = parse_reply(&mut registry, &declaration("a", 1, "x = 2"), false);
        match outcome {
            ParseOutcome::Errors(issues) => {
                assert!(issues[0].error.contains("different content"));
            }
            other => panic!("expected errors, got {other:?}"),
        }
        assert_eq!(registry.latest("a").expect("latest").code, "x = 1");
    }

    #[test]
    fn duplicate_version_with_identical_body_is_a_noop() {
        let mut registry = BlockRegistry::new();
        parse_reply(&mut registry, &declaration("a", 1, "x = 1"), false);
        let outcome = parse_reply(&mut registry, &declaration("a", 1, "x = 1"), false);
        assert_eq!(outcome, ParseOutcome::Declarations { declared: 1 });
    }

    #[test]
    fn end_marker_name_mismatch_is_reported() {
        let mut registry = BlockRegistry::new();
        let reply = "<!-- Block-Start: {\"name\": \"a\"} -->\n```python\npass\n```\n<!-- Block-End: {\"name\": \"b\"} -->";
        let outcome = parse_reply(&mut registry, reply, false);
        match outcome {
            ParseOutcome::Errors(issues) => {
                assert!(issues[0].error.contains("does not match"));
            }
            other => panic!("expected errors, got {other:?}"),
        }
        assert!(!registry.contains("a"));
    }

    #[test]
    fn dangling_start_marker_is_reported() {
        let mut registry = BlockRegistry::new();
        let reply = "<!-- Block-Start: {\"name\": \"a\"} -->\nno fence here";
        let outcome = parse_reply(&mut registry, reply, false);
        match outcome {
            ParseOutcome::Errors(issues) => {
                assert!(issues[0].error.contains("no matching fenced body"));
            }
            other => panic!("expected errors, got {other:?}"),
        }
    }

    #[test]
    fn path_attribute_is_carried_through() {
        let mut registry = BlockRegistry::new();
        let reply = "<!-- Block-Start: {\"name\": \"page\", \"version\": 1, \"path\": \"index.html\"} -->\n```html\n<p>hi</p>\n```\n<!-- Block-End: {\"name\": \"page\"} -->";
        parse_reply(&mut registry, reply, false);
        let block = registry.latest("page").expect("latest");
        assert_eq!(block.path.as_deref(), Some("index.html"));
        assert_eq!(block.lang, "html");
    }

    #[test]
    fn tool_call_reply_is_recognized_only_in_tool_mode() {
        let mut registry = BlockRegistry::new();
        let reply = r#"{"action": "call_tool", "name": "search", "arguments": {"q": "rust"}}"#;

        let outcome = parse_reply(&mut registry, reply, true);
        match outcome {
            ParseOutcome::ToolCall(call) => {
                assert_eq!(call.name, "search");
                assert_eq!(call.arguments["q"], "rust");
            }
            other => panic!("expected tool call, got {other:?}"),
        }

        let outcome = parse_reply(&mut registry, reply, false);
        assert_eq!(outcome, ParseOutcome::Declarations { declared: 0 });
    }

    #[test]
    fn directive_name_extracts_first_marker() {
        let text = format!("prelude {}", exec("target"));
        assert_eq!(directive_name(&text).as_deref(), Some("target"));
        assert_eq!(directive_name("no marker"), None);
    }
}
