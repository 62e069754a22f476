//! The closed retrieval command set and its static validation.
//!
//! A model turn is plain text. The first JSON object in it is the
//! instruction; surrounding prose and code fences are ignored. An instruction
//! is checked before anything runs:
//!
//! 1. its `op` must be on the allow-list, and
//! 2. no field name may reach for reflective, code-loading or process
//!    primitives, and
//! 3. every chunk id must use the id charset.
//!
//! Failing any of these is a [`Parsed::Violation`] and ends the session.
//! String values (queries, prompts, answers) are data and are never
//! executed, so a memory about `subprocess` can be searched for. Unknown
//! fields and other malformed instructions come back as
//! [`Parsed::Malformed`] and are reported to the model.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use crate::memory::{validate_id, EdgeType};

/// Operations a session will execute.
pub const ALLOWED_OPS: &[&str] = &["read", "search", "list_by_tag", "get_links", "ask", "final"];

static FORBIDDEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        __[a-z]+__
        | \b(?:eval|exec|compile|getattr|setattr|delattr|globals|locals|vars|open)\(
        | \b(?:import\s+(?:os|sys|subprocess|socket|ctypes|shutil)|from\s+(?:os|sys|subprocess)\s+import)\b
        | \b(?:subprocess|os\.system|os\.popen|os\.environ|child_process|Runtime\.getRuntime)\b
        | std::(?:process|fs|env|net)\b
        | \bfile://
        | /etc/(?:passwd|shadow)
        | \bsh\s+-c\b",
    )
    .expect("invalid regex")
});

/// One retrieval step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Read {
        id: String,
    },
    Search {
        query: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    ListByTag {
        tags: Vec<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
    GetLinks {
        id: String,
        #[serde(default)]
        edge_type: Option<String>,
    },
    Ask {
        prompt: String,
        #[serde(default)]
        context_ids: Vec<String>,
        #[serde(default)]
        recursive: bool,
    },
    Final {
        answer: String,
        #[serde(default)]
        confidence: Option<f64>,
        #[serde(default)]
        source_ids: Vec<String>,
    },
}

impl Command {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Search { .. } => "search",
            Self::ListByTag { .. } => "list_by_tag",
            Self::GetLinks { .. } => "get_links",
            Self::Ask { .. } => "ask",
            Self::Final { .. } => "final",
        }
    }

    /// Short form for traces and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Read { id } => format!("read {}", id),
            Self::Search { query, limit } => match limit {
                Some(limit) => format!("search {:?} (limit {})", query, limit),
                None => format!("search {:?}", query),
            },
            Self::ListByTag { tags, .. } => format!("list_by_tag {}", tags.join(",")),
            Self::GetLinks { id, edge_type } => match edge_type {
                Some(t) => format!("get_links {} ({})", id, t),
                None => format!("get_links {}", id),
            },
            Self::Ask {
                prompt, recursive, ..
            } => {
                let mode = if *recursive { "ask (recursive)" } else { "ask" };
                format!("{} {:?}", mode, preview(prompt, 80))
            }
            Self::Final { answer, .. } => format!("final {:?}", preview(answer, 80)),
        }
    }

    /// Edge type filter of a `get_links` command.
    pub fn edge_filter(&self) -> Option<EdgeType> {
        match self {
            Self::GetLinks {
                edge_type: Some(name),
                ..
            } => EdgeType::from_name(name),
            _ => None,
        }
    }

    /// Argument names accepted by `op`.
    fn fields(op: &str) -> &'static [&'static str] {
        match op {
            "read" => &["id"],
            "search" => &["query", "limit"],
            "list_by_tag" => &["tags", "limit"],
            "get_links" => &["id", "edge_type"],
            "ask" => &["prompt", "context_ids", "recursive"],
            "final" => &["answer", "confidence", "source_ids"],
            _ => &[],
        }
    }

    fn ids(&self) -> Vec<&str> {
        match self {
            Self::Read { id } | Self::GetLinks { id, .. } => vec![id.as_str()],
            Self::Ask { context_ids, .. } => context_ids.iter().map(String::as_str).collect(),
            Self::Final { source_ids, .. } => source_ids.iter().map(String::as_str).collect(),
            Self::Search { .. } | Self::ListByTag { .. } => Vec::new(),
        }
    }

    /// Argument checks that do not concern security.
    fn check_arguments(&self) -> Option<String> {
        match self {
            Self::Search { query, .. } if query.trim().is_empty() => {
                Some("search needs a non-empty query".into())
            }
            Self::ListByTag { tags, .. } if tags.is_empty() => {
                Some("list_by_tag needs at least one tag".into())
            }
            Self::GetLinks {
                edge_type: Some(name),
                ..
            } if EdgeType::from_name(name).is_none() => {
                Some(format!("unknown edge type `{}`", name))
            }
            Self::Ask { prompt, .. } if prompt.trim().is_empty() => {
                Some("ask needs a non-empty prompt".into())
            }
            Self::Final { answer, .. } if answer.trim().is_empty() => {
                Some("final needs a non-empty answer".into())
            }
            _ => None,
        }
    }
}

/// Result of reading one model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Command(Command),
    /// Not an executable instruction; reported back to the model
    Malformed(String),
    /// Security breach; fatal to the session
    Violation(String),
}

/// Extract, validate and decode the instruction in a model turn.
pub fn parse_instruction(text: &str, max_bytes: usize) -> Parsed {
    let Some(raw) = first_json_object(text) else {
        return Parsed::Malformed("no JSON command found".into());
    };
    if raw.len() > max_bytes {
        return Parsed::Malformed(format!(
            "instruction is {} bytes, the limit is {}",
            raw.len(),
            max_bytes
        ));
    }

    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => return Parsed::Malformed(format!("invalid JSON: {}", e)),
    };
    if let Some(key) = forbidden_key(&value) {
        return Parsed::Violation(format!("forbidden primitive in field `{}`", key));
    }
    let op = match value.get("op") {
        Some(Value::String(op)) => op.clone(),
        Some(_) => return Parsed::Malformed("`op` must be a string".into()),
        None => return Parsed::Malformed("missing `op`".into()),
    };
    if !ALLOWED_OPS.contains(&op.as_str()) {
        return Parsed::Violation(format!("operation `{}` is not allowed", op));
    }

    let known = Command::fields(&op);
    let unknown = value
        .as_object()
        .and_then(|map| map.keys().find(|key| *key != "op" && !known.contains(&key.as_str())));
    if let Some(key) = unknown {
        return Parsed::Malformed(format!("unknown field `{}` for `{}`", key, op));
    }

    let command: Command = match serde_json::from_value(value) {
        Ok(command) => command,
        Err(e) => return Parsed::Malformed(format!("bad arguments for `{}`: {}", op, e)),
    };
    for id in command.ids() {
        if validate_id(id).is_err() {
            return Parsed::Violation(format!("invalid chunk id {:?}", id));
        }
    }
    match command.check_arguments() {
        Some(problem) => Parsed::Malformed(problem),
        None => Parsed::Command(command),
    }
}

/// First object key, at any depth, that names a forbidden primitive.
fn forbidden_key(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => map.iter().find_map(|(key, nested)| {
            if FORBIDDEN.is_match(key) {
                Some(key.as_str())
            } else {
                forbidden_key(nested)
            }
        }),
        Value::Array(items) => items.iter().find_map(forbidden_key),
        _ => None,
    }
}

/// The first balanced `{...}` in `text`, skipping braces inside strings.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Parsed {
        parse_instruction(text, 16 * 1024)
    }

    #[test]
    fn test_parses_fenced_command() {
        let text = "Let me look.\n```json\n{\"op\": \"search\", \"query\": \"auth {jwt}\", \"limit\": 3}\n```";
        assert_eq!(
            parse(text),
            Parsed::Command(Command::Search {
                query: "auth {jwt}".into(),
                limit: Some(3)
            })
        );
    }

    #[test]
    fn test_takes_first_object() {
        let text = r#"{"op": "read", "id": "chunk-1"} {"op": "final", "answer": "x"}"#;
        assert_eq!(
            parse(text),
            Parsed::Command(Command::Read {
                id: "chunk-1".into()
            })
        );
    }

    #[test]
    fn test_unknown_op_is_violation() {
        assert!(matches!(
            parse(r#"{"op": "write", "content": "x"}"#),
            Parsed::Violation(_)
        ));
    }

    #[test]
    fn test_forbidden_fields_are_violations() {
        for text in [
            r#"{"op": "search", "query": "x", "__class__": "__bases__"}"#,
            r#"{"op": "ask", "prompt": "p", "exec(payload)": true}"#,
            r#"{"op": "final", "answer": "a", "os.system": "ls"}"#,
            r#"{"op": "final", "answer": "a", "meta": {"subprocess": ["sh"]}}"#,
            r#"{"op": "ask", "prompt": "p", "opts": [{"std::process": 1}]}"#,
        ] {
            assert!(matches!(parse(text), Parsed::Violation(_)), "{}", text);
        }
    }

    #[test]
    fn test_primitives_in_data_are_plain_text() {
        for text in [
            r#"{"op": "search", "query": "subprocess"}"#,
            r#"{"op": "search", "query": "x.__class__.__bases__"}"#,
            r#"{"op": "ask", "prompt": "why do we call eval(payload)?"}"#,
            r#"{"op": "final", "answer": "It reads os.environ and calls open(path)."}"#,
            r#"{"op": "search", "query": "cat /etc/passwd"}"#,
        ] {
            assert!(matches!(parse(text), Parsed::Command(_)), "{}", text);
        }
    }

    #[test]
    fn test_unknown_fields_are_malformed() {
        assert!(matches!(
            parse(r#"{"op": "read", "id": "chunk-1", "note": "x"}"#),
            Parsed::Malformed(_)
        ));
    }

    #[test]
    fn test_bad_ids_are_violations() {
        assert!(matches!(
            parse(r#"{"op": "read", "id": "../../secrets"}"#),
            Parsed::Violation(_)
        ));
        assert!(matches!(
            parse(r#"{"op": "final", "answer": "a", "source_ids": ["ok", "a/b"]}"#),
            Parsed::Violation(_)
        ));
    }

    #[test]
    fn test_malformed_is_not_fatal() {
        assert!(matches!(parse("I think the answer is 42"), Parsed::Malformed(_)));
        assert!(matches!(parse(r#"{"query": "x"}"#), Parsed::Malformed(_)));
        assert!(matches!(parse(r#"{"op": "read"}"#), Parsed::Malformed(_)));
        assert!(matches!(
            parse(r#"{"op": "search", "query": "  "}"#),
            Parsed::Malformed(_)
        ));
        assert!(matches!(
            parse(r#"{"op": "get_links", "id": "c", "edge_type": "likes"}"#),
            Parsed::Malformed(_)
        ));
        assert!(matches!(parse(r#"{"op": "read", "id": "c""#), Parsed::Malformed(_)));
    }

    #[test]
    fn test_oversized_instruction() {
        let text = format!(r#"{{"op": "final", "answer": "{}"}}"#, "a".repeat(600));
        assert!(matches!(parse_instruction(&text, 256), Parsed::Malformed(_)));
    }

    #[test]
    fn test_ask_defaults() {
        let Parsed::Command(command) = parse(r#"{"op": "ask", "prompt": "summarize"}"#) else {
            panic!("expected a command");
        };
        assert_eq!(
            command,
            Command::Ask {
                prompt: "summarize".into(),
                context_ids: Vec::new(),
                recursive: false
            }
        );
        assert_eq!(command.op(), "ask");
    }

    #[test]
    fn test_ordinary_prose_is_allowed() {
        let text = r#"{"op": "final", "answer": "We decided to open a ticket and import data nightly."}"#;
        assert!(matches!(parse(text), Parsed::Command(_)));
    }
}
