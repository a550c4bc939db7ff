//! Parsers for structured fragments in LLM output
//!
//! - ReAct `Thought:` / `Action:` sections and `Name[argument]` actions
//! - inline `[TOOL_CALL:name:params]` markers
//! - plan lists emitted inside a fenced code block
//!
//! All parsers are total: malformed input yields `None` or an empty result.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static MD_THOUGHT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)\*\*Thought:\*\*\s*(.*?)(?:\*\*Action:|Action:|$)").ok()
});
static MD_ACTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\*\*Action:\*\*[ \t]*([^\n]*)").ok());
static THOUGHT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)Thought:\s*(.*?)(?:Action:|$)").ok());
static ACTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Action:[ \t]*([^\n]*)").ok());
static CALL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)^(\w+)\[(.*)\]").ok());

fn first_group<'t>(re: &LazyLock<Option<Regex>>, text: &'t str) -> Option<&'t str> {
    re.as_ref()?.captures(text)?.get(1).map(|m| m.as_str())
}

/// Opening of an inline tool call
pub const TOOL_CALL_MARKER: &str = "[TOOL_CALL:";
const FINISH: &str = "Finish";

/// `Name[argument]` split into its parts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAction {
    pub name: String,
    pub argument: String,
}

/// What a ReAct action line asks the loop to do
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReactStep {
    /// `Finish[answer]`
    Finish(String),
    /// `Tool[argument]`
    Call(ParsedAction),
    /// Anything else
    Invalid(String),
}

impl ReactStep {
    pub fn from_action(action: &str) -> Self {
        let cleaned = clean(action);
        match parse_action(cleaned) {
            Some(parsed) if parsed.name == FINISH => ReactStep::Finish(parsed.argument),
            Some(parsed) => ReactStep::Call(parsed),
            // `Finish: answer` without brackets
            None => match cleaned.strip_prefix(FINISH) {
                Some(rest) if rest.is_empty() || rest.starts_with([':', ' ']) => {
                    ReactStep::Finish(rest.trim_start_matches([':', ' ']).trim().to_string())
                }
                _ => ReactStep::Invalid(cleaned.to_string()),
            },
        }
    }
}

fn clean(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '`' || c == '*').trim()
}

/// Extract the thought and the action line from a ReAct completion
pub fn parse_react_output(text: &str) -> (Option<String>, Option<String>) {
    let thought = first_group(&MD_THOUGHT, text)
        .or_else(|| first_group(&THOUGHT, text))
        .map(|t| t.trim().trim_end_matches('*').trim().to_string())
        .filter(|t| !t.is_empty());

    let action = first_group(&MD_ACTION, text)
        .or_else(|| first_group(&ACTION, text))
        .map(|a| clean(a).to_string())
        .filter(|a| !a.is_empty());

    (thought, action)
}

/// Parse `Name[argument]`; greedy up to the last `]`
pub fn parse_action(s: &str) -> Option<ParsedAction> {
    let caps = CALL.as_ref()?.captures(clean(s))?;
    Some(ParsedAction {
        name: caps.get(1)?.as_str().to_string(),
        argument: caps.get(2)?.as_str().to_string(),
    })
}

/// One `[TOOL_CALL:name:params]` occurrence
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerCall {
    pub tool_name: String,
    pub parameters: String,
    /// The full marker text as it appeared
    pub original: String,
}

/// Find every tool-call marker, honouring nested brackets and quoted strings
pub fn parse_tool_markers(text: &str) -> Vec<MarkerCall> {
    let mut calls = Vec::new();
    let mut start = 0;

    while let Some(offset) = text[start..].find(TOOL_CALL_MARKER) {
        let begin = start + offset;
        let name_start = begin + TOOL_CALL_MARKER.len();
        let Some(colon) = text[name_start..].find(':').map(|i| name_start + i) else {
            break;
        };
        let body_start = colon + 1;
        let Some(end) = closing_bracket(text, body_start) else {
            break;
        };

        calls.push(MarkerCall {
            tool_name: text[name_start..colon].trim().to_string(),
            parameters: text[body_start..end].trim().to_string(),
            original: text[begin..=end].to_string(),
        });
        start = end + 1;
    }

    calls
}

/// Byte index of the `]` closing a marker body that starts at `from`
fn closing_bracket(text: &str, from: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut prev = '\0';

    for (i, c) in text[from..].char_indices() {
        match quote {
            Some(q) if c == q && prev != '\\' => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '[' => depth += 1,
                ']' if depth == 0 => return Some(from + i),
                ']' => depth -= 1,
                _ => {}
            },
        }
        prev = c;
    }

    None
}

/// Remove all tool-call markers from text
pub fn strip_tool_markers(text: &str) -> String {
    parse_tool_markers(text)
        .iter()
        .fold(text.to_string(), |acc, call| acc.replacen(&call.original, "", 1))
        .trim()
        .to_string()
}

/// Extract a list of step strings from a planner reply
///
/// Looks for a list literal inside a ```` ```python ```` / ```` ```json ````
/// / bare fence, then for a bare `[...]`. Anything else yields no steps.
pub fn parse_plan(text: &str) -> Vec<String> {
    let body = fenced_block(text).unwrap_or(text);
    let (Some(open), Some(close)) = (body.find('['), body.rfind(']')) else {
        return Vec::new();
    };
    if close < open {
        return Vec::new();
    }
    parse_list_literal(&body[open..=close]).unwrap_or_default()
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n').map_or(0, |i| i + 1);
    let header = after[..body_start].trim();
    if !header.is_empty() && !header.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Parse `["a", 'b', 3]` into strings; `None` when not a flat list
fn parse_list_literal(src: &str) -> Option<Vec<String>> {
    let mut chars = src.trim().chars().peekable();
    if chars.next()? != '[' {
        return None;
    }

    let mut items = Vec::new();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.peek().copied()? {
            ']' => {
                chars.next();
                break;
            }
            q @ ('"' | '\'') => {
                chars.next();
                let mut item = String::new();
                loop {
                    match chars.next()? {
                        '\\' => item.push(chars.next()?),
                        c if c == q => break,
                        c => item.push(c),
                    }
                }
                items.push(item);
            }
            '[' | '{' => return None,
            _ => {
                let mut item = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ',' || c == ']' {
                        break;
                    }
                    item.push(c);
                    chars.next();
                }
                items.push(item.trim().to_string());
            }
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next()? {
            ',' => continue,
            ']' => break,
            _ => return None,
        }
    }

    chars.all(char::is_whitespace).then_some(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action() {
        let parsed = parse_action("Tool[arg]").unwrap();
        assert_eq!(parsed.name, "Tool");
        assert_eq!(parsed.argument, "arg");

        let nested = parse_action("search[rust [async] book]").unwrap();
        assert_eq!(nested.argument, "rust [async] book");

        assert_eq!(parse_action("`calculate[2+2]`").unwrap().argument, "2+2");
    }

    #[test]
    fn test_parse_action_malformed() {
        assert!(parse_action("").is_none());
        assert!(parse_action("Tool").is_none());
        assert!(parse_action("Tool[arg").is_none());
        assert!(parse_action("[arg]").is_none());
        assert!(parse_action("two words[x]").is_none());
    }

    #[test]
    fn test_react_output_markdown() {
        let text = "**Thought:** I need to add.\n**Action:** calculate[2+2]\n";
        let (thought, action) = parse_react_output(text);
        assert_eq!(thought.as_deref(), Some("I need to add."));
        assert_eq!(action.as_deref(), Some("calculate[2+2]"));
    }

    #[test]
    fn test_react_output_plain() {
        let text = "Thought: done\nthinking more\nAction: Finish[42]";
        let (thought, action) = parse_react_output(text);
        assert_eq!(thought.as_deref(), Some("done\nthinking more"));
        assert_eq!(action.as_deref(), Some("Finish[42]"));

        assert_eq!(parse_react_output("just chatting"), (None, None));
    }

    #[test]
    fn test_react_step() {
        assert_eq!(ReactStep::from_action("Finish[42]"), ReactStep::Finish("42".into()));
        assert_eq!(ReactStep::from_action("Finish: 42"), ReactStep::Finish("42".into()));
        assert!(matches!(ReactStep::from_action("calculate[1]"), ReactStep::Call(p) if p.name == "calculate"));
        assert!(matches!(ReactStep::from_action("call the calculator"), ReactStep::Invalid(_)));
    }

    #[test]
    fn test_tools_named_like_finish_are_calls() {
        assert!(matches!(ReactStep::from_action("Finisher[x]"), ReactStep::Call(p) if p.name == "Finisher"));
        assert!(matches!(ReactStep::from_action("FinishLine[lap 3]"), ReactStep::Call(p) if p.argument == "lap 3"));
        assert!(matches!(ReactStep::from_action("Finishing up"), ReactStep::Invalid(_)));
        assert_eq!(ReactStep::from_action("`Finish[done]`"), ReactStep::Finish("done".into()));
    }

    #[test]
    fn test_tool_markers() {
        let text = r#"Let me check. [TOOL_CALL:memory:action=search,query="a]b"] and [TOOL_CALL:calculate:[1, 2]] done"#;
        let calls = parse_tool_markers(text);

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_name, "memory");
        assert_eq!(calls[0].parameters, r#"action=search,query="a]b""#);
        assert_eq!(calls[1].tool_name, "calculate");
        assert_eq!(calls[1].parameters, "[1, 2]");

        assert_eq!(strip_tool_markers(text), "Let me check.  and  done");
    }

    #[test]
    fn test_unterminated_marker_is_ignored() {
        assert!(parse_tool_markers("[TOOL_CALL:calc:2+2").is_empty());
        assert!(parse_tool_markers("no markers").is_empty());
    }

    #[test]
    fn test_parse_plan() {
        let reply = "Here is the plan:\n```python\n[\"Find the price\", 'Multiply by 3', \"Report\"]\n```";
        assert_eq!(
            parse_plan(reply),
            vec!["Find the price", "Multiply by 3", "Report"]
        );

        assert_eq!(parse_plan("[\"only step\",]"), vec!["only step"]);
        assert_eq!(parse_plan("```json\n[\"a\", \"b\"]\n```"), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_plan_rejects_non_lists() {
        assert!(parse_plan("I cannot plan this").is_empty());
        assert!(parse_plan("```python\n{\"a\": 1}\n```").is_empty());
        assert!(parse_plan("[\"unterminated]").is_empty());
    }
}
