//! Tool parameter validation chain
//!
//! Turns the free-form argument text a model writes inside `Tool[...]` or
//! `[TOOL_CALL:tool:...]` into a typed argument map for a [`ToolSchema`]:
//! parse, sanitize, apply defaults, validate.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::tool::{ParameterSchema, ToolSchema};

/// Argument map handed to tools
pub type Arguments = HashMap<String, Value>;

/// Run the full chain: parse, sanitize, defaults, validate
pub fn prepare(raw: &str, schema: &ToolSchema) -> Result<Arguments> {
    let parsed = parse_parameters(raw, schema)?;
    let mut args = sanitize(parsed, schema)?;
    apply_defaults(&mut args, schema);
    validate(&args, schema)?;
    Ok(args)
}

/// Parse raw argument text into a map
pub fn parse_parameters(raw: &str, schema: &ToolSchema) -> Result<Arguments> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Arguments::new());
    }

    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            return Ok(map.into_iter().collect());
        }
    }

    if trimmed.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
            return positional(items, schema);
        }
    }

    if let Some(pairs) = key_value_pairs(trimmed, schema) {
        return Ok(pairs);
    }

    let mut args = Arguments::new();
    args.insert(fallback_key(schema), Value::String(trimmed.to_string()));
    Ok(args)
}

fn positional(items: Vec<Value>, schema: &ToolSchema) -> Result<Arguments> {
    let mut args = Arguments::new();

    match schema.parameters.as_slice() {
        [] => {
            args.insert("input".into(), Value::Array(items));
        }
        [only] if only.param_type == "array" => {
            args.insert(only.name.clone(), Value::Array(items));
        }
        params => {
            if items.len() > params.len() {
                return Err(AgentError::ToolValidation(format!(
                    "Expected at most {} positional arguments, got {}",
                    params.len(),
                    items.len()
                )));
            }
            for (param, value) in params.iter().zip(items) {
                args.insert(param.name.clone(), value);
            }
        }
    }

    Ok(args)
}

/// `key=value` pairs separated by `,`, `&` or newlines. A piece that does
/// not start a declared key belongs to the previous value, so free text
/// such as `content=rust, go and python` keeps its commas.
fn key_value_pairs(raw: &str, schema: &ToolSchema) -> Option<Arguments> {
    let mut pairs: Vec<(&str, String)> = Vec::new();

    for piece in raw.split_inclusive(PAIR_SEPARATORS) {
        let pair = piece
            .split_once('=')
            .map(|(key, value)| (key.trim(), value))
            .filter(|(key, _)| {
                is_identifier(key) && (schema.parameters.is_empty() || schema.parameter(key).is_some())
            });

        match (pair, pairs.last_mut()) {
            (Some((key, value)), _) => pairs.push((key, value.to_string())),
            (None, Some((_, value))) => value.push_str(piece),
            (None, None) if piece.trim_matches(PAIR_SEPARATORS).trim().is_empty() => {}
            (None, None) => return None,
        }
    }

    let args: Arguments = pairs
        .into_iter()
        .map(|(key, value)| {
            let value = value.trim().trim_end_matches(PAIR_SEPARATORS).trim_end();
            (key.to_string(), Value::String(value.to_string()))
        })
        .collect();

    (!args.is_empty()).then_some(args)
}

const PAIR_SEPARATORS: [char; 3] = [',', '&', '\n'];

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn fallback_key(schema: &ToolSchema) -> String {
    schema
        .parameters
        .iter()
        .find(|p| p.required)
        .or_else(|| schema.parameters.first())
        .map_or_else(|| "input".to_string(), |p| p.name.clone())
}

/// Normalise string values and coerce them to their declared types
pub fn sanitize(args: Arguments, schema: &ToolSchema) -> Result<Arguments> {
    args.into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => Value::String(normalize_string(&s)),
                other => other,
            };
            let value = match schema.parameter(&key) {
                Some(param) => coerce(value, param)?,
                None => value,
            };
            Ok((key, value))
        })
        .collect()
}

/// Trim a model-written string: drop stray or surrounding quotes and close
/// a dangling `[` or `(`
pub fn normalize_string(value: &str) -> String {
    let mut s = value.trim().to_string();

    if let Some(first) = s.chars().next().filter(|c| is_quote(*c)) {
        if s.matches(first).count() == 1 {
            s.remove(0);
        }
    }
    if let Some(last) = s.chars().last().filter(|c| is_quote(*c)) {
        if s.matches(last).count() == 1 {
            s.pop();
        }
    }

    let mut chars = s.chars();
    if let (Some(first), Some(last)) = (chars.next(), chars.next_back()) {
        if is_quote(first) && first == last {
            s = s[1..s.len() - 1].to_string();
        }
    }

    match (s.chars().next(), s.chars().last()) {
        (Some('['), Some(last)) if last != ']' && last != ')' => s.push(']'),
        (Some('('), Some(last)) if last != ']' && last != ')' => s.push(')'),
        _ => {}
    }

    s.trim().to_string()
}

fn is_quote(c: char) -> bool {
    c == '"' || c == '\''
}

fn coerce(value: Value, param: &ParameterSchema) -> Result<Value> {
    let Value::String(s) = &value else {
        return Ok(value);
    };

    let invalid = |expected: &str| {
        AgentError::ToolValidation(format!(
            "Parameter '{}' expects {}, got '{}'",
            param.name, expected, s
        ))
    };

    match param.param_type.as_str() {
        "integer" => s
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid("an integer")),
        "number" => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid("a number")),
        "boolean" => match s.to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid("a boolean")),
        },
        "array" => {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(s) {
                return Ok(Value::Array(items));
            }
            Ok(Value::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| Value::String(item.to_string()))
                    .collect(),
            ))
        }
        _ => Ok(value),
    }
}

/// Insert declared defaults for missing parameters
pub fn apply_defaults(args: &mut Arguments, schema: &ToolSchema) {
    for param in &schema.parameters {
        if let Some(default) = &param.default {
            args.entry(param.name.clone()).or_insert_with(|| default.clone());
        }
    }
}

/// Required parameters present, enum members respected
pub fn validate(args: &Arguments, schema: &ToolSchema) -> Result<()> {
    for param in &schema.parameters {
        match args.get(&param.name) {
            None if param.required => {
                return Err(AgentError::ToolValidation(format!(
                    "Missing required parameter: {}",
                    param.name
                )));
            }
            Some(value) => {
                if let Some(allowed) = &param.enum_values {
                    if !allowed.contains(value) {
                        return Err(AgentError::ToolValidation(format!(
                            "Parameter '{}' must be one of {}",
                            param.name,
                            Value::Array(allowed.clone())
                        )));
                    }
                }
            }
            None => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(parameters: Vec<ParameterSchema>) -> ToolSchema {
        ToolSchema {
            name: "sample".into(),
            description: "test tool".into(),
            parameters,
            category: None,
            has_side_effects: false,
        }
    }

    fn search_schema() -> ToolSchema {
        schema(vec![
            ParameterSchema::required("query", "string", "Search terms"),
            ParameterSchema::optional("limit", "integer", "Max hits").with_default(json!(5)),
        ])
    }

    #[test]
    fn test_blank_input_is_empty() {
        assert!(parse_parameters("   ", &search_schema()).unwrap().is_empty());
    }

    #[test]
    fn test_json_object() {
        let args = parse_parameters(r#"{"query": "rust", "limit": 3}"#, &search_schema()).unwrap();
        assert_eq!(args["query"], "rust");
        assert_eq!(args["limit"], 3);
    }

    #[test]
    fn test_json_array_is_positional() {
        let args = parse_parameters(r#"["tokio", 2]"#, &search_schema()).unwrap();
        assert_eq!(args["query"], "tokio");
        assert_eq!(args["limit"], 2);

        let err = parse_parameters(r#"["a", 1, true]"#, &search_schema()).unwrap_err();
        assert!(matches!(err, AgentError::ToolValidation(_)));
    }

    #[test]
    fn test_single_array_parameter_takes_whole_array() {
        let tags = schema(vec![ParameterSchema::required("tags", "array", "Tags")]);
        let args = parse_parameters(r#"["a", "b"]"#, &tags).unwrap();
        assert_eq!(args["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_key_value_pairs() {
        let args = parse_parameters("query=rust async, limit=2", &search_schema()).unwrap();
        assert_eq!(args["query"], "rust async");
        assert_eq!(args["limit"], "2");
    }

    #[test]
    fn test_undeclared_keys_fall_back_to_whole_string() {
        let args = parse_parameters("x=1+2", &search_schema()).unwrap();
        assert_eq!(args["query"], "x=1+2");
    }

    #[test]
    fn test_fallback_key_without_schema() {
        let args = parse_parameters("hello world", &schema(vec![])).unwrap();
        assert_eq!(args["input"], "hello world");
    }

    #[test]
    fn test_normalize_string() {
        assert_eq!(normalize_string("  \"quoted\"  "), "quoted");
        assert_eq!(normalize_string("'dangling"), "dangling");
        assert_eq!(normalize_string("trailing\""), "trailing");
        assert_eq!(normalize_string("[1, 2"), "[1, 2]");
        assert_eq!(normalize_string("(a"), "(a)");
        assert_eq!(normalize_string("it's fine's"), "it's fine's");
    }

    #[test]
    fn test_prepare_coerces_and_defaults() {
        let args = prepare("query='tokio'", &search_schema()).unwrap();
        assert_eq!(args["query"], "tokio");
        assert_eq!(args["limit"], 5);

        let args = prepare("query=x, limit=7", &search_schema()).unwrap();
        assert_eq!(args["limit"], 7);
    }

    #[test]
    fn test_prepare_rejects_bad_types_and_missing_required() {
        let err = prepare("query=x, limit=many", &search_schema()).unwrap_err();
        assert!(err.to_string().contains("limit"));

        let err = prepare("", &search_schema()).unwrap_err();
        assert!(err.to_string().contains("query"));
    }

    #[test]
    fn test_array_coercion_from_comma_list() {
        let tags = schema(vec![
            ParameterSchema::required("content", "string", "Body"),
            ParameterSchema::optional("tags", "array", "Tags"),
        ]);
        let args = prepare("content=note, tags=a", &tags).unwrap();
        assert_eq!(args["tags"], json!(["a"]));

        let args = prepare("content=note, tags=a, b,c", &tags).unwrap();
        assert_eq!(args["content"], "note");
        assert_eq!(args["tags"], json!(["a", "b", "c"]));
    }

    #[test]
    fn test_free_text_values_keep_commas() {
        let memory = schema(vec![
            ParameterSchema::required("action", "string", "Operation")
                .with_enum(vec![json!("add"), json!("search")]),
            ParameterSchema::optional("content", "string", "Text"),
            ParameterSchema::optional("importance", "number", "Weight"),
        ]);

        let args = prepare("action=add,content=I like rust, go and python", &memory).unwrap();
        assert_eq!(args["action"], "add");
        assert_eq!(args["content"], "I like rust, go and python");

        let args = prepare("content=rock & roll, a=b,importance=0.8,action=add", &memory).unwrap();
        assert_eq!(args["content"], "rock & roll, a=b");
        assert_eq!(args["importance"], 0.8);
        assert_eq!(args["action"], "add");

        let args = parse_parameters(",query=x,,limit=3,", &search_schema()).unwrap();
        assert_eq!(args["query"], "x");
        assert_eq!(args["limit"], "3");
    }
}
