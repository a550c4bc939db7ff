//! Current date and time

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema};

pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "datetime".into(),
            description: "Get the current date and time (UTC)".into(),
            parameters: vec![
                ParameterSchema::optional("format", "string", "Output format: 'iso', 'human', or 'unix'")
                    .with_default(serde_json::json!("human"))
                    .with_enum(vec![
                        serde_json::json!("iso"),
                        serde_json::json!("human"),
                        serde_json::json!("unix"),
                    ]),
            ],
            category: Some("time".into()),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let format = call.str_arg("format").unwrap_or("human");
        Ok(ToolResult::success("datetime", render(Utc::now(), format)))
    }
}

fn render(now: DateTime<Utc>, format: &str) -> String {
    match format {
        "iso" => now.to_rfc3339(),
        "unix" => now.timestamp().to_string(),
        _ => now.format("%A, %B %d, %Y at %H:%M:%S UTC").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_formats() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(render(at, "unix"), "1709296200");
        assert_eq!(render(at, "iso"), "2024-03-01T12:30:00+00:00");
        assert_eq!(render(at, "human"), "Friday, March 01, 2024 at 12:30:00 UTC");
    }

    #[tokio::test]
    async fn test_default_format_applied_by_registry() {
        let mut registry = crate::tool::ToolRegistry::new();
        registry.register(DateTimeTool);
        let out = registry.execute_text("datetime", "").await;
        assert!(out.contains(" at "));
        assert!(out.ends_with("UTC"));
    }
}
