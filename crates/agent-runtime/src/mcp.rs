//! MCP (Model Context Protocol) client over stdio
//!
//! [`McpClient`] talks newline-delimited JSON-RPC 2.0 with a server process,
//! performs the `initialize` handshake and exposes every remote tool as an
//! [`McpTool`] that registers in a [`ToolRegistry`] like any local tool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use agent_core::tool::ParameterSchema;
use agent_core::{AgentError, Result, Tool, ToolCall, ToolRegistry, ToolResult, ToolSchema};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const METHOD_NOT_FOUND: i64 = -32601;

/// How to launch an MCP server
#[derive(Clone, Debug, Default, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl McpServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Whitespace-separated command line, e.g. `npx -y @scope/server`.
    /// A bare `.py` script runs under `python`.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(String::from);
        let Some(first) = parts.next() else {
            return Err(AgentError::Config("Empty MCP server command".into()));
        };
        let config = if first.ends_with(".py") {
            Self::new("python").arg(first)
        } else {
            Self::new(first)
        };
        Ok(parts.fold(config, Self::arg))
    }
}

/// A tool as advertised by `tools/list`
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Text returned by `tools/call`
#[derive(Clone, Debug, PartialEq)]
pub struct McpCallOutput {
    pub text: String,
    pub is_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolPage {
    #[serde(default)]
    tools: Vec<McpToolInfo>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallOutcome {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Any line the server sends: a response, a notification or a request
#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Connection {
    writer: Writer,
    lines: Lines<BufReader<Reader>>,
    next_id: u64,
}

impl Connection {
    async fn send(&mut self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn notify(&mut self, method: &str) -> Result<()> {
        self.send(&json!({"jsonrpc": "2.0", "method": method})).await
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        self.send(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await?;

        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Err(AgentError::ToolExecution(format!(
                    "MCP server closed the connection during {method}"
                )));
            };
            if line.trim().is_empty() {
                continue;
            }
            let incoming: Incoming = match serde_json::from_str(&line) {
                Ok(incoming) => incoming,
                Err(e) => {
                    debug!(error = %e, "Skipping non JSON-RPC output from MCP server");
                    continue;
                }
            };

            if let Some(server_method) = incoming.method {
                if let Some(request_id) = incoming.id {
                    let reply = if server_method == "ping" {
                        json!({"jsonrpc": "2.0", "id": request_id, "result": {}})
                    } else {
                        json!({
                            "jsonrpc": "2.0",
                            "id": request_id,
                            "error": {"code": METHOD_NOT_FOUND, "message": "Method not found"}
                        })
                    };
                    self.send(&reply).await?;
                }
                debug!(method = %server_method, "MCP server message handled");
                continue;
            }

            if incoming.id.as_ref().and_then(Value::as_u64) != Some(id) {
                debug!(expected = id, "Stale MCP response dropped");
                continue;
            }
            if let Some(error) = incoming.error {
                return Err(AgentError::ToolExecution(format!(
                    "MCP {method} failed ({}): {}",
                    error.code, error.message
                )));
            }
            return Ok(incoming.result.unwrap_or(Value::Null));
        }
    }
}

/// Connection to one MCP server
pub struct McpClient {
    name: String,
    connection: Mutex<Connection>,
    child: Mutex<Option<Child>>,
    timeout: Duration,
}

impl McpClient {
    /// Start the server process and complete the handshake
    pub async fn spawn(config: &McpServerConfig) -> Result<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            AgentError::Config(format!("Cannot start MCP server '{}': {e}", config.command))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(AgentError::Other("MCP server stdio unavailable".into()));
        };

        let client = Self::connect(stdout, stdin).await?;
        *client.child.lock().await = Some(child);
        Ok(client)
    }

    /// Handshake over an already open byte stream
    pub async fn connect<R, W>(reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Reader = Box::new(reader);
        let mut client = Self {
            name: "mcp".into(),
            connection: Mutex::new(Connection {
                writer: Box::new(writer),
                lines: BufReader::new(reader).lines(),
                next_id: 0,
            }),
            child: Mutex::new(None),
            timeout: REQUEST_TIMEOUT,
        };

        let init = client
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "rust-agent", "version": env!("CARGO_PKG_VERSION")}
                }),
            )
            .await?;
        if let Some(name) = init.pointer("/serverInfo/name").and_then(Value::as_str) {
            client.name = name.to_string();
        }
        client.connection.lock().await.notify("notifications/initialized").await?;

        info!(server = %client.name, "Connected to MCP server");
        Ok(client)
    }

    /// Name the server reported during the handshake
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let mut connection = self.connection.lock().await;
        tokio::time::timeout(self.timeout, connection.request(method, params))
            .await
            .map_err(|_| AgentError::ToolExecution(format!("MCP {method} timed out")))?
    }

    /// Every tool the server offers, following `nextCursor` pages
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({"cursor": cursor}),
                None => json!({}),
            };
            let page: ToolPage = serde_json::from_value(self.request("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpCallOutput> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        let outcome: CallOutcome = serde_json::from_value(result)?;
        Ok(McpCallOutput {
            text: extract_text(&outcome.content),
            is_error: outcome.is_error,
        })
    }

    pub async fn ping(&self) -> bool {
        self.request("ping", json!({})).await.is_ok()
    }

    /// Remote tools wrapped for a [`ToolRegistry`]
    pub async fn tools(self: &Arc<Self>) -> Result<Vec<McpTool>> {
        Ok(self
            .list_tools()
            .await?
            .iter()
            .map(|info| McpTool::new(self.clone(), info))
            .collect())
    }

    /// Register every remote tool, returning how many were added
    pub async fn register_tools(self: &Arc<Self>, registry: &mut ToolRegistry) -> Result<usize> {
        let tools = self.tools().await?;
        let count = tools.len();
        for tool in tools {
            registry.register(tool);
        }
        info!(server = %self.name, count, "MCP tools registered");
        Ok(count)
    }
}

/// Text parts joined by newlines; other content kinds are named
fn extract_text(content: &[Value]) -> String {
    content
        .iter()
        .map(|part| match part["type"].as_str() {
            Some("text") => part["text"].as_str().unwrap_or_default().to_string(),
            Some("resource") => match part.pointer("/resource/text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => "[resource content]".into(),
            },
            Some(kind) => format!("[{kind} content]"),
            None => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// JSON Schema `type` of a property; nullable unions keep their first real type
fn json_type(property: &Value) -> String {
    match &property["type"] {
        Value::String(kind) => kind.clone(),
        Value::Array(kinds) => kinds
            .iter()
            .filter_map(Value::as_str)
            .find(|kind| *kind != "null")
            .unwrap_or("string")
            .to_string(),
        _ => "string".into(),
    }
}

/// Flatten an MCP `inputSchema` into parameter definitions
pub fn convert_schema(info: &McpToolInfo, server: &str) -> ToolSchema {
    let required: Vec<&str> = info.input_schema["required"]
        .as_array()
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut parameters: Vec<ParameterSchema> = info.input_schema["properties"]
        .as_object()
        .map(|properties| {
            properties
                .iter()
                .map(|(name, property)| {
                    let description = property["description"].as_str().unwrap_or_default();
                    let mut param = if required.contains(&name.as_str()) {
                        ParameterSchema::required(name, json_type(property), description)
                    } else {
                        ParameterSchema::optional(name, json_type(property), description)
                    };
                    if let Some(values) = property["enum"].as_array() {
                        param = param.with_enum(values.clone());
                    }
                    if let Some(default) = property.get("default") {
                        param = param.with_default(default.clone());
                    }
                    param
                })
                .collect()
        })
        .unwrap_or_default();
    parameters.sort_by_key(|p| !p.required);

    ToolSchema {
        name: info.name.clone(),
        description: info
            .description
            .clone()
            .unwrap_or_else(|| format!("{} tool from MCP server {server}", info.name)),
        parameters,
        category: Some(format!("mcp:{server}")),
        has_side_effects: true,
    }
}

/// A remote MCP tool callable through the local [`Tool`] trait
pub struct McpTool {
    client: Arc<McpClient>,
    schema: ToolSchema,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, info: &McpToolInfo) -> Self {
        let schema = convert_schema(info, client.name());
        Self { client, schema }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let arguments = Value::Object(call.arguments.clone().into_iter().collect());
        let output = self.client.call_tool(&self.schema.name, arguments).await?;
        Ok(if output.is_error {
            ToolResult::failure(&self.schema.name, output.text)
        } else {
            ToolResult::success(&self.schema.name, output.text)
        })
    }
}
