//! Provider Auto-Detection
//!
//! Works out which OpenAI-compatible backend to talk to from environment
//! variables, then resolves the key, base URL, model and timeout for it.
//!
//! Resolution order for every field: explicit overrides, then the generic
//! `LLM_*` variables, then provider-specific variables, then the built-in
//! defaults for the detected provider.

use std::fmt;
use std::str::FromStr;

use agent_core::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Request timeout used when `LLM_TIMEOUT` is not set
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Known OpenAI-compatible backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    DeepSeek,
    Qwen,
    ModelScope,
    Kimi,
    Zhipu,
    Ollama,
    Vllm,
    Local,
    Custom,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 10] = [
        ProviderKind::OpenAi,
        ProviderKind::DeepSeek,
        ProviderKind::Qwen,
        ProviderKind::ModelScope,
        ProviderKind::Kimi,
        ProviderKind::Zhipu,
        ProviderKind::Ollama,
        ProviderKind::Vllm,
        ProviderKind::Local,
        ProviderKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Qwen => "qwen",
            ProviderKind::ModelScope => "modelscope",
            ProviderKind::Kimi => "kimi",
            ProviderKind::Zhipu => "zhipu",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Vllm => "vllm",
            ProviderKind::Local => "local",
            ProviderKind::Custom => "custom",
        }
    }

    /// Self-hosted servers that accept any API key
    pub fn is_local(&self) -> bool {
        matches!(self, ProviderKind::Ollama | ProviderKind::Vllm | ProviderKind::Local)
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("https://api.openai.com/v1"),
            ProviderKind::DeepSeek => Some("https://api.deepseek.com"),
            ProviderKind::Qwen => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
            ProviderKind::ModelScope => Some("https://api-inference.modelscope.cn/v1/"),
            ProviderKind::Kimi => Some("https://api.moonshot.cn/v1"),
            ProviderKind::Zhipu => Some("https://open.bigmodel.cn/api/paas/v4/"),
            ProviderKind::Ollama => Some("http://localhost:11434/v1"),
            ProviderKind::Vllm | ProviderKind::Local => Some("http://localhost:8000/v1"),
            ProviderKind::Custom => None,
        }
    }

    pub fn default_model(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("gpt-3.5-turbo"),
            ProviderKind::DeepSeek => Some("deepseek-chat"),
            ProviderKind::Qwen => Some("qwen-plus"),
            ProviderKind::ModelScope => Some("Qwen/Qwen2.5-72B-Instruct"),
            ProviderKind::Kimi => Some("moonshot-v1-8k"),
            ProviderKind::Zhipu => Some("glm-4"),
            ProviderKind::Ollama => Some("llama3.2"),
            ProviderKind::Vllm => Some("meta-llama/Llama-2-7b-chat-hf"),
            ProviderKind::Local => Some("local-model"),
            ProviderKind::Custom => None,
        }
    }

    /// Key sent to local servers when none is configured
    pub fn placeholder_key(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Ollama => Some("ollama"),
            ProviderKind::Vllm => Some("vllm"),
            ProviderKind::Local => Some("local"),
            _ => None,
        }
    }

    /// Provider-specific API key variables, in priority order
    pub fn key_vars(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::OpenAi => &["OPENAI_API_KEY"],
            ProviderKind::DeepSeek => &["DEEPSEEK_API_KEY"],
            ProviderKind::Qwen => &["DASHSCOPE_API_KEY"],
            ProviderKind::ModelScope => &["MODELSCOPE_API_KEY"],
            ProviderKind::Kimi => &["KIMI_API_KEY", "MOONSHOT_API_KEY"],
            ProviderKind::Zhipu => &["ZHIPU_API_KEY", "GLM_API_KEY"],
            ProviderKind::Ollama => &["OLLAMA_API_KEY"],
            ProviderKind::Vllm => &["VLLM_API_KEY"],
            ProviderKind::Local | ProviderKind::Custom => &[],
        }
    }

    /// Provider-specific host variable
    pub fn host_var(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Ollama => Some("OLLAMA_HOST"),
            ProviderKind::Vllm => Some("VLLM_HOST"),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "qwen" | "dashscope" => Ok(ProviderKind::Qwen),
            "modelscope" => Ok(ProviderKind::ModelScope),
            "kimi" | "moonshot" => Ok(ProviderKind::Kimi),
            "zhipu" | "glm" => Ok(ProviderKind::Zhipu),
            "ollama" => Ok(ProviderKind::Ollama),
            "vllm" => Ok(ProviderKind::Vllm),
            "local" => Ok(ProviderKind::Local),
            "custom" | "auto" => Ok(ProviderKind::Custom),
            other => Err(AgentError::Config(format!("Unknown LLM provider '{}'", other))),
        }
    }
}

/// Lookup that treats blank values as unset
fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Infer the provider from environment variables
///
/// Order: `LLM_PROVIDER`, provider-specific key or host variables,
/// the shape of `LLM_API_KEY`, then host patterns in `LLM_BASE_URL`.
pub fn detect_provider<F>(lookup: F) -> ProviderKind
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(explicit) = non_empty(&lookup, "LLM_PROVIDER") {
        match explicit.parse::<ProviderKind>() {
            Ok(kind) => return kind,
            Err(e) => warn!(error = %e, "Ignoring LLM_PROVIDER"),
        }
    }

    for kind in ProviderKind::ALL {
        let by_key = kind.key_vars().iter().any(|var| non_empty(&lookup, var).is_some());
        let by_host = kind.host_var().is_some_and(|var| non_empty(&lookup, var).is_some());
        if by_key || by_host {
            debug!(provider = %kind, "Detected provider from dedicated variables");
            return kind;
        }
    }

    if non_empty(&lookup, "LLM_API_KEY").is_some_and(|key| key.starts_with("ms-")) {
        return ProviderKind::ModelScope;
    }

    if let Some(url) = non_empty(&lookup, "LLM_BASE_URL") {
        if let Some(kind) = kind_from_url(&url) {
            debug!(provider = %kind, url = %url, "Detected provider from base URL");
            return kind;
        }
    }

    ProviderKind::Custom
}

fn kind_from_url(url: &str) -> Option<ProviderKind> {
    let url = url.to_lowercase();
    let kind = if url.contains("api.openai.com") {
        ProviderKind::OpenAi
    } else if url.contains("api.deepseek.com") {
        ProviderKind::DeepSeek
    } else if url.contains("dashscope.aliyuncs.com") {
        ProviderKind::Qwen
    } else if url.contains("modelscope") {
        ProviderKind::ModelScope
    } else if url.contains("moonshot") {
        ProviderKind::Kimi
    } else if url.contains("bigmodel.cn") {
        ProviderKind::Zhipu
    } else if url.contains(":11434") || url.contains("ollama") {
        ProviderKind::Ollama
    } else if url.contains(":8000") || url.contains("vllm") {
        ProviderKind::Vllm
    } else if url.contains("localhost") || url.contains("127.0.0.1") {
        ProviderKind::Local
    } else {
        return None;
    };
    Some(kind)
}

/// Values that take precedence over anything in the environment
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProviderOverrides {
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Fully resolved connection settings for one provider
#[derive(Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ProviderConfig {
    /// Resolve from process environment variables
    pub fn from_env() -> Result<Self> {
        resolve_config(|key| std::env::var(key).ok(), &ProviderOverrides::default())
    }

    /// Resolve from the environment with explicit overrides on top
    pub fn from_env_with(overrides: &ProviderOverrides) -> Result<Self> {
        resolve_config(|key| std::env::var(key).ok(), overrides)
    }

    /// `{base_url}/{path}` without doubled slashes
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Ollama and vLLM hosts are often given without the `/v1` suffix
fn openai_root(host: &str) -> String {
    let host = host.trim_end_matches('/');
    let host = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };
    if host.ends_with("/v1") {
        host
    } else {
        format!("{}/v1", host)
    }
}

/// Resolve provider settings through an arbitrary key lookup
pub fn resolve_config<F>(lookup: F, overrides: &ProviderOverrides) -> Result<ProviderConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let kind = match overrides.provider {
        Some(kind) => kind,
        None => detect_provider(&lookup),
    };

    let api_key = overrides
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .or_else(|| non_empty(&lookup, "LLM_API_KEY"))
        .or_else(|| kind.key_vars().iter().find_map(|var| non_empty(&lookup, var)))
        .or_else(|| kind.placeholder_key().map(str::to_string))
        .ok_or_else(|| {
            let vars = match kind.key_vars() {
                [] => "LLM_API_KEY".to_string(),
                vars => format!("LLM_API_KEY or {}", vars.join("/")),
            };
            AgentError::Config(format!("No API key for provider '{}'; set {}", kind, vars))
        })?;

    let base_url = overrides
        .base_url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .or_else(|| non_empty(&lookup, "LLM_BASE_URL"))
        .or_else(|| kind.host_var().and_then(|var| non_empty(&lookup, var)).map(|h| openai_root(&h)))
        .or_else(|| kind.default_base_url().map(str::to_string))
        .ok_or_else(|| {
            AgentError::Config(format!("No base URL for provider '{}'; set LLM_BASE_URL", kind))
        })?;

    let model = overrides
        .model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .or_else(|| non_empty(&lookup, "LLM_MODEL_ID"))
        .or_else(|| kind.default_model().map(str::to_string))
        .ok_or_else(|| {
            AgentError::Config(format!("No model for provider '{}'; set LLM_MODEL_ID", kind))
        })?;

    let timeout_secs = match overrides.timeout_secs {
        Some(secs) => secs,
        None => match non_empty(&lookup, "LLM_TIMEOUT") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                AgentError::Config(format!("LLM_TIMEOUT must be an integer, got '{}': {}", raw, e))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        },
    };

    debug!(provider = %kind, base_url = %base_url, model = %model, "Resolved provider config");

    Ok(ProviderConfig {
        kind,
        api_key,
        base_url,
        model,
        timeout_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_explicit_provider_wins() {
        let lookup = env(&[("LLM_PROVIDER", "DeepSeek"), ("OPENAI_API_KEY", "sk-x")]);
        assert_eq!(detect_provider(lookup), ProviderKind::DeepSeek);
    }

    #[test]
    fn test_invalid_explicit_provider_falls_through() {
        let lookup = env(&[("LLM_PROVIDER", "skynet"), ("MOONSHOT_API_KEY", "k")]);
        assert_eq!(detect_provider(lookup), ProviderKind::Kimi);
    }

    #[test]
    fn test_detect_from_dedicated_variables() {
        assert_eq!(detect_provider(env(&[("DASHSCOPE_API_KEY", "k")])), ProviderKind::Qwen);
        assert_eq!(detect_provider(env(&[("GLM_API_KEY", "k")])), ProviderKind::Zhipu);
        assert_eq!(detect_provider(env(&[("OLLAMA_HOST", "localhost:11434")])), ProviderKind::Ollama);
        assert_eq!(detect_provider(env(&[("VLLM_HOST", "gpu-box:8000")])), ProviderKind::Vllm);
    }

    #[test]
    fn test_detect_from_key_shape_and_url() {
        assert_eq!(detect_provider(env(&[("LLM_API_KEY", "ms-abc")])), ProviderKind::ModelScope);
        assert_eq!(
            detect_provider(env(&[("LLM_BASE_URL", "https://api.deepseek.com/v1")])),
            ProviderKind::DeepSeek
        );
        assert_eq!(
            detect_provider(env(&[("LLM_BASE_URL", "http://127.0.0.1:9000/v1")])),
            ProviderKind::Local
        );
        assert_eq!(
            detect_provider(env(&[("LLM_BASE_URL", "https://llm.example.com/v1")])),
            ProviderKind::Custom
        );
        assert_eq!(detect_provider(env(&[])), ProviderKind::Custom);
    }

    #[test]
    fn test_blank_values_are_unset() {
        let lookup = env(&[("OPENAI_API_KEY", "  "), ("DEEPSEEK_API_KEY", "k")]);
        assert_eq!(detect_provider(lookup), ProviderKind::DeepSeek);
    }

    #[test]
    fn test_resolve_uses_provider_defaults() {
        let config = resolve_config(env(&[("DEEPSEEK_API_KEY", "sk-ds")]), &ProviderOverrides::default()).unwrap();
        assert_eq!(config.kind, ProviderKind::DeepSeek);
        assert_eq!(config.api_key, "sk-ds");
        assert_eq!(config.base_url, "https://api.deepseek.com");
        assert_eq!(config.model, "deepseek-chat");
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.endpoint("/chat/completions"), "https://api.deepseek.com/chat/completions");
    }

    #[test]
    fn test_generic_variables_beat_provider_specific() {
        let lookup = env(&[
            ("OPENAI_API_KEY", "sk-specific"),
            ("LLM_API_KEY", "sk-generic"),
            ("LLM_MODEL_ID", "gpt-4o-mini"),
            ("LLM_TIMEOUT", "15"),
        ]);
        let config = resolve_config(lookup, &ProviderOverrides::default()).unwrap();
        assert_eq!(config.kind, ProviderKind::OpenAi);
        assert_eq!(config.api_key, "sk-generic");
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.timeout_secs, 15);
    }

    #[test]
    fn test_overrides_beat_environment() {
        let overrides = ProviderOverrides {
            provider: Some(ProviderKind::Qwen),
            api_key: Some("explicit".into()),
            model: Some("qwen-max".into()),
            ..Default::default()
        };
        let config = resolve_config(env(&[("LLM_API_KEY", "env"), ("LLM_MODEL_ID", "m")]), &overrides).unwrap();
        assert_eq!(config.kind, ProviderKind::Qwen);
        assert_eq!(config.api_key, "explicit");
        assert_eq!(config.model, "qwen-max");
        assert!(config.base_url.starts_with("https://dashscope"));
    }

    #[test]
    fn test_local_providers_get_placeholder_key() {
        let config = resolve_config(env(&[("OLLAMA_HOST", "localhost:11434")]), &ProviderOverrides::default()).unwrap();
        assert_eq!(config.kind, ProviderKind::Ollama);
        assert_eq!(config.api_key, "ollama");
        assert_eq!(config.base_url, "http://localhost:11434/v1");
        assert_eq!(config.model, "llama3.2");
    }

    #[test]
    fn test_missing_key_or_url_is_config_error() {
        let err = resolve_config(env(&[("LLM_PROVIDER", "openai")]), &ProviderOverrides::default()).unwrap_err();
        assert!(matches!(err, AgentError::Config(ref msg) if msg.contains("OPENAI_API_KEY")));

        let err = resolve_config(env(&[("LLM_API_KEY", "k")]), &ProviderOverrides::default()).unwrap_err();
        assert!(matches!(err, AgentError::Config(ref msg) if msg.contains("LLM_BASE_URL")));
    }

    #[test]
    fn test_bad_timeout() {
        let lookup = env(&[("DEEPSEEK_API_KEY", "k"), ("LLM_TIMEOUT", "soon")]);
        assert!(matches!(
            resolve_config(lookup, &ProviderOverrides::default()),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_kind_round_trips_through_display() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.to_string().parse::<ProviderKind>().unwrap(), kind);
        }
        assert!(format!("{:?}", resolve_config(env(&[("OPENAI_API_KEY", "sk-secret")]), &ProviderOverrides::default()).unwrap())
            .contains("<redacted>"));
    }
}
