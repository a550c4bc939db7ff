//! Direct chat agent

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use super::{Agent, AgentCore};
use crate::error::Result;
use crate::message::Message;
use crate::provider::LlmProvider;

/// Stream of text deltas
pub type TextStream<'a> = Pin<Box<dyn Stream<Item = Result<String>> + Send + 'a>>;

/// System prompt + history + user input, one completion per turn
pub struct SimpleAgent {
    core: AgentCore,
}

impl SimpleAgent {
    pub fn new(name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        Self::from_core(AgentCore::new(name, provider))
    }

    pub fn from_core(core: AgentCore) -> Self {
        Self { core }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.core = self.core.with_system_prompt(prompt);
        self
    }

    pub fn core(&self) -> &AgentCore {
        &self.core
    }

    /// Stream the reply chunk by chunk; the turn is recorded once the
    /// provider stream ends
    pub fn run_stream<'a>(&'a mut self, input: &'a str) -> TextStream<'a> {
        Box::pin(async_stream::try_stream! {
            let messages = self.core.chat_messages(self.core.system_prompt(), input);
            let mut upstream = self
                .core
                .provider()
                .complete_stream(&messages, &self.core.options())
                .await?;

            let mut reply = String::new();
            while let Some(chunk) = upstream.next().await {
                let chunk = chunk?;
                if !chunk.delta.is_empty() {
                    reply.push_str(&chunk.delta);
                    yield chunk.delta;
                }
                if chunk.done {
                    break;
                }
            }

            tracing::debug!(agent = %self.core.name(), chars = reply.len(), "Stream finished");
            self.core.record_turn(input, &reply);
        })
    }
}

#[async_trait]
impl Agent for SimpleAgent {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn run(&mut self, input: &str) -> Result<String> {
        let messages = self.core.chat_messages(self.core.system_prompt(), input);
        let reply = self.core.complete(&messages).await?;
        self.core.record_turn(input, &reply);
        Ok(reply)
    }

    fn history(&self) -> &[Message] {
        self.core.history()
    }

    fn clear_history(&mut self) {
        self.core.clear_history();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use crate::testing::ScriptedProvider;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_run_sends_history() {
        let provider = Arc::new(ScriptedProvider::new(["Hi there", "Your name is Ada"]));
        let mut agent = SimpleAgent::new("chat", provider.clone()).with_system_prompt("Be kind.");

        assert_eq!(agent.run("Hello, I am Ada").await.unwrap(), "Hi there");
        assert_eq!(agent.run("What is my name?").await.unwrap(), "Your name is Ada");

        let second = &provider.requests()[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[0].role, Role::System);
        assert_eq!(second[0].content, "Be kind.");
        assert_eq!(second[1].content, "Hello, I am Ada");
        assert_eq!(second[3].content, "What is my name?");
        assert_eq!(agent.history().len(), 4);
    }

    #[tokio::test]
    async fn test_stream_yields_chunks_then_records() {
        let provider = Arc::new(ScriptedProvider::new(["one two three"]));
        let mut agent = SimpleAgent::new("chat", provider);

        let chunks: Vec<String> = agent.run_stream("count").try_collect().await.unwrap();
        assert_eq!(chunks, vec!["one ", "two ", "three"]);
        assert_eq!(agent.history().len(), 2);
        assert_eq!(agent.history()[1].content, "one two three");
    }

    #[tokio::test]
    async fn test_stream_error_is_yielded() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push_error("down");
        let mut agent = SimpleAgent::new("chat", provider);

        let result: Result<Vec<String>> = agent.run_stream("x").try_collect().await;
        assert!(result.is_err());
        assert!(agent.history().is_empty());
    }
}
