use anyhow::{Context, Result};

use crate::openai::{ChatMessage, OpenAiClient};
use crate::tools::Toolbox;

const SYSTEM_PROMPT: &str = "You are the Groundhog assistant. Help users manage schedules and tasks \
using the provided tools. Prefer tool use when information must be retrieved, created, or updated. \
Keep answers brief and actionable.";

pub const MAX_ITERATIONS_REPLY: &str = "Agent stopped due to max iterations.";

/// Tool-calling chat agent with per-conversation memory.
pub struct Agent {
    llm: OpenAiClient,
    tools: Toolbox,
    max_iterations: usize,
    /// User turns and final assistant replies.
    history: Vec<ChatMessage>,
}

impl Agent {
    pub fn new(llm: OpenAiClient, tools: Toolbox, max_iterations: usize) -> Self {
        Self {
            llm,
            tools,
            max_iterations: max_iterations.max(1),
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Answer one user input, calling tools as the model requests.
    pub async fn run(&mut self, input: &str) -> Result<String> {
        let schemas = self.tools.schemas();
        let user = ChatMessage::user(input);

        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(SYSTEM_PROMPT));
        messages.extend(self.history.iter().cloned());
        messages.push(user.clone());

        for iteration in 1..=self.max_iterations {
            let reply = self
                .llm
                .chat(&messages, &schemas)
                .await
                .with_context(|| format!("Agent: model call {} failed", iteration))?;

            if reply.tool_calls.is_empty() {
                let answer = reply.content.unwrap_or_default();
                self.history.push(user);
                self.history.push(ChatMessage::assistant(answer.clone()));
                return Ok(answer);
            }

            let calls = reply.tool_calls.clone();
            messages.push(reply);
            for call in calls {
                log::debug!("Agent: tool {} args {}", call.function.name, call.function.arguments);
                let output = match self.tools.dispatch(&call.function.name, &call.function.arguments).await {
                    Ok(output) => output,
                    Err(e) => {
                        log::warn!("Agent: tool {} failed: {}", call.function.name, e);
                        format!("Error: {}", e)
                    }
                };
                messages.push(ChatMessage::tool_result(call.id, output));
            }
        }

        log::warn!("Agent: gave up after {} iterations", self.max_iterations);
        self.history.push(user);
        self.history.push(ChatMessage::assistant(MAX_ITERATIONS_REPLY));
        Ok(MAX_ITERATIONS_REPLY.to_string())
    }
}
