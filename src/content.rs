use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::comment::Comment;

/// Conversational-continuity content collaborator. The ingestion core only
/// forwards what these calls produce; how the content is generated is not its
/// concern.
#[async_trait]
pub trait ContentEngine: Send + Sync {
    /// Whether the last assistant turn warrants a follow-up before waiting
    /// for more viewer input.
    async fn is_continuation_needed(&self, history: &[ChatMessage]) -> Result<bool>;

    /// Prompt that continues the current line of conversation.
    async fn continuation_prompt(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>>;

    /// A fresh topic to pivot to after sustained silence.
    async fn new_topic(&self, history: &[ChatMessage]) -> Result<String>;

    /// Prompt that pivots the conversation to `topic`.
    async fn new_topic_prompt(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        topic: &str,
    ) -> Result<Vec<ChatMessage>>;

    /// Prompt that winds the conversation down into sleep mode.
    async fn sleep_prompt(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>>;

    /// Pick the single best comment to answer given the conversation so far.
    /// Returns the comment text, or `""` when none is worth answering.
    async fn rank_best_comment(
        &self,
        history: &[ChatMessage],
        comments: &[Comment],
    ) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct ContinuationDecision {
    continuation_needed: bool,
    #[allow(dead_code)]
    #[serde(default)]
    reasoning: String,
}

/// `ContentEngine` backed by an OpenAI-compatible chat completion endpoint
/// (Ollama, LM Studio, vLLM, OpenAI, etc.).
#[derive(Clone)]
pub struct LlmContentEngine {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl LlmContentEngine {
    pub fn new(api_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    async fn generate(&self, messages: Vec<WireMessage>) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.7),
            max_tokens: Some(1000),
        };

        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = self.api_key.as_deref() {
            if !key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", key));
            }
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }

    async fn generate_json<T>(&self, messages: Vec<WireMessage>) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self.generate(messages).await?;

        match serde_json::from_str::<T>(&response) {
            Ok(parsed) => Ok(parsed),
            Err(_) => {
                let extracted = extract_json_block(&response);
                serde_json::from_str::<T>(extracted).context(format!(
                    "Failed to parse JSON response. Raw response: {}",
                    response
                ))
            }
        }
    }

    fn prompt_stack(&self, system_prompt: &str, history: &[ChatMessage]) -> Vec<WireMessage> {
        let mut messages = vec![WireMessage {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        }];
        messages.extend(history.iter().map(|m| WireMessage {
            role: m.role.clone(),
            content: m.content.clone(),
        }));
        messages
    }

    fn history_digest(history: &[ChatMessage]) -> String {
        history
            .iter()
            .rev()
            .take(10)
            .rev()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Pull the JSON body out of a response that wraps it in markdown fences or
/// surrounding prose.
fn extract_json_block(response: &str) -> &str {
    if let Some(start) = response.find("```json") {
        let after_start = &response[start + 7..];
        if let Some(end) = after_start.find("```") {
            return after_start[..end].trim();
        }
        return response;
    }
    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            return &response[start..=end];
        }
    }
    response
}

#[async_trait]
impl ContentEngine for LlmContentEngine {
    async fn is_continuation_needed(&self, history: &[ChatMessage]) -> Result<bool> {
        let messages = vec![
            WireMessage {
                role: "system".to_string(),
                content: "You decide whether a streamer's last reply left a thought unfinished \
                          and should be continued before waiting for new viewer comments. \
                          Respond with JSON: {\"continuation_needed\": true/false, \
                          \"reasoning\": \"short explanation\"}"
                    .to_string(),
            },
            WireMessage {
                role: "user".to_string(),
                content: format!("Recent conversation:\n{}", Self::history_digest(history)),
            },
        ];

        let decision: ContinuationDecision = self.generate_json(messages).await?;
        Ok(decision.continuation_needed)
    }

    async fn continuation_prompt(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = self.prompt_stack(system_prompt, history);
        messages.push(WireMessage {
            role: "user".to_string(),
            content: "No new viewer comments arrived. Continue your previous thought naturally, \
                      without mentioning the silence."
                .to_string(),
        });

        let content = self.generate(messages).await?;
        Ok(vec![ChatMessage::new("assistant", content)])
    }

    async fn new_topic(&self, history: &[ChatMessage]) -> Result<String> {
        let messages = vec![
            WireMessage {
                role: "system".to_string(),
                content: "Suggest one short, concrete topic the streamer could pivot to next. \
                          It must differ from what was recently discussed. \
                          Answer with the topic only, no punctuation around it."
                    .to_string(),
            },
            WireMessage {
                role: "user".to_string(),
                content: format!("Recent conversation:\n{}", Self::history_digest(history)),
            },
        ];

        let topic = self.generate(messages).await?;
        Ok(topic.trim().to_string())
    }

    async fn new_topic_prompt(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        topic: &str,
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = self.prompt_stack(system_prompt, history);
        messages.push(WireMessage {
            role: "user".to_string(),
            content: format!(
                "The conversation went quiet. Change the subject to \"{}\" with a natural segue.",
                topic
            ),
        });

        let content = self.generate(messages).await?;
        Ok(vec![ChatMessage::new("assistant", content)])
    }

    async fn sleep_prompt(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = self.prompt_stack(system_prompt, history);
        messages.push(WireMessage {
            role: "user".to_string(),
            content: "The chat has been quiet for a while. Say you will rest for a bit and \
                      invite viewers to leave comments to wake you up."
                .to_string(),
        });

        let content = self.generate(messages).await?;
        Ok(vec![ChatMessage::new("assistant", content)])
    }

    async fn rank_best_comment(
        &self,
        history: &[ChatMessage],
        comments: &[Comment],
    ) -> Result<String> {
        let listing = comments
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{}. [{}] {}", i + 1, c.user_name, c.text))
            .collect::<Vec<_>>()
            .join("\n");

        let messages = vec![
            WireMessage {
                role: "system".to_string(),
                content: "Pick the single viewer comment that best fits the ongoing conversation. \
                          Reply with the chosen comment text verbatim and nothing else. \
                          Reply with an empty string if none is worth answering."
                    .to_string(),
            },
            WireMessage {
                role: "user".to_string(),
                content: format!(
                    "Recent conversation:\n{}\n\nComments:\n{}",
                    Self::history_digest(history),
                    listing
                ),
            },
        ];

        let selected = self.generate(messages).await?;
        Ok(selected.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_markdown_fence() {
        let raw = "Sure!\n```json\n{\"continuation_needed\": true}\n```\nDone.";
        assert_eq!(extract_json_block(raw), "{\"continuation_needed\": true}");
    }

    #[test]
    fn extracts_json_from_surrounding_prose() {
        let raw = "I think {\"continuation_needed\": false, \"reasoning\": \"done\"} fits.";
        let parsed: ContinuationDecision =
            serde_json::from_str(extract_json_block(raw)).expect("parse");
        assert!(!parsed.continuation_needed);
    }

    #[test]
    fn history_digest_keeps_last_ten_in_order() {
        let history: Vec<ChatMessage> = (0..12)
            .map(|i| ChatMessage::new("user", format!("m{}", i)))
            .collect();
        let digest = LlmContentEngine::history_digest(&history);
        assert!(digest.starts_with("user: m2"));
        assert!(digest.ends_with("user: m11"));
    }
}
