// Concept model seam and an OpenAI-compatible chat-completions client
//
// Three calls back hierarchical classification: concept extraction, major topic
// selection and leaf selection within one topic's roadmap.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

use crate::core::config::Config;
use crate::core::errors::{StageFailure, StageResult};
use crate::core::roadmap::RoadmapTree;
use crate::core::types::MajorTopic;
use crate::middleware::circuit_breaker::CircuitBreakerStats;
use crate::services::http::StageHttpClient;

/// Answer the model gives when nothing fits
const NO_MATCH: &str = "none";

#[async_trait]
pub trait ConceptModel: Send + Sync {
    /// Summarize the mathematical concepts in problem text
    async fn extract_concepts(&self, text: &str) -> StageResult<String>;

    /// Raw major-topic answer for a concept summary; `None` when nothing fits
    async fn determine_major_topic(&self, concepts: &str) -> StageResult<Option<String>>;

    /// Raw leaf answer chosen from `tree`; `None` when nothing fits
    async fn select_leaf(
        &self,
        concepts: &str,
        topic: MajorTopic,
        tree: &RoadmapTree,
    ) -> StageResult<Option<String>>;

    /// Breaker state of the underlying service, when it has one
    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        None
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u32,
}

impl ChatCompletionResponse {
    fn into_content(self) -> StageResult<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| StageFailure::Malformed("completion has no message content".to_string()))
    }
}

/// `None` for an empty or explicit "none" answer
fn optional_answer(content: String) -> Option<String> {
    let answer = content.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '.');
    if answer.is_empty() || answer.eq_ignore_ascii_case(NO_MATCH) {
        None
    } else {
        Some(answer.to_string())
    }
}

/// Concept model backed by an OpenAI-compatible chat completions API
pub struct OpenAiConceptModel {
    client: StageHttpClient,
    api_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiConceptModel {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let classification = &config.classification;
        Ok(Self {
            client: StageHttpClient::new("classification", config.stage_timeout())?,
            api_url: classification.llm_api_url.clone(),
            api_key: classification.llm_api_key.clone(),
            model: classification.llm_model.clone(),
        })
    }

    async fn complete(&self, system: &str, user: String) -> StageResult<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            // resolution must be repeatable for identical input
            temperature: 0.0,
        };

        let start = Instant::now();
        let response: ChatCompletionResponse = match &self.api_key {
            Some(key) => {
                self.client
                    .post_json_authorized(&self.api_url, key, &request)
                    .await?
            }
            None => self.client.post_json(&self.api_url, &request).await?,
        };

        if let Some(usage) = &response.usage {
            debug!(
                "Completion used {} tokens in {:.2}s",
                usage.total_tokens,
                start.elapsed().as_secs_f64()
            );
        }
        response.into_content()
    }
}

fn major_topic_prompt() -> String {
    let labels = MajorTopic::ALL
        .iter()
        .map(|t| format!("- {}", t.label()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You classify elementary and middle school math problems. \
         Given a summary of a problem's concepts, answer with exactly one of the \
         following major categories, copied verbatim, and nothing else:\n{}\n\
         If none applies, answer \"{}\".",
        labels, NO_MATCH
    )
}

#[async_trait]
impl ConceptModel for OpenAiConceptModel {
    fn circuit_stats(&self) -> Option<CircuitBreakerStats> {
        Some(self.client.circuit_stats())
    }

    #[instrument(skip(self, text), fields(text_len = text.len()))]
    async fn extract_concepts(&self, text: &str) -> StageResult<String> {
        let concepts = self
            .complete(
                "You analyze math problems. List the key mathematical concepts the \
                 problem requires, as a short comma-separated summary.",
                format!("Problem:\n{}", text),
            )
            .await?;
        if concepts.is_empty() {
            return Err(StageFailure::Malformed("empty concept summary".to_string()));
        }
        Ok(concepts)
    }

    #[instrument(skip(self, concepts))]
    async fn determine_major_topic(&self, concepts: &str) -> StageResult<Option<String>> {
        let answer = self
            .complete(&major_topic_prompt(), format!("Concepts: {}", concepts))
            .await?;
        Ok(optional_answer(answer))
    }

    #[instrument(skip(self, concepts, tree), fields(topic = %topic))]
    async fn select_leaf(
        &self,
        concepts: &str,
        topic: MajorTopic,
        tree: &RoadmapTree,
    ) -> StageResult<Option<String>> {
        let system = format!(
            "You place math problems in the curriculum roadmap of '{}'. \
             Answer with the name of exactly one leaf item (an item with no \
             children) from the roadmap below, copied verbatim, and nothing else. \
             If no leaf fits, answer \"{}\".\n\nRoadmap:\n{}",
            topic.label(),
            NO_MATCH,
            tree.outline()
        );
        let answer = self.complete(&system, format!("Concepts: {}", concepts)).await?;
        Ok(optional_answer(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_response() {
        let json = r#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": " 도형과 측정 \n"}}],
            "usage": {"prompt_tokens": 50, "completion_tokens": 4, "total_tokens": 54}
        }"#;
        let response: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 54);
        assert_eq!(response.into_content().unwrap(), "도형과 측정");
    }

    #[test]
    fn test_missing_choice_is_malformed() {
        let response: ChatCompletionResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(response.into_content(), Err(StageFailure::Malformed(_))));
    }

    #[test]
    fn test_none_answers() {
        assert_eq!(optional_answer("None.".to_string()), None);
        assert_eq!(optional_answer("  ".to_string()), None);
        assert_eq!(
            optional_answer("\"도형의 넓이\"".to_string()).as_deref(),
            Some("도형의 넓이")
        );
    }

    #[test]
    fn test_major_prompt_lists_every_topic() {
        let prompt = major_topic_prompt();
        for topic in MajorTopic::ALL {
            assert!(prompt.contains(topic.label()));
        }
    }
}
