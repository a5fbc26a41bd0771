pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod providers;
pub mod registry;
pub mod store;
pub mod sync;
pub mod web;

use reqwest::Client;
use std::env;
use tracing::debug;

use error::{PlanroomError, Result};
use providers::*;

pub use error::PlanroomError as Error;
pub use store::DEFAULT_DOCUMENT;

// ---------------------------------------------------------------------------
// Turn outcome
// ---------------------------------------------------------------------------

/// Result of one conversation turn through the agent pipeline.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Assistant reply shown to the user, document block stripped.
    pub reply: String,
    /// Full replacement project plan, when the pipeline produced one.
    pub document: Option<String>,
}

// ---------------------------------------------------------------------------
// Document block extraction
// ---------------------------------------------------------------------------

/// Sentinel opening a replacement-document block in a raw model reply.
pub const DOC_BLOCK_BEGIN: &str = "<<<DOCUMENT";
/// Sentinel closing a replacement-document block.
pub const DOC_BLOCK_END: &str = "DOCUMENT>>>";

/// Split a raw model reply into the user-visible text and an optional
/// replacement document delimited by the sentinel lines. An unterminated
/// block is left in the reply untouched.
pub fn split_reply(raw: &str) -> (String, Option<String>) {
    let Some(begin) = raw.find(DOC_BLOCK_BEGIN) else {
        return (raw.trim().to_string(), None);
    };
    let after_begin = begin + DOC_BLOCK_BEGIN.len();
    let Some(end_rel) = raw[after_begin..].find(DOC_BLOCK_END) else {
        return (raw.trim().to_string(), None);
    };
    let end = after_begin + end_rel;
    let document = raw[after_begin..end].trim().to_string();
    let mut reply = String::new();
    reply.push_str(&raw[..begin]);
    reply.push_str(&raw[end + DOC_BLOCK_END.len()..]);
    let reply = reply.trim().to_string();
    let document = if document.is_empty() { None } else { Some(document) };
    (reply, document)
}

// ---------------------------------------------------------------------------
// PlannerEngine — multi-provider conversation engine
// ---------------------------------------------------------------------------

const PLANNER_SYSTEM_PROMPT: &str = "\
You are a senior product manager guiding a team through planning a new project. \
You are the only agent who talks to the users in this shared workspace. \
Ask one focused question at a time to learn the project's goal, target audience, \
constraints, key tasks, and timeline. Be concise and professional.\n\
\n\
When you judge that enough information has accumulated to write or rewrite a \
useful project plan, or when a user asks to see or update the document, include \
the COMPLETE replacement plan in your reply between a line containing only \
<<<DOCUMENT and a line containing only DOCUMENT>>>. Always emit the full plan, \
never a partial edit, using this markdown structure:\n\
# Project Plan: [Name]\n\
## 1.0 Executive Summary & Vision\n\
## 2.0 Key Requirements\n\
## 3.0 Technical Architecture\n\
## 4.0 Timeline & Milestones\n\
## 5.0 Next Steps\n\
Leave clear TODO entries for details that are still missing.";

/// Drives one conversation turn against the configured provider, carrying the
/// stored history and the current document as context.
pub struct PlannerEngine {
    client: Client,
    api_key: String,
    pub provider: Provider,
    pub model: String,
    pub temperature: f32,
    /// Override for the built-in system prompt.
    pub system_prompt: Option<String>,
}

impl PlannerEngine {
    pub fn new(provider: Provider, model: String) -> Result<Self> {
        let api_key = match provider {
            Provider::Openai => {
                env::var("OPENAI_API_KEY").map_err(|_| PlanroomError::MissingApiKey("OPENAI_API_KEY"))?
            }
            Provider::Anthropic => env::var("ANTHROPIC_API_KEY")
                .map_err(|_| PlanroomError::MissingApiKey("ANTHROPIC_API_KEY"))?,
            Provider::Mock => String::new(),
        };

        Ok(PlannerEngine {
            client: Client::new(),
            api_key,
            provider,
            model,
            temperature: 0.7,
            system_prompt: None,
        })
    }

    fn system_text(&self, document: &str) -> String {
        let base = self.system_prompt.as_deref().unwrap_or(PLANNER_SYSTEM_PROMPT);
        format!("{}\n\nCurrent project plan:\n{}", base, document)
    }

    /// Run one turn: history + current document + the new user message in,
    /// assistant reply (and possibly a replacement document) out.
    pub async fn run_turn(
        &self,
        history: &[store::MessageRow],
        document: &str,
        message: &str,
    ) -> Result<TurnOutcome> {
        let raw = match self.provider {
            Provider::Openai => self.complete_openai(history, document, message).await?,
            Provider::Anthropic => self.complete_anthropic(history, document, message).await?,
            Provider::Mock => mock_reply(history, message),
        };
        let (reply, doc) = split_reply(&raw);
        debug!(
            provider = %self.provider,
            reply_len = reply.len(),
            document_updated = doc.is_some(),
            "turn complete"
        );
        let reply = if reply.is_empty() {
            "I updated the project plan. What should we refine next?".to_string()
        } else {
            reply
        };
        Ok(TurnOutcome { reply, document: doc })
    }

    /// Collapse stored history into alternating role/content pairs, merging
    /// consecutive same-role entries (two users can speak back to back).
    fn transcript(history: &[store::MessageRow], message: &str) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        for row in history {
            let role = if row.role == "assistant" { "assistant" } else { "user" };
            push_merged(&mut out, role, &row.content);
        }
        push_merged(&mut out, "user", message);
        out
    }

    async fn complete_openai(
        &self,
        history: &[store::MessageRow],
        document: &str,
        message: &str,
    ) -> Result<String> {
        let mut messages = vec![OpenAIChatMessage {
            role: "system".to_string(),
            content: self.system_text(document),
        }];
        for (role, content) in Self::transcript(history, message) {
            messages.push(OpenAIChatMessage { role, content });
        }
        let request = OpenAIChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
        };

        let url = "https://api.openai.com/v1/chat/completions";
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| PlanroomError::Connect {
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(PlanroomError::Provider {
                provider: "OpenAI".to_string(),
                detail: format!("HTTP {}: {}", status, detail),
            });
        }

        let parsed: OpenAIChatResponse =
            response.json().await.map_err(|e| PlanroomError::Json {
                context: "OpenAI chat completion".to_string(),
                detail: e.to_string(),
            })?;
        parsed
            .first_text()
            .map(str::to_string)
            .ok_or_else(|| PlanroomError::Provider {
                provider: "OpenAI".to_string(),
                detail: "empty completion".to_string(),
            })
    }

    async fn complete_anthropic(
        &self,
        history: &[store::MessageRow],
        document: &str,
        message: &str,
    ) -> Result<String> {
        let messages = Self::transcript(history, message)
            .into_iter()
            .map(|(role, content)| AnthropicMessage { role, content })
            .collect();
        let request = AnthropicRequest {
            model: self.model.clone(),
            messages,
            max_tokens: 4096,
            temperature: self.temperature,
            system: Some(self.system_text(document)),
        };

        let url = "https://api.anthropic.com/v1/messages";
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| PlanroomError::Connect {
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(PlanroomError::Provider {
                provider: "Anthropic".to_string(),
                detail: format!("HTTP {}: {}", status, detail),
            });
        }

        let parsed: AnthropicResponse =
            response.json().await.map_err(|e| PlanroomError::Json {
                context: "Anthropic messages response".to_string(),
                detail: e.to_string(),
            })?;
        let text = parsed.joined_text();
        if text.is_empty() {
            return Err(PlanroomError::Provider {
                provider: "Anthropic".to_string(),
                detail: "empty completion".to_string(),
            });
        }
        Ok(text)
    }
}

/// Append `content` under `role`, merging into the previous entry when the
/// role repeats (two users can speak back to back between assistant turns).
fn push_merged(out: &mut Vec<(String, String)>, role: &str, content: &str) {
    let merge = out.last().map(|(last_role, _)| last_role == role).unwrap_or(false);
    if merge {
        if let Some((_, existing)) = out.last_mut() {
            existing.push_str("\n\n");
            existing.push_str(content);
        }
    } else {
        out.push((role.to_string(), content.to_string()));
    }
}

/// Deterministic offline pipeline: acknowledges the message and asks the next
/// planning question; emits a replacement plan once three user turns have
/// accumulated or when the user asks for the document.
fn mock_reply(history: &[store::MessageRow], message: &str) -> String {
    let user_turns = history.iter().filter(|m| m.role == "user").count() + 1;
    let wants_doc = {
        let lower = message.to_lowercase();
        lower.contains("document") || lower.contains("plan")
    };
    let questions = [
        "What problem is this project solving, and for whom?",
        "What are the three to five critical features it needs?",
        "What constraints matter most: budget, timeline, or compliance?",
        "What does success look like six months after launch?",
    ];
    let question = questions[(user_turns - 1) % questions.len()];

    if user_turns >= 3 || wants_doc {
        let gathered: Vec<&str> = history
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .collect();
        format!(
            "Here is the current plan based on what we have so far. {}\n\
             {}\n# Project Plan: Draft\n\n\
             ## 1.0 Executive Summary & Vision\n* {}\n\n\
             ## 2.0 Key Requirements\n{}\n* {}\n\n\
             ## 3.0 Technical Architecture\n* TODO: pending technical review\n\n\
             ## 4.0 Timeline & Milestones\n* TODO: dates not yet discussed\n\n\
             ## 5.0 Next Steps\n* Answer: {}\n{}",
            question,
            DOC_BLOCK_BEGIN,
            gathered.first().copied().unwrap_or("TODO: project vision"),
            gathered
                .iter()
                .skip(1)
                .map(|g| format!("* {}", g))
                .collect::<Vec<_>>()
                .join("\n"),
            message,
            question,
            DOC_BLOCK_END,
        )
    } else {
        format!("Noted: {}. {}", message.trim(), question)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
