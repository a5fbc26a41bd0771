use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, ValueEnum, PartialEq)]
pub enum Provider {
    Openai,
    Anthropic,
    /// Canned offline replies; no network, no API key. Used by tests and the
    /// mock toggle in the environment configuration.
    Mock,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Openai => write!(f, "openai"),
            Provider::Anthropic => write!(f, "anthropic"),
            Provider::Mock => write!(f, "mock"),
        }
    }
}

impl Provider {
    pub fn from_str_loose(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Provider::Openai),
            "anthropic" => Ok(Provider::Anthropic),
            "mock" => Ok(Provider::Mock),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }

    /// Default model for this provider when the user hasn't chosen one.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Openai => "gpt-4o",
            Provider::Anthropic => "claude-sonnet-4-20250514",
            Provider::Mock => "scripted",
        }
    }
}

// -- OpenAI chat completion types -------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct OpenAIChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAIChatRequest {
    pub model: String,
    pub messages: Vec<OpenAIChatMessage>,
    pub temperature: f32,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIResponseMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    pub message: OpenAIResponseMessage,
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChatResponse {
    pub choices: Vec<OpenAIChoice>,
}

// -- Anthropic messages types -----------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicResponse {
    pub content: Vec<AnthropicContentBlock>,
}

impl OpenAIChatResponse {
    /// Text of the first choice, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

impl AnthropicResponse {
    /// Concatenated text of all text blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_display() {
        assert_eq!(Provider::Openai.to_string(), "openai");
        assert_eq!(Provider::Anthropic.to_string(), "anthropic");
        assert_eq!(Provider::Mock.to_string(), "mock");
    }

    #[test]
    fn test_provider_from_str_loose_case_insensitive() {
        assert_eq!(Provider::from_str_loose("OpenAI").unwrap(), Provider::Openai);
        assert_eq!(
            Provider::from_str_loose("ANTHROPIC").unwrap(),
            Provider::Anthropic
        );
    }

    #[test]
    fn test_provider_from_str_loose_unknown_errors() {
        let err = Provider::from_str_loose("cohere").unwrap_err();
        assert!(err.contains("cohere"));
    }

    #[test]
    fn test_default_models() {
        assert_eq!(Provider::Openai.default_model(), "gpt-4o");
        assert!(Provider::Anthropic.default_model().starts_with("claude"));
    }

    #[test]
    fn test_openai_request_serializes() {
        let req = OpenAIChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![OpenAIChatMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            }],
            temperature: 0.7,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"model\":\"gpt-4o\""));
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn test_openai_response_first_text() {
        let json = r#"{"choices":[{"message":{"content":"hi there"},"finish_reason":"stop"}]}"#;
        let resp: OpenAIChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.first_text(), Some("hi there"));
    }

    #[test]
    fn test_openai_response_empty_choices() {
        let json = r#"{"choices":[]}"#;
        let resp: OpenAIChatResponse = serde_json::from_str(json).unwrap();
        assert!(resp.first_text().is_none());
    }

    #[test]
    fn test_anthropic_request_omits_absent_system() {
        let req = AnthropicRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            messages: vec![],
            max_tokens: 4096,
            temperature: 0.7,
            system: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("\"system\""));
    }

    #[test]
    fn test_anthropic_request_includes_system_when_set() {
        let req = AnthropicRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            messages: vec![],
            max_tokens: 4096,
            temperature: 0.7,
            system: Some("You are a planner.".to_string()),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"system\":\"You are a planner.\""));
    }

    #[test]
    fn test_anthropic_response_joined_text() {
        let json = r#"{"content":[
            {"type":"text","text":"part one "},
            {"type":"tool_use","text":null},
            {"type":"text","text":"part two"}
        ]}"#;
        let resp: AnthropicResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.joined_text(), "part one part two");
    }

    #[test]
    fn test_anthropic_response_no_text_blocks() {
        let json = r#"{"content":[]}"#;
        let resp: AnthropicResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.joined_text(), "");
    }
}
