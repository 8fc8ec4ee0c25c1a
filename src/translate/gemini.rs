//! Translation between the Anthropic Messages shape and the Google Gemini
//! generateContent shape (also used for Vertex).
//!
//! Gemini has no assistant role; assistant turns map to `model`. System
//! content is carried in `systemInstruction` rather than being demoted to a
//! user turn. Image blocks survive both directions as `inlineData` parts.

use serde::{Deserialize, Serialize};

use super::anthropic::{
    ContentBlock, ImageSource, MessagesRequest, MessagesResponse, Role, Usage,
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    /// Parts this relay does not translate (function calls etc.); kept so an
    /// unexpected part does not fail the whole response.
    Other(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub max_output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Unary response body; streaming chunks share the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Translate an Anthropic Messages request into a Gemini generateContent
/// request. System content (the top-level field and any `system`-role turns)
/// goes to `systemInstruction`.
pub fn anthropic_to_gemini(req: &MessagesRequest) -> GenerateContentRequest {
    let mut system_texts: Vec<String> = Vec::new();
    if let Some(ref system) = req.system {
        system_texts.push(system.as_text());
    }

    let mut contents = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        let blocks = msg.content.blocks();
        match msg.role {
            Role::System => {
                for block in &blocks {
                    if let ContentBlock::Text { text } = block {
                        system_texts.push(text.clone());
                    }
                }
            }
            Role::User | Role::Assistant => {
                let role = if msg.role == Role::Assistant {
                    "model"
                } else {
                    "user"
                };
                contents.push(Content {
                    role: Some(role.to_string()),
                    parts: blocks.iter().map(block_to_part).collect(),
                });
            }
        }
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content {
            role: None,
            parts: vec![Part::Text {
                text: system_texts.join("\n"),
            }],
        })
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: Some(GenerationConfig {
            max_output_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            stop_sequences: req.stop_sequences.clone(),
        }),
    }
}

fn block_to_part(block: &ContentBlock) -> Part {
    match block {
        ContentBlock::Text { text } => Part::Text { text: text.clone() },
        ContentBlock::Image { source } => Part::InlineData {
            inline_data: InlineData {
                mime_type: source.media_type.clone(),
                data: source.data.clone(),
            },
        },
    }
}

/// Translate a unary Gemini response into an Anthropic Messages response.
/// Gemini responses carry no message id, so one is synthesized; `model` is
/// the upstream model name from the resolved route.
pub fn gemini_to_anthropic(resp: &GenerateContentResponse, model: &str) -> MessagesResponse {
    let candidate = resp.candidates.first();

    let mut content: Vec<ContentBlock> = Vec::new();
    if let Some(parts) = candidate
        .and_then(|c| c.content.as_ref())
        .map(|c| &c.parts)
    {
        for part in parts {
            match part {
                Part::Text { text } => content.push(ContentBlock::Text { text: text.clone() }),
                Part::InlineData { inline_data } => content.push(ContentBlock::Image {
                    source: ImageSource {
                        source_type: "base64".to_string(),
                        media_type: inline_data.mime_type.clone(),
                        data: inline_data.data.clone(),
                    },
                }),
                Part::Other(_) => {}
            }
        }
    }
    if content.is_empty() {
        content.push(ContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = candidate
        .and_then(|c| c.finish_reason.as_deref())
        .map(map_finish_reason)
        .unwrap_or("end_turn");

    let usage = resp
        .usage_metadata
        .as_ref()
        .map_or_else(Usage::default, |u| Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        });

    MessagesResponse {
        id: new_message_id(),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    }
}

/// Map a Gemini finishReason to an Anthropic stop_reason.
pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "max_tokens",
        "SAFETY" | "RECITATION" => "stop_sequence",
        _ => "end_turn",
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().to_string().replace('-', ""))
}
