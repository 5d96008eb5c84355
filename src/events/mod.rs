use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Platform;

/// Longest preview carried on a domain event.
const PREVIEW_MAX_CHARS: usize = 120;

/// Parsed inbound event as delivered by a gateway webhook.
///
/// Field names on the wire are camelCase. Provider-specific envelope
/// unwrapping happens upstream; by the time this type exists the event is
/// already shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "integrationExternalRef")]
    pub integration_external_ref: String,
    pub platform: Platform,
    #[serde(rename = "rawSenderId")]
    pub raw_sender_id: String,
    #[serde(default, rename = "pushName")]
    pub push_name: Option<String>,
    pub body: EventBody,
    #[serde(rename = "providerMessageId")]
    pub provider_message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBody {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Media classification as reported by the provider (image, audio, …).
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

impl EventBody {
    /// Whether the body carries nothing renderable.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty()) && self.attachments.is_empty()
    }

    /// Message text to persist: the text when present, otherwise a
    /// placeholder naming the first attachment.
    pub fn display_text(&self) -> String {
        if let Some(text) = self.text.as_deref() {
            if !text.trim().is_empty() {
                return text.to_string();
            }
        }
        match self.attachments.first() {
            Some(att) => match att.caption.as_deref() {
                Some(caption) if !caption.trim().is_empty() => {
                    format!("{}\n[{}]", caption, att.kind)
                }
                _ => format!("[{}]", att.kind),
            },
            None => String::new(),
        }
    }
}

/// Domain event published to the broadcast hub after successful ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "contactId")]
    pub contact_id: i64,
    #[serde(rename = "conversationId")]
    pub conversation_id: i64,
    #[serde(rename = "messageId")]
    pub message_id: i64,
    pub platform: Platform,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub fn message_created(
        contact_id: i64,
        conversation_id: i64,
        message_id: i64,
        platform: Platform,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: "message.created".to_string(),
            contact_id,
            conversation_id,
            message_id,
            platform,
            preview: text.chars().take(PREVIEW_MAX_CHARS).collect(),
            timestamp,
        }
    }
}
