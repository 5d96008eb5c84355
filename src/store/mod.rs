pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::CourierResult;
use crate::identity::Platform;

pub use sqlite::SqliteStore;

/// One real-world counterparty on one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub platform: Platform,
    /// Raw provider identifier this contact was first keyed by.
    pub platform_id: String,
    /// Canonical digits-only phone; `None` until reconciliation learns it.
    pub phone: Option<String>,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub platform: Platform,
    pub platform_id: String,
    pub phone: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Open,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Open => "OPEN",
            ConversationStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(ConversationStatus::Open),
            "CLOSED" => Ok(ConversationStatus::Closed),
            other => Err(format!("unknown conversation status: {}", other)),
        }
    }
}

/// A single ongoing thread between one contact and one integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub contact_id: i64,
    /// `None` only ever denotes an unresolved-routing defect to be repaired;
    /// the online path always routes through a concrete integration.
    pub integration_id: Option<i64>,
    pub platform: Platform,
    pub status: ConversationStatus,
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSender {
    User,
    Agent,
    System,
}

impl MessageSender {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageSender::User => "USER",
            MessageSender::Agent => "AGENT",
            MessageSender::System => "SYSTEM",
        }
    }
}

impl FromStr for MessageSender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(MessageSender::User),
            "AGENT" => Ok(MessageSender::Agent),
            "SYSTEM" => Ok(MessageSender::System),
            other => Err(format!("unknown message sender: {}", other)),
        }
    }
}

/// One unit of content within a conversation. Append-only: nothing mutates
/// a message after creation except a merge changing its `conversation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    /// Denormalized from the conversation so the provider idempotency key
    /// can be a real uniqueness constraint.
    pub integration_id: Option<i64>,
    pub sender: MessageSender,
    pub body: String,
    pub provider_message_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub integration_id: Option<i64>,
    pub sender: MessageSender,
    pub body: String,
    pub provider_message_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Gateway protocol family an integration speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayKind {
    WhatsappWeb,
    WhatsappCloud,
    InstagramGraph,
}

impl GatewayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GatewayKind::WhatsappWeb => "WHATSAPP_WEB",
            GatewayKind::WhatsappCloud => "WHATSAPP_CLOUD",
            GatewayKind::InstagramGraph => "INSTAGRAM_GRAPH",
        }
    }

    pub fn platform(self) -> Platform {
        match self {
            GatewayKind::WhatsappWeb | GatewayKind::WhatsappCloud => Platform::Whatsapp,
            GatewayKind::InstagramGraph => Platform::Instagram,
        }
    }
}

impl FromStr for GatewayKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WHATSAPP_WEB" => Ok(GatewayKind::WhatsappWeb),
            "WHATSAPP_CLOUD" => Ok(GatewayKind::WhatsappCloud),
            "INSTAGRAM_GRAPH" => Ok(GatewayKind::InstagramGraph),
            other => Err(format!("unknown gateway kind: {}", other)),
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrationStatus {
    Connected,
    Disconnected,
}

impl IntegrationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrationStatus::Connected => "CONNECTED",
            IntegrationStatus::Disconnected => "DISCONNECTED",
        }
    }
}

impl FromStr for IntegrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECTED" => Ok(IntegrationStatus::Connected),
            "DISCONNECTED" => Ok(IntegrationStatus::Disconnected),
            other => Err(format!("unknown integration status: {}", other)),
        }
    }
}

/// A configured gateway session/instance conversations are routed through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: i64,
    /// The gateway's own session/instance identifier, as it appears in
    /// webhook envelopes.
    pub external_ref: String,
    pub kind: GatewayKind,
    pub status: IntegrationStatus,
    pub instance_url: Option<String>,
    pub api_key: Option<String>,
    /// Auto-responder binding, carried as data; replying is a collaborator
    /// concern.
    pub agent_id: Option<String>,
    pub config: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub external_ref: String,
    pub kind: GatewayKind,
    pub instance_url: Option<String>,
    pub api_key: Option<String>,
    pub agent_id: Option<String>,
}

/// Outcome of folding one duplicate contact into a primary.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeStats {
    pub conversations_reassigned: usize,
    pub conversations_removed: usize,
    pub messages_moved: usize,
}

/// Persistence seam for the pipeline. The adapter is the system of record;
/// callers never compose read-then-write sequences where the contract says
/// atomic.
#[async_trait]
pub trait Store: Send + Sync {
    // Integrations
    async fn create_integration(&self, new: NewIntegration) -> CourierResult<Integration>;
    async fn find_integration_by_external_ref(
        &self,
        external_ref: &str,
    ) -> CourierResult<Option<Integration>>;
    async fn list_integrations(&self) -> CourierResult<Vec<Integration>>;

    // Contacts
    async fn create_contact(&self, new: NewContact) -> CourierResult<Contact>;
    async fn get_contact(&self, contact_id: i64) -> CourierResult<Option<Contact>>;
    async fn find_contact_by_phone(
        &self,
        platform: Platform,
        phone: &str,
    ) -> CourierResult<Option<Contact>>;
    async fn find_contact_by_raw_id(
        &self,
        platform: Platform,
        raw_id: &str,
    ) -> CourierResult<Option<Contact>>;
    async fn update_contact_phone(&self, contact_id: i64, phone: &str) -> CourierResult<()>;
    async fn update_contact_name(&self, contact_id: i64, name: &str) -> CourierResult<()>;
    /// All contacts sharing a canonical phone, oldest first.
    async fn contacts_by_phone(
        &self,
        platform: Platform,
        phone: &str,
    ) -> CourierResult<Vec<Contact>>;
    /// Phones held by more than one contact (batch sweep input).
    async fn duplicate_phone_groups(&self) -> CourierResult<Vec<(Platform, String)>>;
    async fn delete_contact(&self, contact_id: i64) -> CourierResult<()>;

    // Conversations
    /// Atomic find-or-create of the single OPEN conversation for
    /// (contact, integration). One store transaction, never read-then-write.
    async fn find_or_create_open_conversation(
        &self,
        contact_id: i64,
        integration_id: i64,
    ) -> CourierResult<Conversation>;
    async fn get_conversation(&self, conversation_id: i64) -> CourierResult<Option<Conversation>>;
    async fn conversations_for_contact(&self, contact_id: i64)
    -> CourierResult<Vec<Conversation>>;
    async fn open_conversations_for_contact(
        &self,
        contact_id: i64,
    ) -> CourierResult<Vec<Conversation>>;
    async fn reassign_conversation(
        &self,
        conversation_id: i64,
        new_contact_id: i64,
    ) -> CourierResult<()>;
    async fn delete_conversation(&self, conversation_id: i64) -> CourierResult<()>;

    // Messages
    /// Append a message. The (integration, provider_message_id) uniqueness
    /// constraint absorbs duplicate delivery: re-appending an already-stored
    /// provider message returns the original row.
    async fn append_message(&self, new: NewMessage) -> CourierResult<Message>;
    async fn find_message_by_provider_id(
        &self,
        integration_id: i64,
        provider_message_id: &str,
    ) -> CourierResult<Option<Message>>;
    async fn messages_for_conversation(&self, conversation_id: i64)
    -> CourierResult<Vec<Message>>;
    async fn move_messages(
        &self,
        from_conversation_id: i64,
        to_conversation_id: i64,
    ) -> CourierResult<usize>;

    // Merge procedures (duplicate resolver only). Each runs as one store
    // transaction so a merge is serialized against concurrent ingests.
    async fn merge_contact_into(
        &self,
        primary_id: i64,
        duplicate_id: i64,
    ) -> CourierResult<MergeStats>;
    /// Collapse multiple OPEN conversations per integration into the most
    /// recently active one. Returns how many were folded away.
    async fn collapse_open_conversations(&self, contact_id: i64) -> CourierResult<usize>;
    /// Contacts holding more than one OPEN conversation for the same
    /// integration (batch-sweep input).
    async fn contacts_with_multiple_open_conversations(&self) -> CourierResult<Vec<i64>>;
}
