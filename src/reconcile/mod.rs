use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{IdentityConfig, IngestConfig};
use crate::errors::{CourierError, CourierResult};
use crate::events::InboundEvent;
use crate::identity::{self, NormalizedIdentity, SenderKind};
use crate::store::{Contact, MessageSender, NewContact, NewMessage, Store};

/// Outcome of one accepted (or absorbed) inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub contact_id: i64,
    pub conversation_id: i64,
    pub message_id: i64,
    /// The event was an at-least-once redelivery; nothing was written.
    pub duplicate: bool,
    /// A previously phone-less contact learned its phone from this event.
    /// The caller triggers the online repair merge for it.
    pub backfilled_phone: Option<String>,
}

/// Finds-or-creates the contact and open conversation for an inbound event
/// and appends the message. Never retries internally: terminal rejections
/// are final, storage failures propagate as retryable and the gateway's
/// own redelivery (made safe by idempotency) is the retry mechanism.
pub struct ReconcileEngine {
    store: Arc<dyn Store>,
    identity: IdentityConfig,
    ingest: IngestConfig,
}

impl ReconcileEngine {
    pub fn new(store: Arc<dyn Store>, identity: IdentityConfig, ingest: IngestConfig) -> Self {
        Self {
            store,
            identity,
            ingest,
        }
    }

    pub async fn ingest(&self, event: &InboundEvent) -> CourierResult<IngestReceipt> {
        // 1. Routing: the event envelope names the integration; content is
        //    never used to guess it. No match is a configuration gap.
        let integration = self
            .store
            .find_integration_by_external_ref(&event.integration_external_ref)
            .await?
            .ok_or_else(|| CourierError::UnknownIntegration {
                external_ref: event.integration_external_ref.clone(),
            })?;

        // 2. Identity classification.
        let sender = identity::normalize(event.platform, &event.raw_sender_id, &self.identity);
        match sender.kind {
            SenderKind::Invalid => {
                return Err(CourierError::MalformedPayload(
                    "empty sender identifier".to_string(),
                ));
            }
            SenderKind::Group | SenderKind::Channel | SenderKind::Broadcast
                if !self.ingest.allow_group_senders =>
            {
                return Err(CourierError::UnsupportedSenderKind {
                    kind: sender.kind,
                    raw_id: event.raw_sender_id.clone(),
                });
            }
            _ => {}
        }

        if event.body.is_empty() {
            return Err(CourierError::MalformedPayload(
                "event carries neither text nor attachments".to_string(),
            ));
        }

        // 3. Idempotency against durable state: an already-stored provider
        //    message id short-circuits to the original triple.
        if let Some(existing) = self
            .store
            .find_message_by_provider_id(integration.id, &event.provider_message_id)
            .await?
        {
            let conversation = self
                .store
                .get_conversation(existing.conversation_id)
                .await?
                .ok_or_else(|| CourierError::Storage {
                    message: format!(
                        "message {} references missing conversation {}",
                        existing.id, existing.conversation_id
                    ),
                    retryable: false,
                })?;
            debug!(
                "duplicate delivery of provider message {} on integration {}",
                event.provider_message_id, integration.external_ref
            );
            return Ok(IngestReceipt {
                contact_id: conversation.contact_id,
                conversation_id: conversation.id,
                message_id: existing.id,
                duplicate: true,
                backfilled_phone: None,
            });
        }

        // 4. Contact resolution.
        let (contact, backfilled_phone) = self.resolve_contact(event, &sender).await?;

        // 5. The single atomic upsert of the open conversation.
        let conversation = self
            .store
            .find_or_create_open_conversation(contact.id, integration.id)
            .await?;

        // 6. Append the message, preserving the provider timestamp.
        let message = self
            .store
            .append_message(NewMessage {
                conversation_id: conversation.id,
                integration_id: Some(integration.id),
                sender: MessageSender::User,
                body: event.body.display_text(),
                provider_message_id: Some(event.provider_message_id.clone()),
                metadata: message_metadata(event),
                created_at: event.timestamp,
            })
            .await?;

        info!(
            "ingested message {} for contact {} (conversation {}) via {}",
            message.id, contact.id, conversation.id, integration.external_ref
        );

        Ok(IngestReceipt {
            contact_id: contact.id,
            conversation_id: conversation.id,
            message_id: message.id,
            duplicate: false,
            backfilled_phone,
        })
    }

    /// Find-or-create the contact: by canonical phone when known, by raw
    /// identifier otherwise. A raw-id hit that never had a phone gets it
    /// back-filled in place; no second contact is ever created for the
    /// same underlying party.
    async fn resolve_contact(
        &self,
        event: &InboundEvent,
        sender: &NormalizedIdentity,
    ) -> CourierResult<(Contact, Option<String>)> {
        if let Some(phone) = sender.canonical_phone.as_deref() {
            if let Some(contact) = self
                .store
                .find_contact_by_phone(event.platform, phone)
                .await?
            {
                let contact = self.fill_name(contact, event).await?;
                return Ok((contact, None));
            }

            if let Some(mut contact) = self
                .store
                .find_contact_by_raw_id(event.platform, &sender.fallback_key)
                .await?
            {
                let backfilled = if contact.phone.is_none() {
                    self.store.update_contact_phone(contact.id, phone).await?;
                    contact.phone = Some(phone.to_string());
                    info!(
                        "back-filled phone {} onto contact {} ({})",
                        phone, contact.id, contact.platform_id
                    );
                    Some(phone.to_string())
                } else {
                    None
                };
                let contact = self.fill_name(contact, event).await?;
                return Ok((contact, backfilled));
            }

            let contact = self
                .store
                .create_contact(NewContact {
                    platform: event.platform,
                    platform_id: sender.fallback_key.clone(),
                    phone: Some(phone.to_string()),
                    name: event.push_name.clone(),
                })
                .await?;
            debug!(
                "created contact {} for phone {} on {}",
                contact.id, phone, event.platform
            );
            return Ok((contact, None));
        }

        // Phone unknown (opaque or out-of-bounds identifier): key by the
        // raw identifier and stay eligible for later reconciliation.
        if let Some(contact) = self
            .store
            .find_contact_by_raw_id(event.platform, &sender.fallback_key)
            .await?
        {
            let contact = self.fill_name(contact, event).await?;
            return Ok((contact, None));
        }

        let contact = self
            .store
            .create_contact(NewContact {
                platform: event.platform,
                platform_id: sender.fallback_key.clone(),
                phone: None,
                name: event.push_name.clone(),
            })
            .await?;
        debug!(
            "created phone-less contact {} for {} on {}",
            contact.id, contact.platform_id, event.platform
        );
        Ok((contact, None))
    }

    /// A push name fills a missing contact name; an already-known name is
    /// left alone.
    async fn fill_name(&self, mut contact: Contact, event: &InboundEvent) -> CourierResult<Contact> {
        if contact.name.is_none() {
            if let Some(push_name) = event.push_name.as_deref() {
                if !push_name.trim().is_empty() {
                    self.store
                        .update_contact_name(contact.id, push_name)
                        .await?;
                    contact.name = Some(push_name.to_string());
                }
            }
        }
        Ok(contact)
    }
}

fn message_metadata(event: &InboundEvent) -> Option<serde_json::Value> {
    let mut map = serde_json::Map::new();
    if let Some(push_name) = event.push_name.as_deref() {
        map.insert("pushName".to_string(), push_name.into());
    }
    if !event.body.attachments.is_empty() {
        map.insert(
            "attachments".to_string(),
            serde_json::to_value(&event.body.attachments).unwrap_or_default(),
        );
    }
    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map))
    }
}
