use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use courier::config::{DedupConfig, IdentityConfig, IngestConfig};
use courier::dedup::DuplicateResolver;
use courier::events::{DomainEvent, EventBody, InboundEvent};
use courier::hub::{BroadcastHub, Frame};
use courier::identity::Platform;
use courier::reconcile::ReconcileEngine;
use courier::store::{
    ConversationStatus, GatewayKind, MessageSender, NewContact, NewIntegration, NewMessage,
    SqliteStore, Store,
};

fn open_store(tmp: &TempDir) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::new(tmp.path().join("courier.db")).expect("open store"))
}

fn engine(store: Arc<SqliteStore>) -> ReconcileEngine {
    ReconcileEngine::new(store, IdentityConfig::default(), IngestConfig::default())
}

fn resolver(store: Arc<SqliteStore>) -> DuplicateResolver {
    DuplicateResolver::new(store, IdentityConfig::default(), &DedupConfig::default())
}

async fn seed_integration(store: &SqliteStore, external_ref: &str) -> i64 {
    store
        .create_integration(NewIntegration {
            external_ref: external_ref.to_string(),
            kind: GatewayKind::WhatsappWeb,
            instance_url: None,
            api_key: None,
            agent_id: None,
        })
        .await
        .expect("create integration")
        .id
}

fn whatsapp_event(raw_sender_id: &str, provider_id: &str, text: &str) -> InboundEvent {
    InboundEvent {
        integration_external_ref: "teste2".to_string(),
        platform: Platform::Whatsapp,
        raw_sender_id: raw_sender_id.to_string(),
        push_name: None,
        body: EventBody {
            text: Some(text.to_string()),
            attachments: vec![],
        },
        provider_message_id: provider_id.to_string(),
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_pipeline_persists_across_restart() {
    let tmp = TempDir::new().expect("create temp dir");

    let first_receipt = {
        let store = open_store(&tmp);
        seed_integration(&store, "teste2").await;
        engine(store)
            .ingest(&whatsapp_event("5511999999999@s.whatsapp.net", "m1", "Olá"))
            .await
            .expect("ingest")
    };

    // New process, same database: redelivery must still be recognized —
    // idempotency reads durable state, not a process cache.
    let store = open_store(&tmp);
    let second_receipt = engine(store.clone())
        .ingest(&whatsapp_event("5511999999999@s.whatsapp.net", "m1", "Olá"))
        .await
        .expect("ingest after restart");

    assert!(second_receipt.duplicate);
    assert_eq!(second_receipt.contact_id, first_receipt.contact_id);
    assert_eq!(second_receipt.message_id, first_receipt.message_id);

    let contact = store
        .get_contact(first_receipt.contact_id)
        .await
        .unwrap()
        .expect("contact survived restart");
    assert_eq!(contact.phone.as_deref(), Some("5511999999999"));
}

#[tokio::test]
async fn test_out_of_order_deliveries_sort_by_created_at() {
    let tmp = TempDir::new().expect("create temp dir");
    let store = open_store(&tmp);
    seed_integration(&store, "teste2").await;
    let engine = engine(store.clone());

    let base = Utc::now();
    let mut late = whatsapp_event("5511999999999@s.whatsapp.net", "m2", "second");
    late.timestamp = base + Duration::seconds(10);
    let mut early = whatsapp_event("5511999999999@s.whatsapp.net", "m1", "first");
    early.timestamp = base;

    // The later message arrives first.
    let receipt = engine.ingest(&late).await.expect("ingest late");
    engine.ingest(&early).await.expect("ingest early");

    let bodies: Vec<String> = store
        .messages_for_conversation(receipt.conversation_id)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(
        bodies,
        vec!["first", "second"],
        "consumers sort by createdAt, not arrival order"
    );
}

#[tokio::test]
async fn test_sweep_repairs_legacy_duplicates() {
    let tmp = TempDir::new().expect("create temp dir");
    let store = open_store(&tmp);
    let integration_id = seed_integration(&store, "teste2").await;
    let engine = engine(store.clone());

    // Live traffic creates the canonical contact with three messages.
    for (provider_id, text) in [("m1", "um"), ("m2", "dois"), ("m3", "três")] {
        engine
            .ingest(&whatsapp_event(
                "5511999999999@s.whatsapp.net",
                provider_id,
                text,
            ))
            .await
            .expect("ingest");
    }

    // A legacy import left a second contact for the same phone with its
    // own open conversation and two messages.
    let legacy = store
        .create_contact(NewContact {
            platform: Platform::Whatsapp,
            platform_id: "legacy-import@lid".to_string(),
            phone: Some("5511999999999".to_string()),
            name: None,
        })
        .await
        .unwrap();
    let legacy_conv = store
        .find_or_create_open_conversation(legacy.id, integration_id)
        .await
        .unwrap();
    for text in ["quatro", "cinco"] {
        store
            .append_message(NewMessage {
                conversation_id: legacy_conv.id,
                integration_id: Some(integration_id),
                sender: MessageSender::User,
                body: text.to_string(),
                provider_message_id: Some(format!("legacy-{}", text)),
                metadata: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let report = resolver(store.clone()).sweep().await.expect("sweep");
    assert_eq!(report.phone_groups, 1);
    assert_eq!(report.contacts_merged, 1);

    // One contact, one open conversation, all five messages.
    let survivors = store
        .contacts_by_phone(Platform::Whatsapp, "5511999999999")
        .await
        .unwrap();
    assert_eq!(survivors.len(), 1);
    let open = store
        .open_conversations_for_contact(survivors[0].id)
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, ConversationStatus::Open);
    assert_eq!(
        store
            .messages_for_conversation(open[0].id)
            .await
            .unwrap()
            .len(),
        5
    );

    // New traffic keeps flowing into the surviving conversation.
    let receipt = engine
        .ingest(&whatsapp_event("5511999999999@s.whatsapp.net", "m4", "seis"))
        .await
        .expect("ingest after merge");
    assert_eq!(receipt.conversation_id, open[0].id);
}

#[tokio::test]
async fn test_domain_events_reach_all_live_clients() {
    let tmp = TempDir::new().expect("create temp dir");
    let store = open_store(&tmp);
    seed_integration(&store, "teste2").await;

    let hub = Arc::new(BroadcastHub::new(8));
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let id = uuid::Uuid::new_v4();
        let rx = hub.register(id).expect("register");
        hub.open(id);
        receivers.push(rx);
    }
    // One peer vanishes without a clean close.
    drop(receivers.remove(2));

    let event = whatsapp_event("5511999999999@s.whatsapp.net", "m1", "Olá");
    let receipt = engine(store).ingest(&event).await.expect("ingest");
    let delivered = hub.broadcast(&DomainEvent::message_created(
        receipt.contact_id,
        receipt.conversation_id,
        receipt.message_id,
        event.platform,
        &event.body.display_text(),
        event.timestamp,
    ));

    assert_eq!(delivered, 2, "dead peer is skipped, not fatal");
    for rx in &mut receivers {
        let Some(Frame::Event(payload)) = rx.recv().await else {
            panic!("live client missed the event");
        };
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "message.created");
        assert_eq!(json["preview"], "Olá");
    }
}
