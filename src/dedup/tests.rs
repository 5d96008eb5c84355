use super::*;
use crate::config::DedupConfig;
use crate::store::{
    Conversation, GatewayKind, Integration, Message, MessageSender, NewContact, NewIntegration,
    NewMessage, SqliteStore,
};
use async_trait::async_trait;
use chrono::Utc;

fn resolver(store: Arc<dyn Store>) -> DuplicateResolver {
    DuplicateResolver::new(store, IdentityConfig::default(), &DedupConfig::default())
}

async fn setup() -> (Arc<SqliteStore>, Integration, Integration) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let gw_a = store
        .create_integration(NewIntegration {
            external_ref: "gw-a".to_string(),
            kind: GatewayKind::WhatsappWeb,
            instance_url: None,
            api_key: None,
            agent_id: None,
        })
        .await
        .unwrap();
    let gw_b = store
        .create_integration(NewIntegration {
            external_ref: "gw-b".to_string(),
            kind: GatewayKind::WhatsappWeb,
            instance_url: None,
            api_key: None,
            agent_id: None,
        })
        .await
        .unwrap();
    (store, gw_a, gw_b)
}

async fn contact_with_messages(
    store: &SqliteStore,
    platform_id: &str,
    phone: &str,
    integration_id: i64,
    bodies: &[&str],
) -> Contact {
    let contact = store
        .create_contact(NewContact {
            platform: Platform::Whatsapp,
            platform_id: platform_id.to_string(),
            phone: Some(phone.to_string()),
            name: None,
        })
        .await
        .unwrap();
    let conversation = store
        .find_or_create_open_conversation(contact.id, integration_id)
        .await
        .unwrap();
    for body in bodies {
        store
            .append_message(NewMessage {
                conversation_id: conversation.id,
                integration_id: Some(integration_id),
                sender: MessageSender::User,
                body: (*body).to_string(),
                provider_message_id: Some(format!("{}-{}", platform_id, body)),
                metadata: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    contact
}

#[tokio::test]
async fn merge_is_lossless() {
    let (store, gw_a, gw_b) = setup().await;
    let phone = "5511999999999";

    // Three contacts for one party: 3 + 2 messages on gw-a, 1 on gw-b.
    let primary =
        contact_with_messages(&store, "5511999999999@s.whatsapp.net", phone, gw_a.id, &[
            "a1", "a2", "a3",
        ])
        .await;
    contact_with_messages(&store, "ghost-1@lid", phone, gw_a.id, &["b1", "b2"]).await;
    contact_with_messages(&store, "ghost-2@lid", phone, gw_b.id, &["c1"]).await;

    let resolver = resolver(store.clone());
    let merged = resolver
        .merge_contacts_by_phone(Platform::Whatsapp, phone)
        .await
        .unwrap();
    assert_eq!(merged, 2);

    // Exactly one contact survives.
    let survivors = store
        .contacts_by_phone(Platform::Whatsapp, phone)
        .await
        .unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].id, primary.id);

    // At most one OPEN conversation per integration, all six messages kept.
    let open = store
        .open_conversations_for_contact(primary.id)
        .await
        .unwrap();
    assert_eq!(open.len(), 2);
    let mut total_messages = 0;
    for conv in &open {
        total_messages += store
            .messages_for_conversation(conv.id)
            .await
            .unwrap()
            .len();
    }
    assert_eq!(total_messages, 6, "a merge never drops a message");
}

#[tokio::test]
async fn merge_is_idempotent() {
    let (store, gw_a, _) = setup().await;
    let phone = "5511999999999";
    contact_with_messages(&store, "5511999999999@s.whatsapp.net", phone, gw_a.id, &["a"]).await;
    contact_with_messages(&store, "ghost@lid", phone, gw_a.id, &["b"]).await;

    let resolver = resolver(store.clone());
    assert_eq!(
        resolver
            .merge_contacts_by_phone(Platform::Whatsapp, phone)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        resolver
            .merge_contacts_by_phone(Platform::Whatsapp, phone)
            .await
            .unwrap(),
        0,
        "second run finds nothing to do"
    );
}

#[tokio::test]
async fn primary_prefers_individual_origin_over_older_opaque() {
    let (store, gw_a, _) = setup().await;
    let phone = "5511999999999";

    // The opaque ghost is created first (older)…
    let ghost = contact_with_messages(&store, "ghost@lid", phone, gw_a.id, &["b"]).await;
    // …but the phone-bearing identifier wins the primary choice.
    let individual =
        contact_with_messages(&store, "5511999999999@s.whatsapp.net", phone, gw_a.id, &["a"]).await;
    assert!(ghost.id < individual.id);

    let resolver = resolver(store.clone());
    resolver
        .merge_contacts_by_phone(Platform::Whatsapp, phone)
        .await
        .unwrap();

    let survivors = store
        .contacts_by_phone(Platform::Whatsapp, phone)
        .await
        .unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].id, individual.id);
}

#[tokio::test]
async fn primary_is_oldest_among_same_kind() {
    let (store, gw_a, gw_b) = setup().await;
    let phone = "5511999999999";

    let older = contact_with_messages(&store, "a@s.whatsapp.net", phone, gw_a.id, &["a"]).await;
    contact_with_messages(&store, "b@s.whatsapp.net", phone, gw_b.id, &["b"]).await;

    let resolver = resolver(store.clone());
    resolver
        .merge_contacts_by_phone(Platform::Whatsapp, phone)
        .await
        .unwrap();

    let survivors = store
        .contacts_by_phone(Platform::Whatsapp, phone)
        .await
        .unwrap();
    assert_eq!(survivors[0].id, older.id);
}

#[tokio::test]
async fn singleton_group_is_a_noop() {
    let (store, gw_a, _) = setup().await;
    contact_with_messages(
        &store,
        "a@s.whatsapp.net",
        "5511999999999",
        gw_a.id,
        &["a"],
    )
    .await;

    let resolver = resolver(store.clone());
    assert_eq!(
        resolver
            .merge_contacts_by_phone(Platform::Whatsapp, "5511999999999")
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        resolver
            .merge_open_conversations(
                store
                    .contacts_by_phone(Platform::Whatsapp, "5511999999999")
                    .await
                    .unwrap()[0]
                    .id
            )
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn sweep_covers_every_duplicate_group() {
    let (store, gw_a, gw_b) = setup().await;

    contact_with_messages(&store, "a@s.whatsapp.net", "5511000000001", gw_a.id, &["a"]).await;
    contact_with_messages(&store, "a2@lid", "5511000000001", gw_a.id, &["b"]).await;
    contact_with_messages(&store, "b@s.whatsapp.net", "5511000000002", gw_b.id, &["c"]).await;
    contact_with_messages(&store, "b2@lid", "5511000000002", gw_b.id, &["d"]).await;
    contact_with_messages(&store, "solo@s.whatsapp.net", "5511000000003", gw_a.id, &["e"]).await;

    let resolver = resolver(store.clone());
    let report = resolver.sweep().await.unwrap();
    assert_eq!(report.phone_groups, 2);
    assert_eq!(report.contacts_merged, 2);
    assert_eq!(report.failed_groups, 0);

    assert!(store.duplicate_phone_groups().await.unwrap().is_empty());

    // Sweeps are idempotent.
    let again = resolver.sweep().await.unwrap();
    assert_eq!(again.phone_groups, 0);
    assert_eq!(again.contacts_merged, 0);
}

/// Store double whose merges always hit a retryable conflict.
struct ConflictedStore {
    contacts: Vec<Contact>,
    attempts: std::sync::Mutex<u32>,
}

#[async_trait]
impl Store for ConflictedStore {
    async fn contacts_by_phone(
        &self,
        _platform: Platform,
        _phone: &str,
    ) -> CourierResult<Vec<Contact>> {
        Ok(self.contacts.clone())
    }

    async fn merge_contact_into(
        &self,
        _primary_id: i64,
        _duplicate_id: i64,
    ) -> CourierResult<MergeStats> {
        *self.attempts.lock().unwrap() += 1;
        Err(CourierError::Storage {
            message: "database is locked".to_string(),
            retryable: true,
        })
    }

    // The merge path never touches the rest of the interface.
    async fn create_integration(
        &self,
        _new: NewIntegration,
    ) -> CourierResult<Integration> {
        unimplemented!()
    }
    async fn find_integration_by_external_ref(
        &self,
        _external_ref: &str,
    ) -> CourierResult<Option<Integration>> {
        unimplemented!()
    }
    async fn list_integrations(&self) -> CourierResult<Vec<Integration>> {
        unimplemented!()
    }
    async fn create_contact(&self, _new: NewContact) -> CourierResult<Contact> {
        unimplemented!()
    }
    async fn get_contact(&self, _contact_id: i64) -> CourierResult<Option<Contact>> {
        unimplemented!()
    }
    async fn find_contact_by_phone(
        &self,
        _platform: Platform,
        _phone: &str,
    ) -> CourierResult<Option<Contact>> {
        unimplemented!()
    }
    async fn find_contact_by_raw_id(
        &self,
        _platform: Platform,
        _raw_id: &str,
    ) -> CourierResult<Option<Contact>> {
        unimplemented!()
    }
    async fn update_contact_phone(&self, _contact_id: i64, _phone: &str) -> CourierResult<()> {
        unimplemented!()
    }
    async fn update_contact_name(&self, _contact_id: i64, _name: &str) -> CourierResult<()> {
        unimplemented!()
    }
    async fn duplicate_phone_groups(&self) -> CourierResult<Vec<(Platform, String)>> {
        unimplemented!()
    }
    async fn delete_contact(&self, _contact_id: i64) -> CourierResult<()> {
        unimplemented!()
    }
    async fn find_or_create_open_conversation(
        &self,
        _contact_id: i64,
        _integration_id: i64,
    ) -> CourierResult<Conversation> {
        unimplemented!()
    }
    async fn get_conversation(
        &self,
        _conversation_id: i64,
    ) -> CourierResult<Option<Conversation>> {
        unimplemented!()
    }
    async fn conversations_for_contact(
        &self,
        _contact_id: i64,
    ) -> CourierResult<Vec<Conversation>> {
        unimplemented!()
    }
    async fn open_conversations_for_contact(
        &self,
        _contact_id: i64,
    ) -> CourierResult<Vec<Conversation>> {
        unimplemented!()
    }
    async fn reassign_conversation(
        &self,
        _conversation_id: i64,
        _new_contact_id: i64,
    ) -> CourierResult<()> {
        unimplemented!()
    }
    async fn delete_conversation(&self, _conversation_id: i64) -> CourierResult<()> {
        unimplemented!()
    }
    async fn append_message(&self, _new: NewMessage) -> CourierResult<Message> {
        unimplemented!()
    }
    async fn find_message_by_provider_id(
        &self,
        _integration_id: i64,
        _provider_message_id: &str,
    ) -> CourierResult<Option<Message>> {
        unimplemented!()
    }
    async fn messages_for_conversation(
        &self,
        _conversation_id: i64,
    ) -> CourierResult<Vec<Message>> {
        unimplemented!()
    }
    async fn move_messages(
        &self,
        _from_conversation_id: i64,
        _to_conversation_id: i64,
    ) -> CourierResult<usize> {
        unimplemented!()
    }
    async fn collapse_open_conversations(&self, _contact_id: i64) -> CourierResult<usize> {
        unimplemented!()
    }
    async fn contacts_with_multiple_open_conversations(&self) -> CourierResult<Vec<i64>> {
        unimplemented!()
    }
}

fn fake_contact(id: i64, platform_id: &str) -> Contact {
    Contact {
        id,
        platform: Platform::Whatsapp,
        platform_id: platform_id.to_string(),
        phone: Some("5511999999999".to_string()),
        name: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn merge_conflict_after_bounded_retries() {
    let store = Arc::new(ConflictedStore {
        contacts: vec![
            fake_contact(1, "5511999999999@s.whatsapp.net"),
            fake_contact(2, "ghost@lid"),
        ],
        attempts: std::sync::Mutex::new(0),
    });
    let resolver = DuplicateResolver::new(
        store.clone(),
        IdentityConfig::default(),
        &DedupConfig {
            merge_max_attempts: 3,
            sweep_interval_secs: 0,
        },
    );

    let err = resolver
        .merge_contacts_by_phone(Platform::Whatsapp, "5511999999999")
        .await
        .expect_err("merge must give up");
    assert!(matches!(
        err,
        CourierError::MergeConflict { ref phone, attempts: 3 } if phone == "5511999999999"
    ));
    assert_eq!(*store.attempts.lock().unwrap(), 3);
}
