use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::errors::{CourierError, CourierResult};
use crate::identity::Platform;
use crate::store::{
    Contact, Conversation, Integration, IntegrationStatus, MergeStats, Message, NewContact,
    NewIntegration, NewMessage, Store,
};

/// SQLite adapter: single writer connection behind a mutex, WAL journal,
/// bounded busy timeout so no store call blocks indefinitely.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> CourierResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CourierError::Storage {
                    message: format!(
                        "failed to create database parent directory {}: {}",
                        parent.display(),
                        e
                    ),
                    retryable: false,
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> CourierResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CourierResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> CourierResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS integrations (
                id INTEGER PRIMARY KEY,
                external_ref TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                instance_url TEXT,
                api_key TEXT,
                agent_id TEXT,
                config TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY,
                platform TEXT NOT NULL,
                platform_id TEXT NOT NULL,
                phone TEXT,
                name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (platform, platform_id)
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_phone
                ON contacts(platform, phone) WHERE phone IS NOT NULL;

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY,
                contact_id INTEGER NOT NULL REFERENCES contacts(id),
                integration_id INTEGER REFERENCES integrations(id),
                platform TEXT NOT NULL,
                status TEXT NOT NULL,
                assigned_to TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_open
                ON conversations(contact_id, integration_id) WHERE status = 'OPEN';

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                conversation_id INTEGER NOT NULL REFERENCES conversations(id),
                integration_id INTEGER REFERENCES integrations(id),
                sender TEXT NOT NULL,
                body TEXT NOT NULL,
                provider_message_id TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (integration_id, provider_message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at);",
        )?;
        Ok(())
    }

    fn lock(&self) -> CourierResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CourierError::Storage {
            message: "database lock poisoned".to_string(),
            retryable: false,
        })
    }
}

fn ts_from_sql(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_col<T: FromStr<Err = String>>(idx: usize, value: &str) -> rusqlite::Result<T> {
    value
        .parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn json_from_sql(idx: usize, value: Option<String>) -> rusqlite::Result<Option<serde_json::Value>> {
    match value {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

const CONTACT_COLS: &str = "id, platform, platform_id, phone, name, created_at, updated_at";

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        platform: parse_col(1, &row.get::<_, String>(1)?)?,
        platform_id: row.get(2)?,
        phone: row.get(3)?,
        name: row.get(4)?,
        created_at: ts_from_sql(5, &row.get::<_, String>(5)?)?,
        updated_at: ts_from_sql(6, &row.get::<_, String>(6)?)?,
    })
}

const CONVERSATION_COLS: &str =
    "id, contact_id, integration_id, platform, status, assigned_to, created_at, updated_at";

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        integration_id: row.get(2)?,
        platform: parse_col(3, &row.get::<_, String>(3)?)?,
        status: parse_col(4, &row.get::<_, String>(4)?)?,
        assigned_to: row.get(5)?,
        created_at: ts_from_sql(6, &row.get::<_, String>(6)?)?,
        updated_at: ts_from_sql(7, &row.get::<_, String>(7)?)?,
    })
}

const MESSAGE_COLS: &str =
    "id, conversation_id, integration_id, sender, body, provider_message_id, metadata, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        integration_id: row.get(2)?,
        sender: parse_col(3, &row.get::<_, String>(3)?)?,
        body: row.get(4)?,
        provider_message_id: row.get(5)?,
        metadata: json_from_sql(6, row.get(6)?)?,
        created_at: ts_from_sql(7, &row.get::<_, String>(7)?)?,
    })
}

const INTEGRATION_COLS: &str =
    "id, external_ref, kind, status, instance_url, api_key, agent_id, config, created_at, updated_at";

fn integration_from_row(row: &Row<'_>) -> rusqlite::Result<Integration> {
    Ok(Integration {
        id: row.get(0)?,
        external_ref: row.get(1)?,
        kind: parse_col(2, &row.get::<_, String>(2)?)?,
        status: parse_col(3, &row.get::<_, String>(3)?)?,
        instance_url: row.get(4)?,
        api_key: row.get(5)?,
        agent_id: row.get(6)?,
        config: json_from_sql(7, row.get(7)?)?,
        created_at: ts_from_sql(8, &row.get::<_, String>(8)?)?,
        updated_at: ts_from_sql(9, &row.get::<_, String>(9)?)?,
    })
}

/// Move every message of `from` into `to` within an open transaction.
/// `created_at` is untouched so original ordering survives the move.
fn move_messages_tx(
    tx: &rusqlite::Transaction<'_>,
    from_conversation_id: i64,
    to_conversation_id: i64,
) -> rusqlite::Result<usize> {
    tx.execute(
        "UPDATE messages SET conversation_id = ?2 WHERE conversation_id = ?1",
        params![from_conversation_id, to_conversation_id],
    )
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_integration(&self, new: NewIntegration) -> CourierResult<Integration> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO integrations (external_ref, kind, status, instance_url, api_key, agent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                new.external_ref,
                new.kind.as_str(),
                IntegrationStatus::Connected.as_str(),
                new.instance_url,
                new.api_key,
                new.agent_id,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let integration = conn.query_row(
            &format!("SELECT {} FROM integrations WHERE id = ?1", INTEGRATION_COLS),
            params![id],
            integration_from_row,
        )?;
        Ok(integration)
    }

    async fn find_integration_by_external_ref(
        &self,
        external_ref: &str,
    ) -> CourierResult<Option<Integration>> {
        let conn = self.lock()?;
        let integration = conn
            .query_row(
                &format!(
                    "SELECT {} FROM integrations WHERE external_ref = ?1",
                    INTEGRATION_COLS
                ),
                params![external_ref],
                integration_from_row,
            )
            .optional()?;
        Ok(integration)
    }

    async fn list_integrations(&self) -> CourierResult<Vec<Integration>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM integrations ORDER BY id",
            INTEGRATION_COLS
        ))?;
        let rows = stmt.query_map([], integration_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn create_contact(&self, new: NewContact) -> CourierResult<Contact> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO contacts (platform, platform_id, phone, name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                new.platform.as_str(),
                new.platform_id,
                new.phone,
                new.name,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        let contact = conn.query_row(
            &format!("SELECT {} FROM contacts WHERE id = ?1", CONTACT_COLS),
            params![id],
            contact_from_row,
        )?;
        Ok(contact)
    }

    async fn get_contact(&self, contact_id: i64) -> CourierResult<Option<Contact>> {
        let conn = self.lock()?;
        let contact = conn
            .query_row(
                &format!("SELECT {} FROM contacts WHERE id = ?1", CONTACT_COLS),
                params![contact_id],
                contact_from_row,
            )
            .optional()?;
        Ok(contact)
    }

    async fn find_contact_by_phone(
        &self,
        platform: Platform,
        phone: &str,
    ) -> CourierResult<Option<Contact>> {
        let conn = self.lock()?;
        // Oldest wins when drift has produced duplicates; the resolver will
        // collapse them.
        let contact = conn
            .query_row(
                &format!(
                    "SELECT {} FROM contacts WHERE platform = ?1 AND phone = ?2
                     ORDER BY created_at, id LIMIT 1",
                    CONTACT_COLS
                ),
                params![platform.as_str(), phone],
                contact_from_row,
            )
            .optional()?;
        Ok(contact)
    }

    async fn find_contact_by_raw_id(
        &self,
        platform: Platform,
        raw_id: &str,
    ) -> CourierResult<Option<Contact>> {
        let conn = self.lock()?;
        let contact = conn
            .query_row(
                &format!(
                    "SELECT {} FROM contacts WHERE platform = ?1 AND platform_id = ?2",
                    CONTACT_COLS
                ),
                params![platform.as_str(), raw_id],
                contact_from_row,
            )
            .optional()?;
        Ok(contact)
    }

    async fn update_contact_phone(&self, contact_id: i64, phone: &str) -> CourierResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE contacts SET phone = ?2, updated_at = ?3 WHERE id = ?1",
            params![contact_id, phone, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn update_contact_name(&self, contact_id: i64, name: &str) -> CourierResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE contacts SET name = ?2, updated_at = ?3 WHERE id = ?1",
            params![contact_id, name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn contacts_by_phone(
        &self,
        platform: Platform,
        phone: &str,
    ) -> CourierResult<Vec<Contact>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contacts WHERE platform = ?1 AND phone = ?2
             ORDER BY created_at, id",
            CONTACT_COLS
        ))?;
        let rows = stmt.query_map(params![platform.as_str(), phone], contact_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn duplicate_phone_groups(&self) -> CourierResult<Vec<(Platform, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT platform, phone FROM contacts
             WHERE phone IS NOT NULL
             GROUP BY platform, phone
             HAVING COUNT(*) > 1
             ORDER BY platform, phone",
        )?;
        let rows = stmt.query_map([], |row| {
            let platform: Platform = parse_col(0, &row.get::<_, String>(0)?)?;
            Ok((platform, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn delete_contact(&self, contact_id: i64) -> CourierResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM contacts WHERE id = ?1", params![contact_id])?;
        Ok(())
    }

    async fn find_or_create_open_conversation(
        &self,
        contact_id: i64,
        integration_id: i64,
    ) -> CourierResult<Conversation> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // The conversation inherits the contact's platform; a missing
        // contact is a caller bug surfaced as a storage error.
        let platform: String = tx.query_row(
            "SELECT platform FROM contacts WHERE id = ?1",
            params![contact_id],
            |row| row.get(0),
        )?;

        // The partial unique index on (contact_id, integration_id) WHERE
        // status = 'OPEN' makes this insert-or-lose race-free; losing just
        // means the row already exists.
        let now = Utc::now().to_rfc3339();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO conversations
                 (contact_id, integration_id, platform, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'OPEN', ?4, ?4)",
            params![contact_id, integration_id, platform, now],
        )?;

        let conversation = tx.query_row(
            &format!(
                "SELECT {} FROM conversations
                 WHERE contact_id = ?1 AND integration_id = ?2 AND status = 'OPEN'",
                CONVERSATION_COLS
            ),
            params![contact_id, integration_id],
            conversation_from_row,
        )?;
        tx.commit()?;

        if inserted > 0 {
            debug!(
                "opened conversation {} for contact {} on integration {}",
                conversation.id, contact_id, integration_id
            );
        }
        Ok(conversation)
    }

    async fn get_conversation(&self, conversation_id: i64) -> CourierResult<Option<Conversation>> {
        let conn = self.lock()?;
        let conversation = conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations WHERE id = ?1",
                    CONVERSATION_COLS
                ),
                params![conversation_id],
                conversation_from_row,
            )
            .optional()?;
        Ok(conversation)
    }

    async fn conversations_for_contact(
        &self,
        contact_id: i64,
    ) -> CourierResult<Vec<Conversation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations WHERE contact_id = ?1 ORDER BY id",
            CONVERSATION_COLS
        ))?;
        let rows = stmt.query_map(params![contact_id], conversation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn open_conversations_for_contact(
        &self,
        contact_id: i64,
    ) -> CourierResult<Vec<Conversation>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conversations
             WHERE contact_id = ?1 AND status = 'OPEN'
             ORDER BY updated_at DESC, id DESC",
            CONVERSATION_COLS
        ))?;
        let rows = stmt.query_map(params![contact_id], conversation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn reassign_conversation(
        &self,
        conversation_id: i64,
        new_contact_id: i64,
    ) -> CourierResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE conversations SET contact_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![conversation_id, new_contact_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: i64) -> CourierResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }

    async fn append_message(&self, new: NewMessage) -> CourierResult<Message> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let metadata = new.metadata.as_ref().map(|m| m.to_string());
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO messages
                 (conversation_id, integration_id, sender, body, provider_message_id, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.conversation_id,
                new.integration_id,
                new.sender.as_str(),
                new.body,
                new.provider_message_id,
                metadata,
                new.created_at.to_rfc3339(),
            ],
        )?;

        let message = if inserted > 0 {
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![new.conversation_id, Utc::now().to_rfc3339()],
            )?;
            tx.query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLS),
                params![id],
                message_from_row,
            )?
        } else {
            // A concurrent delivery won the idempotency constraint; hand
            // back the row it created.
            let Some(provider_id) = new.provider_message_id.as_deref() else {
                return Err(CourierError::Storage {
                    message: "message insert ignored without a provider id".to_string(),
                    retryable: false,
                });
            };
            tx.query_row(
                &format!(
                    "SELECT {} FROM messages
                     WHERE integration_id IS ?1 AND provider_message_id = ?2",
                    MESSAGE_COLS
                ),
                params![new.integration_id, provider_id],
                message_from_row,
            )?
        };
        tx.commit()?;
        Ok(message)
    }

    async fn find_message_by_provider_id(
        &self,
        integration_id: i64,
        provider_message_id: &str,
    ) -> CourierResult<Option<Message>> {
        let conn = self.lock()?;
        let message = conn
            .query_row(
                &format!(
                    "SELECT {} FROM messages
                     WHERE integration_id = ?1 AND provider_message_id = ?2",
                    MESSAGE_COLS
                ),
                params![integration_id, provider_message_id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: i64,
    ) -> CourierResult<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ?1
             ORDER BY created_at, id",
            MESSAGE_COLS
        ))?;
        let rows = stmt.query_map(params![conversation_id], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn move_messages(
        &self,
        from_conversation_id: i64,
        to_conversation_id: i64,
    ) -> CourierResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let moved = move_messages_tx(&tx, from_conversation_id, to_conversation_id)?;
        tx.commit()?;
        Ok(moved)
    }

    async fn merge_contact_into(
        &self,
        primary_id: i64,
        duplicate_id: i64,
    ) -> CourierResult<MergeStats> {
        if primary_id == duplicate_id {
            return Err(CourierError::Internal(anyhow::anyhow!(
                "refusing to merge contact {} into itself",
                primary_id
            )));
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();
        let mut stats = MergeStats::default();

        let duplicate_convs: Vec<(i64, Option<i64>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, integration_id FROM conversations
                 WHERE contact_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![duplicate_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (conv_id, integration_id) in duplicate_convs {
            let target: Option<i64> = tx
                .query_row(
                    "SELECT id FROM conversations
                     WHERE contact_id = ?1 AND integration_id IS ?2 AND status = 'OPEN'",
                    params![primary_id, integration_id],
                    |row| row.get(0),
                )
                .optional()?;

            match target {
                // Primary already holds the open thread for this
                // integration: fold the duplicate's messages into it.
                Some(target_id) => {
                    stats.messages_moved += move_messages_tx(&tx, conv_id, target_id)?;
                    tx.execute(
                        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                        params![target_id, now],
                    )?;
                    tx.execute("DELETE FROM conversations WHERE id = ?1", params![conv_id])?;
                    stats.conversations_removed += 1;
                }
                None => {
                    tx.execute(
                        "UPDATE conversations SET contact_id = ?2, updated_at = ?3 WHERE id = ?1",
                        params![conv_id, primary_id, now],
                    )?;
                    stats.conversations_reassigned += 1;
                }
            }
        }

        // Carry identity the duplicate knew that the primary does not.
        tx.execute(
            "UPDATE contacts SET
                 phone = COALESCE(phone, (SELECT phone FROM contacts WHERE id = ?2)),
                 name = COALESCE(name, (SELECT name FROM contacts WHERE id = ?2)),
                 updated_at = ?3
             WHERE id = ?1",
            params![primary_id, duplicate_id, now],
        )?;
        tx.execute("DELETE FROM contacts WHERE id = ?1", params![duplicate_id])?;
        tx.commit()?;

        debug!(
            "merged contact {} into {}: {} reassigned, {} removed, {} messages moved",
            duplicate_id,
            primary_id,
            stats.conversations_reassigned,
            stats.conversations_removed,
            stats.messages_moved
        );
        Ok(stats)
    }

    async fn collapse_open_conversations(&self, contact_id: i64) -> CourierResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();

        let open_convs: Vec<(i64, Option<i64>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, integration_id FROM conversations
                 WHERE contact_id = ?1 AND status = 'OPEN'
                 ORDER BY updated_at DESC, id DESC",
            )?;
            let rows = stmt.query_map(params![contact_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        // Most recently active conversation per integration survives.
        let mut survivors: HashMap<Option<i64>, i64> = HashMap::new();
        let mut merged = 0usize;
        for (conv_id, integration_id) in open_convs {
            match survivors.get(&integration_id) {
                None => {
                    survivors.insert(integration_id, conv_id);
                }
                Some(&survivor_id) => {
                    move_messages_tx(&tx, conv_id, survivor_id)?;
                    tx.execute(
                        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                        params![survivor_id, now],
                    )?;
                    tx.execute("DELETE FROM conversations WHERE id = ?1", params![conv_id])?;
                    merged += 1;
                }
            }
        }
        tx.commit()?;
        Ok(merged)
    }

    async fn contacts_with_multiple_open_conversations(&self) -> CourierResult<Vec<i64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT contact_id FROM (
                 SELECT contact_id FROM conversations
                 WHERE status = 'OPEN'
                 GROUP BY contact_id, integration_id
                 HAVING COUNT(*) > 1
             ) ORDER BY contact_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
