//! `SQLite` reference implementation of the datastore contract.
//!
//! Similarity queries are linear-scan cosine distance over stored `f32`
//! embeddings: distance = 1 − cosine similarity, smaller is better, rows
//! without an embedding score 1. Good enough for the corpus sizes a single
//! conversation carries; a production deployment swaps this module for a
//! vector-store-backed [`Datastore`](super::Datastore) implementation.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::{Datastore, NewAssistantMessage};
use crate::error::StoreError;
use crate::model::{
    Chunk, Conversation, DiscoveredLink, Message, MessageRole, Page, PageStatus, Quote,
    QueryStrategy, ReasoningStep, Slot, SlotItem, SlotKind, Source, StepAction, SubqueryRecord,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY,
    owner_id        TEXT,
    dynamic_sources INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sources (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    domain          TEXT NOT NULL,
    root_url        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pages (
    id        TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES sources(id),
    title     TEXT NOT NULL DEFAULT '',
    path      TEXT NOT NULL DEFAULT '',
    url       TEXT NOT NULL DEFAULT '',
    status    TEXT NOT NULL DEFAULT 'pending',
    content   TEXT
);

CREATE TABLE IF NOT EXISTS chunks (
    id        TEXT PRIMARY KEY,
    page_id   TEXT NOT NULL REFERENCES pages(id),
    content   TEXT NOT NULL,
    lead      INTEGER NOT NULL DEFAULT 0,
    embedding BLOB
);
CREATE INDEX IF NOT EXISTS idx_chunks_page ON chunks(page_id);

CREATE TABLE IF NOT EXISTS discovered_links (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id    TEXT NOT NULL REFERENCES sources(id),
    from_page_id TEXT,
    to_url       TEXT NOT NULL,
    anchor_text  TEXT NOT NULL DEFAULT '',
    snippet      TEXT NOT NULL DEFAULT '',
    embedding    BLOB,
    UNIQUE(source_id, to_url)
);

CREATE TABLE IF NOT EXISTS messages (
    id                   TEXT PRIMARY KEY,
    conversation_id      TEXT NOT NULL REFERENCES conversations(id),
    seq                  INTEGER NOT NULL,
    role                 TEXT NOT NULL,
    content              TEXT NOT NULL DEFAULT '',
    thought_process      TEXT,
    suggested_page       TEXT,
    scraped_page_display TEXT,
    follows_message_id   TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq);

CREATE TABLE IF NOT EXISTS reasoning_steps (
    root_message_id TEXT NOT NULL,
    iteration       INTEGER NOT NULL,
    action          TEXT NOT NULL,
    why             TEXT NOT NULL DEFAULT '',
    completeness    REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (root_message_id, iteration)
);

CREATE TABLE IF NOT EXISTS subqueries (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    root_message_id TEXT NOT NULL,
    iteration       INTEGER NOT NULL,
    slot_id         TEXT,
    query_text      TEXT NOT NULL,
    strategy        TEXT NOT NULL DEFAULT 'targeted'
);
CREATE INDEX IF NOT EXISTS idx_subqueries_step ON subqueries(root_message_id, iteration);

CREATE TABLE IF NOT EXISTS slots (
    id                 TEXT PRIMARY KEY,
    root_message_id    TEXT NOT NULL,
    name               TEXT NOT NULL,
    description        TEXT NOT NULL DEFAULT '',
    kind               TEXT NOT NULL,
    required           INTEGER NOT NULL DEFAULT 1,
    depends_on_slot_id TEXT,
    target_item_count  INTEGER NOT NULL DEFAULT 0,
    items_per_key      INTEGER NOT NULL DEFAULT 1,
    attempt_count      INTEGER NOT NULL DEFAULT 0,
    finished_querying  INTEGER NOT NULL DEFAULT 0,
    last_queries       TEXT NOT NULL DEFAULT '[]',
    UNIQUE(root_message_id, name)
);

CREATE TABLE IF NOT EXISTS slot_items (
    id         TEXT PRIMARY KEY,
    slot_id    TEXT NOT NULL REFERENCES slots(id),
    key        TEXT NOT NULL DEFAULT '',
    value_json TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 0,
    complete   INTEGER NOT NULL DEFAULT 0,
    UNIQUE(slot_id, key, value_json)
);

CREATE TABLE IF NOT EXISTS claim_evidence (
    slot_item_id TEXT NOT NULL REFERENCES slot_items(id),
    chunk_id     TEXT NOT NULL,
    PRIMARY KEY (slot_item_id, chunk_id)
);

CREATE TABLE IF NOT EXISTS quotes (
    id             TEXT PRIMARY KEY,
    message_id     TEXT NOT NULL REFERENCES messages(id),
    page_id        TEXT NOT NULL,
    chunk_id       TEXT NOT NULL,
    snippet        TEXT NOT NULL,
    page_title     TEXT NOT NULL DEFAULT '',
    page_path      TEXT NOT NULL DEFAULT '',
    domain         TEXT NOT NULL DEFAULT '',
    page_url       TEXT,
    context_before TEXT,
    context_after  TEXT,
    citation_order INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quotes_message ON quotes(message_id, citation_order);

CREATE TABLE IF NOT EXISTS run_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    root_message_id TEXT NOT NULL,
    iteration       INTEGER NOT NULL,
    action          TEXT NOT NULL,
    why             TEXT NOT NULL DEFAULT '',
    completeness    REAL NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);
";

/// `SQLite`-backed datastore.
///
/// The connection sits behind a mutex; every operation locks, runs
/// synchronously, and releases before the next await point, so the async
/// trait surface never holds the lock across I/O.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn uuid_from_col(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_default()
}

fn opt_uuid(s: Option<String>) -> Option<Uuid> {
    s.as_deref().and_then(|v| Uuid::parse_str(v).ok())
}

fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// 1 − cosine similarity; 1.0 for empty or zero vectors.
pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 1.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot / (na.sqrt() * nb.sqrt())
}

fn sql_placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database cannot be opened or
    /// migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory store, used by tests and smoke runs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another store call panicked; the data is
        // still consistent (every operation is a single transaction).
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ── seeding (indexer-side writes, used by the CLI and tests) ──────

    /// Inserts a conversation row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO conversations (id, owner_id, dynamic_sources) VALUES (?1, ?2, ?3)",
            params![
                conversation.id.to_string(),
                conversation.owner_id.map(|u| u.to_string()),
                conversation.dynamic_sources,
            ],
        )?;
        Ok(())
    }

    /// Inserts a source row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_source(&self, source: &Source) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO sources (id, conversation_id, domain, root_url) VALUES (?1, ?2, ?3, ?4)",
            params![
                source.id.to_string(),
                source.conversation_id.to_string(),
                source.domain,
                source.root_url,
            ],
        )?;
        Ok(())
    }

    /// Inserts a page row with its full text content.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_page(&self, page: &Page, content: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO pages (id, source_id, title, path, url, status, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                page.id.to_string(),
                page.source_id.to_string(),
                page.title,
                page.path,
                page.url,
                page.status.as_str(),
                content,
            ],
        )?;
        Ok(())
    }

    /// Replaces a page's stored full text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn set_page_content(&self, page_id: Uuid, content: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE pages SET content = ?2 WHERE id = ?1",
            params![page_id.to_string(), content],
        )?;
        Ok(())
    }

    /// Inserts a chunk row with its embedding.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_chunk(
        &self,
        id: Uuid,
        page_id: Uuid,
        content: &str,
        lead: bool,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO chunks (id, page_id, content, lead, embedding) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                page_id.to_string(),
                content,
                lead,
                vec_to_blob(embedding),
            ],
        )?;
        Ok(())
    }

    /// Inserts a discovered-link row with its embedding.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_discovered_link(
        &self,
        link: &DiscoveredLink,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO discovered_links (source_id, from_page_id, to_url, anchor_text, snippet, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(source_id, to_url) DO UPDATE SET
               anchor_text = excluded.anchor_text,
               snippet = excluded.snippet,
               embedding = excluded.embedding",
            params![
                link.source_id.to_string(),
                link.from_page_id.map(|u| u.to_string()),
                link.to_url,
                link.anchor_text,
                link.snippet,
                vec_to_blob(embedding),
            ],
        )?;
        Ok(())
    }

    /// Inserts a user message, assigning the next sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert_user_message(
        &self,
        id: Uuid,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, seq, role, content)
             VALUES (?1, ?2,
               (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?2),
               'user', ?3)",
            params![id.to_string(), conversation_id.to_string(), content],
        )?;
        Ok(())
    }

    // ── row mapping helpers ───────────────────────────────────────────

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
        let thought: Option<String> = row.get("thought_process")?;
        let suggested: Option<String> = row.get("suggested_page")?;
        Ok(Message {
            id: uuid_from_col(&row.get::<_, String>("id")?),
            conversation_id: uuid_from_col(&row.get::<_, String>("conversation_id")?),
            seq: row.get("seq")?,
            role: MessageRole::parse(&row.get::<_, String>("role")?),
            content: row.get("content")?,
            thought_process: thought.and_then(|s| serde_json::from_str(&s).ok()),
            suggested_page: suggested.and_then(|s| serde_json::from_str(&s).ok()),
            scraped_page_display: row.get("scraped_page_display")?,
            follows_message_id: opt_uuid(row.get("follows_message_id")?),
        })
    }

    fn row_to_slot(row: &rusqlite::Row<'_>) -> rusqlite::Result<Slot> {
        let last_queries: String = row.get("last_queries")?;
        Ok(Slot {
            id: uuid_from_col(&row.get::<_, String>("id")?),
            root_message_id: uuid_from_col(&row.get::<_, String>("root_message_id")?),
            name: row.get("name")?,
            description: row.get("description")?,
            kind: SlotKind::parse(&row.get::<_, String>("kind")?),
            required: row.get("required")?,
            depends_on_slot_id: opt_uuid(row.get("depends_on_slot_id")?),
            target_item_count: row.get("target_item_count")?,
            items_per_key: row.get("items_per_key")?,
            current_item_count: row.get("item_count")?,
            attempt_count: row.get("attempt_count")?,
            finished_querying: row.get("finished_querying")?,
            last_queries: serde_json::from_str(&last_queries).unwrap_or_default(),
        })
    }

    fn chunk_query(
        conn: &Connection,
        where_clause: &str,
        ids: &[Uuid],
    ) -> Result<Vec<(Chunk, Vec<f32>)>, StoreError> {
        let sql = format!(
            "SELECT c.id, c.page_id, c.content, c.embedding,
                    p.title AS page_title, p.path AS page_path, s.domain AS source_domain
             FROM chunks c
             JOIN pages p ON p.id = c.page_id
             JOIN sources s ON s.id = p.source_id
             WHERE {where_clause}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let embedding: Option<Vec<u8>> = row.get("embedding")?;
            Ok((
                Chunk {
                    id: uuid_from_col(&row.get::<_, String>("id")?),
                    page_id: uuid_from_col(&row.get::<_, String>("page_id")?),
                    content: row.get("content")?,
                    page_title: row.get("page_title")?,
                    page_path: row.get("page_path")?,
                    source_domain: row.get("source_domain")?,
                    distance: None,
                },
                embedding.map(|b| blob_to_vec(&b)).unwrap_or_default(),
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, owner_id, dynamic_sources FROM conversations WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(Conversation {
                        id: uuid_from_col(&row.get::<_, String>(0)?),
                        owner_id: opt_uuid(row.get(1)?),
                        dynamic_sources: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    async fn list_sources(&self, conversation_id: Uuid) -> Result<Vec<Source>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, domain, root_url FROM sources WHERE conversation_id = ?1",
        )?;
        let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
            Ok(Source {
                id: uuid_from_col(&row.get::<_, String>(0)?),
                conversation_id: uuid_from_col(&row.get::<_, String>(1)?),
                domain: row.get(2)?,
                root_url: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn list_indexed_pages(&self, conversation_id: Uuid) -> Result<Vec<Page>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT p.id, p.source_id, p.title, p.path, p.url, p.status
             FROM pages p
             JOIN sources s ON s.id = p.source_id
             WHERE s.conversation_id = ?1 AND p.status = 'indexed'",
        )?;
        let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
            Ok(Page {
                id: uuid_from_col(&row.get::<_, String>(0)?),
                source_id: uuid_from_col(&row.get::<_, String>(1)?),
                title: row.get(2)?,
                path: row.get(3)?,
                url: row.get(4)?,
                status: PageStatus::parse(&row.get::<_, String>(5)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn get_page_content(&self, page_id: Uuid) -> Result<Option<String>, StoreError> {
        let conn = self.lock();
        let content = conn
            .query_row(
                "SELECT content FROM pages WHERE id = ?1",
                params![page_id.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(content.flatten())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT * FROM messages WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    async fn latest_user_message_before(
        &self,
        conversation_id: Uuid,
        before: Uuid,
    ) -> Result<Option<Message>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT * FROM messages
                 WHERE conversation_id = ?1 AND role = 'user'
                   AND seq < (SELECT seq FROM messages WHERE id = ?2)
                 ORDER BY seq DESC LIMIT 1",
                params![conversation_id.to_string(), before.to_string()],
                Self::row_to_message,
            )
            .optional()?;
        Ok(row)
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![conversation_id.to_string(), limit as i64],
            Self::row_to_message,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    }

    async fn insert_assistant_message(
        &self,
        message: NewAssistantMessage,
    ) -> Result<Message, StoreError> {
        let id = Uuid::new_v4();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO messages
               (id, conversation_id, seq, role, content, thought_process, suggested_page,
                scraped_page_display, follows_message_id)
             VALUES (?1, ?2,
               (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?2),
               'assistant', ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                message.conversation_id.to_string(),
                message.content,
                message
                    .thought_process
                    .as_ref()
                    .map(serde_json::Value::to_string),
                message
                    .suggested_page
                    .as_ref()
                    .map(serde_json::Value::to_string),
                message.scraped_page_display,
                message.follows_message_id.map(|u| u.to_string()),
            ],
        )?;
        let row = conn.query_row(
            "SELECT * FROM messages WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_message,
        )?;
        Ok(row)
    }

    async fn clear_suggested_page(&self, message_id: Uuid) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE messages SET suggested_page = NULL WHERE id = ?1",
            params![message_id.to_string()],
        )?;
        Ok(())
    }

    async fn upsert_reasoning_step(&self, step: &ReasoningStep) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO reasoning_steps (root_message_id, iteration, action, why, completeness)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(root_message_id, iteration) DO UPDATE SET
               action = excluded.action,
               why = excluded.why,
               completeness = excluded.completeness",
            params![
                step.root_message_id.to_string(),
                step.iteration,
                step.action.as_str(),
                step.why,
                step.completeness_score,
            ],
        )?;
        Ok(())
    }

    async fn insert_subqueries(
        &self,
        root_message_id: Uuid,
        iteration: u32,
        subqueries: &[SubqueryRecord],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        // Replaying a step replaces its recorded subqueries wholesale.
        tx.execute(
            "DELETE FROM subqueries WHERE root_message_id = ?1 AND iteration = ?2",
            params![root_message_id.to_string(), iteration],
        )?;
        for sq in subqueries {
            tx.execute(
                "INSERT INTO subqueries (root_message_id, iteration, slot_id, query_text, strategy)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    root_message_id.to_string(),
                    iteration,
                    sq.slot_id.map(|u| u.to_string()),
                    sq.query_text,
                    sq.strategy.as_str(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn subqueries_for_iteration(
        &self,
        root_message_id: Uuid,
        iteration: u32,
    ) -> Result<Vec<SubqueryRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT slot_id, query_text, strategy FROM subqueries
             WHERE root_message_id = ?1 AND iteration = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![root_message_id.to_string(), iteration], |row| {
            Ok(SubqueryRecord {
                slot_id: opt_uuid(row.get(0)?),
                query_text: row.get(1)?,
                strategy: QueryStrategy::parse(&row.get::<_, String>(2)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn append_run_log(
        &self,
        root_message_id: Uuid,
        iteration: u32,
        action: StepAction,
        why: &str,
        completeness: f32,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO run_log (root_message_id, iteration, action, why, completeness)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                root_message_id.to_string(),
                iteration,
                action.as_str(),
                why,
                completeness,
            ],
        )?;
        Ok(())
    }

    async fn insert_slot(&self, slot: &Slot) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO slots
               (id, root_message_id, name, description, kind, required, depends_on_slot_id,
                target_item_count, items_per_key, attempt_count, finished_querying, last_queries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(root_message_id, name) DO NOTHING",
            params![
                slot.id.to_string(),
                slot.root_message_id.to_string(),
                slot.name,
                slot.description,
                slot.kind.as_str(),
                slot.required,
                slot.depends_on_slot_id.map(|u| u.to_string()),
                slot.target_item_count,
                slot.items_per_key,
                slot.attempt_count,
                slot.finished_querying,
                serde_json::to_string(&slot.last_queries)?,
            ],
        )?;
        Ok(())
    }

    async fn list_slots(&self, root_message_id: Uuid) -> Result<Vec<Slot>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT s.*, (SELECT COUNT(*) FROM slot_items i WHERE i.slot_id = s.id) AS item_count
             FROM slots s WHERE s.root_message_id = ?1 ORDER BY s.rowid",
        )?;
        let rows = stmt.query_map(params![root_message_id.to_string()], Self::row_to_slot)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn update_slot_attempt(
        &self,
        slot_id: Uuid,
        queries: &[String],
        finished: bool,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE slots SET
               attempt_count = attempt_count + 1,
               last_queries = ?2,
               finished_querying = finished_querying OR ?3
             WHERE id = ?1",
            params![
                slot_id.to_string(),
                serde_json::to_string(queries)?,
                finished,
            ],
        )?;
        Ok(())
    }

    async fn reset_slot_querying(&self, root_message_id: Uuid) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE slots SET finished_querying = 0 WHERE root_message_id = ?1",
            params![root_message_id.to_string()],
        )?;
        Ok(())
    }

    async fn upsert_slot_item(&self, item: &SlotItem) -> Result<Uuid, StoreError> {
        let conn = self.lock();
        let id: String = conn.query_row(
            "INSERT INTO slot_items (id, slot_id, key, value_json, confidence, complete)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(slot_id, key, value_json) DO UPDATE SET
               confidence = MAX(confidence, excluded.confidence),
               complete = complete OR excluded.complete
             RETURNING id",
            params![
                item.id.to_string(),
                item.slot_id.to_string(),
                item.key.clone().unwrap_or_default(),
                serde_json::to_string(&item.value)?,
                item.confidence,
                item.complete,
            ],
            |row| row.get(0),
        )?;
        Ok(uuid_from_col(&id))
    }

    async fn upsert_claim_evidence(
        &self,
        slot_item_id: Uuid,
        chunk_id: Uuid,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO claim_evidence (slot_item_id, chunk_id) VALUES (?1, ?2)
             ON CONFLICT(slot_item_id, chunk_id) DO NOTHING",
            params![slot_item_id.to_string(), chunk_id.to_string()],
        )?;
        Ok(())
    }

    async fn slot_items(&self, slot_id: Uuid) -> Result<Vec<SlotItem>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, slot_id, key, value_json, confidence, complete
             FROM slot_items WHERE slot_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![slot_id.to_string()], |row| {
            let key: String = row.get(2)?;
            let value_json: String = row.get(3)?;
            Ok(SlotItem {
                id: uuid_from_col(&row.get::<_, String>(0)?),
                slot_id: uuid_from_col(&row.get::<_, String>(1)?),
                key: if key.is_empty() { None } else { Some(key) },
                value: serde_json::from_str(&value_json).unwrap_or(serde_json::Value::Null),
                confidence: row.get(4)?,
                complete: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn evidence_chunks_by_slot(
        &self,
        root_message_id: Uuid,
    ) -> Result<Vec<(Uuid, Vec<Uuid>)>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id AS slot_id, e.chunk_id
             FROM slots s
             JOIN slot_items i ON i.slot_id = s.id
             JOIN claim_evidence e ON e.slot_item_id = i.id
             WHERE s.root_message_id = ?1
             ORDER BY s.rowid, i.rowid, e.rowid",
        )?;
        let rows = stmt.query_map(params![root_message_id.to_string()], |row| {
            Ok((
                uuid_from_col(&row.get::<_, String>(0)?),
                uuid_from_col(&row.get::<_, String>(1)?),
            ))
        })?;

        let mut grouped: Vec<(Uuid, Vec<Uuid>)> = Vec::new();
        for row in rows {
            let (slot_id, chunk_id) = row?;
            if let Some(index) = grouped.iter().position(|(id, _)| *id == slot_id) {
                if !grouped[index].1.contains(&chunk_id) {
                    grouped[index].1.push(chunk_id);
                }
            } else {
                grouped.push((slot_id, vec![chunk_id]));
            }
        }
        Ok(grouped)
    }

    async fn match_chunks(
        &self,
        query_embedding: &[f32],
        page_ids: &[Uuid],
        count: usize,
    ) -> Result<Vec<Chunk>, StoreError> {
        if page_ids.is_empty() || count == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let where_clause = format!("c.page_id IN ({})", sql_placeholders(page_ids.len()));
        let mut scored = Self::chunk_query(&conn, &where_clause, page_ids)?;
        drop(conn);

        let mut out: Vec<Chunk> = scored
            .drain(..)
            .map(|(mut chunk, embedding)| {
                chunk.distance = Some(cosine_distance(query_embedding, &embedding));
                chunk
            })
            .collect();
        out.sort_by(|a, b| {
            a.distance
                .unwrap_or(1.0)
                .total_cmp(&b.distance.unwrap_or(1.0))
        });
        out.truncate(count);
        Ok(out)
    }

    async fn match_discovered_links(
        &self,
        query_embedding: &[f32],
        source_ids: &[Uuid],
        count: usize,
    ) -> Result<Vec<DiscoveredLink>, StoreError> {
        if source_ids.is_empty() || count == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let sql = format!(
            "SELECT source_id, from_page_id, to_url, anchor_text, snippet, embedding
             FROM discovered_links
             WHERE source_id IN ({})
               AND to_url NOT IN (SELECT url FROM pages WHERE status = 'indexed')",
            sql_placeholders(source_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<String> = source_ids.iter().map(Uuid::to_string).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let embedding: Option<Vec<u8>> = row.get(5)?;
            Ok((
                DiscoveredLink {
                    source_id: uuid_from_col(&row.get::<_, String>(0)?),
                    from_page_id: opt_uuid(row.get(1)?),
                    to_url: row.get(2)?,
                    anchor_text: row.get(3)?,
                    snippet: row.get(4)?,
                    distance: None,
                },
                embedding.map(|b| blob_to_vec(&b)).unwrap_or_default(),
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (mut link, embedding) = row?;
            link.distance = Some(cosine_distance(query_embedding, &embedding));
            out.push(link);
        }
        drop(stmt);
        drop(conn);

        out.sort_by(|a, b| {
            a.distance
                .unwrap_or(1.0)
                .total_cmp(&b.distance.unwrap_or(1.0))
        });
        out.truncate(count);
        Ok(out)
    }

    async fn get_lead_chunks(&self, page_ids: &[Uuid]) -> Result<Vec<Chunk>, StoreError> {
        if page_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let where_clause = format!(
            "c.lead = 1 AND c.page_id IN ({})",
            sql_placeholders(page_ids.len())
        );
        let scored = Self::chunk_query(&conn, &where_clause, page_ids)?;
        Ok(scored.into_iter().map(|(chunk, _)| chunk).collect())
    }

    async fn insert_quote(&self, quote: &Quote) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO quotes
               (id, message_id, page_id, chunk_id, snippet, page_title, page_path, domain,
                page_url, context_before, context_after, citation_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                quote.id.to_string(),
                quote.message_id.to_string(),
                quote.page_id.to_string(),
                quote.chunk_id.to_string(),
                quote.snippet,
                quote.page_title,
                quote.page_path,
                quote.domain,
                quote.page_url,
                quote.context_before,
                quote.context_after,
                quote.citation_order,
            ],
        )?;
        Ok(())
    }

    async fn quotes_for_message(&self, message_id: Uuid) -> Result<Vec<Quote>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, page_id, chunk_id, snippet, page_title, page_path, domain,
                    page_url, context_before, context_after, citation_order
             FROM quotes WHERE message_id = ?1 ORDER BY citation_order",
        )?;
        let rows = stmt.query_map(params![message_id.to_string()], |row| {
            Ok(Quote {
                id: uuid_from_col(&row.get::<_, String>(0)?),
                message_id: uuid_from_col(&row.get::<_, String>(1)?),
                page_id: uuid_from_col(&row.get::<_, String>(2)?),
                chunk_id: uuid_from_col(&row.get::<_, String>(3)?),
                snippet: row.get(4)?,
                page_title: row.get(5)?,
                page_path: row.get(6)?,
                domain: row.get(7)?,
                page_url: row.get(8)?,
                context_before: row.get(9)?,
                context_after: row.get(10)?,
                citation_order: row.get(11)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
