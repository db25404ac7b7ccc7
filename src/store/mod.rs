//! Metadata store (MS, §1): concretely implemented here as SQLite, even
//! though the spec treats the MS as an out-of-scope "transactional KV+SQL
//! store with row-level tenant filtering" — something has to sit behind
//! [`crate::pipeline::PipelineStore`] for the pipeline to run against.
//!
//! Grounded in `ledger::with_retry`'s busy-retry policy and
//! `repository`-style "one connection per call, rely on SQLite's own
//! locking plus retry" idiom rather than a pooled/shared connection: every
//! method here opens its own [`rusqlite::Connection`] against the same file,
//! matching how `ledger`'s functions are called from multiple concurrent
//! workers against one database.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::error::{PipelineError, Result};
use crate::models::{
    BoundingBox, CaseDocument, CaseDocumentStatus, Citation, CitationResolutionStatus, ConsistencyIssue, DatePrecision,
    EntityKind, EntityMention, ExtractedTable, IssueSeverity, Matter, OcrChunk, OcrChunkStatus, OcrQualityStatus,
    TextChunk, TimelineEvent,
};
use crate::pipeline::PipelineStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Same busy-retry policy as [`crate::ledger::with_retry`]: five attempts,
/// doubling backoff starting at 100ms, triggered on SQLite's locked/busy
/// errors.
fn with_retry<T>(mut f: impl FnMut() -> StoreResult<T>) -> StoreResult<T> {
    let mut delay_ms = 100u64;
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(StoreError::Database(e)) if attempt < 4 && is_locked(&e) => {
                std::thread::sleep(Duration::from_millis(delay_ms));
                delay_ms = (delay_ms * 2).min(1600);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_locked(e: &rusqlite::Error) -> bool {
    let msg = e.to_string();
    msg.contains("database is locked") || msg.contains("SQLITE_BUSY") || msg.contains("SQLITE_LOCKED")
}

pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Create every table the pipeline needs, including `jobs` (owned in
    /// spirit by [`crate::ledger`], but schema lives here alongside its
    /// siblings since nothing else initializes the database file).
    pub fn init_schema(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY, matter_id TEXT NOT NULL, document_id TEXT, job_type TEXT NOT NULL,
                status TEXT NOT NULL, current_stage TEXT, completed_stages TEXT NOT NULL,
                progress_pct INTEGER NOT NULL, retry_count INTEGER NOT NULL, max_retries INTEGER NOT NULL,
                task_handle TEXT, started_at TEXT, updated_at TEXT NOT NULL, error_message TEXT, metadata TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_type ON jobs(status, job_type);

            CREATE TABLE IF NOT EXISTS matters (
                id TEXT PRIMARY KEY, name TEXT NOT NULL, created_at TEXT NOT NULL, deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY, matter_id TEXT NOT NULL, filename TEXT NOT NULL, storage_path TEXT NOT NULL,
                byte_size INTEGER NOT NULL, page_count INTEGER, status TEXT NOT NULL, ocr_confidence REAL,
                ocr_quality_status TEXT, extracted_text TEXT, uploaded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_matter ON documents(matter_id);

            CREATE TABLE IF NOT EXISTS ocr_chunks (
                document_id TEXT NOT NULL, chunk_index INTEGER NOT NULL, page_start INTEGER NOT NULL,
                page_end INTEGER NOT NULL, status TEXT NOT NULL, result_storage_path TEXT, result_checksum TEXT,
                error_message TEXT, processing_started_at TEXT, processing_completed_at TEXT,
                recovery_attempts INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (document_id, chunk_index)
            );

            CREATE TABLE IF NOT EXISTS bounding_boxes (
                id INTEGER PRIMARY KEY AUTOINCREMENT, document_id TEXT NOT NULL, page_number INTEGER NOT NULL,
                x REAL NOT NULL, y REAL NOT NULL, width REAL NOT NULL, height REAL NOT NULL,
                text TEXT NOT NULL, ocr_confidence REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bboxes_document ON bounding_boxes(document_id);

            CREATE TABLE IF NOT EXISTS text_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT, document_id TEXT NOT NULL, parent_chunk_id INTEGER,
                chunk_type TEXT NOT NULL, chunk_index INTEGER NOT NULL, content TEXT NOT NULL,
                token_count INTEGER NOT NULL, page_number INTEGER, bbox_ids TEXT NOT NULL DEFAULT '[]',
                embedding TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_text_chunks_document ON text_chunks(document_id);

            CREATE TABLE IF NOT EXISTS entity_mentions (
                id INTEGER PRIMARY KEY AUTOINCREMENT, chunk_id INTEGER NOT NULL, canonical_entity_id TEXT NOT NULL,
                kind TEXT NOT NULL, surface_form TEXT NOT NULL, aliases TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS citations (
                id INTEGER PRIMARY KEY AUTOINCREMENT, document_id TEXT NOT NULL, act_name TEXT NOT NULL,
                section TEXT NOT NULL, subsection TEXT, raw_text TEXT NOT NULL, source_page INTEGER NOT NULL,
                source_bbox_ids TEXT NOT NULL DEFAULT '[]', resolution_status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_citations_document ON citations(document_id);

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT, document_id TEXT NOT NULL, event_date TEXT NOT NULL,
                precision TEXT NOT NULL, event_date_text TEXT NOT NULL, description TEXT NOT NULL,
                event_type TEXT NOT NULL, source_page INTEGER NOT NULL, source_bbox_ids TEXT NOT NULL DEFAULT '[]',
                entities_involved TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_events_document ON events(document_id);

            CREATE TABLE IF NOT EXISTS consistency_issues (
                id INTEGER PRIMARY KEY AUTOINCREMENT, document_id TEXT NOT NULL, event_a_id INTEGER NOT NULL,
                event_b_id INTEGER NOT NULL, description TEXT NOT NULL, severity TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS extracted_tables (
                id INTEGER PRIMARY KEY AUTOINCREMENT, document_id TEXT NOT NULL, page_number INTEGER NOT NULL,
                source_bbox_ids TEXT NOT NULL DEFAULT '[]', row_data TEXT NOT NULL, caption TEXT
            );
            ",
        )?;
        Ok(())
    }

    // -- Matter/document CRUD, not part of the PipelineStore trait but used
    // by the CLI's upload/create-matter commands. --

    pub async fn create_matter(&self, matter: &Matter) -> Result<()> {
        let path = self.db_path.clone();
        let matter = matter.clone();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT INTO matters (id, name, created_at, deleted_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO NOTHING",
                params![matter.id, matter.name, matter.created_at.to_rfc3339(), matter.deleted_at.map(|t| t.to_rfc3339())],
            )?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }

    pub async fn get_matter(&self, matter_id: &str) -> Result<Matter> {
        let path = self.db_path.clone();
        let matter_id = matter_id.to_string();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            conn.query_row(
                "SELECT id, name, created_at, deleted_at FROM matters WHERE id = ?1",
                params![matter_id],
                row_to_matter,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("matter {matter_id}")))
        })
        .map_err(store_to_pipeline_err)
    }

    pub async fn create_document(&self, document: &CaseDocument) -> Result<()> {
        self.save_document(document).await
    }
}

fn store_to_pipeline_err(e: StoreError) -> PipelineError {
    match e {
        StoreError::NotFound(what) => PipelineError::Integrity(format!("not found: {what}")),
        other => PipelineError::TransientExternal(other.to_string()),
    }
}

fn row_to_matter(row: &rusqlite::Row<'_>) -> rusqlite::Result<Matter> {
    let created_at_str: String = row.get(2)?;
    let deleted_at_str: Option<String> = row.get(3)?;
    Ok(Matter {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_rfc3339_or_now(&created_at_str),
        deleted_at: deleted_at_str.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc)),
    })
}

fn parse_rfc3339_or_now(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<CaseDocument> {
    let status_str: String = row.get(6)?;
    let quality_str: Option<String> = row.get(8)?;
    let uploaded_at_str: String = row.get(10)?;
    Ok(CaseDocument {
        id: row.get(0)?,
        matter_id: row.get(1)?,
        filename: row.get(2)?,
        storage_path: row.get(3)?,
        byte_size: row.get::<_, i64>(4)? as u64,
        page_count: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        status: CaseDocumentStatus::from_str(&status_str).unwrap_or(CaseDocumentStatus::Failed),
        ocr_confidence: row.get(7)?,
        ocr_quality_status: quality_str.and_then(|s| match s.as_str() {
            "good" => Some(OcrQualityStatus::Good),
            "fair" => Some(OcrQualityStatus::Fair),
            "poor" => Some(OcrQualityStatus::Poor),
            _ => None,
        }),
        extracted_text: row.get(9)?,
        uploaded_at: parse_rfc3339_or_now(&uploaded_at_str),
    })
}

fn ocr_quality_str(status: OcrQualityStatus) -> &'static str {
    match status {
        OcrQualityStatus::Good => "good",
        OcrQualityStatus::Fair => "fair",
        OcrQualityStatus::Poor => "poor",
    }
}

fn row_to_ocr_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<OcrChunk> {
    let status_str: String = row.get(4)?;
    let started_str: Option<String> = row.get(8)?;
    let completed_str: Option<String> = row.get(9)?;
    Ok(OcrChunk {
        document_id: row.get(0)?,
        chunk_index: row.get::<_, i64>(1)? as u32,
        page_start: row.get::<_, i64>(2)? as u32,
        page_end: row.get::<_, i64>(3)? as u32,
        status: OcrChunkStatus::from_str(&status_str).unwrap_or(OcrChunkStatus::Failed),
        result_storage_path: row.get(5)?,
        result_checksum: row.get(6)?,
        error_message: row.get(7)?,
        processing_started_at: started_str.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc)),
        processing_completed_at: completed_str.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc)),
        recovery_attempts: row.get::<_, i64>(10)? as u32,
    })
}

fn row_to_bbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<BoundingBox> {
    Ok(BoundingBox {
        id: row.get(0)?,
        document_id: row.get(1)?,
        page_number: row.get::<_, i64>(2)? as u32,
        x: row.get(3)?,
        y: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        text: row.get(7)?,
        ocr_confidence: row.get(8)?,
    })
}

fn chunk_type_str(t: crate::models::ChunkType) -> &'static str {
    match t {
        crate::models::ChunkType::Parent => "parent",
        crate::models::ChunkType::Child => "child",
    }
}

fn chunk_type_from_str(s: &str) -> crate::models::ChunkType {
    match s {
        "parent" => crate::models::ChunkType::Parent,
        _ => crate::models::ChunkType::Child,
    }
}

fn row_to_text_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<TextChunk> {
    let chunk_type_str_val: String = row.get(3)?;
    let bbox_ids_json: String = row.get(7)?;
    let embedding_json: Option<String> = row.get(8)?;
    Ok(TextChunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        parent_chunk_id: row.get(2)?,
        chunk_type: chunk_type_from_str(&chunk_type_str_val),
        chunk_index: row.get::<_, i64>(4)? as u32,
        content: row.get(5)?,
        token_count: row.get::<_, i64>(6)? as u32,
        page_number: row.get::<_, Option<i64>>(9)?.map(|v| v as u32),
        bbox_ids: serde_json::from_str(&bbox_ids_json).unwrap_or_default(),
        embedding: embedding_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn entity_kind_str(k: EntityKind) -> &'static str {
    match k {
        EntityKind::Person => "person",
        EntityKind::Organization => "organization",
        EntityKind::Statute => "statute",
        EntityKind::DateToken => "date_token",
    }
}

fn entity_kind_from_str(s: &str) -> EntityKind {
    match s {
        "person" => EntityKind::Person,
        "organization" => EntityKind::Organization,
        "statute" => EntityKind::Statute,
        _ => EntityKind::DateToken,
    }
}

fn row_to_entity_mention(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityMention> {
    let kind_str: String = row.get(3)?;
    let aliases_json: String = row.get(5)?;
    Ok(EntityMention {
        id: row.get(0)?,
        chunk_id: row.get(1)?,
        canonical_entity_id: row.get(2)?,
        kind: entity_kind_from_str(&kind_str),
        surface_form: row.get(4)?,
        aliases: serde_json::from_str(&aliases_json).unwrap_or_default(),
    })
}

fn resolution_status_str(s: CitationResolutionStatus) -> &'static str {
    match s {
        CitationResolutionStatus::Available => "available",
        CitationResolutionStatus::AutoFetched => "auto_fetched",
        CitationResolutionStatus::Missing => "missing",
        CitationResolutionStatus::Invalid => "invalid",
    }
}

fn resolution_status_from_str(s: &str) -> CitationResolutionStatus {
    match s {
        "available" => CitationResolutionStatus::Available,
        "auto_fetched" => CitationResolutionStatus::AutoFetched,
        "invalid" => CitationResolutionStatus::Invalid,
        _ => CitationResolutionStatus::Missing,
    }
}

fn row_to_citation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Citation> {
    let source_bbox_ids_json: String = row.get(7)?;
    let resolution_str: String = row.get(8)?;
    Ok(Citation {
        id: row.get(0)?,
        document_id: row.get(1)?,
        act_name: row.get(2)?,
        section: row.get(3)?,
        subsection: row.get(4)?,
        raw_text: row.get(5)?,
        source_page: row.get::<_, i64>(6)? as u32,
        source_bbox_ids: serde_json::from_str(&source_bbox_ids_json).unwrap_or_default(),
        resolution_status: resolution_status_from_str(&resolution_str),
    })
}

fn precision_str(p: DatePrecision) -> &'static str {
    match p {
        DatePrecision::Day => "day",
        DatePrecision::Month => "month",
        DatePrecision::Year => "year",
    }
}

fn precision_from_str(s: &str) -> DatePrecision {
    match s {
        "day" => DatePrecision::Day,
        "month" => DatePrecision::Month,
        _ => DatePrecision::Year,
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<TimelineEvent> {
    let precision_str_val: String = row.get(3)?;
    let source_bbox_ids_json: String = row.get(7)?;
    let entities_json: String = row.get(8)?;
    Ok(TimelineEvent {
        id: row.get(0)?,
        document_id: row.get(1)?,
        event_date: row.get(2)?,
        precision: precision_from_str(&precision_str_val),
        event_date_text: row.get(4)?,
        description: row.get(5)?,
        event_type: row.get(6)?,
        source_page: row.get::<_, i64>(9)? as u32,
        source_bbox_ids: serde_json::from_str(&source_bbox_ids_json).unwrap_or_default(),
        entities_involved: serde_json::from_str(&entities_json).unwrap_or_default(),
    })
}

fn severity_str(s: IssueSeverity) -> &'static str {
    match s {
        IssueSeverity::Low => "low",
        IssueSeverity::Medium => "medium",
        IssueSeverity::High => "high",
    }
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn get_document(&self, document_id: &str) -> Result<CaseDocument> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            conn.query_row(
                "SELECT id, matter_id, filename, storage_path, byte_size, page_count, status,
                    ocr_confidence, ocr_quality_status, extracted_text, uploaded_at
                 FROM documents WHERE id = ?1",
                params![document_id],
                row_to_document,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("document {document_id}")))
        })
        .map_err(store_to_pipeline_err)
    }

    async fn save_document(&self, document: &CaseDocument) -> Result<()> {
        let path = self.db_path.clone();
        let document = document.clone();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT INTO documents (id, matter_id, filename, storage_path, byte_size, page_count, status,
                    ocr_confidence, ocr_quality_status, extracted_text, uploaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    filename = excluded.filename, storage_path = excluded.storage_path,
                    byte_size = excluded.byte_size, page_count = excluded.page_count,
                    status = excluded.status, ocr_confidence = excluded.ocr_confidence,
                    ocr_quality_status = excluded.ocr_quality_status,
                    extracted_text = excluded.extracted_text",
                params![
                    document.id,
                    document.matter_id,
                    document.filename,
                    document.storage_path,
                    document.byte_size as i64,
                    document.page_count.map(|v| v as i64),
                    document.status.as_str(),
                    document.ocr_confidence,
                    document.ocr_quality_status.map(ocr_quality_str),
                    document.extracted_text,
                    document.uploaded_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }

    async fn get_chunks_for_document(&self, document_id: &str) -> Result<Vec<OcrChunk>> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT document_id, chunk_index, page_start, page_end, status, result_storage_path,
                    result_checksum, error_message, processing_started_at, processing_completed_at,
                    recovery_attempts
                 FROM ocr_chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
            )?;
            let rows = stmt.query_map(params![document_id], row_to_ocr_chunk)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .map_err(store_to_pipeline_err)
    }

    async fn save_ocr_chunk(&self, chunk: &OcrChunk) -> Result<()> {
        let path = self.db_path.clone();
        let chunk = chunk.clone();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            conn.execute(
                "INSERT INTO ocr_chunks (document_id, chunk_index, page_start, page_end, status,
                    result_storage_path, result_checksum, error_message, processing_started_at,
                    processing_completed_at, recovery_attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(document_id, chunk_index) DO UPDATE SET
                    page_start = excluded.page_start, page_end = excluded.page_end,
                    status = excluded.status, result_storage_path = excluded.result_storage_path,
                    result_checksum = excluded.result_checksum, error_message = excluded.error_message,
                    processing_started_at = excluded.processing_started_at,
                    processing_completed_at = excluded.processing_completed_at,
                    recovery_attempts = excluded.recovery_attempts",
                params![
                    chunk.document_id,
                    chunk.chunk_index,
                    chunk.page_start,
                    chunk.page_end,
                    chunk.status.as_str(),
                    chunk.result_storage_path,
                    chunk.result_checksum,
                    chunk.error_message,
                    chunk.processing_started_at.map(|t| t.to_rfc3339()),
                    chunk.processing_completed_at.map(|t| t.to_rfc3339()),
                    chunk.recovery_attempts,
                ],
            )?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }

    async fn save_bounding_boxes(&self, document_id: &str, boxes: &[BoundingBox]) -> Result<Vec<BoundingBox>> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        let boxes = boxes.to_vec();
        with_retry(|| {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            let mut saved = Vec::with_capacity(boxes.len());
            for bbox in &boxes {
                tx.execute(
                    "INSERT INTO bounding_boxes (document_id, page_number, x, y, width, height, text, ocr_confidence)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![document_id, bbox.page_number, bbox.x, bbox.y, bbox.width, bbox.height, bbox.text, bbox.ocr_confidence],
                )?;
                let id = tx.last_insert_rowid();
                saved.push(BoundingBox { id, ..bbox.clone() });
            }
            tx.commit()?;
            Ok(saved)
        })
        .map_err(store_to_pipeline_err)
    }

    async fn get_bounding_boxes(&self, document_id: &str) -> Result<Vec<BoundingBox>> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, document_id, page_number, x, y, width, height, text, ocr_confidence
                 FROM bounding_boxes WHERE document_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![document_id], row_to_bbox)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .map_err(store_to_pipeline_err)
    }

    async fn text_chunks_exist(&self, document_id: &str) -> Result<bool> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM text_chunks WHERE document_id = ?1", params![document_id], |r| r.get(0))?;
            Ok(count > 0)
        })
        .map_err(store_to_pipeline_err)
    }

    /// `chunk::run` can only stamp a child's `parent_chunk_id` with its
    /// parent's *chunk_index* (the parent's real row id doesn't exist until
    /// insert time), so this resolves that placeholder against the id
    /// SQLite actually assigned each parent, inside the same transaction —
    /// keeping the "single transaction, all-or-nothing" guarantee from §9's
    /// chunking-idempotency caveat while still writing real foreign keys.
    async fn save_text_chunks(&self, document_id: &str, chunks: &[TextChunk]) -> Result<()> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        let chunks = chunks.to_vec();
        with_retry(|| {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            let mut parent_row_ids: std::collections::HashMap<u32, i64> = std::collections::HashMap::new();

            for chunk in &chunks {
                let resolved_parent_id = match (chunk.chunk_type, chunk.parent_chunk_id) {
                    (ChunkType::Child, Some(parent_chunk_index)) => {
                        let id = parent_row_ids.get(&(parent_chunk_index as u32)).copied().ok_or_else(|| {
                            StoreError::NotFound(format!(
                                "child chunk {} references parent chunk_index {parent_chunk_index} with no prior parent row",
                                chunk.chunk_index
                            ))
                        })?;
                        Some(id)
                    }
                    (ChunkType::Child, None) => {
                        return Err(StoreError::NotFound(format!(
                            "child chunk {} has no parent_chunk_id",
                            chunk.chunk_index
                        )))
                    }
                    (ChunkType::Parent, _) => None,
                };

                tx.execute(
                    "INSERT INTO text_chunks (document_id, parent_chunk_id, chunk_type, chunk_index, content,
                        token_count, page_number, bbox_ids, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        document_id,
                        resolved_parent_id,
                        chunk_type_str(chunk.chunk_type),
                        chunk.chunk_index,
                        chunk.content,
                        chunk.token_count,
                        chunk.page_number,
                        serde_json::to_string(&chunk.bbox_ids)?,
                        chunk.embedding.as_ref().map(serde_json::to_string).transpose()?,
                    ],
                )?;

                if chunk.chunk_type == ChunkType::Parent {
                    parent_row_ids.insert(chunk.chunk_index, tx.last_insert_rowid());
                }
            }
            tx.commit()?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }

    async fn get_text_chunks(&self, document_id: &str) -> Result<Vec<TextChunk>> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, document_id, parent_chunk_id, chunk_type, chunk_index, content, token_count,
                    bbox_ids, embedding, page_number
                 FROM text_chunks WHERE document_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![document_id], row_to_text_chunk)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .map_err(store_to_pipeline_err)
    }

    async fn update_text_chunk(&self, chunk: &TextChunk) -> Result<()> {
        let path = self.db_path.clone();
        let chunk = chunk.clone();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            conn.execute(
                "UPDATE text_chunks SET page_number = ?1, bbox_ids = ?2, embedding = ?3 WHERE id = ?4",
                params![
                    chunk.page_number,
                    serde_json::to_string(&chunk.bbox_ids)?,
                    chunk.embedding.as_ref().map(serde_json::to_string).transpose()?,
                    chunk.id,
                ],
            )?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }

    async fn save_entity_mentions(&self, document_id: &str, mentions: &[EntityMention]) -> Result<()> {
        let _ = document_id;
        let path = self.db_path.clone();
        let mentions = mentions.to_vec();
        with_retry(|| {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            for mention in &mentions {
                tx.execute(
                    "INSERT INTO entity_mentions (chunk_id, canonical_entity_id, kind, surface_form, aliases)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        mention.chunk_id,
                        mention.canonical_entity_id,
                        entity_kind_str(mention.kind),
                        mention.surface_form,
                        serde_json::to_string(&mention.aliases)?,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }

    async fn save_citations(&self, document_id: &str, citations: &[Citation]) -> Result<()> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        let citations = citations.to_vec();
        with_retry(|| {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            for citation in &citations {
                tx.execute(
                    "INSERT INTO citations (document_id, act_name, section, subsection, raw_text, source_page,
                        source_bbox_ids, resolution_status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        document_id,
                        citation.act_name,
                        citation.section,
                        citation.subsection,
                        citation.raw_text,
                        citation.source_page,
                        serde_json::to_string(&citation.source_bbox_ids)?,
                        resolution_status_str(citation.resolution_status),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }

    async fn save_events(&self, document_id: &str, events: &[TimelineEvent]) -> Result<()> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        let events = events.to_vec();
        with_retry(|| {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            for event in &events {
                tx.execute(
                    "INSERT INTO events (document_id, event_date, precision, event_date_text, description,
                        event_type, source_page, source_bbox_ids, entities_involved)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        document_id,
                        event.event_date,
                        precision_str(event.precision),
                        event.event_date_text,
                        event.description,
                        event.event_type,
                        event.source_page,
                        serde_json::to_string(&event.source_bbox_ids)?,
                        serde_json::to_string(&event.entities_involved)?,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }

    async fn get_events(&self, document_id: &str) -> Result<Vec<TimelineEvent>> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        with_retry(|| {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, document_id, event_date, precision, event_date_text, description, event_type,
                    source_bbox_ids, entities_involved, source_page
                 FROM events WHERE document_id = ?1 ORDER BY event_date ASC",
            )?;
            let rows = stmt.query_map(params![document_id], row_to_event)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .map_err(store_to_pipeline_err)
    }

    async fn save_consistency_issues(&self, document_id: &str, issues: &[ConsistencyIssue]) -> Result<()> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        let issues = issues.to_vec();
        with_retry(|| {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            for issue in &issues {
                tx.execute(
                    "INSERT INTO consistency_issues (document_id, event_a_id, event_b_id, description, severity)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![document_id, issue.event_a_id, issue.event_b_id, issue.description, severity_str(issue.severity)],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }

    async fn save_tables(&self, document_id: &str, tables: &[ExtractedTable]) -> Result<()> {
        let path = self.db_path.clone();
        let document_id = document_id.to_string();
        let tables = tables.to_vec();
        with_retry(|| {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            for table in &tables {
                tx.execute(
                    "INSERT INTO extracted_tables (document_id, page_number, source_bbox_ids, row_data, caption)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        document_id,
                        table.page_number,
                        serde_json::to_string(&table.source_bbox_ids)?,
                        serde_json::to_string(&table.rows)?,
                        table.caption,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .map_err(store_to_pipeline_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("pipeline.db"));
        store.init_schema().unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn document_round_trips_through_save_and_get() {
        let (_dir, store) = test_store();
        let mut doc = CaseDocument::new("doc-1".into(), "matter-1".into(), "a.pdf".into(), "documents/matter-1/uploads/a.pdf".into(), 1024);
        doc.page_count = Some(12);
        store.save_document(&doc).await.unwrap();

        let fetched = store.get_document("doc-1").await.unwrap();
        assert_eq!(fetched.id, "doc-1");
        assert_eq!(fetched.page_count, Some(12));
    }

    #[tokio::test]
    async fn save_document_upserts_on_conflict() {
        let (_dir, store) = test_store();
        let mut doc = CaseDocument::new("doc-1".into(), "matter-1".into(), "a.pdf".into(), "documents/matter-1/uploads/a.pdf".into(), 1024);
        store.save_document(&doc).await.unwrap();

        doc.transition_to(CaseDocumentStatus::Processing).unwrap();
        store.save_document(&doc).await.unwrap();

        let fetched = store.get_document("doc-1").await.unwrap();
        assert_eq!(fetched.status, CaseDocumentStatus::Processing);
    }

    #[tokio::test]
    async fn bounding_boxes_get_assigned_ids_on_save() {
        let (_dir, store) = test_store();
        let boxes = vec![
            BoundingBox::new("doc-1".into(), 1, 0.1, 0.1, 0.2, 0.2, "hello".into(), 0.9),
            BoundingBox::new("doc-1".into(), 1, 0.3, 0.3, 0.2, 0.2, "world".into(), 0.9),
        ];
        let saved = store.save_bounding_boxes("doc-1", &boxes).await.unwrap();
        assert_ne!(saved[0].id, 0);
        assert_ne!(saved[0].id, saved[1].id);

        let fetched = store.get_bounding_boxes("doc-1").await.unwrap();
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn text_chunks_exist_reflects_prior_save() {
        let (_dir, store) = test_store();
        assert!(!store.text_chunks_exist("doc-1").await.unwrap());

        let chunks = vec![TextChunk::new_parent("doc-1".into(), 0, "some parent text".into(), 400)];
        store.save_text_chunks("doc-1", &chunks).await.unwrap();

        assert!(store.text_chunks_exist("doc-1").await.unwrap());
        let fetched = store.get_text_chunks("doc-1").await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_ne!(fetched[0].id, 0);
    }

    #[tokio::test]
    async fn child_parent_chunk_id_resolves_to_real_parent_row_id() {
        let (_dir, store) = test_store();
        // chunk::run only knows the parent's chunk_index at split time, not
        // its eventual row id — save_text_chunks must translate that.
        let parent = TextChunk::new_parent("doc-1".into(), 0, "parent text".into(), 1800);
        let child = TextChunk::new_child("doc-1".into(), 0, 0, "child text".into(), 500);
        store.save_text_chunks("doc-1", &[parent, child]).await.unwrap();

        let fetched = store.get_text_chunks("doc-1").await.unwrap();
        let parent_row = fetched.iter().find(|c| c.chunk_type == ChunkType::Parent).unwrap();
        let child_row = fetched.iter().find(|c| c.chunk_type == ChunkType::Child).unwrap();

        assert_eq!(child_row.parent_chunk_id, Some(parent_row.id));
        assert_ne!(child_row.parent_chunk_id, Some(0));
    }

    #[tokio::test]
    async fn multiple_parents_resolve_children_to_the_correct_parent() {
        let (_dir, store) = test_store();
        let chunks = vec![
            TextChunk::new_parent("doc-1".into(), 0, "parent zero".into(), 1800),
            TextChunk::new_child("doc-1".into(), 0, 0, "child of zero".into(), 500),
            TextChunk::new_parent("doc-1".into(), 1, "parent one".into(), 1800),
            TextChunk::new_child("doc-1".into(), 1, 0, "child of one".into(), 500),
        ];
        store.save_text_chunks("doc-1", &chunks).await.unwrap();

        let fetched = store.get_text_chunks("doc-1").await.unwrap();
        let parent0 = fetched.iter().find(|c| c.chunk_type == ChunkType::Parent && c.chunk_index == 0).unwrap();
        let parent1 = fetched.iter().find(|c| c.chunk_type == ChunkType::Parent && c.chunk_index == 1).unwrap();
        let child_of_zero = fetched.iter().find(|c| c.content == "child of zero").unwrap();
        let child_of_one = fetched.iter().find(|c| c.content == "child of one").unwrap();

        assert_eq!(child_of_zero.parent_chunk_id, Some(parent0.id));
        assert_eq!(child_of_one.parent_chunk_id, Some(parent1.id));
    }

    #[tokio::test]
    async fn update_text_chunk_persists_bbox_links() {
        let (_dir, store) = test_store();
        let chunks = vec![TextChunk::new_parent("doc-1".into(), 0, "text".into(), 100)];
        store.save_text_chunks("doc-1", &chunks).await.unwrap();

        let mut fetched = store.get_text_chunks("doc-1").await.unwrap();
        fetched[0].bbox_ids = vec![1, 2, 3];
        fetched[0].page_number = Some(2);
        store.update_text_chunk(&fetched[0]).await.unwrap();

        let refetched = store.get_text_chunks("doc-1").await.unwrap();
        assert_eq!(refetched[0].bbox_ids, vec![1, 2, 3]);
        assert_eq!(refetched[0].page_number, Some(2));
    }

    #[tokio::test]
    async fn ocr_chunks_upsert_by_document_and_index() {
        let (_dir, store) = test_store();
        let mut chunk = OcrChunk::new("doc-1".into(), 0, 1, 15);
        store.save_ocr_chunk(&chunk).await.unwrap();

        chunk.status = OcrChunkStatus::Completed;
        chunk.result_checksum = Some("abc123".into());
        store.save_ocr_chunk(&chunk).await.unwrap();

        let chunks = store.get_chunks_for_document("doc-1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].status, OcrChunkStatus::Completed);
    }

    #[tokio::test]
    async fn events_round_trip_with_severity_and_precision() {
        let (_dir, store) = test_store();
        let event = TimelineEvent::new(
            "doc-1".into(),
            "2024-03-01".into(),
            DatePrecision::Day,
            "March 1, 2024".into(),
            "contract signed".into(),
            "execution".into(),
            4,
        );
        store.save_events("doc-1", &[event]).await.unwrap();

        let fetched = store.get_events("doc-1").await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].precision, DatePrecision::Day);
    }

    #[tokio::test]
    async fn matter_create_is_idempotent() {
        let (_dir, store) = test_store();
        let matter = Matter::new("matter-1".into(), "Smith v. Jones".into());
        store.create_matter(&matter).await.unwrap();
        store.create_matter(&matter).await.unwrap();

        let fetched = store.get_matter("matter-1").await.unwrap();
        assert_eq!(fetched.name, "Smith v. Jones");
    }
}
