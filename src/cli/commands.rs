//! One function per subcommand, each owning its own connections/clients —
//! same shape as the teacher's `cmd_*` functions, which each construct the
//! repositories they need from `Settings` rather than threading a shared
//! context object through.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{mpsc, watch};

use crate::cache::{InMemoryQueryCache, QueryCache, RedisQueryCache};
use crate::config::{self, PipelineConfig};
use crate::ledger;
use crate::lock::{ChunkLock, InMemoryChunkLock, RedisChunkLock};
use crate::models::{CaseDocument, Job, JobType, Matter};
use crate::pipeline::{upload_key, PipelineStore};
use crate::realtime::ConnectionManager;
use crate::recovery;
use crate::store::SqliteStore;
use crate::worker::{dispatch, WorkerEvent, WorkerPool};

pub async fn init(config: &PipelineConfig) -> anyhow::Result<()> {
    config.ensure_directories()?;
    let store = SqliteStore::new(config.database_path());
    store.init_schema()?;
    println!("Initialized legal-pipeline in {}", config.data_dir().display());
    Ok(())
}

pub async fn matter_create(config: &PipelineConfig, name: &str) -> anyhow::Result<()> {
    let store = SqliteStore::new(config.database_path());
    let matter = Matter::new(uuid::Uuid::new_v4().to_string(), name.to_string());
    store.create_matter(&matter).await?;
    println!("Created matter {} ({})", matter.id, matter.name);
    Ok(())
}

pub async fn matter_show(config: &PipelineConfig, id: &str) -> anyhow::Result<()> {
    let store = SqliteStore::new(config.database_path());
    let matter = store.get_matter(id).await?;
    println!("id:         {}", matter.id);
    println!("name:       {}", matter.name);
    println!("created_at: {}", matter.created_at.to_rfc3339());
    if let Some(deleted_at) = matter.deleted_at {
        println!("deleted_at: {}", deleted_at.to_rfc3339());
    }
    Ok(())
}

pub async fn document_upload(config: &PipelineConfig, matter_id: &str, file: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(file).await?;
    let document_id = uuid::Uuid::new_v4().to_string();
    let filename = file
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());
    let unique_filename = format!("{document_id}-{filename}");
    let storage_path = upload_key(matter_id, &unique_filename);
    let byte_size = bytes.len() as u64;

    let objects = config::build_object_store(config);
    objects.put(&storage_path, bytes).await?;

    let store = SqliteStore::new(config.database_path());
    let document = CaseDocument::new(document_id.clone(), matter_id.to_string(), filename, storage_path, byte_size);
    store.create_document(&document).await?;

    // Invalidation happens-before the processing job is enqueued (SPEC_FULL
    // §5: "Cache invalidation on upload happens-before any newly-cached
    // result for that matter").
    let (_lock, cache) = build_lock_and_cache(config).await?;
    cache.invalidate_matter(matter_id).await?;

    let conn = open_ledger(config)?;
    let job = Job::new(format!("{document_id}:process_document"), matter_id.to_string(), Some(document_id.clone()), JobType::ProcessDocument, 3);
    ledger::create(&conn, &job)?;

    println!("Uploaded document {document_id} ({} bytes), queued job {}", document.byte_size, job.id);
    Ok(())
}

pub async fn document_status(config: &PipelineConfig, id: &str) -> anyhow::Result<()> {
    let store = SqliteStore::new(config.database_path());
    let document = store.get_document(id).await?;
    println!("id:       {}", document.id);
    println!("matter:   {}", document.matter_id);
    println!("filename: {}", document.filename);
    println!("status:   {}", document.status.as_str());
    if let Some(pages) = document.page_count {
        println!("pages:    {pages}");
    }
    if let Some(confidence) = document.ocr_confidence {
        println!("ocr_confidence: {confidence:.3}");
    }
    Ok(())
}

pub async fn job_show(config: &PipelineConfig, id: &str) -> anyhow::Result<()> {
    let conn = open_ledger(config)?;
    let job = ledger::get(&conn, id)?;
    println!("id:             {}", job.id);
    println!("matter:         {}", job.matter_id);
    println!("type:           {}", job.job_type.as_str());
    println!("status:         {}", job.status.as_str());
    println!("progress:       {}%", job.progress_pct);
    println!("retry_count:    {}/{}", job.retry_count, job.max_retries);
    if let Some(stage) = &job.current_stage {
        println!("current_stage:  {stage}");
    }
    if let Some(error) = &job.error_message {
        println!("error_message:  {error}");
    }
    Ok(())
}

pub async fn worker_run(config: &PipelineConfig, concurrency: Option<usize>) -> anyhow::Result<()> {
    config.ensure_directories()?;
    let store = SqliteStore::new(config.database_path());
    store.init_schema()?;

    let store: Arc<dyn PipelineStore> = Arc::new(store);
    let objects = Arc::new(config::build_object_store(config));
    let provider = Arc::new(config::build_llm_provider(config));
    let connections = Arc::new(ConnectionManager::new());
    let (lock, cache) = build_lock_and_cache(config).await?;

    let runner = Arc::new(crate::pipeline::runner::PipelineTaskRunner::new(
        store,
        objects,
        provider,
        lock,
        cache,
        connections,
        config.database_path(),
        config.default_ocr_provider.clone(),
        config.default_embedding_provider.clone(),
        config.default_extraction_provider.clone(),
        config.job_stale_timeout_minutes,
    ));

    let pool = Arc::new(WorkerPool::new(runner, concurrency.unwrap_or(config.worker_concurrency)));
    let task_handle = format!("worker-{}", uuid::Uuid::new_v4());

    let (progress_tx, mut progress_rx) = mpsc::channel::<WorkerEvent>(256);
    tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            tracing::info!(?event, "worker event");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatch_handle = tokio::spawn(dispatch::run_dispatch_loop(
        config.database_path(),
        pool,
        task_handle,
        progress_tx,
        shutdown_rx.clone(),
    ));
    let scheduler_handle = tokio::spawn(recovery::scheduler::run_forever(config.database_path(), shutdown_rx));

    println!("Worker running (concurrency={}). Press Ctrl+C to stop.", concurrency.unwrap_or(config.worker_concurrency));
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(dispatch_handle, scheduler_handle);
    Ok(())
}

pub async fn recover_sweep_once(config: &PipelineConfig) -> anyhow::Result<()> {
    let conn = open_ledger(config)?;
    let now = chrono::Utc::now();

    let jobs_recovered = recovery::recover_stale_jobs(&conn, now, config.job_stale_timeout_minutes)?;
    println!("recover_stale_jobs:        {jobs_recovered} job(s) recovered");

    let stale_chunks = recovery::find_stale_chunks(&conn, now)?;
    for (document_id, chunk_index) in &stale_chunks {
        recovery::reset_chunk_to_pending(&conn, document_id, *chunk_index)?;
    }
    println!("recover_stale_chunks:      {} chunk(s) reset to pending", stale_chunks.len());

    let ready_to_merge = recovery::find_documents_ready_to_merge(&conn)?;
    println!("trigger_pending_merges:    {} document(s) ready to merge", ready_to_merge.len());

    let past_retention = recovery::find_chunks_past_retention(&conn, now)?;
    println!("cleanup_stale_chunks:      {} chunk row(s) past retention", past_retention.len());

    let stuck_queued = recovery::find_stuck_queued_jobs(&conn, now)?;
    for job_id in &stuck_queued {
        ledger::heartbeat(&conn, job_id, "dispatch_stuck_queued_jobs", 0)?;
    }
    println!("dispatch_stuck_queued_jobs: {} job(s) nudged", stuck_queued.len());

    Ok(())
}

fn open_ledger(config: &PipelineConfig) -> anyhow::Result<Connection> {
    let conn = Connection::open(config.database_path())?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Selects the Redis-backed lock/cache when `redis_url` is configured,
/// in-memory otherwise. A single-process deployment never needs Redis; a
/// multi-worker one must configure it, per SPEC_FULL §5.
async fn build_lock_and_cache(config: &PipelineConfig) -> anyhow::Result<(Arc<dyn ChunkLock>, Arc<dyn QueryCache>)> {
    match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let lock_conn = client.get_connection_manager().await?;
            let cache_conn = client.get_connection_manager().await?;
            Ok((Arc::new(RedisChunkLock::new(lock_conn)), Arc::new(RedisQueryCache::new(cache_conn))))
        }
        None => Ok((Arc::new(InMemoryChunkLock::new()), Arc::new(InMemoryQueryCache::new()))),
    }
}
