//! libSQL storage layer for graphloom.
//!
//! The [`Storage`] struct wraps a local libSQL database holding jobs, pages,
//! entities, relationships, and consolidation candidates. Every query is
//! scoped by job or by the caller-supplied tenant.
//!
//! Writes are serialized through one connection so that a merge transaction
//! never interleaves with writes from another job.

mod migrations;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use graphloom_shared::{
    CandidateId, CandidateResolution, CandidateScope, ConsolidationCandidate, EntityId,
    EntityRelationship, ExtractedEntity, ExtractionStatus, JobId, PageId, PipelineError, Result,
    ScrapedPage, ScrapingJob, TenantId,
};
use libsql::{Connection, Database, Row, params};
use tokio::sync::Mutex;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    write_lock: Mutex<()>,
}

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Relationship rows re-pointed at the canonical entity.
    pub relationships_repointed: u64,
    /// Relationship rows dropped as duplicates or self-loops.
    pub relationships_dropped: u64,
    /// Pending candidates dropped because they collapsed onto one entity.
    pub candidates_dropped: u64,
}

const JOB_COLUMNS: &str = "id, tenant_id, config_json, status, stage, stage_reached, \
     pages_crawled, pages_extracted, entities_extracted, errors_count, \
     consolidation_pairs_total, consolidation_pairs_evaluated, \
     consolidation_candidates_found, consolidation_auto_merged, \
     created_at, started_at, completed_at, error_message";

const PAGE_COLUMNS: &str = "id, job_id, url, canonical_url, http_status, content_type, depth, \
     raw_content, extracted_content, content_hash, fetch_attempts, fetch_error, \
     extraction_status, fetched_at";

const ENTITY_COLUMNS: &str = "id, tenant_id, job_id, source_page_id, entity_type, name, \
     normalized_name, description, properties_json, extraction_method, confidence_score, \
     embedding_json, synced_to_graph, sync_error, canonical_id, created_at";

const RELATIONSHIP_COLUMNS: &str = "id, tenant_id, job_id, source_entity_id, target_entity_id, \
     relationship_type, properties_json, confidence_score";

const CANDIDATE_COLUMNS: &str = "id, tenant_id, job_id, entity_a, entity_b, breakdown_json, \
     confidence_score, resolution, created_at, resolved_at";

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    PipelineError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Job operations
    // -----------------------------------------------------------------------

    /// Insert a new job record.
    pub async fn insert_job(&self, job: &ScrapingJob) -> Result<()> {
        let config_json = serde_json::to_string(&job.config)
            .map_err(|e| PipelineError::Storage(format!("encode job config: {e}")))?;

        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    job.id.to_string(),
                    job.tenant_id.as_str(),
                    config_json,
                    job.status.as_str(),
                    job.stage.map(|s| s.as_str()),
                    job.stage_reached.map(|s| s.as_str()),
                    job.pages_crawled as i64,
                    job.pages_extracted as i64,
                    job.entities_extracted as i64,
                    job.errors_count as i64,
                    job.consolidation_pairs_total as i64,
                    job.consolidation_pairs_evaluated as i64,
                    job.consolidation_candidates_found as i64,
                    job.consolidation_auto_merged as i64,
                    job.created_at.to_rfc3339(),
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.error_message.as_deref(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Persist a job's status, stage, counters, and timestamps.
    pub async fn update_job(&self, job: &ScrapingJob) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1, stage = ?2, stage_reached = ?3,
                   pages_crawled = ?4, pages_extracted = ?5, entities_extracted = ?6,
                   errors_count = ?7, consolidation_pairs_total = ?8,
                   consolidation_pairs_evaluated = ?9, consolidation_candidates_found = ?10,
                   consolidation_auto_merged = ?11, started_at = ?12, completed_at = ?13,
                   error_message = ?14
                 WHERE id = ?15",
                params![
                    job.status.as_str(),
                    job.stage.map(|s| s.as_str()),
                    job.stage_reached.map(|s| s.as_str()),
                    job.pages_crawled as i64,
                    job.pages_extracted as i64,
                    job.entities_extracted as i64,
                    job.errors_count as i64,
                    job.consolidation_pairs_total as i64,
                    job.consolidation_pairs_evaluated as i64,
                    job.consolidation_candidates_found as i64,
                    job.consolidation_auto_merged as i64,
                    job.started_at.map(|t| t.to_rfc3339()),
                    job.completed_at.map(|t| t.to_rfc3339()),
                    job.error_message.as_deref(),
                    job.id.to_string(),
                ],
            )
            .await
            .map_err(storage_err)?;

        if changed == 0 {
            return Err(PipelineError::not_found("job", job.id));
        }
        Ok(())
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Option<ScrapingJob>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// List a tenant's jobs, newest first.
    pub async fn list_jobs(&self, tenant_id: &TenantId) -> Result<Vec<ScrapingJob>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = ?1 ORDER BY created_at DESC, id DESC"
                ),
                params![tenant_id.as_str()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Page operations
    // -----------------------------------------------------------------------

    /// Insert a page, or refresh its fetch fields on conflict by `job_id + url`.
    pub async fn upsert_page(&self, page: &ScrapedPage) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO pages ({PAGE_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT(job_id, url) DO UPDATE SET
                       http_status = excluded.http_status,
                       content_type = excluded.content_type,
                       raw_content = excluded.raw_content,
                       content_hash = excluded.content_hash,
                       fetch_attempts = excluded.fetch_attempts,
                       fetch_error = excluded.fetch_error,
                       fetched_at = excluded.fetched_at"
                ),
                params![
                    page.id.to_string(),
                    page.job_id.to_string(),
                    page.url.as_str(),
                    page.canonical_url.as_str(),
                    page.http_status.map(i64::from),
                    page.content_type.as_deref(),
                    i64::from(page.depth),
                    page.raw_content.as_deref(),
                    page.extracted_content.as_deref(),
                    page.content_hash.as_deref(),
                    i64::from(page.fetch_attempts),
                    page.fetch_error.as_deref(),
                    page.extraction_status.as_str(),
                    page.fetched_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Record the extraction outcome of a page. Settled pages are left untouched.
    pub async fn update_page_extraction(
        &self,
        page_id: PageId,
        status: ExtractionStatus,
        extracted_content: Option<&str>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE pages SET extraction_status = ?1, extracted_content = ?2
                 WHERE id = ?3 AND extraction_status = 'pending'",
                params![status.as_str(), extracted_content, page_id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// Get a page by ID.
    pub async fn get_page(&self, id: PageId) -> Result<Option<ScrapedPage>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_page(&row)?)),
            None => Ok(None),
        }
    }

    /// List all pages of a job in crawl order.
    pub async fn list_pages(&self, job_id: JobId) -> Result<Vec<ScrapedPage>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PAGE_COLUMNS} FROM pages WHERE job_id = ?1 ORDER BY depth, id"),
                params![job_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_page(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Entity operations
    // -----------------------------------------------------------------------

    /// Insert a new entity.
    pub async fn insert_entity(&self, entity: &ExtractedEntity) -> Result<()> {
        let properties = encode_json(&entity.properties)?;
        let embedding = entity.embedding.as_ref().map(encode_json).transpose()?;

        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO entities ({ENTITY_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    entity.id.to_string(),
                    entity.tenant_id.as_str(),
                    entity.job_id.to_string(),
                    entity.source_page_id.to_string(),
                    entity.entity_type.as_str(),
                    entity.name.as_str(),
                    entity.normalized_name.as_str(),
                    entity.description.as_deref(),
                    properties,
                    entity.extraction_method.as_str(),
                    entity.confidence_score,
                    embedding,
                    i64::from(entity.synced_to_graph),
                    entity.sync_error.as_deref(),
                    entity.canonical_id.map(|id| id.to_string()),
                    entity.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get an entity by ID.
    pub async fn get_entity(&self, id: EntityId) -> Result<Option<ExtractedEntity>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_entity(&row)?)),
            None => Ok(None),
        }
    }

    /// List every entity of a job, merged ones included.
    pub async fn list_entities(&self, job_id: JobId) -> Result<Vec<ExtractedEntity>> {
        self.query_entities(
            &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE job_id = ?1 ORDER BY id"),
            job_id,
        )
        .await
    }

    /// List a job's entities that have not been merged away.
    pub async fn list_active_entities(&self, job_id: JobId) -> Result<Vec<ExtractedEntity>> {
        self.query_entities(
            &format!(
                "SELECT {ENTITY_COLUMNS} FROM entities
                 WHERE job_id = ?1 AND canonical_id IS NULL ORDER BY id"
            ),
            job_id,
        )
        .await
    }

    async fn query_entities(&self, sql: &str, job_id: JobId) -> Result<Vec<ExtractedEntity>> {
        let mut rows = self
            .conn
            .query(sql, params![job_id.to_string()])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_entity(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Relationship operations
    // -----------------------------------------------------------------------

    /// Insert a relationship. Returns `false` if the (source, target, type)
    /// edge already exists or the edge is a self-loop.
    pub async fn insert_relationship(&self, rel: &EntityRelationship) -> Result<bool> {
        if rel.source_entity_id == rel.target_entity_id {
            return Ok(false);
        }
        let properties = encode_json(&rel.properties)?;

        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO relationships ({RELATIONSHIP_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(source_entity_id, target_entity_id, relationship_type) DO NOTHING"
                ),
                params![
                    rel.id.to_string(),
                    rel.tenant_id.as_str(),
                    rel.job_id.to_string(),
                    rel.source_entity_id.to_string(),
                    rel.target_entity_id.to_string(),
                    rel.relationship_type.as_str(),
                    properties,
                    rel.confidence_score,
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// List all relationships of a job.
    pub async fn list_relationships(&self, job_id: JobId) -> Result<Vec<EntityRelationship>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RELATIONSHIP_COLUMNS} FROM relationships WHERE job_id = ?1 ORDER BY id"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_relationship(&row)?);
        }
        Ok(results)
    }

    /// Count relationships touching an entity at either end.
    pub async fn count_relationships_touching(&self, entity: EntityId) -> Result<u64> {
        let id = entity.to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM relationships
                 WHERE source_entity_id = ?1 OR target_entity_id = ?1",
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(int(&row, 0)? as u64),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Consolidation candidates
    // -----------------------------------------------------------------------

    /// Insert a candidate unless the unordered pair already has one.
    /// Returns whether a row was written.
    pub async fn insert_candidate(&self, candidate: &ConsolidationCandidate) -> Result<bool> {
        let breakdown = encode_json(&candidate.breakdown)?;
        let (a, b) = candidate.pair_key();

        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO consolidation_candidates ({CANDIDATE_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT DO NOTHING"
                ),
                params![
                    candidate.id.to_string(),
                    candidate.tenant_id.as_str(),
                    candidate.job_id.to_string(),
                    a.to_string(),
                    b.to_string(),
                    breakdown,
                    candidate.confidence_score,
                    candidate.resolution.as_str(),
                    candidate.created_at.to_rfc3339(),
                    candidate.resolved_at.map(|t| t.to_rfc3339()),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// Get a candidate by ID.
    pub async fn get_candidate(&self, id: CandidateId) -> Result<Option<ConsolidationCandidate>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CANDIDATE_COLUMNS} FROM consolidation_candidates WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_candidate(&row)?)),
            None => Ok(None),
        }
    }

    /// List candidates for a job or tenant, highest score first.
    pub async fn list_candidates(
        &self,
        scope: &CandidateScope,
        resolution: Option<CandidateResolution>,
    ) -> Result<Vec<ConsolidationCandidate>> {
        let (column, key) = match scope {
            CandidateScope::Job(id) => ("job_id", id.to_string()),
            CandidateScope::Tenant(id) => ("tenant_id", id.as_str().to_string()),
        };
        let filter = resolution.map(|r| r.as_str());

        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CANDIDATE_COLUMNS} FROM consolidation_candidates
                     WHERE {column} = ?1 AND (?2 IS NULL OR resolution = ?2)
                     ORDER BY confidence_score DESC, id"
                ),
                params![key, filter],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_candidate(&row)?);
        }
        Ok(results)
    }

    /// Resolve a pending candidate. Returns `false` if it was already resolved.
    pub async fn resolve_candidate(
        &self,
        id: CandidateId,
        resolution: CandidateResolution,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                "UPDATE consolidation_candidates SET resolution = ?1, resolved_at = ?2
                 WHERE id = ?3 AND resolution = 'pending'",
                params![resolution.as_str(), Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Merge `absorbed` into `canonical` in one transaction.
    ///
    /// `canonical` carries the already-combined description and properties.
    /// Afterwards no relationship or pending candidate references `absorbed`,
    /// and every entity that redirected to it redirects to `canonical`.
    pub async fn merge_entities(
        &self,
        absorbed: EntityId,
        canonical: &ExtractedEntity,
    ) -> Result<MergeStats> {
        let stats = self.merge_in_transaction(absorbed, canonical, None).await?;
        Ok(stats.unwrap_or_default())
    }

    /// Confirm a pending candidate and merge its pair in the same transaction.
    ///
    /// Returns `None` without touching anything when the candidate is no
    /// longer pending. A failed merge leaves the candidate pending.
    pub async fn confirm_candidate_merge(
        &self,
        candidate: CandidateId,
        absorbed: EntityId,
        canonical: &ExtractedEntity,
    ) -> Result<Option<MergeStats>> {
        self.merge_in_transaction(absorbed, canonical, Some(candidate))
            .await
    }

    async fn merge_in_transaction(
        &self,
        absorbed: EntityId,
        canonical: &ExtractedEntity,
        confirm: Option<CandidateId>,
    ) -> Result<Option<MergeStats>> {
        if absorbed == canonical.id {
            return Err(PipelineError::validation("cannot merge an entity into itself"));
        }
        let properties = encode_json(&canonical.properties)?;

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        let confirmed = match confirm {
            Some(candidate) => confirm_pending(&tx, candidate).await,
            None => Ok(true),
        };
        let outcome = match confirmed {
            Ok(true) => merge_statements(
                &tx,
                &absorbed.to_string(),
                &canonical.id.to_string(),
                canonical.description.as_deref(),
                &properties,
            )
            .await
            .map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Some(stats)) => {
                tx.commit().await.map_err(storage_err)?;
                tracing::debug!(
                    absorbed = %absorbed,
                    canonical = %canonical.id,
                    repointed = stats.relationships_repointed,
                    "entities merged"
                );
                Ok(Some(stats))
            }
            Ok(None) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "merge rollback failed");
                }
                Ok(None)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "merge rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn confirm_pending(conn: &Connection, candidate: CandidateId) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE consolidation_candidates SET resolution = 'confirmed', resolved_at = ?1
             WHERE id = ?2 AND resolution = 'pending'",
            params![Utc::now().to_rfc3339(), candidate.to_string()],
        )
        .await
        .map_err(storage_err)?;
    Ok(changed > 0)
}

async fn merge_statements(
    conn: &Connection,
    absorbed: &str,
    canonical: &str,
    description: Option<&str>,
    properties: &str,
) -> Result<MergeStats> {
    let mut stats = MergeStats::default();

    conn.execute(
        "UPDATE entities SET description = ?1, properties_json = ?2, canonical_id = NULL
         WHERE id = ?3",
        params![description, properties, canonical],
    )
    .await
    .map_err(storage_err)?;

    // Redirect the absorbed entity and flatten anything that pointed at it.
    conn.execute(
        "UPDATE entities SET canonical_id = ?1 WHERE id = ?2 OR canonical_id = ?2",
        params![canonical, absorbed],
    )
    .await
    .map_err(storage_err)?;

    stats.relationships_repointed += conn
        .execute(
            "UPDATE OR IGNORE relationships SET source_entity_id = ?1 WHERE source_entity_id = ?2",
            params![canonical, absorbed],
        )
        .await
        .map_err(storage_err)?;
    stats.relationships_repointed += conn
        .execute(
            "UPDATE OR IGNORE relationships SET target_entity_id = ?1 WHERE target_entity_id = ?2",
            params![canonical, absorbed],
        )
        .await
        .map_err(storage_err)?;

    // Rows left behind collided with an existing edge; self-loops are new.
    stats.relationships_dropped += conn
        .execute(
            "DELETE FROM relationships
             WHERE source_entity_id = ?1 OR target_entity_id = ?1
                OR source_entity_id = target_entity_id",
            params![absorbed],
        )
        .await
        .map_err(storage_err)?;

    conn.execute(
        "UPDATE OR IGNORE consolidation_candidates
         SET entity_a = min(?1, entity_b), entity_b = max(?1, entity_b)
         WHERE entity_a = ?2 AND resolution = 'pending'",
        params![canonical, absorbed],
    )
    .await
    .map_err(storage_err)?;
    conn.execute(
        "UPDATE OR IGNORE consolidation_candidates
         SET entity_a = min(entity_a, ?1), entity_b = max(entity_a, ?1)
         WHERE entity_b = ?2 AND resolution = 'pending'",
        params![canonical, absorbed],
    )
    .await
    .map_err(storage_err)?;

    stats.candidates_dropped += conn
        .execute(
            "DELETE FROM consolidation_candidates
             WHERE resolution = 'pending'
               AND (entity_a = ?1 OR entity_b = ?1 OR entity_a = entity_b)",
            params![absorbed],
        )
        .await
        .map_err(storage_err)?;

    Ok(stats)
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn storage_err(e: libsql::Error) -> PipelineError {
    PipelineError::Storage(e.to_string())
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| PipelineError::Storage(format!("encode json: {e}")))
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| PipelineError::Storage(format!("invalid {what}: {e}")))
}

fn text(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(storage_err)
}

fn opt_text(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn int(row: &Row, idx: i32) -> Result<i64> {
    row.get::<i64>(idx).map_err(storage_err)
}

fn real(row: &Row, idx: i32) -> Result<f64> {
    row.get::<f64>(idx).map_err(storage_err)
}

fn parse<T>(raw: &str, what: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| PipelineError::Storage(format!("invalid {what} {raw:?}: {e}")))
}

fn time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Storage(format!("invalid date: {e}")))
}

fn opt_time(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    opt_text(row, idx).as_deref().map(time).transpose()
}

fn row_to_job(row: &Row) -> Result<ScrapingJob> {
    Ok(ScrapingJob {
        id: parse(&text(row, 0)?, "job id")?,
        tenant_id: TenantId::new(text(row, 1)?),
        config: decode_json(&text(row, 2)?, "job config")?,
        status: parse(&text(row, 3)?, "job status")?,
        stage: opt_text(row, 4)
            .map(|s| parse(&s, "job stage"))
            .transpose()?,
        stage_reached: opt_text(row, 5)
            .map(|s| parse(&s, "job stage"))
            .transpose()?,
        pages_crawled: int(row, 6)? as u64,
        pages_extracted: int(row, 7)? as u64,
        entities_extracted: int(row, 8)? as u64,
        errors_count: int(row, 9)? as u64,
        consolidation_pairs_total: int(row, 10)? as u64,
        consolidation_pairs_evaluated: int(row, 11)? as u64,
        consolidation_candidates_found: int(row, 12)? as u64,
        consolidation_auto_merged: int(row, 13)? as u64,
        created_at: time(&text(row, 14)?)?,
        started_at: opt_time(row, 15)?,
        completed_at: opt_time(row, 16)?,
        error_message: opt_text(row, 17),
    })
}

fn row_to_page(row: &Row) -> Result<ScrapedPage> {
    Ok(ScrapedPage {
        id: parse(&text(row, 0)?, "page id")?,
        job_id: parse(&text(row, 1)?, "job id")?,
        url: text(row, 2)?,
        canonical_url: text(row, 3)?,
        http_status: row.get::<i64>(4).ok().map(|v| v as u16),
        content_type: opt_text(row, 5),
        depth: int(row, 6)? as u32,
        raw_content: opt_text(row, 7),
        extracted_content: opt_text(row, 8),
        content_hash: opt_text(row, 9),
        fetch_attempts: int(row, 10)? as u32,
        fetch_error: opt_text(row, 11),
        extraction_status: parse(&text(row, 12)?, "extraction status")?,
        fetched_at: time(&text(row, 13)?)?,
    })
}

fn row_to_entity(row: &Row) -> Result<ExtractedEntity> {
    Ok(ExtractedEntity {
        id: parse(&text(row, 0)?, "entity id")?,
        tenant_id: TenantId::new(text(row, 1)?),
        job_id: parse(&text(row, 2)?, "job id")?,
        source_page_id: parse(&text(row, 3)?, "page id")?,
        entity_type: parse(&text(row, 4)?, "entity type")?,
        name: text(row, 5)?,
        normalized_name: text(row, 6)?,
        description: opt_text(row, 7),
        properties: decode_json(&text(row, 8)?, "entity properties")?,
        extraction_method: parse(&text(row, 9)?, "extraction method")?,
        confidence_score: real(row, 10)?,
        embedding: opt_text(row, 11)
            .map(|raw| decode_json(&raw, "embedding"))
            .transpose()?,
        synced_to_graph: int(row, 12)? != 0,
        sync_error: opt_text(row, 13),
        canonical_id: opt_text(row, 14)
            .map(|s| parse(&s, "canonical id"))
            .transpose()?,
        created_at: time(&text(row, 15)?)?,
    })
}

fn row_to_relationship(row: &Row) -> Result<EntityRelationship> {
    Ok(EntityRelationship {
        id: parse(&text(row, 0)?, "relationship id")?,
        tenant_id: TenantId::new(text(row, 1)?),
        job_id: parse(&text(row, 2)?, "job id")?,
        source_entity_id: parse(&text(row, 3)?, "entity id")?,
        target_entity_id: parse(&text(row, 4)?, "entity id")?,
        relationship_type: text(row, 5)?,
        properties: decode_json(&text(row, 6)?, "relationship properties")?,
        confidence_score: real(row, 7)?,
    })
}

fn row_to_candidate(row: &Row) -> Result<ConsolidationCandidate> {
    Ok(ConsolidationCandidate {
        id: parse(&text(row, 0)?, "candidate id")?,
        tenant_id: TenantId::new(text(row, 1)?),
        job_id: parse(&text(row, 2)?, "job id")?,
        entity_a: parse(&text(row, 3)?, "entity id")?,
        entity_b: parse(&text(row, 4)?, "entity id")?,
        breakdown: decode_json(&text(row, 5)?, "similarity breakdown")?,
        confidence_score: real(row, 6)?,
        resolution: parse(&text(row, 7)?, "resolution")?,
        created_at: time(&text(row, 8)?)?,
        resolved_at: opt_time(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphloom_shared::{
        EntityType, ExtractionMethod, JobConfig, JobStage, JobStatus, RelationshipId,
        SimilarityBreakdown, normalize_name,
    };
    use url::Url;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("gl_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn tenant() -> TenantId {
        TenantId::new("tenant-a")
    }

    async fn seeded_job(storage: &Storage) -> ScrapingJob {
        let config = JobConfig::new(Url::parse("https://example.com/").unwrap());
        let job = ScrapingJob::new(tenant(), config);
        storage.insert_job(&job).await.expect("insert job");
        job
    }

    fn page(job: &ScrapingJob, url: &str) -> ScrapedPage {
        ScrapedPage {
            id: PageId::new(),
            job_id: job.id,
            url: url.into(),
            canonical_url: url.into(),
            http_status: Some(200),
            content_type: Some("text/html".into()),
            depth: 0,
            raw_content: Some("<html></html>".into()),
            extracted_content: None,
            content_hash: Some("abc".into()),
            fetch_attempts: 1,
            fetch_error: None,
            extraction_status: ExtractionStatus::Pending,
            fetched_at: Utc::now(),
        }
    }

    fn entity(job: &ScrapingJob, page: &ScrapedPage, name: &str) -> ExtractedEntity {
        ExtractedEntity {
            id: EntityId::new(),
            tenant_id: tenant(),
            job_id: job.id,
            source_page_id: page.id,
            entity_type: EntityType::Person,
            name: name.into(),
            normalized_name: normalize_name(name),
            description: None,
            properties: serde_json::Map::new(),
            extraction_method: ExtractionMethod::SchemaOrg,
            confidence_score: 0.9,
            embedding: None,
            synced_to_graph: false,
            sync_error: None,
            canonical_id: None,
            created_at: Utc::now(),
        }
    }

    fn rel(job: &ScrapingJob, from: EntityId, to: EntityId, kind: &str) -> EntityRelationship {
        EntityRelationship {
            id: RelationshipId::new(),
            tenant_id: tenant(),
            job_id: job.id,
            source_entity_id: from,
            target_entity_id: to,
            relationship_type: kind.into(),
            properties: serde_json::Map::new(),
            confidence_score: 0.9,
        }
    }

    fn candidate(job: &ScrapingJob, a: EntityId, b: EntityId) -> ConsolidationCandidate {
        ConsolidationCandidate {
            id: CandidateId::new(),
            tenant_id: tenant(),
            job_id: job.id,
            entity_a: a,
            entity_b: b,
            breakdown: SimilarityBreakdown::default(),
            confidence_score: 0.8,
            resolution: CandidateResolution::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("gl_test_{}.db", Uuid::now_v7()));
        let first = Storage::open(&tmp).await.expect("first open");
        drop(first);
        let second = Storage::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn job_roundtrip_and_update() {
        let storage = test_storage().await;
        let mut job = seeded_job(&storage).await;

        job.transition(JobStatus::Queued).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.enter_stage(JobStage::Crawling).unwrap();
        job.pages_crawled = 7;
        job.errors_count = 2;
        storage.update_job(&job).await.expect("update job");

        let loaded = storage.get_job(job.id).await.unwrap().expect("job exists");
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.stage, Some(JobStage::Crawling));
        assert_eq!(loaded.pages_crawled, 7);
        assert_eq!(loaded.errors_count, 2);
        assert_eq!(loaded.config, job.config);
        assert!(loaded.started_at.is_some());

        let jobs = storage.list_jobs(&tenant()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(storage.list_jobs(&TenantId::new("other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_missing_job_is_not_found() {
        let storage = test_storage().await;
        let config = JobConfig::new(Url::parse("https://example.com/").unwrap());
        let job = ScrapingJob::new(tenant(), config);
        let err = storage.update_job(&job).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { kind: "job", .. }));
    }

    #[tokio::test]
    async fn page_upsert_and_extraction_is_final() {
        let storage = test_storage().await;
        let job = seeded_job(&storage).await;
        let p = page(&job, "https://example.com/a");
        storage.upsert_page(&p).await.unwrap();
        storage.upsert_page(&p).await.unwrap();
        assert_eq!(storage.list_pages(job.id).await.unwrap().len(), 1);

        let changed = storage
            .update_page_extraction(p.id, ExtractionStatus::Completed, Some("text"))
            .await
            .unwrap();
        assert!(changed);

        let again = storage
            .update_page_extraction(p.id, ExtractionStatus::Failed, None)
            .await
            .unwrap();
        assert!(!again);

        let loaded = storage.get_page(p.id).await.unwrap().unwrap();
        assert_eq!(loaded.extraction_status, ExtractionStatus::Completed);
        assert_eq!(loaded.extracted_content.as_deref(), Some("text"));
    }

    #[tokio::test]
    async fn entity_roundtrip_with_embedding() {
        let storage = test_storage().await;
        let job = seeded_job(&storage).await;
        let p = page(&job, "https://example.com/");
        storage.upsert_page(&p).await.unwrap();

        let mut e = entity(&job, &p, "Ada Lovelace");
        e.embedding = Some(vec![0.1, 0.2, 0.3]);
        e.properties
            .insert("birthDate".into(), serde_json::json!("1815-12-10"));
        storage.insert_entity(&e).await.unwrap();

        let loaded = storage.get_entity(e.id).await.unwrap().unwrap();
        assert_eq!(loaded.normalized_name, "ada lovelace");
        assert_eq!(loaded.embedding.as_deref(), Some(&[0.1f32, 0.2, 0.3][..]));
        assert_eq!(loaded.properties["birthDate"], "1815-12-10");
    }

    #[tokio::test]
    async fn relationships_are_unique_and_skip_self_loops() {
        let storage = test_storage().await;
        let job = seeded_job(&storage).await;
        let (a, b) = (EntityId::new(), EntityId::new());

        assert!(storage.insert_relationship(&rel(&job, a, b, "knows")).await.unwrap());
        assert!(!storage.insert_relationship(&rel(&job, a, b, "knows")).await.unwrap());
        assert!(storage.insert_relationship(&rel(&job, b, a, "knows")).await.unwrap());
        assert!(!storage.insert_relationship(&rel(&job, a, a, "knows")).await.unwrap());
        assert_eq!(storage.list_relationships(job.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn candidate_pair_is_unordered_and_resolves_once() {
        let storage = test_storage().await;
        let job = seeded_job(&storage).await;
        let (a, b) = (EntityId::new(), EntityId::new());

        let c = candidate(&job, b, a);
        assert!(storage.insert_candidate(&c).await.unwrap());
        assert!(!storage.insert_candidate(&candidate(&job, a, b)).await.unwrap());

        let pending = storage
            .list_candidates(&CandidateScope::Tenant(tenant()), Some(CandidateResolution::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_a, a.min(b));

        assert!(storage.resolve_candidate(c.id, CandidateResolution::Rejected).await.unwrap());
        assert!(!storage.resolve_candidate(c.id, CandidateResolution::Confirmed).await.unwrap());

        let loaded = storage.get_candidate(c.id).await.unwrap().unwrap();
        assert_eq!(loaded.resolution, CandidateResolution::Rejected);
        assert!(loaded.resolved_at.is_some());
    }

    #[tokio::test]
    async fn merge_repoints_everything() {
        let storage = test_storage().await;
        let job = seeded_job(&storage).await;
        let p = page(&job, "https://example.com/");
        storage.upsert_page(&p).await.unwrap();

        let x = entity(&job, &p, "Jon Smith");
        let y = entity(&job, &p, "John Smith");
        let org = entity(&job, &p, "Acme");
        let older = entity(&job, &p, "J. Smith");
        for e in [&x, &y, &org, &older] {
            storage.insert_entity(e).await.unwrap();
        }

        // x -> org duplicates y -> org after the merge; x <-> y becomes a self-loop.
        storage.insert_relationship(&rel(&job, x.id, org.id, "worksFor")).await.unwrap();
        storage.insert_relationship(&rel(&job, y.id, org.id, "worksFor")).await.unwrap();
        storage.insert_relationship(&rel(&job, org.id, x.id, "employs")).await.unwrap();
        storage.insert_relationship(&rel(&job, x.id, y.id, "same_page")).await.unwrap();

        // An earlier merge redirected `older` to x.
        storage.merge_entities(older.id, &x).await.unwrap();

        storage.insert_candidate(&candidate(&job, x.id, org.id)).await.unwrap();
        storage.insert_candidate(&candidate(&job, x.id, y.id)).await.unwrap();

        let mut canonical = y.clone();
        canonical
            .properties
            .insert("aliases".into(), serde_json::json!(["Jon Smith"]));
        let stats = storage.merge_entities(x.id, &canonical).await.unwrap();
        assert!(stats.relationships_dropped >= 2);
        assert_eq!(stats.candidates_dropped, 1);

        assert_eq!(storage.count_relationships_touching(x.id).await.unwrap(), 0);
        let rels = storage.list_relationships(job.id).await.unwrap();
        assert_eq!(rels.len(), 2);
        assert!(rels.iter().all(|r| r.source_entity_id != r.target_entity_id));

        let x_loaded = storage.get_entity(x.id).await.unwrap().unwrap();
        assert_eq!(x_loaded.canonical_id, Some(y.id));
        let older_loaded = storage.get_entity(older.id).await.unwrap().unwrap();
        assert_eq!(older_loaded.canonical_id, Some(y.id));

        let y_loaded = storage.get_entity(y.id).await.unwrap().unwrap();
        assert_eq!(y_loaded.properties["aliases"][0], "Jon Smith");

        let pending = storage
            .list_candidates(&CandidateScope::Job(job.id), Some(CandidateResolution::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].pair_key(), ordered(y.id, org.id));

        let active = storage.list_active_entities(job.id).await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn confirmed_merge_resolves_its_candidate_only_once() {
        let storage = test_storage().await;
        let job = seeded_job(&storage).await;
        let p = page(&job, "https://example.com/");
        storage.upsert_page(&p).await.unwrap();

        let x = entity(&job, &p, "Jon Smith");
        let y = entity(&job, &p, "John Smith");
        let z = entity(&job, &p, "Johnny Smith");
        for e in [&x, &y, &z] {
            storage.insert_entity(e).await.unwrap();
        }
        let c = candidate(&job, x.id, y.id);
        storage.insert_candidate(&c).await.unwrap();

        let stats = storage.confirm_candidate_merge(c.id, x.id, &y).await.unwrap();
        assert!(stats.is_some());
        let loaded = storage.get_candidate(c.id).await.unwrap().unwrap();
        assert_eq!(loaded.resolution, CandidateResolution::Confirmed);
        assert_eq!(loaded.pair_key(), ordered(x.id, y.id));
        let x_loaded = storage.get_entity(x.id).await.unwrap().unwrap();
        assert_eq!(x_loaded.canonical_id, Some(y.id));

        // Already confirmed, so nothing else is merged.
        let again = storage.confirm_candidate_merge(c.id, z.id, &y).await.unwrap();
        assert!(again.is_none());
        let z_loaded = storage.get_entity(z.id).await.unwrap().unwrap();
        assert_eq!(z_loaded.canonical_id, None);
    }

    fn ordered(a: EntityId, b: EntityId) -> (EntityId, EntityId) {
        graphloom_shared::types::ordered_pair(a, b)
    }
}
