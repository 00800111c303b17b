//! SQL migration definitions for the graphloom database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: jobs, pages, entities, relationships, candidates",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Scraping jobs and their counters
CREATE TABLE IF NOT EXISTS jobs (
    id                             TEXT PRIMARY KEY,
    tenant_id                      TEXT NOT NULL,
    config_json                    TEXT NOT NULL,
    status                         TEXT NOT NULL,
    stage                          TEXT,
    stage_reached                  TEXT,
    pages_crawled                  INTEGER NOT NULL DEFAULT 0,
    pages_extracted                INTEGER NOT NULL DEFAULT 0,
    entities_extracted             INTEGER NOT NULL DEFAULT 0,
    errors_count                   INTEGER NOT NULL DEFAULT 0,
    consolidation_pairs_total      INTEGER NOT NULL DEFAULT 0,
    consolidation_pairs_evaluated  INTEGER NOT NULL DEFAULT 0,
    consolidation_candidates_found INTEGER NOT NULL DEFAULT 0,
    consolidation_auto_merged      INTEGER NOT NULL DEFAULT 0,
    created_at                     TEXT NOT NULL,
    started_at                     TEXT,
    completed_at                   TEXT,
    error_message                  TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON jobs(tenant_id);

-- Fetched (or permanently failed) pages
CREATE TABLE IF NOT EXISTS pages (
    id                TEXT PRIMARY KEY,
    job_id            TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    url               TEXT NOT NULL,
    canonical_url     TEXT NOT NULL,
    http_status       INTEGER,
    content_type      TEXT,
    depth             INTEGER NOT NULL,
    raw_content       TEXT,
    extracted_content TEXT,
    content_hash      TEXT,
    fetch_attempts    INTEGER NOT NULL DEFAULT 0,
    fetch_error       TEXT,
    extraction_status TEXT NOT NULL,
    fetched_at        TEXT NOT NULL,
    UNIQUE(job_id, url)
);

CREATE INDEX IF NOT EXISTS idx_pages_job ON pages(job_id);

-- Extracted entities; merged entities redirect through canonical_id
CREATE TABLE IF NOT EXISTS entities (
    id                TEXT PRIMARY KEY,
    tenant_id         TEXT NOT NULL,
    job_id            TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    source_page_id    TEXT NOT NULL REFERENCES pages(id) ON DELETE CASCADE,
    entity_type       TEXT NOT NULL,
    name              TEXT NOT NULL,
    normalized_name   TEXT NOT NULL,
    description       TEXT,
    properties_json   TEXT NOT NULL DEFAULT '{}',
    extraction_method TEXT NOT NULL,
    confidence_score  REAL NOT NULL,
    embedding_json    TEXT,
    synced_to_graph   INTEGER NOT NULL DEFAULT 0,
    sync_error        TEXT,
    canonical_id      TEXT,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_lookup
    ON entities(tenant_id, normalized_name, entity_type);
CREATE INDEX IF NOT EXISTS idx_entities_job ON entities(job_id);
CREATE INDEX IF NOT EXISTS idx_entities_canonical ON entities(canonical_id);

-- Directed edges between entities
CREATE TABLE IF NOT EXISTS relationships (
    id                TEXT PRIMARY KEY,
    tenant_id         TEXT NOT NULL,
    job_id            TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    source_entity_id  TEXT NOT NULL,
    target_entity_id  TEXT NOT NULL,
    relationship_type TEXT NOT NULL,
    properties_json   TEXT NOT NULL DEFAULT '{}',
    confidence_score  REAL NOT NULL,
    UNIQUE(source_entity_id, target_entity_id, relationship_type)
);

CREATE INDEX IF NOT EXISTS idx_relationships_job ON relationships(job_id);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_entity_id);

-- Scored entity pairs
CREATE TABLE IF NOT EXISTS consolidation_candidates (
    id               TEXT PRIMARY KEY,
    tenant_id        TEXT NOT NULL,
    job_id           TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    entity_a         TEXT NOT NULL,
    entity_b         TEXT NOT NULL,
    breakdown_json   TEXT NOT NULL,
    confidence_score REAL NOT NULL,
    resolution       TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    resolved_at      TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_candidates_pair
    ON consolidation_candidates(min(entity_a, entity_b), max(entity_a, entity_b));
CREATE INDEX IF NOT EXISTS idx_candidates_tenant
    ON consolidation_candidates(tenant_id, resolution);
CREATE INDEX IF NOT EXISTS idx_candidates_job ON consolidation_candidates(job_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
