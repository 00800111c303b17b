//! The consolidation pass over one job's entity pool.
//!
//! Scoring is CPU-bound and runs in shards on the blocking pool. Merges are
//! applied afterwards on the calling task, highest confidence first, against
//! a union-find view of which entity each id now resolves to.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{self, JoinSet};
use tracing::{debug, info, instrument, warn};

use graphloom_shared::{
    CandidateId, CandidateResolution, Checkpoint, ConsolidationCandidate, ConsolidationConfig,
    EntityId, EntityRelationship, ExtractedEntity, JobControl, JobId, PageId, RelationshipId,
    Result, SimilarityBreakdown, TenantId, checkpoint,
};
use graphloom_storage::Storage;

use crate::blocking::blocked_pairs;
use crate::decision::{Decision, combined_confidence, decide};
use crate::merge::{absorb, choose_canonical};
use crate::similarity::{NeighborIndex, score};

/// Relationship type of inferred page co-occurrence edges.
pub const COOCCURRENCE_RELATIONSHIP: &str = "same_page";

const COOCCURRENCE_CONFIDENCE: f64 = 0.5;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A pair that cleared the candidate threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPair {
    pub a: EntityId,
    pub b: EntityId,
    pub breakdown: SimilarityBreakdown,
    pub confidence: f64,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed,
    Cancelled,
}

/// Emitted by [`ConsolidationPass::apply`] for every effective action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyEvent {
    AutoMerged {
        canonical: EntityId,
        absorbed: EntityId,
    },
    CandidateFound(CandidateId),
}

#[derive(Debug, Default)]
struct ShardResult {
    evaluated: u64,
    errors: u64,
    kept: Vec<ScoredPair>,
}

// ---------------------------------------------------------------------------
// ConsolidationPass
// ---------------------------------------------------------------------------

pub struct ConsolidationPass {
    tenant_id: TenantId,
    job_id: JobId,
    config: Arc<ConsolidationConfig>,
    entities: Arc<Vec<ExtractedEntity>>,
    graph: Arc<NeighborIndex>,
    pairs: Vec<(usize, usize)>,
    scored: Vec<ScoredPair>,
    pair_errors: u64,
    /// Working copies of surviving entities, keyed by id.
    live: HashMap<EntityId, ExtractedEntity>,
    /// Union-find parent links; absent means the entity is a root.
    parent: HashMap<EntityId, EntityId>,
}

impl ConsolidationPass {
    /// Prepare a pass. Entities already merged away are ignored.
    pub fn new(
        tenant_id: TenantId,
        job_id: JobId,
        entities: Vec<ExtractedEntity>,
        relationships: &[EntityRelationship],
        config: ConsolidationConfig,
    ) -> Self {
        let entities: Vec<ExtractedEntity> =
            entities.into_iter().filter(|e| !e.is_merged()).collect();
        let pairs = blocked_pairs(&entities);
        let live = entities.iter().map(|e| (e.id, e.clone())).collect();

        Self {
            tenant_id,
            job_id,
            config: Arc::new(config),
            entities: Arc::new(entities),
            graph: Arc::new(NeighborIndex::from_relationships(relationships)),
            pairs,
            scored: Vec::new(),
            pair_errors: 0,
            live,
            parent: HashMap::new(),
        }
    }

    /// Pairs left after blocking.
    pub fn pairs_total(&self) -> u64 {
        self.pairs.len() as u64
    }

    /// Pairs skipped because scoring them failed.
    pub fn pair_errors(&self) -> u64 {
        self.pair_errors
    }

    /// Pairs at or above the candidate threshold, best first.
    pub fn scored(&self) -> &[ScoredPair] {
        &self.scored
    }

    /// Score every blocked pair across `shards` blocking tasks.
    ///
    /// `on_evaluated` receives the number of pairs finished by each shard.
    #[instrument(skip_all, fields(job_id = %self.job_id, pairs = self.pairs.len()))]
    pub async fn score(
        &mut self,
        shards: usize,
        control: &mut watch::Receiver<JobControl>,
        on_evaluated: impl FnMut(u64),
    ) -> PassOutcome {
        if checkpoint(control).await == Checkpoint::Cancelled {
            return PassOutcome::Cancelled;
        }
        if self.pairs.is_empty() {
            return PassOutcome::Completed;
        }

        let chunk = self.pairs.len().div_ceil(shards.max(1));
        let mut running: JoinSet<ShardResult> = JoinSet::new();
        let mut sizes = HashMap::new();
        for slice in self.pairs.chunks(chunk) {
            let slice = slice.to_vec();
            let size = slice.len() as u64;
            let entities = Arc::clone(&self.entities);
            let graph = Arc::clone(&self.graph);
            let config = Arc::clone(&self.config);
            let handle =
                running.spawn_blocking(move || score_shard(&slice, &entities, &graph, &config));
            sizes.insert(handle.id(), size);
        }

        self.collect_shards(running, sizes, control, on_evaluated)
            .await
    }

    /// Gather shard results. A shard that dies counts all of its pairs as
    /// evaluated and failed.
    async fn collect_shards(
        &mut self,
        mut running: JoinSet<ShardResult>,
        mut sizes: HashMap<task::Id, u64>,
        control: &mut watch::Receiver<JobControl>,
        mut on_evaluated: impl FnMut(u64),
    ) -> PassOutcome {
        loop {
            tokio::select! {
                changed = control.changed() => {
                    if changed.is_err() || *control.borrow() == JobControl::Cancel {
                        running.abort_all();
                        info!("consolidation scoring cancelled");
                        return PassOutcome::Cancelled;
                    }
                }
                joined = running.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((id, shard)) => {
                            sizes.remove(&id);
                            on_evaluated(shard.evaluated);
                            self.pair_errors += shard.errors;
                            self.scored.extend(shard.kept);
                        }
                        Err(e) => {
                            let lost = sizes.remove(&e.id()).unwrap_or_default();
                            warn!(error = %e, pairs = lost, "scoring shard failed");
                            on_evaluated(lost);
                            self.pair_errors += lost;
                        }
                    }
                }
            }
        }

        self.scored.sort_by(|x, y| {
            y.confidence
                .total_cmp(&x.confidence)
                .then_with(|| (x.a, x.b).cmp(&(y.a, y.b)))
        });
        info!(
            kept = self.scored.len(),
            errors = self.pair_errors,
            "consolidation scoring complete"
        );
        PassOutcome::Completed
    }

    /// Apply merge decisions in descending confidence order.
    #[instrument(skip_all, fields(job_id = %self.job_id, scored = self.scored.len()))]
    pub async fn apply(
        &mut self,
        storage: &Storage,
        control: &mut watch::Receiver<JobControl>,
        mut on_event: impl FnMut(ApplyEvent),
    ) -> Result<PassOutcome> {
        let scored = std::mem::take(&mut self.scored);
        for pair in &scored {
            if checkpoint(control).await == Checkpoint::Cancelled {
                info!("consolidation merges cancelled");
                return Ok(PassOutcome::Cancelled);
            }

            let (ra, rb) = (self.find(pair.a), self.find(pair.b));
            if ra == rb {
                continue;
            }

            match pair.decision {
                Decision::AutoMerge => {
                    let (canonical_id, absorbed_id) = {
                        let (Some(x), Some(y)) = (self.live.get(&ra), self.live.get(&rb)) else {
                            continue;
                        };
                        let (canonical, absorbed) = choose_canonical(x, y);
                        (canonical.id, absorbed.id)
                    };

                    let record = self.candidate(pair, ra, rb, CandidateResolution::AutoMerged);
                    storage.insert_candidate(&record).await?;

                    let Some(absorbed) = self.live.remove(&absorbed_id) else {
                        continue;
                    };
                    let Some(canonical) = self.live.get_mut(&canonical_id) else {
                        continue;
                    };
                    absorb(canonical, &absorbed);
                    storage.merge_entities(absorbed_id, canonical).await?;
                    self.parent.insert(absorbed_id, canonical_id);

                    debug!(
                        canonical = %canonical_id,
                        absorbed = %absorbed_id,
                        confidence = pair.confidence,
                        "auto-merged"
                    );
                    on_event(ApplyEvent::AutoMerged {
                        canonical: canonical_id,
                        absorbed: absorbed_id,
                    });
                }
                Decision::Candidate => {
                    let record = self.candidate(pair, ra, rb, CandidateResolution::Pending);
                    if storage.insert_candidate(&record).await? {
                        on_event(ApplyEvent::CandidateFound(record.id));
                    }
                }
                Decision::Discard => {}
            }
        }
        Ok(PassOutcome::Completed)
    }

    /// Link surviving entities that were extracted from the same page.
    ///
    /// At most `cooccurrence_max_per_page` edges per page; 0 disables.
    /// Returns the number of relationships written.
    pub async fn infer_cooccurrence(&self, storage: &Storage) -> Result<u64> {
        let cap = self.config.cooccurrence_max_per_page;
        if cap == 0 {
            return Ok(0);
        }

        let mut by_page: BTreeMap<PageId, BTreeSet<EntityId>> = BTreeMap::new();
        for entity in self.entities.iter() {
            by_page
                .entry(entity.source_page_id)
                .or_default()
                .insert(self.find(entity.id));
        }

        let mut written = 0;
        for (page, members) in &by_page {
            let members: Vec<EntityId> = members.iter().copied().collect();
            let pairs = members
                .iter()
                .enumerate()
                .flat_map(|(n, a)| members[n + 1..].iter().map(move |b| (*a, *b)))
                .take(cap)
                .collect::<Vec<(EntityId, EntityId)>>();
            for (a, b) in pairs {
                let mut properties = serde_json::Map::new();
                properties.insert("page_id".into(), page.to_string().into());
                let rel = EntityRelationship {
                    id: RelationshipId::new(),
                    tenant_id: self.tenant_id.clone(),
                    job_id: self.job_id,
                    source_entity_id: a,
                    target_entity_id: b,
                    relationship_type: COOCCURRENCE_RELATIONSHIP.into(),
                    properties,
                    confidence_score: COOCCURRENCE_CONFIDENCE,
                };
                if storage.insert_relationship(&rel).await? {
                    written += 1;
                }
            }
        }
        debug!(written, "co-occurrence relationships inferred");
        Ok(written)
    }

    fn find(&self, id: EntityId) -> EntityId {
        let mut current = id;
        while let Some(&next) = self.parent.get(&current) {
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    fn candidate(
        &self,
        pair: &ScoredPair,
        a: EntityId,
        b: EntityId,
        resolution: CandidateResolution,
    ) -> ConsolidationCandidate {
        let now = Utc::now();
        ConsolidationCandidate {
            id: CandidateId::new(),
            tenant_id: self.tenant_id.clone(),
            job_id: self.job_id,
            entity_a: a,
            entity_b: b,
            breakdown: pair.breakdown.clone(),
            confidence_score: pair.confidence,
            resolution,
            created_at: now,
            resolved_at: (resolution != CandidateResolution::Pending).then_some(now),
        }
    }
}

fn score_shard(
    pairs: &[(usize, usize)],
    entities: &[ExtractedEntity],
    graph: &NeighborIndex,
    config: &ConsolidationConfig,
) -> ShardResult {
    let mut result = ShardResult::default();
    for &(i, j) in pairs {
        result.evaluated += 1;
        let (a, b) = (&entities[i], &entities[j]);
        let breakdown = match score(a, b, graph) {
            Ok(breakdown) => breakdown,
            Err(e) => {
                debug!(a = %a.id, b = %b.id, error = %e, "pair skipped");
                result.errors += 1;
                continue;
            }
        };
        let confidence = combined_confidence(&breakdown, (a.entity_type, b.entity_type), config);
        let decision = decide(confidence, config);
        if decision != Decision::Discard {
            result.kept.push(ScoredPair {
                a: a.id,
                b: b.id,
                breakdown,
                confidence,
                decision,
            });
        }
    }
    result
}
