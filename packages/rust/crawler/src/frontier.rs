//! Breadth-first crawl frontier: one FIFO queue per depth level.

use std::collections::{BTreeMap, HashSet, VecDeque};

use url::Url;

/// Pending URLs keyed by depth, with canonical-URL dedup.
#[derive(Debug, Default)]
pub struct Frontier {
    levels: BTreeMap<u32, VecDeque<Url>>,
    seen: HashSet<String>,
    max_depth: u32,
    len: usize,
}

impl Frontier {
    /// Create a frontier seeded with `start` at depth 0.
    pub fn new(start: Url, max_depth: u32) -> Self {
        let mut frontier = Self {
            max_depth,
            ..Self::default()
        };
        frontier.push(start, 0);
        frontier
    }

    /// Enqueue a URL. Returns `false` if it is too deep or already seen.
    pub fn push(&mut self, url: Url, depth: u32) -> bool {
        if depth > self.max_depth {
            return false;
        }
        if !self.seen.insert(canonical_url(&url)) {
            return false;
        }
        self.levels.entry(depth).or_default().push_back(url);
        self.len += 1;
        true
    }

    /// Record a URL as seen without enqueueing it (e.g. a redirect target).
    pub fn mark_seen(&mut self, url: &Url) {
        self.seen.insert(canonical_url(url));
    }

    /// Dequeue the oldest URL at the shallowest non-empty depth.
    pub fn pop(&mut self) -> Option<(Url, u32)> {
        let mut entry = self.levels.first_entry()?;
        let depth = *entry.key();
        let url = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        let url = url?;
        self.len -= 1;
        Some((url, depth))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Normalize a URL for deduplication: drop the fragment and any trailing
/// slash on non-root paths. Scheme and host are already lower-cased by `url`.
pub fn canonical_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    if normalized.query() == Some("") {
        normalized.set_query(None);
    }
    let mut s = normalized.to_string();
    if normalized.query().is_none() && s.ends_with('/') && normalized.path() != "/" {
        s.pop();
    }
    s
}
