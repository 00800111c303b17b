//! robots.txt rules, fetched once per host per job.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// Allow/disallow rules that apply to our user agent.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    allow: Vec<String>,
    disallow: Vec<String>,
}

impl RobotsRules {
    /// Rules used when robots.txt is missing or unreachable.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse robots.txt for `user_agent`. A group naming our agent replaces
    /// the `*` group.
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let token = agent_token(user_agent);
        let mut specific = Self::default();
        let mut wildcard = Self::default();
        let mut found_specific = false;

        // Consecutive user-agent lines share one group.
        let mut group_is_specific = false;
        let mut group_is_wildcard = false;
        let mut in_agent_lines = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let directive = directive.trim().to_ascii_lowercase();
            let value = value.trim();

            match directive.as_str() {
                "user-agent" => {
                    if !in_agent_lines {
                        group_is_specific = false;
                        group_is_wildcard = false;
                    }
                    in_agent_lines = true;
                    let agent = value.to_ascii_lowercase();
                    if agent == "*" {
                        group_is_wildcard = true;
                    } else if !agent.is_empty() && token.contains(&agent) {
                        group_is_specific = true;
                        found_specific = true;
                    }
                }
                "allow" | "disallow" => {
                    in_agent_lines = false;
                    if value.is_empty() {
                        continue;
                    }
                    let targets = [
                        (group_is_specific, &mut specific),
                        (group_is_wildcard, &mut wildcard),
                    ];
                    for (applies, rules) in targets {
                        if applies {
                            if directive == "allow" {
                                rules.allow.push(value.to_string());
                            } else {
                                rules.disallow.push(value.to_string());
                            }
                        }
                    }
                }
                _ => in_agent_lines = false,
            }
        }

        if found_specific { specific } else { wildcard }
    }

    /// Longest matching rule wins; ties go to allow.
    pub fn is_allowed(&self, path: &str) -> bool {
        let longest = |patterns: &[String]| {
            patterns
                .iter()
                .filter(|p| path_matches(path, p))
                .map(|p| p.len())
                .max()
                .unwrap_or(0)
        };
        longest(&self.allow) >= longest(&self.disallow)
    }
}

/// Lower-cased product token of a user agent ("graphloom/0.1" -> "graphloom").
fn agent_token(user_agent: &str) -> String {
    user_agent
        .split(['/', ' '])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Match a path against a robots pattern with `*` wildcards and a `$` anchor.
fn path_matches(path: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }

    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };

    if !pattern.contains('*') {
        return if anchored {
            path == pattern
        } else {
            path.starts_with(pattern)
        };
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !path.starts_with(part) {
                return false;
            }
            pos = part.len();
            continue;
        }
        // The final segment of an anchored pattern must sit at the very end.
        if anchored && i == parts.len() - 1 {
            return path.len() >= pos + part.len() && path.ends_with(part);
        }
        match path[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }

    // A trailing `*` (empty last part) matches anything left.
    !anchored || parts.last().is_some_and(|p| p.is_empty()) || pos == path.len()
}

/// Per-job robots.txt cache keyed by origin.
pub struct RobotsCache {
    client: Client,
    user_agent: String,
    rules: Mutex<HashMap<String, Arc<RobotsRules>>>,
}

impl RobotsCache {
    pub fn new(client: Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `url` may be fetched. Fetches the host's robots.txt on first use.
    pub async fn is_allowed(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        let rules = {
            let mut cache = self.rules.lock().await;
            match cache.get(&origin) {
                Some(rules) => rules.clone(),
                None => {
                    let rules = Arc::new(self.fetch(&origin).await);
                    cache.insert(origin.clone(), rules.clone());
                    rules
                }
            }
        };

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        rules.is_allowed(&target)
    }

    async fn fetch(&self, origin: &str) -> RobotsRules {
        let robots_url = format!("{origin}/robots.txt");
        let response = match self.client.get(&robots_url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(url = %robots_url, status = %r.status(), "no robots.txt, allowing all");
                return RobotsRules::allow_all();
            }
            Err(e) => {
                debug!(url = %robots_url, error = %e, "robots.txt unreachable, allowing all");
                return RobotsRules::allow_all();
            }
        };

        match response.text().await {
            Ok(body) => RobotsRules::parse(&body, &self.user_agent),
            Err(_) => RobotsRules::allow_all(),
        }
    }
}
