//! Which URLs a job may fetch.

use std::collections::BTreeSet;
use std::net::IpAddr;

use graphloom_shared::{JobConfig, PipelineError, Result};
use regex::Regex;
use url::Url;

/// Why a URL was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Scheme,
    Domain,
    Excluded,
    NotIncluded,
    PrivateHost,
}

/// Scope rules compiled once per job.
#[derive(Debug, Clone)]
pub struct CrawlScope {
    domains: BTreeSet<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    seed: String,
    allow_private_hosts: bool,
}

impl CrawlScope {
    pub fn new(config: &JobConfig, allow_private_hosts: bool) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        PipelineError::validation(format!("invalid URL pattern {p:?}: {e}"))
                    })
                })
                .collect()
        };

        Ok(Self {
            domains: config.effective_domains(),
            include: compile(&config.url_patterns)?,
            exclude: compile(&config.excluded_patterns)?,
            seed: crate::frontier::canonical_url(&config.start_url),
            allow_private_hosts,
        })
    }

    /// Check a URL against every rule. The seed is exempt from `url_patterns`.
    pub fn check(&self, url: &Url) -> std::result::Result<(), SkipReason> {
        match url.scheme() {
            "http" | "https" => {}
            _ => return Err(SkipReason::Scheme),
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if !self.domains.contains(&host) {
            return Err(SkipReason::Domain);
        }

        if !self.allow_private_hosts && is_ssrf_target(url) {
            return Err(SkipReason::PrivateHost);
        }

        let full = url.as_str();
        if self.exclude.iter().any(|re| re.is_match(full)) {
            return Err(SkipReason::Excluded);
        }

        if !self.include.is_empty()
            && crate::frontier::canonical_url(url) != self.seed
            && !self.include.iter().any(|re| re.is_match(full))
        {
            return Err(SkipReason::NotIncluded);
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost"
                || host.ends_with(".localhost")
                || host.ends_with(".local")
                || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn scope_for(start: &str, f: impl FnOnce(&mut JobConfig)) -> CrawlScope {
        let mut config = JobConfig::new(url(start));
        f(&mut config);
        CrawlScope::new(&config, false).unwrap()
    }

    #[test]
    fn same_host_by_default() {
        let scope = scope_for("https://docs.example.com/guide/", |_| {});
        assert!(scope.check(&url("https://docs.example.com/guide/intro")).is_ok());
        assert_eq!(
            scope.check(&url("https://other.example.com/guide/intro")),
            Err(SkipReason::Domain)
        );
    }

    #[test]
    fn allowed_domains_replace_start_host() {
        let scope = scope_for("https://example.com/", |c| {
            c.allowed_domains.insert("example.com".into());
            c.allowed_domains.insert("blog.example.com".into());
        });
        assert!(scope.check(&url("https://blog.example.com/post")).is_ok());
        assert!(scope.check(&url("https://shop.example.com/")).is_err());
    }

    #[test]
    fn excludes_win_over_includes() {
        let scope = scope_for("https://example.com/", |c| {
            c.url_patterns.push(r"/docs/".into());
            c.excluded_patterns.push(r"/docs/archive/".into());
        });
        assert!(scope.check(&url("https://example.com/docs/a")).is_ok());
        assert_eq!(
            scope.check(&url("https://example.com/docs/archive/old")),
            Err(SkipReason::Excluded)
        );
        assert_eq!(
            scope.check(&url("https://example.com/blog/x")),
            Err(SkipReason::NotIncluded)
        );
    }

    #[test]
    fn seed_is_exempt_from_includes() {
        let scope = scope_for("https://example.com/", |c| {
            c.url_patterns.push(r"/products/".into());
        });
        assert!(scope.check(&url("https://example.com/")).is_ok());
        assert!(scope.check(&url("https://example.com/#top")).is_ok());
    }

    #[test]
    fn ssrf_protection_blocks_file() {
        assert!(is_ssrf_target(&url("file:///etc/passwd")));
    }

    #[test]
    fn ssrf_protection_blocks_private_ip() {
        assert!(is_ssrf_target(&url("http://192.168.1.1/admin")));
        assert!(is_ssrf_target(&url("http://10.0.0.1/")));
        assert!(is_ssrf_target(&url("http://127.0.0.1:8080/")));
        assert!(is_ssrf_target(&url("http://[::1]/")));
        assert!(is_ssrf_target(&url("http://[fd00::1]/")));
    }

    #[test]
    fn ssrf_blocks_localhost_names() {
        assert!(is_ssrf_target(&url("http://localhost:3000/api")));
        assert!(is_ssrf_target(&url("http://printer.local/")));
    }

    #[test]
    fn ssrf_protection_allows_public() {
        assert!(!is_ssrf_target(&url("https://docs.example.com/page")));
    }

    #[test]
    fn private_hosts_opt_in() {
        let config = JobConfig::new(url("http://127.0.0.1:9000/"));
        let strict = CrawlScope::new(&config, false).unwrap();
        assert_eq!(
            strict.check(&url("http://127.0.0.1:9000/a")),
            Err(SkipReason::PrivateHost)
        );
        let relaxed = CrawlScope::new(&config, true).unwrap();
        assert!(relaxed.check(&url("http://127.0.0.1:9000/a")).is_ok());
    }
}
