//! Domain derivation and partitioning of candidates into per-host queues.
//!
//! The domain is the politeness key: every URL sharing a host (ignoring a
//! leading `www.` and the scheme) lands in the same [`DomainGroup`] and is
//! fetched strictly one at a time.

use crate::models::{DomainGroup, UrlCandidate};
use url::Url;

/// Host of `url` without a leading `www.`.
///
/// Unparseable URLs fall back to the raw string so they still form a
/// (single-member) group and surface as a fetch failure later.
pub fn domain_of(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.strip_prefix("www.").unwrap_or(host).to_string(),
            None => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}

/// Group candidates by domain.
///
/// Groups appear in order of each domain's first candidate, and candidates
/// keep their extraction order within a group.
pub fn partition(candidates: Vec<UrlCandidate>) -> Vec<DomainGroup> {
    let mut groups: Vec<DomainGroup> = Vec::new();
    for candidate in candidates {
        let domain = domain_of(&candidate.url);
        match groups.iter_mut().find(|g| g.domain == domain) {
            Some(group) => group.candidates.push(candidate),
            None => groups.push(DomainGroup {
                domain,
                candidates: vec![candidate],
            }),
        }
    }
    groups
}
