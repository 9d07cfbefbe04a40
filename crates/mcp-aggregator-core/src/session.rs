use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::tagfilter::TagFilter;

/// One inbound client-to-proxy conversation. Owns its tag filter and the
/// bookkeeping needed for reverse-direction binding and list-changed
/// notification delivery.
#[derive(Clone)]
pub struct InboundSession {
    pub session_id: String,
    pub tags: Arc<HashSet<String>>,
    pub tag_filter: Arc<TagFilter>,
    pub enable_pagination: bool,
    pub preset_name: Option<String>,
    pub created_at: Instant,
}

impl InboundSession {
    pub fn new(
        session_id: impl Into<String>,
        tags: HashSet<String>,
        tag_filter: TagFilter,
        enable_pagination: bool,
        preset_name: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            tags: Arc::new(tags),
            tag_filter: Arc::new(tag_filter),
            enable_pagination,
            preset_name,
            created_at: Instant::now(),
        }
    }

    /// An upstream is admitted iff its tag set satisfies the filter AND the
    /// scope set (this session's `tags`, when auth is enabled) contains at
    /// least one of the upstream's tags. When `tags` is empty (auth disabled
    /// case handled upstream by populating it with the full tag universe)
    /// this degenerates to filter-only admission.
    pub fn admits(&self, upstream_tags: &[String]) -> bool {
        let tagset: HashSet<String> = upstream_tags.iter().cloned().collect();
        if !self.tag_filter.evaluate(&tagset) {
            return false;
        }
        if self.tags.is_empty() {
            return true;
        }
        upstream_tags.iter().any(|t| self.tags.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_respects_both_filter_and_scope() {
        let mut scope = HashSet::new();
        scope.insert("web".to_string());
        let filter = TagFilter::parse("web,db").unwrap();
        let session = InboundSession::new("s1", scope, filter, false, None);
        assert!(session.admits(&["web".to_string()]));
        assert!(!session.admits(&["db".to_string()])); // filter admits, scope doesn't
        assert!(!session.admits(&["other".to_string()]));
    }

    #[test]
    fn empty_scope_means_filter_only() {
        let filter = TagFilter::parse("web").unwrap();
        let session = InboundSession::new("s1", HashSet::new(), filter, false, None);
        assert!(session.admits(&["web".to_string()]));
        assert!(!session.admits(&["db".to_string()]));
    }
}
