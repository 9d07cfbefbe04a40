//! Scope model: only scopes of the form `tag:<name>` are meaningful. They
//! authorize access to upstreams carrying that tag.

const TAG_PREFIX: &str = "tag:";

pub fn parse_scope_string(scope: &str) -> Vec<String> {
    scope
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

pub fn validate_scopes(scopes: &[String], known_tags: &[String]) -> Result<(), String> {
    for scope in scopes {
        match scope.strip_prefix(TAG_PREFIX) {
            Some(tag) if known_tags.iter().any(|t| t == tag) => {}
            Some(tag) => return Err(format!("unknown tag scope `tag:{tag}`")),
            None => return Err(format!("unrecognized scope `{scope}`")),
        }
    }
    Ok(())
}

pub fn scopes_to_tags(scopes: &[String]) -> Vec<String> {
    scopes
        .iter()
        .filter_map(|s| s.strip_prefix(TAG_PREFIX))
        .map(|s| s.to_string())
        .collect()
}

/// When auth is disabled, the router uses the universe of configured tags as
/// the caller's scope set and `clientId = "anonymous"`.
pub fn anonymous_scopes(all_tags: &[String]) -> Vec<String> {
    all_tags.iter().map(|t| format!("{TAG_PREFIX}{t}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_tag_scope() {
        let known = vec!["web".to_string()];
        let err = validate_scopes(&["tag:db".to_string()], &known).unwrap_err();
        assert!(err.contains("db"));
    }

    #[test]
    fn rejects_non_tag_scope() {
        let err = validate_scopes(&["openid".to_string()], &[]).unwrap_err();
        assert!(err.contains("openid"));
    }

    #[test]
    fn accepts_known_tag_scopes() {
        let known = vec!["web".to_string(), "db".to_string()];
        assert!(validate_scopes(&["tag:web".to_string(), "tag:db".to_string()], &known).is_ok());
    }

    #[test]
    fn anonymous_scopes_cover_full_tag_universe() {
        let tags = vec!["web".to_string(), "db".to_string()];
        let scopes = anonymous_scopes(&tags);
        assert_eq!(scopes_to_tags(&scopes), tags);
    }
}
