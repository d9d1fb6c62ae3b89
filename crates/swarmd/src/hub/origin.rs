//! Origin allow-list matching for upgrade requests.

/// When an allow-list is configured, a present `Origin` header must match
/// one of its patterns (`*` wildcards permitted). Requests without an
/// `Origin` header are non-browser clients and pass. An empty allow-list
/// accepts every origin.
pub fn origin_allowed(allowlist: &[String], origin: Option<&str>) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let Some(origin) = origin else {
        return true;
    };
    allowlist.iter().any(|p| pattern_matches(p, origin))
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;

    let Some(first) = parts.first() else {
        return false;
    };
    if !rest.starts_with(first) {
        return false;
    }
    rest = &rest[first.len()..];

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }

    rest.ends_with(parts[parts.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_allowlist_accepts_all() {
        assert!(origin_allowed(&[], Some("https://evil.example")));
        assert!(origin_allowed(&[], None));
    }

    #[test]
    fn test_exact_match() {
        let allow = list(&["https://ops.example.com"]);
        assert!(origin_allowed(&allow, Some("https://ops.example.com")));
        assert!(!origin_allowed(&allow, Some("https://other.example.com")));
    }

    #[test]
    fn test_wildcard_subdomain() {
        let allow = list(&["https://*.example.com"]);
        assert!(origin_allowed(&allow, Some("https://ops.example.com")));
        assert!(origin_allowed(&allow, Some("https://a.b.example.com")));
        assert!(!origin_allowed(&allow, Some("https://example.org")));
        assert!(!origin_allowed(&allow, Some("http://ops.example.com")));
    }

    #[test]
    fn test_bare_star_matches_everything() {
        let allow = list(&["*"]);
        assert!(origin_allowed(&allow, Some("anything")));
    }

    #[test]
    fn test_missing_origin_passes() {
        // Agents are not browsers; they send no Origin header.
        let allow = list(&["https://ops.example.com"]);
        assert!(origin_allowed(&allow, None));
    }
}
