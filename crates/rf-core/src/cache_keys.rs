//! Cache key definitions
//!
//! Keys are deterministic functions of the query parameters so repeated
//! identical reads hit the same entry, and every key family has a wildcard
//! pattern that a mutation can invalidate in one call.

use uuid::Uuid;

use crate::models::ThreadQuery;

const PREFIX: &str = "forum";

/// `forum:threads:list:{status}:{tag}:{search}:{page}:{limit}`
pub fn thread_list(query: &ThreadQuery) -> String {
    format!(
        "{PREFIX}:threads:list:{}:{}:{}:{}:{}",
        query.status.map(|s| s.as_str()).unwrap_or("all"),
        part(query.tag.as_deref()),
        part(query.search.as_deref()),
        query.page,
        query.limit
    )
}

pub fn thread_list_pattern() -> String {
    format!("{PREFIX}:threads:list:*")
}

/// `forum:threads:author:{author_id}:{page}:{limit}`
pub fn author_threads(author_id: Uuid, page: u32, limit: u32) -> String {
    format!("{PREFIX}:threads:author:{author_id}:{page}:{limit}")
}

pub fn author_threads_pattern(author_id: Uuid) -> String {
    format!("{PREFIX}:threads:author:{author_id}:*")
}

/// `forum:threads:detail:{thread_id}:{page}:{limit}`
pub fn thread_detail(thread_id: Uuid, page: u32, limit: u32) -> String {
    format!("{PREFIX}:threads:detail:{thread_id}:{page}:{limit}")
}

pub fn thread_detail_pattern(thread_id: Uuid) -> String {
    format!("{PREFIX}:threads:detail:{thread_id}:*")
}

/// Free-text parts are normalized and stripped of the separator and the
/// wildcard so they cannot collide with another key family.
fn part(value: Option<&str>) -> String {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => v
            .to_lowercase()
            .chars()
            .map(|c| if c == ':' || c == '*' || c.is_whitespace() { '_' } else { c })
            .collect(),
        None => "-".to_string(),
    }
}

/// Glob match supporting `*` only, the subset every backend understands.
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        return rest.is_empty();
    };
    for piece in middle {
        match rest.find(piece) {
            Some(idx) => rest = &rest[idx + piece.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ThreadStatus;

    #[test]
    fn test_list_key_deterministic() {
        let q = ThreadQuery {
            status: Some(ThreadStatus::Open),
            tag: Some("Rust".into()),
            search: Some("async io".into()),
            page: 2,
            limit: 10,
        };
        assert_eq!(thread_list(&q), thread_list(&q.clone()));
        assert_eq!(thread_list(&q), "forum:threads:list:open:rust:async_io:2:10");
        assert_eq!(
            thread_list(&ThreadQuery::default()),
            "forum:threads:list:all:-:-:1:20"
        );
    }

    #[test]
    fn test_patterns_cover_their_family() {
        let author = Uuid::now_v7();
        let thread = Uuid::now_v7();
        assert!(matches_pattern(&thread_list_pattern(), &thread_list(&ThreadQuery::default())));
        assert!(matches_pattern(&author_threads_pattern(author), &author_threads(author, 1, 20)));
        assert!(matches_pattern(&thread_detail_pattern(thread), &thread_detail(thread, 3, 50)));
        assert!(!matches_pattern(&thread_detail_pattern(thread), &thread_detail(Uuid::now_v7(), 1, 20)));
        assert!(!matches_pattern(&author_threads_pattern(author), &thread_list(&ThreadQuery::default())));
    }

    #[test]
    fn test_glob_edge_cases() {
        assert!(matches_pattern("a*c", "abc"));
        assert!(matches_pattern("a*b*c", "a-b-c"));
        assert!(!matches_pattern("a*b*c", "a-c"));
        assert!(matches_pattern("exact", "exact"));
        assert!(!matches_pattern("exact", "exactly"));
        assert!(!matches_pattern("ab*ba", "aba"));
    }
}
