//! `@handle` extraction from post bodies.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::models::User;

/// 3–20 chars of letters, digits, `_`, `.`, `-`.
static HANDLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@([A-Za-z0-9_.\-]{3,20})").expect("static handle pattern compiles")
});

/// Every distinct handle mentioned in `body`, lower-cased, in order of first
/// appearance. Trailing sentence punctuation (`@bob.`) is not part of a handle.
pub fn extract_handles(body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    HANDLE_RE
        .captures_iter(body)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches(['.', '-']).to_lowercase())
        .filter(|handle| handle.len() >= 3)
        .filter(|handle| seen.insert(handle.clone()))
        .collect()
}

/// Users that should receive a mention, given the users the handles resolved
/// to. The acting user never mentions themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedMentions {
    /// Handles in body order, as stored on the post
    pub handles: Vec<String>,
    pub user_ids: Vec<Uuid>,
}

impl ResolvedMentions {
    pub fn resolve(handles: &[String], users: &[User], actor_id: Uuid) -> Self {
        let mut resolved = Self::default();
        for handle in handles {
            let Some(user) = users.iter().find(|u| u.handle.eq_ignore_ascii_case(handle)) else {
                continue;
            };
            if user.id == actor_id || resolved.user_ids.contains(&user.id) {
                continue;
            }
            resolved.handles.push(handle.clone());
            resolved.user_ids.push(user.id);
        }
        resolved
    }

    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }

    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.user_ids.contains(user_id)
    }
}
