//! Thread slugs.

const MAX_SLUG_LEN: usize = 80;

/// Lower-case ASCII words joined by single hyphens.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;

    for c in title.chars() {
        if !c.is_ascii_alphanumeric() {
            pending_dash = true;
            continue;
        }
        let dash = pending_dash && !slug.is_empty();
        if slug.len() + usize::from(dash) + 1 > MAX_SLUG_LEN {
            break;
        }
        if dash {
            slug.push('-');
        }
        pending_dash = false;
        slug.push(c.to_ascii_lowercase());
    }

    if slug.is_empty() {
        "thread".to_string()
    } else {
        slug
    }
}

/// The n-th candidate for a base slug: `base`, `base-1`, `base-2`, ...
pub fn candidate(base: &str, attempt: u64) -> String {
    if attempt == 0 {
        base.to_string()
    } else {
        format!("{base}-{attempt}")
    }
}
