//! Job ID generation and resolution
//!
//! IDs use the format: `{8-char-hex}-job-{slug}`
//! Example: `9f3a61c2-job-market-survey`

use std::collections::HashMap;

/// Generate a job ID from an optional human name
///
/// The hex part is taken from the random tail of a UUIDv7, so two jobs created
/// in the same millisecond with the same name still get distinct ids.
pub fn generate_id(kind: &str, name: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    let hex = &uuid[uuid.len() - 8..];
    let slug = slugify(name);
    if slug.is_empty() {
        format!("{}-{}", hex, kind)
    } else {
        format!("{}-{}-{}", hex, kind, slug)
    }
}

/// Slugify a name for use in IDs
fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        // Strip apostrophes entirely, replace other non-alphanumeric with hyphens
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-")
}

/// ID resolution for partial matches
pub struct IdResolver<'a> {
    ids: &'a HashMap<String, String>, // id -> display name
}

impl<'a> IdResolver<'a> {
    pub fn new(ids: &'a HashMap<String, String>) -> Self {
        Self { ids }
    }

    /// Resolve a partial reference to a full ID
    ///
    /// Returns:
    /// - Ok(Some(id)) if exactly one match
    /// - Ok(None) if no matches
    /// - Err with candidates if ambiguous
    pub fn resolve(&self, reference: &str) -> Result<Option<String>, Vec<String>> {
        if self.ids.contains_key(reference) {
            return Ok(Some(reference.to_string()));
        }

        let mut matches: Vec<String> = self
            .ids
            .keys()
            .filter(|id| Self::matches(id, reference))
            .cloned()
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => {
                matches.sort();
                Err(matches)
            }
        }
    }

    /// Check if an ID matches a reference
    fn matches(id: &str, reference: &str) -> bool {
        // Hex prefix match
        if id.starts_with(reference) {
            return true;
        }

        // Slug contains match
        if let Some(slug_start) = id.find('-') {
            let slug_part = &id[slug_start + 1..];
            if slug_part.contains(reference) {
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate_id("job", "Market Survey");
        assert!(id.contains("-job-"));
        assert!(id.ends_with("market-survey"));
        assert_eq!(id.find('-'), Some(8));
    }

    #[test]
    fn test_generate_id_without_name() {
        let id = generate_id("job", "");
        assert!(id.ends_with("-job"));
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = generate_id("job", "same");
        let b = generate_id("job", "same");
        assert_ne!(a, b);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("Add OAuth!"), "add-oauth");
        assert_eq!(slugify("Multiple   Spaces"), "multiple-spaces");
        assert_eq!(slugify("here's a test"), "heres-a-test");
        assert_eq!(slugify("one two three four five six seven"), "one-two-three-four-five-six");
    }

    #[test]
    fn test_resolver_partial_matches() {
        let mut ids = HashMap::new();
        ids.insert("aaaa1111-job-survey".to_string(), "survey".to_string());
        ids.insert("bbbb2222-job-summary".to_string(), "summary".to_string());

        let resolver = IdResolver::new(&ids);
        assert_eq!(resolver.resolve("aaaa").unwrap(), Some("aaaa1111-job-survey".to_string()));
        assert_eq!(resolver.resolve("summary").unwrap(), Some("bbbb2222-job-summary".to_string()));
        assert_eq!(resolver.resolve("zzz").unwrap(), None);
        assert_eq!(resolver.resolve("su").unwrap_err().len(), 2);
    }
}
