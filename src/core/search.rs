use std::collections::HashMap;

/// Search results gathered by the querying peer.
///
/// File names are kept in arrival order without duplicates. The owner of a
/// file name is whoever answered first; later answers for the same name are
/// ignored, even from a different owner.
#[derive(Debug, Default, Clone)]
pub struct SearchResults {
    files: Vec<String>,
    owners: HashMap<String, String>,
}

impl SearchResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a result; returns `false` when the file name was already listed.
    pub fn insert(&mut self, file_name: &str, owner: &str) -> bool {
        if self.owners.contains_key(file_name) {
            return false;
        }
        self.files.push(file_name.to_string());
        self.owners
            .insert(file_name.to_string(), owner.to_string());
        true
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.owners.clear();
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn owner_of(&self, file_name: &str) -> Option<&str> {
        self.owners.get(file_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Names from `listing` containing `query`, ignoring case, in listing order.
pub fn find_matches<'a>(listing: &'a [String], query: &str) -> Vec<&'a str> {
    let query = query.to_lowercase();
    listing
        .iter()
        .filter(|name| name.to_lowercase().contains(&query))
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_owner_wins() {
        let mut results = SearchResults::new();

        assert!(results.insert("Report_Final.pdf", "bob"));
        assert!(!results.insert("Report_Final.pdf", "carol"));
        assert!(results.insert("report-draft.doc", "carol"));

        assert_eq!(results.files(), &["Report_Final.pdf", "report-draft.doc"]);
        assert_eq!(results.owner_of("Report_Final.pdf"), Some("bob"));
        assert_eq!(results.owner_of("report-draft.doc"), Some("carol"));
        assert_eq!(results.owner_of("missing"), None);
    }

    #[test]
    fn test_clear_forgets_owners() {
        let mut results = SearchResults::new();
        results.insert("a.txt", "bob");
        results.clear();

        assert!(results.is_empty());
        assert_eq!(results.owner_of("a.txt"), None);
        assert!(results.insert("a.txt", "carol"));
        assert_eq!(results.owner_of("a.txt"), Some("carol"));
    }

    #[test]
    fn test_matching_ignores_case() {
        let listing = vec![
            "Report_Final.pdf".to_string(),
            "notes.txt".to_string(),
            "old_REPORT.txt".to_string(),
        ];

        assert_eq!(find_matches(&listing, "report"), vec!["Report_Final.pdf", "old_REPORT.txt"]);
        assert_eq!(find_matches(&listing, "NOTES"), vec!["notes.txt"]);
        assert!(find_matches(&listing, "zip").is_empty());
        assert_eq!(find_matches(&listing, "final"), vec!["Report_Final.pdf"]);
    }
}
