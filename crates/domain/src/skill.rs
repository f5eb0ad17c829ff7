//! Skill registry contract — the seam a plugin uses to expose named,
//! instruction-carrying procedures to the `/skills` command (C11).
//!
//! No concrete skill content ships here; this only defines how a plugin
//! publishes skills and how `/skills <name|index>` resolves one.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSummary {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillLookupError {
    NotFound,
    Ambiguous(Vec<String>),
}

/// Registered as a service (name `"skillRegistry"`) by any plugin that wants
/// to expose skills to `/skills`.
pub trait SkillRegistry: Send + Sync {
    fn list(&self) -> Vec<SkillSummary>;

    /// Resolve a 1-based index or a case-insensitive substring match against
    /// a skill name to its canonical name.
    fn resolve(&self, name_or_index: &str) -> Result<String, SkillLookupError> {
        let skills = self.list();

        if let Ok(index) = name_or_index.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|i| skills.get(i))
                .map(|s| s.name.clone())
                .ok_or(SkillLookupError::NotFound);
        }

        let needle = name_or_index.to_lowercase();
        let matches: Vec<&SkillSummary> = skills
            .iter()
            .filter(|s| s.name.to_lowercase().contains(&needle))
            .collect();

        match matches.as_slice() {
            [] => Err(SkillLookupError::NotFound),
            [one] => Ok(one.name.clone()),
            many => Err(SkillLookupError::Ambiguous(
                many.iter().map(|s| s.name.clone()).collect(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture(Vec<SkillSummary>);
    impl SkillRegistry for Fixture {
        fn list(&self) -> Vec<SkillSummary> {
            self.0.clone()
        }
    }

    fn fixture() -> Fixture {
        Fixture(vec![
            SkillSummary {
                name: "deploy-check".into(),
                description: "pre-deploy checklist".into(),
            },
            SkillSummary {
                name: "release-notes".into(),
                description: "drafts release notes".into(),
            },
        ])
    }

    #[test]
    fn resolves_by_one_based_index() {
        assert_eq!(fixture().resolve("2").unwrap(), "release-notes");
    }

    #[test]
    fn index_zero_is_not_found() {
        assert_eq!(fixture().resolve("0").unwrap_err(), SkillLookupError::NotFound);
    }

    #[test]
    fn resolves_by_case_insensitive_substring() {
        assert_eq!(fixture().resolve("DEPLOY").unwrap(), "deploy-check");
    }

    #[test]
    fn ambiguous_substring_errors() {
        let err = fixture().resolve("e").unwrap_err();
        assert!(matches!(err, SkillLookupError::Ambiguous(names) if names.len() == 2));
    }

    #[test]
    fn unknown_name_not_found() {
        assert_eq!(fixture().resolve("nope").unwrap_err(), SkillLookupError::NotFound);
    }
}
