//! Table-driven vocabulary: synonym aliases and query-term expansion.
//!
//! Domains register data here (e.g. "空闲" on `Room.status` expands to the two
//! vacant statuses); the engine itself knows no domain words. Matching is
//! case-insensitive.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

type FieldKey = (String, String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermMatch {
    pub field: String,
    pub term: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    aliases: HashMap<FieldKey, HashMap<String, String>>,
    expansions: HashMap<FieldKey, HashMap<String, Vec<String>>>,
}

fn key(entity: &str, field: &str) -> FieldKey {
    (entity.to_owned(), field.to_owned())
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_alias(&mut self, entity: &str, field: &str, synonym: &str, canonical: &str) {
        self.aliases
            .entry(key(entity, field))
            .or_default()
            .insert(synonym.to_lowercase(), canonical.to_owned());
    }

    pub fn add_expansion<I, S>(&mut self, entity: &str, field: &str, term: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expansions
            .entry(key(entity, field))
            .or_default()
            .insert(term.to_lowercase(), values.into_iter().map(Into::into).collect());
    }

    pub fn resolve_alias(&self, entity: &str, field: &str, term: &str) -> Option<&str> {
        self.aliases
            .get(&key(entity, field))?
            .get(&term.trim().to_lowercase())
            .map(String::as_str)
    }

    pub fn expand(&self, entity: &str, field: &str, term: &str) -> Option<&[String]> {
        self.expansions
            .get(&key(entity, field))?
            .get(&term.trim().to_lowercase())
            .map(Vec::as_slice)
    }

    /// Canonical values a user-supplied term stands for: its expansion, else
    /// its alias, else the term itself.
    pub fn canonicalize(&self, entity: &str, field: &str, term: &str) -> Vec<String> {
        if let Some(values) = self.expand(entity, field, term) {
            return values.to_vec();
        }
        match self.resolve_alias(entity, field, term) {
            Some(canonical) => vec![canonical.to_owned()],
            None => vec![term.trim().to_owned()],
        }
    }

    /// Known terms for `entity` occurring in free text, longest first, one
    /// match per field.
    pub fn find_terms(&self, entity: &str, text: &str) -> Vec<TermMatch> {
        let haystack = text.to_lowercase();
        let mut candidates: Vec<TermMatch> = Vec::new();

        for ((e, field), table) in &self.expansions {
            if e != entity {
                continue;
            }
            for (term, values) in table {
                if haystack.contains(term.as_str()) {
                    candidates.push(TermMatch {
                        field: field.clone(),
                        term: term.clone(),
                        values: values.clone(),
                    });
                }
            }
        }
        for ((e, field), table) in &self.aliases {
            if e != entity {
                continue;
            }
            for (term, canonical) in table {
                if haystack.contains(term.as_str()) {
                    candidates.push(TermMatch {
                        field: field.clone(),
                        term: term.clone(),
                        values: vec![canonical.clone()],
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.term
                .chars()
                .count()
                .cmp(&a.term.chars().count())
                .then_with(|| a.field.cmp(&b.field))
                .then_with(|| a.term.cmp(&b.term))
        });
        let mut seen = Vec::new();
        candidates.retain(|m| {
            if seen.contains(&m.field) {
                false
            } else {
                seen.push(m.field.clone());
                true
            }
        });
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocabulary() -> Vocabulary {
        let mut vocabulary = Vocabulary::new();
        vocabulary.add_expansion("Room", "status", "空闲", ["vacant_clean", "vacant_dirty"]);
        vocabulary.add_expansion("Room", "status", "available", ["vacant_clean", "vacant_dirty"]);
        vocabulary.add_alias("Room", "status", "空闲干净", "vacant_clean");
        vocabulary.add_alias("Room", "status", "脏房", "vacant_dirty");
        vocabulary.add_alias("Room", "status", "Occupied", "occupied");
        vocabulary
    }

    #[test]
    fn expansion_wins_over_alias() {
        let v = vocabulary();
        assert_eq!(
            v.canonicalize("Room", "status", "Available"),
            vec!["vacant_clean", "vacant_dirty"]
        );
        assert_eq!(v.canonicalize("Room", "status", "脏房"), vec!["vacant_dirty"]);
        assert_eq!(v.canonicalize("Room", "status", "occupied"), vec!["occupied"]);
        assert_eq!(v.canonicalize("Room", "status", "unknown"), vec!["unknown"]);
    }

    #[test]
    fn longest_term_in_text_wins() {
        let v = vocabulary();
        let matches = v.find_terms("Room", "查一下空闲干净的房间");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].values, vec!["vacant_clean"]);

        let matches = v.find_terms("Room", "有哪些空闲房");
        assert_eq!(matches[0].values, vec!["vacant_clean", "vacant_dirty"]);
    }

    #[test]
    fn other_entities_are_ignored() {
        assert!(vocabulary().find_terms("Task", "空闲").is_empty());
    }
}
