//! Letter persistence and moderation collaborators.
//!
//! The protection layer only consumes these through traits. The in-process
//! implementations let the service run without a database or a moderation
//! backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

use crate::core::clock::Clock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("letter store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation backend failed: {0}")]
    Backend(String),
}

/// A stored letter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Letter {
    pub id: String,
    pub content: String,
    pub author: String,
    pub recipient: Option<String>,
    /// Identity of the submitter, never serialized
    #[serde(skip_serializing, default)]
    pub ip: String,
    pub created_at: DateTime<Utc>,
}

/// Sanitised, moderated input for a new letter
#[derive(Debug, Clone, PartialEq)]
pub struct NewLetter {
    pub content: String,
    pub author: String,
    pub recipient: Option<String>,
    pub ip: String,
}

/// One page of letters, newest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LetterPage {
    pub letters: Vec<Letter>,
    pub total: usize,
}

#[cfg_attr(test, mockall::automock)]
pub trait LetterStore: Send + Sync {
    fn create(&self, letter: NewLetter) -> Result<Letter, StoreError>;
    fn get(&self, id: &str) -> Result<Option<Letter>, StoreError>;
    /// `page` is 1-based
    fn list(&self, page: usize, limit: usize) -> Result<LetterPage, StoreError>;
    fn count(&self) -> Result<usize, StoreError>;
    /// Case-insensitive match on content, author and recipient
    fn search(&self, query: &str, page: usize, limit: usize) -> Result<LetterPage, StoreError>;
}

pub struct InMemoryLetterStore {
    letters: RwLock<Vec<Letter>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLetterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            letters: RwLock::new(Vec::new()),
            clock,
        }
    }
}

fn paginate(mut matches: Vec<Letter>, page: usize, limit: usize) -> LetterPage {
    let total = matches.len();
    matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let start = page.saturating_sub(1).saturating_mul(limit);
    LetterPage {
        letters: matches.into_iter().skip(start).take(limit).collect(),
        total,
    }
}

impl LetterStore for InMemoryLetterStore {
    fn create(&self, letter: NewLetter) -> Result<Letter, StoreError> {
        let letter = Letter {
            id: Uuid::new_v4().to_string(),
            content: letter.content,
            author: letter.author,
            recipient: letter.recipient,
            ip: letter.ip,
            created_at: self.clock.now(),
        };
        self.letters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(letter.clone());
        Ok(letter)
    }

    fn get(&self, id: &str) -> Result<Option<Letter>, StoreError> {
        let letters = self.letters.read().unwrap_or_else(PoisonError::into_inner);
        Ok(letters.iter().find(|letter| letter.id == id).cloned())
    }

    fn list(&self, page: usize, limit: usize) -> Result<LetterPage, StoreError> {
        let letters = self.letters.read().unwrap_or_else(PoisonError::into_inner);
        Ok(paginate(letters.clone(), page, limit))
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.letters.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    fn search(&self, query: &str, page: usize, limit: usize) -> Result<LetterPage, StoreError> {
        let needle = query.to_lowercase();
        let letters = self.letters.read().unwrap_or_else(PoisonError::into_inner);
        let matches = letters
            .iter()
            .filter(|letter| {
                letter.content.to_lowercase().contains(&needle)
                    || letter.author.to_lowercase().contains(&needle)
                    || letter
                        .recipient
                        .as_ref()
                        .map_or(false, |r| r.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        Ok(paginate(matches, page, limit))
    }
}

/// Moderation verdict for a piece of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationOutcome {
    pub accepted: bool,
    /// Text to store, possibly with offending parts removed
    pub filtered_text: String,
    pub message: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
pub trait ContentModerator: Send + Sync {
    fn moderate(&self, text: &str) -> Result<ModerationOutcome, ModerationError>;
}

/// Accepts everything unchanged
#[derive(Debug, Default)]
pub struct PassThroughModerator;

impl ContentModerator for PassThroughModerator {
    fn moderate(&self, text: &str) -> Result<ModerationOutcome, ModerationError> {
        Ok(ModerationOutcome {
            accepted: true,
            filtered_text: text.to_string(),
            message: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn new_letter(content: &str, author: &str) -> NewLetter {
        NewLetter {
            content: content.to_string(),
            author: author.to_string(),
            recipient: None,
            ip: "1.2.3.4".to_string(),
        }
    }

    #[test]
    fn test_create_list_and_search() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap());
        let store = InMemoryLetterStore::new(Arc::new(clock.clone()));

        for n in 0..5 {
            store.create(new_letter(&format!("letter {}", n), "Ana")).unwrap();
            clock.advance(Duration::minutes(1));
        }
        let rain = store.create(new_letter("The Rain in Lisbon", "Rui")).unwrap();

        assert_eq!(store.count().unwrap(), 6);
        let first = store.list(1, 4).unwrap();
        assert_eq!(first.total, 6);
        assert_eq!(first.letters[0].id, rain.id);
        assert_eq!(store.list(2, 4).unwrap().letters.len(), 2);
        assert!(store.list(3, 4).unwrap().letters.is_empty());

        let found = store.search("rain", 1, 10).unwrap();
        assert_eq!(found.total, 1);
        assert_eq!(store.get(&rain.id).unwrap().unwrap().author, "Rui");
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_ip_is_not_serialized() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap());
        let store = InMemoryLetterStore::new(Arc::new(clock));
        let letter = store.create(new_letter("hello", "Ana")).unwrap();
        let value = serde_json::to_value(&letter).unwrap();
        assert!(value.get("ip").is_none());
        assert_eq!(value["createdAt"], "2026-05-01T09:00:00Z");
    }

    #[test]
    fn test_pass_through_moderator() {
        let outcome = PassThroughModerator.moderate("kind words").unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.filtered_text, "kind words");
    }
}
