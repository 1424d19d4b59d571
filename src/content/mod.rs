//! Content taxonomy and prompt analysis
//!
//! Hierarchical category store with word mappings, used for prompt
//! enhancement and safety triage. Categories form a forest: a parent must
//! exist before its children, so cycles are impossible by construction.

pub mod seed;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::{EaselError, Result};

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    path TEXT PRIMARY KEY,             -- slash-delimited, e.g. 'subject/person/hair'
    parent_path TEXT,                  -- NULL for roots
    category_type TEXT NOT NULL,
    description TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_categories_type ON categories(category_type);
CREATE INDEX IF NOT EXISTS idx_categories_parent ON categories(parent_path);

CREATE TABLE IF NOT EXISTS words (
    word TEXT NOT NULL,                -- normalized lowercase
    category_path TEXT NOT NULL REFERENCES categories(path),
    confidence REAL NOT NULL DEFAULT 1.0,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (word, category_path)
);

CREATE INDEX IF NOT EXISTS idx_words_word ON words(word);
"#;

/// Safety triage level for a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Safe,
    Moderate,
    Explicit,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Moderate => "moderate",
            SafetyLevel::Explicit => "explicit",
        }
    }
}

/// One matched word with its category
#[derive(Debug, Clone, Serialize)]
pub struct WordMatch {
    pub word: String,
    pub category_path: String,
    pub confidence: f64,
}

/// Prompt analysis result
#[derive(Debug, Clone, Serialize)]
pub struct PromptAnalysis {
    pub matched: Vec<WordMatch>,
    pub categories_present: BTreeSet<String>,
    pub missing_axes: Vec<&'static str>,
    pub safety_level: SafetyLevel,
    pub safety_score: f64,
    /// Matches found in the negative prompt (excluded from safety scoring)
    pub negative_matched: Vec<WordMatch>,
}

/// Enhanced prompt output
#[derive(Debug, Clone, Serialize)]
pub struct EnhancedPrompt {
    pub prompt: String,
    pub additions: Vec<String>,
    pub removed: Vec<String>,
    pub annotation: Option<String>,
}

/// Category row
#[derive(Debug, Clone, Serialize)]
pub struct CategoryRow {
    pub path: String,
    pub parent_path: Option<String>,
    pub category_type: String,
    pub description: String,
}

/// Axes checked for enhancement, with the canonical filler appended when the
/// axis is absent from the prompt.
const AXES: &[(&str, &str, &str)] = &[
    ("quality", "style/quality", "high quality, detailed"),
    ("style", "style/medium", "professional digital art"),
    ("lighting", "environment/lighting", "soft lighting"),
];

const NSFW_PREFIX: &str = "content_filter/nsfw";
const EXPLICIT_LEVEL: f64 = 0.5;
const MODERATE_LEVEL: f64 = 0.2;

/// Content taxonomy store (thread-safe via Mutex)
pub struct ContentDb {
    conn: Mutex<Connection>,
}

impl ContentDb {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EaselError::Internal(format!("content db lock poisoned: {}", e)))
    }

    /// Open or create the store at path, seeding the built-in taxonomy on
    /// first init
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        {
            let conn = self.conn()?;
            let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            if version < SCHEMA_VERSION {
                conn.execute_batch(SCHEMA)?;
                conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
            }
        }
        self.seed_if_empty()?;
        Ok(())
    }

    fn seed_if_empty(&self) -> Result<()> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM categories", [], |row| row.get(0))?;
        if count > 0 {
            return Ok(());
        }

        for (path, category_type, description) in seed::CATEGORIES {
            self.add_category(path, category_type, description)?;
        }
        self.add_words(
            &seed::WORDS
                .iter()
                .map(|(w, p, c)| (w.to_string(), p.to_string(), *c))
                .collect::<Vec<_>>(),
        )?;
        Ok(())
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Add a category. The parent path (everything before the last slash)
    /// must already exist; single-segment paths are roots.
    pub fn add_category(&self, path: &str, category_type: &str, description: &str) -> Result<()> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(EaselError::Validation("empty category path".to_string()));
        }

        let parent_path = path.rsplit_once('/').map(|(parent, _)| parent.to_string());
        if let Some(parent) = &parent_path {
            let exists: i64 = self.conn()?.query_row(
                "SELECT COUNT(*) FROM categories WHERE path = ?1",
                params![parent],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(EaselError::NotFound(format!(
                    "parent category '{}' does not exist",
                    parent
                )));
            }
        }

        self.conn()?.execute(
            "INSERT OR IGNORE INTO categories (path, parent_path, category_type, description, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![path, parent_path, category_type, description, crate::now_ms()],
        )?;
        Ok(())
    }

    /// Add word mappings. Every category path must exist.
    pub fn add_words(&self, entries: &[(String, String, f64)]) -> Result<usize> {
        let conn = self.conn()?;
        let mut added = 0;
        for (word, path, confidence) in entries {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM categories WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(EaselError::NotFound(format!(
                    "category '{}' does not exist",
                    path
                )));
            }
            conn.execute(
                "INSERT OR REPLACE INTO words (word, category_path, confidence, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    word.to_lowercase().trim(),
                    path,
                    confidence.clamp(0.0, 1.0),
                    crate::now_ms()
                ],
            )?;
            added += 1;
        }
        Ok(added)
    }

    /// Search word mappings by substring
    pub fn search_words(&self, query: &str, limit: usize) -> Result<Vec<WordMatch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT word, category_path, confidence FROM words \
             WHERE word LIKE ?1 ORDER BY word LIMIT ?2",
        )?;
        let needle = format!("%{}%", query.to_lowercase());
        let rows = stmt.query_map(params![needle, limit as i64], |row| {
            Ok(WordMatch {
                word: row.get(0)?,
                category_path: row.get(1)?,
                confidence: row.get(2)?,
            })
        })?;
        let mut matches = Vec::new();
        for row in rows {
            matches.push(row?);
        }
        Ok(matches)
    }

    /// List categories, optionally filtered by type
    pub fn categories(&self, category_type: Option<&str>) -> Result<Vec<CategoryRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT path, parent_path, category_type, description FROM categories \
             WHERE (?1 IS NULL OR category_type = ?1) ORDER BY path",
        )?;
        let rows = stmt.query_map(params![category_type], |row| {
            Ok(CategoryRow {
                path: row.get(0)?,
                parent_path: row.get(1)?,
                category_type: row.get(2)?,
                description: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            })
        })?;
        let mut categories = Vec::new();
        for row in rows {
            categories.push(row?);
        }
        Ok(categories)
    }

    // =========================================================================
    // Analysis
    // =========================================================================

    fn all_mappings(&self) -> Result<Vec<WordMatch>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT word, category_path, confidence FROM words ORDER BY word")?;
        let rows = stmt.query_map([], |row| {
            Ok(WordMatch {
                word: row.get(0)?,
                category_path: row.get(1)?,
                confidence: row.get(2)?,
            })
        })?;
        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row?);
        }
        Ok(mappings)
    }

    fn normalize(text: &str) -> String {
        let lowered = text.to_lowercase();
        let cleaned: String = lowered
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();
        cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Match mappings against text: case-insensitive whole-word, multi-word
    /// phrases greedily longest-first (matched spans are consumed).
    fn match_text(mappings: &[WordMatch], text: &str) -> Vec<WordMatch> {
        let mut working = format!(" {} ", Self::normalize(text));
        let mut matched = Vec::new();

        // Phrases first, longest first, so "dramatic lighting" wins over
        // "lighting"
        let mut ordered: Vec<&WordMatch> = mappings.iter().collect();
        ordered.sort_by(|a, b| b.word.len().cmp(&a.word.len()).then_with(|| a.word.cmp(&b.word)));

        for mapping in ordered {
            let needle = format!(" {} ", mapping.word);
            if working.contains(&needle) {
                matched.push(mapping.clone());
                if mapping.word.contains(' ') {
                    working = working.replace(&needle, " ");
                }
            }
        }

        matched.sort_by(|a, b| a.word.cmp(&b.word).then_with(|| a.category_path.cmp(&b.category_path)));
        matched
    }

    /// Analyze a prompt: matched words, categories present, missing axes,
    /// and a safety score summed over `content_filter/nsfw` matches.
    pub fn analyze(&self, prompt: &str, negative_prompt: &str) -> Result<PromptAnalysis> {
        let mappings = self.all_mappings()?;

        let matched = Self::match_text(&mappings, prompt);
        let negative_matched = if negative_prompt.is_empty() {
            vec![]
        } else {
            Self::match_text(&mappings, negative_prompt)
        };

        let categories_present: BTreeSet<String> = matched
            .iter()
            .map(|m| m.category_path.clone())
            .collect();

        let missing_axes = AXES
            .iter()
            .filter(|(_, prefix, _)| {
                !categories_present
                    .iter()
                    .any(|path| path.starts_with(prefix))
            })
            .map(|(axis, _, _)| *axis)
            .collect();

        let safety_score: f64 = matched
            .iter()
            .filter(|m| m.category_path.starts_with(NSFW_PREFIX))
            .map(|m| m.confidence)
            .sum::<f64>()
            .min(1.0);

        let safety_level = if safety_score >= EXPLICIT_LEVEL {
            SafetyLevel::Explicit
        } else if safety_score >= MODERATE_LEVEL {
            SafetyLevel::Moderate
        } else {
            SafetyLevel::Safe
        };

        Ok(PromptAnalysis {
            matched,
            categories_present,
            missing_axes,
            safety_level,
            safety_score,
            negative_matched,
        })
    }

    /// Enhance a prompt: append canonical fillers for missing axes and,
    /// when the safety filter is on and the prompt is explicit, strip the
    /// matched explicit tokens and annotate the result.
    pub fn enhance(
        &self,
        prompt: &str,
        apply_suggestions: bool,
        safety_filter: bool,
    ) -> Result<EnhancedPrompt> {
        let analysis = self.analyze(prompt, "")?;

        let mut working = prompt.to_string();
        let mut removed = Vec::new();
        let mut annotation = None;

        if safety_filter && analysis.safety_level == SafetyLevel::Explicit {
            for m in analysis
                .matched
                .iter()
                .filter(|m| m.category_path.starts_with(NSFW_PREFIX))
            {
                let pattern = &m.word;
                // Word-boundary removal over a normalized copy
                let mut rebuilt = Vec::new();
                let padded = format!(" {} ", Self::normalize(&working));
                let needle = format!(" {} ", pattern);
                if padded.contains(&needle) {
                    for token in working.split_whitespace() {
                        let normalized_token = Self::normalize(token);
                        if normalized_token == *pattern {
                            continue;
                        }
                        rebuilt.push(token.to_string());
                    }
                    working = rebuilt.join(" ");
                    removed.push(pattern.clone());
                }
            }
            if !removed.is_empty() {
                annotation = Some(format!("removed explicit terms: {}", removed.join(", ")));
            }
        }

        let mut additions = Vec::new();
        if apply_suggestions {
            for (axis, _, filler) in AXES {
                if analysis.missing_axes.contains(axis) {
                    additions.push(filler.to_string());
                }
            }
            if !additions.is_empty() {
                if !working.trim().is_empty() {
                    let trimmed = working
                        .trim_end_matches(|c: char| c == ' ' || c == ',')
                        .to_string();
                    working = format!("{}, {}", trimmed, additions.join(", "));
                } else {
                    working = additions.join(", ");
                }
            }
        }

        Ok(EnhancedPrompt {
            prompt: working,
            additions,
            removed,
            annotation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_taxonomy_is_a_forest() -> Result<()> {
        let db = ContentDb::in_memory()?;
        for row in db.categories(None)? {
            if let Some(parent) = &row.parent_path {
                let found = db
                    .categories(None)?
                    .iter()
                    .any(|c| &c.path == parent);
                assert!(found, "parent '{}' missing for '{}'", parent, row.path);
            }
        }
        Ok(())
    }

    #[test]
    fn add_category_requires_parent() -> Result<()> {
        let db = ContentDb::in_memory()?;
        let err = db
            .add_category("nonexistent/child", "subject", "orphan")
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        db.add_category("subject/vehicle", "subject", "Vehicles")?;
        db.add_category("subject/vehicle/car", "subject", "Cars")?;
        Ok(())
    }

    #[test]
    fn add_words_requires_category() -> Result<()> {
        let db = ContentDb::in_memory()?;
        let err = db
            .add_words(&[("zeppelin".to_string(), "subject/aircraft".to_string(), 1.0)])
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        Ok(())
    }

    #[test]
    fn analyze_finds_whole_words_and_phrases() -> Result<()> {
        let db = ContentDb::in_memory()?;
        let analysis = db.analyze("woman with dramatic lighting in the park", "")?;

        let words: Vec<&str> = analysis.matched.iter().map(|m| m.word.as_str()).collect();
        assert!(words.contains(&"woman"));
        assert!(words.contains(&"dramatic lighting"));
        assert!(words.contains(&"park"));
        // "light" or "dramatic" alone are not mapped words; the phrase wins
        assert!(analysis
            .categories_present
            .contains("environment/lighting/dramatic"));
        Ok(())
    }

    #[test]
    fn safety_scenario_topless_woman() -> Result<()> {
        let db = ContentDb::in_memory()?;
        let analysis = db.analyze("topless woman on beach", "")?;
        assert_eq!(analysis.safety_level, SafetyLevel::Explicit);
        assert!(analysis.safety_score >= 0.5);

        let enhanced = db.enhance("topless woman on beach", false, true)?;
        assert!(!enhanced.prompt.contains("topless"));
        assert!(enhanced.removed.contains(&"topless".to_string()));
        assert!(enhanced.annotation.is_some());
        Ok(())
    }

    #[test]
    fn safety_is_monotone_in_explicit_tokens() -> Result<()> {
        let db = ContentDb::in_memory()?;
        let base = db.analyze("woman on beach", "")?;
        let with_one = db.analyze("topless woman on beach", "")?;
        let with_two = db.analyze("nude topless woman on beach", "")?;
        assert!(with_one.safety_score >= base.safety_score);
        assert!(with_two.safety_score >= with_one.safety_score);
        assert!(with_two.safety_score <= 1.0);
        Ok(())
    }

    #[test]
    fn enhance_fills_missing_axes() -> Result<()> {
        let db = ContentDb::in_memory()?;
        let analysis = db.analyze("woman in the park", "")?;
        assert!(analysis.missing_axes.contains(&"quality"));
        assert!(analysis.missing_axes.contains(&"lighting"));

        let enhanced = db.enhance("woman in the park", true, false)?;
        assert!(enhanced.prompt.contains("high quality, detailed"));
        assert!(enhanced.prompt.contains("soft lighting"));
        assert!(enhanced.prompt.starts_with("woman in the park"));

        // A prompt that already covers an axis gets no filler for it
        let enhanced = db.enhance("masterpiece painting of a woman", true, false)?;
        assert!(!enhanced.additions.contains(&"high quality, detailed".to_string()));
        Ok(())
    }

    #[test]
    fn negative_prompt_matches_do_not_affect_safety() -> Result<()> {
        let db = ContentDb::in_memory()?;
        let analysis = db.analyze("woman in the park", "nude, blurry")?;
        assert_eq!(analysis.safety_level, SafetyLevel::Safe);
        assert!(analysis
            .negative_matched
            .iter()
            .any(|m| m.word == "nude"));
        Ok(())
    }
}
