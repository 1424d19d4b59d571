//! LoRA catalog
//!
//! Persistent index of the engine's LoRAs plus the derived intelligence:
//! categorization, trigger words, content rating, prompt scoring, conflict
//! rules, and weight optimization. Sync is idempotent and skips the write
//! pass entirely when the engine's list hasn't changed.

pub mod analysis;

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::{EaselError, Result};
use crate::sd::SdGateway;
use analysis::{Category, ContentType};

/// Combined weight cap across non-concept LoRAs
pub const MAX_COMBINED_WEIGHT: f64 = 2.4;
/// Style LoRAs above this weight count toward the one-strong-style rule
pub const STYLE_WEIGHT_LIMIT: f64 = 0.7;

const DEFAULT_MIN_WEIGHT: f64 = 0.2;
const DEFAULT_MAX_WEIGHT: f64 = 1.5;
const TRIGGER_LIMIT: usize = 10;
const SCHEMA_VERSION: i32 = 2;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS loras (
    name TEXT PRIMARY KEY,
    filename TEXT,
    path TEXT,
    alias TEXT,
    category TEXT NOT NULL DEFAULT 'general',
    content_type TEXT NOT NULL DEFAULT 'safe',
    description TEXT,
    trigger_words TEXT NOT NULL DEFAULT '[]',    -- JSON array
    tag_frequency TEXT NOT NULL DEFAULT '{}',    -- JSON object tag -> count
    recommended_weight REAL NOT NULL DEFAULT 1.0,
    min_weight REAL NOT NULL DEFAULT 0.2,
    max_weight REAL NOT NULL DEFAULT 1.5,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_loras_category ON loras(category);

CREATE TABLE IF NOT EXISTS sync_meta (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    synced_at INTEGER NOT NULL,
    lora_count INTEGER NOT NULL,
    list_hash TEXT NOT NULL,
    duration_ms INTEGER NOT NULL
);
"#;

/// A cataloged LoRA with derived metadata
#[derive(Debug, Clone, Serialize)]
pub struct LoraRecord {
    pub name: String,
    pub filename: String,
    pub path: String,
    pub alias: Option<String>,
    pub category: Category,
    pub content_type: ContentType,
    pub description: String,
    pub trigger_words: Vec<String>,
    #[serde(skip)]
    pub tag_frequency: BTreeMap<String, i64>,
    pub recommended_weight: f64,
    pub min_weight: f64,
    pub max_weight: f64,
}

/// A caller-selected LoRA with its intended weight
#[derive(Debug, Clone)]
pub struct LoraSelection {
    pub name: String,
    pub weight: f64,
}

/// A rule violation with remediation
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub rule: &'static str,
    /// Names of the LoRAs involved, in the selection's ranking order
    pub loras: Vec<String>,
    pub message: String,
    pub suggestion: String,
}

/// Weight optimization target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StylePreference {
    Subtle,
    Balanced,
    Strong,
}

impl StylePreference {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subtle" => Some(StylePreference::Subtle),
            "balanced" => Some(StylePreference::Balanced),
            "strong" => Some(StylePreference::Strong),
            _ => None,
        }
    }

    fn factor(&self) -> f64 {
        match self {
            StylePreference::Subtle => 0.6,
            StylePreference::Balanced => 1.0,
            StylePreference::Strong => 1.3,
        }
    }
}

/// Prompt-driven suggestion
#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub name: String,
    pub category: Category,
    pub score: f64,
    pub confidence: &'static str,
    pub matching_tags: Vec<String>,
    pub recommended_weight: f64,
}

/// Relevance-ranked search hit
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub name: String,
    pub category: Category,
    pub score: f64,
    pub description: String,
    pub trigger_words: Vec<String>,
}

/// Catalog totals for the summary tool
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    pub total: i64,
    pub by_category: Vec<(String, i64)>,
    pub top_trigger_words: Vec<(String, i64)>,
}

/// Result of a sync pass
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub updated: usize,
    pub skipped: bool,
    pub reason: String,
    pub duration_ms: i64,
}

/// LoRA catalog store (thread-safe via Mutex)
pub struct LoraCatalog {
    conn: Mutex<Connection>,
    /// Explicit pairwise deny list (operator data)
    deny_pairs: Vec<(String, String)>,
}

impl LoraCatalog {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EaselError::Internal(format!("lora catalog lock poisoned: {}", e)))
    }

    /// Open or create the catalog at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let catalog = Self {
            conn: Mutex::new(conn),
            deny_pairs: Vec::new(),
        };
        catalog.init()?;
        Ok(catalog)
    }

    /// Open an in-memory catalog (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self {
            conn: Mutex::new(conn),
            deny_pairs: Vec::new(),
        };
        catalog.init()?;
        Ok(catalog)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
        }
        Ok(())
    }

    /// Install the pairwise deny list
    pub fn set_deny_pairs(&mut self, pairs: Vec<(String, String)>) {
        self.deny_pairs = pairs;
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Pull the engine's LoRA list and refresh derived records.
    ///
    /// Skips the write pass when the engine's list hash and count are
    /// unchanged since the last sync. Re-running against identical input
    /// yields identical records.
    pub async fn sync_from_gateway(&self, gateway: &SdGateway) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let entries = gateway.list_loras().await?;

        let list_hash = {
            let mut keys: Vec<String> = entries
                .iter()
                .map(|e| format!("{}:{}", e.name, e.path.as_deref().unwrap_or("")))
                .collect();
            keys.sort();
            let mut hasher = DefaultHasher::new();
            keys.join("|").hash(&mut hasher);
            format!("{:016x}", hasher.finish())
        };

        if let Some((last_count, last_hash)) = self.last_sync()? {
            if last_count == entries.len() as i64 && last_hash == list_hash {
                return Ok(SyncReport {
                    total: entries.len(),
                    updated: 0,
                    skipped: true,
                    reason: "no changes detected".to_string(),
                    duration_ms: started.elapsed().as_millis() as i64,
                });
            }
        }

        let mut updated = 0;
        {
            let conn = self.conn()?;
            let now = crate::now_ms();
            for entry in &entries {
                let path = entry.path.clone().unwrap_or_default();
                let tag_freq = analysis::parse_tag_frequency(&entry.metadata);

                let (category, trigger_words, content_type, description) = if tag_freq.is_empty() {
                    let (category, triggers, content_type) =
                        analysis::analyze_from_name(&entry.name, &path);
                    let description = format!("{} (inferred from name)", entry.name);
                    (category, triggers, content_type, description)
                } else {
                    let category = analysis::categorize_from_tags(&tag_freq);
                    let triggers = analysis::extract_trigger_words(&tag_freq, TRIGGER_LIMIT);
                    let content_type = analysis::detect_content_type(&tag_freq);
                    let description = if triggers.is_empty() {
                        String::new()
                    } else {
                        format!("Trained on: {}", triggers[..triggers.len().min(5)].join(", "))
                    };
                    (category, triggers, content_type, description)
                };

                let filename = Path::new(&path)
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_default();

                conn.execute(
                    "INSERT INTO loras (name, filename, path, alias, category, content_type, \
                     description, trigger_words, tag_frequency, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10) \
                     ON CONFLICT(name) DO UPDATE SET \
                       filename = excluded.filename, path = excluded.path, \
                       alias = excluded.alias, category = excluded.category, \
                       content_type = excluded.content_type, \
                       description = excluded.description, \
                       trigger_words = excluded.trigger_words, \
                       tag_frequency = excluded.tag_frequency, \
                       updated_at = excluded.updated_at",
                    params![
                        entry.name,
                        filename,
                        path,
                        entry.alias,
                        category.as_str(),
                        content_type.as_str(),
                        description,
                        serde_json::to_string(&trigger_words)?,
                        serde_json::to_string(&tag_freq)?,
                        now,
                    ],
                )?;
                updated += 1;
            }

            let duration_ms = started.elapsed().as_millis() as i64;
            conn.execute(
                "INSERT INTO sync_meta (synced_at, lora_count, list_hash, duration_ms) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![now, entries.len() as i64, list_hash, duration_ms],
            )?;
        }

        Ok(SyncReport {
            total: entries.len(),
            updated,
            skipped: false,
            reason: "catalog refreshed".to_string(),
            duration_ms: started.elapsed().as_millis() as i64,
        })
    }

    fn last_sync(&self) -> Result<Option<(i64, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT lora_count, list_hash FROM sync_meta ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        if let Some(row) = rows.next()? {
            Ok(Some((row.get(0)?, row.get(1)?)))
        } else {
            Ok(None)
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LoraRecord> {
        let category: String = row.get(4)?;
        let content_type: String = row.get(5)?;
        let trigger_words: String = row.get(7)?;
        let tag_frequency: String = row.get(8)?;
        Ok(LoraRecord {
            name: row.get(0)?,
            filename: row.get(1)?,
            path: row.get(2)?,
            alias: row.get(3)?,
            category: Category::parse(&category).unwrap_or(Category::General),
            content_type: ContentType::parse(&content_type),
            description: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            trigger_words: serde_json::from_str(&trigger_words).unwrap_or_default(),
            tag_frequency: serde_json::from_str(&tag_frequency).unwrap_or_default(),
            recommended_weight: row.get(9)?,
            min_weight: row.get(10)?,
            max_weight: row.get(11)?,
        })
    }

    const RECORD_COLUMNS: &'static str = "name, filename, path, alias, category, content_type, \
         description, trigger_words, tag_frequency, recommended_weight, min_weight, max_weight";

    /// Get one record by name
    pub fn get(&self, name: &str) -> Result<Option<LoraRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM loras WHERE name = ?1",
            Self::RECORD_COLUMNS
        ))?;
        let mut rows = stmt.query(params![name])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::record_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    fn all_records(&self) -> Result<Vec<LoraRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM loras ORDER BY name",
            Self::RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Totals, counts by category, and global top trigger words
    pub fn summary(&self) -> Result<CatalogSummary> {
        let conn = self.conn()?;

        let mut by_category = Vec::new();
        let mut total = 0;
        {
            let mut stmt = conn.prepare(
                "SELECT category, COUNT(*) FROM loras GROUP BY category ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (category, count) = row?;
                total += count;
                by_category.push((category, count));
            }
        }

        let mut trigger_counts: BTreeMap<String, i64> = BTreeMap::new();
        {
            let mut stmt = conn.prepare("SELECT trigger_words FROM loras")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let triggers: Vec<String> = serde_json::from_str(&row?).unwrap_or_default();
                for trigger in triggers {
                    *trigger_counts.entry(trigger).or_insert(0) += 1;
                }
            }
        }
        let mut top: Vec<(String, i64)> = trigger_counts.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(10);

        Ok(CatalogSummary {
            total,
            by_category,
            top_trigger_words: top,
        })
    }

    /// List LoRAs in one category
    pub fn browse(&self, category: Category, limit: usize) -> Result<Vec<LoraRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM loras WHERE category = ?1 ORDER BY name LIMIT ?2",
            Self::RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![category.as_str(), limit as i64], Self::record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Relevance-ranked search over name, description, and tags.
    ///
    /// Score: substring match on name/description 0.4, tag membership 0.4,
    /// category name match 0.2.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let needle = query.to_lowercase();
        let mut hits: Vec<SearchHit> = Vec::new();

        for record in self.all_records()? {
            let mut score = 0.0;
            if record.name.to_lowercase().contains(&needle)
                || record.description.to_lowercase().contains(&needle)
            {
                score += 0.4;
            }
            if record
                .trigger_words
                .iter()
                .any(|t| t.to_lowercase().contains(&needle))
                || record.tag_frequency.keys().any(|t| t.to_lowercase() == needle)
            {
                score += 0.4;
            }
            if record.category.as_str() == needle {
                score += 0.2;
            }

            if score > 0.0 {
                hits.push(SearchHit {
                    name: record.name,
                    category: record.category,
                    score,
                    description: record.description,
                    trigger_words: record.trigger_words.into_iter().take(3).collect(),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Score every LoRA against the prompt and return the top matches
    pub fn suggest_for_prompt(&self, prompt: &str, limit: usize) -> Result<Vec<Suggestion>> {
        let mut suggestions: Vec<Suggestion> = Vec::new();

        for record in self.all_records()? {
            if record.tag_frequency.is_empty() {
                continue;
            }
            let (score, matching_tags) = analysis::prompt_tag_score(prompt, &record.tag_frequency);
            if score <= 0.05 {
                continue;
            }
            suggestions.push(Suggestion {
                name: record.name,
                category: record.category,
                score,
                confidence: analysis::confidence_for(score),
                matching_tags: matching_tags.into_iter().take(5).collect(),
                recommended_weight: record.recommended_weight,
            });
        }

        suggestions.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        suggestions.truncate(limit);
        Ok(suggestions)
    }

    // =========================================================================
    // Combination rules
    // =========================================================================

    fn category_of(&self, name: &str) -> Result<Category> {
        Ok(self
            .get(name)?
            .map(|r| r.category)
            .unwrap_or(Category::General))
    }

    /// Detect conflicts in a selection. Selections are assumed ranked, best
    /// first, so remediation keeps the leading entry. An empty return means
    /// the combination is valid.
    pub fn validate_combination(&self, selected: &[LoraSelection]) -> Result<Vec<Conflict>> {
        let mut conflicts = Vec::new();

        let mut categories = Vec::with_capacity(selected.len());
        for selection in selected {
            categories.push(self.category_of(&selection.name)?);
        }

        // (a) at most one character LoRA
        let characters: Vec<&str> = selected
            .iter()
            .zip(&categories)
            .filter(|(_, c)| **c == Category::Character)
            .map(|(s, _)| s.name.as_str())
            .collect();
        if characters.len() > 1 {
            conflicts.push(Conflict {
                rule: "at-most-one-character",
                loras: characters.iter().map(|s| s.to_string()).collect(),
                message: format!(
                    "multiple character LoRAs selected: {}",
                    characters.join(", ")
                ),
                suggestion: format!(
                    "keep '{}' and drop the other character LoRAs",
                    characters[0]
                ),
            });
        }

        // (b) at most one style LoRA above the strong-weight limit
        let strong_styles: Vec<&str> = selected
            .iter()
            .zip(&categories)
            .filter(|(s, c)| **c == Category::Style && s.weight > STYLE_WEIGHT_LIMIT)
            .map(|(s, _)| s.name.as_str())
            .collect();
        if strong_styles.len() > 1 {
            conflicts.push(Conflict {
                rule: "at-most-one-strong-style",
                loras: strong_styles.iter().map(|s| s.to_string()).collect(),
                message: format!(
                    "multiple style LoRAs above weight {}: {}",
                    STYLE_WEIGHT_LIMIT,
                    strong_styles.join(", ")
                ),
                suggestion: format!(
                    "keep '{}' strong and lower the others to {} or below",
                    strong_styles[0], STYLE_WEIGHT_LIMIT
                ),
            });
        }

        // (c) combined weight cap across non-concept LoRAs
        let combined: f64 = selected
            .iter()
            .zip(&categories)
            .filter(|(_, c)| **c != Category::Concept)
            .map(|(s, _)| s.weight)
            .sum();
        if combined > MAX_COMBINED_WEIGHT {
            let non_concept: Vec<String> = selected
                .iter()
                .zip(&categories)
                .filter(|(_, c)| **c != Category::Concept)
                .map(|(s, _)| s.name.clone())
                .collect();
            conflicts.push(Conflict {
                rule: "combined-weight-cap",
                loras: non_concept,
                message: format!(
                    "combined non-concept weight {:.2} exceeds {:.1}",
                    combined, MAX_COMBINED_WEIGHT
                ),
                suggestion: format!(
                    "scale weights down by {:.2}x",
                    MAX_COMBINED_WEIGHT / combined
                ),
            });
        }

        // (d) explicit pairwise deny list
        for (a, b) in &self.deny_pairs {
            let has_a = selected.iter().any(|s| &s.name == a);
            let has_b = selected.iter().any(|s| &s.name == b);
            if has_a && has_b {
                conflicts.push(Conflict {
                    rule: "deny-pair",
                    loras: vec![a.clone(), b.clone()],
                    message: format!("'{}' and '{}' are known to conflict", a, b),
                    suggestion: format!("drop '{}'", b),
                });
            }
        }

        Ok(conflicts)
    }

    /// Apply the style-preference factor to each recommended weight, clamped
    /// to the LoRA's own bounds.
    pub fn optimize_weights(
        &self,
        selected: &[LoraSelection],
        preference: StylePreference,
    ) -> Result<Vec<LoraSelection>> {
        let factor = preference.factor();
        let mut optimized = Vec::with_capacity(selected.len());

        for selection in selected {
            let (min_weight, max_weight) = match self.get(&selection.name)? {
                Some(record) => (record.min_weight, record.max_weight),
                None => (DEFAULT_MIN_WEIGHT, DEFAULT_MAX_WEIGHT),
            };
            optimized.push(LoraSelection {
                name: selection.name.clone(),
                weight: (selection.weight * factor).clamp(min_weight, max_weight),
            });
        }

        Ok(optimized)
    }

    /// Scale a selection uniformly so its non-concept combined weight fits
    /// the cap. Returns the factor applied (1.0 when nothing changed).
    pub fn cap_combined_weight(&self, selected: &mut [LoraSelection]) -> Result<f64> {
        let mut combined = 0.0;
        for selection in selected.iter() {
            if self.category_of(&selection.name)? != Category::Concept {
                combined += selection.weight;
            }
        }
        if combined <= MAX_COMBINED_WEIGHT || combined == 0.0 {
            return Ok(1.0);
        }
        let factor = MAX_COMBINED_WEIGHT / combined;
        for selection in selected.iter_mut() {
            selection.weight *= factor;
        }
        Ok(factor)
    }

    /// Test/bootstrap helper: insert a record directly
    pub fn insert_record(&self, record: &LoraRecord) -> Result<()> {
        let conn = self.conn()?;
        let now = crate::now_ms();
        conn.execute(
            "INSERT OR REPLACE INTO loras (name, filename, path, alias, category, content_type, \
             description, trigger_words, tag_frequency, recommended_weight, min_weight, \
             max_weight, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                record.name,
                record.filename,
                record.path,
                record.alias,
                record.category.as_str(),
                record.content_type.as_str(),
                record.description,
                serde_json::to_string(&record.trigger_words)?,
                serde_json::to_string(&record.tag_frequency)?,
                record.recommended_weight,
                record.min_weight,
                record.max_weight,
                now,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, category: Category, tags: &[(&str, i64)]) -> LoraRecord {
        LoraRecord {
            name: name.to_string(),
            filename: format!("{}.safetensors", name),
            path: format!("/loras/{}.safetensors", name),
            alias: None,
            category,
            content_type: ContentType::Safe,
            description: String::new(),
            trigger_words: vec![],
            tag_frequency: tags.iter().map(|(t, f)| (t.to_string(), *f)).collect(),
            recommended_weight: 1.0,
            min_weight: 0.2,
            max_weight: 1.5,
        }
    }

    fn selection(name: &str, weight: f64) -> LoraSelection {
        LoraSelection {
            name: name.to_string(),
            weight,
        }
    }

    #[test]
    fn suggest_is_deterministic_and_ranked() -> Result<()> {
        let catalog = LoraCatalog::in_memory()?;
        catalog.insert_record(&record(
            "animeStyleV4",
            Category::Anime,
            &[("anime", 500), ("1girl", 450), ("cat ears", 80), ("solo", 400)],
        ))?;
        catalog.insert_record(&record(
            "cityscapes",
            Category::Concept,
            &[("city", 300), ("night", 200)],
        ))?;

        let first = catalog.suggest_for_prompt("anime girl with cat ears", 5)?;
        let second = catalog.suggest_for_prompt("anime girl with cat ears", 5)?;

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "animeStyleV4");
        assert_eq!(first[0].confidence, "high");
        assert!((first[0].score - 0.720).abs() < 1e-3);

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.score, b.score);
        }
        Ok(())
    }

    #[test]
    fn two_characters_always_conflict() -> Result<()> {
        let catalog = LoraCatalog::in_memory()?;
        catalog.insert_record(&record("miku", Category::Character, &[]))?;
        catalog.insert_record(&record("zelda", Category::Character, &[]))?;

        let conflicts = catalog
            .validate_combination(&[selection("miku", 0.9), selection("zelda", 0.9)])?;
        assert!(conflicts.iter().any(|c| c.rule == "at-most-one-character"));
        assert!(conflicts[0].suggestion.contains("miku"));

        // Removing one clears it
        let conflicts = catalog.validate_combination(&[selection("miku", 0.9)])?;
        assert!(conflicts.iter().all(|c| c.rule != "at-most-one-character"));
        Ok(())
    }

    #[test]
    fn strong_style_rule_and_weight_cap() -> Result<()> {
        let catalog = LoraCatalog::in_memory()?;
        catalog.insert_record(&record("oilpaint", Category::Style, &[]))?;
        catalog.insert_record(&record("watercolor", Category::Style, &[]))?;
        catalog.insert_record(&record("nightcity", Category::Concept, &[]))?;

        let conflicts = catalog.validate_combination(&[
            selection("oilpaint", 0.9),
            selection("watercolor", 0.8),
        ])?;
        assert!(conflicts.iter().any(|c| c.rule == "at-most-one-strong-style"));

        // A weak second style is fine
        let conflicts = catalog.validate_combination(&[
            selection("oilpaint", 0.9),
            selection("watercolor", 0.5),
        ])?;
        assert!(conflicts.iter().all(|c| c.rule != "at-most-one-strong-style"));

        // Concept LoRAs don't count toward the cap
        let conflicts = catalog.validate_combination(&[
            selection("oilpaint", 1.3),
            selection("watercolor", 0.6),
            selection("nightcity", 1.4),
        ])?;
        assert!(conflicts.iter().all(|c| c.rule != "combined-weight-cap"));

        let conflicts = catalog.validate_combination(&[
            selection("oilpaint", 1.4),
            selection("watercolor", 0.6),
            selection("miku-unknown", 0.6),
        ])?;
        assert!(conflicts.iter().any(|c| c.rule == "combined-weight-cap"));
        Ok(())
    }

    #[test]
    fn deny_pairs_are_enforced() -> Result<()> {
        let mut catalog = LoraCatalog::in_memory()?;
        catalog.insert_record(&record("a", Category::General, &[]))?;
        catalog.insert_record(&record("b", Category::General, &[]))?;
        catalog.set_deny_pairs(vec![("a".to_string(), "b".to_string())]);

        let conflicts =
            catalog.validate_combination(&[selection("a", 0.5), selection("b", 0.5)])?;
        let conflict = conflicts.iter().find(|c| c.rule == "deny-pair").unwrap();
        assert_eq!(conflict.loras, vec!["a".to_string(), "b".to_string()]);
        assert!(conflict.suggestion.contains("'b'"));
        Ok(())
    }

    #[test]
    fn weight_optimization_applies_factor_within_bounds() -> Result<()> {
        let catalog = LoraCatalog::in_memory()?;
        let mut strong = record("styleA", Category::Style, &[]);
        strong.max_weight = 1.1;
        catalog.insert_record(&strong)?;

        let optimized =
            catalog.optimize_weights(&[selection("styleA", 1.0)], StylePreference::Strong)?;
        // 1.0 * 1.3 clamped to the record's max of 1.1
        assert!((optimized[0].weight - 1.1).abs() < 1e-9);

        let optimized =
            catalog.optimize_weights(&[selection("styleA", 1.0)], StylePreference::Subtle)?;
        assert!((optimized[0].weight - 0.6).abs() < 1e-9);

        let optimized =
            catalog.optimize_weights(&[selection("styleA", 1.0)], StylePreference::Balanced)?;
        assert!((optimized[0].weight - 1.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn combined_weight_capping_scales_uniformly() -> Result<()> {
        let catalog = LoraCatalog::in_memory()?;
        catalog.insert_record(&record("a", Category::Style, &[]))?;
        catalog.insert_record(&record("b", Category::Character, &[]))?;

        let mut selected = vec![selection("a", 1.8), selection("b", 1.2)];
        let factor = catalog.cap_combined_weight(&mut selected)?;
        assert!(factor < 1.0);
        let total: f64 = selected.iter().map(|s| s.weight).sum();
        assert!((total - MAX_COMBINED_WEIGHT).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn search_scores_name_tags_and_category() -> Result<()> {
        let catalog = LoraCatalog::in_memory()?;
        let mut anime = record("animeStyleV4", Category::Anime, &[("anime", 500)]);
        anime.trigger_words = vec!["anime style".to_string()];
        catalog.insert_record(&anime)?;
        catalog.insert_record(&record("photoreal", Category::Realistic, &[("photo", 100)]))?;

        let hits = catalog.search("anime", 10)?;
        assert_eq!(hits[0].name, "animeStyleV4");
        // name + tag + category all match
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert_eq!(hits.len(), 1);
        Ok(())
    }

    #[test]
    fn summary_counts_categories() -> Result<()> {
        let catalog = LoraCatalog::in_memory()?;
        catalog.insert_record(&record("a", Category::Anime, &[]))?;
        catalog.insert_record(&record("b", Category::Anime, &[]))?;
        catalog.insert_record(&record("c", Category::Style, &[]))?;

        let summary = catalog.summary()?;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_category[0], ("anime".to_string(), 2));
        Ok(())
    }
}
