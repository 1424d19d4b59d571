//! LoRA metadata analysis
//!
//! Derivations over training tag frequency: categorization, trigger word
//! extraction, content typing, and prompt scoring. All functions are pure so
//! sync stays idempotent; the catalog store calls into them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// LoRA category alphabet. Tie-break order is the declaration order here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Character,
    Anime,
    Realistic,
    Style,
    Concept,
    General,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Character => "character",
            Category::Anime => "anime",
            Category::Realistic => "realistic",
            Category::Style => "style",
            Category::Concept => "concept",
            Category::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "character" => Some(Category::Character),
            "anime" => Some(Category::Anime),
            "realistic" => Some(Category::Realistic),
            "style" => Some(Category::Style),
            "concept" => Some(Category::Concept),
            "general" => Some(Category::General),
            _ => None,
        }
    }
}

/// Content rating derived from training tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Safe,
    Suggestive,
    Nsfw,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Safe => "safe",
            ContentType::Suggestive => "suggestive",
            ContentType::Nsfw => "nsfw",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "nsfw" => ContentType::Nsfw,
            "suggestive" => ContentType::Suggestive,
            _ => ContentType::Safe,
        }
    }
}

/// Share of explicit tags above which a LoRA is rated nsfw
const NSFW_SHARE: f64 = 0.10;
/// Share above which a LoRA is rated suggestive
const SUGGESTIVE_SHARE: f64 = 0.05;

const NSFW_MARKERS: &[&str] = &[
    "nude", "naked", "nipples", "sex", "nsfw", "explicit", "pornography", "adult", "mature", "r18",
];

/// Generic tags excluded from trigger extraction
const TRIGGER_STOP_LIST: &[&str] = &[
    "1girl",
    "1boy",
    "solo",
    "breasts",
    "looking at viewer",
    "simple background",
    "white background",
    "upper body",
    "portrait",
    "close-up",
    "medium shot",
    "long hair",
    "short hair",
    "brown hair",
    "black hair",
    "blonde hair",
    "blue eyes",
    "brown eyes",
    "green eyes",
    "smile",
    "open mouth",
];

/// Sum per-bucket tag counts from the engine's `ss_tag_frequency` metadata.
/// The value may arrive as a JSON string or an already-parsed object.
pub fn parse_tag_frequency(metadata: &serde_json::Value) -> BTreeMap<String, i64> {
    let mut freq = BTreeMap::new();

    let raw = &metadata["ss_tag_frequency"];
    let parsed;
    let tag_data = if let Some(s) = raw.as_str() {
        parsed = serde_json::from_str::<serde_json::Value>(s).unwrap_or_default();
        &parsed
    } else {
        raw
    };

    if let Some(buckets) = tag_data.as_object() {
        for tags in buckets.values() {
            if let Some(tags) = tags.as_object() {
                for (tag, count) in tags {
                    if let Some(n) = count.as_f64() {
                        *freq.entry(tag.clone()).or_insert(0) += n as i64;
                    }
                }
            }
        }
    }

    freq
}

/// Categorize from tag frequency patterns. The highest-scoring category
/// wins; ties break in declaration order (character first, general last).
pub fn categorize_from_tags(tag_freq: &BTreeMap<String, i64>) -> Category {
    if tag_freq.is_empty() {
        return Category::General;
    }

    let mut top: Vec<(&String, &i64)> = tag_freq.iter().collect();
    top.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    let top_names: Vec<&str> = top.iter().take(20).map(|(tag, _)| tag.as_str()).collect();

    let count_matches = |indicators: &[&str]| -> i64 {
        top_names
            .iter()
            .filter(|tag| {
                let tag = tag.to_lowercase();
                indicators.iter().any(|ind| tag.contains(ind))
            })
            .count() as i64
    };

    let mut anime = count_matches(&["anime", "manga", "2d", "chibi", "kawaii", "cel shading"]);
    let mut realistic = count_matches(&[
        "photorealistic",
        "realistic",
        "photo",
        "photography",
        "portrait",
    ]);
    let mut character = count_matches(&["1girl", "1boy", "character", "person", "face"]);
    let style = count_matches(&[
        "art style",
        "painting",
        "drawing",
        "sketch",
        "watercolor",
        "oil painting",
    ]);
    let concept = count_matches(&[
        "pose",
        "clothing",
        "outfit",
        "background",
        "lighting",
        "effect",
    ]);

    if tag_freq.get("1girl").copied().unwrap_or(0) > 100 {
        character += 2;
    }
    if tag_freq.contains_key("anime") || tag_freq.contains_key("manga") {
        anime += 3;
    }
    if tag_freq.contains_key("photorealistic") || tag_freq.contains_key("realistic") {
        realistic += 3;
    }

    // Tie-break order is fixed by iteration order
    let scored = [
        (Category::Character, character),
        (Category::Anime, anime),
        (Category::Realistic, realistic),
        (Category::Style, style),
        (Category::Concept, concept),
    ];

    let best = scored.iter().max_by_key(|(_, score)| *score).unwrap();
    if best.1 > 0 {
        best.0
    } else {
        Category::General
    }
}

/// Fallback analysis when the engine has no training metadata
pub fn analyze_from_name(name: &str, path: &str) -> (Category, Vec<String>, ContentType) {
    let name_lower = name.to_lowercase();
    let haystack = format!("{} {}", name_lower, path.to_lowercase());

    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| haystack.contains(k));

    let mut triggers: Vec<String> = Vec::new();
    let category = if contains_any(&["anime", "manga", "2d", "cartoon", "cel"]) {
        triggers.extend(["anime style".to_string(), "manga".to_string()]);
        Category::Anime
    } else if contains_any(&["real", "photo", "portrait"]) {
        triggers.extend(["photorealistic".to_string(), "photo".to_string()]);
        Category::Realistic
    } else if contains_any(&["character", "person", "girl", "boy", "woman", "man"]) {
        Category::Character
    } else if contains_any(&["style", "art", "painting", "draw"]) {
        Category::Style
    } else if contains_any(&["pose", "outfit", "clothing", "background"]) {
        Category::Concept
    } else {
        Category::General
    };

    // Pull candidate triggers from the name, dropping version tokens
    for word in name_lower.replace(['_', '-'], " ").split_whitespace() {
        let word = word.trim();
        if word.len() > 2
            && !word.chars().all(|c| c.is_ascii_digit())
            && !(word.starts_with('v') && word[1..].chars().all(|c| c.is_ascii_digit()))
        {
            triggers.push(word.to_string());
        }
        if triggers.len() >= 5 {
            break;
        }
    }
    triggers.dedup();

    let content_type = if contains_any(&["nsfw", "nude", "adult", "xxx", "hentai"]) {
        ContentType::Nsfw
    } else {
        ContentType::Safe
    };

    (category, triggers, content_type)
}

/// Extract trigger words: frequent, non-generic tags ordered by descending
/// frequency then lexicographically.
pub fn extract_trigger_words(tag_freq: &BTreeMap<String, i64>, limit: usize) -> Vec<String> {
    let mut candidates: Vec<(&String, i64)> = tag_freq
        .iter()
        .filter(|(tag, freq)| {
            let lower = tag.to_lowercase();
            **freq > 5
                && tag.len() > 2
                && !tag.chars().all(|c| c.is_ascii_digit())
                && !TRIGGER_STOP_LIST.contains(&lower.as_str())
        })
        .map(|(tag, freq)| (tag, *freq))
        .collect();

    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    candidates
        .into_iter()
        .take(limit)
        .map(|(tag, _)| tag.clone())
        .collect()
}

/// Rate content from the share of explicit-marker tags in total frequency
pub fn detect_content_type(tag_freq: &BTreeMap<String, i64>) -> ContentType {
    let total: i64 = tag_freq.values().sum();
    if total == 0 {
        return ContentType::Safe;
    }

    let explicit: i64 = tag_freq
        .iter()
        .filter(|(tag, _)| {
            let lower = tag.to_lowercase();
            NSFW_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .map(|(_, freq)| freq)
        .sum();

    let share = explicit as f64 / total as f64;
    if share > NSFW_SHARE {
        ContentType::Nsfw
    } else if share > SUGGESTIVE_SHARE {
        ContentType::Suggestive
    } else {
        ContentType::Safe
    }
}

/// Tokenize a prompt into a lowercase word set (commas treated as spaces)
pub fn prompt_tokens(prompt: &str) -> BTreeSet<String> {
    prompt
        .to_lowercase()
        .replace(',', " ")
        .split_whitespace()
        .map(|w| w.to_string())
        .collect()
}

/// Strip the leading count from booru-style tags ("1girl" -> "girl")
fn strip_count_prefix(word: &str) -> &str {
    word.trim_start_matches(|c: char| c.is_ascii_digit())
}

/// Score a prompt against a LoRA's tag frequency.
///
/// For each tag whose token set overlaps the prompt's, add its share of the
/// total frequency. Count prefixes on tag words are ignored so "1girl"
/// matches a prompt's "girl". Clamped to 1.0; a tag equal to the whole
/// normalized prompt clamps the score to 1.0 outright.
pub fn prompt_tag_score(
    prompt: &str,
    tag_freq: &BTreeMap<String, i64>,
) -> (f64, Vec<String>) {
    let total: i64 = tag_freq.values().sum();
    if total == 0 {
        return (0.0, vec![]);
    }

    let tokens = prompt_tokens(prompt);
    let normalized_prompt = prompt.to_lowercase().replace(',', " ");
    let normalized_prompt = normalized_prompt.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut score = 0.0;
    let mut matching: Vec<(&String, i64)> = Vec::new();

    for (tag, freq) in tag_freq {
        let tag_words: BTreeSet<String> = tag
            .to_lowercase()
            .replace('_', " ")
            .split_whitespace()
            .map(|w| strip_count_prefix(w).to_string())
            .filter(|w| !w.is_empty())
            .collect();

        if tag.to_lowercase().replace('_', " ") == normalized_prompt {
            matching.push((tag, *freq));
            score = 1.0;
            continue;
        }

        if !tag_words.is_disjoint(&tokens) {
            score += *freq as f64 / total as f64;
            matching.push((tag, *freq));
        }
    }

    matching.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let matching_tags = matching.into_iter().map(|(tag, _)| tag.clone()).collect();

    (score.min(1.0), matching_tags)
}

/// Confidence band for a prompt-tag score
pub fn confidence_for(score: f64) -> &'static str {
    if score >= 0.5 {
        "high"
    } else if score >= 0.2 {
        "medium"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn freq(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
        pairs.iter().map(|(t, f)| (t.to_string(), *f)).collect()
    }

    #[test]
    fn tag_frequency_sums_across_buckets() {
        let metadata = json!({
            "ss_tag_frequency": {
                "bucket_a": {"anime": 300, "1girl": 200},
                "bucket_b": {"anime": 200, "cat ears": 80}
            }
        });
        let parsed = parse_tag_frequency(&metadata);
        assert_eq!(parsed["anime"], 500);
        assert_eq!(parsed["1girl"], 200);
        assert_eq!(parsed["cat ears"], 80);
    }

    #[test]
    fn tag_frequency_accepts_string_encoded_metadata() {
        let metadata = json!({
            "ss_tag_frequency": "{\"dataset\": {\"anime\": 10}}"
        });
        let parsed = parse_tag_frequency(&metadata);
        assert_eq!(parsed["anime"], 10);
    }

    #[test]
    fn prompt_scoring_matches_reference_case() {
        // animeStyleV4: {"anime": 500, "1girl": 450, "cat ears": 80, "solo": 400}
        let tags = freq(&[("anime", 500), ("1girl", 450), ("cat ears", 80), ("solo", 400)]);
        let (score, matching) = prompt_tag_score("anime girl with cat ears", &tags);

        // "anime" and "cat ears" overlap directly, "1girl" through its
        // count-stripped token; "solo" does not match.
        assert!(matching.contains(&"anime".to_string()));
        assert!(matching.contains(&"1girl".to_string()));
        assert!(matching.contains(&"cat ears".to_string()));
        assert!(!matching.contains(&"solo".to_string()));
        let expected = (500.0 + 450.0 + 80.0) / 1430.0;
        assert!((score - expected).abs() < 1e-9);
        assert!((score - 0.720).abs() < 1e-3);
        assert_eq!(confidence_for(score), "high");
    }

    #[test]
    fn whole_prompt_tag_clamps_to_one() {
        let tags = freq(&[("cat ears", 10), ("solo", 90)]);
        let (score, _) = prompt_tag_score("cat ears", &tags);
        assert_eq!(score, 1.0);
        assert_eq!(confidence_for(score), "high");
    }

    #[test]
    fn scoring_is_deterministic() {
        let tags = freq(&[("anime", 500), ("1girl", 450), ("cat ears", 80), ("solo", 400)]);
        let first = prompt_tag_score("anime girl with cat ears", &tags);
        let second = prompt_tag_score("anime girl with cat ears", &tags);
        assert_eq!(first, second);
    }

    #[test]
    fn categorization_tie_breaks_toward_character() {
        // Equal evidence for character and anime resolves to character
        let tags = freq(&[("1girl", 50), ("anime style", 50)]);
        assert_eq!(categorize_from_tags(&tags), Category::Character);
    }

    #[test]
    fn categorization_prefers_dominant_signal() {
        let tags = freq(&[("anime", 500), ("manga", 300), ("cel shading", 100)]);
        assert_eq!(categorize_from_tags(&tags), Category::Anime);

        let empty = BTreeMap::new();
        assert_eq!(categorize_from_tags(&empty), Category::General);
    }

    #[test]
    fn trigger_extraction_filters_and_orders() {
        let tags = freq(&[
            ("1girl", 400),
            ("solo", 300),
            ("hatsune miku", 250),
            ("twintails", 250),
            ("aqua hair", 120),
            ("ok", 90),  // too short
            ("1234", 80), // numeric
            ("rare tag", 3), // below floor
        ]);
        let triggers = extract_trigger_words(&tags, 10);
        assert_eq!(
            triggers,
            vec!["hatsune miku", "twintails", "aqua hair"]
        );
    }

    #[test]
    fn content_type_thresholds() {
        let nsfw = freq(&[("nude", 150), ("1girl", 850)]);
        assert_eq!(detect_content_type(&nsfw), ContentType::Nsfw);

        let suggestive = freq(&[("nude", 70), ("1girl", 930)]);
        assert_eq!(detect_content_type(&suggestive), ContentType::Suggestive);

        let safe = freq(&[("landscape", 500), ("sky", 300)]);
        assert_eq!(detect_content_type(&safe), ContentType::Safe);
    }

    #[test]
    fn name_fallback_categorizes() {
        let (category, triggers, content) =
            analyze_from_name("animeStyle_v4", "/models/lora/animeStyle_v4.safetensors");
        assert_eq!(category, Category::Anime);
        assert!(!triggers.is_empty());
        assert_eq!(content, ContentType::Safe);

        let (category, _, content) = analyze_from_name("nsfw_real_photo", "");
        assert_eq!(category, Category::Realistic);
        assert_eq!(content, ContentType::Nsfw);
    }
}
