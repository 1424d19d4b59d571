//! Shared application state
//!
//! Everything the tool surface and chat core need, plus the end-to-end
//! orchestration recipe: content analysis, LoRA suggestion, weight
//! optimization, conflict resolution, enqueue.

use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::content::ContentDb;
use crate::convo::ConvoDb;
use crate::error::Result;
use crate::llm::LlmRouter;
use crate::lora::{LoraCatalog, LoraSelection, StylePreference};
use crate::queue::{JobRequest, QueueEngine, DEFAULT_PRIORITY};
use crate::sd::{lora_prompt_ref, SdGateway, Txt2ImgRequest};
use crate::upload::UploadRouter;

/// Shared state for the MCP server and chat core
pub struct AppState {
    pub config: Config,
    pub gateway: Arc<SdGateway>,
    pub lora: Arc<LoraCatalog>,
    pub content: Arc<ContentDb>,
    pub convo: Arc<ConvoDb>,
    pub queue: Arc<QueueEngine>,
    pub uploader: Arc<UploadRouter>,
    pub llm: Arc<LlmRouter>,
}

/// What the orchestrate pipeline did
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    pub job_id: String,
    pub final_prompt: String,
    pub safety_level: &'static str,
    pub safety_score: f64,
    pub selected_loras: Vec<SelectedLora>,
    /// Adjustments made to satisfy combination rules
    pub downgrades: Vec<String>,
    pub steps_completed: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectedLora {
    pub name: String,
    pub weight: f64,
    pub score: f64,
}

impl AppState {
    /// End-to-end generation recipe: analyze the prompt, pick LoRAs,
    /// optimize weights, resolve conflicts (recording every downgrade),
    /// then enqueue the job.
    pub async fn orchestrate(
        &self,
        prompt: &str,
        style_preference: StylePreference,
        user_id: Option<&str>,
    ) -> Result<OrchestrationReport> {
        let mut steps = Vec::new();
        let mut downgrades = Vec::new();

        // 1. Content analysis and enhancement
        let analysis = self.content.analyze(prompt, "")?;
        let enhanced = self
            .content
            .enhance(prompt, true, self.config.nsfw_filter)?;
        if !enhanced.removed.is_empty() {
            downgrades.push(format!(
                "removed explicit terms: {}",
                enhanced.removed.join(", ")
            ));
        }
        steps.push("content_analysis");

        // 2. LoRA suggestion
        let suggestions = self.lora.suggest_for_prompt(prompt, 3)?;
        let score_by_name: std::collections::HashMap<String, f64> = suggestions
            .iter()
            .map(|s| (s.name.clone(), s.score))
            .collect();
        let mut selected: Vec<LoraSelection> = suggestions
            .iter()
            .map(|s| LoraSelection {
                name: s.name.clone(),
                weight: s.recommended_weight,
            })
            .collect();
        steps.push("lora_suggestion");

        // 3. Weight optimization
        selected = self.lora.optimize_weights(&selected, style_preference)?;
        steps.push("weight_optimization");

        // 4. Conflict resolution. Suggestions are already ranked, so the
        // remediation of each rule keeps the leading entry.
        let conflicts = self.lora.validate_combination(&selected)?;
        for conflict in &conflicts {
            match conflict.rule {
                "at-most-one-character" => {
                    let mut seen_character = false;
                    let mut kept = Vec::with_capacity(selected.len());
                    for selection in selected.drain(..) {
                        let is_character = self
                            .lora
                            .get(&selection.name)?
                            .map(|r| r.category == crate::lora::analysis::Category::Character)
                            .unwrap_or(false);
                        if is_character && seen_character {
                            downgrades.push(format!(
                                "dropped character LoRA '{}'",
                                selection.name
                            ));
                            continue;
                        }
                        seen_character |= is_character;
                        kept.push(selection);
                    }
                    selected = kept;
                }
                "at-most-one-strong-style" => {
                    let mut seen_strong = false;
                    for selection in selected.iter_mut() {
                        let is_style = self
                            .lora
                            .get(&selection.name)?
                            .map(|r| r.category == crate::lora::analysis::Category::Style)
                            .unwrap_or(false);
                        if is_style && selection.weight > crate::lora::STYLE_WEIGHT_LIMIT {
                            if seen_strong {
                                downgrades.push(format!(
                                    "reduced style LoRA '{}' to {:.1}",
                                    selection.name,
                                    crate::lora::STYLE_WEIGHT_LIMIT
                                ));
                                selection.weight = crate::lora::STYLE_WEIGHT_LIMIT;
                            }
                            seen_strong = true;
                        }
                    }
                }
                "deny-pair" => {
                    // The conflict names the pair; drop its second member
                    if let Some(drop_name) = conflict.loras.get(1) {
                        if let Some(position) =
                            selected.iter().position(|s| &s.name == drop_name)
                        {
                            let dropped = selected.remove(position);
                            downgrades
                                .push(format!("dropped conflicting LoRA '{}'", dropped.name));
                        }
                    }
                }
                _ => {}
            }
        }
        let factor = self.lora.cap_combined_weight(&mut selected)?;
        if factor < 1.0 {
            downgrades.push(format!(
                "scaled all weights by {:.2} to satisfy the combined-weight cap",
                factor
            ));
        }
        steps.push("conflict_check");

        // 5. Enqueue with LoRA references appended the way the engine
        // expects them
        let mut final_prompt = enhanced.prompt.clone();
        for selection in &selected {
            final_prompt.push(' ');
            final_prompt.push_str(&lora_prompt_ref(&selection.name, selection.weight));
        }

        let job_id = self.queue.enqueue(
            JobRequest {
                request: Txt2ImgRequest {
                    prompt: final_prompt.clone(),
                    negative_prompt: "low quality, blurry, deformed".to_string(),
                    ..Txt2ImgRequest::default()
                },
                user_id: user_id.map(|s| s.to_string()),
                title: None,
            },
            DEFAULT_PRIORITY,
        );
        steps.push("enqueue");

        let selected_loras = selected
            .iter()
            .map(|s| SelectedLora {
                name: s.name.clone(),
                weight: s.weight,
                score: score_by_name.get(&s.name).copied().unwrap_or(0.0),
            })
            .collect();

        Ok(OrchestrationReport {
            job_id,
            final_prompt,
            safety_level: analysis.safety_level.as_str(),
            safety_score: analysis.safety_score,
            selected_loras,
            downgrades,
            steps_completed: steps,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use crate::lora::analysis::{Category, ContentType};
    use crate::lora::LoraRecord;
    use crate::upload::HostDb;

    pub(crate) fn test_state() -> (AppState, tempfile::TempDir) {
        test_state_with_catalog(LoraCatalog::in_memory().unwrap())
    }

    pub(crate) fn test_state_with_catalog(
        catalog: LoraCatalog,
    ) -> (AppState, tempfile::TempDir) {
        let (gateway, _) = SdGateway::mock(Duration::from_millis(5));
        let gateway = Arc::new(gateway);
        let queue = Arc::new(QueueEngine::new(gateway.clone()));
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(UploadRouter::local_only(
            HostDb::in_memory().unwrap(),
            dir.path().to_path_buf(),
            "http://localhost:8081".to_string(),
        ));
        let state = AppState {
            config: Config::default(),
            gateway,
            lora: Arc::new(catalog),
            content: Arc::new(ContentDb::in_memory().unwrap()),
            convo: Arc::new(ConvoDb::in_memory().unwrap()),
            queue,
            uploader,
            llm: Arc::new(LlmRouter::mock()),
        };
        (state, dir)
    }

    fn record(name: &str, category: Category, tags: &[(&str, i64)], weight: f64) -> LoraRecord {
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
            recommended_weight: weight,
            min_weight: 0.2,
            max_weight: 1.5,
        }
    }

    #[tokio::test]
    async fn orchestrate_runs_all_steps_and_enqueues() -> crate::error::Result<()> {
        let (state, _dir) = test_state();
        state.lora.insert_record(&record(
            "animeStyleV4",
            Category::Anime,
            &[("anime", 500), ("1girl", 450), ("cat ears", 80)],
            1.0,
        ))?;

        let report = state
            .orchestrate("anime girl with cat ears", StylePreference::Balanced, None)
            .await?;

        assert_eq!(
            report.steps_completed,
            vec![
                "content_analysis",
                "lora_suggestion",
                "weight_optimization",
                "conflict_check",
                "enqueue"
            ]
        );
        assert_eq!(report.selected_loras.len(), 1);
        assert!(report.final_prompt.contains("<lora:animeStyleV4:"));
        // The job is actually queued
        let snapshot = state.queue.get(&report.job_id)?;
        assert_eq!(snapshot.prompt, report.final_prompt);
        Ok(())
    }

    #[tokio::test]
    async fn orchestrate_resolves_character_conflicts() -> crate::error::Result<()> {
        let (state, _dir) = test_state();
        // Two character LoRAs that both match the prompt strongly
        state.lora.insert_record(&record(
            "miku",
            Category::Character,
            &[("hatsune miku", 900), ("girl", 100)],
            0.9,
        ))?;
        state.lora.insert_record(&record(
            "zelda",
            Category::Character,
            &[("princess zelda", 800), ("girl", 200)],
            0.9,
        ))?;

        let report = state
            .orchestrate("girl portrait", StylePreference::Balanced, None)
            .await?;

        assert_eq!(report.selected_loras.len(), 1);
        assert!(report
            .downgrades
            .iter()
            .any(|d| d.contains("dropped character LoRA")));
        Ok(())
    }

    #[tokio::test]
    async fn orchestrate_drops_the_denied_pair_member() -> crate::error::Result<()> {
        let mut catalog = LoraCatalog::in_memory().unwrap();
        catalog.set_deny_pairs(vec![("alpha".to_string(), "beta".to_string())]);
        let (state, _dir) = test_state_with_catalog(catalog);

        // Three suggestions ranked alpha > beta > gamma; alpha and beta are
        // the denied pair, so beta must go and gamma must stay
        state.lora.insert_record(&record(
            "alpha",
            Category::General,
            &[("castle", 90), ("moat", 10)],
            0.7,
        ))?;
        state.lora.insert_record(&record(
            "beta",
            Category::General,
            &[("castle", 80), ("hill", 20)],
            0.7,
        ))?;
        state.lora.insert_record(&record(
            "gamma",
            Category::General,
            &[("castle", 50), ("sky", 50)],
            0.7,
        ))?;

        let report = state
            .orchestrate("castle at dusk", StylePreference::Balanced, None)
            .await?;

        let names: Vec<&str> = report
            .selected_loras
            .iter()
            .map(|l| l.name.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
        assert!(report
            .downgrades
            .iter()
            .any(|d| d.contains("dropped conflicting LoRA 'beta'")));
        Ok(())
    }

    #[tokio::test]
    async fn orchestrate_caps_combined_weight() -> crate::error::Result<()> {
        let (state, _dir) = test_state();
        state.lora.insert_record(&record(
            "styleA",
            Category::Style,
            &[("painting", 500)],
            1.4,
        ))?;
        state.lora.insert_record(&record(
            "styleB",
            Category::Anime,
            &[("painting", 450)],
            1.4,
        ))?;
        state.lora.insert_record(&record(
            "styleC",
            Category::General,
            &[("painting", 400)],
            1.4,
        ))?;

        // Strong preference pushes 3 x 1.4 x 1.3 well past the cap
        let report = state
            .orchestrate("painting of a castle", StylePreference::Strong, None)
            .await?;

        let total: f64 = report.selected_loras.iter().map(|l| l.weight).sum();
        assert!(total <= crate::lora::MAX_COMBINED_WEIGHT + 1e-9);
        assert!(report
            .downgrades
            .iter()
            .any(|d| d.contains("combined-weight cap")));
        Ok(())
    }
}
