//! MCP server exposing the easel tool catalog
//!
//! Every tool returns a JSON text payload with at least
//! `{success, error?, error_kind?}`; errors never cross the protocol as
//! anything but structured results.

use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router,
    transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpService,
    },
    ServerHandler,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::EaselError;
use crate::lora::analysis::Category;
use crate::lora::{LoraSelection, StylePreference};
use crate::queue::{JobRequest, DEFAULT_PRIORITY};
use crate::sd::Txt2ImgRequest;
use crate::state::AppState;

/// MCP server for easel
#[derive(Clone)]
pub struct EaselMcpServer {
    state: Arc<AppState>,
    tool_router: ToolRouter<Self>,
}

fn ok(mut payload: serde_json::Value) -> String {
    if let Some(object) = payload.as_object_mut() {
        object.insert("success".to_string(), json!(true));
    }
    payload.to_string()
}

fn fail(error: &EaselError) -> String {
    json!({
        "success": false,
        "error": error.to_string(),
        "error_kind": error.kind(),
    })
    .to_string()
}

/// Parameters for search_sd_models
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SearchSdModelsParams {
    #[schemars(description = "Substring to match against model names")]
    pub query: String,
    #[schemars(description = "Maximum results (default 10)")]
    pub limit: Option<usize>,
}

/// Parameters for browse_loras_by_category
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct BrowseLorasParams {
    #[schemars(description = "Category: anime, realistic, character, style, concept, general")]
    pub category: String,
    #[schemars(description = "Maximum results (default 10)")]
    pub limit: Option<usize>,
}

/// Parameters for search_loras_smart
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SearchLorasParams {
    #[schemars(description = "Search text matched against names, descriptions, and tags")]
    pub query: String,
    #[schemars(description = "Maximum results (default 5)")]
    pub max_results: Option<usize>,
}

/// Parameters for suggest_loras_for_prompt
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SuggestLorasParams {
    #[schemars(description = "The generation prompt to score LoRAs against")]
    pub prompt: String,
    #[schemars(description = "Maximum suggestions (default 5)")]
    pub limit: Option<usize>,
}

/// One selected LoRA for validation
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct LoraSelectionParam {
    #[schemars(description = "LoRA name as listed in the catalog")]
    pub name: String,
    #[schemars(description = "Intended weight (default 1.0)")]
    pub weight: Option<f64>,
}

/// Parameters for validate_lora_combination
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ValidateLoraParams {
    #[schemars(description = "Selected LoRAs, best match first")]
    pub selected: Vec<LoraSelectionParam>,
}

/// Parameters for generate_image and enqueue_image_generation
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct GenerateImageParams {
    #[schemars(description = "Generation prompt")]
    pub prompt: String,
    #[schemars(description = "Negative prompt")]
    pub negative_prompt: Option<String>,
    #[schemars(description = "Sampling steps (default 25)")]
    pub steps: Option<u32>,
    #[schemars(description = "Image width (default 512)")]
    pub width: Option<u32>,
    #[schemars(description = "Image height (default 512)")]
    pub height: Option<u32>,
    #[schemars(description = "Sampler name (default 'Euler a')")]
    pub sampler_name: Option<String>,
    #[schemars(description = "CFG scale (default 7.0)")]
    pub cfg_scale: Option<f64>,
    #[schemars(description = "Seed (-1 for random)")]
    pub seed: Option<i64>,
    #[schemars(description = "Ignored; images are routed through the configured sinks")]
    pub output_path: Option<String>,
    #[schemars(description = "Caller user id, used for per-user hosting")]
    pub user_id: Option<String>,
    #[schemars(description = "Queue priority, lower runs first (default 5)")]
    pub priority: Option<i64>,
}

/// Parameters for get_generation_progress
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ProgressParams {
    #[schemars(description = "Job id; omit for the currently running job")]
    pub job_id: Option<String>,
}

/// Parameters for cancel_generation_job
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CancelParams {
    #[schemars(description = "Job id to cancel")]
    pub job_id: String,
}

/// Parameters for get_job_history
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct HistoryParams {
    #[schemars(description = "Maximum entries (default 10)")]
    pub limit: Option<usize>,
}

/// Parameters for orchestrate_image_generation
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct OrchestrateParams {
    #[schemars(description = "What to generate")]
    pub prompt: String,
    #[schemars(description = "Style preference: subtle, balanced, or strong (default balanced)")]
    pub style_preference: Option<String>,
    #[schemars(description = "Caller user id, used for per-user hosting")]
    pub user_id: Option<String>,
}

/// Parameters for analyze_prompt_content
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct AnalyzeParams {
    #[schemars(description = "Prompt to analyze")]
    pub prompt: String,
    #[schemars(description = "Negative prompt")]
    pub negative_prompt: Option<String>,
}

/// Parameters for enhanced_prompt_generation
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct EnhanceParams {
    #[schemars(description = "Prompt to enhance")]
    pub prompt: String,
    #[schemars(description = "Append fillers for missing axes (default true)")]
    pub apply_suggestions: Option<bool>,
    #[schemars(description = "Strip explicit terms when the prompt is explicit (default false)")]
    pub safety_filter: Option<bool>,
}

/// Parameters for get_content_categories
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CategoriesParams {
    #[schemars(
        description = "Filter: subject, style, environment, surreal, motif, content_filter"
    )]
    pub category_type: Option<String>,
}

/// Parameters for parameterless tools
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct NoParams {}

impl GenerateImageParams {
    fn validate(&self) -> Result<(), EaselError> {
        if self.prompt.trim().is_empty() {
            return Err(EaselError::Validation("prompt must not be empty".to_string()));
        }
        if let Some(steps) = self.steps {
            if !(1..=150).contains(&steps) {
                return Err(EaselError::Validation(format!(
                    "steps must be in 1..=150, got {}",
                    steps
                )));
            }
        }
        for (label, value) in [("width", self.width), ("height", self.height)] {
            if let Some(v) = value {
                if !(64..=2048).contains(&v) {
                    return Err(EaselError::Validation(format!(
                        "{} must be in 64..=2048, got {}",
                        label, v
                    )));
                }
            }
        }
        if let Some(cfg) = self.cfg_scale {
            if !(1.0..=30.0).contains(&cfg) {
                return Err(EaselError::Validation(format!(
                    "cfg_scale must be in 1..=30, got {}",
                    cfg
                )));
            }
        }
        Ok(())
    }

    fn to_request(&self) -> JobRequest {
        JobRequest {
            request: Txt2ImgRequest {
                prompt: self.prompt.clone(),
                negative_prompt: self.negative_prompt.clone().unwrap_or_default(),
                steps: self.steps.unwrap_or(25),
                width: self.width.unwrap_or(512),
                height: self.height.unwrap_or(512),
                cfg_scale: self.cfg_scale.unwrap_or(7.0),
                sampler_name: self
                    .sampler_name
                    .clone()
                    .unwrap_or_else(|| "Euler a".to_string()),
                seed: self.seed.unwrap_or(-1),
            },
            user_id: self.user_id.clone(),
            title: None,
        }
    }
}

fn job_json(snapshot: &crate::queue::JobSnapshot) -> serde_json::Value {
    serde_json::to_value(snapshot).unwrap_or_else(|_| json!({}))
}

#[tool_router]
impl EaselMcpServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            tool_router: Self::tool_router(),
        }
    }

    // =========================================================================
    // Engine listings
    // =========================================================================

    #[tool(description = "Summary of available SD checkpoint models and the loaded one")]
    async fn get_sd_models_summary(&self, Parameters(_params): Parameters<NoParams>) -> String {
        let models = match self.state.gateway.list_models().await {
            Ok(models) => models,
            Err(e) => return fail(&e),
        };
        let current = self
            .state
            .gateway
            .current_model()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        ok(json!({
            "total": models.len(),
            "current_model": current,
            "models": models.iter().take(20).map(|m| &m.model_name).collect::<Vec<_>>(),
        }))
    }

    #[tool(description = "Search SD checkpoint models by name")]
    async fn search_sd_models(
        &self,
        Parameters(params): Parameters<SearchSdModelsParams>,
    ) -> String {
        let limit = params.limit.unwrap_or(10);
        let needle = params.query.to_lowercase();
        match self.state.gateway.list_models().await {
            Ok(models) => {
                let hits: Vec<_> = models
                    .iter()
                    .filter(|m| {
                        m.model_name.to_lowercase().contains(&needle)
                            || m.title.to_lowercase().contains(&needle)
                    })
                    .take(limit)
                    .map(|m| json!({"name": m.model_name, "title": m.title}))
                    .collect();
                ok(json!({"query": params.query, "matches": hits}))
            }
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "List available samplers")]
    async fn get_samplers_list(&self, Parameters(_params): Parameters<NoParams>) -> String {
        match self.state.gateway.list_samplers().await {
            Ok(samplers) => ok(json!({
                "samplers": samplers.iter().map(|s| &s.name).collect::<Vec<_>>(),
            })),
            Err(e) => fail(&e),
        }
    }

    // =========================================================================
    // LoRA catalog
    // =========================================================================

    #[tool(description = "Catalog totals: counts by category and top trigger words")]
    async fn get_lora_summary(&self, Parameters(_params): Parameters<NoParams>) -> String {
        match self.state.lora.summary() {
            Ok(summary) => ok(json!({
                "total": summary.total,
                "categories": summary.by_category,
                "top_trigger_words": summary.top_trigger_words,
            })),
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "List LoRAs in one category")]
    async fn browse_loras_by_category(
        &self,
        Parameters(params): Parameters<BrowseLorasParams>,
    ) -> String {
        let Some(category) = Category::parse(&params.category) else {
            return fail(&EaselError::Validation(format!(
                "unknown category '{}'; use anime, realistic, character, style, concept, or general",
                params.category
            )));
        };
        match self.state.lora.browse(category, params.limit.unwrap_or(10)) {
            Ok(records) => ok(json!({
                "category": params.category,
                "loras": records.iter().map(|r| json!({
                    "name": r.name,
                    "trigger_words": r.trigger_words.iter().take(3).collect::<Vec<_>>(),
                    "description": r.description,
                })).collect::<Vec<_>>(),
            })),
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "Relevance-ranked LoRA search over names, tags, and descriptions")]
    async fn search_loras_smart(
        &self,
        Parameters(params): Parameters<SearchLorasParams>,
    ) -> String {
        match self
            .state
            .lora
            .search(&params.query, params.max_results.unwrap_or(5))
        {
            Ok(hits) => ok(json!({"query": params.query, "results": hits})),
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "Suggest LoRAs for a prompt using training-tag analysis")]
    async fn suggest_loras_for_prompt(
        &self,
        Parameters(params): Parameters<SuggestLorasParams>,
    ) -> String {
        match self
            .state
            .lora
            .suggest_for_prompt(&params.prompt, params.limit.unwrap_or(5))
        {
            Ok(suggestions) => ok(json!({
                "prompt": params.prompt,
                "suggestions": suggestions,
            })),
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "Check a LoRA combination for conflicts")]
    async fn validate_lora_combination(
        &self,
        Parameters(params): Parameters<ValidateLoraParams>,
    ) -> String {
        let selected: Vec<LoraSelection> = params
            .selected
            .iter()
            .map(|s| LoraSelection {
                name: s.name.clone(),
                weight: s.weight.unwrap_or(1.0),
            })
            .collect();
        match self.state.lora.validate_combination(&selected) {
            Ok(conflicts) => ok(json!({
                "valid": conflicts.is_empty(),
                "conflicts": conflicts,
            })),
            Err(e) => fail(&e),
        }
    }

    // =========================================================================
    // Generation
    // =========================================================================

    #[tool(
        description = "Generate an image and wait for the result. Runs through the queue at \
                       high priority."
    )]
    async fn generate_image(&self, Parameters(params): Parameters<GenerateImageParams>) -> String {
        if let Err(e) = params.validate() {
            return fail(&e);
        }

        let job_id = self.state.queue.enqueue(params.to_request(), 0);

        // Wait for the worker, bounded by the generation timeout plus slack
        // for censoring and upload
        let deadline = Duration::from_secs(self.state.config.sd_generation_timeout + 60);
        let started = std::time::Instant::now();
        loop {
            match self.state.queue.get(&job_id) {
                Ok(snapshot) if snapshot.state.is_terminal() => {
                    return ok(json!({"job": job_json(&snapshot)}));
                }
                Ok(_) => {}
                Err(e) => return fail(&e),
            }
            if started.elapsed() > deadline {
                return fail(&EaselError::Timeout {
                    component: "queue",
                    seconds: deadline.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    #[tool(description = "Enqueue a generation job and return its id immediately")]
    async fn enqueue_image_generation(
        &self,
        Parameters(params): Parameters<GenerateImageParams>,
    ) -> String {
        if let Err(e) = params.validate() {
            return fail(&e);
        }
        let priority = params.priority.unwrap_or(DEFAULT_PRIORITY);
        let job_id = self.state.queue.enqueue(params.to_request(), priority);
        ok(json!({"job_id": job_id, "priority": priority}))
    }

    #[tool(description = "Progress of a job, or of the currently running one")]
    async fn get_generation_progress(
        &self,
        Parameters(params): Parameters<ProgressParams>,
    ) -> String {
        match &params.job_id {
            Some(job_id) => match self.state.queue.get(job_id) {
                Ok(snapshot) => ok(json!({"job": job_json(&snapshot)})),
                Err(e) => fail(&e),
            },
            None => match self.state.queue.current() {
                Some(snapshot) => ok(json!({"job": job_json(&snapshot)})),
                None => ok(json!({"job": null, "idle": true})),
            },
        }
    }

    #[tool(description = "Queue counters and the running job id")]
    async fn get_queue_status(&self, Parameters(_params): Parameters<NoParams>) -> String {
        match serde_json::to_value(self.state.queue.status()) {
            Ok(status) => ok(json!({"queue": status})),
            Err(e) => fail(&EaselError::from(e)),
        }
    }

    #[tool(description = "Cancel a queued or running job")]
    async fn cancel_generation_job(&self, Parameters(params): Parameters<CancelParams>) -> String {
        match self.state.queue.cancel(&params.job_id).await {
            Ok(state) => ok(json!({"job_id": params.job_id, "state": state.as_str()})),
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "Recent terminal jobs, newest first")]
    async fn get_job_history(&self, Parameters(params): Parameters<HistoryParams>) -> String {
        let history = self.state.queue.history(params.limit.unwrap_or(10));
        ok(json!({
            "jobs": history.iter().map(job_json).collect::<Vec<_>>(),
        }))
    }

    #[tool(
        description = "End-to-end generation: analyze the prompt, pick and validate LoRAs, \
                       optimize weights, and enqueue"
    )]
    async fn orchestrate_image_generation(
        &self,
        Parameters(params): Parameters<OrchestrateParams>,
    ) -> String {
        if params.prompt.trim().is_empty() {
            return fail(&EaselError::Validation("prompt must not be empty".to_string()));
        }
        let preference = match params.style_preference.as_deref() {
            None => StylePreference::Balanced,
            Some(raw) => match StylePreference::parse(raw) {
                Some(preference) => preference,
                None => {
                    return fail(&EaselError::Validation(format!(
                        "unknown style preference '{}'; use subtle, balanced, or strong",
                        raw
                    )))
                }
            },
        };

        match self
            .state
            .orchestrate(&params.prompt, preference, params.user_id.as_deref())
            .await
        {
            Ok(report) => match serde_json::to_value(&report) {
                Ok(value) => ok(json!({"orchestration": value})),
                Err(e) => fail(&EaselError::from(e)),
            },
            Err(e) => fail(&e),
        }
    }

    // =========================================================================
    // Content analysis
    // =========================================================================

    #[tool(description = "Analyze a prompt: matched taxonomy words, missing axes, safety")]
    async fn analyze_prompt_content(&self, Parameters(params): Parameters<AnalyzeParams>) -> String {
        match self
            .state
            .content
            .analyze(&params.prompt, params.negative_prompt.as_deref().unwrap_or(""))
        {
            Ok(analysis) => match serde_json::to_value(&analysis) {
                Ok(value) => ok(json!({"analysis": value})),
                Err(e) => fail(&EaselError::from(e)),
            },
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "Enhance a prompt with axis fillers and an optional safety filter")]
    async fn enhanced_prompt_generation(
        &self,
        Parameters(params): Parameters<EnhanceParams>,
    ) -> String {
        match self.state.content.enhance(
            &params.prompt,
            params.apply_suggestions.unwrap_or(true),
            params.safety_filter.unwrap_or(false),
        ) {
            Ok(enhanced) => match serde_json::to_value(&enhanced) {
                Ok(value) => ok(json!({"enhanced": value})),
                Err(e) => fail(&EaselError::from(e)),
            },
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "List content taxonomy categories, optionally by type")]
    async fn get_content_categories(
        &self,
        Parameters(params): Parameters<CategoriesParams>,
    ) -> String {
        match self.state.content.categories(params.category_type.as_deref()) {
            Ok(categories) => ok(json!({
                "total": categories.len(),
                "categories": categories,
            })),
            Err(e) => fail(&e),
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    #[tool(description = "List chat personalities")]
    async fn get_personalities_list(&self, Parameters(_params): Parameters<NoParams>) -> String {
        match self.state.convo.list_personalities() {
            Ok(personalities) => ok(json!({
                "personalities": personalities.iter().map(|p| json!({
                    "name": p.name,
                    "display_name": p.display_name,
                    "description": p.description,
                    "emoji": p.emoji,
                })).collect::<Vec<_>>(),
            })),
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "Report which image sink an upload would use right now")]
    async fn test_upload_connection(&self, Parameters(_params): Parameters<NoParams>) -> String {
        match self.state.uploader.test_connection().await {
            Ok(sink) => ok(json!({"sink": sink})),
            Err(e) => fail(&e),
        }
    }

    #[tool(description = "Health and availability of both LLM channels")]
    async fn get_llm_status(&self, Parameters(_params): Parameters<NoParams>) -> String {
        ok(json!({"llm": self.state.llm.provider_info().await}))
    }
}

#[tool_handler]
impl ServerHandler for EaselMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "easel MCP server - Stable Diffusion generation tools. \
                 Use orchestrate_image_generation for the full recipe, \
                 suggest_loras_for_prompt and validate_lora_combination for \
                 LoRA work, and enqueue_image_generation/get_generation_progress \
                 for queued jobs."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Start the MCP server on the given port
pub async fn start_mcp_server(
    port: u16,
    state: Arc<AppState>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!(port, "MCP server listening");

    let service = StreamableHttpService::new(
        move || Ok(EaselMcpServer::new(state.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("MCP server error: {}", e);
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tool_results_carry_success_flag() {
        let (state, _dir) = crate::state::tests::test_state();
        let server = EaselMcpServer::new(Arc::new(state));

        let result = server
            .get_samplers_list(Parameters(NoParams {}))
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["success"], true);
        assert!(parsed["samplers"].is_array());
    }

    #[tokio::test]
    async fn validation_failures_are_structured() {
        let (state, _dir) = crate::state::tests::test_state();
        let server = EaselMcpServer::new(Arc::new(state));

        let result = server
            .enqueue_image_generation(Parameters(GenerateImageParams {
                prompt: "ok".to_string(),
                negative_prompt: None,
                steps: Some(9999),
                width: None,
                height: None,
                sampler_name: None,
                cfg_scale: None,
                seed: None,
                output_path: None,
                user_id: None,
                priority: None,
            }))
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["error_kind"], "validation");

        // No side effects: nothing was enqueued
        let server_state = server.state.clone();
        assert_eq!(server_state.queue.list(None).len(), 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (state, _dir) = crate::state::tests::test_state();
        let server = EaselMcpServer::new(Arc::new(state));

        let result = server
            .cancel_generation_job(Parameters(CancelParams {
                job_id: "missing".to_string(),
            }))
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["error_kind"], "not_found");
    }

    #[tokio::test]
    async fn unknown_category_is_validation_error() {
        let (state, _dir) = crate::state::tests::test_state();
        let server = EaselMcpServer::new(Arc::new(state));

        let result = server
            .browse_loras_by_category(Parameters(BrowseLorasParams {
                category: "vaporwave".to_string(),
                limit: None,
            }))
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["error_kind"], "validation");
    }
}
