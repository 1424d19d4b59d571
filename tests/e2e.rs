//! End-to-end integration tests for easel
//!
//! Runs the MCP server over streamable HTTP against a mock SD engine and a
//! mock LLM, and drives the tool surface the way an LLM host would.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rmcp::{
    model::CallToolRequestParam,
    service::ServiceExt,
    transport::StreamableHttpClientTransport,
};
use tokio::net::TcpListener;

use easel::config::Config;
use easel::content::ContentDb;
use easel::convo::ConvoDb;
use easel::llm::LlmRouter;
use easel::lora::analysis::{Category, ContentType};
use easel::lora::{LoraCatalog, LoraRecord};
use easel::mcp_server::EaselMcpServer;
use easel::queue::{self, QueueEngine};
use easel::sd::SdGateway;
use easel::state::AppState;
use easel::upload::{HostDb, UploadRouter};

// ============================================================================
// Test Helpers
// ============================================================================

fn anime_record() -> LoraRecord {
    LoraRecord {
        name: "animeStyleV4".to_string(),
        filename: "animeStyleV4.safetensors".to_string(),
        path: "/loras/animeStyleV4.safetensors".to_string(),
        alias: None,
        category: Category::Anime,
        content_type: ContentType::Safe,
        description: "Trained on: anime, cat ears".to_string(),
        trigger_words: vec!["anime".to_string(), "cat ears".to_string()],
        tag_frequency: [
            ("anime".to_string(), 500),
            ("1girl".to_string(), 450),
            ("cat ears".to_string(), 80),
            ("solo".to_string(), 400),
        ]
        .into_iter()
        .collect(),
        recommended_weight: 1.0,
        min_weight: 0.2,
        max_weight: 1.5,
    }
}

/// Build a full AppState on mock backends, with the queue worker running
fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
    let (gateway, _mock) = SdGateway::mock(Duration::from_millis(10));
    let gateway = Arc::new(gateway);
    let engine = Arc::new(QueueEngine::new(gateway.clone()));
    let uploader = Arc::new(UploadRouter::local_only(
        HostDb::in_memory().unwrap(),
        dir.path().to_path_buf(),
        "http://localhost:8081".to_string(),
    ));

    let lora = LoraCatalog::in_memory().unwrap();
    lora.insert_record(&anime_record()).unwrap();

    let _worker = queue::spawn_worker(engine.clone(), gateway.clone(), uploader.clone(), None);

    Arc::new(AppState {
        config: Config::default(),
        gateway,
        lora: Arc::new(lora),
        content: Arc::new(ContentDb::in_memory().unwrap()),
        convo: Arc::new(ConvoDb::in_memory().unwrap()),
        queue: engine,
        uploader,
        llm: Arc::new(LlmRouter::mock()),
    })
}

/// Start the easel MCP server on a random port, returns the URL
async fn start_server(state: Arc<AppState>) -> Result<(String, tokio::task::JoinHandle<()>)> {
    use rmcp::transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpService,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let url = format!("http://127.0.0.1:{}/mcp", port);

    let service = StreamableHttpService::new(
        move || Ok(EaselMcpServer::new(state.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok((url, handle))
}

async fn call_tool(
    client: &rmcp::service::RunningService<rmcp::RoleClient, ()>,
    name: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value> {
    let result = client
        .call_tool(CallToolRequestParam {
            name: name.to_string().into(),
            arguments: args.as_object().cloned(),
        })
        .await?;

    let text = result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(serde_json::from_str(&text)?)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn server_exposes_the_tool_catalog() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state = test_state(&dir);
    let (url, _server) = start_server(state).await?;

    let transport = StreamableHttpClientTransport::from_uri(url.as_str());
    let client = ().serve(transport).await?;

    let tools = client.list_tools(Default::default()).await?;
    let names: Vec<String> = tools.tools.iter().map(|t| t.name.to_string()).collect();

    for expected in [
        "get_sd_models_summary",
        "search_sd_models",
        "get_samplers_list",
        "get_lora_summary",
        "browse_loras_by_category",
        "search_loras_smart",
        "suggest_loras_for_prompt",
        "validate_lora_combination",
        "generate_image",
        "enqueue_image_generation",
        "get_generation_progress",
        "get_queue_status",
        "cancel_generation_job",
        "get_job_history",
        "orchestrate_image_generation",
        "analyze_prompt_content",
        "enhanced_prompt_generation",
        "get_content_categories",
        "get_personalities_list",
        "test_upload_connection",
        "get_llm_status",
    ] {
        assert!(names.contains(&expected.to_string()), "missing tool {}", expected);
    }

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn lora_suggestion_over_the_wire() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state = test_state(&dir);
    let (url, _server) = start_server(state).await?;

    let transport = StreamableHttpClientTransport::from_uri(url.as_str());
    let client = ().serve(transport).await?;

    let body = call_tool(
        &client,
        "suggest_loras_for_prompt",
        serde_json::json!({"prompt": "anime girl with cat ears"}),
    )
    .await?;

    assert_eq!(body["success"], true);
    let suggestions = body["suggestions"].as_array().unwrap();
    assert_eq!(suggestions[0]["name"], "animeStyleV4");
    assert_eq!(suggestions[0]["confidence"], "high");
    let score = suggestions[0]["score"].as_f64().unwrap();
    assert!((score - 0.720).abs() < 1e-3);

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn orchestrate_enqueues_and_the_job_completes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state = test_state(&dir);
    let (url, _server) = start_server(state.clone()).await?;

    let transport = StreamableHttpClientTransport::from_uri(url.as_str());
    let client = ().serve(transport).await?;

    let body = call_tool(
        &client,
        "orchestrate_image_generation",
        serde_json::json!({"prompt": "anime girl with cat ears", "style_preference": "balanced"}),
    )
    .await?;

    assert_eq!(body["success"], true);
    let orchestration = &body["orchestration"];
    let job_id = orchestration["job_id"].as_str().unwrap().to_string();
    assert!(orchestration["final_prompt"]
        .as_str()
        .unwrap()
        .contains("<lora:animeStyleV4:"));
    assert_eq!(
        orchestration["steps_completed"].as_array().unwrap().len(),
        5
    );

    // Poll progress until the worker finishes against the mock engine
    let mut last = serde_json::Value::Null;
    for _ in 0..100 {
        last = call_tool(
            &client,
            "get_generation_progress",
            serde_json::json!({"job_id": job_id}),
        )
        .await?;
        let job_state = last["job"]["state"].as_str().unwrap_or_default().to_string();
        if job_state == "completed" || job_state == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(last["job"]["state"], "completed");
    let urls = last["job"]["output"]["image_urls"].as_array().unwrap();
    assert_eq!(urls.len(), 1);
    assert!(urls[0].as_str().unwrap().starts_with("http://localhost:8081/images/"));
    assert_eq!(last["job"]["output"]["sink"], "local");

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn queue_tools_report_and_cancel() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state = test_state(&dir);
    let (url, _server) = start_server(state).await?;

    let transport = StreamableHttpClientTransport::from_uri(url.as_str());
    let client = ().serve(transport).await?;

    // Enqueue a couple of jobs
    let first = call_tool(
        &client,
        "enqueue_image_generation",
        serde_json::json!({"prompt": "a quiet village", "priority": 5}),
    )
    .await?;
    assert_eq!(first["success"], true);

    let second = call_tool(
        &client,
        "enqueue_image_generation",
        serde_json::json!({"prompt": "a louder village", "priority": 5}),
    )
    .await?;
    let second_id = second["job_id"].as_str().unwrap().to_string();

    // Cancelling an unknown job is a structured not-found
    let missing = call_tool(
        &client,
        "cancel_generation_job",
        serde_json::json!({"job_id": "nope"}),
    )
    .await?;
    assert_eq!(missing["success"], false);
    assert_eq!(missing["error_kind"], "not_found");

    // Queue status parses and the history fills in as jobs finish
    let status = call_tool(&client, "get_queue_status", serde_json::json!({})).await?;
    assert_eq!(status["success"], true);

    // Wait for both jobs to drain
    for _ in 0..100 {
        let history = call_tool(
            &client,
            "get_job_history",
            serde_json::json!({"limit": 10}),
        )
        .await?;
        if history["jobs"].as_array().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let snapshot = call_tool(
        &client,
        "get_generation_progress",
        serde_json::json!({"job_id": second_id}),
    )
    .await?;
    assert_eq!(snapshot["job"]["state"], "completed");

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn content_tools_analyze_and_enhance() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state = test_state(&dir);
    let (url, _server) = start_server(state).await?;

    let transport = StreamableHttpClientTransport::from_uri(url.as_str());
    let client = ().serve(transport).await?;

    let analysis = call_tool(
        &client,
        "analyze_prompt_content",
        serde_json::json!({"prompt": "topless woman on beach"}),
    )
    .await?;
    assert_eq!(analysis["success"], true);
    assert_eq!(analysis["analysis"]["safety_level"], "explicit");
    assert!(analysis["analysis"]["safety_score"].as_f64().unwrap() >= 0.5);

    let enhanced = call_tool(
        &client,
        "enhanced_prompt_generation",
        serde_json::json!({
            "prompt": "topless woman on beach",
            "apply_suggestions": false,
            "safety_filter": true
        }),
    )
    .await?;
    assert_eq!(enhanced["success"], true);
    let new_prompt = enhanced["enhanced"]["prompt"].as_str().unwrap();
    assert!(!new_prompt.contains("topless"));
    assert!(enhanced["enhanced"]["annotation"].is_string());

    client.cancel().await?;
    Ok(())
}

#[tokio::test]
async fn personalities_and_status_tools() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let state = test_state(&dir);
    let (url, _server) = start_server(state).await?;

    let transport = StreamableHttpClientTransport::from_uri(url.as_str());
    let client = ().serve(transport).await?;

    let personalities = call_tool(&client, "get_personalities_list", serde_json::json!({})).await?;
    let names: Vec<String> = personalities["personalities"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect();
    for expected in ["default", "uwu", "sarcastic", "professional", "helpful", "creative"] {
        assert!(names.contains(&expected.to_string()));
    }

    let sink = call_tool(&client, "test_upload_connection", serde_json::json!({})).await?;
    assert_eq!(sink["success"], true);
    assert_eq!(sink["sink"], "local");

    let llm = call_tool(&client, "get_llm_status", serde_json::json!({})).await?;
    assert_eq!(llm["success"], true);
    assert_eq!(llm["llm"]["chat"]["available"], true);

    client.cancel().await?;
    Ok(())
}
