//! easel - MCP bridge between LLM hosts and a local Stable Diffusion engine
//!
//! Starts the queue worker and the streamable-HTTP MCP endpoint, wires the
//! stores, and runs startup housekeeping (auto-clean, LoRA catalog sync).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use easel::config::Config;
use easel::content::ContentDb;
use easel::convo::ConvoDb;
use easel::llm::LlmRouter;
use easel::lora::LoraCatalog;
use easel::mcp_server;
use easel::paths;
use easel::queue::{self, QueueEngine};
use easel::sd::SdGateway;
use easel::state::AppState;
use easel::upload::{HostDb, UploadRouter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("easel=info".parse()?),
        )
        .init();

    let config = Config::from_env();
    paths::ensure_dirs()?;
    info!(data_dir = %paths::data_dir().display(), "starting easel");

    // Stores
    let mut lora = LoraCatalog::open(paths::lora_db_path())?;
    lora.set_deny_pairs(config.lora_deny_pairs.clone());
    let lora = Arc::new(lora);
    let content = Arc::new(ContentDb::open(paths::content_db_path())?);
    let convo = Arc::new(ConvoDb::open(paths::conversation_db_path())?);
    let host_db = HostDb::open(paths::hosting_db_path())?;

    // Startup housekeeping must never block the server
    match convo.run_auto_clean(&config.auto_clean) {
        Ok(report) if report.ran => info!(
            conversations = report.conversations_deleted,
            rate_events = report.rate_events_deleted,
            "auto-clean completed"
        ),
        Ok(_) => {}
        Err(e) => warn!("auto-clean failed: {}", e),
    }

    // External collaborators
    let gateway = Arc::new(SdGateway::new(
        config.sd_base_url.clone(),
        config.sd_auth.clone(),
        Duration::from_secs(config.sd_generation_timeout),
        Duration::from_secs(config.sd_listing_timeout),
    ));
    let llm = Arc::new(LlmRouter::from_config(&config));
    let uploader = Arc::new(UploadRouter::new(
        host_db,
        config.host_base_url.clone(),
        config.host_guest_api_key.clone(),
        Duration::from_secs(config.host_timeout),
        config.host_max_file_size,
        config.local_fallback,
        paths::image_out_dir(),
        config.file_server_base_url.clone(),
    ));

    // Initial catalog sync; the engine may simply not be up yet
    match lora.sync_from_gateway(&gateway).await {
        Ok(report) if report.skipped => info!("LoRA sync skipped: {}", report.reason),
        Ok(report) => info!(
            total = report.total,
            updated = report.updated,
            duration_ms = report.duration_ms,
            "LoRA catalog synced"
        ),
        Err(e) => warn!("LoRA sync failed (engine offline?): {}", e),
    }

    // Queue and worker
    let engine = Arc::new(QueueEngine::new(gateway.clone()));
    let censor = config.nsfw_filter.then(|| config.censor.clone());
    let _worker = queue::spawn_worker(
        engine.clone(),
        gateway.clone(),
        uploader.clone(),
        censor,
    );

    let state = Arc::new(AppState {
        config,
        gateway,
        lora,
        content,
        convo,
        queue: engine,
        uploader,
        llm,
    });

    let handle = mcp_server::start_mcp_server(state.config.mcp_port, state.clone()).await?;
    handle.await?;

    Ok(())
}
