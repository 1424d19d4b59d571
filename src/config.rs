//! Server configuration
//!
//! All configuration is environment-driven. Every variable has a default so
//! the server starts against a stock local stack (SD WebUI on :7860, local
//! LLM on :1234) with no configuration at all.

use std::collections::HashSet;

use crate::sd::{CensorConfig, FilterType, MaskShape};

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// MCP server listen port
    pub mcp_port: u16,

    /// SD engine base URL
    pub sd_base_url: String,
    /// Optional HTTP basic auth for the SD engine
    pub sd_auth: Option<(String, String)>,
    /// Per-operation timeout for generation calls (seconds)
    pub sd_generation_timeout: u64,
    /// Per-operation timeout for listing/progress calls (seconds)
    pub sd_listing_timeout: u64,

    /// Chat LLM provider switch: "local", "openai", or "none"
    pub chat_provider: String,
    /// Local (OpenAI-compatible) LLM endpoint, also the image-assist provider
    pub local_llm_url: String,
    /// Default model for the local provider (empty = server default)
    pub local_llm_model: String,
    /// OpenAI-compatible remote endpoint
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    /// LLM request timeout (seconds)
    pub llm_timeout: u64,

    /// Image host base URL (None disables external hosting)
    pub host_base_url: Option<String>,
    /// Guest API key used when the caller has no personal key
    pub host_guest_api_key: Option<String>,
    /// Upload timeout (seconds)
    pub host_timeout: u64,
    /// Maximum upload size in bytes
    pub host_max_file_size: u64,
    /// Fall back to the local file sink when hosting fails
    pub local_fallback: bool,
    /// Base URL the local file server exposes the image directory under
    pub file_server_base_url: String,

    /// Rate limits per action type (events per minute)
    pub chat_rate_limit: u32,
    pub generate_rate_limit: u32,

    /// Admin user ids (comma-separated in env)
    pub admin_user_ids: HashSet<String>,

    /// Pairwise LoRA deny list (JSON array of [a, b] pairs in env)
    pub lora_deny_pairs: Vec<(String, String)>,

    /// Auto-clean policy for the conversation store
    pub auto_clean: AutoCleanConfig,

    /// NSFW censor configuration
    pub censor: CensorConfig,
    /// Run the censor pass after generation
    pub nsfw_filter: bool,
}

/// Auto-clean policy
#[derive(Debug, Clone)]
pub struct AutoCleanConfig {
    pub enabled: bool,
    pub method: CleanMethod,
    /// Days between cleanups (days method) and message retention window
    pub days: i64,
    /// Launches between cleanups (launches method)
    pub launches: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanMethod {
    Days,
    Launches,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mcp_port: 8723,
            sd_base_url: "http://localhost:7860".to_string(),
            sd_auth: None,
            sd_generation_timeout: 300,
            sd_listing_timeout: 15,
            chat_provider: "local".to_string(),
            local_llm_url: "http://localhost:1234/v1".to_string(),
            local_llm_model: String::new(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            llm_timeout: 60,
            host_base_url: None,
            host_guest_api_key: None,
            host_timeout: 30,
            host_max_file_size: 50 * 1024 * 1024,
            local_fallback: true,
            file_server_base_url: "http://localhost:8081".to_string(),
            chat_rate_limit: 10,
            generate_rate_limit: 5,
            admin_user_ids: HashSet::new(),
            lora_deny_pairs: Vec::new(),
            auto_clean: AutoCleanConfig {
                enabled: false,
                method: CleanMethod::Days,
                days: 7,
                launches: 10,
            },
            censor: CensorConfig::default(),
            nsfw_filter: true,
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let sd_auth = match (env_opt("EASEL_SD_AUTH_USER"), env_opt("EASEL_SD_AUTH_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        let admin_user_ids = env_str("EASEL_ADMIN_USER_IDS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let method = match env_str("EASEL_AUTO_CLEAN_METHOD", "days").as_str() {
            "launches" => CleanMethod::Launches,
            _ => CleanMethod::Days,
        };

        let lora_deny_pairs = env_opt("EASEL_LORA_DENYLIST")
            .and_then(|raw| serde_json::from_str::<Vec<(String, String)>>(&raw).ok())
            .unwrap_or_default();

        Self {
            mcp_port: env_parse("EASEL_MCP_PORT", defaults.mcp_port),
            sd_base_url: env_str("EASEL_SD_BASE_URL", &defaults.sd_base_url),
            sd_auth,
            sd_generation_timeout: env_parse(
                "EASEL_SD_GENERATION_TIMEOUT",
                defaults.sd_generation_timeout,
            ),
            sd_listing_timeout: env_parse("EASEL_SD_LISTING_TIMEOUT", defaults.sd_listing_timeout),
            chat_provider: env_str("EASEL_CHAT_LLM_PROVIDER", &defaults.chat_provider),
            local_llm_url: env_str("EASEL_LOCAL_LLM_URL", &defaults.local_llm_url),
            local_llm_model: env_str("EASEL_LOCAL_LLM_MODEL", ""),
            openai_base_url: env_str("EASEL_OPENAI_BASE_URL", &defaults.openai_base_url),
            openai_api_key: env_opt("EASEL_OPENAI_API_KEY"),
            openai_model: env_str("EASEL_OPENAI_MODEL", &defaults.openai_model),
            llm_timeout: env_parse("EASEL_LLM_TIMEOUT", defaults.llm_timeout),
            host_base_url: env_opt("EASEL_HOST_BASE_URL"),
            host_guest_api_key: env_opt("EASEL_HOST_GUEST_API_KEY"),
            host_timeout: env_parse("EASEL_HOST_TIMEOUT", defaults.host_timeout),
            host_max_file_size: env_parse("EASEL_HOST_MAX_FILE_SIZE", defaults.host_max_file_size),
            local_fallback: env_bool("EASEL_HOST_LOCAL_FALLBACK", defaults.local_fallback),
            file_server_base_url: env_str(
                "EASEL_FILE_SERVER_BASE_URL",
                &defaults.file_server_base_url,
            ),
            chat_rate_limit: env_parse("EASEL_CHAT_RATE_LIMIT_PER_MINUTE", defaults.chat_rate_limit),
            generate_rate_limit: env_parse(
                "EASEL_GENERATE_RATE_LIMIT_PER_MINUTE",
                defaults.generate_rate_limit,
            ),
            admin_user_ids,
            lora_deny_pairs,
            auto_clean: AutoCleanConfig {
                enabled: env_bool("EASEL_AUTO_CLEAN_ENABLED", false),
                method,
                days: env_parse("EASEL_AUTO_CLEAN_DAYS", defaults.auto_clean.days),
                launches: env_parse("EASEL_AUTO_CLEAN_LAUNCHES", defaults.auto_clean.launches),
            },
            censor: censor_from_env(),
            nsfw_filter: env_bool("EASEL_NSFW_FILTER", true),
        }
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_user_ids.contains(user_id)
    }
}

/// NudeNet censor knobs. A threshold of 1.0 disables detection for a class.
fn censor_from_env() -> CensorConfig {
    let defaults = CensorConfig::default();
    CensorConfig {
        threshold_face: env_parse("EASEL_NUDENET_THRESHOLD_FACE", defaults.threshold_face),
        threshold_breast_exposed: env_parse(
            "EASEL_NUDENET_THRESHOLD_BREAST_EXPOSED",
            defaults.threshold_breast_exposed,
        ),
        threshold_breast_covered: env_parse(
            "EASEL_NUDENET_THRESHOLD_BREAST_COVERED",
            defaults.threshold_breast_covered,
        ),
        threshold_buttocks_exposed: env_parse(
            "EASEL_NUDENET_THRESHOLD_BUTTOCKS_EXPOSED",
            defaults.threshold_buttocks_exposed,
        ),
        threshold_buttocks_covered: env_parse(
            "EASEL_NUDENET_THRESHOLD_BUTTOCKS_COVERED",
            defaults.threshold_buttocks_covered,
        ),
        threshold_genitalia_exposed: env_parse(
            "EASEL_NUDENET_THRESHOLD_GENITALIA_EXPOSED",
            defaults.threshold_genitalia_exposed,
        ),
        threshold_genitalia_covered: env_parse(
            "EASEL_NUDENET_THRESHOLD_GENITALIA_COVERED",
            defaults.threshold_genitalia_covered,
        ),
        threshold_feet: env_parse("EASEL_NUDENET_THRESHOLD_FEET", defaults.threshold_feet),
        threshold_belly: env_parse("EASEL_NUDENET_THRESHOLD_BELLY", defaults.threshold_belly),
        threshold_armpits: env_parse("EASEL_NUDENET_THRESHOLD_ARMPITS", defaults.threshold_armpits),
        threshold_default: env_parse("EASEL_NUDENET_THRESHOLD_DEFAULT", defaults.threshold_default),
        nms_threshold: env_parse("EASEL_NUDENET_NMS_THRESHOLD", defaults.nms_threshold),
        filter_type: match env_str("EASEL_NUDENET_FILTER_TYPE", "").as_str() {
            "Pixelation" => FilterType::Pixelation,
            "Solid fill" => FilterType::SolidFill,
            "Variable blur" => FilterType::VariableBlur,
            _ => defaults.filter_type,
        },
        blur_radius: env_parse("EASEL_NUDENET_BLUR_RADIUS", defaults.blur_radius),
        blur_strength_curve: env_parse(
            "EASEL_NUDENET_BLUR_STRENGTH_CURVE",
            defaults.blur_strength_curve,
        ),
        pixelation_factor: env_parse(
            "EASEL_NUDENET_PIXELATION_FACTOR",
            defaults.pixelation_factor,
        ),
        fill_color: env_str("EASEL_NUDENET_FILL_COLOR", &defaults.fill_color),
        mask_shape: match env_str("EASEL_NUDENET_MASK_SHAPE", "").as_str() {
            "Rectangle" => MaskShape::Rectangle,
            "Ellipse" => MaskShape::Ellipse,
            _ => defaults.mask_shape,
        },
        mask_blend_radius: env_parse(
            "EASEL_NUDENET_MASK_BLEND_RADIUS",
            defaults.mask_blend_radius,
        ),
        rectangle_round_radius: env_parse(
            "EASEL_NUDENET_RECTANGLE_ROUND_RADIUS",
            defaults.rectangle_round_radius,
        ),
        expand_horizontal: env_parse("EASEL_NUDENET_EXPAND_HORIZONTAL", defaults.expand_horizontal),
        expand_vertical: env_parse("EASEL_NUDENET_EXPAND_VERTICAL", defaults.expand_vertical),
    }
}
