//! SD engine gateway
//!
//! Typed facade over the Stable Diffusion HTTP API: model/sampler/LoRA
//! listing, txt2img, progress polling, interrupt, and the NudeNet censor
//! extension. No retries here; retry policy belongs to callers.
//!
//! The backend is an enum so tests and the queue worker can run against a
//! mock engine without HTTP.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{transport_error, EaselError, Result};

/// Checkpoint model as reported by the engine
#[derive(Debug, Clone, Deserialize)]
pub struct SdModel {
    pub title: String,
    pub model_name: String,
    #[serde(default)]
    pub hash: Option<String>,
}

/// Sampler as reported by the engine
#[derive(Debug, Clone, Deserialize)]
pub struct Sampler {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Raw LoRA entry from the engine, metadata included
#[derive(Debug, Clone, Deserialize)]
pub struct LoraEntry {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// txt2img request parameters
#[derive(Debug, Clone, Serialize)]
pub struct Txt2ImgRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub cfg_scale: f64,
    pub sampler_name: String,
    pub seed: i64,
}

impl Default for Txt2ImgRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 25,
            width: 512,
            height: 512,
            cfg_scale: 7.0,
            sampler_name: "Euler a".to_string(),
            seed: -1,
        }
    }
}

/// Decoded txt2img output
#[derive(Debug, Clone)]
pub struct GeneratedImages {
    pub images: Vec<Vec<u8>>,
    /// Engine-reported generation info (seed, sampler, timings)
    pub info: String,
}

/// Generation progress snapshot
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub progress: f64,
    pub eta_seconds: f64,
    pub current_image: Option<String>,
}

/// Outcome of a censor pass
#[derive(Debug, Clone)]
pub struct CensorOutcome {
    pub has_nsfw: bool,
    /// Censored image bytes when the extension masked anything
    pub censored: Option<Vec<u8>>,
    pub detection_classes: Vec<String>,
}

/// Mask filter applied by the censor extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    VariableBlur,
    Pixelation,
    SolidFill,
}

impl FilterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterType::VariableBlur => "Variable blur",
            FilterType::Pixelation => "Pixelation",
            FilterType::SolidFill => "Solid fill",
        }
    }
}

/// Mask shape used by the censor extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskShape {
    Ellipse,
    Rectangle,
}

impl MaskShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaskShape::Ellipse => "Ellipse",
            MaskShape::Rectangle => "Rectangle",
        }
    }
}

/// NudeNet censor configuration
///
/// Per-class detection thresholds follow the extension's convention:
/// 1.0 means the class is never censored.
#[derive(Debug, Clone)]
pub struct CensorConfig {
    pub threshold_face: f64,
    pub threshold_breast_exposed: f64,
    pub threshold_breast_covered: f64,
    pub threshold_buttocks_exposed: f64,
    pub threshold_buttocks_covered: f64,
    pub threshold_genitalia_exposed: f64,
    pub threshold_genitalia_covered: f64,
    pub threshold_feet: f64,
    pub threshold_belly: f64,
    pub threshold_armpits: f64,
    pub threshold_default: f64,
    pub nms_threshold: f64,
    pub filter_type: FilterType,
    pub blur_radius: u32,
    pub blur_strength_curve: u32,
    pub pixelation_factor: u32,
    pub fill_color: String,
    pub mask_shape: MaskShape,
    pub mask_blend_radius: u32,
    pub rectangle_round_radius: u32,
    pub expand_horizontal: f64,
    pub expand_vertical: f64,
}

impl Default for CensorConfig {
    fn default() -> Self {
        Self {
            threshold_face: 1.0,
            threshold_breast_exposed: 0.1,
            threshold_breast_covered: 1.0,
            threshold_buttocks_exposed: 0.1,
            threshold_buttocks_covered: 1.0,
            threshold_genitalia_exposed: 0.1,
            threshold_genitalia_covered: 1.0,
            threshold_feet: 1.0,
            threshold_belly: 1.0,
            threshold_armpits: 1.0,
            threshold_default: 1.0,
            nms_threshold: 0.5,
            filter_type: FilterType::VariableBlur,
            blur_radius: 10,
            blur_strength_curve: 3,
            pixelation_factor: 5,
            fill_color: "#000000".to_string(),
            mask_shape: MaskShape::Ellipse,
            mask_blend_radius: 10,
            rectangle_round_radius: 0,
            expand_horizontal: 1.0,
            expand_vertical: 1.0,
        }
    }
}

impl CensorConfig {
    /// Build the 18-element threshold array in the extension's label order:
    /// 0 Female_genitalia_covered, 1 Face_female, 2 Buttocks_exposed,
    /// 3 Female_breast_exposed, 4 Female_genitalia_exposed,
    /// 5 Male_breast_exposed, 6 Anus_exposed, 7 Feet_exposed,
    /// 8 Belly_covered, 9 Feet_covered, 10 Armpits_covered,
    /// 11 Armpits_exposed, 12 Face_male, 13 Belly_exposed,
    /// 14 Male_genitalia_exposed, 15 Anus_covered,
    /// 16 Female_breast_covered, 17 Buttocks_covered
    pub fn thresholds(&self) -> [f64; 18] {
        [
            self.threshold_genitalia_covered,
            self.threshold_face,
            self.threshold_buttocks_exposed,
            self.threshold_breast_exposed,
            self.threshold_genitalia_exposed,
            self.threshold_breast_exposed,
            self.threshold_genitalia_exposed,
            self.threshold_feet,
            self.threshold_belly,
            self.threshold_feet,
            self.threshold_armpits,
            self.threshold_armpits,
            self.threshold_face,
            self.threshold_belly,
            self.threshold_genitalia_exposed,
            self.threshold_genitalia_covered,
            self.threshold_breast_covered,
            self.threshold_buttocks_covered,
        ]
    }
}

/// Format a LoRA reference the way the engine expects it in prompts
pub fn lora_prompt_ref(name: &str, weight: f64) -> String {
    format!("<lora:{}:{:.2}>", name, weight)
}

/// Shared state for the mock backend so tests can observe the worker
#[derive(Debug, Default)]
pub struct MockEngineState {
    pub interrupt: AtomicBool,
    pub fail_generation: AtomicBool,
    /// Makes txt2img panic, for worker resilience tests
    pub panic_generation: AtomicBool,
    pub concurrent: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    /// Prompts in the order txt2img was invoked
    pub calls: Mutex<Vec<String>>,
}

/// How to reach the engine
pub enum SdBackend {
    Http {
        base_url: String,
        auth: Option<(String, String)>,
    },
    /// In-process fake engine for tests
    Mock {
        state: Arc<MockEngineState>,
        latency: Duration,
    },
}

/// Gateway to the SD engine
pub struct SdGateway {
    backend: SdBackend,
    client: reqwest::Client,
    generation_timeout: Duration,
    listing_timeout: Duration,
}

// 1x1 transparent PNG, returned by the mock backend
const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

impl SdGateway {
    pub fn new(
        base_url: String,
        auth: Option<(String, String)>,
        generation_timeout: Duration,
        listing_timeout: Duration,
    ) -> Self {
        Self {
            backend: SdBackend::Http { base_url, auth },
            client: reqwest::Client::new(),
            generation_timeout,
            listing_timeout,
        }
    }

    /// Mock gateway for tests: generation takes `latency` and honors interrupt
    pub fn mock(latency: Duration) -> (Self, Arc<MockEngineState>) {
        let state = Arc::new(MockEngineState::default());
        let gateway = Self {
            backend: SdBackend::Mock {
                state: state.clone(),
                latency,
            },
            client: reqwest::Client::new(),
            generation_timeout: Duration::from_secs(5),
            listing_timeout: Duration::from_secs(5),
        };
        (gateway, state)
    }

    fn get(&self, base: &str, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let mut req = self.client.get(format!("{}{}", base, path)).timeout(timeout);
        if let SdBackend::Http {
            auth: Some((user, pass)),
            ..
        } = &self.backend
        {
            req = req.basic_auth(user, Some(pass));
        }
        req
    }

    fn post(&self, base: &str, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}{}", base, path))
            .timeout(timeout);
        if let SdBackend::Http {
            auth: Some((user, pass)),
            ..
        } = &self.backend
        {
            req = req.basic_auth(user, Some(pass));
        }
        req
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(EaselError::Upstream {
            component: "sd",
            message: format!("HTTP {}: {}", status.as_u16(), snippet),
        })
    }

    /// List available checkpoint models
    pub async fn list_models(&self) -> Result<Vec<SdModel>> {
        match &self.backend {
            SdBackend::Http { base_url, .. } => {
                let resp = self
                    .get(base_url, "/sdapi/v1/sd-models", self.listing_timeout)
                    .send()
                    .await
                    .map_err(|e| transport_error("sd", e))?;
                let resp = Self::check_status(resp).await?;
                resp.json().await.map_err(|e| transport_error("sd", e))
            }
            SdBackend::Mock { .. } => Ok(vec![SdModel {
                title: "mock-v1.safetensors [0000]".to_string(),
                model_name: "mock-v1".to_string(),
                hash: Some("0000".to_string()),
            }]),
        }
    }

    /// List available samplers
    pub async fn list_samplers(&self) -> Result<Vec<Sampler>> {
        match &self.backend {
            SdBackend::Http { base_url, .. } => {
                let resp = self
                    .get(base_url, "/sdapi/v1/samplers", self.listing_timeout)
                    .send()
                    .await
                    .map_err(|e| transport_error("sd", e))?;
                let resp = Self::check_status(resp).await?;
                resp.json().await.map_err(|e| transport_error("sd", e))
            }
            SdBackend::Mock { .. } => Ok(vec![
                Sampler {
                    name: "Euler a".to_string(),
                    aliases: vec!["k_euler_a".to_string()],
                },
                Sampler {
                    name: "DPM++ 2M".to_string(),
                    aliases: vec![],
                },
            ]),
        }
    }

    /// List LoRAs with raw metadata (training tag frequency when present)
    pub async fn list_loras(&self) -> Result<Vec<LoraEntry>> {
        match &self.backend {
            SdBackend::Http { base_url, .. } => {
                let resp = self
                    .get(base_url, "/sdapi/v1/loras", self.listing_timeout)
                    .send()
                    .await
                    .map_err(|e| transport_error("sd", e))?;
                let resp = Self::check_status(resp).await?;
                resp.json().await.map_err(|e| transport_error("sd", e))
            }
            SdBackend::Mock { .. } => Ok(vec![]),
        }
    }

    /// Name of the currently loaded checkpoint
    pub async fn current_model(&self) -> Result<String> {
        match &self.backend {
            SdBackend::Http { base_url, .. } => {
                let resp = self
                    .get(base_url, "/sdapi/v1/options", self.listing_timeout)
                    .send()
                    .await
                    .map_err(|e| transport_error("sd", e))?;
                let resp = Self::check_status(resp).await?;
                let options: serde_json::Value =
                    resp.json().await.map_err(|e| transport_error("sd", e))?;
                Ok(options["sd_model_checkpoint"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string())
            }
            SdBackend::Mock { .. } => Ok("mock-v1".to_string()),
        }
    }

    /// Run txt2img and decode the returned images
    pub async fn txt2img(&self, request: &Txt2ImgRequest) -> Result<GeneratedImages> {
        match &self.backend {
            SdBackend::Http { base_url, .. } => {
                let payload = json!({
                    "prompt": request.prompt,
                    "negative_prompt": request.negative_prompt,
                    "steps": request.steps,
                    "width": request.width,
                    "height": request.height,
                    "cfg_scale": request.cfg_scale,
                    "sampler_name": request.sampler_name,
                    "seed": request.seed,
                    "n_iter": 1,
                });
                let resp = self
                    .post(base_url, "/sdapi/v1/txt2img", self.generation_timeout)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| match e.is_timeout() {
                        true => EaselError::Timeout {
                            component: "sd",
                            seconds: self.generation_timeout.as_secs(),
                        },
                        false => transport_error("sd", e),
                    })?;
                let resp = Self::check_status(resp).await?;
                let body: serde_json::Value =
                    resp.json().await.map_err(|e| transport_error("sd", e))?;

                let encoded = body["images"].as_array().cloned().unwrap_or_default();
                if encoded.is_empty() {
                    return Err(EaselError::Upstream {
                        component: "sd",
                        message: "no images returned".to_string(),
                    });
                }

                let mut images = Vec::with_capacity(encoded.len());
                for value in encoded {
                    let data = value.as_str().unwrap_or_default();
                    // Engine may prefix a data URL
                    let b64 = data.rsplit(',').next().unwrap_or(data);
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(b64)
                        .map_err(|e| EaselError::Upstream {
                            component: "sd",
                            message: format!("bad image encoding: {}", e),
                        })?;
                    images.push(bytes);
                }

                let info = body["info"].as_str().unwrap_or_default().to_string();
                Ok(GeneratedImages { images, info })
            }
            SdBackend::Mock { state, latency } => {
                state.calls.lock().unwrap().push(request.prompt.clone());
                let now = state.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                state.max_concurrent.fetch_max(now, Ordering::SeqCst);

                // Sleep in slices so interrupt can cut generation short
                let slice = Duration::from_millis(5);
                let mut elapsed = Duration::ZERO;
                while elapsed < *latency && !state.interrupt.load(Ordering::SeqCst) {
                    tokio::time::sleep(slice).await;
                    elapsed += slice;
                }
                state.interrupt.store(false, Ordering::SeqCst);
                state.concurrent.fetch_sub(1, Ordering::SeqCst);

                if state.panic_generation.load(Ordering::SeqCst) {
                    panic!("mock generation panic");
                }
                if state.fail_generation.load(Ordering::SeqCst) {
                    return Err(EaselError::Upstream {
                        component: "sd",
                        message: "mock generation failure".to_string(),
                    });
                }
                Ok(GeneratedImages {
                    images: vec![PNG_1X1.to_vec()],
                    info: format!("{{\"seed\": 42, \"prompt\": {:?}}}", request.prompt),
                })
            }
        }
    }

    /// Poll generation progress
    pub async fn progress(&self) -> Result<Progress> {
        match &self.backend {
            SdBackend::Http { base_url, .. } => {
                let resp = self
                    .get(base_url, "/sdapi/v1/progress", self.listing_timeout)
                    .send()
                    .await
                    .map_err(|e| transport_error("sd", e))?;
                let resp = Self::check_status(resp).await?;
                let body: serde_json::Value =
                    resp.json().await.map_err(|e| transport_error("sd", e))?;
                Ok(Progress {
                    progress: body["progress"].as_f64().unwrap_or(0.0),
                    eta_seconds: body["eta_relative"].as_f64().unwrap_or(0.0),
                    current_image: body["current_image"].as_str().map(|s| s.to_string()),
                })
            }
            SdBackend::Mock { state, .. } => {
                let active = state.concurrent.load(Ordering::SeqCst) > 0;
                Ok(Progress {
                    progress: if active { 0.5 } else { 0.0 },
                    eta_seconds: 0.0,
                    current_image: None,
                })
            }
        }
    }

    /// Interrupt the in-flight generation
    pub async fn interrupt(&self) -> Result<()> {
        match &self.backend {
            SdBackend::Http { base_url, .. } => {
                let resp = self
                    .post(base_url, "/sdapi/v1/interrupt", self.listing_timeout)
                    .send()
                    .await
                    .map_err(|e| transport_error("sd", e))?;
                Self::check_status(resp).await?;
                Ok(())
            }
            SdBackend::Mock { state, .. } => {
                state.interrupt.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Run the NudeNet censor extension over an image
    pub async fn censor(&self, image: &[u8], config: &CensorConfig) -> Result<CensorOutcome> {
        match &self.backend {
            SdBackend::Http { base_url, .. } => {
                let b64 = base64::engine::general_purpose::STANDARD.encode(image);
                let thresholds = config.thresholds();
                let payload = json!({
                    "input_image": b64,
                    "enable_nudenet": true,
                    "output_mask": true,
                    "filter_type": config.filter_type.as_str(),
                    "blur_radius": config.blur_radius,
                    "blur_strength_curve": config.blur_strength_curve,
                    "pixelation_factor": config.pixelation_factor,
                    "fill_color": config.fill_color,
                    "mask_shape": config.mask_shape.as_str(),
                    "mask_blend_radius": config.mask_blend_radius,
                    "rectangle_round_radius": config.rectangle_round_radius,
                    "nms_threshold": config.nms_threshold,
                    "thresholds": thresholds,
                    "expand_horizontal": vec![config.expand_horizontal; 18],
                    "expand_vertical": vec![config.expand_vertical; 18],
                });

                let resp = self
                    .post(base_url, "/nudenet/censor", self.generation_timeout)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| transport_error("sd", e))?;

                if resp.status().as_u16() == 404 {
                    return Err(EaselError::Upstream {
                        component: "sd",
                        message: "NudeNet extension not available".to_string(),
                    });
                }
                let resp = Self::check_status(resp).await?;
                let body: serde_json::Value =
                    resp.json().await.map_err(|e| transport_error("sd", e))?;

                let censored_b64 = body["image"].as_str().unwrap_or_default();
                let mask_b64 = body["mask"].as_str().unwrap_or_default();
                let has_nsfw = !censored_b64.is_empty() || !mask_b64.is_empty();

                let censored = if censored_b64.is_empty() {
                    None
                } else {
                    let raw = censored_b64.rsplit(',').next().unwrap_or(censored_b64);
                    Some(
                        base64::engine::general_purpose::STANDARD
                            .decode(raw)
                            .map_err(|e| EaselError::Upstream {
                                component: "sd",
                                message: format!("bad censored image encoding: {}", e),
                            })?,
                    )
                };

                let detection_classes = body["detection_classes"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();

                Ok(CensorOutcome {
                    has_nsfw,
                    censored,
                    detection_classes,
                })
            }
            SdBackend::Mock { .. } => Ok(CensorOutcome {
                has_nsfw: false,
                censored: None,
                detection_classes: vec![],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lora_ref_format() {
        assert_eq!(lora_prompt_ref("animeStyleV4", 0.8), "<lora:animeStyleV4:0.80>");
        assert_eq!(lora_prompt_ref("miku", 1.0), "<lora:miku:1.00>");
    }

    #[test]
    fn threshold_array_follows_label_order() {
        let config = CensorConfig {
            threshold_face: 0.9,
            threshold_breast_exposed: 0.2,
            ..CensorConfig::default()
        };
        let t = config.thresholds();
        assert_eq!(t.len(), 18);
        assert_eq!(t[1], 0.9); // Face_female
        assert_eq!(t[12], 0.9); // Face_male
        assert_eq!(t[3], 0.2); // Female_breast_exposed
        assert_eq!(t[5], 0.2); // Male_breast_exposed
        // 1.0 disables a class
        assert_eq!(t[16], 1.0); // Female_breast_covered
    }

    #[tokio::test]
    async fn mock_generation_returns_an_image() {
        let (gateway, state) = SdGateway::mock(Duration::from_millis(10));
        let result = gateway.txt2img(&Txt2ImgRequest::default()).await.unwrap();
        assert_eq!(result.images.len(), 1);
        assert!(!result.images[0].is_empty());
        assert_eq!(state.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mock_interrupt_cuts_generation_short() {
        let (gateway, state) = SdGateway::mock(Duration::from_secs(30));
        state.interrupt.store(true, Ordering::SeqCst);
        let started = std::time::Instant::now();
        let _ = gateway.txt2img(&Txt2ImgRequest::default()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn mock_generation_failure_maps_to_upstream() {
        let (gateway, state) = SdGateway::mock(Duration::from_millis(1));
        state.fail_generation.store(true, Ordering::SeqCst);
        let err = gateway.txt2img(&Txt2ImgRequest::default()).await.unwrap_err();
        assert_eq!(err.kind(), "upstream");
    }
}
