use crate::error::ApiError;
use crate::payload::{ExtrasPayload, GenerationPayload};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const SDAPI_PREFIX: &str = "/sdapi/v1";
const PROBE_TIMEOUT_SECONDS: u64 = 60;
const LOG_PAYLOAD_CHARS: usize = 400;
const LOG_STRING_CHARS: usize = 256;

/// Subset of `GET options` the replay needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerOptions {
    #[serde(default)]
    pub sd_model_checkpoint: Option<String>,
    #[serde(default)]
    pub sd_checkpoint_hash: Option<String>,
    #[serde(default)]
    pub sd_vae: Option<String>,
}

/// Entry of `GET sd-models`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub title: String,
    pub model_name: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub filename: String,
}

impl ModelInfo {
    /// Matches a short or full checkpoint hash.
    pub fn matches_hash(&self, hash: &str) -> bool {
        let hash = hash.trim().to_ascii_lowercase();
        if hash.is_empty() {
            return false;
        }
        let short = self.hash.as_deref().map(str::to_ascii_lowercase);
        let full = self.sha256.as_deref().map(str::to_ascii_lowercase);
        short.as_deref() == Some(hash.as_str())
            || full.as_deref().is_some_and(|full| full.starts_with(&hash))
    }

    /// Name used to select this checkpoint and to compare session state.
    pub fn canonical_name(&self) -> &str {
        if self.title.is_empty() {
            &self.model_name
        } else {
            &self.title
        }
    }

    /// Matches a checkpoint by model name, title or file name (with or
    /// without extension).
    pub fn matches_name(&self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let file_name = std::path::Path::new(&self.filename)
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_default();
        self.model_name == name
            || self.title == name
            || file_name == name
            || strip_model_extension(&file_name) == name
    }
}

/// Entry of `GET sd-vae`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecoderInfo {
    pub model_name: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub eta_relative: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub info: Option<String>,
}

impl GenerationResponse {
    /// The service's canonical parameter string for the first image.
    pub fn infotext(&self) -> Option<String> {
        let info: Value = serde_json::from_str(self.info.as_deref()?).ok()?;
        info.get("infotexts")
            .and_then(Value::as_array)
            .and_then(|texts| texts.first())
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ExtrasResponse {
    image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeStatus {
    pub ok: bool,
    pub message: String,
}

/// Operations the replay pipeline needs from the generation service.
///
/// Every call returns a `Result`; callers decide locally whether a failure is
/// fatal (`?`) or skippable.
#[allow(async_fn_in_trait)]
pub trait ForgeBackend {
    async fn options(&self) -> Result<ServerOptions, ApiError>;
    async fn set_model(&self, name: &str) -> Result<(), ApiError>;
    async fn set_decoder(&self, name: &str) -> Result<(), ApiError>;
    async fn models(&self) -> Result<Vec<ModelInfo>, ApiError>;
    async fn refresh_models(&self) -> Result<(), ApiError>;
    async fn decoders(&self) -> Result<Vec<DecoderInfo>, ApiError>;
    async fn samplers(&self) -> Result<Vec<String>, ApiError>;
    async fn upscalers(&self) -> Result<Vec<String>, ApiError>;
    async fn txt2img(&self, payload: &GenerationPayload) -> Result<GenerationResponse, ApiError>;
    async fn img2img(&self, payload: &GenerationPayload) -> Result<GenerationResponse, ApiError>;
    /// Returns the processed image as base64.
    async fn extra_single_image(&self, payload: &ExtrasPayload) -> Result<String, ApiError>;
    async fn progress(&self) -> Result<Progress, ApiError>;
    async fn interrupt(&self) -> Result<(), ApiError>;
}

/// HTTP implementation of [`ForgeBackend`] for Forge / A1111 `--api`.
#[derive(Debug, Clone)]
pub struct ForgeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ForgeClient {
    /// Generation calls carry no timeout: a hung service stalls the queue.
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self, ApiError> {
        Ok(Self {
            http: build_client(api_key, None)?,
            base_url: normalize_base_url(base_url),
            api_key: api_key.map(str::to_string),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issues one call and normalizes every failure into an [`ApiError`],
    /// logging method, endpoint and a payload summary.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        let url = build_sdapi_endpoint(&self.base_url, endpoint);
        let mut request = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => return Err(self.transport_failure(&method, &url, body, &error)),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let hint = if status == StatusCode::NOT_FOUND {
                " Start Forge with --api and use a base URL like http://127.0.0.1:7860 (without /sdapi/v1)."
            } else {
                ""
            };
            log::error!(
                "{} {} failed with status {}.{} Payload: {}",
                method,
                url,
                status,
                hint,
                summarize_payload(body)
            );
            return Err(ApiError::Status {
                method: method.to_string(),
                endpoint: url,
                status: status.as_u16(),
                body: truncate(&text, LOG_PAYLOAD_CHARS),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| self.transport_failure(&method, &url, body, &error))?;
        let bytes: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        serde_json::from_slice(bytes).map_err(|error| {
            log::error!("{} {} returned an unexpected body: {}", method, url, error);
            ApiError::Decode {
                method: method.to_string(),
                endpoint: url,
                message: error.to_string(),
            }
        })
    }

    /// Short-timeout reachability check used by the `status` command.
    pub async fn probe(&self) -> ForgeStatus {
        let client = match build_client(
            self.api_key.as_deref(),
            Some(Duration::from_secs(PROBE_TIMEOUT_SECONDS)),
        ) {
            Ok(client) => client,
            Err(error) => {
                return ForgeStatus {
                    ok: false,
                    message: error.to_string(),
                }
            }
        };
        let endpoint = build_sdapi_endpoint(&self.base_url, "samplers");

        match client.get(&endpoint).send().await {
            Ok(response) if response.status().is_success() => ForgeStatus {
                ok: true,
                message: format!("Connected to Forge/A1111 API at {}", self.base_url),
            },
            Ok(response) => ForgeStatus {
                ok: false,
                message: format!(
                    "Connection failed with status {} at {}",
                    response.status(),
                    endpoint
                ),
            },
            Err(error) if error.is_connect() => ForgeStatus {
                ok: false,
                message: ApiError::NotRunning {
                    base_url: self.base_url.clone(),
                }
                .to_string(),
            },
            Err(error) => ForgeStatus {
                ok: false,
                message: format!("Forge transport error at {}: {}", endpoint, error),
            },
        }
    }

    fn transport_failure(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        error: &reqwest::Error,
    ) -> ApiError {
        if error.is_connect() {
            let failure = ApiError::NotRunning {
                base_url: self.base_url.clone(),
            };
            log::error!("{}", failure);
            return failure;
        }

        log::error!(
            "{} {} transport error: {}. Payload: {}",
            method,
            url,
            error,
            summarize_payload(body)
        );
        ApiError::Transport {
            method: method.to_string(),
            endpoint: url.to_string(),
            message: error.to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.call(Method::GET, endpoint, None).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body).map_err(|error| ApiError::Decode {
            method: Method::POST.to_string(),
            endpoint: endpoint.to_string(),
            message: error.to_string(),
        })?;
        self.call(Method::POST, endpoint, Some(&body)).await
    }

    async fn named_options(&self, endpoint: &str) -> Result<Vec<String>, ApiError> {
        let raw: Vec<Value> = self.get(endpoint).await?;
        Ok(collect_named_options(&raw))
    }
}

impl ForgeBackend for ForgeClient {
    async fn options(&self) -> Result<ServerOptions, ApiError> {
        self.get("options").await
    }

    async fn set_model(&self, name: &str) -> Result<(), ApiError> {
        self.post::<Value, _>("options", &json!({ "sd_model_checkpoint": name }))
            .await
            .map(|_| ())
    }

    async fn set_decoder(&self, name: &str) -> Result<(), ApiError> {
        self.post::<Value, _>("options", &json!({ "sd_vae": name }))
            .await
            .map(|_| ())
    }

    async fn models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        self.get("sd-models").await
    }

    async fn refresh_models(&self) -> Result<(), ApiError> {
        self.post::<Value, _>("refresh-checkpoints", &json!({}))
            .await
            .map(|_| ())
    }

    async fn decoders(&self) -> Result<Vec<DecoderInfo>, ApiError> {
        self.get("sd-vae").await
    }

    async fn samplers(&self) -> Result<Vec<String>, ApiError> {
        self.named_options("samplers").await
    }

    async fn upscalers(&self) -> Result<Vec<String>, ApiError> {
        self.named_options("upscalers").await
    }

    async fn txt2img(&self, payload: &GenerationPayload) -> Result<GenerationResponse, ApiError> {
        self.post("txt2img", payload).await
    }

    async fn img2img(&self, payload: &GenerationPayload) -> Result<GenerationResponse, ApiError> {
        self.post("img2img", payload).await
    }

    async fn extra_single_image(&self, payload: &ExtrasPayload) -> Result<String, ApiError> {
        let response: ExtrasResponse = self.post("extra-single-image", payload).await?;
        Ok(response.image)
    }

    async fn progress(&self) -> Result<Progress, ApiError> {
        self.get("progress").await
    }

    async fn interrupt(&self) -> Result<(), ApiError> {
        self.post::<Value, _>("interrupt", &json!({}))
            .await
            .map(|_| ())
    }
}

fn collect_named_options(entries: &[Value]) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut options = Vec::new();

    for entry in entries {
        let name = entry
            .get("name")
            .and_then(|value| value.as_str())
            .or_else(|| entry.get("label").and_then(|value| value.as_str()))
            .or_else(|| entry.get("title").and_then(|value| value.as_str()));

        let Some(name) = name else {
            continue;
        };
        let trimmed = name.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            options.push(trimmed.to_string());
        }
    }

    options
}

pub(crate) fn strip_model_extension(value: &str) -> &str {
    let lower = value.to_ascii_lowercase();
    for ext in [".safetensors", ".ckpt", ".pt", ".gguf"] {
        if lower.ends_with(ext) {
            return &value[..value.len() - ext.len()];
        }
    }
    value
}

/// Payload summary for logs: long strings (base64 images) are elided.
fn summarize_payload(body: Option<&Value>) -> String {
    fn elide(value: &Value) -> Value {
        match value {
            Value::String(text) if text.len() > LOG_STRING_CHARS => {
                Value::String(format!("<{} bytes>", text.len()))
            }
            Value::Array(items) => Value::Array(items.iter().map(elide).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), elide(value)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    match body {
        Some(body) => truncate(&elide(body).to_string(), LOG_PAYLOAD_CHARS),
        None => "<none>".to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

fn build_sdapi_endpoint(base_url: &str, endpoint: &str) -> String {
    let normalized = normalize_base_url(base_url);
    let path = endpoint.trim_start_matches('/');
    format!("{normalized}{SDAPI_PREFIX}/{path}")
}

fn normalize_base_url(base_url: &str) -> String {
    let mut normalized = base_url.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return normalized;
    }

    loop {
        let stripped = if let Some(value) = normalized.strip_suffix("/docs") {
            Some(value)
        } else if let Some(value) = normalized.strip_suffix(SDAPI_PREFIX) {
            Some(value)
        } else {
            normalized.strip_suffix("/sdapi")
        };

        let Some(value) = stripped else {
            return normalized;
        };

        normalized = value.trim_end_matches('/').to_string();
        if normalized.is_empty() {
            return normalized;
        }
    }
}

fn build_client(
    api_key: Option<&str>,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, ApiError> {
    let mut headers = HeaderMap::new();

    if let Some(key) = api_key {
        let token = key.trim();
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|error| ApiError::InvalidApiKey(error.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
    }

    let mut builder = reqwest::Client::builder().default_headers(headers);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(|error| ApiError::Transport {
        method: "-".to_string(),
        endpoint: "-".to_string(),
        message: error.to_string(),
    })
}
