//! In-memory [`ForgeBackend`] for unit tests.

use crate::error::ApiError;
use crate::forge_api::{
    DecoderInfo, ForgeBackend, GenerationResponse, ModelInfo, Progress, ServerOptions,
};
use crate::payload::{ExtrasPayload, GenerationPayload};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use image::{ImageFormat, Rgba, RgbaImage};
use serde_json::json;
use std::io::Cursor;
use std::sync::Mutex;

pub fn png_base64(width: u32, height: u32, color: [u8; 4]) -> String {
    let image = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    BASE64_STANDARD.encode(bytes)
}

fn model(name: &str) -> ModelInfo {
    ModelInfo {
        title: name.to_string(),
        model_name: name.to_string(),
        hash: None,
        sha256: None,
        filename: format!("/models/{name}.safetensors"),
    }
}

/// Records every call as `"<operation>"` or `"<operation>:<argument>"`.
pub struct FakeBackend {
    models: Mutex<Vec<ModelInfo>>,
    hidden_until_refresh: Vec<ModelInfo>,
    decoders: Vec<DecoderInfo>,
    options: Mutex<ServerOptions>,
    image: String,
    restored_image: String,
    calls: Mutex<Vec<String>>,
    generations: Mutex<Vec<GenerationPayload>>,
}

impl FakeBackend {
    pub fn new(models: &[&str], active_model: &str) -> Self {
        Self {
            models: Mutex::new(models.iter().map(|name| model(name)).collect()),
            hidden_until_refresh: Vec::new(),
            decoders: Vec::new(),
            options: Mutex::new(ServerOptions {
                sd_model_checkpoint: Some(active_model.to_string()),
                sd_checkpoint_hash: None,
                sd_vae: Some("Automatic".to_string()),
            }),
            image: png_base64(4, 4, [10, 20, 30, 255]),
            restored_image: png_base64(4, 4, [200, 200, 200, 255]),
            calls: Mutex::new(Vec::new()),
            generations: Mutex::new(Vec::new()),
        }
    }

    /// The generated image returned by `txt2img`.
    pub fn with_image(mut self, base64: String) -> Self {
        self.image = base64;
        self
    }

    pub fn with_decoders(mut self, names: &[&str]) -> Self {
        self.decoders = names
            .iter()
            .map(|name| DecoderInfo {
                model_name: name.to_string(),
                filename: None,
            })
            .collect();
        self
    }

    /// A model that only appears after `refresh-checkpoints`.
    pub fn with_model_after_refresh(mut self, name: &str) -> Self {
        self.hidden_until_refresh.push(model(name));
        self
    }

    pub fn restored_image(&self) -> &str {
        &self.restored_image
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn generations(&self) -> Vec<GenerationPayload> {
        self.generations.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl ForgeBackend for FakeBackend {
    async fn options(&self) -> Result<ServerOptions, ApiError> {
        self.record("options");
        Ok(self.options.lock().unwrap().clone())
    }

    async fn set_model(&self, name: &str) -> Result<(), ApiError> {
        self.record(format!("set_model:{name}"));
        self.options.lock().unwrap().sd_model_checkpoint = Some(name.to_string());
        Ok(())
    }

    async fn set_decoder(&self, name: &str) -> Result<(), ApiError> {
        self.record(format!("set_decoder:{name}"));
        self.options.lock().unwrap().sd_vae = Some(name.to_string());
        Ok(())
    }

    async fn models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        self.record("models");
        Ok(self.models.lock().unwrap().clone())
    }

    async fn refresh_models(&self) -> Result<(), ApiError> {
        self.record("refresh_models");
        self.models
            .lock()
            .unwrap()
            .extend(self.hidden_until_refresh.iter().cloned());
        Ok(())
    }

    async fn decoders(&self) -> Result<Vec<DecoderInfo>, ApiError> {
        self.record("decoders");
        Ok(self.decoders.clone())
    }

    async fn samplers(&self) -> Result<Vec<String>, ApiError> {
        self.record("samplers");
        Ok(vec!["Euler a".to_string()])
    }

    async fn upscalers(&self) -> Result<Vec<String>, ApiError> {
        self.record("upscalers");
        Ok(vec!["Latent".to_string()])
    }

    async fn txt2img(&self, payload: &GenerationPayload) -> Result<GenerationResponse, ApiError> {
        self.record("txt2img");
        self.generations.lock().unwrap().push(payload.clone());
        let infotext = format!(
            "{}\nNegative prompt: {}\nSteps: {}, Seed: {}",
            payload.prompt, payload.negative_prompt, payload.steps, payload.seed
        );
        Ok(GenerationResponse {
            images: vec![self.image.clone()],
            info: Some(json!({ "infotexts": [infotext] }).to_string()),
        })
    }

    async fn img2img(&self, _payload: &GenerationPayload) -> Result<GenerationResponse, ApiError> {
        self.record("img2img");
        Ok(GenerationResponse {
            images: vec![self.restored_image.clone()],
            info: None,
        })
    }

    async fn extra_single_image(&self, _payload: &ExtrasPayload) -> Result<String, ApiError> {
        self.record("extra_single_image");
        Ok(self.restored_image.clone())
    }

    async fn progress(&self) -> Result<Progress, ApiError> {
        Ok(Progress {
            progress: 0.5,
            eta_relative: 1.0,
        })
    }

    async fn interrupt(&self) -> Result<(), ApiError> {
        self.record("interrupt");
        Ok(())
    }
}
