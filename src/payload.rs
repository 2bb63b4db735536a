//! Maps resolved [`GenerationParameters`] to the service's request bodies.

use crate::params::{
    CutoffConfig, FaceRestoration, FaceRestorer, GenerationParameters, TiledDiffusionConfig,
    TiledVaeConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

const DEFAULT_ADETAILER_FACE_MODEL: &str = "face_yolov8n.pt";
const CUTOFF_SCRIPT: &str = "Cutoff";
const TILED_DIFFUSION_SCRIPT: &str = "Tiled Diffusion";
const TILED_VAE_SCRIPT: &str = "Tiled VAE";
const ADETAILER_SCRIPT: &str = "ADetailer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    Reproduce,
    Upscale,
}

/// Body shared by `txt2img` and `img2img`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub prompt: String,
    pub negative_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampler_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    pub steps: u32,
    pub cfg_scale: f64,
    pub seed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subseed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subseed_strength: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub restore_faces: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_hr: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_upscaler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_second_pass_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_settings: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_images: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_images: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alwayson_scripts: Option<Value>,
}

/// Body of `extra-single-image`, used for CodeFormer / GFPGAN post-passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrasPayload {
    pub image: String,
    pub upscaling_resize: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codeformer_visibility: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codeformer_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gfpgan_visibility: Option<f64>,
}

/// A face-restoration post-pass, routed to the endpoint its method needs.
#[derive(Debug, Clone, PartialEq)]
pub enum RestorationRequest {
    Extras(ExtrasPayload),
    Img2Img(GenerationPayload),
}

/// Builds the primary `txt2img` request.
///
/// Face restoration is never requested inline; it runs as a separate pass so
/// its strength can be controlled. Upscale mode always enables the hi-res
/// pass; reproduce mode enables it only when the source image used one.
pub fn build_generation_payload(params: &GenerationParameters, mode: ReplayMode) -> GenerationPayload {
    let hires = &params.hires;
    let enable_hr = mode == ReplayMode::Upscale || hires.enabled;

    let override_settings = params
        .clip_skip
        .map(|clip_skip| json!({ "CLIP_stop_at_last_layers": clip_skip }));

    let mut payload = GenerationPayload {
        prompt: params.prompt.clone(),
        negative_prompt: params.negative_prompt.clone(),
        sampler_name: non_empty(&params.sampler),
        scheduler: params.scheduler.as_deref().and_then(non_empty),
        steps: params.steps,
        cfg_scale: params.cfg_scale,
        seed: params.seed,
        subseed: params.subseed,
        subseed_strength: params.subseed_strength,
        width: params.width,
        height: params.height,
        restore_faces: false,
        override_settings,
        send_images: Some(true),
        save_images: Some(false),
        alwayson_scripts: build_alwayson_scripts(params),
        ..GenerationPayload::default()
    };

    if enable_hr {
        payload.enable_hr = Some(true);
        payload.hr_scale = Some(hires.scale);
        payload.hr_upscaler = non_empty(&hires.upscaler);
        payload.hr_second_pass_steps = Some(hires.steps);
        payload.denoising_strength = Some(hires.denoising_strength);
    }

    payload
}

/// Extension blocks keyed by script name; only enabled blocks are emitted.
pub fn build_alwayson_scripts(params: &GenerationParameters) -> Option<Value> {
    let mut scripts = Map::new();

    if let Some(cutoff) = params.cutoff.as_ref().filter(|c| c.enabled) {
        scripts.insert(CUTOFF_SCRIPT.to_string(), cutoff_script(cutoff));
    }
    if let Some(tiled) = params.tiled_diffusion.as_ref().filter(|t| t.enabled) {
        scripts.insert(
            TILED_DIFFUSION_SCRIPT.to_string(),
            tiled_diffusion_script(tiled, params),
        );
    }
    if let Some(tiled_vae) = params.tiled_vae.as_ref().filter(|t| t.enabled) {
        scripts.insert(TILED_VAE_SCRIPT.to_string(), tiled_vae_script(tiled_vae));
    }

    if scripts.is_empty() {
        None
    } else {
        Some(Value::Object(scripts))
    }
}

/// Builds the post-pass request for an already generated image.
///
/// `size` is the generated image's size; img2img needs it explicitly or the
/// service falls back to 512x512.
pub fn build_restoration_request(
    params: &GenerationParameters,
    restoration: &FaceRestoration,
    image_base64: &str,
    size: (u32, u32),
) -> RestorationRequest {
    let strength = restoration.strength.clamp(0.0, 1.0);

    match restoration.method {
        FaceRestorer::CodeFormer => RestorationRequest::Extras(ExtrasPayload {
            image: image_base64.to_string(),
            upscaling_resize: 1.0,
            codeformer_visibility: Some(strength),
            codeformer_weight: Some(strength),
            gfpgan_visibility: None,
        }),
        FaceRestorer::Gfpgan => RestorationRequest::Extras(ExtrasPayload {
            image: image_base64.to_string(),
            upscaling_resize: 1.0,
            codeformer_visibility: None,
            codeformer_weight: None,
            gfpgan_visibility: Some(strength),
        }),
        FaceRestorer::Adetailer => RestorationRequest::Img2Img(GenerationPayload {
            prompt: params.prompt.clone(),
            negative_prompt: params.negative_prompt.clone(),
            sampler_name: non_empty(&params.sampler),
            scheduler: params.scheduler.as_deref().and_then(non_empty),
            steps: params.steps,
            cfg_scale: params.cfg_scale,
            seed: params.seed,
            width: size.0,
            height: size.1,
            restore_faces: false,
            denoising_strength: Some(strength),
            init_images: Some(vec![image_base64.to_string()]),
            send_images: Some(true),
            save_images: Some(false),
            alwayson_scripts: Some(build_adetailer_alwayson_scripts(
                restoration.detector.as_deref(),
            )),
            ..GenerationPayload::default()
        }),
    }
}

fn cutoff_script(cutoff: &CutoffConfig) -> Value {
    json!({
        "args": [
            true,
            cutoff.targets.join(", "),
            cutoff.weight,
            true,
            false,
            "",
            "lerp"
        ]
    })
}

fn tiled_diffusion_script(tiled: &TiledDiffusionConfig, params: &GenerationParameters) -> Value {
    json!({
        "args": [
            true,
            tiled.method,
            false,
            true,
            params.width,
            params.height,
            tiled.tile_width,
            tiled.tile_height,
            tiled.overlap,
            tiled.batch_size,
            "None",
            1.0
        ]
    })
}

fn tiled_vae_script(tiled: &TiledVaeConfig) -> Value {
    json!({
        "args": [
            true,
            tiled.encoder_tile_size,
            tiled.decoder_tile_size,
            true,
            true,
            true,
            false
        ]
    })
}

fn build_adetailer_alwayson_scripts(face_model: Option<&str>) -> Value {
    let model = face_model
        .and_then(non_empty)
        .unwrap_or_else(|| DEFAULT_ADETAILER_FACE_MODEL.to_string());

    json!({
        ADETAILER_SCRIPT: {
            "args": [
                true,
                false,
                {
                    "ad_model": model
                }
            ]
        }
    })
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
