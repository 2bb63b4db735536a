use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const DECODER_AUTOMATIC: &str = "Automatic";
pub const DECODER_NONE: &str = "None";

/// Reference to the secondary decoder (VAE) an image was generated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecoderRef {
    Automatic,
    None,
    Named {
        hash: Option<String>,
        name: Option<String>,
    },
}

impl DecoderRef {
    /// Interprets a single value from an override or the service options.
    pub fn from_value(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case(DECODER_AUTOMATIC) {
            Self::Automatic
        } else if trimmed.eq_ignore_ascii_case(DECODER_NONE) || trimmed.is_empty() {
            Self::None
        } else {
            Self::Named {
                hash: None,
                name: Some(trimmed.to_string()),
            }
        }
    }

    /// Key used to order records that share a model.
    pub fn sort_key(&self) -> String {
        match self {
            Self::Automatic => DECODER_AUTOMATIC.to_string(),
            Self::None => DECODER_NONE.to_string(),
            Self::Named { hash, name } => name
                .clone()
                .or_else(|| hash.clone())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for DecoderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named {
                hash: Some(hash),
                name: Some(name),
            } => write!(f, "{name} [{hash}]"),
            _ => f.write_str(&self.sort_key()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub name: String,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiresConfig {
    /// Whether the source image used a hi-res pass.
    pub enabled: bool,
    pub scale: f64,
    pub denoising_strength: f64,
    /// 0 means "same as sampling steps".
    pub steps: u32,
    pub upscaler: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceRestorer {
    CodeFormer,
    Gfpgan,
    Adetailer,
}

impl FaceRestorer {
    pub fn from_name(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "codeformer" => Some(Self::CodeFormer),
            "gfpgan" => Some(Self::Gfpgan),
            "adetailer" => Some(Self::Adetailer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRestoration {
    pub method: FaceRestorer,
    pub strength: f64,
    /// ADetailer detection model, as recorded in the sidecar.
    #[serde(default)]
    pub detector: Option<String>,
}

/// Prompt-segmentation extension ("Cutoff").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoffConfig {
    pub enabled: bool,
    pub targets: Vec<String>,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiledDiffusionConfig {
    pub enabled: bool,
    pub method: String,
    pub tile_width: u32,
    pub tile_height: u32,
    pub overlap: u32,
    pub batch_size: u32,
}

/// Tiled decode extension ("Tiled VAE").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiledVaeConfig {
    pub enabled: bool,
    pub encoder_tile_size: u32,
    pub decoder_tile_size: u32,
}

/// Fully resolved parameters for one sidecar, ready for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub prompt: String,
    pub negative_prompt: String,
    pub sampler: String,
    pub scheduler: Option<String>,
    pub steps: u32,
    pub cfg_scale: f64,
    pub seed: i64,
    pub subseed: Option<i64>,
    pub subseed_strength: Option<f64>,
    pub clip_skip: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub decoder: Option<DecoderRef>,
    pub model: ModelRef,
    pub hires: HiresConfig,
    pub face_restoration: Option<FaceRestoration>,
    pub cutoff: Option<CutoffConfig>,
    pub tiled_diffusion: Option<TiledDiffusionConfig>,
    pub tiled_vae: Option<TiledVaeConfig>,
    pub template: Option<String>,
    pub negative_template: Option<String>,
    /// Unrecognized settings, kept for keyword search.
    pub extra: BTreeMap<String, String>,
    pub raw_text: String,
    pub sidecar_path: PathBuf,
    pub image_path: PathBuf,
}

impl GenerationParameters {
    /// File stem shared by the sidecar and its image.
    pub fn file_name(&self) -> String {
        self.sidecar_path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }

    /// Case-insensitive search over the original text blob.
    pub fn mentions(&self, keyword: &str) -> bool {
        self.raw_text
            .to_lowercase()
            .contains(&keyword.to_lowercase())
    }
}
