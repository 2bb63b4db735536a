//! Console configuration.
//!
//! Looked up next to the working directory as `forge-replay.yaml` → `.yml` →
//! `.json`; every field has a default so a missing file is fine. Environment
//! variables win over the file, CLI flags win over both.

use crate::error::{Error, Result};
use crate::params::FaceRestorer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_STEM: &str = "forge-replay";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7860";
const URL_ENV: &str = "FORGE_REPLAY_URL";
const API_KEY_ENV: &str = "FORGE_REPLAY_API_KEY";
const PARSE_THREADS_ENV: &str = "FORGE_PARSE_THREADS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Reproduce mode: percent difference (0..1) below which an output counts
    /// as reproduced.
    pub tolerance: f64,
    /// Per-pixel perceptual threshold (0..1) used by the verifier.
    pub pixel_threshold: f64,
    pub poll_interval_ms: u64,
    pub parse_threads: Option<usize>,
    /// Local VAE folder; when set, decoder short hashes are computed from it.
    pub vae_dir: Option<PathBuf>,
    pub folders: OutputFolders,
    pub defaults: ParameterDefaults,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            tolerance: 0.15,
            pixel_threshold: 0.1,
            poll_interval_ms: 1_000,
            parse_threads: None,
            vae_dir: None,
            folders: OutputFolders::default(),
            defaults: ParameterDefaults::default(),
        }
    }
}

/// Folder names created under the replay root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFolders {
    pub upscaled: String,
    pub sources_completed: String,
    pub reproduce: String,
    pub reproducible: String,
    pub non_reproducible: String,
    pub orphans: String,
}

impl Default for OutputFolders {
    fn default() -> Self {
        Self {
            upscaled: "upscaled".to_string(),
            sources_completed: "sources-completed".to_string(),
            reproduce: "reproduce".to_string(),
            reproducible: "reproducible".to_string(),
            non_reproducible: "non-reproducible".to_string(),
            orphans: "orphaned-params".to_string(),
        }
    }
}

impl OutputFolders {
    /// Directory names the scanner must not descend into.
    pub fn reserved(&self) -> [&str; 4] {
        [
            &self.upscaled,
            &self.sources_completed,
            &self.reproduce,
            &self.orphans,
        ]
    }
}

/// Lowest-precedence values, used when neither the sidecar nor an override
/// provides one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterDefaults {
    pub sampler: String,
    pub hires_scale: f64,
    pub hires_denoising_strength: f64,
    pub hires_steps: u32,
    pub hires_upscaler: String,
    pub face_restorer: FaceRestorer,
    pub face_restoration_strength: f64,
    pub cutoff_weight: f64,
    pub tiled_diffusion_method: String,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_overlap: u32,
    pub tile_batch_size: u32,
    pub encoder_tile_size: u32,
    pub decoder_tile_size: u32,
}

impl Default for ParameterDefaults {
    fn default() -> Self {
        Self {
            sampler: "Euler a".to_string(),
            hires_scale: 2.0,
            hires_denoising_strength: 0.35,
            hires_steps: 0,
            hires_upscaler: "Latent".to_string(),
            face_restorer: FaceRestorer::CodeFormer,
            face_restoration_strength: 0.5,
            cutoff_weight: 0.5,
            tiled_diffusion_method: "MultiDiffusion".to_string(),
            tile_width: 96,
            tile_height: 96,
            tile_overlap: 48,
            tile_batch_size: 4,
            encoder_tile_size: 1024,
            decoder_tile_size: 96,
        }
    }
}

impl AppConfig {
    /// Loads the explicit file when given, otherwise the first config file
    /// found in `search_dir`, then applies environment overrides.
    pub fn load(explicit: Option<&Path>, search_dir: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(search_dir),
        };

        let mut config = match path {
            Some(path) => {
                let config = read_config_file(&path)?;
                log::info!("Loaded configuration from {}", path.display());
                config
            }
            None => AppConfig::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(URL_ENV) {
            if !url.trim().is_empty() {
                self.base_url = url;
            }
        }
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Ok(raw) = std::env::var(PARSE_THREADS_ENV) {
            if let Ok(parsed) = raw.parse::<usize>() {
                self.parse_threads = Some(parsed.clamp(1, 32));
            }
        }
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(100))
    }
}

fn find_config_file(dir: &Path) -> Option<PathBuf> {
    ["yaml", "yml", "json"]
        .iter()
        .map(|ext| dir.join(format!("{CONFIG_STEM}.{ext}")))
        .find(|candidate| candidate.is_file())
}

fn read_config_file(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|error| {
        Error::Config(format!("failed to read {}: {}", path.display(), error))
    })?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    match ext {
        "json" => serde_json::from_str(&content).map_err(|error| {
            Error::Config(format!("invalid JSON in {}: {}", path.display(), error))
        }),
        _ => serde_yaml::from_str(&content).map_err(|error| {
            Error::Config(format!("invalid YAML in {}: {}", path.display(), error))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = read_or_default(dir.path());
        assert_eq!(config.tolerance, 0.15);
        assert_eq!(config.folders.upscaled, "upscaled");
        assert_eq!(config.defaults.face_restorer, FaceRestorer::CodeFormer);
    }

    #[test]
    fn test_yaml_is_preferred_over_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("forge-replay.yaml"),
            "tolerance: 0.05\nfolders:\n  upscaled: big\ndefaults:\n  face_restorer: gfpgan\n",
        )
        .unwrap();
        fs::write(dir.path().join("forge-replay.json"), r#"{"tolerance": 0.9}"#).unwrap();

        let config = read_or_default(dir.path());
        assert_eq!(config.tolerance, 0.05);
        assert_eq!(config.folders.upscaled, "big");
        assert_eq!(config.folders.sources_completed, "sources-completed");
        assert_eq!(config.defaults.face_restorer, FaceRestorer::Gfpgan);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge-replay.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(read_config_file(&path), Err(Error::Config(_))));
    }

    fn read_or_default(dir: &Path) -> AppConfig {
        find_config_file(dir)
            .map(|path| read_config_file(&path).unwrap())
            .unwrap_or_default()
    }
}
