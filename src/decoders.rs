//! Secondary decoder (VAE) roster.
//!
//! The service lists decoders by file name only, while sidecars usually record
//! a short content hash. When a local VAE folder is configured, short hashes
//! (first 10 hex chars of the file's SHA-256) are computed for its files so
//! hash references can be resolved too.

use crate::error::ApiError;
use crate::forge_api::{strip_model_extension, ForgeBackend};
use crate::params::{DecoderRef, DECODER_AUTOMATIC, DECODER_NONE};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

const SHORT_HASH_LEN: usize = 10;
const DECODER_EXTENSIONS: &[&str] = &["safetensors", "pt", "ckpt", "bin"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderEntry {
    pub name: String,
    pub short_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DecoderRoster {
    entries: Vec<DecoderEntry>,
}

impl DecoderRoster {
    /// Merges the service's decoder names with locally hashed files
    /// (file name → short hash).
    pub fn new(names: Vec<String>, local_hashes: BTreeMap<String, String>) -> Self {
        let mut entries: Vec<DecoderEntry> = names
            .into_iter()
            .map(|name| DecoderEntry {
                short_hash: local_hashes.get(&name).cloned(),
                name,
            })
            .collect();

        for (name, hash) in local_hashes {
            if !entries.iter().any(|entry| entry.name == name) {
                entries.push(DecoderEntry {
                    name,
                    short_hash: Some(hash),
                });
            }
        }

        Self { entries }
    }

    pub async fn fetch<B: ForgeBackend>(
        backend: &B,
        vae_dir: Option<&Path>,
    ) -> Result<Self, ApiError> {
        let names = backend
            .decoders()
            .await?
            .into_iter()
            .map(|info| info.model_name)
            .collect();

        let local_hashes = match vae_dir {
            Some(dir) => {
                let dir = dir.to_path_buf();
                tokio::task::spawn_blocking(move || hash_decoder_dir(&dir))
                    .await
                    .unwrap_or_else(|error| {
                        log::warn!("Decoder hashing task failed: {}", error);
                        BTreeMap::new()
                    })
            }
            None => BTreeMap::new(),
        };

        let roster = Self::new(names, local_hashes);
        log::info!("Decoder roster: {} entries", roster.entries.len());
        Ok(roster)
    }

    /// The value to send as `sd_vae` for `reference`.
    ///
    /// Sentinels map directly; named references resolve by hash, then by
    /// name. Unknown decoders fall back to `None` with a warning.
    pub fn resolve(&self, reference: &DecoderRef) -> String {
        let (hash, name) = match reference {
            DecoderRef::Automatic => return DECODER_AUTOMATIC.to_string(),
            DecoderRef::None => return DECODER_NONE.to_string(),
            DecoderRef::Named { hash, name } => (hash.as_deref(), name.as_deref()),
        };

        if let Some(entry) = hash.and_then(|hash| self.find_by_hash(hash)) {
            return entry.name.clone();
        }
        if let Some(entry) = name.and_then(|name| self.find_by_name(name)) {
            return entry.name.clone();
        }

        log::warn!(
            "Decoder {} is not available on the service; using {}",
            reference,
            DECODER_NONE
        );
        DECODER_NONE.to_string()
    }

    fn find_by_hash(&self, hash: &str) -> Option<&DecoderEntry> {
        let hash = hash.trim().to_ascii_lowercase();
        if hash.is_empty() {
            return None;
        }
        self.entries.iter().find(|entry| {
            entry
                .short_hash
                .as_deref()
                .is_some_and(|known| known.starts_with(&hash) || hash.starts_with(known))
        })
    }

    fn find_by_name(&self, name: &str) -> Option<&DecoderEntry> {
        let name = name.trim();
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|entry| strip_model_extension(&entry.name) == strip_model_extension(name))
            })
    }
}

/// Short hashes of every decoder file directly under `dir`, keyed by file name.
pub fn hash_decoder_dir(dir: &Path) -> BTreeMap<String, String> {
    let files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
                .is_some_and(|ext| DECODER_EXTENSIONS.contains(&ext.as_str()))
        })
        .collect();

    files
        .par_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().to_string();
            match short_hash(path) {
                Ok(hash) => Some((name, hash)),
                Err(error) => {
                    log::warn!("Failed to hash decoder {}: {}", path.display(), error);
                    None
                }
            }
        })
        .collect()
}

fn short_hash(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    let mut hex = hex_encode(&digest);
    hex.truncate(SHORT_HASH_LEN);
    Ok(hex)
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push(HEX[(byte >> 4) as usize] as char);
        output.push(HEX[(byte & 0x0f) as usize] as char);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> DecoderRoster {
        let mut local = BTreeMap::new();
        local.insert("sdxl_vae.safetensors".to_string(), "735e4c3a44".to_string());
        DecoderRoster::new(
            vec![
                "sdxl_vae.safetensors".to_string(),
                "kl-f8-anime2.ckpt".to_string(),
            ],
            local,
        )
    }

    #[test]
    fn test_sentinels_resolve_directly() {
        let roster = DecoderRoster::default();
        assert_eq!(roster.resolve(&DecoderRef::Automatic), "Automatic");
        assert_eq!(roster.resolve(&DecoderRef::None), "None");
    }

    #[test]
    fn test_hash_wins_over_name() {
        let reference = DecoderRef::Named {
            hash: Some("735E4C3A44".to_string()),
            name: Some("kl-f8-anime2".to_string()),
        };
        assert_eq!(roster().resolve(&reference), "sdxl_vae.safetensors");
    }

    #[test]
    fn test_name_matches_without_extension() {
        let reference = DecoderRef::Named {
            hash: Some("ffffffffff".to_string()),
            name: Some("kl-f8-anime2".to_string()),
        };
        assert_eq!(roster().resolve(&reference), "kl-f8-anime2.ckpt");
    }

    #[test]
    fn test_unknown_decoder_falls_back_to_none() {
        let reference = DecoderRef::Named {
            hash: None,
            name: Some("missing_vae".to_string()),
        };
        assert_eq!(roster().resolve(&reference), "None");
    }

    #[test]
    fn test_local_files_are_hashed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.safetensors"), b"abc").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let hashes = hash_decoder_dir(dir.path());
        // sha256("abc") = ba7816bf8f01cfea...
        assert_eq!(
            hashes.get("tiny.safetensors").map(String::as_str),
            Some("ba7816bf8f")
        );
        assert_eq!(hashes.len(), 1);
    }
}
