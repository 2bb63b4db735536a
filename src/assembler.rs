//! Builds one [`GenerationParameters`] per sidecar from parsed text, the
//! directory's effective overrides and configured defaults, then orders the
//! records for replay.

use crate::config::{AppConfig, ParameterDefaults};
use crate::error::{Error, ParseError, Result};
use crate::forge_api::{ForgeBackend, ModelInfo};
use crate::fsops::{self, ScannedDir};
use crate::overrides::{build_override_tree, Overrides};
use crate::params::{
    CutoffConfig, DecoderRef, FaceRestoration, FaceRestorer, GenerationParameters, HiresConfig,
    ModelRef, TiledDiffusionConfig, TiledVaeConfig,
};
use crate::parser::{self, Field, SidecarText};
use rayon::prelude::*;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Settings the assembler maps to typed fields; everything else lands in
/// `extra`.
const KNOWN_FIELDS: &[Field<'static>] = &[
    parser::STEPS,
    parser::SAMPLER,
    parser::SCHEDULE_TYPE,
    parser::CFG_SCALE,
    parser::SEED,
    parser::SIZE,
    parser::MODEL_HASH,
    parser::MODEL,
    parser::VAE_HASH,
    parser::VAE,
    parser::VARIATION_SEED,
    parser::VARIATION_SEED_STRENGTH,
    parser::CLIP_SKIP,
    parser::DENOISING_STRENGTH,
    parser::HIRES_UPSCALE,
    parser::HIRES_STEPS,
    parser::HIRES_UPSCALER,
    parser::FACE_RESTORATION,
    parser::CUTOFF_ENABLED,
    parser::CUTOFF_TARGETS,
    parser::CUTOFF_WEIGHT,
    parser::TILED_DIFFUSION,
    parser::TILED_VAE,
];

const ADETAILER_MODEL_KEY: &str = "ADetailer model";

/// Scans `root`, assembles every sidecar and returns the replay order.
///
/// Orphaned sidecars are only moved when `prune` is set; otherwise they are
/// reported and left where they are. Single bad files are logged and
/// skipped; override, roster and filesystem failures abort.
pub async fn parse_and_sort<B: ForgeBackend>(
    backend: &B,
    root: &Path,
    scanned: &ScannedDir,
    config: &AppConfig,
    prune: bool,
) -> Result<Vec<GenerationParameters>> {
    let (pairs, orphans) = fsops::pair_files(&scanned.images, &scanned.sidecars);

    let mut image_for: HashMap<PathBuf, PathBuf> = pairs
        .into_iter()
        .map(|pair| (pair.sidecar, pair.image))
        .collect();
    let mut sidecars = scanned.sidecars.clone();

    if !orphans.is_empty() {
        if scanned.sidecars.len() > scanned.images.len() {
            if prune {
                let moved = fsops::prune_orphans(root, &orphans, &config.folders.orphans)?;
                log::info!("Moved {} orphaned sidecar(s) aside", moved);
            } else {
                for orphan in &orphans {
                    log::warn!("Orphaned sidecar {} (left in place)", orphan.display());
                }
            }
            sidecars.retain(|sidecar| image_for.contains_key(sidecar));
        } else {
            // replayed anyway; the queue reports the missing image per item
            for orphan in &orphans {
                image_for.insert(orphan.clone(), orphan.with_extension("png"));
            }
        }
    }

    let roster = backend.models().await?;
    log::info!("Model roster: {} checkpoint(s)", roster.len());

    let groups = build_override_tree(root, &sidecars)?;
    let defaults = config.defaults.clone();
    let total = sidecars.len();

    let mut records = tokio::task::spawn_blocking(move || {
        groups
            .par_iter()
            .flat_map_iter(|group| {
                group
                    .files
                    .iter()
                    .map(move |file| (&group.overrides, file))
            })
            .filter_map(|(overrides, sidecar)| {
                let image = image_for
                    .get(sidecar)
                    .cloned()
                    .unwrap_or_else(|| sidecar.with_extension("png"));
                load_record(sidecar, image, overrides, &roster, &defaults)
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|error| Error::Task(error.to_string()))?;

    sort_for_replay(&mut records);
    log::info!(
        "Assembled {}/{} sidecar(s) for replay",
        records.len(),
        total
    );
    Ok(records)
}

/// Orders by model name, then decoder; records with a decoder reference sort
/// before those without. Stable, so ties keep scan order.
pub fn sort_for_replay(records: &mut [GenerationParameters]) {
    records.sort_by(|a, b| {
        a.model
            .name
            .cmp(&b.model.name)
            .then_with(|| decoder_order(a.decoder.as_ref(), b.decoder.as_ref()))
    });
}

fn decoder_order(a: Option<&DecoderRef>, b: Option<&DecoderRef>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.sort_key().cmp(&b.sort_key()),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn load_record(
    sidecar: &Path,
    image: PathBuf,
    overrides: &Overrides,
    roster: &[ModelInfo],
    defaults: &ParameterDefaults,
) -> Option<GenerationParameters> {
    let raw = match fsops::read_to_string_with_retry(sidecar) {
        Ok(raw) => raw,
        Err(error) => {
            log::warn!("Skipping {}: {}", sidecar.display(), error);
            return None;
        }
    };

    match assemble(&raw, sidecar, image, overrides, roster, defaults) {
        Ok(record) => Some(record),
        Err(error) => {
            log::warn!("Skipping {}: {}", sidecar.display(), error);
            None
        }
    }
}

/// Combines one sidecar's text with its overrides: override > parsed > default.
///
/// Required fields supplied by an override are never read from the text, so
/// an override can rescue a sidecar that lacks them.
pub fn assemble(
    raw: &str,
    sidecar: &Path,
    image: PathBuf,
    overrides: &Overrides,
    roster: &[ModelInfo],
    defaults: &ParameterDefaults,
) -> std::result::Result<GenerationParameters, ParseError> {
    let text = SidecarText::parse(raw);
    let ov = overrides;

    let steps = match ov.steps {
        Some(steps) => steps,
        None => require(text.number::<u32>(&parser::STEPS)?, &parser::STEPS)?,
    };
    let cfg_scale = match ov.cfg_scale {
        Some(cfg) => cfg,
        None => require(text.float(&parser::CFG_SCALE)?, &parser::CFG_SCALE)?,
    };
    let seed = match ov.seed {
        Some(seed) => seed,
        None => require(text.number::<i64>(&parser::SEED)?, &parser::SEED)?,
    };
    let (width, height) = match (ov.width, ov.height) {
        (Some(width), Some(height)) => (width, height),
        (width, height) => {
            let (parsed_width, parsed_height) = text.size()?;
            (width.unwrap_or(parsed_width), height.unwrap_or(parsed_height))
        }
    };

    let model = resolve_model(
        ov.model.as_deref(),
        lenient(sidecar, text.get(&parser::MODEL_HASH)),
        lenient(sidecar, text.get(&parser::MODEL)),
        roster,
    )?;

    let decoder = match ov.decoder.as_deref() {
        Some(value) => Some(DecoderRef::from_value(value)),
        None => parsed_decoder(
            lenient(sidecar, text.get(&parser::VAE_HASH)),
            lenient(sidecar, text.get(&parser::VAE)),
        ),
    };

    let pairs = text.pairs();
    let extra: BTreeMap<String, String> = pairs
        .iter()
        .filter(|(key, _)| !KNOWN_FIELDS.iter().any(|field| field.name == key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(GenerationParameters {
        prompt: ov.prompt.clone().unwrap_or_else(|| text.prompt.clone()),
        negative_prompt: ov
            .negative_prompt
            .clone()
            .unwrap_or_else(|| text.negative_prompt.clone()),
        sampler: ov
            .sampler
            .clone()
            .or_else(|| lenient(sidecar, text.get(&parser::SAMPLER)))
            .unwrap_or_else(|| defaults.sampler.clone()),
        scheduler: ov
            .scheduler
            .clone()
            .or_else(|| lenient(sidecar, text.get(&parser::SCHEDULE_TYPE))),
        steps,
        cfg_scale,
        seed,
        subseed: ov
            .subseed
            .or_else(|| lenient(sidecar, text.number(&parser::VARIATION_SEED))),
        subseed_strength: ov
            .subseed_strength
            .or_else(|| lenient(sidecar, text.float(&parser::VARIATION_SEED_STRENGTH))),
        clip_skip: ov
            .clip_skip
            .or_else(|| lenient(sidecar, text.number(&parser::CLIP_SKIP))),
        width,
        height,
        decoder,
        model,
        hires: resolve_hires(&text, sidecar, ov, defaults),
        face_restoration: resolve_face_restoration(&text, sidecar, &pairs, ov, defaults),
        cutoff: resolve_cutoff(&text, sidecar, ov, defaults),
        tiled_diffusion: resolve_tiled_diffusion(&text, sidecar, ov, defaults),
        tiled_vae: resolve_tiled_vae(&text, sidecar, ov, defaults),
        template: ov.template.clone().or_else(|| text.template.clone()),
        negative_template: ov
            .negative_template
            .clone()
            .or_else(|| text.negative_template.clone()),
        extra,
        raw_text: raw.to_string(),
        sidecar_path: sidecar.to_path_buf(),
        image_path: image,
    })
}

fn require<T>(value: Option<T>, field: &Field<'_>) -> std::result::Result<T, ParseError> {
    value.ok_or_else(|| ParseError::MissingField(field.name.to_string()))
}

/// Optional fields never exclude a file; a malformed one is logged and
/// treated as absent.
fn lenient<T>(sidecar: &Path, value: std::result::Result<Option<T>, ParseError>) -> Option<T> {
    match value {
        Ok(value) => value,
        Err(error) => {
            log::warn!("{}: ignoring {}", sidecar.display(), error);
            None
        }
    }
}

/// Override > roster match by hash > roster match by name > parsed name.
fn resolve_model(
    override_name: Option<&str>,
    parsed_hash: Option<String>,
    parsed_name: Option<String>,
    roster: &[ModelInfo],
) -> std::result::Result<ModelRef, ParseError> {
    if let Some(name) = override_name.map(str::trim).filter(|name| !name.is_empty()) {
        return Ok(match roster.iter().find(|model| model.matches_name(name)) {
            Some(model) => model_ref(model),
            None => ModelRef {
                name: name.to_string(),
                hash: None,
            },
        });
    }

    if let Some(model) = parsed_hash
        .as_deref()
        .and_then(|hash| roster.iter().find(|model| model.matches_hash(hash)))
    {
        return Ok(model_ref(model));
    }
    if let Some(model) = parsed_name
        .as_deref()
        .and_then(|name| roster.iter().find(|model| model.matches_name(name)))
    {
        return Ok(model_ref(model));
    }

    match (parsed_name, parsed_hash) {
        (Some(name), hash) => Ok(ModelRef { name, hash }),
        (None, Some(hash)) => Ok(ModelRef {
            name: hash.clone(),
            hash: Some(hash),
        }),
        (None, None) => Err(ParseError::MissingField(parser::MODEL.name.to_string())),
    }
}

fn model_ref(model: &ModelInfo) -> ModelRef {
    ModelRef {
        name: model.canonical_name().to_string(),
        hash: model.hash.clone().or_else(|| model.sha256.clone()),
    }
}

fn parsed_decoder(hash: Option<String>, name: Option<String>) -> Option<DecoderRef> {
    match (hash, name) {
        (None, None) => None,
        (None, Some(name)) => Some(DecoderRef::from_value(&name)),
        (hash, name) => Some(DecoderRef::Named { hash, name }),
    }
}

fn resolve_hires(
    text: &SidecarText,
    sidecar: &Path,
    ov: &Overrides,
    defaults: &ParameterDefaults,
) -> HiresConfig {
    let parsed_scale = lenient(sidecar, text.float(&parser::HIRES_UPSCALE));
    let parsed_upscaler = lenient(sidecar, text.get(&parser::HIRES_UPSCALER));
    let enabled = parsed_scale.is_some() || parsed_upscaler.is_some();

    HiresConfig {
        enabled,
        scale: ov
            .hires
            .scale
            .or(parsed_scale)
            .unwrap_or(defaults.hires_scale),
        denoising_strength: ov
            .hires
            .denoising_strength
            .or_else(|| lenient(sidecar, text.float(&parser::DENOISING_STRENGTH)))
            .unwrap_or(defaults.hires_denoising_strength),
        steps: ov
            .hires
            .steps
            .or_else(|| lenient(sidecar, text.number(&parser::HIRES_STEPS)))
            .unwrap_or(defaults.hires_steps),
        upscaler: ov
            .hires
            .upscaler
            .clone()
            .or(parsed_upscaler)
            .unwrap_or_else(|| defaults.hires_upscaler.clone()),
    }
}

fn resolve_face_restoration(
    text: &SidecarText,
    sidecar: &Path,
    pairs: &BTreeMap<String, String>,
    ov: &Overrides,
    defaults: &ParameterDefaults,
) -> Option<FaceRestoration> {
    let detector = pairs
        .iter()
        .find(|(key, _)| key.starts_with(ADETAILER_MODEL_KEY))
        .map(|(_, value)| value.trim().to_string());
    let parsed_method = lenient(sidecar, text.get(&parser::FACE_RESTORATION))
        .and_then(|name| FaceRestorer::from_name(&name))
        .or_else(|| detector.as_ref().map(|_| FaceRestorer::Adetailer));

    let requested = &ov.face_restoration;
    let enabled = requested
        .enabled
        .unwrap_or(parsed_method.is_some() || requested.method.is_some());
    if !enabled {
        return None;
    }

    let method = requested
        .method
        .or(parsed_method)
        .unwrap_or(defaults.face_restorer);
    Some(FaceRestoration {
        method,
        strength: requested
            .strength
            .unwrap_or(defaults.face_restoration_strength),
        detector: detector.filter(|_| method == FaceRestorer::Adetailer),
    })
}

fn resolve_cutoff(
    text: &SidecarText,
    sidecar: &Path,
    ov: &Overrides,
    defaults: &ParameterDefaults,
) -> Option<CutoffConfig> {
    let parsed_enabled = lenient(sidecar, text.flag(&parser::CUTOFF_ENABLED));
    let parsed_targets = lenient(sidecar, text.list(&parser::CUTOFF_TARGETS));
    let parsed_weight = lenient(sidecar, text.float(&parser::CUTOFF_WEIGHT));
    let requested = &ov.cutoff;

    let mentioned = parsed_enabled.is_some()
        || parsed_targets.is_some()
        || requested.enabled.is_some()
        || requested.targets.is_some();
    if !mentioned {
        return None;
    }

    let targets = requested
        .targets
        .clone()
        .or(parsed_targets)
        .unwrap_or_default();
    Some(CutoffConfig {
        enabled: requested
            .enabled
            .or(parsed_enabled)
            .unwrap_or(!targets.is_empty()),
        targets,
        weight: requested
            .weight
            .or(parsed_weight)
            .unwrap_or(defaults.cutoff_weight),
    })
}

fn resolve_tiled_diffusion(
    text: &SidecarText,
    sidecar: &Path,
    ov: &Overrides,
    defaults: &ParameterDefaults,
) -> Option<TiledDiffusionConfig> {
    let parsed = lenient(sidecar, text.dict(&parser::TILED_DIFFUSION));
    let requested = &ov.tiled_diffusion;
    if parsed.is_none() && requested.enabled.is_none() {
        return None;
    }
    let enabled = requested.enabled.unwrap_or(parsed.is_some());
    let parsed = parsed.unwrap_or_default();

    Some(TiledDiffusionConfig {
        enabled,
        method: requested
            .method
            .clone()
            .or_else(|| dict_value::<String>(&parsed, "Method"))
            .unwrap_or_else(|| defaults.tiled_diffusion_method.clone()),
        tile_width: requested
            .tile_width
            .or_else(|| dict_value(&parsed, "Tile tile width"))
            .unwrap_or(defaults.tile_width),
        tile_height: requested
            .tile_height
            .or_else(|| dict_value(&parsed, "Tile tile height"))
            .unwrap_or(defaults.tile_height),
        overlap: requested
            .overlap
            .or_else(|| dict_value(&parsed, "Tile Overlap"))
            .unwrap_or(defaults.tile_overlap),
        batch_size: requested
            .batch_size
            .or_else(|| dict_value(&parsed, "Tile batch size"))
            .unwrap_or(defaults.tile_batch_size),
    })
}

fn resolve_tiled_vae(
    text: &SidecarText,
    sidecar: &Path,
    ov: &Overrides,
    defaults: &ParameterDefaults,
) -> Option<TiledVaeConfig> {
    let parsed = lenient(sidecar, text.dict(&parser::TILED_VAE));
    let requested = &ov.tiled_vae;
    if parsed.is_none() && requested.enabled.is_none() {
        return None;
    }
    let enabled = requested.enabled.unwrap_or(parsed.is_some());
    let parsed = parsed.unwrap_or_default();

    Some(TiledVaeConfig {
        enabled,
        encoder_tile_size: requested
            .encoder_tile_size
            .or_else(|| dict_value(&parsed, "Encoder Tile Size"))
            .unwrap_or(defaults.encoder_tile_size),
        decoder_tile_size: requested
            .decoder_tile_size
            .or_else(|| dict_value(&parsed, "Decoder Tile Size"))
            .unwrap_or(defaults.decoder_tile_size),
    })
}

/// Reads a dictionary entry written either as a JSON number/string or as
/// text that parses to `T`.
fn dict_value<T: FromStr>(dict: &Map<String, Value>, key: &str) -> Option<T> {
    match dict.get(key)? {
        Value::String(text) => text.trim().parse().ok(),
        other => other.to_string().parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use std::fs;

    const FULL: &str = "masterpiece, 1girl
Negative prompt: blurry
Steps: 20, Sampler: Euler a, CFG scale: 7, Seed: 12345, Size: 512x768, Model hash: abc123, Model: myModel, VAE hash: 735e4c3a44, VAE: sdxl_vae, Hires upscale: 1.5, Hires upscaler: Latent, Denoising strength: 0.4, Face restoration: GFPGAN, Cutoff enabled: True, Cutoff targets: ['red', 'blue'], Cutoff weight: 0.6, Tiled Diffusion: {\"Method\": \"Mixture of Diffusers\", \"Tile tile width\": 64, \"Tile tile height\": 80, \"Tile Overlap\": 16, \"Tile batch size\": 2}, Tiled VAE: {\"Encoder Tile Size\": 2048, \"Decoder Tile Size\": 128}, Lora hashes: \"a: 1, b: 2\"
Template: {style}, 1girl";

    fn defaults() -> ParameterDefaults {
        ParameterDefaults::default()
    }

    fn roster() -> Vec<ModelInfo> {
        vec![ModelInfo {
            title: "myModel.safetensors [abc123ffff]".to_string(),
            model_name: "myModel".to_string(),
            hash: Some("abc123".to_string()),
            sha256: None,
            filename: "/models/myModel.safetensors".to_string(),
        }]
    }

    fn assemble_text(raw: &str, overrides: &Overrides) -> std::result::Result<GenerationParameters, ParseError> {
        assemble(
            raw,
            Path::new("/r/a.txt"),
            PathBuf::from("/r/a.png"),
            overrides,
            &roster(),
            &defaults(),
        )
    }

    #[test]
    fn test_round_trip_of_every_field() {
        let record = assemble_text(FULL, &Overrides::default()).unwrap();
        assert_eq!(record.prompt, "masterpiece, 1girl");
        assert_eq!(record.negative_prompt, "blurry");
        assert_eq!(record.sampler, "Euler a");
        assert_eq!(record.steps, 20);
        assert_eq!(record.cfg_scale, 7.0);
        assert_eq!(record.seed, 12345);
        assert_eq!((record.width, record.height), (512, 768));
        assert_eq!(record.model.name, "myModel.safetensors [abc123ffff]");
        assert_eq!(
            record.decoder,
            Some(DecoderRef::Named {
                hash: Some("735e4c3a44".to_string()),
                name: Some("sdxl_vae".to_string()),
            })
        );
        assert!(record.hires.enabled);
        assert_eq!(record.hires.scale, 1.5);
        assert_eq!(record.hires.denoising_strength, 0.4);
        assert_eq!(
            record.face_restoration.as_ref().map(|f| f.method),
            Some(FaceRestorer::Gfpgan)
        );
        let cutoff = record.cutoff.unwrap();
        assert!(cutoff.enabled);
        assert_eq!(cutoff.targets, vec!["red", "blue"]);
        assert_eq!(cutoff.weight, 0.6);
        let tiled = record.tiled_diffusion.unwrap();
        assert_eq!(tiled.method, "Mixture of Diffusers");
        assert_eq!((tiled.tile_width, tiled.tile_height), (64, 80));
        assert_eq!((tiled.overlap, tiled.batch_size), (16, 2));
        let tiled_vae = record.tiled_vae.unwrap();
        assert_eq!(tiled_vae.encoder_tile_size, 2048);
        assert_eq!(tiled_vae.decoder_tile_size, 128);
        assert_eq!(record.template.as_deref(), Some("{style}, 1girl"));
        assert_eq!(
            record.extra.get("Lora hashes").map(String::as_str),
            Some("\"a: 1, b: 2\"")
        );
        assert_eq!(record.clip_skip, None);
    }

    #[test]
    fn test_override_beats_parsed_value() {
        let overrides = Overrides {
            steps: Some(30),
            hires: crate::overrides::HiresOverrides {
                scale: Some(2.5),
                ..Default::default()
            },
            ..Default::default()
        };
        let record = assemble_text(FULL, &overrides).unwrap();
        assert_eq!(record.steps, 30);
        assert_eq!(record.hires.scale, 2.5);
        assert_eq!(record.hires.upscaler, "Latent");
    }

    #[test]
    fn test_missing_seed_excludes_file() {
        let raw = "a cat\nSteps: 20, CFG scale: 7, Size: 512x512, Model: m";
        assert_eq!(
            assemble_text(raw, &Overrides::default()).unwrap_err(),
            ParseError::MissingField("Seed".to_string())
        );

        let rescued = Overrides {
            seed: Some(7),
            ..Default::default()
        };
        assert_eq!(assemble_text(raw, &rescued).unwrap().seed, 7);
    }

    #[test]
    fn test_defaults_fill_absent_values() {
        let raw = "a cat\nSteps: 20, CFG scale: 7, Seed: 1, Size: 512x512, Model: unknown";
        let record = assemble_text(raw, &Overrides::default()).unwrap();
        assert_eq!(record.sampler, "Euler a");
        assert!(!record.hires.enabled);
        assert_eq!(record.hires.scale, 2.0);
        assert_eq!(record.model.name, "unknown");
        assert_eq!(record.decoder, None);
        assert!(record.face_restoration.is_none());
        assert!(record.cutoff.is_none());
    }

    #[test]
    fn test_face_restoration_can_be_disabled_by_override() {
        let overrides = Overrides {
            face_restoration: crate::overrides::FaceRestorationOverrides {
                enabled: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(assemble_text(FULL, &overrides)
            .unwrap()
            .face_restoration
            .is_none());
    }

    #[test]
    fn test_adetailer_model_selects_detector() {
        let raw = "face\nSteps: 20, CFG scale: 7, Seed: 1, Size: 64x64, Model: myModel, ADetailer model: hand_yolov8n.pt, ADetailer confidence: 0.3";
        let restoration = assemble_text(raw, &Overrides::default())
            .unwrap()
            .face_restoration
            .unwrap();
        assert_eq!(restoration.method, FaceRestorer::Adetailer);
        assert_eq!(restoration.detector.as_deref(), Some("hand_yolov8n.pt"));
    }

    fn record(model: &str, decoder: Option<DecoderRef>, name: &str) -> GenerationParameters {
        let mut params = crate::payload::tests::sample_params(model);
        params.decoder = decoder;
        params.sidecar_path = PathBuf::from(name);
        params
    }

    #[test]
    fn test_sort_groups_by_model_then_decoder() {
        let vae_a = Some(DecoderRef::from_value("a.safetensors"));
        let vae_b = Some(DecoderRef::from_value("b.safetensors"));
        let mut records = vec![
            record("modelB", None, "1"),
            record("modelA", vae_b.clone(), "2"),
            record("modelA", None, "3"),
            record("modelA", vae_a.clone(), "4"),
            record("modelB", vae_a.clone(), "5"),
        ];
        sort_for_replay(&mut records);
        let order: Vec<String> = records
            .iter()
            .map(|r| r.sidecar_path.to_string_lossy().to_string())
            .collect();
        assert_eq!(order, vec!["4", "2", "3", "5", "1"]);
    }

    #[tokio::test]
    async fn test_parse_and_sort_skips_bad_files_and_prunes_orphans() {
        let root = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| fs::write(root.path().join(name), body).unwrap();
        write("b.txt", "b\nSteps: 20, CFG scale: 7, Seed: 2, Size: 64x64, Model: modelB");
        write("b.png", "");
        write("a.txt", "a\nSteps: 20, CFG scale: 7, Seed: 1, Size: 64x64, Model: modelA");
        write("a.png", "");
        write("bad.txt", "bad\nSteps: 20, CFG scale: 7, Size: 64x64, Model: modelA");
        write("bad.png", "");
        write("lonely.txt", "x\nSteps: 1, CFG scale: 1, Seed: 1, Size: 8x8, Model: modelA");

        let config = AppConfig::default();
        let scanned = fsops::scan_directory(root.path(), &config.folders);
        let backend = FakeBackend::new(&["modelA", "modelB"], "modelA");

        let records = parse_and_sort(&backend, root.path(), &scanned, &config, true)
            .await
            .unwrap();
        let names: Vec<String> = records.iter().map(|r| r.file_name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(records[0].image_path, root.path().join("a.png"));
        assert!(root.path().join("orphaned-params/lonely.txt").exists());
    }

    #[tokio::test]
    async fn test_parse_and_sort_without_pruning_leaves_orphans_in_place() {
        let root = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| fs::write(root.path().join(name), body).unwrap();
        write("a.txt", "a\nSteps: 20, CFG scale: 7, Seed: 1, Size: 64x64, Model: modelA");
        write("a.png", "");
        write("lonely.txt", "x\nSteps: 1, CFG scale: 1, Seed: 1, Size: 8x8, Model: modelA");

        let config = AppConfig::default();
        let scanned = fsops::scan_directory(root.path(), &config.folders);
        let backend = FakeBackend::new(&["modelA"], "modelA");

        let records = parse_and_sort(&backend, root.path(), &scanned, &config, false)
            .await
            .unwrap();
        let names: Vec<String> = records.iter().map(|r| r.file_name()).collect();
        assert_eq!(names, vec!["a"]);
        assert!(root.path().join("lonely.txt").is_file());
        assert!(!root.path().join("orphaned-params").exists());
    }
}
