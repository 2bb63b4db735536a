//! Directory-scoped override files.
//!
//! Every directory may carry an `overrides.json` whose keys are parameter
//! names or dot paths (`"hires.scale": 1.5`). A file's effective overrides are
//! the merge of every directory from the replay root down to its own, nearer
//! directories winning.

use crate::error::OverrideError;
use crate::params::FaceRestorer;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub const OVERRIDES_FILE: &str = "overrides.json";

/// Raw, already nested key/value entries of one directory.
pub type OverrideSet = Map<String, Value>;

/// Every recognized override key. Unknown keys are rejected so typos surface
/// instead of being silently ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Overrides {
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub steps: Option<u32>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<i64>,
    pub subseed: Option<i64>,
    pub subseed_strength: Option<f64>,
    pub clip_skip: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub model: Option<String>,
    pub decoder: Option<String>,
    pub template: Option<String>,
    pub negative_template: Option<String>,
    #[serde(default)]
    pub hires: HiresOverrides,
    #[serde(default)]
    pub face_restoration: FaceRestorationOverrides,
    #[serde(default)]
    pub cutoff: CutoffOverrides,
    #[serde(default)]
    pub tiled_diffusion: TiledDiffusionOverrides,
    #[serde(default)]
    pub tiled_vae: TiledVaeOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HiresOverrides {
    pub scale: Option<f64>,
    pub denoising_strength: Option<f64>,
    pub steps: Option<u32>,
    pub upscaler: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FaceRestorationOverrides {
    pub enabled: Option<bool>,
    pub method: Option<FaceRestorer>,
    pub strength: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CutoffOverrides {
    pub enabled: Option<bool>,
    pub targets: Option<Vec<String>>,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TiledDiffusionOverrides {
    pub enabled: Option<bool>,
    pub method: Option<String>,
    pub tile_width: Option<u32>,
    pub tile_height: Option<u32>,
    pub overlap: Option<u32>,
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TiledVaeOverrides {
    pub enabled: Option<bool>,
    pub encoder_tile_size: Option<u32>,
    pub decoder_tile_size: Option<u32>,
}

/// Sidecar files sharing one effective override set.
#[derive(Debug, Clone)]
pub struct OverrideGroup {
    pub dir: PathBuf,
    pub overrides: Overrides,
    pub files: Vec<PathBuf>,
}

/// Expands dot-path keys into nested objects.
///
/// `{"a.b.c": 5, "a": {"d": 1}}` becomes `{"a": {"b": {"c": 5}, "d": 1}}`.
pub fn flat_keys_to_tree(entries: OverrideSet) -> Value {
    let mut tree = Value::Object(Map::new());

    for (key, value) in entries {
        let value = match value {
            Value::Object(nested) => flat_keys_to_tree(nested),
            other => other,
        };

        let mut branch = value;
        for segment in key.split('.').rev() {
            let mut wrapper = Map::new();
            wrapper.insert(segment.to_string(), branch);
            branch = Value::Object(wrapper);
        }
        merge_into(&mut tree, branch);
    }

    tree
}

/// Deep-merges `overlay` into `base`; overlay values win on conflicts.
pub fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Reads the override file of one directory. A missing file is an empty set.
pub fn load_overrides(dir: &Path) -> Result<OverrideSet, OverrideError> {
    let path = dir.join(OVERRIDES_FILE);
    if !path.is_file() {
        return Ok(OverrideSet::new());
    }

    let content = std::fs::read_to_string(&path).map_err(|source| OverrideError::Io {
        path: path.clone(),
        source,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| OverrideError::Json {
        path: path.clone(),
        source,
    })?;
    let Value::Object(entries) = value else {
        return Err(OverrideError::NotAnObject { path });
    };

    log::debug!("Loaded {} override key(s) from {}", entries.len(), path.display());
    match flat_keys_to_tree(entries) {
        Value::Object(tree) => Ok(tree),
        _ => Ok(OverrideSet::new()),
    }
}

/// Groups `files` by directory and resolves each directory's effective
/// overrides, merging from `root` downward. Each override file is read once.
pub fn build_override_tree(
    root: &Path,
    files: &[PathBuf],
) -> Result<Vec<OverrideGroup>, OverrideError> {
    let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for file in files {
        let dir = file.parent().unwrap_or(root).to_path_buf();
        by_dir.entry(dir).or_default().push(file.clone());
    }

    let mut effective: HashMap<PathBuf, Value> = HashMap::new();
    let mut groups = Vec::with_capacity(by_dir.len());

    for (dir, mut dir_files) in by_dir {
        let tree = resolve_effective(root, &dir, &mut effective)?;
        let overrides: Overrides =
            serde_json::from_value(tree).map_err(|source| OverrideError::Invalid {
                dir: dir.clone(),
                source,
            })?;
        dir_files.sort();
        groups.push(OverrideGroup {
            dir,
            overrides,
            files: dir_files,
        });
    }

    Ok(groups)
}

fn resolve_effective(
    root: &Path,
    dir: &Path,
    cache: &mut HashMap<PathBuf, Value>,
) -> Result<Value, OverrideError> {
    let mut chain = vec![root.to_path_buf()];
    if let Ok(relative) = dir.strip_prefix(root) {
        let mut current = root.to_path_buf();
        for component in relative.components() {
            current.push(component);
            chain.push(current.clone());
        }
    } else {
        chain = vec![dir.to_path_buf()];
    }

    let mut inherited = Value::Object(Map::new());
    for level in chain {
        if let Some(cached) = cache.get(&level) {
            inherited = cached.clone();
            continue;
        }
        let own = load_overrides(&level)?;
        merge_into(&mut inherited, Value::Object(own));
        cache.insert(level, inherited.clone());
    }

    Ok(inherited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write_overrides(dir: &Path, value: Value) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(OVERRIDES_FILE), value.to_string()).unwrap();
    }

    #[test]
    fn test_flat_keys_expand_to_nested_structure() {
        let entries = json!({ "a.b.c": 5 }).as_object().unwrap().clone();
        assert_eq!(flat_keys_to_tree(entries), json!({ "a": { "b": { "c": 5 } } }));
    }

    #[test]
    fn test_flat_and_nested_keys_merge() {
        let entries = json!({
            "tiledDiffusion.enabled": true,
            "tiledDiffusion": { "overlap": 32 },
            "hires": { "denoising.ignored": 1 }
        })
        .as_object()
        .unwrap()
        .clone();
        assert_eq!(
            flat_keys_to_tree(entries),
            json!({
                "tiledDiffusion": { "enabled": true, "overlap": 32 },
                "hires": { "denoising": { "ignored": 1 } }
            })
        );
    }

    #[test]
    fn test_missing_file_is_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_overrides(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(OVERRIDES_FILE), "{ nope").unwrap();
        assert!(matches!(
            load_overrides(dir.path()),
            Err(OverrideError::Json { .. })
        ));
    }

    #[test]
    fn test_nearer_directory_wins_and_inherits() {
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("sub");
        write_overrides(
            root.path(),
            json!({ "steps": 30, "hires.scale": 1.5, "sampler": "Euler" }),
        );
        write_overrides(&sub, json!({ "steps": 40, "hires": { "upscaler": "Latent" } }));

        let files = vec![root.path().join("top.txt"), sub.join("leaf.txt")];
        let groups = build_override_tree(root.path(), &files).unwrap();
        assert_eq!(groups.len(), 2);

        let top = groups.iter().find(|g| g.dir == root.path()).unwrap();
        assert_eq!(top.overrides.steps, Some(30));
        assert_eq!(top.overrides.hires.upscaler, None);

        let leaf = groups.iter().find(|g| g.dir == sub).unwrap();
        assert_eq!(leaf.files, vec![sub.join("leaf.txt")]);
        assert_eq!(leaf.overrides.steps, Some(40));
        assert_eq!(leaf.overrides.sampler.as_deref(), Some("Euler"));
        assert_eq!(leaf.overrides.hires.scale, Some(1.5));
        assert_eq!(leaf.overrides.hires.upscaler.as_deref(), Some("Latent"));
    }

    #[test]
    fn test_intermediate_directory_without_files_still_applies() {
        let root = tempfile::tempdir().unwrap();
        let middle = root.path().join("a");
        let leaf = middle.join("b");
        write_overrides(&middle, json!({ "cfgScale": 4.5 }));
        fs::create_dir_all(&leaf).unwrap();

        let groups = build_override_tree(root.path(), &[leaf.join("x.txt")]).unwrap();
        assert_eq!(groups[0].overrides.cfg_scale, Some(4.5));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_overrides(root.path(), json!({ "stepz": 3 }));
        let result = build_override_tree(root.path(), &[root.path().join("x.txt")]);
        assert!(matches!(result, Err(OverrideError::Invalid { .. })));
    }
}
