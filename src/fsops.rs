//! Directory scanning and collision-safe file placement.

use crate::config::OutputFolders;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Image extensions a sidecar can be paired with.
const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];
const SIDECAR_EXTENSION: &str = "txt";
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;
const OPEN_RETRIES: u32 = 20;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannedDir {
    pub images: Vec<PathBuf>,
    pub sidecars: Vec<PathBuf>,
}

/// Recursively collects images and sidecars under `root`, skipping the
/// folders this tool writes into.
pub fn scan_directory(root: &Path, folders: &OutputFolders) -> ScannedDir {
    let reserved = folders.reserved();
    let mut scanned = ScannedDir::default();

    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .max_open(32)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_reserved_dir(entry, &reserved));

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(ext) = path.extension() else {
            continue;
        };
        let ext_lower = ext.to_string_lossy().to_ascii_lowercase();
        if ext_lower == SIDECAR_EXTENSION {
            scanned.sidecars.push(path.to_path_buf());
        } else if SUPPORTED_EXTENSIONS.contains(&ext_lower.as_str()) {
            scanned.images.push(path.to_path_buf());
        }
    }

    scanned
}

fn is_reserved_dir(entry: &walkdir::DirEntry, reserved: &[&str]) -> bool {
    entry.depth() == 1
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| reserved.contains(&name))
}

/// A sidecar together with its same-stem image in the same directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    pub sidecar: PathBuf,
    pub image: PathBuf,
}

/// Pairs sidecars with images by directory and stem. Returns the pairs and
/// the sidecars that have no image.
pub fn pair_files(images: &[PathBuf], sidecars: &[PathBuf]) -> (Vec<FilePair>, Vec<PathBuf>) {
    let mut by_stem: HashMap<(PathBuf, String), &PathBuf> = HashMap::with_capacity(images.len());
    for image in images {
        if let Some(key) = pairing_key(image) {
            by_stem.entry(key).or_insert(image);
        }
    }

    let mut pairs = Vec::with_capacity(sidecars.len());
    let mut orphans = Vec::new();
    for sidecar in sidecars {
        match pairing_key(sidecar).and_then(|key| by_stem.get(&key)) {
            Some(image) => pairs.push(FilePair {
                sidecar: sidecar.clone(),
                image: (*image).clone(),
            }),
            None => orphans.push(sidecar.clone()),
        }
    }

    (pairs, orphans)
}

fn pairing_key(path: &Path) -> Option<(PathBuf, String)> {
    let parent = path.parent()?.to_path_buf();
    let stem = path.file_stem()?.to_string_lossy().to_string();
    Some((parent, stem))
}

/// Moves sidecars without an image into `<root>/<orphans>/<relative dir>`.
pub fn prune_orphans(root: &Path, orphans: &[PathBuf], folder: &str) -> io::Result<usize> {
    let target_root = root.join(folder);
    let mut moved = 0usize;

    for orphan in orphans {
        let dest_dir = target_root.join(relative_dir(root, orphan));
        let dest = move_file(orphan, &dest_dir)?;
        log::warn!(
            "Sidecar {} has no image; moved to {}",
            orphan.display(),
            dest.display()
        );
        moved += 1;
    }

    Ok(moved)
}

/// Directory of `path` relative to `root` (empty when outside `root`).
pub fn relative_dir(root: &Path, path: &Path) -> PathBuf {
    path.parent()
        .and_then(|parent| parent.strip_prefix(root).ok())
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// `path` itself if free, otherwise the first free `stem-N.ext`.
pub fn unique_destination(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|value| format!(".{}", value.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1usize;
    loop {
        let candidate = parent.join(format!("{stem}-{counter}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Moves `source` into `dest_dir`, keeping its file name unless taken.
pub fn move_file(source: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dest_dir)?;
    let file_name = source
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let dest = unique_destination(&dest_dir.join(file_name));
    rename_or_copy(source, &dest)?;
    Ok(dest)
}

/// Moves an image and its sidecar into `dest_dir` under one shared stem,
/// suffixed as a unit when either name is taken.
pub fn move_pair(image: &Path, sidecar: &Path, dest_dir: &Path) -> io::Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dest_dir)?;
    let stem = image
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let image_ext = extension_of(image);
    let sidecar_ext = extension_of(sidecar);

    let stem = free_stem(dest_dir, &stem, &[&image_ext, &sidecar_ext]);
    let image_dest = dest_dir.join(with_extension(&stem, &image_ext));
    let sidecar_dest = dest_dir.join(with_extension(&stem, &sidecar_ext));
    rename_or_copy(image, &image_dest)?;
    rename_or_copy(sidecar, &sidecar_dest)?;
    Ok((image_dest, sidecar_dest))
}

/// Writes two files sharing one stem, e.g. an image and its sidecar.
/// On collision both get the same `-N` suffix.
pub fn write_pair(
    dest_dir: &Path,
    stem: &str,
    first: (&str, &[u8]),
    second: (&str, &[u8]),
) -> io::Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dest_dir)?;
    let stem = free_stem(dest_dir, stem, &[first.0, second.0]);
    let first_dest = dest_dir.join(with_extension(&stem, first.0));
    let second_dest = dest_dir.join(with_extension(&stem, second.0));
    fs::write(&first_dest, first.1)?;
    fs::write(&second_dest, second.1)?;
    Ok((first_dest, second_dest))
}

/// `stem` if no `stem.<ext>` exists for any of `exts`, otherwise the first
/// `stem-N` free for all of them.
fn free_stem(dir: &Path, stem: &str, exts: &[&str]) -> String {
    let is_free = |candidate: &str| {
        exts.iter()
            .all(|ext| !dir.join(with_extension(candidate, ext)).exists())
    };
    if is_free(stem) {
        return stem.to_string();
    }
    let mut counter = 1usize;
    loop {
        let candidate = format!("{stem}-{counter}");
        if is_free(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn with_extension(stem: &str, ext: &str) -> String {
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

/// Falls back to copy + remove when a rename crosses filesystems.
fn rename_or_copy(source: &Path, dest: &Path) -> io::Result<()> {
    if fs::rename(source, dest).is_err() {
        fs::copy(source, dest)?;
        fs::remove_file(source)?;
    }
    Ok(())
}

/// Reads a text file, retrying while the process is out of descriptors.
pub fn read_to_string_with_retry(path: &Path) -> io::Result<String> {
    let mut attempt = 0u32;
    loop {
        match fs::read_to_string(path) {
            Err(error) if is_descriptor_exhaustion(&error) && attempt < OPEN_RETRIES => {
                attempt += 1;
                log::debug!(
                    "Out of file descriptors reading {} (attempt {}), retrying",
                    path.display(),
                    attempt
                );
                std::thread::sleep(OPEN_RETRY_DELAY);
            }
            result => return result,
        }
    }
}

fn is_descriptor_exhaustion(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(EMFILE) | Some(ENFILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_scan_skips_output_folders() {
        let root = tempfile::tempdir().unwrap();
        let folders = OutputFolders::default();
        touch(&root.path().join("a.png"));
        touch(&root.path().join("a.txt"));
        touch(&root.path().join("sub/b.jpg"));
        touch(&root.path().join("upscaled/c.png"));
        touch(&root.path().join("orphaned-params/d.txt"));

        let scanned = scan_directory(root.path(), &folders);
        assert_eq!(
            scanned.images,
            vec![root.path().join("a.png"), root.path().join("sub/b.jpg")]
        );
        assert_eq!(scanned.sidecars, vec![root.path().join("a.txt")]);
    }

    #[test]
    fn test_pairing_requires_same_directory_and_stem() {
        let images = vec![PathBuf::from("/r/a.png"), PathBuf::from("/r/sub/b.png")];
        let sidecars = vec![
            PathBuf::from("/r/a.txt"),
            PathBuf::from("/r/b.txt"),
            PathBuf::from("/r/sub/b.txt"),
        ];
        let (pairs, orphans) = pair_files(&images, &sidecars);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].image, PathBuf::from("/r/a.png"));
        assert_eq!(orphans, vec![PathBuf::from("/r/b.txt")]);
    }

    #[test]
    fn test_orphans_are_moved_with_relative_dir() {
        let root = tempfile::tempdir().unwrap();
        let orphan = root.path().join("sub/lonely.txt");
        touch(&orphan);

        let moved = prune_orphans(root.path(), &[orphan.clone()], "orphaned-params").unwrap();
        assert_eq!(moved, 1);
        assert!(!orphan.exists());
        assert!(root.path().join("orphaned-params/sub/lonely.txt").exists());
    }

    #[test]
    fn test_collisions_get_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("img.png"));
        touch(&dir.path().join("img-1.png"));
        assert_eq!(
            unique_destination(&dir.path().join("img.png")),
            dir.path().join("img-2.png")
        );
    }

    #[test]
    fn test_pair_keeps_shared_stem_when_one_name_is_taken() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("one.png"));

        let (image, sidecar) =
            write_pair(dir.path(), "one", ("png", b"img"), ("txt", b"text")).unwrap();
        assert_eq!(image, dir.path().join("one-1.png"));
        assert_eq!(sidecar, dir.path().join("one-1.txt"));
        assert_eq!(fs::read(&sidecar).unwrap(), b"text");
    }

    #[test]
    fn test_move_pair_suffixes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("a.png");
        let sidecar = dir.path().join("a.txt");
        touch(&image);
        touch(&sidecar);
        let done = dir.path().join("done");
        touch(&done.join("a.txt"));

        let (moved_image, moved_sidecar) = move_pair(&image, &sidecar, &done).unwrap();
        assert_eq!(moved_image, done.join("a-1.png"));
        assert_eq!(moved_sidecar, done.join("a-1.txt"));
        assert!(!image.exists() && !sidecar.exists());
    }

    #[test]
    fn test_move_file_keeps_name() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.png");
        touch(&source);
        let dest = move_file(&source, &dir.path().join("done")).unwrap();
        assert_eq!(dest, dir.path().join("done/a.png"));
        assert!(!source.exists());
    }
}
