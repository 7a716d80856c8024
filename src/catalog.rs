// SPDX-License-Identifier: MPL-2.0

//! Video assets and the catalog that lists them.
//!
//! The session only consumes the [`Catalog`] trait. [`DirectoryCatalog`] is the
//! daemon's implementation: it scans a directory tree for video files, merges
//! remote streams from an optional `catalog.ron` manifest, and persists the
//! last played asset in the cosmic-config state.

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
};

use cosmic_bg_video_config::state::State;
use cosmic_config::CosmicConfigEntry;
use rand::seq::IndexedRandom;
use serde::Deserialize;
use walkdir::WalkDir;

/// Manifest listing streams and extra entries, read from the catalog root.
pub const MANIFEST_NAME: &str = "catalog.ron";

/// Video container extensions that may contain playable video.
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "avi", "mov", "m4v", "ogv"];

/// Image extensions accepted as a preview next to a video.
const PREVIEW_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Stable identifier of an asset: its locator as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(String);

impl AssetId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the media of an asset lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Path(PathBuf),
    Url(String),
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Path(path) => write!(f, "{}", path.display()),
            Locator::Url(url) => f.write_str(url),
        }
    }
}

impl Locator {
    fn parse(raw: &str, root: &Path) -> Self {
        if raw.contains("://") {
            Locator::Url(raw.to_owned())
        } else {
            Locator::Path(root.join(raw))
        }
    }
}

/// One playable video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: AssetId,
    pub locator: Locator,
    pub name: String,
    pub streaming: bool,
    pub preview: Option<Locator>,
    pub tags: Vec<String>,
}

impl Asset {
    /// A local video file.
    #[must_use]
    pub fn local(path: PathBuf) -> Self {
        let name = path
            .file_stem()
            .map(|stem| display_name(&stem.to_string_lossy()))
            .unwrap_or_default();

        Self {
            id: AssetId(path.to_string_lossy().into_owned()),
            locator: Locator::Path(path),
            name,
            streaming: false,
            preview: None,
            tags: Vec::new(),
        }
    }

    /// A network stream.
    #[must_use]
    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: AssetId(url.clone()),
            locator: Locator::Url(url),
            name: name.into(),
            streaming: true,
            preview: None,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_preview(mut self, preview: Option<Locator>) -> Self {
        self.preview = preview;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Source of assets consumed by the session.
pub trait Catalog {
    /// Every known asset, in display order.
    fn list_assets(&self) -> Vec<Asset>;

    /// A random asset, or `None` if the catalog is empty.
    fn random_asset(&mut self) -> Option<Asset>;

    /// The asset recorded by the last call to [`Catalog::record_played`], if it still exists.
    fn last_played_asset(&self) -> Option<Asset>;

    fn record_played(&mut self, asset: &Asset);

    fn find(&self, id: &str) -> Option<Asset> {
        self.list_assets()
            .into_iter()
            .find(|asset| asset.id.as_str() == id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    name: String,
    url: String,
    #[serde(default)]
    preview: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Catalog backed by a directory of video files.
#[derive(Debug)]
pub struct DirectoryCatalog {
    root: PathBuf,
    assets: Vec<Asset>,
    last_played: Option<AssetId>,
    persist: bool,
}

impl DirectoryCatalog {
    /// Scan `root` and restore the last played asset from the cosmic-config state.
    pub fn open(root: PathBuf) -> Self {
        let last_played = State::state()
            .ok()
            .map(|helper| State::get_entry(&helper).unwrap_or_else(|(_, partial)| partial))
            .and_then(|state| state.last_played)
            .map(AssetId);

        let mut catalog = Self::scan(root);
        catalog.last_played = last_played;
        catalog.persist = true;
        catalog
    }

    /// Scan `root` without touching persisted state.
    pub fn scan(root: PathBuf) -> Self {
        let mut catalog = Self {
            root,
            assets: Vec::new(),
            last_played: None,
            persist: false,
        };
        catalog.rescan();
        catalog
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rebuild the asset list from disk.
    pub fn rescan(&mut self) {
        tracing::debug!(root = %self.root.display(), "scanning video catalog");

        let mut assets: Vec<Asset> = WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file() && is_video_file(entry.path()))
            .map(|entry| self.local_asset(entry.into_path()))
            .collect();

        assets.extend(self.manifest_assets());

        let mut seen = HashSet::new();
        assets.retain(|asset| seen.insert(asset.id.clone()));
        assets.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });

        tracing::info!(root = %self.root.display(), assets = assets.len(), "video catalog loaded");
        self.assets = assets;
    }

    fn local_asset(&self, path: PathBuf) -> Asset {
        let preview = PREVIEW_EXTENSIONS
            .iter()
            .map(|ext| path.with_extension(ext))
            .find(|candidate| candidate.is_file())
            .map(Locator::Path);

        let tags = path
            .strip_prefix(&self.root)
            .ok()
            .and_then(Path::parent)
            .map(|dir| {
                dir.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();

        Asset::local(path).with_preview(preview).with_tags(tags)
    }

    fn manifest_assets(&self) -> Vec<Asset> {
        let path = self.root.join(MANIFEST_NAME);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };

        match ron::from_str::<Vec<ManifestEntry>>(&contents) {
            Ok(entries) => entries
                .into_iter()
                .map(|entry| {
                    let preview = entry
                        .preview
                        .as_deref()
                        .map(|raw| Locator::parse(raw, &self.root));
                    match Locator::parse(&entry.url, &self.root) {
                        Locator::Url(url) => Asset::remote(entry.name, url),
                        Locator::Path(path) => Asset {
                            name: entry.name,
                            ..Asset::local(path)
                        },
                    }
                    .with_preview(preview)
                    .with_tags(entry.tags)
                })
                .collect(),
            Err(why) => {
                tracing::warn!(path = %path.display(), %why, "invalid catalog manifest");
                Vec::new()
            }
        }
    }
}

impl Catalog for DirectoryCatalog {
    fn list_assets(&self) -> Vec<Asset> {
        self.assets.clone()
    }

    fn random_asset(&mut self) -> Option<Asset> {
        self.assets.choose(&mut rand::rng()).cloned()
    }

    fn last_played_asset(&self) -> Option<Asset> {
        let id = self.last_played.as_ref()?;
        self.assets.iter().find(|asset| &asset.id == id).cloned()
    }

    fn record_played(&mut self, asset: &Asset) {
        self.last_played = Some(asset.id.clone());

        if self.persist {
            let id = asset.id.to_string();
            if let Err(why) = State::modify(|state| state.last_played = Some(id)) {
                tracing::error!(?why, "failed to persist last played asset");
            }
        }
    }

    fn find(&self, id: &str) -> Option<Asset> {
        self.assets.iter().find(|asset| asset.id.as_str() == id).cloned()
    }
}

/// Check if a path points to a video file.
#[must_use]
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

fn display_name(stem: &str) -> String {
    stem.replace(['_', '-'], " ")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write(path: &Path, bytes: usize) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn video_extensions_are_case_insensitive() {
        for name in ["a.mp4", "a.MP4", "a.WebM", "a.mkv", "a.mov", "a.m4v", "a.ogv", "a.avi"] {
            assert!(is_video_file(Path::new(name)), "{name} should be a video");
        }
        for name in ["a.gif", "a.png", "a", "a.mp4.txt"] {
            assert!(!is_video_file(Path::new(name)), "{name} should not be a video");
        }
    }

    #[test]
    fn scan_builds_assets_with_tags_and_previews() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("ocean_waves.mp4"), 16);
        write(&root.join("ocean_waves.jpg"), 16);
        write(&root.join("nature/forest/Misty-Morning.webm"), 16);
        write(&root.join("readme.txt"), 16);

        let catalog = DirectoryCatalog::scan(root.to_path_buf());
        let assets = catalog.list_assets();

        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].name, "Misty Morning");
        assert_eq!(assets[0].tags, vec!["nature".to_owned(), "forest".to_owned()]);
        assert_eq!(assets[0].preview, None);
        assert!(!assets[0].streaming);

        assert_eq!(assets[1].name, "ocean waves");
        assert!(assets[1].tags.is_empty());
        assert_eq!(
            assets[1].preview,
            Some(Locator::Path(root.join("ocean_waves.jpg")))
        );
    }

    #[test]
    fn manifest_adds_streams() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(
            root.join(MANIFEST_NAME),
            r#"[
                (name: "Aurora", url: "https://example.org/aurora.m3u8", tags: ["sky"]),
                (name: "Local Clip", url: "clips/clip.mp4", preview: Some("clips/clip.png")),
            ]"#,
        )
        .unwrap();

        let catalog = DirectoryCatalog::scan(root.to_path_buf());
        let aurora = catalog.find("https://example.org/aurora.m3u8").unwrap();
        assert!(aurora.streaming);
        assert_eq!(aurora.tags, vec!["sky".to_owned()]);

        let clip = catalog
            .list_assets()
            .into_iter()
            .find(|asset| asset.name == "Local Clip")
            .unwrap();
        assert_eq!(clip.locator, Locator::Path(root.join("clips/clip.mp4")));
        assert_eq!(clip.preview, Some(Locator::Path(root.join("clips/clip.png"))));
        assert!(!clip.streaming);
    }

    #[test]
    fn invalid_manifest_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_NAME), "not ron at all (").unwrap();
        write(&dir.path().join("a.mp4"), 1);

        let catalog = DirectoryCatalog::scan(dir.path().to_path_buf());
        assert_eq!(catalog.list_assets().len(), 1);
    }

    #[test]
    fn random_and_last_played() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.mp4"), 1);
        write(&dir.path().join("b.mp4"), 1);

        let mut catalog = DirectoryCatalog::scan(dir.path().to_path_buf());
        assert!(catalog.last_played_asset().is_none());

        let listed = catalog.list_assets();
        let random = catalog.random_asset().unwrap();
        assert!(listed.contains(&random));

        catalog.record_played(&listed[1]);
        assert_eq!(catalog.last_played_asset(), Some(listed[1].clone()));

        fs::remove_file(dir.path().join("b.mp4")).unwrap();
        catalog.rescan();
        assert!(catalog.last_played_asset().is_none());
    }

    #[test]
    fn empty_catalog_has_no_random_asset() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = DirectoryCatalog::scan(dir.path().join("missing"));
        assert!(catalog.list_assets().is_empty());
        assert!(catalog.random_asset().is_none());
    }

    #[test]
    fn locators_display_as_written() {
        let root = Path::new("/videos");
        assert_eq!(
            Locator::parse("clips/sea.mp4", root).to_string(),
            "/videos/clips/sea.mp4"
        );
        assert_eq!(
            Locator::parse("https://example.org/live.m3u8", root).to_string(),
            "https://example.org/live.m3u8"
        );
    }
}
