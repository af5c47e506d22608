//! External collaborators: embedding, description and feature extraction.
//!
//! The engine never runs models itself. It calls these traits, which
//! hosts implement over whatever inference stack they use. Closures
//! implement the traits directly, which keeps tests short.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Image path -> embedding vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, image: &Path) -> Result<Vec<f32>>;
}

/// Image path -> text description.
///
/// Only `describe` is required. Generators that can caption several images
/// in one call report it through `supports_batch` and override
/// `describe_batch`; the builder falls back to per-item calls when the
/// batch call fails.
pub trait DescriptionGenerator: Send + Sync {
    fn describe(&self, image: &Path) -> Result<String>;

    fn supports_batch(&self) -> bool {
        false
    }

    /// Describe several images. Missing entries in the returned map count
    /// as per-image failures.
    fn describe_batch(&self, images: &[PathBuf]) -> Result<BTreeMap<PathBuf, String>> {
        let mut out = BTreeMap::new();
        for image in images {
            match self.describe(image) {
                Ok(text) => {
                    out.insert(image.clone(), text);
                }
                Err(e) => tracing::warn!("description failed for {}: {}", image.display(), e),
            }
        }
        Ok(out)
    }
}

/// Image path -> feature bag.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &Path) -> Result<FeatureBag>;
}

impl<F> Embedder for F
where
    F: Fn(&Path) -> Result<Vec<f32>> + Send + Sync,
{
    fn embed(&self, image: &Path) -> Result<Vec<f32>> {
        self(image)
    }
}

impl<F> DescriptionGenerator for F
where
    F: Fn(&Path) -> Result<String> + Send + Sync,
{
    fn describe(&self, image: &Path) -> Result<String> {
        self(image)
    }
}

impl<F> FeatureExtractor for F
where
    F: Fn(&Path) -> Result<FeatureBag> + Send + Sync,
{
    fn extract(&self, image: &Path) -> Result<FeatureBag> {
        self(image)
    }
}

/// The set of collaborators an engine builds with.
#[derive(Clone)]
pub struct Collaborators {
    pub embedder: Arc<dyn Embedder>,
    pub describer: Option<Arc<dyn DescriptionGenerator>>,
    pub extractor: Option<Arc<dyn FeatureExtractor>>,
}

impl Collaborators {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder, describer: None, extractor: None }
    }

    pub fn with_describer(mut self, describer: Arc<dyn DescriptionGenerator>) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("describer", &self.describer.is_some())
            .field("extractor", &self.extractor.is_some())
            .finish()
    }
}

// ── Feature bag ────────────────────────────────────────────────────

/// Everything a feature extractor reports for one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureBag {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicFeatures>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorFeatures>,

    /// Free-form composition metrics (`rule_of_thirds`, `high_contrast`, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub composition: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exif: Option<ExifFeatures>,

    /// Flat tags; `category:value` tags are also linked to their category
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<DetectedObject>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faces: Vec<FaceRegion>,
}

impl FeatureBag {
    pub fn is_empty(&self) -> bool {
        self.basic.is_none()
            && self.color.is_none()
            && self.composition.is_empty()
            && self.exif.is_none()
            && self.tags.is_empty()
            && self.objects.is_empty()
            && self.faces.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicFeatures {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f32,
    /// `landscape`, `portrait` or `square`
    pub orientation: String,
}

impl BasicFeatures {
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        let orientation = match width.cmp(&height) {
            std::cmp::Ordering::Greater => "landscape",
            std::cmp::Ordering::Less => "portrait",
            std::cmp::Ordering::Equal => "square",
        };
        let aspect_ratio = if height == 0 { 0.0 } else { width as f32 / height as f32 };
        Self { width, height, aspect_ratio, orientation: orientation.to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorFeatures {
    #[serde(default)]
    pub avg_rgb: [f32; 3],
    /// 0..1
    #[serde(default)]
    pub avg_brightness: f32,
    /// `dark`, `medium` or `bright`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness_category: Option<String>,
    #[serde(default)]
    pub color_contrast: f32,
    #[serde(default)]
    pub dominant_colors: Vec<String>,
    /// `#rrggbb` of the average color
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_hex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExifFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens: Option<String>,
    /// Remaining EXIF fields (`camera_make`, `iso`, `aperture`, ...)
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

// ── Discovery ──────────────────────────────────────────────────────

/// True when `path` has one of `extensions` (case-insensitive, no dot).
pub fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Regular files directly inside `dir` with a matching extension, sorted.
pub fn discover_images(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && has_image_extension(&path, extensions) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

// ── Timeouts ───────────────────────────────────────────────────────

/// Deadline applied to each collaborator call unless configured otherwise.
pub const DEFAULT_COLLABORATOR_TIMEOUT_MS: u64 = 30_000;

/// Run `call`, giving up after `timeout`.
///
/// With a timeout the call runs on its own thread and the result comes back
/// over a bounded channel; `None` means the deadline passed. A timed-out
/// worker is left to finish in the background and its result is dropped.
pub fn call_with_timeout<T, F>(timeout: Option<Duration>, call: F) -> Option<Result<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let Some(timeout) = timeout else {
        return Some(call());
    };

    let (tx, rx) = crossbeam_channel::bounded(1);
    let spawned = std::thread::Builder::new()
        .name("simgraph-collaborator".to_string())
        .spawn(move || {
            // Receiver may be gone after a timeout.
            let _ = tx.send(call());
        });
    if let Err(e) = spawned {
        return Some(Err(GraphError::Io(e)));
    }

    rx.recv_timeout(timeout).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_closure_collaborators() {
        let embedder = |_: &Path| -> Result<Vec<f32>> { Ok(vec![1.0, 0.0]) };
        assert_eq!(embedder.embed(Path::new("a.jpg")).unwrap(), vec![1.0, 0.0]);

        let describer = |p: &Path| -> Result<String> { Ok(format!("photo of {}", p.display())) };
        assert!(!describer.supports_batch());
        let batch = describer
            .describe_batch(&[PathBuf::from("a.jpg"), PathBuf::from("b.jpg")])
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[&PathBuf::from("b.jpg")], "photo of b.jpg");
    }

    #[test]
    fn test_default_batch_skips_failures() {
        let describer = |p: &Path| -> Result<String> {
            if p.ends_with("bad.jpg") {
                Err(GraphError::DescriptionFailed {
                    path: p.display().to_string(),
                    reason: "model error".into(),
                })
            } else {
                Ok("ok".into())
            }
        };
        let batch = describer
            .describe_batch(&[PathBuf::from("good.jpg"), PathBuf::from("bad.jpg")])
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.contains_key(&PathBuf::from("good.jpg")));
    }

    #[test]
    fn test_orientation_from_dimensions() {
        assert_eq!(BasicFeatures::from_dimensions(800, 600).orientation, "landscape");
        assert_eq!(BasicFeatures::from_dimensions(600, 800).orientation, "portrait");
        assert_eq!(BasicFeatures::from_dimensions(500, 500).orientation, "square");
        assert_eq!(BasicFeatures::from_dimensions(10, 0).aspect_ratio, 0.0);
    }

    #[test]
    fn test_feature_bag_json_shape() {
        let bag = FeatureBag {
            exif: Some(ExifFeatures {
                camera_model: Some("X100V".into()),
                lens: None,
                extra: BTreeMap::from([("iso".to_string(), "200".to_string())]),
            }),
            tags: vec!["landscape".into()],
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::to_value(&bag).unwrap();
        assert_eq!(json["exif"]["camera_model"], "X100V");
        assert_eq!(json["exif"]["iso"], "200");
        assert!(json.get("objects").is_none());
        assert!(!bag.is_empty());
        assert!(FeatureBag::default().is_empty());
    }

    #[test]
    fn test_discover_images_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        for name in ["b.JPG", "a.png", "notes.txt", "c.gif", "d.jpeg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.jpg")).unwrap();

        let exts: Vec<String> = ["jpg", "jpeg", "png", "gif"].iter().map(|s| s.to_string()).collect();
        let found = discover_images(dir.path(), &exts).unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, vec!["a.png", "b.JPG", "c.gif", "d.jpeg"]);
    }

    #[test]
    fn test_call_with_timeout() {
        let fast = call_with_timeout(Some(Duration::from_secs(5)), || Ok(42));
        assert_eq!(fast.unwrap().unwrap(), 42);

        let inline = call_with_timeout(None, || Ok("direct"));
        assert_eq!(inline.unwrap().unwrap(), "direct");

        let slow = call_with_timeout(Some(Duration::from_millis(20)), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(1)
        });
        assert!(slow.is_none());
    }
}
