//! Asset store surface: where composite and mask exports go.
//!
//! The engine only ever talks to the [`AssetStore`] trait — a remote store
//! is somebody else's problem.  [`DirectoryAssetStore`] is the bundled
//! implementation: encoded images dropped into a directory with a JSON index
//! sidecar, enough for local sessions and for tests.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetCategory {
    General,
    Mask,
    Intermediate,
}

impl AssetCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetCategory::General => "general",
            AssetCategory::Mask => "mask",
            AssetCategory::Intermediate => "intermediate",
        }
    }
}

/// Descriptor returned for every stored image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Store-unique name (also the filename for directory stores).
    pub name: String,
    pub category: AssetCategory,
    pub width: u32,
    pub height: u32,
    /// Intermediates are working artifacts the store may reap.
    pub is_intermediate: bool,
}

#[derive(Debug)]
pub enum AssetError {
    Io(String),
    /// The uploaded bytes are not a decodable image.
    Decode(String),
}

impl std::fmt::Display for AssetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetError::Io(e) => write!(f, "asset store I/O failed: {}", e),
            AssetError::Decode(e) => write!(f, "asset bytes are not an image: {}", e),
        }
    }
}

impl std::error::Error for AssetError {}

impl From<std::io::Error> for AssetError {
    fn from(e: std::io::Error) -> Self {
        AssetError::Io(e.to_string())
    }
}

// ============================================================================
// STORE TRAIT
// ============================================================================

pub trait AssetStore {
    /// Persist encoded image bytes.  `filename` is advisory — stores may
    /// decorate it to guarantee uniqueness.  Returns the stored descriptor.
    fn upload_image(
        &self,
        data: &[u8],
        filename: &str,
        category: AssetCategory,
        is_intermediate: bool,
    ) -> Result<AssetRecord, AssetError>;

    /// Look up a previously stored image.  Missing names are `None`, not an
    /// error.
    fn get_image_record(&self, name: &str) -> Option<AssetRecord>;
}

// ============================================================================
// DIRECTORY STORE
// ============================================================================

const INDEX_FILE: &str = "index.json";

/// Files-on-disk store: `<root>/<name>` plus `<root>/index.json`.
pub struct DirectoryAssetStore {
    root: PathBuf,
    index: Mutex<HashMap<String, AssetRecord>>,
}

impl DirectoryAssetStore {
    /// Open (or create) a store rooted at `root`.  A pre-existing index is
    /// loaded; a corrupt index starts fresh with a logged warning rather
    /// than refusing to open.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, AssetError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let index_path = root.join(INDEX_FILE);
        let index = if index_path.exists() {
            match fs::read_to_string(&index_path) {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                    crate::log_warn!("asset index unreadable ({}), starting fresh", e);
                    HashMap::new()
                }),
                Err(e) => {
                    crate::log_warn!("asset index unreadable ({}), starting fresh", e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn persist_index(&self, index: &HashMap<String, AssetRecord>) -> Result<(), AssetError> {
        let raw =
            serde_json::to_string_pretty(index).map_err(|e| AssetError::Io(e.to_string()))?;
        fs::write(self.root.join(INDEX_FILE), raw)?;
        Ok(())
    }
}

impl AssetStore for DirectoryAssetStore {
    fn upload_image(
        &self,
        data: &[u8],
        filename: &str,
        category: AssetCategory,
        is_intermediate: bool,
    ) -> Result<AssetRecord, AssetError> {
        let decoded = image::load_from_memory(data)
            .map_err(|e| AssetError::Decode(e.to_string()))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        // Sanitize the advisory name and suffix it for uniqueness
        let stem: String = filename
            .trim_end_matches(".png")
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let short_id = Uuid::new_v4().to_string();
        let name = format!("{}-{}.png", stem, &short_id[..8]);
        fs::write(self.root.join(&name), data)?;
        let record = AssetRecord {
            name: name.clone(),
            category,
            width,
            height,
            is_intermediate,
        };
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index.insert(name, record.clone());
        self.persist_index(&index)?;
        crate::log_info!(
            "asset stored  \"{}\"  {}x{} ({})",
            record.name,
            record.width,
            record.height,
            record.category.as_str()
        );
        Ok(record)
    }

    fn get_image_record(&self, name: &str) -> Option<AssetRecord> {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}
