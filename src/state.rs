//! Immutable application-state snapshots.
//!
//! The upstream store keeps every independently-changing sub-structure behind
//! its own `Arc`, so producing a new snapshot after an edit is reference-count
//! bumps plus one rebuilt sub-structure.  The reconciliation engine relies on
//! this copy-on-write discipline: a sub-collection's `Arc` pointer changes if
//! and only if its logical contents changed, which makes "did this collection
//! change" an O(1) pointer comparison.  Nothing in this crate deep-compares
//! snapshots.

use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ENTITY IDENTITY
// ============================================================================

/// Stable, globally unique entity id.  Ids are minted once per logical entity
/// and never recycled; an id that disappears from state and later reappears
/// denotes the *same* logical entity, but still gets a brand-new adapter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    /// Mint a fresh id with a category prefix, e.g. `layer-3f2a…`.
    pub fn mint(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    /// Wrap an id that already exists upstream.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The category an entity belongs to.  Each category has its own state
/// collection and its own adapter registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityCategory {
    DrawableLayer,
    MaskRegion,
    ControlAdapter,
    InpaintMask,
}

impl EntityCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityCategory::DrawableLayer => "drawable_layer",
            EntityCategory::MaskRegion => "mask_region",
            EntityCategory::ControlAdapter => "control_adapter",
            EntityCategory::InpaintMask => "inpaint_mask",
        }
    }
}

/// (id, category) pair naming the currently selected entity, if any.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityIdentifier {
    pub id: EntityId,
    pub category: EntityCategory,
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// Integer rectangle in pixel space.  Used for the generation bounding box
/// and for extents computed by the background worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

// ============================================================================
// ENTITY CONTENT
// ============================================================================

/// What an entity draws.  Raster content is shared behind `Arc` so cloning a
/// snapshot never copies pixels; the `revision` counter on the owning entity
/// state is what renderers use to decide whether pixels actually changed.
#[derive(Clone, Debug)]
pub enum ContentSource {
    /// Flat RGBA buffer positioned at the entity origin.
    Raster(Arc<RgbaImage>),
    /// Solid fill over a w×h extent.
    Fill {
        color: [u8; 4],
        width: u32,
        height: u32,
    },
}

impl ContentSource {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ContentSource::Raster(img) => img.dimensions(),
            ContentSource::Fill { width, height, .. } => (*width, *height),
        }
    }
}

// ============================================================================
// PER-ENTITY STATE
// ============================================================================

/// One drawable (raster) layer.
#[derive(Clone, Debug)]
pub struct DrawableLayerState {
    pub id: EntityId,
    pub name: String,
    pub is_enabled: bool,
    pub opacity: f32,
    pub x: i32,
    pub y: i32,
    pub content: ContentSource,
    /// Bumped by the upstream store on every content edit.
    pub revision: u64,
}

impl DrawableLayerState {
    pub fn new(name: impl Into<String>, content: ContentSource) -> Self {
        Self {
            id: EntityId::mint("layer"),
            name: name.into(),
            is_enabled: true,
            opacity: 1.0,
            x: 0,
            y: 0,
            content,
            revision: 0,
        }
    }
}

/// One regional guidance mask.  The mask's pixel coverage comes from
/// `content`; its on-screen color is `fill` tinted at the global mask
/// opacity from [`Settings`].
#[derive(Clone, Debug)]
pub struct MaskRegionState {
    pub id: EntityId,
    pub name: String,
    pub is_enabled: bool,
    /// RGB fill color painted wherever the mask has coverage.
    pub fill: [u8; 3],
    pub x: i32,
    pub y: i32,
    pub content: ContentSource,
    pub revision: u64,
}

impl MaskRegionState {
    pub fn new(name: impl Into<String>, content: ContentSource) -> Self {
        Self {
            id: EntityId::mint("region"),
            name: name.into(),
            is_enabled: true,
            fill: [255, 0, 255],
            x: 0,
            y: 0,
            content,
            revision: 0,
        }
    }

    /// The inpaint mask is the same shape but lives outside the id-keyed
    /// collections, so it gets its own prefix.
    pub fn new_inpaint(content: ContentSource) -> Self {
        let mut mask = Self::new("Inpaint Mask", content);
        mask.id = EntityId::mint("inpaint_mask");
        mask.fill = [255, 122, 0];
        mask
    }
}

/// One control region (structural guidance image).
#[derive(Clone, Debug)]
pub struct ControlAdapterState {
    pub id: EntityId,
    pub is_enabled: bool,
    pub weight: f32,
    pub x: i32,
    pub y: i32,
    pub content: ContentSource,
    pub revision: u64,
}

impl ControlAdapterState {
    pub fn new(content: ContentSource) -> Self {
        Self {
            id: EntityId::mint("control"),
            is_enabled: true,
            weight: 1.0,
            x: 0,
            y: 0,
            content,
            revision: 0,
        }
    }
}

// ============================================================================
// TOOL / SETTINGS / SESSION
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolKind {
    Brush,
    Eraser,
    Rect,
    Move,
    View,
    Bbox,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrushConfig {
    pub size: f32,
    pub color: [u8; 4],
}

impl Default for BrushConfig {
    fn default() -> Self {
        Self {
            size: 50.0,
            color: [0, 0, 0, 255],
        }
    }
}

/// Current tool configuration.  Changes far more often than the entity
/// collections, which is why each reconciliation block declares its own
/// dependency set instead of sharing one dirty flag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub tool: ToolKind,
    pub brush: BrushConfig,
    pub fill_color: [u8; 4],
}

impl Default for ToolState {
    fn default() -> Self {
        Self {
            tool: ToolKind::Brush,
            brush: BrushConfig::default(),
            fill_color: [0, 0, 0, 255],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Opacity applied to every mask-shaped node (regions + inpaint mask).
    pub mask_opacity: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self { mask_opacity: 0.5 }
    }
}

/// Generation bounding box.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BboxState {
    pub rect: PixelRect,
}

impl Default for BboxState {
    fn default() -> Self {
        Self {
            rect: PixelRect::new(0, 0, 512, 512),
        }
    }
}

/// One generated candidate image parked in the staging area.
#[derive(Clone, Debug)]
pub struct StagedImage {
    pub content: ContentSource,
    pub x: i32,
    pub y: i32,
}

/// Staging / generation-in-progress state.
#[derive(Clone, Debug)]
pub struct SessionState {
    pub is_staging: bool,
    pub staged: Vec<StagedImage>,
    pub selected_index: usize,
    pub show_preview: bool,
    /// Bumped by the upstream store on every staging change.
    pub revision: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            is_staging: false,
            staged: Vec::new(),
            selected_index: 0,
            show_preview: true,
            revision: 0,
        }
    }
}

// ============================================================================
// THE SNAPSHOT
// ============================================================================

/// One immutable snapshot of the whole application state.
///
/// Cloning is cheap (every field is an `Arc` or a small value).  The
/// `with_*` constructors produce a new snapshot that shares every untouched
/// sub-structure, which is exactly the upstream store's copy-on-write
/// contract.
#[derive(Clone, Debug)]
pub struct AppState {
    pub layers: Arc<Vec<DrawableLayerState>>,
    pub regions: Arc<Vec<MaskRegionState>>,
    pub control_adapters: Arc<Vec<ControlAdapterState>>,
    pub inpaint_mask: Arc<MaskRegionState>,
    pub selected_entity: Option<EntityIdentifier>,
    pub tool: Arc<ToolState>,
    pub settings: Arc<Settings>,
    pub bbox: Arc<BboxState>,
    pub session: Arc<SessionState>,
}

impl AppState {
    /// Empty document: no entities, an empty inpaint mask, default tool.
    pub fn new() -> Self {
        let inpaint = MaskRegionState::new_inpaint(ContentSource::Fill {
            color: [0, 0, 0, 0],
            width: 0,
            height: 0,
        });
        Self {
            layers: Arc::new(Vec::new()),
            regions: Arc::new(Vec::new()),
            control_adapters: Arc::new(Vec::new()),
            inpaint_mask: Arc::new(inpaint),
            selected_entity: None,
            tool: Arc::new(ToolState::default()),
            settings: Arc::new(Settings::default()),
            bbox: Arc::new(BboxState::default()),
            session: Arc::new(SessionState::default()),
        }
    }

    pub fn with_layers(&self, layers: Vec<DrawableLayerState>) -> Self {
        let mut next = self.clone();
        next.layers = Arc::new(layers);
        next
    }

    pub fn with_regions(&self, regions: Vec<MaskRegionState>) -> Self {
        let mut next = self.clone();
        next.regions = Arc::new(regions);
        next
    }

    pub fn with_control_adapters(&self, controls: Vec<ControlAdapterState>) -> Self {
        let mut next = self.clone();
        next.control_adapters = Arc::new(controls);
        next
    }

    pub fn with_inpaint_mask(&self, mask: MaskRegionState) -> Self {
        let mut next = self.clone();
        next.inpaint_mask = Arc::new(mask);
        next
    }

    pub fn with_selection(&self, selected: Option<EntityIdentifier>) -> Self {
        let mut next = self.clone();
        next.selected_entity = selected;
        next
    }

    pub fn with_tool(&self, tool: ToolState) -> Self {
        let mut next = self.clone();
        next.tool = Arc::new(tool);
        next
    }

    pub fn with_settings(&self, settings: Settings) -> Self {
        let mut next = self.clone();
        next.settings = Arc::new(settings);
        next
    }

    pub fn with_bbox(&self, bbox: BboxState) -> Self {
        let mut next = self.clone();
        next.bbox = Arc::new(bbox);
        next
    }

    pub fn with_session(&self, session: SessionState) -> Self {
        let mut next = self.clone();
        next.session = Arc::new(session);
        next
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
