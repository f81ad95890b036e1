//! The reconciliation engine.
//!
//! [`SceneManager`] is the sole owner of the previous-snapshot cell, the
//! adapter registries, and the stage.  Every state notification lands in
//! [`reconcile`](SceneManager::reconcile), which compares the new snapshot
//! against the previous one — reference comparisons per sub-structure, never
//! deep equality — and applies the minimal set of adapter creations, updates,
//! and destructions, then reassigns draw order wholesale.
//!
//! Each collection block carries its own dependency set because the
//! sub-structures change at wildly different rates: tool state changes every
//! few events, the layer list changes rarely.  One global dirty flag would
//! re-render every category on every tool tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use image::RgbaImage;
use kurbo::{Point, Rect, Size, Vec2};
use serde_json::{Value, json};

use crate::adapters::{
    AdapterRole, BackgroundAdapter, BboxOverlay, EntityAdapter, StagingAdapter, UpdateContext,
};
use crate::assets::{AssetCategory, AssetError, AssetRecord, AssetStore};
use crate::stage::Stage;
use crate::state::{AppState, EntityCategory, EntityId, EntityIdentifier, PixelRect, ToolKind};
use crate::view::ViewState;
use crate::worker::WorkerProxy;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum ExportError {
    Asset(AssetError),
    Encode(String),
    /// An id was found but belongs to another category — a caller-side logic
    /// error, reported loudly instead of degrading.
    WrongCategory {
        id: EntityId,
        expected: EntityCategory,
        actual: EntityCategory,
    },
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Asset(e) => write!(f, "{}", e),
            ExportError::Encode(e) => write!(f, "image encode failed: {}", e),
            ExportError::WrongCategory {
                id,
                expected,
                actual,
            } => write!(
                f,
                "entity {} is a {}, expected a {}",
                id,
                actual.as_str(),
                expected.as_str()
            ),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<AssetError> for ExportError {
    fn from(e: AssetError) -> Self {
        ExportError::Asset(e)
    }
}

// ============================================================================
// READ MODEL & PASS ACCOUNTING
// ============================================================================

/// Derived values the UI layer reads back, republished every non-skipped
/// pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadModel {
    pub tool: ToolKind,
    pub fill_color: [u8; 4],
    pub selection: Option<EntityIdentifier>,
    /// Whether the selected id currently has a live adapter.
    pub selection_live: bool,
}

impl Default for ReadModel {
    fn default() -> Self {
        Self {
            tool: ToolKind::Brush,
            fill_color: [0, 0, 0, 255],
            selection: None,
            selection_live: false,
        }
    }
}

/// What the last reconciliation pass actually did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// True when the pass was the redundant-notification fast path.
    pub skipped: bool,
    pub created: usize,
    pub updated: usize,
    pub destroyed: usize,
    /// Per-entity update failures, logged and survived.
    pub failed: usize,
}

// ============================================================================
// THE MANAGER
// ============================================================================

pub struct SceneManager {
    stage: Stage,
    view: ViewState,
    worker: WorkerProxy,

    layer_adapters: HashMap<EntityId, EntityAdapter>,
    region_adapters: HashMap<EntityId, EntityAdapter>,
    control_adapters: HashMap<EntityId, EntityAdapter>,
    inpaint_adapter: Option<EntityAdapter>,

    background: BackgroundAdapter,
    staging: StagingAdapter,
    bbox_overlay: BboxOverlay,

    /// Previous snapshot: single-writer cell, replaced atomically at the end
    /// of every successful pass.  Seeded at construction, which is why the
    /// first pass must treat everything as dirty.
    prev: Arc<AppState>,
    primed: bool,

    read_model: ReadModel,
    last_pass: PassSummary,
}

impl SceneManager {
    /// `stage_size` bounds the composite output; `viewport` seeds the view
    /// transform.  The initial snapshot becomes the previous-snapshot
    /// baseline — it is NOT reconciled here, the first `reconcile` call is.
    pub fn new(initial: &Arc<AppState>, stage_size: (u32, u32), viewport: Size) -> Self {
        let mut stage = Stage::new(stage_size.0, stage_size.1);
        let background = BackgroundAdapter::new(&mut stage);
        let staging = StagingAdapter::new(&mut stage);
        let bbox_overlay = BboxOverlay::new(&mut stage);
        crate::log_info!(
            "scene manager up, stage {}x{}",
            stage_size.0,
            stage_size.1
        );
        Self {
            stage,
            view: ViewState::new(viewport),
            worker: WorkerProxy::spawn(),
            layer_adapters: HashMap::new(),
            region_adapters: HashMap::new(),
            control_adapters: HashMap::new(),
            inpaint_adapter: None,
            background,
            staging,
            bbox_overlay,
            prev: Arc::clone(initial),
            primed: false,
            read_model: ReadModel::default(),
            last_pass: PassSummary::default(),
        }
    }

    // ---- accessors ---------------------------------------------------------

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn read_model(&self) -> &ReadModel {
        &self.read_model
    }

    pub fn last_pass(&self) -> PassSummary {
        self.last_pass
    }

    pub fn worker_pending(&self) -> usize {
        self.worker.pending_len()
    }

    pub fn log_context(&self) -> Value {
        json!({ "component": "scene_manager", "nodes": self.stage.node_count() })
    }

    /// Live adapter ids for one category.  After any pass this equals the
    /// id set of the corresponding state collection.
    pub fn live_ids(&self, category: EntityCategory) -> HashSet<EntityId> {
        match category {
            EntityCategory::DrawableLayer => self.layer_adapters.keys().cloned().collect(),
            EntityCategory::MaskRegion => self.region_adapters.keys().cloned().collect(),
            EntityCategory::ControlAdapter => self.control_adapters.keys().cloned().collect(),
            EntityCategory::InpaintMask => self
                .inpaint_adapter
                .iter()
                .map(|a| a.entity_id().clone())
                .collect(),
        }
    }

    /// Find an adapter by id across every category.  Missing ids are `None`.
    pub fn find_adapter(&self, id: &EntityId) -> Option<(&EntityAdapter, EntityCategory)> {
        if let Some(a) = self.layer_adapters.get(id) {
            return Some((a, EntityCategory::DrawableLayer));
        }
        if let Some(a) = self.region_adapters.get(id) {
            return Some((a, EntityCategory::MaskRegion));
        }
        if let Some(a) = self.control_adapters.get(id) {
            return Some((a, EntityCategory::ControlAdapter));
        }
        if let Some(a) = &self.inpaint_adapter
            && a.entity_id() == id
        {
            return Some((a, EntityCategory::InpaintMask));
        }
        None
    }

    /// Last worker-computed extents for an entity, if any.
    pub fn cached_extents(&self, id: &EntityId) -> Option<PixelRect> {
        self.find_adapter(id).and_then(|(a, _)| a.cached_extents())
    }

    pub fn extents_pending(&self, id: &EntityId) -> bool {
        self.find_adapter(id)
            .is_some_and(|(a, _)| a.extents_pending())
    }

    /// A region adapter by id.  A missing id is `Ok(None)`; an id that
    /// belongs to another category is a loud error.
    pub fn region_adapter(&self, id: &EntityId) -> Result<Option<&EntityAdapter>, ExportError> {
        match self.find_adapter(id) {
            Some((a, EntityCategory::MaskRegion)) => Ok(Some(a)),
            Some((_, actual)) => Err(ExportError::WrongCategory {
                id: id.clone(),
                expected: EntityCategory::MaskRegion,
                actual,
            }),
            None => Ok(None),
        }
    }

    // ---- view operations ---------------------------------------------------

    pub fn set_viewport_size(&mut self, viewport: Size) {
        self.view.set_viewport_size(viewport);
    }

    pub fn set_view_scale(&mut self, scale: f64, pivot: Point) {
        self.view.set_scale(scale, pivot);
    }

    pub fn pan_by(&mut self, delta: Vec2) {
        self.view.pan_by(delta);
    }

    /// Fit the whole stage rect in the viewport and center it.
    pub fn reset_view(&mut self) {
        let content = Rect::new(
            0.0,
            0.0,
            self.stage.width() as f64,
            self.stage.height() as f64,
        );
        self.view.reset_view(content);
    }

    // ---- worker ------------------------------------------------------------

    /// Drain worker responses, resolving extent callbacks.  Call from the
    /// host's event loop tick.
    pub fn pump_worker(&mut self) {
        self.worker.pump();
    }

    // ---- reconciliation ----------------------------------------------------

    /// One reconciliation pass.  Failures inside a single entity's update are
    /// logged and survived — they never abort the rest of the pass, so the
    /// registry id-set invariant and the commit both still happen.
    pub fn reconcile(&mut self, new: &Arc<AppState>) {
        // Redundant-notification fast path.  The store may emit the same
        // snapshot more than once; only the very first pass ignores equality.
        if self.primed && Arc::ptr_eq(new, &self.prev) {
            self.last_pass = PassSummary {
                skipped: true,
                ..PassSummary::default()
            };
            return;
        }
        let first = !self.primed;
        let prev = Arc::clone(&self.prev);
        let mut summary = PassSummary::default();

        let layers_changed = !Arc::ptr_eq(&new.layers, &prev.layers);
        let regions_changed = !Arc::ptr_eq(&new.regions, &prev.regions);
        let controls_changed = !Arc::ptr_eq(&new.control_adapters, &prev.control_adapters);
        let inpaint_changed = !Arc::ptr_eq(&new.inpaint_mask, &prev.inpaint_mask);
        let tool_changed = !Arc::ptr_eq(&new.tool, &prev.tool);
        let settings_changed = !Arc::ptr_eq(&new.settings, &prev.settings);
        let selection_changed = new.selected_entity != prev.selected_entity;

        // Per-block dependency sets: tool and selection feed every entity
        // block (they affect visual state); mask opacity additionally feeds
        // the mask-shaped blocks.
        if first || layers_changed || tool_changed || selection_changed {
            self.reconcile_layers(new, &mut summary);
        }
        if first || regions_changed || settings_changed || tool_changed || selection_changed {
            self.reconcile_regions(new, &mut summary);
        }
        if first || controls_changed || selection_changed {
            self.reconcile_controls(new, &mut summary);
        }
        if first || inpaint_changed || settings_changed || tool_changed || selection_changed {
            self.reconcile_inpaint(new, &mut summary);
        }

        // Cheap, so published unconditionally on every non-skipped pass.
        self.publish_read_model(new);

        if first || !Arc::ptr_eq(&new.bbox, &prev.bbox) || tool_changed {
            self.bbox_overlay.update(&mut self.stage, &new.bbox, &new.tool);
        }
        if first || !Arc::ptr_eq(&new.session, &prev.session) {
            if let Err(e) = self.staging.update(&mut self.stage, &new.session) {
                summary.failed += 1;
                crate::logger::write_with(
                    "ERROR",
                    &format!("staging update failed: {}", e),
                    &self.staging.log_context(),
                );
            }
        }
        if first
            || layers_changed
            || controls_changed
            || regions_changed
            || inpaint_changed
            || selection_changed
        {
            self.update_draw_order(new);
        }

        // Commit: the previous-snapshot cell is replaced exactly once per
        // pass, after everything else succeeded or was survived.
        self.prev = Arc::clone(new);
        self.primed = true;
        self.last_pass = summary;
        crate::log_info!(
            "reconcile pass: {} created, {} updated, {} destroyed, {} failed",
            summary.created,
            summary.updated,
            summary.destroyed,
            summary.failed
        );
    }

    fn selected_id(new: &AppState) -> Option<&EntityId> {
        new.selected_entity.as_ref().map(|sel| &sel.id)
    }

    fn reconcile_layers(&mut self, new: &AppState, summary: &mut PassSummary) {
        // Destroy before create, so a vanished id can never coexist with a
        // new node inside the same pass.
        let keep: HashSet<&EntityId> = new.layers.iter().map(|l| &l.id).collect();
        let removed: Vec<EntityId> = self
            .layer_adapters
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            if let Some(mut adapter) = self.layer_adapters.remove(id) {
                adapter.destroy(&mut self.stage);
                summary.destroyed += 1;
            }
        }

        let selected = Self::selected_id(new);
        let stage = &mut self.stage;
        let worker = &mut self.worker;
        let adapters = &mut self.layer_adapters;
        for layer in new.layers.iter() {
            let created = !adapters.contains_key(&layer.id);
            let adapter = adapters
                .entry(layer.id.clone())
                .or_insert_with(|| EntityAdapter::for_layer(stage, layer));
            if created {
                summary.created += 1;
            }
            let mut ctx = UpdateContext {
                tool: &new.tool,
                is_selected: selected == Some(&layer.id),
                mask_opacity: new.settings.mask_opacity,
                worker: &mut *worker,
            };
            match adapter.update_layer(stage, layer, &mut ctx) {
                Ok(()) => summary.updated += 1,
                Err(e) => {
                    summary.failed += 1;
                    crate::logger::write_with(
                        "ERROR",
                        &format!("layer update failed: {}", e),
                        &adapter.log_context(),
                    );
                }
            }
        }
    }

    fn reconcile_regions(&mut self, new: &AppState, summary: &mut PassSummary) {
        let keep: HashSet<&EntityId> = new.regions.iter().map(|r| &r.id).collect();
        let removed: Vec<EntityId> = self
            .region_adapters
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            if let Some(mut adapter) = self.region_adapters.remove(id) {
                adapter.destroy(&mut self.stage);
                summary.destroyed += 1;
            }
        }

        let selected = Self::selected_id(new);
        let stage = &mut self.stage;
        let worker = &mut self.worker;
        let adapters = &mut self.region_adapters;
        for region in new.regions.iter() {
            let created = !adapters.contains_key(&region.id);
            let adapter = adapters.entry(region.id.clone()).or_insert_with(|| {
                EntityAdapter::for_region(stage, region, AdapterRole::RegionMask)
            });
            if created {
                summary.created += 1;
            }
            let mut ctx = UpdateContext {
                tool: &new.tool,
                is_selected: selected == Some(&region.id),
                mask_opacity: new.settings.mask_opacity,
                worker: &mut *worker,
            };
            match adapter.update_region(stage, region, &mut ctx) {
                Ok(()) => summary.updated += 1,
                Err(e) => {
                    summary.failed += 1;
                    crate::logger::write_with(
                        "ERROR",
                        &format!("region update failed: {}", e),
                        &adapter.log_context(),
                    );
                }
            }
        }
    }

    fn reconcile_controls(&mut self, new: &AppState, summary: &mut PassSummary) {
        let keep: HashSet<&EntityId> = new.control_adapters.iter().map(|c| &c.id).collect();
        let removed: Vec<EntityId> = self
            .control_adapters
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            if let Some(mut adapter) = self.control_adapters.remove(id) {
                adapter.destroy(&mut self.stage);
                summary.destroyed += 1;
            }
        }

        let selected = Self::selected_id(new);
        let stage = &mut self.stage;
        let worker = &mut self.worker;
        let adapters = &mut self.control_adapters;
        for control in new.control_adapters.iter() {
            let created = !adapters.contains_key(&control.id);
            let adapter = adapters
                .entry(control.id.clone())
                .or_insert_with(|| EntityAdapter::for_control(stage, control));
            if created {
                summary.created += 1;
            }
            let mut ctx = UpdateContext {
                tool: &new.tool,
                is_selected: selected == Some(&control.id),
                mask_opacity: new.settings.mask_opacity,
                worker: &mut *worker,
            };
            match adapter.update_control(stage, control, &mut ctx) {
                Ok(()) => summary.updated += 1,
                Err(e) => {
                    summary.failed += 1;
                    crate::logger::write_with(
                        "ERROR",
                        &format!("control update failed: {}", e),
                        &adapter.log_context(),
                    );
                }
            }
        }
    }

    fn reconcile_inpaint(&mut self, new: &AppState, summary: &mut PassSummary) {
        let state = &*new.inpaint_mask;
        // A new document swaps the singleton's id; the old adapter is
        // terminal and gets replaced wholesale.
        let stale = self
            .inpaint_adapter
            .as_ref()
            .is_some_and(|a| a.entity_id() != &state.id);
        if stale && let Some(mut old) = self.inpaint_adapter.take() {
            old.destroy(&mut self.stage);
            summary.destroyed += 1;
        }
        if self.inpaint_adapter.is_none() {
            summary.created += 1;
            let adapter =
                EntityAdapter::for_region(&mut self.stage, state, AdapterRole::InpaintMask);
            self.inpaint_adapter = Some(adapter);
        }
        let stage = &mut self.stage;
        let worker = &mut self.worker;
        let Some(adapter) = self.inpaint_adapter.as_mut() else {
            return;
        };
        let is_selected = new
            .selected_entity
            .as_ref()
            .is_some_and(|sel| sel.category == EntityCategory::InpaintMask && sel.id == state.id);
        let mut ctx = UpdateContext {
            tool: &new.tool,
            is_selected,
            mask_opacity: new.settings.mask_opacity,
            worker: &mut *worker,
        };
        match adapter.update_region(stage, state, &mut ctx) {
            Ok(()) => summary.updated += 1,
            Err(e) => {
                summary.failed += 1;
                crate::logger::write_with(
                    "ERROR",
                    &format!("inpaint mask update failed: {}", e),
                    &adapter.log_context(),
                );
            }
        }
    }

    fn publish_read_model(&mut self, new: &AppState) {
        let selection_live = new.selected_entity.as_ref().is_some_and(|sel| {
            match sel.category {
                EntityCategory::DrawableLayer => self.layer_adapters.contains_key(&sel.id),
                EntityCategory::MaskRegion => self.region_adapters.contains_key(&sel.id),
                EntityCategory::ControlAdapter => self.control_adapters.contains_key(&sel.id),
                EntityCategory::InpaintMask => self
                    .inpaint_adapter
                    .as_ref()
                    .is_some_and(|a| a.entity_id() == &sel.id),
            }
        });
        self.read_model = ReadModel {
            tool: new.tool.tool,
            fill_color: new.tool.fill_color,
            selection: new.selected_entity.clone(),
            selection_live,
        };
    }

    /// Wholesale draw-order assignment: fixed category precedence, back to
    /// front, strictly increasing z from 1.  Within a category, order
    /// follows the state collection.  Recomputing everything is cheap
    /// relative to render cost and immune to incremental-reorder bugs.
    fn update_draw_order(&mut self, new: &AppState) {
        let mut z: u32 = 1;
        self.stage.set_z_index(self.background.node(), z);
        z += 1;
        for layer in new.layers.iter() {
            if let Some(adapter) = self.layer_adapters.get(&layer.id) {
                self.stage.set_z_index(adapter.node(), z);
                z += 1;
            }
        }
        for control in new.control_adapters.iter() {
            if let Some(adapter) = self.control_adapters.get(&control.id) {
                self.stage.set_z_index(adapter.node(), z);
                z += 1;
            }
        }
        for region in new.regions.iter() {
            if let Some(adapter) = self.region_adapters.get(&region.id) {
                self.stage.set_z_index(adapter.node(), z);
                z += 1;
            }
        }
        if let Some(adapter) = &self.inpaint_adapter {
            self.stage.set_z_index(adapter.node(), z);
            z += 1;
        }
        self.stage.set_z_index(self.staging.node(), z);
        z += 1;
        self.stage.set_z_index(self.bbox_overlay.node(), z);
    }

    // ---- exports -----------------------------------------------------------

    /// Flatten the drawable layers and upload the PNG.  Overlays, masks, and
    /// the checkerboard backdrop are not part of a composite export.
    pub fn export_composite(
        &self,
        store: &dyn AssetStore,
        filename: &str,
        is_intermediate: bool,
    ) -> Result<AssetRecord, ExportError> {
        let layer_nodes: HashSet<u64> =
            self.layer_adapters.values().map(|a| a.node()).collect();
        let composite = self
            .stage
            .render_composite_where(|node| layer_nodes.contains(&node.id));
        let bytes = encode_png(&composite)?;
        Ok(store.upload_image(&bytes, filename, AssetCategory::General, is_intermediate)?)
    }

    /// Upload one region's mask pixels.  Returns `Ok(None)` when the id has
    /// no live adapter; ids from another category fail loudly.
    pub fn export_region_mask(
        &self,
        store: &dyn AssetStore,
        id: &EntityId,
        filename: &str,
    ) -> Result<Option<AssetRecord>, ExportError> {
        let Some(adapter) = self.region_adapter(id)? else {
            crate::log_warn!("export_region_mask: no live region for {}", id);
            return Ok(None);
        };
        let Some(node) = self.stage.node(adapter.node()) else {
            crate::log_warn!("export_region_mask: node detached for {}", id);
            return Ok(None);
        };
        let bytes = encode_png(&node.surface.to_rgba_image())?;
        Ok(Some(store.upload_image(
            &bytes,
            filename,
            AssetCategory::Mask,
            true,
        )?))
    }

    // ---- teardown ----------------------------------------------------------

    /// Explicit teardown: every live adapter (collection members and
    /// singletons) is destroyed and the worker is detached.
    pub fn destroy(&mut self) {
        for (_, mut adapter) in self.layer_adapters.drain() {
            adapter.destroy(&mut self.stage);
        }
        for (_, mut adapter) in self.region_adapters.drain() {
            adapter.destroy(&mut self.stage);
        }
        for (_, mut adapter) in self.control_adapters.drain() {
            adapter.destroy(&mut self.stage);
        }
        if let Some(mut adapter) = self.inpaint_adapter.take() {
            adapter.destroy(&mut self.stage);
        }
        self.staging.destroy(&mut self.stage);
        self.bbox_overlay.destroy(&mut self.stage);
        self.background.destroy(&mut self.stage);
        self.worker.detach();
        crate::log_info!("scene manager torn down");
    }
}

fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, ExportError> {
    let mut bytes = Vec::new();
    img.write_to(
        &mut std::io::Cursor::new(&mut bytes),
        image::ImageOutputFormat::Png,
    )
    .map_err(|e| ExportError::Encode(e.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        ContentSource, DrawableLayerState, MaskRegionState, Settings, ToolState,
    };

    fn fill(w: u32, h: u32) -> ContentSource {
        ContentSource::Fill {
            color: [40, 40, 40, 255],
            width: w,
            height: h,
        }
    }

    fn manager(initial: &Arc<AppState>) -> SceneManager {
        SceneManager::new(initial, (64, 64), Size::new(800.0, 600.0))
    }

    fn node_z(mgr: &SceneManager, id: &EntityId) -> u32 {
        let (adapter, _) = mgr.find_adapter(id).expect("adapter must exist");
        mgr.stage().node(adapter.node()).expect("node must exist").z_index
    }

    #[test]
    fn first_pass_is_always_dirty_even_for_the_baseline_snapshot() {
        let initial = Arc::new(
            AppState::new().with_layers(vec![DrawableLayerState::new("L1", fill(8, 8))]),
        );
        let mut mgr = manager(&initial);
        // Same Arc as the construction baseline: still a full pass.
        mgr.reconcile(&initial);
        let pass = mgr.last_pass();
        assert!(!pass.skipped);
        assert_eq!(pass.created, 2, "layer adapter + inpaint singleton");
        assert_eq!(pass.updated, 2);
        assert_eq!(pass.failed, 0);
    }

    #[test]
    fn redundant_snapshot_is_a_no_op_after_first_pass() {
        let s1 = Arc::new(
            AppState::new().with_layers(vec![DrawableLayerState::new("L1", fill(8, 8))]),
        );
        let mut mgr = manager(&s1);
        mgr.reconcile(&s1);
        // Exact same Arc: fast path.
        mgr.reconcile(&s1);
        assert!(mgr.last_pass().skipped);
        // New Arc, every sub-structure shared: pass runs but touches nothing.
        let s2 = Arc::new((*s1).clone());
        mgr.reconcile(&s2);
        let pass = mgr.last_pass();
        assert!(!pass.skipped);
        assert_eq!(
            (pass.created, pass.updated, pass.destroyed),
            (0, 0, 0),
            "no sub-collection changed by reference, so no adapter work"
        );
    }

    #[test]
    fn adapter_id_sets_match_state_collections_after_every_pass() {
        let l1 = DrawableLayerState::new("L1", fill(4, 4));
        let l2 = DrawableLayerState::new("L2", fill(4, 4));
        let r1 = MaskRegionState::new("R1", fill(4, 4));
        let s1 = Arc::new(
            AppState::new()
                .with_layers(vec![l1.clone(), l2.clone()])
                .with_regions(vec![r1.clone()]),
        );
        let mut mgr = manager(&s1);
        mgr.reconcile(&s1);
        assert_eq!(
            mgr.live_ids(EntityCategory::DrawableLayer),
            HashSet::from([l1.id.clone(), l2.id.clone()])
        );
        assert_eq!(
            mgr.live_ids(EntityCategory::MaskRegion),
            HashSet::from([r1.id.clone()])
        );

        let s2 = Arc::new(s1.with_layers(vec![l2.clone()]));
        mgr.reconcile(&s2);
        assert_eq!(mgr.last_pass().destroyed, 1);
        assert_eq!(
            mgr.live_ids(EntityCategory::DrawableLayer),
            HashSet::from([l2.id.clone()])
        );
        assert_eq!(
            mgr.live_ids(EntityCategory::MaskRegion),
            HashSet::from([r1.id.clone()]),
            "untouched categories keep their adapters"
        );
    }

    #[test]
    fn adding_a_layer_creates_exactly_one_adapter_and_orders_it_above() {
        let l1 = DrawableLayerState::new("L1", fill(4, 4));
        let s1 = Arc::new(AppState::new().with_layers(vec![l1.clone()]));
        let mut mgr = manager(&s1);
        mgr.reconcile(&s1);

        let l2 = DrawableLayerState::new("L2", fill(4, 4));
        let s2 = Arc::new(s1.with_layers(vec![l1.clone(), l2.clone()]));
        mgr.reconcile(&s2);
        let pass = mgr.last_pass();
        assert_eq!(pass.created, 1, "only L2 is new");
        assert_eq!(pass.updated, 2, "L1's existing adapter is updated too");
        assert_eq!(pass.destroyed, 0);
        assert!(
            node_z(&mgr, &l1.id) < node_z(&mgr, &l2.id),
            "collection order is draw order within the category"
        );
    }

    #[test]
    fn draw_order_is_strictly_increasing_across_fixed_precedence() {
        let l1 = DrawableLayerState::new("L1", fill(4, 4));
        let l2 = DrawableLayerState::new("L2", fill(4, 4));
        let c1 = crate::state::ControlAdapterState::new(fill(4, 4));
        let r1 = MaskRegionState::new("R1", fill(4, 4));
        let r2 = MaskRegionState::new("R2", fill(4, 4));
        let s1 = Arc::new(
            AppState::new()
                .with_layers(vec![l1.clone(), l2.clone()])
                .with_control_adapters(vec![c1.clone()])
                .with_regions(vec![r1.clone(), r2.clone()]),
        );
        let mut mgr = manager(&s1);
        mgr.reconcile(&s1);

        let zs: Vec<u32> = vec![
            node_z(&mgr, &l1.id),
            node_z(&mgr, &l2.id),
            node_z(&mgr, &c1.id),
            node_z(&mgr, &r1.id),
            node_z(&mgr, &r2.id),
        ];
        for pair in zs.windows(2) {
            assert!(
                pair[0] < pair[1],
                "z must strictly increase through layers < controls < regions: {:?}",
                zs
            );
        }
        assert!(zs[0] >= 2, "background sits below every entity");
        let inpaint_id = s1.inpaint_mask.id.clone();
        assert!(
            node_z(&mgr, &inpaint_id) > zs[4],
            "inpaint mask sits above regions"
        );

        // Re-running with unchanged category order must reproduce the exact
        // same assignment.  Selection is in every block's dependency set, so
        // it re-triggers the draw-order step without changing any order.
        let s2 = Arc::new(s1.with_selection(Some(EntityIdentifier {
            id: l1.id.clone(),
            category: EntityCategory::DrawableLayer,
        })));
        mgr.reconcile(&s2);
        let zs2: Vec<u32> = vec![
            node_z(&mgr, &l1.id),
            node_z(&mgr, &l2.id),
            node_z(&mgr, &c1.id),
            node_z(&mgr, &r1.id),
            node_z(&mgr, &r2.id),
        ];
        assert_eq!(zs, zs2, "identical order must yield identical z-indices");
    }

    #[test]
    fn mask_opacity_change_updates_mask_shaped_adapters_only() {
        let r1 = MaskRegionState::new("R1", fill(4, 4));
        let r2 = MaskRegionState::new("R2", fill(4, 4));
        let l1 = DrawableLayerState::new("L1", fill(4, 4));
        let s1 = Arc::new(
            AppState::new()
                .with_layers(vec![l1.clone()])
                .with_regions(vec![r1.clone(), r2.clone()]),
        );
        let mut mgr = manager(&s1);
        mgr.reconcile(&s1);

        let s2 = Arc::new(s1.with_settings(Settings { mask_opacity: 0.8 }));
        mgr.reconcile(&s2);
        let pass = mgr.last_pass();
        assert_eq!(pass.created, 0);
        assert_eq!(pass.destroyed, 0);
        assert_eq!(
            pass.updated, 3,
            "both regions and the inpaint singleton update; the layer block does not run"
        );
    }

    #[test]
    fn removed_then_readded_id_gets_a_brand_new_adapter() {
        let mut l1 = DrawableLayerState::new("L1", fill(4, 4));
        l1.id = EntityId::from_raw("mask-mask-1");
        let s1 = Arc::new(AppState::new().with_layers(vec![l1.clone()]));
        let mut mgr = manager(&s1);
        mgr.reconcile(&s1);
        let first_node = mgr.find_adapter(&l1.id).unwrap().0.node();

        let s2 = Arc::new(s1.with_layers(Vec::new()));
        mgr.reconcile(&s2);
        assert!(mgr.find_adapter(&l1.id).is_none());

        let s3 = Arc::new(s2.with_layers(vec![l1.clone()]));
        mgr.reconcile(&s3);
        let second_node = mgr.find_adapter(&l1.id).unwrap().0.node();
        assert_ne!(
            first_node, second_node,
            "a re-appearing id must get a distinct adapter instance"
        );
    }

    #[test]
    fn read_model_tracks_tool_selection_and_liveness() {
        let l1 = DrawableLayerState::new("L1", fill(4, 4));
        let sel = EntityIdentifier {
            id: l1.id.clone(),
            category: EntityCategory::DrawableLayer,
        };
        let s1 = Arc::new(
            AppState::new()
                .with_layers(vec![l1.clone()])
                .with_selection(Some(sel.clone())),
        );
        let mut mgr = manager(&s1);
        mgr.reconcile(&s1);
        assert_eq!(mgr.read_model().selection, Some(sel.clone()));
        assert!(mgr.read_model().selection_live);

        // Layer vanishes but the selection id lingers: handle goes dead.
        let s2 = Arc::new(s1.with_layers(Vec::new()));
        mgr.reconcile(&s2);
        assert!(!mgr.read_model().selection_live);

        let mut tool = ToolState::default();
        tool.tool = ToolKind::Eraser;
        tool.fill_color = [9, 9, 9, 255];
        let s3 = Arc::new(s2.with_tool(tool));
        mgr.reconcile(&s3);
        assert_eq!(mgr.read_model().tool, ToolKind::Eraser);
        assert_eq!(mgr.read_model().fill_color, [9, 9, 9, 255]);
    }

    #[test]
    fn region_lookup_asserts_category() {
        let l1 = DrawableLayerState::new("L1", fill(4, 4));
        let r1 = MaskRegionState::new("R1", fill(4, 4));
        let s1 = Arc::new(
            AppState::new()
                .with_layers(vec![l1.clone()])
                .with_regions(vec![r1.clone()]),
        );
        let mut mgr = manager(&s1);
        mgr.reconcile(&s1);

        assert!(mgr.region_adapter(&r1.id).unwrap().is_some());
        assert!(
            mgr.region_adapter(&EntityId::from_raw("region-gone"))
                .unwrap()
                .is_none(),
            "a missing id degrades to None"
        );
        match mgr.region_adapter(&l1.id) {
            Err(ExportError::WrongCategory { actual, .. }) => {
                assert_eq!(actual, EntityCategory::DrawableLayer);
            }
            other => panic!("layer id must fail loudly, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn teardown_destroys_every_live_adapter() {
        let s1 = Arc::new(
            AppState::new()
                .with_layers(vec![DrawableLayerState::new("L1", fill(4, 4))])
                .with_regions(vec![MaskRegionState::new("R1", fill(4, 4))]),
        );
        let mut mgr = manager(&s1);
        mgr.reconcile(&s1);
        assert!(mgr.stage().node_count() > 3);
        mgr.destroy();
        assert_eq!(mgr.stage().node_count(), 0);
    }
}
