//! Entity adapters: the stateful bridge between one entity's immutable state
//! and its live scene-graph node.
//!
//! Lifecycle per adapter is `absent → live → destroyed`, and destroyed is
//! terminal — if an id disappears from state and later returns, it gets a
//! brand-new adapter.  `update` is idempotent: the owned renderer tracks the
//! entity's content revision and skips redundant pixel work, so overlapping
//! redundant updates are wasteful at worst, never corrupting.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{Value, json};

use crate::renderer::{
    EntityRenderer, HandleController, RasterRenderer, RenderError, RenderInputs,
    TransformController,
};
use crate::stage::{NodeId, Stage, draw_checkerboard};
use crate::state::{
    BboxState, ContentSource, ControlAdapterState, DrawableLayerState, EntityId, MaskRegionState,
    PixelRect, SessionState, ToolKind, ToolState,
};
use crate::worker::{ExtentOutcome, WorkerProxy};

// ============================================================================
// ROLES & CONTEXT
// ============================================================================

/// Role tag carried by every adapter.  The shape of an adapter's logging
/// context is selected by this tag, never by runtime type inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterRole {
    RasterLayer,
    RegionMask,
    ControlImage,
    InpaintMask,
    Staging,
    Background,
}

impl AdapterRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AdapterRole::RasterLayer => "raster_layer",
            AdapterRole::RegionMask => "region_mask",
            AdapterRole::ControlImage => "control_image",
            AdapterRole::InpaintMask => "inpaint_mask",
            AdapterRole::Staging => "staging",
            AdapterRole::Background => "background",
        }
    }
}

/// Cross-cutting context the engine hands to every adapter update — the
/// "service locator" surface child adapters pull from.
pub struct UpdateContext<'a> {
    pub tool: &'a ToolState,
    pub is_selected: bool,
    /// Opacity applied to mask-shaped nodes.
    pub mask_opacity: f32,
    pub worker: &'a mut WorkerProxy,
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum AdapterError {
    Render(RenderError),
    /// The adapter's scene node vanished from under it.
    NodeDetached(NodeId),
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Render(e) => write!(f, "{}", e),
            AdapterError::NodeDetached(id) => write!(f, "scene node {} is detached", id),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<RenderError> for AdapterError {
    fn from(e: RenderError) -> Self {
        AdapterError::Render(e)
    }
}

// ============================================================================
// ENTITY ADAPTER
// ============================================================================

/// Last extents the worker computed for this entity.  The worker answers
/// asynchronously, so the value lands via a shared cell when the engine
/// pumps the response channel.
#[derive(Default)]
pub struct ExtentCache {
    pub extents: Option<PixelRect>,
    pub pending: bool,
}

struct NodeProps {
    visible: bool,
    opacity: f32,
    x: i32,
    y: i32,
}

/// One live entity: owns a scene node, a renderer, and (for transformable
/// variants) a transform controller.
pub struct EntityAdapter {
    role: AdapterRole,
    entity_id: EntityId,
    node: NodeId,
    renderer: Box<dyn EntityRenderer>,
    transform: Option<Box<dyn TransformController>>,
    extents: Rc<RefCell<ExtentCache>>,
    destroyed: bool,
}

impl EntityAdapter {
    pub fn for_layer(stage: &mut Stage, state: &DrawableLayerState) -> Self {
        Self::attach(
            stage,
            AdapterRole::RasterLayer,
            state.id.clone(),
            &state.content,
            true,
        )
    }

    /// `role` is [`AdapterRole::RegionMask`] for collection members and
    /// [`AdapterRole::InpaintMask`] for the singleton.
    pub fn for_region(stage: &mut Stage, state: &MaskRegionState, role: AdapterRole) -> Self {
        Self::attach(stage, role, state.id.clone(), &state.content, true)
    }

    pub fn for_control(stage: &mut Stage, state: &ControlAdapterState) -> Self {
        Self::attach(
            stage,
            AdapterRole::ControlImage,
            state.id.clone(),
            &state.content,
            false,
        )
    }

    fn attach(
        stage: &mut Stage,
        role: AdapterRole,
        entity_id: EntityId,
        content: &ContentSource,
        transformable: bool,
    ) -> Self {
        let (w, h) = content.dimensions();
        let node = stage.add_node(entity_id.as_str(), w.max(1), h.max(1));
        let adapter = Self {
            role,
            entity_id,
            node,
            renderer: Box::new(RasterRenderer::default()),
            transform: transformable.then(|| {
                Box::new(HandleController::default()) as Box<dyn TransformController>
            }),
            extents: Rc::new(RefCell::new(ExtentCache::default())),
            destroyed: false,
        };
        crate::logger::write_with("INFO", "adapter attached", &adapter.log_context());
        adapter
    }

    pub fn role(&self) -> AdapterRole {
        self.role
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn cached_extents(&self) -> Option<PixelRect> {
        self.extents.borrow().extents
    }

    pub fn extents_pending(&self) -> bool {
        self.extents.borrow().pending
    }

    pub fn update_layer(
        &mut self,
        stage: &mut Stage,
        state: &DrawableLayerState,
        ctx: &mut UpdateContext<'_>,
    ) -> Result<(), AdapterError> {
        self.apply(
            stage,
            NodeProps {
                visible: state.is_enabled,
                opacity: state.opacity.clamp(0.0, 1.0),
                x: state.x,
                y: state.y,
            },
            &state.content,
            state.revision,
            None,
            ctx,
        )
    }

    pub fn update_region(
        &mut self,
        stage: &mut Stage,
        state: &MaskRegionState,
        ctx: &mut UpdateContext<'_>,
    ) -> Result<(), AdapterError> {
        self.apply(
            stage,
            NodeProps {
                visible: state.is_enabled,
                opacity: ctx.mask_opacity.clamp(0.0, 1.0),
                x: state.x,
                y: state.y,
            },
            &state.content,
            state.revision,
            Some(state.fill),
            ctx,
        )
    }

    pub fn update_control(
        &mut self,
        stage: &mut Stage,
        state: &ControlAdapterState,
        ctx: &mut UpdateContext<'_>,
    ) -> Result<(), AdapterError> {
        self.apply(
            stage,
            NodeProps {
                visible: state.is_enabled,
                opacity: state.weight.clamp(0.0, 1.0),
                x: state.x,
                y: state.y,
            },
            &state.content,
            state.revision,
            None,
            ctx,
        )
    }

    fn apply(
        &mut self,
        stage: &mut Stage,
        props: NodeProps,
        content: &ContentSource,
        revision: u64,
        tint: Option<[u8; 3]>,
        ctx: &mut UpdateContext<'_>,
    ) -> Result<(), AdapterError> {
        if self.destroyed {
            return Ok(());
        }
        let buffer = {
            let node = stage
                .node_mut(self.node)
                .ok_or(AdapterError::NodeDetached(self.node))?;
            node.visible = props.visible;
            node.opacity = props.opacity;
            node.x = props.x;
            node.y = props.y;
            // Grow the node surface when the content outgrew it.  A size
            // change always comes with a revision bump upstream, so the
            // renderer redraws into the fresh surface.
            let (cw, ch) = content.dimensions();
            if cw > node.surface.width() || ch > node.surface.height() {
                node.surface.reset_size(cw, ch);
            }
            let changed = self.renderer.render(
                &mut node.surface,
                &RenderInputs {
                    content,
                    revision,
                    tint,
                },
            )?;
            (changed && props.visible).then(|| node.surface.to_rgba_image())
        };
        if let Some(transform) = &mut self.transform {
            transform.sync_position(props.x, props.y);
            // Handles are live only while this entity is selected with the
            // Move tool; anything else cancels an in-progress session.
            if ctx.is_selected && ctx.tool.tool == ToolKind::Move {
                transform.begin();
            } else if transform.is_active() {
                transform.cancel();
            }
        }
        if let Some(buffer) = buffer {
            self.extents.borrow_mut().pending = true;
            let cache = Rc::clone(&self.extents);
            ctx.worker
                .request_extents(buffer, 1, self.entity_id.as_str(), move |outcome| {
                    let mut cache = cache.borrow_mut();
                    cache.pending = false;
                    cache.extents = match outcome {
                        ExtentOutcome::Computed(extents) => extents,
                        ExtentOutcome::TransportFailed => None,
                    };
                });
        }
        Ok(())
    }

    /// Terminal: releases the scene node, the renderer, and the transform
    /// controller.  Safe to call twice.
    pub fn destroy(&mut self, stage: &mut Stage) {
        if self.destroyed {
            return;
        }
        self.renderer.destroy();
        if let Some(transform) = &mut self.transform {
            transform.destroy();
        }
        stage.remove_node(self.node);
        self.destroyed = true;
        crate::logger::write_with("INFO", "adapter destroyed", &self.log_context());
    }

    /// Logging context, shaped by role tag.
    pub fn log_context(&self) -> Value {
        json!({
            "role": self.role.as_str(),
            "entity": self.entity_id.as_str(),
            "node": self.node,
        })
    }
}

// ============================================================================
// SINGLETON ADAPTERS
// ============================================================================

/// Staging/preview overlay: shows the currently selected staged image while
/// a generation session is in progress.
pub struct StagingAdapter {
    node: NodeId,
    renderer: RasterRenderer,
}

impl StagingAdapter {
    pub fn new(stage: &mut Stage) -> Self {
        let node = stage.add_node("staging-preview", 1, 1);
        Self {
            node,
            renderer: RasterRenderer::default(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn update(&mut self, stage: &mut Stage, session: &SessionState) -> Result<(), AdapterError> {
        let node = stage
            .node_mut(self.node)
            .ok_or(AdapterError::NodeDetached(self.node))?;
        let staged = session.staged.get(session.selected_index);
        let visible = session.is_staging && session.show_preview && staged.is_some();
        node.visible = visible;
        if let Some(image) = staged
            && visible
        {
            node.x = image.x;
            node.y = image.y;
            let (w, h) = image.content.dimensions();
            if w > node.surface.width() || h > node.surface.height() {
                node.surface.reset_size(w, h);
            }
            self.renderer.render(
                &mut node.surface,
                &RenderInputs {
                    content: &image.content,
                    revision: session.revision,
                    tint: None,
                },
            )?;
        }
        Ok(())
    }

    pub fn destroy(&mut self, stage: &mut Stage) {
        stage.remove_node(self.node);
    }

    pub fn log_context(&self) -> Value {
        json!({ "role": AdapterRole::Staging.as_str(), "node": self.node })
    }
}

/// Checkerboard backdrop behind every other node, covering the stage rect.
pub struct BackgroundAdapter {
    node: NodeId,
}

impl BackgroundAdapter {
    pub fn new(stage: &mut Stage) -> Self {
        let (w, h) = (stage.width(), stage.height());
        let node = stage.add_node("background", w, h);
        if let Some(n) = stage.node_mut(node) {
            draw_checkerboard(&mut n.surface, w, h);
        }
        Self { node }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn destroy(&mut self, stage: &mut Stage) {
        stage.remove_node(self.node);
    }

    pub fn log_context(&self) -> Value {
        json!({ "role": AdapterRole::Background.as_str(), "node": self.node })
    }
}

/// Generation bounding-box outline, topmost in the preview group.
pub struct BboxOverlay {
    node: NodeId,
    last_key: Option<(PixelRect, ToolKind)>,
}

impl BboxOverlay {
    const STROKE: u32 = 2;

    pub fn new(stage: &mut Stage) -> Self {
        let (w, h) = (stage.width(), stage.height());
        let node = stage.add_node("generation-bbox", w, h);
        Self {
            node,
            last_key: None,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn update(&mut self, stage: &mut Stage, bbox: &BboxState, tool: &ToolState) {
        let key = (bbox.rect, tool.tool);
        if self.last_key == Some(key) {
            return;
        }
        let Some(node) = stage.node_mut(self.node) else {
            return;
        };
        let color = if tool.tool == ToolKind::Bbox {
            image::Rgba([66, 133, 244, 255])
        } else {
            image::Rgba([255, 255, 255, 180])
        };
        node.surface.clear();
        let r = bbox.rect;
        let s = Self::STROKE;
        node.surface.fill_rect(r.x, r.y, r.width, s, color);
        node.surface
            .fill_rect(r.x, r.bottom() - s as i32, r.width, s, color);
        node.surface.fill_rect(r.x, r.y, s, r.height, color);
        node.surface
            .fill_rect(r.right() - s as i32, r.y, s, r.height, color);
        self.last_key = Some(key);
    }

    pub fn destroy(&mut self, stage: &mut Stage) {
        stage.remove_node(self.node);
    }

    pub fn log_context(&self) -> Value {
        json!({ "role": "generation_bbox", "node": self.node })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AppState, Settings};
    use image::Rgba;

    fn fill_content(w: u32, h: u32) -> ContentSource {
        ContentSource::Fill {
            color: [10, 20, 30, 255],
            width: w,
            height: h,
        }
    }

    fn ctx<'a>(tool: &'a ToolState, worker: &'a mut WorkerProxy) -> UpdateContext<'a> {
        UpdateContext {
            tool,
            is_selected: false,
            mask_opacity: Settings::default().mask_opacity,
            worker,
        }
    }

    #[test]
    fn layer_adapter_attach_update_destroy() {
        let mut stage = Stage::new(64, 64);
        let mut worker = WorkerProxy::spawn();
        let tool = ToolState::default();
        let state = DrawableLayerState::new("L", fill_content(8, 8));
        let mut adapter = EntityAdapter::for_layer(&mut stage, &state);
        assert_eq!(stage.node_count(), 1);

        let mut c = ctx(&tool, &mut worker);
        adapter.update_layer(&mut stage, &state, &mut c).unwrap();
        let node = stage.node(adapter.node()).unwrap();
        assert!(node.visible);
        assert_eq!(*node.surface.get_pixel(0, 0), Rgba([10, 20, 30, 255]));

        adapter.destroy(&mut stage);
        assert!(adapter.is_destroyed());
        assert_eq!(stage.node_count(), 0);
        // terminal: a second destroy is a no-op
        adapter.destroy(&mut stage);
    }

    #[test]
    fn region_adapter_tints_and_uses_mask_opacity() {
        let mut stage = Stage::new(64, 64);
        let mut worker = WorkerProxy::spawn();
        let tool = ToolState::default();
        let mut state = MaskRegionState::new("R", fill_content(4, 4));
        state.fill = [200, 0, 0];
        let mut adapter =
            EntityAdapter::for_region(&mut stage, &state, AdapterRole::RegionMask);
        let mut c = ctx(&tool, &mut worker);
        adapter.update_region(&mut stage, &state, &mut c).unwrap();
        let node = stage.node(adapter.node()).unwrap();
        assert_eq!(*node.surface.get_pixel(0, 0), Rgba([200, 0, 0, 255]));
        assert!((node.opacity - Settings::default().mask_opacity).abs() < f32::EPSILON);
    }

    #[test]
    fn adapter_grows_surface_with_content() {
        let mut stage = Stage::new(64, 64);
        let mut worker = WorkerProxy::spawn();
        let tool = ToolState::default();
        let mut state = DrawableLayerState::new("L", fill_content(4, 4));
        let mut adapter = EntityAdapter::for_layer(&mut stage, &state);
        let mut c = ctx(&tool, &mut worker);
        adapter.update_layer(&mut stage, &state, &mut c).unwrap();

        state.content = fill_content(32, 32);
        state.revision += 1;
        let mut c = ctx(&tool, &mut worker);
        adapter.update_layer(&mut stage, &state, &mut c).unwrap();
        let node = stage.node(adapter.node()).unwrap();
        assert!(node.surface.width() >= 32 && node.surface.height() >= 32);
    }

    #[test]
    fn staging_adapter_hidden_outside_staging() {
        let mut stage = Stage::new(32, 32);
        let mut staging = StagingAdapter::new(&mut stage);
        let session = SessionState::default();
        staging.update(&mut stage, &session).unwrap();
        assert!(!stage.node(staging.node()).unwrap().visible);

        let mut session = SessionState::default();
        session.is_staging = true;
        session.revision = 1;
        session.staged.push(crate::state::StagedImage {
            content: fill_content(8, 8),
            x: 2,
            y: 3,
        });
        staging.update(&mut stage, &session).unwrap();
        let node = stage.node(staging.node()).unwrap();
        assert!(node.visible);
        assert_eq!((node.x, node.y), (2, 3));
    }

    #[test]
    fn bbox_overlay_draws_outline() {
        let mut stage = Stage::new(64, 64);
        let mut overlay = BboxOverlay::new(&mut stage);
        let state = AppState::new().with_bbox(BboxState {
            rect: PixelRect::new(4, 4, 16, 16),
        });
        overlay.update(&mut stage, &state.bbox, &state.tool);
        let node = stage.node(overlay.node()).unwrap();
        assert_ne!(node.surface.get_pixel(4, 4)[3], 0, "corner must be stroked");
        assert_eq!(
            node.surface.get_pixel(10, 10)[3],
            0,
            "interior must stay clear"
        );
    }
}
