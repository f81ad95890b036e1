//! Entity renderer and transform controller seams.
//!
//! The engine never draws pixels itself: each adapter owns a renderer that
//! knows how to put one entity's content onto its scene node, and (for
//! transformable entities) a controller that tracks move/resize sessions.
//! Interactive widgets and exotic drawing strategies live outside the crate
//! behind these traits; the built-in implementations cover raster content.

use crate::state::ContentSource;
use crate::surface::TileSurface;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum RenderError {
    /// The entity's content cannot be drawn (e.g. zero-sized).
    ContentUnavailable(String),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::ContentUnavailable(why) => {
                write!(f, "entity content unavailable: {}", why)
            }
        }
    }
}

impl std::error::Error for RenderError {}

// ============================================================================
// ENTITY RENDERER
// ============================================================================

/// Everything a renderer needs for one update.
pub struct RenderInputs<'a> {
    pub content: &'a ContentSource,
    /// Upstream content revision; unchanged revision means unchanged pixels.
    pub revision: u64,
    /// When set, source pixels are recolored to this RGB while keeping
    /// their coverage (mask-shaped entities).
    pub tint: Option<[u8; 3]>,
}

/// Draws one entity's pixel content into its scene node.
///
/// `render` must be idempotent: calling it again with unchanged inputs must
/// be a cheap no-op.  Returns `true` when the surface pixels actually
/// changed, which is what drives follow-up extent requests.
pub trait EntityRenderer {
    fn render(
        &mut self,
        surface: &mut TileSurface,
        inputs: &RenderInputs<'_>,
    ) -> Result<bool, RenderError>;

    /// Release renderer-owned resources.  Default: nothing to release.
    fn destroy(&mut self) {}
}

/// Built-in renderer for raster and solid-fill content.
#[derive(Default)]
pub struct RasterRenderer {
    last_revision: Option<u64>,
    last_tint: Option<[u8; 3]>,
}

impl EntityRenderer for RasterRenderer {
    fn render(
        &mut self,
        surface: &mut TileSurface,
        inputs: &RenderInputs<'_>,
    ) -> Result<bool, RenderError> {
        if self.last_revision == Some(inputs.revision) && self.last_tint == inputs.tint {
            return Ok(false);
        }
        let (w, h) = inputs.content.dimensions();
        if w == 0 || h == 0 {
            // An empty mask is a valid entity; just present nothing.
            surface.clear();
            self.last_revision = Some(inputs.revision);
            self.last_tint = inputs.tint;
            return Ok(true);
        }
        if w > surface.width() || h > surface.height() {
            return Err(RenderError::ContentUnavailable(format!(
                "content {}x{} exceeds node surface {}x{}",
                w,
                h,
                surface.width(),
                surface.height()
            )));
        }
        surface.clear();
        match inputs.content {
            ContentSource::Raster(img) => match inputs.tint {
                Some(rgb) => surface.blit_tinted(img, 0, 0, rgb),
                None => surface.blit_image(img, 0, 0),
            },
            ContentSource::Fill {
                color,
                width,
                height,
            } => {
                let color = match inputs.tint {
                    Some(rgb) => [rgb[0], rgb[1], rgb[2], color[3]],
                    None => *color,
                };
                surface.fill_rect(0, 0, *width, *height, image::Rgba(color));
            }
        }
        self.last_revision = Some(inputs.revision);
        self.last_tint = inputs.tint;
        Ok(true)
    }
}

// ============================================================================
// TRANSFORM CONTROLLER
// ============================================================================

/// Tracks an entity's move/resize session.  The interactive handle widget
/// is external; the engine only needs start/apply/cancel semantics and a
/// synced position.
pub trait TransformController {
    /// Keep the controller aligned with the entity's committed position.
    fn sync_position(&mut self, x: i32, y: i32);

    /// Begin a transform session from the current position.
    fn begin(&mut self);

    /// Commit the in-progress transform.  Returns the final position.
    fn apply(&mut self) -> (i32, i32);

    /// Abort the in-progress transform, restoring the starting position.
    fn cancel(&mut self);

    fn is_active(&self) -> bool;

    /// Release controller-owned resources.  Default: nothing to release.
    fn destroy(&mut self) {}
}

/// Built-in controller: a plain position state machine.
#[derive(Default)]
pub struct HandleController {
    x: i32,
    y: i32,
    saved: Option<(i32, i32)>,
}

impl HandleController {
    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    /// Move the entity while a transform session is active.
    pub fn drag_to(&mut self, x: i32, y: i32) {
        if self.saved.is_some() {
            self.x = x;
            self.y = y;
        }
    }
}

impl TransformController for HandleController {
    fn sync_position(&mut self, x: i32, y: i32) {
        // A committed position from state overrides any stale session.
        if self.saved.is_none() {
            self.x = x;
            self.y = y;
        }
    }

    fn begin(&mut self) {
        if self.saved.is_none() {
            self.saved = Some((self.x, self.y));
        }
    }

    fn apply(&mut self) -> (i32, i32) {
        self.saved = None;
        (self.x, self.y)
    }

    fn cancel(&mut self) {
        if let Some((x, y)) = self.saved.take() {
            self.x = x;
            self.y = y;
        }
    }

    fn is_active(&self) -> bool {
        self.saved.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::sync::Arc;

    fn raster(w: u32, h: u32, color: [u8; 4]) -> ContentSource {
        let mut img = RgbaImage::new(w, h);
        for px in img.pixels_mut() {
            *px = Rgba(color);
        }
        ContentSource::Raster(Arc::new(img))
    }

    #[test]
    fn render_is_idempotent_per_revision() {
        let mut surface = TileSurface::new(16, 16);
        let mut renderer = RasterRenderer::default();
        let content = raster(4, 4, [5, 6, 7, 255]);
        let inputs = RenderInputs {
            content: &content,
            revision: 1,
            tint: None,
        };
        assert!(renderer.render(&mut surface, &inputs).unwrap());
        assert!(
            !renderer.render(&mut surface, &inputs).unwrap(),
            "unchanged revision must be a no-op"
        );
    }

    #[test]
    fn tint_change_forces_redraw() {
        let mut surface = TileSurface::new(16, 16);
        let mut renderer = RasterRenderer::default();
        let content = raster(4, 4, [255, 255, 255, 200]);
        let mut inputs = RenderInputs {
            content: &content,
            revision: 1,
            tint: Some([255, 0, 0]),
        };
        assert!(renderer.render(&mut surface, &inputs).unwrap());
        assert_eq!(*surface.get_pixel(0, 0), Rgba([255, 0, 0, 200]));
        inputs.tint = Some([0, 0, 255]);
        assert!(renderer.render(&mut surface, &inputs).unwrap());
        assert_eq!(*surface.get_pixel(0, 0), Rgba([0, 0, 255, 200]));
    }

    #[test]
    fn oversized_content_is_a_loud_error() {
        let mut surface = TileSurface::new(4, 4);
        let mut renderer = RasterRenderer::default();
        let content = raster(8, 8, [1, 1, 1, 255]);
        let inputs = RenderInputs {
            content: &content,
            revision: 1,
            tint: None,
        };
        assert!(renderer.render(&mut surface, &inputs).is_err());
    }

    #[test]
    fn handle_controller_cancel_restores_position() {
        let mut ctl = HandleController::default();
        ctl.sync_position(10, 20);
        ctl.begin();
        ctl.drag_to(50, 60);
        assert_eq!(ctl.position(), (50, 60));
        ctl.cancel();
        assert_eq!(ctl.position(), (10, 20));
        assert!(!ctl.is_active());
    }

    #[test]
    fn handle_controller_apply_commits() {
        let mut ctl = HandleController::default();
        ctl.sync_position(0, 0);
        ctl.begin();
        ctl.drag_to(7, 9);
        assert_eq!(ctl.apply(), (7, 9));
        assert!(!ctl.is_active());
    }
}
