//! View transform over the stage: position, uniform scale, viewport size.
//!
//! Mutated only by explicit view operations (resize, pan, zoom, reset) —
//! never inferred from entity state.  Scale is always uniform (x and y equal)
//! and kept to 2 decimal places so repeated zooms stay reproducible.

use kurbo::{Point, Rect, Size, Vec2};

pub const MIN_SCALE: f64 = 0.1;
pub const MAX_SCALE: f64 = 100.0;

/// Padding kept between fitted content and the viewport edge on reset.
const FIT_PADDING: f64 = 20.0;

#[derive(Clone, Debug, PartialEq)]
pub struct ViewState {
    /// Stage origin in screen space.
    position: Point,
    /// Uniform zoom factor.
    scale: f64,
    /// Viewport size in screen pixels.
    viewport: Size,
}

impl ViewState {
    pub fn new(viewport: Size) -> Self {
        Self {
            position: Point::ZERO,
            scale: 1.0,
            viewport,
        }
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn viewport(&self) -> Size {
        self.viewport
    }

    /// Resize the viewport to match its container.  The transform itself is
    /// left alone; callers wanting re-centering follow up with
    /// [`reset_view`](Self::reset_view).
    pub fn set_viewport_size(&mut self, viewport: Size) {
        self.viewport = viewport;
    }

    /// Pan by a screen-space delta.
    pub fn pan_by(&mut self, delta: Vec2) {
        self.position += delta;
    }

    /// Set the zoom factor, keeping `pivot` (screen space) fixed.
    ///
    /// The new scale is clamped to `[MIN_SCALE, MAX_SCALE]` and rounded to
    /// 2 decimal places.  The position is re-derived so the stage point under
    /// the pivot stays under it: with `offset = (pivot - pos) / old_scale`
    /// in pre-scale units, the new origin is `pivot - offset * new_scale`.
    pub fn set_scale(&mut self, new_scale: f64, pivot: Point) {
        let clamped = round2(new_scale.clamp(MIN_SCALE, MAX_SCALE));
        let offset = (pivot - self.position) / self.scale;
        self.position = pivot - offset * clamped;
        self.scale = clamped;
    }

    /// Fit `content` (stage space) inside the viewport minus fixed padding,
    /// never upscaling past native resolution, and center it.
    pub fn reset_view(&mut self, content: Rect) {
        if content.width() <= 0.0 || content.height() <= 0.0 {
            self.position = Point::ZERO;
            self.scale = 1.0;
            return;
        }
        let avail_w = (self.viewport.width - 2.0 * FIT_PADDING).max(1.0);
        let avail_h = (self.viewport.height - 2.0 * FIT_PADDING).max(1.0);
        let fit = (avail_w / content.width()).min(avail_h / content.height());
        let scale = round2(fit.min(1.0).max(MIN_SCALE));
        let viewport_center = Point::new(self.viewport.width / 2.0, self.viewport.height / 2.0);
        self.position = viewport_center - content.center().to_vec2() * scale;
        self.scale = scale;
    }

    /// Map a screen-space point into stage space.
    pub fn screen_to_stage(&self, p: Point) -> Point {
        ((p - self.position) / self.scale).to_point()
    }

    /// Map a stage-space point into screen space.
    pub fn stage_to_screen(&self, p: Point) -> Point {
        self.position + p.to_vec2() * self.scale
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
