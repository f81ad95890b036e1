//! stagesync — keeps a mutable scene graph of renderable layers in sync with
//! an immutable, versioned application-state tree.
//!
//! The state store emits a full snapshot on every update; [`SceneManager`]
//! diffs it against the previous snapshot (reference comparisons only, never
//! deep equality), then creates, updates, reorders, or destroys the per-entity
//! adapters that own the actual scene-graph nodes.  Expensive bounding-box
//! extraction is offloaded to a background worker thread and correlated back
//! by opaque request ids.

pub mod logger;

pub mod adapters;
pub mod assets;
pub mod reconciler;
pub mod renderer;
pub mod stage;
pub mod state;
pub mod surface;
pub mod view;
pub mod worker;

pub use reconciler::SceneManager;
pub use state::AppState;
