//! Rendering seam.
//!
//! No graphics backend lives here. A backend consumes [`RenderItem`]s read
//! from the object manager: world matrix plus the entity's mesh, texture and
//! material colour.

use crate::{
    math::{Color, Mat4},
    scene::NodeId,
};

/// One drawable node.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderItem {
    pub id: NodeId,
    pub model_matrix: Mat4,
    pub mesh: String,
    pub texture: String,
    pub color: Color,
}

pub trait RenderBackend: Send {
    fn begin_frame(&mut self);
    fn draw(&mut self, item: &RenderItem);
    fn end_frame(&mut self);
}

/// Draws `items` as one frame.
pub fn render_frame(backend: &mut dyn RenderBackend, items: &[RenderItem]) {
    backend.begin_frame();
    for item in items {
        backend.draw(item);
    }
    backend.end_frame();
}

/// Headless backend that only counts.
#[derive(Debug, Default)]
pub struct NullRenderer {
    frames: u64,
    draws: u64,
    last_frame_items: usize,
}

impl NullRenderer {
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn last_frame_items(&self) -> usize {
        self.last_frame_items
    }
}

impl RenderBackend for NullRenderer {
    fn begin_frame(&mut self) {
        self.last_frame_items = 0;
    }

    fn draw(&mut self, _item: &RenderItem) {
        self.draws += 1;
        self.last_frame_items += 1;
    }

    fn end_frame(&mut self) {
        self.frames += 1;
    }
}
