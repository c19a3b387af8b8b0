//! Mock frame renderer for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::lock;
use crate::error::{Result, ShrinkError};
use crate::media::{FrameRenderer, InputSurface, SnapshotRequest, SurfaceHandle};

/// Observable state of a [`MockFrameRenderer`].
#[derive(Debug, Clone, Default)]
pub struct RendererState {
    pub rotation: f32,
    pub frames_drawn: u64,
    pub snapshots: Vec<SnapshotRequest>,
    pub released: bool,
}

#[derive(Debug, Default)]
pub(crate) struct RendererShared {
    state: RendererState,
    pending: VecDeque<i64>,
}

impl RendererShared {
    /// Called by a decoder rendering into this renderer's surface.
    pub(crate) fn frame_available(&mut self, presentation_time_us: i64) {
        self.pending.push_back(presentation_time_us);
    }

    pub(crate) fn state(&self) -> &RendererState {
        &self.state
    }
}

/// Frame renderer fed by a [`MockCodec`](super::MockCodec) decoder.
///
/// Instead of blocking when no frame is pending, `draw_next_frame` fails.
pub struct MockFrameRenderer {
    surface: SurfaceHandle,
    shared: Arc<Mutex<RendererShared>>,
}

impl MockFrameRenderer {
    pub fn new(surface: SurfaceHandle, rotation: f32) -> Self {
        let shared = RendererShared {
            state: RendererState {
                rotation,
                ..Default::default()
            },
            pending: VecDeque::new(),
        };
        Self {
            surface,
            shared: Arc::new(Mutex::new(shared)),
        }
    }

    pub fn state(&self) -> RendererState {
        lock(&self.shared).state.clone()
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<RendererShared>> {
        Arc::clone(&self.shared)
    }
}

impl FrameRenderer for MockFrameRenderer {
    fn surface(&self) -> SurfaceHandle {
        self.surface
    }

    fn draw_next_frame(
        &mut self,
        _target: &mut dyn InputSurface,
        snapshot: Option<&SnapshotRequest>,
    ) -> Result<()> {
        let mut shared = lock(&self.shared);
        if shared.pending.pop_front().is_none() {
            return Err(ShrinkError::codec("no decoded frame is pending"));
        }
        shared.state.frames_drawn += 1;
        if let Some(snapshot) = snapshot {
            shared.state.snapshots.push(snapshot.clone());
        }
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.shared).state.released = true;
    }
}
