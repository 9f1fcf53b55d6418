// Collaborator seams toward the single-context UI layer.
//
// Everything on the other side of these seams (hover detection, per-site
// link extraction, toast chrome, shortcut handling) has no consistency
// obligations; the engine only calls out through `Renderer` and receives
// `UiEvent`s back.

use quicktab_common::types::{NoticeKind, QuickWindow};
use quicktab_common::window_id::WindowId;

/// Outward calls into the UI collaborator.
pub trait Renderer {
    /// Render (or re-render) a window in this context.
    fn render(&mut self, window: &QuickWindow);

    /// Tear down a window's rendering in this context.
    fn destroy(&mut self, id: &WindowId);

    /// Show a toast-style notice.
    fn show_notice(&mut self, message: &str, kind: NoticeKind);

    /// Current pointer position in viewport pixels, when known. New windows
    /// spawn near it.
    fn pointer_position(&self) -> Option<(f64, f64)>;
}

/// Inward events from the UI collaborator, fed into the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Keyboard shortcut or per-site extraction produced a URL to open.
    CreateRequested { url: String, title: String },
    /// The user sent a window to another context.
    AdoptRequested { window_id: WindowId, new_owner_context_id: u32 },
    /// The user closed a window.
    CloseRequested { window_id: WindowId },
    /// The user toggled a window's minimized state.
    MinimizeToggled { window_id: WindowId },
}

/// Renderer that records every call. The reference implementation for tests
/// and a starting point for embedders wiring a real DOM layer.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    pub rendered: Vec<QuickWindow>,
    pub destroyed: Vec<WindowId>,
    pub notices: Vec<(String, NoticeKind)>,
    pub pointer: Option<(f64, f64)>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids rendered so far, in call order.
    pub fn rendered_ids(&self) -> Vec<WindowId> {
        self.rendered.iter().map(|w| w.id.clone()).collect()
    }
}

impl Renderer for RecordingRenderer {
    fn render(&mut self, window: &QuickWindow) {
        self.rendered.push(window.clone());
    }

    fn destroy(&mut self, id: &WindowId) {
        self.destroyed.push(id.clone());
    }

    fn show_notice(&mut self, message: &str, kind: NoticeKind) {
        self.notices.push((message.to_string(), kind));
    }

    fn pointer_position(&self) -> Option<(f64, f64)> {
        self.pointer
    }
}
