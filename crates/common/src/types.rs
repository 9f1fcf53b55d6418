// Core domain types shared across all quicktab crates.

use serde::{Deserialize, Serialize};

use crate::window_id::WindowId;

/// Pixel position of a quick window's top-left corner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowPosition {
    pub x: f64,
    pub y: f64,
}

/// Pixel dimensions of a quick window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowSize {
    pub width: f64,
    pub height: f64,
}

/// What a quick window stays anchored to while the page scrolls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PinTarget {
    /// Fixed to the viewport; survives scrolling.
    Screen,
    /// Anchored to page coordinates; scrolls with content.
    Page,
}

/// Explicit per-viewer visibility lists.
///
/// `solo` is an allow-list of context ids: when non-empty, only those contexts
/// render the window. `mute` contexts never render it. Mute wins on overlap.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisibilitySet {
    #[serde(default)]
    pub solo: Vec<u32>,
    #[serde(default)]
    pub mute: Vec<u32>,
}

impl VisibilitySet {
    /// Whether a context is allowed to render under these lists.
    pub fn visible_to(&self, context_id: u32) -> bool {
        if self.mute.contains(&context_id) {
            return false;
        }
        self.solo.is_empty() || self.solo.contains(&context_id)
    }
}

/// A synchronized floating overlay window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuickWindow {
    pub id: WindowId,
    pub url: String,
    pub title: String,
    pub position: WindowPosition,
    pub size: WindowSize,
    /// The context this window currently renders in. `None` means the window
    /// was written in degraded mode and no context claims it by owner field.
    pub owner_context_id: Option<u32>,
    #[serde(default)]
    pub minimized: bool,
    pub pin_target: PinTarget,
    /// Isolation scope (e.g. container/profile key). Windows from a different
    /// scope are never rendered together.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Session-only windows do not survive a suspend/resume cycle.
    #[serde(default)]
    pub session_only: bool,
    #[serde(default)]
    pub visibility: VisibilitySet,
}

impl QuickWindow {
    /// Whether `context_id` should render this window, considering the owner
    /// field and the explicit visibility lists (but not adoption overrides,
    /// which are a per-context concern).
    pub fn renders_in(&self, context_id: u32) -> bool {
        self.owner_context_id == Some(context_id) && self.visibility.visible_to(context_id)
    }
}

/// Notice severity for the UI collaborator's toast surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Info,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window_id::WindowId;

    fn window(owner: Option<u32>) -> QuickWindow {
        QuickWindow {
            id: WindowId::new(5, 7, "ab".to_string()),
            url: "https://example.com/article".to_string(),
            title: "Article".to_string(),
            position: WindowPosition { x: 40.0, y: 80.0 },
            size: WindowSize { width: 420.0, height: 320.0 },
            owner_context_id: owner,
            minimized: false,
            pin_target: PinTarget::Screen,
            scope: None,
            session_only: false,
            visibility: VisibilitySet::default(),
        }
    }

    #[test]
    fn renders_only_in_owner_context() {
        let w = window(Some(5));
        assert!(w.renders_in(5));
        assert!(!w.renders_in(9));
    }

    #[test]
    fn unowned_window_renders_nowhere_by_owner_field() {
        let w = window(None);
        assert!(!w.renders_in(5));
    }

    #[test]
    fn mute_wins_over_solo() {
        let mut w = window(Some(5));
        w.visibility = VisibilitySet { solo: vec![5], mute: vec![5] };
        assert!(!w.renders_in(5));
    }

    #[test]
    fn empty_solo_list_allows_everyone_not_muted() {
        let v = VisibilitySet { solo: vec![], mute: vec![3] };
        assert!(v.visible_to(1));
        assert!(!v.visible_to(3));
    }

    #[test]
    fn non_empty_solo_list_restricts() {
        let v = VisibilitySet { solo: vec![2, 4], mute: vec![] };
        assert!(v.visible_to(2));
        assert!(!v.visible_to(5));
    }

    #[test]
    fn window_serde_round_trips() {
        let w = window(Some(5));
        let json = serde_json::to_string(&w).expect("serialize window");
        let back: QuickWindow = serde_json::from_str(&json).expect("deserialize window");
        assert_eq!(back, w);
    }

    #[test]
    fn pin_target_uses_snake_case_wire_form() {
        assert_eq!(serde_json::to_string(&PinTarget::Screen).unwrap(), "\"screen\"");
        assert_eq!(serde_json::to_string(&PinTarget::Page).unwrap(), "\"page\"");
    }
}
