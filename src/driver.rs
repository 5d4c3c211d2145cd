//! Host-side page primitives the executor and resolver are written against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ActionError;

/// Modifier bit for shift in input events.
pub const SHIFT: i64 = 8;
const VK_RETURN: i64 = 13;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseEventKind {
    Pressed,
    Released,
}

/// Left-button pointer event in viewport coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MouseEvent {
    pub kind: MouseEventKind,
    pub at: Point,
    pub click_count: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyEventKind {
    KeyDown,
    RawKeyDown,
    Char,
    KeyUp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub kind: KeyEventKind,
    pub text: Option<String>,
    pub modifiers: i64,
    pub windows_virtual_key_code: Option<i64>,
    /// Editing commands such as `selectAll`.
    pub commands: Vec<String>,
}

impl KeyEvent {
    fn plain(kind: KeyEventKind, text: Option<String>) -> Self {
        Self {
            kind,
            text,
            modifiers: 0,
            windows_virtual_key_code: None,
            commands: Vec::new(),
        }
    }

    pub fn down(c: char) -> Self {
        Self::plain(KeyEventKind::KeyDown, Some(c.to_string()))
    }

    pub fn up(c: char) -> Self {
        Self::plain(KeyEventKind::KeyUp, Some(c.to_string()))
    }

    pub fn select_all() -> Self {
        Self {
            commands: vec!["selectAll".to_string()],
            ..Self::plain(KeyEventKind::KeyDown, None)
        }
    }

    /// The raw-down, char, up sequence for a carriage return.
    pub fn carriage_return(modifiers: i64) -> [Self; 3] {
        let ev = |kind| Self {
            kind,
            text: Some("\r".to_string()),
            modifiers,
            windows_virtual_key_code: Some(VK_RETURN),
            commands: Vec::new(),
        };
        [ev(KeyEventKind::RawKeyDown), ev(KeyEventKind::Char), ev(KeyEventKind::KeyUp)]
    }
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Whether `selector` matches an element in the live document.
    async fn exists(&self, selector: &str) -> Result<bool, ActionError>;

    /// Center of the element's border box, measured now. `None` when the
    /// element is gone or has no layout.
    async fn box_center(&self, selector: &str) -> Result<Option<Point>, ActionError>;

    async fn dispatch_mouse(&self, event: MouseEvent) -> Result<(), ActionError>;

    async fn dispatch_key(&self, event: KeyEvent) -> Result<(), ActionError>;

    async fn evaluate(&self, expression: &str) -> Result<Value, ActionError>;

    async fn navigate(&self, url: &str) -> Result<(), ActionError>;
}
