//! JavaScript evaluated inside the page.
//!
//! The payload lives in `scripts/page_payload.js` so editors can highlight it;
//! it is bundled at compile time.

use serde_json::Value;

use crate::action::ScrollDirection;
use crate::transport::CommandMessage;

/// Installs `window.__pagePilot`. Evaluating it twice is harmless.
pub const PAGE_PAYLOAD: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/scripts/page_payload.js"));

pub const PING: &str = "!!(window.__pagePilot && window.__pagePilot.ping())";

pub const HTML_LENGTH: &str = "document.documentElement.innerHTML.length";

/// Expression that runs a transport command against the payload.
pub fn dispatch_expression(message: &CommandMessage) -> String {
    let encoded = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    format!("window.__pagePilot.handle({encoded})")
}

pub fn scroll_expression(direction: ScrollDirection) -> &'static str {
    match direction {
        ScrollDirection::Up => {
            r#"window.scrollBy({left: 0, top: -window.innerHeight / 1.5, behavior: "smooth"})"#
        }
        ScrollDirection::Down => {
            r#"window.scrollBy({left: 0, top: window.innerHeight / 1.5, behavior: "smooth"})"#
        }
        ScrollDirection::Top => "window.scroll({left: 0, top: 0})",
        ScrollDirection::Bottom => "window.scroll({left: 0, top: document.body.offsetHeight})",
    }
}

/// Last-resort value assignment: scan every input and textarea for a matching
/// `id` or `name`, set the value and fire `input`. Evaluates to `true` on a hit.
pub fn broad_scan_expression(target: &str, value: &str) -> String {
    let target = Value::String(target.to_string());
    let value = Value::String(value.to_string());
    format!(
        r#"(function() {{
  const target = {target};
  for (const el of document.querySelectorAll('input, textarea')) {{
    if (el.id === target || el.name === target) {{
      el.focus();
      el.value = {value};
      el.dispatchEvent(new Event('input', {{ bubbles: true }}));
      return true;
    }}
  }}
  return false;
}})()"#
    )
}
