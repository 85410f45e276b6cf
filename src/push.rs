//! Push payload to notification mapping.

use serde::{Deserialize, Serialize};

const DEFAULT_TITLE: &str = "Shelf";
const DEFAULT_BODY: &str = "You have an update waiting.";
const DEFAULT_ICON: &str = "/icons/icon-192.png";
const DEFAULT_BADGE: &str = "/icons/badge-72.png";
const DEFAULT_URL: &str = "/";
const VIBRATION: [u32; 3] = [100, 50, 100];

/// Inbound push message payload. Every field is optional; defaults fill in
/// the rest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

/// A user-facing notification derived from a push payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Page a click should land on
  pub url: String,
}

/// Parse a raw push body. Malformed or empty payloads fall back to defaults
/// rather than dropping the notification.
pub fn parse_payload(raw: &[u8]) -> PushPayload {
  serde_json::from_slice(raw).unwrap_or_default()
}

pub fn notification_for(payload: &PushPayload) -> Notification {
  Notification {
    title: payload.title.clone().unwrap_or_else(|| DEFAULT_TITLE.to_string()),
    body: payload.body.clone().unwrap_or_else(|| DEFAULT_BODY.to_string()),
    icon: DEFAULT_ICON.to_string(),
    badge: DEFAULT_BADGE.to_string(),
    vibrate: VIBRATION.to_vec(),
    url: payload.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string()),
  }
}

/// Where a notification click should land.
#[derive(Debug, PartialEq)]
pub enum ClickAction {
  /// Focus the already-open page at this index.
  Focus(usize),
  /// Open a new page at the notification's target.
  Open(String),
}

/// Focus an existing page matching the notification's target URL, or open a
/// new one.
pub fn click_target(notification: &Notification, open_pages: &[String]) -> ClickAction {
  match open_pages.iter().position(|u| u == &notification.url) {
    Some(index) => ClickAction::Focus(index),
    None => ClickAction::Open(notification.url.clone()),
  }
}
