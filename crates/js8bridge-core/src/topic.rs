//! Event category → bus topic mapping.
//!
//! A pure string transform, no state: `RIG.FREQ` under prefix `js8` becomes
//! `js8/rig/freq`. Reassembly results have fixed topics, and a category that
//! cannot be turned into a clean topic path lands on the catch-all topic. So
//! does a category that would land on one of the fixed topics: an echoed
//! `TX.COMMAND` must never be read back as a command.
//!
//! ```rust
//! use js8bridge_core::topic::TopicMapper;
//!
//! let topics = TopicMapper::new("js8");
//! assert_eq!(topics.for_category("RIG.FREQ"), "js8/rig/freq");
//! assert_eq!(topics.for_category(""), "js8/unknown");
//! assert_eq!(topics.complete(), "js8/rx/complete");
//! assert_eq!(topics.for_category("TX.COMMAND"), "js8/unknown");
//! ```

/// Last path segment of the catch-all topic.
pub const CATCH_ALL_SEGMENT: &str = "unknown";

/// Topic names derived from a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMapper {
    prefix: String,
}

impl TopicMapper {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Reassembled messages.
    pub fn complete(&self) -> String {
        format!("{}/rx/complete", self.prefix)
    }

    /// Partial messages flushed on timeout.
    pub fn incomplete(&self) -> String {
        format!("{}/rx/incomplete", self.prefix)
    }

    /// Inbound commands for the radio application.
    pub fn command(&self) -> String {
        format!("{}/tx/command", self.prefix)
    }

    /// Commands evicted from a full queue.
    pub fn dropped(&self) -> String {
        format!("{}/tx/dropped", self.prefix)
    }

    /// Bridge online/offline notices.
    pub fn status(&self) -> String {
        format!("{}/bridge/status", self.prefix)
    }

    /// Catch-all for categories that do not map to a clean path.
    pub fn catch_all(&self) -> String {
        format!("{}/{CATCH_ALL_SEGMENT}", self.prefix)
    }

    /// Whether `topic` is one the bridge itself publishes or listens on.
    pub fn is_reserved(&self, topic: &str) -> bool {
        [
            self.complete(),
            self.incomplete(),
            self.command(),
            self.dropped(),
            self.status(),
        ]
        .iter()
        .any(|reserved| reserved == topic)
    }

    /// Map an event category to its topic.
    pub fn for_category(&self, category: &str) -> String {
        match category_path(category) {
            Some(path) => {
                let topic = format!("{}/{path}", self.prefix);
                if self.is_reserved(&topic) {
                    self.catch_all()
                } else {
                    topic
                }
            }
            None => self.catch_all(),
        }
    }
}

/// Lower-case the dot-separated segments of `category` and join them with
/// `/`. Returns `None` for empty categories, empty segments, and segments that
/// would alter the topic structure (`/`, `+`, `#`, whitespace).
pub fn category_path(category: &str) -> Option<String> {
    let category = category.trim();
    if category.is_empty() {
        return None;
    }
    let mut segments = Vec::new();
    for segment in category.split('.') {
        if segment.is_empty()
            || segment
                .chars()
                .any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace())
        {
            return None;
        }
        segments.push(segment.to_lowercase());
    }
    Some(segments.join("/"))
}
