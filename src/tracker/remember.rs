//! Auto-remember: notable session events saved as memories.
//!
//! Critical events (a fix verified by a passing test) go straight to the
//! memory worker so the current session can use them. Everything else, and
//! any critical event the worker cannot take, lands in
//! `.auto_remember_queue.jsonl` for ingestion at the next boot.

use crate::config::Paths;
use crate::memory_client::MemoryClient;
use crate::state::SessionState;
use anyhow::{Context, Result};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;

pub const MAX_AUTO_REMEMBER_PER_SESSION: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct RememberEvent {
    pub content: String,
    pub context: String,
    pub tags: String,
    pub critical: bool,
}

impl RememberEvent {
    pub fn queued(content: impl Into<String>, context: impl Into<String>, tags: &str) -> Self {
        Self {
            content: content.into(),
            context: context.into(),
            tags: tags.to_string(),
            critical: false,
        }
    }

    pub fn critical(content: impl Into<String>, context: impl Into<String>, tags: &str) -> Self {
        Self {
            critical: true,
            ..Self::queued(content, context, tags)
        }
    }
}

pub struct AutoRemember<'a> {
    paths: &'a Paths,
    memory: Option<&'a MemoryClient>,
}

impl<'a> AutoRemember<'a> {
    pub fn new(paths: &'a Paths, memory: Option<&'a MemoryClient>) -> Self {
        Self { paths, memory }
    }

    /// Save or queue one event, subject to the per-session budget
    pub fn record(&self, event: RememberEvent, state: &mut SessionState, now: f64) {
        if state.auto_remember_count >= MAX_AUTO_REMEMBER_PER_SESSION {
            return;
        }
        state.auto_remember_count += 1;

        if event.critical {
            if let Some(memory) = self.memory.filter(|m| m.is_available()) {
                match memory.remember(&event.content, &event.context, &event.tags) {
                    Ok(_) => return,
                    Err(e) => tracing::debug!(error = %e, "auto-remember fell back to queue"),
                }
            }
        }
        if let Err(e) = self.enqueue(&event, now) {
            tracing::debug!(error = %e, "auto-remember queue write failed");
        }
    }

    fn enqueue(&self, event: &RememberEvent, now: f64) -> Result<()> {
        let path = self.paths.auto_remember_queue();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let line = json!({
            "content": event.content,
            "context": event.context,
            "tags": event.tags,
            "timestamp": now,
        });
        writeln!(file, "{}", line)?;
        Ok(())
    }
}
