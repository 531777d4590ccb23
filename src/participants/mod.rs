use anyhow::{Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use crate::runtime::fei::FlowExpressionId;
use crate::runtime::workitem::Workitem;

pub mod builtin;

/// External task handler. The engine hands it a workitem and expects the
/// workitem back exactly once, or never.
#[async_trait]
pub trait Participant: Send + Sync + Debug {
    /// `Some` replies right away. `None` keeps the workitem; the reply comes
    /// later through `Engine::reply`.
    async fn consume(&self, workitem: Workitem) -> Result<Option<Workitem>>;

    /// The expression holding `fei` was cancelled.
    async fn cancel(&self, _fei: &FlowExpressionId) -> Result<()> {
        Ok(())
    }
}

struct Entry {
    pattern: String,
    regex: Regex,
    participant: Arc<dyn Participant>,
}

/// Participants keyed by name pattern, first registered match wins.
#[derive(Default)]
pub struct ParticipantRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `pattern` is a regular expression matched against the whole name;
    /// a plain name matches itself. Re-registering a pattern replaces it.
    pub fn register(&self, pattern: &str, participant: Arc<dyn Participant>) -> Result<()> {
        let regex = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| anyhow!("Invalid participant pattern '{}': {}", pattern, e))?;

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = Entry {
            pattern: pattern.to_string(),
            regex,
            participant,
        };
        match entries.iter().position(|e| e.pattern == pattern) {
            Some(idx) => entries[idx] = entry,
            None => entries.push(entry),
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Participant>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|e| e.regex.is_match(name))
            .map(|e| e.participant.clone())
    }
}
