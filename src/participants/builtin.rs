use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::participants::Participant;
use crate::runtime::fei::FlowExpressionId;
use crate::runtime::workitem::Workitem;

/// Replies immediately with the workitem untouched.
#[derive(Debug, Default)]
pub struct NoOpParticipant;

#[async_trait]
impl Participant for NoOpParticipant {
    async fn consume(&self, workitem: Workitem) -> Result<Option<Workitem>> {
        Ok(Some(workitem))
    }
}

/// Never replies.
#[derive(Debug, Default)]
pub struct NullParticipant;

#[async_trait]
impl Participant for NullParticipant {
    async fn consume(&self, _workitem: Workitem) -> Result<Option<Workitem>> {
        Ok(None)
    }
}

/// Logs the participant name, appends it to a shared trace and replies.
#[derive(Debug, Default, Clone)]
pub struct TraceParticipant {
    trace: Arc<Mutex<Vec<String>>>,
}

impl TraceParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Participant for TraceParticipant {
    async fn consume(&self, workitem: Workitem) -> Result<Option<Workitem>> {
        let name = workitem.participant_name.clone().unwrap_or_default();
        info!(participant = %name, "[TRACE] {}", name);
        self.trace
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name);
        Ok(Some(workitem))
    }
}

/// Parks workitems until someone takes them out and replies through the
/// engine.
#[derive(Debug, Default)]
pub struct StorageParticipant {
    // Map<Fei, Workitem>
    workitems: DashMap<String, Workitem>,
}

impl StorageParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workitems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workitems.is_empty()
    }

    pub fn workitems(&self) -> Vec<Workitem> {
        self.workitems.iter().map(|w| w.value().clone()).collect()
    }

    pub fn by_participant(&self, name: &str) -> Vec<Workitem> {
        self.workitems
            .iter()
            .filter(|w| w.value().participant_name.as_deref() == Some(name))
            .map(|w| w.value().clone())
            .collect()
    }

    /// Removes and returns the workitem held for `fei`.
    pub fn take(&self, fei: &FlowExpressionId) -> Option<Workitem> {
        self.workitems.remove(&fei.to_string()).map(|(_, w)| w)
    }
}

#[async_trait]
impl Participant for StorageParticipant {
    async fn consume(&self, workitem: Workitem) -> Result<Option<Workitem>> {
        if let Some(fei) = &workitem.fei {
            self.workitems.insert(fei.to_string(), workitem.clone());
        }
        Ok(None)
    }

    async fn cancel(&self, fei: &FlowExpressionId) -> Result<()> {
        self.workitems.remove(&fei.to_string());
        Ok(())
    }
}

type Block = dyn Fn(&mut Workitem) -> Result<()> + Send + Sync;

/// Runs a closure over the workitem and replies with the result.
pub struct BlockParticipant {
    block: Box<Block>,
}

impl BlockParticipant {
    pub fn new<F>(block: F) -> Self
    where
        F: Fn(&mut Workitem) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            block: Box::new(block),
        }
    }
}

impl fmt::Debug for BlockParticipant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockParticipant").finish_non_exhaustive()
    }
}

#[async_trait]
impl Participant for BlockParticipant {
    async fn consume(&self, mut workitem: Workitem) -> Result<Option<Workitem>> {
        (self.block)(&mut workitem)?;
        Ok(Some(workitem))
    }
}
