use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::runtime::fei::FlowExpressionId;
use crate::runtime::workitem::Workitem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Launch,
    Apply,
    Reply,
    Receive,
    Dispatch,
    DispatchError,
    Cancel,
    ErrorIntercepted,
    /// A detached (forgotten) branch finished; its reply went nowhere.
    Ceased,
    /// The root of an instance is gone.
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub action: LogAction,
    pub wfid: String,
    pub fei: Option<FlowExpressionId>,
    pub participant: Option<String>,
    pub message: Option<String>,
    pub workitem: Option<Workitem>,
    pub at: DateTime<Utc>,
}

impl HistoryEvent {
    pub fn new(action: LogAction, wfid: &str) -> Self {
        Self {
            action,
            wfid: wfid.to_string(),
            fei: None,
            participant: None,
            message: None,
            workitem: None,
            at: Utc::now(),
        }
    }

    pub fn for_fei(action: LogAction, fei: &FlowExpressionId) -> Self {
        let mut event = Self::new(action, fei.wfid());
        event.fei = Some(fei.clone());
        event
    }

    pub fn with_participant(mut self, name: &str) -> Self {
        self.participant = Some(name.to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_workitem(mut self, workitem: &Workitem) -> Self {
        self.workitem = Some(workitem.clone());
        self
    }

    /// True when this event belongs to the top-level instance `wfid`
    /// (sub-processes included).
    pub fn concerns(&self, wfid: &str) -> bool {
        self.wfid == wfid
            || self
                .fei
                .as_ref()
                .is_some_and(|f| f.parent_wfid() == wfid)
    }
}

/// Bounded in-process log of lifecycle events, also broadcast live.
pub struct History {
    events: Mutex<VecDeque<HistoryEvent>>,
    capacity: usize,
    sender: broadcast::Sender<HistoryEvent>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            sender,
        }
    }

    pub fn record(&self, event: HistoryEvent) {
        {
            let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
            if self.capacity > 0 && events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.sender.subscribe()
    }

    pub fn events(&self) -> Vec<HistoryEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().cloned().collect()
    }

    pub fn by_action(&self, action: LogAction) -> Vec<HistoryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }

    pub fn for_wfid(&self, wfid: &str) -> Vec<HistoryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.concerns(wfid))
            .collect()
    }

    pub fn count(&self, wfid: &str, action: LogAction) -> usize {
        self.for_wfid(wfid)
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}
