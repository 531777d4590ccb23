use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FlowError;

pub const CHILD_SEP: char = '_';
pub const FIELD_SEP: char = '|';
pub const ROOT_EXPID: &str = "0";

/// Matches the trailing `_<digits>` segment of a sub-process wfid. The
/// greedy prefix makes it match only the last such segment.
static SUBP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)_(\d+)$").expect("static regex"));

/// Uniquely identifies one expression of one process instance.
///
/// The canonical string form is `"<engine_id>|<wfid>|<expid>"`; it is the
/// only representation that crosses storage or queue boundaries (serde
/// goes through it too).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FlowExpressionId {
    engine_id: String,
    wfid: String,
    expid: String,
}

impl FlowExpressionId {
    /// The root expression of a process instance (expid `"0"`).
    pub fn new_root(engine_id: impl Into<String>, wfid: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
            wfid: wfid.into(),
            expid: ROOT_EXPID.to_string(),
        }
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn wfid(&self) -> &str {
        &self.wfid
    }

    pub fn expid(&self) -> &str {
        &self.expid
    }

    /// Returns a copy of this id with `index` appended to the expid.
    pub fn child(&self, index: usize) -> Self {
        Self {
            engine_id: self.engine_id.clone(),
            wfid: self.wfid.clone(),
            expid: format!("{}{}{}", self.expid, CHILD_SEP, index),
        }
    }

    /// Strips the last expid element. `None` at depth 0.
    pub fn parent(&self) -> Option<Self> {
        let (parent_expid, _) = self.expid.rsplit_once(CHILD_SEP)?;
        Some(Self {
            engine_id: self.engine_id.clone(),
            wfid: self.wfid.clone(),
            expid: parent_expid.to_string(),
        })
    }

    /// The root of the sub-process numbered `n` within this id's top-level
    /// instance: wfid `"<parent_wfid>_<n>"`, expid `"0"`. Nested
    /// sub-processes stay flat under the top-level wfid.
    pub fn sub_process_root(&self, n: u64) -> Self {
        Self::new_root(
            self.engine_id.clone(),
            format!("{}{}{}", self.parent_wfid(), CHILD_SEP, n),
        )
    }

    /// Last number in the expid: `0_5_7` gives 7.
    pub fn child_id(&self) -> usize {
        self.expid_path().last().copied().unwrap_or(0)
    }

    /// The root expression has a depth of 0.
    pub fn depth(&self) -> usize {
        self.expid.split(CHILD_SEP).count() - 1
    }

    pub fn expid_path(&self) -> Vec<usize> {
        self.expid
            .split(CHILD_SEP)
            .filter_map(|e| e.parse().ok())
            .collect()
    }

    pub fn parent_expid(&self) -> Option<&str> {
        self.expid.rsplit_once(CHILD_SEP).map(|(p, _)| p)
    }

    /// Prefix check on the element sequence, never a traversal. Ancestry
    /// does not cross sub-process boundaries.
    pub fn is_ancestor_of(&self, other: &FlowExpressionId) -> bool {
        if self.engine_id != other.engine_id || self.wfid != other.wfid {
            return false;
        }
        let mine = self.expid_path();
        let theirs = other.expid_path();
        mine.len() < theirs.len() && theirs.starts_with(&mine)
    }

    /// The wfid of the top-level instance this id belongs to.
    pub fn parent_wfid(&self) -> &str {
        wfid_split(&self.wfid).0
    }

    /// The sub-process number, `None` for a top-level instance.
    pub fn sub_wfid(&self) -> Option<&str> {
        wfid_split(&self.wfid).1
    }

    /// `"<expid>|<sub_wfid>|<parent_wfid>"`, empty string for a missing
    /// sub_wfid. Stores group keys by `parent_wfid` so a recovery scan reads
    /// a whole instance, sub-processes included, in one pass.
    pub fn to_storage_id(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.expid,
            self.sub_wfid().unwrap_or(""),
            self.parent_wfid(),
            sep = FIELD_SEP
        )
    }

    pub fn parse(s: &str) -> Result<Self, FlowError> {
        let fields: Vec<&str> = s.split(FIELD_SEP).collect();
        let [engine_id, wfid, expid] = fields.as_slice() else {
            return Err(FlowError::Format(s.to_string()));
        };

        let numeric = |e: &str| !e.is_empty() && e.bytes().all(|b| b.is_ascii_digit());
        if !expid.split(CHILD_SEP).all(numeric) {
            return Err(FlowError::Format(s.to_string()));
        }

        Ok(Self {
            engine_id: engine_id.to_string(),
            wfid: wfid.to_string(),
            expid: expid.to_string(),
        })
    }
}

/// Splits a wfid into `(parent_wfid, sub_wfid)`.
///
/// A top-level wfid that itself ends in `_<digits>` is read as a
/// sub-process id; callers minting wfids should avoid that shape.
pub fn wfid_split(wfid: &str) -> (&str, Option<&str>) {
    match SUBP_REGEX.captures(wfid) {
        Some(caps) => match (caps.get(1), caps.get(2)) {
            (Some(parent), Some(sub)) => (parent.as_str(), Some(sub.as_str())),
            _ => (wfid, None),
        },
        None => (wfid, None),
    }
}

impl fmt::Display for FlowExpressionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.engine_id,
            self.wfid,
            self.expid,
            sep = FIELD_SEP
        )
    }
}

impl FromStr for FlowExpressionId {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<FlowExpressionId> for String {
    fn from(fei: FlowExpressionId) -> Self {
        fei.to_string()
    }
}

impl TryFrom<String> for FlowExpressionId {
    type Error = FlowError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}
