//! The task contract consumed by the master.
//!
//! A task names the work: a lazy generator of items, a per-item processor
//! that runs inside a worker child, and hooks around the fork. Any value
//! implementing [`Task`] can be driven by [`crate::master::Master`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::worker::WorkerRecord;

/// One unit of work: a heterogeneous tuple of serializable values.
///
/// Items cross the parent/child boundary as a single JSON array, one
/// rendezvous connection per item (see [`crate::protocol`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItem(pub Vec<Value>);

impl WorkItem {
    /// Create an item from its tuple fields.
    pub fn new(fields: Vec<Value>) -> Self {
        Self(fields)
    }

    /// Number of fields in the tuple.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the tuple has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<unprintable item>"),
        }
    }
}

impl<V: Into<Value>> FromIterator<V> for WorkItem {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A lazy stream of work items. Finite and not restartable.
pub type Dispatch<'a> = Box<dyn Iterator<Item = Result<WorkItem>> + 'a>;

/// User-supplied work definition.
///
/// `dispatch` runs in the master; `perform` runs in a worker child. State
/// mutated by `dispatch` after the fork is invisible to children, and vice
/// versa.
pub trait Task {
    /// Produce the stream of work items, in delivery order.
    fn dispatch(&self) -> Result<Dispatch<'_>>;

    /// Process one item. Invoked in a worker child; an error ends that
    /// child with a non-zero exit status and the item is not retried.
    fn perform(&self, item: &WorkItem) -> Result<()>;

    /// Called in the parent immediately before each worker fork.
    fn before_fork(&self, _worker: &WorkerRecord) {}

    /// Called in the child immediately after the fork.
    fn after_fork(&self, _worker: &WorkerRecord) {}

    /// Filesystem path of the rendezvous socket.
    fn socket_path(&self) -> PathBuf {
        default_socket_path()
    }
}

/// Default rendezvous socket path, derived from the master's process id.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("divvy-{}.sock", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_work_item_display_is_json() {
        let item: WorkItem = [json!(3), json!("abc")].into_iter().collect();
        assert_eq!(item.to_string(), r#"[3,"abc"]"#);
    }

    #[test]
    fn test_work_item_from_iterator() {
        let item: WorkItem = vec!["a", "b"].into_iter().collect();
        assert_eq!(item.len(), 2);
        assert!(!item.is_empty());
        assert_eq!(item.0[0], json!("a"));
    }

    #[test]
    fn test_default_socket_path_embeds_pid() {
        let path = default_socket_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("divvy-"));
        assert!(name.ends_with(".sock"));
        assert!(name.contains(&std::process::id().to_string()));
    }
}
