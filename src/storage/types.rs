use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Field every transferable queue item / map value must carry as its identity.
///
/// Cross-structure transfers (`poll_into`, `transfer_to_queue`) key the map
/// entry by this field of the JSON object.
pub const KEY_FIELD: &str = "id";

/// Suffix of the queue that collects items a transfer could not key.
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_SUFFIX)
}

/// The three shared structure families. Each owns its own event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StructureKind {
    Queue,
    Map,
    Topic,
}

impl StructureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructureKind::Queue => "queue",
            StructureKind::Map => "map",
            StructureKind::Topic => "topic",
        }
    }
}

impl fmt::Display for StructureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StructureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(StructureKind::Queue),
            "map" => Ok(StructureKind::Map),
            "topic" => Ok(StructureKind::Topic),
            other => Err(format!("unknown structure kind: {}", other)),
        }
    }
}

/// A single change applied to a shared structure, in its serialized form.
///
/// Values are carried as JSON strings, exactly as they are stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    ItemAdded {
        item: String,
    },
    ItemRemoved {
        item: String,
    },
    EntryAdded {
        key: String,
        value: String,
    },
    EntryUpdated {
        key: String,
        value: String,
        old_value: String,
    },
    EntryRemoved {
        key: String,
        old_value: String,
    },
    Message {
        payload: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: StoreEvent,
}

/// Result of reading a structure's event log after a cursor.
///
/// `cursor` is the sequence number to pass as `after` on the next read.
/// `skipped` counts events that were trimmed from the log before the reader
/// caught up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<SequencedEvent>,
    pub cursor: u64,
    pub skipped: u64,
}

/// Handle returned when registering a listener; used to remove it again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ListenerId(pub Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEventKind {
    Added,
    Removed,
}

/// Typed queue item notification.
#[derive(Debug, Clone)]
pub struct ItemEvent<T> {
    pub kind: ItemEventKind,
    pub item: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEventKind {
    Added,
    Updated,
    Removed,
}

/// Typed map entry notification.
///
/// `value` is the value after the change (`None` on removal), `old_value`
/// the value before it (`None` on add).
#[derive(Debug, Clone)]
pub struct EntryEvent<K, V> {
    pub kind: EntryEventKind,
    pub key: K,
    pub value: Option<V>,
    pub old_value: Option<V>,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Anything that can be stored in a queue, map or topic.
pub trait StoreValue: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Map keys travel as strings and are parsed back for typed listeners.
pub trait MapKey: ToString + Clone + Eq + Hash + Send + Sync + 'static {
    fn from_key(raw: &str) -> Option<Self>;
}

impl<T> MapKey for T
where
    T: ToString + FromStr + Clone + Eq + Hash + Send + Sync + 'static,
{
    fn from_key(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}
