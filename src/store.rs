//! The content-store seam.
//!
//! Everything the loader knows about the repository goes through the
//! [`ContentStore`] trait: a hierarchical store whose inner items are *nodes*
//! and whose leaves are *properties* — binary streams with a last-modification
//! timestamp. One implementor value models one open session against the
//! repository.
//!
//! The trait is deliberately narrow. Reading, permission probing, child
//! iteration, URL minting and event subscription are all the loader ever
//! asks for; persistence, locking and access control stay on the other side
//! of the seam.

use std::io::Read;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use url::Url;

/// A single addressable item in a content store.
///
/// Both variants carry the item's absolute, `/`-separated store path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Item {
  /// An inner item that contains other items.
  Node(String),
  /// A leaf item carrying a binary stream.
  Property(String),
}

impl Item {
  /// The absolute store path of the item.
  pub fn path(&self) -> &str {
    match self {
      Item::Node(path) => path,
      Item::Property(path) => path,
    }
  }

  /// The last path segment.
  pub fn name(&self) -> &str {
    self.path().rsplit('/').next().unwrap_or("")
  }

  /// Whether the item is a property.
  pub fn is_property(&self) -> bool {
    matches!(self, Item::Property(_))
  }

  /// Whether the item is a node.
  pub fn is_node(&self) -> bool {
    matches!(self, Item::Node(_))
  }
}

/// Failure while talking to the underlying store.
#[derive(Debug, Error)]
pub enum StoreFailure {
  /// Nothing lives at the path.
  #[error("no item at {0}")]
  NoSuchItem(String),
  /// The item exists but is a node, not a property.
  #[error("item at {0} is not a property")]
  NotAProperty(String),
  /// The session may not read the path.
  #[error("read access to {0} denied")]
  Denied(String),
  /// The session has been closed underneath us.
  #[error("store session is no longer alive")]
  SessionClosed,
  /// An I/O error from the store's transport.
  #[error("store i/o failure at {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
}

/// What happened in the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
  NodeAdded,
  NodeRemoved,
  PropertyAdded,
  PropertyRemoved,
  PropertyChanged,
}

impl EventKind {
  /// Every kind a store can report.
  pub const ALL: [EventKind; 5] = [
    EventKind::NodeAdded,
    EventKind::NodeRemoved,
    EventKind::PropertyAdded,
    EventKind::PropertyRemoved,
    EventKind::PropertyChanged,
  ];

  /// The kinds that can change which paths exist. A property-value change
  /// rewrites content but never the shape of the tree.
  pub const STRUCTURAL: [EventKind; 4] = [
    EventKind::NodeAdded,
    EventKind::NodeRemoved,
    EventKind::PropertyAdded,
    EventKind::PropertyRemoved,
  ];

  /// Whether the event reports something new in the store.
  pub fn is_addition(self) -> bool {
    matches!(self, EventKind::NodeAdded | EventKind::PropertyAdded)
  }
}

/// One store change notification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Event {
  /// What happened.
  pub kind: EventKind,
  /// The absolute path of the item the event is about.
  pub path: String,
}

impl Event {
  pub fn new(kind: EventKind, path: &str) -> Event {
    Event {
      kind,
      path: path.to_owned(),
    }
  }
}

/// Receiver of store change notifications.
///
/// Batches arrive in the order the store reports them, on a store-owned
/// thread, serialized per store. Implementations must not block on store
/// I/O; reading the event metadata is all a callback should do.
pub trait EventListener: Send + Sync {
  fn on_events(&self, events: &[Event]);
}

/// Handle for a live event subscription.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
  pub fn new(raw: u64) -> SubscriptionId {
    SubscriptionId(raw)
  }

  pub fn raw(self) -> u64 {
    self.0
  }
}

/// An open session against a hierarchical content repository.
///
/// Paths are absolute and `/`-separated. Implementations are expected to be
/// callable from several threads at once; the loader never serializes its
/// own access to the store.
pub trait ContentStore: Send + Sync {
  /// Whether the session may read the item at `path`.
  fn read_allowed(&self, path: &str) -> bool;

  /// The item at `path`, or `None` when nothing lives there.
  fn item(&self, path: &str) -> Option<Item>;

  /// Direct children of the node at `path` — nodes and properties both —
  /// in the store's iteration order. The order is stable within one call
  /// but carries no guarantee across calls.
  fn children(&self, path: &str) -> Vec<Item>;

  /// Open the binary stream of the property at `path`.
  fn stream(&self, path: &str) -> Result<Box<dyn Read + Send>, StoreFailure>;

  /// Size in bytes of the property at `path`.
  fn size(&self, path: &str) -> Result<u64, StoreFailure>;

  /// Last modification of the property at `path`, in milliseconds since
  /// the Unix epoch.
  fn last_modified_ms(&self, path: &str) -> Result<i64, StoreFailure>;

  /// Mint a URL for the item at `path`.
  fn url(&self, path: &str) -> Option<Url>;

  /// Register `listener` for the given event kinds anywhere in the store.
  fn subscribe(&self, kinds: &[EventKind], listener: Arc<dyn EventListener>) -> SubscriptionId;

  /// Drop a subscription. Unknown ids are ignored.
  fn unsubscribe(&self, id: SubscriptionId);

  /// Whether the session is still usable.
  fn alive(&self) -> bool;
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as i64)
    .unwrap_or(0)
}
