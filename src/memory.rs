//! An in-memory content store.
//!
//! [`MemoryStore`] is a complete [`ContentStore`] binding backed by a
//! mutex-guarded path tree. It is what the test suite runs against, and it
//! is perfectly serviceable for embedders that want to serve classes out of
//! process memory; it is *not* a persistence layer.
//!
//! Mutations emit event batches synchronously on the mutating thread,
//! serialized by a delivery mutex, which matches the serialized-delivery
//! contract of the trait. Modification stamps come from a logical clock
//! that only moves forward; [`MemoryStore::advance_clock`] pushes it into
//! the future so expiry tests can separate a load from the change that
//! should expire it without sleeping.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;
use url::Url;

use crate::store::{
  now_millis, ContentStore, Event, EventKind, EventListener, Item, StoreFailure, SubscriptionId,
};

#[derive(Clone)]
enum Slot {
  Node,
  Property { bytes: Arc<Vec<u8>>, modified_ms: i64 },
}

#[derive(Clone)]
struct Subscriber {
  id: u64,
  kinds: Vec<EventKind>,
  listener: Arc<dyn EventListener>,
}

/// An in-memory [`ContentStore`].
pub struct MemoryStore {
  name: String,
  tree: Mutex<BTreeMap<String, Slot>>,
  clock: Mutex<i64>,
  denied: Mutex<Vec<String>>,
  subscribers: Mutex<Vec<Subscriber>>,
  delivery: Mutex<()>,
  next_subscription: AtomicU64,
  opens: AtomicU64,
  open: AtomicBool,
}

impl MemoryStore {
  /// Create an empty store whose URLs live under `mem://<name>`.
  pub fn new(name: &str) -> Arc<MemoryStore> {
    Arc::new(MemoryStore {
      name: name.to_owned(),
      tree: Mutex::new(BTreeMap::new()),
      clock: Mutex::new(now_millis()),
      denied: Mutex::new(Vec::new()),
      subscribers: Mutex::new(Vec::new()),
      delivery: Mutex::new(()),
      next_subscription: AtomicU64::new(1),
      opens: AtomicU64::new(0),
      open: AtomicBool::new(true),
    })
  }

  fn now(&self) -> i64 {
    let mut clock = self.clock.lock().unwrap();
    *clock = (*clock).max(now_millis());
    *clock
  }

  /// Push the store clock `ms` into the future.
  ///
  /// Modification stamps never move backwards, so everything written after
  /// this call is strictly newer than everything read before it.
  pub fn advance_clock(&self, ms: i64) {
    let mut clock = self.clock.lock().unwrap();
    *clock = (*clock).max(now_millis()) + ms;
  }

  /// Create a node, along with any missing ancestors.
  pub fn add_node(&self, path: &str) {
    let mut events = Vec::new();
    {
      let mut tree = self.tree.lock().unwrap();
      ensure_nodes(&mut tree, path, &mut events);
    }
    self.deliver(events);
  }

  /// Create or overwrite a property. Missing ancestor nodes are created on
  /// the way.
  pub fn put_property(&self, path: &str, bytes: &[u8]) {
    let mut events = Vec::new();
    {
      let mut tree = self.tree.lock().unwrap();
      if let Some(parent) = parent_path(path) {
        ensure_nodes(&mut tree, &parent, &mut events);
      }
      let kind = if matches!(tree.get(path), Some(Slot::Property { .. })) {
        EventKind::PropertyChanged
      } else {
        EventKind::PropertyAdded
      };
      let stamp = self.now();
      tree.insert(
        path.to_owned(),
        Slot::Property {
          bytes: Arc::new(bytes.to_vec()),
          modified_ms: stamp,
        },
      );
      events.push(Event::new(kind, path));
    }
    self.deliver(events);
  }

  /// Remove an item and everything below it.
  pub fn remove(&self, path: &str) {
    let mut events = Vec::new();
    {
      let mut tree = self.tree.lock().unwrap();
      let path = path.trim_end_matches('/');
      let prefix = format!("{}/", path);
      let doomed: Vec<(String, bool)> = tree
        .iter()
        .filter(|(key, _)| key.as_str() == path || key.starts_with(&prefix))
        .map(|(key, slot)| (key.clone(), matches!(slot, Slot::Property { .. })))
        .collect();
      for (key, is_property) in doomed {
        tree.remove(&key);
        let kind = if is_property {
          EventKind::PropertyRemoved
        } else {
          EventKind::NodeRemoved
        };
        events.push(Event::new(kind, &key));
      }
    }
    self.deliver(events);
  }

  /// Deny read access to `prefix` and everything below it.
  pub fn deny(&self, prefix: &str) {
    self.denied.lock().unwrap().push(prefix.to_owned());
  }

  /// Kill the session; [`ContentStore::alive`] reports `false` afterwards.
  pub fn close(&self) {
    self.open.store(false, Ordering::Release);
  }

  /// How many property streams have been opened so far. Test
  /// instrumentation for cache behaviour.
  pub fn stream_opens(&self) -> u64 {
    self.opens.load(Ordering::Relaxed)
  }

  fn deliver(&self, events: Vec<Event>) {
    if events.is_empty() {
      return;
    }
    let subscribers: Vec<Subscriber> = self.subscribers.lock().unwrap().clone();
    // one batch at a time, in store order
    let _serialized = self.delivery.lock().unwrap();
    trace!("delivering {} events to {} subscribers", events.len(), subscribers.len());
    for subscriber in subscribers {
      let batch: Vec<Event> = events
        .iter()
        .filter(|event| subscriber.kinds.contains(&event.kind))
        .cloned()
        .collect();
      if !batch.is_empty() {
        subscriber.listener.on_events(&batch);
      }
    }
  }
}

fn ensure_nodes(tree: &mut BTreeMap<String, Slot>, path: &str, events: &mut Vec<Event>) {
  let mut current = String::new();
  for segment in path.split('/').filter(|s| !s.is_empty()) {
    current.push('/');
    current.push_str(segment);
    if !tree.contains_key(&current) {
      tree.insert(current.clone(), Slot::Node);
      events.push(Event::new(EventKind::NodeAdded, &current));
    }
  }
}

fn parent_path(path: &str) -> Option<String> {
  let trimmed = path.trim_end_matches('/');
  trimmed
    .rfind('/')
    .map(|at| trimmed[..at].to_owned())
    .filter(|parent| !parent.is_empty())
}

impl ContentStore for MemoryStore {
  fn read_allowed(&self, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    !self.denied.lock().unwrap().iter().any(|denied| {
      let denied = denied.trim_end_matches('/');
      path == denied || path.starts_with(&format!("{}/", denied))
    })
  }

  fn item(&self, path: &str) -> Option<Item> {
    let key = path.trim_end_matches('/');
    if key.is_empty() {
      return Some(Item::Node(String::from("/")));
    }
    let tree = self.tree.lock().unwrap();
    match tree.get(key) {
      Some(Slot::Node) => Some(Item::Node(key.to_owned())),
      Some(Slot::Property { .. }) => Some(Item::Property(key.to_owned())),
      None => None,
    }
  }

  fn children(&self, path: &str) -> Vec<Item> {
    let tree = self.tree.lock().unwrap();
    let trimmed = path.trim_end_matches('/');
    let prefix = if trimmed.is_empty() {
      String::from("/")
    } else {
      format!("{}/", trimmed)
    };
    tree
      .iter()
      .filter(|(key, _)| key.starts_with(&prefix) && !key[prefix.len()..].contains('/'))
      .map(|(key, slot)| match slot {
        Slot::Node => Item::Node(key.clone()),
        Slot::Property { .. } => Item::Property(key.clone()),
      })
      .collect()
  }

  fn stream(&self, path: &str) -> Result<Box<dyn Read + Send>, StoreFailure> {
    if !self.alive() {
      return Err(StoreFailure::SessionClosed);
    }
    if !self.read_allowed(path) {
      return Err(StoreFailure::Denied(path.to_owned()));
    }
    let tree = self.tree.lock().unwrap();
    match tree.get(path.trim_end_matches('/')) {
      Some(Slot::Property { bytes, .. }) => {
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(Cursor::new(bytes.as_ref().clone())))
      }
      Some(Slot::Node) => Err(StoreFailure::NotAProperty(path.to_owned())),
      None => Err(StoreFailure::NoSuchItem(path.to_owned())),
    }
  }

  fn size(&self, path: &str) -> Result<u64, StoreFailure> {
    let tree = self.tree.lock().unwrap();
    match tree.get(path.trim_end_matches('/')) {
      Some(Slot::Property { bytes, .. }) => Ok(bytes.len() as u64),
      Some(Slot::Node) => Err(StoreFailure::NotAProperty(path.to_owned())),
      None => Err(StoreFailure::NoSuchItem(path.to_owned())),
    }
  }

  fn last_modified_ms(&self, path: &str) -> Result<i64, StoreFailure> {
    let tree = self.tree.lock().unwrap();
    match tree.get(path.trim_end_matches('/')) {
      Some(Slot::Property { modified_ms, .. }) => Ok(*modified_ms),
      Some(Slot::Node) => Err(StoreFailure::NotAProperty(path.to_owned())),
      None => Err(StoreFailure::NoSuchItem(path.to_owned())),
    }
  }

  fn url(&self, path: &str) -> Option<Url> {
    Url::parse(&format!("mem://{}{}", self.name, path)).ok()
  }

  fn subscribe(&self, kinds: &[EventKind], listener: Arc<dyn EventListener>) -> SubscriptionId {
    let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
    self.subscribers.lock().unwrap().push(Subscriber {
      id,
      kinds: kinds.to_vec(),
      listener,
    });
    SubscriptionId::new(id)
  }

  fn unsubscribe(&self, id: SubscriptionId) {
    self
      .subscribers
      .lock()
      .unwrap()
      .retain(|subscriber| subscriber.id != id.raw());
  }

  fn alive(&self) -> bool {
    self.open.load(Ordering::Acquire)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  struct Recorder {
    seen: Mutex<Vec<Event>>,
    batches: AtomicUsize,
  }

  impl Recorder {
    fn new() -> Arc<Recorder> {
      Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
        batches: AtomicUsize::new(0),
      })
    }
  }

  impl EventListener for Recorder {
    fn on_events(&self, events: &[Event]) {
      self.batches.fetch_add(1, Ordering::SeqCst);
      self.seen.lock().unwrap().extend(events.iter().cloned());
    }
  }

  #[test]
  fn properties_create_their_ancestors() {
    let store = MemoryStore::new("repo");
    store.put_property("/a/b/c.bin", b"x");
    assert_eq!(store.item("/a"), Some(Item::Node(String::from("/a"))));
    assert_eq!(store.item("/a/b"), Some(Item::Node(String::from("/a/b"))));
    assert!(store.item("/a/b/c.bin").unwrap().is_property());
  }

  #[test]
  fn children_are_direct_and_ordered() {
    let store = MemoryStore::new("repo");
    store.put_property("/a/z.bin", b"z");
    store.put_property("/a/a.bin", b"a");
    store.add_node("/a/deep");
    store.put_property("/a/deep/hidden.bin", b"h");
    let names: Vec<String> = store
      .children("/a")
      .into_iter()
      .map(|item| item.name().to_owned())
      .collect();
    assert_eq!(names, vec!["a.bin", "deep", "z.bin"]);
  }

  #[test]
  fn mutations_emit_one_batch() {
    let store = MemoryStore::new("repo");
    let recorder = Recorder::new();
    store.subscribe(&EventKind::ALL, recorder.clone());
    store.put_property("/a/b.bin", b"x");
    assert_eq!(recorder.batches.load(Ordering::SeqCst), 1);
    let seen = recorder.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], Event::new(EventKind::NodeAdded, "/a"));
    assert_eq!(seen[1], Event::new(EventKind::PropertyAdded, "/a/b.bin"));
  }

  #[test]
  fn rewrites_report_changes_and_masks_filter() {
    let store = MemoryStore::new("repo");
    let structural = Recorder::new();
    store.subscribe(&EventKind::STRUCTURAL, structural.clone());
    store.put_property("/a.bin", b"1");
    store.put_property("/a.bin", b"2");
    let seen = structural.seen.lock().unwrap();
    // the PropertyChanged event is filtered by the mask
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, EventKind::PropertyAdded);
  }

  #[test]
  fn unsubscribing_stops_delivery() {
    let store = MemoryStore::new("repo");
    let recorder = Recorder::new();
    let id = store.subscribe(&EventKind::ALL, recorder.clone());
    store.put_property("/a.bin", b"1");
    store.unsubscribe(id);
    store.put_property("/b.bin", b"2");
    assert_eq!(recorder.batches.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn removal_sweeps_the_subtree() {
    let store = MemoryStore::new("repo");
    store.put_property("/a/b/c.bin", b"x");
    store.remove("/a");
    assert_eq!(store.item("/a"), None);
    assert_eq!(store.item("/a/b/c.bin"), None);
  }

  #[test]
  fn denied_prefixes_block_reads() {
    let store = MemoryStore::new("repo");
    store.put_property("/secret/k.bin", b"x");
    store.deny("/secret");
    assert!(!store.read_allowed("/secret/k.bin"));
    assert!(store.read_allowed("/public"));
    assert!(matches!(
      store.stream("/secret/k.bin"),
      Err(StoreFailure::Denied(_))
    ));
  }

  #[test]
  fn clock_only_moves_forward() {
    let store = MemoryStore::new("repo");
    store.put_property("/a.bin", b"1");
    let before = store.last_modified_ms("/a.bin").unwrap();
    store.advance_clock(5_000);
    store.put_property("/a.bin", b"2");
    let after = store.last_modified_ms("/a.bin").unwrap();
    assert!(after >= before + 5_000);
  }
}
