//! Search-path entries.
//!
//! A [`PathEntry`] is one element of a loader's search path. The variant is
//! picked once, at construction time, and never changes:
//!
//!   - a path with a trailing `/` is a [`Directory`](PathEntry::Directory)
//!     entry resolving names against properties below the node;
//!   - a property that streams as a bundle becomes an
//!     [`Archive`](PathEntry::Archive) entry, or an
//!     [`Expanded`](PathEntry::Expanded) entry when the loader is configured
//!     to spool bundles into memory;
//!   - everything else falls back to a directory entry with `/` appended.
//!
//! Entries never let a failure cross over to the loader: a denied read, a
//! vanished item or a broken stream is logged and reported as *absent*, and
//! the loader simply moves on to the next entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, warn};
use thiserror::Error;
use url::Url;

use crate::archive::{self, ArchiveError, Manifest, MemberInfo, MANIFEST_NAME};
use crate::resource::Origin;
use crate::store::{ContentStore, StoreFailure};

#[derive(Debug, Error)]
enum ProbeFailure {
  #[error("no item")]
  Missing,
  #[error("not a property")]
  NotAProperty,
  #[error(transparent)]
  Store(#[from] StoreFailure),
  #[error(transparent)]
  Archive(#[from] ArchiveError),
}

/// One element of a loader's search path.
pub enum PathEntry {
  /// A directory-like node; resources are properties below it.
  Directory(DirectoryEntry),
  /// A bundle property, read member by member through its central
  /// directory.
  Archive(ArchiveEntry),
  /// A bundle property whose members are spooled into memory on first use.
  Expanded(ExpandedEntry),
}

impl PathEntry {
  /// Build the entry for a candidate search path, or report that the path
  /// cannot back one.
  pub fn create(
    store: &Arc<dyn ContentStore>,
    path: &str,
    expand_archives: bool,
  ) -> Option<PathEntry> {
    if !store.read_allowed(path) {
      warn!("read access denied on {}, dropping path entry", path);
      return None;
    }
    if path.ends_with('/') {
      return Some(PathEntry::Directory(DirectoryEntry::new(
        store.clone(),
        path.to_owned(),
      )));
    }
    match Self::probe_archive(store, path) {
      Ok(()) => {
        if expand_archives {
          debug!("{} streams as a bundle, expanding in memory", path);
          Some(PathEntry::Expanded(ExpandedEntry::new(
            store.clone(),
            path.to_owned(),
          )))
        } else {
          debug!("{} streams as a bundle", path);
          Some(PathEntry::Archive(ArchiveEntry::new(
            store.clone(),
            path.to_owned(),
          )))
        }
      }
      Err(err) => {
        debug!("{} does not stream as a bundle ({}), treating as directory", path, err);
        let mut dir = path.to_owned();
        dir.push('/');
        Some(PathEntry::Directory(DirectoryEntry::new(store.clone(), dir)))
      }
    }
  }

  fn probe_archive(store: &Arc<dyn ContentStore>, path: &str) -> Result<(), ProbeFailure> {
    match store.item(path) {
      Some(item) if item.is_property() => {}
      Some(_) => return Err(ProbeFailure::NotAProperty),
      None => return Err(ProbeFailure::Missing),
    }
    let mut stream = store.stream(path)?;
    archive::probe(&mut stream)?;
    Ok(())
  }

  /// The store path backing this entry. Directory paths carry their
  /// trailing `/`.
  pub fn path(&self) -> &str {
    match self {
      PathEntry::Directory(e) => &e.path,
      PathEntry::Archive(e) => &e.path,
      PathEntry::Expanded(e) => &e.path,
    }
  }

  pub(crate) fn store(&self) -> &Arc<dyn ContentStore> {
    match self {
      PathEntry::Directory(e) => &e.store,
      PathEntry::Archive(e) => &e.store,
      PathEntry::Expanded(e) => &e.store,
    }
  }

  /// The base URL of the entry, computed once per entry.
  pub fn url(&self) -> Option<Url> {
    let (store, path, cell) = match self {
      PathEntry::Directory(e) => (&e.store, &e.path, &e.base_url),
      PathEntry::Archive(e) => (&e.store, &e.path, &e.base_url),
      PathEntry::Expanded(e) => (&e.store, &e.path, &e.base_url),
    };
    cell.get_or_init(|| store.url(path)).clone()
  }

  /// Resolve `name` to its origin within this entry, or report absent.
  pub fn locate(&self, name: &str) -> Option<Origin> {
    match self {
      PathEntry::Directory(e) => e.locate(name),
      PathEntry::Archive(e) => e.locate(name),
      PathEntry::Expanded(e) => e.locate(name),
    }
  }

  /// The bundle manifest, when this entry is a bundle that carries one.
  pub fn manifest(&self) -> Option<Manifest> {
    match self {
      PathEntry::Directory(_) => None,
      PathEntry::Archive(e) => match e.locate(MANIFEST_NAME)? {
        Origin::Member(info) => e.read_member(info).map(|bytes| Manifest::parse(&bytes)),
        _ => None,
      },
      PathEntry::Expanded(e) => match e.locate(MANIFEST_NAME)? {
        Origin::Spooled(bytes) => Some(Manifest::parse(&bytes)),
        _ => None,
      },
    }
  }

  /// Bytes of a bundle member previously located in this entry.
  pub(crate) fn read_member(&self, info: MemberInfo) -> Option<Vec<u8>> {
    match self {
      PathEntry::Archive(e) => e.read_member(info),
      _ => None,
    }
  }

  /// Clone this entry for another owning loader.
  ///
  /// The copy shares the store path identity but starts with cold mutable
  /// sub-state, rebound to `store`.
  pub fn copy(&self, store: &Arc<dyn ContentStore>) -> PathEntry {
    match self {
      PathEntry::Directory(e) => {
        PathEntry::Directory(DirectoryEntry::new(store.clone(), e.path.clone()))
      }
      PathEntry::Archive(e) => {
        PathEntry::Archive(ArchiveEntry::new(store.clone(), e.path.clone()))
      }
      PathEntry::Expanded(e) => {
        PathEntry::Expanded(ExpandedEntry::new(store.clone(), e.path.clone()))
      }
    }
  }
}

impl fmt::Debug for PathEntry {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      PathEntry::Directory(e) => f.debug_tuple("Directory").field(&e.path).finish(),
      PathEntry::Archive(e) => f.debug_tuple("Archive").field(&e.path).finish(),
      PathEntry::Expanded(e) => f.debug_tuple("Expanded").field(&e.path).finish(),
    }
  }
}

/// Directory-backed search-path entry.
pub struct DirectoryEntry {
  store: Arc<dyn ContentStore>,
  path: String,
  base_url: OnceLock<Option<Url>>,
}

impl DirectoryEntry {
  fn new(store: Arc<dyn ContentStore>, path: String) -> DirectoryEntry {
    DirectoryEntry {
      store,
      path,
      base_url: OnceLock::new(),
    }
  }

  fn locate(&self, name: &str) -> Option<Origin> {
    let path = format!("{}{}", self.path, name);
    match self.store.item(&path) {
      Some(item) if item.is_property() => Some(Origin::Property(path)),
      _ => None,
    }
  }
}

/// Bundle-backed search-path entry reading members off the property stream.
pub struct ArchiveEntry {
  store: Arc<dyn ContentStore>,
  path: String,
  index: Mutex<Option<HashMap<String, MemberInfo>>>,
  base_url: OnceLock<Option<Url>>,
}

impl ArchiveEntry {
  fn new(store: Arc<dyn ContentStore>, path: String) -> ArchiveEntry {
    ArchiveEntry {
      store,
      path,
      index: Mutex::new(None),
      base_url: OnceLock::new(),
    }
  }

  fn locate(&self, name: &str) -> Option<Origin> {
    let mut index = self.index.lock().unwrap();
    if index.is_none() {
      *index = Some(self.build_index());
    }
    index
      .as_ref()
      .and_then(|i| i.get(name).copied())
      .map(Origin::Member)
  }

  fn build_index(&self) -> HashMap<String, MemberInfo> {
    match self.try_index() {
      Ok(index) => {
        debug!("indexed bundle {} ({} members)", self.path, index.len());
        index
      }
      Err(err) => {
        warn!("cannot index bundle {}: {}", self.path, err);
        HashMap::new()
      }
    }
  }

  fn try_index(&self) -> Result<HashMap<String, MemberInfo>, ProbeFailure> {
    let mut stream = self.store.stream(&self.path)?;
    Ok(archive::read_index(&mut stream)?)
  }

  fn read_member(&self, info: MemberInfo) -> Option<Vec<u8>> {
    match self.try_read_member(info) {
      Ok(bytes) => Some(bytes),
      Err(err) => {
        warn!("cannot read bundle member in {}: {}", self.path, err);
        None
      }
    }
  }

  fn try_read_member(&self, info: MemberInfo) -> Result<Vec<u8>, ProbeFailure> {
    let mut stream = self.store.stream(&self.path)?;
    Ok(archive::read_member(&mut stream, info)?)
  }
}

/// Bundle-backed search-path entry holding every member in memory.
///
/// Spooling trades memory for read-time latency: the property stream is
/// opened once and never re-seeked afterwards.
pub struct ExpandedEntry {
  store: Arc<dyn ContentStore>,
  path: String,
  members: Mutex<Option<HashMap<String, Arc<[u8]>>>>,
  base_url: OnceLock<Option<Url>>,
}

impl ExpandedEntry {
  fn new(store: Arc<dyn ContentStore>, path: String) -> ExpandedEntry {
    ExpandedEntry {
      store,
      path,
      members: Mutex::new(None),
      base_url: OnceLock::new(),
    }
  }

  fn locate(&self, name: &str) -> Option<Origin> {
    let mut members = self.members.lock().unwrap();
    if members.is_none() {
      *members = Some(self.spool());
    }
    members
      .as_ref()
      .and_then(|m| m.get(name).cloned())
      .map(Origin::Spooled)
  }

  fn spool(&self) -> HashMap<String, Arc<[u8]>> {
    match self.try_spool() {
      Ok(members) => {
        debug!("spooled bundle {} ({} members)", self.path, members.len());
        members
      }
      Err(err) => {
        warn!("cannot spool bundle {}: {}", self.path, err);
        HashMap::new()
      }
    }
  }

  fn try_spool(&self) -> Result<HashMap<String, Arc<[u8]>>, ProbeFailure> {
    let mut stream = self.store.stream(&self.path)?;
    Ok(archive::spool(&mut stream)?)
  }
}
