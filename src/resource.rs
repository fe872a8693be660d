//! Located resources and their expiry model.

use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;
use url::Url;

use crate::archive::{Manifest, MemberInfo};
use crate::definer::ClassDefiner;
use crate::entry::PathEntry;
use crate::store::now_millis;

/// Where a resource's bytes come from.
#[derive(Clone, Debug)]
pub enum Origin {
  /// A property stream in the store.
  Property(String),
  /// Bytes inside a bundle, addressed through its central directory.
  Member(MemberInfo),
  /// Bytes held by an expanded bundle's in-memory cache.
  Spooled(Arc<[u8]>),
}

/// A resource found along the search path.
///
/// A `Resource` remembers the entry it was found in, where its bytes come
/// from and when it was constructed. Staleness is decided against its
/// *expiry witness* — the store property whose last-modification time must
/// stay at or below the construction stamp — and latches: once a resource
/// has expired it stays expired.
///
/// When the loader defines a class out of the resource's bytes the class is
/// kept here too; such a resource is *realized*, and only realized resources
/// make a dynamic loader dirty when they expire behind its back.
pub struct Resource<D>
where
  D: ClassDefiner,
{
  entry: Arc<PathEntry>,
  name: String,
  origin: Origin,
  load_time_ms: i64,
  expired: AtomicBool,
  class: Mutex<Option<D::Class>>,
}

impl<D> Resource<D>
where
  D: ClassDefiner,
{
  pub(crate) fn new(entry: Arc<PathEntry>, name: &str, origin: Origin) -> Resource<D> {
    Resource {
      entry,
      name: name.to_owned(),
      origin,
      load_time_ms: now_millis(),
      expired: AtomicBool::new(false),
      class: Mutex::new(None),
    }
  }

  /// The name the resource was resolved under.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// The entry the resource was found in.
  pub fn entry(&self) -> &Arc<PathEntry> {
    &self.entry
  }

  /// When the resource was constructed, in milliseconds since the epoch.
  pub fn load_time_ms(&self) -> i64 {
    self.load_time_ms
  }

  /// The store property whose modification time decides staleness: the
  /// property itself for directory hits, the bundle property for bundle
  /// members.
  pub fn expiry_witness(&self) -> &str {
    match &self.origin {
      Origin::Property(path) => path,
      Origin::Member(_) | Origin::Spooled(_) => self.entry.path(),
    }
  }

  /// The resource's own URL. Bundle members are addressed as a fragment of
  /// the bundle URL.
  pub fn url(&self) -> Option<Url> {
    match &self.origin {
      Origin::Property(path) => self.entry.store().url(path),
      Origin::Member(_) | Origin::Spooled(_) => {
        let mut url = self.entry.url()?;
        url.set_fragment(Some(&self.name));
        Some(url)
      }
    }
  }

  /// The URL identifying the code source: the owning entry, not the member.
  pub fn code_source_url(&self) -> Option<Url> {
    self.entry.url()
  }

  /// Size in bytes, when the store can tell.
  pub fn size(&self) -> Option<u64> {
    match &self.origin {
      Origin::Property(path) => match self.entry.store().size(path) {
        Ok(size) => Some(size),
        Err(err) => {
          warn!("cannot size {}: {}", path, err);
          None
        }
      },
      Origin::Member(info) => Some(u64::from(info.size)),
      Origin::Spooled(bytes) => Some(bytes.len() as u64),
    }
  }

  /// Last modification of the expiry witness.
  pub fn last_modified_ms(&self) -> Option<i64> {
    let witness = self.expiry_witness();
    match self.entry.store().last_modified_ms(witness) {
      Ok(ms) => Some(ms),
      Err(err) => {
        warn!("cannot read modification time of {}: {}", witness, err);
        None
      }
    }
  }

  /// The resource bytes. Failures are logged and read as absent.
  pub fn bytes(&self) -> Option<Vec<u8>> {
    match &self.origin {
      Origin::Property(path) => {
        let mut stream = match self.entry.store().stream(path) {
          Ok(stream) => stream,
          Err(err) => {
            warn!("cannot open {}: {}", path, err);
            return None;
          }
        };
        let mut buf = Vec::new();
        match stream.read_to_end(&mut buf) {
          Ok(_) => Some(buf),
          Err(err) => {
            warn!("cannot read {}: {}", path, err);
            None
          }
        }
      }
      Origin::Member(info) => self.entry.read_member(*info),
      Origin::Spooled(bytes) => Some(bytes.to_vec()),
    }
  }

  /// The bundle manifest, for bundle-backed resources.
  pub fn manifest(&self) -> Option<Manifest> {
    match self.origin {
      Origin::Property(_) => None,
      Origin::Member(_) | Origin::Spooled(_) => self.entry.manifest(),
    }
  }

  /// Certificates attached to the resource's bundle. The bundle format
  /// carries no signature blocks, so the list is empty; directory hits
  /// never have certificates at all.
  pub fn certificates(&self) -> &[Vec<u8>] {
    &[]
  }

  /// Whether the resource has been marked stale.
  pub fn is_expired(&self) -> bool {
    self.expired.load(Ordering::Acquire)
  }

  /// Latch the expired flag.
  pub(crate) fn mark_expired(&self) {
    self.expired.store(true, Ordering::Release);
  }

  /// Evaluate the expiry predicate, latching the flag when it fires.
  ///
  /// When the witness cannot be read the resource counts as modified right
  /// now, which errs toward invalidation.
  pub fn check_expired(&self) -> bool {
    if self.is_expired() {
      return true;
    }
    let witness = self.expiry_witness();
    let modified = match self.entry.store().last_modified_ms(witness) {
      Ok(ms) => ms,
      Err(err) => {
        warn!("cannot read expiry witness {}: {}", witness, err);
        now_millis()
      }
    };
    if modified > self.load_time_ms {
      self.mark_expired();
      true
    } else {
      false
    }
  }

  /// The class defined through this resource, if any.
  pub fn defined_class(&self) -> Option<D::Class> {
    self.class.lock().unwrap().clone()
  }

  /// Whether a class has been defined through this resource.
  pub fn is_realized(&self) -> bool {
    self.class.lock().unwrap().is_some()
  }

  /// Record the defined class. The first writer wins; the canonical class
  /// is returned either way.
  pub(crate) fn realize(&self, class: D::Class) -> D::Class {
    let mut slot = self.class.lock().unwrap();
    slot.get_or_insert(class).clone()
  }
}

impl<D> fmt::Debug for Resource<D>
where
  D: ClassDefiner,
{
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Resource")
      .field("name", &self.name)
      .field("origin", &self.origin)
      .field("expired", &self.is_expired())
      .field("realized", &self.is_realized())
      .finish()
  }
}
