//! The loader engine.
//!
//! A [`Loader`] owns an ordered list of [`PathEntry`] values rebuilt from a
//! [`PatternPath`], services class and resource look-ups against it and
//! remembers every verdict in a cache — hits *and* misses. Misses are
//! evicted by [`Loader::clean_not_found`] whenever the store may have gained
//! the missing name; hits are never evicted, only flagged stale, and carry
//! until the loader is replaced wholesale.
//!
//! The loader on its own knows nothing about store events; that is
//! [`DynamicLoader`](crate::dynamic::DynamicLoader)'s layer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use thiserror::Error;
use url::Url;

use crate::definer::ClassDefiner;
use crate::entry::PathEntry;
use crate::pattern::PatternPath;
use crate::resource::Resource;
use crate::store::ContentStore;

/// Operation on a loader that has been destroyed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("loader has been destroyed")]
pub struct Destroyed;

/// Error returned by [`Loader::find_class`].
pub enum ClassError<D>
where
  D: ClassDefiner,
{
  /// No resource for the class after walking the whole search path.
  NotFound(String),
  /// Bytes were found but the definer rejected them.
  DefineFailed(String, D::Error),
}

impl<D> fmt::Debug for ClassError<D>
where
  D: ClassDefiner,
  D::Error: fmt::Debug,
{
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      ClassError::NotFound(name) => f.debug_tuple("NotFound").field(name).finish(),
      ClassError::DefineFailed(name, err) => {
        f.debug_tuple("DefineFailed").field(name).field(err).finish()
      }
    }
  }
}

impl<D> fmt::Display for ClassError<D>
where
  D: ClassDefiner,
{
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      ClassError::NotFound(name) => write!(f, "class {} not found", name),
      ClassError::DefineFailed(name, err) => {
        write!(f, "class {} could not be defined: {}", name, err)
      }
    }
  }
}

impl<D> PartialEq for ClassError<D>
where
  D: ClassDefiner,
  D::Error: PartialEq,
{
  fn eq(&self, rhs: &Self) -> bool {
    match (self, rhs) {
      (ClassError::NotFound(a), ClassError::NotFound(b)) => a == b,
      (ClassError::DefineFailed(a, ae), ClassError::DefineFailed(b, be)) => a == b && ae == be,
      _ => false,
    }
  }
}

impl<D> Eq for ClassError<D>
where
  D: ClassDefiner,
  D::Error: Eq,
{
}

/// One cache slot: a located resource or a remembered miss.
pub(crate) enum CacheSlot<D>
where
  D: ClassDefiner,
{
  Hit(Arc<Resource<D>>),
  Miss,
}

pub(crate) struct LoaderCache<D>
where
  D: ClassDefiner,
{
  /// resource name → verdict
  pub(crate) slots: HashMap<String, CacheSlot<D>>,
  /// expiry-witness path → the most recently cached resource behind it
  pub(crate) expiry: HashMap<String, Arc<Resource<D>>>,
}

impl<D> LoaderCache<D>
where
  D: ClassDefiner,
{
  fn new() -> LoaderCache<D> {
    LoaderCache {
      slots: HashMap::new(),
      expiry: HashMap::new(),
    }
  }

  fn clear(&mut self) {
    self.slots.clear();
    self.expiry.clear();
  }
}

/// Various options to customize a [`Loader`].
#[derive(Clone, Debug)]
pub struct LoaderOpt {
  expand_archives: bool,
}

impl Default for LoaderOpt {
  fn default() -> Self {
    LoaderOpt {
      expand_archives: false,
    }
  }
}

impl LoaderOpt {
  /// Spool bundle members into memory instead of re-reading the property
  /// stream on every access. Trades memory for read-time latency.
  ///
  /// # Default
  ///
  /// Disabled.
  #[inline]
  pub fn set_expand_archives(self, expand: bool) -> Self {
    LoaderOpt {
      expand_archives: expand,
    }
  }

  /// Whether bundles are expanded in memory.
  #[inline]
  pub fn expand_archives(&self) -> bool {
    self.expand_archives
  }
}

/// The composed look-up engine.
///
/// Look-ups may run concurrently from any number of threads. The entry list
/// is snapshotted per walk, so a concurrent rebuild never re-orders a walk
/// already in flight; the cache is consulted and published under a single
/// mutex held only around the probe and the insertion. A race that builds
/// the same resource twice resolves by last writer wins.
pub struct Loader<D>
where
  D: ClassDefiner,
{
  pub(crate) store: Mutex<Option<Arc<dyn ContentStore>>>,
  pub(crate) definer: D,
  pub(crate) opt: LoaderOpt,
  pub(crate) pattern_path: Mutex<Option<Arc<PatternPath>>>,
  pub(crate) entries: Mutex<Arc<Vec<Arc<PathEntry>>>>,
  pub(crate) added: Mutex<Vec<Arc<PathEntry>>>,
  pub(crate) cache: Mutex<LoaderCache<D>>,
  pub(crate) destroyed: AtomicBool,
}

impl<D> Loader<D>
where
  D: ClassDefiner,
{
  /// Create a loader over `patterns` with default options.
  pub fn new<P, S>(store: Arc<dyn ContentStore>, definer: D, patterns: P) -> Loader<D>
  where
    P: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    Self::with_opt(store, definer, patterns, LoaderOpt::default())
  }

  /// Create a loader with explicit options.
  pub fn with_opt<P, S>(
    store: Arc<dyn ContentStore>,
    definer: D,
    patterns: P,
    opt: LoaderOpt,
  ) -> Loader<D>
  where
    P: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let path = Arc::new(PatternPath::new(store.clone(), patterns));
    Self::from_parts(store, definer, path, opt)
  }

  pub(crate) fn from_parts(
    store: Arc<dyn ContentStore>,
    definer: D,
    path: Arc<PatternPath>,
    opt: LoaderOpt,
  ) -> Loader<D> {
    let loader = Loader {
      store: Mutex::new(Some(store)),
      definer,
      opt,
      pattern_path: Mutex::new(Some(path)),
      entries: Mutex::new(Arc::new(Vec::new())),
      added: Mutex::new(Vec::new()),
      cache: Mutex::new(LoaderCache::new()),
      destroyed: AtomicBool::new(false),
    };
    loader.build_path_entries();
    loader
  }

  /// Whether [`Loader::destroy`] has run.
  pub fn is_destroyed(&self) -> bool {
    self.destroyed.load(Ordering::Acquire)
  }

  pub(crate) fn session(&self) -> Option<Arc<dyn ContentStore>> {
    self.store.lock().unwrap().clone()
  }

  pub(crate) fn snapshot_entries(&self) -> Arc<Vec<Arc<PathEntry>>> {
    self.entries.lock().unwrap().clone()
  }

  /// The canonicalized pattern strings the loader was configured with.
  pub fn pattern_strings(&self) -> Vec<String> {
    match self.pattern_path.lock().unwrap().as_ref() {
      Some(path) => path.pattern_strings(),
      None => Vec::new(),
    }
  }

  /// Find a class by its dotted name.
  ///
  /// `a.b.C` resolves through the resource `a/b/C.class`. On the first hit
  /// the definer is invoked with the bytes, the code-source URL and the
  /// bundle manifest when there is one; the defined class is kept on the
  /// resource, so a second call returns the same class without touching the
  /// store again.
  pub fn find_class(&self, name: &str) -> Result<D::Class, ClassError<D>> {
    let resource = self
      .lookup(&class_resource_name(name))
      .ok_or_else(|| ClassError::NotFound(name.to_owned()))?;
    if let Some(class) = resource.defined_class() {
      return Ok(class);
    }
    let bytes = resource
      .bytes()
      .ok_or_else(|| ClassError::NotFound(name.to_owned()))?;
    let code_source = resource.code_source_url();
    let manifest = resource.manifest();
    let class = self
      .definer
      .define(name, &bytes, code_source.as_ref(), manifest.as_ref())
      .map_err(|err| ClassError::DefineFailed(name.to_owned(), err))?;
    debug!("defined class {} from {}", name, resource.name());
    Ok(resource.realize(class))
  }

  /// The URL of the first resource with `name` along the search path.
  ///
  /// Populates the cache, positively or negatively.
  pub fn find_resource(&self, name: &str) -> Option<Url> {
    self.lookup(name).and_then(|resource| resource.url())
  }

  /// URLs of every entry that has `name`, in search-path order.
  ///
  /// Multi-hit look-ups have no cache; every call walks the entries.
  pub fn find_resources(&self, name: &str) -> Vec<Url> {
    if self.is_destroyed() {
      return Vec::new();
    }
    let name = name.trim_start_matches('/');
    let entries = self.snapshot_entries();
    let mut urls = Vec::new();
    for entry in entries.iter() {
      if let Some(origin) = entry.locate(name) {
        let resource: Resource<D> = Resource::new(entry.clone(), name, origin);
        if let Some(url) = resource.url() {
          urls.push(url);
        }
      }
    }
    urls
  }

  /// Base URLs of the current search path, in order.
  pub fn urls(&self) -> Vec<Url> {
    self.snapshot_entries().iter().filter_map(|e| e.url()).collect()
  }

  fn lookup(&self, name: &str) -> Option<Arc<Resource<D>>> {
    if self.is_destroyed() {
      return None;
    }
    let name = name.trim_start_matches('/');
    {
      let cache = self.cache.lock().unwrap();
      match cache.slots.get(name) {
        Some(CacheSlot::Hit(resource)) => return Some(resource.clone()),
        Some(CacheSlot::Miss) => return None,
        None => {}
      }
    }
    // the walk runs on a snapshot, outside the cache mutex
    let entries = self.snapshot_entries();
    let mut found = None;
    for entry in entries.iter() {
      if let Some(origin) = entry.locate(name) {
        trace!("{} found in {:?}", name, entry);
        found = Some(Arc::new(Resource::new(entry.clone(), name, origin)));
        break;
      }
    }
    let mut cache = self.cache.lock().unwrap();
    match found {
      Some(resource) => {
        cache
          .slots
          .insert(name.to_owned(), CacheSlot::Hit(resource.clone()));
        cache
          .expiry
          .insert(resource.expiry_witness().to_owned(), resource.clone());
        Some(resource)
      }
      None => {
        trace!("{} not found, caching the miss", name);
        cache.slots.insert(name.to_owned(), CacheSlot::Miss);
        None
      }
    }
  }

  /// The positively cached resource under `name`, if any.
  pub(crate) fn find_cached(&self, name: &str) -> Option<Arc<Resource<D>>> {
    let cache = self.cache.lock().unwrap();
    match cache.slots.get(name.trim_start_matches('/')) {
      Some(CacheSlot::Hit(resource)) => Some(resource.clone()),
      _ => None,
    }
  }

  pub(crate) fn cached_resources(&self) -> Vec<Arc<Resource<D>>> {
    let cache = self.cache.lock().unwrap();
    cache
      .slots
      .values()
      .filter_map(|slot| match slot {
        CacheSlot::Hit(resource) => Some(resource.clone()),
        CacheSlot::Miss => None,
      })
      .collect()
  }

  pub(crate) fn expiry_hit(&self, path: &str) -> Option<Arc<Resource<D>>> {
    self.cache.lock().unwrap().expiry.get(path).cloned()
  }

  /// Append `path` to the search path.
  ///
  /// The entry is also remembered separately, so rebuilds keep it and
  /// `reinstantiate` carries it over into the replacement loader.
  pub fn add_path(&self, path: &str) {
    if self.is_destroyed() {
      return;
    }
    let store = match self.session() {
      Some(store) => store,
      None => return,
    };
    match PathEntry::create(&store, path, self.opt.expand_archives()) {
      Some(entry) => self.adopt_entry(Arc::new(entry)),
      None => {}
    }
  }

  pub(crate) fn adopt_entry(&self, entry: Arc<PathEntry>) {
    self.added.lock().unwrap().push(entry.clone());
    let mut entries = self.entries.lock().unwrap();
    let mut next = entries.to_vec();
    next.push(entry);
    *entries = Arc::new(next);
  }

  /// Expand the pattern path and rebuild the ordered entry list.
  ///
  /// Duplicate expansion results are dropped, first occurrence wins.
  /// Entries whose path is already in the current list are reused so their
  /// bundle indices survive; separately added entries are kept at the end.
  /// Finishes with [`Loader::clean_not_found`], so names that used to miss
  /// get another chance against the new list. Positive cache slots are left
  /// alone — the entries backing them stay alive through the resources
  /// that reference them.
  pub fn build_path_entries(&self) {
    if self.is_destroyed() {
      return;
    }
    let store = match self.session() {
      Some(store) => store,
      None => return,
    };
    let path = match self.pattern_path.lock().unwrap().clone() {
      Some(path) => path,
      None => return,
    };
    let old = self.snapshot_entries();
    let mut next: Vec<Arc<PathEntry>> = Vec::new();
    let mut seen = HashSet::new();
    for candidate in path.expanded_paths() {
      if !seen.insert(candidate.trim_end_matches('/').to_owned()) {
        continue;
      }
      if let Some(prior) = old.iter().find(|e| paths_equal(e.path(), &candidate)) {
        next.push(prior.clone());
      } else if let Some(entry) = PathEntry::create(&store, &candidate, self.opt.expand_archives())
      {
        next.push(Arc::new(entry));
      }
    }
    for entry in self.added.lock().unwrap().iter() {
      if seen.insert(entry.path().trim_end_matches('/').to_owned()) {
        next.push(entry.clone());
      }
    }
    debug!("search path rebuilt with {} entries", next.len());
    *self.entries.lock().unwrap() = Arc::new(next);
    self.clean_not_found();
  }

  /// Evict every remembered miss, so absent names may resolve again.
  /// Idempotent.
  pub fn clean_not_found(&self) {
    let mut cache = self.cache.lock().unwrap();
    cache
      .slots
      .retain(|_, slot| matches!(slot, CacheSlot::Hit(_)));
  }

  /// Whether any look-up has produced a resource so far.
  pub fn has_loaded_resources(&self) -> bool {
    let cache = self.cache.lock().unwrap();
    cache
      .slots
      .values()
      .any(|slot| matches!(slot, CacheSlot::Hit(_)))
  }

  /// Tear the loader down.
  ///
  /// Idempotent. Afterwards every look-up reports absent, `urls` is empty
  /// and `find_class` fails with `NotFound`.
  pub fn destroy(&self) {
    if self.destroyed.swap(true, Ordering::AcqRel) {
      return;
    }
    self.cache.lock().unwrap().clear();
    *self.entries.lock().unwrap() = Arc::new(Vec::new());
    self.added.lock().unwrap().clear();
    *self.pattern_path.lock().unwrap() = None;
    *self.store.lock().unwrap() = None;
    debug!("loader destroyed");
  }
}

/// `a.b.C` → `a/b/C.class`.
fn class_resource_name(name: &str) -> String {
  let mut path = name.replace('.', "/");
  path.push_str(".class");
  path
}

fn paths_equal(a: &str, b: &str) -> bool {
  a.trim_end_matches('/') == b.trim_end_matches('/')
}
