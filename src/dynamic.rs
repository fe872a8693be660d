//! Event-driven loaders.
//!
//! A [`DynamicLoader`] is a [`Loader`] that watches its store. It listens on
//! two distinct planes:
//!
//!   - *store events*, to expire cached resources whose witness property
//!     changed and to re-open the negative cache when something new appears;
//!   - *path changes* from its [`DynamicPatternPath`], to rebuild the entry
//!     list when the expanded search path itself moves.
//!
//! Once anything it handed out may be stale, the loader raises its *dirty*
//! flag and never lowers it again: classes already defined in a host runtime
//! cannot be undefined, so the only way forward is [`reinstantiate`] — build
//! a replacement loader with the same configuration and retire this one.
//!
//! [`reinstantiate`]: DynamicLoader::reinstantiate

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::definer::ClassDefiner;
use crate::loader::{Destroyed, Loader, LoaderOpt};
use crate::pattern::{DynamicPatternPath, PathListener, PatternPath};
use crate::store::{ContentStore, Event, EventKind, EventListener, SubscriptionId};

/// A loader that observes its store and knows when it has gone stale.
///
/// Constructors hand back an `Arc` because the loader stands as its own
/// event and path listener. The store keeps a strong reference to it for
/// event delivery, so a `DynamicLoader` must be torn down explicitly with
/// [`DynamicLoader::destroy`] — or replaced via
/// [`DynamicLoader::reinstantiate`], which destroys it on the way out.
///
/// All of [`Loader`]'s look-up surface is available through deref.
pub struct DynamicLoader<D>
where
  D: ClassDefiner,
{
  loader: Loader<D>,
  dynamic_path: Mutex<Option<Arc<DynamicPatternPath>>>,
  subscription: Mutex<Option<SubscriptionId>>,
  dirty: AtomicBool,
  me: Weak<DynamicLoader<D>>,
}

impl<D> Deref for DynamicLoader<D>
where
  D: ClassDefiner,
{
  type Target = Loader<D>;

  fn deref(&self) -> &Loader<D> {
    &self.loader
  }
}

impl<D> DynamicLoader<D>
where
  D: ClassDefiner,
{
  /// Create a dynamic loader over `patterns` with default options.
  pub fn new<P, S>(store: Arc<dyn ContentStore>, definer: D, patterns: P) -> Arc<DynamicLoader<D>>
  where
    P: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    Self::with_opt(store, definer, patterns, LoaderOpt::default())
  }

  /// Create a dynamic loader with explicit options.
  pub fn with_opt<P, S>(
    store: Arc<dyn ContentStore>,
    definer: D,
    patterns: P,
    opt: LoaderOpt,
  ) -> Arc<DynamicLoader<D>>
  where
    P: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let path = Arc::new(PatternPath::new(store.clone(), patterns));
    let dynamic_path = DynamicPatternPath::new(path.clone());
    let this = Arc::new_cyclic(|me| DynamicLoader {
      loader: Loader::from_parts(store.clone(), definer, path, opt),
      dynamic_path: Mutex::new(Some(dynamic_path)),
      subscription: Mutex::new(None),
      dirty: AtomicBool::new(false),
      me: me.clone(),
    });
    Self::attach(&this, &store);
    this
  }

  fn attach(this: &Arc<DynamicLoader<D>>, store: &Arc<dyn ContentStore>) {
    let id = store.subscribe(&EventKind::ALL, this.clone());
    *this.subscription.lock().unwrap() = Some(id);
    if let Some(path) = this.dynamic_path.lock().unwrap().as_ref() {
      let listener: Arc<dyn PathListener> = this.clone();
      path.add_listener(&listener);
    }
  }

  fn mark_dirty(&self) {
    if !self.dirty.swap(true, Ordering::AcqRel) {
      debug!("loader marked dirty");
    }
  }

  /// Whether the loader should be replaced: destroyed, flagged dirty, or
  /// sitting on a dead session.
  pub fn is_dirty(&self) -> bool {
    if self.loader.is_destroyed() || self.dirty.load(Ordering::Acquire) {
      return true;
    }
    match self.loader.session() {
      Some(store) => !store.alive(),
      None => true,
    }
  }

  /// Decide whether the resource cached under `name` calls for a reload.
  ///
  /// Destroyed loaders always reload; names that were never cached never
  /// do. `force` latches the dirty flag outright; otherwise the expiry
  /// predicate runs and its verdict is propagated into the flag.
  pub fn should_reload(&self, name: &str, force: bool) -> bool {
    if self.loader.is_destroyed() {
      return true;
    }
    let resource = match self.loader.find_cached(name) {
      Some(resource) => resource,
      None => return false,
    };
    if force {
      self.mark_dirty();
      return true;
    }
    let expired = resource.check_expired();
    if expired {
      self.mark_dirty();
    }
    expired
  }

  /// Whether anything the loader has handed out is stale.
  ///
  /// Already-dirty loaders answer immediately; otherwise every cached
  /// resource's expiry predicate runs until the first hit, which latches
  /// the flag.
  pub fn should_reload_any(&self) -> bool {
    if self.is_dirty() {
      return true;
    }
    for resource in self.loader.cached_resources() {
      if resource.check_expired() {
        debug!("{} expired, loader needs a reload", resource.name());
        self.mark_dirty();
        return true;
      }
    }
    false
  }

  /// Swap the pattern list for a new one.
  ///
  /// No-op on a destroyed loader. The old dynamic pattern path is
  /// detached, a new one installed and the entry list rebuilt; when the
  /// cache already holds resources the loader is marked dirty, because
  /// what it handed out may belong to entries that no longer exist or may
  /// now be shadowed.
  pub fn reconfigure<P, S>(&self, patterns: P)
  where
    P: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    if self.loader.is_destroyed() {
      return;
    }
    let store = match self.loader.session() {
      Some(store) => store,
      None => return,
    };
    self.detach_path_listener();
    let path = Arc::new(PatternPath::new(store, patterns));
    let dynamic_path = DynamicPatternPath::new(path.clone());
    *self.loader.pattern_path.lock().unwrap() = Some(path);
    *self.dynamic_path.lock().unwrap() = Some(dynamic_path.clone());
    self.loader.build_path_entries();
    if let Some(me) = self.me.upgrade() {
      let listener: Arc<dyn PathListener> = me;
      dynamic_path.add_listener(&listener);
    }
    if self.loader.has_loaded_resources() {
      self.mark_dirty();
    }
    debug!("loader reconfigured");
  }

  /// Build a replacement loader with the same pattern list and the same
  /// added paths, then destroy this one.
  ///
  /// Classes already defined through this loader cannot be undefined; the
  /// replacement simply starts with an empty realized set. Calling this on
  /// a destroyed loader is an error.
  pub fn reinstantiate(
    &self,
    store: Arc<dyn ContentStore>,
    definer: D,
  ) -> Result<Arc<DynamicLoader<D>>, Destroyed> {
    if self.loader.is_destroyed() {
      return Err(Destroyed);
    }
    let patterns = self.loader.pattern_strings();
    let added = self.loader.added.lock().unwrap().clone();
    let next = DynamicLoader::with_opt(store.clone(), definer, patterns, self.loader.opt.clone());
    for entry in added {
      next.loader.adopt_entry(Arc::new(entry.copy(&store)));
    }
    self.destroy();
    debug!("loader reinstantiated");
    Ok(next)
  }

  /// Detach from the store and the pattern path, then destroy the
  /// underlying loader. Idempotent.
  pub fn destroy(&self) {
    if self.loader.is_destroyed() {
      return;
    }
    if let Some(id) = self.subscription.lock().unwrap().take() {
      if let Some(store) = self.loader.session() {
        store.unsubscribe(id);
      }
    }
    self.detach_path_listener();
    self.loader.destroy();
  }

  fn detach_path_listener(&self) {
    let old = self.dynamic_path.lock().unwrap().take();
    if let (Some(path), Some(me)) = (old, self.me.upgrade()) {
      let listener: Arc<dyn PathListener> = me;
      path.remove_listener(&listener);
    }
  }
}

impl<D> EventListener for DynamicLoader<D>
where
  D: ClassDefiner,
{
  fn on_events(&self, events: &[Event]) {
    if self.loader.is_destroyed() {
      return;
    }
    for event in events {
      if let Some(resource) = self.loader.expiry_hit(&event.path) {
        debug!("{} superseded by {:?} event", event.path, event.kind);
        resource.mark_expired();
        if resource.is_realized() {
          self.mark_dirty();
        }
      } else if event.kind.is_addition() {
        // a name that missed before may resolve now
        self.loader.clean_not_found();
      }
    }
  }
}

impl<D> PathListener for DynamicLoader<D>
where
  D: ClassDefiner,
{
  fn paths_changed(&self) {
    if self.loader.is_destroyed() {
      return;
    }
    debug!("search path expansion changed, rebuilding");
    self.loader.build_path_entries();
    // what was loaded may belong to a retired entry or be shadowed now
    self.mark_dirty();
  }
}
