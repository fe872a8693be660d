//! Pattern paths: wildcard search paths expanded against a live store.
//!
//! A search path is configured as a list of *patterns* — slash-separated
//! segments where each segment is a `|`-disjunction of globs and `*` matches
//! any run of characters. [`PatternPath`] turns that list into concrete store
//! paths on demand; [`DynamicPatternPath`] additionally watches the store and
//! tells its listeners when the expansion may have changed.

use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace};

use crate::store::{ContentStore, Event, EventKind, EventListener, SubscriptionId};

/// One canonicalized search-path pattern.
#[derive(Clone, Debug)]
struct Pattern {
  raw: String,
  segments: Vec<Segment>,
  literal: bool,
}

#[derive(Clone, Debug)]
struct Segment {
  disjuncts: Vec<String>,
}

impl Pattern {
  /// Canonicalize one pattern string: trailing slashes are stripped and
  /// strings that end up empty are discarded.
  fn new(raw: &str) -> Option<Pattern> {
    let raw = raw.trim_end_matches('/');
    if raw.is_empty() {
      return None;
    }
    let literal = !raw.contains('*') && !raw.contains('|');
    let segments: Vec<Segment> = raw
      .split('/')
      .filter(|s| !s.is_empty())
      .map(|s| Segment {
        disjuncts: s.split('|').map(str::to_owned).collect(),
      })
      .collect();
    if segments.is_empty() {
      return None;
    }
    Some(Pattern {
      raw: raw.to_owned(),
      segments,
      literal,
    })
  }

  /// Whether `names` — a path already split into segments — is covered by
  /// this pattern. Only same-depth paths can be part of the expansion, so
  /// the segment counts must agree.
  fn matches_segments(&self, names: &[&str]) -> bool {
    self.segments.len() == names.len()
      && self
        .segments
        .iter()
        .zip(names)
        .all(|(segment, name)| segment.matches(name))
  }
}

impl Segment {
  fn matches(&self, name: &str) -> bool {
    self.disjuncts.iter().any(|d| glob_matches(d, name))
  }
}

/// Match one glob disjunct against a name.
///
/// A lone `*` matches anything. Otherwise the glob is split on `*` into
/// fragments which must all occur in the name in order; the first fragment
/// is anchored at the start unless the glob opens with `*`, the last at the
/// end unless it closes with `*`.
fn glob_matches(glob: &str, name: &str) -> bool {
  if glob == "*" {
    return true;
  }
  if !glob.contains('*') {
    return glob == name;
  }
  let mut fragments: Vec<&str> = glob.split('*').filter(|f| !f.is_empty()).collect();
  if fragments.is_empty() {
    // globs like "**" degenerate to "anything"
    return true;
  }
  let mut rest = name;
  if !glob.starts_with('*') {
    let first = fragments.remove(0);
    match rest.strip_prefix(first) {
      Some(after) => rest = after,
      None => return false,
    }
  }
  if !glob.ends_with('*') {
    if let Some(last) = fragments.pop() {
      match rest.strip_suffix(last) {
        Some(before) => rest = before,
        None => return false,
      }
    }
  }
  for fragment in fragments {
    match rest.find(fragment) {
      Some(at) => rest = &rest[at + fragment.len()..],
      None => return false,
    }
  }
  true
}

/// An ordered list of path patterns, expanded on demand against a store.
///
/// Expansion is time-varying: the same `PatternPath` yields different path
/// lists as the store changes. For that reason the type implements no
/// content equality — two pattern paths are "the same" only when they are
/// the same allocation.
pub struct PatternPath {
  store: Arc<dyn ContentStore>,
  patterns: Vec<Pattern>,
}

impl PatternPath {
  /// Create a pattern path over `patterns`.
  ///
  /// Empty strings are discarded and trailing slashes stripped; everything
  /// else is kept verbatim, including patterns that match nothing today.
  pub fn new<P, S>(store: Arc<dyn ContentStore>, patterns: P) -> PatternPath
  where
    P: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let patterns = patterns
      .into_iter()
      .filter_map(|p| Pattern::new(p.as_ref()))
      .collect();
    PatternPath { store, patterns }
  }

  /// The canonicalized pattern strings, in order.
  pub fn pattern_strings(&self) -> Vec<String> {
    self.patterns.iter().map(|p| p.raw.clone()).collect()
  }

  pub(crate) fn store(&self) -> &Arc<dyn ContentStore> {
    &self.store
  }

  /// Expand the patterns against the current store state.
  ///
  /// Every call walks the store afresh and returns a new list. Only paths
  /// that exist right now are returned, with one exception: *literal*
  /// patterns — no `*`, no `|` — pass through verbatim, so a search path
  /// may name items that are yet to appear.
  pub fn expanded_paths(&self) -> Vec<String> {
    let mut paths = Vec::new();
    for pattern in &self.patterns {
      if pattern.literal {
        paths.push(pattern.raw.clone());
        continue;
      }
      self.expand_into(pattern, &mut paths);
    }
    trace!("expanded {} patterns into {} paths", self.patterns.len(), paths.len());
    paths
  }

  fn expand_into(&self, pattern: &Pattern, paths: &mut Vec<String>) {
    let mut candidates = vec![String::from("/")];
    let last_index = pattern.segments.len() - 1;
    for (index, segment) in pattern.segments.iter().enumerate() {
      // properties can only ever match the final segment; everything on
      // the way down must be a node
      let wants_properties = index == last_index;
      let mut next = Vec::new();
      for candidate in &candidates {
        for item in self.store.children(candidate) {
          if !wants_properties && item.is_property() {
            continue;
          }
          if segment.matches(item.name()) {
            next.push(item.path().to_owned());
          }
        }
      }
      candidates = next;
      if candidates.is_empty() {
        break;
      }
    }
    paths.extend(candidates);
  }

  /// Whether a store path could be part of this path's expansion.
  pub(crate) fn matches(&self, path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    self.patterns.iter().any(|p| p.matches_segments(&segments))
  }
}

/// Observer of a [`DynamicPatternPath`].
pub trait PathListener: Send + Sync {
  /// The set of paths the pattern path expands to has (possibly) changed.
  fn paths_changed(&self);
}

/// A [`PatternPath`] wrapper that watches the store for changes to the
/// expanded set.
///
/// The store subscription is lazy: it is acquired when the first listener
/// registers and dropped again when the last one leaves, so an unobserved
/// path costs the store nothing. Listeners are held weakly; a listener that
/// has been dropped elsewhere is pruned on the next registration change.
pub struct DynamicPatternPath {
  path: Arc<PatternPath>,
  listeners: Mutex<Vec<Weak<dyn PathListener>>>,
  subscription: Mutex<Option<SubscriptionId>>,
  me: Weak<DynamicPatternPath>,
}

impl DynamicPatternPath {
  pub fn new(path: Arc<PatternPath>) -> Arc<DynamicPatternPath> {
    Arc::new_cyclic(|me| DynamicPatternPath {
      path,
      listeners: Mutex::new(Vec::new()),
      subscription: Mutex::new(None),
      me: me.clone(),
    })
  }

  /// The wrapped pattern path.
  pub fn path(&self) -> &Arc<PatternPath> {
    &self.path
  }

  /// Register a listener, acquiring the store subscription if it is the
  /// first one.
  pub fn add_listener(&self, listener: &Arc<dyn PathListener>) {
    let mut listeners = self.listeners.lock().unwrap();
    if listeners.is_empty() {
      if let Some(me) = self.me.upgrade() {
        let id = self.path.store().subscribe(&EventKind::STRUCTURAL, me);
        *self.subscription.lock().unwrap() = Some(id);
        debug!("pattern path subscribed to store events");
      }
    }
    listeners.push(Arc::downgrade(listener));
  }

  /// Deregister a listener, dropping the store subscription when the list
  /// empties.
  pub fn remove_listener(&self, listener: &Arc<dyn PathListener>) {
    let mut listeners = self.listeners.lock().unwrap();
    let target = Arc::as_ptr(listener) as *const ();
    listeners.retain(|weak| weak.as_ptr() as *const () != target && weak.strong_count() > 0);
    if listeners.is_empty() {
      if let Some(id) = self.subscription.lock().unwrap().take() {
        self.path.store().unsubscribe(id);
        debug!("pattern path unsubscribed from store events");
      }
    }
  }
}

impl EventListener for DynamicPatternPath {
  fn on_events(&self, events: &[Event]) {
    for event in events {
      if event.kind == EventKind::PropertyChanged {
        // content changes cannot alter the matched set
        continue;
      }
      if self.path.matches(&event.path) {
        // one signal per batch is enough; the next batch is examined anew
        let snapshot: Vec<Arc<dyn PathListener>> = {
          let listeners = self.listeners.lock().unwrap();
          listeners.iter().filter_map(Weak::upgrade).collect()
        };
        debug!(
          "{} matched a search-path pattern, notifying {} listeners",
          event.path,
          snapshot.len()
        );
        for listener in snapshot {
          listener.paths_changed();
        }
        return;
      }
    }
  }
}
