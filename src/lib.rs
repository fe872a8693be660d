//! Hot-invalidating class and resource loading over hierarchical content
//! repositories.
//!
//! # Foreword
//!
//! This crate resolves named resources — class bytecode and arbitrary files
//! — out of a hierarchical content store, along an ordered, pattern-driven
//! search path. Verdicts are cached both ways (hits *and* misses), and a
//! dynamic flavour of the loader watches the store so that the cache never
//! silently serves stale content: the moment something it handed out is
//! superseded, the loader raises a monotone *dirty* flag and asks to be
//! replaced.
//!
//! Three ideas carry the whole design:
//!
//!   - **The store is a seam.** The repository appears only as the
//!     [`ContentStore`] trait: items at paths, property streams, child
//!     iteration and an event subscription. Anything that can wear that
//!     trait — the bundled in-memory [`MemoryStore`], or your own binding —
//!     can serve classes.
//!   - **The search path is live.** Patterns like `/app/*/classes` are
//!     re-expanded against the store as it changes; search-path elements
//!     come and go at runtime without rebuilding the loader by hand.
//!   - **Classes don't unload.** Once bytes have been handed to the host
//!     runtime there is no taking them back, so invalidation is a
//!     *replacement* protocol: `is_dirty` tells you when, and
//!     [`reinstantiate`](DynamicLoader::reinstantiate) builds the successor
//!     loader with the same configuration.
//!
//! # The search path
//!
//! A [`Loader`] is configured with a list of patterns. Each expands to zero
//! or more store paths, and every path becomes a [`PathEntry`]:
//!
//!   - paths ending in `/` (and anything that is not a bundle) resolve
//!     names against **properties below a node**, like a classes directory;
//!   - a property that streams as a *bundle* — the packed archive format in
//!     [`archive`] — resolves names against its members, either straight
//!     off the property stream or spooled into memory when the loader is
//!     built with [`LoaderOpt::set_expand_archives`].
//!
//! Look-ups walk the entries in order and the first hit wins, so earlier
//! entries shadow later ones exactly the way a classpath does.
//!
//! Patterns with no wildcards pass through expansion verbatim even when
//! nothing exists at that path yet; the entry starts empty and the name
//! resolves as soon as the content appears.
//!
//! # Loading a class
//!
//! Defining a class out of bytes is host-runtime business, so the crate
//! keeps it behind the [`ClassDefiner`] trait, mirroring how the store side
//! stays behind [`ContentStore`]. The loader feeds the definer the bytes,
//! the code-source URL and the bundle manifest when there is one, and
//! caches whatever handle the definer returns on the resource itself:
//!
//! ```
//! use std::sync::Arc;
//! use hotclass::{ClassDefiner, DynamicLoader, Manifest, MemoryStore};
//! use url::Url;
//!
//! // A definer that just records what it was given.
//! struct Recorder;
//!
//! struct Defined {
//!   name: String,
//!   len: usize,
//! }
//!
//! impl ClassDefiner for Recorder {
//!   type Class = Arc<Defined>;
//!   type Error = std::convert::Infallible;
//!
//!   fn define(
//!     &self,
//!     name: &str,
//!     bytes: &[u8],
//!     _code_source: Option<&Url>,
//!     _manifest: Option<&Manifest>,
//!   ) -> Result<Self::Class, Self::Error> {
//!     Ok(Arc::new(Defined {
//!       name: name.to_owned(),
//!       len: bytes.len(),
//!     }))
//!   }
//! }
//!
//! let store = MemoryStore::new("repo");
//! store.put_property("/classes/a/b/C.class", b"\xCA\xFE\xBA\xBEexample");
//!
//! let loader = DynamicLoader::new(store.clone(), Recorder, ["/classes/"]);
//!
//! let class = loader.find_class("a.b.C").unwrap();
//! assert_eq!(class.name, "a.b.C");
//! assert!(!loader.is_dirty());
//!
//! // the store keeps a reference to the loader for event delivery, so
//! // retire it explicitly when you are done
//! loader.destroy();
//! ```
//!
//! # Caching and invalidation
//!
//! Every look-up verdict lands in the loader's cache. A name that resolved
//! keeps resolving to the *same* resource until the loader is replaced; a
//! name that missed is remembered as a miss so the search path is not
//! walked again for it. The negative half is dropped whenever the store
//! gains content (the miss might resolve now); the positive half is never
//! dropped, only flagged.
//!
//! Staleness is decided per resource against its *expiry witness* — the
//! property its bytes came from, or the bundle property for bundle members.
//! A [`DynamicLoader`] keeps an index from witness paths to cached
//! resources and reacts to store events: a change to a witness expires its
//! resource on the spot, and if a class was defined through that resource,
//! the loader goes dirty. Pattern-path changes (an entry appearing,
//! disappearing or moving) rebuild the entry list and dirty the loader
//! unconditionally.
//!
//! `is_dirty` is deliberately cheap and monotone: destroyed, flagged, or
//! dead session. Poll it (or call
//! [`should_reload_any`](DynamicLoader::should_reload_any) to actively
//! probe witnesses) and swap the loader out when it answers `true`.
//!
//! # Picking a store
//!
//! The crate ships [`MemoryStore`], an in-memory tree with synchronous
//! event delivery — the test suite runs on it. Bindings to real content
//! repositories implement [`ContentStore`] and get the entire loader stack
//! for free.

pub mod archive;
pub mod definer;
pub mod dynamic;
pub mod entry;
pub mod loader;
pub mod memory;
pub mod pattern;
pub mod resource;
pub mod store;

pub use crate::archive::{ArchiveError, Manifest};
pub use crate::definer::ClassDefiner;
pub use crate::dynamic::DynamicLoader;
pub use crate::entry::PathEntry;
pub use crate::loader::{ClassError, Destroyed, Loader, LoaderOpt};
pub use crate::memory::MemoryStore;
pub use crate::pattern::{DynamicPatternPath, PathListener, PatternPath};
pub use crate::resource::{Origin, Resource};
pub use crate::store::{
  ContentStore, Event, EventKind, EventListener, Item, StoreFailure, SubscriptionId,
};
