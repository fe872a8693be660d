use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hotclass::archive::Writer;
use hotclass::{
  ClassDefiner, ClassError, ContentStore, DynamicLoader, DynamicPatternPath, Loader, LoaderOpt,
  Manifest, MemoryStore, PathEntry, PathListener, PatternPath,
};
use url::Url;

/// Bytes the test definer accepts as valid bytecode.
const CLASS_BYTES: &[u8] = b"\xCA\xFE\xBA\xBE hotclass";

#[derive(Debug)]
struct DefinedClass {
  name: String,
  bytes: Vec<u8>,
  code_source: Option<Url>,
  sealed: bool,
}

#[derive(Debug, Eq, PartialEq)]
enum DefineErr {
  Malformed,
}

impl fmt::Display for DefineErr {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      DefineErr::Malformed => f.write_str("malformed bytecode"),
    }
  }
}

struct TestDefiner;

impl ClassDefiner for TestDefiner {
  type Class = Arc<DefinedClass>;
  type Error = DefineErr;

  fn define(
    &self,
    name: &str,
    bytes: &[u8],
    code_source: Option<&Url>,
    manifest: Option<&Manifest>,
  ) -> Result<Self::Class, Self::Error> {
    if !bytes.starts_with(&[0xCA, 0xFE]) {
      return Err(DefineErr::Malformed);
    }
    Ok(Arc::new(DefinedClass {
      name: name.to_owned(),
      bytes: bytes.to_vec(),
      code_source: code_source.cloned(),
      sealed: manifest
        .and_then(|m| m.attribute("Sealed"))
        .map_or(false, |v| v == "true"),
    }))
  }
}

fn bundle(members: &[(&str, &[u8])]) -> Vec<u8> {
  let mut writer = Writer::new(Vec::new()).expect("bundle header");
  for (name, data) in members {
    writer.member(name, data).expect("bundle member");
  }
  writer.finish().expect("bundle directory")
}

fn class_store() -> Arc<MemoryStore> {
  let store = MemoryStore::new("repo");
  store.put_property("/classes/a/b/C.class", CLASS_BYTES);
  store
}

#[test]
fn simple_class_load_hits_the_cache() {
  let store = class_store();
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);

  let first = loader.find_class("a.b.C").expect("class should define");
  assert_eq!(first.name, "a.b.C");
  assert_eq!(first.bytes, CLASS_BYTES);

  let opens = store.stream_opens();
  let second = loader.find_class("a.b.C").expect("cached class");
  // same class object, and the property was not read again
  assert!(Arc::ptr_eq(&first, &second));
  assert_eq!(store.stream_opens(), opens);

  loader.destroy();
}

#[test]
fn repeated_resource_lookups_do_not_rewalk() {
  let store = class_store();
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);

  let first = loader.find_resource("a/b/C.class").expect("resource url");
  assert_eq!(first.as_str(), "mem://repo/classes/a/b/C.class");
  let second = loader.find_resource("a/b/C.class").expect("cached url");
  assert_eq!(first, second);

  loader.destroy();
}

#[test]
fn negative_cache_without_events_stays_negative() {
  let store = class_store();
  let loader = Loader::new(store.clone(), TestDefiner, ["/classes/"]);

  assert!(loader.find_resource("X.class").is_none());
  store.put_property("/classes/X.class", CLASS_BYTES);
  // a plain loader has no event wiring; the miss is still cached
  assert!(loader.find_resource("X.class").is_none());

  // an explicit clean re-opens it
  loader.clean_not_found();
  assert!(loader.find_resource("X.class").is_some());

  loader.destroy();
}

#[test]
fn property_added_event_reopens_the_negative_cache() {
  let store = class_store();
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);

  assert!(loader.find_resource("X.class").is_none());
  store.put_property("/classes/X.class", CLASS_BYTES);
  assert_eq!(
    loader
      .find_resource("X.class")
      .expect("found after event")
      .as_str(),
    "mem://repo/classes/X.class"
  );

  loader.destroy();
}

#[test]
fn bundles_resolve_members_with_the_bundle_as_code_source() {
  let store = MemoryStore::new("repo");
  store.put_property(
    "/lib/jars",
    &bundle(&[
      ("org/x/Y.class", CLASS_BYTES),
      ("meta/manifest", b"Sealed: true\n"),
    ]),
  );
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/lib/jars"]);

  let class = loader.find_class("org.x.Y").expect("bundle member defines");
  let bundle_url = store.url("/lib/jars").unwrap();
  assert_eq!(class.code_source, Some(bundle_url.clone()));
  assert!(class.sealed);

  // the member's own URL is a fragment of the bundle URL
  let member_url = loader.find_resource("org/x/Y.class").unwrap();
  assert_eq!(member_url.fragment(), Some("org/x/Y.class"));
  assert_eq!(loader.urls(), vec![bundle_url]);

  loader.destroy();
}

#[test]
fn entry_variants_follow_the_construction_rules() {
  let store = MemoryStore::new("repo");
  store.put_property("/lib/jars", &bundle(&[("m.bin", b"m")]));
  store.put_property("/plain.txt", b"not a bundle");
  let session: Arc<dyn ContentStore> = store.clone();

  assert!(matches!(
    PathEntry::create(&session, "/classes/", false),
    Some(PathEntry::Directory(_))
  ));
  assert!(matches!(
    PathEntry::create(&session, "/lib/jars", false),
    Some(PathEntry::Archive(_))
  ));
  assert!(matches!(
    PathEntry::create(&session, "/lib/jars", true),
    Some(PathEntry::Expanded(_))
  ));
  // not a bundle: canonicalized into a directory with a trailing slash
  let fallback = PathEntry::create(&session, "/plain.txt", false).unwrap();
  assert!(matches!(fallback, PathEntry::Directory(_)));
  assert_eq!(fallback.path(), "/plain.txt/");

  store.deny("/lib");
  assert!(PathEntry::create(&session, "/lib/jars", false).is_none());
}

#[test]
fn expanded_bundles_spool_once() {
  let store = MemoryStore::new("repo");
  store.put_property("/lib/jars", &bundle(&[("one.bin", b"1"), ("two.bin", b"2")]));
  let loader = DynamicLoader::with_opt(
    store.clone(),
    TestDefiner,
    ["/lib/jars"],
    LoaderOpt::default().set_expand_archives(true),
  );

  assert!(loader.find_resource("one.bin").is_some());
  let opens = store.stream_opens();
  // further members come out of the spool, not the property stream
  assert!(loader.find_resource("two.bin").is_some());
  assert!(loader.find_resource("absent.bin").is_none());
  assert_eq!(store.stream_opens(), opens);

  loader.destroy();
}

#[test]
fn expiry_of_a_realized_class_dirties_the_loader() {
  let store = MemoryStore::new("repo");
  store.put_property("/cls/A.class", CLASS_BYTES);
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/cls/"]);

  loader.find_class("A").expect("class should define");
  assert!(!loader.is_dirty());
  assert!(!loader.should_reload_any());

  store.advance_clock(5_000);
  store.put_property("/cls/A.class", b"\xCA\xFE new bytes");

  assert!(loader.should_reload("A.class", false));
  assert!(loader.should_reload_any());
  assert!(loader.is_dirty());

  loader.destroy();
}

#[test]
fn expiry_of_an_unrealized_resource_does_not_dirty_by_itself() {
  let store = MemoryStore::new("repo");
  store.put_property("/data/r.txt", b"plain data");
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/data/"]);

  loader.find_resource("r.txt").expect("resource url");
  store.advance_clock(5_000);
  store.put_property("/data/r.txt", b"rewritten");

  // the resource expired, but no class was defined through it
  assert!(!loader.is_dirty());
  // an explicit probe still reports and latches the staleness
  assert!(loader.should_reload("r.txt", false));
  assert!(loader.is_dirty());

  loader.destroy();
}

#[test]
fn force_reload_latches_the_dirty_flag() {
  let store = class_store();
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);

  // uncached names never reload, forced or not
  assert!(!loader.should_reload("nope.class", true));
  assert!(!loader.is_dirty());

  loader.find_resource("a/b/C.class").unwrap();
  assert!(loader.should_reload("a/b/C.class", true));
  assert!(loader.is_dirty());

  loader.destroy();
}

#[test]
fn pattern_growth_rebuilds_and_dirties() {
  let store = MemoryStore::new("repo");
  store.put_property("/aclasses/M.class", CLASS_BYTES);
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/*classes/"]);

  assert_eq!(
    loader.urls(),
    vec![Url::parse("mem://repo/aclasses/").unwrap()]
  );
  assert!(loader.find_resource("M.class").is_some());
  assert!(!loader.is_dirty());

  store.add_node("/bclasses");
  assert!(loader.is_dirty());
  assert_eq!(loader.urls().len(), 2);

  // content under the new entry resolves without further ceremony
  store.put_property("/bclasses/N.class", CLASS_BYTES);
  assert!(loader.find_resource("N.class").is_some());

  loader.destroy();
}

#[test]
fn lookup_order_follows_the_search_path() {
  let store = MemoryStore::new("repo");
  store.put_property("/first/M.class", CLASS_BYTES);
  store.put_property("/second/M.class", CLASS_BYTES);
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/first/", "/second/"]);

  let all = loader.find_resources("M.class");
  assert_eq!(
    all,
    vec![
      Url::parse("mem://repo/first/M.class").unwrap(),
      Url::parse("mem://repo/second/M.class").unwrap(),
    ]
  );
  assert_eq!(
    loader.find_resource("M.class").unwrap().as_str(),
    "mem://repo/first/M.class"
  );

  loader.destroy();
}

#[test]
fn denied_paths_are_dropped_from_the_search_path() {
  let store = class_store();
  store.put_property("/secret/S.class", CLASS_BYTES);
  store.deny("/secret");
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/secret/", "/classes/"]);

  assert_eq!(
    loader.urls(),
    vec![Url::parse("mem://repo/classes/").unwrap()]
  );
  assert!(loader.find_resource("S.class").is_none());
  assert!(loader.find_resource("a/b/C.class").is_some());

  loader.destroy();
}

#[test]
fn destroy_is_terminal_and_idempotent() {
  let store = class_store();
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);
  loader.find_class("a.b.C").unwrap();

  loader.destroy();
  loader.destroy();

  assert!(loader.is_destroyed());
  assert!(loader.is_dirty());
  assert!(loader.urls().is_empty());
  assert!(loader.find_resource("a/b/C.class").is_none());
  assert!(loader.find_resources("a/b/C.class").is_empty());
  assert!(matches!(
    loader.find_class("a.b.C"),
    Err(ClassError::NotFound(_))
  ));
  assert!(loader.reinstantiate(store, TestDefiner).is_err());
}

#[test]
fn clean_not_found_is_idempotent() {
  let store = class_store();
  let loader = Loader::new(store, TestDefiner, ["/classes/"]);
  assert!(loader.find_resource("gone.class").is_none());
  loader.clean_not_found();
  loader.clean_not_found();
  // the positive path still works after repeated cleaning
  assert!(loader.find_resource("a/b/C.class").is_some());
  loader.destroy();
}

#[test]
fn added_paths_survive_rebuilds_exactly_once() {
  let store = class_store();
  store.put_property("/extra/E.class", CLASS_BYTES);
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);

  loader.add_path("/extra/");
  assert!(loader.find_resource("E.class").is_some());

  loader.build_path_entries();
  let extra = Url::parse("mem://repo/extra/").unwrap();
  let count = loader.urls().iter().filter(|u| **u == extra).count();
  assert_eq!(count, 1);

  loader.destroy();
}

#[test]
fn reinstantiate_carries_configuration_and_added_paths() {
  let store = class_store();
  store.put_property("/extra/E.class", CLASS_BYTES);
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);
  loader.add_path("/extra/");
  let old_class = loader.find_class("a.b.C").unwrap();

  let next = loader
    .reinstantiate(store.clone(), TestDefiner)
    .expect("live loader reinstantiates");

  assert!(loader.is_destroyed());
  assert!(!next.is_dirty());
  assert_eq!(next.pattern_strings(), vec!["/classes"]);
  assert!(next.find_resource("E.class").is_some());

  // the realized set starts empty: the class is defined afresh
  let new_class = next.find_class("a.b.C").unwrap();
  assert!(!Arc::ptr_eq(&old_class, &new_class));

  next.destroy();
}

#[test]
fn reconfigure_swaps_patterns_and_dirties_when_loaded() {
  let store = class_store();
  store.put_property("/other/O.class", CLASS_BYTES);
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);

  // nothing loaded yet: reconfiguring is clean
  loader.reconfigure(["/classes/", "/other/"]);
  assert!(!loader.is_dirty());
  assert_eq!(loader.urls().len(), 2);

  loader.find_class("a.b.C").unwrap();
  loader.reconfigure(["/other/"]);
  assert!(loader.is_dirty());
  assert!(loader.find_resource("O.class").is_some());

  loader.destroy();
}

#[test]
fn dead_sessions_read_as_dirty() {
  let store = class_store();
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);
  assert!(!loader.is_dirty());
  store.close();
  assert!(loader.is_dirty());
  loader.destroy();
}

#[test]
fn rejected_bytes_surface_as_define_failures() {
  let store = MemoryStore::new("repo");
  store.put_property("/classes/Bad.class", b"not bytecode");
  let loader = DynamicLoader::new(store.clone(), TestDefiner, ["/classes/"]);

  let err = loader.find_class("Bad").unwrap_err();
  assert!(matches!(
    err,
    ClassError::DefineFailed(_, DefineErr::Malformed)
  ));
  assert_eq!(
    err.to_string(),
    "class Bad could not be defined: malformed bytecode"
  );

  loader.destroy();
}

struct CountingListener(AtomicUsize);

impl PathListener for CountingListener {
  fn paths_changed(&self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }
}

#[test]
fn dynamic_pattern_paths_signal_once_per_batch() {
  let store = MemoryStore::new("repo");
  store.add_node("/data");
  let path = Arc::new(PatternPath::new(store.clone(), ["/data/*"]));
  let dynamic = DynamicPatternPath::new(path);
  let counter = Arc::new(CountingListener(AtomicUsize::new(0)));
  let listener: Arc<dyn PathListener> = counter.clone();
  dynamic.add_listener(&listener);

  // one batch (node + property), one signal
  store.put_property("/data/x.bin", b"1");
  assert_eq!(counter.0.load(Ordering::SeqCst), 1);

  // a pure content change never signals
  store.put_property("/data/x.bin", b"2");
  assert_eq!(counter.0.load(Ordering::SeqCst), 1);

  // changes below the pattern depth never signal
  store.put_property("/data/x.bin/deep.bin", b"3");
  assert_eq!(counter.0.load(Ordering::SeqCst), 1);

  store.remove("/data/x.bin");
  assert_eq!(counter.0.load(Ordering::SeqCst), 2);

  // after the last listener leaves the subscription is gone
  dynamic.remove_listener(&listener);
  store.put_property("/data/y.bin", b"4");
  assert_eq!(counter.0.load(Ordering::SeqCst), 2);
}
