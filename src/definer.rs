//! The byte-to-class seam.

use std::fmt::Display;

use url::Url;

use crate::archive::Manifest;

/// Class of types that can turn resource bytes into a live class in some
/// host runtime.
///
/// The loader finds the bytes; what "defining a class" means — JIT loading,
/// scripting-engine registration, plain bookkeeping in tests — is entirely
/// the definer's business. The loader hands over the code-source URL and,
/// for bundle-backed resources, the bundle manifest; package sealing policy
/// lives behind this trait too.
///
/// Definers are shared across look-up threads, hence the `Send + Sync`
/// bound; class handles are cached on resources and cloned out to callers,
/// hence `Clone` on the associated type.
pub trait ClassDefiner: Send + Sync + 'static {
  /// The runtime's class handle.
  type Class: Clone + Send + Sync + 'static;

  /// Error produced when the bytes are rejected.
  type Error: Display + 'static;

  /// Define a class from bytecode.
  fn define(
    &self,
    name: &str,
    bytes: &[u8],
    code_source: Option<&Url>,
    manifest: Option<&Manifest>,
  ) -> Result<Self::Class, Self::Error>;
}
