//! The bundle archive format.
//!
//! A *bundle* is a packed archive stored as a single repository property: a
//! magic-tagged header entry, a run of length-prefixed members and a trailing
//! central directory. The layout is built for streams — repository property
//! streams cannot seek, so everything here works with a forward-only
//! [`Read`]:
//!
//! ```text
//! header:   magic "RBND", format version (u16 LE)
//! member:   tag 0x01, name length (u16 LE), name (UTF-8),
//!           data length (u32 LE), data
//! central:  tag 0x02, member count (u32 LE), then per member:
//!           name length (u16 LE), name, data offset (u64 LE), size (u32 LE)
//! ```
//!
//! [`probe`] reads the header entry only; that is the whole construction-time
//! archive sniff. [`read_index`] skips the members and decodes the central
//! directory; [`read_member`] fetches one member's bytes on a fresh stream;
//! [`spool`] decodes every member in one pass for in-memory expansion.
//! [`Writer`] is the matching encoder.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

pub(crate) const MAGIC: [u8; 4] = *b"RBND";
pub(crate) const FORMAT_VERSION: u16 = 1;

const MEMBER_TAG: u8 = 0x01;
const DIRECTORY_TAG: u8 = 0x02;

/// Conventional member name of a bundle manifest.
pub const MANIFEST_NAME: &str = "meta/manifest";

/// Failure while decoding or encoding a bundle.
#[derive(Debug, Error)]
pub enum ArchiveError {
  /// The stream does not start with the bundle magic.
  #[error("bad magic, not a bundle")]
  BadMagic,
  /// The bundle was written by a newer format revision.
  #[error("unsupported bundle format version {0}")]
  UnsupportedVersion(u16),
  /// The stream ended before the central directory.
  #[error("bundle is truncated: missing central directory")]
  MissingDirectory,
  /// An entry tag this revision does not know.
  #[error("unknown bundle entry tag {0:#04x}")]
  UnknownTag(u8),
  /// A member name that does not decode as UTF-8.
  #[error("bundle member name is not valid UTF-8")]
  BadMemberName,
  #[error(transparent)]
  Io(#[from] io::Error),
}

/// Offset and size of one member's data within a bundle stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemberInfo {
  /// Offset of the member's data from the start of the stream.
  pub offset: u64,
  /// Data size in bytes.
  pub size: u32,
}

/// Read the bundle header entry, failing unless the stream is a bundle.
pub fn probe<R: Read>(reader: &mut R) -> Result<(), ArchiveError> {
  let mut magic = [0u8; 4];
  reader.read_exact(&mut magic)?;
  if magic != MAGIC {
    return Err(ArchiveError::BadMagic);
  }
  let version = reader.read_u16::<LittleEndian>()?;
  if version > FORMAT_VERSION {
    return Err(ArchiveError::UnsupportedVersion(version));
  }
  Ok(())
}

fn read_name<R: Read>(reader: &mut R) -> Result<String, ArchiveError> {
  let len = reader.read_u16::<LittleEndian>()? as usize;
  let mut buf = vec![0u8; len];
  reader.read_exact(&mut buf)?;
  String::from_utf8(buf).map_err(|_| ArchiveError::BadMemberName)
}

fn skip<R: Read>(reader: &mut R, len: u64) -> Result<(), ArchiveError> {
  let skipped = io::copy(&mut reader.by_ref().take(len), &mut io::sink())?;
  if skipped < len {
    return Err(ArchiveError::MissingDirectory);
  }
  Ok(())
}

fn next_tag<R: Read>(reader: &mut R) -> Result<u8, ArchiveError> {
  match reader.read_u8() {
    Ok(tag) => Ok(tag),
    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ArchiveError::MissingDirectory),
    Err(e) => Err(e.into()),
  }
}

/// Decode the central directory into a member index.
///
/// Member entries are skipped, not decoded; only the trailing directory is
/// read.
pub fn read_index<R: Read>(reader: &mut R) -> Result<HashMap<String, MemberInfo>, ArchiveError> {
  probe(reader)?;
  loop {
    match next_tag(reader)? {
      MEMBER_TAG => {
        let name_len = reader.read_u16::<LittleEndian>()? as u64;
        skip(reader, name_len)?;
        let data_len = reader.read_u32::<LittleEndian>()? as u64;
        skip(reader, data_len)?;
      }
      DIRECTORY_TAG => {
        let count = reader.read_u32::<LittleEndian>()?;
        let mut index = HashMap::with_capacity(count as usize);
        for _ in 0..count {
          let name = read_name(reader)?;
          let offset = reader.read_u64::<LittleEndian>()?;
          let size = reader.read_u32::<LittleEndian>()?;
          index.insert(name, MemberInfo { offset, size });
        }
        return Ok(index);
      }
      other => return Err(ArchiveError::UnknownTag(other)),
    }
  }
}

/// Skip to a member's data and read it whole.
pub fn read_member<R: Read>(reader: &mut R, info: MemberInfo) -> Result<Vec<u8>, ArchiveError> {
  skip(reader, info.offset)?;
  let mut data = vec![0u8; info.size as usize];
  reader.read_exact(&mut data)?;
  Ok(data)
}

/// Decode every member into memory in one forward pass.
///
/// The central directory is not consulted; reaching it ends the pass.
pub fn spool<R: Read>(reader: &mut R) -> Result<HashMap<String, Arc<[u8]>>, ArchiveError> {
  probe(reader)?;
  let mut members = HashMap::new();
  loop {
    match next_tag(reader)? {
      MEMBER_TAG => {
        let name = read_name(reader)?;
        let len = reader.read_u32::<LittleEndian>()? as usize;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        members.insert(name, Arc::from(data));
      }
      DIRECTORY_TAG => return Ok(members),
      other => return Err(ArchiveError::UnknownTag(other)),
    }
  }
}

/// A bundle manifest: the `meta/manifest` member, one `Key: value` pair per
/// line.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Manifest {
  attributes: BTreeMap<String, String>,
}

impl Manifest {
  /// Parse manifest bytes. Lines without a `:` separator are skipped, as
  /// are blank lines; keys and values are trimmed.
  pub fn parse(bytes: &[u8]) -> Manifest {
    let text = String::from_utf8_lossy(bytes);
    let mut attributes = BTreeMap::new();
    for line in text.lines() {
      let line = line.trim();
      if line.is_empty() {
        continue;
      }
      if let Some((key, value)) = line.split_once(':') {
        attributes.insert(key.trim().to_owned(), value.trim().to_owned());
      }
    }
    Manifest { attributes }
  }

  /// Look up an attribute by key.
  pub fn attribute(&self, key: &str) -> Option<&str> {
    self.attributes.get(key).map(String::as_str)
  }

  /// All attributes, in key order.
  pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
    self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn is_empty(&self) -> bool {
    self.attributes.is_empty()
  }
}

/// Streaming bundle encoder.
///
/// Members are written as they come; [`Writer::finish`] appends the central
/// directory and hands the sink back.
pub struct Writer<W: Write> {
  out: W,
  position: u64,
  directory: Vec<(String, MemberInfo)>,
}

impl<W: Write> Writer<W> {
  pub fn new(mut out: W) -> Result<Writer<W>, ArchiveError> {
    out.write_all(&MAGIC)?;
    out.write_u16::<LittleEndian>(FORMAT_VERSION)?;
    Ok(Writer {
      out,
      position: 6,
      directory: Vec::new(),
    })
  }

  /// Append one member.
  pub fn member(&mut self, name: &str, data: &[u8]) -> Result<(), ArchiveError> {
    self.out.write_u8(MEMBER_TAG)?;
    self.out.write_u16::<LittleEndian>(name.len() as u16)?;
    self.out.write_all(name.as_bytes())?;
    self.out.write_u32::<LittleEndian>(data.len() as u32)?;
    self.out.write_all(data)?;
    let offset = self.position + 1 + 2 + name.len() as u64 + 4;
    self.directory.push((
      name.to_owned(),
      MemberInfo {
        offset,
        size: data.len() as u32,
      },
    ));
    self.position = offset + data.len() as u64;
    Ok(())
  }

  /// Write the central directory and return the sink.
  pub fn finish(mut self) -> Result<W, ArchiveError> {
    self.out.write_u8(DIRECTORY_TAG)?;
    self.out.write_u32::<LittleEndian>(self.directory.len() as u32)?;
    for (name, info) in &self.directory {
      self.out.write_u16::<LittleEndian>(name.len() as u16)?;
      self.out.write_all(name.as_bytes())?;
      self.out.write_u64::<LittleEndian>(info.offset)?;
      self.out.write_u32::<LittleEndian>(info.size)?;
    }
    Ok(self.out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  fn sample() -> Vec<u8> {
    let mut writer = Writer::new(Vec::new()).unwrap();
    writer.member("org/x/Y.class", b"\xCA\xFEbytes").unwrap();
    writer.member("meta/manifest", b"Sealed: true\n").unwrap();
    writer.finish().unwrap()
  }

  #[test]
  fn probe_accepts_bundles() {
    probe(&mut Cursor::new(sample())).unwrap();
  }

  #[test]
  fn probe_rejects_other_streams() {
    let result = probe(&mut Cursor::new(b"class Y {}".to_vec()));
    assert!(matches!(result, Err(ArchiveError::BadMagic)));
  }

  #[test]
  fn index_and_member_roundtrip() {
    let bytes = sample();
    let index = read_index(&mut Cursor::new(&bytes)).unwrap();
    assert_eq!(index.len(), 2);
    let info = index["org/x/Y.class"];
    let data = read_member(&mut Cursor::new(&bytes), info).unwrap();
    assert_eq!(data, b"\xCA\xFEbytes");
  }

  #[test]
  fn spool_reads_every_member() {
    let bytes = sample();
    let members = spool(&mut Cursor::new(&bytes)).unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(&members["org/x/Y.class"][..], b"\xCA\xFEbytes");
  }

  #[test]
  fn truncated_bundle_is_rejected() {
    let mut bytes = sample();
    bytes.truncate(bytes.len() - 4);
    assert!(read_index(&mut Cursor::new(&bytes)).is_err());
  }

  #[test]
  fn manifest_lines() {
    let manifest = Manifest::parse(b"Sealed: true\n\nVendor: hotclass tests\nnot a pair\n");
    assert_eq!(manifest.attribute("Sealed"), Some("true"));
    assert_eq!(manifest.attribute("Vendor"), Some("hotclass tests"));
    assert_eq!(manifest.attribute("not a pair"), None);
    assert_eq!(manifest.attributes().count(), 2);
  }
}
