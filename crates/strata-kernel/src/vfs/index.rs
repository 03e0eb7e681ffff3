//! In-memory index and metadata tables.
//!
//! The index is the only description of what lives where in the container:
//! file extents, the directory set, symlinks, and per-path metadata. It is
//! serialized as JSON into the container header:
//!
//! ```text
//! {"version":1,
//!  "files":[["/a.txt",{"offset":97,"size":10}]],
//!  "dirs":["/docs"],
//!  "symlinks":[["/latest","/a.txt"]],
//!  "metadata":[["/a.txt",{"mode":420,"uid":0,"gid":0,"mtime":1700000000000,"atime":1700000000000}]]}
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strata_types::{DirEntry, FileType, VfsError, VfsResult};

use super::path::ROOT;

/// Version tag written into every index. A mismatch causes a cold start.
pub const FORMAT_VERSION: u32 = 1;

/// Location of a file's bytes inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Absolute byte offset in the container.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
}

impl Extent {
    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Per-path metadata. Modes and ownership are stored, never enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Milliseconds since the Unix epoch.
    pub mtime: u64,
    /// Milliseconds since the Unix epoch.
    pub atime: u64,
}

impl Metadata {
    /// Fresh metadata stamped with `now`.
    pub fn new(mode: u32, now: u64) -> Self {
        Self {
            mode,
            uid: 0,
            gid: 0,
            mtime: now,
            atime: now,
        }
    }
}

/// Result of decoding a persisted index.
#[derive(Debug)]
pub enum Loaded {
    /// The index parsed and carries the current format version.
    Ready(Index),
    /// Nothing usable was found; start empty.
    Fresh(String),
}

/// The index and metadata tables.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Index {
    pub files: BTreeMap<String, Extent>,
    pub dirs: BTreeSet<String>,
    pub symlinks: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, Metadata>,
    /// File entries whose extent failed validation on load, kept verbatim.
    pub corrupt: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct IndexDocRef<'a> {
    version: u32,
    files: Vec<(&'a str, serde_json::Value)>,
    dirs: Vec<&'a str>,
    symlinks: Vec<(&'a str, &'a str)>,
    metadata: Vec<(&'a str, &'a Metadata)>,
}

#[derive(Deserialize)]
struct IndexDoc {
    version: u32,
    #[serde(default)]
    files: Vec<(String, serde_json::Value)>,
    #[serde(default)]
    dirs: Vec<String>,
    #[serde(default)]
    symlinks: Vec<(String, String)>,
    #[serde(default)]
    metadata: Vec<(String, Metadata)>,
}

impl Index {
    /// Serialize to the header JSON shape.
    pub fn encode(&self) -> VfsResult<Vec<u8>> {
        let mut files: Vec<(&str, serde_json::Value)> = self
            .files
            .iter()
            .map(|(p, e)| Ok((p.as_str(), serde_json::to_value(e)?)))
            .collect::<Result<_, serde_json::Error>>()
            .map_err(|e| VfsError::other(format!("index encode: {e}")))?;
        files.extend(self.corrupt.iter().map(|(p, v)| (p.as_str(), v.clone())));

        let doc = IndexDocRef {
            version: FORMAT_VERSION,
            files,
            dirs: self.dirs.iter().map(String::as_str).collect(),
            symlinks: self
                .symlinks
                .iter()
                .map(|(p, t)| (p.as_str(), t.as_str()))
                .collect(),
            metadata: self.metadata.iter().map(|(p, m)| (p.as_str(), m)).collect(),
        };
        serde_json::to_vec(&doc).map_err(|e| VfsError::other(format!("index encode: {e}")))
    }

    /// Parse a persisted index, tolerating anything unusable by starting fresh.
    pub fn decode(bytes: &[u8]) -> Loaded {
        if bytes.is_empty() {
            return Loaded::Fresh("empty index".into());
        }
        let doc: IndexDoc = match serde_json::from_slice(bytes) {
            Ok(doc) => doc,
            Err(e) => return Loaded::Fresh(format!("unparsable index: {e}")),
        };
        if doc.version != FORMAT_VERSION {
            return Loaded::Fresh(format!(
                "index format version {} (expected {FORMAT_VERSION})",
                doc.version
            ));
        }

        let mut index = Index::default();
        for (path, raw) in doc.files {
            match serde_json::from_value::<Extent>(raw.clone()) {
                Ok(extent) => {
                    index.files.insert(path, extent);
                }
                Err(_) => {
                    index.corrupt.insert(path, raw);
                }
            }
        }
        index.dirs.extend(doc.dirs);
        index.symlinks.extend(doc.symlinks);
        index.metadata.extend(doc.metadata);
        Loaded::Ready(index)
    }

    /// What kind of entry lives at `path`, if any.
    pub fn kind_of(&self, path: &str) -> Option<FileType> {
        if path == ROOT || self.dirs.contains(path) {
            Some(FileType::Directory)
        } else if self.files.contains_key(path) || self.corrupt.contains_key(path) {
            Some(FileType::File)
        } else if self.symlinks.contains_key(path) {
            Some(FileType::Symlink)
        } else {
            None
        }
    }

    /// Whether any entry lives at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.kind_of(path).is_some()
    }

    /// Every entry path strictly below `dir`, in sorted order.
    pub fn descendants(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == ROOT {
            ROOT.to_string()
        } else {
            format!("{dir}/")
        };
        let mut out: BTreeSet<String> = BTreeSet::new();
        collect_prefixed(self.files.keys(), &prefix, &mut out);
        collect_prefixed(self.dirs.iter(), &prefix, &mut out);
        collect_prefixed(self.symlinks.keys(), &prefix, &mut out);
        collect_prefixed(self.corrupt.keys(), &prefix, &mut out);
        out.remove(ROOT);
        out.into_iter().collect()
    }

    /// Direct children of `dir`, sorted by name.
    pub fn children(&self, dir: &str) -> Vec<DirEntry> {
        let prefix_len = if dir == ROOT { 1 } else { dir.len() + 1 };
        self.descendants(dir)
            .into_iter()
            .filter(|p| !p[prefix_len..].contains('/'))
            .filter_map(|p| {
                let kind = self.kind_of(&p)?;
                Some(DirEntry::new(&p[prefix_len..], kind))
            })
            .collect()
    }

    /// Whether `dir` has any entries below it.
    pub fn has_children(&self, dir: &str) -> bool {
        !self.descendants(dir).is_empty()
    }

    /// Remove whatever lives at `path`, returning its extent if it was a file.
    pub fn remove(&mut self, path: &str) -> Option<Extent> {
        self.dirs.remove(path);
        self.symlinks.remove(path);
        self.metadata.remove(path);
        self.corrupt.remove(path);
        self.files.remove(path)
    }

    /// Sum of all live file sizes.
    pub fn live_bytes(&self) -> u64 {
        self.files.values().map(|e| e.size).sum()
    }

    /// Lowest offset of any non-empty file; the index must never reach it.
    pub fn lowest_offset(&self) -> Option<u64> {
        self.files
            .values()
            .filter(|e| e.size > 0)
            .map(|e| e.offset)
            .min()
    }

    /// Every path in the index, sorted.
    pub fn all_paths(&self) -> Vec<String> {
        let mut out: BTreeSet<String> = BTreeSet::new();
        out.extend(self.files.keys().cloned());
        out.extend(self.dirs.iter().cloned());
        out.extend(self.symlinks.keys().cloned());
        out.extend(self.corrupt.keys().cloned());
        out.into_iter().collect()
    }
}

fn collect_prefixed<'a>(
    keys: impl Iterator<Item = &'a String>,
    prefix: &str,
    out: &mut BTreeSet<String>,
) {
    out.extend(keys.filter(|k| k.starts_with(prefix)).cloned());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Index {
        let mut index = Index::default();
        index.files.insert("/a.txt".into(), Extent { offset: 100, size: 10 });
        index.files.insert("/docs/b.md".into(), Extent { offset: 110, size: 5 });
        index.dirs.insert("/docs".into());
        index.dirs.insert("/docs/sub".into());
        index.symlinks.insert("/latest".into(), "/a.txt".into());
        index.metadata.insert("/a.txt".into(), Metadata::new(0o644, 42));
        index
    }

    #[test]
    fn test_encode_matches_header_shape() {
        let json: serde_json::Value = serde_json::from_slice(&sample().encode().unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["files"][0][0], "/a.txt");
        assert_eq!(json["files"][0][1]["offset"], 100);
        assert_eq!(json["dirs"][0], "/docs");
        assert_eq!(json["symlinks"][0][1], "/a.txt");
        assert_eq!(json["metadata"][0][1]["mode"], 0o644);
    }

    #[test]
    fn test_decode_roundtrip() {
        let index = sample();
        match Index::decode(&index.encode().unwrap()) {
            Loaded::Ready(back) => assert_eq!(back, index),
            Loaded::Fresh(reason) => panic!("unexpected cold start: {reason}"),
        }
    }

    #[test]
    fn test_unusable_input_starts_fresh() {
        assert!(matches!(Index::decode(b""), Loaded::Fresh(_)));
        assert!(matches!(Index::decode(b"{not json"), Loaded::Fresh(_)));
        assert!(matches!(
            Index::decode(br#"{"version":99,"files":[]}"#),
            Loaded::Fresh(_)
        ));
    }

    #[test]
    fn test_negative_extent_is_isolated_as_corrupt() {
        let raw = br#"{"version":1,"files":[["/bad",{"offset":-4,"size":3}],["/ok",{"offset":8,"size":1}]]}"#;
        let Loaded::Ready(index) = Index::decode(raw) else {
            panic!("expected index");
        };
        assert!(index.files.contains_key("/ok"));
        assert!(index.corrupt.contains_key("/bad"));
        assert_eq!(index.kind_of("/bad"), Some(FileType::File));

        // Corrupt entries survive a re-encode.
        let Loaded::Ready(again) = Index::decode(&index.encode().unwrap()) else {
            panic!("expected index");
        };
        assert!(again.corrupt.contains_key("/bad"));
    }

    #[test]
    fn test_children_and_descendants() {
        let index = sample();
        let root: Vec<_> = index.children("/").into_iter().map(|e| e.name).collect();
        assert_eq!(root, vec!["a.txt", "docs", "latest"]);

        let docs = index.children("/docs");
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().any(|e| e.name == "sub" && e.kind.is_dir()));
        assert_eq!(index.descendants("/docs"), vec!["/docs/b.md", "/docs/sub"]);
        assert!(!index.has_children("/docs/sub"));
    }

    #[test]
    fn test_space_accounting() {
        let mut index = sample();
        index.files.insert("/empty".into(), Extent { offset: 0, size: 0 });
        assert_eq!(index.live_bytes(), 15);
        assert_eq!(index.lowest_offset(), Some(100));
        assert_eq!(index.remove("/a.txt"), Some(Extent { offset: 100, size: 10 }));
        assert!(!index.metadata.contains_key("/a.txt"));
    }
}
