//! Sharded on-disk page store.
//!
//! Layout: `root/<bucket>/<hash><suffix>.<ext>`. Every file starts with one
//! JSON header line followed by the payload bytes. Writes go through a temp
//! file in the bucket and an atomic rename, so readers never see a partial
//! entry and the last writer wins.
//!
//! Page dependencies live under `root/deps/`, one JSON-lines file per entity,
//! so any process sharing the root can find the pages an entity fed into.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::keys::{EntityKey, Fingerprint, PageKey};

const ENTRY_VERSION: u32 = 1;
const TEMP_PREFIX: &str = ".tmp-";
const DEPS_DIR: &str = "deps";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed entry header in `{path}`: {source}")]
    Header {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt entry `{path}`: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    version: u32,
    created_at: i64,
    ttl_seconds: u64,
    content_type: String,
}

/// One line of an entity's dependency index.
#[derive(Debug, Serialize, Deserialize)]
struct DependentPage {
    host: String,
    path: String,
}

/// A page read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub payload: Bytes,
    pub content_type: String,
    pub created_at: OffsetDateTime,
    pub ttl_seconds: u64,
}

impl StoredPage {
    /// Fresh while `now - created_at <= ttl_seconds`.
    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        is_fresh(self.created_at, self.ttl_seconds, now)
    }
}

fn is_fresh(created_at: OffsetDateTime, ttl_seconds: u64, now: OffsetDateTime) -> bool {
    let ttl = Duration::seconds(i64::try_from(ttl_seconds).unwrap_or(i64::MAX));
    now - created_at <= ttl
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreUsage {
    pub entries: u64,
    pub bytes: u64,
}

pub struct PageStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl PageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_clock(root, Arc::new(SystemClock))
    }

    pub fn with_clock(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join(fingerprint.bucket())
            .join(fingerprint.file_name())
    }

    /// Fresh entry for `fingerprint`. Read failures count as misses.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<StoredPage> {
        match self.try_get(fingerprint) {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    target = "cache::store",
                    op = "get",
                    result = "read_error",
                    fingerprint = %fingerprint,
                    error = %err,
                    "Failed to read page cache entry; treating as miss"
                );
                None
            }
        }
    }

    pub fn try_get(&self, fingerprint: &Fingerprint) -> Result<Option<StoredPage>, StoreError> {
        let path = self.entry_path(fingerprint);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&path, err)),
        };

        let page = match decode_entry(&path, Bytes::from(data)) {
            Ok(page) => page,
            Err(err) => {
                remove_quietly(&path);
                return Err(err);
            }
        };

        if !page.is_fresh(self.clock.now()) {
            debug!(
                cache = "page",
                fingerprint = %fingerprint,
                "removing stale page cache entry"
            );
            remove_quietly(&path);
            return Ok(None);
        }

        Ok(Some(page))
    }

    /// Store `payload`; failures are logged and reported as `false`.
    pub fn put(
        &self,
        fingerprint: &Fingerprint,
        payload: &[u8],
        content_type: &str,
        ttl_seconds: u64,
    ) -> bool {
        match self.try_put(fingerprint, payload, content_type, ttl_seconds) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "cache::store",
                    op = "put",
                    result = "write_error",
                    fingerprint = %fingerprint,
                    error = %err,
                    "Failed to write page cache entry"
                );
                false
            }
        }
    }

    pub fn try_put(
        &self,
        fingerprint: &Fingerprint,
        payload: &[u8],
        content_type: &str,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let bucket = self.root.join(fingerprint.bucket());
        fs::create_dir_all(&bucket).map_err(|err| StoreError::io(&bucket, err))?;

        let header = EntryHeader {
            version: ENTRY_VERSION,
            created_at: self.clock.now().unix_timestamp(),
            ttl_seconds,
            content_type: content_type.to_string(),
        };
        let mut header_line =
            serde_json::to_vec(&header).map_err(|source| StoreError::Header {
                path: bucket.clone(),
                source,
            })?;
        header_line.push(b'\n');

        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&bucket)
            .map_err(|err| StoreError::io(&bucket, err))?;
        let written = file
            .write_all(&header_line)
            .and_then(|()| file.write_all(payload))
            .and_then(|()| file.flush());
        if let Err(err) = written {
            return Err(StoreError::io(file.path(), err));
        }

        let path = self.entry_path(fingerprint);
        file.persist(&path)
            .map_err(|err| StoreError::io(&path, err.error))?;
        Ok(())
    }

    /// Remove every variant and format stored under the fingerprint's hash.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> Result<usize, StoreError> {
        let bucket = self.root.join(fingerprint.bucket());
        let hash = fingerprint.hash();
        let mut removed = 0;
        for path in list_files(&bucket)? {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let belongs = name
                .strip_prefix(hash)
                .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'));
            if belongs && remove_entry(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove every bucket and the dependency index under the root.
    pub fn invalidate_all(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for bucket in self.bucket_dirs()? {
            removed += list_files(&bucket)?.len();
            remove_dir(&bucket)?;
        }
        remove_dir(&self.root.join(DEPS_DIR))?;
        Ok(removed)
    }

    /// Delete stale and unreadable entries.
    pub fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut removed = 0;
        for bucket in self.bucket_dirs()? {
            for path in list_files(&bucket)? {
                if is_temp_file(&path) {
                    continue;
                }
                let stale = match read_header(&path) {
                    Ok(Some((created_at, ttl_seconds))) => !is_fresh(created_at, ttl_seconds, now),
                    Ok(None) => false,
                    Err(err) => {
                        debug!(
                            cache = "page",
                            path = %path.display(),
                            error = %err,
                            "sweeping unreadable page cache entry"
                        );
                        true
                    }
                };
                if stale && remove_entry(&path)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn usage(&self) -> Result<StoreUsage, StoreError> {
        let mut usage = StoreUsage::default();
        for bucket in self.bucket_dirs()? {
            for path in list_files(&bucket)? {
                if is_temp_file(&path) {
                    continue;
                }
                match fs::metadata(&path) {
                    Ok(meta) => {
                        usage.entries += 1;
                        usage.bytes += meta.len();
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(StoreError::io(&path, err)),
                }
            }
        }
        Ok(usage)
    }

    /// Append `page` to the dependency index of every entity in `entities`.
    ///
    /// Lines are only ever appended; a page re-rendered with fewer
    /// dependencies may still be listed under an old entity, which at worst
    /// invalidates it once more than needed.
    pub fn record_dependencies(
        &self,
        page: &PageKey,
        entities: &HashSet<EntityKey>,
    ) -> Result<(), StoreError> {
        if entities.is_empty() {
            return Ok(());
        }
        let dir = self.root.join(DEPS_DIR);
        fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;

        let line = DependentPage {
            host: page.host().to_string(),
            path: page.path().to_string(),
        };
        let mut line = serde_json::to_vec(&line).map_err(|source| StoreError::Header {
            path: dir.clone(),
            source,
        })?;
        line.push(b'\n');

        for entity in entities {
            let path = dir.join(index_file_name(entity));
            // Single write per line; O_APPEND keeps concurrent lines whole.
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| file.write_all(&line))
                .map_err(|err| StoreError::io(&path, err))?;
        }
        Ok(())
    }

    /// Remove the dependency index of `entity` and return the pages it listed.
    pub fn take_dependents(&self, entity: &EntityKey) -> Result<HashSet<PageKey>, StoreError> {
        let dir = self.root.join(DEPS_DIR);
        let index = dir.join(index_file_name(entity));
        let taken = dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        match fs::rename(&index, &taken) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(err) => return Err(StoreError::io(&index, err)),
        }

        let data = fs::read(&taken).map_err(|err| StoreError::io(&taken, err));
        remove_quietly(&taken);
        let data = data?;

        let mut pages = HashSet::new();
        for line in data.split(|b| *b == b'\n').filter(|line| !line.is_empty()) {
            match serde_json::from_slice::<DependentPage>(line) {
                Ok(page) => {
                    pages.insert(PageKey::new(&page.host, &page.path));
                }
                Err(err) => debug!(
                    cache = "page",
                    entity = %entity,
                    error = %err,
                    "skipping malformed dependency index line"
                ),
            }
        }
        Ok(pages)
    }

    /// Two-hex-character directories directly under the root.
    fn bucket_dirs(&self) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&self.root, err)),
        };
        let mut buckets = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::io(&self.root, err))?;
            let is_bucket = entry.file_name().to_str().is_some_and(|name| {
                name.len() == 2
                    && name
                        .bytes()
                        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            });
            if is_bucket && entry.path().is_dir() {
                buckets.push(entry.path());
            }
        }
        Ok(buckets)
    }
}

fn decode_entry(path: &Path, mut data: Bytes) -> Result<StoredPage, StoreError> {
    let newline = data
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| StoreError::corrupt(path, "missing header line"))?;
    let payload = data.split_off(newline + 1);
    let header = parse_header(path, &data[..newline])?;
    Ok(StoredPage {
        payload,
        content_type: header.content_type,
        created_at: created_at(path, header.created_at)?,
        ttl_seconds: header.ttl_seconds,
    })
}

fn parse_header(path: &Path, line: &[u8]) -> Result<EntryHeader, StoreError> {
    let header: EntryHeader =
        serde_json::from_slice(line).map_err(|source| StoreError::Header {
            path: path.to_path_buf(),
            source,
        })?;
    if header.version != ENTRY_VERSION {
        return Err(StoreError::corrupt(
            path,
            format!("unsupported entry version {}", header.version),
        ));
    }
    Ok(header)
}

fn created_at(path: &Path, unix: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|err| StoreError::corrupt(path, format!("bad timestamp: {err}")))
}

/// `(created_at, ttl_seconds)` from the header line, `None` if the file vanished.
fn read_header(path: &Path) -> Result<Option<(OffsetDateTime, u64)>, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let newline = data
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| StoreError::corrupt(path, "missing header line"))?;
    let header = parse_header(path, &data[..newline])?;
    Ok(Some((created_at(path, header.created_at)?, header.ttl_seconds)))
}

fn index_file_name(entity: &EntityKey) -> String {
    match entity {
        EntityKey::Content(id) => format!("content-{id}.jsonl"),
        EntityKey::Term(id) => format!("term-{id}.jsonl"),
    }
}

fn remove_dir(dir: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(dir, err)),
    }
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(dir, err)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::io(dir, err))?;
        if entry.path().is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

/// `Ok(true)` if this call removed the file.
fn remove_entry(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = remove_entry(path) {
        warn!(
            target = "cache::store",
            op = "remove",
            result = "error",
            error = %err,
            "Failed to remove page cache entry"
        );
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::keys::{OutputFormat, Variant, build_key};

    fn store_with_clock() -> (TempDir, Arc<ManualClock>, PageStore) {
        let dir = TempDir::new().expect("temp dir");
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("valid timestamp"),
        ));
        let store = PageStore::with_clock(dir.path().join("pages"), clock.clone());
        (dir, clock, store)
    }

    fn page(path: &str) -> Fingerprint {
        build_key("example.com", path, &Variant::default())
    }

    #[test]
    fn put_then_get_round_trips_payload_and_metadata() {
        let (_dir, clock, store) = store_with_clock();
        let fingerprint = page("/blog/hello-world");
        assert!(store.get(&fingerprint).is_none());

        assert!(store.put(&fingerprint, b"<html>hello</html>", "text/html", 3600));
        let stored = store.get(&fingerprint).expect("hit");
        assert_eq!(&stored.payload[..], b"<html>hello</html>");
        assert_eq!(stored.content_type, "text/html");
        assert_eq!(stored.ttl_seconds, 3600);
        assert_eq!(stored.created_at, clock.now());

        let on_disk = store
            .root()
            .join(fingerprint.bucket())
            .join(fingerprint.file_name());
        assert!(on_disk.is_file());
    }

    #[test]
    fn entry_expires_after_ttl_and_is_removed() {
        let (_dir, clock, store) = store_with_clock();
        let fingerprint = page("/about");
        assert!(store.put(&fingerprint, b"payload", "text/html", 60));

        clock.advance(Duration::seconds(60));
        assert!(store.get(&fingerprint).is_some(), "boundary is inclusive");

        clock.advance(Duration::seconds(1));
        assert!(store.get(&fingerprint).is_none());
        assert_eq!(store.usage().expect("usage").entries, 0);
    }

    #[test]
    fn last_writer_wins() {
        let (_dir, _clock, store) = store_with_clock();
        let fingerprint = page("/");
        assert!(store.put(&fingerprint, b"first", "text/html", 60));
        assert!(store.put(&fingerprint, b"second", "text/html", 60));
        assert_eq!(&store.get(&fingerprint).expect("hit").payload[..], b"second");
        assert_eq!(store.usage().expect("usage").entries, 1);
    }

    #[test]
    fn invalidate_removes_every_variant_of_the_hash_only() {
        let (_dir, _clock, store) = store_with_clock();
        let desktop = page("/post");
        let mobile = build_key("example.com", "/post", &Variant::mobile());
        let feed = desktop.clone().with_format(OutputFormat::Xml);
        let other = page("/other");
        for fingerprint in [&desktop, &mobile, &feed, &other] {
            assert!(store.put(fingerprint, b"x", "text/html", 60));
        }

        assert_eq!(store.invalidate(&desktop).expect("invalidate"), 3);
        assert!(store.get(&mobile).is_none());
        assert!(store.get(&other).is_some());
        assert_eq!(store.invalidate(&desktop).expect("invalidate"), 0);
    }

    #[test]
    fn invalidate_all_clears_tree() {
        let (_dir, _clock, store) = store_with_clock();
        for path in ["/a", "/b", "/c"] {
            assert!(store.put(&page(path), b"x", "text/html", 60));
        }
        assert_eq!(store.invalidate_all().expect("invalidate_all"), 3);
        assert_eq!(store.usage().expect("usage"), StoreUsage::default());
        assert_eq!(store.invalidate_all().expect("empty"), 0);
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let (_dir, clock, store) = store_with_clock();
        assert!(store.put(&page("/short"), b"x", "text/html", 10));
        assert!(store.put(&page("/long"), b"x", "text/html", 1000));
        clock.advance(Duration::seconds(11));

        assert_eq!(store.sweep_expired().expect("sweep"), 1);
        assert!(store.get(&page("/long")).is_some());
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_gets_removed() {
        let (_dir, _clock, store) = store_with_clock();
        let fingerprint = page("/broken");
        let bucket = store.root().join(fingerprint.bucket());
        fs::create_dir_all(&bucket).expect("bucket");
        fs::write(bucket.join(fingerprint.file_name()), b"not a header").expect("write");

        assert!(store.get(&fingerprint).is_none());
        assert!(!bucket.join(fingerprint.file_name()).exists());
    }

    #[test]
    fn dependency_index_is_shared_through_the_root() {
        let (dir, clock, writer) = store_with_clock();
        let reader = PageStore::with_clock(dir.path().join("pages"), clock);
        let post = PageKey::new("example.com", "/post-1");
        let listing = PageKey::new("example.com", "/category/x");
        let content: HashSet<EntityKey> = [EntityKey::Content(42)].into_iter().collect();

        writer.record_dependencies(&post, &content).expect("record");
        writer.record_dependencies(&listing, &content).expect("record");
        writer.record_dependencies(&post, &content).expect("record again");

        let pages = reader.take_dependents(&EntityKey::Content(42)).expect("take");
        assert_eq!(pages, [post, listing].into_iter().collect());
        assert!(reader.take_dependents(&EntityKey::Content(42)).expect("take").is_empty());
        assert!(reader.take_dependents(&EntityKey::Term(1)).expect("missing").is_empty());
    }

    #[test]
    fn dependency_index_is_not_counted_and_is_cleared_with_the_tree() {
        let (_dir, _clock, store) = store_with_clock();
        let page_key = PageKey::new("example.com", "/a");
        let content: HashSet<EntityKey> = [EntityKey::Content(1)].into_iter().collect();
        assert!(store.put(&page("/a"), b"x", "text/html", 60));
        store.record_dependencies(&page_key, &content).expect("record");

        assert_eq!(store.usage().expect("usage").entries, 1);
        assert_eq!(store.invalidate_all().expect("invalidate_all"), 1);
        assert!(!store.root().join(DEPS_DIR).exists());
        assert!(store.take_dependents(&EntityKey::Content(1)).expect("take").is_empty());
    }

    #[test]
    fn usage_counts_entries_and_bytes() {
        let (_dir, _clock, store) = store_with_clock();
        assert_eq!(store.usage().expect("usage on missing root"), StoreUsage::default());
        assert!(store.put(&page("/a"), b"12345", "text/html", 60));
        let usage = store.usage().expect("usage");
        assert_eq!(usage.entries, 1);
        assert!(usage.bytes > 5);
    }
}
