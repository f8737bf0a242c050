//! RocksDB-backed store for all durable collaboration state.
//!
//! Column families:
//! - `activity`         — timeline entries, keyed `doc_id:seq`
//! - `operations`       — edit operations, keyed `doc_id:version`
//! - `comments`         — comment rows, keyed `doc_id:seq`
//! - `comment_index`    — `comment_id -> comments key`
//! - `reactions`        — keyed `comment_id:user_id:symbol`
//! - `versions`         — version rows, keyed `doc_id:seq` (LZ4 content)
//! - `version_index`    — `version_id -> versions key` plus the
//!                        per-document current-version pointer
//! - `branches`         — keyed `doc_id:branch_id`
//! - `version_comments` — keyed `version_id:seq`
//! - `settings`         — auto-version settings, keyed `user_id:doc_id`
//!                        (nil doc uuid = the user's global row)
//! - `follow`           — follow sessions, keyed `doc_id:follower:seq`
//!
//! Composite keys put the scannable id first and a big-endian sequence
//! last, so every list query is a single prefix scan and reverse
//! iteration yields newest-first. Sequence counters live in memory and
//! are recovered from the highest existing key per prefix, so a crash
//! never leaves a counter row out of sync with the data.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use crate::activity::ActivityEntry;
use crate::autosave::AutoVersionSettings;
use crate::comments::{Comment, Reaction};
use crate::follow::FollowSession;
use crate::operations::Operation;
use crate::versions::{ChangeKind, DocumentVersion, VersionBranch, VersionComment};

/// Column family names.
const CF_ACTIVITY: &str = "activity";
const CF_OPERATIONS: &str = "operations";
const CF_COMMENTS: &str = "comments";
const CF_COMMENT_INDEX: &str = "comment_index";
const CF_REACTIONS: &str = "reactions";
const CF_VERSIONS: &str = "versions";
const CF_VERSION_INDEX: &str = "version_index";
const CF_BRANCHES: &str = "branches";
const CF_VERSION_COMMENTS: &str = "version_comments";
const CF_SETTINGS: &str = "settings";
const CF_FOLLOW: &str = "follow";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[
    CF_ACTIVITY,
    CF_OPERATIONS,
    CF_COMMENTS,
    CF_COMMENT_INDEX,
    CF_REACTIONS,
    CF_VERSIONS,
    CF_VERSION_INDEX,
    CF_BRANCHES,
    CF_VERSION_COMMENTS,
    CF_SETTINGS,
    CF_FOLLOW,
];

/// `version_index` key tags.
const IDX_VERSION: u8 = 1;
const IDX_CURRENT: u8 = 2;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Row not found
    NotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(row, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode_row<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(row)
}

/// Operation row with the JSON payload pre-serialized.
///
/// `serde_json::Value` cannot round-trip through bincode (it needs a
/// self-describing format), so the payload is stored as raw JSON bytes.
#[derive(Serialize, Deserialize)]
struct StoredOperation {
    id: Uuid,
    doc_id: Uuid,
    user_id: Uuid,
    kind: String,
    data_json: Vec<u8>,
    version_number: u64,
    parent_version: Option<u64>,
    created_at: i64,
}

impl StoredOperation {
    fn from_operation(op: &Operation) -> Result<Self, StoreError> {
        Ok(Self {
            id: op.id,
            doc_id: op.doc_id,
            user_id: op.user_id,
            kind: op.kind.clone(),
            data_json: serde_json::to_vec(&op.data)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?,
            version_number: op.version_number,
            parent_version: op.parent_version,
            created_at: op.created_at,
        })
    }

    fn into_operation(self) -> Result<Operation, StoreError> {
        Ok(Operation {
            id: self.id,
            doc_id: self.doc_id,
            user_id: self.user_id,
            kind: self.kind,
            data: serde_json::from_slice(&self.data_json)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?,
            version_number: self.version_number,
            parent_version: self.parent_version,
            created_at: self.created_at,
        })
    }
}

/// Version row with the document content compressed.
///
/// Content is the dominant cost of a version row; JSON-encode it once
/// and LZ4 it, everything else rides along as plain bincode fields.
#[derive(Serialize, Deserialize)]
struct StoredVersion {
    id: Uuid,
    doc_id: Uuid,
    content_lz4: Vec<u8>,
    file_ref: Option<String>,
    file_hash: Option<String>,
    change_summary: String,
    change_kind: ChangeKind,
    branch_id: Option<Uuid>,
    parent_version_id: Option<Uuid>,
    tags: Vec<String>,
    major: u32,
    minor: u32,
    version_number: u64,
    is_current: bool,
    created_by: Uuid,
    created_at: i64,
}

impl StoredVersion {
    fn from_version(v: &DocumentVersion) -> Result<Self, StoreError> {
        let json = serde_json::to_vec(&v.content)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(Self {
            id: v.id,
            doc_id: v.doc_id,
            content_lz4: lz4_flex::compress_prepend_size(&json),
            file_ref: v.file_ref.clone(),
            file_hash: v.file_hash.clone(),
            change_summary: v.change_summary.clone(),
            change_kind: v.change_kind,
            branch_id: v.branch_id,
            parent_version_id: v.parent_version_id,
            tags: v.tags.clone(),
            major: v.major,
            minor: v.minor,
            version_number: v.version_number,
            is_current: v.is_current,
            created_by: v.created_by,
            created_at: v.created_at,
        })
    }

    fn into_version(self) -> Result<DocumentVersion, StoreError> {
        let json = lz4_flex::decompress_size_prepended(&self.content_lz4)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        Ok(DocumentVersion {
            id: self.id,
            doc_id: self.doc_id,
            content: serde_json::from_slice(&json)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?,
            file_ref: self.file_ref,
            file_hash: self.file_hash,
            change_summary: self.change_summary,
            change_kind: self.change_kind,
            branch_id: self.branch_id,
            parent_version_id: self.parent_version_id,
            tags: self.tags,
            major: self.major,
            minor: self.minor,
            version_number: self.version_number,
            is_current: self.is_current,
            created_by: self.created_by,
            created_at: self.created_at,
        })
    }
}

/// RocksDB-backed collaboration store.
///
/// Single-threaded RocksDB mode; concurrency comes from tokio, writes
/// are short and synchronous. Current-version flips and sequence
/// assignment are serialized through an in-process mutex.
pub struct CollabStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Per-prefix sequence counters, keyed `(cf, key prefix)`.
    seqs: Mutex<HashMap<(&'static str, Vec<u8>), u64>>,
}

impl CollabStore {
    /// Open the store at the configured path, creating the database
    /// and column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            seqs: Mutex::new(HashMap::new()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ACTIVITY | CF_OPERATIONS | CF_COMMENTS | CF_VERSIONS => {
                // Prefix-scanned by 16-byte document id.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_COMMENT_INDEX | CF_VERSION_INDEX | CF_SETTINGS => {
                // Point lookups only.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }

        // Version content arrives LZ4-compressed already.
        if name == CF_VERSIONS {
            opts.set_compression_type(DBCompressionType::None);
        }

        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Missing column family: {name}")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Collect `(key, value)` pairs under a key prefix. `reverse`
    /// yields descending key order (newest first for sequence keys).
    fn scan_prefix(
        &self,
        cf_name: &str,
        prefix: &[u8],
        reverse: bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        // Reverse scans start just past the last possible key with this
        // prefix; the first key without the prefix sorts below it, so a
        // prefix mismatch ends the scan in either direction.
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&[0xFF; 9]);
        let mode = if reverse {
            IteratorMode::From(&upper, Direction::Reverse)
        } else {
            IteratorMode::From(prefix, Direction::Forward)
        };

        let mut rows = Vec::new();
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    /// Next sequence number for a key prefix (starts at 1). Recovered
    /// from the highest existing key on first use after open.
    fn next_seq(&self, cf_name: &'static str, prefix: &[u8]) -> Result<u64, StoreError> {
        let mut seqs = self.seqs.lock().unwrap_or_else(|e| e.into_inner());
        let map_key = (cf_name, prefix.to_vec());
        let last = match seqs.get(&map_key) {
            Some(n) => *n,
            None => self.recover_last_seq(cf_name, prefix)?,
        };
        let next = last + 1;
        seqs.insert(map_key, next);
        Ok(next)
    }

    /// Highest sequence suffix under a prefix, 0 if none.
    fn recover_last_seq(&self, cf_name: &str, prefix: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&[0xFF; 9]);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if key.starts_with(prefix) && key.len() == prefix.len() + 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[prefix.len()..]);
                return Ok(u64::from_be_bytes(buf));
            }
            if key.as_ref() < prefix {
                break;
            }
        }
        Ok(0)
    }

    fn seq_key(prefix: &[u8], seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + 8);
        key.extend_from_slice(prefix);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    // ─── Activity ─────────────────────────────────────────────────────

    /// Append a timeline entry. Returns the assigned sequence number.
    pub fn append_activity(&self, entry: &ActivityEntry) -> Result<u64, StoreError> {
        let cf = self.cf(CF_ACTIVITY)?;
        let seq = self.next_seq(CF_ACTIVITY, entry.doc_id.as_bytes())?;
        let key = Self::seq_key(entry.doc_id.as_bytes(), seq);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &encode_row(entry)?);
        self.write(batch)?;
        Ok(seq)
    }

    /// Timeline entries for a document, newest first.
    ///
    /// `before` is a keyset cursor: only entries with a strictly lower
    /// sequence number are returned.
    pub fn list_activity(
        &self,
        doc_id: Uuid,
        limit: usize,
        before: Option<u64>,
    ) -> Result<Vec<(u64, ActivityEntry)>, StoreError> {
        let prefix = doc_id.as_bytes();
        let rows = match before {
            Some(b) if b <= 1 => return Ok(Vec::new()),
            Some(b) => self.scan_seq_reverse(CF_ACTIVITY, prefix, b - 1, limit)?,
            None => self.scan_seq_reverse(CF_ACTIVITY, prefix, u64::MAX, limit)?,
        };

        rows.into_iter()
            .map(|(seq, value)| Ok((seq, decode_row::<ActivityEntry>(&value)?)))
            .collect()
    }

    /// Reverse scan of sequence-suffixed keys starting at `from_seq`
    /// (inclusive), up to `limit` rows.
    fn scan_seq_reverse(
        &self,
        cf_name: &str,
        prefix: &[u8],
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let start = Self::seq_key(prefix, from_seq);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Reverse));

        let mut rows = Vec::new();
        for item in iter {
            if rows.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[prefix.len()..]);
            rows.push((u64::from_be_bytes(buf), value.to_vec()));
        }
        Ok(rows)
    }

    // ─── Operations ───────────────────────────────────────────────────

    /// Persist an operation, assigning the next version number for its
    /// document (starting at 1). Returns the stored operation.
    pub fn append_operation(&self, mut op: Operation) -> Result<Operation, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let version = self.next_seq(CF_OPERATIONS, op.doc_id.as_bytes())?;
        op.version_number = version;

        let key = Self::seq_key(op.doc_id.as_bytes(), version);
        let row = StoredOperation::from_operation(&op)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &encode_row(&row)?);
        self.write(batch)?;
        Ok(op)
    }

    /// Operations with `version_number >= since`, ascending.
    pub fn list_operations_since(
        &self,
        doc_id: Uuid,
        since: u64,
    ) -> Result<Vec<Operation>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let prefix = doc_id.as_bytes();
        let start = Self::seq_key(prefix, since);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut ops = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            let row: StoredOperation = decode_row(&value)?;
            ops.push(row.into_operation()?);
        }
        Ok(ops)
    }

    /// Highest version number assigned for a document (0 if none).
    pub fn latest_operation_number(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        self.recover_last_seq(CF_OPERATIONS, doc_id.as_bytes())
    }

    // ─── Comments ─────────────────────────────────────────────────────

    /// Insert a new comment row and its id index entry.
    pub fn insert_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        let cf = self.cf(CF_COMMENTS)?;
        let cf_idx = self.cf(CF_COMMENT_INDEX)?;
        let seq = self.next_seq(CF_COMMENTS, comment.doc_id.as_bytes())?;
        let key = Self::seq_key(comment.doc_id.as_bytes(), seq);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &encode_row(comment)?);
        batch.put_cf(&cf_idx, comment.id.as_bytes(), &key);
        self.write(batch)
    }

    fn comment_key(&self, comment_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf_idx = self.cf(CF_COMMENT_INDEX)?;
        self.db
            .get_cf(&cf_idx, comment_id.as_bytes())?
            .ok_or(StoreError::NotFound(comment_id))
    }

    pub fn get_comment(&self, comment_id: Uuid) -> Result<Comment, StoreError> {
        let key = self.comment_key(comment_id)?;
        let cf = self.cf(CF_COMMENTS)?;
        match self.db.get_cf(&cf, &key)? {
            Some(bytes) => decode_row(&bytes),
            None => Err(StoreError::NotFound(comment_id)),
        }
    }

    /// Overwrite an existing comment row in place (key unchanged, so
    /// creation order is preserved).
    pub fn update_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        let key = self.comment_key(comment.id)?;
        let cf = self.cf(CF_COMMENTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &encode_row(comment)?);
        self.write(batch)
    }

    /// Delete a comment row, its index entry, and its reactions.
    pub fn delete_comment(&self, comment_id: Uuid) -> Result<(), StoreError> {
        let key = self.comment_key(comment_id)?;
        let cf = self.cf(CF_COMMENTS)?;
        let cf_idx = self.cf(CF_COMMENT_INDEX)?;
        let cf_reactions = self.cf(CF_REACTIONS)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, &key);
        batch.delete_cf(&cf_idx, comment_id.as_bytes());
        for (rkey, _) in self.scan_prefix(CF_REACTIONS, comment_id.as_bytes(), false)? {
            batch.delete_cf(&cf_reactions, &rkey);
        }
        self.write(batch)
    }

    /// All comments for a document in creation order.
    pub fn list_comments(&self, doc_id: Uuid) -> Result<Vec<Comment>, StoreError> {
        self.scan_prefix(CF_COMMENTS, doc_id.as_bytes(), false)?
            .into_iter()
            .map(|(_, value)| decode_row(&value))
            .collect()
    }

    // ─── Reactions ────────────────────────────────────────────────────

    fn reaction_key(comment_id: Uuid, user_id: Uuid, symbol: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(32 + symbol.len());
        key.extend_from_slice(comment_id.as_bytes());
        key.extend_from_slice(user_id.as_bytes());
        key.extend_from_slice(symbol.as_bytes());
        key
    }

    pub fn put_reaction(&self, reaction: &Reaction) -> Result<(), StoreError> {
        let cf = self.cf(CF_REACTIONS)?;
        let key = Self::reaction_key(reaction.comment_id, reaction.user_id, &reaction.symbol);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &encode_row(reaction)?);
        self.write(batch)
    }

    pub fn get_reaction(
        &self,
        comment_id: Uuid,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Reaction>, StoreError> {
        let cf = self.cf(CF_REACTIONS)?;
        let key = Self::reaction_key(comment_id, user_id, symbol);
        match self.db.get_cf(&cf, &key)? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_reaction(
        &self,
        comment_id: Uuid,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_REACTIONS)?;
        let key = Self::reaction_key(comment_id, user_id, symbol);
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, &key);
        self.write(batch)
    }

    /// All reactions on a comment.
    pub fn list_reactions(&self, comment_id: Uuid) -> Result<Vec<Reaction>, StoreError> {
        self.scan_prefix(CF_REACTIONS, comment_id.as_bytes(), false)?
            .into_iter()
            .map(|(_, value)| decode_row(&value))
            .collect()
    }

    // ─── Versions ─────────────────────────────────────────────────────

    fn version_idx_key(tag: u8, id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(17);
        key.push(tag);
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Number a version draft and persist it as the document's new
    /// current version. Returns the completed version.
    ///
    /// The draft's `major`/`minor`/`version_number`/`parent_version_id`
    /// are assigned here: the old current version is read, the number
    /// computed, and the new row written all under the sequence lock,
    /// so two concurrent commits on one document can never share a
    /// number. The previous current row is demoted in the same write
    /// batch, so there is never a moment with zero or two current rows.
    pub fn commit_version(
        &self,
        mut version: DocumentVersion,
        major_bump: bool,
    ) -> Result<DocumentVersion, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let cf_idx = self.cf(CF_VERSION_INDEX)?;
        let pointer_key = Self::version_idx_key(IDX_CURRENT, version.doc_id);

        let mut seqs = self.seqs.lock().unwrap_or_else(|e| e.into_inner());
        let map_key = (CF_VERSIONS, version.doc_id.as_bytes().to_vec());
        let last = match seqs.get(&map_key) {
            Some(n) => *n,
            None => self.recover_last_seq(CF_VERSIONS, version.doc_id.as_bytes())?,
        };
        let seq = last + 1;

        let old = match self.db.get_cf(&cf_idx, &pointer_key)? {
            Some(old_key) => match self.db.get_cf(&cf, &old_key)? {
                Some(bytes) => Some((old_key, decode_row::<StoredVersion>(&bytes)?)),
                None => None,
            },
            None => None,
        };

        let (major, minor) = match old.as_ref().map(|(_, row)| row) {
            None => (1, 0),
            Some(cur) if major_bump => (cur.major + 1, 0),
            Some(cur) => (cur.major, cur.minor + 1),
        };
        version.major = major;
        version.minor = minor;
        version.version_number = (major as u64) * 100 + minor as u64;
        version.parent_version_id = old.as_ref().map(|(_, row)| row.id);
        version.is_current = true;

        let key = Self::seq_key(version.doc_id.as_bytes(), seq);
        let row = StoredVersion::from_version(&version)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &encode_row(&row)?);
        batch.put_cf(&cf_idx, Self::version_idx_key(IDX_VERSION, version.id), &key);
        if let Some((old_key, mut old_row)) = old {
            old_row.is_current = false;
            batch.put_cf(&cf, &old_key, &encode_row(&old_row)?);
        }
        batch.put_cf(&cf_idx, &pointer_key, &key);

        self.write(batch)?;
        seqs.insert(map_key, seq);
        Ok(version)
    }

    fn version_key(&self, version_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let cf_idx = self.cf(CF_VERSION_INDEX)?;
        self.db
            .get_cf(&cf_idx, Self::version_idx_key(IDX_VERSION, version_id))?
            .ok_or(StoreError::NotFound(version_id))
    }

    pub fn get_version(&self, version_id: Uuid) -> Result<DocumentVersion, StoreError> {
        let key = self.version_key(version_id)?;
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(&cf, &key)? {
            Some(bytes) => decode_row::<StoredVersion>(&bytes)?.into_version(),
            None => Err(StoreError::NotFound(version_id)),
        }
    }

    /// Delete a version row and its index entry. Callers are expected
    /// to refuse deleting the current version before reaching here.
    pub fn delete_version(&self, version_id: Uuid) -> Result<(), StoreError> {
        let key = self.version_key(version_id)?;
        let cf = self.cf(CF_VERSIONS)?;
        let cf_idx = self.cf(CF_VERSION_INDEX)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, &key);
        batch.delete_cf(&cf_idx, Self::version_idx_key(IDX_VERSION, version_id));
        self.write(batch)
    }

    /// All versions of a document, newest first.
    pub fn list_versions(&self, doc_id: Uuid) -> Result<Vec<DocumentVersion>, StoreError> {
        self.scan_prefix(CF_VERSIONS, doc_id.as_bytes(), true)?
            .into_iter()
            .map(|(_, value)| decode_row::<StoredVersion>(&value)?.into_version())
            .collect()
    }

    /// The document's current version, if any version exists.
    pub fn current_version(&self, doc_id: Uuid) -> Result<Option<DocumentVersion>, StoreError> {
        let cf_idx = self.cf(CF_VERSION_INDEX)?;
        let pointer_key = Self::version_idx_key(IDX_CURRENT, doc_id);
        let Some(key) = self.db.get_cf(&cf_idx, &pointer_key)? else {
            return Ok(None);
        };
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(&cf, &key)? {
            Some(bytes) => Ok(Some(decode_row::<StoredVersion>(&bytes)?.into_version()?)),
            None => Ok(None),
        }
    }

    /// Number of auto-created versions stored for a document.
    pub fn count_auto_versions(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let mut count = 0u64;
        for (_, value) in self.scan_prefix(CF_VERSIONS, doc_id.as_bytes(), false)? {
            let row: StoredVersion = decode_row(&value)?;
            if row.change_kind == ChangeKind::Auto {
                count += 1;
            }
        }
        Ok(count)
    }

    // ─── Branches ─────────────────────────────────────────────────────

    fn branch_key(doc_id: Uuid, branch_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(branch_id.as_bytes());
        key
    }

    pub fn insert_branch(&self, branch: &VersionBranch) -> Result<(), StoreError> {
        let cf = self.cf(CF_BRANCHES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf,
            Self::branch_key(branch.doc_id, branch.id),
            &encode_row(branch)?,
        );
        self.write(batch)
    }

    pub fn get_branch(&self, doc_id: Uuid, branch_id: Uuid) -> Result<VersionBranch, StoreError> {
        let cf = self.cf(CF_BRANCHES)?;
        match self.db.get_cf(&cf, Self::branch_key(doc_id, branch_id))? {
            Some(bytes) => decode_row(&bytes),
            None => Err(StoreError::NotFound(branch_id)),
        }
    }

    pub fn update_branch(&self, branch: &VersionBranch) -> Result<(), StoreError> {
        // Same key layout as insert; overwrite in place.
        self.get_branch(branch.doc_id, branch.id)?;
        self.insert_branch(branch)
    }

    pub fn list_branches(&self, doc_id: Uuid) -> Result<Vec<VersionBranch>, StoreError> {
        self.scan_prefix(CF_BRANCHES, doc_id.as_bytes(), false)?
            .into_iter()
            .map(|(_, value)| decode_row(&value))
            .collect()
    }

    // ─── Version comments ─────────────────────────────────────────────

    /// Append a note to a version's discussion. Returns the sequence.
    pub fn append_version_comment(&self, comment: &VersionComment) -> Result<u64, StoreError> {
        let cf = self.cf(CF_VERSION_COMMENTS)?;
        let seq = self.next_seq(CF_VERSION_COMMENTS, comment.version_id.as_bytes())?;
        let key = Self::seq_key(comment.version_id.as_bytes(), seq);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &encode_row(comment)?);
        self.write(batch)?;
        Ok(seq)
    }

    /// Notes on a version in posting order.
    pub fn list_version_comments(
        &self,
        version_id: Uuid,
    ) -> Result<Vec<VersionComment>, StoreError> {
        self.scan_prefix(CF_VERSION_COMMENTS, version_id.as_bytes(), false)?
            .into_iter()
            .map(|(_, value)| decode_row(&value))
            .collect()
    }

    // ─── Auto-version settings ────────────────────────────────────────

    fn settings_key(user_id: Uuid, doc_id: Option<Uuid>) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(user_id.as_bytes());
        key.extend_from_slice(doc_id.unwrap_or(Uuid::nil()).as_bytes());
        key
    }

    pub fn put_auto_settings(&self, settings: &AutoVersionSettings) -> Result<(), StoreError> {
        let cf = self.cf(CF_SETTINGS)?;
        let key = Self::settings_key(settings.user_id, settings.doc_id);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &encode_row(settings)?);
        self.write(batch)
    }

    pub fn get_auto_settings(
        &self,
        user_id: Uuid,
        doc_id: Option<Uuid>,
    ) -> Result<Option<AutoVersionSettings>, StoreError> {
        let cf = self.cf(CF_SETTINGS)?;
        match self.db.get_cf(&cf, Self::settings_key(user_id, doc_id))? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Effective settings for a user on a document: the per-document
    /// row wins over the user's global row; with neither present a
    /// default global row is created and returned.
    pub fn resolve_auto_settings(
        &self,
        user_id: Uuid,
        doc_id: Uuid,
    ) -> Result<AutoVersionSettings, StoreError> {
        if let Some(doc_row) = self.get_auto_settings(user_id, Some(doc_id))? {
            return Ok(doc_row);
        }
        if let Some(global) = self.get_auto_settings(user_id, None)? {
            return Ok(global);
        }
        let default = AutoVersionSettings::default_global(user_id);
        self.put_auto_settings(&default)?;
        Ok(default)
    }

    // ─── Follow sessions ──────────────────────────────────────────────

    fn follow_prefix(doc_id: Uuid, follower_id: Uuid) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(32);
        prefix.extend_from_slice(doc_id.as_bytes());
        prefix.extend_from_slice(follower_id.as_bytes());
        prefix
    }

    /// Append a follow session row. Returns the assigned sequence.
    pub fn append_follow_session(&self, session: &FollowSession) -> Result<u64, StoreError> {
        let cf = self.cf(CF_FOLLOW)?;
        let prefix = Self::follow_prefix(session.doc_id, session.follower_id);
        let seq = self.next_seq(CF_FOLLOW, &prefix)?;
        let key = Self::seq_key(&prefix, seq);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &encode_row(session)?);
        self.write(batch)?;
        Ok(seq)
    }

    /// Overwrite the stored row for a session (matched by id).
    pub fn update_follow_session(&self, session: &FollowSession) -> Result<(), StoreError> {
        let cf = self.cf(CF_FOLLOW)?;
        let prefix = Self::follow_prefix(session.doc_id, session.follower_id);
        for (key, value) in self.scan_prefix(CF_FOLLOW, &prefix, false)? {
            let row: FollowSession = decode_row(&value)?;
            if row.id == session.id {
                let mut batch = WriteBatch::default();
                batch.put_cf(&cf, &key, &encode_row(session)?);
                return self.write(batch);
            }
        }
        Err(StoreError::NotFound(session.id))
    }

    /// The follower's active session on a document, if any.
    pub fn active_follow_session(
        &self,
        doc_id: Uuid,
        follower_id: Uuid,
    ) -> Result<Option<FollowSession>, StoreError> {
        let prefix = Self::follow_prefix(doc_id, follower_id);
        for (_, value) in self.scan_prefix(CF_FOLLOW, &prefix, true)? {
            let row: FollowSession = decode_row(&value)?;
            if row.is_active {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Full follow history for a follower on a document, oldest first.
    pub fn list_follow_sessions(
        &self,
        doc_id: Uuid,
        follower_id: Uuid,
    ) -> Result<Vec<FollowSession>, StoreError> {
        let prefix = Self::follow_prefix(doc_id, follower_id);
        self.scan_prefix(CF_FOLLOW, &prefix, false)?
            .into_iter()
            .map(|(_, value)| decode_row(&value))
            .collect()
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
