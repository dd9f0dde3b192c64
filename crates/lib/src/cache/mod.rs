//! Content-addressed package cache.
//!
//! Maps a [`Fingerprint`] to an immutable [`CacheEntry`]. The cache also owns
//! the reservation table that guarantees at most one in-flight build per
//! fingerprint: the first caller to [`reserve`](PackageCache::reserve) gets a
//! [`BuildToken`], everyone else gets a [`BuildWaiter`] that resolves when the
//! owner commits or aborts. Callers sharing one `PackageCache` meet in the
//! in-memory table; different handles on the same directory meet at the
//! fingerprint's lock file.
//!
//! # Layout
//!
//! ```text
//! <root>/entries/<hex>/entry.json     committed record
//! <root>/entries/<hex>/package/       committed artifacts
//! <root>/staging/<hex>.lock           build lock, held by the token owner
//! <root>/staging/<hex>-<suffix>/      one fresh directory per token
//! ```
//!
//! Lookups never delete anything. An entry that fails verification stays on
//! disk until the next builder of that fingerprint, holding its lock, clears
//! it.
//!
//! # Submodules
//!
//! - `entry` - entry records and integrity verification
//! - `lock` - per-fingerprint OS locks
//! - [`retention`] - eviction policies

mod entry;
mod lock;
pub mod retention;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::consts::{ENTRIES_DIR, PACKAGE_DIR, RESERVATION_SHARDS, STAGING_DIR};
use crate::fingerprint::Fingerprint;
use crate::util::hash::DigestError;

use lock::BuildLock;

pub use entry::{CacheEntry, NewEntry};
pub use retention::{EntrySummary, GcStats, KeepAll, MaxEntries, RetentionPolicy};

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize cache entry: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("failed to hash package directory: {0}")]
  Hash(#[from] DigestError),

  /// An on-disk entry failed integrity verification.
  #[error("cache entry {fingerprint} is corrupted: {reason}")]
  Corrupted { fingerprint: String, reason: String },

  #[error("cache entry {0} is already committed")]
  AlreadyCommitted(String),

  #[error("cache background task failed: {0}")]
  Task(String),
}

impl CacheError {
  pub(crate) fn io(path: &Path, source: io::Error) -> Self {
    CacheError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Result of [`PackageCache::lookup`].
#[derive(Debug, Clone)]
pub enum Lookup {
  Hit(Arc<CacheEntry>),
  Miss,
}

/// Result of [`PackageCache::reserve`].
#[derive(Debug)]
pub enum Reservation {
  /// The caller owns the build of this fingerprint.
  Token(BuildToken),
  /// Someone else is building it.
  AlreadyBuilding(BuildWaiter),
  /// It is already committed.
  Present(Arc<CacheEntry>),
}

/// Result of [`PackageCache::acquire`].
#[derive(Debug)]
pub enum Acquired {
  Hit(Arc<CacheEntry>),
  Build(BuildToken),
}

enum Slot {
  Building(watch::Receiver<()>),
  Committed(Arc<CacheEntry>),
}

struct ReservationTable {
  shards: Vec<Mutex<HashMap<Fingerprint, Slot>>>,
}

impl ReservationTable {
  fn new() -> Self {
    Self {
      shards: (0..RESERVATION_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
    }
  }

  fn shard(&self, fingerprint: &Fingerprint) -> MutexGuard<'_, HashMap<Fingerprint, Slot>> {
    let idx = fingerprint.shard_byte() as usize % self.shards.len();
    self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Drop a `Building` slot. Committed slots are left alone.
  fn release(&self, fingerprint: &Fingerprint) {
    let mut shard = self.shard(fingerprint);
    if matches!(shard.get(fingerprint), Some(Slot::Building(_))) {
      shard.remove(fingerprint);
    }
  }
}

/// Exclusive right to build one fingerprint.
///
/// Dropping a token without committing it aborts the reservation.
pub struct BuildToken {
  fingerprint: Fingerprint,
  staging: TempDir,
  lock: Option<BuildLock>,
  table: Arc<ReservationTable>,
  done: Option<watch::Sender<()>>,
}

impl BuildToken {
  pub fn fingerprint(&self) -> Fingerprint {
    self.fingerprint
  }

  /// Private working area for this build.
  ///
  /// Created empty by [`PackageCache::reserve`] and never shared with
  /// another token, even of the same fingerprint.
  pub fn staging_dir(&self) -> &Path {
    self.staging.path()
  }

  /// Where the package phase must lay out artifacts.
  pub fn package_dir(&self) -> PathBuf {
    self.staging.path().join(PACKAGE_DIR)
  }

  fn release(&mut self) {
    if let Some(done) = self.done.take() {
      if let Some(lock) = self.lock.take() {
        debug!(lock = ?lock.path(), "releasing build lock");
      }
      self.table.release(&self.fingerprint);
      // Waiters observe the sender closing
      drop(done);
    }
  }
}

impl Drop for BuildToken {
  fn drop(&mut self) {
    if self.done.is_some() {
      debug!(fingerprint = %self.fingerprint.short(), "build token dropped without commit");
      self.release();
    }
  }
}

impl std::fmt::Debug for BuildToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildToken")
      .field("fingerprint", &self.fingerprint)
      .field("staging_dir", &self.staging.path())
      .finish()
  }
}

#[derive(Debug)]
enum WaitOn {
  /// A token handed out by this cache.
  Local(watch::Receiver<()>),
  /// A token held through another handle on the same directory.
  Lock(PathBuf),
}

/// Handle for waiting on somebody else's build.
#[derive(Debug)]
pub struct BuildWaiter {
  fingerprint: Fingerprint,
  on: WaitOn,
}

impl BuildWaiter {
  pub fn fingerprint(&self) -> Fingerprint {
    self.fingerprint
  }

  /// Suspend until the owning build commits or aborts.
  pub async fn wait(self) {
    match self.on {
      WaitOn::Local(mut done) => {
        // Nothing is ever sent; this resolves when the sender is dropped.
        while done.changed().await.is_ok() {}
      }
      WaitOn::Lock(path) => {
        let waited = tokio::task::spawn_blocking(move || lock::wait_released(&path)).await;
        match waited {
          Ok(Ok(())) => {}
          Ok(Err(e)) => warn!(fingerprint = %self.fingerprint.short(), error = %e, "failed to wait on build lock"),
          Err(e) => warn!(fingerprint = %self.fingerprint.short(), error = %e, "build lock wait task failed"),
        }
      }
    }
  }
}

/// A package cache rooted at one directory.
///
/// Share it between workers as `Arc<PackageCache>`. Two caches opened on the
/// same directory share entries on disk and exclude each other through the
/// per-fingerprint lock files.
pub struct PackageCache {
  root: PathBuf,
  table: Arc<ReservationTable>,
}

impl PackageCache {
  /// Open (creating if needed) a cache rooted at `root`.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
    let root = root.into();
    for dir in [root.join(ENTRIES_DIR), root.join(STAGING_DIR)] {
      std::fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
    }
    debug!(root = ?root, "opened package cache");
    Ok(Self {
      root,
      table: Arc::new(ReservationTable::new()),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
    self.root.join(ENTRIES_DIR).join(fingerprint.to_hex())
  }

  fn lock_path(&self, fingerprint: &Fingerprint) -> PathBuf {
    self.root.join(STAGING_DIR).join(format!("{}.lock", fingerprint.to_hex()))
  }

  /// Find a committed entry.
  ///
  /// Entries loaded from disk are verified first. A corrupted entry is
  /// logged and reported as a miss; the builder that reserves it next
  /// removes it.
  pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Lookup, CacheError> {
    let in_memory = match self.table.shard(fingerprint).get(fingerprint) {
      Some(Slot::Committed(entry)) => Some(Lookup::Hit(entry.clone())),
      Some(Slot::Building(_)) => Some(Lookup::Miss),
      None => None,
    };
    if let Some(found) = in_memory {
      return Ok(found);
    }

    let dir = self.entry_dir(fingerprint);
    let expected = *fingerprint;
    let loaded = tokio::task::spawn_blocking(move || entry::read_record(&dir, expected))
      .await
      .map_err(|e| CacheError::Task(e.to_string()))?;

    match loaded {
      Ok(Some(entry)) => {
        let entry = self.remember(entry);
        debug!(fingerprint = %fingerprint.short(), package = %entry.package, "cache hit on disk");
        Ok(Lookup::Hit(entry))
      }
      Ok(None) => Ok(Lookup::Miss),
      Err(err @ CacheError::Corrupted { .. }) => {
        warn!(fingerprint = %fingerprint.short(), error = %err, "cache entry corrupted, will rebuild");
        Ok(Lookup::Miss)
      }
      Err(err) => Err(err),
    }
  }

  /// Record an entry found on disk, unless a build of it is in flight here.
  fn remember(&self, entry: CacheEntry) -> Arc<CacheEntry> {
    let mut shard = self.table.shard(&entry.fingerprint);
    match shard.get(&entry.fingerprint) {
      Some(Slot::Committed(known)) => known.clone(),
      Some(Slot::Building(_)) => Arc::new(entry),
      None => {
        let entry = Arc::new(entry);
        shard.insert(entry.fingerprint, Slot::Committed(entry.clone()));
        entry
      }
    }
  }

  /// Try to become the builder of `fingerprint`.
  ///
  /// A granted token holds the fingerprint's lock file and a fresh, empty
  /// staging directory. It does not look at `entries/`; see
  /// [`acquire`](Self::acquire) for that.
  pub fn reserve(&self, fingerprint: &Fingerprint) -> Result<Reservation, CacheError> {
    let mut shard = self.table.shard(fingerprint);
    match shard.get(fingerprint) {
      Some(Slot::Committed(entry)) => return Ok(Reservation::Present(entry.clone())),
      Some(Slot::Building(done)) => {
        return Ok(Reservation::AlreadyBuilding(BuildWaiter {
          fingerprint: *fingerprint,
          on: WaitOn::Local(done.clone()),
        }));
      }
      None => {}
    }

    let lock_path = self.lock_path(fingerprint);
    let Some(lock) = BuildLock::try_acquire(&lock_path).map_err(|e| CacheError::io(&lock_path, e))? else {
      debug!(fingerprint = %fingerprint.short(), "fingerprint locked by another cache handle");
      return Ok(Reservation::AlreadyBuilding(BuildWaiter {
        fingerprint: *fingerprint,
        on: WaitOn::Lock(lock_path),
      }));
    };

    let staging_root = self.root.join(STAGING_DIR);
    let staging = tempfile::Builder::new()
      .prefix(&format!("{}-", fingerprint.to_hex()))
      .tempdir_in(&staging_root)
      .map_err(|e| CacheError::io(&staging_root, e))?;

    let (tx, rx) = watch::channel(());
    shard.insert(*fingerprint, Slot::Building(rx));
    Ok(Reservation::Token(BuildToken {
      fingerprint: *fingerprint,
      staging,
      lock: Some(lock),
      table: self.table.clone(),
      done: Some(tx),
    }))
  }

  /// Return a committed entry, or a token to build it.
  ///
  /// Waits out any in-flight build of the same fingerprint and then looks
  /// again, so an aborted build hands the reservation to one of its waiters.
  /// Once it holds a token it settles `entries/<hex>/` under the lock: a valid
  /// entry committed meanwhile through another handle is a hit, anything
  /// unusable left there is removed before the token is returned.
  pub async fn acquire(&self, fingerprint: &Fingerprint) -> Result<Acquired, CacheError> {
    loop {
      if let Lookup::Hit(entry) = self.lookup(fingerprint).await? {
        return Ok(Acquired::Hit(entry));
      }

      match self.reserve(fingerprint)? {
        Reservation::Token(mut token) => {
          let dir = self.entry_dir(fingerprint);
          let expected = *fingerprint;
          let settled = tokio::task::spawn_blocking(move || settle_entry_dir(&dir, expected))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?;
          return match settled {
            Ok(Some(entry)) => {
              let entry = Arc::new(entry);
              self
                .table
                .shard(fingerprint)
                .insert(*fingerprint, Slot::Committed(entry.clone()));
              token.release();
              Ok(Acquired::Hit(entry))
            }
            Ok(None) => Ok(Acquired::Build(token)),
            Err(err) => {
              self.abort(token).await;
              Err(err)
            }
          };
        }
        Reservation::Present(entry) => return Ok(Acquired::Hit(entry)),
        Reservation::AlreadyBuilding(waiter) => {
          debug!(fingerprint = %fingerprint.short(), "waiting for in-flight build");
          waiter.wait().await;
        }
      }
    }
  }

  /// Publish the build held by `token`.
  ///
  /// The token's staging directory becomes the entry directory and its
  /// `package/` subdirectory the artifact directory. This is the only way an
  /// entry becomes visible.
  pub async fn commit(&self, mut token: BuildToken, draft: NewEntry) -> Result<Arc<CacheEntry>, CacheError> {
    let fingerprint = token.fingerprint;
    let final_dir = self.entry_dir(&fingerprint);

    let entry = match self.publish(&token, draft, &final_dir).await {
      Ok(entry) => Arc::new(entry),
      Err(err) => {
        self.abort(token).await;
        return Err(err);
      }
    };

    self
      .table
      .shard(&fingerprint)
      .insert(fingerprint, Slot::Committed(entry.clone()));
    // The slot is already Committed, so this only drops the lock and wakes waiters
    token.release();

    info!(fingerprint = %fingerprint.short(), package = %entry.package, "committed cache entry");
    Ok(entry)
  }

  async fn publish(&self, token: &BuildToken, draft: NewEntry, final_dir: &Path) -> Result<CacheEntry, CacheError> {
    let fingerprint = token.fingerprint;
    let staging = token.staging_dir().to_path_buf();
    let existing = final_dir.to_path_buf();
    let mut entry = tokio::task::spawn_blocking(move || -> Result<CacheEntry, CacheError> {
      if settle_entry_dir(&existing, fingerprint)?.is_some() {
        return Err(CacheError::AlreadyCommitted(fingerprint.to_hex()));
      }
      std::fs::create_dir_all(staging.join(PACKAGE_DIR)).map_err(|e| CacheError::io(&staging, e))?;
      let entry = entry::seal(fingerprint, draft, &staging.join(PACKAGE_DIR))?;
      entry::write_record(&staging, &entry)?;
      Ok(entry)
    })
    .await
    .map_err(|e| CacheError::Task(e.to_string()))??;

    tokio::fs::rename(token.staging_dir(), final_dir)
      .await
      .map_err(|e| CacheError::io(final_dir, e))?;

    entry.package_dir = final_dir.join(PACKAGE_DIR);
    Ok(entry)
  }

  /// Give up the build held by `token`, discarding its staging directory.
  pub async fn abort(&self, mut token: BuildToken) {
    if let Err(e) = remove_dir_if_exists(token.staging_dir()).await {
      warn!(fingerprint = %token.fingerprint.short(), error = %e, "failed to clean staging directory");
    }
    debug!(fingerprint = %token.fingerprint.short(), "aborted reservation");
    token.release();
  }

  /// Whether the fingerprint is currently being built.
  pub fn is_building(&self, fingerprint: &Fingerprint) -> bool {
    matches!(self.table.shard(fingerprint).get(fingerprint), Some(Slot::Building(_)))
  }

  /// Summaries of every committed entry on disk.
  pub fn committed(&self) -> Result<Vec<EntrySummary>, CacheError> {
    let entries_dir = self.root.join(ENTRIES_DIR);
    let mut summaries = Vec::new();

    for dir_entry in std::fs::read_dir(&entries_dir).map_err(|e| CacheError::io(&entries_dir, e))? {
      let dir_entry = dir_entry.map_err(|e| CacheError::io(&entries_dir, e))?;
      let Some(name) = dir_entry.file_name().to_str().map(str::to_string) else {
        continue;
      };
      let Ok(fingerprint) = name.parse::<Fingerprint>() else {
        continue;
      };
      if let Some(record) = entry::peek_record(&dir_entry.path()) {
        summaries.push(EntrySummary {
          fingerprint,
          package: record.package,
          created_at_unix: record.created_at_unix,
        });
      }
    }

    summaries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    Ok(summaries)
  }

  /// Evict the entries `policy` selects and clear abandoned staging areas.
  ///
  /// Staging areas of in-flight builds are left alone.
  pub fn collect_garbage(&self, policy: &dyn RetentionPolicy) -> Result<GcStats, CacheError> {
    let summaries = self.committed()?;
    let mut stats = GcStats {
      entries_scanned: summaries.len(),
      ..GcStats::default()
    };

    for fingerprint in policy.select_evictions(&summaries) {
      let dir = self.entry_dir(&fingerprint);
      let mut shard = self.table.shard(&fingerprint);
      if matches!(shard.get(&fingerprint), Some(Slot::Building(_))) {
        continue;
      }
      let lock_path = self.lock_path(&fingerprint);
      let Some(_lock) = BuildLock::try_acquire(&lock_path).map_err(|e| CacheError::io(&lock_path, e))? else {
        debug!(fingerprint = %fingerprint.short(), "entry locked elsewhere, not evicting");
        continue;
      };
      shard.remove(&fingerprint);
      match std::fs::remove_dir_all(&dir) {
        Ok(()) => stats.entries_evicted += 1,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(CacheError::io(&dir, e)),
      }
    }

    let staging_root = self.root.join(STAGING_DIR);
    for dir_entry in std::fs::read_dir(&staging_root).map_err(|e| CacheError::io(&staging_root, e))? {
      let dir_entry = dir_entry.map_err(|e| CacheError::io(&staging_root, e))?;
      let path = dir_entry.path();
      // Lock files stay
      if !dir_entry.file_type().map_err(|e| CacheError::io(&path, e))?.is_dir() {
        continue;
      }

      let owner = dir_entry
        .file_name()
        .to_str()
        .and_then(|name| name.split_once('-'))
        .and_then(|(hex, _)| hex.parse::<Fingerprint>().ok());
      let _lock = match owner {
        Some(fingerprint) => {
          if self.is_building(&fingerprint) {
            continue;
          }
          let lock_path = self.lock_path(&fingerprint);
          match BuildLock::try_acquire(&lock_path).map_err(|e| CacheError::io(&lock_path, e))? {
            Some(lock) => Some(lock),
            None => continue,
          }
        }
        None => None,
      };

      std::fs::remove_dir_all(&path).map_err(|e| CacheError::io(&path, e))?;
      stats.staging_removed += 1;
    }

    info!(
      scanned = stats.entries_scanned,
      evicted = stats.entries_evicted,
      staging_removed = stats.staging_removed,
      "cache garbage collection complete"
    );
    Ok(stats)
  }
}

impl std::fmt::Debug for PackageCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PackageCache").field("root", &self.root).finish_non_exhaustive()
  }
}

/// Keep a valid committed entry in `dir`, or clear whatever is there.
///
/// Only call this while holding the fingerprint's token.
fn settle_entry_dir(dir: &Path, fingerprint: Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
  match entry::read_record(dir, fingerprint) {
    Ok(Some(entry)) => Ok(Some(entry)),
    Ok(None) | Err(CacheError::Corrupted { .. }) => {
      match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!(fingerprint = %fingerprint.short(), "removed unusable entry directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(CacheError::io(dir, e)),
      }
      Ok(None)
    }
    Err(err) => Err(err),
  }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), CacheError> {
  match tokio::fs::remove_dir_all(path).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(CacheError::io(path, e)),
  }
}
