//! Per-job resource accounting: temp files, cached connections, cached
//! credentials, and large-file telemetry.
//!
//! One [`ResourceManager`] per job. All state sits behind a single lock so a
//! manager can be shared across tasks, though the orchestrator only ever
//! touches it from one.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tempfile::{Builder, NamedTempFile, TempDir, TempPath};
use tracing::{debug, info, warn};

use folio_shared::{FolioError, JobId, ResourceConfig, Result};

/// Prefix of every per-job temp directory.
pub const TEMP_DIR_PREFIX: &str = "book_ingestion_";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A cached handle the manager can close at the end of a job.
pub trait ManagedConnection: Send + Sync {
    fn close(&self) -> Result<()>;
}

struct CachedCredential {
    value: serde_json::Value,
    /// `None` when the TTL is too large to represent; never expires.
    expires_at: Option<Instant>,
}

/// A temp file the manager owns. Dropping the [`TempPath`] deletes it.
struct TrackedFile {
    size: u64,
    path: TempPath,
}

#[derive(Default)]
struct Counters {
    temp_files_created: u64,
    temp_files_cleaned: u64,
    peak_space_bytes: u64,
    connections_created: u64,
    connections_reused: u64,
    credentials_cached: u64,
    cache_hits: u64,
    large_files_processed: u64,
    memory_cleanups: u64,
}

#[derive(Default)]
struct ResourceState {
    /// Created on first temp file, removed by `cleanup_all`.
    job_dir: Option<TempDir>,
    temp_files: BTreeMap<PathBuf, TrackedFile>,
    connections: HashMap<String, Arc<dyn ManagedConnection>>,
    credentials: HashMap<String, CachedCredential>,
    counters: Counters,
}

impl ResourceState {
    fn space_used(&self) -> u64 {
        self.temp_files.values().map(|f| f.size).sum()
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TempFileStats {
    pub created: u64,
    pub cleaned: u64,
    pub active: usize,
    pub space_used_mb: f64,
    pub peak_space_mb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub connections_created: u64,
    pub connections_reused: u64,
    pub active_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStats {
    pub cached: u64,
    pub cache_hits: u64,
    pub active_cache_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub large_files_processed: u64,
    pub memory_cleanups: u64,
}

/// Snapshot returned by [`ResourceManager::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub job_id: String,
    pub temp_files: TempFileStats,
    pub database: ConnectionStats,
    pub credentials: CredentialStats,
    pub memory: MemoryStats,
}

// ---------------------------------------------------------------------------
// ResourceManager
// ---------------------------------------------------------------------------

pub struct ResourceManager {
    job_id: JobId,
    temp_root: PathBuf,
    credential_ttl: Duration,
    large_file_bytes: u64,
    max_temp_bytes: u64,
    state: Mutex<ResourceState>,
}

fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

impl ResourceManager {
    pub fn new(job_id: JobId, config: &ResourceConfig) -> Self {
        let temp_root = config
            .temp_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        Self {
            job_id,
            temp_root,
            credential_ttl: Duration::from_secs(config.credential_ttl_secs),
            large_file_bytes: mb_to_bytes(config.large_file_threshold_mb),
            max_temp_bytes: mb_to_bytes(config.max_temp_space_mb),
            state: Mutex::new(ResourceState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Directory holding this job's temp files, if one exists right now.
    /// It is created on first use and removed by [`Self::cleanup_all`].
    pub fn job_dir(&self) -> Option<PathBuf> {
        self.state()
            .job_dir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
    }

    // -----------------------------------------------------------------------
    // Temp files
    // -----------------------------------------------------------------------

    /// `book_ingestion_{job_id}_<random>` under the temp root.
    fn ensure_job_dir(&self, state: &mut ResourceState) -> Result<PathBuf> {
        if let Some(dir) = &state.job_dir {
            return Ok(dir.path().to_path_buf());
        }
        std::fs::create_dir_all(&self.temp_root)
            .map_err(|e| FolioError::io(&self.temp_root, e))?;
        let dir = Builder::new()
            .prefix(&format!("{TEMP_DIR_PREFIX}{}_", self.job_id))
            .tempdir_in(&self.temp_root)
            .map_err(|e| FolioError::io(&self.temp_root, e))?;
        let path = dir.path().to_path_buf();
        debug!(dir = ?path, "created job temp dir");
        state.job_dir = Some(dir);
        Ok(path)
    }

    fn new_temp_file(
        &self,
        state: &mut ResourceState,
        prefix: &str,
        suffix: &str,
    ) -> Result<NamedTempFile> {
        let dir = self.ensure_job_dir(state)?;
        let file = Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&dir)
            .map_err(|e| FolioError::io(&dir, e))?;
        state.counters.temp_files_created += 1;
        Ok(file)
    }

    /// Create an empty, tracked temp file named `{prefix}<random>{suffix}`.
    /// It lives until [`Self::cleanup_file`] or [`Self::cleanup_all`].
    pub fn temp_file(&self, prefix: &str, suffix: &str) -> Result<PathBuf> {
        let mut state = self.state();
        let path = self.new_temp_file(&mut state, prefix, suffix)?.into_temp_path();
        let key = path.to_path_buf();
        state
            .temp_files
            .insert(key.clone(), TrackedFile { size: 0, path });
        debug!(path = ?key, "created temp file");
        Ok(key)
    }

    /// Temp file whose name ties it to `page_number`, so
    /// [`Self::cleanup_page_resources`] can find it.
    pub fn page_temp_file(&self, page_number: u32, suffix: &str) -> Result<PathBuf> {
        self.temp_file(&format!("page_{page_number}_"), suffix)
    }

    /// Temp file in the job directory that deletes itself when dropped.
    ///
    /// Hand it back through [`Self::release_temp_file`] to have the deletion
    /// counted and any failure logged.
    pub fn scoped_temp_file(&self, prefix: &str, suffix: &str) -> Result<NamedTempFile> {
        let mut state = self.state();
        let file = self.new_temp_file(&mut state, prefix, suffix)?;
        debug!(path = ?file.path(), "created scoped temp file");
        Ok(file)
    }

    /// Delete a file from [`Self::scoped_temp_file`]. Failures are logged.
    pub fn release_temp_file(&self, file: NamedTempFile) {
        let path = file.path().to_path_buf();
        match file.close() {
            Ok(()) => {
                self.state().counters.temp_files_cleaned += 1;
                debug!(?path, "released scoped temp file");
            }
            Err(e) => warn!(?path, error = %e, "failed to remove scoped temp file"),
        }
    }

    /// Re-read a tracked file's size after it was written, updating space
    /// accounting and large-file telemetry. Returns the size in bytes.
    pub fn record_file_size(&self, path: &Path) -> Result<u64> {
        let size = std::fs::metadata(path)
            .map_err(|e| FolioError::io(path, e))?
            .len();

        let mut state = self.state();
        if let Some(known) = state.temp_files.get_mut(path) {
            known.size = size;
        }
        let used = state.space_used();
        state.counters.peak_space_bytes = state.counters.peak_space_bytes.max(used);
        if self.max_temp_bytes > 0 && used as f64 > self.max_temp_bytes as f64 * 0.8 {
            warn!(
                used_mb = used as f64 / BYTES_PER_MB,
                max_mb = self.max_temp_bytes as f64 / BYTES_PER_MB,
                "temp space above 80% of limit"
            );
        }
        drop(state);

        self.track_large_file(size);
        Ok(size)
    }

    /// Count a file above the large-file threshold. Returns whether it was.
    pub fn track_large_file(&self, size_bytes: u64) -> bool {
        if size_bytes <= self.large_file_bytes {
            return false;
        }
        self.state().counters.large_files_processed += 1;
        info!(size_mb = size_bytes as f64 / BYTES_PER_MB, "processing large file");
        true
    }

    /// Delete one tracked temp file. Failures are logged; returns whether
    /// the file is gone from tracking.
    pub fn cleanup_file(&self, path: &Path) -> bool {
        let mut state = self.state();
        let Some(tracked) = state.temp_files.remove(path) else {
            return false;
        };
        match tracked.path.close() {
            Ok(()) => {
                state.counters.temp_files_cleaned += 1;
                debug!(?path, "removed temp file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                state.counters.temp_files_cleaned += 1;
            }
            Err(e) => warn!(?path, error = %e, "failed to remove temp file"),
        }
        true
    }

    /// Delete every tracked temp file belonging to `page_number`.
    pub fn cleanup_page_resources(&self, page_number: u32) {
        let infix = format!("page_{page_number}_");
        let dotted = format!("_p{page_number}.");
        let matching: Vec<PathBuf> = self
            .state()
            .temp_files
            .keys()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(&infix) || n.contains(&dotted))
            })
            .cloned()
            .collect();

        for path in &matching {
            self.cleanup_file(path);
        }

        let mut state = self.state();
        if state.counters.large_files_processed > 0 {
            state.counters.memory_cleanups += 1;
            debug!(page = page_number, "memory cleanup hint after large files");
        }
        if !matching.is_empty() {
            debug!(page = page_number, files = matching.len(), "released page resources");
        }
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Return the cached connection for `key`, creating it with `factory`
    /// on first use.
    ///
    /// The lock is not held while `factory` runs, so the factory may call
    /// back into the manager. If two callers race, the first insert wins and
    /// the loser's connection is closed.
    pub fn get_db_connection<F>(&self, key: &str, factory: F) -> Result<Arc<dyn ManagedConnection>>
    where
        F: FnOnce() -> Result<Arc<dyn ManagedConnection>>,
    {
        {
            let mut state = self.state();
            if let Some(conn) = state.connections.get(key) {
                let conn = Arc::clone(conn);
                state.counters.connections_reused += 1;
                return Ok(conn);
            }
        }

        let created = factory()?;

        let mut state = self.state();
        let cached = Arc::clone(
            state
                .connections
                .entry(key.to_string())
                .or_insert_with(|| Arc::clone(&created)),
        );
        if Arc::ptr_eq(&cached, &created) {
            state.counters.connections_created += 1;
            debug!(key, "created cached connection");
        } else {
            state.counters.connections_reused += 1;
            drop(state);
            if let Err(e) = created.close() {
                warn!(key, error = %e, "failed to close duplicate connection");
            }
        }
        Ok(cached)
    }

    /// Close and forget every cached connection, logging individual failures.
    pub fn close_db_connections(&self) {
        let connections: Vec<(String, Arc<dyn ManagedConnection>)> =
            self.state().connections.drain().collect();
        for (key, conn) in connections {
            match conn.close() {
                Ok(()) => debug!(key = %key, "closed connection"),
                Err(e) => warn!(key = %key, error = %e, "failed to close connection"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    pub fn cache_credentials(&self, client_id: &str, credentials: serde_json::Value) {
        let mut state = self.state();
        state.credentials.insert(
            client_id.to_string(),
            CachedCredential {
                value: credentials,
                expires_at: Instant::now().checked_add(self.credential_ttl),
            },
        );
        state.counters.credentials_cached += 1;
    }

    /// Cached credentials for `client_id`, unless missing or expired.
    /// Expired entries are evicted.
    pub fn get_cached_credentials(&self, client_id: &str) -> Option<serde_json::Value> {
        let mut state = self.state();
        let expired = match state.credentials.get(client_id) {
            None => return None,
            Some(cached) => cached.expires_at.is_some_and(|at| Instant::now() >= at),
        };
        if expired {
            state.credentials.remove(client_id);
            debug!(client_id, "evicted expired credentials");
            return None;
        }
        state.counters.cache_hits += 1;
        state.credentials.get(client_id).map(|c| c.value.clone())
    }

    // -----------------------------------------------------------------------
    // Stats and teardown
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> ResourceStats {
        let state = self.state();
        let c = &state.counters;
        ResourceStats {
            job_id: self.job_id.to_string(),
            temp_files: TempFileStats {
                created: c.temp_files_created,
                cleaned: c.temp_files_cleaned,
                active: state.temp_files.len(),
                space_used_mb: state.space_used() as f64 / BYTES_PER_MB,
                peak_space_mb: c.peak_space_bytes as f64 / BYTES_PER_MB,
            },
            database: ConnectionStats {
                connections_created: c.connections_created,
                connections_reused: c.connections_reused,
                active_connections: state.connections.len(),
            },
            credentials: CredentialStats {
                cached: c.credentials_cached,
                cache_hits: c.cache_hits,
                active_cache_entries: state.credentials.len(),
            },
            memory: MemoryStats {
                large_files_processed: c.large_files_processed,
                memory_cleanups: c.memory_cleanups,
            },
        }
    }

    /// Close connections, delete temp files and the job directory, and clear
    /// caches. Safe to call repeatedly; failures are logged, never returned.
    pub fn cleanup_all(&self) {
        self.close_db_connections();

        let files: Vec<PathBuf> = self.state().temp_files.keys().cloned().collect();
        for path in &files {
            self.cleanup_file(path);
        }

        let mut state = self.state();
        if let Some(dir) = state.job_dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(dir = ?path, "removed job temp dir"),
                Err(e) => warn!(dir = ?path, error = %e, "failed to remove job temp dir"),
            }
        }

        state.credentials.clear();
        if !files.is_empty() {
            state.counters.memory_cleanups += 1;
        }
        info!(
            job_id = %self.job_id,
            files_cleaned = state.counters.temp_files_cleaned,
            "job resources released"
        );
    }
}
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    use super::*;

    struct FakeConn {
        closed: AtomicBool,
        fail: bool,
    }

    impl ManagedConnection for FakeConn {
        fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail {
                return Err(FolioError::Database("close failed".into()));
            }
            Ok(())
        }
    }

    fn fake_conn() -> Arc<dyn ManagedConnection> {
        Arc::new(FakeConn {
            closed: AtomicBool::new(false),
            fail: false,
        })
    }

    fn manager_with(root: &TempDir, config: ResourceConfig) -> ResourceManager {
        let config = ResourceConfig {
            temp_root: Some(root.path().to_path_buf()),
            ..config
        };
        ResourceManager::new(JobId::new(), &config)
    }

    fn manager(root: &TempDir) -> ResourceManager {
        manager_with(root, ResourceConfig::default())
    }

    #[test]
    fn temp_files_are_tracked_and_cleaned() {
        let root = TempDir::new().unwrap();
        let rm = manager(&root);
        assert!(rm.job_dir().is_none());

        let path = rm.temp_file("page_", ".png").expect("temp file");
        assert!(path.exists());
        let job_dir = rm.job_dir().expect("job dir");
        assert!(path.starts_with(&job_dir));
        assert!(job_dir.starts_with(root.path()));
        let dir_name = job_dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert!(dir_name.starts_with(&format!("{TEMP_DIR_PREFIX}{}", rm.job_id())));
        assert_eq!(rm.stats().temp_files.active, 1);

        assert!(rm.cleanup_file(&path));
        assert!(!path.exists());
        assert!(!rm.cleanup_file(&path));
        let stats = rm.stats();
        assert_eq!((stats.temp_files.created, stats.temp_files.cleaned), (1, 1));
        rm.cleanup_all();
    }

    #[test]
    fn missing_temp_root_is_created() {
        let root = TempDir::new().unwrap();
        let config = ResourceConfig {
            temp_root: Some(root.path().join("nested").join("scratch")),
            ..ResourceConfig::default()
        };
        let rm = ResourceManager::new(JobId::new(), &config);
        let path = rm.temp_file("page_", ".png").expect("temp file");
        assert!(path.exists());
        rm.cleanup_all();
    }

    #[test]
    fn scoped_temp_file_is_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let rm = manager(&root);
        let path = {
            let scoped = rm.scoped_temp_file("scratch_", ".bin").expect("scoped");
            assert!(scoped.path().exists());
            assert!(scoped.path().starts_with(rm.job_dir().expect("job dir")));
            scoped.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(rm.stats().temp_files.active, 0);
        rm.cleanup_all();
    }

    #[test]
    fn released_scoped_file_is_counted() {
        let root = TempDir::new().unwrap();
        let rm = manager(&root);
        let scoped = rm.scoped_temp_file("scratch_", ".bin").expect("scoped");
        let path = scoped.path().to_path_buf();
        rm.release_temp_file(scoped);

        assert!(!path.exists());
        let stats = rm.stats();
        assert_eq!((stats.temp_files.created, stats.temp_files.cleaned), (1, 1));
        rm.cleanup_all();
    }

    #[test]
    fn page_cleanup_only_touches_that_page() {
        let root = TempDir::new().unwrap();
        let rm = manager(&root);
        let p3 = rm.page_temp_file(3, ".png").expect("p3");
        let p30 = rm.page_temp_file(30, ".png").expect("p30");
        rm.cleanup_page_resources(3);
        assert!(!p3.exists());
        assert!(p30.exists());
        rm.cleanup_all();
    }

    #[test]
    fn space_and_large_files_are_accounted() {
        let root = TempDir::new().unwrap();
        let rm = manager_with(
            &root,
            ResourceConfig {
                large_file_threshold_mb: 0,
                ..ResourceConfig::default()
            },
        );
        let path = rm.page_temp_file(1, ".png").expect("temp");
        std::fs::write(&path, vec![0u8; 2048]).expect("write");
        assert_eq!(rm.record_file_size(&path).expect("size"), 2048);

        let stats = rm.stats();
        assert!(stats.temp_files.space_used_mb > 0.0);
        assert_eq!(stats.memory.large_files_processed, 1);

        rm.cleanup_page_resources(1);
        let stats = rm.stats();
        assert_eq!(stats.temp_files.space_used_mb, 0.0);
        assert!(stats.temp_files.peak_space_mb > 0.0);
        assert_eq!(stats.memory.memory_cleanups, 1);
        rm.cleanup_all();
    }

    #[test]
    fn huge_limits_saturate_instead_of_overflowing() {
        let root = TempDir::new().unwrap();
        let rm = manager_with(
            &root,
            ResourceConfig {
                large_file_threshold_mb: u64::MAX,
                max_temp_space_mb: u64::MAX,
                credential_ttl_secs: u64::MAX,
                ..ResourceConfig::default()
            },
        );
        assert!(!rm.track_large_file(u64::MAX - 1));

        rm.cache_credentials("client-a", serde_json::json!({"token": "t"}));
        assert!(rm.get_cached_credentials("client-a").is_some());
    }

    #[test]
    fn connections_are_cached_and_closed() {
        let root = TempDir::new().unwrap();
        let rm = manager(&root);
        let conn = Arc::new(FakeConn {
            closed: AtomicBool::new(false),
            fail: false,
        });
        let first = Arc::clone(&conn);
        rm.get_db_connection("pages", move || Ok(first as Arc<dyn ManagedConnection>))
            .expect("create");
        rm.get_db_connection("pages", || Err(FolioError::Database("unused".into())))
            .expect("reuse");
        rm.get_db_connection("broken", || {
            Ok(Arc::new(FakeConn {
                closed: AtomicBool::new(false),
                fail: true,
            }) as Arc<dyn ManagedConnection>)
        })
        .expect("create broken");

        let stats = rm.stats();
        assert_eq!(stats.database.connections_created, 2);
        assert_eq!(stats.database.connections_reused, 1);

        rm.close_db_connections();
        assert!(conn.closed.load(Ordering::SeqCst));
        assert_eq!(rm.stats().database.active_connections, 0);
    }

    #[test]
    fn connection_factory_may_call_back_into_the_manager() {
        let root = TempDir::new().unwrap();
        let rm = Arc::new(manager(&root));
        let (tx, rx) = mpsc::channel();

        let worker = Arc::clone(&rm);
        std::thread::spawn(move || {
            let result = worker.get_db_connection("pages", || {
                let _ = worker.stats();
                worker.track_large_file(0);
                worker.get_db_connection("inner", || Ok(fake_conn()))?;
                Ok(fake_conn())
            });
            let _ = tx.send(result.is_ok());
        });

        let created = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("factory finished without deadlocking");
        assert!(created);
        assert_eq!(rm.stats().database.connections_created, 2);
    }

    #[test]
    fn credentials_expire() {
        let root = TempDir::new().unwrap();
        let rm = manager(&root);
        rm.cache_credentials("client-a", serde_json::json!({"token": "t"}));
        assert!(rm.get_cached_credentials("client-a").is_some());
        assert!(rm.get_cached_credentials("client-b").is_none());
        assert_eq!(rm.stats().credentials.cache_hits, 1);

        let short = manager_with(
            &root,
            ResourceConfig {
                credential_ttl_secs: 0,
                ..ResourceConfig::default()
            },
        );
        short.cache_credentials("client-a", serde_json::json!({"token": "t"}));
        assert!(short.get_cached_credentials("client-a").is_none());
        assert_eq!(short.stats().credentials.active_cache_entries, 0);
    }

    #[test]
    fn cleanup_all_is_idempotent() {
        let root = TempDir::new().unwrap();
        let rm = manager(&root);
        rm.temp_file("page_1_", ".png").expect("temp");
        rm.temp_file("page_2_", ".png").expect("temp");
        rm.get_db_connection("pages", || Ok(fake_conn())).expect("conn");
        let job_dir = rm.job_dir().expect("job dir");

        rm.cleanup_all();
        let stats = rm.stats();
        assert_eq!(stats.temp_files.active, 0);
        assert_eq!(stats.database.active_connections, 0);
        assert!(!job_dir.exists());
        assert!(rm.job_dir().is_none());

        rm.cleanup_all();
        assert_eq!(rm.stats().temp_files.active, 0);
    }
}
