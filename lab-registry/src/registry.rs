//! The dataset registry: name → dataset across the three tiers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use chrono::Utc;
use lab_primitives::{DatasetName, Table};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::columnar::{ColumnarTable, ColumnarWriter};
use crate::dataset::{Backend, Dataset};
use crate::error::{RegistryError, RegistryResult};
use crate::loader::{DataFormat, FormatLoader, TableLoader, io_failure};
use crate::memory::MemoryTable;
use crate::relational::RelationalStore;
use crate::source::DatasetHandle;

/// Default upper bound (exclusive) for the in-memory tier.
pub const DEFAULT_IN_MEMORY_LIMIT: u64 = 100 * 1024 * 1024;
/// Default upper bound (exclusive) for the columnar tier.
pub const DEFAULT_COLUMNAR_LIMIT: u64 = 1024 * 1024 * 1024;

const RELATIONAL_FILE: &str = "relational.db";
const COLUMNAR_DIR: &str = "columnar";

/// Configuration for [`DataRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    data_dir: PathBuf,
    in_memory_limit: u64,
    columnar_limit: u64,
}

impl RegistryConfig {
    /// Creates a configuration rooted at `data_dir` with default thresholds.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            in_memory_limit: DEFAULT_IN_MEMORY_LIMIT,
            columnar_limit: DEFAULT_COLUMNAR_LIMIT,
        }
    }

    /// Overrides the tier thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, in_memory_limit: u64, columnar_limit: u64) -> Self {
        self.in_memory_limit = in_memory_limit;
        self.columnar_limit = columnar_limit;
        self
    }

    /// Directory under which session directories are created.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Upper bound (exclusive) for the in-memory tier.
    #[must_use]
    pub const fn in_memory_limit(&self) -> u64 {
        self.in_memory_limit
    }

    /// Upper bound (exclusive) for the columnar tier.
    #[must_use]
    pub const fn columnar_limit(&self) -> u64 {
        self.columnar_limit
    }

    /// Selects the tier for a dataset of `size` bytes.
    #[must_use]
    pub const fn backend_for(&self, size: u64) -> Backend {
        if size < self.in_memory_limit {
            Backend::Memory
        } else if size < self.columnar_limit {
            Backend::Columnar
        } else {
            Backend::Relational
        }
    }

    /// Validates threshold ordering.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Validation`] if the in-memory limit is not
    /// below the columnar limit.
    pub fn validate(&self) -> RegistryResult<()> {
        if self.in_memory_limit >= self.columnar_limit {
            return Err(RegistryError::validation(format!(
                "in-memory limit ({}) must be below columnar limit ({})",
                self.in_memory_limit, self.columnar_limit
            )));
        }
        Ok(())
    }
}

/// Data handed to [`DataRegistry::store`].
#[derive(Debug)]
pub enum DataSource {
    /// An already materialized table.
    Table(Table),
    /// A file read through the registry's loader.
    File(PathBuf),
}

/// Options accepted by [`DataRegistry::store`].
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Size used for tier selection instead of the measured size.
    pub size_hint: Option<u64>,
    /// Forces a tier regardless of size.
    pub backend: Option<Backend>,
    /// Replaces an existing dataset of the same name.
    pub overwrite: bool,
    /// Source format; inferred from the extension when absent.
    pub format: Option<DataFormat>,
}

#[derive(Debug, Clone)]
struct Entry {
    meta: Dataset,
    handle: DatasetHandle,
}

/// Registry of named datasets.
///
/// Mutations of one name (`store`, `promote`, `remove`) are serialized by a
/// per-name lock; different names proceed in parallel. Reads take a short
/// shared lock on the catalog. Lock order is always name lock, then the
/// relational writer lock.
pub struct DataRegistry {
    config: RegistryConfig,
    session_dir: PathBuf,
    relational: Arc<RelationalStore>,
    loader: Arc<dyn TableLoader>,
    catalog: RwLock<HashMap<DatasetName, Entry>>,
    name_locks: std::sync::Mutex<HashMap<DatasetName, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for DataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRegistry")
            .field("config", &self.config)
            .field("session_dir", &self.session_dir)
            .finish_non_exhaustive()
    }
}

impl DataRegistry {
    /// Creates a registry with a fresh session directory under the configured
    /// data directory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Validation`] for inconsistent thresholds and
    /// [`RegistryError::Storage`] if the session directory or database cannot
    /// be created.
    pub fn open(config: RegistryConfig) -> RegistryResult<Self> {
        config.validate()?;
        let session_dir = config
            .data_dir
            .join(format!("session-{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(session_dir.join(COLUMNAR_DIR))
            .map_err(|err| RegistryError::storage("*", Backend::Columnar, err))?;
        let relational = RelationalStore::open(session_dir.join(RELATIONAL_FILE))?;
        info!(session = %session_dir.display(), "opened data registry");

        Ok(Self {
            config,
            session_dir,
            relational: Arc::new(relational),
            loader: Arc::new(FormatLoader),
            catalog: RwLock::new(HashMap::new()),
            name_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Replaces the loader used for [`DataSource::File`].
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn TableLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Returns the registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Session directory holding columnar files and the relational database.
    #[must_use]
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Path of the session's relational database.
    #[must_use]
    pub fn relational_path(&self) -> &Path {
        self.relational.path()
    }

    /// Stores a dataset under `name`, choosing its tier by size.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Validation`] if the name exists and
    /// `overwrite` is not set or the source does not parse, and
    /// [`RegistryError::Storage`] if the source cannot be read or the
    /// backend write fails. On error the registry is unchanged.
    pub async fn store(
        &self,
        name: &DatasetName,
        source: DataSource,
        options: StoreOptions,
    ) -> RegistryResult<Dataset> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let previous = self.catalog.read().await.get(name).cloned();
        if previous.is_some() && !options.overwrite {
            return Err(RegistryError::validation(format!(
                "dataset `{name}` already exists; pass overwrite to replace it"
            )));
        }

        let (table, source_path, file_len) = match source {
            DataSource::Table(table) => (table, None, None),
            DataSource::File(path) => {
                let file_len = match tokio::fs::metadata(&path).await {
                    Ok(meta) => meta.len(),
                    Err(err) => {
                        return Err(self.rebind(name, &options, None, io_failure(&path, &err)));
                    }
                };
                let loader = Arc::clone(&self.loader);
                let format = options.format;
                let load_path = path.clone();
                let table = blocking(move || loader.load(&load_path, format))
                    .await
                    .map_err(|err| self.rebind(name, &options, Some(file_len), err))?;
                (table, Some(path), Some(file_len))
            }
        };

        let byte_size = options
            .size_hint
            .or(file_len)
            .unwrap_or_else(|| table.estimated_bytes());
        let backend = options
            .backend
            .unwrap_or_else(|| self.config.backend_for(byte_size));
        let schema = table.schema().clone();
        let row_count = table.row_count() as u64;

        let handle = self
            .materialize(name, backend, table, options.overwrite)
            .await?;

        let meta = Dataset {
            name: name.clone(),
            backend,
            schema,
            row_count,
            byte_size,
            source_path,
            created_at: Utc::now(),
        };
        let entry = Entry {
            meta: meta.clone(),
            handle,
        };
        self.catalog.write().await.insert(name.clone(), entry);

        if let Some(previous) = previous {
            self.release(&previous, backend).await;
        }

        info!(
            dataset = %name,
            %backend,
            rows = row_count,
            bytes = byte_size,
            "stored dataset"
        );
        Ok(meta)
    }

    /// Returns a handle on `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the dataset is absent.
    pub async fn get(&self, name: &str) -> RegistryResult<DatasetHandle> {
        self.catalog
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| not_found(name))
    }

    /// Returns metadata for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the dataset is absent.
    pub async fn info(&self, name: &str) -> RegistryResult<Dataset> {
        self.catalog
            .read()
            .await
            .get(name)
            .map(|entry| entry.meta.clone())
            .ok_or_else(|| not_found(name))
    }

    /// Lists every dataset, sorted by name.
    #[must_use]
    pub async fn list(&self) -> Vec<Dataset> {
        let mut datasets: Vec<Dataset> = self
            .catalog
            .read()
            .await
            .values()
            .map(|entry| entry.meta.clone())
            .collect();
        datasets.sort_by(|a, b| a.name.cmp(&b.name));
        datasets
    }

    /// Ensures `name` is held by the relational tier.
    ///
    /// Returns `true` if a table was created and `false` if one already
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the dataset is absent and
    /// [`RegistryError::Storage`] if the copy fails; on failure the dataset
    /// keeps its previous tier.
    pub async fn promote(&self, name: &str) -> RegistryResult<bool> {
        let key = DatasetName::new(name).map_err(|_| not_found(name))?;
        let lock = self.name_lock(&key);
        let _guard = lock.lock().await;

        let entry = self
            .catalog
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))?;

        let store = Arc::clone(&self.relational);
        let table_name = name.to_owned();
        let exists = blocking(move || store.table_exists(&table_name)).await?;
        if exists && entry.meta.backend == Backend::Relational {
            debug!(dataset = name, "dataset already relational");
            return Ok(false);
        }

        let store = Arc::clone(&self.relational);
        let source = Arc::clone(&entry.handle);
        let table_name = name.to_owned();
        let handle = blocking(move || {
            if !exists {
                let table = source.collect()?;
                store.create_table(&table_name, &table, false)?;
            }
            Ok(Arc::new(store.open_table(&table_name)?) as DatasetHandle)
        })
        .await?;

        let mut meta = entry.meta.clone();
        meta.backend = Backend::Relational;
        self.catalog
            .write()
            .await
            .insert(key, Entry { meta, handle });
        self.release(&entry, Backend::Relational).await;

        info!(dataset = name, from = %entry.meta.backend, created = !exists, "promoted dataset");
        Ok(!exists)
    }

    /// Removes `name` and releases its representation.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the dataset is absent.
    pub async fn remove(&self, name: &str) -> RegistryResult<Dataset> {
        let key = DatasetName::new(name).map_err(|_| not_found(name))?;
        let lock = self.name_lock(&key);
        let guard = lock.lock().await;
        let removed = self.remove_locked(name).await;
        drop(guard);
        self.evict_name_lock(&key, lock);
        removed
    }

    async fn remove_locked(&self, name: &str) -> RegistryResult<Dataset> {
        let entry = self
            .catalog
            .write()
            .await
            .remove(name)
            .ok_or_else(|| not_found(name))?;
        if entry.meta.backend == Backend::Relational {
            let store = Arc::clone(&self.relational);
            let table_name = name.to_owned();
            blocking(move || store.drop_table(&table_name)).await?;
        } else {
            entry.handle.retire();
        }
        info!(dataset = name, backend = %entry.meta.backend, "removed dataset");
        Ok(entry.meta)
    }

    /// Rebinds a source read failure to `name` and the tier the dataset
    /// would have landed in.
    fn rebind(
        &self,
        name: &DatasetName,
        options: &StoreOptions,
        file_len: Option<u64>,
        err: RegistryError,
    ) -> RegistryError {
        match err {
            RegistryError::Storage { reason, .. } => {
                let backend = options.backend.unwrap_or_else(|| {
                    self.config
                        .backend_for(options.size_hint.or(file_len).unwrap_or(0))
                });
                RegistryError::storage(name.as_str(), backend, reason)
            }
            other => other,
        }
    }

    async fn materialize(
        &self,
        name: &DatasetName,
        backend: Backend,
        table: Table,
        replace: bool,
    ) -> RegistryResult<DatasetHandle> {
        let dataset = name.to_string();
        match backend {
            Backend::Memory => Ok(Arc::new(MemoryTable::new(dataset, table))),
            Backend::Columnar => {
                let path = self.session_dir.join(COLUMNAR_DIR).join(format!(
                    "{dataset}-{}.dlcol",
                    Uuid::new_v4().simple()
                ));
                blocking(move || {
                    ColumnarWriter::new(&dataset).write(&path, &table)?;
                    match ColumnarTable::open(&dataset, &path) {
                        Ok(handle) => Ok(Arc::new(handle) as DatasetHandle),
                        Err(err) => {
                            let _ = std::fs::remove_file(&path);
                            Err(err)
                        }
                    }
                })
                .await
            }
            Backend::Relational => {
                let store = Arc::clone(&self.relational);
                blocking(move || {
                    store.create_table(&dataset, &table, replace)?;
                    Ok(Arc::new(store.open_table(&dataset)?) as DatasetHandle)
                })
                .await
            }
        }
    }

    /// Releases the representation `previous` held, unless the new entry
    /// reuses it (a relational table replaced in place).
    async fn release(&self, previous: &Entry, replacement: Backend) {
        match previous.meta.backend {
            Backend::Relational if replacement != Backend::Relational => {
                let store = Arc::clone(&self.relational);
                let table_name = previous.meta.name.to_string();
                if let Err(err) = blocking(move || store.drop_table(&table_name)).await {
                    warn!(dataset = %previous.meta.name, %err, "failed to drop replaced relational table");
                }
            }
            Backend::Relational => {}
            Backend::Memory | Backend::Columnar => previous.handle.retire(),
        }
    }

    fn name_lock(&self, name: &DatasetName) -> Arc<Mutex<()>> {
        let mut locks = self.name_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.clone()).or_default())
    }

    /// Drops the table's entry once nobody but the caller holds `lock`.
    /// New holders clone under the table mutex, so the count is stable here.
    fn evict_name_lock(&self, name: &DatasetName, lock: Arc<Mutex<()>>) {
        let mut locks = self.name_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(name);
        }
    }

    #[cfg(test)]
    fn name_lock_count(&self) -> usize {
        self.name_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for DataRegistry {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.session_dir) {
            warn!(session = %self.session_dir.display(), %err, "failed to remove session directory");
        }
    }
}

fn not_found(name: &str) -> RegistryError {
    RegistryError::NotFound {
        name: name.to_owned(),
    }
}

async fn blocking<T, F>(task: F) -> RegistryResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> RegistryResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| RegistryError::Internal(format!("blocking task failed: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_primitives::{ColumnType, Field, Schema, Value};

    const MB: u64 = 1024 * 1024;

    fn sample(rows: i64) -> Table {
        let schema = Schema::new(vec![
            Field::new("id", ColumnType::Int),
            Field::new("label", ColumnType::Text),
        ])
        .unwrap();
        Table::new(
            schema,
            (0..rows)
                .map(|id| vec![Value::Int(id), Value::Text(format!("row-{id}"))])
                .collect(),
        )
        .unwrap()
    }

    fn registry(dir: &Path) -> DataRegistry {
        DataRegistry::open(RegistryConfig::new(dir)).unwrap()
    }

    fn name(text: &str) -> DatasetName {
        DatasetName::new(text).unwrap()
    }

    fn hinted(size: u64) -> StoreOptions {
        StoreOptions {
            size_hint: Some(size),
            ..StoreOptions::default()
        }
    }

    fn relational_tables(registry: &DataRegistry) -> i64 {
        let conn = crate::relational::open_read_only(registry.relational_path()).unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn selects_tier_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        for (label, size, backend) in [
            ("sales", 50 * MB, Backend::Memory),
            ("events", 500 * MB, Backend::Columnar),
            ("logs", 2048 * MB, Backend::Relational),
            ("edge_low", DEFAULT_IN_MEMORY_LIMIT, Backend::Columnar),
            ("edge_high", DEFAULT_COLUMNAR_LIMIT, Backend::Relational),
        ] {
            let meta = registry
                .store(&name(label), DataSource::Table(sample(4)), hinted(size))
                .await
                .unwrap();
            assert_eq!(meta.backend, backend, "{label}");

            let handle = registry.get(label).await.unwrap();
            assert_eq!(handle.backend(), backend);
            assert_eq!(handle.schema(), sample(4).schema());
            assert_eq!(handle.row_count(), 4);
            assert_eq!(handle.collect().unwrap(), sample(4));
        }
    }

    #[tokio::test]
    async fn store_requires_overwrite_for_existing_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let sales = name("sales");

        registry
            .store(&sales, DataSource::Table(sample(2)), StoreOptions::default())
            .await
            .unwrap();
        let err = registry
            .store(&sales, DataSource::Table(sample(3)), StoreOptions::default())
            .await
            .expect_err("duplicate");
        assert!(matches!(err, RegistryError::Validation { .. }));
        assert_eq!(registry.info("sales").await.unwrap().row_count, 2);

        let options = StoreOptions {
            overwrite: true,
            ..StoreOptions::default()
        };
        registry
            .store(&sales, DataSource::Table(sample(3)), options)
            .await
            .unwrap();
        assert_eq!(registry.info("sales").await.unwrap().row_count, 3);
    }

    #[tokio::test]
    async fn overwritten_columnar_handle_outlives_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let events = name("events");

        registry
            .store(&events, DataSource::Table(sample(5)), hinted(500 * MB))
            .await
            .unwrap();
        let old = registry.get("events").await.unwrap();
        let old_path = match old.reference() {
            Some(crate::DatasetRef::Columnar { path }) => path,
            other => panic!("unexpected reference {other:?}"),
        };

        let options = StoreOptions {
            overwrite: true,
            ..StoreOptions::default()
        };
        registry
            .store(&events, DataSource::Table(sample(1)), options)
            .await
            .unwrap();

        assert_eq!(old.collect().unwrap().row_count(), 5);
        assert_eq!(registry.get("events").await.unwrap().row_count(), 1);
        drop(old);
        assert!(!old_path.exists());
    }

    #[tokio::test]
    async fn promote_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry
            .store(&name("sales"), DataSource::Table(sample(3)), StoreOptions::default())
            .await
            .unwrap();

        assert!(registry.promote("sales").await.unwrap());
        assert!(!registry.promote("sales").await.unwrap());
        assert_eq!(relational_tables(&registry), 1);

        let meta = registry.info("sales").await.unwrap();
        assert_eq!(meta.backend, Backend::Relational);
        assert_eq!(registry.get("sales").await.unwrap().collect().unwrap(), sample(3));
    }

    #[tokio::test]
    async fn relational_store_is_not_promoted_again() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry
            .store(&name("logs"), DataSource::Table(sample(2)), hinted(2048 * MB))
            .await
            .unwrap();
        assert!(!registry.promote("logs").await.unwrap());
        assert_eq!(relational_tables(&registry), 1);
    }

    #[tokio::test]
    async fn missing_names_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        assert!(matches!(registry.get("nope").await, Err(RegistryError::NotFound { .. })));
        assert!(matches!(registry.promote("nope").await, Err(RegistryError::NotFound { .. })));
        assert!(matches!(registry.remove("nope").await, Err(RegistryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn failed_load_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let err = registry
            .store(
                &name("ghost"),
                DataSource::File(dir.path().join("missing.csv")),
                StoreOptions::default(),
            )
            .await
            .expect_err("missing file");
        assert!(matches!(err, RegistryError::Storage { .. }), "{err}");
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn unreadable_source_names_dataset_and_intended_backend() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let missing = dir.path().join("missing.csv");

        let err = registry
            .store(
                &name("ghost"),
                DataSource::File(missing.clone()),
                hinted(500 * MB),
            )
            .await
            .unwrap_err();
        match err {
            RegistryError::Storage {
                dataset, backend, ..
            } => {
                assert_eq!(dataset, "ghost");
                assert_eq!(backend, Backend::Columnar);
            }
            other => panic!("unexpected error: {other}"),
        }

        let forced = StoreOptions {
            backend: Some(Backend::Relational),
            ..StoreOptions::default()
        };
        let err = registry
            .store(&name("ghost"), DataSource::File(missing), forced)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Storage {
                backend: Backend::Relational,
                ..
            }
        ));
        assert_eq!(err.kind(), lab_primitives::ErrorKind::StorageError);

        let garbled = dir.path().join("garbled.csv");
        std::fs::write(&garbled, "a,b\n1\n").unwrap();
        let err = registry
            .store(&name("garbled"), DataSource::File(garbled), StoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation { .. }), "{err}");
    }

    #[tokio::test]
    async fn remove_releases_its_name_lock() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        for idx in 0..20 {
            let label = format!("scratch_{idx}");
            registry
                .store(&name(&label), DataSource::Table(sample(1)), StoreOptions::default())
                .await
                .unwrap();
            registry.remove(&label).await.unwrap();
        }
        assert!(registry.remove("never_stored").await.is_err());
        assert_eq!(registry.name_lock_count(), 0);

        registry
            .store(&name("kept"), DataSource::Table(sample(1)), StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(registry.name_lock_count(), 1);
    }

    #[tokio::test]
    async fn remove_drops_relational_table() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry
            .store(&name("logs"), DataSource::Table(sample(2)), hinted(2048 * MB))
            .await
            .unwrap();
        registry.remove("logs").await.unwrap();
        assert_eq!(relational_tables(&registry), 0);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn list_is_sorted_and_stores_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(registry(dir.path()));

        let mut tasks = Vec::new();
        for label in ["zeta", "alpha", "mid"] {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry
                    .store(&name(label), DataSource::Table(sample(2)), hinted(500 * MB))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let names: Vec<String> = registry
            .list()
            .await
            .into_iter()
            .map(|meta| meta.name.to_string())
            .collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn config_rejects_inverted_thresholds() {
        let config = RegistryConfig::new("/tmp").with_thresholds(10, 10);
        assert!(config.validate().is_err());
    }
}
