//! Database settings and the external override bundle.

use crate::adapter::{ModelLoader, ModelSaver};
use crate::handle::{DatabaseCallback, HandleFactory};
use crate::notify::ModelNotifier;
use crate::transaction::TransactionManagerFactory;
use serde::{Deserialize, Serialize};
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default file extension for database files.
pub const DEFAULT_EXTENSION: &str = ".db";

/// Prefix of the backup file kept beside the database file.
pub const BACKUP_PREFIX: &str = "temp-";

/// Static settings of one logical database, fixed by the schema description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Logical database name. The file is `<name><extension>`.
    pub name: String,

    /// File extension, including the leading dot.
    pub extension: String,

    /// Keep the database in memory instead of on disk.
    pub in_memory: bool,

    /// Target schema version.
    pub version: i64,

    /// Directory holding the database file.
    pub directory: PathBuf,

    /// Whether backups are produced and consulted.
    pub backup_enabled: bool,

    /// Whether the database is checked for consistency when opened.
    pub consistency_checks: bool,

    /// Whether foreign keys are enforced.
    pub foreign_keys: bool,

    /// Database file copied into place when no file exists yet.
    pub prepackaged: Option<PathBuf>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
            in_memory: false,
            version: 1,
            directory: PathBuf::from("."),
            backup_enabled: false,
            consistency_checks: false,
            foreign_keys: false,
            prepackaged: None,
        }
    }
}

impl DatabaseSettings {
    /// Creates settings for the named database with default values.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the target schema version.
    #[must_use]
    pub const fn version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Sets the directory holding the database file.
    #[must_use]
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Sets the file extension.
    #[must_use]
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Sets whether the database lives in memory.
    #[must_use]
    pub const fn in_memory(mut self, value: bool) -> Self {
        self.in_memory = value;
        self
    }

    /// Sets whether backups are enabled.
    #[must_use]
    pub const fn backup_enabled(mut self, value: bool) -> Self {
        self.backup_enabled = value;
        self
    }

    /// Sets whether consistency checks run on open.
    #[must_use]
    pub const fn consistency_checks(mut self, value: bool) -> Self {
        self.consistency_checks = value;
        self
    }

    /// Sets whether foreign keys are enforced.
    #[must_use]
    pub const fn foreign_keys(mut self, value: bool) -> Self {
        self.foreign_keys = value;
        self
    }

    /// Sets a prepackaged database file to seed a missing database.
    #[must_use]
    pub fn prepackaged(mut self, path: impl Into<PathBuf>) -> Self {
        self.prepackaged = Some(path.into());
        self
    }

    /// Returns `<name><extension>`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, self.extension)
    }

    /// Returns the full path of the database file.
    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        self.directory.join(self.file_name())
    }

    /// Returns the full path of the backup file.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        self.directory
            .join(format!("{BACKUP_PREFIX}{}", self.file_name()))
    }

    /// Returns true if backups may be taken.
    ///
    /// Consistency checks imply a backup to restore from.
    #[must_use]
    pub const fn can_backup(&self) -> bool {
        self.backup_enabled || self.consistency_checks
    }

    /// Returns a copy with every override from `config` applied.
    #[must_use]
    pub fn with_overrides(&self, config: Option<&DatabaseConfig>) -> Self {
        let mut effective = self.clone();
        if let Some(config) = config {
            if let Some(name) = &config.database_name {
                effective.name = name.clone();
            }
            if let Some(extension) = &config.extension {
                effective.extension = extension.clone();
            }
            if let Some(in_memory) = config.in_memory {
                effective.in_memory = in_memory;
            }
        }
        effective
    }

    /// Returns true if `path` names this database's file.
    #[must_use]
    pub fn is_file(&self, path: &Path) -> bool {
        path == self.file_path()
    }
}

/// Per-entity hook overrides.
#[derive(Clone, Default)]
pub struct TableConfig {
    pub(crate) loader: Option<Arc<dyn ModelLoader>>,
    pub(crate) saver: Option<Arc<dyn ModelSaver>>,
}

impl TableConfig {
    /// Creates an empty table configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the loader.
    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Overrides the saver.
    #[must_use]
    pub fn saver(mut self, saver: Arc<dyn ModelSaver>) -> Self {
        self.saver = Some(saver);
        self
    }
}

impl std::fmt::Debug for TableConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableConfig")
            .field("loader", &self.loader.is_some())
            .field("saver", &self.saver.is_some())
            .finish()
    }
}

/// Externally supplied overrides for one logical database.
///
/// The coordinator never owns the configuration's policy. It applies the
/// bundle when the database is constructed and again, verbatim, on every
/// reset and reopen.
///
/// # Example
///
/// ```rust,ignore
/// let config = DatabaseConfig::new()
///     .database_name("cache")
///     .in_memory(true)
///     .table::<User>(TableConfig::new().saver(Arc::new(AuditingSaver)));
/// ```
#[derive(Clone, Default)]
pub struct DatabaseConfig {
    pub(crate) tables: HashMap<TypeId, (&'static str, TableConfig)>,
    pub(crate) notifier: Option<Arc<dyn ModelNotifier>>,
    pub(crate) handle_factory: Option<Arc<dyn HandleFactory>>,
    pub(crate) transaction_manager_factory: Option<Arc<dyn TransactionManagerFactory>>,
    pub(crate) database_name: Option<String>,
    pub(crate) extension: Option<String>,
    pub(crate) in_memory: Option<bool>,
    pub(crate) callback: Option<Arc<dyn DatabaseCallback>>,
}

impl DatabaseConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds hook overrides for entity type `T`.
    #[must_use]
    pub fn table<T: 'static>(mut self, config: TableConfig) -> Self {
        self.tables
            .insert(TypeId::of::<T>(), (type_name::<T>(), config));
        self
    }

    /// Overrides the change notifier.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn ModelNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Overrides the handle factory.
    #[must_use]
    pub fn handle_factory(mut self, factory: Arc<dyn HandleFactory>) -> Self {
        self.handle_factory = Some(factory);
        self
    }

    /// Overrides the transaction manager factory.
    #[must_use]
    pub fn transaction_manager_factory(
        mut self,
        factory: Arc<dyn TransactionManagerFactory>,
    ) -> Self {
        self.transaction_manager_factory = Some(factory);
        self
    }

    /// Overrides the database name.
    #[must_use]
    pub fn database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = Some(name.into());
        self
    }

    /// Overrides the file extension.
    #[must_use]
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Overrides whether the database lives in memory.
    #[must_use]
    pub fn in_memory(mut self, value: bool) -> Self {
        self.in_memory = Some(value);
        self
    }

    /// Installs a lifecycle callback (open, create, upgrade, backup, restore).
    #[must_use]
    pub fn callback(mut self, callback: Arc<dyn DatabaseCallback>) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables: Vec<_> = self.tables.values().map(|(name, _)| *name).collect();
        f.debug_struct("DatabaseConfig")
            .field("tables", &tables)
            .field("notifier", &self.notifier.is_some())
            .field("handle_factory", &self.handle_factory.is_some())
            .field(
                "transaction_manager_factory",
                &self.transaction_manager_factory.is_some(),
            )
            .field("database_name", &self.database_name)
            .field("extension", &self.extension)
            .field("in_memory", &self.in_memory)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;

    #[test]
    fn default_settings() {
        let settings = DatabaseSettings::default();
        assert_eq!(settings.extension, ".db");
        assert!(!settings.in_memory);
        assert!(!settings.can_backup());
    }

    #[test]
    fn file_naming() {
        let settings = DatabaseSettings::new("notes").directory("/data");
        assert_eq!(settings.file_name(), "notes.db");
        assert_eq!(settings.file_path(), PathBuf::from("/data/notes.db"));
        assert_eq!(settings.backup_path(), PathBuf::from("/data/temp-notes.db"));
        assert!(settings.is_file(Path::new("/data/notes.db")));
    }

    #[test]
    fn builder_pattern() {
        let settings = DatabaseSettings::new("app")
            .version(3)
            .extension(".sqlite")
            .consistency_checks(true)
            .foreign_keys(true);

        assert_eq!(settings.version, 3);
        assert_eq!(settings.file_name(), "app.sqlite");
        assert!(settings.can_backup());
        assert!(settings.foreign_keys);
    }

    #[test]
    fn overrides_apply_on_copy() {
        let settings = DatabaseSettings::new("app");
        let config = DatabaseConfig::new()
            .database_name("cache")
            .extension(".bin")
            .in_memory(true);

        let effective = settings.with_overrides(Some(&config));
        assert_eq!(effective.file_name(), "cache.bin");
        assert!(effective.in_memory);
        assert_eq!(settings.file_name(), "app.db");
        assert_eq!(settings.with_overrides(None), settings);
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: DatabaseSettings =
            serde_json::from_str(r#"{"name":"inventory","version":4}"#).unwrap();
        assert_eq!(settings.name, "inventory");
        assert_eq!(settings.version, 4);
        assert_eq!(settings.extension, ".db");
    }

    #[test]
    fn table_config_is_keyed_by_type() {
        let config = DatabaseConfig::new().table::<Marker>(TableConfig::new());
        assert!(config.tables.contains_key(&TypeId::of::<Marker>()));
        assert!(format!("{config:?}").contains("Marker"));
    }
}
