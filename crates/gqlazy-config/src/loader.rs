//! Layered config files.
//!
//! `~/.gqlazy/config.toml` is read first, then `<project>/.gqlazy/config.toml`,
//! then command-line overrides. A field left at its default in a later layer
//! keeps the value from the earlier one.

use std::path::{Path, PathBuf};

use tracing::{debug, info, trace};

use crate::error::ConfigError;
use crate::{
    CacheConfig, ClientConfig, ConfigOverrides, LoggingConfig, SchedulerConfig, SelectionConfig,
    TransportConfig,
};

const CONFIG_DIR: &str = ".gqlazy";
const CONFIG_FILE: &str = "config.toml";

/// Finds, reads and merges config files.
///
/// The global layer is read once per loader.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    global_dir: Option<PathBuf>,
    global: Option<ClientConfig>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader rooted at `~/.gqlazy`, or with no global layer when there is
    /// no home directory.
    pub fn new() -> Self {
        Self {
            global_dir: dirs::home_dir().map(|home| home.join(CONFIG_DIR)),
            global: None,
        }
    }

    pub fn with_global_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            global_dir: Some(dir.into()),
            global: None,
        }
    }

    pub fn global_config_path(&self) -> Option<PathBuf> {
        self.global_dir.as_ref().map(|dir| dir.join(CONFIG_FILE))
    }

    pub fn local_config_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Merge every layer that exists for `project_root` and validate the result.
    pub fn load(
        &mut self,
        project_root: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<ClientConfig, ConfigError> {
        let mut config = ClientConfig::default();
        if let Some(global) = self.load_global()? {
            config = merge(config, global);
        }
        if let Some(local) = self.load_local(project_root)? {
            config = merge(config, local);
        }
        if let Some(overrides) = overrides {
            config.apply_overrides(overrides);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load_global(&mut self) -> Result<Option<ClientConfig>, ConfigError> {
        if self.global.is_none() {
            let Some(path) = self.global_config_path() else {
                debug!("No home directory, global config skipped");
                return Ok(None);
            };
            self.global = read_if_present(&path)?;
        }
        Ok(self.global.clone())
    }

    pub fn load_local(&self, project_root: &Path) -> Result<Option<ClientConfig>, ConfigError> {
        read_if_present(&self.local_config_path(project_root))
    }

    /// Read one file as-is, without layering or validation.
    pub fn load_file(&self, path: &Path) -> Result<ClientConfig, ConfigError> {
        read_file(path)
    }

    /// Write a default `.gqlazy/config.toml` under `project_root`.
    ///
    /// An existing file is left untouched. Returns the file path and whether
    /// it was created.
    pub fn init_local(&self, project_root: &Path) -> Result<(PathBuf, bool), ConfigError> {
        let path = self.local_config_path(project_root);
        if path.exists() {
            return Ok((path, false));
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::write(dir, e))?;
        }
        std::fs::write(&path, ClientConfig::default().to_toml()?)
            .map_err(|e| ConfigError::write(&path, e))?;
        info!("Created {}", path.display());
        Ok((path, true))
    }
}

fn read_if_present(path: &Path) -> Result<Option<ClientConfig>, ConfigError> {
    if !path.exists() {
        trace!("No config at {}", path.display());
        return Ok(None);
    }
    debug!("Reading config from {}", path.display());
    read_file(path).map(Some)
}

fn read_file(path: &Path) -> Result<ClientConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::read(path, e))?;
    toml::from_str(&text).map_err(|e| ConfigError::parse(path, e))
}

/// `overlay` unless it still holds the default.
fn pick<T: PartialEq>(base: T, overlay: T, default: &T) -> T {
    if &overlay == default {
        base
    } else {
        overlay
    }
}

fn merge(base: ClientConfig, overlay: ClientConfig) -> ClientConfig {
    ClientConfig {
        cache: merge_cache(base.cache, overlay.cache),
        scheduler: SchedulerConfig {
            window_ms: pick(base.scheduler.window_ms, overlay.scheduler.window_ms, &0),
        },
        selection: merge_selection(base.selection, overlay.selection),
        transport: merge_transport(base.transport, overlay.transport),
        logging: merge_logging(base.logging, overlay.logging),
    }
}

fn merge_cache(base: CacheConfig, overlay: CacheConfig) -> CacheConfig {
    let d = CacheConfig::default();
    CacheConfig {
        max_age_ms: pick(base.max_age_ms, overlay.max_age_ms, &d.max_age_ms),
        // Either layer may switch these away from their defaults.
        immutable: base.immutable || overlay.immutable,
        normalization: base.normalization && overlay.normalization,
        stale_while_revalidate_ms: pick(
            base.stale_while_revalidate_ms,
            overlay.stale_while_revalidate_ms,
            &d.stale_while_revalidate_ms,
        ),
        max_entries: pick(base.max_entries, overlay.max_entries, &d.max_entries),
        identity_fields: pick(base.identity_fields, overlay.identity_fields, &d.identity_fields),
        array_merge: pick(base.array_merge, overlay.array_merge, &d.array_merge),
    }
}

fn merge_selection(base: SelectionConfig, overlay: SelectionConfig) -> SelectionConfig {
    let d = SelectionConfig::default();
    SelectionConfig {
        alias_length: pick(base.alias_length, overlay.alias_length, &d.alias_length),
        document_cache_size: pick(
            base.document_cache_size,
            overlay.document_cache_size,
            &d.document_cache_size,
        ),
    }
}

fn merge_transport(base: TransportConfig, overlay: TransportConfig) -> TransportConfig {
    let d = TransportConfig::default();
    let mut headers = base.headers;
    headers.extend(overlay.headers);
    TransportConfig {
        endpoint: pick(base.endpoint, overlay.endpoint, &d.endpoint),
        headers,
        auth_token_env: overlay.auth_token_env.or(base.auth_token_env),
        timeout_secs: pick(base.timeout_secs, overlay.timeout_secs, &d.timeout_secs),
        max_retries: pick(base.max_retries, overlay.max_retries, &d.max_retries),
    }
}

fn merge_logging(base: LoggingConfig, overlay: LoggingConfig) -> LoggingConfig {
    let d = LoggingConfig::default();
    LoggingConfig {
        level: pick(base.level, overlay.level, &d.level),
        format: pick(base.format, overlay.format, &d.format),
        file: overlay.file.or(base.file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArrayMergeMode, LogFormat};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join(CONFIG_DIR).join(CONFIG_FILE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn loader(temp: &TempDir) -> ConfigLoader {
        ConfigLoader::with_global_dir(temp.path().join("home").join(CONFIG_DIR))
    }

    #[test]
    fn test_defaults_without_files() {
        let temp = TempDir::new().unwrap();
        let config = loader(&temp).load(temp.path(), None).unwrap();

        assert_eq!(config.cache.max_entries, 4096);
        assert_eq!(config.transport.endpoint, "http://localhost:4000/graphql");
    }

    #[test]
    fn test_local_file_is_read() {
        let temp = TempDir::new().unwrap();
        write_config(
            temp.path(),
            r#"
            [cache]
            max_age_ms = 30000
            array_merge = "replace"

            [transport]
            endpoint = "https://api.example.com/graphql"
            "#,
        );

        let config = loader(&temp).load(temp.path(), None).unwrap();

        assert_eq!(config.cache.max_age_ms, 30_000);
        assert_eq!(config.cache.array_merge, ArrayMergeMode::Replace);
        assert_eq!(config.transport.endpoint, "https://api.example.com/graphql");
    }

    #[test]
    fn test_local_layer_wins_over_global() {
        let temp = TempDir::new().unwrap();
        write_config(
            &temp.path().join("home"),
            r#"
            [logging]
            level = "debug"
            format = "json"

            [transport]
            endpoint = "https://global.example.com/graphql"
            headers = { "x-client" = "global" }
            "#,
        );
        write_config(
            temp.path(),
            r#"
            [transport]
            endpoint = "https://local.example.com/graphql"
            headers = { "x-team" = "local" }
            "#,
        );

        let config = loader(&temp).load(temp.path(), None).unwrap();

        assert_eq!(config.transport.endpoint, "https://local.example.com/graphql");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.transport.headers.len(), 2);
        assert_eq!(config.transport.headers["x-client"], "global");
    }

    #[test]
    fn test_overrides_apply_last() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "[scheduler]\nwindow_ms = 10\n");

        let overrides = ConfigOverrides {
            window_ms: Some(25),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };
        let config = loader(&temp).load(temp.path(), Some(&overrides)).unwrap();

        assert_eq!(config.scheduler.window_ms, 25);
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_global_layer_is_read_once() {
        let temp = TempDir::new().unwrap();
        let path = write_config(&temp.path().join("home"), "[scheduler]\nwindow_ms = 5\n");

        let mut loader = loader(&temp);
        assert_eq!(loader.load_global().unwrap().unwrap().scheduler.window_ms, 5);

        std::fs::write(&path, "[scheduler]\nwindow_ms = 50\n").unwrap();
        assert_eq!(loader.load_global().unwrap().unwrap().scheduler.window_ms, 5);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp = TempDir::new().unwrap();
        write_config(temp.path(), "[selection]\nalias_length = 1\n");

        let err = loader(&temp).load(temp.path(), None).unwrap_err();
        assert!(err.to_string().contains("alias_length"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let temp = TempDir::new().unwrap();
        let path = write_config(temp.path(), "[cache\nmax_age_ms = ");

        let err = loader(&temp).load(temp.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&path.display().to_string()));
    }

    #[test]
    fn test_init_local_writes_defaults_once() {
        let temp = TempDir::new().unwrap();
        let loader = loader(&temp);

        let (path, created) = loader.init_local(temp.path()).unwrap();
        assert!(created);
        assert!(path.ends_with(".gqlazy/config.toml"));
        let written = loader.load_file(&path).unwrap();
        assert_eq!(written.selection.alias_length, 6);

        std::fs::write(&path, "[scheduler]\nwindow_ms = 7\n").unwrap();
        let (_, created) = loader.init_local(temp.path()).unwrap();
        assert!(!created);
        assert_eq!(loader.load_file(&path).unwrap().scheduler.window_ms, 7);
    }
}
