// Configuration Storage Service
// Handles config file read/write, version backup and data directory layout

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "qaVerifier";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub version: String,
    /// Overrides the user data directory (checkpoints, corrections, logs)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerType {
    /// Model when a checkpoint loads, rules otherwise
    #[default]
    Auto,
    Rules,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    #[serde(default)]
    pub analyzer_type: AnalyzerType,
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            analyzer_type: AnalyzerType::Auto,
            confidence_threshold: default_threshold(),
            max_history: default_max_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_batch")]
    pub min_batch_size: usize,
    /// Usable examples required before automatic training, with every label represented
    #[serde(default = "default_min_training_examples")]
    pub min_training_examples: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_batch_size: default_min_batch(),
            min_training_examples: default_min_training_examples(),
            chunk_size: default_chunk_size(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            feature_dim: default_feature_dim(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    #[serde(default = "default_true")]
    pub include_header: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { include_header: true }
    }
}

fn default_threshold() -> f64 { 0.55 }
fn default_max_history() -> usize { 100 }
fn default_true() -> bool { true }
fn default_min_batch() -> usize { 10 }
fn default_min_training_examples() -> usize { 10 }
fn default_chunk_size() -> usize { 32 }
fn default_epochs() -> usize { 5 }
fn default_learning_rate() -> f64 { 0.5 }
fn default_feature_dim() -> usize { 4096 }

/// Locations of everything the app persists outside the config file
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Resolve from config override, falling back to the user-scoped data dir
    pub fn resolve(config: &AppConfig) -> Result<Self, String> {
        if let Some(dir) = &config.data_dir {
            return Ok(Self::new(dir.clone()));
        }
        dirs::data_local_dir()
            .map(|p| Self::new(p.join(APP_DIR_NAME)))
            .ok_or_else(|| "Failed to resolve user data directory".to_string())
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn corrections_file(&self) -> PathBuf {
        self.data_dir.join("corrections.jsonl")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Ensure data directories exist
    pub fn ensure_dirs(&self) -> Result<(), String> {
        for dir in [self.data_dir.clone(), self.checkpoints_dir(), self.logs_dir()] {
            fs::create_dir_all(&dir)
                .map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
        }
        Ok(())
    }
}

pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join("config.json");
        Self { config_dir, config_file }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(APP_DIR_NAME))
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Ensure config directory exists
    pub fn ensure_dir(&self) -> Result<(), String> {
        fs::create_dir_all(&self.config_dir)
            .map_err(|e| format!("Failed to create config dir: {}", e))
    }

    /// Load configuration from file
    pub fn load(&self) -> Result<AppConfig, String> {
        if !self.config_file.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_file)
            .map_err(|e| format!("Failed to read config: {}", e))?;

        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Save configuration to file
    pub fn save(&self, config: &AppConfig) -> Result<(), String> {
        self.ensure_dir()?;

        // Create backup if file exists
        if self.config_file.exists() {
            self.create_backup()?;
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        fs::write(&self.config_file, content)
            .map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Create a backup of current config
    fn create_backup(&self) -> Result<(), String> {
        let backup_dir = self.config_dir.join("backups");
        fs::create_dir_all(&backup_dir)
            .map_err(|e| format!("Failed to create backup dir: {}", e))?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let backup_file = backup_dir.join(format!("config_{}.json", timestamp));

        fs::copy(&self.config_file, &backup_file)
            .map_err(|e| format!("Failed to create backup: {}", e))?;

        // Keep only last 10 backups
        self.cleanup_old_backups(&backup_dir, 10)?;

        Ok(())
    }

    /// Remove old backups, keeping only the most recent N
    fn cleanup_old_backups(&self, backup_dir: &Path, keep: usize) -> Result<(), String> {
        let mut entries: Vec<_> = fs::read_dir(backup_dir)
            .map_err(|e| format!("Failed to read backup dir: {}", e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .collect();

        if entries.len() <= keep {
            return Ok(());
        }

        // Timestamped names sort chronologically
        entries.sort_by_key(|e| e.file_name());

        for entry in entries.iter().take(entries.len() - keep) {
            let _ = fs::remove_file(entry.path());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.analysis.analyzer_type, AnalyzerType::Auto);
        assert_eq!(config.analysis.confidence_threshold, 0.55);
        assert_eq!(config.analysis.max_history, 100);
        assert!(config.training.enabled);
        assert_eq!(config.training.min_batch_size, 10);
        assert!(config.export.include_header);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{"version":"1.0.0","analysis":{"analyzerType":"rules"}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.analysis.analyzer_type, AnalyzerType::Rules);
        assert_eq!(config.analysis.confidence_threshold, 0.55);
        assert_eq!(config.training.chunk_size, 32);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = AppConfig::default();
        config.version = "1.0.0".to_string();
        config.training.min_batch_size = 3;

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("minBatchSize"));
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, "1.0.0");
        assert_eq!(parsed.training.min_batch_size, 3);
    }

    #[test]
    fn test_store_round_trip_with_backups() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().to_path_buf());
        assert_eq!(store.load().unwrap().version, "");

        let mut config = AppConfig::default();
        config.version = "1".to_string();
        store.save(&config).unwrap();
        config.version = "2".to_string();
        store.save(&config).unwrap();

        assert_eq!(store.load().unwrap().version, "2");
        let backups = fs::read_dir(dir.path().join("backups")).unwrap().count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn test_app_paths_override() {
        let mut config = AppConfig::default();
        config.data_dir = Some(PathBuf::from("/tmp/qa-data"));
        let paths = AppPaths::resolve(&config).unwrap();
        assert_eq!(paths.corrections_file(), PathBuf::from("/tmp/qa-data/corrections.jsonl"));
        assert_eq!(paths.checkpoints_dir(), PathBuf::from("/tmp/qa-data/checkpoints"));
    }
}
