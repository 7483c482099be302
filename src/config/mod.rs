// 配置管理模块

use crate::error::UploadError;
use crate::uploader::chunk::{DEFAULT_PART_SIZE, MAX_PART_NUM, MIN_RESUME_FILE_SIZE};
use crate::uploader::task::UploadMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 保留的日志文件个数（按天滚动，默认 7 个）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 上传配置
///
/// 断点续传相关的全部参数：
/// - 分片大小及其约束（最小分片、最大分片数）
/// - 并发数、单次调用最大尝试次数、退避时间
/// - 检查点目录（为空时不做持久化，无法跨进程续传）
/// - 小文件阈值（低于此值直接单次上传）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小（字节），必须是 min_part_size 的整数倍
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// 远端允许的最小分片（字节）
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
    /// 远端允许的最大分片数
    #[serde(default = "default_max_part_count")]
    pub max_part_count: u64,
    /// 并发上传的 worker 数（顺序模式下强制为 1）
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 每次远端调用的最大尝试次数（含首次）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 首次重试前的等待（毫秒），之后指数增长
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// 重试等待上限（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 检查点目录，None 表示仅内存（不可续传）
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// 检查点保留时间（小时），超过后清理
    #[serde(default = "default_checkpoint_retention_hours")]
    pub checkpoint_retention_hours: u64,
    /// 小于该大小的文件不走分片上传
    #[serde(default = "default_small_file_threshold")]
    pub small_file_threshold: u64,
    /// 默认上传模式
    #[serde(default)]
    pub mode: UploadMode,
    /// 完成时是否附带整文件 MD5
    #[serde(default)]
    pub verify_md5: bool,
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_min_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_max_part_count() -> u64 {
    MAX_PART_NUM
}

fn default_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_checkpoint_retention_hours() -> u64 {
    24
}

fn default_small_file_threshold() -> u64 {
    MIN_RESUME_FILE_SIZE
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            min_part_size: default_min_part_size(),
            max_part_count: default_max_part_count(),
            workers: default_workers(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            checkpoint_dir: None,
            checkpoint_retention_hours: default_checkpoint_retention_hours(),
            small_file_threshold: default_small_file_threshold(),
            mode: UploadMode::default(),
            verify_md5: false,
        }
    }
}

impl UploadConfig {
    /// 校验配置
    ///
    /// 分片大小必须不小于 min_part_size 且为其整数倍；worker 数与尝试次数至少为 1
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.min_part_size == 0 {
            return Err(UploadError::Config("min_part_size 不能为 0".to_string()));
        }
        if self.part_size < self.min_part_size {
            return Err(UploadError::Config(format!(
                "分片大小 {} 小于最小值 {}",
                self.part_size, self.min_part_size
            )));
        }
        if self.part_size % self.min_part_size != 0 {
            return Err(UploadError::Config(format!(
                "分片大小 {} 必须是 {} 的整数倍",
                self.part_size, self.min_part_size
            )));
        }
        if self.max_part_count == 0 {
            return Err(UploadError::Config("max_part_count 不能为 0".to_string()));
        }
        if self.workers == 0 {
            return Err(UploadError::Config("workers 至少为 1".to_string()));
        }
        if self.max_retries == 0 {
            return Err(UploadError::Config("max_retries 至少为 1".to_string()));
        }
        Ok(())
    }

    /// 检查点保留时长
    pub fn checkpoint_retention(&self) -> Duration {
        Duration::from_secs(self.checkpoint_retention_hours * 3600)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传参数校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .context("保存配置失败：上传参数校验失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_upload_config_is_valid() {
        let config = UploadConfig::default();
        assert_eq!(config.part_size, 1024 * 1024);
        assert_eq!(config.small_file_threshold, 10 * 1024 * 1024);
        assert_eq!(config.max_retries, 3);
        assert!(config.checkpoint_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_part_size_rules() {
        let mut config = UploadConfig::default();

        config.part_size = 512 * 1024;
        assert!(matches!(config.validate(), Err(UploadError::Config(_))));

        config.part_size = 3 * 1024 * 1024 / 2;
        assert!(matches!(config.validate(), Err(UploadError::Config(_))));

        config.part_size = 4 * 1024 * 1024;
        assert!(config.validate().is_ok());

        config.workers = 0;
        assert!(config.validate().is_err());

        config.workers = 2;
        config.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let content = r#"
            [upload]
            part_size = 2097152
            workers = 8
            checkpoint_dir = "/var/lib/upyun/checkpoints"
            mode = "ordered"
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.upload.part_size, 2 * 1024 * 1024);
        assert_eq!(config.upload.workers, 8);
        assert_eq!(config.upload.mode, UploadMode::Ordered);
        assert_eq!(
            config.upload.checkpoint_dir,
            Some(PathBuf::from("/var/lib/upyun/checkpoints"))
        );
        assert_eq!(config.upload.max_retries, 3);
        assert_eq!(config.log.level, "info");
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.workers = 6;
        config.upload.verify_md5 = true;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.workers, 6);
        assert!(loaded.upload.verify_md5);
    }

    #[tokio::test]
    async fn test_load_or_default_falls_back() {
        let config = AppConfig::load_or_default("/nonexistent/app.toml").await;
        assert_eq!(config.upload.workers, 4);
    }
}
