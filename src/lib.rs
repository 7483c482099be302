// UpYun Resume Rust Library
// 又拍云断点续传分片上传核心库

// 错误定义
pub mod error;

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 检查点持久化模块
pub mod persistence;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, LogConfig, UploadConfig};
pub use error::{BackendError, RemoteOp, UploadError, UploadErrorKind};
pub use logging::{init_logging, LogGuard};
pub use persistence::{cleanup_expired_checkpoints, scan_checkpoints, Checkpoint};
pub use uploader::{
    MultipartBackend, ProgressEvent, ProgressListener, ResumableUploader, UploadMode,
    UploadReport, UploadRequest, UploadState,
};
