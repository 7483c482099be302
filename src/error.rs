// 上传错误定义
//
// 错误分三层：
// - UploadErrorKind: 远端错误分类（决定是否可重试）
// - BackendError: 远端协作方返回的原始错误
// - UploadError: 上传子系统对调用方暴露的错误

use std::fmt;
use std::io;

/// 远端错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试，需要更长等待时间）
    RateLimited,
    /// 分片越界或重复（协议错误，不可重试）
    PartRejected,
    /// 文件不存在（不可重试）
    NotFound,
    /// 权限不足（不可重试）
    Forbidden,
    /// 参数错误（不可重试）
    BadRequest,
    /// 空间不足（不可重试）
    QuotaExceeded,
    /// 未知错误（按瞬时错误处理）
    Unknown,
}

impl UploadErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadErrorKind::Network
                | UploadErrorKind::Timeout
                | UploadErrorKind::ServerError
                | UploadErrorKind::RateLimited
                | UploadErrorKind::Unknown
        )
    }

    /// 是否为协议错误（本地与远端状态不一致）
    pub fn is_protocol(&self) -> bool {
        matches!(self, UploadErrorKind::PartRejected)
    }

    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => UploadErrorKind::BadRequest,
            401 | 403 => UploadErrorKind::Forbidden,
            404 => UploadErrorKind::NotFound,
            408 => UploadErrorKind::Timeout,
            409 => UploadErrorKind::PartRejected,
            413 => UploadErrorKind::QuotaExceeded,
            429 => UploadErrorKind::RateLimited,
            500..=599 => UploadErrorKind::ServerError,
            _ => UploadErrorKind::Unknown,
        }
    }
}

/// 远端协作方返回的错误
#[derive(Debug, Clone)]
pub struct BackendError {
    /// 错误分类
    pub kind: UploadErrorKind,
    /// HTTP 状态码（如有）
    pub status: Option<u16>,
    /// 错误信息
    pub message: String,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?}: status={}, message={}", self.kind, status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for BackendError {}

impl BackendError {
    pub fn new(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// 根据 HTTP 状态码构造
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: UploadErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(UploadErrorKind::Network, message)
    }

    pub fn part_rejected(message: impl Into<String>) -> Self {
        Self::new(UploadErrorKind::PartRejected, message)
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// 远端操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    InitUpload,
    UploadPart,
    CompleteUpload,
    PartsReport,
    PutObject,
}

impl fmt::Display for RemoteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteOp::InitUpload => write!(f, "init multipart"),
            RemoteOp::UploadPart => write!(f, "upload part"),
            RemoteOp::CompleteUpload => write!(f, "complete multipart"),
            RemoteOp::PartsReport => write!(f, "get resume process"),
            RemoteOp::PutObject => write!(f, "put"),
        }
    }
}

/// 上传子系统错误
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// 本地 IO 错误（检查点读写、文件 stat 等）
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),

    /// 源文件读取失败（致命，不重试）
    #[error("源文件读取失败: {0}")]
    SourceRead(#[source] io::Error),

    /// 源文件在上传过程中被修改
    #[error("源文件已变化: {0}")]
    SourceChanged(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 远端调用失败（已用尽重试次数，或错误不可重试）
    #[error("{operation}{} 失败（共尝试 {attempts} 次）: {source}", fmt_part(.part_id))]
    Remote {
        operation: RemoteOp,
        part_id: Option<u64>,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    /// 协议错误：远端拒绝分片（越界/重复），说明本地与远端状态不一致
    #[error("协议错误 {operation}{}: {source}", fmt_part(.part_id))]
    Protocol {
        operation: RemoteOp,
        part_id: Option<u64>,
        #[source]
        source: BackendError,
    },

    /// 多个独立失败的汇总
    #[error("{} 个错误: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<UploadError>),

    /// 上传已取消
    #[error("上传已取消")]
    Cancelled,

    /// 后台任务异常退出
    #[error("后台任务异常: {0}")]
    TaskFailed(String),
}

impl UploadError {
    /// 展开汇总错误，返回所有叶子错误
    pub fn flatten(&self) -> Vec<&UploadError> {
        match self {
            UploadError::Multiple(errors) => errors.iter().flat_map(|e| e.flatten()).collect(),
            other => vec![other],
        }
    }

    /// 所有失败分片的 ID（升序去重）
    pub fn failed_part_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .flatten()
            .into_iter()
            .filter_map(|e| match e {
                UploadError::Remote { part_id, .. } | UploadError::Protocol { part_id, .. } => {
                    *part_id
                }
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// 把多个错误合并为一个；只有一个时原样返回
    pub fn join(mut errors: Vec<UploadError>) -> Option<UploadError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(UploadError::Multiple(errors)),
        }
    }
}

fn fmt_part(part_id: &Option<u64>) -> String {
    match part_id {
        Some(id) => format!(" (part #{})", id),
        None => String::new(),
    }
}

fn join_errors(errors: &[UploadError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
