// 上传会话定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// 上传模式
///
/// 一个会话只能使用一种模式，在 init 时确定并写入检查点
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// 顺序模式：远端要求分片 ID 严格递增，进度由本地检查点记录
    Ordered,
    /// 乱序模式：分片可任意顺序到达，远端是已完成分片的权威来源
    #[default]
    Disorder,
}

impl UploadMode {
    pub fn is_ordered(&self) -> bool {
        matches!(self, UploadMode::Ordered)
    }
}

/// 上传状态机
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// 初始
    Idle,
    /// 已获得 upload_id
    Initiated,
    /// 分片上传中
    Uploading,
    /// 合并中
    Completing,
    /// 已完成
    Done,
    /// 因不可恢复错误终止（检查点保留）
    Aborted,
}

impl UploadState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Done | UploadState::Aborted)
    }

    /// 状态迁移是否合法
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Idle, Initiated)
                | (Idle, Done)
                | (Idle, Aborted)
                | (Initiated, Uploading)
                | (Initiated, Aborted)
                | (Uploading, Completing)
                | (Uploading, Aborted)
                | (Completing, Done)
                | (Completing, Aborted)
        )
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadState::Idle => write!(f, "idle"),
            UploadState::Initiated => write!(f, "initiated"),
            UploadState::Uploading => write!(f, "uploading"),
            UploadState::Completing => write!(f, "completing"),
            UploadState::Done => write!(f, "done"),
            UploadState::Aborted => write!(f, "aborted"),
        }
    }
}

/// 文件上传请求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 远端路径
    pub remote_key: String,
    /// Content-Type
    pub content_type: Option<String>,
    /// 上传模式（None 使用配置中的默认值）
    pub mode: Option<UploadMode>,
    /// 是否附带整文件 MD5（None 使用配置中的默认值）
    pub verify_md5: Option<bool>,
}

impl UploadRequest {
    pub fn new(local_path: impl Into<PathBuf>, remote_key: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_key: remote_key.into(),
            content_type: None,
            mode: None,
            verify_md5: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_mode(mut self, mode: UploadMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_md5(mut self, verify: bool) -> Self {
        self.verify_md5 = Some(verify);
        self
    }
}

/// 上传结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReport {
    /// 远端路径
    pub remote_key: String,
    /// 分片上传会话 ID（单次上传时为 None）
    pub upload_id: Option<String>,
    /// 是否走了分片上传
    pub multipart: bool,
    /// 是否从检查点续传
    pub resumed: bool,
    /// 分片总数
    pub total_parts: u64,
    /// 本次实际上传的分片数
    pub uploaded_parts: u64,
    /// 文件总大小
    pub total_bytes: u64,
    /// 整文件 MD5（仅在开启校验时计算）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_md5: Option<String>,
    /// 最终状态
    pub state: UploadState,
}
