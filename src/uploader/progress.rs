// 上传进度通知

use serde::Serialize;
use std::sync::Arc;

/// 进度事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    /// 开始上传（total_bytes 已确定，consumed_bytes 为续传前已完成的字节数）
    Started,
    /// 有新数据上传成功
    Data,
    /// 上传完成
    Completed,
    /// 上传失败
    Failed,
}

/// 进度事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub consumed_bytes: u64,
    pub total_bytes: u64,
    pub event_type: ProgressEventType,
}

impl ProgressEvent {
    pub fn new(event_type: ProgressEventType, consumed_bytes: u64, total_bytes: u64) -> Self {
        Self {
            consumed_bytes,
            total_bytes,
            event_type,
        }
    }

    /// 进度百分比
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.consumed_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// 进度监听器
///
/// 回调在编排器的控制流中同步执行，实现方不应阻塞
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// 发布进度事件（无监听器时忽略）
pub(crate) fn publish(listener: Option<&Arc<dyn ProgressListener>>, event: ProgressEvent) {
    if let Some(listener) = listener {
        listener.on_progress(&event);
    }
}
