// 断点续传上传模块
//
// - chunk: 分片划分与分片大小校验
// - skipper: 根据远端报告跳过已完成分片
// - source: 数据源抽象与 MD5 计算
// - pool: 分片生产者 + 并发 worker
// - retry: 指数退避重试
// - backend: 远端分片上传接口
// - engine: 上传状态机（检查点、续传、完成）

pub mod backend;
pub mod chunk;
pub mod engine;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod skipper;
pub mod source;
pub mod task;

pub use backend::{
    DisorderPart, InitUploadRequest, InitUploadResult, MultipartBackend, RemotePartsReport,
    UploadSession,
};
pub use chunk::{
    calculate_parts, part_count, validate_part_size, UploadPart, DEFAULT_PART_SIZE, MAX_PART_NUM,
    MIN_RESUME_FILE_SIZE,
};
pub use engine::ResumableUploader;
pub use pool::{MultipartUploader, PartPayload};
pub use progress::{ProgressEvent, ProgressEventType, ProgressListener};
pub use retry::{with_retry, RetryPolicy};
pub use skipper::PartSkipper;
pub use source::{md5_file, md5_reader, FileSource, LengthKnown, UploadSource};
pub use task::{UploadMode, UploadReport, UploadRequest, UploadState};
