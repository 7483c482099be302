//! 断点续传持久化模块
//!
//! - 检查点：每个 (本地文件, 远端路径) 一个 JSON 文件，记录会话和分片完成状态
//! - 恢复：扫描检查点目录，清理长期未续传的检查点
//!
//! ## 文件结构
//!
//! ```text
//! checkpoints/
//! ├── {md5(src)}-{md5(key)}.json       # 检查点
//! └── {md5(src)}-{md5(key)}.json.tmp   # 写入中的临时文件（重命名后消失）
//! ```
//!
//! ## 使用示例
//!
//! ```ignore
//! use upyun_resume_rust::persistence::Checkpoint;
//!
//! let mut cp = Checkpoint::create(&local_path, "/remote/file.bin", Some(&cp_dir));
//! if !cp.is_resumable() {
//!     cp.initialize(part_size)?;
//!     cp.begin_session(upload_id, mode);
//!     cp.persist()?;
//! }
//!
//! // 每个分片成功后
//! cp.mark_part_complete(part_id);
//! cp.persist()?;
//!
//! // 完成后删除
//! cp.remove();
//! ```

pub mod checkpoint;
pub mod recovery;

pub use checkpoint::{
    checkpoint_file_name, Checkpoint, CheckpointInvalid, FileFingerprint, CHECKPOINT_MAGIC,
};
pub use recovery::{cleanup_expired_checkpoints, scan_checkpoints};
