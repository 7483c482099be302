//! 断点续传检查点
//!
//! 每个 (本地文件, 远端路径) 对应一个检查点文件，记录上传会话和每个分片的完成状态。
//!
//! ## 文件格式
//!
//! JSON，文件名为 `{md5(本地路径)}-{md5(远端路径)}.json`：
//! ```json
//! {
//!   "magic": "UPYUN-RESUME-CHECKPOINT-V1",
//!   "md5": "base64(md5(去掉 md5 字段后的序列化内容))",
//!   "file_path": "/data/movie.mkv",
//!   "file_stat": { "size": 104857600, "last_modified": "2025-12-05T00:00:00.123456789Z" },
//!   "object_key": "/videos/movie.mkv",
//!   "upload_id": "...",
//!   "mode": "disorder",
//!   "part_size": 1048576,
//!   "parts": [{ "part_id": 0, "offset": 0, "size": 1048576, "completed": true }, ...],
//!   "updated_at": "2025-12-05T00:00:01Z"
//! }
//! ```
//!
//! 加载时先校验 magic 和自校验哈希，再比对源文件的大小和修改时间。
//! 任一校验失败都视为"没有可续传的状态"，删除旧文件后从头上传。

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use crate::uploader::chunk::{calculate_parts, UploadPart};
use crate::uploader::skipper::PartSkipper;
use crate::uploader::task::UploadMode;

/// 检查点文件魔数
pub const CHECKPOINT_MAGIC: &str = "UPYUN-RESUME-CHECKPOINT-V1";

/// 检查点文件扩展名
pub const CHECKPOINT_EXTENSION: &str = "json";

/// 获取检查点文件名
///
/// 由本地路径和远端路径各自的 MD5 拼接而成，同一对路径始终得到同一个文件名
pub fn checkpoint_file_name(source_path: &Path, remote_key: &str) -> String {
    let src = md5::compute(source_path.to_string_lossy().as_bytes());
    let dest = md5::compute(remote_key.as_bytes());
    format!("{:x}-{:x}.{}", src, dest, CHECKPOINT_EXTENSION)
}

/// 源文件指纹（大小 + 修改时间）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl Default for FileFingerprint {
    fn default() -> Self {
        Self {
            size: 0,
            last_modified: DateTime::<Utc>::from(UNIX_EPOCH),
        }
    }
}

impl FileFingerprint {
    /// 读取文件当前指纹
    pub fn of(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            last_modified: DateTime::<Utc>::from(metadata.modified()?),
        })
    }
}

/// 检查点失效原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointInvalid {
    /// 文件无法解析
    Unreadable(String),
    /// 魔数不匹配
    MagicMismatch,
    /// 自校验哈希不匹配（文件损坏或被截断）
    HashMismatch,
    /// 记录的路径与当前请求不一致
    IdentityMismatch,
    /// 源文件已不存在
    SourceMissing,
    /// 源文件大小或修改时间变化
    SourceChanged,
}

impl fmt::Display for CheckpointInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointInvalid::Unreadable(e) => write!(f, "检查点无法解析: {}", e),
            CheckpointInvalid::MagicMismatch => write!(f, "魔数不匹配"),
            CheckpointInvalid::HashMismatch => write!(f, "自校验哈希不匹配"),
            CheckpointInvalid::IdentityMismatch => write!(f, "路径与请求不一致"),
            CheckpointInvalid::SourceMissing => write!(f, "源文件不存在"),
            CheckpointInvalid::SourceChanged => write!(f, "源文件已变化"),
        }
    }
}

/// 上传检查点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    magic: String,
    /// 自校验哈希（base64 编码的 MD5）
    md5: String,
    file_path: PathBuf,
    file_stat: FileFingerprint,
    object_key: String,
    upload_id: String,
    mode: UploadMode,
    part_size: u64,
    parts: Vec<UploadPart>,
    updated_at: DateTime<Utc>,
    /// 检查点文件路径，None 表示仅内存
    #[serde(skip)]
    cp_path: Option<PathBuf>,
}

impl Checkpoint {
    /// 空检查点
    fn empty(source_path: &Path, remote_key: &str, cp_path: Option<PathBuf>) -> Self {
        Self {
            magic: CHECKPOINT_MAGIC.to_string(),
            md5: String::new(),
            file_path: source_path.to_path_buf(),
            file_stat: FileFingerprint::default(),
            object_key: remote_key.to_string(),
            upload_id: String::new(),
            mode: UploadMode::default(),
            part_size: 0,
            parts: Vec::new(),
            updated_at: Utc::now(),
            cp_path,
        }
    }

    /// 加载或创建检查点
    ///
    /// 目录中存在同名检查点且校验通过时原样返回（可续传）；
    /// 否则删除旧文件并返回空检查点。`dir` 为 None 时只在内存中记录进度。
    pub fn create(source_path: &Path, remote_key: &str, dir: Option<&Path>) -> Self {
        let Some(dir) = dir else {
            return Self::empty(source_path, remote_key, None);
        };

        let cp_path = dir.join(checkpoint_file_name(source_path, remote_key));
        let fresh = Self::empty(source_path, remote_key, Some(cp_path.clone()));

        if !cp_path.exists() {
            return fresh;
        }

        let invalid = match Self::load(&cp_path) {
            Ok(mut cp) => match cp.validate(source_path, remote_key) {
                Ok(()) => {
                    cp.cp_path = Some(cp_path);
                    info!(
                        "找到可续传的检查点: upload_id={}, 已完成 {}/{} 个分片",
                        cp.upload_id,
                        cp.completed_count(),
                        cp.parts.len()
                    );
                    return cp;
                }
                Err(reason) => reason,
            },
            Err(e) => CheckpointInvalid::Unreadable(e.to_string()),
        };

        warn!("丢弃检查点 {:?}: {}", cp_path, invalid);
        fresh.remove();
        fresh
    }

    /// 从文件加载（不做任何校验）
    pub fn load(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut cp: Checkpoint = serde_json::from_reader(reader).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse checkpoint: {}", e),
            )
        })?;
        cp.cp_path = Some(path.to_path_buf());
        debug!("已加载检查点: {:?}", path);
        Ok(cp)
    }

    /// 校验检查点是否可用于续传
    pub fn validate(&self, source_path: &Path, remote_key: &str) -> Result<(), CheckpointInvalid> {
        if self.magic != CHECKPOINT_MAGIC {
            return Err(CheckpointInvalid::MagicMismatch);
        }
        if !self.verify_integrity() {
            return Err(CheckpointInvalid::HashMismatch);
        }
        if self.file_path != source_path || self.object_key != remote_key {
            return Err(CheckpointInvalid::IdentityMismatch);
        }

        match FileFingerprint::of(&self.file_path) {
            Ok(current) if current == self.file_stat => Ok(()),
            Ok(_) => Err(CheckpointInvalid::SourceChanged),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CheckpointInvalid::SourceMissing),
            Err(e) => Err(CheckpointInvalid::Unreadable(e.to_string())),
        }
    }

    /// 重新计算自校验哈希并与记录值比较
    pub fn verify_integrity(&self) -> bool {
        match self.integrity_hash() {
            Ok(hash) => hash == self.md5,
            Err(_) => false,
        }
    }

    /// 计算自校验哈希：md5 字段置空后序列化，再取 MD5 的 base64
    fn integrity_hash(&self) -> io::Result<String> {
        let mut unsigned = self.clone();
        unsigned.md5 = String::new();
        let json = serde_json::to_vec(&unsigned)?;
        Ok(BASE64.encode(md5::compute(&json).0))
    }

    /// 初始化分片列表
    ///
    /// stat 源文件记录指纹，并按 part_size 划分分片
    pub fn initialize(&mut self, part_size: u64) -> io::Result<()> {
        self.file_stat = FileFingerprint::of(&self.file_path)?;
        self.part_size = part_size;
        self.parts = calculate_parts(self.file_stat.size, part_size);

        debug!(
            "初始化检查点: file={:?}, size={}, part_size={}, parts={}",
            self.file_path,
            self.file_stat.size,
            part_size,
            self.parts.len()
        );
        Ok(())
    }

    /// 记录会话身份
    pub fn begin_session(&mut self, upload_id: impl Into<String>, mode: UploadMode) {
        self.upload_id = upload_id.into();
        self.mode = mode;
    }

    /// 持久化到磁盘
    ///
    /// 先写临时文件再原子重命名，写入中断不会留下半个检查点
    pub fn persist(&mut self) -> io::Result<()> {
        let Some(path) = self.cp_path.clone() else {
            return Ok(());
        };

        self.updated_at = Utc::now();
        self.md5 = self.integrity_hash()?;

        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
                debug!("已创建检查点目录: {:?}", dir);
            }
        }

        let temp_path = path.with_extension("json.tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &path)?;

        debug!(
            "已保存检查点: {:?} ({}/{} 完成)",
            path,
            self.completed_count(),
            self.parts.len()
        );
        Ok(())
    }

    /// 标记分片完成（幂等）
    ///
    /// 返回 false 表示 part_id 越界
    pub fn mark_part_complete(&mut self, part_id: u64) -> bool {
        match self.parts.get_mut(part_id as usize) {
            Some(part) if part.part_id == part_id => {
                part.completed = true;
                true
            }
            _ => {
                warn!("标记完成的分片不存在: part_id={}", part_id);
                false
            }
        }
    }

    /// 未完成的分片（按 part_id 升序）
    pub fn pending_parts(&self) -> Vec<UploadPart> {
        self.parts.iter().filter(|p| !p.completed).cloned().collect()
    }

    /// 已完成的字节数
    pub fn completed_bytes(&self) -> u64 {
        self.parts.iter().filter(|p| p.completed).map(|p| p.size).sum()
    }

    /// 已完成的分片数
    pub fn completed_count(&self) -> usize {
        self.parts.iter().filter(|p| p.completed).count()
    }

    /// 按远端报告重建完成状态（乱序模式下远端是权威来源）
    pub fn reconcile(&mut self, skipper: &PartSkipper) -> usize {
        for part in &mut self.parts {
            part.completed = skipper.is_skippable(part.part_id);
        }
        self.completed_count()
    }

    /// 源文件是否与记录的指纹一致
    pub fn source_unchanged(&self) -> io::Result<bool> {
        Ok(FileFingerprint::of(&self.file_path)? == self.file_stat)
    }

    /// 删除检查点文件
    pub fn remove(&self) {
        if let Some(path) = &self.cp_path {
            match fs::remove_file(path) {
                Ok(()) => debug!("已删除检查点: {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("删除检查点失败 {:?}: {}", path, e),
            }
        }
    }

    /// 丢弃当前进度，回到空检查点（文件一并删除）
    pub fn discard(&mut self) {
        self.remove();
        *self = Self::empty(&self.file_path, &self.object_key, self.cp_path.clone());
    }

    /// 是否包含可续传的会话
    pub fn is_resumable(&self) -> bool {
        !self.upload_id.is_empty() && !self.parts.is_empty()
    }

    /// 是否会写入磁盘
    pub fn is_persistent(&self) -> bool {
        self.cp_path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.cp_path.as_deref()
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn mode(&self) -> UploadMode {
        self.mode
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn parts(&self) -> &[UploadPart] {
        &self.parts
    }

    pub fn fingerprint(&self) -> &FileFingerprint {
        &self.file_stat
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
