//! 检查点扫描与过期清理
//!
//! 检查点在上传成功后会被删除；失败或进程被杀时保留下来等待续传。
//! 长期无人续传的检查点按最后更新时间清理，无法解析的文件按文件修改时间清理。

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::checkpoint::{Checkpoint, CHECKPOINT_EXTENSION};

/// 写入中途残留的临时文件扩展名
const TEMP_EXTENSION: &str = "tmp";

/// 扫描目录中的所有检查点
///
/// 无法解析或自校验失败的文件会被跳过（不删除）
pub fn scan_checkpoints(dir: &Path) -> io::Result<Vec<Checkpoint>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    let mut skipped = 0;

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != CHECKPOINT_EXTENSION) {
            continue;
        }

        match Checkpoint::load(&path) {
            Ok(cp) if cp.verify_integrity() => checkpoints.push(cp),
            Ok(_) => {
                warn!("跳过自校验失败的检查点 {:?}", path);
                skipped += 1;
            }
            Err(e) => {
                warn!("跳过无效检查点文件 {:?}: {}", path, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("扫描检查点完成，跳过 {} 个无效文件", skipped);
    }
    debug!("扫描到 {} 个检查点", checkpoints.len());

    Ok(checkpoints)
}

/// 清理过期检查点
///
/// # Arguments
/// * `dir` - 检查点目录
/// * `max_age` - 最长保留时间
///
/// # Returns
/// 删除的文件数
pub fn cleanup_expired_checkpoints(dir: &Path, max_age: Duration) -> io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    info!("开始清理过期检查点（保留 {} 秒）", max_age.as_secs());
    let mut cleaned = 0;

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(ext) = path.extension() else {
            continue;
        };

        let expired = if ext == CHECKPOINT_EXTENSION {
            match Checkpoint::load(&path) {
                Ok(cp) if cp.verify_integrity() => {
                    let age = Utc::now().signed_duration_since(cp.updated_at());
                    age.to_std().map_or(false, |age| age > max_age)
                }
                // 损坏的文件没有可信的更新时间，按文件修改时间判断
                _ => expired_by_modified_time(&path, max_age),
            }
        } else if ext == TEMP_EXTENSION {
            expired_by_modified_time(&path, max_age)
        } else {
            continue;
        };

        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                info!("已清理过期检查点: {:?}", path);
                cleaned += 1;
            }
            Err(e) => error!("清理过期检查点 {:?} 失败: {}", path, e),
        }
    }

    if cleaned > 0 {
        info!("已清理 {} 个过期检查点", cleaned);
    } else {
        debug!("无过期检查点需要清理");
    }

    Ok(cleaned)
}

fn expired_by_modified_time(path: &Path, max_age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(false, |age| age > max_age)
}
