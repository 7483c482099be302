// 上传分片划分
//
// 又拍云分片上传规则：
// - 分片大小默认 1MB，必须是 1MB 的整数倍
// - 单个文件最多 10000 个分片
// - 小于 10MB 的文件不走断点续传，直接单次上传

use crate::error::UploadError;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

/// 默认分片大小: 1MB（同时也是远端要求的最小分片）
pub const DEFAULT_PART_SIZE: u64 = 1024 * 1024;

/// 最大分片数
pub const MAX_PART_NUM: u64 = 10000;

/// 断点续传的最小文件大小: 10MB
pub const MIN_RESUME_FILE_SIZE: u64 = DEFAULT_PART_SIZE * 10;

/// 上传分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPart {
    /// 分片 ID（从 0 开始）
    pub part_id: u64,
    /// 在源文件中的起始偏移
    pub offset: u64,
    /// 分片大小
    pub size: u64,
    /// 远端是否已确认
    pub completed: bool,
}

impl UploadPart {
    pub fn new(part_id: u64, offset: u64, size: u64) -> Self {
        Self {
            part_id,
            offset,
            size,
            completed: false,
        }
    }

    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }
}

/// 分片数量：ceil(total_size / part_size)
pub fn part_count(total_size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    total_size.div_ceil(part_size)
}

/// 计算分片
///
/// 除最后一片外每片都是 part_size，最后一片为剩余字节
pub fn calculate_parts(total_size: u64, part_size: u64) -> Vec<UploadPart> {
    let count = part_count(total_size, part_size);
    let parts: Vec<UploadPart> = (0..count)
        .map(|part_id| {
            let offset = part_id * part_size;
            let size = part_size.min(total_size - offset);
            UploadPart::new(part_id, offset, size)
        })
        .collect();

    debug!(
        "分片划分: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        total_size,
        part_size,
        parts.len()
    );

    parts
}

/// 校验分片大小
///
/// # 参数
/// * `part_size` - 期望的分片大小，0 表示使用 min_part_size
/// * `file_size` - 文件大小
/// * `min_part_size` - 远端最小分片
/// * `max_part_count` - 远端最大分片数
///
/// # 返回
/// (实际分片大小, 分片数量)
pub fn validate_part_size(
    part_size: u64,
    file_size: u64,
    min_part_size: u64,
    max_part_count: u64,
) -> Result<(u64, u64), UploadError> {
    let part_size = if part_size == 0 {
        min_part_size
    } else {
        part_size
    };

    if part_size < min_part_size {
        return Err(UploadError::Config(format!(
            "分片大小最小为 {}",
            min_part_size
        )));
    }
    if min_part_size > 0 && part_size % min_part_size != 0 {
        return Err(UploadError::Config(format!(
            "分片大小必须是 {} 的整数倍",
            min_part_size
        )));
    }

    let count = part_count(file_size, part_size);
    if count > max_part_count {
        return Err(UploadError::Config(format!(
            "分片数量 {} 超过上限 {}",
            count, max_part_count
        )));
    }

    Ok((part_size, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_part_creation() {
        let part = UploadPart::new(3, 3072, 1024);
        assert_eq!(part.range(), 3072..4096);
        assert!(!part.completed);
    }

    #[test]
    fn test_part_calculation() {
        // 整除
        let parts = calculate_parts(16 * 1024 * 1024, 4 * 1024 * 1024);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].range(), 0..(4 * 1024 * 1024));
        assert_eq!(parts[3].range(), (12 * 1024 * 1024)..(16 * 1024 * 1024));

        // 不整除
        let parts = calculate_parts(17 * 1024 * 1024, 4 * 1024 * 1024);
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[4].offset, 16 * 1024 * 1024);
        assert_eq!(parts[4].size, 1024 * 1024);
    }

    #[test]
    fn test_empty_file_has_no_parts() {
        assert!(calculate_parts(0, DEFAULT_PART_SIZE).is_empty());
        assert_eq!(part_count(0, DEFAULT_PART_SIZE), 0);
    }

    #[test]
    fn test_validate_part_size() {
        let mb = DEFAULT_PART_SIZE;

        // 0 使用默认值
        assert_eq!(validate_part_size(0, 20 * mb, mb, MAX_PART_NUM).unwrap(), (mb, 20));
        assert_eq!(
            validate_part_size(2 * mb, 21 * mb, mb, MAX_PART_NUM).unwrap(),
            (2 * mb, 11)
        );

        // 太小 / 非整数倍
        assert!(validate_part_size(mb / 2, 20 * mb, mb, MAX_PART_NUM).is_err());
        assert!(validate_part_size(mb + 1, 20 * mb, mb, MAX_PART_NUM).is_err());

        // 分片数超限
        assert!(validate_part_size(mb, (MAX_PART_NUM + 1) * mb, mb, MAX_PART_NUM).is_err());
        assert!(validate_part_size(mb, MAX_PART_NUM * mb, mb, MAX_PART_NUM).is_ok());
    }

    proptest! {
        #[test]
        fn prop_partition_covers_file(file_size in 1u64..10_000_000, part_size in 1u64..2_000_000) {
            let parts = calculate_parts(file_size, part_size);
            let expected = file_size.div_ceil(part_size);

            prop_assert_eq!(parts.len() as u64, expected);
            for (i, part) in parts.iter().enumerate() {
                prop_assert_eq!(part.part_id, i as u64);
                prop_assert_eq!(part.offset, i as u64 * part_size);
            }
            for part in &parts[..parts.len() - 1] {
                prop_assert_eq!(part.size, part_size);
            }
            let last = parts.last().unwrap();
            prop_assert_eq!(last.size, file_size - (expected - 1) * part_size);
            prop_assert_eq!(parts.iter().map(|p| p.size).sum::<u64>(), file_size);
        }
    }
}
