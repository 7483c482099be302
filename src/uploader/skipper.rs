// 分片跳过器
//
// 乱序模式下远端会报告已收到的分片：next_part_id 之前的分片连续完成，
// 之后的分片可能零散完成（中间有空洞）。生产者据此决定从哪里开始读、哪些分片不用再发。

use std::collections::HashMap;

use crate::persistence::Checkpoint;
use crate::uploader::backend::DisorderPart;

/// 分片跳过器
#[derive(Debug, Clone, Default)]
pub struct PartSkipper {
    /// 远端期望的下一个分片 ID
    next_part_id: u64,
    /// 已报告完成的分片: part_id -> size
    reported: HashMap<u64, u64>,
}

impl PartSkipper {
    /// 根据远端报告创建
    pub fn new(next_part_id: u64, reported_parts: &[DisorderPart]) -> Self {
        let reported = reported_parts.iter().map(|p| (p.id, p.size)).collect();
        Self {
            next_part_id,
            reported,
        }
    }

    /// 根据本地检查点创建（顺序模式）
    ///
    /// 检查点中所有已完成分片都视为"已报告"
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let reported = checkpoint
            .parts()
            .iter()
            .filter(|p| p.completed)
            .map(|p| (p.part_id, p.size))
            .collect();
        Self {
            next_part_id: 0,
            reported,
        }
    }

    /// 第一个缺失的分片 ID
    ///
    /// 报告集合为空时返回 next_part_id；否则从 0 开始找第一个不在集合中的 ID
    pub fn first_missing_part_id(&self) -> u64 {
        if self.reported.is_empty() {
            return self.next_part_id;
        }
        let mut id = 0;
        while self.reported.contains_key(&id) {
            id += 1;
        }
        id
    }

    /// 分片是否可以跳过
    pub fn is_skippable(&self, part_id: u64) -> bool {
        part_id < self.next_part_id || self.reported.contains_key(&part_id)
    }

    /// 已报告完成的字节数
    pub fn reported_bytes(&self) -> u64 {
        self.reported.values().sum()
    }

    pub fn next_part_id(&self) -> u64 {
        self.next_part_id
    }

    pub fn reported_count(&self) -> usize {
        self.reported.len()
    }
}
