// 远端分片上传接口
//
// 上传子系统只负责编排，具体的协议（签名、请求头）由实现方提供

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::uploader::task::UploadMode;

/// 初始化分片上传请求
#[derive(Debug, Clone)]
pub struct InitUploadRequest {
    pub remote_key: String,
    pub part_size: u64,
    pub content_length: u64,
    pub content_type: Option<String>,
    /// 乱序模式需要在初始化时声明
    pub mode: UploadMode,
}

/// 初始化结果
#[derive(Debug, Clone)]
pub struct InitUploadResult {
    pub upload_id: String,
    /// 远端确认的分片大小（0 表示沿用请求值）
    pub part_size: u64,
}

/// 分片上传会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub remote_key: String,
    pub part_size: u64,
    pub mode: UploadMode,
}

/// 远端报告的已接收分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisorderPart {
    pub id: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl DisorderPart {
    pub fn new(id: u64, size: u64) -> Self {
        Self {
            id,
            size,
            last_modified: None,
            etag: None,
        }
    }
}

/// 远端上传进度报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemotePartsReport {
    pub upload_id: String,
    /// 远端期望的下一个分片 ID
    pub next_part_id: u64,
    pub next_part_size: u64,
    pub parts: Vec<DisorderPart>,
}

/// 分片上传后端
///
/// 所有方法都可能被重试，实现方需保证同一请求重复发送是安全的
#[async_trait]
pub trait MultipartBackend: Send + Sync + 'static {
    /// 初始化分片上传，获取 upload_id
    async fn init_upload(&self, request: &InitUploadRequest)
        -> Result<InitUploadResult, BackendError>;

    /// 上传单个分片
    async fn upload_part(
        &self,
        session: &UploadSession,
        part_id: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    /// 完成上传（可选附带整文件 MD5，十六进制）
    async fn complete_upload(
        &self,
        session: &UploadSession,
        content_md5: Option<&str>,
    ) -> Result<(), BackendError>;

    /// 查询远端已接收的分片（仅乱序模式）
    async fn get_remote_parts_report(
        &self,
        remote_key: &str,
    ) -> Result<RemotePartsReport, BackendError>;

    /// 单次上传整个文件
    async fn put_object(
        &self,
        remote_key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), BackendError>;
}

/// 内存后端，测试用
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::error::UploadErrorKind;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};

    /// 调用记录
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Init,
        Part(u64),
        Complete,
        Report,
        Put,
    }

    /// 故障注入计划
    #[derive(Debug, Clone)]
    struct Failure {
        kind: UploadErrorKind,
        /// None 表示一直失败
        remaining: Option<u32>,
    }

    #[derive(Debug, Default)]
    struct Session {
        seq: u64,
        remote_key: String,
        part_size: u64,
        content_length: u64,
        mode: UploadMode,
        parts: BTreeMap<u64, Vec<u8>>,
        completed: bool,
    }

    #[derive(Debug, Default)]
    struct State {
        next_id: u64,
        sessions: HashMap<String, Session>,
        objects: HashMap<String, Vec<u8>>,
        calls: Vec<Call>,
        part_failures: HashMap<u64, Failure>,
        init_failure: Option<Failure>,
        complete_failure: Option<Failure>,
    }

    /// 消耗一次故障，返回本次是否失败
    fn take_failure(failure: Option<&mut Failure>) -> Option<UploadErrorKind> {
        let failure = failure?;
        match failure.remaining.as_mut() {
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(failure.kind)
            }
            None => Some(failure.kind),
        }
    }

    #[derive(Debug, Default)]
    pub struct MemoryBackend {
        state: Mutex<State>,
    }

    impl MemoryBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// 指定分片失败 times 次（None 为一直失败）
        pub fn fail_part(&self, part_id: u64, kind: UploadErrorKind, times: Option<u32>) {
            self.state.lock().part_failures.insert(
                part_id,
                Failure {
                    kind,
                    remaining: times,
                },
            );
        }

        pub fn fail_init(&self, kind: UploadErrorKind, times: Option<u32>) {
            self.state.lock().init_failure = Some(Failure {
                kind,
                remaining: times,
            });
        }

        pub fn fail_complete(&self, kind: UploadErrorKind, times: Option<u32>) {
            self.state.lock().complete_failure = Some(Failure {
                kind,
                remaining: times,
            });
        }

        pub fn clear_failures(&self) {
            let mut state = self.state.lock();
            state.part_failures.clear();
            state.init_failure = None;
            state.complete_failure = None;
        }

        /// 让远端"丢失"一个已接收的分片
        pub fn forget_part(&self, upload_id: &str, part_id: u64) {
            if let Some(session) = self.state.lock().sessions.get_mut(upload_id) {
                session.parts.remove(&part_id);
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.state.lock().calls.clone()
        }

        pub fn count(&self, call: &Call) -> usize {
            self.state.lock().calls.iter().filter(|c| *c == call).count()
        }

        /// 分片上传调用次数（含失败）
        pub fn part_attempts(&self, part_id: u64) -> usize {
            self.count(&Call::Part(part_id))
        }

        pub fn total_part_calls(&self) -> usize {
            self.state
                .lock()
                .calls
                .iter()
                .filter(|c| matches!(c, Call::Part(_)))
                .count()
        }

        pub fn object(&self, remote_key: &str) -> Option<Vec<u8>> {
            self.state.lock().objects.get(remote_key).cloned()
        }

        pub fn received_parts(&self, upload_id: &str) -> Vec<u64> {
            self.state
                .lock()
                .sessions
                .get(upload_id)
                .map(|s| s.parts.keys().copied().collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl MultipartBackend for MemoryBackend {
        async fn init_upload(
            &self,
            request: &InitUploadRequest,
        ) -> Result<InitUploadResult, BackendError> {
            let mut state = self.state.lock();
            state.calls.push(Call::Init);
            if let Some(kind) = take_failure(state.init_failure.as_mut()) {
                return Err(BackendError::new(kind, "injected init failure"));
            }

            state.next_id += 1;
            let seq = state.next_id;
            let upload_id = format!("upload-{}", seq);
            state.sessions.insert(
                upload_id.clone(),
                Session {
                    seq,
                    remote_key: request.remote_key.clone(),
                    part_size: request.part_size,
                    content_length: request.content_length,
                    mode: request.mode,
                    ..Default::default()
                },
            );
            Ok(InitUploadResult {
                upload_id,
                part_size: request.part_size,
            })
        }

        async fn upload_part(
            &self,
            session: &UploadSession,
            part_id: u64,
            data: &[u8],
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock();
            state.calls.push(Call::Part(part_id));

            if let Some(kind) = take_failure(state.part_failures.get_mut(&part_id)) {
                return Err(BackendError::new(
                    kind,
                    format!("injected failure on part {}", part_id),
                ));
            }

            let remote = state
                .sessions
                .get_mut(&session.upload_id)
                .ok_or_else(|| BackendError::from_status(404, "upload id not found"))?;

            let part_count = remote.content_length.div_ceil(remote.part_size.max(1));
            if part_id >= part_count {
                return Err(BackendError::part_rejected(format!(
                    "part {} out of range ({} parts)",
                    part_id, part_count
                )));
            }
            if remote.mode.is_ordered() {
                let expected = remote.parts.len() as u64;
                if part_id != expected {
                    return Err(BackendError::part_rejected(format!(
                        "expected part {}, got {}",
                        expected, part_id
                    )));
                }
            }

            remote.parts.insert(part_id, data.to_vec());
            Ok(())
        }

        async fn complete_upload(
            &self,
            session: &UploadSession,
            content_md5: Option<&str>,
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock();
            state.calls.push(Call::Complete);
            if let Some(kind) = take_failure(state.complete_failure.as_mut()) {
                return Err(BackendError::new(kind, "injected complete failure"));
            }

            let remote = state
                .sessions
                .get_mut(&session.upload_id)
                .ok_or_else(|| BackendError::from_status(404, "upload id not found"))?;
            if remote.completed {
                return Ok(());
            }

            let expected = remote.content_length.div_ceil(remote.part_size.max(1));
            if remote.parts.len() as u64 != expected {
                return Err(BackendError::from_status(
                    400,
                    format!("missing parts: {}/{}", remote.parts.len(), expected),
                ));
            }

            let object: Vec<u8> = remote.parts.values().flatten().copied().collect();
            if let Some(md5) = content_md5 {
                let actual = format!("{:x}", md5::compute(&object));
                if actual != md5 {
                    return Err(BackendError::from_status(400, "content md5 mismatch"));
                }
            }

            remote.completed = true;
            let key = remote.remote_key.clone();
            state.objects.insert(key, object);
            Ok(())
        }

        async fn get_remote_parts_report(
            &self,
            remote_key: &str,
        ) -> Result<RemotePartsReport, BackendError> {
            let mut state = self.state.lock();
            state.calls.push(Call::Report);

            let found = state
                .sessions
                .iter()
                .filter(|(_, s)| s.remote_key == remote_key && !s.completed)
                .max_by_key(|(_, s)| s.seq);
            let Some((upload_id, session)) = found else {
                return Err(BackendError::from_status(404, "no pending upload"));
            };

            let mut next_part_id = 0;
            while session.parts.contains_key(&next_part_id) {
                next_part_id += 1;
            }
            Ok(RemotePartsReport {
                upload_id: upload_id.clone(),
                next_part_id,
                next_part_size: session.part_size,
                parts: session
                    .parts
                    .iter()
                    .map(|(id, data)| DisorderPart::new(*id, data.len() as u64))
                    .collect(),
            })
        }

        async fn put_object(
            &self,
            remote_key: &str,
            data: Vec<u8>,
            _content_type: Option<&str>,
        ) -> Result<(), BackendError> {
            let mut state = self.state.lock();
            state.calls.push(Call::Put);
            state.objects.insert(remote_key.to_string(), data);
            Ok(())
        }
    }
}
