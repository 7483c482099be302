// 断点续传上传引擎
//
// 状态机: Idle -> Initiated -> Uploading -> Completing -> Done
//                      \            \             \
//                       +------------+-------------+--> Aborted
//
// - Idle: 加载/创建检查点，无可续传会话时调用 init 获取 upload_id
// - Uploading: 生产者 + worker 池上传未完成分片，每个分片成功后立即持久化检查点
// - Completing: 校验源文件未变化，可选计算整文件 MD5，调用 complete
// - Done: 删除检查点
// - Aborted: 检查点保留在磁盘，下次同参数调用时续传

use std::io::Cursor;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UploadConfig;
use crate::error::{RemoteOp, UploadError, UploadErrorKind};
use crate::persistence::{cleanup_expired_checkpoints, Checkpoint, FileFingerprint};
use crate::uploader::backend::{InitUploadRequest, MultipartBackend, UploadSession};
use crate::uploader::chunk::{part_count, validate_part_size};
use crate::uploader::pool::{MultipartUploader, PartPayload};
use crate::uploader::progress::{publish, ProgressEvent, ProgressEventType, ProgressListener};
use crate::uploader::retry::{with_retry, RetryPolicy};
use crate::uploader::skipper::PartSkipper;
use crate::uploader::source::{md5_file, md5_reader, FileSource, UploadSource};
use crate::uploader::task::{UploadMode, UploadReport, UploadRequest, UploadState};

/// 断点续传上传器
pub struct ResumableUploader<B> {
    backend: Arc<B>,
    config: UploadConfig,
    retry: RetryPolicy,
    cancel: CancellationToken,
    progress: Option<Arc<dyn ProgressListener>>,
}

/// 单次上传的状态跟踪
struct Tracker<'a> {
    remote_key: &'a str,
    state: UploadState,
    total_bytes: u64,
    progress: Option<&'a Arc<dyn ProgressListener>>,
}

impl Tracker<'_> {
    fn transition(&mut self, next: UploadState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        debug!("[{}] 状态 {} -> {}", self.remote_key, self.state, next);
        self.state = next;
    }

    fn publish(&self, event_type: ProgressEventType, consumed: u64) {
        publish(
            self.progress,
            ProgressEvent::new(event_type, consumed, self.total_bytes),
        );
    }

    /// 进入 Aborted 并发布失败事件
    fn abort(&mut self, consumed: u64, err: UploadError) -> UploadError {
        error!("[{}] ❌ 上传终止: {}", self.remote_key, err);
        self.transition(UploadState::Aborted);
        self.publish(ProgressEventType::Failed, consumed);
        err
    }
}

impl<B: MultipartBackend> ResumableUploader<B> {
    /// 创建上传器
    ///
    /// 配置不合法时返回 `UploadError::Config`
    pub fn new(backend: Arc<B>, config: UploadConfig) -> Result<Self, UploadError> {
        config.validate()?;
        Ok(Self {
            backend,
            retry: RetryPolicy::from_config(&config),
            config,
            cancel: CancellationToken::new(),
            progress: None,
        })
    }

    /// 使用外部取消令牌
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.progress = Some(listener);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 清理检查点目录中的过期检查点
    pub fn cleanup_expired_checkpoints(&self) -> Result<usize, UploadError> {
        match &self.config.checkpoint_dir {
            Some(dir) => Ok(cleanup_expired_checkpoints(
                dir,
                self.config.checkpoint_retention(),
            )?),
            None => Ok(0),
        }
    }

    /// 上传本地文件（可续传）
    pub async fn upload_file(&self, request: UploadRequest) -> Result<UploadReport, UploadError> {
        let mode = request.mode.unwrap_or(self.config.mode);
        let verify_md5 = request.verify_md5.unwrap_or(self.config.verify_md5);
        let remote_key = request.remote_key.as_str();

        let fingerprint = FileFingerprint::of(&request.local_path)?;
        let size = fingerprint.size;

        if size == 0 || size < self.config.small_file_threshold {
            info!(
                "文件小于断点续传阈值，直接上传: {:?} -> {} ({} bytes)",
                request.local_path, remote_key, size
            );
            let data = tokio::fs::read(&request.local_path)
                .await
                .map_err(UploadError::SourceRead)?;
            return self
                .put_small(remote_key, data, request.content_type.as_deref(), verify_md5)
                .await;
        }

        let mut tracker = Tracker {
            remote_key,
            state: UploadState::Idle,
            total_bytes: size,
            progress: self.progress.as_ref(),
        };

        let (part_size, _) = validate_part_size(
            self.config.part_size,
            size,
            self.config.min_part_size,
            self.config.max_part_count,
        )?;

        let mut checkpoint = Checkpoint::create(
            &request.local_path,
            remote_key,
            self.config.checkpoint_dir.as_deref(),
        );

        // ========== Idle -> Initiated ==========
        let mut skipper = None;
        let mut resumed = false;

        if checkpoint.is_resumable() {
            if checkpoint.mode() != mode {
                warn!(
                    "[{}] 检查点模式 {:?} 与本次请求 {:?} 不一致，丢弃检查点",
                    remote_key,
                    checkpoint.mode(),
                    mode
                );
                checkpoint.discard();
            } else if mode.is_ordered() {
                skipper = Some(PartSkipper::from_checkpoint(&checkpoint));
                resumed = true;
            } else {
                match self.reconcile_with_remote(&mut checkpoint).await {
                    Ok(Some(reported)) => {
                        skipper = Some(reported);
                        resumed = true;
                    }
                    Ok(None) => checkpoint.discard(),
                    Err(e) => return Err(tracker.abort(checkpoint.completed_bytes(), e)),
                }
            }
        }

        if !resumed {
            if let Err(e) = self
                .init_session(&mut checkpoint, part_size, size, mode, &request)
                .await
            {
                return Err(tracker.abort(0, e));
            }
        } else {
            info!(
                "[{}] 🔄 从检查点续传: upload_id={}, 已完成 {}/{} 个分片",
                remote_key,
                checkpoint.upload_id(),
                checkpoint.completed_count(),
                checkpoint.parts().len()
            );
        }
        tracker.transition(UploadState::Initiated);
        tracker.publish(ProgressEventType::Started, checkpoint.completed_bytes());

        // ========== Initiated -> Uploading ==========
        let session = Arc::new(UploadSession {
            upload_id: checkpoint.upload_id().to_string(),
            remote_key: remote_key.to_string(),
            part_size: checkpoint.part_size(),
            mode,
        });
        let workers = self.effective_workers(mode);
        let pending = checkpoint.pending_parts().len();
        tracker.transition(UploadState::Uploading);

        let mut source = None;
        let mut uploaded_parts = 0;
        if pending > 0 {
            info!(
                "[{}] 开始上传 {} 个分片 (分片大小: {} bytes, worker: {})",
                remote_key, pending, session.part_size, workers
            );

            let file = match FileSource::open(&request.local_path).await {
                Ok(file) => file,
                Err(e) => {
                    let consumed = checkpoint.completed_bytes();
                    return Err(tracker.abort(consumed, UploadError::SourceRead(e)));
                }
            };

            let skipper = skipper.unwrap_or_else(|| PartSkipper::from_checkpoint(&checkpoint));
            let total_parts = checkpoint.parts().len() as u64;
            let mut persist_failed = false;
            let (result, uploaded) = self
                .upload_parts(file, &session, total_parts, Some(skipper), workers, |part_id| {
                    checkpoint.mark_part_complete(part_id);
                    if let Err(e) = checkpoint.persist() {
                        if !persist_failed {
                            warn!("[{}] 保存检查点失败，本次上传将无法续传: {}", remote_key, e);
                        }
                        persist_failed = true;
                    }
                    tracker.publish(ProgressEventType::Data, checkpoint.completed_bytes());
                })
                .await;
            uploaded_parts = uploaded;

            match result {
                Ok(file) => source = Some(file),
                Err(e) => {
                    let flattened = e.flatten();
                    if flattened
                        .iter()
                        .any(|e| matches!(e, UploadError::Protocol { .. }))
                    {
                        warn!("[{}] 远端拒绝分片，本地与远端状态不一致，丢弃检查点", remote_key);
                        checkpoint.discard();
                    } else if flattened
                        .iter()
                        .any(|e| matches!(e, UploadError::SourceChanged(_)))
                    {
                        warn!("[{}] 上传过程中源文件发生变化，丢弃检查点", remote_key);
                        checkpoint.discard();
                    } else if persist_failed {
                        warn!("[{}] 检查点未能完整保存，续传可能重复上传部分分片", remote_key);
                    }
                    let consumed = checkpoint.completed_bytes();
                    return Err(tracker.abort(consumed, e));
                }
            }
        }

        let remaining = checkpoint.pending_parts().len();
        if remaining > 0 {
            let consumed = checkpoint.completed_bytes();
            return Err(tracker.abort(
                consumed,
                UploadError::TaskFailed(format!("仍有 {} 个分片未确认完成", remaining)),
            ));
        }

        // ========== Uploading -> Completing ==========
        tracker.transition(UploadState::Completing);

        match checkpoint.source_unchanged() {
            Ok(true) => {}
            Ok(false) => {
                checkpoint.discard();
                return Err(tracker.abort(
                    0,
                    UploadError::SourceChanged(format!("{:?}", request.local_path)),
                ));
            }
            Err(e) => {
                checkpoint.discard();
                return Err(tracker.abort(0, UploadError::SourceRead(e)));
            }
        }

        let content_md5 = if verify_md5 {
            let digest = match source.as_mut() {
                Some(file) => md5_reader(file, 0).await,
                None => md5_file(&request.local_path).await,
            };
            match digest {
                Ok(digest) => Some(digest),
                Err(e) => {
                    let consumed = checkpoint.completed_bytes();
                    return Err(tracker.abort(consumed, UploadError::SourceRead(e)));
                }
            }
        } else {
            None
        };

        if let Err(e) = self.complete(&session, content_md5.as_deref()).await {
            return Err(tracker.abort(checkpoint.completed_bytes(), e));
        }

        // ========== Completing -> Done ==========
        checkpoint.remove();
        tracker.transition(UploadState::Done);
        tracker.publish(ProgressEventType::Completed, size);

        info!(
            "[{}] ✓ 上传完成: {} bytes, {} 个分片（本次上传 {} 个）",
            remote_key,
            size,
            checkpoint.parts().len(),
            uploaded_parts
        );

        Ok(UploadReport {
            remote_key: remote_key.to_string(),
            upload_id: Some(session.upload_id.clone()),
            multipart: true,
            resumed,
            total_parts: checkpoint.parts().len() as u64,
            uploaded_parts,
            total_bytes: size,
            content_md5,
            state: tracker.state,
        })
    }

    /// 上传任意可 seek 的数据源（不可续传）
    ///
    /// 长度由 `LengthKnown` 提供；长度未知的数据源无法决定分片数，直接报错
    pub async fn upload_reader<R: UploadSource>(
        &self,
        mut reader: R,
        remote_key: &str,
        content_type: Option<&str>,
    ) -> Result<UploadReport, UploadError> {
        let size = reader.length_known().ok_or_else(|| {
            UploadError::Config(format!("数据源长度未知，无法上传到 {}", remote_key))
        })?;
        // 从当前游标开始上传，MD5 也从这里算起
        let start = reader
            .stream_position()
            .await
            .map_err(UploadError::SourceRead)?;

        if size == 0 || size < self.config.small_file_threshold {
            let mut data = Vec::with_capacity(size as usize);
            reader
                .read_to_end(&mut data)
                .await
                .map_err(UploadError::SourceRead)?;
            return self
                .put_small(remote_key, data, content_type, self.config.verify_md5)
                .await;
        }

        let mode = self.config.mode;
        let mut tracker = Tracker {
            remote_key,
            state: UploadState::Idle,
            total_bytes: size,
            progress: self.progress.as_ref(),
        };

        let (part_size, _) = validate_part_size(
            self.config.part_size,
            size,
            self.config.min_part_size,
            self.config.max_part_count,
        )?;

        let init = InitUploadRequest {
            remote_key: remote_key.to_string(),
            part_size,
            content_length: size,
            content_type: content_type.map(str::to_string),
            mode,
        };
        let result = match with_retry(&self.retry, RemoteOp::InitUpload, None, &self.cancel, || {
            self.backend.init_upload(&init)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => return Err(tracker.abort(0, e)),
        };
        let part_size = if result.part_size == 0 || result.part_size == part_size {
            part_size
        } else {
            match validate_part_size(
                result.part_size,
                size,
                self.config.min_part_size,
                self.config.max_part_count,
            ) {
                Ok((adjusted, _)) => adjusted,
                Err(e) => return Err(tracker.abort(0, e)),
            }
        };
        let total_parts = part_count(size, part_size);
        tracker.transition(UploadState::Initiated);
        tracker.publish(ProgressEventType::Started, 0);

        let session = Arc::new(UploadSession {
            upload_id: result.upload_id,
            remote_key: remote_key.to_string(),
            part_size,
            mode,
        });
        tracker.transition(UploadState::Uploading);

        let mut consumed = 0;
        let (result, uploaded_parts) = self
            .upload_parts(
                reader,
                &session,
                total_parts,
                None,
                self.effective_workers(mode),
                |part_id| {
                    consumed += part_size.min(size.saturating_sub(part_id * part_size));
                    tracker.publish(ProgressEventType::Data, consumed);
                },
            )
            .await;
        let mut reader = match result {
            Ok(reader) => reader,
            Err(e) => return Err(tracker.abort(consumed, e)),
        };

        tracker.transition(UploadState::Completing);
        let content_md5 = if self.config.verify_md5 {
            match md5_reader(&mut reader, start).await {
                Ok(digest) => Some(digest),
                Err(e) => return Err(tracker.abort(consumed, UploadError::SourceRead(e))),
            }
        } else {
            None
        };
        if let Err(e) = self.complete(&session, content_md5.as_deref()).await {
            return Err(tracker.abort(consumed, e));
        }

        tracker.transition(UploadState::Done);
        tracker.publish(ProgressEventType::Completed, size);
        info!("[{}] ✓ 上传完成: {} bytes, {} 个分片", remote_key, size, total_parts);

        Ok(UploadReport {
            remote_key: remote_key.to_string(),
            upload_id: Some(session.upload_id.clone()),
            multipart: true,
            resumed: false,
            total_parts,
            uploaded_parts,
            total_bytes: size,
            content_md5,
            state: tracker.state,
        })
    }

    /// 上传内存数据（不可续传）
    pub async fn upload_bytes(
        &self,
        data: Vec<u8>,
        remote_key: &str,
        content_type: Option<&str>,
    ) -> Result<UploadReport, UploadError> {
        self.upload_reader(Cursor::new(data), remote_key, content_type)
            .await
    }

    /// 顺序模式下远端要求分片严格递增，只能单 worker
    fn effective_workers(&self, mode: UploadMode) -> usize {
        if mode.is_ordered() {
            1
        } else {
            self.config.workers
        }
    }

    /// 单次上传
    async fn put_small(
        &self,
        remote_key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        verify_md5: bool,
    ) -> Result<UploadReport, UploadError> {
        let size = data.len() as u64;
        let mut tracker = Tracker {
            remote_key,
            state: UploadState::Idle,
            total_bytes: size,
            progress: self.progress.as_ref(),
        };
        tracker.publish(ProgressEventType::Started, 0);

        let content_md5 = verify_md5.then(|| format!("{:x}", md5::compute(&data)));

        let result = with_retry(&self.retry, RemoteOp::PutObject, None, &self.cancel, || {
            self.backend.put_object(remote_key, data.clone(), content_type)
        })
        .await;
        if let Err(e) = result {
            return Err(tracker.abort(0, e));
        }

        tracker.transition(UploadState::Done);
        tracker.publish(ProgressEventType::Completed, size);
        info!("[{}] ✓ 单次上传完成: {} bytes", remote_key, size);

        Ok(UploadReport {
            remote_key: remote_key.to_string(),
            upload_id: None,
            multipart: false,
            resumed: false,
            total_parts: 0,
            uploaded_parts: 0,
            total_bytes: size,
            content_md5,
            state: tracker.state,
        })
    }

    /// 新建会话：划分分片、调用 init、立即持久化
    async fn init_session(
        &self,
        checkpoint: &mut Checkpoint,
        part_size: u64,
        size: u64,
        mode: UploadMode,
        request: &UploadRequest,
    ) -> Result<(), UploadError> {
        checkpoint.initialize(part_size)?;

        let init = InitUploadRequest {
            remote_key: request.remote_key.clone(),
            part_size,
            content_length: size,
            content_type: request.content_type.clone(),
            mode,
        };
        let result = with_retry(&self.retry, RemoteOp::InitUpload, None, &self.cancel, || {
            self.backend.init_upload(&init)
        })
        .await?;

        if result.part_size != 0 && result.part_size != part_size {
            warn!(
                "[{}] 远端调整分片大小: {} -> {}",
                request.remote_key, part_size, result.part_size
            );
            let (adjusted, _) = validate_part_size(
                result.part_size,
                size,
                self.config.min_part_size,
                self.config.max_part_count,
            )?;
            checkpoint.initialize(adjusted)?;
        }

        checkpoint.begin_session(result.upload_id, mode);
        if let Err(e) = checkpoint.persist() {
            warn!("[{}] 保存检查点失败，本次上传将无法续传: {}", request.remote_key, e);
        }

        info!(
            "[{}] 初始化分片上传: upload_id={}, 分片数={}",
            request.remote_key,
            checkpoint.upload_id(),
            checkpoint.parts().len()
        );
        Ok(())
    }

    /// 乱序模式续传：以远端报告为准重建完成状态
    ///
    /// 远端没有对应会话或 upload_id 不一致时返回 None（需要重新开始）
    async fn reconcile_with_remote(
        &self,
        checkpoint: &mut Checkpoint,
    ) -> Result<Option<PartSkipper>, UploadError> {
        let remote_key = checkpoint.object_key().to_string();
        let report = match with_retry(&self.retry, RemoteOp::PartsReport, None, &self.cancel, || {
            self.backend.get_remote_parts_report(&remote_key)
        })
        .await
        {
            Ok(report) => report,
            Err(UploadError::Remote { source, .. }) if source.kind == UploadErrorKind::NotFound => {
                warn!("[{}] 远端没有未完成的上传会话，重新开始", remote_key);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if report.upload_id != checkpoint.upload_id() {
            warn!(
                "[{}] 远端会话 {} 与检查点 {} 不一致，重新开始",
                remote_key,
                report.upload_id,
                checkpoint.upload_id()
            );
            return Ok(None);
        }

        let skipper = PartSkipper::new(report.next_part_id, &report.parts);
        let completed = checkpoint.reconcile(&skipper);
        if let Err(e) = checkpoint.persist() {
            warn!("[{}] 保存检查点失败: {}", remote_key, e);
        }
        debug!(
            "[{}] 远端报告: next_part_id={}, 已接收 {} 个分片，核对后完成 {} 个",
            remote_key,
            report.next_part_id,
            skipper.reported_count(),
            completed
        );
        Ok(Some(skipper))
    }

    /// 完成上传（假定远端 complete 幂等，失败原样重试）
    async fn complete(
        &self,
        session: &UploadSession,
        content_md5: Option<&str>,
    ) -> Result<(), UploadError> {
        with_retry(
            &self.retry,
            RemoteOp::CompleteUpload,
            None,
            &self.cancel,
            || self.backend.complete_upload(session, content_md5),
        )
        .await
    }

    /// 并发上传分片
    ///
    /// worker 通过结果通道回报成功的分片，`on_part` 在当前任务中依次执行，
    /// 检查点只在这里被修改。返回数据源（或汇总错误）和本次成功上传的分片数
    async fn upload_parts<S, C>(
        &self,
        source: S,
        session: &Arc<UploadSession>,
        total_parts: u64,
        skipper: Option<PartSkipper>,
        workers: usize,
        mut on_part: C,
    ) -> (Result<S, UploadError>, u64)
    where
        S: AsyncRead + AsyncSeek + Unpin + Send + 'static,
        C: FnMut(u64),
    {
        // 任一分片失败时取消本次运行中的其他重试
        let run_cancel = self.cancel.child_token();
        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<u64>();

        let mut pool = MultipartUploader::new(source, session.part_size, workers)
            .with_part_limit(total_parts)
            .with_cancel_token(run_cancel.clone());
        if let Some(skipper) = skipper {
            pool = pool.with_skipper(skipper);
        }

        let backend = self.backend.clone();
        let session = session.clone();
        let policy = self.retry;
        let upload = move |payload: PartPayload| {
            let backend = backend.clone();
            let session = session.clone();
            let results_tx = results_tx.clone();
            let cancel = run_cancel.clone();

            async move {
                let part_id = payload.part_id;
                let result = with_retry(&policy, RemoteOp::UploadPart, Some(part_id), &cancel, || {
                    backend.upload_part(&session, part_id, &payload.data)
                })
                .await;

                match result {
                    Ok(()) => {
                        debug!("[分片#{}] ✓ 上传成功 ({} bytes)", part_id, payload.data.len());
                        let _ = results_tx.send(part_id);
                        Ok(())
                    }
                    Err(e) => {
                        cancel.cancel();
                        Err(e)
                    }
                }
            }
        };

        let consume = async {
            let mut uploaded = 0;
            while let Some(part_id) = results_rx.recv().await {
                on_part(part_id);
                uploaded += 1;
            }
            uploaded
        };

        tokio::join!(pool.run(upload), consume)
    }
}
