// 分片生产者 + 上传 worker 池
//
// 生产者顺序读取数据源，切成固定大小的分片放入有界队列；
// W 个 worker 从队列取分片并调用上传函数。
//
// - 队列容量等于 worker 数，读取速度不会远超上传速度
// - 任一 worker 失败即取消生产者和其他 worker，不再入队/出队
// - 所有 worker 退出后才汇总结果，返回全部错误而不只是第一个

use std::future::Future;
use std::io::SeekFrom;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::UploadError;
use crate::uploader::skipper::PartSkipper;

/// 队列中的分片（数据归 worker 独占，不共享文件游标）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPayload {
    pub part_id: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

/// 并发分片上传器
pub struct MultipartUploader<S> {
    source: S,
    part_size: u64,
    workers: usize,
    part_limit: Option<u64>,
    skipper: Option<PartSkipper>,
    cancel: CancellationToken,
}

type SharedErrors = Arc<Mutex<Vec<UploadError>>>;

impl<S> MultipartUploader<S>
where
    S: AsyncRead + AsyncSeek + Unpin + Send + 'static,
{
    pub fn new(source: S, part_size: u64, workers: usize) -> Self {
        Self {
            source,
            part_size: part_size.max(1),
            workers: workers.max(1),
            part_limit: None,
            skipper: None,
            cancel: CancellationToken::new(),
        }
    }

    /// 预期的分片总数，生产者不会产生超出范围的分片 ID
    pub fn with_part_limit(mut self, total_parts: u64) -> Self {
        self.part_limit = Some(total_parts);
        self
    }

    /// 设置跳过器，已完成的分片不再入队
    pub fn with_skipper(mut self, skipper: PartSkipper) -> Self {
        self.skipper = Some(skipper);
        self
    }

    /// 外部取消令牌
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 运行生产者和 worker，直到数据源读完或出错
    ///
    /// 成功时归还数据源（游标位于末尾）
    pub async fn run<F, Fut>(self, upload: F) -> Result<S, UploadError>
    where
        F: Fn(PartPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), UploadError>> + Send + 'static,
    {
        let MultipartUploader {
            source,
            part_size,
            workers,
            part_limit,
            skipper,
            cancel: external,
        } = self;

        // 内部失败只取消本次运行，不影响调用方的令牌
        let cancel = external.child_token();
        let errors: SharedErrors = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel::<PartPayload>(workers);

        let producer = tokio::spawn(produce(
            source,
            part_size,
            part_limit,
            skipper,
            tx,
            cancel.clone(),
            errors.clone(),
        ));

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let upload = Arc::new(upload);
        let mut set = JoinSet::new();

        for worker_id in 0..workers {
            let rx = rx.clone();
            let upload = upload.clone();
            let cancel = cancel.clone();
            let errors = errors.clone();

            set.spawn(async move {
                loop {
                    let payload = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            payload = rx.recv() => payload,
                        }
                    };
                    let Some(payload) = payload else {
                        break;
                    };
                    if cancel.is_cancelled() {
                        break;
                    }

                    let part_id = payload.part_id;
                    debug!("[worker#{}] 开始上传分片 #{}", worker_id, part_id);

                    if let Err(e) = (*upload)(payload).await {
                        if !matches!(e, UploadError::Cancelled) {
                            error!("[worker#{}] 分片 #{} 上传失败: {}", worker_id, part_id, e);
                            errors.lock().push(e);
                        }
                        cancel.cancel();
                        break;
                    }
                }
            });
        }
        drop(rx);

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("上传 worker 异常退出: {}", e);
                errors.lock().push(UploadError::TaskFailed(e.to_string()));
                cancel.cancel();
            }
        }

        let source = match producer.await {
            Ok(source) => source,
            Err(e) => {
                error!("分片生产者异常退出: {}", e);
                errors.lock().push(UploadError::TaskFailed(e.to_string()));
                None
            }
        };

        let errors = std::mem::take(&mut *errors.lock());
        if let Some(err) = UploadError::join(errors) {
            return Err(err);
        }
        if external.is_cancelled() {
            warn!("分片上传已取消");
            return Err(UploadError::Cancelled);
        }

        source.ok_or_else(|| UploadError::TaskFailed("分片生产者未返回数据源".to_string()))
    }
}

/// 生产者：读取分片并入队
///
/// 读到末尾时关闭队列（drop tx）；读取失败时记录错误并取消。
/// 设置了分片数上限时，数据源长度与上限不符视为数据源已变化
async fn produce<S>(
    mut source: S,
    part_size: u64,
    part_limit: Option<u64>,
    skipper: Option<PartSkipper>,
    tx: mpsc::Sender<PartPayload>,
    cancel: CancellationToken,
    errors: SharedErrors,
) -> Option<S>
where
    S: AsyncRead + AsyncSeek + Unpin,
{
    let fail = |err: UploadError| {
        errors.lock().push(err);
        cancel.cancel();
    };

    // 跳过已经上传的前一部分
    let mut part_id = 0;
    if let Some(skipper) = &skipper {
        part_id = skipper.first_missing_part_id();
        if part_id > 0 {
            let skip = part_id.saturating_mul(part_size);
            debug!("从分片 #{} 开始读取，跳过 {} bytes", part_id, skip);
            if let Err(e) = source.seek(SeekFrom::Current(skip as i64)).await {
                fail(UploadError::SourceRead(e));
                return None;
            }
        }
    }

    loop {
        if cancel.is_cancelled() {
            return Some(source);
        }

        if let Some(limit) = part_limit.filter(|limit| part_id >= *limit) {
            let mut extra = [0u8; 1];
            return match source.read(&mut extra).await {
                Ok(0) => Some(source),
                Ok(_) => {
                    error!("数据源长度超出预期的 {} 个分片", limit);
                    fail(UploadError::SourceChanged(format!(
                        "数据源长度超出预期的 {} 个分片",
                        limit
                    )));
                    None
                }
                Err(e) => {
                    fail(UploadError::SourceRead(e));
                    None
                }
            };
        }

        // 远端已有的分片只移动游标
        if skipper.as_ref().is_some_and(|s| s.is_skippable(part_id)) {
            debug!("跳过已上传的分片 #{}", part_id);
            if let Err(e) = source.seek(SeekFrom::Current(part_size as i64)).await {
                fail(UploadError::SourceRead(e));
                return None;
            }
            part_id += 1;
            continue;
        }

        let mut data = Vec::with_capacity(part_size as usize);
        if let Err(e) = (&mut source).take(part_size).read_to_end(&mut data).await {
            error!("读取分片 #{} 失败: {}", part_id, e);
            fail(UploadError::SourceRead(e));
            return None;
        }
        if data.is_empty() {
            if let Some(limit) = part_limit {
                warn!("数据源在分片 #{} 处提前结束（预期 {} 个分片）", part_id, limit);
                fail(UploadError::SourceChanged(format!(
                    "数据源在分片 #{} 处提前结束，预期 {} 个分片",
                    part_id, limit
                )));
                return None;
            }
            return Some(source);
        }

        let payload = PartPayload {
            part_id,
            offset: part_id * part_size,
            data,
        };

        tokio::select! {
            _ = cancel.cancelled() => return Some(source),
            sent = tx.send(payload) => {
                if sent.is_err() {
                    // 所有 worker 都已退出
                    return Some(source);
                }
            }
        }
        part_id += 1;
    }
}
