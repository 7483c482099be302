// 上传数据源
//
// 分片生产者需要可读可 seek 的数据源；编排器还需要知道数据长度来决定是否走分片上传

use md5::Context as Md5Context;
use std::io::{self, Cursor, Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, ReadBuf};
use tracing::debug;

/// 哈希计算缓冲区: 64KB
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// 能否预先得知数据长度
pub trait LengthKnown {
    /// 从当前位置起剩余的数据长度，未知时返回 None
    fn length_known(&self) -> Option<u64>;
}

/// 上传数据源
pub trait UploadSource: AsyncRead + AsyncSeek + LengthKnown + Unpin + Send + 'static {}

impl<T> UploadSource for T where T: AsyncRead + AsyncSeek + LengthKnown + Unpin + Send + 'static {}

impl<T: AsRef<[u8]>> LengthKnown for Cursor<T> {
    fn length_known(&self) -> Option<u64> {
        let len = self.get_ref().as_ref().len() as u64;
        Some(len.saturating_sub(self.position()))
    }
}

/// 本地文件数据源
///
/// 打开时记录文件大小，之后的长度查询不再访问文件系统。
/// 长度按游标位于文件开头计算
#[derive(Debug)]
pub struct FileSource {
    file: File,
    path: PathBuf,
    len: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok(Self { file, path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LengthKnown for FileSource {
    fn length_known(&self) -> Option<u64> {
        Some(self.len)
    }
}

impl AsyncRead for FileSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl AsyncSeek for FileSource {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.file).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.file).poll_complete(cx)
    }
}

/// 计算文件 MD5（十六进制）
pub async fn md5_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();

    // 在阻塞线程池中执行文件 I/O
    tokio::task::spawn_blocking(move || md5_file_sync(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("计算 MD5 任务执行失败: {}", e)))?
}

fn md5_file_sync(path: &Path) -> io::Result<String> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Md5Context::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.consume(&buffer[..bytes_read]);
    }

    let digest = format!("{:x}", hasher.compute());
    debug!("文件 MD5 计算完成: path={:?}, md5={}", path, digest);
    Ok(digest)
}

/// 从 start 处重读数据源计算 MD5，结束后游标停在末尾
pub async fn md5_reader<R>(reader: &mut R, start: u64) -> io::Result<String>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    reader.seek(SeekFrom::Start(start)).await?;

    let mut hasher = Md5Context::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.consume(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.compute()))
}
