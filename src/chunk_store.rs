//! 分片持久化：摘要校验、按序定位、合并写出与清理。
//!
//! 分片与合并结果位于同一根目录：分片为 `{assembly}.part{index}`，
//! 合并结果为 `{assembly}`。写入都先落到同目录的点前缀临时文件，
//! 再原子重命名，因此并发写入不同分片无需共享锁。

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::atomic::{AtomicFile, is_temp_name};
use crate::digest::DigestAlgorithm;

const PART_SEPARATOR: &str = ".part";
const MAX_ASSEMBLY_ID_LEN: usize = 200;

/// 分片与合并过程中的错误。
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("invalid assembly name {0:?}")]
    InvalidAssemblyId(String),
    #[error("chunk {index} is empty")]
    EmptyPayload { index: u32 },
    #[error("total chunk count {total} is invalid")]
    InvalidTotal { total: u32 },
    #[error("chunk index {index} is outside 1..={total}")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("declared total {got} does not match the assembly total {expected}")]
    TotalMismatch { expected: u32, got: u32 },
    #[error("digest mismatch for chunk {index}: expected {expected}, computed {actual}")]
    DigestMismatch {
        index: u32,
        expected: String,
        actual: String,
    },
    #[error("chunk {index} is missing")]
    MissingChunk { index: u32 },
    #[error("assembly has {present} of {total} chunks")]
    Incomplete { present: u32, total: u32 },
    #[error("failed to write {}: {source}", path.display())]
    StorageWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {}: {source}", path.display())]
    StorageReadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ChunkError {
    fn write(path: &Path, source: io::Error) -> Self {
        ChunkError::StorageWriteFailure {
            path: path.to_path_buf(),
            source,
        }
    }

    fn read(path: &Path, source: io::Error) -> Self {
        ChunkError::StorageReadFailure {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// 经过校验、可直接作为存储文件名的装配标识（原始文件名）。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssemblyId(String);

impl AssemblyId {
    /// 校验上传端提供的文件名。
    ///
    /// 只接受单级文件名：不含路径分隔符与控制字符、不以 `.` 开头
    /// （临时文件占用该前缀）、也不以 `.part{n}` 结尾（会与分片名冲突）。
    pub fn parse(name: &str) -> Result<Self, ChunkError> {
        let trimmed = name.trim();
        let invalid = || ChunkError::InvalidAssemblyId(name.to_string());
        if trimmed.is_empty() || trimmed.len() > MAX_ASSEMBLY_ID_LEN {
            return Err(invalid());
        }
        if trimmed.starts_with('.')
            || trimmed
                .chars()
                .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control())
        {
            return Err(invalid());
        }
        if let Some((_, suffix)) = trimmed.rsplit_once(PART_SEPARATOR)
            && !suffix.is_empty()
            && suffix.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssemblyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
    algorithm: DigestAlgorithm,
}

impl ChunkStore {
    pub fn new(root: PathBuf, algorithm: DigestAlgorithm) -> Self {
        Self { root, algorithm }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn chunk_path(&self, id: &AssemblyId, index: u32) -> PathBuf {
        self.root.join(format!("{id}{PART_SEPARATOR}{index}"))
    }

    pub fn merged_path(&self, id: &AssemblyId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// 校验摘要后持久化分片，同一序号重复上传时覆盖旧分片。
    pub async fn put(
        &self,
        id: &AssemblyId,
        index: u32,
        payload: &[u8],
        expected_digest: &str,
    ) -> Result<(), ChunkError> {
        if payload.is_empty() {
            return Err(ChunkError::EmptyPayload { index });
        }
        if let Err(actual) = self.algorithm.verify(payload, expected_digest) {
            warn!(
                assembly = %id,
                index,
                expected = expected_digest.trim(),
                actual,
                "chunk digest mismatch"
            );
            return Err(ChunkError::DigestMismatch {
                index,
                expected: expected_digest.trim().to_string(),
                actual,
            });
        }

        let path = self.chunk_path(id, index);
        let mut atomic = AtomicFile::new(&path)
            .await
            .map_err(|err| ChunkError::write(&path, err))?;
        if let Err(err) = atomic.file_mut().write_all(payload).await {
            atomic.cleanup().await;
            return Err(ChunkError::write(&path, err));
        }
        atomic
            .finalize()
            .await
            .map_err(|err| ChunkError::write(&path, err))?;

        debug!(assembly = %id, index, bytes = payload.len(), "chunk stored");
        Ok(())
    }

    /// 统计目录中实际存在的 `1..=total` 分片数量。
    pub async fn present_count(&self, id: &AssemblyId, total: u32) -> Result<u32, ChunkError> {
        let indices = self.chunk_indices(id).await?;
        Ok(indices.into_iter().filter(|&index| index <= total).count() as u32)
    }

    /// 目录中是否还有该装配的任何分片（不限序号范围）。
    pub async fn has_chunks(&self, id: &AssemblyId) -> Result<bool, ChunkError> {
        Ok(!self.chunk_indices(id).await?.is_empty())
    }

    async fn chunk_indices(&self, id: &AssemblyId) -> Result<Vec<u32>, ChunkError> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|err| ChunkError::read(&self.root, err))?;
        let mut indices = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| ChunkError::read(&self.root, err))?
        {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some((base, index)) = parse_chunk_name(&file_name) else {
                continue;
            };
            if base != id.as_str() {
                continue;
            }
            match entry.file_type().await {
                Ok(file_type) if file_type.is_file() => indices.push(index),
                Ok(_) => {}
                Err(err) => return Err(ChunkError::read(&entry.path(), err)),
            }
        }
        Ok(indices)
    }

    /// 按序号升序定位全部分片，遇到第一个缺失的序号立即失败。
    pub async fn locate_all_in_order(
        &self,
        id: &AssemblyId,
        total: u32,
    ) -> Result<Vec<PathBuf>, ChunkError> {
        let mut parts = Vec::with_capacity(total as usize);
        for index in 1..=total {
            let path = self.chunk_path(id, index);
            match fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => parts.push(path),
                Ok(_) => return Err(ChunkError::MissingChunk { index }),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(ChunkError::MissingChunk { index });
                }
                Err(err) => return Err(ChunkError::read(&path, err)),
            }
        }
        Ok(parts)
    }

    /// 按序拼接全部分片写入 `destination`，返回写入字节数。
    ///
    /// 失败时目标路径保持原状，临时文件被清理。
    pub async fn merge_into(
        &self,
        id: &AssemblyId,
        total: u32,
        destination: &Path,
    ) -> Result<u64, ChunkError> {
        let parts = self.locate_all_in_order(id, total).await?;
        let mut atomic = AtomicFile::new(destination)
            .await
            .map_err(|err| ChunkError::write(destination, err))?;

        let write_result: Result<u64, ChunkError> = async {
            let mut total_written: u64 = 0;
            for (offset, path) in parts.iter().enumerate() {
                let mut part_file = match File::open(path).await {
                    Ok(file) => file,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        return Err(ChunkError::MissingChunk {
                            index: offset as u32 + 1,
                        });
                    }
                    Err(err) => return Err(ChunkError::read(path, err)),
                };
                total_written += tokio::io::copy(&mut part_file, atomic.file_mut())
                    .await
                    .map_err(|err| ChunkError::write(destination, err))?;
            }
            Ok(total_written)
        }
        .await;

        let total_written = match write_result {
            Ok(value) => value,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err);
            }
        };
        atomic
            .finalize()
            .await
            .map_err(|err| ChunkError::write(destination, err))?;
        Ok(total_written)
    }

    /// 尽力删除 `1..=total` 的分片，单个失败只记录日志，返回实际删除数量。
    pub async fn delete_all(&self, id: &AssemblyId, total: u32) -> u32 {
        let mut deleted = 0;
        for index in 1..=total {
            let path = self.chunk_path(id, index);
            match fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(assembly = %id, index, "chunk already removed");
                }
                Err(err) => {
                    warn!(assembly = %id, index, error = %err, "failed to remove chunk");
                }
            }
        }
        deleted
    }

    /// 删除单个分片，返回分片是否存在。
    pub async fn remove_chunk(&self, id: &AssemblyId, index: u32) -> Result<bool, ChunkError> {
        let path = self.chunk_path(id, index);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ChunkError::write(&path, err)),
        }
    }

    pub async fn merged_exists(&self, id: &AssemblyId) -> Result<bool, ChunkError> {
        let path = self.merged_path(id);
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(ChunkError::read(&path, err)),
        }
    }

    /// 清理崩溃遗留的过期临时文件。
    pub async fn cleanup_stale_temp_files(&self, ttl: Duration) -> io::Result<u32> {
        if ttl.is_zero() || fs::metadata(&self.root).await.is_err() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !is_temp_name(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age >= ttl {
                let path = entry.path();
                if let Err(err) = fs::remove_file(&path).await {
                    warn!(path = ?path, error = %err, "failed to remove stale temp file");
                } else {
                    info!(path = ?path, "removed stale temp file");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// 回收被放弃的上传：某个装配最新分片的修改时间早于 `ttl` 时删除它的全部分片。
    pub async fn cleanup_stale_chunks(&self, ttl: Duration) -> io::Result<u32> {
        if ttl.is_zero() || fs::metadata(&self.root).await.is_err() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut assemblies: HashMap<String, (SystemTime, Vec<PathBuf>)> = HashMap::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some((base, _)) = parse_chunk_name(&file_name) else {
                continue;
            };
            if AssemblyId::parse(base).is_err() {
                continue;
            }
            // 合并任务可能刚删掉该文件
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let (newest, paths) = assemblies
                .entry(base.to_string())
                .or_insert((modified, Vec::new()));
            *newest = (*newest).max(modified);
            paths.push(entry.path());
        }

        let mut removed = 0;
        for (assembly, (newest, paths)) in assemblies {
            let Ok(age) = now.duration_since(newest) else {
                continue;
            };
            if age < ttl {
                continue;
            }
            for path in paths {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(path = ?path, error = %err, "failed to remove abandoned chunk");
                    }
                }
            }
            info!(assembly = assembly.as_str(), "removed abandoned chunks");
        }
        Ok(removed)
    }
}

/// 拆分 `{assembly}.part{index}`，只接受规范的十进制序号（"01"、"0" 不算）。
fn parse_chunk_name(file_name: &str) -> Option<(&str, u32)> {
    let (base, suffix) = file_name.rsplit_once(PART_SEPARATOR)?;
    let index = suffix.parse::<u32>().ok()?;
    if base.is_empty() || index == 0 || index.to_string() != suffix {
        return None;
    }
    Some((base, index))
}
