//! Verified file duplication.
//!
//! Large files go through `tokio::fs::copy`, which delegates to the kernel
//! (`copy_file_range`/`sendfile` on Linux, clonefile on macOS). Small files and
//! fast-path failures stream through fixed-size user-space chunks.

use crate::domain::DomainError;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeroCopyConfig {
    pub fast_path_enabled: bool,
    /// Sources smaller than this skip the kernel path.
    pub min_fast_path_bytes: u64,
    pub chunk_size: usize,
}

impl Default for ZeroCopyConfig {
    fn default() -> Self {
        Self {
            fast_path_enabled: true,
            min_fast_path_bytes: 10 * MB,
            chunk_size: (64 * MB) as usize,
        }
    }
}

#[derive(Debug, Default)]
struct ZeroCopyCounters {
    bytes_copied: AtomicU64,
    fast_path_copies: AtomicU64,
    buffered_copies: AtomicU64,
    fast_path_fallbacks: AtomicU64,
    verification_failures: AtomicU64,
    failures: AtomicU64,
    elapsed_micros: AtomicU64,
}

/// Point-in-time copy of the transfer counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ZeroCopyStats {
    pub bytes_copied: u64,
    pub fast_path_copies: u64,
    pub buffered_copies: u64,
    pub fast_path_fallbacks: u64,
    pub verification_failures: u64,
    pub failures: u64,
    pub throughput_mb_s: f64,
}

pub struct ZeroCopyTransfer {
    config: ZeroCopyConfig,
    counters: ZeroCopyCounters,
}

impl ZeroCopyTransfer {
    pub fn new(config: ZeroCopyConfig) -> Self {
        Self {
            config,
            counters: ZeroCopyCounters::default(),
        }
    }

    /// Copy `src` to `dst`, replacing any existing destination. Returns bytes written.
    ///
    /// With `verify`, a destination whose size differs from the source is an error.
    pub async fn copy(&self, src: &Path, dst: &Path, verify: bool) -> Result<u64, DomainError> {
        let started = Instant::now();
        let result = self.copy_inner(src, dst, verify).await;
        let c = &self.counters;
        match &result {
            Ok(bytes) => {
                c.bytes_copied.fetch_add(*bytes, Ordering::Relaxed);
                c.elapsed_micros
                    .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                c.failures.fetch_add(1, Ordering::Relaxed);
                warn!(src = %src.display(), dst = %dst.display(), error = %e, "copy failed");
            }
        }
        result
    }

    async fn copy_inner(&self, src: &Path, dst: &Path, verify: bool) -> Result<u64, DomainError> {
        let meta = fs::metadata(src)
            .await
            .map_err(|e| DomainError::Transfer(format!("stat {}: {}", src.display(), e)))?;
        if !meta.is_file() {
            return Err(DomainError::Transfer(format!(
                "{} is not a regular file",
                src.display()
            )));
        }
        let size = meta.len();
        if same_file(src, dst).await {
            return Err(DomainError::Transfer(format!(
                "{} and {} are the same file",
                src.display(),
                dst.display()
            )));
        }

        if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::Transfer(format!("create {}: {}", parent.display(), e)))?;
        }
        remove_if_exists(dst).await?;

        let fast = self.config.fast_path_enabled && size >= self.config.min_fast_path_bytes;
        let copied = if fast {
            match fs::copy(src, dst).await {
                Ok(n) => {
                    self.counters.fast_path_copies.fetch_add(1, Ordering::Relaxed);
                    n
                }
                Err(e) => {
                    warn!(src = %src.display(), error = %e, "fast path failed, retrying buffered");
                    self.counters
                        .fast_path_fallbacks
                        .fetch_add(1, Ordering::Relaxed);
                    remove_if_exists(dst).await?;
                    self.buffered_copy(src, dst, size).await?
                }
            }
        } else {
            self.buffered_copy(src, dst, size).await?
        };

        if verify {
            let actual = fs::metadata(dst)
                .await
                .map_err(|e| DomainError::Transfer(format!("stat {}: {}", dst.display(), e)))?
                .len();
            if actual != size {
                self.counters
                    .verification_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(DomainError::SizeMismatch {
                    expected: size,
                    actual,
                });
            }
        }
        debug!(src = %src.display(), dst = %dst.display(), bytes = copied, fast, "copied");
        Ok(copied)
    }

    async fn buffered_copy(&self, src: &Path, dst: &Path, size_hint: u64) -> Result<u64, DomainError> {
        let io = |what: &str, p: &Path, e: std::io::Error| {
            DomainError::Transfer(format!("{} {}: {}", what, p.display(), e))
        };
        let mut reader = fs::File::open(src).await.map_err(|e| io("open", src, e))?;
        let mut writer = fs::File::create(dst).await.map_err(|e| io("create", dst, e))?;
        let buf_len = (size_hint.clamp(1, self.config.chunk_size.max(1) as u64)) as usize;
        let mut buf = vec![0u8; buf_len];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(|e| io("read", src, e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| io("write", dst, e))?;
            total += n as u64;
        }
        writer.flush().await.map_err(|e| io("flush", dst, e))?;
        writer.sync_all().await.map_err(|e| io("sync", dst, e))?;
        self.counters.buffered_copies.fetch_add(1, Ordering::Relaxed);
        Ok(total)
    }

    pub fn stats(&self) -> ZeroCopyStats {
        let c = &self.counters;
        let bytes = c.bytes_copied.load(Ordering::Relaxed);
        let micros = c.elapsed_micros.load(Ordering::Relaxed);
        ZeroCopyStats {
            bytes_copied: bytes,
            fast_path_copies: c.fast_path_copies.load(Ordering::Relaxed),
            buffered_copies: c.buffered_copies.load(Ordering::Relaxed),
            fast_path_fallbacks: c.fast_path_fallbacks.load(Ordering::Relaxed),
            verification_failures: c.verification_failures.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            throughput_mb_s: if micros == 0 {
                0.0
            } else {
                (bytes as f64 / MB as f64) / (micros as f64 / 1_000_000.0)
            },
        }
    }
}

impl Default for ZeroCopyTransfer {
    fn default() -> Self {
        Self::new(ZeroCopyConfig::default())
    }
}

async fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a).await, fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), DomainError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DomainError::Transfer(format!(
            "remove existing {}: {}",
            path.display(),
            e
        ))),
    }
}
