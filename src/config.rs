//! CLI arguments and upload defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::time::Duration;

use crate::build;
use crate::digest::DigestAlgorithm;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNKS: u32 = 8192;
pub const DEFAULT_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const MAINTENANCE_INTERVAL_SECS: u64 = 900;
/// 多段表单中除分片外的字段与边界开销。
pub const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-upload", version = VERSION_INFO, about = "AxoUpload chunk assembly server")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "AXO_UPLOAD_DIR",
        default_value = ".axo/uploads",
        help = "Directory holding chunks and merged files"
    )]
    pub upload_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_LOG",
        default_value = "info",
        help = "Log filter used when RUST_LOG is unset"
    )]
    pub log_filter: String,
    #[arg(
        long,
        env = "AXO_DIGEST",
        value_enum,
        default_value_t = DigestAlgorithm::Md5,
        help = "Digest algorithm uploaders use for chunk checksums"
    )]
    pub digest: DigestAlgorithm,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max size of a single chunk in bytes"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_MAX_CHUNKS,
        help = "Max chunks per file (0 to disable)"
    )]
    pub max_chunks: u32,
    #[arg(
        long,
        env = "AXO_UPLOAD_REPLACE_EXISTING",
        help = "Replace an existing merged file instead of skipping the merge"
    )]
    pub replace_existing: bool,
    #[arg(
        long,
        env = "AXO_UPLOAD_TEMP_TTL_SECS",
        default_value_t = DEFAULT_TEMP_TTL_SECS,
        help = "Age after which orphaned temp files and finished statuses are pruned (0 to disable)"
    )]
    pub temp_ttl_secs: u64,
}

/// 上传与合并策略。
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_chunk_size: u64,
    pub max_chunks: u32,
    pub replace_existing: bool,
    pub temp_ttl: Duration,
}

impl From<&Args> for UploadConfig {
    fn from(args: &Args) -> Self {
        Self {
            max_chunk_size: args.max_chunk_size,
            max_chunks: args.max_chunks,
            replace_existing: args.replace_existing,
            temp_ttl: Duration::from_secs(args.temp_ttl_secs),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_chunks: DEFAULT_MAX_CHUNKS,
            replace_existing: false,
            temp_ttl: Duration::from_secs(DEFAULT_TEMP_TTL_SECS),
        }
    }
}
