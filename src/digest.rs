//! 分片内容摘要计算与校验。

use clap::ValueEnum;
use md5::Md5;
use sha2::{Digest, Sha256};

/// 上传端声明分片摘要时使用的算法。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum DigestAlgorithm {
    /// 与旧版上传客户端保持一致的 MD5 十六进制摘要。
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// 计算负载的小写十六进制摘要。
    pub fn hex_digest(self, payload: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 => hex::encode(Md5::digest(payload)),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(payload)),
        }
    }

    /// 校验声明的摘要，忽略大小写与首尾空白。
    ///
    /// 返回实际计算出的摘要，便于调用方记录日志。
    pub fn verify(self, payload: &[u8], expected: &str) -> Result<(), String> {
        let actual = self.hex_digest(payload);
        if actual.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(actual)
        }
    }
}
