//! 统一的 API 错误类型与转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::chunk_store::ChunkError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// 分片摘要不符，上传端应重传该分片。
    DigestMismatch(u32),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::DigestMismatch(index) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("digest mismatch for chunk {index}, please resend it"),
            )
                .into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<ChunkError> for ApiError {
    fn from(error: ChunkError) -> Self {
        match error {
            ChunkError::DigestMismatch { index, .. } => ApiError::DigestMismatch(index),
            ChunkError::Incomplete { .. } | ChunkError::MissingChunk { .. } => {
                ApiError::Conflict(error.to_string())
            }
            ChunkError::StorageWriteFailure { .. } | ChunkError::StorageReadFailure { .. } => {
                ApiError::Internal(error.to_string())
            }
            ChunkError::InvalidAssemblyId(_)
            | ChunkError::EmptyPayload { .. }
            | ChunkError::InvalidTotal { .. }
            | ChunkError::IndexOutOfRange { .. }
            | ChunkError::TotalMismatch { .. } => ApiError::BadRequest(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn chunk_errors_map_to_status_codes() {
        let cases = [
            (
                ChunkError::DigestMismatch {
                    index: 3,
                    expected: "a".into(),
                    actual: "b".into(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ChunkError::EmptyPayload { index: 1 },
                StatusCode::BAD_REQUEST,
            ),
            (
                ChunkError::TotalMismatch {
                    expected: 2,
                    got: 3,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                ChunkError::Incomplete {
                    present: 1,
                    total: 2,
                },
                StatusCode::CONFLICT,
            ),
            (
                ChunkError::StorageWriteFailure {
                    path: PathBuf::from("a.bin.part1"),
                    source: io::Error::other("disk full"),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            let response = ApiError::from(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
