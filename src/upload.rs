//! 分片上传处理器：表单与流式两种入口、状态查询与显式合并。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Multipart, Query};
use axum::extract::multipart::MultipartError;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json as JsonResponse;
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::assembly::{AssemblyCoordinator, AssemblyStatus, ChunkReceipt};
use crate::config::UploadConfig;
use crate::error::ApiError;

/// 流式上传时携带分片摘要的请求头。
pub const CHUNK_DIGEST_HEADER: &str = "X-Chunk-Digest";

#[derive(Deserialize)]
pub(crate) struct UploadChunkQuery {
    name: String,
    index: u32,
    total: u32,
}

#[derive(Deserialize)]
pub(crate) struct StatusQuery {
    name: String,
}

#[derive(Deserialize)]
pub(crate) struct MergeRequest {
    name: String,
    total: u32,
}

/// 表单上传：`file`、`md5`（或 `digest`）、`chunkNumber`、`totalChunks`。
pub async fn upload_form(
    Extension(coordinator): Extension<Arc<AssemblyCoordinator>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, JsonResponse<ChunkReceipt>), ApiError> {
    let mut name: Option<String> = None;
    let mut payload = None;
    let mut digest = None;
    let mut index = None;
    let mut total = None;

    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" => {
                if let Some(file_name) = field.file_name() {
                    name = Some(file_name.to_string());
                }
                let bytes = field.bytes().await.map_err(form_error)?;
                if bytes.len() as u64 > upload.max_chunk_size {
                    return Err(ApiError::BadRequest("chunk too large".into()));
                }
                payload = Some(bytes);
            }
            "fileName" if name.is_none() => {
                name = Some(field.text().await.map_err(form_error)?);
            }
            "md5" | "digest" => digest = Some(field.text().await.map_err(form_error)?),
            "chunkNumber" => {
                let value = field.text().await.map_err(form_error)?;
                index = Some(parse_number(&value, "chunkNumber")?);
            }
            "totalChunks" => {
                let value = field.text().await.map_err(form_error)?;
                total = Some(parse_number(&value, "totalChunks")?);
            }
            _ => debug!(field = field_name, "ignoring unknown form field"),
        }
    }

    let name = name.ok_or_else(|| ApiError::BadRequest("file name is required".into()))?;
    let payload = payload.ok_or_else(|| ApiError::BadRequest("file is required".into()))?;
    let digest = digest.ok_or_else(|| ApiError::BadRequest("md5 is required".into()))?;
    let index = index.ok_or_else(|| ApiError::BadRequest("chunkNumber is required".into()))?;
    let total = total.ok_or_else(|| ApiError::BadRequest("totalChunks is required".into()))?;

    info!(name, index, total, bytes = payload.len(), "chunk upload");
    let receipt = coordinator
        .accept_chunk(&name, index, total, &payload, &digest)
        .await?;
    Ok((receipt_status(receipt), JsonResponse(receipt)))
}

/// 流式上传单个分片，摘要放在 `X-Chunk-Digest` 头中。
pub async fn upload_chunk(
    Query(UploadChunkQuery { name, index, total }): Query<UploadChunkQuery>,
    headers: HeaderMap,
    Extension(coordinator): Extension<Arc<AssemblyCoordinator>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    body: AxumBody,
) -> Result<(StatusCode, JsonResponse<ChunkReceipt>), ApiError> {
    let digest = headers
        .get(CHUNK_DIGEST_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("{CHUNK_DIGEST_HEADER} is required")))?
        .to_string();

    let mut payload = Vec::new();
    let mut data_stream = BodyExt::into_data_stream(body);
    while let Some(chunk) = data_stream.next().await {
        let chunk = chunk.map_err(|err: AxumError| ApiError::Internal(err.to_string()))?;
        if chunk.is_empty() {
            continue;
        }
        if (payload.len() + chunk.len()) as u64 > upload.max_chunk_size {
            return Err(ApiError::BadRequest("chunk too large".into()));
        }
        payload.extend_from_slice(&chunk);
    }

    info!(name, index, total, bytes = payload.len(), "chunk upload");
    let receipt = coordinator
        .accept_chunk(&name, index, total, &payload, &digest)
        .await?;
    Ok((receipt_status(receipt), JsonResponse(receipt)))
}

/// 查询装配状态（合并结果在此异步可见）。
pub async fn upload_status(
    Query(StatusQuery { name }): Query<StatusQuery>,
    Extension(coordinator): Extension<Arc<AssemblyCoordinator>>,
) -> Result<JsonResponse<AssemblyStatus>, ApiError> {
    coordinator
        .status(&name)
        .await?
        .map(JsonResponse)
        .ok_or_else(|| ApiError::NotFound("unknown assembly".into()))
}

/// 显式重新触发合并，用于合并失败后的人工恢复。
pub async fn retry_merge(
    Extension(coordinator): Extension<Arc<AssemblyCoordinator>>,
    Json(payload): Json<MergeRequest>,
) -> Result<StatusCode, ApiError> {
    coordinator.trigger_merge(&payload.name, payload.total).await?;
    info!(name = payload.name, total = payload.total, "merge requested");
    Ok(StatusCode::ACCEPTED)
}

fn receipt_status(receipt: ChunkReceipt) -> StatusCode {
    match receipt {
        ChunkReceipt::Accepted { .. } => StatusCode::CREATED,
        ChunkReceipt::AssemblyComplete { .. } => StatusCode::ACCEPTED,
    }
}

fn parse_number(value: &str, field: &str) -> Result<u32, ApiError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ApiError::BadRequest(format!("{field} must be a positive integer")))
}

fn form_error(err: MultipartError) -> ApiError {
    ApiError::BadRequest(err.body_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::FromRequest;
    use axum::http::{HeaderValue, Request, header};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    use crate::assembly::{AssemblyState, MergeOutcome};
    use crate::chunk_store::ChunkStore;
    use crate::digest::DigestAlgorithm;

    const BOUNDARY: &str = "axo-test-boundary";

    fn make_state(
        upload: UploadConfig,
    ) -> (
        tempfile::TempDir,
        Arc<AssemblyCoordinator>,
        Arc<UploadConfig>,
    ) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        std::fs::create_dir_all(&root).expect("create upload root");
        let store = Arc::new(ChunkStore::new(root, DigestAlgorithm::Md5));
        let upload = Arc::new(upload);
        let coordinator = Arc::new(AssemblyCoordinator::new(store, upload.clone()));
        (temp, coordinator, upload)
    }

    fn md5(payload: &[u8]) -> String {
        DigestAlgorithm::Md5.hex_digest(payload)
    }

    async fn form(
        file_name: &str,
        payload: &[u8],
        digest: &str,
        index: u32,
        total: u32,
    ) -> Multipart {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(payload);
        body.extend_from_slice(b"\r\n");
        for (name, value) in [
            ("md5", digest.to_string()),
            ("chunkNumber", index.to_string()),
            ("totalChunks", total.to_string()),
        ] {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        let request = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .expect("build request");
        Multipart::from_request(request, &())
            .await
            .unwrap_or_else(|_| panic!("multipart extraction failed"))
    }

    #[tokio::test]
    async fn form_upload_completes_and_merges() {
        let (_temp, coordinator, upload) = make_state(UploadConfig::default());
        let mut reports = coordinator.subscribe();

        let (status, JsonResponse(receipt)) = upload_form(
            Extension(coordinator.clone()),
            Extension(upload.clone()),
            form("photo.jpg", b"second", &md5(b"second"), 2, 2).await,
        )
        .await
        .unwrap_or_else(|_| panic!("upload chunk 2 failed"));
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(receipt, ChunkReceipt::Accepted { index: 2 });

        let (status, JsonResponse(receipt)) = upload_form(
            Extension(coordinator.clone()),
            Extension(upload.clone()),
            form("photo.jpg", b"first-", &md5(b"first-"), 1, 2).await,
        )
        .await
        .unwrap_or_else(|_| panic!("upload chunk 1 failed"));
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            receipt,
            ChunkReceipt::AssemblyComplete {
                triggered_merge: true
            }
        );

        let report = timeout(Duration::from_secs(5), reports.recv())
            .await
            .expect("merge report in time")
            .expect("report channel open");
        assert_eq!(report.outcome, MergeOutcome::Merged { bytes: 12 });
        let merged = tokio::fs::read(coordinator.store().root_path().join("photo.jpg"))
            .await
            .expect("read merged");
        assert_eq!(merged, b"first-second");
    }

    #[tokio::test]
    async fn form_upload_with_bad_digest_asks_for_resend() {
        let (_temp, coordinator, upload) = make_state(UploadConfig::default());
        let result = upload_form(
            Extension(coordinator.clone()),
            Extension(upload),
            form("photo.jpg", b"data", &md5(b"other"), 1, 2).await,
        )
        .await;

        assert!(matches!(result, Err(ApiError::DigestMismatch(1))));
        assert!(
            !coordinator
                .store()
                .root_path()
                .join("photo.jpg.part1")
                .exists()
        );
    }

    #[tokio::test]
    async fn streamed_chunk_requires_digest_header_and_size_limit() {
        let (_temp, coordinator, upload) = make_state(UploadConfig {
            max_chunk_size: 4,
            ..UploadConfig::default()
        });

        let missing_header = upload_chunk(
            Query(UploadChunkQuery {
                name: "a.bin".into(),
                index: 1,
                total: 1,
            }),
            HeaderMap::new(),
            Extension(coordinator.clone()),
            Extension(upload.clone()),
            AxumBody::from("abc"),
        )
        .await;
        assert!(matches!(missing_header, Err(ApiError::BadRequest(_))));

        let mut headers = HeaderMap::new();
        headers.insert(
            CHUNK_DIGEST_HEADER,
            HeaderValue::from_str(&md5(b"abcdef")).expect("header value"),
        );
        let too_large = upload_chunk(
            Query(UploadChunkQuery {
                name: "a.bin".into(),
                index: 1,
                total: 1,
            }),
            headers,
            Extension(coordinator.clone()),
            Extension(upload),
            AxumBody::from("abcdef"),
        )
        .await;
        assert!(matches!(too_large, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn streamed_chunk_is_stored_and_status_is_pollable() {
        let (_temp, coordinator, upload) = make_state(UploadConfig::default());
        let mut headers = HeaderMap::new();
        headers.insert(
            CHUNK_DIGEST_HEADER,
            HeaderValue::from_str(&md5(b"abc")).expect("header value"),
        );

        let (status, JsonResponse(receipt)) = upload_chunk(
            Query(UploadChunkQuery {
                name: "a.bin".into(),
                index: 1,
                total: 3,
            }),
            headers,
            Extension(coordinator.clone()),
            Extension(upload),
            AxumBody::from("abc"),
        )
        .await
        .unwrap_or_else(|_| panic!("upload chunk failed"));
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(receipt, ChunkReceipt::Accepted { index: 1 });

        let JsonResponse(status) = upload_status(
            Query(StatusQuery {
                name: "a.bin".into(),
            }),
            Extension(coordinator.clone()),
        )
        .await
        .unwrap_or_else(|_| panic!("status failed"));
        assert_eq!(status.state, AssemblyState::Receiving);
        assert_eq!(status.received, 1);
        assert_eq!(status.total, 3);

        let unknown = upload_status(
            Query(StatusQuery {
                name: "b.bin".into(),
            }),
            Extension(coordinator),
        )
        .await;
        assert!(matches!(unknown, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn retry_merge_rejects_incomplete_assembly() {
        let (_temp, coordinator, _upload) = make_state(UploadConfig::default());
        coordinator
            .accept_chunk("a.bin", 1, 2, b"abc", &md5(b"abc"))
            .await
            .expect("accept");

        let result = retry_merge(
            Extension(coordinator),
            Json(MergeRequest {
                name: "a.bin".into(),
                total: 2,
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));
    }
}
