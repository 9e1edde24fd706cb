use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use model::{Page, RelativePath, ThumbSize};
use tokio_util::io::ReaderStream;

use super::error::HttpError;
use super::AppState;
use crate::cache::CachedContent;
use crate::error::{ServiceError, ServiceResult};

type Params = HashMap<String, String>;

/// `GET /`
pub async fn root(
    State(service): State<AppState>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Response {
    respond(dispatch(&service, "", &params).await, "/", &headers)
}

/// `GET /*path`
pub async fn path(
    State(service): State<AppState>,
    Path(path): Path<String>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Response {
    respond(dispatch(&service, &path, &params).await, &path, &headers)
}

/// `GET /static/*path`
pub async fn resource(
    State(service): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    respond(serve_resource(&service, &path).await, &path, &headers)
}

async fn serve_resource(service: &AppState, raw_path: &str) -> ServiceResult<Response> {
    let path = RelativePath::new(raw_path)?;
    serve(service.resource(&path).await?).await
}

fn respond(result: ServiceResult<Response>, path: &str, headers: &HeaderMap) -> Response {
    match result {
        Ok(response) => response,
        Err(error) => HttpError::new(error, path, headers).into_response(),
    }
}

/// Pick the operation from `?action=`. A bare `?size=` asks for a thumbnail.
async fn dispatch(service: &AppState, raw_path: &str, params: &Params) -> ServiceResult<Response> {
    let param = |name: &str| params.get(name).map(String::as_str);

    let action = match param("action").unwrap_or_default() {
        "" if params.contains_key("size") => "thumb",
        action => action,
    };

    match action {
        "" => {
            let path = parse_path(raw_path)?;
            serve(service.file(&path).await?).await
        }
        "thumb" => {
            let path = parse_path(raw_path)?;
            let size = ThumbSize::parse(param("size").unwrap_or_default())?;
            serve(service.thumbnail(&path, size).await?).await
        }
        "info" => {
            let page = Page::parse(param("page_token").unwrap_or_default(), param("page_size"))?;
            let path = parse_path(raw_path)?;
            Ok(Json(service.directory(&path, &page).await?).into_response())
        }
        "image-info" => {
            let path = parse_path(raw_path)?;
            Ok(Json(service.image_info(&path).await?).into_response())
        }
        other => Err(ServiceError::BadRequest(format!("unknown action {:?}", other))),
    }
}

/// Validate a path from the URL. One trailing `/` is allowed.
fn parse_path(raw: &str) -> ServiceResult<RelativePath> {
    Ok(RelativePath::new(raw.strip_suffix('/').unwrap_or(raw))?)
}

/// Stream cached or on-disk content to the client.
async fn serve(content: CachedContent) -> ServiceResult<Response> {
    match content {
        CachedContent::Bytes {
            bytes,
            content_type,
        } => Ok(([(CONTENT_TYPE, content_type)], bytes).into_response()),
        CachedContent::File { path, content_type } => {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| ServiceError::from_io(path.display(), e))?;
            let length = file
                .metadata()
                .await
                .map_err(|e| ServiceError::from_io(path.display(), e))?
                .len();

            Ok((
                [
                    (CONTENT_TYPE, content_type),
                    (CONTENT_LENGTH, length.to_string()),
                ],
                Body::from_stream(ReaderStream::new(file)),
            )
                .into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_trims_one_slash() {
        assert_eq!(parse_path("album/").unwrap().as_str(), "album");
        assert_eq!(parse_path("").unwrap(), RelativePath::root());
        assert_eq!(parse_path("/").unwrap(), RelativePath::root());
        assert!(matches!(
            parse_path("album//"),
            Err(ServiceError::UnsafePath(_))
        ));
        assert!(matches!(
            parse_path("../etc/passwd"),
            Err(ServiceError::UnsafePath(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_bytes() {
        let response = serve(CachedContent::Bytes {
            bytes: bytes::Bytes::from_static(b"jpeg"),
            content_type: "image/jpeg".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "image/jpeg");
    }

    #[tokio::test]
    async fn test_serve_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = serve(CachedContent::File {
            path: dir.path().join("gone.jpg"),
            content_type: "image/jpeg".to_string(),
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
