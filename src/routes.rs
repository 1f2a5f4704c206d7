use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::config::{BackendKind, Config};
use crate::error::AppError;
use crate::index::{BlobCleanup, ImageRecord};
use crate::library::{ImageLibrary, NewImage};
use crate::media::{decode_data_url, get_extension_from_mime_type, resolve_upload_mime_type};

pub type SharedLibrary = Arc<ImageLibrary>;

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "Content-Type, Authorization";

#[derive(Serialize)]
struct ListResponse {
    success: bool,
    images: Vec<ImageRecord>,
    count: usize,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct ImageResponse {
    success: bool,
    image: ImageRecord,
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    message: &'static str,
    id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    success: bool,
    message: &'static str,
    image_url: String,
    filename: String,
    image: ImageRecord,
}

#[derive(Deserialize)]
struct UploadBody {
    image: Option<String>,
    filename: Option<String>,
}

pub fn build_router(library: SharedLibrary, config: &Config) -> Router {
    let mut router = Router::new()
        .route("/images", get(list_images).fallback(method_not_allowed))
        .route(
            "/images/{id}",
            get(get_image)
                .delete(delete_image)
                .fallback(method_not_allowed),
        )
        .route(
            "/upload",
            post(upload_image)
                .fallback(method_not_allowed)
                .layer(DefaultBodyLimit::max(config.max_upload_bytes)),
        );
    if config.backend == BackendKind::Local {
        router = router.nest_service("/files", ServeDir::new(config.blob_dir()));
    }
    router
        .fallback(fallback)
        .layer(middleware::from_fn(answer_preflight))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOW_HEADERS),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(library)
}

/// Answers OPTIONS on every path, nested file serving included, before routing.
async fn answer_preflight(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

async fn method_not_allowed(method: Method) -> AppError {
    AppError::MethodNotAllowed(format!("method {method} is not allowed"))
}

async fn fallback() -> AppError {
    AppError::not_found("route not found")
}

fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::not_found("image not found"))
}

async fn list_images(State(library): State<SharedLibrary>) -> Result<Json<ListResponse>, AppError> {
    let images = library.list().await?;
    Ok(Json(ListResponse {
        success: true,
        count: images.len(),
        images,
        timestamp: Utc::now(),
    }))
}

async fn get_image(
    State(library): State<SharedLibrary>,
    Path(id): Path<String>,
) -> Result<Json<ImageResponse>, AppError> {
    let image = library.get(parse_id(&id)?).await?;
    Ok(Json(ImageResponse {
        success: true,
        image,
    }))
}

async fn delete_image(
    State(library): State<SharedLibrary>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let removal = library.delete(parse_id(&id)?).await?;
    let warning = match removal.blob {
        BlobCleanup::Failed(err) => Some(format!("image file could not be removed: {err}")),
        BlobCleanup::Deleted | BlobCleanup::AlreadyMissing => None,
    };
    Ok(Json(DeleteResponse {
        success: true,
        message: "image deleted",
        id: removal.record.id,
        warning,
    }))
}

async fn upload_image(
    State(library): State<SharedLibrary>,
    request: Request,
) -> Result<Json<UploadResponse>, AppError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));
    let image = if is_multipart {
        let multipart = Multipart::from_request(request, &library)
            .await
            .map_err(|err| AppError::rejected(err.status(), err.body_text()))?;
        read_multipart(multipart).await?
    } else {
        let Json(body) = Json::<UploadBody>::from_request(request, &library)
            .await
            .map_err(|err| AppError::rejected(err.status(), err.body_text()))?;
        read_json_body(body)?
    };

    let record = library.upload(image).await?;
    Ok(Json(UploadResponse {
        success: true,
        message: "image uploaded",
        image_url: record.url.clone(),
        filename: record.file_name.clone(),
        image: record,
    }))
}

fn read_json_body(body: UploadBody) -> Result<NewImage, AppError> {
    let image = body.image.filter(|value| !value.is_empty());
    let filename = body.filename.filter(|value| !value.trim().is_empty());
    let (Some(image), Some(filename)) = (image, filename) else {
        return Err(AppError::invalid_input(
            "missing required field: image or filename",
        ));
    };
    let (mime_type, bytes) = decode_data_url(&image)?;
    Ok(NewImage {
        name: filename.trim().to_string(),
        mime_type: mime_type.to_string(),
        bytes,
    })
}

async fn read_multipart(mut multipart: Multipart) -> Result<NewImage, AppError> {
    let mut file_name = None;
    let mut form_name = None;
    let mut content_type = None;
    let mut bytes = None;
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| {
                AppError::rejected(
                    err.status(),
                    format!("failed to read form: {}", err.body_text()),
                )
            })?;
        let Some(field) = field else {
            break;
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") | Some("file") if bytes.is_none() => {
                content_type = field.content_type().map(str::to_string);
                file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| {
                        AppError::rejected(
                            err.status(),
                            format!("failed to read file: {}", err.body_text()),
                        )
                    })?;
                bytes = Some(data);
            }
            Some("filename") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| {
                        AppError::rejected(
                            err.status(),
                            format!("failed to read form: {}", err.body_text()),
                        )
                    })?;
                form_name = Some(text);
            }
            _ => {}
        }
    }

    let bytes = bytes.ok_or_else(|| AppError::invalid_input("missing required field: image"))?;
    if bytes.is_empty() {
        return Err(AppError::invalid_input("uploaded file is empty"));
    }
    let name = form_name
        .or(file_name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let mime_type = resolve_upload_mime_type(
        name.as_deref().unwrap_or_default(),
        content_type.as_deref(),
        &bytes,
    )?;
    let name = match name {
        Some(name) => name,
        None => format!(
            "image.{}",
            get_extension_from_mime_type(mime_type).unwrap_or("bin")
        ),
    };
    Ok(NewImage {
        name,
        mime_type: mime_type.to_string(),
        bytes: bytes.to_vec(),
    })
}
