use std::{fmt::Debug, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Path, Request,
        State,
        multipart::MultipartError,
    },
    http::{
        HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
        request::Parts,
    },
    response::{IntoResponse, Response},
    routing,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::{SERVICE_NAME, Settings},
    ingest_service::{
        CompressError, CompressResponse, GetItemError, GetQrError, IngestService, ItemPayload,
        Submission, UploadedFile,
    },
};

/// Room for multipart framing on top of the largest accepted payload.
const BODY_LIMIT_HEADROOM: usize = 1024 * 1024;

/// Worst-case UTF-8 width of one character.
const MAX_UTF8_BYTES: usize = 4;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const MULTIPART_FORM_DATA: &str = "multipart/form-data";

type Service = Arc<dyn IngestService>;

/// Builds the public HTTP surface on top of `service`.
pub fn router(service: Service, settings: &Settings) -> Router {
    Router::new()
        .route("/health", routing::get(health))
        .route("/api/compress", routing::post(compress))
        .route("/api/item/{short_code}", routing::get(get_item))
        .route("/api/qr/{short_code}", routing::get(get_qr_code))
        .layer(DefaultBodyLimit::max(body_limit(settings)))
        .layer(cors_layer(&settings.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Largest body that can still carry a valid file or text submission, so oversized
/// payloads reach validation instead of being cut off by the transport.
const fn body_limit(settings: &Settings) -> usize {
    let max_text_bytes = settings.max_text_length.saturating_mul(MAX_UTF8_BYTES);
    let max_payload = if settings.max_file_size_bytes > max_text_bytes {
        settings.max_file_size_bytes
    } else {
        max_text_bytes
    };
    max_payload.saturating_add(BODY_LIMIT_HEADROOM)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins = origins
        .iter()
        .filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|_| warn!(origin, "Ignoring invalid CORS origin"))
                .ok()
        })
        .collect::<Vec<_>>();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub service: &'static str,
}

#[derive(Serialize)]
pub struct Error {
    pub error: String,
    pub error_id: String,
}

/// A JSON error response carrying an id that also appears in the logs.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    error_id: Uuid,
}

impl ApiError {
    fn client(status: StatusCode, error: impl Debug + ToString) -> Self {
        let err_uuid = Uuid::new_v4();
        info!(?err_uuid, ?error, %status, "User submitted a bad request");
        Self {
            status,
            message: error.to_string(),
            error_id: err_uuid,
        }
    }

    fn internal(error: impl Debug) -> Self {
        let err_uuid = Uuid::new_v4();
        error!(?err_uuid, ?error, "Encountered an error during a request");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal server error".to_owned(),
            error_id: err_uuid,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(Error {
                error: self.message,
                error_id: self.error_id.to_string(),
            }),
        )
            .into_response()
    }
}

/// Peer IP used to key rate limiting; `"unknown"` when the server wasn't
/// started with connect info.
pub struct ClientId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientId {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map_or_else(|| "unknown".to_owned(), |ConnectInfo(addr)| addr.ip().to_string()),
        ))
    }
}

#[derive(Deserialize)]
struct SubmissionFields {
    #[serde(rename = "type", default)]
    kind: String,
    content: Option<String>,
}

/// Reads a [`Submission`] from either an urlencoded or a multipart form.
pub struct SubmissionForm(pub Submission);

impl<S: Send + Sync> FromRequest<S> for SubmissionForm {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with(MULTIPART_FORM_DATA) {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::client(rejection.status(), rejection.body_text()))?;
            read_multipart(multipart)
                .await
                .map(Self)
                .map_err(|err| ApiError::client(err.status(), err.body_text()))
        } else if content_type.starts_with(FORM_URLENCODED) {
            let axum::Form(SubmissionFields { kind, content }) =
                axum::Form::from_request(req, state)
                    .await
                    .map_err(|rejection| {
                        ApiError::client(rejection.status(), rejection.body_text())
                    })?;
            Ok(Self(Submission {
                kind,
                content,
                file: None,
            }))
        } else {
            Err(ApiError::client(
                StatusCode::BAD_REQUEST,
                format!("expected {FORM_URLENCODED} or {MULTIPART_FORM_DATA} body"),
            ))
        }
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<Submission, MultipartError> {
    let mut submission = Submission::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("type") => submission.kind = field.text().await?,
            Some("content") => submission.content = Some(field.text().await?),
            Some("file") => {
                let file_name = field.file_name().map(str::to_owned);
                let content_type = field.content_type().map(str::to_owned);
                submission.file = Some(UploadedFile {
                    file_name,
                    content_type,
                    data: field.bytes().await?.to_vec(),
                });
            }
            _ => {}
        }
    }
    Ok(submission)
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "ok",
        service: SERVICE_NAME,
    })
}

#[instrument(skip(service, submission))]
async fn compress(
    State(service): State<Service>,
    ClientId(client_id): ClientId,
    SubmissionForm(submission): SubmissionForm,
) -> Result<Json<CompressResponse>, ApiError> {
    service
        .compress(&client_id, submission)
        .await
        .map(Json)
        .map_err(|error: CompressError| match error {
            CompressError::RateLimited => ApiError::client(StatusCode::TOO_MANY_REQUESTS, error),
            CompressError::Validation(_) => ApiError::client(StatusCode::BAD_REQUEST, error),
            CompressError::InvalidImage(_) => {
                info!(?error, "User submitted an unreadable image");
                ApiError::client(StatusCode::BAD_REQUEST, "Invalid or unsupported image file")
            }
            CompressError::Internal(_) => ApiError::internal(error),
        })
}

#[instrument(skip(service))]
async fn get_item(
    State(service): State<Service>,
    Path(short_code): Path<String>,
) -> Result<Json<ItemPayload>, ApiError> {
    service
        .get_item(&short_code)
        .await
        .map(Json)
        .map_err(|error: GetItemError| match error {
            GetItemError::NotFound => ApiError::client(StatusCode::NOT_FOUND, error),
            GetItemError::Expired => ApiError::client(StatusCode::GONE, error),
            GetItemError::Internal(_) => ApiError::internal(error),
        })
}

#[instrument(skip(service))]
async fn get_qr_code(
    State(service): State<Service>,
    Path(short_code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    service
        .get_qr_code(&short_code)
        .await
        .map(|qr| {
            (
                [
                    (CONTENT_TYPE, qr.content_type.to_owned()),
                    (
                        CONTENT_DISPOSITION,
                        format!("inline; filename=\"qr-{short_code}.png\""),
                    ),
                ],
                qr.data,
            )
        })
        .map_err(|error: GetQrError| match error {
            GetQrError::NotFound => ApiError::client(StatusCode::NOT_FOUND, error),
            GetQrError::Internal(_) => ApiError::internal(error),
        })
}
