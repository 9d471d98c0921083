//! Signed calls to the Cloudinary image API for profile pictures.

use axum::http::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};

pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const API_BASE: &str = "https://api.cloudinary.com/v1_1";

const SIGNATURE_ALGORITHM: &str = "sha256";

#[derive(Debug, thiserror::Error)]
pub enum CloudinaryError {
    #[error("image upload is not configured")]
    NotConfigured,

    #[error("image is larger than {MAX_IMAGE_BYTES} bytes")]
    TooLarge,

    #[error("unsupported content type {0}")]
    UnsupportedContentType(String),

    #[error("image upload failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("image service rejected the request: {0}")]
    Rejected(String),
}

impl CloudinaryError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedContentType(..) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Request(..) | Self::Rejected(..) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CloudinaryCredentials {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub folder: String,
}

#[derive(Clone)]
pub struct CloudinaryClient {
    http: reqwest::Client,
    credentials: Option<CloudinaryCredentials>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UploadedImage {
    pub public_id: String,
    pub secure_url: String,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorMessage,
}

#[derive(Deserialize)]
struct ApiErrorMessage {
    message: String,
}

#[derive(Deserialize)]
struct DestroyResponse {
    result: String,
}

/// The `k=v&...` string a request is signed over: every sent parameter except
/// `file` and `api_key`, sorted by name.
pub fn string_to_sign(params: &[(&str, String)]) -> String {
    let mut params = params
        .iter()
        .filter(|(key, _)| !matches!(*key, "file" | "api_key" | "signature"))
        .collect::<Vec<_>>();
    params.sort_by(|(a, _), (b, _)| a.cmp(b));

    params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// SHA-256 request signature over [`string_to_sign`] followed by the secret.
pub fn sign(params: &[(&str, String)], api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(string_to_sign(params).as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn check_image(content_type: &str, len: usize) -> Result<(), CloudinaryError> {
    if !content_type.starts_with("image/") {
        return Err(CloudinaryError::UnsupportedContentType(
            content_type.to_string(),
        ));
    }

    if len > MAX_IMAGE_BYTES {
        return Err(CloudinaryError::TooLarge);
    }

    Ok(())
}

/// Parameters sent with, and signed for, an upload.
fn upload_params(folder: &str, timestamp: String) -> Vec<(&'static str, String)> {
    vec![
        ("folder", folder.to_string()),
        ("signature_algorithm", SIGNATURE_ALGORITHM.to_string()),
        ("timestamp", timestamp),
    ]
}

fn destroy_params(public_id: &str, timestamp: String) -> Vec<(&'static str, String)> {
    vec![
        ("public_id", public_id.to_string()),
        ("signature_algorithm", SIGNATURE_ALGORITHM.to_string()),
        ("timestamp", timestamp),
    ]
}

impl CloudinaryClient {
    pub fn new(credentials: Option<CloudinaryCredentials>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
        }
    }

    fn credentials(&self) -> Result<&CloudinaryCredentials, CloudinaryError> {
        self.credentials
            .as_ref()
            .ok_or(CloudinaryError::NotConfigured)
    }

    #[tracing::instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        file_name: String,
        content_type: &str,
    ) -> Result<UploadedImage, CloudinaryError> {
        check_image(content_type, bytes.len())?;
        let credentials = self.credentials()?;

        let timestamp = time::OffsetDateTime::now_utc().unix_timestamp().to_string();
        let params = upload_params(&credentials.folder, timestamp);
        let signature = sign(&params, &credentials.api_secret);

        let file = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(content_type)?;

        let form = params
            .into_iter()
            .fold(reqwest::multipart::Form::new(), |form, (key, value)| {
                form.text(key, value)
            })
            .text("api_key", credentials.api_key.clone())
            .text("signature", signature)
            .part("file", file);

        let response = self
            .http
            .post(format!(
                "{API_BASE}/{}/image/upload",
                credentials.cloud_name
            ))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let message = response
                .json::<ApiErrorBody>()
                .await
                .map(|it| it.error.message)
                .unwrap_or_else(|err| err.to_string());
            return Err(CloudinaryError::Rejected(message));
        }

        let uploaded = response.json::<UploadedImage>().await?;
        tracing::debug!(public_id = %uploaded.public_id, "image uploaded");

        Ok(uploaded)
    }

    #[tracing::instrument(skip(self))]
    pub async fn destroy(&self, public_id: &str) -> Result<(), CloudinaryError> {
        let credentials = self.credentials()?;

        let timestamp = time::OffsetDateTime::now_utc().unix_timestamp().to_string();
        let params = destroy_params(public_id, timestamp);
        let signature = sign(&params, &credentials.api_secret);

        let response = self
            .http
            .post(format!(
                "{API_BASE}/{}/image/destroy",
                credentials.cloud_name
            ))
            .form(
                &params
                    .into_iter()
                    .chain([
                        ("api_key", credentials.api_key.clone()),
                        ("signature", signature),
                    ])
                    .collect::<Vec<_>>(),
            )
            .send()
            .await?
            .json::<DestroyResponse>()
            .await?;

        match response.result.as_str() {
            "ok" | "not found" => Ok(()),
            other => Err(CloudinaryError::Rejected(other.to_string())),
        }
    }
}
