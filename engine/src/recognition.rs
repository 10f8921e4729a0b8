use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use card_capture_common::config::RecognitionConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const FORM_FIELD: &str = "idCardImage";
const FILE_NAME: &str = "id_card_capture.jpg";

/// Fields extracted from an ID card by the recognition service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdCardFields {
    #[serde(default)]
    pub identification_number: Option<String>,
    #[serde(default)]
    pub name_th: Option<String>,
    #[serde(default)]
    pub name_en: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub date_of_expiry: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
}

/// External OCR collaborator invoked from the `Processing` state.
pub trait Recognizer: Send + Sync {
    fn recognize(
        &self,
        image: Bytes,
    ) -> impl Future<Output = Result<IdCardFields, RecognitionError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("recognition request failed: {0}")]
    Transport(String),
    #[error("{0}")]
    Rejected(String),
}

/// Response envelope of the OCR endpoint.
#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<IdCardFields>,
    #[serde(default)]
    error: Option<String>,
}

/// Posts the captured JPEG as a multipart form to an OCR HTTP endpoint.
pub struct HttpRecognizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRecognizer {
    pub fn new(config: &RecognitionConfig) -> Result<Self, RecognitionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RecognitionError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

impl Recognizer for HttpRecognizer {
    async fn recognize(&self, image: Bytes) -> Result<IdCardFields, RecognitionError> {
        let size = image.len();
        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name(FILE_NAME)
            .mime_str("image/jpeg")
            .map_err(|e| RecognitionError::Transport(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part(FORM_FIELD, part);

        debug!(endpoint = self.endpoint, bytes = size, "submitting capture for recognition");
        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RecognitionError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| RecognitionError::Transport(e.to_string()))?;
        let fields = interpret_response(status, &body)?;
        info!(status = status.as_u16(), "recognition succeeded");
        Ok(fields)
    }
}

/// Map an OCR endpoint reply onto the fields or a human-readable failure.
fn interpret_response(
    status: reqwest::StatusCode,
    body: &str,
) -> Result<IdCardFields, RecognitionError> {
    let parsed: Option<OcrResponse> = serde_json::from_str(body).ok();

    if !status.is_success() {
        let message = parsed
            .and_then(|r| r.error)
            .unwrap_or_else(|| format!("server error: {status}"));
        return Err(RecognitionError::Rejected(message));
    }

    match parsed {
        Some(OcrResponse {
            success: true,
            data: Some(fields),
            ..
        }) => Ok(fields),
        Some(r) => Err(RecognitionError::Rejected(
            r.error
                .unwrap_or_else(|| "recognition service returned no data".into()),
        )),
        None => Err(RecognitionError::Rejected(
            "recognition service returned an unreadable response".into(),
        )),
    }
}
