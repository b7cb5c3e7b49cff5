use crate::preprocess::{preprocess_for_clip, ImageTensor};
use crate::trial::{CapturedImage, Caption, TrialServices, VoicePayload};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const SPEECH_LANGUAGE: &str = "en-US";

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("encoder model unavailable: {0}")]
    Unloaded(String),
    #[error("encoder input is empty")]
    EmptyInput,
    #[error("encoder prediction failed: {0}")]
    Prediction(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("caption request failed: {0}")]
    Caption(String),
    #[error("speech request failed: {0}")]
    Speech(String),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error("image preprocessing failed: {0}")]
    Preprocess(String),
    #[error("audio playback failed: {0}")]
    Playback(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        "external_service_error"
    }
}

fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderHandle {
    text_model: PathBuf,
    image_model: PathBuf,
}

impl EncoderHandle {
    pub fn text_model(&self) -> &Path {
        &self.text_model
    }

    pub fn image_model(&self) -> &Path {
        &self.image_model
    }
}

pub trait FeatureEncoder {
    fn load(&self) -> impl Future<Output = Result<EncoderHandle, EncoderError>> + Send;

    fn predict_text(
        &self,
        handle: &EncoderHandle,
        text: &str,
    ) -> impl Future<Output = Result<Vec<f32>, EncoderError>> + Send;

    fn predict_image(
        &self,
        handle: &EncoderHandle,
        tensor: &ImageTensor,
    ) -> impl Future<Output = Result<Vec<f32>, EncoderError>> + Send;
}

#[derive(Debug, Deserialize)]
struct FeatureResponse {
    feature: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct HttpEncoder {
    client: reqwest::Client,
    endpoint: String,
    text_model: PathBuf,
    image_model: PathBuf,
}

impl HttpEncoder {
    pub fn new(
        endpoint: &str,
        text_model: impl Into<PathBuf>,
        image_model: impl Into<PathBuf>,
    ) -> Result<Self, EncoderError> {
        let client = http_client().map_err(|e| EncoderError::Unloaded(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            text_model: text_model.into(),
            image_model: image_model.into(),
        })
    }

    async fn predict(&self, route: &str, body: serde_json::Value) -> Result<Vec<f32>, EncoderError> {
        let url = format!("{}/{}", self.endpoint, route);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| EncoderError::Prediction(e.to_string()))?;
        let parsed: FeatureResponse = response
            .json()
            .await
            .map_err(|e| EncoderError::Prediction(format!("bad response from {}: {}", url, e)))?;
        if parsed.feature.is_empty() {
            return Err(EncoderError::Prediction(format!("{} returned an empty feature", url)));
        }
        Ok(parsed.feature)
    }
}

impl FeatureEncoder for HttpEncoder {
    async fn load(&self) -> Result<EncoderHandle, EncoderError> {
        for model in [&self.text_model, &self.image_model] {
            tokio::fs::metadata(model).await.map_err(|e| {
                EncoderError::Unloaded(format!("{}: {}", model.display(), e))
            })?;
        }
        info!(endpoint = %self.endpoint, "feature encoder ready");
        Ok(EncoderHandle {
            text_model: self.text_model.clone(),
            image_model: self.image_model.clone(),
        })
    }

    async fn predict_text(&self, handle: &EncoderHandle, text: &str) -> Result<Vec<f32>, EncoderError> {
        if text.trim().is_empty() {
            return Err(EncoderError::EmptyInput);
        }
        let body = json!({
            "model": handle.text_model.to_string_lossy(),
            "text": text,
        });
        self.predict("text", body).await
    }

    async fn predict_image(
        &self,
        handle: &EncoderHandle,
        tensor: &ImageTensor,
    ) -> Result<Vec<f32>, EncoderError> {
        if tensor.as_slice().is_empty() {
            return Err(EncoderError::EmptyInput);
        }
        let body = json!({
            "model": handle.image_model.to_string_lossy(),
            "shape": ImageTensor::SHAPE,
            "data": tensor.as_slice(),
        });
        self.predict("image", body).await
    }
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    description: Description,
}

#[derive(Debug, Deserialize)]
struct Description {
    #[serde(default)]
    captions: Vec<DescribeCaption>,
}

#[derive(Debug, Deserialize)]
struct DescribeCaption {
    text: String,
    confidence: f64,
}

#[derive(Debug, Clone)]
pub struct AzureCaptioner {
    client: reqwest::Client,
    url: String,
    key: String,
}

impl AzureCaptioner {
    pub fn new(url: &str, key: &str) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client().map_err(|e| ServiceError::Caption(e.to_string()))?,
            url: url.to_string(),
            key: key.to_string(),
        })
    }

    pub async fn describe(&self, png: Vec<u8>) -> Result<Caption, ServiceError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .body(png)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ServiceError::Caption(e.to_string()))?;
        let parsed: DescribeResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Caption(format!("bad describe response: {}", e)))?;
        let first = parsed
            .description
            .captions
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Caption("describe response has no captions".to_string()))?;
        Ok(Caption {
            text: first.text,
            confidence: first.confidence,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
}

#[derive(Debug, Clone)]
pub struct GoogleSpeech {
    client: reqwest::Client,
    base_url: String,
    key: String,
}

impl GoogleSpeech {
    pub const DEFAULT_BASE_URL: &'static str = "https://texttospeech.googleapis.com";

    pub fn new(base_url: &str, key: &str) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client().map_err(|e| ServiceError::Speech(e.to_string()))?,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }

    pub async fn synthesize(&self, text: &str, speaking_rate: f64) -> Result<VoicePayload, ServiceError> {
        let url = format!("{}/v1/text:synthesize", self.base_url);
        let body = json!({
            "input": { "text": text },
            "voice": { "languageCode": SPEECH_LANGUAGE },
            "audioConfig": { "audioEncoding": "MP3", "speakingRate": speaking_rate },
        });
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.key.as_str())])
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ServiceError::Speech(e.to_string()))?;
        let parsed: SynthesizeResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Speech(format!("bad synthesize response: {}", e)))?;
        if parsed.audio_content.is_empty() {
            return Err(ServiceError::Speech("synthesize returned no audio".to_string()));
        }
        Ok(VoicePayload::new(parsed.audio_content))
    }
}

pub trait AudioPlayer {
    fn play(&self, voice: &VoicePayload) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SilentPlayer;

impl AudioPlayer for SilentPlayer {
    async fn play(&self, voice: &VoicePayload) -> Result<(), ServiceError> {
        debug!(bytes = voice.as_base64().len(), "skipping audio playback");
        Ok(())
    }
}

pub struct RemoteServices<E, P> {
    encoder: E,
    handle: EncoderHandle,
    captioner: AzureCaptioner,
    speech: GoogleSpeech,
    player: P,
}

impl<E: FeatureEncoder, P: AudioPlayer> RemoteServices<E, P> {
    pub async fn connect(
        encoder: E,
        captioner: AzureCaptioner,
        speech: GoogleSpeech,
        player: P,
    ) -> Result<Self, ServiceError> {
        let handle = encoder.load().await?;
        Ok(Self {
            encoder,
            handle,
            captioner,
            speech,
            player,
        })
    }
}

impl<E, P> TrialServices for RemoteServices<E, P>
where
    E: FeatureEncoder + Sync,
    P: AudioPlayer + Sync,
{
    fn preprocess(&self, image: &CapturedImage) -> Result<ImageTensor, ServiceError> {
        let png = image
            .decode()
            .map_err(|e| ServiceError::Preprocess(e.to_string()))?;
        preprocess_for_clip(&png)
    }

    async fn image_feature(&self, tensor: &ImageTensor) -> Result<Vec<f32>, ServiceError> {
        Ok(self.encoder.predict_image(&self.handle, tensor).await?)
    }

    async fn text_feature(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(self.encoder.predict_text(&self.handle, text).await?)
    }

    async fn caption(&self, image: &CapturedImage) -> Result<Caption, ServiceError> {
        let png = image
            .decode()
            .map_err(|e| ServiceError::Caption(e.to_string()))?;
        self.captioner.describe(png).await
    }

    async fn synthesize(&self, text: &str, speaking_rate: f64) -> Result<VoicePayload, ServiceError> {
        self.speech.synthesize(text, speaking_rate).await
    }

    async fn play(&self, voice: &VoicePayload) -> Result<(), ServiceError> {
        self.player.play(voice).await
    }
}
