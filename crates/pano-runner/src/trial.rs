use crate::preprocess::ImageTensor;
use crate::registry::RunWorkspace;
use crate::reward::{self, RewardScore};
use crate::services::ServiceError;
use pano_core::{decode_base64_payload, encode_base64, ArtifactStore, CoreError, EventLog};
use pano_settings::TrialInfo;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info, warn};

// First request plus one retry.
pub const CAPTION_ATTEMPTS: usize = 2;
pub const TEXT_FEATURE_NAME: &str = "text_feature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialPhase {
    Uninitialized,
    FixationBeforePreview,
    CapturePreview,
    FixationBeforeMultimodal,
    Multimodal,
    FixationBeforeReward,
    Reward,
    FixationAfterReward,
    End,
}

impl TrialPhase {
    pub const SEQUENCE: [TrialPhase; 7] = [
        TrialPhase::FixationBeforePreview,
        TrialPhase::CapturePreview,
        TrialPhase::FixationBeforeMultimodal,
        TrialPhase::Multimodal,
        TrialPhase::FixationBeforeReward,
        TrialPhase::Reward,
        TrialPhase::FixationAfterReward,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrialPhase::Uninitialized => "uninitialized",
            TrialPhase::FixationBeforePreview => "fixation_before_preview",
            TrialPhase::CapturePreview => "capture_preview",
            TrialPhase::FixationBeforeMultimodal => "fixation_before_multimodal",
            TrialPhase::Multimodal => "multimodal",
            TrialPhase::FixationBeforeReward => "fixation_before_reward",
            TrialPhase::Reward => "reward",
            TrialPhase::FixationAfterReward => "fixation_after_reward",
            TrialPhase::End => "end",
        }
    }
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    base64_png: String,
}

impl CapturedImage {
    pub fn new(base64_png: impl Into<String>) -> Self {
        Self {
            base64_png: base64_png.into(),
        }
    }

    pub fn from_png(bytes: &[u8]) -> Self {
        Self::new(encode_base64(bytes))
    }

    pub fn as_base64(&self) -> &str {
        &self.base64_png
    }

    pub fn decode(&self) -> Result<Vec<u8>, CoreError> {
        decode_base64_payload("capture", &self.base64_png)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Caption {
    pub text: String,
    pub confidence: f64,
}

impl Caption {
    pub fn unavailable() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoicePayload(String);

impl VoicePayload {
    pub fn new(base64_audio: impl Into<String>) -> Self {
        Self(base64_audio.into())
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn as_base64(&self) -> &str {
        &self.0
    }

    pub fn is_caption_only(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Caption,
    Voice,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Caption => "caption",
            Modality::Voice => "voice",
        }
    }
}

pub trait TrialServices {
    fn preprocess(&self, image: &CapturedImage) -> Result<ImageTensor, ServiceError>;

    fn image_feature(
        &self,
        tensor: &ImageTensor,
    ) -> impl Future<Output = Result<Vec<f32>, ServiceError>> + Send;

    fn text_feature(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, ServiceError>> + Send;

    fn caption(&self, image: &CapturedImage) -> impl Future<Output = Result<Caption, ServiceError>> + Send;

    fn synthesize(
        &self,
        text: &str,
        speaking_rate: f64,
    ) -> impl Future<Output = Result<VoicePayload, ServiceError>> + Send;

    fn play(&self, voice: &VoicePayload) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("cannot {action} in phase {phase}")]
    InvalidState {
        action: &'static str,
        phase: TrialPhase,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseUpdate {
    pub trial: u32,
    pub phase: TrialPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialOutcome {
    NextTrial(u32),
    RunComplete,
}

// Uniform integer in `[ceil(b - r*b), floor(b + r*b)]`.
pub fn jitter<R: Rng + ?Sized>(base_ms: u64, ratio: f64, rng: &mut R) -> u64 {
    let base = base_ms as f64;
    let low = (base - ratio * base).ceil().max(0.0) as u64;
    let high = (base + ratio * base).floor().max(0.0) as u64;
    if low >= high {
        return low;
    }
    rng.random_range(low..=high)
}

pub async fn hold<F: Future>(minimum: Duration, work: F) -> F::Output {
    let timer = tokio::time::sleep(minimum);
    let (output, ()) = tokio::join!(work, timer);
    output
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

pub struct TrialMachine<S> {
    services: S,
    info: TrialInfo,
    etime: EventLog,
    actions: EventLog,
    captures: ArtifactStore,
    features: ArtifactStore,
    audio: ArtifactStore,
    rng: StdRng,
    phase: TrialPhase,
    trial_number: u32,
    capture: Option<CapturedImage>,
    image_feature: Option<Vec<f32>>,
    text_feature: Option<Vec<f32>>,
    caption: Caption,
    voice: VoicePayload,
    rewards: Vec<RewardScore>,
    updates: watch::Sender<PhaseUpdate>,
}

impl<S: TrialServices> TrialMachine<S> {
    pub fn new(services: S, info: TrialInfo, workspace: &RunWorkspace, rng: StdRng) -> Self {
        let (updates, _) = watch::channel(PhaseUpdate {
            trial: 1,
            phase: TrialPhase::Uninitialized,
        });
        Self {
            services,
            info,
            etime: workspace.etime_log(),
            actions: workspace.action_log(),
            captures: workspace.capture_store(),
            features: workspace.feature_store(),
            audio: workspace.audio_store(),
            rng,
            phase: TrialPhase::Uninitialized,
            trial_number: 1,
            capture: None,
            image_feature: None,
            text_feature: None,
            caption: Caption::unavailable(),
            voice: VoicePayload::none(),
            rewards: Vec::new(),
            updates,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PhaseUpdate> {
        self.updates.subscribe()
    }

    pub fn phase(&self) -> TrialPhase {
        self.phase
    }

    pub fn trial_number(&self) -> u32 {
        self.trial_number
    }

    pub fn info(&self) -> &TrialInfo {
        &self.info
    }

    pub fn caption(&self) -> &Caption {
        &self.caption
    }

    pub fn voice(&self) -> &VoicePayload {
        &self.voice
    }

    pub fn image_feature(&self) -> Option<&[f32]> {
        self.image_feature.as_deref()
    }

    pub fn text_feature(&self) -> Option<&[f32]> {
        self.text_feature.as_deref()
    }

    pub fn rewards(&self) -> &[RewardScore] {
        &self.rewards
    }

    pub async fn fixation_target(&mut self, caption_target: &str) {
        let duration = self.fixation_duration();
        let this = &*self;
        let feature = hold(duration, async move {
            this.log("fixation_target");
            this.predict_target(caption_target).await
        })
        .await;
        self.text_feature = feature;
    }

    async fn predict_target(&self, caption_target: &str) -> Option<Vec<f32>> {
        match self.services.text_feature(caption_target).await {
            Ok(feature) => {
                if let Err(err) = self.features.store_feature(TEXT_FEATURE_NAME, &feature) {
                    warn!(error = %err, "failed to store text feature");
                }
                Some(feature)
            }
            Err(err) => {
                warn!(error = %err, "text feature unavailable; rewards will be zero");
                None
            }
        }
    }

    pub fn set_text_feature(&mut self, feature: Option<Vec<f32>>) {
        self.text_feature = feature;
    }

    pub fn mark_trial(&self) {
        let marker = self.trial_name();
        self.log(&marker);
        if let Err(err) = self.actions.append(&marker) {
            warn!(error = %err, marker = %marker, "failed to append controller marker");
        }
    }

    pub fn begin_trial(&mut self, capture: CapturedImage) -> Result<(), TrialError> {
        if self.phase != TrialPhase::Uninitialized {
            return Err(TrialError::InvalidState {
                action: "begin a trial",
                phase: self.phase,
            });
        }
        self.capture = Some(capture);
        self.image_feature = None;
        self.caption = Caption::unavailable();
        self.voice = VoicePayload::none();
        self.enter(TrialPhase::FixationBeforePreview);
        Ok(())
    }

    pub async fn advance(&mut self) -> Result<TrialPhase, TrialError> {
        let next = match self.phase {
            TrialPhase::Uninitialized | TrialPhase::End => {
                return Err(TrialError::InvalidState {
                    action: "advance",
                    phase: self.phase,
                })
            }
            TrialPhase::FixationBeforePreview => {
                self.fixation_before_preview().await;
                TrialPhase::CapturePreview
            }
            TrialPhase::CapturePreview => {
                self.capture_preview().await;
                TrialPhase::FixationBeforeMultimodal
            }
            TrialPhase::FixationBeforeMultimodal => {
                self.fixation_before_multimodal().await;
                TrialPhase::Multimodal
            }
            TrialPhase::Multimodal => {
                self.multimodal().await;
                TrialPhase::FixationBeforeReward
            }
            TrialPhase::FixationBeforeReward => {
                self.plain_fixation().await;
                TrialPhase::Reward
            }
            TrialPhase::Reward => {
                self.reward().await;
                TrialPhase::FixationAfterReward
            }
            TrialPhase::FixationAfterReward => {
                self.plain_fixation().await;
                self.finish_trial()
            }
        };
        self.enter(next);
        Ok(next)
    }

    pub async fn run_trial(&mut self, capture: CapturedImage) -> Result<TrialOutcome, TrialError> {
        self.begin_trial(capture)?;
        loop {
            match self.advance().await? {
                TrialPhase::End => return Ok(TrialOutcome::RunComplete),
                TrialPhase::Uninitialized => return Ok(TrialOutcome::NextTrial(self.trial_number)),
                _ => {}
            }
        }
    }

    fn enter(&mut self, phase: TrialPhase) {
        self.phase = phase;
        debug!(trial = self.trial_number, phase = %phase, "entered phase");
        self.updates.send_replace(PhaseUpdate {
            trial: self.trial_number,
            phase,
        });
    }

    fn finish_trial(&mut self) -> TrialPhase {
        if self.trial_number >= self.info.total_number_of_trials {
            info!(trials = self.trial_number, "run complete");
            return TrialPhase::End;
        }
        self.trial_number += 1;
        self.mark_trial();
        TrialPhase::Uninitialized
    }

    fn trial_name(&self) -> String {
        format!("trial_{}", self.trial_number)
    }

    fn log(&self, message: &str) {
        if let Err(err) = self.etime.append(message) {
            warn!(error = %err, message, "failed to append etime marker");
        }
    }

    fn fixation_duration(&mut self) -> Duration {
        ms(jitter(
            self.info.fixation_duration_in_ms,
            self.info.fixation_jitter_ratio,
            &mut self.rng,
        ))
    }

    async fn plain_fixation(&mut self) {
        let duration = self.fixation_duration();
        let this = &*self;
        hold(duration, async move { this.log("trial_fixation") }).await;
    }

    async fn fixation_before_preview(&mut self) {
        let duration = self.fixation_duration();
        let this = &*self;
        hold(duration, async move {
            this.log("trial_fixation");
            if let Some(capture) = &this.capture {
                if let Err(err) = this.captures.store_image(&this.trial_name(), capture.as_base64()) {
                    warn!(error = %err, "failed to store capture");
                }
            }
        })
        .await;
    }

    async fn capture_preview(&mut self) {
        let this = &*self;
        let feature = hold(ms(self.info.capture_preview_duration_in_ms), async move {
            this.log("trial_preview");
            this.extract_image_feature().await
        })
        .await;
        self.image_feature = feature;
    }

    async fn extract_image_feature(&self) -> Option<Vec<f32>> {
        let capture = self.capture.as_ref()?;
        let tensor = match self.services.preprocess(capture) {
            Ok(tensor) => tensor,
            Err(err) => {
                warn!(trial = self.trial_number, error = %err, "image preprocessing failed");
                return None;
            }
        };
        let feature = match self.services.image_feature(&tensor).await {
            Ok(feature) => feature,
            Err(err) => {
                warn!(trial = self.trial_number, error = %err, "image feature unavailable");
                return None;
            }
        };
        let name = format!("image_feature_{}", self.trial_name());
        if let Err(err) = self.features.store_feature(&name, &feature) {
            warn!(error = %err, "failed to store image feature");
        }
        Some(feature)
    }

    async fn fixation_before_multimodal(&mut self) {
        let duration = self.fixation_duration();
        let wants_voice = self.rng.random::<f64>() >= self.info.probability_of_caption_text;
        let this = &*self;
        let (caption, voice) = hold(duration, async move {
            this.log("trial_fixation");
            this.describe_capture(wants_voice).await
        })
        .await;
        self.caption = caption;
        self.voice = voice;
    }

    async fn request_caption(&self, capture: &CapturedImage) -> Option<Caption> {
        for attempt in 1..=CAPTION_ATTEMPTS {
            match self.services.caption(capture).await {
                Ok(caption) => return Some(caption),
                Err(err) => {
                    warn!(trial = self.trial_number, attempt, error = %err, "caption request failed")
                }
            }
        }
        None
    }

    async fn describe_capture(&self, wants_voice: bool) -> (Caption, VoicePayload) {
        let caption = match &self.capture {
            Some(capture) => self.request_caption(capture).await,
            None => None,
        };
        let Some(caption) = caption else {
            self.log("trial_caption_unavailable");
            return (Caption::unavailable(), VoicePayload::none());
        };
        if !wants_voice || caption.text.trim().is_empty() {
            return (caption, VoicePayload::none());
        }
        match self
            .services
            .synthesize(&caption.text, self.info.speaking_rate)
            .await
        {
            Ok(voice) => {
                if let Err(err) = self.audio.store_audio(&self.trial_name(), voice.as_base64()) {
                    warn!(error = %err, "failed to store synthesized voice");
                }
                (caption, voice)
            }
            Err(err) => {
                warn!(trial = self.trial_number, error = %err, "speech unavailable; caption only");
                (caption, VoicePayload::none())
            }
        }
    }

    async fn multimodal(&mut self) {
        let modality = if self.voice.is_caption_only() {
            Modality::Caption
        } else {
            Modality::Voice
        };
        let message = format!(
            "trial_{}:{}/conf:{}",
            modality.as_str(),
            self.caption.text,
            self.caption.confidence
        );
        let this = &*self;
        hold(ms(self.info.multimodal_duration_in_ms), async move {
            this.log(&message);
            if modality == Modality::Voice {
                if let Err(err) = this.services.play(&this.voice).await {
                    warn!(trial = this.trial_number, error = %err, "voice playback failed");
                }
            }
        })
        .await;
    }

    async fn reward(&mut self) {
        let score = reward::score(
            self.image_feature.as_deref(),
            self.text_feature.as_deref(),
            self.info.min_similarity_threshold,
            self.info.max_similarity_threshold,
        );
        let this = &*self;
        hold(ms(self.info.reward_duration_in_ms), async move {
            this.log(&score.log_message())
        })
        .await;
        info!(
            trial = self.trial_number,
            similarity = score.similarity,
            percent = score.percent,
            "trial reward"
        );
        self.rewards.push(score);
    }
}
