pub mod explore;
pub mod preprocess;
pub mod registry;
pub mod reward;
pub mod services;
pub mod session;
pub mod trial;

pub use explore::{
    circular_difference, select_link, Capture, CaptureKind, ControllerAction, ExplorationController,
    Link, PanoramaGraph, PanoramaView, Pov, SceneCamera,
};
pub use preprocess::{preprocess_for_clip, ImageTensor};
pub use registry::{
    participant_status, resolve_run, resolve_run_with_rng, select_run, select_run_with_rng, ManifestEntry,
    Participant, RegistryError, ResolvedRun, RunManifest, RunStatus, RunWorkspace,
};
pub use reward::{cosine_similarity, score, RewardScore};
pub use services::{
    AudioPlayer, AzureCaptioner, EncoderError, EncoderHandle, FeatureEncoder, GoogleSpeech,
    HttpEncoder, RemoteServices, ServiceError, SilentPlayer,
};
pub use session::{DirectoryCamera, RunSession, SessionSummary};
pub use trial::{
    jitter, CapturedImage, Caption, PhaseUpdate, TrialError, TrialMachine, TrialOutcome,
    TrialPhase, TrialServices, VoicePayload,
};
