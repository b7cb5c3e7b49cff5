use crate::explore::{CaptureKind, ControllerAction, ExplorationController, PanoramaView, SceneCamera};
use crate::registry::ResolvedRun;
use crate::reward::RewardScore;
use crate::trial::{hold, CapturedImage, PhaseUpdate, TrialMachine, TrialOutcome, TrialServices};
use anyhow::{bail, Context, Result};
use pano_core::EventLog;
use pano_settings::TrialInfo;
use rand::rngs::StdRng;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

pub const INSTRUCTION_DURATION: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct DirectoryCamera {
    frames: Vec<PathBuf>,
    next: usize,
}

impl DirectoryCamera {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut frames = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("cannot list scenes in {}", dir.display()))?;
            let is_png = entry
                .path()
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
            if entry.file_type().is_file() && is_png {
                frames.push(entry.into_path());
            }
        }
        if frames.is_empty() {
            bail!("no PNG scenes found in {}", dir.display());
        }
        frames.sort();
        Ok(Self { frames, next: 0 })
    }

    pub fn frames(&self) -> &[PathBuf] {
        &self.frames
    }
}

impl SceneCamera for DirectoryCamera {
    fn capture(&mut self) -> Result<CapturedImage> {
        let path = &self.frames[self.next % self.frames.len()];
        self.next += 1;
        let bytes = fs::read(path).with_context(|| format!("cannot read scene {}", path.display()))?;
        Ok(CapturedImage::from_png(&bytes))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub run_dir: PathBuf,
    pub trials: u32,
    pub manual_captures: u32,
    pub timeout_captures: u32,
    pub rewards: Vec<RewardScore>,
}

pub struct RunSession<S, V, C> {
    machine: TrialMachine<S>,
    controller: ExplorationController<V, C>,
    etime: EventLog,
    caption_target: String,
    run_dir: PathBuf,
}

impl<S, V, C> RunSession<S, V, C>
where
    S: TrialServices,
    V: PanoramaView,
    C: SceneCamera,
{
    pub fn new(run: &ResolvedRun, info: TrialInfo, services: S, view: V, camera: C, rng: StdRng) -> Self {
        let ws = &run.workspace;
        let controller = ExplorationController::new(
            view,
            camera,
            ws.etime_log(),
            ws.action_log(),
            Duration::from_millis(info.capture_interval_in_ms),
        );
        Self {
            machine: TrialMachine::new(services, info, ws, rng),
            controller,
            etime: ws.etime_log(),
            caption_target: run.run_info.caption_target.clone(),
            run_dir: ws.root.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PhaseUpdate> {
        self.machine.subscribe()
    }

    pub async fn run(&mut self, actions: &mut mpsc::Receiver<ControllerAction>) -> Result<SessionSummary> {
        self.log("sync");
        let etime = &self.etime;
        hold(INSTRUCTION_DURATION, async move { log_marker(etime, "instruction") }).await;
        self.machine.fixation_target(&self.caption_target).await;
        self.machine.mark_trial();

        let mut summary = SessionSummary {
            run_dir: self.run_dir.clone(),
            trials: 0,
            manual_captures: 0,
            timeout_captures: 0,
            rewards: Vec::new(),
        };
        loop {
            let capture = self
                .controller
                .explore(actions)
                .await
                .with_context(|| format!("capture failed in trial {}", self.machine.trial_number()))?;
            match capture.kind {
                CaptureKind::Manual => summary.manual_captures += 1,
                CaptureKind::Timeout => summary.timeout_captures += 1,
            }
            summary.trials += 1;
            if self.machine.run_trial(capture.image).await? == TrialOutcome::RunComplete {
                break;
            }
        }
        self.log("end");
        summary.rewards = self.machine.rewards().to_vec();
        info!(
            run = %self.run_dir.display(),
            trials = summary.trials,
            "session finished"
        );
        Ok(summary)
    }

    fn log(&self, marker: &str) {
        log_marker(&self.etime, marker);
    }
}

fn log_marker(etime: &EventLog, marker: &str) {
    if let Err(err) = etime.append(marker) {
        warn!(error = %err, marker, "failed to append etime marker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explore::PanoramaGraph;
    use crate::preprocess::ImageTensor;
    use crate::registry::resolve_run;
    use crate::services::ServiceError;
    use crate::trial::{Caption, VoicePayload};
    use chrono::Local;
    use pano_core::ensure_dir;
    use pano_settings::{LatLng, RunInfo};
    use rand::SeedableRng;
    use tokio::time::Instant;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "pano_session_{}_{}_{}",
            tag,
            std::process::id(),
            Local::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    struct StaticServices;

    impl TrialServices for StaticServices {
        fn preprocess(&self, _image: &CapturedImage) -> Result<ImageTensor, ServiceError> {
            ImageTensor::from_raw(vec![0.0; 3 * 224 * 224])
        }

        async fn image_feature(&self, _tensor: &ImageTensor) -> Result<Vec<f32>, ServiceError> {
            Ok(vec![1.0, 1.0])
        }

        async fn text_feature(&self, _text: &str) -> Result<Vec<f32>, ServiceError> {
            Ok(vec![1.0, 0.0])
        }

        async fn caption(&self, _image: &CapturedImage) -> Result<Caption, ServiceError> {
            Ok(Caption {
                text: "a quiet plaza".to_string(),
                confidence: 0.5,
            })
        }

        async fn synthesize(&self, _text: &str, _rate: f64) -> Result<VoicePayload, ServiceError> {
            Err(ServiceError::Speech("not used".to_string()))
        }

        async fn play(&self, _voice: &VoicePayload) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    fn info() -> TrialInfo {
        TrialInfo {
            capture_interval_in_ms: 2000,
            total_number_of_trials: 2,
            fixation_duration_in_ms: 1000,
            fixation_jitter_ratio: 0.0,
            capture_preview_duration_in_ms: 500,
            multimodal_duration_in_ms: 500,
            reward_duration_in_ms: 500,
            probability_of_caption_text: 1.0,
            min_similarity_threshold: 0.6,
            max_similarity_threshold: 0.8,
            ..TrialInfo::default()
        }
    }

    fn scenes(root: &Path) -> PathBuf {
        let dir = root.join("scenes");
        ensure_dir(&dir).expect("scenes dir");
        fs::write(dir.join("b.png"), b"second").expect("scene");
        fs::write(dir.join("a.png"), b"first").expect("scene");
        fs::write(dir.join("notes.txt"), b"skip").expect("other file");
        dir
    }

    #[test]
    fn camera_cycles_sorted_png_frames() {
        let root = temp_root("camera");
        let mut camera = DirectoryCamera::open(&scenes(&root)).expect("camera");
        assert_eq!(camera.frames().len(), 2);
        let shots: Vec<Vec<u8>> = (0..3)
            .map(|_| camera.capture().expect("capture").decode().expect("decode"))
            .collect();
        assert_eq!(shots, vec![b"first".to_vec(), b"second".to_vec(), b"first".to_vec()]);
        assert!(DirectoryCamera::open(&root.join("missing")).is_err());
        let empty = root.join("empty");
        ensure_dir(&empty).expect("empty dir");
        assert!(DirectoryCamera::open(&empty).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_logs_every_marker_in_order() {
        let root = temp_root("full");
        let config = vec![RunInfo {
            city: "Kyoto".to_string(),
            latlng: LatLng { lat: 35.0, lng: 135.7 },
            caption_target: "a temple gate".to_string(),
        }];
        let run = resolve_run(&root.join("data"), "ann", "p01", &config).expect("run");
        let camera = DirectoryCamera::open(&scenes(&root)).expect("camera");
        let mut session = RunSession::new(
            &run,
            info(),
            StaticServices,
            PanoramaGraph::single(35.0, 135.7),
            camera,
            StdRng::seed_from_u64(5),
        );
        let updates = session.subscribe();

        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(7000)).await;
            let _ = tx.send(ControllerAction::Left).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(ControllerAction::Capture).await;
        });

        let start = Instant::now();
        let summary = session.run(&mut rx).await.expect("session");
        // 5000 instruction + 1000 target, 1100 ms manual exploration, 5500 trial,
        // 2000 ms timed-out exploration, 5500 trial.
        assert_eq!(start.elapsed(), Duration::from_millis(20_100));
        assert_eq!(summary.trials, 2);
        assert_eq!(summary.manual_captures, 1);
        assert_eq!(summary.timeout_captures, 1);
        assert_eq!(summary.rewards.len(), 2);
        // cos = 1/sqrt(2) ~ 0.707, halfway-ish between 0.6 and 0.8.
        assert!(summary.rewards[0].percent > 50.0 && summary.rewards[0].percent < 55.0);
        assert_eq!(updates.borrow().phase, crate::trial::TrialPhase::End);

        let etime = fs::read_to_string(run.workspace.etime_log().path()).expect("etime");
        let messages: Vec<&str> = etime
            .lines()
            .filter_map(|l| l.split_once('\t').map(|(_, m)| m))
            .collect();
        let trial = [
            "trial_fixation",
            "trial_preview",
            "trial_fixation",
            "trial_caption:a quiet plaza/conf:0.5",
            "trial_fixation",
            messages[10],
            "trial_fixation",
        ];
        let mut expected = vec!["sync", "instruction", "fixation_target", "trial_1", "capture"];
        expected.extend(trial);
        expected.extend(["trial_2", "capture_failed"]);
        expected.extend(trial);
        expected.push("end");
        assert_eq!(messages, expected);
        assert!(messages[10].starts_with("trial_reward:0.7071"), "{}", messages[10]);

        assert_eq!(
            fs::read(run.workspace.capture.join("trial_1.png")).expect("trial 1 capture"),
            b"first"
        );
        assert_eq!(
            fs::read(run.workspace.capture.join("trial_2.png")).expect("trial 2 capture"),
            b"second"
        );
        assert!(run.workspace.feature_vector.join("text_feature.json").is_file());

        let actions = fs::read_to_string(run.workspace.action_log().path()).expect("actions");
        let lines: Vec<&str> = actions.lines().collect();
        assert_eq!(lines.len(), 4, "{}", actions);
        assert!(lines[0].ends_with("\ttrial_1"));
        assert!(lines[1].contains("\"action\":\"left\""));
        assert!(lines[2].contains("\"action\":\"capture\""));
        assert!(lines[3].ends_with("\ttrial_2"));
        let _ = fs::remove_dir_all(root);
    }
}
