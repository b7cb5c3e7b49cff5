use crate::trial::CapturedImage;
use pano_core::EventLog;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const VIEWPOINT_STEP_DEGREES: f64 = 0.8;
pub const VIEWPOINT_INTERVAL: Duration = Duration::from_millis(20);
pub const LOCATION_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerAction {
    Stop,
    Up,
    Down,
    Left,
    Right,
    Capture,
}

impl ControllerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerAction::Stop => "stop",
            ControllerAction::Up => "up",
            ControllerAction::Down => "down",
            ControllerAction::Left => "left",
            ControllerAction::Right => "right",
            ControllerAction::Capture => "capture",
        }
    }
}

impl fmt::Display for ControllerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControllerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(ControllerAction::Stop),
            "up" => Ok(ControllerAction::Up),
            "down" => Ok(ControllerAction::Down),
            "left" => Ok(ControllerAction::Left),
            "right" => Ok(ControllerAction::Right),
            "capture" => Ok(ControllerAction::Capture),
            other => Err(format!("unknown controller action: {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pov {
    pub heading: f64,
    pub pitch: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub pano: String,
    pub heading: f64,
}

pub trait PanoramaView {
    fn pov(&self) -> Pov;
    fn set_pov(&mut self, pov: Pov);
    fn position(&self) -> String;
    fn links(&self) -> Vec<Link>;
    fn set_pano(&mut self, pano: &str);
}

pub trait SceneCamera {
    fn capture(&mut self) -> anyhow::Result<CapturedImage>;
}

pub fn circular_difference(a: f64, b: f64) -> f64 {
    let diff = (a.rem_euclid(360.0) - b.rem_euclid(360.0)).abs();
    diff.min(360.0 - diff)
}

// Forward picks the link closest to `heading`, backward the farthest.
// Ties resolve to the earliest link for forward and the latest for backward.
pub fn select_link(links: &[Link], heading: f64, backward: bool) -> Option<&Link> {
    let by_diff = |a: &&Link, b: &&Link| {
        circular_difference(a.heading, heading).total_cmp(&circular_difference(b.heading, heading))
    };
    if backward {
        links.iter().max_by(by_diff)
    } else {
        links.iter().min_by(by_diff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Movement {
    Rotate(f64),
    Forward,
    Backward,
}

impl Movement {
    fn for_action(action: ControllerAction) -> Option<Self> {
        match action {
            ControllerAction::Left => Some(Movement::Rotate(-VIEWPOINT_STEP_DEGREES)),
            ControllerAction::Right => Some(Movement::Rotate(VIEWPOINT_STEP_DEGREES)),
            ControllerAction::Up => Some(Movement::Forward),
            ControllerAction::Down => Some(Movement::Backward),
            ControllerAction::Stop | ControllerAction::Capture => None,
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            Movement::Rotate(_) => VIEWPOINT_INTERVAL,
            Movement::Forward | Movement::Backward => LOCATION_INTERVAL,
        }
    }

    pub fn apply<V: PanoramaView + ?Sized>(&self, view: &mut V) {
        match self {
            Movement::Rotate(step) => {
                let pov = view.pov();
                view.set_pov(Pov {
                    heading: pov.heading + step,
                    pitch: pov.pitch,
                });
            }
            Movement::Forward | Movement::Backward => {
                let heading = view.pov().heading;
                let links = view.links();
                if let Some(link) = select_link(&links, heading, *self == Movement::Backward) {
                    let pano = link.pano.clone();
                    view.set_pano(&pano);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct Repeater {
    movement: Movement,
    ticker: Interval,
}

impl Repeater {
    pub fn start(movement: Movement) -> Self {
        let mut ticker = time::interval(movement.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { movement, ticker }
    }

    pub fn movement(&self) -> Movement {
        self.movement
    }

    pub async fn tick(&mut self) -> Movement {
        self.ticker.tick().await;
        self.movement
    }
}

async fn next_tick(repeater: &mut Option<Repeater>) -> Movement {
    match repeater {
        Some(r) => r.tick().await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Manual,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct Capture {
    pub kind: CaptureKind,
    pub image: CapturedImage,
}

pub struct ExplorationController<V, C> {
    view: V,
    camera: C,
    etime: EventLog,
    actions: EventLog,
    capture_timeout: Duration,
    repeater: Option<Repeater>,
}

impl<V: PanoramaView, C: SceneCamera> ExplorationController<V, C> {
    pub fn new(view: V, camera: C, etime: EventLog, actions: EventLog, capture_timeout: Duration) -> Self {
        Self {
            view,
            camera,
            etime,
            actions,
            capture_timeout,
            repeater: None,
        }
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn is_repeating(&self) -> bool {
        self.repeater.is_some()
    }

    pub async fn explore(&mut self, actions: &mut mpsc::Receiver<ControllerAction>) -> anyhow::Result<Capture> {
        let mut stale = 0usize;
        while actions.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "dropped actions received outside exploration");
        }

        let deadline = time::sleep_until(Instant::now() + self.capture_timeout);
        tokio::pin!(deadline);
        let mut stream_open = true;
        loop {
            tokio::select! {
                biased;
                action = actions.recv(), if stream_open => match action {
                    Some(ControllerAction::Capture) => {
                        self.record_action(ControllerAction::Capture);
                        return self.finish(CaptureKind::Manual);
                    }
                    Some(action) => self.handle(action),
                    None => {
                        stream_open = false;
                        info!("action stream closed; waiting for capture deadline");
                    }
                },
                movement = next_tick(&mut self.repeater) => movement.apply(&mut self.view),
                () = &mut deadline => return self.finish(CaptureKind::Timeout),
            }
        }
    }

    fn handle(&mut self, action: ControllerAction) {
        self.record_action(action);
        self.repeater = Movement::for_action(action).map(Repeater::start);
    }

    fn finish(&mut self, kind: CaptureKind) -> anyhow::Result<Capture> {
        self.repeater = None;
        let marker = match kind {
            CaptureKind::Manual => "capture",
            CaptureKind::Timeout => "capture_failed",
        };
        if let Err(err) = self.etime.append(marker) {
            warn!(error = %err, marker, "failed to append etime marker");
        }
        let image = self.camera.capture()?;
        Ok(Capture { kind, image })
    }

    fn record_action(&self, action: ControllerAction) {
        let pov = self.view.pov();
        let line = json!({
            "action": action.as_str(),
            "coordinate": self.view.position(),
            "pov": { "heading": pov.heading, "pitch": pov.pitch },
        });
        if let Err(err) = self.actions.append(&line.to_string()) {
            warn!(error = %err, %action, "failed to append controller action");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PanoramaNode {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PanoramaGraph {
    pub start: String,
    pub nodes: BTreeMap<String, PanoramaNode>,
    #[serde(skip)]
    current: String,
    #[serde(skip, default = "default_pov")]
    pov: Pov,
}

fn default_pov() -> Pov {
    Pov {
        heading: 0.0,
        pitch: 0.0,
    }
}

impl PanoramaGraph {
    pub fn single(lat: f64, lng: f64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "start".to_string(),
            PanoramaNode {
                lat,
                lng,
                links: Vec::new(),
            },
        );
        Self::from_nodes("start", nodes)
    }

    pub fn from_nodes(start: &str, nodes: BTreeMap<String, PanoramaNode>) -> Self {
        Self {
            start: start.to_string(),
            nodes,
            current: start.to_string(),
            pov: default_pov(),
        }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let parsed: PanoramaGraph = serde_json::from_str(raw)?;
        if !parsed.nodes.contains_key(&parsed.start) {
            anyhow::bail!("start panorama {:?} is not a node", parsed.start);
        }
        for (id, node) in &parsed.nodes {
            if let Some(link) = node.links.iter().find(|l| !parsed.nodes.contains_key(&l.pano)) {
                anyhow::bail!("panorama {:?} links to unknown panorama {:?}", id, link.pano);
            }
        }
        Ok(Self::from_nodes(&parsed.start, parsed.nodes))
    }

    pub fn current(&self) -> &str {
        &self.current
    }
}

impl PanoramaView for PanoramaGraph {
    fn pov(&self) -> Pov {
        self.pov
    }

    fn set_pov(&mut self, pov: Pov) {
        self.pov = pov;
    }

    fn position(&self) -> String {
        match self.nodes.get(&self.current) {
            Some(node) => format!("({}, {})", node.lat, node.lng),
            None => "(unknown)".to_string(),
        }
    }

    fn links(&self) -> Vec<Link> {
        self.nodes
            .get(&self.current)
            .map(|node| node.links.clone())
            .unwrap_or_default()
    }

    fn set_pano(&mut self, pano: &str) {
        if self.nodes.contains_key(pano) {
            self.current = pano.to_string();
        } else {
            warn!(pano, "ignoring move to unknown panorama");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use pano_core::ensure_dir;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "pano_explore_{}_{}_{}",
            tag,
            std::process::id(),
            Local::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    struct CountingCamera {
        shots: usize,
    }

    impl SceneCamera for CountingCamera {
        fn capture(&mut self) -> anyhow::Result<CapturedImage> {
            self.shots += 1;
            Ok(CapturedImage::new(format!("shot{}", self.shots)))
        }
    }

    fn link(pano: &str, heading: f64) -> Link {
        Link {
            pano: pano.to_string(),
            heading,
        }
    }

    fn graph() -> PanoramaGraph {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "a".to_string(),
            PanoramaNode {
                lat: 1.0,
                lng: 2.0,
                links: vec![link("b", 10.0), link("c", 190.0)],
            },
        );
        nodes.insert(
            "b".to_string(),
            PanoramaNode {
                lat: 1.5,
                lng: 2.5,
                links: vec![link("a", 190.0)],
            },
        );
        nodes.insert(
            "c".to_string(),
            PanoramaNode {
                lat: 0.5,
                lng: 1.5,
                links: vec![link("a", 10.0)],
            },
        );
        PanoramaGraph::from_nodes("a", nodes)
    }

    fn controller(
        root: &std::path::Path,
        timeout_ms: u64,
    ) -> ExplorationController<PanoramaGraph, CountingCamera> {
        ExplorationController::new(
            graph(),
            CountingCamera { shots: 0 },
            EventLog::etime(root),
            EventLog::controller_actions(root),
            Duration::from_millis(timeout_ms),
        )
    }

    fn messages(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.split_once('\t').map(|(_, m)| m.to_string()))
            .collect()
    }

    #[test]
    fn actions_parse_from_words() {
        assert_eq!("Left".parse::<ControllerAction>(), Ok(ControllerAction::Left));
        assert_eq!(" capture\n".parse::<ControllerAction>(), Ok(ControllerAction::Capture));
        assert!("jump".parse::<ControllerAction>().is_err());
    }

    #[test]
    fn circular_difference_wraps_around_north() {
        assert_eq!(circular_difference(350.0, 10.0), 20.0);
        assert_eq!(circular_difference(-10.0, 10.0), 20.0);
        assert_eq!(circular_difference(720.0 + 5.0, 0.0), 5.0);
        assert_eq!(circular_difference(0.0, 180.0), 180.0);
    }

    #[test]
    fn link_selection_uses_circular_distance() {
        let links = vec![link("east", 90.0), link("north", 355.0), link("south", 180.0)];
        assert_eq!(select_link(&links, 5.0, false).map(|l| l.pano.as_str()), Some("north"));
        assert_eq!(select_link(&links, 5.0, true).map(|l| l.pano.as_str()), Some("south"));
        assert_eq!(select_link(&[], 5.0, false), None);
    }

    #[test]
    fn link_selection_ties_follow_list_order() {
        let links = vec![link("first", 10.0), link("second", 350.0)];
        assert_eq!(select_link(&links, 0.0, false).map(|l| l.pano.as_str()), Some("first"));
        assert_eq!(select_link(&links, 0.0, true).map(|l| l.pano.as_str()), Some("second"));
    }

    // Feeds `steps` into a fresh action stream at the given offsets (ms)
    // and closes it afterwards.
    fn script(steps: Vec<(u64, ControllerAction)>) -> mpsc::Receiver<ControllerAction> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let start = Instant::now();
            for (at, action) in steps {
                time::sleep_until(start + Duration::from_millis(at)).await;
                if tx.send(action).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_forces_a_capture() {
        let root = temp_root("deadline");
        let mut ctl = controller(&root, 20_000);
        let (_tx, mut rx) = mpsc::channel(8);
        let start = Instant::now();
        let capture = ctl.explore(&mut rx).await.expect("capture");
        assert_eq!(capture.kind, CaptureKind::Timeout);
        assert_eq!(capture.image.as_base64(), "shot1");
        assert_eq!(start.elapsed(), Duration::from_millis(20_000));
        assert_eq!(messages(&root.join("log_etime.txt")), vec!["capture_failed"]);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_still_waits_for_deadline() {
        let root = temp_root("closed");
        let mut ctl = controller(&root, 3_000);
        let (tx, mut rx) = mpsc::channel::<ControllerAction>(8);
        drop(tx);
        let start = Instant::now();
        let capture = ctl.explore(&mut rx).await.expect("capture");
        assert_eq!(capture.kind, CaptureKind::Timeout);
        assert_eq!(start.elapsed(), Duration::from_millis(3_000));
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_capture_wins_and_suppresses_deadline() {
        let root = temp_root("manual");
        let mut ctl = controller(&root, 20_000);
        let mut rx = script(vec![(500, ControllerAction::Capture)]);
        let start = Instant::now();
        let capture = ctl.explore(&mut rx).await.expect("capture");
        assert_eq!(capture.kind, CaptureKind::Manual);
        assert_eq!(start.elapsed(), Duration::from_millis(500));

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(messages(&root.join("log_etime.txt")), vec!["capture"]);
        let actions = messages(&root.join("controller_action.txt"));
        assert_eq!(actions.len(), 1);
        let logged: serde_json::Value = serde_json::from_str(&actions[0]).expect("json action");
        assert_eq!(logged["action"], "capture");
        assert_eq!(logged["coordinate"], "(1, 2)");
        assert_eq!(logged["pov"]["heading"], 0.0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_repeats_until_stopped() {
        let root = temp_root("rotate");
        let mut ctl = controller(&root, 20_000);
        let mut rx = script(vec![
            (1, ControllerAction::Right),
            (111, ControllerAction::Stop),
            (500, ControllerAction::Capture),
        ]);
        ctl.explore(&mut rx).await.expect("capture");
        // Ticks at 1, 21, 41, 61, 81 and 101 ms.
        let heading = ctl.view().pov().heading;
        assert!((heading - 6.0 * VIEWPOINT_STEP_DEGREES).abs() < 1e-9, "{}", heading);
        assert!(!ctl.is_repeating());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test(start_paused = true)]
    async fn new_direction_replaces_previous_repetition() {
        let root = temp_root("replace");
        let mut ctl = controller(&root, 20_000);
        let mut rx = script(vec![
            (1, ControllerAction::Right),
            (11, ControllerAction::Left),
            (500, ControllerAction::Capture),
        ]);
        ctl.explore(&mut rx).await.expect("capture");
        // One right step at 1 ms, then left steps from 11 ms every 20 ms up to 491 ms.
        let expected = (1.0 - 25.0) * VIEWPOINT_STEP_DEGREES;
        let heading = ctl.view().pov().heading;
        assert!((heading - expected).abs() < 1e-9, "{} vs {}", heading, expected);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test(start_paused = true)]
    async fn up_and_down_follow_links() {
        let root = temp_root("links");
        let mut ctl = controller(&root, 20_000);
        let mut rx = script(vec![(1, ControllerAction::Up), (500, ControllerAction::Capture)]);
        ctl.explore(&mut rx).await.expect("capture");
        assert_eq!(ctl.view().current(), "b");

        let mut ctl = controller(&root, 20_000);
        let mut rx = script(vec![(1, ControllerAction::Down), (500, ControllerAction::Capture)]);
        ctl.explore(&mut rx).await.expect("capture");
        assert_eq!(ctl.view().current(), "c");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test(start_paused = true)]
    async fn actions_queued_between_periods_are_dropped() {
        let root = temp_root("stale");
        let mut ctl = controller(&root, 2_000);
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ControllerAction::Capture).await.expect("send");
        let capture = ctl.explore(&mut rx).await.expect("capture");
        assert_eq!(capture.kind, CaptureKind::Timeout);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn graph_json_is_validated() {
        let good = r#"{"start":"a","nodes":{"a":{"lat":1,"lng":2,"links":[{"pano":"b","heading":90}]},"b":{"lat":1,"lng":3}}}"#;
        let graph = PanoramaGraph::from_json(good).expect("graph");
        assert_eq!(graph.current(), "a");
        assert_eq!(graph.position(), "(1, 2)");

        let dangling = r#"{"start":"a","nodes":{"a":{"lat":1,"lng":2,"links":[{"pano":"z","heading":90}]}}}"#;
        assert!(PanoramaGraph::from_json(dangling).is_err());
        assert!(PanoramaGraph::from_json(r#"{"start":"q","nodes":{}}"#).is_err());
    }
}
