use pano_core::{atomic_write_bytes, ensure_dir, ArtifactStore, CoreError, EventLog};
use pano_settings::RunInfo;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "runinfo.txt";
pub const CAPTURE_DIR: &str = "capture";
pub const FEATURE_VECTOR_DIR: &str = "feature_vector";
pub const CAPTION_AUDIO_DIR: &str = "caption_audio";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(String),
    #[error("cannot prepare {path}: {source}")]
    Workspace {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] CoreError),
    #[error("malformed run manifest {path}: {detail}")]
    Manifest { path: PathBuf, detail: String },
    #[error("participant {participant} has completed every run")]
    AllRunsCompleted { participant: String },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Validation(_) => "validation_error",
            RegistryError::Workspace { .. } | RegistryError::Store(_) => "workspace_error",
            RegistryError::Manifest { .. } => "manifest_error",
            RegistryError::AllRunsCompleted { .. } => "all_runs_completed",
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    name: String,
    id: String,
}

impl Participant {
    pub fn new(name: &str, id: &str) -> Result<Self> {
        Ok(Self {
            name: validate_component("name", name)?,
            id: validate_component("id", id)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.id, self.name)
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

fn validate_component(field: &str, raw: &str) -> Result<String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(RegistryError::Validation(format!(
            "participant {} must not be empty",
            field
        )));
    }
    if value.contains(['/', '\\', '\0']) || value.contains("..") {
        return Err(RegistryError::Validation(format!(
            "participant {} contains a path separator or '..': {:?}",
            field, value
        )));
    }
    Ok(value.to_string())
}

// Collapses whitespace runs to `_` and replaces characters that would
// break the manifest line or the run directory name.
pub fn sanitize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut in_space = false;
    for ch in label.chars() {
        if ch.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        match ch {
            '/' | '\\' | '#' | '\0' => out.push('_'),
            other => out.push(other),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub sequence: usize,
    pub label: String,
    pub original_index: usize,
}

impl ManifestEntry {
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.sequence, self.label)
    }

    pub fn to_line(&self) -> String {
        format!("{}#{}", self.dir_name(), self.original_index)
    }

    pub fn parse(line: &str) -> Option<Self> {
        let (dir, index) = line.rsplit_once('#')?;
        let (sequence, label) = dir.split_once('_')?;
        Some(Self {
            sequence: sequence.parse().ok()?,
            label: label.to_string(),
            original_index: index.trim().parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunManifest {
    pub entries: Vec<ManifestEntry>,
}

impl RunManifest {
    pub fn shuffled<R: Rng + ?Sized>(runs: &[RunInfo], rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..runs.len()).collect();
        order.shuffle(rng);
        let entries = order
            .into_iter()
            .enumerate()
            .map(|(pos, original_index)| ManifestEntry {
                sequence: pos + 1,
                label: sanitize_label(&runs[original_index].city),
                original_index,
            })
            .collect();
        Self { entries }
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(ManifestEntry::to_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = ManifestEntry::parse(line).ok_or_else(|| RegistryError::Manifest {
                path: path.to_path_buf(),
                detail: format!("line {} is not '<seq>_<label>#<index>': {:?}", idx + 1, line),
            })?;
            entries.push(entry);
        }
        if entries.is_empty() {
            return Err(RegistryError::Manifest {
                path: path.to_path_buf(),
                detail: "manifest lists no runs".to_string(),
            });
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| RegistryError::Workspace {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &text)
    }

    pub fn remaining<'a>(&'a self, completed: &'a [String]) -> impl Iterator<Item = &'a ManifestEntry> {
        self.entries
            .iter()
            .filter(move |entry| !completed.contains(&entry.dir_name()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWorkspace {
    pub root: PathBuf,
    pub capture: PathBuf,
    pub feature_vector: PathBuf,
    pub caption_audio: PathBuf,
}

impl RunWorkspace {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            capture: root.join(CAPTURE_DIR),
            feature_vector: root.join(FEATURE_VECTOR_DIR),
            caption_audio: root.join(CAPTION_AUDIO_DIR),
        }
    }

    pub fn create(&self) -> std::result::Result<(), CoreError> {
        for dir in [&self.root, &self.capture, &self.feature_vector, &self.caption_audio] {
            ensure_dir(dir)?;
        }
        Ok(())
    }

    pub fn etime_log(&self) -> EventLog {
        EventLog::etime(&self.root)
    }

    pub fn action_log(&self) -> EventLog {
        EventLog::controller_actions(&self.root)
    }

    pub fn capture_store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.capture)
    }

    pub fn feature_store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.feature_vector)
    }

    pub fn audio_store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.caption_audio)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRun {
    pub participant: Participant,
    pub participant_dir: PathBuf,
    pub workspace: RunWorkspace,
    pub entry: ManifestEntry,
    pub run_number: usize,
    pub total_runs: usize,
    pub first_registration: bool,
    pub run_info: RunInfo,
}

impl ResolvedRun {
    pub fn status_message(&self) -> String {
        let verb = if self.first_registration {
            "registered"
        } else {
            "loaded"
        };
        format!(
            "Participant {} ({}, Run {})",
            verb,
            self.participant.dir_name(),
            self.run_number
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    pub entry: ManifestEntry,
    pub completed: bool,
}

pub fn resolve_run(root: &Path, name: &str, id: &str, runs: &[RunInfo]) -> Result<ResolvedRun> {
    resolve_run_with_rng(root, name, id, runs, &mut rand::rng())
}

pub fn select_run(root: &Path, name: &str, id: &str, runs: &[RunInfo]) -> Result<ResolvedRun> {
    select_run_with_rng(root, name, id, runs, &mut rand::rng())
}

pub fn resolve_run_with_rng<R: Rng + ?Sized>(
    root: &Path,
    name: &str,
    id: &str,
    runs: &[RunInfo],
    rng: &mut R,
) -> Result<ResolvedRun> {
    let resolved = select_run_with_rng(root, name, id, runs, rng)?;
    prepare_workspace(&resolved.workspace)?;
    debug!(run = %resolved.workspace.root.display(), "run workspace ready");
    Ok(resolved)
}

pub fn select_run_with_rng<R: Rng + ?Sized>(
    root: &Path,
    name: &str,
    id: &str,
    runs: &[RunInfo],
    rng: &mut R,
) -> Result<ResolvedRun> {
    let participant = Participant::new(name, id)?;
    if runs.is_empty() {
        return Err(RegistryError::Validation(
            "run configuration list is empty".to_string(),
        ));
    }
    let participant_dir = participant_dir(root, &participant)?;
    let manifest_path = participant_dir.join(MANIFEST_FILE);

    let mut first_registration = !participant_dir.exists();
    if first_registration {
        ensure_dir(&participant_dir)?;
    }
    let completed = completed_runs(&participant_dir)?;
    if !manifest_path.exists() {
        // A directory without a manifest and without runs is an interrupted
        // first registration; anything else cannot be resumed safely.
        if !completed.is_empty() {
            return Err(RegistryError::Manifest {
                path: manifest_path,
                detail: "manifest is missing but run directories exist".to_string(),
            });
        }
        let manifest = RunManifest::shuffled(runs, rng);
        atomic_write_bytes(&manifest_path, manifest.render().as_bytes())?;
        info!(participant = %participant, runs = manifest.entries.len(), "wrote run manifest");
        first_registration = true;
    }

    let manifest = RunManifest::load(&manifest_path)?;
    let total_runs = manifest.entries.len();
    let entry = manifest
        .remaining(&completed)
        .next()
        .cloned()
        .ok_or_else(|| RegistryError::AllRunsCompleted {
            participant: participant.dir_name(),
        })?;
    let run_info = runs
        .get(entry.original_index)
        .cloned()
        .ok_or_else(|| RegistryError::Manifest {
            path: manifest_path.clone(),
            detail: format!(
                "run index {} is outside the {} configured runs",
                entry.original_index,
                runs.len()
            ),
        })?;
    let run_number = manifest
        .entries
        .iter()
        .position(|e| e == &entry)
        .map_or(entry.sequence, |pos| pos + 1);

    let workspace = RunWorkspace::new(&participant_dir.join(entry.dir_name()));
    Ok(ResolvedRun {
        participant,
        participant_dir,
        workspace,
        entry,
        run_number,
        total_runs,
        first_registration,
        run_info,
    })
}

pub fn participant_status(root: &Path, name: &str, id: &str) -> Result<Option<Vec<RunStatus>>> {
    let participant = Participant::new(name, id)?;
    let participant_dir = participant_dir(root, &participant)?;
    let manifest_path = participant_dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Ok(None);
    }
    let manifest = RunManifest::load(&manifest_path)?;
    let completed = completed_runs(&participant_dir)?;
    Ok(Some(
        manifest
            .entries
            .into_iter()
            .map(|entry| RunStatus {
                completed: completed.contains(&entry.dir_name()),
                entry,
            })
            .collect(),
    ))
}

fn participant_dir(root: &Path, participant: &Participant) -> Result<PathBuf> {
    let root = if root.is_absolute() {
        normalize_path(root)
    } else {
        let cwd = std::env::current_dir().map_err(|source| RegistryError::Workspace {
            path: root.to_path_buf(),
            source,
        })?;
        normalize_path(&cwd.join(root))
    };
    let dir = normalize_path(&root.join(participant.dir_name()));
    if dir.parent() != Some(root.as_path()) {
        return Err(RegistryError::Validation(format!(
            "participant directory escapes data root: {}",
            dir.display()
        )));
    }
    Ok(dir)
}

fn prepare_workspace(workspace: &RunWorkspace) -> Result<()> {
    if let Err(err) = workspace.create() {
        // A leftover run directory would be counted as a started run.
        let _ = fs::remove_dir_all(&workspace.root);
        return Err(err.into());
    }
    Ok(())
}

fn completed_runs(participant_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in WalkDir::new(participant_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|err| RegistryError::Workspace {
            path: participant_dir.to_path_buf(),
            source: err
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
        })?;
        if entry.file_type().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
