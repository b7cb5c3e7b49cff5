use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Local;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ETIME_LOG_FILE: &str = "log_etime.txt";
pub const CONTROLLER_ACTION_FILE: &str = "controller_action.txt";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid base64 payload for {name}: {source}")]
    Decode {
        name: String,
        source: base64::DecodeError,
    },
    #[error("invalid feature vector in {path}: {source}")]
    Feature {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| CoreError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let write_err = |source| CoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let ts = Local::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp).map_err(write_err)?;
    file.write_all(bytes).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}

pub fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

// Appends `"{timestamp}\t{message}\n"`, creating the file if needed.
// The parent directory must already exist.
pub fn append_timestamped_line(path: &Path, message: &str) -> Result<String> {
    let now = timestamp_now();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| CoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(format!("{}\t{}\n", now, single_line(message)).as_bytes())
        .map_err(|source| CoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(now)
}

// One event per line: control characters (tabs, newlines) become spaces.
fn single_line(message: &str) -> String {
    message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn etime(run_root: &Path) -> Self {
        Self::new(run_root.join(ETIME_LOG_FILE))
    }

    pub fn controller_actions(run_root: &Path) -> Self {
        Self::new(run_root.join(CONTROLLER_ACTION_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) -> Result<String> {
        append_timestamped_line(&self.path, message)
    }
}

pub fn decode_base64_payload(name: &str, payload: &str) -> Result<Vec<u8>> {
    let body = match payload.split_once(";base64,") {
        Some((head, rest)) if head.starts_with("data:") => rest,
        _ => payload,
    };
    STANDARD
        .decode(body.trim())
        .map_err(|source| CoreError::Decode {
            name: name.to_string(),
            source,
        })
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, extension))
    }

    pub fn store_base64(&self, name: &str, extension: &str, payload: &str) -> Result<PathBuf> {
        let bytes = decode_base64_payload(name, payload)?;
        let path = self.path_for(name, extension);
        fs::write(&path, bytes).map_err(|source| CoreError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn store_image(&self, name: &str, base64_png: &str) -> Result<PathBuf> {
        self.store_base64(name, "png", base64_png)
    }

    pub fn store_audio(&self, name: &str, base64_mp3: &str) -> Result<PathBuf> {
        self.store_base64(name, "mp3", base64_mp3)
    }

    pub fn store_feature(&self, name: &str, feature: &[f32]) -> Result<PathBuf> {
        let path = self.path_for(name, "json");
        let bytes = serde_json::to_vec(feature).map_err(|source| CoreError::Feature {
            path: path.clone(),
            source,
        })?;
        atomic_write_bytes(&path, &bytes)?;
        Ok(path)
    }
}

pub fn load_feature(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path).map_err(|source| CoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| CoreError::Feature {
        path: path.to_path_buf(),
        source,
    })
}
