use facecomp_core::{GenerationParams, IdentityMode, ModeFlags, SwapModel};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("unknown identity mode '{0}' (expected none, standard, faceid, faceid_plus, dual or clip_blend)")]
    UnknownMode(String),
    #[error("{0}")]
    SwapModel(String),
}

/// Daemon configuration: `FACECOMP_*` environment variables, optionally
/// overlaid by the TOML file named in `FACECOMP_CONFIG`.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Parent of the per-job run folders.
    pub outputs_dir: PathBuf,
    /// Identity mode fixed at startup.
    pub identity_mode: String,
    /// Swap network loaded at startup.
    pub swap_model: SwapModel,
    /// Jobs that may wait behind the running one.
    pub queue_depth: usize,
}

/// The subset of [`Config`] a file may override.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    model_dir: Option<PathBuf>,
    outputs_dir: Option<PathBuf>,
    identity_mode: Option<String>,
    swap_model: Option<SwapModel>,
    queue_depth: Option<usize>,
}

impl Config {
    /// Environment first, then the file in `FACECOMP_CONFIG` if set.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("FACECOMP_CONFIG") {
            config.overlay_file(Path::new(&path))?;
        }
        Ok(config)
    }

    /// Load configuration from `FACECOMP_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let swap_model = match std::env::var("FACECOMP_SWAP_MODEL") {
            Ok(v) => v.parse().map_err(ConfigError::SwapModel)?,
            Err(_) => SwapModel::default(),
        };
        Ok(Self {
            model_dir: facecomp_core::default_model_dir(),
            outputs_dir: std::env::var("FACECOMP_OUTPUTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("outputs")),
            identity_mode: std::env::var("FACECOMP_IDENTITY_MODE").unwrap_or_else(|_| "standard".to_string()),
            swap_model,
            queue_depth: env_usize("FACECOMP_QUEUE_DEPTH", 4).max(1),
        })
    }

    fn overlay_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "config file loaded");

        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.outputs_dir {
            self.outputs_dir = v;
        }
        if let Some(v) = file.identity_mode {
            self.identity_mode = v;
        }
        if let Some(v) = file.swap_model {
            self.swap_model = v;
        }
        if let Some(v) = file.queue_depth {
            self.queue_depth = v.max(1);
        }
        Ok(())
    }

    /// The configured mode, with default tunables; requests refresh them.
    pub fn mode(&self) -> Result<IdentityMode, ConfigError> {
        let mut flags = ModeFlags::default();
        match self.identity_mode.to_ascii_lowercase().as_str() {
            "none" => return Ok(IdentityMode::None),
            "standard" => flags.standard = true,
            "faceid" => flags.faceid = true,
            "faceid_plus" | "faceid-plus" => flags.faceid_plus = true,
            "dual" => flags.dual = true,
            "clip_blend" | "clip-blend" => flags.clip_blend = true,
            other => return Err(ConfigError::UnknownMode(other.to_string())),
        }
        Ok(flags.select(&GenerationParams::default()))
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base() -> Config {
        Config {
            model_dir: PathBuf::from("/models"),
            outputs_dir: PathBuf::from("outputs"),
            identity_mode: "standard".into(),
            swap_model: SwapModel::InSwapper,
            queue_depth: 4,
        }
    }

    #[test]
    fn test_overlay_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "identity_mode = \"faceid_plus\"\nswap_model = \"ghost\"\nqueue_depth = 0").unwrap();
        let mut c = base();
        c.overlay_file(f.path()).unwrap();
        assert_eq!(c.swap_model, SwapModel::Ghost);
        assert_eq!(c.queue_depth, 1);
        assert_eq!(c.model_dir, PathBuf::from("/models"));
        assert_eq!(c.mode().unwrap(), IdentityMode::FaceIdPlus { shortcut_scale: 1.0 });
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "camera_device = \"/dev/video0\"").unwrap();
        assert!(matches!(base().overlay_file(f.path()), Err(ConfigError::Toml { .. })));
    }

    #[test]
    fn test_mode_names() {
        let with = |name: &str| Config { identity_mode: name.into(), ..base() }.mode();
        assert_eq!(with("none").unwrap(), IdentityMode::None);
        assert_eq!(with("FaceID").unwrap(), IdentityMode::FaceId);
        assert_eq!(
            with("clip-blend").unwrap(),
            IdentityMode::ClipBlend { face_weight: 0.6, hair_weight: 0.4 }
        );
        assert!(matches!(with("turbo"), Err(ConfigError::UnknownMode(_))));
    }
}
