//! Per-run output folder: input copies, stage images, previews and `params.txt`.

use crate::request::{GenerationParams, IdentityMode};
use image::{GrayImage, RgbImage};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PARAMS_FILE: &str = "params.txt";
pub const PREVIEW_DIR: &str = "previews";
/// Relative inputs that do not exist are looked up here.
pub const INPUTS_DIR: &str = "inputs";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("format: {0}")]
    Fmt(#[from] std::fmt::Error),
}

/// Numbered images written into the run folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Reference,
    Face,
    PrePaste,
    MaskOverlay,
    InpaintInput,
    Mask,
    FaceSwap,
    SwapRefine,
    Enhance,
    Result,
}

impl Artifact {
    pub fn file_name(&self) -> &'static str {
        match self {
            Artifact::Reference => "1_reference.png",
            Artifact::Face => "2_face.png",
            Artifact::PrePaste => "2b_pre_paste.png",
            Artifact::MaskOverlay => "3_mask_overlay.png",
            Artifact::InpaintInput => "4_inpaint_input.png",
            Artifact::Mask => "4b_mask.png",
            Artifact::FaceSwap => "5a_face_swap.png",
            Artifact::SwapRefine => "5b_swap_refine.png",
            Artifact::Enhance => "5c_enhance.png",
            Artifact::Result => "5_result.png",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunFolder {
    root: PathBuf,
}

impl RunFolder {
    /// Create `<outputs>/<name>_<YYYYmmdd_HHMMSS>`, or `run_<ts>` without a name.
    /// Any extension on `name` is dropped.
    pub fn create(outputs: &Path, name: Option<&str>) -> Result<Self, ArtifactError> {
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let stem = name
            .map(|n| {
                Path::new(n)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| n.to_string())
            })
            .filter(|s| !s.is_empty());
        let folder = match stem {
            Some(stem) => format!("{stem}_{ts}"),
            None => format!("run_{ts}"),
        };
        let root = outputs.join(folder);
        std::fs::create_dir_all(&root)?;
        tracing::info!(path = %root.display(), "run folder created");
        Ok(Self { root })
    }

    /// Use an existing directory as the run folder.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, artifact: Artifact) -> PathBuf {
        self.root.join(artifact.file_name())
    }

    pub fn preview_dir(&self) -> PathBuf {
        self.root.join(PREVIEW_DIR)
    }

    pub fn save(&self, artifact: Artifact, image: &RgbImage) -> Result<PathBuf, ArtifactError> {
        let path = self.artifact_path(artifact);
        image.save(&path)?;
        tracing::debug!(path = %path.display(), "artifact saved");
        Ok(path)
    }

    pub fn save_mask(&self, artifact: Artifact, mask: &GrayImage) -> Result<PathBuf, ArtifactError> {
        let path = self.artifact_path(artifact);
        mask.save(&path)?;
        Ok(path)
    }

    /// Write `params.txt`.
    pub fn write_params(&self, record: &RunRecord<'_>) -> Result<PathBuf, ArtifactError> {
        let path = self.root.join(PARAMS_FILE);
        std::fs::write(&path, record.render()?)?;
        Ok(path)
    }
}

/// Everything needed to describe and reproduce one run.
#[derive(Debug, Clone)]
pub struct RunRecord<'a> {
    pub command: String,
    pub background_path: &'a Path,
    pub face_path: &'a Path,
    pub params: &'a GenerationParams,
    /// The prompt actually used (auto-generated or the user's).
    pub prompt_used: &'a str,
    pub mode: &'a IdentityMode,
}

impl RunRecord<'_> {
    pub fn render(&self) -> Result<String, ArtifactError> {
        let p = self.params;
        let mut out = String::new();
        let rule = "=".repeat(70);
        writeln!(out, "{rule}\nfacecomp - run parameters\n{rule}\n")?;
        writeln!(out, "time: {}\n", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(out, "[ command ]\n{}\n", self.command)?;

        writeln!(out, "[ inputs ]")?;
        for (label, path) in [("background", self.background_path), ("face", self.face_path)] {
            let digest = file_sha256(path).unwrap_or_else(|e| format!("unavailable ({e})"));
            writeln!(out, "{label}: {}\n{label}_sha256: {digest}", path.display())?;
        }
        writeln!(out)?;

        writeln!(out, "[ parameters ]")?;
        writeln!(out, "seed: {}", p.seed)?;
        writeln!(out, "face_strength: {}", p.face_strength)?;
        writeln!(out, "denoising: {}", p.denoising_strength)?;
        writeln!(out, "guidance: {}", p.guidance_scale)?;
        writeln!(out, "steps: {}", p.steps)?;
        writeln!(out, "mask_expand: {}", p.mask_expand)?;
        writeln!(out, "mask_blur: {}", p.mask_blur)?;
        writeln!(out, "mask_padding: {}", p.mask_padding)?;
        writeln!(out, "stop_at: {}", p.stop_at)?;
        writeln!(out, "shortcut_scale: {}", p.shortcut_scale)?;
        writeln!(out, "prompt: {}\n", self.prompt_used)?;

        writeln!(out, "[ modes ]")?;
        writeln!(out, "identity_mode: {}", self.mode)?;
        writeln!(out, "segmentation: {}", p.use_segmentation)?;
        writeln!(out, "include_hair: {}", p.include_hair)?;
        writeln!(out, "include_neck: {}", p.include_neck)?;
        writeln!(out, "gender_detect: {}", p.gender_detect)?;
        writeln!(out, "auto_prompt: {}", p.auto_prompt)?;
        writeln!(
            out,
            "pre_paste: {}",
            p.pre_paste.map(|o| o.blend.to_string()).unwrap_or_else(|| "off".into())
        )?;
        writeln!(
            out,
            "face_swap: {}",
            p.face_swap.map(|m| m.to_string()).unwrap_or_else(|| "off".into())
        )?;
        writeln!(out, "swap_refine: {}", p.swap_refine.is_some())?;
        writeln!(
            out,
            "enhance: {}\n",
            p.enhance.map(|e| e.ratio.to_string()).unwrap_or_else(|| "off".into())
        )?;

        writeln!(out, "[ blend weights ]")?;
        writeln!(out, "face_blend_weight: {}", p.face_blend_weight)?;
        writeln!(out, "hair_blend_weight: {}\n", p.hair_blend_weight)?;

        writeln!(out, "[ reproduce ]")?;
        writeln!(
            out,
            "{}",
            repro_command(self.background_path, self.face_path, p, self.prompt_used, self.mode)
        )?;
        Ok(out)
    }
}

/// Lowercase hex SHA-256 of a file.
pub fn file_sha256(path: &Path) -> Result<String, ArtifactError> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// A `facecomp compose` command line that reruns this request.
pub fn repro_command(
    background: &Path,
    face: &Path,
    p: &GenerationParams,
    prompt: &str,
    mode: &IdentityMode,
) -> String {
    let mut args = vec![
        "facecomp".to_string(),
        "compose".to_string(),
        shell_quote(&background.display().to_string()),
        shell_quote(&face.display().to_string()),
        format!("--prompt {}", shell_quote(prompt)),
        format!("--seed {}", p.seed),
        format!("--face-strength {}", p.face_strength),
        format!("--denoising {}", p.denoising_strength),
        format!("--guidance {}", p.guidance_scale),
        format!("--steps {}", p.steps),
        format!("--mask-expand {}", p.mask_expand),
        format!("--mask-blur {}", p.mask_blur),
        format!("--mask-padding={}", p.mask_padding),
        format!("--stop-at {}", p.stop_at),
    ];
    match mode {
        IdentityMode::None => args.push("--no-identity".into()),
        IdentityMode::Standard => {}
        IdentityMode::FaceId => args.push("--faceid".into()),
        IdentityMode::FaceIdPlus { shortcut_scale } => {
            args.push("--faceid-plus".into());
            args.push(format!("--shortcut-scale {shortcut_scale}"));
        }
        IdentityMode::Dual => args.push("--dual".into()),
        IdentityMode::ClipBlend { .. } => {
            args.push("--clip-blend".into());
            args.push(format!("--face-blend-weight {}", p.face_blend_weight));
            args.push(format!("--hair-blend-weight {}", p.hair_blend_weight));
        }
    }
    if !p.include_hair {
        args.push("--no-hair".into());
    }
    if p.include_neck {
        args.push("--include-neck".into());
    }
    if !p.use_segmentation {
        args.push("--no-segmentation".into());
    }
    if !p.gender_detect {
        args.push("--no-gender-detect".into());
    }
    if let Some(opts) = p.pre_paste {
        args.push(format!("--pre-paste --blend {}", opts.blend));
    }
    if let Some(model) = p.face_swap {
        args.push(format!("--face-swap --swap-model {model}"));
    }
    if let Some(opts) = p.swap_refine {
        args.push(format!("--swap-refine --refine-strength {} --refine-steps {}", opts.strength, opts.steps));
    }
    if let Some(opts) = p.enhance {
        args.push(format!("--enhance --enhance-ratio {}", opts.ratio));
    }
    if p.save_preview {
        args.push("--save-preview".into());
    }
    args.join(" ")
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=,".contains(c)) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// `path` if it exists or is absolute; otherwise `inputs_root/inputs/path` when that exists.
pub fn resolve_input(path: &Path, inputs_root: &Path) -> PathBuf {
    if path.exists() || path.is_absolute() {
        return path.to_path_buf();
    }
    let candidate = inputs_root.join(INPUTS_DIR).join(path);
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "input resolved under inputs/");
        candidate
    } else {
        path.to_path_buf()
    }
}
