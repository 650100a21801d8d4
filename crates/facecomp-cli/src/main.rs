use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use facecomp_core::artifacts::{resolve_input, Artifact, RunFolder, RunRecord};
use facecomp_core::mask::{MaskBuilder, MaskOptions};
use facecomp_core::protocol::StdoutSink;
use facecomp_core::request::{EnhanceOptions, PrePasteOptions, RefineOptions};
use facecomp_core::{
    imaging, BlendMethod, CancelToken, ComposeContext, ComposeError, CompositeRequest, FaceModels,
    GenerationOrchestrator, GenerationParams, HarmonicInpainter, IdentityMode, ModeFlags, ModelPaths, StageStatus,
    SwapModel,
};
use image::RgbImage;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facecomp", about = "Compose an ID photo from a background portrait and a source face")]
struct Cli {
    /// Directory holding the ONNX model files (default: $FACECOMP_MODEL_DIR)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a composite
    Compose(ComposeArgs),
    /// Build the inpainting mask only and save it with an overlay
    Mask {
        background_path: PathBuf,
        #[command(flatten)]
        mask: MaskArgs,
        /// Parent directory for the run folder
        #[arg(long, default_value = "outputs")]
        outputs: PathBuf,
    },
    /// List which models load from the model directory
    Models,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("mode").args(["no_identity", "standard", "faceid", "faceid_plus", "dual", "clip_blend"])))]
struct ComposeArgs {
    /// Portrait whose face region is regenerated
    background_path: PathBuf,
    /// Source face whose identity is transferred
    face_path: PathBuf,

    #[arg(long, default_value = "")]
    prompt: String,
    /// Replaces the built-in negative prompt
    #[arg(long)]
    negative_prompt: Option<String>,
    /// Random when omitted
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = 0.85)]
    face_strength: f32,
    #[arg(long = "denoising", default_value_t = 0.92)]
    denoising_strength: f32,
    #[arg(long, default_value_t = 50)]
    steps: u32,
    #[arg(long = "guidance", default_value_t = 7.5)]
    guidance_scale: f32,
    /// Fraction of steps that keep identity conditioning
    #[arg(long, default_value_t = 1.0)]
    stop_at: f32,

    #[command(flatten)]
    mask: MaskArgs,

    /// Pure inpainting, no identity conditioning
    #[arg(long)]
    no_identity: bool,
    /// Raw source image through the image encoder (default)
    #[arg(long)]
    standard: bool,
    /// Identity embedding only
    #[arg(long)]
    faceid: bool,
    /// Identity embedding plus CLIP hairstyle features
    #[arg(long)]
    faceid_plus: bool,
    /// Hair and face routed to two adapters
    #[arg(long)]
    dual: bool,
    /// Pixel blend of face and hair through one encoder
    #[arg(long)]
    clip_blend: bool,
    #[arg(long, default_value_t = 1.0)]
    shortcut_scale: f32,
    #[arg(long, default_value_t = 0.6)]
    face_blend_weight: f32,
    #[arg(long, default_value_t = 0.4)]
    hair_blend_weight: f32,

    /// Do not prefix the prompt with a gender hint
    #[arg(long)]
    no_gender_detect: bool,
    /// Describe the source face and use that as the prompt
    #[arg(long)]
    auto_prompt: bool,
    /// Save a decoded preview every few steps
    #[arg(long)]
    save_preview: bool,

    /// Paste the source face onto the background before generation
    #[arg(long)]
    pre_paste: bool,
    #[arg(long, default_value_t = BlendMethod::Seamless)]
    blend: BlendMethod,
    /// Swap the source face onto the generated one
    #[arg(long)]
    face_swap: bool,
    #[arg(long, default_value_t = SwapModel::InSwapper)]
    swap_model: SwapModel,
    /// Harmonize a swapped face with a low-strength pass
    #[arg(long)]
    swap_refine: bool,
    #[arg(long, default_value_t = 0.3)]
    refine_strength: f32,
    #[arg(long, default_value_t = 20)]
    refine_steps: u32,
    /// Restore the final face
    #[arg(long)]
    enhance: bool,
    #[arg(long, default_value_t = 1.0)]
    enhance_ratio: f32,

    /// Parent directory for the run folder
    #[arg(long, default_value = "outputs")]
    outputs: PathBuf,
    /// Also write the final image here; the format follows the extension
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct MaskArgs {
    #[arg(long, default_value_t = 0.3)]
    mask_expand: f32,
    #[arg(long, default_value_t = 15.0)]
    mask_blur: f32,
    /// Grow (positive) or shrink (negative) the mask by this many pixels
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    mask_padding: i32,
    /// Keep the hair out of the mask
    #[arg(long)]
    no_hair: bool,
    #[arg(long)]
    include_neck: bool,
    /// Always use the ellipse mask
    #[arg(long)]
    no_segmentation: bool,
}

impl MaskArgs {
    fn apply(&self, params: &mut GenerationParams) {
        params.mask_expand = self.mask_expand;
        params.mask_blur = self.mask_blur;
        params.mask_padding = self.mask_padding;
        params.include_hair = !self.no_hair;
        params.include_neck = self.include_neck;
        params.use_segmentation = !self.no_segmentation;
    }
}

impl ComposeArgs {
    fn params(&self) -> GenerationParams {
        let mut params = GenerationParams {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            face_strength: self.face_strength,
            denoising_strength: self.denoising_strength,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            stop_at: self.stop_at,
            face_blend_weight: self.face_blend_weight,
            hair_blend_weight: self.hair_blend_weight,
            shortcut_scale: self.shortcut_scale,
            seed: self.seed.unwrap_or_else(|| rand::random::<u32>() as u64),
            gender_detect: !self.no_gender_detect,
            auto_prompt: self.auto_prompt,
            save_preview: self.save_preview,
            pre_paste: self.pre_paste.then_some(PrePasteOptions { blend: self.blend }),
            face_swap: self.face_swap.then_some(self.swap_model),
            swap_refine: self.swap_refine.then_some(RefineOptions {
                strength: self.refine_strength,
                steps: self.refine_steps,
            }),
            enhance: self.enhance.then_some(EnhanceOptions {
                ratio: self.enhance_ratio,
            }),
            ..Default::default()
        };
        self.mask.apply(&mut params);
        params
    }

    fn mode(&self, params: &GenerationParams) -> IdentityMode {
        if self.no_identity {
            return IdentityMode::None;
        }
        // Standard is the default when no mode flag is given.
        let other = self.clip_blend || self.faceid_plus || self.dual || self.faceid;
        let flags = ModeFlags {
            clip_blend: self.clip_blend,
            faceid_plus: self.faceid_plus,
            dual: self.dual,
            faceid: self.faceid,
            standard: self.standard || !other,
        };
        flags.select(params)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let model_dir = cli.model_dir.unwrap_or_else(facecomp_core::default_model_dir);
    let paths = ModelPaths::in_dir(&model_dir);

    match cli.command {
        Commands::Compose(args) => compose(args, &paths).await,
        Commands::Mask {
            background_path,
            mask,
            outputs,
        } => {
            let background_path = resolve_input(&background_path, Path::new("."));
            let background = load_rgb(&background_path)?;
            let mut params = GenerationParams::default();
            mask.apply(&mut params);
            let mut models = FaceModels::load(&paths, SwapModel::default()).context("loading face models")?;

            let (w, h) = imaging::working_size(background.width(), background.height());
            let working = imaging::resize_rgb(&background, w, h);
            let face_mask = MaskBuilder::new()
                .build_mask(&mut models, &working, &MaskOptions::from_params(&params))
                .context("building mask")?;

            let run = RunFolder::create(&outputs, file_stem(&background_path).as_deref())?;
            run.save(Artifact::Reference, &background)?;
            run.save(Artifact::MaskOverlay, &imaging::mask_overlay(&working, &face_mask.mask))?;
            let path = run.save_mask(Artifact::Mask, &face_mask.mask)?;
            println!(
                "Mask ({}, coverage {:.1}%): {}",
                face_mask.method,
                face_mask.coverage * 100.0,
                path.display()
            );
            Ok(())
        }
        Commands::Models => {
            for (name, path) in [
                ("detector", &paths.detector),
                ("recognizer", &paths.recognizer),
                ("parser", &paths.parser),
                ("clip", &paths.clip),
                ("inswapper", &paths.inswapper),
                ("ghost", &paths.ghost),
                ("restorer", &paths.restorer),
            ] {
                let state = if path.exists() { "found" } else { "missing" };
                println!("{name:<11} {state:<8} {}", path.display());
            }
            Ok(())
        }
    }
}

async fn compose(args: ComposeArgs, paths: &ModelPaths) -> Result<()> {
    let background_path = resolve_input(&args.background_path, Path::new("."));
    let face_path = resolve_input(&args.face_path, Path::new("."));
    let background = load_rgb(&background_path)?;
    let face = load_rgb(&face_path)?;

    let params = args.params();
    let mode = args.mode(&params);
    let request = CompositeRequest::new(background, face, params.clone()).context("invalid request")?;
    tracing::info!(seed = params.seed, mode = %mode, "request ready");

    let models = FaceModels::load(paths, args.swap_model).context("loading face models")?;
    let mut orchestrator = GenerationOrchestrator::new(models, Box::new(HarmonicInpainter::new()), mode);
    let run = RunFolder::create(&args.outputs, file_stem(&background_path).as_deref())?;

    let cancel = CancelToken::new();
    let job = {
        let cancel = cancel.clone();
        let run = run.clone();
        tokio::task::spawn_blocking(move || {
            let mut sink = StdoutSink;
            let result = orchestrator.compose(
                &request,
                ComposeContext {
                    sink: &mut sink,
                    cancel,
                    run_folder: Some(&run),
                },
            );
            (result, orchestrator)
        })
    };
    tokio::pin!(job);

    let (result, orchestrator) = tokio::select! {
        joined = &mut job => joined.context("compose task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received, cancelling");
            cancel.cancel();
            job.await.context("compose task panicked")?
        }
    };

    let result = match result {
        Ok(result) => result,
        Err(ComposeError::NoFaceFound) => bail!("no face found in {}", background_path.display()),
        Err(e) => return Err(e).context("compose failed"),
    };

    let prompt_used = result.generated_prompt.as_deref().unwrap_or(&params.prompt);
    let record = RunRecord {
        command: std::env::args().collect::<Vec<_>>().join(" "),
        background_path: &background_path,
        face_path: &face_path,
        params: &params,
        prompt_used,
        mode: orchestrator.current_mode(),
    };
    run.write_params(&record).context("writing params.txt")?;

    for report in &result.stages {
        match &report.status {
            StageStatus::Done => {}
            StageStatus::Degraded(reason) => println!("{:?}: degraded ({reason})", report.stage),
            StageStatus::Skipped(reason) => tracing::debug!(stage = ?report.stage, reason = %reason, "stage skipped"),
        }
    }
    if let Some(similarity) = result.identity_similarity {
        println!("Identity similarity: {similarity:.3}");
    }
    println!("Mode: {}", result.effective_mode);
    println!("Result: {}", run.artifact_path(Artifact::Result).display());
    if let Some(output) = &args.output {
        save_output(&result.image, output)?;
        println!("Saved: {}", output.display());
    }
    Ok(())
}

fn save_output(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    image.save(path).with_context(|| format!("writing {}", path.display()))
}

fn load_rgb(path: &Path) -> Result<RgbImage> {
    if !path.exists() {
        bail!("input not found: {}", path.display());
    }
    let image = image::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(image.to_rgb8())
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compose_args(extra: &[&str]) -> ComposeArgs {
        let mut argv = vec!["facecomp", "compose", "bg.jpg", "face.jpg"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Compose(args) => args,
            _ => panic!("expected compose"),
        }
    }

    #[test]
    fn test_defaults_match_library() {
        let args = compose_args(&["--seed", "3"]);
        let params = args.params();
        assert_eq!(params, GenerationParams { seed: 3, ..Default::default() });
        assert_eq!(args.mode(&params), IdentityMode::Standard);
    }

    #[test]
    fn test_mode_flags() {
        let args = compose_args(&["--faceid-plus", "--shortcut-scale", "0.5"]);
        assert_eq!(
            args.mode(&args.params()),
            IdentityMode::FaceIdPlus { shortcut_scale: 0.5 }
        );
        let args = compose_args(&["--no-identity"]);
        assert_eq!(args.mode(&args.params()), IdentityMode::None);
        let argv = ["facecomp", "compose", "a", "b", "--dual", "--faceid"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_stage_switches() {
        let args = compose_args(&[
            "--no-hair",
            "--mask-padding=-4",
            "--pre-paste",
            "--blend",
            "alpha",
            "--face-swap",
            "--swap-model",
            "ghost",
            "--enhance",
            "--enhance-ratio",
            "0.5",
        ]);
        let p = args.params();
        assert!(!p.include_hair);
        assert_eq!(p.mask_padding, -4);
        assert_eq!(p.pre_paste, Some(PrePasteOptions { blend: BlendMethod::Alpha }));
        assert_eq!(p.face_swap, Some(SwapModel::Ghost));
        assert_eq!(p.enhance, Some(EnhanceOptions { ratio: 0.5 }));
        assert!(p.swap_refine.is_none());
    }

    #[test]
    fn test_output_path() {
        assert!(compose_args(&[]).output.is_none());
        let args = compose_args(&["-o", "final/portrait.jpg"]);
        assert_eq!(args.output.as_deref(), Some(Path::new("final/portrait.jpg")));
    }

    #[test]
    fn test_save_output_creates_parent_and_follows_extension() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::from_pixel(6, 4, image::Rgb([10, 200, 30]));
        let path = dir.path().join("nested").join("out.jpg");
        save_output(&image, &path).unwrap();
        assert_eq!(image::ImageFormat::from_path(&path).unwrap(), image::ImageFormat::Jpeg);
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (6, 4));
        assert!(save_output(&image, &dir.path().join("out.unknown")).is_err());
    }
}
