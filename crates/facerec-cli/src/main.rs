use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facerec_core::{
    build_gallery, EuclideanMatcher, FaceDetector, FaceRecognizer, Gallery, Matcher,
    ParallelMatcher, SamplePolicy,
};
use facerec_hw::Camera;
use pipeline::{FaceReport, Pipeline, RecognitionParams};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod pipeline;

use config::Config;

/// Give up on the camera after this many capture errors in a row.
const MAX_CONSECUTIVE_CAPTURE_FAILURES: u32 = 10;

#[derive(Parser)]
#[command(name = "facerec", about = "Recognize known people in live video or still images")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing det_10g.onnx and the SFace model
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    /// Directory with one subdirectory of sample images per person
    #[arg(long, global = true)]
    persons_dir: Option<PathBuf>,

    /// Maximum descriptor distance accepted as a match
    #[arg(long, global = true)]
    match_distance: Option<f64>,

    /// Jittered chips averaged per descriptor
    #[arg(long, global = true)]
    jitter: Option<u32>,

    /// Margin around the aligned face, as a fraction of its size
    #[arg(long, global = true)]
    padding: Option<f64>,

    /// Skip gallery samples that fail instead of aborting
    #[arg(long, global = true)]
    skip_bad_samples: bool,

    /// Scan the gallery on the rayon thread pool
    #[arg(long, global = true)]
    parallel_match: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize faces in the live camera stream
    Run {
        /// V4L2 device path (e.g., /dev/video0)
        #[arg(short, long)]
        device: Option<String>,
        /// Stop after this many frames (0 = run until interrupted)
        #[arg(long)]
        max_frames: Option<u64>,
    },
    /// Recognize faces in still images
    Identify {
        /// Image files to process
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Detect all images in one batch (they must share dimensions)
        #[arg(long)]
        batch: bool,
    },
    /// Build the gallery and list its persons
    Gallery,
    /// List V4L2 capture devices
    Devices,
}

impl Cli {
    /// Apply command-line overrides on top of file and environment settings.
    fn apply_overrides(&self, cfg: &mut Config) {
        if let Some(dir) = &self.models_dir {
            cfg.models_dir = dir.clone();
        }
        if let Some(dir) = &self.persons_dir {
            cfg.persons_dir = dir.clone();
        }
        if let Some(d) = self.match_distance {
            cfg.match_distance = d;
        }
        if let Some(j) = self.jitter {
            cfg.jitter = j;
        }
        if let Some(p) = self.padding {
            cfg.padding = p;
        }
        if self.skip_bad_samples {
            cfg.sample_policy = SamplePolicy::Skip;
        }
        if self.parallel_match {
            cfg.parallel_match = true;
        }
        if let Commands::Run { device, max_frames } = &self.command {
            if let Some(device) = device {
                cfg.camera_device = device.clone();
            }
            if let Some(n) = max_frames {
                cfg.max_frames = *n;
            }
        }
    }
}

/// One JSON output line: the face report tagged with where it came from.
#[derive(Serialize)]
struct OutputLine<'a, S: Serialize> {
    #[serde(flatten)]
    source: S,
    #[serde(flatten)]
    face: &'a FaceReport,
}

#[derive(Serialize)]
struct FrameSource {
    frame: u64,
    sequence: u32,
}

#[derive(Serialize)]
struct FileSource<'a> {
    file: &'a str,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut cfg = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply_overrides(&mut cfg);
    tracing::debug!(?cfg, "configuration resolved");

    match &cli.command {
        Commands::Run { .. } => run_live(&cfg),
        Commands::Identify { images, batch } => identify(&cfg, images, *batch),
        Commands::Gallery => list_gallery(&cfg),
        Commands::Devices => {
            list_devices();
            Ok(())
        }
    }
}

fn load_models(cfg: &Config) -> Result<(FaceDetector, FaceRecognizer)> {
    let detector_path = cfg.detector_model_path();
    let detector = FaceDetector::load(&detector_path)
        .with_context(|| format!("failed to load detector from {detector_path}"))?
        .with_confidence_threshold(cfg.detector_confidence);

    let recognizer_path = cfg.recognizer_model_path();
    let recognizer = FaceRecognizer::load(&recognizer_path)
        .with_context(|| format!("failed to load recognizer from {recognizer_path}"))?;

    Ok((detector, recognizer))
}

fn load_gallery(
    cfg: &Config,
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
) -> Result<Gallery> {
    let (gallery, report) =
        build_gallery(&cfg.persons_dir, detector, recognizer, &cfg.build_options())
            .with_context(|| format!("failed to build gallery from {}", cfg.persons_dir.display()))?;

    if gallery.descriptor_count() == 0 {
        tracing::warn!("gallery has no descriptors; every face will be unknown");
    }
    tracing::debug!(?report, "gallery build report");
    Ok(gallery)
}

fn build_pipeline(cfg: &Config) -> Result<Pipeline<FaceDetector, FaceRecognizer>> {
    let (mut detector, mut recognizer) = load_models(cfg)?;
    let gallery = load_gallery(cfg, &mut detector, &mut recognizer)?;

    let matcher: Box<dyn Matcher> = if cfg.parallel_match {
        Box::new(ParallelMatcher)
    } else {
        Box::new(EuclideanMatcher)
    };

    Ok(Pipeline::new(
        detector,
        recognizer,
        gallery,
        matcher,
        RecognitionParams {
            padding: cfg.padding,
            jitter: cfg.jitter,
            match_distance: cfg.match_distance,
        },
    ))
}

fn emit<S: Serialize>(out: &mut impl Write, source: S, faces: &[FaceReport]) -> Result<()> {
    for face in faces {
        let line = serde_json::to_string(&OutputLine { source: &source, face })?;
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}

fn run_live(cfg: &Config) -> Result<()> {
    let mut pipeline = build_pipeline(cfg)?;

    let camera = Camera::open(&cfg.camera_device)
        .with_context(|| format!("failed to open camera {}", cfg.camera_device))?;
    let mut stream = camera.stream().context("failed to start capture")?;

    tracing::info!(
        device = %cfg.camera_device,
        width = camera.width,
        height = camera.height,
        persons = pipeline.gallery().len(),
        "recognizing live video"
    );

    let mut stdout = std::io::stdout().lock();
    let mut frame_no: u64 = 0;
    let mut capture_failures = 0;

    while cfg.max_frames == 0 || frame_no < cfg.max_frames {
        let frame = match stream.next_frame() {
            Ok(frame) => {
                capture_failures = 0;
                frame
            }
            Err(e) => {
                capture_failures += 1;
                tracing::warn!(error = %e, attempt = capture_failures, "frame capture failed");
                if capture_failures >= MAX_CONSECUTIVE_CAPTURE_FAILURES {
                    bail!("camera stopped delivering frames: {e}");
                }
                continue;
            }
        };
        frame_no += 1;

        match pipeline.process(&frame.image) {
            Ok(faces) => emit(
                &mut stdout,
                FrameSource {
                    frame: frame_no,
                    sequence: frame.sequence,
                },
                &faces,
            )?,
            Err(e) => tracing::warn!(frame = frame_no, error = %e, "skipping frame"),
        }
    }

    tracing::info!(frames = frame_no, "live loop finished");
    Ok(())
}

fn identify(cfg: &Config, paths: &[PathBuf], batch: bool) -> Result<()> {
    let mut pipeline = build_pipeline(cfg)?;

    let images = paths
        .iter()
        .map(|path| {
            image::open(path)
                .map(|img| img.to_rgb8())
                .with_context(|| format!("failed to read image {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let results = if batch {
        pipeline.process_batch(&images).context("batch recognition failed")?
    } else {
        images
            .iter()
            .zip(paths)
            .map(|(image, path)| {
                pipeline
                    .process(image)
                    .with_context(|| format!("recognition failed for {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let mut stdout = std::io::stdout().lock();
    for (path, faces) in paths.iter().zip(&results) {
        let file = path.to_string_lossy();
        if faces.is_empty() {
            tracing::info!(file = %file, "no faces found");
        }
        emit(&mut stdout, FileSource { file: &file }, faces)?;
    }
    Ok(())
}

fn list_gallery(cfg: &Config) -> Result<()> {
    let (mut detector, mut recognizer) = load_models(cfg)?;
    let (gallery, report) = build_gallery(
        &cfg.persons_dir,
        &mut detector,
        &mut recognizer,
        &cfg.build_options(),
    )
    .with_context(|| format!("failed to build gallery from {}", cfg.persons_dir.display()))?;

    if gallery.is_empty() {
        println!("No persons found in {}", cfg.persons_dir.display());
        return Ok(());
    }

    println!("{:<24} DESCRIPTORS", "NAME");
    for person in gallery.all() {
        println!("{:<24} {}", person.name, person.descriptors.len());
    }
    println!();
    println!(
        "{} samples, {} undecodable, {} skipped",
        report.samples, report.undecodable, report.skipped
    );
    if !report.empty_persons.is_empty() {
        println!("Persons without descriptors: {}", report.empty_persons.join(", "));
    }
    Ok(())
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for dev in devices {
        println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
}
