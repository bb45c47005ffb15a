use structopt::StructOpt;

mod progress_window;

use neural_style::{
    Batch, BatchProgress, Dims, Error, FeatureExtractor, GramNormalization, Session,
    SessionBuilder,
};
use progress_window::{BatchBars, ProgressWindow};
use std::path::PathBuf;
use tracing::{info, warn};

fn parse_size(input: &str) -> Result<(u32, u32), std::num::ParseIntError> {
    let mut i = input.splitn(2, 'x');

    let x: u32 = i.next().unwrap_or("").parse()?;
    let y: u32 = match i.next() {
        Some(num) => num.parse()?,
        None => x,
    };
    Ok((x, y))
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Transfer {
    /// The image whose structure is preserved
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image whose textures and colors are adopted
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// The directory to save `<restart>.png`, `loss.png` and `loss.json` to
    #[structopt(long, short, parse(from_os_str))]
    out: PathBuf,
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct BatchTransfer {
    /// Directory of content images
    #[structopt(long, parse(from_os_str))]
    content_dir: PathBuf,
    /// Directory of style images, each is applied to every content image
    #[structopt(long, parse(from_os_str))]
    style_dir: PathBuf,
    /// Each run is written to a new `<unix seconds>` directory inside this one
    #[structopt(long, parse(from_os_str))]
    out_dir: PathBuf,
    /// The maximum number of content images processed in parallel. Defaults
    /// to the logical core count.
    #[structopt(short = "t", long)]
    threads: Option<usize>,
}

#[derive(StructOpt)]
enum Subcommand {
    /// Optimizes a single content and style pair
    #[structopt(name = "transfer")]
    Transfer(Transfer),
    /// Optimizes every pair of a directory of content images and a directory
    /// of style images
    #[structopt(name = "batch")]
    Batch(BatchTransfer),
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Tweaks {
    /// The number of optimization steps
    #[structopt(long, default_value = "20000")]
    epochs: u32,
    /// Size both inputs are resized to, in `width x height`, or a single
    /// number for both dimensions
    #[structopt(long, default_value = "224", parse(try_from_str = parse_size))]
    size: (u32, u32),
    /// Seed of the random initialization
    #[structopt(long, default_value = "7442")]
    seed: u64,
    /// The number of independently initialized images optimized together
    #[structopt(long, default_value = "1")]
    random_starts: u32,
    /// Coefficient of the content loss
    #[structopt(long, default_value = "1", allow_hyphen_values = true)]
    alpha: f64,
    /// Coefficient of the style loss
    #[structopt(long, default_value = "5000", allow_hyphen_values = true)]
    beta: f64,
    /// Adam's learning rate, in 0-255 pixel units
    #[structopt(long, default_value = "0.255")]
    lr: f32,
    /// Comma separated layers matched against the content image
    #[structopt(long, default_value = "conv4_2", use_delimiter = true)]
    content_layers: Vec<String>,
    /// Comma separated layers matched against the style image
    #[structopt(
        long,
        default_value = "conv1_1,conv2_1,conv3_1,conv4_1",
        use_delimiter = true
    )]
    style_layers: Vec<String>,
    /// Comma separated weights, one per content layer. Defaults to 1/n each
    #[structopt(long, use_delimiter = true, allow_hyphen_values = true)]
    content_weights: Vec<f32>,
    /// Comma separated weights, one per style layer. Defaults to 1/n each
    #[structopt(long, use_delimiter = true, allow_hyphen_values = true)]
    style_weights: Vec<f32>,
    /// How Gram matrices are normalized, `none` or `element-count`
    #[structopt(long, default_value = "none")]
    gram_norm: GramNormalization,
    /// Show a window with the image being optimized
    #[cfg(feature = "progress")]
    #[structopt(long = "window")]
    show_window: bool,
    /// Don't show progress bars
    #[structopt(long)]
    no_progress: bool,
}

impl Tweaks {
    fn apply<'a>(&self, sb: SessionBuilder<'a>) -> SessionBuilder<'a> {
        let mut sb = sb
            .epochs(self.epochs)
            .input_size(Dims::new(self.size.0, self.size.1))
            .seed(self.seed)
            .random_starts(self.random_starts)
            .alpha(self.alpha)
            .beta(self.beta)
            .learning_rate(self.lr)
            .content_layers(self.content_layers.iter().cloned())
            .style_layers(self.style_layers.iter().cloned())
            .gram_normalization(self.gram_norm);

        if !self.content_weights.is_empty() {
            sb = sb.content_weights(self.content_weights.clone());
        }

        if !self.style_weights.is_empty() {
            sb = sb.style_weights(self.style_weights.clone());
        }

        sb
    }
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Optimizes images toward the content of one image and the style of another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// Path to a VGG19 weight archive, see `tools/export_vgg19.py`
    #[structopt(long, parse(from_os_str))]
    weights: PathBuf,
    #[structopt(flatten)]
    tweaks: Tweaks,
    #[structopt(subcommand)]
    cmd: Subcommand,
}

fn main() {
    init_tracing();

    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

/// Logs to stderr, filtered by `RUST_LOG`, or `info` when it isn't set
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    let vgg = FeatureExtractor::vgg19(&args.weights)?;
    let sb = args.tweaks.apply(Session::builder().extractor(&vgg));

    match &args.cmd {
        Subcommand::Transfer(transfer) => {
            let session = sb
                .content_image(&transfer.content)
                .style_image(&transfer.style)
                .build()?;

            let progress: Option<Box<dyn neural_style::OptimizationProgress>> =
                if !args.tweaks.no_progress {
                    let progress = ProgressWindow::new();

                    #[cfg(feature = "progress")]
                    let progress = {
                        if args.tweaks.show_window {
                            progress.with_preview(
                                Dims::new(args.tweaks.size.0, args.tweaks.size.1),
                                std::time::Duration::from_millis(100),
                            )
                        } else {
                            progress
                        }
                    };

                    Some(Box::new(progress))
                } else {
                    None
                };

            let generated = session.run(progress)?;

            let images = generated.save(&transfer.out)?;
            generated.save_loss_curve(transfer.out.join("loss.png"))?;
            generated.save_loss_history(transfer.out.join("loss.json"))?;

            info!(
                images = images.len(),
                out = %transfer.out.display(),
                "saved generated images"
            );
        }
        Subcommand::Batch(dirs) => {
            let run_id = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default();

            let mut builder = Batch::builder()
                .session(sb)
                .content_dir(&dirs.content_dir)
                .style_dir(&dirs.style_dir)
                .run_dir(dirs.out_dir.join(run_id.to_string()));

            if let Some(threads) = dirs.threads {
                builder = builder.max_workers(threads);
            }

            let batch = builder.build()?;

            let bars = if args.tweaks.no_progress {
                None
            } else {
                Some(BatchBars::new(batch.contents().len() * batch.styles().len()))
            };

            let manifest = batch.run(bars.as_ref().map(|bars| bars as &dyn BatchProgress))?;

            for failure in &manifest.failed {
                warn!(
                    content = %failure.content.display(),
                    style = %failure.style.display(),
                    "{}",
                    failure.error
                );
            }

            info!(
                run_dir = %manifest.run_dir.display(),
                succeeded = manifest.succeeded.len(),
                failed = manifest.failed.len(),
                "batch complete"
            );
        }
    }

    Ok(())
}
