//! Runs one style transfer per (content, style) pair of two directories,
//! spread over a pool of worker threads.
//!
//! A run directory ends up looking like this:
//!
//! ```text
//! <run>/configuration.json
//! <run>/<content stem>/<style stem>/0.png … <restarts - 1>.png
//! <run>/<content stem>/<style stem>/loss.png
//! <run>/<content stem>/<style stem>/loss.json
//! <run>/<content stem>_loss.png
//! <run>/manifest.json
//! ```
//!
//! `<content stem>_loss.png` draws the loss of every style that succeeded for
//! that content image on the same axes. When two files of a directory share a
//! stem, both use their whole file name with `.` replaced by `_` instead.
//!
//! Each worker takes whole content images, and runs every style against the
//! content image it was handed. A pair that fails is recorded in the
//! `Manifest` and the remaining pairs still run.

use crate::{
    errors, plot, session::ProgressStat, Error, ImageSource, Parameters, SessionBuilder,
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};
use tracing::{info, warn};

/// The outputs of a pair that was optimized successfully
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PairReport {
    pub content: PathBuf,
    pub style: PathBuf,
    pub output_dir: PathBuf,
    /// One image per random restart
    pub images: Vec<PathBuf>,
    pub loss_curve: PathBuf,
    pub loss_history: PathBuf,
    /// The loss of the last step
    pub final_loss: Option<f64>,
}

/// A pair that could not be optimized, and why
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PairFailure {
    pub content: PathBuf,
    pub style: PathBuf,
    pub error: String,
}

/// The loss curves of every successful style of one content image, drawn on
/// the same axes
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LossComparison {
    pub content: PathBuf,
    pub plot: PathBuf,
    /// The styles in drawing order, the n-th curve is drawn in the n-th
    /// colour of the palette
    pub styles: Vec<PathBuf>,
}

/// The result of every pair of a batch, sorted by content then style path.
/// Also written as `manifest.json` in the run directory.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Manifest {
    pub run_dir: PathBuf,
    pub succeeded: Vec<PairReport>,
    pub failed: Vec<PairFailure>,
    /// One per content image with at least one successful style
    pub loss_comparisons: Vec<LossComparison>,
}

/// Sent to `BatchProgress` every time a pair finishes
pub struct BatchUpdate<'a> {
    pub content: &'a Path,
    pub style: &'a Path,
    /// Pairs finished so far, over all pairs of the batch
    pub pairs: ProgressStat,
    pub succeeded: bool,
}

/// Receives updates from every worker thread as pairs finish
pub trait BatchProgress: Sync {
    fn update(&self, info: BatchUpdate<'_>);
}

impl<F> BatchProgress for F
where
    F: Fn(BatchUpdate<'_>) + Sync,
{
    fn update(&self, info: BatchUpdate<'_>) {
        self(info)
    }
}

#[derive(Serialize)]
struct Configuration<'b> {
    content_dir: &'b Path,
    style_dir: &'b Path,
    workers: usize,
    contents: &'b [PathBuf],
    styles: &'b [PathBuf],
    parameters: &'b Parameters,
}

/// Every regular, non-hidden file of `dir`, sorted by path
fn list_images(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let path = entry.path();

        if !hidden && path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_owned())
}

/// The output directory name of every file, its stem unless another file
/// shares it
fn output_names(files: &[PathBuf]) -> Result<Vec<String>, Error> {
    let stems: Vec<String> = files.iter().map(|path| stem(path)).collect();

    let names: Vec<String> = files
        .iter()
        .zip(&stems)
        .map(|(path, stem)| {
            if stems.iter().filter(|other| *other == stem).count() > 1 {
                path.file_name()
                    .map(|name| name.to_string_lossy().replace('.', "_"))
                    .unwrap_or_else(|| stem.clone())
            } else {
                stem.clone()
            }
        })
        .collect();

    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort();
    if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(Error::DuplicateOutputName(pair[0].clone()));
    }

    Ok(names)
}

fn record<T>(results: &Mutex<Vec<T>>, value: T) -> Result<(), Error> {
    results
        .lock()
        .map_err(|_| Error::WorkerPanicked)?
        .push(value);
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let file = std::io::BufWriter::new(std::fs::File::create(path)?);
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

/// A batch of style transfers over every content × style pair of two
/// directories
pub struct Batch<'a> {
    template: SessionBuilder<'a>,
    content_dir: PathBuf,
    style_dir: PathBuf,
    run_dir: PathBuf,
    contents: Vec<PathBuf>,
    styles: Vec<PathBuf>,
    content_names: Vec<String>,
    style_names: Vec<String>,
    workers: usize,
}

impl<'a> Batch<'a> {
    pub fn builder() -> BatchBuilder<'a> {
        BatchBuilder::default()
    }

    /// The content images, in the order they are handed to workers
    pub fn contents(&self) -> &[PathBuf] {
        &self.contents
    }

    pub fn styles(&self) -> &[PathBuf] {
        &self.styles
    }

    /// The number of worker threads that will be spawned
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn run_pair(&self, content: usize, style: usize) -> Result<(PairReport, Vec<f64>), Error> {
        let output_dir = self
            .run_dir
            .join(&self.content_names[content])
            .join(&self.style_names[style]);

        let session = self
            .template
            .clone()
            .content_image(ImageSource::Path(&self.contents[content]))
            .style_image(ImageSource::Path(&self.styles[style]))
            .build()?;
        let generated = session.run(None)?;

        let images = generated.save(&output_dir)?;

        let loss_curve = output_dir.join("loss.png");
        generated.save_loss_curve(&loss_curve)?;

        let loss_history = output_dir.join("loss.json");
        generated.save_loss_history(&loss_history)?;

        let report = PairReport {
            content: self.contents[content].clone(),
            style: self.styles[style].clone(),
            output_dir,
            images,
            loss_curve,
            loss_history,
            final_loss: generated.loss_history().last().copied(),
        };

        Ok((report, generated.loss_history().to_vec()))
    }

    /// Draws the histories of every successful style of a content image
    fn compare_styles(
        &self,
        content: usize,
        histories: Vec<(PathBuf, Vec<f64>)>,
    ) -> Result<LossComparison, Error> {
        let plot = self
            .run_dir
            .join(format!("{}_loss.png", self.content_names[content]));

        let curves: Vec<&[f64]> = histories.iter().map(|(_, h)| h.as_slice()).collect();
        plot::save_loss_curves(&plot, &curves)?;

        Ok(LossComparison {
            content: self.contents[content].clone(),
            plot,
            styles: histories.into_iter().map(|(style, _)| style).collect(),
        })
    }

    /// Runs every pair, writing `configuration.json` first and
    /// `manifest.json` once every pair has finished.
    ///
    /// Errors of individual pairs are recorded in the returned `Manifest`,
    /// only failures to set up the run directory or a panicking worker abort
    /// the batch.
    pub fn run(self, progress: Option<&dyn BatchProgress>) -> Result<Manifest, Error> {
        std::fs::create_dir_all(&self.run_dir)?;

        write_json(
            &self.run_dir.join("configuration.json"),
            &Configuration {
                content_dir: &self.content_dir,
                style_dir: &self.style_dir,
                workers: self.workers,
                contents: &self.contents,
                styles: &self.styles,
                parameters: self.template.parameters(),
            },
        )?;

        let total_pairs = self.contents.len() * self.styles.len();
        info!(
            run_dir = %self.run_dir.display(),
            contents = self.contents.len(),
            styles = self.styles.len(),
            workers = self.workers,
            "starting batch"
        );

        let next_content = AtomicUsize::new(0);
        let finished = AtomicUsize::new(0);
        let outcomes = Mutex::new(Vec::with_capacity(total_pairs));
        let comparisons = Mutex::new(Vec::with_capacity(self.contents.len()));

        let worker = || -> Result<(), Error> {
            loop {
                let index = next_content.fetch_add(1, Ordering::Relaxed);
                let content = match self.contents.get(index) {
                    Some(content) => content,
                    None => return Ok(()),
                };

                let mut histories = Vec::with_capacity(self.styles.len());

                for (style_index, style) in self.styles.iter().enumerate() {
                    let outcome = match self.run_pair(index, style_index) {
                        Ok((report, history)) => {
                            histories.push((style.clone(), history));
                            Ok(report)
                        }
                        Err(err) => {
                            warn!(
                                content = %content.display(),
                                style = %style.display(),
                                error = %err,
                                "pair failed"
                            );
                            Err(PairFailure {
                                content: content.clone(),
                                style: style.clone(),
                                error: err.to_string(),
                            })
                        }
                    };

                    let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(progress) = progress {
                        progress.update(BatchUpdate {
                            content,
                            style,
                            pairs: ProgressStat {
                                current: done,
                                total: total_pairs,
                            },
                            succeeded: outcome.is_ok(),
                        });
                    }

                    record(&outcomes, outcome)?;
                }

                if histories.is_empty() {
                    continue;
                }

                match self.compare_styles(index, histories) {
                    Ok(comparison) => record(&comparisons, comparison)?,
                    Err(err) => warn!(
                        content = %content.display(),
                        error = %err,
                        "unable to draw the style comparison"
                    ),
                }
            }
        };

        let worker = &worker;
        let joined = crossbeam_utils::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.workers)
                .map(|_| scope.spawn(move |_| worker()))
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>()
        })
        .map_err(|_| Error::WorkerPanicked)?;

        for result in joined {
            result.map_err(|_| Error::WorkerPanicked)??;
        }

        let outcomes = outcomes.into_inner().map_err(|_| Error::WorkerPanicked)?;
        let mut loss_comparisons = comparisons
            .into_inner()
            .map_err(|_| Error::WorkerPanicked)?;
        loss_comparisons.sort_by(|a, b| a.content.cmp(&b.content));

        let mut manifest = Manifest {
            run_dir: self.run_dir.clone(),
            loss_comparisons,
            ..Manifest::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(report) => manifest.succeeded.push(report),
                Err(failure) => manifest.failed.push(failure),
            }
        }
        manifest
            .succeeded
            .sort_by(|a, b| (&a.content, &a.style).cmp(&(&b.content, &b.style)));
        manifest
            .failed
            .sort_by(|a, b| (&a.content, &a.style).cmp(&(&b.content, &b.style)));

        write_json(&self.run_dir.join("manifest.json"), &manifest)?;

        info!(
            succeeded = manifest.succeeded.len(),
            failed = manifest.failed.len(),
            "batch finished"
        );

        Ok(manifest)
    }
}

/// Builds a `Batch` from a session template, which supplies the extractor
/// and every hyperparameter, and the directories to read from and write to
#[derive(Default)]
pub struct BatchBuilder<'a> {
    template: SessionBuilder<'a>,
    content_dir: Option<PathBuf>,
    style_dir: Option<PathBuf>,
    run_dir: Option<PathBuf>,
    max_workers: Option<usize>,
}

impl<'a> BatchBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session every pair is built from. Any content or style image set
    /// on it is replaced by the pair's images.
    pub fn session(mut self, template: SessionBuilder<'a>) -> Self {
        self.template = template;
        self
    }

    pub fn content_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.content_dir = Some(dir.into());
        self
    }

    pub fn style_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.style_dir = Some(dir.into());
        self
    }

    /// The directory every output of this run is written to
    pub fn run_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.run_dir = Some(dir.into());
        self
    }

    /// Upper bound on the number of worker threads.
    ///
    /// Default: the number of logical cores. Never more than the number of
    /// content images.
    pub fn max_workers(mut self, count: usize) -> Self {
        self.max_workers = Some(count);
        self
    }

    /// Lists both directories and validates the session template
    pub fn build(self) -> Result<Batch<'a>, Error> {
        self.template.check_parameters_validity()?;

        let content_dir = self
            .content_dir
            .ok_or(Error::MissingInput("content directory"))?;
        let style_dir = self.style_dir.ok_or(Error::MissingInput("style directory"))?;
        let run_dir = self.run_dir.ok_or(Error::MissingInput("run directory"))?;

        if self.max_workers == Some(0) {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: 1024.0,
                value: 0.0,
                name: "max-workers",
            }));
        }

        if !self.template.has_extractor() {
            return Err(Error::MissingInput("feature extractor"));
        }

        let contents = list_images(&content_dir)?;
        let styles = list_images(&style_dir)?;
        let content_names = output_names(&contents)?;
        let style_names = output_names(&styles)?;

        let workers = self
            .max_workers
            .unwrap_or_else(num_cpus::get)
            .min(contents.len());

        Ok(Batch {
            template: self.template,
            content_dir,
            style_dir,
            run_dir,
            contents,
            styles,
            content_names,
            style_names,
            workers,
        })
    }
}
