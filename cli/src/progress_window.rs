#[cfg(feature = "progress")]
use neural_style::Dims;

use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress")]
use minifb::Window;
use neural_style::{BatchProgress, BatchUpdate, OptimizationProgress, ProgressUpdate};

pub struct ProgressWindow {
    #[cfg(feature = "progress")]
    window: Option<(Window, std::time::Duration, std::time::Instant)>,

    epoch_pb: ProgressBar,
    total_len: usize,
}

impl ProgressWindow {
    pub fn new() -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .progress_chars("##-");

        let epoch_pb = ProgressBar::new(100);
        epoch_pb.set_style(sty);

        Self {
            #[cfg(feature = "progress")]
            window: None,
            epoch_pb,
            total_len: 100,
        }
    }

    #[cfg(feature = "progress")]
    pub fn with_preview(mut self, size: Dims, update_every: std::time::Duration) -> Self {
        match Window::new(
            "Neural Style",
            size.width as usize,
            size.height as usize,
            minifb::WindowOptions::default(),
        ) {
            Ok(window) => self.window = Some((window, update_every, std::time::Instant::now())),
            Err(err) => tracing::warn!(error = %err, "unable to open the preview window"),
        }

        self
    }
}

impl Drop for ProgressWindow {
    fn drop(&mut self) {
        self.epoch_pb.finish();
    }
}

impl OptimizationProgress for ProgressWindow {
    fn update(&mut self, update: ProgressUpdate<'_>) {
        if update.epoch.total != self.total_len {
            self.total_len = update.epoch.total;
            self.epoch_pb.set_length(self.total_len as u64);
        }

        self.epoch_pb.set_position(update.epoch.current as u64);
        self.epoch_pb
            .set_message(&format!("loss {:.4e}", update.loss.total));

        #[cfg(feature = "progress")]
        {
            if let Some((ref mut window, ref dur, ref mut last_update)) = self.window {
                let now = std::time::Instant::now();

                if now - *last_update < *dur {
                    return;
                }

                *last_update = now;

                if !window.is_open() {
                    return;
                }

                let pixels: Vec<u32> = update
                    .image
                    .pixels()
                    .map(|p| u32::from(p[0]) << 16 | u32::from(p[1]) << 8 | u32::from(p[2]))
                    .collect();

                // We don't particularly care if this fails
                let _ = window.update_with_buffer(
                    &pixels,
                    update.image.width() as usize,
                    update.image.height() as usize,
                );
            }
        }
    }
}

/// A single bar counting finished pairs, shared by every batch worker
pub struct BatchBars {
    pairs_pb: ProgressBar,
}

impl BatchBars {
    pub fn new(total_pairs: usize) -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} pairs {msg}")
            .progress_chars("##-");

        let pairs_pb = ProgressBar::new(total_pairs as u64);
        pairs_pb.set_style(sty);

        Self { pairs_pb }
    }
}

impl Drop for BatchBars {
    fn drop(&mut self) {
        self.pairs_pb.finish();
    }
}

impl BatchProgress for BatchBars {
    fn update(&self, update: BatchUpdate<'_>) {
        let name = |path: &std::path::Path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        self.pairs_pb.set_length(update.pairs.total as u64);
        self.pairs_pb.set_position(update.pairs.current as u64);
        self.pairs_pb.set_message(&format!(
            "{} {} x {}",
            if update.succeeded { "done" } else { "failed" },
            name(update.content),
            name(update.style)
        ));
    }
}
