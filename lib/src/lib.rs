// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` optimizes an image so that its deep features match the
//! content of one image and the style of another, following Gatys et al.'s
//! neural style transfer over a frozen VGG19 feature stack.
//!
//! First, you load a `FeatureExtractor` from a VGG19 weight archive. Then you
//! build a `Session` via a `SessionBuilder`, which follows the builder pattern.
//! Calling `build` on the `SessionBuilder` loads both input images, computes
//! the reference content activations and style Gram matrices once, and seeds
//! the randomly initialized image.
//!
//! `Session` has a `run()` method that performs a fixed number of Adam steps
//! on the image pixels and returns a `GeneratedImage`, which holds one image
//! per random restart and the loss history.
//!
//! For whole directories of content and style images, see [`Batch`].
//!
//! ## Loss
//!
//! * content: `(Σ w_l · ‖F_l − P_l‖²) / 2` over the content layers
//! * style: `Σ w_l / (2·d·e·c)² · ‖G(F_l) − G(S_l)‖²` over the style layers,
//!   where `G` is the Gram matrix of the feature map
//! * total: `alpha · content + beta · style`
//!
//! ## Usage
//!
//! ```no_run
//! use neural_style as ns;
//!
//! let vgg = ns::FeatureExtractor::vgg19("vgg19.bin").expect("failed to load weights");
//!
//! let session = ns::Session::builder()
//!     .extractor(&vgg)
//!     .content_image(&"content/tom.jpg")
//!     .style_image(&"style/starry_night.jpg")
//!     .epochs(500)
//!     .build()
//!     .expect("failed to build session");
//!
//! let generated = session.run(None).expect("optimization failed");
//! generated.save("out/tom").expect("failed to save generated images");
//! ```
pub mod batch;
mod errors;
pub mod extractor;
pub mod loss;
pub mod network;
mod optim;
mod plot;
pub mod session;
mod utils;
pub mod weights;

pub use image;
pub use ndarray;
use ndarray::Array4;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub use batch::{
    Batch, BatchBuilder, BatchProgress, BatchUpdate, LossComparison, Manifest, PairFailure,
    PairReport,
};
pub use errors::Error;
pub use extractor::{FeatureExtractor, Features};
pub use loss::{GramNormalization, LayerSelection, LossConfig, LossValue};
pub use network::{Architecture, StageKind, StageSpec, VGG19_LAYERS};
pub use session::{
    OptimizationProgress, ProgressStat, ProgressUpdate, Session, SessionBuilder,
};
pub use utils::{load_dynamic_image, load_pixels, ImageSource};
pub use weights::{ConvWeights, NetworkWeights};

/// Lowest value a generated pixel may take
pub const PIXEL_MIN: f32 = 0.0;
/// Highest value a generated pixel may take
pub const PIXEL_MAX: f32 = 255.0;

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Every hyperparameter of a run, serialized verbatim into
/// `configuration.json` for provenance.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct Parameters {
    epochs: u32,
    input_size: Dims,
    seed: u64,
    random_starts: u32,
    learning_rate: f32,
    #[serde(flatten)]
    loss: LossConfig,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            epochs: 20000,
            input_size: Dims::square(224),
            seed: 7442,
            random_starts: 1,
            // 1e-3 on the unit pixel scale
            learning_rate: 0.255,
            loss: LossConfig::default(),
        }
    }
}

/// The images generated by a `Session::run()`, one per random restart,
/// together with the loss recorded at every step
pub struct GeneratedImage {
    pixels: Array4<f32>,
    loss_history: Vec<f64>,
}

impl GeneratedImage {
    /// The optimized pixels, shaped `(restarts, 3, height, width)` with values
    /// in `[PIXEL_MIN, PIXEL_MAX]`
    pub fn pixels(&self) -> &Array4<f32> {
        &self.pixels
    }

    /// The total loss evaluated at each step, in step order
    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    /// The number of independently initialized images
    pub fn restarts(&self) -> usize {
        self.pixels.dim().0
    }

    /// Converts each restart into an 8-bit RGB image
    pub fn to_images(&self) -> Vec<image::RgbImage> {
        utils::pixels_to_images(&self.pixels)
    }

    /// Saves every restart as `<index>.png` inside the specified directory,
    /// returning the paths that were written
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>, Error> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut written = Vec::with_capacity(self.restarts());
        for (i, img) in self.to_images().into_iter().enumerate() {
            let path = dir.join(format!("{}.png", i));
            img.save(&path)?;
            written.push(path);
        }

        Ok(written)
    }

    /// Plots the loss history on a log scale and saves it as a PNG
    pub fn save_loss_curve<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        plot::save_loss_curve(path.as_ref(), &self.loss_history)
    }

    /// Writes the loss history as a JSON array
    pub fn save_loss_history<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer(file, &self.loss_history)?;
        Ok(())
    }

    /// Returns the optimized pixels
    pub fn into_pixels(self) -> Array4<f32> {
        self.pixels
    }
}
