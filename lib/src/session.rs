use crate::{
    errors,
    extractor::FeatureExtractor,
    loss::{GramNormalization, LossConfig, LossValue, Objective},
    optim::Adam,
    utils, Dims, Error, GeneratedImage, ImageSource, Parameters, PIXEL_MAX, PIXEL_MIN,
};
use ndarray::{Array4, Axis};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use tracing::{debug, info};

/// Style transfer session.
///
/// Holds the reference activations of the content image, the Gram matrices
/// of the style image, and the image being optimized. Calling `run()` performs
/// every step and returns the final image, consuming the session in the
/// process. You can provide an `OptimizationProgress` implementation to get
/// an update with the current image and loss after every step.
///
/// # Example
/// ```no_run
/// let vgg = neural_style::FeatureExtractor::vgg19("vgg19.bin").expect("failed to load weights");
///
/// let session = neural_style::Session::builder()
///     .extractor(&vgg)
///     .content_image(&"content/tom.jpg")
///     .style_image(&"style/starry_night.jpg")
///     .seed(10)
///     .build()
///     .expect("failed to build session");
///
/// let generated = session.run(None).expect("optimization failed");
/// generated.save("out").expect("failed to save images");
/// ```
pub struct Session<'a> {
    extractor: &'a FeatureExtractor,
    objective: Objective,
    taps: Vec<usize>,
    pixels: Array4<f32>,
    optimizer: Adam,
    params: Parameters,
    loss_history: Vec<f64>,
}

impl<'a> Session<'a> {
    /// Creates a new session with default parameters.
    pub fn builder() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// The image being optimized, shaped `(restarts, 3, height, width)`
    pub fn pixels(&self) -> &Array4<f32> {
        &self.pixels
    }

    /// The loss of every step taken so far
    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    /// Performs a single optimization step.
    ///
    /// The returned loss is the one evaluated before the pixels were updated.
    pub fn step(&mut self) -> Result<LossValue, Error> {
        let (features, tape) = self.extractor.forward(&self.pixels, &self.taps, true)?;
        let evaluation = self.objective.evaluate(&features, true)?;

        let architecture = self.extractor.architecture();
        let gradients = evaluation
            .gradients
            .into_iter()
            .map(|(layer, grad)| match architecture.position(&layer) {
                Some(index) => Ok((index, grad)),
                None => Err(Error::UnknownLayer(layer)),
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let grad = self.extractor.backward(&tape, gradients)?;
        self.optimizer.step(&mut self.pixels, &grad)?;

        // also maps NaN to PIXEL_MIN
        self.pixels.mapv_inplace(|v| v.max(PIXEL_MIN).min(PIXEL_MAX));

        self.loss_history.push(evaluation.value.total);
        Ok(evaluation.value)
    }

    /// Runs every remaining step and returns the generated images.
    pub fn run(
        mut self,
        mut progress: Option<Box<dyn OptimizationProgress + '_>>,
    ) -> Result<GeneratedImage, Error> {
        let total = self.params.epochs as usize;
        let log_every = (total / 10).max(1);

        let mut last = None;
        for epoch in self.loss_history.len()..total {
            let loss = self.step()?;

            if (epoch + 1) % log_every == 0 {
                debug!(
                    epoch = epoch + 1,
                    total = loss.total,
                    content = loss.content,
                    style = loss.style,
                    "optimization step"
                );
            }

            if let Some(ref mut prog) = progress {
                let image = utils::pixels_to_image(self.pixels.index_axis(Axis(0), 0));
                prog.update(ProgressUpdate {
                    image: &image,
                    epoch: ProgressStat {
                        current: epoch + 1,
                        total,
                    },
                    loss,
                });
            }

            last = Some(loss);
        }

        if let Some(loss) = last {
            info!(
                epochs = total,
                restarts = self.pixels.dim().0,
                total = loss.total,
                content = loss.content,
                style = loss.style,
                "optimization finished"
            );
        }

        Ok(GeneratedImage {
            pixels: self.pixels,
            loss_history: self.loss_history,
        })
    }
}

/// Builds a session by setting parameters and the two input images, calling
/// `build` loads the images and verifies that every parameter and layer name
/// is valid
#[derive(Clone, Default)]
pub struct SessionBuilder<'a> {
    extractor: Option<&'a FeatureExtractor>,
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The pretrained network the losses are measured with
    pub fn extractor(mut self, extractor: &'a FeatureExtractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// The image whose structure is preserved
    pub fn content_image<I: Into<ImageSource<'a>>>(mut self, content: I) -> Self {
        self.content = Some(content.into());
        self
    }

    /// The image whose textures and colors are adopted
    pub fn style_image<I: Into<ImageSource<'a>>>(mut self, style: I) -> Self {
        self.style = Some(style.into());
        self
    }

    /// The number of optimization steps, there is no early stopping.
    ///
    /// Default: 20000
    pub fn epochs(mut self, epochs: u32) -> Self {
        self.params.epochs = epochs;
        self
    }

    /// Both input images are resized to this, and it is the size of the
    /// generated image.
    ///
    /// Default: 224x224
    pub fn input_size(mut self, dims: Dims) -> Self {
        self.params.input_size = dims;
        self
    }

    /// Seeds the random initialization of the generated image.
    ///
    /// Default: 7442
    pub fn seed(mut self, value: u64) -> Self {
        self.params.seed = value;
        self
    }

    /// The number of independently initialized images optimized together.
    ///
    /// Default: 1
    pub fn random_starts(mut self, count: u32) -> Self {
        self.params.random_starts = count;
        self
    }

    /// Adam's step size, in pixel units.
    ///
    /// Default: 0.255
    pub fn learning_rate(mut self, value: f32) -> Self {
        self.params.learning_rate = value;
        self
    }

    /// Coefficient of the content loss. Negative values are allowed.
    ///
    /// Default: 1.0
    pub fn alpha(mut self, value: f64) -> Self {
        self.params.loss.alpha = value;
        self
    }

    /// Coefficient of the style loss. Negative values are allowed.
    ///
    /// Default: 5000.0
    pub fn beta(mut self, value: f64) -> Self {
        self.params.loss.beta = value;
        self
    }

    /// Layers whose activations are matched against the content image.
    ///
    /// Default: `conv4_2`
    pub fn content_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.loss.content.layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// Layers whose Gram matrices are matched against the style image.
    ///
    /// Default: `conv1_1`, `conv2_1`, `conv3_1`, `conv4_1`
    pub fn style_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.loss.style.layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// One weight per content layer.
    ///
    /// Default: `1/n` for each of the `n` layers
    pub fn content_weights(mut self, weights: Vec<f32>) -> Self {
        self.params.loss.content.weights = Some(weights);
        self
    }

    /// One weight per style layer.
    ///
    /// Default: `1/n` for each of the `n` layers
    pub fn style_weights(mut self, weights: Vec<f32>) -> Self {
        self.params.loss.style.weights = Some(weights);
        self
    }

    /// How Gram matrices are normalized before being compared.
    ///
    /// Default: `GramNormalization::None`
    pub fn gram_normalization(mut self, normalization: GramNormalization) -> Self {
        self.params.loss.gram_normalization = normalization;
        self
    }

    /// Replaces the whole loss definition at once
    pub fn loss_config(mut self, config: LossConfig) -> Self {
        self.params.loss = config;
        self
    }

    pub(crate) fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Creates a `Session`, or returns an error if invalid parameters, layer
    /// names or input images were specified.
    pub fn build(self) -> Result<Session<'a>, Error> {
        self.check_parameters_validity()?;

        let extractor = self
            .extractor
            .ok_or(Error::MissingInput("feature extractor"))?;
        let content_src = self.content.ok_or(Error::MissingInput("content image"))?;
        let style_src = self.style.ok_or(Error::MissingInput("style image"))?;

        let params = self.params;
        let loss = &params.loss;
        let size = params.input_size;

        loss.content.resolved_weights("content")?;
        loss.style.resolved_weights("style")?;

        let content_taps = extractor.resolve(&loss.content.layers)?;
        let style_taps = extractor.resolve(&loss.style.layers)?;

        let mut taps: Vec<usize> = content_taps.iter().chain(&style_taps).copied().collect();
        taps.sort_unstable();
        taps.dedup();
        extractor.check_input_size(&taps, size)?;

        let content_pixels = utils::load_pixels(content_src, size)?;
        let style_pixels = utils::load_pixels(style_src, size)?;

        let (content_features, _) = extractor.forward(&content_pixels, &content_taps, false)?;
        let (style_features, _) = extractor.forward(&style_pixels, &style_taps, false)?;
        let objective = Objective::new(loss, &content_features, &style_features)?;

        let shape = (
            params.random_starts as usize,
            3,
            size.height as usize,
            size.width as usize,
        );
        let mut rng = Pcg32::seed_from_u64(params.seed);
        let pixels = Array4::from_shape_simple_fn(shape, || rng.gen::<f32>() * PIXEL_MAX);

        info!(
            width = size.width,
            height = size.height,
            restarts = params.random_starts,
            epochs = params.epochs,
            seed = params.seed,
            "session ready"
        );

        Ok(Session {
            extractor,
            objective,
            taps,
            optimizer: Adam::new(params.learning_rate, pixels.dim()),
            pixels,
            params,
            loss_history: Vec::new(),
        })
    }

    pub(crate) fn has_extractor(&self) -> bool {
        self.extractor.is_some()
    }

    pub(crate) fn check_parameters_validity(&self) -> Result<(), Error> {
        if self.params.epochs == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: 0.0,
                name: "epochs",
            }));
        }

        if self.params.random_starts == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: 0.0,
                name: "random-starts",
            }));
        }

        let lr = self.params.learning_rate;
        if !(lr > 0.0 && lr.is_finite()) {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: f32::MIN_POSITIVE,
                max: f32::MAX,
                value: lr,
                name: "learning-rate",
            }));
        }

        let size = self.params.input_size;
        if size.width == 0 || size.height == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: size.width.min(size.height) as f32,
                name: "input-size",
            }));
        }

        Ok(())
    }
}

/// Helper struct for passing progress information to external callers
#[derive(Copy, Clone, Debug)]
pub struct ProgressStat {
    /// The current amount of work that has been done
    pub current: usize,
    /// The total amount of work to do
    pub total: usize,
}

/// The state of the optimization after a step
pub struct ProgressUpdate<'a> {
    /// The first restart of the image being optimized
    pub image: &'a image::RgbImage,
    /// The number of steps taken
    pub epoch: ProgressStat,
    /// The loss evaluated during the last step
    pub loss: LossValue,
}

/// Allows the session to update external callers with the current progress
/// of the optimization
pub trait OptimizationProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> OptimizationProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}
