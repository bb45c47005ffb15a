//! Layer taps over a frozen feature network.

use crate::{
    network::{Architecture, Conv3x3, Stage, StageKind, TapeEntry},
    weights::NetworkWeights,
    Dims, Error,
};
use ndarray::{Array4, Axis};
use std::path::Path;

/// Per-channel mean of the images VGG19 was trained on, on the unit scale
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation of the images VGG19 was trained on
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Maps `[0, 255]` pixels to the normalized input the network expects
pub fn normalize(pixels: &Array4<f32>) -> Array4<f32> {
    let mut normalized = pixels / 255.0;

    for (c, mut channel) in normalized.axis_iter_mut(Axis(1)).enumerate() {
        let (mean, std) = (IMAGENET_MEAN[c % 3], IMAGENET_STD[c % 3]);
        channel.mapv_inplace(|v| (v - mean) / std);
    }

    normalized
}

/// The activations captured during one forward pass, keyed by layer name and
/// kept in the network's forward order
#[derive(Clone, Debug, Default)]
pub struct Features {
    layers: Vec<(String, Array4<f32>)>,
}

impl Features {
    pub fn get(&self, name: &str) -> Option<&Array4<f32>> {
        self.layers
            .iter()
            .find(|(layer, _)| layer == name)
            .map(|(_, activation)| activation)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.layers.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array4<f32>)> + '_ {
        self.layers
            .iter()
            .map(|(name, activation)| (name.as_str(), activation))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl std::iter::FromIterator<(String, Array4<f32>)> for Features {
    fn from_iter<I: IntoIterator<Item = (String, Array4<f32>)>>(iter: I) -> Self {
        Self {
            layers: iter.into_iter().collect(),
        }
    }
}

/// Everything the backward pass needs from a forward pass
pub(crate) struct Tape {
    input_dim: (usize, usize, usize, usize),
    entries: Vec<TapeEntry>,
}

/// A pretrained network whose intermediate activations can be read by name.
///
/// The parameters are never updated; gradients only ever flow back to the
/// input pixels.
pub struct FeatureExtractor {
    architecture: Architecture,
    stages: Vec<Stage>,
}

impl FeatureExtractor {
    /// Loads `weights` into the stages of `architecture`
    pub fn new(architecture: Architecture, weights: &NetworkWeights) -> Result<Self, Error> {
        weights.check(&architecture)?;

        let mut convs = weights.convs().iter();
        let mut stages = Vec::with_capacity(architecture.len());

        for spec in architecture.stages() {
            let stage = match spec.kind {
                StageKind::Conv { .. } => match convs.next() {
                    Some(conv) => Stage::Conv(Conv3x3::from_weights(conv)?),
                    None => {
                        return Err(Error::WeightsMismatch(format!(
                            "no kernel for '{}'",
                            spec.name
                        )))
                    }
                },
                StageKind::Relu => Stage::Relu,
                StageKind::MaxPool => Stage::MaxPool,
            };
            stages.push(stage);
        }

        Ok(Self {
            architecture,
            stages,
        })
    }

    /// Loads VGG19 from a weight archive
    pub fn vgg19<P: AsRef<Path>>(weights: P) -> Result<Self, Error> {
        Self::new(Architecture::vgg19(), &NetworkWeights::open(weights)?)
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    /// Resolves layer names to stage positions, in forward order and without
    /// duplicates
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>, Error> {
        let mut taps = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.architecture
                    .position(name)
                    .ok_or_else(|| Error::UnknownLayer(name.to_owned()))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        taps.sort_unstable();
        taps.dedup();
        Ok(taps)
    }

    /// Checks that an input of `size` survives every stage up to the deepest
    /// of `taps`
    pub(crate) fn check_input_size(&self, taps: &[usize], size: Dims) -> Result<(), Error> {
        match taps.last() {
            Some(&deepest) => self.architecture.output_shape(deepest, size).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Runs `pixels`, a `(batch, 3, height, width)` tensor with values in
    /// `[0, 255]`, through the network and returns the activations of the
    /// named layers.
    ///
    /// Only the stages up to the deepest requested layer are evaluated.
    pub fn extract<S: AsRef<str>>(
        &self,
        pixels: &Array4<f32>,
        names: &[S],
    ) -> Result<Features, Error> {
        let taps = self.resolve(names)?;
        self.forward(pixels, &taps, false).map(|(features, _)| features)
    }

    pub(crate) fn forward(
        &self,
        pixels: &Array4<f32>,
        taps: &[usize],
        record: bool,
    ) -> Result<(Features, Tape), Error> {
        let (batch, channels, height, width) = pixels.dim();
        if channels != 3 {
            return Err(Error::ShapeMismatch(
                pixels.shape().to_vec(),
                vec![batch, 3, height, width],
            ));
        }

        self.check_input_size(taps, Dims::new(width as u32, height as u32))?;

        let mut tape = Tape {
            input_dim: pixels.dim(),
            entries: Vec::new(),
        };
        let mut features = Features::default();

        let deepest = match taps.last() {
            Some(&deepest) => deepest,
            None => return Ok((features, tape)),
        };

        let mut activation = normalize(pixels);

        for (index, stage) in self.stages.iter().enumerate().take(deepest + 1) {
            activation = if record {
                let (output, entry) = stage.forward_taped(activation)?;
                tape.entries.push(entry);
                output
            } else {
                stage.forward(activation)?
            };

            if taps.binary_search(&index).is_ok() {
                features.layers.push((
                    self.architecture.stages()[index].name.clone(),
                    activation.clone(),
                ));
            }
        }

        Ok((features, tape))
    }

    /// Propagates gradients with respect to the outputs of the specified
    /// stages back to the input pixels
    pub(crate) fn backward(
        &self,
        tape: &Tape,
        gradients: Vec<(usize, Array4<f32>)>,
    ) -> Result<Array4<f32>, Error> {
        let mut injected: Vec<Option<Array4<f32>>> =
            (0..tape.entries.len()).map(|_| None).collect();

        for (index, grad) in gradients {
            if index >= injected.len() {
                return Err(Error::UnknownLayer(
                    self.architecture
                        .stages()
                        .get(index)
                        .map(|stage| stage.name.clone())
                        .unwrap_or_else(|| index.to_string()),
                ));
            }

            if let Some(existing) = injected[index].as_mut() {
                *existing += &grad;
            } else {
                injected[index] = Some(grad);
            }
        }

        let mut running: Option<Array4<f32>> = None;

        for index in (0..tape.entries.len()).rev() {
            if let Some(grad) = injected[index].take() {
                running = Some(match running {
                    Some(mut sum) => {
                        sum += &grad;
                        sum
                    }
                    None => grad,
                });
            }

            if let Some(grad) = running.take() {
                running = Some(self.stages[index].backward(grad, &tape.entries[index])?);
            }
        }

        let mut grad = match running {
            Some(grad) => grad,
            None => return Ok(Array4::zeros(tape.input_dim)),
        };

        // undo the normalization's scaling, the mean shift has no gradient
        for (c, mut channel) in grad.axis_iter_mut(Axis(1)).enumerate() {
            let scale = 1.0 / (255.0 * IMAGENET_STD[c % 3]);
            channel.mapv_inplace(|v| v * scale);
        }

        Ok(grad)
    }
}
