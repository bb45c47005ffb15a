//! Content, style and combined losses, and their gradients with respect to the
//! tapped feature maps.

use crate::{extractor::Features, Error};
use ndarray::{Array2, Array3, Array4, ArrayView3, Axis, Zip};
use serde::Serialize;

/// How Gram matrices are scaled before being compared
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GramNormalization {
    /// The raw `F · Fᵀ`, so the style term grows with the feature map size
    None,
    /// `F · Fᵀ / (c · h · w)`
    ElementCount,
}

impl Default for GramNormalization {
    fn default() -> Self {
        Self::None
    }
}

impl GramNormalization {
    pub fn scale(self, channels: usize, height: usize, width: usize) -> f32 {
        match self {
            Self::None => 1.0,
            Self::ElementCount => 1.0 / (channels * height * width).max(1) as f32,
        }
    }
}

impl std::str::FromStr for GramNormalization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "element-count" => Ok(Self::ElementCount),
            other => Err(format!(
                "unknown Gram normalization '{}', expected 'none' or 'element-count'",
                other
            )),
        }
    }
}

/// Layers contributing to one loss term, and how much each contributes
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LayerSelection {
    pub layers: Vec<String>,
    /// One weight per layer, `None` weighs every layer `1/n`
    pub weights: Option<Vec<f32>>,
}

impl LayerSelection {
    pub fn uniform<I, S>(layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            layers: layers.into_iter().map(Into::into).collect(),
            weights: None,
        }
    }

    /// Explicit per-layer weights. Their sum isn't normalized, it sets the
    /// scale of the term
    pub fn weighted<I, S>(layers: I, weights: Vec<f32>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            layers: layers.into_iter().map(Into::into).collect(),
            weights: Some(weights),
        }
    }

    /// The weight of every layer, in selection order
    pub fn resolved_weights(&self, term: &'static str) -> Result<Vec<f32>, Error> {
        match &self.weights {
            Some(weights) if weights.len() != self.layers.len() => {
                Err(Error::WeightCountMismatch {
                    term,
                    layers: self.layers.len(),
                    weights: weights.len(),
                })
            }
            Some(weights) => Ok(weights.clone()),
            None => {
                let n = self.layers.len();
                Ok(vec![1.0 / n as f32; n])
            }
        }
    }
}

/// Everything that defines the objective being minimized
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LossConfig {
    pub content: LayerSelection,
    pub style: LayerSelection,
    /// Coefficient of the content term, used as is
    pub alpha: f64,
    /// Coefficient of the style term, used as is
    pub beta: f64,
    pub gram_normalization: GramNormalization,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            content: LayerSelection::uniform(vec!["conv4_2"]),
            style: LayerSelection::uniform(vec!["conv1_1", "conv2_1", "conv3_1", "conv4_1"]),
            alpha: 1.0,
            beta: 5e3,
            gram_normalization: GramNormalization::None,
        }
    }
}

/// The loss of one step
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct LossValue {
    pub content: f64,
    pub style: f64,
    pub total: f64,
}

/// `alpha · content + beta · style`, with no clamping of either coefficient
pub fn combine(alpha: f64, beta: f64, content: f64, style: f64) -> f64 {
    alpha * content + beta * style
}

fn flatten(item: ArrayView3<'_, f32>) -> Array2<f32> {
    let (channels, height, width) = item.dim();
    Array2::from_shape_fn((channels, height * width), |(c, i)| {
        item[[c, i / width, i % width]]
    })
}

/// The Gram matrix of every item of a `(batch, c, h, w)` feature map, shaped
/// `(batch, c, c)`
pub fn gram_matrix(features: &Array4<f32>, normalization: GramNormalization) -> Array3<f32> {
    let (batch, channels, height, width) = features.dim();
    let scale = normalization.scale(channels, height, width);

    let mut grams = Array3::zeros((batch, channels, channels));
    for (item, mut gram) in features.outer_iter().zip(grams.outer_iter_mut()) {
        let flat = flatten(item);
        gram.assign(&flat.dot(&flat.t()));
        gram *= scale;
    }

    grams
}

/// Index of the reference item compared against generated item `b`
fn reference_index(reference_batch: usize, b: usize) -> usize {
    if reference_batch == 1 {
        0
    } else {
        b
    }
}

/// References either match the generated batch or hold a single item that
/// every generated item is compared against
fn check_compatible(generated: &[usize], reference: &[usize]) -> Result<(), Error> {
    let batch_ok = reference[0] == 1 || reference[0] == generated[0];
    if !batch_ok || generated[1..] != reference[1..] {
        return Err(Error::ShapeMismatch(generated.to_vec(), reference.to_vec()));
    }
    Ok(())
}

/// `weight · ‖g − r‖² / 2` for one layer, and optionally its gradient
/// `weight · (g − r)`
fn content_layer(
    generated: &Array4<f32>,
    reference: &Array4<f32>,
    weight: f32,
    want_grad: bool,
) -> Result<(f64, Option<Array4<f32>>), Error> {
    check_compatible(generated.shape(), reference.shape())?;

    let reference_batch = reference.dim().0;
    let mut grad = if want_grad {
        Some(Array4::zeros(generated.dim()))
    } else {
        None
    };

    let mut squared = 0.0f64;
    for (b, item) in generated.outer_iter().enumerate() {
        let target = reference.index_axis(Axis(0), reference_index(reference_batch, b));

        Zip::from(&item).and(&target).for_each(|&g, &r| {
            let diff = f64::from(g - r);
            squared += diff * diff;
        });

        if let Some(grad) = grad.as_mut() {
            let mut grad_item = grad.index_axis_mut(Axis(0), b);
            Zip::from(&mut grad_item)
                .and(&item)
                .and(&target)
                .for_each(|d, &g, &r| *d = weight * (g - r));
        }
    }

    Ok((f64::from(weight) * squared / 2.0, grad))
}

/// `weight / (2·h·w·c)² · ‖G(g) − A‖²` for one layer, where `A` holds the
/// reference Gram matrices, and optionally its gradient
/// `weight / (2·h·w·c)² · 4·s · (G − A) · F` with `s` the Gram scale
fn style_layer(
    generated: &Array4<f32>,
    target: &Array3<f32>,
    weight: f32,
    normalization: GramNormalization,
    want_grad: bool,
) -> Result<(f64, Option<Array4<f32>>), Error> {
    let (batch, channels, height, width) = generated.dim();
    check_compatible(&[batch, channels, channels], target.shape())?;

    let scale = normalization.scale(channels, height, width);
    let denominator = 2.0 * (height * width * channels) as f64;
    let layer_scale = f64::from(weight) / (denominator * denominator);

    let mut grad = if want_grad {
        Some(Array4::zeros(generated.dim()))
    } else {
        None
    };

    let mut squared = 0.0f64;
    for (b, item) in generated.outer_iter().enumerate() {
        let flat = flatten(item);
        let mut diff = flat.dot(&flat.t());
        diff *= scale;
        diff -= &target.index_axis(Axis(0), reference_index(target.dim().0, b));

        squared += diff.iter().map(|&d| f64::from(d) * f64::from(d)).sum::<f64>();

        if let Some(grad) = grad.as_mut() {
            let mut grad_flat = diff.dot(&flat);
            grad_flat *= (layer_scale * 4.0 * f64::from(scale)) as f32;
            grad.index_axis_mut(Axis(0), b)
                .assign(&grad_flat.into_shape((channels, height, width))?);
        }
    }

    Ok((layer_scale * squared, grad))
}

fn check_counts(
    term: &'static str,
    generated: usize,
    reference: usize,
    weights: usize,
) -> Result<(), Error> {
    if generated != reference {
        return Err(Error::ShapeMismatch(vec![generated], vec![reference]));
    }
    if generated != weights {
        return Err(Error::WeightCountMismatch {
            term,
            layers: generated,
            weights,
        });
    }
    Ok(())
}

/// The content loss over parallel lists of generated and reference feature
/// maps, one per layer
pub fn content_loss(
    generated: &[&Array4<f32>],
    reference: &[&Array4<f32>],
    weights: &[f32],
) -> Result<f64, Error> {
    check_counts("content", generated.len(), reference.len(), weights.len())?;

    let mut loss = 0.0;
    for ((g, r), &w) in generated.iter().zip(reference).zip(weights) {
        loss += content_layer(g, r, w, false)?.0;
    }
    Ok(loss)
}

/// The style loss over parallel lists of generated and reference feature maps,
/// one per layer
pub fn style_loss(
    generated: &[&Array4<f32>],
    reference: &[&Array4<f32>],
    weights: &[f32],
    normalization: GramNormalization,
) -> Result<f64, Error> {
    check_counts("style", generated.len(), reference.len(), weights.len())?;

    let mut loss = 0.0;
    for ((g, r), &w) in generated.iter().zip(reference).zip(weights) {
        let target = gram_matrix(r, normalization);
        loss += style_layer(g, &target, w, normalization, false)?.0;
    }
    Ok(loss)
}

struct ContentTarget {
    layer: String,
    weight: f32,
    activation: Array4<f32>,
}

struct StyleTarget {
    layer: String,
    weight: f32,
    gram: Array3<f32>,
}

/// The loss at one point, and its gradient with respect to each tapped layer
pub(crate) struct Evaluation {
    pub(crate) value: LossValue,
    pub(crate) gradients: Vec<(String, Array4<f32>)>,
}

/// The combined loss against fixed references, whose content activations and
/// style Gram matrices are computed once up front
pub(crate) struct Objective {
    alpha: f64,
    beta: f64,
    normalization: GramNormalization,
    content: Vec<ContentTarget>,
    style: Vec<StyleTarget>,
}

fn find<'f>(features: &'f Features, layer: &str) -> Result<&'f Array4<f32>, Error> {
    features
        .get(layer)
        .ok_or_else(|| Error::UnknownLayer(layer.to_owned()))
}

impl Objective {
    pub(crate) fn new(
        config: &LossConfig,
        content: &Features,
        style: &Features,
    ) -> Result<Self, Error> {
        let content_weights = config.content.resolved_weights("content")?;
        let style_weights = config.style.resolved_weights("style")?;

        let content = config
            .content
            .layers
            .iter()
            .zip(content_weights)
            .map(|(layer, weight)| -> Result<_, Error> {
                Ok(ContentTarget {
                    layer: layer.clone(),
                    weight,
                    activation: find(content, layer)?.clone(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let style = config
            .style
            .layers
            .iter()
            .zip(style_weights)
            .map(|(layer, weight)| -> Result<_, Error> {
                Ok(StyleTarget {
                    layer: layer.clone(),
                    weight,
                    gram: gram_matrix(find(style, layer)?, config.gram_normalization),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self {
            alpha: config.alpha,
            beta: config.beta,
            normalization: config.gram_normalization,
            content,
            style,
        })
    }

    /// Evaluates the loss of `features`, along with its gradient when
    /// `want_grad` is set
    pub(crate) fn evaluate(&self, features: &Features, want_grad: bool) -> Result<Evaluation, Error> {
        let mut gradients: Vec<(String, Array4<f32>)> = Vec::new();
        let mut accumulate = |layer: &str, grad: Option<Array4<f32>>, coefficient: f64| {
            if let Some(mut grad) = grad {
                grad *= coefficient as f32;
                match gradients.iter_mut().find(|(name, _)| name == layer) {
                    Some((_, existing)) => *existing += &grad,
                    None => gradients.push((layer.to_owned(), grad)),
                }
            }
        };

        let mut content = 0.0;
        for target in &self.content {
            let generated = find(features, &target.layer)?;
            let (loss, grad) =
                content_layer(generated, &target.activation, target.weight, want_grad)?;
            content += loss;
            accumulate(&target.layer, grad, self.alpha);
        }

        let mut style = 0.0;
        for target in &self.style {
            let generated = find(features, &target.layer)?;
            let (loss, grad) = style_layer(
                generated,
                &target.gram,
                target.weight,
                self.normalization,
                want_grad,
            )?;
            style += loss;
            accumulate(&target.layer, grad, self.beta);
        }

        Ok(Evaluation {
            value: LossValue {
                content,
                style,
                total: combine(self.alpha, self.beta, content, style),
            },
            gradients,
        })
    }
}
