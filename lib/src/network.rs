//! The feature network, expressed as an explicit ordered sequence of named
//! stages so that a layer name maps to exactly one position in the forward
//! pass.

use crate::{errors::InputTooSmall, weights::ConvWeights, Dims, Error};
use ndarray::{Array1, Array2, Array4, ArrayView3, ArrayViewMut3, Axis, Zip};

/// The names of VGG19's feature stages, in forward order
pub const VGG19_LAYERS: [&str; 37] = [
    "conv1_1", "relu1_1", "conv1_2", "relu1_2", "maxpool1", //
    "conv2_1", "relu2_1", "conv2_2", "relu2_2", "maxpool2", //
    "conv3_1", "relu3_1", "conv3_2", "relu3_2", "conv3_3", "relu3_3", "conv3_4", "relu3_4",
    "maxpool3", //
    "conv4_1", "relu4_1", "conv4_2", "relu4_2", "conv4_3", "relu4_3", "conv4_4", "relu4_4",
    "maxpool4", //
    "conv5_1", "relu5_1", "conv5_2", "relu5_2", "conv5_3", "relu5_3", "conv5_4", "relu5_4",
    "maxpool5",
];

/// (convolutions, width multiplier) for each of VGG19's blocks
const VGG19_BLOCKS: [(usize, usize); 5] = [(2, 1), (2, 2), (4, 4), (4, 8), (4, 8)];

/// Side of the square convolution kernels
pub(crate) const KERNEL: usize = 3;

/// What a single stage computes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    /// 3x3 convolution with stride 1 and zero padding 1
    Conv {
        in_channels: usize,
        out_channels: usize,
    },
    Relu,
    /// 2x2 max pool with stride 2, odd trailing rows/columns are dropped
    MaxPool,
}

/// A named stage of the network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
}

/// The ordered stages of a feature network.
///
/// This is the single source of truth for which layer names exist and where
/// they sit in the forward pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Architecture {
    stages: Vec<StageSpec>,
}

impl Architecture {
    /// The 37 feature stages of VGG19
    pub fn vgg19() -> Self {
        Self::vgg19_with_base_width(64)
    }

    /// VGG19's topology with the channel widths of the five blocks set to
    /// `base`, `2·base`, `4·base`, `8·base` and `8·base`.
    ///
    /// Stage names are the same as VGG19's regardless of the width, which
    /// makes narrow networks useful stand-ins when pretrained weights
    /// aren't needed.
    pub fn vgg19_with_base_width(base: usize) -> Self {
        let mut stages = Vec::with_capacity(VGG19_LAYERS.len());
        let mut in_channels = 3;

        for (block, &(convs, multiplier)) in VGG19_BLOCKS.iter().enumerate() {
            let out_channels = base * multiplier;

            for conv in 1..=convs {
                stages.push(StageSpec {
                    name: format!("conv{}_{}", block + 1, conv),
                    kind: StageKind::Conv {
                        in_channels,
                        out_channels,
                    },
                });
                stages.push(StageSpec {
                    name: format!("relu{}_{}", block + 1, conv),
                    kind: StageKind::Relu,
                });
                in_channels = out_channels;
            }

            stages.push(StageSpec {
                name: format!("maxpool{}", block + 1),
                kind: StageKind::MaxPool,
            });
        }

        Self { stages }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Position of the named stage in the forward pass
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name == name)
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.stages.iter().map(|stage| stage.name.as_str())
    }

    /// The `(channels, height, width)` produced by the stage at `index` for
    /// an input of the specified size
    pub fn output_shape(&self, index: usize, input: Dims) -> Result<(usize, usize, usize), Error> {
        let mut channels = 3;
        let (mut height, mut width) = (input.height as usize, input.width as usize);

        for stage in self.stages.iter().take(index + 1) {
            match stage.kind {
                StageKind::Conv { out_channels, .. } => channels = out_channels,
                StageKind::Relu => {}
                StageKind::MaxPool => {
                    if height < 2 || width < 2 {
                        return Err(Error::InputTooSmall(InputTooSmall {
                            layer: stage.name.clone(),
                            width: input.width,
                            height: input.height,
                        }));
                    }
                    height /= 2;
                    width /= 2;
                }
            }
        }

        Ok((channels, height, width))
    }
}

/// A frozen 3x3 convolution
pub(crate) struct Conv3x3 {
    in_channels: usize,
    out_channels: usize,
    /// `(out_channels, in_channels * 9)`, each row laid out as `(in, ky, kx)`
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Conv3x3 {
    pub(crate) fn from_weights(weights: &ConvWeights) -> Result<Self, Error> {
        let span = weights.in_channels * KERNEL * KERNEL;

        Ok(Self {
            in_channels: weights.in_channels,
            out_channels: weights.out_channels,
            weight: Array2::from_shape_vec((weights.out_channels, span), weights.weight.clone())?,
            bias: Array1::from(weights.bias.clone()),
        })
    }

    fn check_channels(&self, input: &Array4<f32>, expected: usize) -> Result<(), Error> {
        let (batch, channels, height, width) = input.dim();
        if channels != expected {
            return Err(Error::ShapeMismatch(
                vec![batch, channels, height, width],
                vec![batch, expected, height, width],
            ));
        }
        Ok(())
    }

    pub(crate) fn forward(&self, input: &Array4<f32>) -> Result<Array4<f32>, Error> {
        self.check_channels(input, self.in_channels)?;

        let (batch, _, height, width) = input.dim();
        let mut output = Array4::zeros((batch, self.out_channels, height, width));
        let bias = self.bias.view().insert_axis(Axis(1));

        for (item, mut out_item) in input.outer_iter().zip(output.outer_iter_mut()) {
            let mut result = self.weight.dot(&im2col(item));
            result += &bias;
            out_item.assign(&result.into_shape((self.out_channels, height, width))?);
        }

        Ok(output)
    }

    /// Gradient with respect to the input, the kernel itself never changes
    pub(crate) fn backward(&self, grad_output: &Array4<f32>) -> Result<Array4<f32>, Error> {
        self.check_channels(grad_output, self.out_channels)?;

        let (batch, _, height, width) = grad_output.dim();
        let mut grad_input = Array4::zeros((batch, self.in_channels, height, width));

        for (grad_item, in_item) in grad_output.outer_iter().zip(grad_input.outer_iter_mut()) {
            let grad_matrix = grad_item.into_shape((self.out_channels, height * width))?;
            let columns = self.weight.t().dot(&grad_matrix);
            col2im(&columns, in_item);
        }

        Ok(grad_input)
    }
}

/// Unfolds every 3x3 zero-padded neighborhood into a column, giving a
/// `(channels * 9, height * width)` matrix
fn im2col(input: ArrayView3<'_, f32>) -> Array2<f32> {
    let (channels, height, width) = input.dim();
    let mut columns = Array2::zeros((channels * KERNEL * KERNEL, height * width));

    for c in 0..channels {
        let plane = input.index_axis(Axis(0), c);
        for ky in 0..KERNEL {
            for kx in 0..KERNEL {
                let mut row = columns.row_mut((c * KERNEL + ky) * KERNEL + kx);
                // (y + ky, x + kx) are coordinates in the padded plane
                for y in 0..height {
                    let py = y + ky;
                    if py < 1 || py > height {
                        continue;
                    }
                    for x in 0..width {
                        let px = x + kx;
                        if px < 1 || px > width {
                            continue;
                        }
                        row[y * width + x] = plane[[py - 1, px - 1]];
                    }
                }
            }
        }
    }

    columns
}

/// The transpose of `im2col`, accumulating columns back onto the plane
fn col2im(columns: &Array2<f32>, mut output: ArrayViewMut3<'_, f32>) {
    let (channels, height, width) = output.dim();

    for c in 0..channels {
        for ky in 0..KERNEL {
            for kx in 0..KERNEL {
                let row = columns.row((c * KERNEL + ky) * KERNEL + kx);
                for y in 0..height {
                    let py = y + ky;
                    if py < 1 || py > height {
                        continue;
                    }
                    for x in 0..width {
                        let px = x + kx;
                        if px < 1 || px > width {
                            continue;
                        }
                        output[[c, py - 1, px - 1]] += row[y * width + x];
                    }
                }
            }
        }
    }
}

/// 2x2/2 max pool, returning the winning offset within each input plane
fn max_pool(input: &Array4<f32>) -> (Array4<f32>, Vec<usize>) {
    let (batch, channels, height, width) = input.dim();
    let (out_h, out_w) = (height / 2, width / 2);

    let mut output = Array4::zeros((batch, channels, out_h, out_w));
    let mut argmax = Vec::with_capacity(batch * channels * out_h * out_w);

    for b in 0..batch {
        for c in 0..channels {
            for y in 0..out_h {
                for x in 0..out_w {
                    let mut best = f32::MIN;
                    let mut best_idx = (2 * y) * width + 2 * x;
                    for dy in 0..2 {
                        for dx in 0..2 {
                            let (iy, ix) = (2 * y + dy, 2 * x + dx);
                            let value = input[[b, c, iy, ix]];
                            if value > best {
                                best = value;
                                best_idx = iy * width + ix;
                            }
                        }
                    }
                    output[[b, c, y, x]] = best;
                    argmax.push(best_idx);
                }
            }
        }
    }

    (output, argmax)
}

fn max_pool_backward(
    grad_output: &Array4<f32>,
    argmax: &[usize],
    (height, width): (usize, usize),
) -> Array4<f32> {
    let (batch, channels, out_h, out_w) = grad_output.dim();
    let mut grad_input = Array4::zeros((batch, channels, height, width));

    let mut winners = argmax.iter();
    for b in 0..batch {
        for c in 0..channels {
            for y in 0..out_h {
                for x in 0..out_w {
                    if let Some(&idx) = winners.next() {
                        grad_input[[b, c, idx / width, idx % width]] += grad_output[[b, c, y, x]];
                    }
                }
            }
        }
    }

    grad_input
}

/// A stage with its parameters loaded
pub(crate) enum Stage {
    Conv(Conv3x3),
    Relu,
    MaxPool,
}

/// What a stage remembers from the forward pass to run backwards
pub(crate) enum TapeEntry {
    Conv,
    /// The rectified output, its sign is the gradient mask
    Relu(Array4<f32>),
    MaxPool {
        argmax: Vec<usize>,
        input_hw: (usize, usize),
    },
}

impl Stage {
    pub(crate) fn forward(&self, input: Array4<f32>) -> Result<Array4<f32>, Error> {
        match self {
            Self::Conv(conv) => conv.forward(&input),
            Self::Relu => Ok(relu(input)),
            Self::MaxPool => Ok(max_pool(&input).0),
        }
    }

    pub(crate) fn forward_taped(
        &self,
        input: Array4<f32>,
    ) -> Result<(Array4<f32>, TapeEntry), Error> {
        match self {
            Self::Conv(conv) => Ok((conv.forward(&input)?, TapeEntry::Conv)),
            Self::Relu => {
                let output = relu(input);
                let mask = output.clone();
                Ok((output, TapeEntry::Relu(mask)))
            }
            Self::MaxPool => {
                let (_, _, height, width) = input.dim();
                let (output, argmax) = max_pool(&input);
                Ok((
                    output,
                    TapeEntry::MaxPool {
                        argmax,
                        input_hw: (height, width),
                    },
                ))
            }
        }
    }

    pub(crate) fn backward(
        &self,
        mut grad: Array4<f32>,
        entry: &TapeEntry,
    ) -> Result<Array4<f32>, Error> {
        match (self, entry) {
            (Self::Conv(conv), TapeEntry::Conv) => conv.backward(&grad),
            (Self::Relu, TapeEntry::Relu(output)) => {
                if grad.dim() != output.dim() {
                    return Err(Error::ShapeMismatch(
                        grad.shape().to_vec(),
                        output.shape().to_vec(),
                    ));
                }
                Zip::from(&mut grad).and(output).for_each(|g, &o| {
                    if o <= 0.0 {
                        *g = 0.0;
                    }
                });
                Ok(grad)
            }
            (Self::MaxPool, TapeEntry::MaxPool { argmax, input_hw }) => {
                Ok(max_pool_backward(&grad, argmax, *input_hw))
            }
            _ => Err(Error::TapeMismatch),
        }
    }
}

fn relu(mut input: Array4<f32>) -> Array4<f32> {
    input.mapv_inplace(|v| v.max(0.0));
    input
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg32;

    fn random_tensor(shape: (usize, usize, usize, usize), seed: u64) -> Array4<f32> {
        let mut rng = Pcg32::seed_from_u64(seed);
        Array4::from_shape_simple_fn(shape, || rng.gen_range(-1.0f32..1.0))
    }

    fn dot(a: &Array4<f32>, b: &Array4<f32>) -> f64 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| f64::from(*x) * f64::from(*y))
            .sum()
    }

    fn random_conv(in_channels: usize, out_channels: usize, seed: u64) -> Conv3x3 {
        let mut rng = Pcg32::seed_from_u64(seed);
        let span = in_channels * KERNEL * KERNEL;
        Conv3x3::from_weights(&ConvWeights {
            out_channels,
            in_channels,
            kernel: (KERNEL, KERNEL),
            weight: (0..out_channels * span)
                .map(|_| rng.gen_range(-1.0f32..1.0))
                .collect(),
            bias: vec![0.0; out_channels],
        })
        .unwrap()
    }

    #[test]
    fn vgg19_names_match_canonical_list() {
        let arch = Architecture::vgg19();
        let names: Vec<_> = arch.layer_names().collect();

        assert_eq!(names, VGG19_LAYERS.to_vec());
        assert_eq!(arch.position("conv4_2"), Some(21));
        assert_eq!(arch.position("maxpool5"), Some(36));
        assert_eq!(arch.position("conv6_1"), None);
    }

    #[test]
    fn vgg19_channel_progression() {
        let arch = Architecture::vgg19();
        let convs: Vec<_> = arch
            .stages()
            .iter()
            .filter_map(|stage| match stage.kind {
                StageKind::Conv {
                    in_channels,
                    out_channels,
                } => Some((in_channels, out_channels)),
                _ => None,
            })
            .collect();

        assert_eq!(convs.len(), 16);
        assert_eq!(convs[0], (3, 64));
        assert_eq!(convs[2], (64, 128));
        assert_eq!(convs[4], (128, 256));
        assert_eq!(convs[8], (256, 512));
        assert_eq!(convs[15], (512, 512));
    }

    #[test]
    fn output_shapes_follow_pooling() {
        let arch = Architecture::vgg19();
        let input = Dims::square(224);

        assert_eq!(arch.output_shape(0, input).unwrap(), (64, 224, 224));
        assert_eq!(arch.output_shape(4, input).unwrap(), (64, 112, 112));
        assert_eq!(
            arch.output_shape(arch.position("conv4_2").unwrap(), input)
                .unwrap(),
            (512, 28, 28)
        );
        assert_eq!(arch.output_shape(36, input).unwrap(), (512, 7, 7));

        // 15 -> 7 -> 3 -> 1, and the 4th pool has nothing left to pool
        let small = Dims::square(15);
        assert!(arch.output_shape(19, small).is_ok());
        match arch.output_shape(27, small) {
            Err(Error::InputTooSmall(its)) => assert_eq!(its.layer, "maxpool4"),
            _ => panic!("expected the input to be too small"),
        }
    }

    #[test]
    fn conv_bias_only_response() {
        let conv = Conv3x3 {
            in_channels: 1,
            out_channels: 2,
            weight: Array2::zeros((2, 9)),
            bias: Array1::from(vec![0.5, -2.0]),
        };

        let out = conv.forward(&Array4::ones((1, 1, 3, 3))).unwrap();
        assert_eq!(out.dim(), (1, 2, 3, 3));
        assert!(out.index_axis(Axis(1), 0).iter().all(|&v| v == 0.5));
        assert!(out.index_axis(Axis(1), 1).iter().all(|&v| v == -2.0));
    }

    #[test]
    fn conv_zero_pads_borders() {
        // a kernel that sums its neighborhood
        let conv = Conv3x3 {
            in_channels: 1,
            out_channels: 1,
            weight: Array2::ones((1, 9)),
            bias: Array1::zeros(1),
        };

        let out = conv.forward(&Array4::ones((1, 1, 3, 3))).unwrap();
        assert_eq!(out[[0, 0, 0, 0]], 4.0);
        assert_eq!(out[[0, 0, 0, 1]], 6.0);
        assert_eq!(out[[0, 0, 1, 1]], 9.0);
    }

    #[test]
    fn conv_backward_is_adjoint_of_forward() {
        let conv = random_conv(3, 4, 1);
        let x = random_tensor((2, 3, 5, 6), 2);
        let y = random_tensor((2, 4, 5, 6), 3);

        let lhs = dot(&conv.forward(&x).unwrap(), &y);
        let rhs = dot(&x, &conv.backward(&y).unwrap());

        assert!((lhs - rhs).abs() <= 1e-3 * lhs.abs().max(1.0), "{} vs {}", lhs, rhs);
    }

    #[test]
    fn conv_rejects_wrong_channel_count() {
        let conv = random_conv(3, 4, 1);
        assert!(conv.forward(&Array4::zeros((1, 2, 4, 4))).is_err());
        assert!(conv.backward(&Array4::zeros((1, 3, 4, 4))).is_err());
    }

    #[test]
    fn max_pool_routes_gradient_to_winners() {
        let input = random_tensor((2, 3, 5, 4), 7);
        let stage = Stage::MaxPool;

        let (output, entry) = stage.forward_taped(input.clone()).unwrap();
        assert_eq!(output.dim(), (2, 3, 2, 2));

        for b in 0..2 {
            for c in 0..3 {
                for y in 0..2 {
                    for x in 0..2 {
                        let window_max = (0..2)
                            .flat_map(|dy| (0..2).map(move |dx| (dy, dx)))
                            .map(|(dy, dx)| input[[b, c, 2 * y + dy, 2 * x + dx]])
                            .fold(f32::MIN, f32::max);
                        assert_eq!(output[[b, c, y, x]], window_max);
                    }
                }
            }
        }

        let grad = random_tensor(output.dim(), 8);
        let grad_input = stage.backward(grad.clone(), &entry).unwrap();
        assert_eq!(grad_input.dim(), input.dim());

        // with the winners fixed, pooling is linear and backward is its adjoint
        let lhs = dot(&output, &grad);
        let rhs = dot(&input, &grad_input);
        assert!((lhs - rhs).abs() < 1e-4);
    }

    #[test]
    fn relu_masks_gradient() {
        let input = random_tensor((1, 2, 3, 3), 11);
        let stage = Stage::Relu;

        let (output, entry) = stage.forward_taped(input.clone()).unwrap();
        assert!(output.iter().all(|&v| v >= 0.0));

        let grad = Array4::ones(input.dim());
        let grad_input = stage.backward(grad, &entry).unwrap();

        for (g, x) in grad_input.iter().zip(input.iter()) {
            assert_eq!(*g, if *x > 0.0 { 1.0 } else { 0.0 });
        }
    }

    #[test]
    fn mismatched_tape_is_an_error() {
        let input = random_tensor((1, 2, 4, 4), 5);
        let (_, pool_entry) = Stage::MaxPool.forward_taped(input.clone()).unwrap();

        assert!(matches!(
            Stage::Relu.backward(Array4::ones(input.dim()), &pool_entry),
            Err(Error::TapeMismatch)
        ));
        assert!(matches!(
            Stage::MaxPool.backward(Array4::ones((1, 2, 2, 2)), &TapeEntry::Conv),
            Err(Error::TapeMismatch)
        ));
    }
}
