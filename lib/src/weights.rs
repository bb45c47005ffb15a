//! Convolution kernels for a feature network, and the binary archive they are
//! stored in.
//!
//! The archive is little-endian:
//!
//! ```text
//! u32 magic       0x5647_0001, the low 16 bits are the version
//! u32 conv_count
//! conv_count × [u32; 4] (out_channels, in_channels, kernel_h, kernel_w)
//! conv_count × { f32 weight[out · in · kh · kw], f32 bias[out] }
//! ```
//!
//! Kernels are stored in PyTorch's `(out, in, kh, kw)` order, and appear in
//! the same order as the convolutions of the network. `tools/export_vgg19.py`
//! writes torchvision's pretrained VGG19 in this format.

use crate::{
    network::{Architecture, StageKind, KERNEL},
    Error,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::{
    io::{self, Read, Write},
    path::Path,
};

const WEIGHTS_MAGIC: u32 = 0x5647_0001;

/// Upper bound on the number of convolutions in an archive, anything larger
/// is treated as corrupt
const MAX_CONVS: u32 = 1024;

/// Upper bounds on the header fields of a single convolution
const MAX_CHANNELS: u32 = 1 << 16;
const MAX_KERNEL_SIDE: u32 = 16;

/// The kernel and bias of one convolution
#[derive(Clone, Debug, PartialEq)]
pub struct ConvWeights {
    pub out_channels: usize,
    pub in_channels: usize,
    pub kernel: (usize, usize),
    /// `out_channels * in_channels * kernel.0 * kernel.1` values
    pub weight: Vec<f32>,
    /// `out_channels` values
    pub bias: Vec<f32>,
}

/// The kernels of every convolution of a network, in forward order
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkWeights {
    convs: Vec<ConvWeights>,
}

impl NetworkWeights {
    pub fn new(convs: Vec<ConvWeights>) -> Self {
        Self { convs }
    }

    pub fn convs(&self) -> &[ConvWeights] {
        &self.convs
    }

    /// Uniform He-initialized kernels with zero biases, for every
    /// convolution of `architecture`, drawn from a seeded generator.
    pub fn seeded(architecture: &Architecture, seed: u64) -> Self {
        let mut rng = Pcg32::seed_from_u64(seed);

        let convs = architecture
            .stages()
            .iter()
            .filter_map(|stage| match stage.kind {
                StageKind::Conv {
                    in_channels,
                    out_channels,
                } => Some((in_channels, out_channels)),
                _ => None,
            })
            .map(|(in_channels, out_channels)| {
                let fan_in = in_channels * KERNEL * KERNEL;
                let bound = (6.0 / fan_in as f32).sqrt();

                ConvWeights {
                    out_channels,
                    in_channels,
                    kernel: (KERNEL, KERNEL),
                    weight: (0..out_channels * fan_in)
                        .map(|_| rng.gen_range(-bound..bound))
                        .collect(),
                    bias: vec![0.0; out_channels],
                }
            })
            .collect();

        Self { convs }
    }

    /// Reads an archive from disk
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut file = io::BufReader::new(std::fs::File::open(path)?);
        Ok(Self::read(&mut file)?)
    }

    /// Writes an archive to disk
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = io::BufWriter::new(std::fs::File::create(path)?);
        self.write(&mut file)?;
        file.flush()?;
        Ok(())
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<usize> {
        let mut written = 0;

        for conv in &self.convs {
            let kernel_len = conv.out_channels * conv.in_channels * conv.kernel.0 * conv.kernel.1;
            if conv.weight.len() != kernel_len || conv.bias.len() != conv.out_channels {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "kernel length doesn't match its dimensions",
                ));
            }
        }

        written += write_u32s(w, &[WEIGHTS_MAGIC, self.convs.len() as u32])?;

        for conv in &self.convs {
            written += write_u32s(
                w,
                &[
                    conv.out_channels as u32,
                    conv.in_channels as u32,
                    conv.kernel.0 as u32,
                    conv.kernel.1 as u32,
                ],
            )?;
        }

        for conv in &self.convs {
            written += write_f32s(w, &conv.weight)?;
            written += write_f32s(w, &conv.bias)?;
        }

        Ok(written)
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let magic = read_u32(r)?;

        if magic >> 16 != WEIGHTS_MAGIC >> 16 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid magic"));
        }

        if magic & 0x0000_ffff != 0x1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid version",
            ));
        }

        let count = read_u32(r)?;
        if count > MAX_CONVS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "implausible convolution count",
            ));
        }

        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut header = [0u32; 4];
            for field in header.iter_mut() {
                *field = read_u32(r)?;
            }
            headers.push(header);
        }

        let mut convs = Vec::with_capacity(headers.len());
        for [out_channels, in_channels, kh, kw] in headers {
            if out_channels > MAX_CHANNELS
                || in_channels > MAX_CHANNELS
                || kh > MAX_KERNEL_SIDE
                || kw > MAX_KERNEL_SIDE
            {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "implausible convolution dimensions",
                ));
            }

            let kernel_len = [in_channels, kh, kw]
                .iter()
                .try_fold(out_channels as usize, |acc, &d| acc.checked_mul(d as usize))
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "kernel size overflows")
                })?;

            let weight = read_f32s(r, kernel_len)?;
            let bias = read_f32s(r, out_channels as usize)?;

            convs.push(ConvWeights {
                out_channels: out_channels as usize,
                in_channels: in_channels as usize,
                kernel: (kh as usize, kw as usize),
                weight,
                bias,
            });
        }

        Ok(Self { convs })
    }

    /// Checks that these weights describe every convolution of `architecture`
    pub(crate) fn check(&self, architecture: &Architecture) -> Result<(), Error> {
        let expected: Vec<_> = architecture
            .stages()
            .iter()
            .filter_map(|stage| match stage.kind {
                StageKind::Conv {
                    in_channels,
                    out_channels,
                } => Some((stage.name.as_str(), in_channels, out_channels)),
                _ => None,
            })
            .collect();

        if expected.len() != self.convs.len() {
            return Err(Error::WeightsMismatch(format!(
                "the network has {} convolutions, but {} were provided",
                expected.len(),
                self.convs.len()
            )));
        }

        for ((name, in_channels, out_channels), conv) in expected.into_iter().zip(&self.convs) {
            if conv.in_channels != in_channels
                || conv.out_channels != out_channels
                || conv.kernel != (KERNEL, KERNEL)
            {
                return Err(Error::WeightsMismatch(format!(
                    "'{}' expects a {}x{}x{}x{} kernel, but got {}x{}x{}x{}",
                    name,
                    out_channels,
                    in_channels,
                    KERNEL,
                    KERNEL,
                    conv.out_channels,
                    conv.in_channels,
                    conv.kernel.0,
                    conv.kernel.1
                )));
            }
        }

        Ok(())
    }
}

fn write_u32s<W: Write>(w: &mut W, values: &[u32]) -> io::Result<usize> {
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(values.len() * 4)
}

fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> io::Result<usize> {
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(values.len() * 4)
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32s<R: Read>(r: &mut R, len: usize) -> io::Result<Vec<f32>> {
    // the length comes from the archive, so the buffer grows as values arrive
    let mut values = Vec::with_capacity(len.min(1 << 16));
    let mut buf = [0u8; 4];
    for _ in 0..len {
        r.read_exact(&mut buf)?;
        values.push(f32::from_le_bytes(buf));
    }
    Ok(values)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn weights_serde() {
        let input = NetworkWeights::new(vec![
            ConvWeights {
                out_channels: 2,
                in_channels: 1,
                kernel: (3, 3),
                weight: (0..18).map(|i| i as f32 * 0.25 - 2.0).collect(),
                bias: vec![1.5, -0.5],
            },
            ConvWeights {
                out_channels: 1,
                in_channels: 2,
                kernel: (1, 1),
                weight: vec![f32::MAX, f32::MIN_POSITIVE],
                bias: vec![0.0],
            },
        ]);

        let mut buffer = Vec::new();
        let written = input.write(&mut buffer).unwrap();
        assert_eq!(written, buffer.len());
        assert_eq!(written, 4 * (2 + 2 * 4 + 18 + 2 + 2 + 1));

        let mut cursor = std::io::Cursor::new(&buffer);
        let deserialized = NetworkWeights::read(&mut cursor).unwrap();

        assert_eq!(deserialized, input);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let weights = NetworkWeights::seeded(&Architecture::vgg19_with_base_width(1), 3);
        let mut buffer = Vec::new();
        weights.write(&mut buffer).unwrap();

        let mut bad_magic = buffer.clone();
        bad_magic[3] ^= 0xff;
        let err = NetworkWeights::read(&mut std::io::Cursor::new(&bad_magic)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let truncated = &buffer[..buffer.len() - 3];
        let err = NetworkWeights::read(&mut std::io::Cursor::new(truncated)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn rejects_implausible_headers() {
        let header = |dims: [u32; 4]| {
            let mut buffer = Vec::new();
            write_u32s(&mut buffer, &[WEIGHTS_MAGIC, 1]).unwrap();
            write_u32s(&mut buffer, &dims).unwrap();
            buffer
        };

        for dims in &[
            [0xffff_ffff, 0xffff_ffff, 0xffff_ffff, 0xffff_ffff],
            [0xffff, 0xffff, 0xffff, 0xffff],
            [64, 64, 17, 3],
            [(1 << 16) + 1, 3, 3, 3],
        ] {
            let err = NetworkWeights::read(&mut std::io::Cursor::new(header(*dims))).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData, "{:?}", dims);
        }

        // the largest header that is accepted still fails cleanly when the
        // data isn't there
        let err = NetworkWeights::read(&mut std::io::Cursor::new(header([
            1 << 16,
            1 << 16,
            16,
            16,
        ])))
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn seeded_weights_fit_their_architecture() {
        let arch = Architecture::vgg19_with_base_width(2);
        let weights = NetworkWeights::seeded(&arch, 42);

        assert_eq!(weights.convs().len(), 16);
        assert!(weights.check(&arch).is_ok());
        assert_eq!(weights, NetworkWeights::seeded(&arch, 42));
        assert_ne!(weights, NetworkWeights::seeded(&arch, 43));

        match weights.check(&Architecture::vgg19_with_base_width(4)) {
            Err(Error::WeightsMismatch(reason)) => assert!(reason.contains("conv1_1")),
            _ => panic!("expected a mismatch"),
        }
    }
}
