use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use neural_style as ns;
use ns::ndarray::Array4;
use std::time::{Duration, Instant};

// Benches run on a narrow, randomly weighted VGG so they don't need the real
// weight archive, the layer layout and op counts per pixel stay the same
fn vgg(base_width: usize) -> ns::FeatureExtractor {
    let arch = ns::Architecture::vgg19_with_base_width(base_width);
    let weights = ns::NetworkWeights::seeded(&arch, 3);
    ns::FeatureExtractor::new(arch, &weights).unwrap()
}

fn stripes(dim: u32) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_fn(dim, dim, |x, y| {
        ns::image::Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x ^ y) % 256) as u8])
    }))
}

fn gram(c: &mut Criterion) {
    let mut group = c.benchmark_group("gram");

    for channels in [16usize, 64, 256].iter() {
        let features = Array4::from_shape_fn((1, *channels, 28, 28), |(_, c, y, x)| {
            ((c * 31 + y * 7 + x) % 17) as f32 / 17.0
        });

        group.bench_with_input(
            BenchmarkId::from_parameter(channels),
            &features,
            |b, features| {
                b.iter(|| {
                    black_box(ns::loss::gram_matrix(
                        features,
                        ns::GramNormalization::None,
                    ))
                })
            },
        );
    }
    group.finish();
}

fn extract(c: &mut Criterion) {
    static DIM: u32 = 32;

    let vgg = vgg(8);
    let layers = ["conv1_1", "conv2_1", "conv3_1", "conv4_1", "conv4_2"];

    let mut group = c.benchmark_group("extract");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        let pixels = ns::load_pixels(
            ns::ImageSource::Image(stripes(*dim)),
            ns::Dims::square(*dim),
        )
        .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(dim), &pixels, |b, pixels| {
            b.iter(|| black_box(vgg.extract(pixels, &layers).unwrap()))
        });
    }
    group.finish();
}

fn optimization_step(c: &mut Criterion) {
    static DIM: u32 = 32;

    let vgg = vgg(8);

    let mut group = c.benchmark_group("optimization_step");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, &dim| {
            b.iter_custom(|iters| {
                let mut session = ns::Session::builder()
                    .extractor(&vgg)
                    .content_image(stripes(dim))
                    .style_image(stripes(dim / 2))
                    .input_size(ns::Dims::square(dim))
                    .seed(120)
                    .build()
                    .unwrap();

                // Session setup extracts the reference features, which
                // isn't what's being measured here
                let start = Instant::now();
                for _i in 0..iters {
                    black_box(session.step().unwrap());
                }

                start.elapsed()
            });
        });
    }
    group.finish();
}

fn random_starts(c: &mut Criterion) {
    let vgg = vgg(4);

    let mut group = c.benchmark_group("random_starts");
    group.sample_size(10);

    for starts in [1u32, 2, 4].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(starts),
            starts,
            |b, &starts| {
                b.iter_custom(|iters| {
                    let mut total_elapsed = Duration::new(0, 0);
                    for _i in 0..iters {
                        let sess = ns::Session::builder()
                            .extractor(&vgg)
                            .content_image(stripes(32))
                            .style_image(stripes(24))
                            .input_size(ns::Dims::square(32))
                            .random_starts(starts)
                            .epochs(5)
                            .build()
                            .unwrap();

                        let start = Instant::now();
                        black_box(sess.run(None).unwrap());
                        total_elapsed += start.elapsed();
                    }

                    total_elapsed
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, gram, extract, optimization_step, random_starts);
criterion_main!(benches);
