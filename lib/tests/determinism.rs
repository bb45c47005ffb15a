use img_hash::{HasherConfig, ImageHash};
use neural_style as ns;

fn tiny_vgg() -> ns::FeatureExtractor {
    let arch = ns::Architecture::vgg19_with_base_width(2);
    let weights = ns::NetworkWeights::seeded(&arch, 77);
    ns::FeatureExtractor::new(arch, &weights).expect("seeded weights fit")
}

fn checker(size: u32, cell: u32) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_fn(size, size, |x, y| {
        if (x / cell + y / cell) % 2 == 0 {
            ns::image::Rgb([230, 200, 40])
        } else {
            ns::image::Rgb([20, 60, 160])
        }
    }))
}

fn generate(vgg: &ns::FeatureExtractor, seed: u64) -> ns::GeneratedImage {
    ns::Session::builder()
        .extractor(vgg)
        .content_image(checker(32, 8))
        .style_image(checker(32, 3))
        .input_size(ns::Dims::square(32))
        .epochs(5)
        .learning_rate(3.0)
        .seed(seed)
        .build()
        .unwrap()
        .run(None)
        .unwrap()
}

fn hash(generated: &ns::GeneratedImage) -> ImageHash {
    let hasher = HasherConfig::new().to_hasher();
    hasher.hash_image(&generated.to_images()[0])
}

// Runs are single threaded and seeded, so the same inputs must always give
// the exact same image
#[test]
fn same_seed_same_image() {
    let vgg = tiny_vgg();

    let first = generate(&vgg, 120);
    let second = generate(&vgg, 120);

    assert_eq!(first.pixels(), second.pixels());
    assert_eq!(first.loss_history(), second.loss_history());
    assert_eq!(hash(&first).dist(&hash(&second)), 0);
}

#[test]
fn different_seeds_different_images() {
    let vgg = tiny_vgg();

    let first = generate(&vgg, 1);
    let second = generate(&vgg, 2);

    assert_ne!(first.pixels(), second.pixels());
    assert_ne!(first.loss_history(), second.loss_history());
}

#[test]
fn restarts_start_from_different_noise() {
    let vgg = tiny_vgg();

    let session = ns::Session::builder()
        .extractor(&vgg)
        .content_image(checker(32, 8))
        .style_image(checker(32, 3))
        .input_size(ns::Dims::square(32))
        .random_starts(2)
        .build()
        .unwrap();

    let pixels = session.pixels();
    let first = pixels.index_axis(ns::ndarray::Axis(0), 0);
    let second = pixels.index_axis(ns::ndarray::Axis(0), 1);
    assert_ne!(first, second);
}
