use neural_style as ns;
use ns::ndarray::Array4;

fn tiny_vgg() -> ns::FeatureExtractor {
    let arch = ns::Architecture::vgg19_with_base_width(2);
    let weights = ns::NetworkWeights::seeded(&arch, 1234);
    ns::FeatureExtractor::new(arch, &weights).expect("seeded weights fit")
}

fn gradient(width: u32, height: u32, flip: bool) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_fn(width, height, |x, y| {
        let (x, y) = if flip { (y, x) } else { (x, y) };
        ns::image::Rgb([(x * 13 % 256) as u8, (y * 29 % 256) as u8, ((x + y) * 7 % 256) as u8])
    }))
}

fn builder(vgg: &ns::FeatureExtractor) -> ns::SessionBuilder<'_> {
    ns::Session::builder()
        .extractor(vgg)
        .content_image(gradient(24, 20, false))
        .style_image(gradient(40, 40, true))
        .input_size(ns::Dims::square(16))
}

fn in_range(pixels: &Array4<f32>) -> bool {
    pixels
        .iter()
        .all(|&v| v >= ns::PIXEL_MIN && v <= ns::PIXEL_MAX)
}

#[test]
fn pixels_are_clamped_after_every_step() {
    let vgg = tiny_vgg();
    // a huge step size pushes most pixels out of range before clamping
    let mut session = builder(&vgg)
        .learning_rate(400.0)
        .random_starts(2)
        .build()
        .unwrap();

    for step in 1..=5 {
        let loss = session.step().unwrap();
        assert!(loss.total.is_finite());
        assert!(in_range(session.pixels()), "out of range after step {}", step);
        assert_eq!(session.loss_history().len(), step);
    }

    assert!(session
        .pixels()
        .iter()
        .any(|&v| v == ns::PIXEL_MIN || v == ns::PIXEL_MAX));
}

#[test]
fn run_records_one_loss_per_epoch() {
    let vgg = tiny_vgg();
    let generated = builder(&vgg)
        .epochs(7)
        .random_starts(3)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    assert_eq!(generated.loss_history().len(), 7);
    assert_eq!(generated.restarts(), 3);
    assert_eq!(generated.pixels().dim(), (3, 3, 16, 16));
    assert!(in_range(generated.pixels()));

    let images = generated.to_images();
    assert_eq!(images.len(), 3);
    assert!(images.iter().all(|img| img.dimensions() == (16, 16)));
}

#[test]
fn optimization_reduces_loss() {
    let vgg = tiny_vgg();
    let generated = builder(&vgg)
        .epochs(60)
        .learning_rate(2.0)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    let history = generated.loss_history();
    let first = history[0];
    let last = history[history.len() - 1];
    assert!(last < first, "loss went from {} to {}", first, last);
}

#[test]
fn zero_coefficients_leave_pixels_untouched() {
    let vgg = tiny_vgg();
    let mut session = builder(&vgg).alpha(0.0).beta(0.0).build().unwrap();
    let initial = session.pixels().clone();

    for _ in 0..3 {
        let loss = session.step().unwrap();
        assert_eq!(loss.total, 0.0);
        assert!(loss.content > 0.0 || loss.style > 0.0);
    }

    assert_eq!(session.pixels(), &initial);
}

#[test]
fn negative_coefficients_are_used_as_is() {
    let vgg = tiny_vgg();
    let mut session = builder(&vgg).alpha(-1.0).beta(0.5).build().unwrap();

    let loss = session.step().unwrap();
    assert_eq!(loss.total, -loss.content + 0.5 * loss.style);
}

#[test]
fn content_only_objective_matches_content_image() {
    // the content term alone is minimized by reproducing the content
    // activations, so the loss falls steadily
    let vgg = tiny_vgg();
    let generated = builder(&vgg)
        .beta(0.0)
        .content_layers(vec!["relu1_2"])
        .epochs(40)
        .learning_rate(4.0)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    let history = generated.loss_history();
    assert!(history[history.len() - 1] < 0.8 * history[0]);
}

#[test]
fn saves_images_curve_and_history() {
    let out = std::env::temp_dir().join(format!("neural-style-session-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&out);

    let vgg = tiny_vgg();
    let generated = builder(&vgg)
        .epochs(3)
        .random_starts(2)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    let written = generated.save(&out).unwrap();
    assert_eq!(written, vec![out.join("0.png"), out.join("1.png")]);

    let reloaded = ns::load_pixels(ns::ImageSource::Path(&written[1]), ns::Dims::square(16))
        .unwrap();
    assert_eq!(reloaded.dim(), (1, 3, 16, 16));

    generated.save_loss_curve(out.join("loss.png")).unwrap();
    assert!(out.join("loss.png").is_file());

    generated.save_loss_history(out.join("loss.json")).unwrap();
    let history: Vec<f64> =
        serde_json::from_reader(std::fs::File::open(out.join("loss.json")).unwrap()).unwrap();
    assert_eq!(history, generated.loss_history());
}
