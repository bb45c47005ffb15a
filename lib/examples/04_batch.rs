use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let vgg = ns::FeatureExtractor::vgg19("vgg19.bin")?;

    // every image in imgs/content is paired with every image in imgs/style
    let batch = ns::Batch::builder()
        .session(ns::Session::builder().extractor(&vgg).epochs(500))
        .content_dir("imgs/content")
        .style_dir("imgs/style")
        .run_dir("out/04")
        .max_workers(2)
        .build()?;

    let manifest = batch.run(None)?;

    for failure in &manifest.failed {
        eprintln!(
            "{} x {} failed: {}",
            failure.content.display(),
            failure.style.display(),
            failure.error
        );
    }

    Ok(())
}
