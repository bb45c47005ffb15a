use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let vgg = ns::FeatureExtractor::vgg19("vgg19.bin")?;

    let session = ns::Session::builder()
        .extractor(&vgg)
        .content_image(&"imgs/tom.jpg")
        .style_image(&"imgs/waves.jpg")
        // optimize 4 images from different noise at once, they share the
        // reference features but otherwise don't affect each other
        .random_starts(4)
        .seed(211)
        .epochs(500)
        .build()?;

    // print the loss every 50 steps
    let progress = |update: ns::ProgressUpdate<'_>| {
        if update.epoch.current % 50 == 0 {
            println!(
                "{}/{} content {:.3e} style {:.3e}",
                update.epoch.current, update.epoch.total, update.loss.content, update.loss.style
            );
        }
    };

    let generated = session.run(Some(Box::new(progress)))?;

    // writes out/03/0.png through out/03/3.png
    generated.save("out/03")?;
    generated.save_loss_history("out/03/loss.json")
}
