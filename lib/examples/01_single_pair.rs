use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    // load the network, see tools/export_vgg19.py for how to produce the archive
    let vgg = ns::FeatureExtractor::vgg19("vgg19.bin")?;

    //create a new session
    let session = ns::Session::builder()
        .extractor(&vgg)
        // the image whose structure we keep
        .content_image(&"imgs/tom.jpg")
        // the image whose textures and colors we adopt
        .style_image(&"imgs/waves.jpg")
        .epochs(500)
        .build()?;

    //optimize the image
    let generated = session.run(None)?;

    //save the image and its loss curve to the disk
    generated.save("out/01")?;
    generated.save_loss_curve("out/01/loss.png")
}
