use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let vgg = ns::FeatureExtractor::vgg19("vgg19.bin")?;

    let session = ns::Session::builder()
        .extractor(&vgg)
        .content_image(&"imgs/tom.jpg")
        .style_image(&"imgs/waves.jpg")
        // match structure at a shallower layer, which keeps more of the
        // content image's fine detail
        .content_layers(vec!["conv3_2"])
        // favor the coarse style layers
        .style_layers(vec!["conv1_1", "conv3_1", "conv5_1"])
        .style_weights(vec![0.2, 0.3, 0.5])
        // divide the Gram matrices by the layer size so every layer's style
        // loss has a similar magnitude
        .gram_normalization(ns::GramNormalization::ElementCount)
        .beta(1e9)
        .epochs(500)
        .build()?;

    let generated = session.run(None)?;

    generated.save("out/02")?;
    Ok(())
}
