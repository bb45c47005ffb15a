use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct InputTooSmall {
    pub(crate) layer: String,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl fmt::Display for InputTooSmall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "an input of {}x{} is too small to reach layer '{}'",
            self.width, self.height, self.layer
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// Failed to serialize the configuration, loss history or manifest
    Json(serde_json::Error),
    /// A tensor could not be viewed in the requested shape
    Shape(ndarray::ShapeError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// A requested layer name is not part of the network
    UnknownLayer(String),
    /// A required input was not provided to a builder
    MissingInput(&'static str),
    /// The number of explicit layer weights didn't match the number of layers
    WeightCountMismatch {
        term: &'static str,
        layers: usize,
        weights: usize,
    },
    /// A weight archive doesn't describe the network it is loaded into
    WeightsMismatch(String),
    /// The input size shrinks to nothing before reaching a requested layer
    InputTooSmall(InputTooSmall),
    /// Two tensors that are compared have incompatible batch or feature shapes
    ShapeMismatch(Vec<usize>, Vec<usize>),
    /// A backward pass was given a tape recorded by different stages
    TapeMismatch,
    /// Two inputs of a batch would write to the same output directory
    DuplicateOutputName(String),
    /// The loss curve could not be drawn
    Plot(String),
    /// A batch worker thread panicked
    WorkerPanicked,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::Shape(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Io(io) => write!(f, "{}", io),
            Self::Json(js) => write!(f, "{}", js),
            Self::Shape(se) => write!(f, "{}", se),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::UnknownLayer(name) => write!(f, "the network has no layer named '{}'", name),
            Self::MissingInput(what) => write!(f, "no {} was provided", what),
            Self::WeightCountMismatch {
                term,
                layers,
                weights,
            } => write!(
                f,
                "{} {} layer(s) were selected, but {} weight(s) were provided",
                layers, term, weights
            ),
            Self::WeightsMismatch(reason) => {
                write!(f, "the weight archive doesn't match the network: {}", reason)
            }
            Self::InputTooSmall(its) => write!(f, "{}", its),
            Self::ShapeMismatch(left, right) => write!(
                f,
                "tensor of shape {:?} can't be compared with tensor of shape {:?}",
                left, right
            ),
            Self::TapeMismatch => write!(
                f,
                "the recorded forward pass doesn't belong to this network"
            ),
            Self::DuplicateOutputName(name) => write!(
                f,
                "more than one input would be written to the output directory '{}'",
                name
            ),
            Self::Plot(reason) => write!(f, "failed to draw loss curve: {}", reason),
            Self::WorkerPanicked => write!(f, "a batch worker thread panicked"),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<serde_json::Error> for Error {
    fn from(js: serde_json::Error) -> Self {
        Self::Json(js)
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(se: ndarray::ShapeError) -> Self {
        Self::Shape(se)
    }
}
