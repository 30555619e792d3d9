pub mod ml_model;
pub mod preprocess;
pub mod postprocess;
pub mod inference;

pub use ml_model::{HeadLayout, ResNet, ResNetConfig};
pub use preprocess::{PreprocessSpec, IMAGENET_MEAN, IMAGENET_STD};
pub use postprocess::{argmax, classify, softmax, Classification};
pub use inference::InferencePipeline;
