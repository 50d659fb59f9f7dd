mod conv;
mod discriminator;
mod generator;
mod loss;
mod vgg;

pub use conv::*;
pub use discriminator::*;
pub use generator::*;
pub use loss::*;
pub use vgg::*;
