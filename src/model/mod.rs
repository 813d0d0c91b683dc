pub mod traits;
pub mod vocab;

pub use traits::{ParamMeta, StepClient};
pub use vocab::vocab_size_with_padding;
