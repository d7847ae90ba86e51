mod annotation;
mod endpoint;
mod span;

pub use annotation::Annotation;
pub use endpoint::Endpoint;
pub use span::{Kind, ListOfSpans, Span};
