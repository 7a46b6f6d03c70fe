pub mod collector;
pub mod preprocess;
pub mod schema;
pub mod sse;
pub mod streaming;
