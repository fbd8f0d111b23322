pub mod fetcher;
pub mod image_analyzer;
pub mod image_ref;

pub use fetcher::{HttpImageFetcher, ImageFetcher};
pub use image_analyzer::{ImageAnalyzer, DEFAULT_MAX_CONCURRENCY};
pub use image_ref::{ImageRefResolver, DEFAULT_ORIGIN};
