pub mod hls;

pub use hls::{HlsSegmenter, SegmenterConfig, SegmenterHandoff};
