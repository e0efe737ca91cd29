pub mod config;
pub mod error;
pub mod faces;
pub mod jobs;
pub mod media;
pub mod video;
