pub mod censor;

pub use censor::{CensorJob, CensorRequest, VideoCensor};
