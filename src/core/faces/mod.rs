//! 人脸检测与比对的能力接口
//!
//! 具体算法由外部库提供，管线只依赖 detect / encode / matches 三个契约。

pub mod detector;
pub mod matcher;

pub use detector::{MockRegionDetector, ProfiledDetector, RegionDetector};
pub use matcher::{
    EuclideanMatcher, Fingerprint, MeanColorEncoder, ReferenceSet, RegionEncoder, RegionMatcher,
};
