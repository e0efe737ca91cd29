use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::core::config::RemuxSettings;
use crate::core::error::PipelineError;
use crate::core::media::AudioRemuxer;

#[derive(Debug, Clone, PartialEq)]
pub enum AudioOutcome {
    /// 原始音轨已合入
    Remuxed,
    /// 源视频没有音轨
    NoAudio,
    /// 合流失败，输出为无声视频
    RemuxFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeOutcome {
    pub output_path: PathBuf,
    pub audio: AudioOutcome,
}

impl FinalizeOutcome {
    pub fn remux_error(&self) -> Option<&str> {
        match &self.audio {
            AudioOutcome::RemuxFailed(message) => Some(message),
            _ => None,
        }
    }
}

/// `out.mp4` → `out_temp.mp4`，与最终输出同目录
pub fn temp_output_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let name = match output.extension() {
        Some(ext) => format!("{}_temp.{}", stem, ext.to_string_lossy()),
        None => format!("{}_temp", stem),
    };
    output.with_file_name(name)
}

/// 将临时文件移动到最终位置；跨文件系统时退化为复制再删除
pub fn publish(temp: &Path, output: &Path) -> Result<(), PipelineError> {
    if std::fs::rename(temp, output).is_ok() {
        return Ok(());
    }
    std::fs::copy(temp, output)?;
    if let Err(e) = std::fs::remove_file(temp) {
        warn!("⚠️ Could not remove temp file {:?}: {}", temp, e);
    }
    Ok(())
}

/// 收尾：探测音轨，合流或直接发布无声视频
pub struct Finalizer<'a> {
    remuxer: &'a dyn AudioRemuxer,
    settings: &'a RemuxSettings,
}

impl<'a> Finalizer<'a> {
    pub fn new(remuxer: &'a dyn AudioRemuxer, settings: &'a RemuxSettings) -> Self {
        Self { remuxer, settings }
    }

    /// 探测失败按无音轨处理
    pub fn has_audio_track(&self, original: &Path) -> bool {
        match self.remuxer.has_audio_stream(original) {
            Ok(has_audio) => has_audio,
            Err(e) => {
                warn!("⚠️ Audio probe failed for {:?}, treating as silent: {}", original, e);
                false
            }
        }
    }

    pub fn finalize(
        &self,
        original: &Path,
        temp: &Path,
        output: &Path,
    ) -> Result<FinalizeOutcome, PipelineError> {
        if !self.has_audio_track(original) {
            publish(temp, output)?;
            info!("✅ Published {:?} (no audio track)", output);
            return Ok(FinalizeOutcome {
                output_path: output.to_path_buf(),
                audio: AudioOutcome::NoAudio,
            });
        }

        match self.remuxer.remux(temp, original, output, self.settings) {
            Ok(()) => {
                if let Err(e) = std::fs::remove_file(temp) {
                    warn!("⚠️ Could not remove temp file {:?}: {}", temp, e);
                }
                info!("✅ Published {:?} with original audio", output);
                Ok(FinalizeOutcome {
                    output_path: output.to_path_buf(),
                    audio: AudioOutcome::Remuxed,
                })
            }
            Err(e) => {
                error!("❌ Audio remux failed, publishing silent video: {}", e);
                if output.exists() {
                    let _ = std::fs::remove_file(output);
                }
                publish(temp, output)?;
                Ok(FinalizeOutcome {
                    output_path: output.to_path_buf(),
                    audio: AudioOutcome::RemuxFailed(e.to_string()),
                })
            }
        }
    }
}
