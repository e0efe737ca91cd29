//! ffmpeg / ffprobe 子进程后端
//!
//! - 源视频：ffprobe 读取头信息，ffmpeg 解码为 RGB24 管道
//! - 写出器：RGB24 管道送入 ffmpeg 编码
//! - 音频：ffprobe 检测音轨，ffmpeg 合流

use std::collections::HashSet;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use log::{debug, info, warn};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::Deserialize;

use crate::core::config::{MediaConfig, RemuxSettings, SinkCodec};
use crate::core::error::{MediaError, PipelineError, RemuxError};
use crate::core::media::{AudioRemuxer, FrameSink, FrameSource, VideoInfo, VideoIo};
use crate::core::video::frame::Frame;

static REGEX_VIDEO_ENCODER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*V\S{5}\s+(\S+)").unwrap());

pub struct FfmpegMedia {
    ffmpeg_path: String,
    ffprobe_path: String,
    encoders: OnceCell<HashSet<String>>,
}

impl FfmpegMedia {
    pub fn new() -> Self {
        Self::from_config(&MediaConfig::default())
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            encoders: OnceCell::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn probe_video(&self, path: &Path) -> Result<VideoInfo, MediaError> {
        let stdout = self.run_ffprobe(
            &[
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=codec_type,codec_name,codec_tag_string,width,height,r_frame_rate,avg_frame_rate,nb_frames,duration",
            ],
            path,
        )?;
        parse_video_info(&stdout)
    }

    fn run_ffprobe(&self, args: &[&str], path: &Path) -> Result<Vec<u8>, MediaError> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error"])
            .args(args)
            .args(["-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(MediaError::Failed {
                tool: "ffprobe",
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// 用一帧黑图试编码到同目录的临时文件，确认编码器真正能打开
    fn trial_encode(
        &self,
        path: &Path,
        codec: &SinkCodec,
        info: &VideoInfo,
    ) -> Result<(), MediaError> {
        let scratch = trial_path(path);
        let mut child = Command::new(&self.ffmpeg_path)
            .args(build_sink_args(&scratch, codec, info))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child.stderr.take().map(drain_stderr);
        if let Some(mut stdin) = child.stdin.take() {
            let blank = vec![0u8; info.width as usize * info.height as usize * 3];
            // 编码器提前退出时写入会失败，以退出码为准
            let _ = stdin.write_all(&blank);
        }
        let status = child.wait()?;
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

        if scratch.exists() {
            if let Err(e) = std::fs::remove_file(&scratch) {
                warn!("⚠️ Could not remove trial output {:?}: {}", scratch, e);
            }
        }

        if !status.success() {
            debug!("{} trial encode failed: {}", codec.encoder, stderr.trim());
            return Err(MediaError::Failed {
                tool: "ffmpeg",
                status: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn video_encoders(&self) -> Result<&HashSet<String>, MediaError> {
        self.encoders.get_or_try_init(|| {
            let output = Command::new(&self.ffmpeg_path)
                .args(["-hide_banner", "-encoders"])
                .stdin(Stdio::null())
                .output()?;
            if !output.status.success() {
                return Err(MediaError::Failed {
                    tool: "ffmpeg",
                    status: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            let encoders = parse_video_encoders(&String::from_utf8_lossy(&output.stdout));
            debug!("ffmpeg reports {} video encoders", encoders.len());
            Ok(encoders)
        })
    }
}

impl Default for FfmpegMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoIo for FfmpegMedia {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
        let info = self.probe_video(path)?;
        info!(
            "🎬 Source {:?}: {}x{} @ {:.2}fps, {} frames, codec '{}'",
            path, info.width, info.height, info.fps, info.frame_count, info.codec_tag
        );

        let mut child = Command::new(&self.ffmpeg_path)
            .args(build_decode_args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            release_child(&mut child, "decoder");
            return Err(MediaError::Spawn(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "decoder stdout unavailable",
            )));
        };

        let frame_bytes = info.width as usize * info.height as usize * 3;
        Ok(Box::new(FfmpegSource {
            reader: BufReader::with_capacity(frame_bytes.max(8192), stdout),
            child,
            frame_bytes,
            next_frame: 0,
            info,
        }))
    }

    fn create_sink(
        &self,
        path: &Path,
        codec: &SinkCodec,
        info: &VideoInfo,
    ) -> Result<Box<dyn FrameSink>, MediaError> {
        if !self.video_encoders()?.contains(&codec.encoder) {
            return Err(MediaError::EncoderUnavailable(codec.encoder.clone()));
        }
        // 编码器或封装器初始化失败（如尺寸不合要求）要在这里暴露，才能回退到下一个编码器
        self.trial_encode(path, codec, info)?;

        let mut child = Command::new(&self.ffmpeg_path)
            .args(build_sink_args(path, codec, info))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child.stderr.take().map(drain_stderr);
        let Some(stdin) = child.stdin.take() else {
            release_child(&mut child, "encoder");
            return Err(MediaError::Spawn(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "encoder stdin unavailable",
            )));
        };

        Ok(Box::new(FfmpegSink {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stderr,
            width: info.width,
            height: info.height,
            encoder: codec.encoder.clone(),
        }))
    }
}

impl AudioRemuxer for FfmpegMedia {
    fn has_audio_stream(&self, path: &Path) -> Result<bool, MediaError> {
        let stdout = self.run_ffprobe(&["-show_entries", "stream=codec_type"], path)?;
        streams_have_audio(&stdout)
    }

    fn remux(
        &self,
        video_only: &Path,
        original: &Path,
        output: &Path,
        settings: &RemuxSettings,
    ) -> Result<(), RemuxError> {
        info!("🔊 Remuxing audio from {:?} into {:?}", original, output);
        let result = Command::new(&self.ffmpeg_path)
            .args(build_remux_args(video_only, original, output, settings))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .output()?;

        if !result.status.success() {
            if output.exists() {
                if let Err(e) = std::fs::remove_file(output) {
                    warn!("⚠️ Could not remove partial remux output {:?}: {}", output, e);
                }
            }
            return Err(MediaError::Failed {
                tool: "ffmpeg",
                status: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

pub struct FfmpegSource {
    info: VideoInfo,
    child: Child,
    reader: BufReader<ChildStdout>,
    frame_bytes: usize,
    next_frame: u64,
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, PipelineError> {
        let mut data = vec![0u8; self.frame_bytes];
        let filled = read_full(&mut self.reader, &mut data)?;
        if filled < self.frame_bytes {
            if filled > 0 {
                warn!(
                    "⚠️ Truncated frame {} ({} of {} bytes), stopping",
                    self.next_frame, filled, self.frame_bytes
                );
            }
            return Ok(None);
        }

        let frame = Frame::from_raw(self.info.width, self.info.height, data, self.next_frame)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "decoded frame has wrong size")
            })?;
        self.next_frame += 1;
        Ok(Some(frame))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        release_child(&mut self.child, "decoder");
    }
}

pub struct FfmpegSink {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    encoder: String,
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(PipelineError::SinkWrite(format!(
                "frame {} is {}x{}, writer expects {}x{}",
                frame.frame_number,
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::SinkWrite("writer already closed".to_string()))?;
        stdin.write_all(frame.as_raw()).map_err(|e| {
            PipelineError::SinkWrite(format!("{} encoder rejected frame: {}", self.encoder, e))
        })
    }

    fn finish(mut self: Box<Self>) -> Result<(), PipelineError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .flush()
                .map_err(|e| PipelineError::SinkWrite(e.to_string()))?;
        }
        let status = self.child.wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if status.success() {
            debug!("{} encoder finished", self.encoder);
            Ok(())
        } else {
            Err(PipelineError::SinkWrite(format!(
                "{} encoder exited with {}: {}",
                self.encoder,
                status,
                stderr.trim()
            )))
        }
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        self.stdin.take();
        release_child(&mut self.child, "encoder");
    }
}

fn release_child(child: &mut Child, role: &str) {
    if let Ok(None) = child.try_wait() {
        let _ = child.kill();
    }
    let _ = child.wait();
    debug!("🗑️ ffmpeg {} released", role);
}

fn drain_stderr<R: Read + Send + 'static>(stderr: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut text = String::new();
        let _ = BufReader::new(stderr).read_to_string(&mut text);
        text
    })
}

/// out_temp.mp4 → out_temp_trial.mp4，保留扩展名以使用同一封装器
pub fn trial_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_trial.{}", stem, ext.to_string_lossy()),
        None => format!("{}_trial", stem),
    };
    path.with_file_name(name)
}

/// 读满 buf 或遇到 EOF，返回实际读取字节数
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub fn build_decode_args(input: &Path) -> Vec<String> {
    [
        "-hide_banner",
        "-v",
        "error",
        "-nostdin",
        "-noautorotate",
        "-i",
        &*input.to_string_lossy(),
        "-map",
        "0:v:0",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn build_sink_args(output: &Path, codec: &SinkCodec, info: &VideoInfo) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-v",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
        "-s",
        &*format!("{}x{}", info.width, info.height),
        "-r",
        &*format!("{}", info.fps),
        "-i",
        "pipe:0",
        "-an",
        "-c:v",
        codec.encoder.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let extra: &[&str] = match codec.encoder.as_str() {
        "mpeg4" => &["-q:v", "3", "-pix_fmt", "yuv420p"],
        "mjpeg" => &["-q:v", "3", "-pix_fmt", "yuvj420p"],
        "rawvideo" => &[],
        _ => &["-pix_fmt", "yuv420p"],
    };
    args.extend(extra.iter().map(|s| s.to_string()));
    args.push(output.to_string_lossy().to_string());
    args
}

pub fn build_remux_args(
    video_only: &Path,
    original: &Path,
    output: &Path,
    settings: &RemuxSettings,
) -> Vec<String> {
    [
        "-hide_banner",
        "-v",
        "error",
        "-y",
        "-i",
        &*video_only.to_string_lossy(),
        "-i",
        &*original.to_string_lossy(),
        "-map",
        "0:v:0",
        "-map",
        "1:a:0",
        "-c:v",
        settings.video_codec.as_str(),
        "-crf",
        &*settings.crf.to_string(),
        "-preset",
        settings.preset.as_str(),
        "-c:a",
        settings.audio_codec.as_str(),
        &*output.to_string_lossy(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Default, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    codec_tag_string: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

/// "30000/1001" → 29.97；"0/0" 之类无效值返回 None
pub fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

pub fn parse_video_info(json: &[u8]) -> Result<VideoInfo, MediaError> {
    let probe: ProbeOutput = serde_json::from_slice(json)?;
    let stream = probe
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref().map_or(true, |t| t == "video"))
        .ok_or_else(|| MediaError::Probe("no video stream".to_string()))?;

    let width = stream
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| MediaError::Probe("missing width".to_string()))?;
    let height = stream
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| MediaError::Probe("missing height".to_string()))?;
    let fps = stream
        .r_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_rate))
        .ok_or_else(|| MediaError::Probe("unknown frame rate".to_string()))?;

    // 部分容器不写 nb_frames，用时长估算
    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.trim().parse::<u64>().ok())
        .or_else(|| {
            stream
                .duration
                .as_deref()
                .and_then(|d| d.trim().parse::<f64>().ok())
                .map(|d| (d * fps).round().max(0.0) as u64)
        })
        .unwrap_or(0);

    let codec_tag = stream
        .codec_tag_string
        .filter(|t| !t.is_empty())
        .or(stream.codec_name)
        .unwrap_or_default();

    Ok(VideoInfo {
        width,
        height,
        fps,
        frame_count,
        codec_tag,
    })
}

pub fn streams_have_audio(json: &[u8]) -> Result<bool, MediaError> {
    let probe: ProbeOutput = serde_json::from_slice(json)?;
    Ok(probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio")))
}

pub fn parse_video_encoders(listing: &str) -> HashSet<String> {
    REGEX_VIDEO_ENCODER
        .captures_iter(listing)
        .map(|caps| caps[1].to_string())
        .filter(|name| name != "=")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "programs": [],
        "streams": [
            {
                "codec_name": "h264",
                "codec_type": "video",
                "codec_tag_string": "avc1",
                "width": 1280,
                "height": 720,
                "r_frame_rate": "30000/1001",
                "avg_frame_rate": "30000/1001",
                "duration": "10.010000",
                "nb_frames": "300"
            }
        ]
    }"#;

    const ENCODERS_LISTING: &str = "Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D mpeg4                MPEG-4 part 2
 V....D mjpeg                MJPEG (Motion JPEG)
 V..... rawvideo             raw video
 A....D aac                  AAC (Advanced Audio Coding)
";

    #[test]
    fn test_parse_rate() {
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("25/1"), Some(25.0));
        assert_eq!(parse_rate("24"), Some(24.0));
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn test_parse_video_info() {
        let info = parse_video_info(PROBE_JSON.as_bytes()).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.frame_count, 300);
        assert_eq!(info.codec_tag, "avc1");
    }

    #[test]
    fn test_frame_count_falls_back_to_duration() {
        let json = r#"{"streams": [{"codec_type": "video", "codec_name": "vp9",
            "width": 640, "height": 360, "r_frame_rate": "25/1", "duration": "4.0"}]}"#;
        let info = parse_video_info(json.as_bytes()).unwrap();
        assert_eq!(info.frame_count, 100);
        assert_eq!(info.codec_tag, "vp9");
    }

    #[test]
    fn test_probe_without_video_stream() {
        let json = r#"{"streams": [{"codec_type": "audio"}]}"#;
        assert!(matches!(
            parse_video_info(json.as_bytes()),
            Err(MediaError::Probe(_))
        ));
        assert!(matches!(
            parse_video_info(b"not json"),
            Err(MediaError::Json(_))
        ));
    }

    #[test]
    fn test_streams_have_audio() {
        let with_audio = r#"{"streams": [{"codec_type": "video"}, {"codec_type": "audio"}]}"#;
        let silent = r#"{"streams": [{"codec_type": "video"}]}"#;
        assert!(streams_have_audio(with_audio.as_bytes()).unwrap());
        assert!(!streams_have_audio(silent.as_bytes()).unwrap());
    }

    #[test]
    fn test_parse_video_encoders() {
        let encoders = parse_video_encoders(ENCODERS_LISTING);
        assert!(encoders.contains("mpeg4"));
        assert!(encoders.contains("mjpeg"));
        assert!(encoders.contains("rawvideo"));
        assert!(!encoders.contains("aac"));
        assert!(!encoders.contains("="));
    }

    #[test]
    fn test_build_sink_args() {
        let info = VideoInfo {
            width: 320,
            height: 240,
            fps: 25.0,
            frame_count: 10,
            codec_tag: "avc1".to_string(),
        };
        let args = build_sink_args(
            &PathBuf::from("/tmp/out_temp.mp4"),
            &SinkCodec::new("mp4v", "mpeg4"),
            &info,
        );

        assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "320x240"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "mpeg4"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "pipe:0"));
        assert_eq!(args.last().unwrap(), "/tmp/out_temp.mp4");
    }

    #[test]
    fn test_build_remux_args() {
        let args = build_remux_args(
            &PathBuf::from("silent.mp4"),
            &PathBuf::from("original.mov"),
            &PathBuf::from("final.mp4"),
            &RemuxSettings::default(),
        );

        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a:0"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "23"));
        assert!(args.windows(2).any(|w| w[0] == "-preset" && w[1] == "fast"));
        assert_eq!(args.last().unwrap(), "final.mp4");
    }

    #[test]
    fn test_decode_args_emit_rgb24() {
        let args = build_decode_args(&PathBuf::from("in.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "rgb24"));
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn test_trial_path_keeps_extension() {
        assert_eq!(
            trial_path(Path::new("/tmp/out_temp.mp4")),
            PathBuf::from("/tmp/out_temp_trial.mp4")
        );
        assert_eq!(trial_path(Path::new("clip")), PathBuf::from("clip_trial"));
    }

    /// 用 shell 脚本模拟 ffmpeg / ffprobe 的子进程行为
    #[cfg(unix)]
    mod scripted {
        use super::*;
        use crate::core::config::PipelineConfig;
        use crate::core::faces::MockRegionDetector;
        use crate::core::media::MemoryMedia;
        use crate::core::video::PipelineDriver;
        use image::{Rgb, RgbImage};
        use std::sync::Arc;
        use std::time::{Duration, Instant};

        const STREAM_INFO_2X2: &str = r#"printf '{"streams":[{"codec_type":"video","codec_name":"rawvideo","width":2,"height":2,"r_frame_rate":"25/1","nb_frames":"3"}]}'"#;

        const LAST_ARG: &str = r#"for arg in "$@"; do last="$arg"; done"#;

        struct ScriptDir {
            dir: PathBuf,
        }

        impl ScriptDir {
            fn new(name: &str) -> Self {
                let dir = std::env::temp_dir().join(format!("{}_{}", name, uuid::Uuid::new_v4()));
                std::fs::create_dir_all(&dir).unwrap();
                Self { dir }
            }

            fn path(&self, name: &str) -> PathBuf {
                self.dir.join(name)
            }

            /// 写入可执行脚本；-version 直接成功，用来等待脚本可执行
            fn tool(&self, name: &str, body: &str) -> String {
                use std::os::unix::fs::PermissionsExt;

                let path = self.path(name);
                let script = format!(
                    "#!/bin/sh\ncase \"$1\" in -version) exit 0;; esac\n{}\n",
                    body
                );
                std::fs::write(&path, script).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

                // 其他测试线程 fork 时可能短暂持有写句柄（ETXTBSY）
                for _ in 0..50 {
                    match Command::new(&path).arg("-version").status() {
                        Err(e) if e.raw_os_error() == Some(26) => {
                            std::thread::sleep(Duration::from_millis(20))
                        }
                        _ => break,
                    }
                }
                path.to_string_lossy().to_string()
            }

            fn media(&self, ffmpeg: &str, ffprobe: &str) -> FfmpegMedia {
                let ffmpeg = self.tool("ffmpeg", ffmpeg);
                let ffprobe = self.tool("ffprobe", ffprobe);
                FfmpegMedia::from_config(&MediaConfig {
                    ffmpeg_path: ffmpeg,
                    ffprobe_path: ffprobe,
                    ..Default::default()
                })
            }
        }

        impl Drop for ScriptDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.dir);
            }
        }

        /// mpeg4 在奇数尺寸下初始化失败，其余编码器把原始帧写到输出
        fn odd_size_encoder() -> String {
            format!(
                r#"case " $* " in
  *" -encoders "*) printf ' V....D mpeg4   MPEG-4 part 2\n V....D mjpeg   MJPEG\n V..... rawvideo   raw video\n'; exit 0;;
  *" -c:v mpeg4 "*) cat > /dev/null; echo "[mpeg4] width not divisible by 2" >&2; exit 1;;
esac
{}
cat > "$last""#,
                LAST_ARG
            )
        }

        fn odd_info() -> VideoInfo {
            VideoInfo {
                width: 33,
                height: 25,
                fps: 25.0,
                frame_count: 3,
                codec_tag: "avc1".to_string(),
            }
        }

        #[test]
        fn test_encoder_init_failure_rejects_codec() {
            let scripts = ScriptDir::new("ffmpeg_trial");
            let media = scripts.media(&odd_size_encoder(), "exit 1");
            let out = scripts.path("out_temp.avi");
            let info = odd_info();

            let err = media
                .create_sink(&out, &SinkCodec::new("mp4v", "mpeg4"), &info)
                .err()
                .unwrap();
            match err {
                MediaError::Failed { status, stderr, .. } => {
                    assert_eq!(status, Some(1));
                    assert!(stderr.contains("not divisible"));
                }
                other => panic!("unexpected error: {:?}", other),
            }

            let mut sink = media
                .create_sink(&out, &SinkCodec::new("MJPG", "mjpeg"), &info)
                .unwrap();
            sink.write_frame(&Frame::new(RgbImage::new(33, 25), 0)).unwrap();
            sink.finish().unwrap();

            assert_eq!(std::fs::metadata(&out).unwrap().len(), 33 * 25 * 3);
            assert!(!trial_path(&out).exists());
        }

        /// 内存源 + 脚本编码器
        struct ScriptedSinkIo {
            source: MemoryMedia,
            sink: FfmpegMedia,
        }

        impl VideoIo for ScriptedSinkIo {
            fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
                self.source.open_source(path)
            }

            fn create_sink(
                &self,
                path: &Path,
                codec: &SinkCodec,
                info: &VideoInfo,
            ) -> Result<Box<dyn FrameSink>, MediaError> {
                self.sink.create_sink(path, codec, info)
            }
        }

        #[test]
        fn test_driver_falls_back_when_encoder_cannot_open() {
            let scripts = ScriptDir::new("ffmpeg_fallback");
            let input = scripts.path("in.mp4");
            let output = scripts.path("out.mp4");
            let frames = (0..3)
                .map(|i| Frame::new(RgbImage::from_pixel(33, 25, Rgb([i as u8, 40, 80])), i))
                .collect();
            let io = Arc::new(ScriptedSinkIo {
                source: MemoryMedia::new().with_source(input.clone(), odd_info(), frames),
                sink: scripts.media(&odd_size_encoder(), "exit 1"),
            });
            let config = PipelineConfig {
                worker_count: 1,
                batch_size: 2,
                ..Default::default()
            };

            let outcome = PipelineDriver::new(
                config,
                io,
                Arc::new(MemoryMedia::new()),
                Arc::new(MockRegionDetector::new()),
            )
            .run(&input, &output)
            .unwrap();

            assert_eq!(outcome.stats.codec.as_deref(), Some("mjpeg"));
            assert_eq!(outcome.stats.frames_written, 3);
            assert_eq!(std::fs::metadata(&output).unwrap().len(), 3 * 33 * 25 * 3);
        }

        #[test]
        fn test_source_stops_at_truncated_frame() {
            let scripts = ScriptDir::new("ffmpeg_decode");
            // 2x2 RGB24 每帧 12 字节，30 字节为 2.5 帧
            let media = scripts.media("head -c 30 /dev/zero", STREAM_INFO_2X2);

            let mut source = media.open_source(&scripts.path("in.mp4")).unwrap();
            assert_eq!(source.info().frame_count, 3);

            let first = source.read_frame().unwrap().unwrap();
            let second = source.read_frame().unwrap().unwrap();
            assert_eq!(first.frame_number, 0);
            assert_eq!(second.frame_number, 1);
            assert_eq!(second.as_raw().len(), 12);
            assert!(source.read_frame().unwrap().is_none());
        }

        #[test]
        fn test_dropping_source_stops_decoder() {
            let scripts = ScriptDir::new("ffmpeg_release");
            let media = scripts.media("exec sleep 30", STREAM_INFO_2X2);

            let source = media.open_source(&scripts.path("in.mp4")).unwrap();
            let started = Instant::now();
            drop(source);
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn test_encoder_exit_status_fails_finish() {
            let scripts = ScriptDir::new("ffmpeg_encode_fail");
            let body = format!(
                r#"case " $* " in *" -encoders "*) printf ' V....D mjpeg   MJPEG\n'; exit 0;; esac
{}
case "$last" in *_trial*) cat > /dev/null; exit 0;; esac
cat > /dev/null
echo "muxer rejected stream" >&2
exit 3"#,
                LAST_ARG
            );
            let media = scripts.media(&body, "exit 1");
            let info = VideoInfo {
                width: 2,
                height: 2,
                ..odd_info()
            };

            let mut sink = media
                .create_sink(&scripts.path("out_temp.avi"), &SinkCodec::new("MJPG", "mjpeg"), &info)
                .unwrap();
            sink.write_frame(&Frame::new(RgbImage::new(2, 2), 0)).unwrap();
            match sink.finish() {
                Err(PipelineError::SinkWrite(message)) => {
                    assert!(message.contains("muxer rejected stream"))
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }

        #[test]
        fn test_failed_remux_removes_partial_output() {
            let scripts = ScriptDir::new("ffmpeg_remux_fail");
            let body = format!(
                r#"{}
printf 'partial' > "$last"
echo "Stream map '1:a:0' matches no streams" >&2
exit 1"#,
                LAST_ARG
            );
            let media = scripts.media(&body, "exit 1");
            let output = scripts.path("final.mp4");

            let result = media.remux(
                &scripts.path("silent.mp4"),
                &scripts.path("original.mp4"),
                &output,
                &RemuxSettings::default(),
            );

            match result {
                Err(RemuxError::Media(MediaError::Failed { status, stderr, .. })) => {
                    assert_eq!(status, Some(1));
                    assert!(stderr.contains("matches no streams"));
                }
                other => panic!("unexpected result: {:?}", other),
            }
            assert!(!output.exists());
        }
    }
}
