// src/ffmpeg.rs

use crate::error::{Result, VqError};
use crate::source::{Frame, FrameSource, Pixels, SourceOpener, effective_frame_rate};
use image::RgbImage;
use log::{debug, error, info, warn};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub path: PathBuf,
    /// Displayed size, after applying the stream's rotation.
    pub width: u32,
    pub height: u32,
    /// Rotation in degrees from display-matrix side data or the `rotate` tag.
    pub rotation: i64,
    pub frame_count: Option<u64>,
    pub fps: Option<f64>,
}

/// Runs ffprobe to get video metadata.
pub fn get_video_info(video_path: &Path) -> Result<VideoInfo> {
    info!("Probing video file: {}", video_path.display());
    if !video_path.exists() {
        return Err(VqError::Input(format!(
            "Input video file not found: {}",
            video_path.display()
        )));
    }

    let output = Command::new("ffprobe")
        .args([
            "-v", "error",
            "-select_streams", "v:0",
            "-show_entries", "stream=width,height,nb_frames,r_frame_rate,avg_frame_rate:stream_side_data=rotation:stream_tags=rotate:format=nb_frames",
            "-of", "json",
        ])
        .arg(video_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("ffprobe failed for {}: {}", video_path.display(), stderr);
        return Err(VqError::Command(format!(
            "ffprobe failed for {}: {}",
            video_path.display(), stderr
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!("ffprobe output for {}: {}", video_path.display(), stdout);
    parse_probe_output(video_path, &stdout)
}

/// Extracts stream metadata from ffprobe's JSON output.
fn parse_probe_output(video_path: &Path, stdout: &str) -> Result<VideoInfo> {
    let json: serde_json::Value = serde_json::from_str(stdout)
        .map_err(|e| VqError::Parse(format!("Failed to parse ffprobe JSON: {}", e)))?;

    let stream = json["streams"].get(0).ok_or_else(|| VqError::Parse("No video stream found in ffprobe output".to_string()))?;

    let width = stream["width"].as_u64().ok_or_else(|| VqError::Parse("Missing width".to_string()))? as u32;
    let height = stream["height"].as_u64().ok_or_else(|| VqError::Parse("Missing height".to_string()))? as u32;
    if width == 0 || height == 0 {
        return Err(VqError::Parse(format!("Invalid frame size {}x{}", width, height)));
    }

    // ffmpeg auto-rotates on decode, so quarter turns swap the output geometry.
    let rotation = stream_rotation(stream);
    let (width, height) = if rotation.rem_euclid(180) == 90 {
        debug!("{} is rotated by {} degrees, decoding as {}x{}", video_path.display(), rotation, height, width);
        (height, width)
    } else {
        (width, height)
    };

    // Frame count is informational only; playback and metrics read until EOF.
    let frame_count = stream["nb_frames"].as_str()
        .or_else(|| json["format"]["nb_frames"].as_str())
        .and_then(|fc| fc.parse::<u64>().ok());

    let fps = ["r_frame_rate", "avg_frame_rate"]
        .iter()
        .filter_map(|key| stream[*key].as_str())
        .find_map(|s| match parse_frame_rate(s) {
            Ok(fps) if fps > 0.0 => Some(fps),
            Ok(_) => None,
            Err(e) => {
                debug!("Ignoring frame rate '{}' for {}: {}", s, video_path.display(), e);
                None
            }
        });

    info!("Detected Info for {}: {}x{} @ {:?} fps, {:?} frames",
          video_path.display(), width, height, fps, frame_count);

    Ok(VideoInfo {
        path: video_path.to_path_buf(),
        width,
        height,
        rotation,
        frame_count,
        fps,
    })
}

/// Rotation in degrees. Newer ffprobe reports display-matrix side data,
/// older builds a `rotate` stream tag.
fn stream_rotation(stream: &serde_json::Value) -> i64 {
    let as_degrees = |v: &serde_json::Value| {
        v.as_i64()
            .or_else(|| v.as_f64().map(|f| f.round() as i64))
            .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
    };
    stream["side_data_list"]
        .as_array()
        .and_then(|list| list.iter().find_map(|sd| as_degrees(&sd["rotation"])))
        .or_else(|| as_degrees(&stream["tags"]["rotate"]))
        .unwrap_or(0)
}

/// Parses frame rate string (e.g., "24000/1001") into f64.
fn parse_frame_rate(fps_str: &str) -> Result<f64> {
    if fps_str.contains('/') {
        let parts: Vec<&str> = fps_str.split('/').collect();
        if parts.len() == 2 {
            let num = parts[0].parse::<f64>().map_err(|_| VqError::Parse(format!("Invalid FPS numerator: {}", parts[0])))?;
            let den = parts[1].parse::<f64>().map_err(|_| VqError::Parse(format!("Invalid FPS denominator: {}", parts[1])))?;
            if den == 0.0 {
                Err(VqError::Parse("FPS denominator cannot be zero".to_string()))
            } else {
                Ok(num / den)
            }
        } else {
            Err(VqError::Parse(format!("Invalid FPS format: {}", fps_str)))
        }
    } else {
        fps_str.parse::<f64>().map_err(|_| VqError::Parse(format!("Invalid FPS format: {}", fps_str)))
    }
}

/// Starts an ffmpeg process decoding the first video stream to packed RGB24 on stdout.
///
/// Auto-rotation stays on; the probed size already accounts for it.
fn spawn_decoder(video_path: &Path) -> Result<Child> {
    debug!("Spawning ffmpeg decoder for {}", video_path.display());
    let child = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
        .arg(video_path)
        .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child)
}

/// Opens video files by probing them with ffprobe and decoding through ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    default_fps: f64,
}

impl FfmpegOpener {
    pub fn new(default_fps: f64) -> Self {
        Self { default_fps }
    }
}

impl SourceOpener for FfmpegOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let info = get_video_info(path).map_err(|e| VqError::unavailable(path, e.to_string()))?;
        let fps = effective_frame_rate(info.fps, self.default_fps);
        if info.fps.is_none() {
            warn!("No usable frame rate reported for {}, assuming {} fps", path.display(), fps);
        }
        let mut source = FfmpegSource {
            path: Arc::from(path),
            frame_bytes: info.width as usize * info.height as usize * 3,
            info,
            fps,
            child: None,
            reader: None,
            position: 0,
            closed: false,
        };
        source.start().map_err(|e| VqError::unavailable(path, e.to_string()))?;
        Ok(Box::new(source))
    }
}

/// A decoding ffmpeg child process plus the read position within its output.
pub struct FfmpegSource {
    path: Arc<Path>,
    info: VideoInfo,
    fps: f64,
    frame_bytes: usize,
    child: Option<Child>,
    reader: Option<BufReader<ChildStdout>>,
    position: u64,
    closed: bool,
}

impl FfmpegSource {
    fn start(&mut self) -> Result<()> {
        let mut child = spawn_decoder(&self.path)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VqError::Command("ffmpeg stdout was not captured".to_string()))?;
        self.reader = Some(BufReader::with_capacity(self.frame_bytes, stdout));
        self.child = Some(child);
        self.position = 0;
        Ok(())
    }

    fn stop_decoder(&mut self) {
        self.reader = None;
        if let Some(mut child) = self.child.take() {
            // The decoder is usually still writing; kill it rather than drain.
            if let Err(e) = child.kill() {
                debug!("ffmpeg for {} already exited: {}", self.path.display(), e);
            }
            if let Err(e) = child.wait() {
                warn!("Failed to reap ffmpeg for {}: {}", self.path.display(), e);
            }
        }
    }
}

impl FrameSource for FfmpegSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        self.info.frame_count
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.closed {
            return Err(VqError::InvalidState(format!(
                "read from closed source {}",
                self.path.display()
            )));
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; self.frame_bytes];
        match reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("End of stream for {} after {} frames", self.path.display(), self.position);
                self.stop_decoder();
                return Ok(None);
            }
            Err(e) => return Err(VqError::Io(e)),
        }
        let img = RgbImage::from_raw(self.info.width, self.info.height, buf)
            .ok_or_else(|| VqError::Parse("Decoded frame has unexpected size".to_string()))?;
        let frame = Frame {
            source: Arc::clone(&self.path),
            index: self.position,
            pixels: Pixels::Rgb(img),
        };
        self.position += 1;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> Result<()> {
        if self.closed {
            return Err(VqError::InvalidState(format!(
                "rewind of closed source {}",
                self.path.display()
            )));
        }
        self.stop_decoder();
        self.start()
    }

    fn close(&mut self) {
        if !self.closed {
            debug!("Closing decoder for {}", self.path.display());
            self.stop_decoder();
            self.closed = true;
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractional_and_plain_frame_rates() {
        assert!((parse_frame_rate("24000/1001").unwrap() - 23.976).abs() < 1e-3);
        assert_eq!(parse_frame_rate("30").unwrap(), 30.0);
        assert!(parse_frame_rate("0/0").is_err());
        assert!(parse_frame_rate("abc").is_err());
        assert!(parse_frame_rate("1/2/3").is_err());
    }

    #[test]
    fn probe_output_with_missing_rate_leaves_fps_unset() {
        let json = r#"{"streams":[{"width":640,"height":360,"r_frame_rate":"0/0","avg_frame_rate":"0/0"}],"format":{}}"#;
        let info = parse_probe_output(Path::new("x.mp4"), json).unwrap();
        assert_eq!((info.width, info.height), (640, 360));
        assert_eq!(info.fps, None);
        assert_eq!(info.frame_count, None);
    }

    #[test]
    fn probe_output_reads_rate_and_count() {
        let json = r#"{"streams":[{"width":1920,"height":1080,"nb_frames":"240","r_frame_rate":"60000/1001"}]}"#;
        let info = parse_probe_output(Path::new("x.mp4"), json).unwrap();
        assert_eq!(info.frame_count, Some(240));
        assert!((info.fps.unwrap() - 59.94).abs() < 1e-2);
    }

    #[test]
    fn quarter_turn_rotation_swaps_decoded_geometry() {
        let json = r#"{"streams":[{"width":1920,"height":1080,"r_frame_rate":"30/1",
            "side_data_list":[{"side_data_type":"Display Matrix","rotation":-90}]}]}"#;
        let info = parse_probe_output(Path::new("phone.mp4"), json).unwrap();
        assert_eq!(info.rotation, -90);
        assert_eq!((info.width, info.height), (1080, 1920));
    }

    #[test]
    fn rotate_tag_is_used_when_side_data_is_absent() {
        let json = r#"{"streams":[{"width":1280,"height":720,"tags":{"rotate":"270"}}]}"#;
        let info = parse_probe_output(Path::new("old.mov"), json).unwrap();
        assert_eq!(info.rotation, 270);
        assert_eq!((info.width, info.height), (720, 1280));

        let json = r#"{"streams":[{"width":1280,"height":720,"side_data_list":[{"rotation":180}]}]}"#;
        let info = parse_probe_output(Path::new("flipped.mp4"), json).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
    }

    #[test]
    fn probe_output_without_stream_is_error() {
        assert!(matches!(
            parse_probe_output(Path::new("x.mp4"), r#"{"streams":[]}"#),
            Err(VqError::Parse(_))
        ));
    }

    #[test]
    fn opening_missing_file_is_source_unavailable() {
        let opener = FfmpegOpener::new(30.0);
        assert!(matches!(
            opener.open(Path::new("/definitely/not/here.mp4")),
            Err(VqError::SourceUnavailable { .. })
        ));
    }
}
