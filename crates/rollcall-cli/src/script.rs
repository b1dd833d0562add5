//! Frame scripts: JSON lists of frames replayed against the daemon.
//!
//! Enrollment frame: `{"has_face": true, "pitch": 0.0, "yaw": 20.0, "image": "left.jpg"}`
//! Scan frame: `{"face_present": true, "image": "door-01.jpg"}`
//!
//! `has_face`/`face_present` default to true; image paths are relative to
//! the script file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnrollFrame {
    #[serde(default = "yes")]
    pub has_face: bool,
    #[serde(default)]
    pub pitch: f64,
    #[serde(default)]
    pub yaw: f64,
    #[serde(default)]
    pub image: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScanFrame {
    #[serde(default = "yes")]
    pub face_present: bool,
    #[serde(default)]
    pub image: Option<PathBuf>,
}

pub trait HasImage {
    fn image_path(&mut self) -> &mut Option<PathBuf>;
}

impl HasImage for EnrollFrame {
    fn image_path(&mut self) -> &mut Option<PathBuf> {
        &mut self.image
    }
}

impl HasImage for ScanFrame {
    fn image_path(&mut self) -> &mut Option<PathBuf> {
        &mut self.image
    }
}

/// Parse a script and resolve its image paths against `base`.
pub fn parse<T>(text: &str, base: &Path) -> Result<Vec<T>>
where
    T: HasImage + for<'de> Deserialize<'de>,
{
    let mut frames: Vec<T> = serde_json::from_str(text).context("parsing frame script")?;
    for frame in &mut frames {
        if let Some(path) = frame.image_path() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
    Ok(frames)
}

pub fn load<T>(path: &Path) -> Result<Vec<T>>
where
    T: HasImage + for<'de> Deserialize<'de>,
{
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse(&text, base)
}

/// Image bytes for a frame; a frame without an image sends none.
pub fn read_image(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(p) => std::fs::read(p).with_context(|| format!("reading image {}", p.display())),
        None => Ok(Vec::new()),
    }
}
