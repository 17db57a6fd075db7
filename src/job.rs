use crate::error::{JobError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

pub const DIMENSION_RANGE: RangeInclusive<u32> = 256..=2048;

/// Generation modes offered by the mflux tool family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Text-to-image, distilled model (fast, no guidance).
    Schnell,
    /// Text-to-image, full model.
    Dev,
    /// Image-to-image editing with a reference image.
    Kontext,
}

/// Static per-mode limits and CLI wiring.
#[derive(Debug, Clone, Serialize)]
pub struct ModeProfile {
    pub key: &'static str,
    pub label: &'static str,
    pub executable: &'static str,
    pub model_flag: Option<&'static str>,
    pub requires_image: bool,
    pub steps_range: RangeInclusive<u32>,
    pub default_steps: u32,
    pub guidance_range: Option<RangeInclusive<f32>>,
    pub default_guidance: Option<f32>,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Schnell, Mode::Dev, Mode::Kontext];

    pub fn profile(self) -> ModeProfile {
        match self {
            Mode::Schnell => ModeProfile {
                key: "schnell",
                label: "Text-to-Image (Schnell)",
                executable: "mflux-generate",
                model_flag: Some("schnell"),
                requires_image: false,
                steps_range: 1..=10,
                default_steps: 4,
                guidance_range: None,
                default_guidance: None,
            },
            Mode::Dev => ModeProfile {
                key: "dev",
                label: "Text-to-Image (Dev)",
                executable: "mflux-generate",
                model_flag: Some("dev"),
                requires_image: false,
                steps_range: 10..=40,
                default_steps: 20,
                guidance_range: Some(0.5..=8.0),
                default_guidance: Some(3.5),
            },
            Mode::Kontext => ModeProfile {
                key: "kontext",
                label: "Image-to-Image (Kontext)",
                executable: "mflux-generate-kontext",
                model_flag: None,
                requires_image: true,
                steps_range: 10..=40,
                default_steps: 20,
                guidance_range: Some(2.0..=4.0),
                default_guidance: Some(2.5),
            },
        }
    }

    pub fn key(self) -> &'static str {
        self.profile().key
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Weight quantization passed as `-q`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Quantize {
    Q3,
    Q4,
    Q6,
    Q8,
}

impl Quantize {
    pub fn bits(self) -> u8 {
        match self {
            Quantize::Q3 => 3,
            Quantize::Q4 => 4,
            Quantize::Q6 => 6,
            Quantize::Q8 => 8,
        }
    }
}

impl TryFrom<u8> for Quantize {
    type Error = String;

    fn try_from(bits: u8) -> std::result::Result<Self, Self::Error> {
        match bits {
            3 => Ok(Quantize::Q3),
            4 => Ok(Quantize::Q4),
            6 => Ok(Quantize::Q6),
            8 => Ok(Quantize::Q8),
            other => Err(format!("unsupported quantization: {other} (expected 3, 4, 6 or 8)")),
        }
    }
}

impl From<Quantize> for u8 {
    fn from(q: Quantize) -> u8 {
        q.bits()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VaeSplit {
    Horizontal,
    Vertical,
}

impl VaeSplit {
    pub fn as_str(self) -> &'static str {
        match self {
            VaeSplit::Horizontal => "horizontal",
            VaeSplit::Vertical => "vertical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Bf16,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Bf16 => "bf16",
        }
    }
}

/// One generation request. Build it, then [`JobSpec::validate`] before launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub mode: Mode,
    pub prompt: String,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    pub steps: u32,
    #[serde(default)]
    pub guidance: Option<f32>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub quantize: Option<Quantize>,
    #[serde(default)]
    pub low_ram: bool,
    /// `Some` enables VAE tiling with the given split direction.
    #[serde(default)]
    pub vae_tiling: Option<VaeSplit>,
    #[serde(default)]
    pub precision: Option<Precision>,
    pub out_dir: PathBuf,
    pub file_name: String,
}

impl JobSpec {
    /// A spec carrying the mode's defaults (1024x1024, 3-bit quantization).
    pub fn new(
        mode: Mode,
        prompt: impl Into<String>,
        out_dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Self {
        let profile = mode.profile();
        Self {
            mode,
            prompt: prompt.into(),
            image_path: None,
            steps: profile.default_steps,
            guidance: profile.default_guidance,
            width: 1024,
            height: 1024,
            seed: None,
            quantize: Some(Quantize::Q3),
            low_ram: false,
            vae_tiling: None,
            precision: None,
            out_dir: out_dir.into(),
            file_name: file_name.into(),
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.out_dir.join(&self.file_name)
    }

    pub fn validate(&self) -> Result<()> {
        let profile = self.mode.profile();

        if self.prompt.trim().is_empty() {
            return Err(JobError::validation("prompt is required"));
        }

        if !profile.steps_range.contains(&self.steps) {
            return Err(JobError::validation(format!(
                "steps {} outside {}..={} for mode {}",
                self.steps,
                profile.steps_range.start(),
                profile.steps_range.end(),
                self.mode
            )));
        }

        match (&profile.guidance_range, self.guidance) {
            (None, Some(_)) => {
                return Err(JobError::validation(format!(
                    "mode {} does not accept guidance",
                    self.mode
                )));
            }
            (Some(range), Some(g)) if !range.contains(&g) => {
                return Err(JobError::validation(format!(
                    "guidance {g} outside {}..={} for mode {}",
                    range.start(),
                    range.end(),
                    self.mode
                )));
            }
            _ => {}
        }

        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !DIMENSION_RANGE.contains(&value) {
                return Err(JobError::validation(format!(
                    "{name} {value} outside {}..={}",
                    DIMENSION_RANGE.start(),
                    DIMENSION_RANGE.end()
                )));
            }
        }

        validate_file_name(&self.file_name)?;

        if profile.requires_image {
            let Some(image) = self.image_path.as_deref() else {
                return Err(JobError::validation(format!(
                    "mode {} requires a reference image",
                    self.mode
                )));
            };
            if !image.is_file() {
                return Err(JobError::validation(format!(
                    "reference image does not exist: {}",
                    image.display()
                )));
            }
        }

        Ok(())
    }
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(JobError::validation("output file name is required"));
    }
    let p = Path::new(name);
    if p.components().count() != 1 || p.file_name().is_none() {
        return Err(JobError::validation(format!(
            "output file name must be a bare name: {name}"
        )));
    }
    Ok(())
}
