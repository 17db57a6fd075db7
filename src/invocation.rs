use crate::config::ToolCommand;
use crate::job::JobSpec;
use serde::{Deserialize, Serialize};

/// A fully resolved command line for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Resolve a spec against the mode's default executable.
    pub fn for_spec(spec: &JobSpec) -> Self {
        let tool = ToolCommand {
            program: spec.mode.profile().executable.to_string(),
            prefix_args: Vec::new(),
        };
        Self::with_tool(&tool, spec)
    }

    /// Resolve a spec against a configured launcher (e.g. `uv run mflux-generate`).
    pub fn with_tool(tool: &ToolCommand, spec: &JobSpec) -> Self {
        let mut args = tool.prefix_args.clone();
        args.extend(generation_args(spec));
        Self {
            program: tool.program.clone(),
            args,
        }
    }

    /// Shell-ish rendering for logs; not meant to be re-parsed.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_for_display)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Flags for the generation tool. Pure function of the job; ordering is stable.
pub fn generation_args(spec: &JobSpec) -> Vec<String> {
    let profile = spec.mode.profile();
    let mut args: Vec<String> = Vec::new();

    if let Some(model) = profile.model_flag {
        flag(&mut args, "--model", model);
    }

    if profile.requires_image {
        if let Some(image) = &spec.image_path {
            flag(&mut args, "--image-path", image.to_string_lossy());
        }
    }

    flag(&mut args, "--prompt", spec.prompt.as_str());
    flag(&mut args, "--steps", spec.steps.to_string());
    flag(&mut args, "--width", spec.width.to_string());
    flag(&mut args, "--height", spec.height.to_string());
    flag(&mut args, "--output", spec.output_path().to_string_lossy());

    if profile.guidance_range.is_some() {
        if let Some(g) = spec.guidance {
            flag(&mut args, "--guidance", g.to_string());
        }
    }
    if let Some(q) = spec.quantize {
        flag(&mut args, "-q", q.bits().to_string());
    }
    if let Some(seed) = spec.seed {
        flag(&mut args, "--seed", seed.to_string());
    }
    if spec.low_ram {
        args.push("--low-ram".to_string());
    }
    if let Some(split) = spec.vae_tiling {
        args.push("--vae-tiling".to_string());
        flag(&mut args, "--vae-tiling-split", split.as_str());
    }
    if let Some(precision) = spec.precision {
        flag(&mut args, "--dtype", precision.as_str());
    }

    args
}

fn flag(args: &mut Vec<String>, name: &str, value: impl Into<String>) {
    args.push(name.to_string());
    args.push(value.into());
}

fn quote_for_display(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
