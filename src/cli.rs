use crate::config::VsmConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

const SUPPORTED_FLAGS: &str =
    "--scene, --config, --out, --moments-png, --resolution, --strength, --min-variance, --bleed, --bias";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CliOverrides {
    pub scene: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub out: Option<PathBuf>,
    pub moments_png: Option<PathBuf>,
    resolution: Option<u32>,
    strength: Option<f32>,
    min_variance: Option<f32>,
    bleed: Option<f32>,
    bias: Option<f32>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // program name
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Supported flags: {SUPPORTED_FLAGS}.");
            };
            let value = iter
                .next()
                .ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?
                .as_ref()
                .to_string();
            match key {
                "scene" => overrides.scene = Some(PathBuf::from(value)),
                "config" => overrides.config = Some(PathBuf::from(value)),
                "out" => overrides.out = Some(PathBuf::from(value)),
                "moments-png" => overrides.moments_png = Some(PathBuf::from(value)),
                "resolution" => {
                    let resolution = value
                        .parse::<u32>()
                        .with_context(|| format!("Invalid resolution '{value}'"))?;
                    overrides.resolution = Some(resolution);
                }
                "strength" => overrides.strength = Some(parse_unit_float("strength", &value)?),
                "min-variance" => {
                    overrides.min_variance = Some(parse_float("min-variance", &value)?);
                }
                "bleed" => overrides.bleed = Some(parse_unit_float("bleed", &value)?),
                "bias" => overrides.bias = Some(parse_float("bias", &value)?),
                _ => bail!("Unknown flag '{flag}'. Supported flags: {SUPPORTED_FLAGS}."),
            }
        }
        Ok(overrides)
    }

    pub fn config_overrides(&self) -> VsmConfigOverrides {
        VsmConfigOverrides {
            resolution: self.resolution,
            shadow_strength: self.strength,
            min_variance: self.min_variance,
            light_bleeding_reduction: self.bleed,
            depth_bias: self.bias,
        }
    }
}

fn parse_float(flag: &str, value: &str) -> Result<f32> {
    let parsed = value.parse::<f32>().with_context(|| format!("Invalid {flag} '{value}'"))?;
    if !parsed.is_finite() {
        bail!("Invalid {flag} '{value}': must be finite");
    }
    Ok(parsed)
}

fn parse_unit_float(flag: &str, value: &str) -> Result<f32> {
    let parsed = parse_float(flag, value)?;
    if !(0.0..=1.0).contains(&parsed) {
        bail!("Invalid {flag} '{value}': expected a value in [0, 1]");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paths_and_tunables() {
        let args = [
            "vsm_fit", "--scene", "demo.json", "--resolution", "512", "--strength", "0.5", "--bias",
            "0.02",
        ];
        let cli = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(cli.scene, Some(PathBuf::from("demo.json")));
        let overrides = cli.config_overrides();
        assert_eq!(overrides.resolution, Some(512));
        assert_eq!(overrides.shadow_strength, Some(0.5));
        assert_eq!(overrides.depth_bias, Some(0.02));
        assert_eq!(overrides.min_variance, None);
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["vsm_fit", "--bleed", "0.1", "--bleed", "0.3"];
        let cli = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(cli.config_overrides().light_bleeding_reduction, Some(0.3));
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["vsm_fit", "--resolution"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_unknown_flags_and_out_of_range_strength() {
        let err = CliOverrides::parse(["vsm_fit", "--foo", "bar"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
        let err = CliOverrides::parse(["vsm_fit", "--strength", "1.5"]).unwrap_err();
        assert!(err.to_string().contains("[0, 1]"));
    }
}
