use anyhow::{Context, Result};
use kestrel_vsm::cli::CliOverrides;
use kestrel_vsm::config::VsmConfig;
use kestrel_vsm::manager::{FrameReport, VsmShadowManager};
use kestrel_vsm::occlusion::MomentSampler;
use kestrel_vsm::renderer::SoftwareShadowBackend;
use kestrel_vsm::scene::{ProbeSample, SceneDescription};
use serde::Serialize;
use std::fs;

#[derive(Serialize)]
struct FitReport {
    config: VsmConfig,
    frame: FrameReport,
    probes: Vec<ProbeSample>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(cli) {
        eprintln!("vsm_fit error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: CliOverrides) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => VsmConfig::load(path)?,
        None => VsmConfig::default(),
    };
    let overrides = cli.config_overrides();
    if !overrides.is_empty() {
        log::info!("CLI overrides: {}", overrides.applied_fields().join(", "));
    }
    config.apply_overrides(&overrides);
    let config = config.sanitized();

    let scene = match &cli.scene {
        Some(path) => SceneDescription::load_from_path(path)?,
        None => SceneDescription::demo(),
    };
    let registry = scene.build_registry();
    let mut receivers = scene.build_receivers();

    let mut manager = VsmShadowManager::new(SoftwareShadowBackend::new(), &config);
    manager.activate().context("activating shadow manager")?;
    let frame = manager.update(&scene.directional_light(), &registry, &mut receivers);

    let params = receivers.iter().next().map(|(_, receiver)| receiver.params).unwrap_or_default();
    let sampler = manager.shadow_map().map(|map| map as &dyn MomentSampler);
    let probes = scene.shade_probes(&params, sampler);

    if let Some(path) = &cli.moments_png {
        let map = manager.shadow_map().context("no shadow map was rendered")?;
        map.depth_image(manager.camera().convention)
            .save(path)
            .with_context(|| format!("Writing moment image {}", path.display()))?;
        log::info!("wrote first moment to {}", path.display());
    }

    let report = FitReport { config, frame, probes };
    let json = serde_json::to_string_pretty(&report)?;
    match &cli.out {
        Some(path) => {
            fs::write(path, json.as_bytes())
                .with_context(|| format!("Writing report {}", path.display()))?;
        }
        None => println!("{json}"),
    }
    Ok(())
}
