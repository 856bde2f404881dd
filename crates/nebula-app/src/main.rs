//! Headless planet renderer: flies a straight camera path for a number of
//! frames and optionally writes the final frame as PNG.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use nebula_app::{AppError, CameraPath, PlanetRenderer, PlatformDirs};
use nebula_config::{CliArgs, Config};
use nebula_render::{GpuBackend, GpuContext, SoftwareBackend, WgpuBackend};
use tracing::{error, info};

const STATE_FILE: &str = "state.json";

fn main() -> ExitCode {
    let args = CliArgs::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("nebula-terrain: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &CliArgs) -> Result<(), AppError> {
    let dirs = match &args.config {
        Some(dir) => PlatformDirs::with_config_dir(dir),
        None => PlatformDirs::resolve()?,
    };
    dirs.create_dirs()?;

    let mut config = Config::load_or_create(&dirs.config_dir)?;
    config.apply_cli_overrides(args);
    config.validate()?;
    nebula_log::init_logging(Some(&dirs.log_dir), cfg!(debug_assertions), Some(&config));
    info!("Config loaded from {}", dirs.config_dir.display());

    if args.software {
        let mut gpu = SoftwareBackend::new();
        drive(&mut gpu, &config, args, &dirs)
    } else {
        let ctx = GpuContext::new_headless_blocking()?;
        let mut gpu = WgpuBackend::new(ctx);
        drive(&mut gpu, &config, args, &dirs)
    }
}

fn drive(gpu: &mut dyn GpuBackend, config: &Config, args: &CliArgs, dirs: &PlatformDirs) -> Result<(), AppError> {
    let mut renderer = PlanetRenderer::new(gpu, config)?;
    let path = CameraPath::straight(config);
    let fov_y = config.render.fov_y_degrees.to_radians();
    let aspect = config.render.width.max(1) as f32 / config.render.height.max(1) as f32;

    for frame in 0..args.frames {
        let camera = path.camera(frame, fov_y, aspect);
        renderer.render_frame(gpu, &camera)?;
    }
    let report = renderer.last_report();
    let stats = renderer.streaming().stats();
    info!(
        "Rendered {} frames: {} chunks drawn, {} resident bytes, {} evictions, sky LUT ready: {}",
        renderer.frame(),
        report.chunks_drawn,
        stats.resident_bytes,
        stats.evictions_total,
        report.lut_ready
    );

    if let Some(output) = &args.output {
        renderer.capture_color(gpu)?.save(output)?;
        info!("Wrote {}", output.display());
        if let Some(preview) = renderer.capture_height_preview(gpu)? {
            let preview_path = height_preview_path(output);
            preview.save(&preview_path)?;
            info!("Wrote {}", preview_path.display());
        }
    }
    if config.debug.dump_state_json {
        let target = match &args.output {
            Some(output) => output.with_extension("json"),
            None => dirs.log_dir.join(STATE_FILE),
        };
        std::fs::write(&target, renderer.state_json()?)?;
        info!("Wrote {}", target.display());
    }

    renderer.shutdown(gpu);
    Ok(())
}

/// `frame.png` becomes `frame_height.png` in the same directory.
fn height_preview_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".into());
    output.with_file_name(format!("{stem}_height.png"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The preview sits next to the output with a suffixed name.
    #[test]
    fn test_height_preview_path() {
        let out = Path::new("renders").join("final.png");
        assert_eq!(height_preview_path(&out), Path::new("renders").join("final_height.png"));
    }

    /// A full headless run writes the frame, the preview and the state dump.
    #[test]
    fn test_headless_run_writes_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = PlatformDirs::with_config_dir(&tmp.path().join("config"));
        dirs.create_dirs().unwrap();
        let mut config = Config::default();
        config.streaming.base_texture_size = 64;
        config.streaming.stream_radius = 200.0;
        config.render.width = 8;
        config.render.height = 8;
        config.debug.dump_state_json = true;
        let output = tmp.path().join("frame.png");
        let args = CliArgs {
            frames: 30,
            output: Some(output.clone()),
            software: true,
            ..CliArgs::default()
        };
        let mut gpu = SoftwareBackend::new();
        drive(&mut gpu, &config, &args, &dirs).unwrap();

        assert!(output.exists());
        assert!(tmp.path().join("frame_height.png").exists());
        let json = std::fs::read_to_string(tmp.path().join("frame.json")).unwrap();
        assert!(json.contains("\"streaming\""));
        let img = image::open(&output).unwrap();
        assert_eq!((img.width(), img.height()), (8, 8));
    }
}
