use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use image::RgbaImage;
use indicatif::{ProgressBar, ProgressStyle};
use minisession::{
    BufferParams, Session, SessionParams, SessionState,
    device::{BoxFilterDenoiser, CpuDevice, DenoiseParams, DenoiserType, DeviceId, RingsKernel},
    display::ImageDisplay,
    scene::CameraScene,
    screen_block::TileOrder,
};

#[derive(Parser)]
#[command(author, version, about = "Render a procedural test pattern with a progressive session")]
struct Arguments {
    #[arg(long, default_value_t = 1024)]
    width: u32,
    #[arg(long, default_value_t = 768)]
    height: u32,
    /// Sample target, renders until interrupted if missing.
    #[arg(long, short = 's')]
    samples: Option<u32>,
    /// Run as an interactive session with low resolution previews.
    #[arg(long)]
    interactive: bool,
    /// Render threads, 0 for one per CPU.
    #[arg(long, short = 't', default_value_t = 0)]
    threads: usize,
    #[arg(long, default_value_t = 64)]
    tile_size: u32,
    #[arg(long, value_enum, default_value = "center")]
    tile_order: TileOrderArgument,
    #[arg(long, default_value_t = 1)]
    pixel_size: u32,
    /// Denoise the result with a box filter.
    #[arg(long)]
    denoise: bool,
    /// Write the final image to this file.
    #[arg(long, short = 'o', value_parser)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum TileOrderArgument {
    Center,
    LeftToRight,
    RightToLeft,
    TopToBottom,
    BottomToTop,
}

impl From<TileOrderArgument> for TileOrder {
    fn from(value: TileOrderArgument) -> Self {
        match value {
            TileOrderArgument::Center => TileOrder::Center,
            TileOrderArgument::LeftToRight => TileOrder::LeftToRight,
            TileOrderArgument::RightToLeft => TileOrder::RightToLeft,
            TileOrderArgument::TopToBottom => TileOrder::TopToBottom,
            TileOrderArgument::BottomToTop => TileOrder::BottomToTop,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let arguments = Arguments::parse();

    let params = SessionParams::builder()
        .background(!arguments.interactive)
        .maybe_samples(arguments.samples)
        .pixel_size(arguments.pixel_size)
        .tile_size(arguments.tile_size)
        .tile_order(arguments.tile_order.into())
        .denoising(DenoiseParams {
            use_denoising: arguments.denoise,
            denoiser_type: DenoiserType::BoxFilter,
            start_sample: 0,
        })
        .build()?;

    let device = CpuDevice::new(DeviceId(0), RingsKernel::default(), arguments.threads)
        .with_denoiser(BoxFilterDenoiser::default());
    log::info!("Rendering on {} threads", device.threads());

    let last_image: Arc<Mutex<Option<RgbaImage>>> = Arc::default();
    let display = ImageDisplay::new().with_present_callback({
        let last_image = Arc::clone(&last_image);
        move |image| {
            *last_image.lock().expect("Poisoned lock!") = Some(image.clone());
        }
    });

    let session = Session::builder()
        .params(params)
        .device(device)
        .scene(CameraScene::default())
        .display(Box::new(display))
        .build();

    let bar = ProgressBar::new(1000);
    bar.set_style(ProgressStyle::with_template("{bar:40} {elapsed_precise} {msg}")?);

    session.reset(
        BufferParams::new(arguments.width, arguments.height),
        arguments.samples,
    );
    session.start()?;

    loop {
        let (status, substatus) = session.progress().get_status();
        bar.set_position((session.progress().get_progress() * 1000.0) as u64);
        bar.set_message(format!("{status} {substatus}"));

        match session.state() {
            SessionState::Finished | SessionState::Cancelled => break,
            _ if status == "Rendering Done" => break,
            _ => std::thread::sleep(Duration::from_millis(100)),
        }
    }
    session.cancel();
    bar.finish();

    if session.progress().get_error() {
        anyhow::bail!(session.progress().get_error_message());
    }
    let (total, render) = session.progress().get_time();
    log::info!("Rendered in {render:.2?} ({total:.2?} total)");

    session.draw();
    if let Some(output) = &arguments.output {
        let image = last_image.lock().expect("Poisoned lock!").take();
        let image = image.context("Nothing was rendered")?;
        image
            .save(output)
            .with_context(|| format!("save image to {}", output.display()))?;
        log::info!("Saved {}", output.display());
    }

    Ok(())
}
