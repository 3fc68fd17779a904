//! aulos-play - play a WAV file through the Aulos playback engine
//!
//! Decodes a WAV with hound, registers it as a source model, starts the
//! CPAL output backend and plays until the material ends (or forever with
//! --loop). Mostly a smoke-test harness for the engine, but a usable
//! little player.
//!
//! ## Usage
//!
//! `aulos-play <file.wav> [--device NAME] [--loop] [--stretch RATIO]
//!     [--select START END]`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use aulos_core::audio::{start_output, OutputPrefs};
use aulos_core::config::{default_tuning_path, load_config};
use aulos_core::engine::{EngineEvent, PlaybackController};
use aulos_core::model::BufferModel;
use aulos_core::selection::Selection;
use aulos_core::types::Sample;
use aulos_core::EngineTuning;

struct Options {
    path: String,
    device: Option<String>,
    looping: bool,
    stretch: Option<f64>,
    selection: Option<(usize, usize)>,
}

fn parse_args() -> Result<Options> {
    let mut args = std::env::args().skip(1);
    let mut opts = Options {
        path: String::new(),
        device: None,
        looping: false,
        stretch: None,
        selection: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--device" => {
                opts.device = Some(args.next().context("--device needs a name")?);
            }
            "--loop" => opts.looping = true,
            "--stretch" => {
                let r = args.next().context("--stretch needs a ratio")?;
                opts.stretch = Some(r.parse().context("invalid stretch ratio")?);
            }
            "--select" => {
                let start: usize = args
                    .next()
                    .context("--select needs START END")?
                    .parse()
                    .context("invalid selection start")?;
                let end: usize = args
                    .next()
                    .context("--select needs START END")?
                    .parse()
                    .context("invalid selection end")?;
                opts.selection = Some((start, end));
            }
            other if opts.path.is_empty() => opts.path = other.to_string(),
            other => bail!("unexpected argument: {}", other),
        }
    }

    if opts.path.is_empty() {
        bail!("usage: aulos-play <file.wav> [--device NAME] [--loop] [--stretch RATIO] [--select START END]");
    }
    Ok(opts)
}

/// Decode a WAV file into planar f32 channels
fn load_wav(path: &Path) -> Result<(u32, Vec<Vec<Sample>>)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {:?}", path))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        bail!("{:?} has no channels", path);
    }

    let interleaved: Vec<Sample> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .context("decoding float samples")?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as Sample;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as Sample * scale))
                .collect::<std::result::Result<_, _>>()
                .context("decoding integer samples")?
        }
    };

    let frames = interleaved.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            planar[ch].push(s);
        }
    }
    Ok((spec.sample_rate, planar))
}

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let opts = parse_args()?;
    log::info!("aulos-play starting up");

    let tuning: EngineTuning = load_config(&default_tuning_path());
    let (controller, feed) = PlaybackController::new(tuning);

    let (rate, channels) = load_wav(Path::new(&opts.path))?;
    let frames = channels.first().map(|c| c.len()).unwrap_or(0);
    log::info!(
        "loaded {:?}: {} Hz, {} channels, {} frames ({:.1}s)",
        opts.path,
        rate,
        channels.len(),
        frames,
        frames as f64 / rate as f64
    );
    let model = BufferModel::new(rate, channels)?;
    controller.add_model(Arc::new(model))?;

    if let Some((start, end)) = opts.selection {
        controller.set_selections(vec![Selection::new(start, end)]);
        controller.set_play_selection_mode(true);
    }
    controller.set_play_loop_mode(opts.looping);

    let prefs = OutputPrefs {
        device: opts.device.clone(),
        sample_rate: Some(rate),
        block_frames: None,
    };
    let handle = start_output(&controller, feed, &prefs)?;

    // After device negotiation, so the stretcher is built at the target rate
    if let Some(ratio) = opts.stretch {
        controller.set_time_stretch(ratio);
    }
    log::info!(
        "output running at {} Hz, {} frame blocks (~{:.1}ms)",
        handle.sample_rate(),
        handle.block_frames(),
        handle.latency_ms()
    );

    let events = controller.events();
    controller.play(0);

    let source_rate = controller.source_rate().unwrap_or(rate);
    loop {
        std::thread::sleep(Duration::from_millis(200));
        for event in events.try_iter() {
            match event {
                EngineEvent::PlaybackFinished => log::info!("finished"),
                other => log::info!("engine event: {:?}", other),
            }
        }
        let pos = controller.position();
        print!(
            "\r{:>10.2}s / {:.2}s ",
            pos as f64 / source_rate as f64,
            controller.material_end() as f64 / source_rate as f64
        );
        use std::io::Write;
        let _ = std::io::stdout().flush();

        if !controller.is_playing() && !opts.looping {
            break;
        }
    }
    println!();

    drop(handle);
    log::info!("aulos-play exiting");
    Ok(())
}
