/// Gapless playback check
/// Feeds a 24 kHz WAV file through the playback scheduler in randomly sized,
/// randomly delayed chunks, the way speech arrives from the service. Any gap
/// or click you hear is a scheduling bug.
///
/// Usage: playback_test <file.wav> [--interrupt-after <seconds>]
use anyhow::{bail, Context};
use counsel_live::codec::{encode_frame, AudioFrame, OUTPUT_SAMPLE_RATE};
use counsel_live::device::AudioBackend;
use counsel_live::mixer::OutputEngine;
use counsel_live::playback::{ChunkOutcome, PlaybackScheduler};
use counsel_live::pulse::PulseBackend;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn read_mono(path: &str) -> anyhow::Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("cannot open {}", path))?;
    let spec = reader.spec();
    if spec.sample_rate != OUTPUT_SAMPLE_RATE {
        bail!(
            "{} is {} Hz, expected {} Hz",
            path,
            spec.sample_rate,
            OUTPUT_SAMPLE_RATE
        );
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let channels = spec.channels.max(1) as usize;
    Ok(interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(path) = args.get(1) else {
        bail!("usage: playback_test <file.wav> [--interrupt-after <seconds>]");
    };
    let interrupt_after = match args.get(2).map(String::as_str) {
        Some("--interrupt-after") => {
            let secs: f64 = args
                .get(3)
                .context("--interrupt-after needs a value")?
                .parse()
                .context("--interrupt-after must be a number of seconds")?;
            Some(Duration::from_secs_f64(secs))
        }
        Some(other) => bail!("unknown argument {}", other),
        None => None,
    };

    let samples = read_mono(path)?;
    println!(
        "Playing {} ({:.1}s) in jittered chunks",
        path,
        samples.len() as f64 / OUTPUT_SAMPLE_RATE as f64
    );

    let backend = PulseBackend::new("counsel-live-playback-test");
    let device = backend.open_output(OUTPUT_SAMPLE_RATE)?;
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
    let (faults_tx, mut faults_rx) = mpsc::unbounded_channel();
    let engine = OutputEngine::spawn(device, OUTPUT_SAMPLE_RATE, finished_tx, faults_tx)?;
    let mut scheduler = PlaybackScheduler::new(engine.timeline());

    let mut rng = rand::rng();
    let started = Instant::now();
    let mut offset = 0;
    let mut chunks = 0;
    let mut interrupted = false;

    while offset < samples.len() {
        // 40 to 200 ms of audio per chunk, delivered a little faster than real time.
        let len = rng.random_range(960..4800).min(samples.len() - offset);
        let frame = AudioFrame::new(samples[offset..offset + len].to_vec(), OUTPUT_SAMPLE_RATE);
        offset += len;

        if let ChunkOutcome::Dropped(reason) = scheduler.on_audio_chunk(&encode_frame(&frame)) {
            bail!("chunk {} was dropped: {}", chunks, reason);
        }
        chunks += 1;

        if let Some(after) = interrupt_after {
            if !interrupted && started.elapsed() >= after {
                let stopped = scheduler.on_interrupted();
                let secs = after.as_secs_f64();
                println!("Interrupted after {:.1}s, {} sources stopped", secs, stopped);
                interrupted = true;
            }
        }

        let delay = frame.duration() * rng.random_range(0.2..0.9);
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        while let Ok(id) = finished_rx.try_recv() {
            scheduler.on_source_finished(id);
        }
        if let Ok(e) = faults_rx.try_recv() {
            bail!("playback device failed: {}", e);
        }
    }

    while scheduler.pending() > 0 {
        match finished_rx.recv().await {
            Some(id) => scheduler.on_source_finished(id),
            None => break,
        }
    }

    println!("Scheduled {} chunks", chunks);
    engine.shutdown().await;
    Ok(())
}
