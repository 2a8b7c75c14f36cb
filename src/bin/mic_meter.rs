//! Microphone meter
//!
//! Opens the default microphone with the session constraints and draws the
//! spectral level in the terminal. Useful for checking device and level
//! before a practice run.

use lingolive::capture::{start_capture, CaptureConfig};
use lingolive::visual::LevelMeter;
use std::io::Write;

const BAR_WIDTH: usize = 40;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let (mut chunks, handle) = start_capture(&CaptureConfig::default())?;
    let mut meter = LevelMeter::new();
    println!("Capturing from the default microphone. Ctrl-C to exit.");

    while let Some(chunk) = chunks.blocking_recv() {
        let level = meter.level(&chunk);
        let filled = (((level / 2.0) * BAR_WIDTH as f32) as usize).min(BAR_WIDTH);
        let mut bar = String::with_capacity(BAR_WIDTH);
        for i in 0..BAR_WIDTH {
            bar.push(if i < filled { '█' } else { '░' });
        }
        eprint!("\r[{}] {:.3}", bar, level);
        let _ = std::io::stderr().flush();
    }

    handle.stop();
    Ok(())
}
