//! Archive preparation tool.
//!
//! Allocates an archive file and writes its header.  The major-block count
//! is fitted to the requested file size; the resulting geometry is printed
//! so the operator can sanity-check retention before starting the daemon.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fa_core::BpmMask;
use fa_store::{Archive, HeaderParams};

#[derive(Parser)]
#[command(name = "fa-prepare")]
#[command(about = "Allocate and initialise an FA archive file")]
struct Cli {
    /// Archive file to create.  An existing file is overwritten.
    archive: PathBuf,

    /// Captured BPM ids, e.g. "0-255" or "1,3,10-20".
    #[arg(short, long)]
    mask: String,

    /// Archive file size in bytes; K, M, G and T suffixes are accepted.
    #[arg(short, long)]
    size: String,

    /// FA samples per BPM per major block.
    #[arg(long, default_value_t = 65_536)]
    major_samples: u32,

    /// Frames delivered per input block.
    #[arg(long, default_value_t = 256)]
    input_frames: u32,

    /// First decimation factor.
    #[arg(long, default_value_t = 64)]
    first_decimation: u32,

    /// Second decimation factor.
    #[arg(long, default_value_t = 256)]
    second_decimation: u32,

    /// Nominal sample frequency in Hz.
    #[arg(short, long, default_value_t = 10_072.0)]
    frequency: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let params = HeaderParams {
        file_size: parse_size(&cli.size)?,
        archive_mask: BpmMask::parse_ids(&cli.mask)?,
        major_sample_count: cli.major_samples,
        input_frame_count: cli.input_frames,
        first_decimation: cli.first_decimation,
        second_decimation: cli.second_decimation,
        sample_frequency: cli.frequency,
    };
    let header = Archive::create(&cli.archive, &params)
        .with_context(|| format!("creating {}", cli.archive.display()))?;
    println!("{header}");
    Ok(())
}

/// Parses a byte count with an optional K, M, G or T binary suffix.
fn parse_size(text: &str) -> Result<u64> {
    let (digits, shift) = match text.as_bytes().last() {
        Some(b'K') => (&text[..text.len() - 1], 10),
        Some(b'M') => (&text[..text.len() - 1], 20),
        Some(b'G') => (&text[..text.len() - 1], 30),
        Some(b'T') => (&text[..text.len() - 1], 40),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size '{text}'"))?;
    if value.leading_zeros() < shift {
        bail!("size '{text}' overflows");
    }
    Ok(value << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64M").unwrap(), 64 << 20);
        assert_eq!(parse_size("2T").unwrap(), 2 << 40);
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("999999999T").is_err());
    }
}
