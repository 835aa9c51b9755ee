//! Shared helpers: logging setup and debug formatting.

use std::fs::File;
use std::path::{Path, PathBuf};

/// Initialize file-based tracing output.
///
/// Honors `RUST_LOG` when set, defaulting to `info`. Safe to call more than
/// once; later calls keep the first subscriber.
pub fn init_file_logging(name: &str) -> PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_dir = Path::new("logs");
    let _ = std::fs::create_dir_all(log_dir);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let log_path = log_dir.join(format!("{name}_{timestamp}.log"));

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    if let Ok(log_file) = File::create(&log_path) {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::new(&filter))
            .with(fmt::layer().with_writer(log_file).with_ansi(false))
            .try_init();
    }

    log_path
}

/// Summary statistics for a float buffer, for debug logging.
pub(crate) fn vector_stats(data: &[f32]) -> String {
    if data.is_empty() {
        return "len=0".to_string();
    }
    let n = data.len() as f64;
    let mean: f64 = data.iter().map(|&x| x as f64).sum::<f64>() / n;
    let variance: f64 = data
        .iter()
        .map(|&x| {
            let d = x as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let min = data.iter().copied().fold(f32::INFINITY, f32::min);
    let max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    format!(
        "len={}, mean={:.6}, std={:.6}, min={:.6}, max={:.6}",
        data.len(),
        mean,
        variance.sqrt(),
        min,
        max
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_report_moments() {
        let stats = vector_stats(&[1.0, -1.0, 1.0, -1.0]);
        assert!(stats.contains("len=4"));
        assert!(stats.contains("mean=0.000000"));
        assert!(stats.contains("std=1.000000"));
    }

    #[test]
    fn empty_buffer_is_reported() {
        assert_eq!(vector_stats(&[]), "len=0");
    }
}
