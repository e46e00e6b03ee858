//! Shared library for the mycp tools: the copy pipeline (batching, bounded
//! handoff, writer pool), the MySQL collaborators, and the CLI harness that
//! sets up tracing, the tokio runtime and progress reporting.

use std::time::Duration;

pub mod batch;
pub mod config;
pub mod copy;
pub mod mysql;
pub mod progress;
pub mod schema;
pub mod target;
#[cfg(test)]
pub mod testutils;
pub mod writer;

pub use config::{OutputConfig, ProgressSettings, RuntimeConfig};

static PROG_TRACK: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

/// Process-wide pipeline counters, shared by the producer and all writers.
pub fn prog_track() -> &'static progress::Progress {
    &PROG_TRACK
}

const DEFAULT_PROGRESS_DELAY: Duration = Duration::from_secs(10);

fn parse_progress_delay(settings: &ProgressSettings) -> Duration {
    match &settings.progress_delay {
        Some(text) => match humantime::parse_duration(text) {
            Ok(delay) => delay,
            Err(error) => {
                tracing::warn!(
                    "invalid progress delay {text:?} ({error}), using {}",
                    humantime::format_duration(DEFAULT_PROGRESS_DELAY)
                );
                DEFAULT_PROGRESS_DELAY
            }
        },
        None => DEFAULT_PROGRESS_DELAY,
    }
}

async fn progress_printer(delay: Duration) {
    let mut printer = progress::ProgressPrinter::new(prog_track());
    loop {
        tokio::time::sleep(delay).await;
        eprintln!("{}", printer.print());
    }
}

fn setup_tracing(output: &OutputConfig) {
    let default_directive = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

/// Runs `func` to completion on a fresh multi-thread runtime with tracing and
/// optional periodic progress reporting installed.
///
/// Prints the summary when requested and the error (with its chain) otherwise;
/// returns `None` on failure so the binary can pick the exit code.
pub fn run<Fut, SummaryT>(
    progress_settings: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<SummaryT>
where
    SummaryT: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<SummaryT>>,
{
    setup_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to build the tokio runtime: {error:#}");
            return None;
        }
    };
    let result = tokio_runtime.block_on(async {
        let progress_task = progress_settings.map(|settings| {
            let delay = parse_progress_delay(&settings);
            tokio::spawn(progress_printer(delay))
        });
        let result = func().await;
        if let Some(task) = &progress_task {
            task.abort();
        }
        result
    });
    match result {
        Ok(summary) => {
            if output.print_summary {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", error);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_delay_parsing() {
        let settings = ProgressSettings {
            progress_delay: Some("200ms".to_string()),
        };
        assert_eq!(parse_progress_delay(&settings), Duration::from_millis(200));
        let settings = ProgressSettings {
            progress_delay: Some("not-a-duration".to_string()),
        };
        assert_eq!(parse_progress_delay(&settings), DEFAULT_PROGRESS_DELAY);
        assert_eq!(
            parse_progress_delay(&ProgressSettings::default()),
            DEFAULT_PROGRESS_DELAY
        );
    }

    #[test]
    fn run_returns_the_summary() {
        let res = run(
            None,
            OutputConfig::default(),
            RuntimeConfig::default(),
            || async { Ok("done".to_string()) },
        );
        assert_eq!(res.as_deref(), Some("done"));
    }

    #[test]
    fn run_maps_errors_to_none() {
        let res: Option<String> = run(
            None,
            OutputConfig {
                quiet: true,
                ..Default::default()
            },
            RuntimeConfig::default(),
            || async { Err(anyhow::anyhow!("boom")) },
        );
        assert!(res.is_none());
    }
}
