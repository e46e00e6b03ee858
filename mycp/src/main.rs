use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mycp",
    version,
    about = "Copy a table between MySQL servers - dump-and-load without the dump file",
    long_about = "`mycp` streams rows from a source table and bulk-inserts them into a \
destination table over many parallel connections, without staging anything on disk.

A bounded queue sits between the single reader and the writer pool, so memory use \
stays flat even when the destination is slower than the source. With more than one \
writer the destination commit order is not the source row order; use --threads 1 if \
that matters.

EXAMPLES:
    # Copy db1.users to another host (same table name)
    mycp src-host/db1/users dst-host:3307/db2 --progress --summary

    # Copy into a differently named table, tolerating bad rows
    mycp src-host/db1/users dst-host/db1/users_copy --force

    # Custom SELECT feeding the copy
    mycp -q 'SELECT * FROM users WHERE active=1' src-host/db1/users dst-host/db1"
)]
struct Args {
    // Copy options
    /// Override SELECT query
    #[arg(short = 'q', long, value_name = "SQL", help_heading = "Copy options")]
    query: Option<String>,

    /// Number of writer threads, each with its own destination connection
    #[arg(
        short = 't',
        long,
        default_value = "16",
        value_name = "N",
        help_heading = "Copy options"
    )]
    threads: usize,

    /// Ignore insertion failures
    #[arg(long, help_heading = "Copy options")]
    force: bool,

    /// Crazy fast, super unsafe, not safe for prod
    ///
    /// Disables the binlog, unique checks and the RocksDB WAL on every writer
    /// connection. The destination server may refuse; that only logs a warning.
    #[arg(long, help_heading = "Copy options")]
    crazy: bool,

    /// Connection character set
    #[arg(
        long,
        default_value = "binary",
        value_name = "CHARSET",
        help_heading = "Copy options"
    )]
    charset: String,

    /// User name for the source and destination connections
    #[arg(short = 'u', long, value_name = "USER", help_heading = "Copy options")]
    user: Option<String>,

    /// Password for the source and destination connections
    #[arg(
        long,
        env = "MYSQL_PWD",
        hide_env_values = true,
        value_name = "PASSWORD",
        help_heading = "Copy options"
    )]
    password: Option<String>,

    // Batching & backpressure
    /// Soft flush threshold for a single INSERT batch
    ///
    /// A batch is handed to the writers once it grows past this size, so a batch
    /// can exceed it by up to one row. Accepts sizes like "512KiB", "4MiB".
    #[arg(
        long,
        default_value = "1MiB",
        value_name = "SIZE",
        help_heading = "Batching & backpressure"
    )]
    batch_size: bytesize::ByteSize,

    /// Maximum number of batches buffered between the reader and the writers
    ///
    /// When the buffer is full the reader blocks; this is what bounds memory use.
    #[arg(
        long,
        default_value = "100",
        value_name = "N",
        help_heading = "Batching & backpressure"
    )]
    queue_depth: usize,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Sets the delay between progress updates (default 10s)
    ///
    /// If specified, --progress flag is implied. This option accepts a human
    /// readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of runtime worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source and destination: host[:port]/db/table host[:port]/db[/table]
    #[arg()]
    specs: Vec<String>,
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> Result<common::copy::Summary> {
    if args.specs.len() != 2 {
        return Err(anyhow!(
            "You must specify a source and a destination: host[:port]/db/table host[:port]/db[/table]"
        ));
    }
    let source = common::target::Target::parse(&args.specs[0])?;
    let mut destination = common::target::Target::parse(&args.specs[1])?;
    let src_table = source
        .table
        .clone()
        .ok_or_else(|| anyhow!("no table name in source {:?}", &args.specs[0]))?;
    let dst_table = destination
        .table
        .get_or_insert_with(|| src_table.clone())
        .clone();

    let settings = common::copy::Settings {
        writers: args.threads,
        queue_depth: args.queue_depth,
        batch_size: args.batch_size.as_u64() as usize,
        tolerant: args.force,
    };
    settings.validate().map_err(|error| anyhow!(error))?;
    tracing::debug!("copy settings: {:?}", &settings);

    let options = common::mysql::ConnectOptions {
        user: args.user.clone(),
        password: args.password.clone(),
        charset: args.charset.clone(),
        crazy: args.crazy,
    };
    let mut src_conn = common::mysql::connect(&source, &options).await?;
    {
        // the destination connection is only needed to replay the schema; the
        // writers open their own
        let mut dst_conn = common::mysql::connect(&destination, &options).await?;
        common::schema::transfer(&mut src_conn, &mut dst_conn, &src_table, &dst_table).await?;
    }

    let query = args
        .query
        .clone()
        .unwrap_or_else(|| format!("SELECT * FROM {src_table}"));
    let cursor = common::mysql::MysqlSource::select(&mut src_conn, &query).await?;
    let connector = common::mysql::MysqlConnector::new(destination, options);
    let escape = connector.clone();
    match common::copy::copy(
        cursor,
        Arc::new(connector),
        &escape,
        &dst_table,
        &settings,
        common::prog_track(),
    )
    .await
    {
        Ok(summary) => Ok(summary),
        Err(error) => {
            if args.summary {
                let summary = error.summary();
                return Err(anyhow!("{}\n\n{}", error, summary));
            }
            Err(error.into())
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(
        if args.progress || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_delay: args.progress_delay.clone(),
            })
        } else {
            None
        },
        output,
        runtime,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
