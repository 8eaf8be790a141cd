use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use evfix::io::glob::expand_inputs;
use evfix::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Renumber, slim and merge partitioned ntuple containers
#[derive(Parser)]
#[command(name = "evfix")]
#[command(version)]
#[command(about = "Renumber, slim and merge partitioned ntuple containers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Args)]
struct BatchArgs {
    /// Input containers or glob patterns
    #[arg(required = true, value_name = "NTUPLE")]
    inputs: Vec<String>,

    /// Output directory
    #[arg(short, long, value_name = "DIR", default_value = "data")]
    outdir: PathBuf,

    /// Worker pool size (overrides config file; 0 = one per CPU)
    #[arg(short, long, value_name = "N")]
    workers: Option<usize>,

    /// Stop waiting for jobs after this many seconds
    #[arg(long, value_name = "SECS")]
    job_timeout_secs: Option<u64>,

    /// Write the batch report as JSON
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Merge all successful outputs into this container afterwards
    #[arg(long, value_name = "FILE")]
    merge_into: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Bkg,
    Nu,
    Pgun,
}

impl From<ModeArg> for SlimMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Bkg => Self::Bkg,
            ModeArg::Nu => Self::Nu,
            ModeArg::Pgun => Self::Pgun,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Offset event numbers by 10 x job number (`<base>_<job>_ana.ntuple.<ext>`)
    Fix(BatchArgs),

    /// Offset event numbers and set run numbers (`<base>_<run>_<job>_ana.ntuple.<ext>`)
    FixRun(BatchArgs),

    /// Keep selected tables, add event_uid and cut trigger primitives
    Slim {
        #[command(flatten)]
        batch: BatchArgs,

        /// Table selection
        #[arg(short, long, value_enum)]
        mode: ModeArg,
    },

    /// Merge containers into one, bounded by the fan-in limit
    Merge {
        /// Input containers or glob patterns
        #[arg(required = true, value_name = "NTUPLE")]
        inputs: Vec<String>,

        /// Output container
        #[arg(short, long, value_name = "FILE", default_value = "tfile_merged.root")]
        outfile: PathBuf,

        /// Maximum containers per merge call (overrides config file)
        #[arg(long, value_name = "N")]
        fan_in: Option<usize>,

        /// Concurrent merges per level (overrides config file)
        #[arg(long, value_name = "N")]
        merge_jobs: Option<usize>,
    },

    /// Count distinct event_uid values in event_summary and primitive tables
    CheckUid {
        #[arg(value_name = "NTUPLE")]
        container: String,
    },

    /// Print the largest simides timestamp per container and overall
    MaxTimestamp {
        #[arg(required = true, value_name = "NTUPLE")]
        inputs: Vec<String>,
    },
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let store: Arc<dyn ContainerStore> = Arc::new(BundleStore::new());

    match cli.command {
        Command::Fix(args) => run_batch(config, store, &args, Tool::Fix),
        Command::FixRun(args) => run_batch(config, store, &args, Tool::FixRun),
        Command::Slim { batch, mode } => run_batch(config, store, &batch, Tool::Slim(mode.into())),
        Command::Merge { inputs, outfile, fan_in, merge_jobs } => {
            config.fan_in = fan_in.unwrap_or(config.fan_in);
            config.merge_jobs = merge_jobs.unwrap_or(config.merge_jobs);
            config.validate()?;
            let inputs = expand_inputs(&inputs)?;
            println!("Merging {} files into {}", inputs.len(), outfile.display());
            merge_all(&config, store, &inputs, &outfile)
        }
        Command::CheckUid { container } => {
            let reader = store.open(&container)?;
            let counts = inspect::count_event_uids(reader.as_ref(), &config)?;
            println!("Events in EvSum: {}", counts.event_summary);
            for (table, n) in &counts.primitives {
                println!("Events in TPs ({table}): {n}");
            }
            Ok(())
        }
        Command::MaxTimestamp { inputs } => {
            let mut overall: Option<i64> = None;
            for path in expand_inputs(&inputs)? {
                let reader = store.open(&path.to_string_lossy())?;
                let ts = inspect::max_timestamp(reader.as_ref(), &config)?;
                match ts {
                    Some(ts) => println!("{} {ts}", path.display()),
                    None => println!("{} (empty)", path.display()),
                }
                overall = overall.max(ts);
            }
            match overall {
                Some(ts) => println!(">>> max_ts={ts} <<<"),
                None => println!(">>> max_ts=none <<<"),
            }
            Ok(())
        }
    }
}

#[derive(Clone, Copy)]
enum Tool {
    Fix,
    FixRun,
    Slim(SlimMode),
}

fn run_batch(mut config: PipelineConfig, store: Arc<dyn ContainerStore>, args: &BatchArgs, tool: Tool) -> Result<()> {
    if let Some(w) = args.workers {
        config.workers = if w == 0 { num_cpus::get().max(1) } else { w };
    }
    if args.job_timeout_secs.is_some() {
        config.job_timeout_secs = args.job_timeout_secs;
    }
    config.validate()?;

    let paths = expand_inputs(&args.inputs)?;
    let discovery = match tool {
        Tool::Fix => discover(&paths, KeyPattern::Job, &config.remote_rewrites),
        Tool::FixRun => discover(&paths, KeyPattern::RunJob, &config.remote_rewrites),
        Tool::Slim(_) => enumerate_inputs(&paths, &config.remote_rewrites),
    };

    if !discovery.no_match.is_empty() {
        println!("Found file names without job id:");
        for f in &discovery.no_match {
            println!("- {}", f.display());
        }
    }
    if discovery.has_collisions() {
        for (key, files) in &discovery.collisions {
            println!("Partition {key} is claimed by:");
            for f in files {
                println!("- {}", f.display());
            }
        }
        bail!("{} partition id(s) are claimed by more than one file", discovery.collisions.len());
    }
    println!("Found {} files to process", discovery.accepted.len());

    if !args.outdir.exists() {
        std::fs::create_dir_all(&args.outdir)
            .with_context(|| format!("create output directory {}", args.outdir.display()))?;
        println!("Created '{}'", args.outdir.display());
    }

    let (spec, renumber, naming) = match tool {
        Tool::Fix | Tool::FixRun => (TransformSpec::identity(), true, OutputNaming::Fixed),
        Tool::Slim(mode) => (TransformSpec::slim(mode)?, false, OutputNaming::Slim),
    };
    let config = Arc::new(config);
    let transformer = RecordTransformer::new(
        Arc::clone(&store),
        Arc::clone(&config),
        TransformPlan { spec, renumber, naming, outdir: args.outdir.clone() },
    );

    let started = Instant::now();
    let scheduler = Scheduler::new(config.workers).with_timeout(config.job_timeout_secs.map(Duration::from_secs));
    let outcomes = scheduler.run(Arc::new(transformer), &discovery.accepted, |outcome| match &outcome.result {
        JobResult::Done(path) => println!("File {} completed", path.display()),
        JobResult::Failed(e) => println!("{} generated an exception: {e}", outcome.key),
        JobResult::TimedOut => println!("{} timed out", outcome.key),
    })?;

    let report = BatchReport::new(&discovery, &outcomes, started.elapsed());
    report.print();
    if let Some(path) = &args.report {
        report.save_to_file(path)?;
        info!(path = %path.display(), "report written");
    }

    if let Some(target) = &args.merge_into {
        let outputs = report.outputs();
        if outputs.is_empty() {
            bail!("no successful outputs to merge");
        }
        merge_all(&config, store, &outputs, target)?;
    }
    Ok(())
}

fn merge_all(config: &PipelineConfig, store: Arc<dyn ContainerStore>, inputs: &[PathBuf], outfile: &Path) -> Result<()> {
    let primitive = Arc::new(ContainerMerger::new(Arc::clone(&store)));
    let merger = HierarchicalMerger::new(primitive, store, config.fan_in, config.merge_jobs)?;
    let summary = merger.merge(inputs, outfile)?;
    println!(
        "Merged {} files into {} ({} merge calls over {} levels)",
        inputs.len(),
        outfile.display(),
        summary.total_calls(),
        summary.levels()
    );
    Ok(())
}
