use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use halalseq_rs::{
    detect_samples, estimate_memory, load_database, AnalysisConfig, AnalysisContext, AnalysisPipeline,
    ProgressEvent, ReferenceDatabase,
};

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Species identification and halal verdicts for food-sample sequencing reads.
#[derive(Parser, Debug)]
#[command(name = "halalseq-rs", version, about)]
struct Args {
    /// Classification index file (.idx)
    #[arg(short, long)]
    index: PathBuf,

    /// JSON analysis configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reservoir-sample large inputs
    #[arg(long)]
    subsample: bool,

    #[arg(long)]
    subsample_cap: Option<usize>,

    /// Minimum fraction of confirmed k-mers to assign a read
    #[arg(long)]
    acceptance_threshold: Option<f64>,

    /// Haram weight percentage above which a sample fails
    #[arg(long)]
    haram_threshold: Option<f64>,

    #[arg(long)]
    min_agreement: Option<f64>,

    #[arg(long)]
    max_unmatched: Option<f64>,

    #[arg(long)]
    bootstrap_draws: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Skip unreadable samples instead of stopping
    #[arg(long)]
    keep_going: bool,

    /// Print reports as JSON
    #[arg(long)]
    json: bool,

    /// Print the reference species, markers and amplicon coverage before analysing
    #[arg(long)]
    show_database: bool,

    /// Cancel the run after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// FASTQ/FASTA files, optionally gzipped; mates are paired automatically
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl Args {
    fn config(&self) -> Result<AnalysisConfig, halalseq_rs::error::ConfigError> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::from_json_file(path)?,
            None => AnalysisConfig::default(),
        };
        config.subsample |= self.subsample;
        config.continue_on_file_error |= self.keep_going;
        if let Some(v) = self.subsample_cap {
            config.subsample_cap = v;
        }
        if let Some(v) = self.acceptance_threshold {
            config.acceptance_threshold = v;
        }
        if let Some(v) = self.haram_threshold {
            config.verdict.haram_threshold_pct = v;
        }
        if let Some(v) = self.min_agreement {
            config.verdict.min_agreement = v;
        }
        if let Some(v) = self.max_unmatched {
            config.verdict.max_unmatched_pct = v;
        }
        if let Some(v) = self.bootstrap_draws {
            config.estimator.bootstrap_draws = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn spinner(color: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_strings(TICKS)
        .template(&format!("{{spinner:.{}}} {{msg}}", color))
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb
}

/// Species table, marker table, then amplicon lengths per species and marker
/// (`-` where the panel has no reference).
fn database_tables(db: &ReferenceDatabase) -> String {
    let mut out = format!("# {}\n", db.summary());
    out.push_str("species\tname\tstatus\tmito_copies\n");
    for s in &db.species {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            s.id, s.common_name, s.status, s.mito_copy_number
        ));
    }
    out.push_str("\nmarker\tforward_primer\treverse_primer\n");
    for m in &db.markers {
        out.push_str(&format!("{}\t{}\t{}\n", m.id, m.forward_primer, m.reverse_primer));
    }
    out.push_str("\namplicon_len");
    for m in &db.markers {
        out.push('\t');
        out.push_str(&m.id);
    }
    out.push('\n');
    for (s, species) in db.species.iter().enumerate() {
        out.push_str(&species.id);
        for m in 0..db.markers.len() {
            let cell = db
                .reference(s, m)
                .map_or_else(|| "-".to_string(), |r| r.amplicon_len.to_string());
            out.push('\t');
            out.push_str(&cell);
        }
        out.push('\n');
    }
    out
}

fn timed_out(started: Instant, limit: Option<Duration>) -> bool {
    limit.is_some_and(|l| started.elapsed() >= l)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match args.config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    if args.show_database {
        match load_database(&args.index) {
            Ok(db) => print!("{}", database_tables(&db)),
            Err(e) => {
                eprintln!("Cannot read database: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    // 1. Group input files into samples
    let pb = spinner("blue");
    pb.set_message("Detecting samples...");
    let samples = detect_samples(&args.files);
    pb.finish_with_message(format!("Found {} sample(s).", samples.len()));

    for sample in &samples {
        match estimate_memory(sample) {
            Ok(est) => {
                let note = if !config.subsample && est.estimated_ram_mb > config.ram_budget_mb {
                    " (over budget, consider --subsample)"
                } else {
                    ""
                };
                println!(
                    "  {}: ~{} reads, ~{} MB{}",
                    sample.name, est.estimated_reads, est.estimated_ram_mb, note
                );
            }
            Err(e) => println!("  {}: {}", sample.name, e),
        }
    }

    // 2. Run the pipeline, polling its status
    let pipeline = AnalysisPipeline::new();
    if let Err(e) = pipeline.start(AnalysisContext {
        samples,
        index_path: args.index.clone(),
        config,
    }) {
        eprintln!("Cannot start analysis: {}", e);
        return ExitCode::FAILURE;
    }
    let events = pipeline.events();

    let pb = spinner("green");
    pb.enable_steady_tick(Duration::from_millis(100));
    let started = Instant::now();
    let limit = args.timeout.map(Duration::from_secs);
    let mut timed_out_run = false;
    while pipeline.is_running() {
        if !timed_out_run && timed_out(started, limit) {
            timed_out_run = true;
            pb.println(format!("Timeout of {}s reached, cancelling...", args.timeout.unwrap_or_default()));
            pipeline.cancel();
        }
        for event in events.try_iter() {
            match event {
                ProgressEvent::Warning(w) => pb.println(format!("warning: {}", w)),
                ProgressEvent::SampleFinished { name, verdict, .. } => {
                    pb.println(format!("{}: {}", name, verdict))
                }
                ProgressEvent::SampleFailed { message, .. } => pb.println(format!("error: {}", message)),
                _ => {}
            }
        }
        let status = pipeline.status();
        pb.set_message(format!(
            "[{}/{}] {} ({}%), {} reads",
            (status.sample_index + 1).min(status.sample_count),
            status.sample_count,
            status.state.label(),
            status.state.progress_percent(),
            status.reads_processed
        ));
        thread::sleep(Duration::from_millis(100));
    }
    let outcome = pipeline.wait();
    for event in events.try_iter() {
        if let ProgressEvent::Warning(w) = event {
            pb.println(format!("warning: {}", w));
        }
    }
    pb.finish_with_message(format!("Analysed {} sample(s).", outcome.reports.len()));

    // 3. Reports
    if args.json {
        match serde_json::to_string_pretty(&outcome.reports) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Cannot serialise reports: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        for report in &outcome.reports {
            println!("{}", report);
        }
    }

    for failure in &outcome.failures {
        eprintln!("skipped: {}", failure);
    }
    if outcome.cancelled {
        eprintln!("Analysis cancelled.");
    }
    match outcome.error {
        Some(e) => {
            eprintln!("Analysis failed: {}", e);
            ExitCode::FAILURE
        }
        None if outcome.cancelled && timed_out_run => ExitCode::FAILURE,
        None => ExitCode::SUCCESS,
    }
}
