mod export;
mod reader;

use clap::{Parser, Subcommand};
use emvscan::batch;
use emvscan::{CapturedKey, RocaAnalyzer, ScanAbort, ScanContext, TransactionWorkflow};
use log::LevelFilter;
use log::{error, info, warn};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use std::error::Error;
use std::path::PathBuf;

use export::{load_exports, YamlSessionSink};
use reader::PcscTransport;

#[derive(Parser)]
#[command(name = "scanterminal")]
#[command(about = "EMV contactless card scanner with ROCA key analysis")]
#[command(version)]
struct Cli {
    /// log4rs configuration file
    #[arg(long, default_value = "config/log4rs.yaml")]
    log_config: String,

    /// Scan settings
    #[arg(short, long, default_value = "config/settings.yaml", global = true)]
    settings: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the card on the first PC/SC reader
    Scan {
        /// Print all read tags after the scan
        #[arg(long)]
        print_tags: bool,

        /// Directory for scan session exports
        #[arg(short, long, default_value = "scans")]
        output: PathBuf,
    },
    /// Re-run ROCA analysis over exported scan sessions
    Analyze {
        directory: PathBuf,

        /// Worker threads, 0 for one per CPU
        #[arg(short, long)]
        workers: Option<usize>,

        /// Factorization time budget per key
        #[arg(long)]
        budget_ms: Option<u64>,
    },
}

fn init_logging(log_config: &str) {
    if let Err(err) = log4rs::init_file(log_config, Default::default()) {
        let stdout = ConsoleAppender::builder().build();
        let config = Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info));

        match config {
            Ok(config) => {
                if log4rs::init_config(config).is_ok() {
                    warn!("Could not load {} ({}), logging to console", log_config, err);
                }
            }
            Err(config_err) => eprintln!("Logging unavailable: {}", config_err),
        }
    }
}

fn scan(context: &ScanContext, print_tags: bool, output: PathBuf) -> Result<(), Box<dyn Error>> {
    let mut transport = PcscTransport::new()?;
    let mut sink = YamlSessionSink::new(output)?;

    let report = TransactionWorkflow::new(context, &mut transport, ScanAbort::new())?
        .with_sink(&mut sink)
        .run()?;

    if print_tags {
        let censor = context.settings.censor_sensitive_fields;
        for entry in report.session.tags.iter() {
            println!(
                "{} - {}: {}",
                entry.tag,
                context.tags.name(entry.tag.as_str()),
                context
                    .tags
                    .display_value(entry.tag.as_str(), &entry.raw_value, censor)
            );
        }
    }

    for (key, finding) in report.keys.iter().zip(report.findings.iter()) {
        info!(
            "{} {} bit key (recovered: {}): vulnerable {}, {:?} confidence",
            key.tag_source, key.key_size_bits, key.recovered, finding.is_vulnerable, finding.confidence
        );
    }

    Ok(())
}

fn analyze(
    context: &ScanContext,
    directory: PathBuf,
    workers: Option<usize>,
    budget_ms: Option<u64>,
) -> Result<(), Box<dyn Error>> {
    let mut roca_settings = context.settings.roca.clone();
    if let Some(workers) = workers {
        roca_settings.batch_workers = workers;
    }
    if let Some(budget_ms) = budget_ms {
        roca_settings.factorization_budget_ms = budget_ms;
    }
    let analyzer = RocaAnalyzer::new(&roca_settings);

    let exports = load_exports(&directory)?;
    let mut sessions: Vec<&str> = Vec::new();
    let mut keys: Vec<CapturedKey> = Vec::new();
    for export in exports.iter() {
        for key in export.keys.iter() {
            sessions.push(&export.session_id);
            keys.push(key.clone());
        }
    }

    info!("Loaded {} keys from {} sessions", keys.len(), exports.len());

    let findings = batch::analyze_keys(&analyzer, &keys, roca_settings.batch_workers);

    let mut vulnerable = 0;
    for (session_id, finding) in sessions.iter().zip(findings.iter()) {
        if !finding.is_vulnerable {
            continue;
        }

        vulnerable += 1;
        match &finding.factorization {
            Some(factors) => warn!(
                "{} {}: vulnerable ({:?}), factored with {:?} in {} ms",
                session_id, finding.tag_source, finding.confidence, factors.method, factors.elapsed_ms
            ),
            None => warn!(
                "{} {}: vulnerable ({:?})",
                session_id, finding.tag_source, finding.confidence
            ),
        }
    }

    info!("{} of {} keys match the ROCA fingerprint", vulnerable, keys.len());

    Ok(())
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_config);

    let context = ScanContext::new(&cli.settings)?;

    match cli.command {
        Command::Scan { print_tags, output } => scan(&context, print_tags, output),
        Command::Analyze {
            directory,
            workers,
            budget_ms,
        } => analyze(&context, directory, workers, budget_ms),
    }
}

fn main() {
    std::process::exit(match run() {
        Ok(()) => 0,
        Err(err) => {
            error!("{}", err);
            eprintln!("{}", err);
            1
        }
    });
}
