use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use color_print::cformat;

use minitrace::analysis::{SessionAnalysis, analyze_session};
use minitrace::config::{Config, ConfigError};
use minitrace::device::Device;
use minitrace::run::{RunEnd, RunOptions, RunReport, TraceRun};
use minitrace::symbols::Symbols;
use minitrace::trace::{
    SegmentStats, TraceError, TraceReader, find_bases, render_event, render_stats, segment_base,
};

mod cli;

use cli::{AggregateArgs, Cli, Commands, DecodeArgs, RunArgs};

/// A run that ended for a reason other than the server finishing or the
/// user stopping it.
#[derive(Debug, thiserror::Error)]
#[error("trace run aborted: {0}")]
struct RunAborted(RunEnd);

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = Config::load(cli.config.as_deref())
        .map_err(anyhow::Error::from)
        .and_then(|config| match cli.command {
            Commands::Run(args) => handle_run(config, args),
            Commands::Decode(args) => handle_decode(args),
            Commands::Aggregate(args) => handle_aggregate(&config, args),
        });

    if let Err(e) = result {
        anstream::eprintln!("{}", cformat!("<red><bold>error:</></> {:#}", e));
        process::exit(exit_code(&e));
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

/// 2: unreadable trace data, 3: bad config, 4: aborted run, 1: anything else.
fn exit_code(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if cause.is::<TraceError>() {
            return 2;
        }
        if cause.is::<ConfigError>() {
            return 3;
        }
        if cause.is::<RunAborted>() {
            return 4;
        }
    }
    1
}

fn handle_run(mut config: Config, args: RunArgs) -> anyhow::Result<()> {
    if let Some(serial) = args.serial {
        config.serial = Some(serial);
    }
    if let Some(flags) = args.log_flags {
        config.log_flags = flags;
    }
    if let Some(output) = args.output {
        config.output_dir = output;
    }
    config.validate()?;

    let device: Arc<dyn Device> = Arc::new(config.adb());
    let mut options = RunOptions::from_config(&config, &args.package);
    options.duration = args.duration.map(Duration::from_secs);
    if args.no_logcat {
        options.logcat_filter = None;
    }

    let run = TraceRun::new(device, options);
    #[cfg(unix)]
    run.interrupt_on_signals()?;
    let report = run.run()?;
    print_report(&report);

    if report.end.is_failure() {
        return Err(RunAborted(report.end.clone()).into());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    anstream::println!(
        "{}",
        cformat!(
            "<bold>Run ended:</> {} <dim>({} server lines)</>",
            report.end,
            report.lines
        )
    );
    if report.servers_killed > 0 {
        anstream::println!("  killed {} trace server(s)", report.servers_killed);
    }
    for result in &report.sessions {
        match &result.analysis {
            Ok(analysis) => print_analysis(analysis),
            Err(e) => anstream::println!(
                "{}",
                cformat!("  <red>✗</> {}: analysis failed: {:#}", result.session.prefix, e)
            ),
        }
    }
    for failure in &report.extraction_failures {
        anstream::println!(
            "{}",
            cformat!(
                "  <red>✗</> {} (pid {}): retrieval failed: {}",
                failure.prefix,
                failure.pid,
                failure.error
            )
        );
    }
    for (socket, pid) in &report.abandoned {
        anstream::println!(
            "{}",
            cformat!("  <yellow>▲</> socket {} (pid {}) never selected a prefix", socket, pid)
        );
    }
    if let Some(path) = &report.line_log {
        anstream::println!("{}", cformat!("  <dim>server lines: {}</>", path.display()));
    }
    if let Some(path) = &report.logcat {
        anstream::println!("{}", cformat!("  <dim>device log: {}</>", path.display()));
    }
}

fn print_analysis(analysis: &SessionAnalysis) {
    anstream::println!(
        "{}",
        cformat!(
            "  <green>✓</> <bold>{}</>: {} segment(s), {} events, {} messages, {} idle snapshots",
            analysis.base,
            analysis.segments,
            analysis.events,
            analysis.messages,
            analysis.idle_snapshots
        )
    );
    for (segment, reason) in &analysis.failed_segments {
        anstream::println!(
            "{}",
            cformat!("    <yellow>▲</> {} stopped early: {}", segment.display(), reason)
        );
    }
    if analysis.unknown_methods > 0 {
        anstream::println!(
            "{}",
            cformat!(
                "    <yellow>▲</> {} method pointer(s) missing from symbols",
                analysis.unknown_methods
            )
        );
    }
    anstream::println!(
        "{}",
        cformat!(
            "    <dim>{} {}</>",
            analysis.messages_table.display(),
            analysis.idle_table.display()
        )
    );
}

fn handle_decode(args: DecodeArgs) -> anyhow::Result<()> {
    let symbols = match &args.symbols {
        Some(dir) => {
            let base = match &args.base {
                Some(base) => base.clone(),
                None => infer_base(&args.file)?,
            };
            Symbols::load(dir, &base)
                .with_context(|| format!("Failed to load symbols for {base}"))?
        }
        None => Symbols::default(),
    };

    let file = File::open(&args.file)
        .with_context(|| format!("Failed to open {}", args.file.display()))?;
    let mut reader = TraceReader::new(BufReader::new(file))?;
    let Some(header) = reader.header().copied() else {
        log::warn!("{} has no complete header", args.file.display());
        return Ok(());
    };

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    writeln!(
        out,
        "# version {} flags 0x{:08X} start {}",
        header.version, header.log_flags, header.start_ms
    )?;

    let mut stats = SegmentStats::default();
    let mut shown = 0;
    while let Some(event) = reader.next_event()? {
        if args.stats {
            stats.record(&event);
            continue;
        }
        if args.limit.is_some_and(|limit| shown >= limit) {
            break;
        }
        writeln!(out, "{}", render_event(&event, &symbols))?;
        shown += 1;
    }

    if args.stats {
        write!(out, "{}", render_stats(&stats, &symbols))?;
    }
    out.flush()?;
    Ok(())
}

fn infer_base(file: &Path) -> anyhow::Result<String> {
    file.file_name()
        .and_then(|name| name.to_str())
        .and_then(segment_base)
        .map(str::to_string)
        .with_context(|| {
            format!(
                "Can't tell the session prefix from {}; pass --base",
                file.display()
            )
        })
}

fn handle_aggregate(config: &Config, args: AggregateArgs) -> anyhow::Result<()> {
    let options = config.aggregate_options();
    let bases = match args.base {
        Some(base) => vec![base],
        None => find_bases(&args.dir)?,
    };
    anyhow::ensure!(
        !bases.is_empty(),
        "No sessions (no *info_t.log) in {}",
        args.dir.display()
    );

    if let [base] = bases.as_slice() {
        print_analysis(&analyze_session(&args.dir, base, &options)?);
        return Ok(());
    }

    let mut failed = 0;
    for base in &bases {
        match analyze_session(&args.dir, base, &options) {
            Ok(analysis) => print_analysis(&analysis),
            Err(e) => {
                anstream::eprintln!("{}", cformat!("<red>✗</> {}: {:#}", base, e));
                failed += 1;
            }
        }
    }
    anyhow::ensure!(failed == 0, "{failed} of {} session(s) failed", bases.len());
    Ok(())
}
