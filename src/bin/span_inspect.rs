//! span-inspect
//!
//! Reports on span and stripe metadata of a proxy cache without mounting it

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use span_cache::inspector::{clear_span, inspect_span, resolve_target, volumes, InspectDepth};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "span-inspect")]
#[command(about = "Inspect proxy cache spans and stripes")]
struct Args {
    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct Targets {
    /// Span files or devices, or storage lists naming spans
    #[arg(required = true)]
    targets: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List span headers and their stripe directories
    List {
        /// Also locate and reconcile every stripe's descriptor copies
        #[arg(long)]
        stripes: bool,
        #[command(flatten)]
        targets: Targets,
    },
    /// Stripe count and size per volume
    Volumes {
        #[command(flatten)]
        targets: Targets,
    },
    /// Zero the span header, discarding the span layout
    Clear {
        /// Confirm the destructive write
        #[arg(long)]
        yes: bool,
        #[command(flatten)]
        targets: Targets,
    },
}

impl Command {
    fn targets(&self) -> &[PathBuf] {
        match self {
            Command::List { targets, .. }
            | Command::Volumes { targets }
            | Command::Clear { targets, .. } => &targets.targets,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();

    let mut spans = Vec::new();
    for target in args.command.targets() {
        let resolved = resolve_target(target)
            .with_context(|| format!("cannot resolve target {}", target.display()))?;
        spans.extend(resolved);
    }

    match args.command {
        Command::List { stripes, .. } => {
            let depth = if stripes {
                InspectDepth::Stripe
            } else {
                InspectDepth::Span
            };
            let reports: Vec<_> = spans.iter().map(|p| inspect_span(p, depth)).collect();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    print!("{}", report);
                }
            }
        }
        Command::Volumes { .. } => {
            let reports: Vec<_> = spans
                .iter()
                .map(|p| inspect_span(p, InspectDepth::Span))
                .collect();
            for failed in reports.iter().filter(|r| !r.is_ok()) {
                eprintln!(
                    "{}: {}",
                    failed.path.display(),
                    failed.error.as_deref().unwrap_or("unusable")
                );
            }
            let summary = volumes(&reports);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for volume in &summary {
                    println!("{}", volume);
                }
            }
        }
        Command::Clear { yes, .. } => {
            if !yes {
                bail!("clear overwrites span headers; pass --yes to confirm");
            }
            for span in &spans {
                info!("Clearing {} permanently on disk", span.display());
                clear_span(span).with_context(|| format!("failed to clear {}", span.display()))?;
                println!("Cleared {}", span.display());
            }
        }
    }

    Ok(())
}
