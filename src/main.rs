/*
 * linpama - Package transaction engine for Arch Linux front ends.
 * Copyright (C) 2025  linpama contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

use linpama::aur::{BuildRecipe, Severity};
use linpama::search::{RemoteStatus, ResultPages};
use linpama::transaction::TransactionSnapshot;
use linpama::{
    logging, Config, CredentialResponse, Event, Preferences, ReviewDecision, SearchAggregator,
    SearchSession, Session, Supervisor, TransactionIntent, TransactionState,
};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Copyright (C) 2025  linpama contributors\n",
    "License GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>\n\n",
    "This is free software; you are free to change and redistribute it.\n",
    "There is NO WARRANTY, to the extent permitted by law."
);

#[derive(Parser)]
#[command(name = "linpama")]
#[command(version)]
#[command(long_version = LONG_VERSION)]
#[command(about = "Search, install and remove Arch Linux packages, including from the AUR.")]
struct Cli {
    /// Verbose diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also append diagnostics to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search the sync repositories (and optionally the AUR)
    Search {
        query: String,
        /// Include AUR results
        #[arg(short = 'A', long)]
        aur: bool,
        /// Result page to show
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Install a package, or build it from the AUR
    Install {
        package: String,
        /// Build from the AUR after reviewing its PKGBUILD
        #[arg(short = 'A', long)]
        aur: bool,
    },
    /// Remove a package with its unneeded dependencies
    Remove { package: String },
    /// Show or change the first-run warning setting
    Warning {
        #[arg(long, conflicts_with = "enable")]
        disable: bool,
        #[arg(long)]
        enable: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load();
    if cli.log_file.is_some() {
        config.logging.file = cli.log_file.clone();
    }
    logging::init_from_config(&config.logging, cli.verbose);
    config.validate()?;

    match cli.command {
        Command::Search { query, aur, page } => search(&config, &query, aur, page).await,
        Command::Install { package, aur } => {
            first_run_warning();
            let intent = if aur {
                TransactionIntent::aur_build(package)
            } else {
                TransactionIntent::install(package)
            };
            run_transaction(&config, intent).await
        }
        Command::Remove { package } => {
            first_run_warning();
            run_transaction(&config, TransactionIntent::remove(package)).await
        }
        Command::Warning { disable, enable } => warning_setting(disable, enable),
    }
}

fn spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.cyan} {msg}")?,
    );
    Ok(pb)
}

async fn search(config: &Config, query: &str, include_aur: bool, page: usize) -> Result<()> {
    if query.trim().chars().count() < config.search.min_query_len {
        bail!(
            "query must be at least {} characters",
            config.search.min_query_len
        );
    }

    let aggregator = Arc::new(SearchAggregator::from_config(config)?);
    let mut session = SearchSession::new(aggregator, config);

    let pb = spinner()?;
    pb.set_message(format!("searching for '{}'...", query));
    pb.enable_steady_tick(std::time::Duration::from_millis(config.transaction.tick_ms));
    let event = session.search_now(query, include_aur).await;
    pb.finish_and_clear();

    let outcome = match event {
        Some(Event::SearchCompleted(outcome)) => outcome,
        Some(Event::SearchFailed { reason, .. }) => return Err(anyhow!(reason)),
        _ => bail!("search produced no result"),
    };

    if let RemoteStatus::Degraded(kind) = outcome.remote {
        println!(
            "{}",
            style(format!(":: AUR unavailable ({}), showing repository results only", kind)).yellow()
        );
    }
    if outcome.skipped_lines > 0 {
        tracing::debug!("{} index line(s) could not be parsed", outcome.skipped_lines);
    }

    let pages = ResultPages::new(outcome.records, config.search.batch_size);
    if pages.total() == 0 {
        println!("{}", style(":: no packages found.").yellow());
        return Ok(());
    }

    let mut t = Table::new();
    t.load_preset(UTF8_FULL);
    t.set_header(vec!["repo", "package", "version", "description"]);
    for record in pages.page(page) {
        let version = if record.installed() {
            format!("{} [installed]", record.version())
        } else {
            record.version().to_string()
        };
        t.add_row(vec![
            record.repository().to_string(),
            record.name().to_string(),
            version,
            record.description().to_string(),
        ]);
    }
    println!("{t}");
    println!(
        "{}",
        style(format!(
            ":: page {} of {} ({} packages)",
            page.max(1),
            pages.page_count(),
            pages.total()
        ))
        .bold()
    );
    Ok(())
}

async fn run_transaction(config: &Config, intent: TransactionIntent) -> Result<()> {
    let (mut supervisor, mut events) =
        Supervisor::new(config, Session::new(config.privilege.clone()));
    let mut interrupts = signal(SignalKind::interrupt())?;
    let term = Term::stderr();
    let pb = spinner()?;

    let package = intent.package_name.clone();
    supervisor.submit(intent)?;

    let success = loop {
        let mut finished = None;

        while let Ok(event) = events.try_recv() {
            match event {
                Event::LogAppended(line) => pb.println(line),
                Event::ProgressTick => pb.tick(),
                Event::TransactionStateChanged(snapshot) => pb.set_message(describe(&snapshot)),
                Event::CredentialRequested { package } => {
                    let response = pb.suspend(|| prompt_password(&term, &package));
                    supervisor.provide_credential(response)?;
                }
                Event::ReviewRequested { recipe } => {
                    let decision = pb.suspend(|| review_recipe(&term, &recipe));
                    supervisor.review(decision)?;
                }
                Event::TransactionCompleted { success, .. } => finished = Some(success),
                Event::SearchCompleted(_) | Event::SearchFailed { .. } => {}
            }
        }

        if let Some(success) = finished {
            break Some(success);
        }

        match supervisor.state() {
            TransactionState::Idle => break None,
            state if state.has_child() => {
                tokio::select! {
                    _ = supervisor.pump() => {}
                    _ = interrupts.recv() => supervisor.cancel()?,
                }
            }
            state => bail!("transaction stalled while {}", state),
        }
    };
    pb.finish_and_clear();

    match success {
        Some(true) => {
            println!("{}", style(format!(":: {} done.", package)).green().bold());
            Ok(())
        }
        Some(false) => bail!("transaction for {} failed", package),
        None => {
            println!("{}", style(":: cancelled.").yellow());
            Ok(())
        }
    }
}

fn describe(snapshot: &TransactionSnapshot) -> String {
    let target = snapshot
        .intent
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    match snapshot.phase {
        Some(phase) => format!("{} ({}): {}", snapshot.state, phase, target),
        None => format!("{}: {}", snapshot.state, target),
    }
}

fn prompt_password(term: &Term, package: &str) -> CredentialResponse {
    let _ = term.write_line(&format!(
        "{} administrator password required for {}",
        style("::").bold().cyan(),
        style(package).bold()
    ));
    let _ = term.write_str("password: ");
    match term.read_secure_line() {
        Ok(secret) => CredentialResponse::Provided(secret),
        Err(_) => CredentialResponse::Cancelled,
    }
}

fn review_recipe(term: &Term, recipe: &BuildRecipe) -> ReviewDecision {
    let _ = term.write_line(&format!(
        "\n{} PKGBUILD for {} (sha256 {})",
        style("::").bold().cyan(),
        style(recipe.package()).bold(),
        recipe.digest()
    ));
    for (idx, line) in recipe.text().lines().enumerate() {
        let _ = term.write_line(&format!("{:>4} {}", style(idx + 1).dim(), line));
    }

    if !recipe.findings().is_empty() {
        let _ = term.write_line(&format!("\n{}", style("review notes:").bold()));
        for finding in recipe.findings() {
            let label = match finding.severity {
                Severity::Critical | Severity::High => style(finding.severity.to_string()).red().bold(),
                Severity::Medium => style(finding.severity.to_string()).yellow(),
                Severity::Low => style(finding.severity.to_string()).dim(),
            };
            let location = finding
                .line
                .map(|l| format!("line {}", l))
                .unwrap_or_else(|| "recipe".to_string());
            let _ = term.write_line(&format!("  [{}] {}: {}", label, location, finding.description));
        }
    }

    let _ = term.write_str(&format!("\n{} build and install? [y/N] ", style("::").bold().cyan()));
    match term.read_line() {
        Ok(answer) if matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") => {
            ReviewDecision::Proceed
        }
        _ => ReviewDecision::Cancel,
    }
}

fn first_run_warning() {
    let Some(prefs) = Preferences::open_default() else {
        return;
    };
    if !prefs.show_warning() {
        return;
    }
    println!(
        "{}",
        style(":: linpama runs pacman and makepkg with administrator rights.").yellow().bold()
    );
    println!(
        "{}",
        style(":: AUR packages are user-produced; read every PKGBUILD before building it.").yellow()
    );
    println!(
        "{}",
        style(":: run `linpama warning --disable` to stop showing this notice.").dim()
    );
}

fn warning_setting(disable: bool, enable: bool) -> Result<()> {
    let prefs = Preferences::open_default()
        .ok_or_else(|| anyhow!("cannot determine the configuration directory"))?;

    if disable || enable {
        prefs.set_show_warning(enable)?;
    }
    let state = if prefs.show_warning() { "shown" } else { "hidden" };
    println!(":: first-run warning is {} ({})", state, prefs.path().display());
    Ok(())
}
