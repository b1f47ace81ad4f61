// SAVI Billing CLI
// run  : price a production batch, apply bundles, check payer rules
// runs : list stored runs
// rules: print the effective rule set

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use savi_billing::{
    format_brl, format_percentage, load_records_csv, load_records_sqlite, parse_execution_date,
    write_processed_csv, BillingOrchestrator, BillingResult, BillingRules, RecordFilter, RunMetadata,
    RunStore,
};

#[derive(Parser, Debug)]
#[command(name = "savi-billing", version)]
#[command(about = "TEA therapy billing: tariffs, monthly bundles and payer compliance")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bill a batch of production records
    Run(RunArgs),

    /// List billing runs saved in a store
    Runs {
        #[arg(long, env = "SAVI_STORE")]
        store: PathBuf,
    },

    /// Print the effective billing rules as JSON
    Rules {
        #[arg(long, env = "SAVI_RULES")]
        rules: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// CSV export of the producao table
    #[arg(long, conflicts_with = "sqlite", required_unless_present = "sqlite")]
    records: Option<PathBuf>,

    /// SQLite database with a producao table
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Roster (CSV or .xlsx/.xls) of patients with preferential pricing
    #[arg(long)]
    roster: Option<PathBuf>,

    /// Rules JSON; built-in rules when omitted
    #[arg(long, env = "SAVI_RULES")]
    rules: Option<PathBuf>,

    /// First execution date (inclusive)
    #[arg(long, value_parser = parse_date_arg)]
    from: Option<NaiveDate>,

    /// Last execution date (inclusive)
    #[arg(long, value_parser = parse_date_arg)]
    to: Option<NaiveDate>,

    #[arg(long)]
    payer: Option<String>,

    #[arg(long)]
    procedure: Option<String>,

    #[arg(long)]
    physician: Option<String>,

    /// Restrict to these patient ids (comma-separated)
    #[arg(long, value_delimiter = ',')]
    patients: Vec<String>,

    /// Bundle threshold override
    #[arg(long)]
    threshold: Option<i64>,

    /// Write processed records to this CSV
    #[arg(long)]
    export: Option<PathBuf>,

    /// Print the full result as JSON instead of the report
    #[arg(long)]
    json: bool,

    /// Save the run to this SQLite store
    #[arg(long, env = "SAVI_STORE")]
    store: Option<PathBuf>,
}

fn parse_date_arg(text: &str) -> std::result::Result<NaiveDate, String> {
    parse_execution_date(text).ok_or_else(|| format!("invalid date {:?}, expected dd/mm/yyyy or yyyy-mm-dd", text))
}

fn main() -> Result<()> {
    // Logs go to stderr so --json output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run_billing(args),
        Command::Runs { store } => list_runs(&store),
        Command::Rules { rules } => print_rules(rules.as_deref()),
    }
}

fn load_rules(path: Option<&Path>) -> Result<BillingRules> {
    match path {
        Some(path) => BillingRules::from_file(path),
        None => Ok(BillingRules::builtin()),
    }
}

fn run_billing(args: RunArgs) -> Result<()> {
    let mut rules = load_rules(args.rules.as_deref())?;
    if let Some(threshold) = args.threshold {
        rules.bundle = rules.bundle.with_threshold(threshold);
    }

    let (records, source) = match (&args.records, &args.sqlite) {
        (Some(csv), _) => (
            load_records_csv(csv).with_context(|| format!("Failed to load records from {:?}", csv))?,
            csv.display().to_string(),
        ),
        (None, Some(db)) => (
            load_records_sqlite(db).with_context(|| format!("Failed to load records from {:?}", db))?,
            db.display().to_string(),
        ),
        (None, None) => bail!("either --records or --sqlite is required"),
    };

    let mut filter = RecordFilter::new()
        .between(args.from, args.to)
        .cohort(args.patients.iter().map(String::as_str));
    filter.payer_company = args.payer;
    filter.procedure_name = args.procedure;
    filter.physician_name = args.physician;
    let records = filter.apply(&records)?;

    let orchestrator = BillingOrchestrator::new(rules)?;
    let result = orchestrator.run_with_roster(&records, args.roster.as_deref())?;

    if let Some(path) = &args.export {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        write_processed_csv(&result.processed_records, BufWriter::new(file))?;
    }

    let run_id = match &args.store {
        Some(path) => {
            let mut store = RunStore::open(path)?;
            let roster = args.roster.as_ref().map(|p| p.display().to_string());
            Some(store.save(&result, &RunMetadata::new(source, roster, &records))?)
        }
        None => None,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_report(&result);
        if let Some(path) = &args.export {
            println!("\n📤 Exported {} rows to {}", result.processed_records.len(), path.display());
        }
        if let Some(run_id) = run_id {
            println!("💾 Saved run {}", run_id);
        }
    }

    Ok(())
}

fn print_report(result: &BillingResult) {
    let summary = &result.summary;

    println!("💰 SAVI Billing - rules {}", result.rules_version);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Input records:    {}", result.input_records);
    println!("Processed rows:   {}", summary.record_count);
    println!("Bundles:          {} ({} standard, {} preferential)",
        summary.bundle_count, result.insights.standard_bundles, result.insights.preferential_bundles);
    println!("Violations:       {}", summary.violation_count);
    println!("Grand total:      {}", format_brl(summary.grand_total));
    println!("Average per row:  {}", format_brl(summary.average_value));

    if !summary.by_company.is_empty() {
        println!("\n🏢 By company");
        for (company, totals) in &summary.by_company {
            let share = if summary.grand_total.is_zero() {
                rust_decimal::Decimal::ZERO
            } else {
                totals.total_value * rust_decimal::Decimal::ONE_HUNDRED / summary.grand_total
            };
            println!(
                "  {:<30} {:>6} rows  {:>16}  {:>7}",
                company,
                totals.session_count,
                format_brl(totals.total_value),
                format_percentage(share)
            );
        }
    }

    if !result.insights.monthly_revenue.is_empty() {
        println!("\n📅 By month");
        for (month, value) in &result.insights.monthly_revenue {
            println!("  {}  {:>16}", month, format_brl(*value));
        }
    }

    if !result.violations.is_empty() {
        println!("\n⚠️  Compliance violations (first 20)");
        for violation in result.violations.iter().take(20) {
            println!("  row {:>5}: {}", violation.row_index, violation.message);
        }
    }

    for warning in &result.warnings {
        println!("\n❗ {}", warning.message());
    }
}

fn list_runs(store: &Path) -> Result<()> {
    let store = RunStore::open(store)?;
    let runs = store.list_runs()?;

    if runs.is_empty() {
        println!("No runs stored yet.");
        return Ok(());
    }

    println!("🗄️  {} stored runs", runs.len());
    for run in runs {
        println!(
            "  {}  {}  {:>6} rows  {:>3} bundles  {:>4} violations  {:>16}  {}",
            run.run_id,
            run.created_at.format("%Y-%m-%d %H:%M"),
            run.input_records,
            run.bundle_count,
            run.violation_count,
            format_brl(run.grand_total),
            run.status
        );
    }
    Ok(())
}

fn print_rules(path: Option<&Path>) -> Result<()> {
    let rules = load_rules(path)?;
    println!("{}", serde_json::to_string_pretty(&rules)?);
    Ok(())
}
