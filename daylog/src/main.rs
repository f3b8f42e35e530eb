use std::{
    io::{self, Read},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, TimeDelta};
use clap::{Args, Parser, Subcommand};
use daylog::checklist::{self, GoalItem};
use daylog::{BlockRepository, BlockStore, Header, StoreConfig, WeekEntry, parse_blocks};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(
    name = "daylog",
    about = "Daily journal documents split into fixed sections",
    version
)]
struct Cli {
    /// Directory that contains the `logs/` tree.
    #[arg(long, global = true, env = "DAYLOG_ROOT", default_value = ".")]
    root: PathBuf,
    /// Owner of the documents; used verbatim as a directory name.
    #[arg(long, global = true, env = "DAYLOG_USER")]
    user: Option<String>,
    /// Serialize writes per file and replace files atomically.
    #[arg(long, global = true)]
    guarded: bool,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the document path for a date.
    Path(DateArgs),

    /// Print one block as plain lines.
    Read(ReadArgs),

    /// Replace one block and rewrite the document.
    Write(WriteArgs),

    /// Print the stored document text.
    Show(ShowArgs),

    /// Report whether the morning and evening entries exist.
    Exists(DateArgs),

    /// List the days of a Monday-Sunday week that have a document.
    Week(WeekArgs),

    /// Dates of the week with a morning entry.
    Morning(WeekArgs),

    /// Dates of the week with a morning or evening entry.
    Evening(WeekArgs),

    /// Tick goals as done in the evening checklist.
    Check(CheckArgs),

    /// Goal completion per day for a week.
    Progress(WeekArgs),
}

#[derive(Debug, Args)]
struct DateArgs {
    /// Target date (YYYY-MM-DD). Defaults to today.
    date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct ReadArgs {
    /// Block name (`goals`, `focus`, ...) or its full header line.
    header: Header,
    /// Target date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct WriteArgs {
    /// Block name (`goals`, `focus`, ...) or its full header line.
    header: Header,
    /// Target date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Block body; read from stdin when omitted.
    #[arg(long)]
    body: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Target date (YYYY-MM-DD). Defaults to today.
    date: Option<NaiveDate>,
    /// Emit the parsed document as JSON instead of raw text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct WeekArgs {
    /// Reference date inside the week (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Shift the reference date by this many weeks.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    offset: i64,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Goal texts to mark as done.
    goals: Vec<String>,
    /// Target date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Mark every goal of the day as done.
    #[arg(long)]
    all: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let user = cli
        .user
        .clone()
        .context("no user given; pass --user or set DAYLOG_USER")?;
    let mut config = StoreConfig::new(cli.root.clone());
    if cli.guarded {
        config = config.guarded();
    }
    let store = BlockStore::with_config(&config, user);

    match cli.command {
        Commands::Path(args) => handle_path(&store, args),
        Commands::Read(args) => handle_read(&store, args),
        Commands::Write(args) => handle_write(&store, args),
        Commands::Show(args) => handle_show(&store, args),
        Commands::Exists(args) => handle_exists(&store, args),
        Commands::Week(args) => handle_week(&store, args),
        Commands::Morning(args) => handle_filtered_week(&store, args, |e| e.has_morning),
        Commands::Evening(args) => {
            handle_filtered_week(&store, args, |e| e.has_morning || e.has_evening)
        }
        Commands::Check(args) => handle_check(&store, args),
        Commands::Progress(args) => handle_progress(&store, args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("DAYLOG_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "daylog=debug,info"
        } else {
            "daylog=warn"
        })
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(io::stderr))
        .init();
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn reference_day(date: Option<NaiveDate>, offset_weeks: i64) -> Result<NaiveDate> {
    let base = date.unwrap_or_else(today);
    TimeDelta::try_weeks(offset_weeks)
        .and_then(|delta| base.checked_add_signed(delta))
        .with_context(|| format!("week offset {offset_weeks} out of range from {base}"))
}

fn handle_path(store: &BlockStore, args: DateArgs) -> Result<()> {
    let date = args.date.unwrap_or_else(today);
    println!("{}", store.document_path(date).display());
    Ok(())
}

fn handle_read(store: &BlockStore, args: ReadArgs) -> Result<()> {
    let ReadArgs { header, date } = args;
    let date = date.unwrap_or_else(today);
    let body = store
        .read_block(date, header)
        .with_context(|| format!("reading {} for {date}", header.slug()))?;
    for line in body.lines() {
        println!("{line}");
    }
    Ok(())
}

fn handle_write(store: &BlockStore, args: WriteArgs) -> Result<()> {
    let WriteArgs { header, date, body } = args;
    let date = date.unwrap_or_else(today);
    let body = match body {
        Some(body) => body,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading block body from stdin")?;
            buf
        }
    };

    store
        .write_block(date, header, Some(&body))
        .with_context(|| format!("writing {} for {date}", header.slug()))?;
    println!(
        "Wrote {} to {:?}",
        header.slug(),
        store.document_path(date)
    );
    Ok(())
}

fn handle_show(store: &BlockStore, args: ShowArgs) -> Result<()> {
    let ShowArgs { date, json } = args;
    let date = date.unwrap_or_else(today);
    let Some(text) = store
        .read_raw(date)
        .with_context(|| format!("reading document for {date}"))?
    else {
        anyhow::bail!("no document for {date}");
    };

    if json {
        let doc = parse_blocks(&text);
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        for line in text.lines() {
            println!("{line}");
        }
    }
    Ok(())
}

fn handle_exists(store: &BlockStore, args: DateArgs) -> Result<()> {
    let date = args.date.unwrap_or_else(today);
    let morning = store.morning_exists(date)?;
    let evening = store.evening_exists(date)?;
    println!("{date} morning={morning} evening={evening}");
    Ok(())
}

fn mark(flag: bool) -> &'static str {
    if flag { "x" } else { "-" }
}

fn handle_week(store: &BlockStore, args: WeekArgs) -> Result<()> {
    let ref_day = reference_day(args.date, args.offset)?;
    let entries = store
        .list_week(ref_day)
        .with_context(|| format!("listing week of {ref_day}"))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        eprintln!("No documents in the week of {ref_day}.");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{} morning[{}] evening[{}]",
            entry.date,
            mark(entry.has_morning),
            mark(entry.has_evening)
        );
    }
    Ok(())
}

fn handle_filtered_week(
    store: &BlockStore,
    args: WeekArgs,
    keep: impl Fn(&WeekEntry) -> bool,
) -> Result<()> {
    let ref_day = reference_day(args.date, args.offset)?;
    let dates: Vec<NaiveDate> = store
        .list_week(ref_day)
        .with_context(|| format!("listing week of {ref_day}"))?
        .into_iter()
        .filter(|e| keep(e))
        .map(|e| e.date)
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&dates)?);
    } else {
        for date in dates {
            println!("{date}");
        }
    }
    Ok(())
}

/// Marks goals whose text matches one of `wanted` (trimmed, exact). Returns how many matched.
fn tick_goals(items: &mut [GoalItem], wanted: &[String], all: bool) -> usize {
    let mut hits = 0;
    for item in items.iter_mut() {
        if all || wanted.iter().any(|w| w.trim() == item.text) {
            item.done = true;
            hits += 1;
        }
    }
    hits
}

fn handle_check(store: &BlockStore, args: CheckArgs) -> Result<()> {
    let CheckArgs { goals, date, all } = args;
    let date = date.unwrap_or_else(today);
    if goals.is_empty() && !all {
        anyhow::bail!("name at least one goal or pass --all");
    }

    let mut items = checklist::goal_checklist(store, date)
        .with_context(|| format!("loading goals for {date}"))?;
    if items.is_empty() {
        anyhow::bail!("no goals recorded for {date}");
    }

    let hits = tick_goals(&mut items, &goals, all);
    if hits == 0 {
        anyhow::bail!("none of the given goals exist for {date}");
    }

    checklist::write_goal_checklist(store, date, &items)
        .with_context(|| format!("writing checklist for {date}"))?;
    for item in &items {
        println!("[{}] {}", if item.done { 'x' } else { ' ' }, item.text);
    }
    Ok(())
}

fn handle_progress(store: &BlockStore, args: WeekArgs) -> Result<()> {
    let ref_day = reference_day(args.date, args.offset)?;
    let progress = checklist::week_progress(store, ref_day)
        .with_context(|| format!("computing progress for week of {ref_day}"))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    for day in &progress.days {
        println!(
            "{} {:>3}% ({}/{})",
            day.date, day.percent, day.achieved, day.total
        );
    }
    println!(
        "week {:>3}% ({}/{})",
        progress.percent, progress.achieved, progress.total
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    #[test]
    fn reference_day_shifts_by_whole_weeks() {
        let shift = |date, weeks| reference_day(Some(date), weeks).expect("in range");
        assert_eq!(shift(d(2024, 5, 16), 0), d(2024, 5, 16));
        assert_eq!(shift(d(2024, 5, 16), -1), d(2024, 5, 9));
        assert_eq!(shift(d(2024, 5, 30), 1), d(2024, 6, 6));
    }

    #[test]
    fn reference_day_rejects_offsets_past_the_calendar() {
        let day = d(2024, 5, 16);
        assert!(reference_day(Some(day), 30_000_000).is_err());
        assert!(reference_day(Some(day), -30_000_000).is_err());
        assert!(reference_day(Some(day), i64::MAX).is_err());

        let err = reference_day(Some(day), i64::MIN).expect_err("out of range");
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn tick_goals_matches_trimmed_text() {
        let mut items = vec![
            GoalItem {
                text: "run".into(),
                done: false,
            },
            GoalItem {
                text: "read".into(),
                done: false,
            },
        ];
        let hits = tick_goals(&mut items, &[" read ".to_string(), "swim".to_string()], false);
        assert_eq!(hits, 1);
        assert!(!items[0].done);
        assert!(items[1].done);

        assert_eq!(tick_goals(&mut items, &[], true), 2);
        assert!(items.iter().all(|i| i.done));
    }

    #[test]
    fn cli_parses_header_slugs_and_dates() {
        let cli = Cli::try_parse_from([
            "daylog",
            "--user",
            "alice",
            "write",
            "achievements",
            "--date",
            "2024-05-16",
            "--body",
            "shipped",
        ])
        .expect("parse");
        match cli.command {
            Commands::Write(args) => {
                assert_eq!(args.header, Header::Achievements);
                assert_eq!(args.date, Some(d(2024, 5, 16)));
                assert_eq!(args.body.as_deref(), Some("shipped"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn store_round_trip_through_handlers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = BlockStore::new(tmp.path(), "alice");
        let date = d(2024, 5, 16);

        handle_write(
            &store,
            WriteArgs {
                header: Header::Goals,
                date: Some(date),
                body: Some("a\nb".into()),
            },
        )
        .expect("write");
        handle_check(
            &store,
            CheckArgs {
                goals: vec!["b".into()],
                date: Some(date),
                all: false,
            },
        )
        .expect("check");

        let items = checklist::goal_checklist(&store, date).expect("checklist");
        assert_eq!(
            items.iter().map(|i| i.done).collect::<Vec<_>>(),
            vec![false, true]
        );
    }
}
