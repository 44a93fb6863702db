use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use console::{style, Emoji};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use uuid::Uuid;

use dicom_catalog::{build_query, Catalog, CatalogScanner, FindLevel, ScanEvent, ScanInput, ScanOptions};

static MAGNIFIER: Emoji<'_, '_> = Emoji("🔍 ", "");
static CLIPBOARD: Emoji<'_, '_> = Emoji("📋 ", "");
static WARNING: Emoji<'_, '_> = Emoji("⚠️ ", "");

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Granularity {
    Series,
    Image,
}

impl From<Granularity> for FindLevel {
    fn from(g: Granularity) -> Self {
        match g {
            Granularity::Series => FindLevel::Series,
            Granularity::Image => FindLevel::Image,
        }
    }
}

#[derive(Parser)]
#[command(name = "dicom-catalog")]
#[command(about = "Catalog DICOM files into patients, studies and series")]
#[command(version = "1.0")]
struct Args {
    /// Directory, file, DICOMDIR or Database.sql; several paths are scanned as a file list
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory levels to descend (1 = the root's files only)
    #[arg(short, long, default_value = "1")]
    depth: usize,

    /// Do not follow symbolic links
    #[arg(long)]
    no_follow_symlinks: bool,

    /// Glob applied to file names, e.g. "*.dcm"
    #[arg(short, long)]
    pattern: Option<String>,

    /// Keep files without pixel data (reports, presentation states)
    #[arg(long)]
    allow_missing_pixels: bool,

    /// Query term Keyword=Value (repeatable), e.g. Modality=MR
    #[arg(short = 'm', long = "match")]
    matches: Vec<String>,

    /// Keep whole series or only matching images
    #[arg(long, value_enum, default_value = "series")]
    find_level: Granularity,

    /// Write a JSON summary of the catalog
    #[arg(short, long)]
    summary: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let session_id = Uuid::new_v4().to_string();
    let log_file = format!("dicom_catalog_{}.log", session_id);
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_ansi(false)
        .with_writer(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&log_file)
                .with_context(|| format!("cannot create log file {}", log_file))?,
        )
        .init();

    println!("{} DICOM Catalog v1.0", MAGNIFIER);
    println!("Session ID: {}", style(&session_id).cyan());
    println!("Log file: {}", style(&log_file).yellow());
    println!();

    let mut options = ScanOptions::default()
        .with_scan_depth(args.depth)
        .with_follow_symlinks(!args.no_follow_symlinks)
        .with_require_pixel_data(!args.allow_missing_pixels)
        .with_find_level(args.find_level.into());
    if let Some(pattern) = &args.pattern {
        options = options.with_file_pattern(pattern);
    }
    if !args.matches.is_empty() {
        options = options.with_query(build_query(&args.matches).context("invalid --match term")?);
    }

    let input = match args.inputs.as_slice() {
        [single] => ScanInput::Path(single.clone()),
        many => ScanInput::Files(many.to_vec()),
    };

    let progress = ProgressBar::new(100);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("  [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}%")?
            .progress_chars("#>-"),
    );

    let scanner = CatalogScanner::new(options);
    let catalog = scanner
        .scan_with_observer(&input, |event| match event {
            ScanEvent::Started => info!("Session {} started", session_id),
            ScanEvent::Progress(fraction) => progress.set_position((fraction * 100.0).round() as u64),
            ScanEvent::Warning { message, .. } => {
                progress.println(format!("{} {}", WARNING, style(message).yellow()));
            }
            ScanEvent::Finished => progress.finish_and_clear(),
        })
        .context("scan failed")?;

    print_catalog(&catalog);

    if let Some(path) = &args.summary {
        let summary_json = serde_json::to_string_pretty(&catalog.summary())?;
        std::fs::write(path, summary_json)
            .with_context(|| format!("cannot write summary {}", path.display()))?;
        println!("📊 Summary JSON: {}", style(path.display()).yellow());
    }

    if let (Some(code), Some(path)) = (catalog.error_code(), catalog.error_path()) {
        println!(
            "{} First problem: {:?} at {}",
            WARNING,
            style(code).red(),
            style(path.display()).dim()
        );
    }
    println!("📄 Detailed log: {}", style(&log_file).yellow());
    Ok(())
}

fn print_catalog(catalog: &Catalog) {
    println!("{} Catalog", CLIPBOARD);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for (index, patient) in catalog.patients().iter().enumerate() {
        println!(
            "{} {}",
            style(patient.name()).bold(),
            style(format!("[{}]", patient.patient_id())).dim()
        );
        for study in catalog.studies_for_patient(index) {
            println!("  {} {} {}", style("Study").cyan(), study.date(), style(&study.uid).dim());
            for series in &catalog.all_series()[study.series.clone()] {
                println!(
                    "    {} #{} {} {} ({} files)",
                    style("Series").green(),
                    series.number.map_or_else(|| "-".to_string(), |n| n.to_string()),
                    series.modality(),
                    series.description(),
                    style(series.number_of_files()).cyan()
                );
            }
        }
    }
    println!();
    println!("Patients:        {}", style(catalog.number_of_patients()).cyan());
    println!("Studies:         {}", style(catalog.number_of_studies()).cyan());
    println!("Series:          {}", style(catalog.number_of_series()).cyan());
    println!("Files:           {}", style(catalog.number_of_files()).cyan());
    if catalog.was_cancelled() {
        println!("{}", style("Scan was cancelled; the catalog is partial").red());
    }
}
