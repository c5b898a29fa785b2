//! Cleaner Service - Normalizes the SECMCA remittances workbook into tidy CSV series
//!
//! Responsibilities:
//! - Read the raw workbook as a plain string grid, with no assumed header
//! - Locate the real header row (three fallback heuristics, in priority order)
//! - Filter to the Honduras rows and melt wide periods into long rows
//! - Clean numeric formatting and parse period labels into calendar dates
//! - Write monthly, annual and quarterly CSVs
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same workbook + same cleaner version = same output files
//!
//! Usage:
//!   cargo run --bin cleaner
//!   cargo run --bin cleaner -- --input data/raw/secmca_remesas_hn.xlsx --sheet 0

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Datelike, NaiveDate};
use clap::Parser;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "cleaner", about = "Cleans the SECMCA remittances workbook into CSV series")]
struct Args {
    /// Input workbook (xls, xlsx or ods)
    #[arg(long, default_value = "data/raw/secmca_remesas_hn.xlsx")]
    input: PathBuf,

    /// Zero-based sheet index inside the workbook
    #[arg(long, default_value = "0")]
    sheet: usize,

    /// Directory the output CSVs are written to (created if absent)
    #[arg(long, default_value = "data/processed")]
    out_dir: PathBuf,
}

// =============================================================================
// Output row types
// =============================================================================

#[derive(Debug, Serialize)]
struct MonthlyRow {
    fecha: NaiveDate,
    remesas_ingreso_usd: f64,
}

#[derive(Debug, Serialize)]
struct AnnualRow {
    anio: i32,
    remesas_ingreso_usd: f64,
}

#[derive(Debug, Serialize)]
struct QuarterlyRow {
    fecha: NaiveDate,
    anio: i32,
    tri: u32,
    remesas_ingreso_usd: f64,
}

/// One melted cell: a period label paired with the raw value text under it.
#[derive(Debug, Clone)]
struct LongRow {
    period: String,
    raw_value: String,
}

/// A fully cleaned observation. Rows that fail either parse never become one.
#[derive(Debug, Clone, PartialEq)]
struct Observation {
    date: NaiveDate,
    value: f64,
}

// =============================================================================
// Period grammar
// =============================================================================
// SECMCA publishes the same series under several period encodings, sometimes
// mixed within one workbook: 2001, 2001-1, 200101, 2001M01, 2001Q1 (T for
// trimestre also appears).

static YEAR_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})$").expect("period pattern"));
static YEAR_DASH_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[-/](\d{1,2})$").expect("period pattern"));
static YEAR_MONTH_COMPACT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})(\d{2})$").expect("period pattern"));
static YEAR_MONTH_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[mM](\d{2})$").expect("period pattern"));
static YEAR_QUARTER_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[qQtT](\d)$").expect("period pattern"));

/// Does this cell look like a period label under any of the five encodings?
///
/// Lexical only: "2001-13" looks like a period even though it parses to no
/// date. Header detection wants the shape, not the calendar.
fn looks_like_period(cell: &str) -> bool {
    let cell = cell.trim();
    YEAR_ONLY.is_match(cell)
        || YEAR_DASH_MONTH.is_match(cell)
        || YEAR_MONTH_COMPACT.is_match(cell)
        || YEAR_MONTH_CODE.is_match(cell)
        || YEAR_QUARTER_CODE.is_match(cell)
}

/// Parse a period label into the date that stamps its observation.
///
/// Annual labels stamp Dec 31, monthly labels the 1st of the month, quarterly
/// labels the 1st of the quarter's first month. Anything else, including
/// out-of-range months and quarters, is a soft miss: the row is dropped later
/// by the cleaning filter instead of failing the run.
fn parse_period(label: &str) -> Option<NaiveDate> {
    let label = label.trim();

    if let Some(caps) = YEAR_ONLY.captures(label) {
        let year: i32 = caps[1].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, 12, 31);
    }
    for re in [&YEAR_DASH_MONTH, &YEAR_MONTH_COMPACT, &YEAR_MONTH_CODE] {
        if let Some(caps) = re.captures(label) {
            let year: i32 = caps[1].parse().ok()?;
            let month: u32 = caps[2].parse().ok()?;
            return NaiveDate::from_ymd_opt(year, month, 1);
        }
    }
    if let Some(caps) = YEAR_QUARTER_CODE.captures(label) {
        let year: i32 = caps[1].parse().ok()?;
        let quarter: u32 = caps[2].parse().ok()?;
        if !(1..=4).contains(&quarter) {
            return None;
        }
        return NaiveDate::from_ymd_opt(year, (quarter - 1) * 3 + 1, 1);
    }
    None
}

// =============================================================================
// Normalization
// =============================================================================

/// Fold the accented Latin letters the SECMCA headers use onto plain ASCII.
fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        _ => c,
    }
}

/// Normalize a header cell the same way every time: trim, lowercase, fold
/// accents, collapse every run of non-alphanumeric characters into a single
/// underscore, and drop leading/trailing underscores.
///
/// "  País " -> "pais", "Remesas (US$ millones)" -> "remesas_us_millones"
fn normalize_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().to_lowercase().chars().map(fold_accent) {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Clean a raw value cell into a number.
///
/// Strips non-breaking spaces, plain spaces, thousands-separator commas and
/// semicolons, then anything that is not a digit, a period or a minus sign.
/// An empty residue or an unparseable residue is a soft miss, never an error.
fn clean_value(raw: &str) -> Option<f64> {
    let residue: String = raw
        .replace('\u{a0}', "")
        .replace(' ', "")
        .replace(',', "")
        .replace(';', "")
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if residue.is_empty() {
        return None;
    }
    residue.parse::<f64>().ok()
}

// =============================================================================
// Loader
// =============================================================================

/// Render one workbook cell as text. Numeric cells keep their shortest display
/// form, so a 2019 stored as a number comes back as "2019".
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty => String::new(),
        other => format!("{}", other),
    }
}

/// Read the selected sheet as a grid of strings, with no header interpretation.
fn load_grid(path: &Path, sheet_index: usize) -> Result<Vec<Vec<String>>> {
    println!("Opening workbook: {}", path.display());

    // calamine auto-detects the container format: xls, xlsx, xlsb, ods
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("Failed to open workbook {}", path.display()))?;

    let sheet_names = workbook.sheet_names().to_vec();
    if sheet_names.is_empty() {
        anyhow::bail!("Workbook has no sheets");
    }
    let sheet_name = sheet_names
        .get(sheet_index)
        .with_context(|| {
            format!(
                "Sheet index {} out of range: workbook has {} sheets",
                sheet_index,
                sheet_names.len()
            )
        })?
        .clone();
    println!(
        "Reading sheet: '{}' ({} of {} sheets)",
        sheet_name,
        sheet_index + 1,
        sheet_names.len()
    );

    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read sheet")?;
    let (row_count, col_count) = range.get_size();
    println!("Sheet size: {} rows x {} columns", row_count, col_count);

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect())
}

// =============================================================================
// Header Locator
// =============================================================================
// The SECMCA workbooks carry title and note rows above the real table, and the
// header offset moves between releases. Three heuristics, tried in strict
// order; first hit wins, exhaustion is fatal.

/// Strategy a: the first row that mentions the country column ("país"/"pais").
fn header_by_country_label(grid: &[Vec<String>]) -> Option<usize> {
    grid.iter().position(|row| {
        let joined = row.join(" | ").to_lowercase();
        joined.contains("país") || joined.contains("pais")
    })
}

/// Strategy b: the row right above the first row that mentions "honduras",
/// clamped to row 0.
fn header_by_honduras_row(grid: &[Vec<String>]) -> Option<usize> {
    grid.iter()
        .position(|row| row.join(" | ").to_lowercase().contains("honduras"))
        .map(|i| i.saturating_sub(1))
}

/// Strategy c: the row right above the first row holding at least 3
/// period-shaped cells (or that row itself when it is row 0).
fn header_by_period_density(grid: &[Vec<String>]) -> Option<usize> {
    grid.iter()
        .position(|row| row.iter().filter(|cell| looks_like_period(cell)).count() >= 3)
        .map(|i| i.saturating_sub(1))
}

fn locate_header_row(grid: &[Vec<String>]) -> Result<usize> {
    header_by_country_label(grid)
        .or_else(|| header_by_honduras_row(grid))
        .or_else(|| header_by_period_density(grid))
        .context(
            "Could not locate the header row. Open the workbook and check which row holds the column names",
        )
}

// =============================================================================
// Reshaper
// =============================================================================

/// Category metadata columns the SECMCA layouts use. Everything else is a
/// candidate period column.
const IDENTIFIER_COLUMNS: &[&str] = &["pais", "serie", "variable", "unidad", "medida", "concepto"];

/// Partition columns into identifier and period roles.
///
/// Period columns are recognized by header name first; failing that, by
/// sampling each remaining column's first 8 values (some releases put the
/// period in the cells instead of the header); failing that, column 0 is
/// assumed to be the sole identifier and every other column a period.
fn assign_column_roles(headers: &[String], rows: &[&Vec<String>]) -> (Vec<usize>, Vec<usize>) {
    let mut id_cols: Vec<usize> = Vec::new();
    let mut period_cols: Vec<usize> = Vec::new();

    for (idx, name) in headers.iter().enumerate() {
        if IDENTIFIER_COLUMNS.contains(&name.as_str()) {
            id_cols.push(idx);
        } else if looks_like_period(name) {
            period_cols.push(idx);
        }
    }

    if period_cols.is_empty() {
        for idx in 0..headers.len() {
            if id_cols.contains(&idx) {
                continue;
            }
            let hits = rows
                .iter()
                .take(8)
                .filter(|row| row.get(idx).map(|v| looks_like_period(v)).unwrap_or(false))
                .count();
            if hits >= 3 {
                period_cols.push(idx);
            }
        }
    }

    // Last resort for single-country exports with unlabeled period headers.
    if period_cols.is_empty() && headers.len() > 1 {
        return (vec![0], (1..headers.len()).collect());
    }

    (id_cols, period_cols)
}

/// Melt the table below the header row into long (period label, raw value)
/// rows, keeping only the Honduras rows when a country column exists.
fn reshape_long(grid: &[Vec<String>], header_row: usize) -> Result<Vec<LongRow>> {
    let headers: Vec<String> = grid[header_row].iter().map(|c| normalize_header(c)).collect();
    let data_rows: &[Vec<String>] = grid.get(header_row + 1..).unwrap_or(&[]);

    // Single-country selection: only applied when the layout has a country
    // column at all.
    let kept: Vec<&Vec<String>> = match headers.iter().position(|h| h == "pais") {
        Some(pais_col) => data_rows
            .iter()
            .filter(|row| {
                row.get(pais_col)
                    .map(|v| v.to_lowercase().contains("honduras"))
                    .unwrap_or(false)
            })
            .collect(),
        None => data_rows.iter().collect(),
    };
    println!("Data rows after country filter: {}", kept.len());

    let (id_cols, period_cols) = assign_column_roles(&headers, &kept);
    println!(
        "Columns: {} identifier, {} period",
        id_cols.len(),
        period_cols.len()
    );
    if period_cols.is_empty() {
        anyhow::bail!(
            "No period columns detected by header, by sampled values, or by position. Check the workbook layout"
        );
    }

    // Column-major melt: all rows of the first period column, then the next.
    // The label is always the column name, which is what later date parsing
    // sees.
    let mut long = Vec::with_capacity(period_cols.len() * kept.len());
    for &col in &period_cols {
        for row in &kept {
            long.push(LongRow {
                period: headers[col].clone(),
                raw_value: row.get(col).cloned().unwrap_or_default(),
            });
        }
    }
    println!("Melted {} long rows", long.len());
    Ok(long)
}

// =============================================================================
// Cleaning filter
// =============================================================================

/// Keep only rows where both the period and the value parsed, sorted by date.
///
/// The sort is stable, so duplicate dates keep their melt order. Duplicates
/// are not collapsed.
fn clean_observations(long: &[LongRow]) -> Vec<Observation> {
    let mut observations: Vec<Observation> = long
        .iter()
        .filter_map(|row| {
            let date = parse_period(&row.period)?;
            let value = clean_value(&row.raw_value)?;
            Some(Observation { date, value })
        })
        .collect();
    observations.sort_by(|a, b| a.date.cmp(&b.date));
    observations
}

// =============================================================================
// Aggregation
// =============================================================================

fn annual_totals(observations: &[Observation]) -> Vec<AnnualRow> {
    // BTreeMap for deterministic ascending year order
    let mut totals: BTreeMap<i32, f64> = BTreeMap::new();
    for obs in observations {
        *totals.entry(obs.date.year()).or_insert(0.0) += obs.value;
    }
    totals
        .into_iter()
        .map(|(anio, total)| AnnualRow {
            anio,
            remesas_ingreso_usd: total,
        })
        .collect()
}

/// Last calendar day of the quarter: Mar 31, Jun 30, Sep 30 or Dec 31.
fn quarter_end(year: i32, quarter: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if quarter == 4 {
        (year + 1, 1)
    } else {
        (year, quarter * 3 + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

fn quarterly_totals(observations: &[Observation]) -> Result<Vec<QuarterlyRow>> {
    let mut totals: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for obs in observations {
        let quarter = obs.date.month0() / 3 + 1;
        *totals.entry((obs.date.year(), quarter)).or_insert(0.0) += obs.value;
    }
    totals
        .into_iter()
        .map(|((anio, tri), total)| {
            let fecha = quarter_end(anio, tri)
                .with_context(|| format!("Invalid quarter end for {} T{}", anio, tri))?;
            Ok(QuarterlyRow {
                fecha,
                anio,
                tri,
                remesas_ingreso_usd: total,
            })
        })
        .collect()
}

// =============================================================================
// Writer
// =============================================================================

/// Write one CSV with an explicit header record, so an empty table still
/// produces a headers-only file.
fn write_csv<T: Serialize>(path: &Path, headers: &[&str], rows: &[T]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(headers)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_outputs(out_dir: &Path, observations: &[Observation]) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

    let monthly: Vec<MonthlyRow> = observations
        .iter()
        .map(|obs| MonthlyRow {
            fecha: obs.date,
            remesas_ingreso_usd: obs.value,
        })
        .collect();
    let monthly_path = out_dir.join("remesas_hn_mensual.csv");
    write_csv(&monthly_path, &["fecha", "remesas_ingreso_usd"], &monthly)?;
    println!("Wrote {} ({} rows)", monthly_path.display(), monthly.len());

    // Derived series are only written when there is monthly data to sum.
    if observations.is_empty() {
        println!("No observations survived cleaning; skipping annual and quarterly outputs");
        return Ok(());
    }

    let annual = annual_totals(observations);
    let annual_path = out_dir.join("remesas_hn_anual.csv");
    write_csv(&annual_path, &["anio", "remesas_ingreso_usd"], &annual)?;
    println!("Wrote {} ({} rows)", annual_path.display(), annual.len());

    let quarterly = quarterly_totals(observations)?;
    let quarterly_path = out_dir.join("remesas_hn_trimestral.csv");
    write_csv(
        &quarterly_path,
        &["fecha", "anio", "tri", "remesas_ingreso_usd"],
        &quarterly,
    )?;
    println!("Wrote {} ({} rows)", quarterly_path.display(), quarterly.len());

    Ok(())
}

// =============================================================================
// Pipeline
// =============================================================================

fn run(args: &Args) -> Result<()> {
    let grid = load_grid(&args.input, args.sheet)?;

    let header_row = locate_header_row(&grid)?;
    println!("Header row located at offset {}", header_row);

    let long = reshape_long(&grid, header_row)?;
    let observations = clean_observations(&long);
    println!("Clean observations: {}", observations.len());

    write_outputs(&args.out_dir, &observations)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("=== SECMCA Remittances Cleaner ===");
    println!("Input: {}", args.input.display());
    println!("Sheet index: {}", args.sheet);
    println!("Output dir: {}", args.out_dir.display());

    run(&args)?;

    println!("\n=== Cleaning Complete ===");
    println!(
        "{}: remesas_hn_mensual.csv + anual/trimestral",
        args.out_dir.display()
    );
    Ok(())
}

// =============================================================================
// TESTS - Critical for ensuring DETERMINISM
// =============================================================================
