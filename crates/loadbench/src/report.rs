use anyhow::{anyhow, Result};
use clap::ValueEnum;
use loadbench_core::{CellResult, ResultSet};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

const TABLE_COLUMNS: [&str; 10] = [
    "Model",
    "Concurrency",
    "Success/Total",
    "Success Rate",
    "Avg Latency",
    "Avg Input Tokens",
    "Avg Output Tokens",
    "Avg Total Tokens",
    "RPS",
    "TPS",
];

const CSV_COLUMNS: [&str; 12] = [
    "model",
    "concurrency",
    "avg_latency_ms",
    "avg_input_tokens",
    "avg_output_tokens",
    "avg_total_tokens",
    "requests_per_sec",
    "tokens_per_sec",
    "success_rate_pct",
    "total_requests",
    "success_requests",
    "failed_requests",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Text => "md",
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
        }
    }
}

/// Everything written to the report file.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub timestamp: String,
    pub mode: &'a str,
    pub stream: bool,
    pub duration_ms: u64,
    pub request_timeout_ms: u64,
    pub cells: Vec<&'a CellResult>,
}

impl<'a> RunReport<'a> {
    pub fn new(
        mode: &'a str,
        stream: bool,
        duration_ms: u64,
        request_timeout_ms: u64,
        results: &'a ResultSet,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            mode,
            stream,
            duration_ms,
            request_timeout_ms,
            cells: sorted_cells(results),
        }
    }

    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Text => Ok(render_table(&self.cells)),
            OutputFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            OutputFormat::Csv => render_csv(&self.cells),
        }
    }
}

/// Cells ordered by variant name, then concurrency.
fn sorted_cells(results: &ResultSet) -> Vec<&CellResult> {
    let mut cells: Vec<_> = results.iter().collect();
    cells.sort_by(|a, b| {
        a.variant
            .cmp(&b.variant)
            .then(a.concurrency.cmp(&b.concurrency))
    });
    cells
}

/// Union of the percentiles any cell reports, ascending.
fn all_percentiles(cells: &[&CellResult]) -> Vec<u8> {
    cells
        .iter()
        .flat_map(|c| c.latency_percentiles.keys().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn success_rate(cell: &CellResult) -> f64 {
    if cell.total_requests == 0 {
        return 0.0;
    }
    cell.success_requests as f64 / cell.total_requests as f64 * 100.0
}

fn format_duration(d: Duration) -> String {
    if d < Duration::from_millis(1) {
        format!("{:.2} µs", d.as_secs_f64() * 1_000_000.0)
    } else if d < Duration::from_secs(1) {
        format!("{:.2} ms", d.as_secs_f64() * 1000.0)
    } else {
        format!("{:.2} s", d.as_secs_f64())
    }
}

fn table_row(cols: &[String]) -> String {
    format!("| {} |\n", cols.join(" | "))
}

/// Markdown comparison table across every variant and concurrency level.
fn render_table(cells: &[&CellResult]) -> String {
    let percentiles = all_percentiles(cells);

    let mut header: Vec<String> = TABLE_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(percentiles.iter().map(|p| format!("P{}", p)));
    let divider = vec!["---".to_string(); header.len()];

    let mut out = String::from("# Benchmark Results\n\n");
    out.push_str(&table_row(&header));
    out.push_str(&table_row(&divider));

    for cell in cells {
        let mut row = vec![
            cell.variant.clone(),
            cell.concurrency.to_string(),
            format!("{}/{}", cell.success_requests, cell.total_requests),
            format!("{:.2}%", success_rate(cell)),
            format_duration(cell.avg_latency),
            format!("{:.2}", cell.avg_input_tokens),
            format!("{:.2}", cell.avg_output_tokens),
            format!("{:.2}", cell.avg_total_tokens),
            format!("{:.2}", cell.requests_per_sec),
            format!("{:.2}", cell.tokens_per_sec),
        ];
        row.extend(percentiles.iter().map(|p| {
            cell.latency_percentiles
                .get(p)
                .map_or_else(|| "-".to_string(), |d| format_duration(*d))
        }));
        out.push_str(&table_row(&row));
    }

    out
}

fn render_csv(cells: &[&CellResult]) -> Result<String> {
    let percentiles = all_percentiles(cells);
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<String> = CSV_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(percentiles.iter().map(|p| format!("p{}_ms", p)));
    writer.write_record(&header)?;

    for cell in cells {
        let mut row = vec![
            cell.variant.clone(),
            cell.concurrency.to_string(),
            format!("{:.2}", cell.avg_latency.as_secs_f64() * 1000.0),
            format!("{:.2}", cell.avg_input_tokens),
            format!("{:.2}", cell.avg_output_tokens),
            format!("{:.2}", cell.avg_total_tokens),
            format!("{:.2}", cell.requests_per_sec),
            format!("{:.2}", cell.tokens_per_sec),
            format!("{:.2}", success_rate(cell)),
            cell.total_requests.to_string(),
            cell.success_requests.to_string(),
            cell.failed_requests.to_string(),
        ];
        row.extend(percentiles.iter().map(|p| {
            cell.latency_percentiles.get(p).map_or_else(
                || "-".to_string(),
                |d| format!("{:.2}", d.as_secs_f64() * 1000.0),
            )
        }));
        writer.write_record(&row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush CSV report: {}", e.error()))?;
    Ok(String::from_utf8(bytes)?)
}
