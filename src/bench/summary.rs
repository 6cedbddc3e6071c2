//! Text summary of `results.csv`: mean HTTP latency by token budget and by
//! image edge, and mean peak VRAM by edge when the server reported it.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use super::BenchError;

/// Only the columns the summary needs; extra columns are ignored.
#[derive(Debug, Deserialize)]
struct RawRow {
    max_image_edge: String,
    max_new_tokens: String,
    http_ms: String,
    #[serde(default)]
    peak_vram_mb: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Sample {
    edge: u32,
    tokens: u32,
    http_ms: u64,
    peak_vram_mb: Option<f64>,
}

impl Sample {
    fn parse(raw: RawRow) -> Option<Self> {
        let vram = raw.peak_vram_mb.trim();
        Some(Self {
            edge: raw.max_image_edge.trim().parse().ok()?,
            tokens: raw.max_new_tokens.trim().parse().ok()?,
            http_ms: raw.http_ms.trim().parse().ok()?,
            peak_vram_mb: if vram.is_empty() { None } else { Some(vram.parse().ok()?) },
        })
    }
}

/// Means keyed by `(outer, inner)`; all maps iterate in ascending key order.
#[derive(Debug, Default, PartialEq)]
pub struct Summary {
    pub rows: usize,
    /// edge → tokens → mean http_ms
    pub latency_by_tokens: BTreeMap<u32, BTreeMap<u32, f64>>,
    /// tokens → edge → mean http_ms
    pub latency_by_edge: BTreeMap<u32, BTreeMap<u32, f64>>,
    /// edge → mean peak_vram_mb; empty when no row has VRAM
    pub vram_by_edge: BTreeMap<u32, f64>,
}

#[derive(Default)]
struct Mean {
    sum: f64,
    n: usize,
}

impl Mean {
    fn add(&mut self, v: f64) {
        self.sum += v;
        self.n += 1;
    }

    fn value(&self) -> f64 {
        if self.n == 0 { 0.0 } else { self.sum / self.n as f64 }
    }
}

fn nested_means(acc: BTreeMap<u32, BTreeMap<u32, Mean>>) -> BTreeMap<u32, BTreeMap<u32, f64>> {
    acc.into_iter()
        .map(|(k, inner)| (k, inner.into_iter().map(|(k2, m)| (k2, m.value())).collect()))
        .collect()
}

pub fn summarize_reader<R: Read>(rdr: R) -> Summary {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(rdr);
    let samples: Vec<Sample> = reader
        .deserialize::<RawRow>()
        .filter_map(|r| match r {
            Ok(raw) => Sample::parse(raw),
            Err(e) => {
                debug!(error = %e, "skipping unreadable row");
                None
            }
        })
        .collect();

    let mut by_tokens: BTreeMap<u32, BTreeMap<u32, Mean>> = BTreeMap::new();
    let mut by_edge: BTreeMap<u32, BTreeMap<u32, Mean>> = BTreeMap::new();
    let mut vram: BTreeMap<u32, Mean> = BTreeMap::new();
    for s in &samples {
        by_tokens.entry(s.edge).or_default().entry(s.tokens).or_default().add(s.http_ms as f64);
        by_edge.entry(s.tokens).or_default().entry(s.edge).or_default().add(s.http_ms as f64);
        if let Some(v) = s.peak_vram_mb {
            vram.entry(s.edge).or_default().add(v);
        }
    }

    Summary {
        rows: samples.len(),
        latency_by_tokens: nested_means(by_tokens),
        latency_by_edge: nested_means(by_edge),
        vram_by_edge: vram.into_iter().map(|(k, m)| (k, m.value())).collect(),
    }
}

pub fn summarize_file(path: &Path) -> Result<Summary, BenchError> {
    let file = std::fs::File::open(path)
        .map_err(|source| BenchError::Io { path: path.display().to_string(), source })?;
    Ok(summarize_reader(file))
}

fn table(out: &mut String, title: &str, group: &str, col: &str, data: &BTreeMap<u32, BTreeMap<u32, f64>>) {
    let _ = writeln!(out, "{title}");
    for (outer, inner) in data {
        let cells: Vec<String> = inner.iter().map(|(k, v)| format!("{col}={k}: {v:.0}ms")).collect();
        let _ = writeln!(out, "  {group}={outer:<6} {}", cells.join("  "));
    }
}

pub fn render(summary: &Summary) -> String {
    let mut out = String::new();
    if summary.rows == 0 {
        out.push_str("No usable rows.\n");
        return out;
    }
    let _ = writeln!(out, "Rows: {}\n", summary.rows);
    table(&mut out, "Mean HTTP latency vs max_new_tokens", "edge", "tokens", &summary.latency_by_tokens);
    out.push('\n');
    table(&mut out, "Mean HTTP latency vs max_image_edge", "tokens", "edge", &summary.latency_by_edge);
    if !summary.vram_by_edge.is_empty() {
        out.push_str("\nMean peak VRAM vs max_image_edge\n");
        for (edge, mb) in &summary.vram_by_edge {
            let _ = writeln!(out, "  edge={edge:<6} {mb:.0} MB");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
timestamp,server,model_id,quant_4bit,use_cpu,max_image_edge,max_new_tokens,files,http_ms,model_latency_ms,peak_vram_mb,answer_chars,status,ttft_ms
t,s,m,true,false,640,128,none,100,90,,10,200,
t,s,m,true,false,640,128,none,300,250,,10,200,
t,s,m,true,false,640,256,none,500,,,10,200,
t,s,m,true,false,1024,128,none,800,,2048.5,10,200,
t,s,m,true,false,bad,128,none,1,,,0,200,
";

    #[test]
    fn means_grouped_both_ways() {
        let s = summarize_reader(CSV.as_bytes());
        assert_eq!(s.rows, 4);
        assert_eq!(s.latency_by_tokens[&640][&128], 200.0);
        assert_eq!(s.latency_by_tokens[&640][&256], 500.0);
        assert_eq!(s.latency_by_edge[&128][&1024], 800.0);
        assert_eq!(s.vram_by_edge.len(), 1);
        assert_eq!(s.vram_by_edge[&1024], 2048.5);
    }

    #[test]
    fn older_files_without_ttft_column() {
        let csv = "max_image_edge,max_new_tokens,http_ms,peak_vram_mb\n768,64,40,\n";
        let s = summarize_reader(csv.as_bytes());
        assert_eq!(s.rows, 1);
        assert!(s.vram_by_edge.is_empty());
    }

    #[test]
    fn render_lists_tables() {
        let text = render(&summarize_reader(CSV.as_bytes()));
        assert!(text.contains("Rows: 4"));
        assert!(text.contains("tokens=128: 200ms"));
        assert!(text.contains("Mean peak VRAM"));
        assert_eq!(render(&Summary::default()), "No usable rows.\n");
    }
}
