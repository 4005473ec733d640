//! Run the standard QC metrics on one instrument export.
//!
//! Prints a per-metric table, then the result as one JSON line.
//!
//! Run: `cargo run --example check_file -- scan.gwy [config.json] [reference.txt]`
//!
//! With a reference spectrum the 100% line SNR metric is added.

use std::sync::Arc;

use snomqc_core::{JsonExporter, MetricRegistry, QcConfig, QcPipeline, ResultExporter, ingest};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: check_file <measurement> [config.json] [reference]");
        std::process::exit(2);
    };
    let config = match args.next() {
        Some(config_path) => QcConfig::from_path(config_path)?,
        None => QcConfig::default(),
    };

    let record = Arc::new(ingest::load_path(&path)?);
    println!(
        "{}: {} channel(s), spectrum: {}",
        path,
        record.channel_names().len(),
        record.spectrum().map_or(0, |s| s.samples())
    );

    let registry = match args.next() {
        Some(reference_path) => {
            let reference = ingest::load_path(&reference_path)?;
            let Some(spectrum) = reference.spectrum() else {
                eprintln!("{reference_path} has no spectrum");
                std::process::exit(2);
            };
            MetricRegistry::with_reference(spectrum.clone())
        }
        None => MetricRegistry::standard(),
    };

    let pipeline = QcPipeline::new(registry, &config)?;
    let result = pipeline.run(&record);

    println!();
    for metric in &result.metrics {
        let value = metric
            .value
            .map_or_else(|| "-".to_string(), |v| format!("{v:.4e}"));
        let note = metric.error.as_deref().unwrap_or("");
        println!("  {:<20} {:<6} {:>12}  {}", metric.name, metric.status, value, note);
    }
    println!(
        "\nOverall: {} (score {})",
        result.status,
        result
            .score
            .map_or_else(|| "n/a".to_string(), |s| format!("{s:.3}"))
    );
    JsonExporter::new(std::io::stdout()).export(&result)?;
    Ok(())
}
