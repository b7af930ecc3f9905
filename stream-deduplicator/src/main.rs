use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stream_deduplicator::config::Config;
use stream_deduplicator::store::LocalStateBackend;
use stream_deduplicator::{PipelineBuilder, Row, Schema};

/// Batch files of the input directory, `<batch_id>.jsonl`, in batch order
async fn list_batches(input_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(input_dir)
        .await
        .with_context(|| format!("Failed to read input directory {input_dir:?}"))?;

    let mut batches = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(batch_id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        batches.push((batch_id, path));
    }
    batches.sort();
    Ok(batches)
}

async fn read_batch(schema: &Schema, path: &Path) -> Result<Vec<Row>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read batch file {path:?}"))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            let json: serde_json::Value = serde_json::from_str(line)
                .with_context(|| format!("{path:?} line {} is not valid JSON", n + 1))?;
            Row::from_json(schema, &json).with_context(|| format!("{path:?} line {}", n + 1))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Rows go to stdout, logs to stderr
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_deduplicator=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting stream deduplicator");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    if let Some(bind) = &config.metrics_bind {
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("Invalid METRICS_BIND '{bind}'"))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Metrics server listening on {}", addr);
    }

    let schema = config.schema()?;
    let backend = Arc::new(LocalStateBackend::new(config.state_dir_buf()));
    let mut pipeline = PipelineBuilder::new(schema.clone())
        .config(config.to_pipeline_config())
        .store_config(config.to_store_config())
        .backend(backend)
        .deduplicate(config.to_deduplicate_config()?)
        .build()
        .await
        .context("Failed to build pipeline")?;

    let mut stdout = tokio::io::BufWriter::new(tokio::io::stdout());
    for (batch_id, path) in list_batches(&config.input_dir_buf()).await? {
        if batch_id <= pipeline.last_committed() {
            info!(batch_id, "Skipping already committed batch");
            continue;
        }

        let rows = read_batch(&schema, &path).await?;
        let output = pipeline
            .process_batch(batch_id, rows)
            .await
            .with_context(|| format!("Failed to process batch {batch_id}"))?;

        for row in &output.rows {
            let line = serde_json::to_string(&row.to_json(pipeline.output_schema()))?;
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.flush().await?;

        info!(
            batch_id,
            emitted = output.rows.len(),
            watermark = ?output.watermark,
            metrics = ?output.operator_metrics,
            "Processed batch"
        );
    }

    info!(
        last_committed = pipeline.last_committed(),
        "All available batches processed"
    );
    Ok(())
}
