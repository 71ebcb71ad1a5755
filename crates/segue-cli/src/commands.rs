//! CLI command implementations

use crate::output::{secs, table, to_json, OutputFormat, PropertyRow};
use segue_core::{
    ad::{AdBackend, AdResponse},
    manifest::HlsLoader,
    AbortToken, AdPlayer, BufferSink, EngineConfig, EventBus, EventRecord, HeadlessElement,
    HttpClient, MemorySink, SegmentPipeline, SessionId,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use url::Url;

/// Tick rate of the headless element backing `pod`
const ELEMENT_STEP: Duration = Duration::from_millis(250);

/// Engine configuration from `path`, or the defaults
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::from_path(path)?),
        None => Ok(EngineConfig::default()),
    }
}

fn client(config: &EngineConfig) -> anyhow::Result<HttpClient> {
    Ok(HttpClient::reqwest(&config.transport)?)
}

#[derive(Tabled)]
struct LevelRow {
    #[tabled(rename = "#")]
    index: usize,
    bandwidth: u64,
    resolution: String,
    codecs: String,
    selected: &'static str,
}

#[derive(Serialize)]
struct ProbeReport {
    url: String,
    multivariant: bool,
    levels: Vec<segue_core::Level>,
    selected: usize,
    segments: usize,
    duration: f64,
}

/// Show levels and the one selected for `bandwidth`
pub async fn probe(
    config: &EngineConfig,
    manifest_url: &str,
    bandwidth: Option<u64>,
    format: &str,
) -> anyhow::Result<()> {
    let url = Url::parse(manifest_url)?;
    let loader = HlsLoader::new(
        client(config)?,
        Duration::from_millis(config.redundancy.manifest_timeout_ms),
        config.redundancy.retry_count,
    );
    let loaded = loader.load(&url, bandwidth, &AbortToken::new()).await?;

    let report = ProbeReport {
        url: url.to_string(),
        multivariant: loaded.master.is_multivariant,
        levels: loaded.master.levels.clone(),
        selected: loaded.level.index,
        segments: loaded.playlist.segments.len(),
        duration: loaded.playlist.total_duration(),
    };

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", to_json(&report)?),
        OutputFormat::Text => {
            println!("Manifest: {}", report.url);
            let rows = report.levels.iter().map(|level| LevelRow {
                index: level.index,
                bandwidth: level.bandwidth,
                resolution: level
                    .resolution
                    .map(|r| format!("{} ({})", r, r.quality_name()))
                    .unwrap_or_else(|| "-".into()),
                codecs: level.codecs.clone().unwrap_or_else(|| "-".into()),
                selected: if level.index == report.selected { "*" } else { "" },
            });
            println!("{}", table(rows));
            println!(
                "Selected level {}: {} segments, {}",
                report.selected,
                report.segments,
                secs(report.duration)
            );
        }
    }

    Ok(())
}

#[derive(Tabled)]
struct TimingRow {
    segment: u64,
    bytes: usize,
    download: String,
}

#[derive(Serialize)]
struct PlayAdReport {
    level: usize,
    bandwidth: u64,
    segments: usize,
    duration: f64,
    bytes: usize,
    elapsed: f64,
    throughput_bps: Option<u64>,
    mime_type: Option<String>,
    init_appends: usize,
    appended: Vec<u64>,
}

/// Run the segment pipeline for one creative into a memory sink
pub async fn play_ad(
    config: &EngineConfig,
    manifest_url: &str,
    bandwidth: Option<u64>,
    format: &str,
) -> anyhow::Result<()> {
    let url = Url::parse(manifest_url)?;
    let sink = Arc::new(MemorySink::new());
    let pipeline = SegmentPipeline::new(
        client(config)?,
        config.redundancy.clone(),
        Arc::clone(&sink) as Arc<dyn BufferSink>,
        AbortToken::new(),
    );
    let result = pipeline.run(&url, bandwidth).await;
    pipeline.teardown();
    let report = result?;

    let summary = PlayAdReport {
        level: report.level.index,
        bandwidth: report.level.bandwidth,
        segments: report.segments,
        duration: report.duration,
        bytes: report.bytes,
        elapsed: report.elapsed.as_secs_f64(),
        throughput_bps: report.throughput_bps(),
        mime_type: sink.mime_type(),
        init_appends: sink.init_appends(),
        appended: sink.appended_sequences(),
    };

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", to_json(&summary)?),
        OutputFormat::Text => {
            let timings = report.timings.iter().map(|t| TimingRow {
                segment: t.number,
                bytes: t.bytes,
                download: format!("{} ms", t.download.as_millis()),
            });
            println!("{}", table(timings));
            println!(
                "{}",
                table(vec![
                    PropertyRow::new("Level", summary.level),
                    PropertyRow::new("Bandwidth", summary.bandwidth),
                    PropertyRow::new("Segments", summary.segments),
                    PropertyRow::new("Duration", secs(summary.duration)),
                    PropertyRow::new("Bytes", summary.bytes),
                    PropertyRow::new("Elapsed", secs(summary.elapsed)),
                    PropertyRow::new(
                        "Throughput",
                        summary
                            .throughput_bps
                            .map(|bps| format!("{} kbps", bps / 1000))
                            .unwrap_or_else(|| "-".into()),
                    ),
                    PropertyRow::new("Sink type", summary.mime_type.as_deref().unwrap_or("-")),
                    PropertyRow::new("Init appends", summary.init_appends),
                ])
            );
        }
    }

    Ok(())
}

#[derive(Tabled)]
struct CreativeRow {
    #[tabled(rename = "#")]
    sequence: usize,
    id: String,
    outcome: String,
    stall_retries: u32,
    health_retries: u32,
}

fn print_event(record: &EventRecord, format: &str) -> anyhow::Result<()> {
    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", serde_json::to_string(record)?),
        OutputFormat::Text => println!(
            "[{}] #{} {}",
            record.timestamp.format("%H:%M:%S%.3f"),
            record.sequence,
            record.event.name()
        ),
    }
    Ok(())
}

/// Play the pod described by an ad-decision response on a headless element
pub async fn pod(
    config: &EngineConfig,
    response: &Path,
    stream_events: bool,
    format: &str,
) -> anyhow::Result<()> {
    let ads = AdResponse::parse(&std::fs::read_to_string(response)?)?;
    let ids: Vec<String> = ads.iter().map(|ad| ad.id.clone()).collect();

    let element = Arc::new(HeadlessElement::new());
    let ticker = element.drive(ELEMENT_STEP);
    let backend = AdBackend {
        client: client(config)?,
        redundancy: config.redundancy.clone(),
        element: Arc::clone(&element) as _,
        bridge: None,
        sink_factory: Arc::new(|| Arc::new(MemorySink::new()) as Arc<dyn BufferSink>),
    };
    let bus = EventBus::new(SessionId::new());
    let mut events = bus.subscribe();
    let mut player = AdPlayer::new(config.ads.clone(), backend, bus);

    let summary = {
        let play = player.play_ad_response(ads);
        tokio::pin!(play);
        loop {
            tokio::select! {
                summary = &mut play => break summary,
                Some(record) = events.recv(), if stream_events => print_event(&record, format)?,
            }
        }
    };
    if stream_events {
        while let Some(record) = events.try_recv() {
            print_event(&record, format)?;
        }
    }
    ticker.abort();

    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", to_json(&summary)?),
        OutputFormat::Text => {
            if let Some(pod) = player.pod() {
                let rows = pod.states().zip(&ids).enumerate().map(|(i, (state, id))| {
                    CreativeRow {
                        sequence: i + 1,
                        id: id.clone(),
                        outcome: match (state.finished, state.failed) {
                            (true, _) => "completed".into(),
                            (_, Some(reason)) => format!("skipped ({reason:?})"),
                            _ => "not played".into(),
                        },
                        stall_retries: state.stall_retry_count,
                        health_retries: state.health_score_retry_count,
                    }
                });
                println!("{}", table(rows));
            }
            println!(
                "{}",
                table(vec![
                    PropertyRow::new("Pod size", summary.pod_size),
                    PropertyRow::new("Completed", summary.success_count),
                    PropertyRow::new("Failed", summary.failure_count),
                    PropertyRow::new("Duration", secs(summary.total_duration)),
                    PropertyRow::new(
                        "Excluding pauses",
                        secs(summary.total_duration_excluding_pause)
                    ),
                ])
            );
        }
    }

    Ok(())
}

/// Print the effective configuration
pub fn show_config(config: &EngineConfig, format: &str) -> anyhow::Result<()> {
    match OutputFormat::from(format) {
        OutputFormat::Json => println!("{}", to_json(config)?),
        OutputFormat::Text => {
            let value = serde_json::to_value(config)?;
            if let Some(sections) = value.as_object() {
                for (section, fields) in sections {
                    println!("[{section}]");
                    if let Some(fields) = fields.as_object() {
                        for (key, value) in fields {
                            println!("  {key} = {value}");
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let path = std::env::temp_dir().join(format!("segue-cli-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"ads": {"max_stall_retries": 1}}"#).unwrap();
        let config = load_config(Some(path.as_path())).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.ads.max_stall_retries, 1);
    }
}
