use base64::{engine::general_purpose, Engine as _};
use blastline::campaign::{AttemptOutcome, CampaignConfig, CampaignSnapshot, OverlayConfig};
use blastline::config::Config;
use blastline::engine::CampaignEngine;
use blastline::gateway::{DryRunGateway, HttpGateway, MessageGateway};
use blastline::roster::{infer_recipients, RecipientRecord};
use blastline::template::MessageRenderer;
use clap::{Arg, Command};
use log::LevelFilter;
use serde_json::{Map, Value};
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let matches = Command::new("blastline")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Campaign dispatch engine for bulk outbound messaging")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("blastline.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("recipients")
                .short('r')
                .long("recipients")
                .value_name("FILE")
                .help("Decoded recipient table: JSON array of row objects (field name -> value)")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("parse-only")
                .long("parse-only")
                .help("Infer the recipient roster, print it, and exit without sending")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("message")
                .short('m')
                .long("message")
                .value_name("TEXT")
                .help("Message template; {name} is replaced per recipient")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("message-file")
                .long("message-file")
                .value_name("FILE")
                .help("Read the message template from a file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("media")
                .long("media")
                .value_name("FILE")
                .help("Attach a media file to every message")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("media-type")
                .long("media-type")
                .value_name("HINT")
                .help("Media type hint (image, video, audio, document); guessed from the extension if omitted")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("delay")
                .long("delay")
                .value_name("SECONDS")
                .help("Override the configured delay between sends")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Rehearse the campaign against a logging gateway instead of the real one")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("🔍 Testing configuration...");
        println!();
        println!("Gateway endpoint: {}", config.gateway.base_url);
        println!(
            "API key: {}",
            if config.gateway.api_key.as_deref().unwrap_or("").is_empty() {
                "not set"
            } else {
                "set"
            }
        );
        println!(
            "Delay between sends: {:.1}s",
            config.dispatch.inter_item_delay_seconds
        );
        println!(
            "Per-recipient overlay: {}",
            if config.overlay.enabled {
                "enabled"
            } else {
                "disabled"
            }
        );
        println!();
        println!("✅ Configuration is valid");
        return;
    }

    let Some(rows_path) = matches.get_one::<String>("recipients") else {
        eprintln!("❌ --recipients FILE is required (JSON array of row objects)");
        process::exit(1);
    };

    let recipients = match load_recipients(rows_path) {
        Ok(recipients) => recipients,
        Err(e) => {
            eprintln!("❌ Error reading recipient table: {e:#}");
            process::exit(1);
        }
    };
    if recipients.is_empty() {
        eprintln!(
            "❌ No usable recipients found in {rows_path}: no column looks like a phone/group identifier"
        );
        process::exit(1);
    }

    if matches.get_flag("parse-only") {
        print_roster(&recipients);
        return;
    }

    let message_template = match resolve_template(&matches) {
        Ok(template) => template,
        Err(e) => {
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    };

    let media = match load_media(&matches) {
        Ok(media) => media,
        Err(e) => {
            eprintln!("❌ Error reading media file: {e:#}");
            process::exit(1);
        }
    };

    let delay_seconds = match matches.get_one::<String>("delay") {
        Some(raw) => match raw.parse::<f64>() {
            Ok(value) if value >= 0.0 && value.is_finite() => value,
            _ => {
                eprintln!("❌ --delay must be a non-negative number of seconds, got '{raw}'");
                process::exit(1);
            }
        },
        None => config.dispatch.inter_item_delay_seconds,
    };

    let campaign = CampaignConfig {
        message_template,
        media,
        overlay: overlay_from_settings(&config),
        inter_item_delay: Duration::from_secs_f64(delay_seconds),
    };

    let gateway: Arc<dyn MessageGateway> = if matches.get_flag("dry-run") {
        log::info!("dry-run mode: nothing will actually be sent");
        Arc::new(DryRunGateway)
    } else {
        match HttpGateway::new(&config.gateway) {
            Ok(gateway) => Arc::new(gateway),
            Err(e) => {
                eprintln!("❌ Error setting up gateway client: {e:#}");
                process::exit(1);
            }
        }
    };

    let engine = CampaignEngine::new(gateway);
    if let Err(e) = engine.start(campaign, recipients) {
        eprintln!("❌ Could not start campaign: {e:#}");
        process::exit(1);
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::warn!("interrupt received, stopping after the in-flight send");
                let _ = engine.stop();
            }
            _ = ticker.tick() => {
                let snapshot = engine.snapshot();
                if snapshot.state.is_terminal() {
                    break;
                }
                log::info!(
                    "progress: {}% ({} sent, {} failed of {})",
                    snapshot.progress,
                    snapshot.stats.sent,
                    snapshot.stats.failed,
                    snapshot.stats.total
                );
            }
        }
    }

    // Waits out the in-flight send after a stop so the summary includes it.
    engine.join().await;
    print_summary(&engine.snapshot());
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e:#}");
            process::exit(1);
        }
    }
}

fn load_recipients(path: &str) -> anyhow::Result<Vec<RecipientRecord>> {
    use anyhow::Context;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read recipient table: {path}"))?;
    let rows: Vec<Map<String, Value>> = serde_json::from_str(&content)
        .with_context(|| format!("{path} is not a JSON array of row objects"))?;
    log::info!("loaded {} rows from {path}", rows.len());
    Ok(infer_recipients(&rows))
}

fn resolve_template(matches: &clap::ArgMatches) -> anyhow::Result<String> {
    use anyhow::{bail, Context};

    if let Some(text) = matches.get_one::<String>("message") {
        return Ok(text.clone());
    }
    if let Some(path) = matches.get_one::<String>("message-file") {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read message template: {path}"));
    }
    bail!("a message template is required: pass --message TEXT or --message-file FILE");
}

fn load_media(matches: &clap::ArgMatches) -> anyhow::Result<Option<blastline::campaign::MediaRef>> {
    use anyhow::Context;

    let Some(path) = matches.get_one::<String>("media") else {
        return Ok(None);
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read media file: {path}"))?;
    let type_hint = matches
        .get_one::<String>("media-type")
        .cloned()
        .unwrap_or_else(|| media_type_hint(path).to_string());
    log::info!("attaching {path} ({} bytes, type {type_hint})", bytes.len());
    Ok(Some(blastline::campaign::MediaRef {
        handle: general_purpose::STANDARD.encode(bytes),
        type_hint,
    }))
}

fn media_type_hint(path: &str) -> &'static str {
    let extension = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" => "image",
        "mp4" | "3gp" | "mov" => "video",
        "mp3" | "ogg" | "m4a" | "aac" => "audio",
        _ => "document",
    }
}

/// Turn the static overlay settings into the per-recipient overlay function
/// the engine expects.
fn overlay_from_settings(config: &Config) -> Option<Arc<blastline::campaign::OverlayFn>> {
    if !config.overlay.enabled {
        return None;
    }
    let settings = config.overlay.clone();
    let renderer = MessageRenderer::new();
    Some(Arc::new(move |recipient: &RecipientRecord| OverlayConfig {
        text: renderer.render(&settings.text, &recipient.display_name),
        x: settings.x,
        y: settings.y,
        font_size: settings.font_size,
        color: settings.color.clone(),
    }))
}

fn print_roster(recipients: &[RecipientRecord]) {
    println!("📇 Inferred roster ({} recipients)", recipients.len());
    println!("┌──────────────────────┬──────────────────────────────┐");
    println!("│ Identifier           │ Display name                 │");
    println!("├──────────────────────┼──────────────────────────────┤");
    for recipient in recipients {
        println!(
            "│ {:<20} │ {:<28} │",
            truncate_string(&recipient.identifier, 20),
            truncate_string(&recipient.display_name, 28)
        );
    }
    println!("└──────────────────────┴──────────────────────────────┘");
}

fn print_summary(snapshot: &CampaignSnapshot) {
    println!();
    println!("📊 Campaign Summary");
    println!("═══════════════════════════════════════");
    println!("  State:    {}", snapshot.state);
    println!("  Progress: {}%", snapshot.progress);
    println!(
        "  Sent: {}  Failed: {}  Total: {}",
        snapshot.stats.sent, snapshot.stats.failed, snapshot.stats.total
    );

    if snapshot.attempts.is_empty() {
        println!("📭 No attempts recorded");
        return;
    }

    println!();
    println!("🎯 Attempts (most recent first):");
    println!("┌───────┬────────────────────────────────┬──────────┐");
    println!("│   Seq │ Recipient                      │ Outcome  │");
    println!("├───────┼────────────────────────────────┼──────────┤");
    for attempt in snapshot.attempts.iter().take(20) {
        println!(
            "│ {:>5} │ {:<30} │ {:<8} │",
            attempt.sequence,
            truncate_string(&attempt.recipient_label, 30),
            outcome_label(attempt.outcome)
        );
    }
    println!("└───────┴────────────────────────────────┴──────────┘");
    if snapshot.attempts.len() > 20 {
        println!("  ... and {} more attempts", snapshot.attempts.len() - 20);
    }
}

fn outcome_label(outcome: AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Pending => "pending",
        AttemptOutcome::Sent => "sent",
        AttemptOutcome::Failed => "failed",
        AttemptOutcome::Errored => "errored",
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
