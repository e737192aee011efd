use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use voicelink::settings::{default_settings_path, load_settings};
use voicelink::{AudioCaptureController, ConnectionManager, Role, WsConnector};

const HELP: &str = "\
Commands:
  /connect      open the session (done at startup)
  /close        close without reconnecting
  /record       start recording from the default microphone
  /stop         stop recording and send it
  /transcript   print the conversation
  /status       print connection state
  /diag         print diagnostics summary
  /events       print recent session events
  /errors       print recent errors
  /quit         exit
Anything else is sent as a text message.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Crypto provider for wss:// connections
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let path = default_settings_path()?;
    let mut settings =
        load_settings(&path).with_context(|| format!("loading settings from {:?}", path))?;
    settings.apply_env_overrides();
    settings.validate()?;

    let connector = Arc::new(WsConnector::new(settings.connect_timeout()));
    let (manager, mut notices) = ConnectionManager::spawn(settings, connector);
    let mut recorder = AudioCaptureController::with_default_device();

    manager.connect()?;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(notice) = notices.recv() => println!("* {}", notice),
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                recorder.collect_pending();

                match line {
                    "/quit" => break,
                    "/help" => println!("{}", HELP),
                    "/connect" => manager.connect()?,
                    "/close" => manager.close().await,
                    "/record" => match recorder.start_recording() {
                        Ok(()) => println!("* recording... /stop to send"),
                        Err(e) => println!("! {}", e),
                    },
                    "/stop" => match recorder.stop_recording() {
                        Ok(Some(blob)) => {
                            println!("* recorded {}ms", blob.duration_ms);
                            if let Err(e) = manager.send_recording(&blob).await {
                                println!("! {}", e);
                            }
                        }
                        Ok(None) => println!("! not recording"),
                        Err(e) => println!("! {}", e),
                    },
                    "/transcript" => {
                        for message in manager.transcript() {
                            let who = match message.role {
                                Role::User => "you",
                                Role::Assistant => "assistant",
                                Role::System => "system",
                            };
                            let marker = if message.is_streaming { " ..." } else { "" };
                            println!("{}: {}{}", who, message.content, marker);
                        }
                    }
                    "/status" => {
                        let status = manager.status();
                        println!("* {} (attempt {})", status.state, status.attempt.count);
                    }
                    "/diag" => {
                        let summary = manager.diagnostics().await;
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    }
                    "/events" => {
                        let events = manager.diagnostics_handle().lock().await.events();
                        for event in events.iter().rev() {
                            println!(
                                "{} {:<12} {}",
                                event.timestamp.format("%H:%M:%S%.3f"),
                                event.kind,
                                event.detail
                            );
                        }
                    }
                    "/errors" => {
                        let errors = manager.diagnostics_handle().lock().await.errors();
                        if errors.is_empty() {
                            println!("* no errors");
                        }
                        for error in errors.iter().rev() {
                            println!(
                                "{} [{}] {}",
                                error.timestamp.format("%H:%M:%S%.3f"),
                                error.error_type,
                                error.message
                            );
                        }
                    }
                    text => {
                        if let Err(e) = manager.send_text(text).await {
                            println!("! {}", e);
                        }
                    }
                }
            }
        }
    }

    if recorder.is_recording() {
        let _ = recorder.stop_recording();
    }
    manager.shutdown().await;
    Ok(())
}
