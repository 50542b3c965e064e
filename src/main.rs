pub mod config;
pub mod console;
pub mod credentials;
pub mod mqtt;

use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::console::Console;
use crate::mqtt::{ConnectionState, MqttConnector, SessionHandle, EVENT_QUEUE_DEPTH};

/// Terminal MQTT client: subscribe to a topic, watch its latest messages and publish.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Config file, created with defaults if missing [default: ~/.config/mqttify/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup()?;

    let config_path = args.config.unwrap_or_else(Config::default_path);
    let config = Config::load_or_create(&config_path).await?;
    info!(
        "Using broker {}:{} ({})",
        config.broker.host, config.broker.port, config.broker.tls
    );

    let credentials = credentials::read_credentials(&config.credentials_file).await?;
    let connect_request = config.connect_request(credentials).await?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let connector = MqttConnector::new(events_tx);
    let (session, worker) = SessionHandle::spawn(connector, events_rx);

    if let Err(e) = session.connect(connect_request.clone()).await {
        warn!("Initial connect failed: {}", e);
    }
    apply_startup_topics(&session, &config).await;

    Console::new(session.clone(), connect_request).run().await?;

    session.shutdown();
    if let Err(e) = worker.await {
        error!("Session worker ended abnormally: {}", e);
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Applies the topics preset in the config once the first connection is up.
async fn apply_startup_topics(session: &SessionHandle, config: &Config) {
    if let Some(topic) = &config.publish_topic {
        if let Err(e) = session.set_publish_target(topic.clone()).await {
            warn!("Could not set publish topic {}: {}", topic, e);
        }
    }

    let Some(topic) = config.subscribe_topic.clone() else {
        return;
    };
    let session = session.clone();
    tokio::spawn(async move {
        let mut view_rx = session.watch();
        let reached = view_rx
            .wait_for(|view| {
                matches!(
                    view.connection_state,
                    ConnectionState::Connected | ConnectionState::Failed
                )
            })
            .await
            .map(|view| view.connection_state);
        match reached {
            Ok(ConnectionState::Connected) => {
                if let Err(e) = session.subscribe(topic.clone()).await {
                    warn!("Could not subscribe to {}: {}", topic, e);
                }
            }
            Ok(state) => info!("Not subscribing to {}, connection {}", topic, state),
            Err(_) => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use clap::CommandFactory;

    #[test]
    fn command_line_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn config_path_is_optional() {
        let args = Args::try_parse_from(["mqttify"]).unwrap();
        assert_eq!(args.config, None);
    }

    #[test]
    fn config_path_accepts_short_long_and_equals_forms() {
        for argv in [
            vec!["mqttify", "-c", "/tmp/a.toml"],
            vec!["mqttify", "--config", "/tmp/a.toml"],
            vec!["mqttify", "--config=/tmp/a.toml"],
        ] {
            let args = Args::try_parse_from(argv).unwrap();
            assert_eq!(args.config, Some(PathBuf::from("/tmp/a.toml")));
        }
    }

    #[test]
    fn help_is_printed_instead_of_failing() {
        let err = Args::try_parse_from(["mqttify", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);

        let err = Args::try_parse_from(["mqttify", "--bogus"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
    }
}
