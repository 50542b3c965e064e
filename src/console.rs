//! Line oriented operator console.
//!
//! Reads commands from stdin, forwards them to the [`SessionHandle`] and
//! prints what the session exposes. It keeps no session state of its own.

use std::str::FromStr;

use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mqtt::{ConnectRequest, ConnectionState, SessionHandle, SessionView};

const HELP: &str = "\
commands:
  connect            connect to the configured broker
  disconnect         close the connection and drop the subscription
  sub <topic>        subscribe, replacing the current subscription
  unsub              unsubscribe and clear received messages
  target <topic>     set the publish topic
  untarget           reset the publish topic
  pub <text>         publish text to the publish topic
  show               print the received messages
  status             print connection, subscription and counters
  help               this text
  quit               exit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Connect,
    Disconnect,
    Subscribe(String),
    Unsubscribe,
    SetTarget(String),
    ClearTarget,
    Publish(String),
    Show,
    Status,
    Help,
    Quit,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseCommandError {
    #[error("Unknown command: {0} (try 'help')")]
    Unknown(String),

    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),
}

impl FromStr for ShellCommand {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_start();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest),
            None => (line.trim_end(), ""),
        };
        let argument = |name: &'static str| {
            let topic = rest.trim();
            if topic.is_empty() {
                Err(ParseCommandError::MissingArgument(name))
            } else {
                Ok(topic.to_string())
            }
        };

        match word {
            "connect" => Ok(ShellCommand::Connect),
            "disconnect" => Ok(ShellCommand::Disconnect),
            // empty topics go through so the session reports them
            "sub" => Ok(ShellCommand::Subscribe(rest.trim().to_string())),
            "unsub" => Ok(ShellCommand::Unsubscribe),
            "target" => argument("target").map(ShellCommand::SetTarget),
            "untarget" => Ok(ShellCommand::ClearTarget),
            // the body is passed untouched, the session normalizes it
            "pub" => Ok(ShellCommand::Publish(rest.to_string())),
            "show" => Ok(ShellCommand::Show),
            "status" => Ok(ShellCommand::Status),
            "help" | "?" => Ok(ShellCommand::Help),
            "quit" | "exit" => Ok(ShellCommand::Quit),
            other => Err(ParseCommandError::Unknown(other.to_string())),
        }
    }
}

pub fn render_status(view: &SessionView) -> String {
    let subscription = view
        .subscription
        .as_ref()
        .map(|s| s.topic.as_str())
        .unwrap_or("-");
    let target = view.publish_target.as_deref().unwrap_or("-");
    let mut status = format!(
        "state: {} | subscribed: {} | publish to: {} | received: {} | sent: {} | decode warnings: {}",
        view.connection_state,
        subscription,
        target,
        view.messages_received,
        view.messages_sent,
        view.decode_warnings
    );
    if let Some(error) = &view.last_error {
        status.push_str(&format!("\nlast error: {}", error));
    }
    status
}

pub fn render_messages(view: &SessionView) -> String {
    if view.messages.is_empty() {
        return "(no messages)".to_string();
    }
    view.messages
        .iter()
        .map(|record| record.render())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prints new messages and connection state changes as they happen.
fn spawn_renderer(mut view_rx: watch::Receiver<SessionView>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_state = view_rx.borrow().connection_state;
        let mut last_seq: Option<u64> = view_rx.borrow().messages.last().map(|r| r.seq);

        while view_rx.changed().await.is_ok() {
            let view = view_rx.borrow_and_update().clone();

            if view.connection_state != last_state {
                println!("[{}]", view.connection_state);
                if view.connection_state == ConnectionState::Failed {
                    if let Some(error) = &view.last_error {
                        println!("  {}", error);
                    }
                }
                last_state = view.connection_state;
            }

            for record in view
                .messages
                .iter()
                .filter(|r| last_seq.map_or(true, |seq| r.seq > seq))
            {
                println!("{}", record.render());
            }
            if let Some(record) = view.messages.last() {
                last_seq = Some(record.seq);
            }
        }
        debug!("Renderer stopped");
    })
}

pub struct Console {
    session: SessionHandle,
    connect_request: ConnectRequest,
}

impl Console {
    pub fn new(session: SessionHandle, connect_request: ConnectRequest) -> Self {
        Self {
            session,
            connect_request,
        }
    }

    pub async fn run(self) -> Result<()> {
        println!("{}", HELP);
        let renderer = spawn_renderer(self.session.watch());
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let command = match line.parse::<ShellCommand>() {
                Ok(command) => command,
                Err(e) => {
                    println!("{}", e);
                    continue;
                }
            };
            if command == ShellCommand::Quit {
                break;
            }
            self.execute(command).await;
        }

        info!("Console closed");
        renderer.abort();
        Ok(())
    }

    async fn execute(&self, command: ShellCommand) {
        let result = match command {
            ShellCommand::Connect => self.session.connect(self.connect_request.clone()).await,
            ShellCommand::Disconnect => self.session.disconnect().await,
            ShellCommand::Subscribe(topic) => self.session.subscribe(topic).await,
            ShellCommand::Unsubscribe => self.session.unsubscribe().await,
            ShellCommand::SetTarget(topic) => self.session.set_publish_target(topic).await,
            ShellCommand::ClearTarget => self.session.clear_publish_target().await,
            ShellCommand::Publish(body) => match self.session.publish(body).await {
                Ok(receipt) => {
                    println!("sent to {}: {}", receipt.topic, receipt.payload.trim_end());
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ShellCommand::Show => {
                println!("{}", render_messages(&self.session.view()));
                Ok(())
            }
            ShellCommand::Status => {
                println!("{}", render_status(&self.session.view()));
                Ok(())
            }
            ShellCommand::Help | ShellCommand::Quit => {
                println!("{}", HELP);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Command failed: {}", e);
            println!("error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::message_buffer::MessageRingBuffer;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(
            "sub sensors/temp".parse::<ShellCommand>(),
            Ok(ShellCommand::Subscribe("sensors/temp".into()))
        );
        assert_eq!(
            "target  cmd ".parse::<ShellCommand>(),
            Ok(ShellCommand::SetTarget("cmd".into()))
        );
        assert_eq!(
            "pub  42 ".parse::<ShellCommand>(),
            Ok(ShellCommand::Publish(" 42 ".into()))
        );
        assert_eq!("quit".parse::<ShellCommand>(), Ok(ShellCommand::Quit));
    }

    #[test]
    fn empty_subscribe_reaches_the_session() {
        assert_eq!("sub".parse::<ShellCommand>(), Ok(ShellCommand::Subscribe(String::new())));
    }

    #[test]
    fn rejects_unknown_and_incomplete_commands() {
        assert_eq!(
            "jump".parse::<ShellCommand>(),
            Err(ParseCommandError::Unknown("jump".into()))
        );
        assert_eq!(
            "target".parse::<ShellCommand>(),
            Err(ParseCommandError::MissingArgument("target"))
        );
    }

    #[test]
    fn status_shows_last_error() {
        let view = SessionView {
            connection_state: ConnectionState::Failed,
            last_error: Some("Connection Refused: not authorised.".into()),
            ..SessionView::default()
        };
        let status = render_status(&view);
        assert!(status.starts_with("state: failed"));
        assert!(status.contains("not authorised"));
    }

    #[test]
    fn messages_render_oldest_first() {
        let mut buffer = MessageRingBuffer::default();
        buffer.append("t", "first".into(), false);
        buffer.append("t", "second".into(), false);
        let view = SessionView {
            messages: buffer.snapshot(),
            ..SessionView::default()
        };
        let rendered = render_messages(&view);
        let first = rendered.find("first").unwrap();
        let second = rendered.find("second").unwrap();
        assert!(first < second);
        assert_eq!(render_messages(&SessionView::default()), "(no messages)");
    }
}
