use anyhow::{Context, Result};
use flume::Receiver;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use super::chat::{ChatView, Command, HELP_TEXT};
use crate::api::{ApiClient, FrontendEvent};

pub struct ChatApp {
    api_client: ApiClient,
    session_id: String,
    view: ChatView,
    event_rx: Receiver<FrontendEvent>,
    event_task: JoinHandle<()>,
}

impl ChatApp {
    /// Open a session with `character` (the backend default when `None`) and
    /// subscribe to its events.
    pub async fn start(api_client: ApiClient, character: Option<String>) -> Result<Self> {
        match api_client.health().await {
            Ok(health) => tracing::info!(
                "Backend up: collaborator '{}', {} character(s)",
                health.collaborator,
                health.characters
            ),
            Err(error) => tracing::warn!("Backend health check failed: {:#}", error),
        }

        let snapshot = api_client
            .create_session(character.as_deref())
            .await
            .context("Failed to start a conversation")?;
        tracing::info!("Session {} with {}", snapshot.id, snapshot.character_id);

        let (event_tx, event_rx) = flume::unbounded();
        let event_client = api_client.clone();
        let session_id = snapshot.id.clone();
        let event_task = tokio::spawn(async move {
            event_client.stream_events_forever(session_id, event_tx).await;
        });

        Ok(Self {
            api_client,
            session_id: snapshot.id.clone(),
            view: ChatView::new(&snapshot),
            event_rx,
            event_task,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        print_lines(self.view.header());
        println!("{}", HELP_TEXT);

        let mut input = BufReader::new(tokio::io::stdin()).lines();
        let mut events_open = true;
        loop {
            tokio::select! {
                line = input.next_line() => {
                    let Some(line) = line.context("Failed to read from stdin")? else {
                        break;
                    };
                    match Command::parse(&line) {
                        Command::Quit => break,
                        Command::Nothing => {}
                        Command::Help => println!("{}", HELP_TEXT),
                        Command::Reset => self.reset().await,
                        Command::Characters => self.list_characters().await,
                        Command::Say(text) => self.say(&text).await,
                    }
                }
                event = self.event_rx.recv_async(), if events_open => match event {
                    Ok(event) => print_lines(self.view.apply_event(event)),
                    Err(_) => {
                        tracing::warn!("Event stream closed; delayed replies will not show up");
                        events_open = false;
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn say(&mut self, text: &str) {
        if self.view.is_ended() {
            println!(
                "{} isn't reading your messages anymore. Type /reset to start over.",
                self.view.character()
            );
            return;
        }

        println!("{}", self.view.typing_label());
        match self.api_client.send_message(&self.session_id, text).await {
            Ok(outcome) => print_lines(self.view.absorb_outcome(outcome)),
            Err(error) => println!("(not delivered: {:#})", error),
        }
    }

    async fn reset(&mut self) {
        match self.api_client.reset_session(&self.session_id).await {
            Ok(snapshot) => print_lines(self.view.reset(&snapshot)),
            Err(error) => println!("(reset failed: {:#})", error),
        }
    }

    async fn list_characters(&self) {
        match self.api_client.list_characters().await {
            Ok(characters) => {
                for character in characters {
                    println!("  {}: {}", character.id, character.tagline);
                }
            }
            Err(error) => println!("(could not list characters: {:#})", error),
        }
    }

    async fn shutdown(self) {
        self.event_task.abort();
        if let Err(error) = self.api_client.close_session(&self.session_id).await {
            tracing::warn!("Failed to close session {}: {:#}", self.session_id, error);
        }
    }
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}
