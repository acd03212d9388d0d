use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::{
    io::{self, BufRead, Write},
    sync::Arc,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

mod api;
mod captcha;
mod config;
mod contacts;
mod error;
mod events;
mod lyrics;
mod manager;
mod notify;
mod poller;
mod profanity;
mod share;
mod store;
mod style;
mod task;
mod types;

use captcha::{Heart, HeartChallenge, ThrottleStatus, VerificationThrottle};
use config::AppConfig;
use contacts::ContactBook;
use error::SubmitError;
use events::EventHub;
use lyrics::{LyricKind, LyricsGenerator};
use manager::{ManagerSettings, TaskManager};
use notify::{Dispatcher, EmailJsClient, EmailSender, SmsGatewayClient, SmsSender};
use poller::Poller;
use profanity::ProfanityFilter;
use share::SharePayload;
use store::{FileStore, KeyValueStore};
use style::{Era, Genre, Mood, StyleOptions, Voice};
use task::{GenerationTask, TaskStatus};

#[derive(Parser)]
#[command(name = "serenade", version, about = "Turn lyrics into a song and share it")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit lyrics for rendering.
    Submit {
        lyrics: String,
        #[command(flatten)]
        style: StyleArgs,
        /// Solve a heart challenge first.
        #[arg(long)]
        verify: bool,
        /// Keep polling until the song is ready.
        #[arg(long)]
        watch: bool,
    },
    /// Write lyrics from a short idea.
    Lyrics {
        idea: String,
        #[arg(long, value_enum, default_value_t = LyricKind::Romantic)]
        kind: LyricKind,
    },
    /// Show the generation history, newest first.
    List,
    /// Poll pending tasks until none remain.
    Watch,
    /// Resubmit a failed task with its original lyrics and style.
    Retry {
        task_id: String,
        #[arg(long)]
        watch: bool,
    },
    Remove {
        task_id: String,
    },
    /// Forget every task.
    Clear,
    #[command(subcommand)]
    Contact(ContactCommand),
    /// Build a share link for a finished song.
    Share {
        task_id: String,
        #[arg(long, value_enum, default_value_t = Channel::Link)]
        via: Channel,
        /// Recipient email address or phone number.
        #[arg(long)]
        to: Option<String>,
    },
    /// Decode a share link.
    Open {
        link: String,
    },
    /// Solve a heart challenge.
    Verify {
        #[arg(long, value_enum)]
        pick: Option<Heart>,
    },
}

#[derive(Args, Default)]
struct StyleArgs {
    #[arg(long, value_enum, default_value_t = Voice::Male)]
    voice: Voice,
    #[arg(long, value_enum)]
    genre: Option<Genre>,
    #[arg(long, value_enum)]
    mood: Option<Mood>,
    #[arg(long, value_enum)]
    era: Option<Era>,
}

impl From<StyleArgs> for StyleOptions {
    fn from(args: StyleArgs) -> Self {
        Self { voice: args.voice, genre: args.genre, mood: args.mood, era: args.era }
    }
}

#[derive(Subcommand)]
enum ContactCommand {
    Email { address: String },
    Phone { number: String },
    Show,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Channel {
    Link,
    Email,
    Sms,
    Whatsapp,
    Facebook,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing()?;
    let cli = Cli::parse();
    let config = AppConfig::load()?;
    let app = App::build(config)?;
    app.run(cli.command).await
}

fn setup_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .try_init()
        .map_err(|err: Box<dyn std::error::Error + Send + Sync>| {
            anyhow!("failed to initialise tracing: {err}")
        })?;
    Ok(())
}

struct App {
    config: AppConfig,
    http: reqwest::Client,
    store: Arc<dyn KeyValueStore>,
    manager: Arc<TaskManager>,
}

impl App {
    fn build(config: AppConfig) -> Result<Self> {
        let data_dir = match config.data_dir() {
            Some(dir) => dir.to_path_buf(),
            None => FileStore::default_dir()?,
        };
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&data_dir)?);
        debug!(data_dir = %data_dir.display(), "opened local store");

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .context("failed to build HTTP client")?;
        let client = api::Client::new(config.api_base_url(), config.api_key().map(str::to_string))?;
        debug!(base = %client.base_url(), "music API client ready");

        let notifier = Arc::new(Dispatcher::from_config(&config, http.clone()));
        let manager = TaskManager::load(
            Arc::new(client),
            store.clone(),
            notifier,
            EventHub::default(),
            ManagerSettings::from_config(&config),
        )?;
        Ok(Self { config, http, store, manager: Arc::new(manager) })
    }

    async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Submit { lyrics, style, verify, watch } => {
                if verify && !self.verify(None)? {
                    bail!("verification failed, nothing submitted");
                }
                self.submit(&lyrics, style.into(), watch).await
            }
            Command::Lyrics { idea, kind } => {
                let generator = LyricsGenerator::from_config(&self.config, self.http.clone());
                let lyrics = generator.generate(&idea, kind).await?;
                println!("{lyrics}");
                Ok(())
            }
            Command::List => {
                self.print_history().await;
                Ok(())
            }
            Command::Watch => self.watch().await,
            Command::Retry { task_id, watch } => {
                let new_id = self.manager.retry(&task_id).await.map_err(|err| self.explain(err))?;
                println!("Retrying {task_id} as {new_id}");
                if watch {
                    self.watch().await?;
                }
                Ok(())
            }
            Command::Remove { task_id } => {
                if !self.manager.remove(&task_id).await? {
                    bail!("no task with id {task_id}");
                }
                println!("Removed {task_id}");
                Ok(())
            }
            Command::Clear => {
                self.manager.clear_all().await?;
                println!("History cleared");
                Ok(())
            }
            Command::Contact(command) => self.contact(command),
            Command::Share { task_id, via, to } => self.share(&task_id, via, to.as_deref()).await,
            Command::Open { link } => {
                let payload = share::decode(&link)?;
                println!("{}", payload.title);
                println!("  from: {}", payload.sender);
                println!("  listen: {}", payload.url);
                Ok(())
            }
            Command::Verify { pick } => {
                if self.verify(pick)? {
                    println!("Verified 💝");
                    Ok(())
                } else {
                    bail!("verification failed")
                }
            }
        }
    }

    async fn submit(&self, lyrics: &str, style: StyleOptions, watch: bool) -> Result<()> {
        let (cleaned, filtered) = ProfanityFilter::default().clean_text(lyrics);
        if filtered {
            warn!(
                "Please keep the content family-friendly. Inappropriate words have been removed."
            );
        }
        let task = self.manager.submit(&cleaned, style).await.map_err(|err| self.explain(err))?;
        println!("Submitted {} ({})", task.id, style.description());
        if watch {
            self.watch().await?;
        }
        Ok(())
    }

    async fn watch(&self) -> Result<()> {
        let poller = Poller::new(self.manager.clone(), self.config.poll_interval());
        let mut events = self.manager.events().subscribe();
        if !poller.ensure_running().await {
            println!("Nothing pending");
            return Ok(());
        }
        info!(pending = self.manager.pending_ids().await.len(), "watching pending tasks");

        let finished = poller.join();
        tokio::pin!(finished);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => println!("{}", event.describe()),
                    Err(RecvError::Lagged(missed)) => debug!(missed, "event listener fell behind"),
                    Err(RecvError::Closed) => break,
                },
                _ = &mut finished => break,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for Ctrl-C")?;
                    poller.stop();
                    println!("Stopped watching; pending tasks resume on the next watch");
                    break;
                }
            }
        }
        while let Ok(event) = events.try_recv() {
            println!("{}", event.describe());
        }
        Ok(())
    }

    async fn print_history(&self) {
        let tasks = self.manager.snapshot().await;
        if tasks.is_empty() {
            println!("No songs yet");
            return;
        }
        for task in &tasks {
            println!("{}", history_line(task));
            if let Some(song) = task.first_playable() {
                let url = share::absolute_song_url(self.config.media_base_url(), &song.song_path);
                println!("    {url}");
            }
            if let Some(error) = &task.error {
                println!("    {error}");
            }
        }
    }

    fn contact(&self, command: ContactCommand) -> Result<()> {
        let book = ContactBook::new(self.store.clone());
        match command {
            ContactCommand::Email { address } => {
                book.set_email(&address)?;
                println!("Notifications will go to {}", address.trim());
            }
            ContactCommand::Phone { number } => {
                book.set_phone(&number)?;
                println!("SMS notifications enabled");
            }
            ContactCommand::Show => {
                let contacts = book.load()?;
                println!("email: {}", contacts.email.as_deref().unwrap_or("-"));
                println!("phone: {}", contacts.phone.as_deref().unwrap_or("-"));
            }
            ContactCommand::Clear => {
                book.clear()?;
                println!("Contact details cleared");
            }
        }
        Ok(())
    }

    async fn share(&self, task_id: &str, via: Channel, to: Option<&str>) -> Result<()> {
        let task = self
            .manager
            .get(task_id)
            .await
            .ok_or_else(|| anyhow!("no task with id {task_id}"))?;
        let song = task
            .first_playable()
            .ok_or_else(|| anyhow!("task {task_id} has no finished song to share"))?;
        let payload = SharePayload {
            url: share::absolute_song_url(self.config.media_base_url(), &song.song_path),
            title: task.title(),
            sender: self.config.sender_name().to_string(),
        };
        let long_link = share::play_url(self.config.share_base_url(), &payload);
        let link = if self.config.shorten_links() {
            share::shorten(&self.http, &long_link).await
        } else {
            long_link
        };

        match via {
            Channel::Link => println!("{link}"),
            Channel::Whatsapp => {
                let message =
                    share::whatsapp_message(&payload.title, &link, self.config.share_base_url());
                println!("{}", share::whatsapp_url(&message)?);
            }
            Channel::Facebook => println!("{}", share::facebook_url(&link)?),
            Channel::Email => {
                let to = to.ok_or_else(|| anyhow!("--to <email> is required"))?;
                contacts::validate_email(to)?;
                let sender = EmailJsClient::from_config(&self.config, self.http.clone())
                    .ok_or_else(|| anyhow!("email delivery is not configured"))?;
                sender.send_share(to, &payload.title, &link, &payload.sender).await?;
                println!("Song shared with {to}");
            }
            Channel::Sms => {
                let to = to.ok_or_else(|| anyhow!("--to <phone> is required"))?;
                let phone = contacts::validate_local_phone(to)?;
                let sender = SmsGatewayClient::from_config(&self.config, self.http.clone())
                    .ok_or_else(|| anyhow!("SMS delivery is not configured"))?;
                let message =
                    share::sms_message(&payload.title, &link, self.config.sms().max_chars);
                sender.send_sms(&phone, &message).await?;
                println!("Song shared by SMS");
            }
        }
        Ok(())
    }

    /// Runs one heart challenge against the persisted throttle. With no
    /// `pick`, the choice is read from stdin.
    fn verify(&self, pick: Option<Heart>) -> Result<bool> {
        let throttle = VerificationThrottle::new(self.store.clone());
        if let ThrottleStatus::Locked { remaining_secs } = throttle.status(Utc::now())? {
            bail!("Too many attempts. Please wait {remaining_secs} seconds before trying again.");
        }

        let challenge = HeartChallenge::random();
        let target = challenge.target();
        let choice = match pick {
            Some(choice) => choice,
            None => prompt_for_heart(target)?,
        };
        let passed = challenge.check(choice);
        match throttle.record(passed, Utc::now())? {
            _ if passed => {}
            ThrottleStatus::Open { attempts_left } => {
                println!("That's not the {}. Attempts remaining: {attempts_left}", target.name());
            }
            ThrottleStatus::Locked { remaining_secs } => {
                println!("Too many attempts. Please wait {remaining_secs} seconds.");
            }
        }
        Ok(passed)
    }

    fn explain(&self, err: SubmitError) -> anyhow::Error {
        match err.action_link(self.config.account_url()) {
            Some(link) => anyhow!("{err}\nTop up your credits at {link}"),
            None => anyhow!(err),
        }
    }
}

fn prompt_for_heart(target: Heart) -> Result<Heart> {
    println!("To continue, please find and select this heart: {}", target.emoji());
    for (index, heart) in Heart::ALL.iter().enumerate() {
        println!("  {}) {} {}", index + 1, heart.emoji(), heart.name());
    }
    print!("> ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let index: usize = line.trim().parse().context("enter the number next to a heart")?;
    index
        .checked_sub(1)
        .and_then(|index| Heart::ALL.get(index).copied())
        .ok_or_else(|| anyhow!("pick a number between 1 and {}", Heart::ALL.len()))
}

fn history_line(task: &GenerationTask) -> String {
    let marker = match task.status {
        TaskStatus::Pending => "…",
        TaskStatus::Completed => "♪",
        TaskStatus::Failed => "✗",
    };
    let when = task.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M");
    let title = match task.status {
        TaskStatus::Completed => task.title(),
        _ => preview(&task.prompt, 40),
    };
    format!("{marker} {} [{}] {when}  {title}", task.id, task.status.as_str())
}

fn preview(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    share::bounded_message(line, max_chars)
}
