mod commands;
mod config;
mod deck;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use commands::{CallCommand, Command};
use config::AppConfig;
use logging::{LogConfig, LogLevel};
use realtime_bus::phoenix::{PhoenixConfig, PhoenixRealtime};
use reading_session::{
    AccessMethod, EngineDeps, FileLocalStore, Identity, PostgrestRowStore, SessionEngine,
    SessionEvent, SessionPatch, StaticIdentity, WebRtcMedia,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "reading-sync", about = "Host or join a shared tarot reading")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "READING_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Start a new session as its host.
    Host {
        #[arg(long)]
        deck: Option<String>,
    },
    /// Join an existing session.
    Join {
        session_id: String,
        #[arg(long, help = "Joining through an invite link")]
        invite: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let cfg = AppConfig::from_env().context("reading READING_* configuration")?;

    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone().or_else(|| cfg.log_path.clone().map(PathBuf::from)),
    })?;

    let (engine, identity) = build_engine(&cfg)?;
    let session_id = match &cli.mode {
        Mode::Host { deck } => engine.create(deck.as_deref()).await,
        Mode::Join { session_id, invite } => {
            let access = if *invite {
                AccessMethod::Invite
            } else {
                AccessMethod::Direct
            };
            engine.join(session_id, access).await?
        }
    };
    println!(
        "session {session_id} ({}{})",
        if engine.is_host() { "host" } else { "guest" },
        if engine.is_offline() { ", offline" } else { "" }
    );
    println!("type `help` for commands");

    let printer = tokio::spawn(print_events(engine.clone()));
    let result = command_loop(&engine, &identity).await;
    printer.abort();
    result
}

fn build_engine(cfg: &AppConfig) -> anyhow::Result<(SessionEngine, Arc<StaticIdentity>)> {
    let project = cfg
        .supabase_url
        .as_deref()
        .ok_or_else(|| anyhow!("READING_SUPABASE_URL is not set"))?;
    let project = Url::parse(project).context("invalid READING_SUPABASE_URL")?;
    let api_key = cfg
        .supabase_anon_key
        .clone()
        .ok_or_else(|| anyhow!("READING_SUPABASE_ANON_KEY is not set"))?;

    let rows = PostgrestRowStore::new(&project, api_key.clone(), cfg.tables())?
        .with_access_token(cfg.access_token.clone());
    let mut realtime = PhoenixConfig::from_project_url(&project, api_key)?;
    realtime.access_token = cfg.access_token.clone();

    let data_dir = cfg
        .data_dir()
        .ok_or_else(|| anyhow!("no data directory; set READING_DATA_DIR"))?;
    let local = FileLocalStore::open(&data_dir)
        .with_context(|| format!("opening local store at {}", data_dir.display()))?;
    info!(data_dir = %data_dir.display(), "local store ready");

    let identity = match (&cfg.user_id, &cfg.anonymous_id) {
        (Some(user), _) => Some(Identity::User(user.clone())),
        (None, Some(anon)) => Some(Identity::Anonymous(anon.clone())),
        (None, None) => None,
    };
    let identity = Arc::new(StaticIdentity::new(identity, cfg.display_name.clone()));

    let engine = SessionEngine::new(EngineDeps {
        rows: Arc::new(rows),
        realtime: PhoenixRealtime::new(realtime),
        local: Arc::new(local),
        identity: identity.clone(),
        media: WebRtcMedia::new(cfg.call())?,
        config: cfg.sync.clone(),
    });
    Ok((engine, identity))
}

async fn command_loop(engine: &SessionEngine, identity: &StaticIdentity) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            engine.leave().await;
            return Ok(());
        };
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };
        match command {
            Command::Quit => {
                engine.leave().await;
                return Ok(());
            }
            Command::End => {
                engine.end_session().await?;
                println!("session closed");
                return Ok(());
            }
            other => {
                if let Err(err) = run(engine, identity, other).await {
                    eprintln!("{err}");
                }
            }
        }
    }
}

async fn run(
    engine: &SessionEngine,
    identity: &StaticIdentity,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Question(text) => engine.update(SessionPatch::question(text)).await?,
        Command::Layout(name) => {
            engine
                .update(SessionPatch {
                    selected_layout: Some(Some(name)),
                    ..SessionPatch::default()
                })
                .await?
        }
        Command::Step(step) => engine.update(SessionPatch::step(step)).await?,
        Command::Shuffle => {
            engine
                .update(SessionPatch {
                    shuffled_deck: Some(deck::shuffled(&mut rand::thread_rng())),
                    selected_cards: Some(Vec::new()),
                    ..SessionPatch::default()
                })
                .await?
        }
        Command::Draw => {
            let record = engine
                .snapshot()
                .ok_or_else(|| anyhow!("no active session"))?;
            let card = deck::next_draw(&record, &mut rand::thread_rng())
                .ok_or_else(|| anyhow!("deck is empty, try `shuffle`"))?;
            println!(
                "drew {}{}",
                card.card.name,
                if card.is_reversed { " (reversed)" } else { "" }
            );
            engine.draw_card(card).await?
        }
        Command::Interpret(text) => {
            engine
                .update(SessionPatch {
                    interpretation: Some(Some(text)),
                    ..SessionPatch::default()
                })
                .await?
        }
        Command::Zoom(level) => {
            engine
                .update(SessionPatch {
                    zoom_level: Some(level),
                    ..SessionPatch::default()
                })
                .await?
        }
        Command::Call(CallCommand::Join) => engine.join_call().await?,
        Command::Call(CallCommand::Leave) => engine.leave_call().await?,
        Command::Show => match engine.snapshot() {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("no active session"),
        },
        Command::Who => print_roster(engine),
        Command::SignIn { user_id, name } => {
            identity.sign_in(user_id, name);
            engine.upgrade_identity().await?;
            println!("signed in");
        }
        Command::Sync => println!("{:?}", engine.run_sync_cycle().await),
        Command::Help => println!("{}", commands::HELP),
        Command::End | Command::Quit => {}
    }
    Ok(())
}

fn print_roster(engine: &SessionEngine) {
    let presence = engine.presence();
    for participant in engine.participants() {
        let online = presence
            .iter()
            .find(|meta| meta.participant_id == participant.id);
        println!(
            "{} {}{}{}",
            participant.id,
            participant.name,
            if participant.is_host() { " [host]" } else { "" },
            match online {
                Some(meta) if meta.in_call => " (online, in call)",
                Some(_) => " (online)",
                None => "",
            }
        );
    }
    for (peer, state) in engine.call_peers() {
        println!("call link {peer}: {state:?}");
    }
}

async fn print_events(engine: SessionEngine) {
    let mut events = engine.subscribe();
    loop {
        match events.recv().await {
            Ok(SessionEvent::Updated(record)) => println!(
                "~ step={} cards={} question={}",
                record.reading_step,
                record.selected_cards.len(),
                record.question.as_deref().unwrap_or("-")
            ),
            Ok(SessionEvent::Migrated { from, to }) => println!("~ {from} is now {to}"),
            Ok(SessionEvent::Offline) => println!("~ working offline"),
            Ok(SessionEvent::Ended) => println!("~ session ended"),
            Ok(SessionEvent::PresenceChanged(metas)) => println!("~ {} online", metas.len()),
            Ok(SessionEvent::ParticipantsChanged(list)) => {
                println!("~ {} participants", list.len())
            }
            Ok(SessionEvent::Call(event)) => println!("~ call: {event:?}"),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
