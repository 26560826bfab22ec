//! Tribunal CLI - AI elimination debates
//!
//! Usage:
//!   tribunal init                         Write a default tribunal.toml
//!   tribunal new --player Ada --player Bo Create a game
//!   tribunal start <game>                 Play a game to the end
//!   tribunal resume                       Resume every running game
//!   tribunal stop <game>                  Stop a game
//!   tribunal status [game]                Show games and rounds
//!   tribunal transcript <game>            Print a game transcript

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tribunal_core::{GameId, GameSettings, Participant, TribunalConfig};
use tribunal_orchestrator::{
    game_transcript, render, BroadcastPublisher, GameEvent, GameOutcome, GameRunner, GameSummary,
};
use tribunal_store::{JsonStore, PersistenceGateway};

#[derive(Parser)]
#[command(name = "tribunal")]
#[command(author, version, about = "Multiplayer AI elimination debates")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding tribunal.toml
    #[arg(short = 'C', long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default tribunal.toml
    Init,

    /// Create a game in `preparing`
    New {
        /// Participant as NAME or NAME=MODEL (repeatable)
        #[arg(short, long = "player", value_name = "NAME[=MODEL]")]
        players: Vec<String>,

        /// TOML roster with [[participants]] name, model, background, personality
        #[arg(long, value_name = "FILE")]
        roster: Option<PathBuf>,

        /// Free-debate budget in seconds for this game
        #[arg(long)]
        round_time: Option<u64>,
    },

    /// Start a preparing game and play it to the end
    Start {
        game: GameId,

        /// Only print the final summary
        #[arg(short, long)]
        quiet: bool,
    },

    /// Resume every running game from its persisted state
    Resume {
        #[arg(short, long)]
        quiet: bool,
    },

    /// Mark a game finished
    Stop { game: GameId },

    /// Show games, or one game in detail
    Status { game: Option<GameId> },

    /// Print a game transcript
    Transcript {
        game: GameId,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    participants: Vec<RosterEntry>,
}

#[derive(Debug, Deserialize)]
struct RosterEntry {
    name: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    background: String,
    #[serde(default)]
    personality: String,
}

/// Everything a command needs, built from the config
struct App {
    config: Arc<TribunalConfig>,
    store: Arc<JsonStore>,
    publisher: Arc<BroadcastPublisher>,
}

impl App {
    async fn load(root: &Path) -> Result<Self> {
        let config = TribunalConfig::load_or_default(root).context("Failed to load configuration")?;
        let state_path = if config.storage.path.is_absolute() {
            config.storage.path.clone()
        } else {
            root.join(&config.storage.path)
        };
        let store = JsonStore::open(&state_path)
            .await
            .with_context(|| format!("Failed to open {}", state_path.display()))?;
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            publisher: Arc::new(BroadcastPublisher::default()),
        })
    }

    fn runner(&self) -> Result<GameRunner> {
        let provider = tribunal_provider::build_provider(&self.config.provider)?;
        Ok(GameRunner::new(
            self.store.clone(),
            self.publisher.clone(),
            provider,
            self.config.clone(),
        ))
    }

    /// Print a game's live events until its channel closes
    fn watch(&self, game: GameId) -> JoinHandle<()> {
        let mut events = Box::pin(self.publisher.subscribe_stream(game));
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                print_event(&event);
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init(&cli.root),
        Commands::New {
            players,
            roster,
            round_time,
        } => cmd_new(&cli.root, players, roster, round_time).await,
        Commands::Start { game, quiet } => cmd_start(&cli.root, game, quiet).await,
        Commands::Resume { quiet } => cmd_resume(&cli.root, quiet).await,
        Commands::Stop { game } => cmd_stop(&cli.root, game).await,
        Commands::Status { game } => cmd_status(&cli.root, game).await,
        Commands::Transcript { game, json } => cmd_transcript(&cli.root, game, json).await,
    }
}

fn cmd_init(root: &Path) -> Result<()> {
    let path = TribunalConfig::write_default(root)?;
    println!("Wrote {}", path.display());
    println!("\nNext steps:");
    println!("  1. Point [provider] at your Ollama or OpenAI-compatible endpoint");
    println!("  2. Run 'tribunal new --player Ada --player Bo --player Cy'");
    println!("  3. Run 'tribunal start <game>'");
    Ok(())
}

async fn cmd_new(root: &Path, players: Vec<String>, roster: Option<PathBuf>, round_time: Option<u64>) -> Result<()> {
    let app = App::load(root).await?;

    let mut seats: Vec<Participant> = players.iter().map(|spec| parse_player(spec)).collect::<Result<_>>()?;
    if let Some(path) = roster {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: RosterFile = toml::from_str(&content).context("Failed to parse roster")?;
        seats.extend(file.participants.into_iter().map(|e| {
            Participant::new(GameId::default(), e.name, e.model)
                .with_background(e.background)
                .with_personality(e.personality)
        }));
    }
    if seats.is_empty() {
        bail!("A game needs participants: pass --player or --roster");
    }

    let settings = GameSettings {
        round_time_secs: round_time,
    };
    let (game, seated) = app.runner()?.create_game(settings, seats).await?;

    println!("Created {} with {} participants", game.id, seated.len());
    for p in &seated {
        let model = if p.model.is_empty() {
            app.config.provider.default_model.as_str()
        } else {
            p.model.as_str()
        };
        println!("  {} {} ({})", p.id, p.display_name, model);
    }
    if seated.len() < app.config.game.min_participants {
        warn!(
            "{} needs at least {} participants before it can start",
            game.id, app.config.game.min_participants
        );
    }
    Ok(())
}

fn parse_player(spec: &str) -> Result<Participant> {
    let (name, model) = match spec.split_once('=') {
        Some((name, model)) => (name.trim(), model.trim()),
        None => (spec.trim(), ""),
    };
    if name.is_empty() {
        bail!("Invalid player '{}': empty name", spec);
    }
    Ok(Participant::new(GameId::default(), name, model))
}

async fn cmd_start(root: &Path, game: GameId, quiet: bool) -> Result<()> {
    let app = App::load(root).await?;
    let runner = app.runner()?;

    let watcher = (!quiet).then(|| app.watch(game));
    let result = runner.start_game(game).await;
    app.publisher.close(game);
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }

    print_summary(&result?);
    Ok(())
}

async fn cmd_resume(root: &Path, quiet: bool) -> Result<()> {
    let app = App::load(root).await?;
    let runner = app.runner()?;

    let running = app.store.running_games().await?;
    if running.is_empty() {
        println!("No running games");
        return Ok(());
    }
    let watchers: Vec<_> = if quiet {
        Vec::new()
    } else {
        running.iter().map(|g| app.watch(g.id)).collect()
    };

    let results = runner.resume_all().await?;
    for game in &running {
        app.publisher.close(game.id);
    }
    for watcher in watchers {
        let _ = watcher.await;
    }

    let mut failed = 0;
    for result in results {
        match result {
            Ok(summary) => print_summary(&summary),
            Err(e) => {
                failed += 1;
                eprintln!("Resume failed: {}", e);
            }
        }
    }
    if failed > 0 {
        bail!("{} game(s) failed to resume", failed);
    }
    Ok(())
}

async fn cmd_stop(root: &Path, game: GameId) -> Result<()> {
    let app = App::load(root).await?;
    let stopped = app.runner()?.stop_game(game).await?;
    info!(game_id = %stopped.id, "Stopped");
    println!("{} is {}", stopped.id, stopped.status);
    println!("A process still playing it abandons the round at its next phase change");
    Ok(())
}

async fn cmd_status(root: &Path, game: Option<GameId>) -> Result<()> {
    let app = App::load(root).await?;

    let Some(id) = game else {
        let games = app.store.games().await?;
        println!("Tribunal Status");
        println!("===============");
        if games.is_empty() {
            println!("\nNo games yet");
        }
        for g in games {
            let active = app.store.active_participants(g.id).await?.len();
            let rounds = app.store.rounds(g.id).await?.len();
            println!("{}  {:<9}  {} active  {} round(s)", g.id, g.status, active, rounds);
        }
        return Ok(());
    };

    let g = app
        .store
        .game(id)
        .await?
        .with_context(|| format!("{} not found", id))?;
    println!("{} ({})", g.id, g.status);
    println!("Debate budget: {}s", app.config.round_time(&g.settings).as_secs());

    println!("\nParticipants:");
    for p in app.store.participants(id).await? {
        let note = match p.elimination_round {
            Some(n) => format!("{} in round {}", p.status, n),
            None => p.status.to_string(),
        };
        println!("  {} {:<16} {}", p.id, p.display_name, note);
    }

    let rounds = app.store.rounds(id).await?;
    if !rounds.is_empty() {
        println!("\nRounds:");
    }
    for r in rounds {
        let eliminated = match r.eliminated_participant {
            Some(p) => format!(", eliminated {}", p),
            None => String::new(),
        };
        println!("  #{} {} [{}]{}", r.round_number, r.topic, r.phase, eliminated);
    }
    Ok(())
}

async fn cmd_transcript(root: &Path, game: GameId, json: bool) -> Result<()> {
    let app = App::load(root).await?;
    let entries = game_transcript(app.store.as_ref(), game).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        print!("{}", render(&entries));
    }
    Ok(())
}

fn print_summary(summary: &GameSummary) {
    let outcome = match summary.outcome {
        GameOutcome::Finished => "finished",
        GameOutcome::Abandoned => "abandoned",
    };
    let winners = summary
        .winners
        .iter()
        .map(|p| p.display_name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    println!(
        "\n{} {} after {} round(s). Winners: {}",
        summary.game_id,
        outcome,
        summary.rounds_played,
        if winners.is_empty() { "none" } else { winners.as_str() }
    );
}

fn print_event(event: &GameEvent) {
    let mut out = std::io::stdout().lock();
    let _ = match event {
        GameEvent::RoundStart {
            round_number,
            topic,
            is_resume,
            participants,
            ..
        } => {
            let names = participants.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ");
            let resumed = if *is_resume { " (resumed)" } else { "" };
            writeln!(out, "\n=== Round {}{}: {} ===\n    {}", round_number, resumed, topic, names)
        }
        GameEvent::SystemMessage { content, .. } => writeln!(out, "* {}", content),
        GameEvent::PhaseStarted { .. } => Ok(()),
        GameEvent::MessageStart { speaker, .. } => write!(out, "{}: ", speaker.name),
        GameEvent::MessageChunk { delta, .. } => write!(out, "{}", delta),
        GameEvent::MessageComplete { .. } => writeln!(out),
        GameEvent::MessageError { kind, error, .. } => writeln!(out, "\n    [{}] {}", kind, error),
        GameEvent::Speech {
            speaker,
            content,
            is_fallback,
            ..
        } => {
            let tag = if *is_fallback { " [fallback]" } else { "" };
            writeln!(out, "{}{}: {}", speaker.name, tag, content)
        }
        GameEvent::VotingTable { table, .. } => {
            let _ = writeln!(out, "[{}] {}/{} votes", table.title, table.total_votes, table.total_participants);
            table
                .candidates
                .iter()
                .try_for_each(|c| writeln!(out, "  {} - {}", c.name, c.vote_count))
        }
        GameEvent::VotingResult { candidates, is_tie, .. } => {
            let names = candidates.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ");
            let verdict = if *is_tie { "Tied" } else { "Most votes" };
            writeln!(out, "{}: {}", verdict, names)
        }
        GameEvent::RoundEnded {
            eliminated, survivors, ..
        } => {
            let loser = eliminated.as_ref().map(|p| p.name.as_str()).unwrap_or("nobody");
            writeln!(out, "Eliminated: {} ({} survive)", loser, survivors.len())
        }
        GameEvent::GameEnded { message, .. } => writeln!(out, "\n{}", message),
        GameEvent::SystemError { error, .. } => writeln!(out, "! {}", error),
    };
    let _ = out.flush();
}
