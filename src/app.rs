use clap::{Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::CacheSource;
use crate::config::Config;
use crate::connection::{ConnectionManager, RetryPolicy};
use crate::entity::{Collection, Entity, EntityKind, Fields};
use crate::health::HealthMonitor;
use crate::local::{new_entity_draft_key, Draft, LocalState};
use crate::remote::rest::RestConnector;
use crate::store::{FatalLoadError, StoreEvent, SyncStore};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// List a collection, newest first
  List {
    kind: EntityKind,
    /// Only entities visible to the signed-in user
    #[arg(long)]
    mine: bool,
    /// Ignore the cache and refetch
    #[arg(long)]
    refresh: bool,
  },
  /// Create an entity from a JSON object
  Create { kind: EntityKind, payload: String },
  /// Apply a partial JSON update to an entity
  Update {
    kind: EntityKind,
    id: String,
    payload: String,
  },
  Delete { kind: EntityKind, id: String },
  /// Count a view of an entity
  View { kind: EntityKind, id: String },
  /// Load everything and print changes until interrupted
  Watch,
  Login {
    email: String,
    /// Read from stdin when omitted
    #[arg(long)]
    password: Option<String>,
  },
  Logout,
  Whoami,
  /// Manage the locally saved "new entity" drafts
  Draft {
    #[command(subcommand)]
    action: DraftAction,
  },
  Theme {
    #[command(subcommand)]
    action: ThemeAction,
  },
}

#[derive(Subcommand, Debug)]
pub enum DraftAction {
  /// Save (or overwrite) the draft for a kind
  Save { kind: EntityKind, payload: String },
  Show { kind: EntityKind },
  Discard { kind: EntityKind },
  /// Create the entity from the draft and clear it on success
  Submit { kind: EntityKind },
}

#[derive(Subcommand, Debug)]
pub enum ThemeAction {
  Get,
  Set { mode: ThemeMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ThemeMode {
  Light,
  Dark,
}

pub async fn run(config_path: Option<&Path>, command: Command) -> Result<()> {
  let local = LocalState::open()?;

  // Local-only commands need neither config nor network
  match command {
    Command::Theme { action } => theme(&local, action),
    Command::Draft { action } if !matches!(action, DraftAction::Submit { .. }) => draft(&local, action),
    command => {
      let config = Config::load(config_path)?;
      let mut app = App::connect(config, local).await?;
      app.execute(command).await
    }
  }
}

fn theme(local: &LocalState, action: ThemeAction) -> Result<()> {
  match action {
    ThemeAction::Get => {
      let mode = if local.dark_mode()? { "dark" } else { "light" };
      println!("{}", mode);
    }
    ThemeAction::Set { mode } => local.set_dark_mode(mode == ThemeMode::Dark)?,
  }
  Ok(())
}

fn draft(local: &LocalState, action: DraftAction) -> Result<()> {
  match action {
    DraftAction::Save { kind, payload } => {
      local.save_draft(&new_entity_draft_key(kind), &parse_fields(&payload)?)?;
    }
    DraftAction::Show { kind } => match local.load_draft::<Fields>(&new_entity_draft_key(kind))? {
      Some(Draft { data, updated_at }) => {
        println!("saved {}", updated_at.format("%Y-%m-%d %H:%M:%S"));
        println!("{}", serde_json::to_string_pretty(&data)?);
      }
      None => println!("no draft for new {}", kind),
    },
    DraftAction::Discard { kind } => {
      if !local.clear_draft(&new_entity_draft_key(kind))? {
        println!("no draft for new {}", kind);
      }
    }
    DraftAction::Submit { .. } => return Err(eyre!("submitting a draft needs a connection")),
  }
  Ok(())
}

/// A connected client session: the sync store plus what it needs around it.
struct App {
  config: Config,
  store: Arc<SyncStore>,
  events: mpsc::UnboundedReceiver<StoreEvent>,
  connector: Arc<RestConnector>,
  local: LocalState,
}

impl App {
  async fn connect(config: Config, local: LocalState) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let policy = RetryPolicy::from(&config.retry);
    let connector = Arc::new(RestConnector::new(&config.remote.url, api_key, policy.request_timeout)?);

    let saved_token = local.auth_token()?;
    if let Some(token) = &saved_token {
      connector.restore_session(token.clone());
    }

    let conn = Arc::new(ConnectionManager::start(connector.clone(), policy).await);
    let (store, events) = SyncStore::new(conn, config.sync.clone(), local.session_id().to_string());
    let app = Self {
      config,
      store: Arc::new(store),
      events,
      connector,
      local,
    };

    if saved_token.is_some() {
      app.resume_session().await?;
    }
    Ok(app)
  }

  /// Check a saved sign-in against the remote and forget it if it expired.
  async fn resume_session(&self) -> Result<()> {
    match self.store.current_session().await {
      Ok(Some(user)) => info!(user = %user.id, "resumed session"),
      Ok(None) => {
        info!("saved session expired");
        self.local.set_auth_token(None)?;
      }
      Err(e) => warn!(error = %e, "could not verify saved session"),
    }
    Ok(())
  }

  async fn execute(&mut self, command: Command) -> Result<()> {
    match command {
      Command::List { kind, mine, refresh } => self.list(kind, mine, refresh).await,
      Command::Create { kind, payload } => {
        let entity = self.store.create(kind, parse_fields(&payload)?).await?;
        print_entity(&entity)
      }
      Command::Update { kind, id, payload } => {
        let entity = self.store.update(kind, &id, parse_fields(&payload)?).await?;
        print_entity(&entity)
      }
      Command::Delete { kind, id } => {
        self.store.delete(kind, &id).await?;
        println!("deleted {} {}", kind, id);
        Ok(())
      }
      Command::View { kind, id } => {
        let counted = self.store.record_view(kind, &id).await?;
        let title = self
          .store
          .collection(kind)
          .get(&id)
          .and_then(|e| e.title().map(str::to_string))
          .unwrap_or(id);
        if counted {
          println!("view of {} recorded", title);
        } else {
          println!("view of {} already counted", title);
        }
        Ok(())
      }
      Command::Watch => self.watch().await,
      Command::Login { email, password } => {
        let password = match password {
          Some(p) => p,
          None => prompt("Password: ")?,
        };
        let user = self.store.sign_in(&email, &password).await?;
        self.local.set_auth_token(self.connector.access_token().as_deref())?;
        println!("signed in as {} ({:?})", user.email.as_deref().unwrap_or(&user.id), user.role);
        Ok(())
      }
      Command::Logout => {
        self.store.sign_out().await?;
        self.local.set_auth_token(None)?;
        println!("signed out");
        Ok(())
      }
      Command::Whoami => {
        match self.store.current_user().await? {
          Some(user) => println!(
            "{} {} ({:?})",
            user.id,
            user.email.as_deref().unwrap_or("-"),
            user.role
          ),
          None => println!("not signed in"),
        }
        Ok(())
      }
      Command::Draft {
        action: DraftAction::Submit { kind },
      } => self.submit_draft(kind).await,
      Command::Draft { action } => draft(&self.local, action),
      Command::Theme { action } => theme(&self.local, action),
    }
  }

  async fn list(&self, kind: EntityKind, mine: bool, refresh: bool) -> Result<()> {
    let collection = if mine {
      self.store.refresh_owned(kind).await?
    } else {
      let result = self.store.refresh(kind, refresh).await?;
      if result.source == CacheSource::Offline {
        let when = result
          .cached_at
          .map(|t| t.format("%H:%M:%S").to_string())
          .unwrap_or_else(|| "earlier".into());
        eprintln!("remote unreachable, showing data from {}", when);
      }
      result.data
    };
    print_collection(&collection);
    Ok(())
  }

  async fn submit_draft(&self, kind: EntityKind) -> Result<()> {
    let key = new_entity_draft_key(kind);
    let draft = self
      .local
      .load_draft::<Fields>(&key)?
      .ok_or_else(|| eyre!("no draft for new {}", kind))?;
    let entity = self.store.create(kind, draft.data).await?;
    self.local.clear_draft(&key)?;
    print_entity(&entity)
  }

  async fn watch(&mut self) -> Result<()> {
    let report = self.store.start(confirm_reload).await?;
    info!(state = ?self.store.load_state(), "initial load finished");
    for (kind, err) in &report.failed {
      eprintln!("could not load {}s: {}", kind, err);
    }
    for kind in &report.loaded {
      println!("{}s: {} entries", kind, self.store.collection(*kind).len());
    }

    let _monitor = HealthMonitor::spawn(self.store.clone(), &self.config.health);
    let store = self.store.clone();
    let events = &mut self.events;
    let mut connection = store.subscribe_connection();
    let mut ticker = tokio::time::interval(self.config.sync.stale_after());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
      tokio::select! {
        _ = &mut ctrl_c => break,
        Some(event) = events.recv() => match event {
          StoreEvent::CollectionChanged(kind) => {
            let collection = store.collection(kind);
            let newest = collection.first().and_then(Entity::title).unwrap_or("-");
            let pending = if store.is_loading() { ", refreshing" } else { "" };
            println!("{}s: {} entries, newest {}{}", kind, collection.len(), newest, pending);
          }
          StoreEvent::ActorChanged(Some(user)) => println!("signed in as {}", user.id),
          StoreEvent::ActorChanged(None) => println!("signed out"),
          StoreEvent::FatalLoad(err) => eprintln!("{}", err),
        },
        Ok(()) = connection.changed() => {
          let state = *connection.borrow_and_update();
          println!("connection {}", state);
        }
        _ = ticker.tick() => {
          for (kind, result) in store.refresh_all(false).await {
            if let Err(e) = result {
              eprintln!("could not refresh {}s: {}", kind, e);
            }
          }
        }
      }
    }
    Ok(())
  }
}

fn confirm_reload(err: &FatalLoadError) -> bool {
  match prompt(&format!("{}. Retry? [y/N] ", err)) {
    Ok(answer) => matches!(answer.as_str(), "y" | "Y" | "yes"),
    Err(_) => false,
  }
}

fn prompt(question: &str) -> Result<String> {
  eprint!("{}", question);
  io::stderr().flush()?;
  let mut answer = String::new();
  io::stdin().read_line(&mut answer)?;
  Ok(answer.trim().to_string())
}

fn parse_fields(payload: &str) -> Result<Fields> {
  match serde_json::from_str(payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))? {
    Value::Object(fields) => Ok(fields),
    other => Err(eyre!("Payload must be a JSON object, got {}", other)),
  }
}

fn print_entity(entity: &Entity) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(entity)?);
  Ok(())
}

fn print_collection(collection: &Collection) {
  if collection.is_empty() {
    println!("(empty)");
    return;
  }
  for entity in collection {
    println!(
      "{}\t{}\t{}",
      entity.id,
      entity.created_at.format("%Y-%m-%d %H:%M"),
      entity.title().unwrap_or("-")
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;

  #[derive(Parser, Debug)]
  struct Cli {
    #[command(subcommand)]
    command: Command,
  }

  #[test]
  fn test_parse_fields_requires_object() {
    let fields = parse_fields(r#"{"title":"A","tags":["x"]}"#).unwrap();
    assert_eq!(fields["title"], "A");
    assert!(parse_fields("[1,2]").is_err());
    assert!(parse_fields("{not json").is_err());
  }

  #[test]
  fn test_command_line_parsing() {
    let cli = Cli::try_parse_from(["strata", "list", "course", "--mine"]).unwrap();
    assert!(matches!(
      cli.command,
      Command::List {
        kind: EntityKind::Course,
        mine: true,
        refresh: false
      }
    ));

    let cli = Cli::try_parse_from(["strata", "draft", "submit", "article"]).unwrap();
    assert!(matches!(
      cli.command,
      Command::Draft {
        action: DraftAction::Submit {
          kind: EntityKind::Article
        }
      }
    ));

    assert!(Cli::try_parse_from(["strata", "list", "video"]).is_err());
  }

  #[test]
  fn test_local_commands_work_offline() {
    let local = LocalState::open_in_memory().unwrap();
    theme(&local, ThemeAction::Set { mode: ThemeMode::Dark }).unwrap();
    assert!(local.dark_mode().unwrap());

    draft(
      &local,
      DraftAction::Save {
        kind: EntityKind::Project,
        payload: r#"{"title":"wip"}"#.into(),
      },
    )
    .unwrap();
    let saved: Draft<Fields> = local.load_draft("draft:new-project").unwrap().unwrap();
    assert_eq!(saved.data["title"], "wip");

    draft(&local, DraftAction::Discard { kind: EntityKind::Project }).unwrap();
    assert!(local.load_draft::<Fields>("draft:new-project").unwrap().is_none());
  }
}
