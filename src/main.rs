use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fieldsync::remote::{HttpRemote, ListQuery};
use fieldsync::{logging, CacheKey, Config, EntityType, ReadOptions, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Local-first cache for field reports, projects and users")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read an entity through the cache
  Get {
    entity_type: EntityType,
    id: String,
    /// Refresh when the cached copy is older than this
    #[arg(long)]
    max_age_secs: Option<u64>,
  },
  /// Apply a JSON merge patch to an entity
  Patch {
    entity_type: EntityType,
    id: String,
    json: String,
  },
  /// Drop one cached entity, or every entity of a type
  Invalidate {
    entity_type: EntityType,
    id: Option<String>,
  },
  /// Create an entity; the server assigns its id
  Create {
    entity_type: EntityType,
    json: String,
  },
  /// Fetch a collection from the server into the cache
  Sync {
    entity_type: EntityType,
    /// Only the reports of this project
    #[arg(long)]
    project: Option<String>,
  },
  /// List cached entities of a type
  List { entity_type: EntityType },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let remote = Arc::new(HttpRemote::new(&config)?);
  let engine = SyncEngine::from_config(&config, remote)?;

  match args.command {
    Command::Get {
      entity_type,
      id,
      max_age_secs,
    } => {
      let opts = ReadOptions {
        max_age: max_age_secs.map(Duration::from_secs),
        ..Default::default()
      };
      let result = engine.read(&CacheKey::new(entity_type, id), opts).await?;
      println!("{}", serde_json::to_string_pretty(&result.data)?);
      match &result.stale_reason {
        Some(reason) => {
          eprintln!("source: {} (v{}, {})", result.source.label(), result.version, reason)
        }
        None => eprintln!("source: {} (v{})", result.source.label(), result.version),
      }
    }
    Command::Patch {
      entity_type,
      id,
      json,
    } => {
      let mutation: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON patch: {}", e))?;
      let confirmed = engine
        .write(&CacheKey::new(entity_type, id), mutation)
        .await?;
      println!("{}", serde_json::to_string_pretty(&confirmed.payload)?);
      eprintln!("confirmed: v{}", confirmed.version);
    }
    Command::Invalidate { entity_type, id } => match id {
      Some(id) => {
        let key = CacheKey::new(entity_type, id);
        engine.invalidate(&key);
        println!("invalidated {}", key);
      }
      None => {
        let count = engine.invalidate_by_type(entity_type);
        println!("invalidated {} {} entries", count, entity_type);
      }
    },
    Command::Create { entity_type, json } => {
      let payload: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      let created = engine.create(entity_type, payload).await?;
      println!("{}", serde_json::to_string_pretty(&created.payload)?);
      eprintln!("created: {} (v{})", created.key, created.version);
    }
    Command::Sync {
      entity_type,
      project,
    } => {
      let query = match project {
        Some(project) if entity_type == EntityType::Report => {
          ListQuery::reports_for_project(project)
        }
        Some(_) => return Err(eyre!("--project only applies to reports")),
        None => ListQuery::all(entity_type),
      };
      let listed = engine.read_list(&query, None).await?;
      match &listed.stale_reason {
        Some(reason) => eprintln!("source: {} ({})", listed.source.label(), reason),
        None => eprintln!("source: {}", listed.source.label()),
      }
      println!("synced {} {} entries", listed.entries.len(), entity_type);
    }
    Command::List { entity_type } => {
      for entry in engine.list(entity_type) {
        println!(
          "{}\tv{}\t{:?}\t{}",
          entry.key,
          entry.version,
          entry.state,
          entry.fetched_at.to_rfc3339()
        );
      }
    }
  }

  Ok(())
}
