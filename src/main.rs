use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use stockroom::cache::SqliteSnapshot;
use stockroom::config::Config;
use stockroom::logging;
use stockroom::remote::{MemoryStore, OrderBy};
use stockroom::{ActionKind, Actor, DataAccess, EntityKind, Filter, ListQuery, ReadPolicy};

#[derive(Parser, Debug)]
#[command(name = "stockroom")]
#[command(about = "Inspect roles and read inventory data through the access layer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stockroom/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print whether a role may perform an action on an entity kind
  Check {
    #[arg(long)]
    role: String,
    #[arg(long)]
    action: ActionKind,
    #[arg(long)]
    entity: EntityKind,
  },
  /// Print the CRUD grid of a role
  Matrix {
    #[arg(long)]
    role: String,
  },
  /// Read one document
  Get {
    #[arg(long)]
    role: String,
    #[arg(long)]
    entity: EntityKind,
    #[arg(long)]
    id: String,
  },
  /// List documents of an entity kind
  List {
    #[arg(long)]
    role: String,
    #[arg(long)]
    entity: EntityKind,
    /// Equality filter, e.g. --where code=K-12 (repeatable)
    #[arg(long = "where", value_parser = parse_clause)]
    filters: Vec<(String, Value)>,
    /// Field to sort by
    #[arg(long)]
    order: Option<String>,
    #[arg(long)]
    desc: bool,
  },
  /// List the configured roles
  Roles,
}

/// Parse `field=value`. The value is read as JSON when possible, so
/// `count=3` compares as a number and `code=K-12` as a string.
fn parse_clause(raw: &str) -> std::result::Result<(String, Value), String> {
  let (field, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected field=value, got '{}'", raw))?;
  if field.is_empty() {
    return Err(format!("missing field name in '{}'", raw));
  }
  let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok((field.to_string(), value))
}

fn build_data_access(config: &Config) -> Result<DataAccess> {
  let store = Arc::new(MemoryStore::new());
  for (collection, docs) in config.seed_documents()? {
    store.seed(&collection, docs);
  }

  let mut builder = DataAccess::builder(store)
    .roles(config.roles.clone())
    .cache_config(&config.cache);
  if config.cache.snapshot {
    let snapshot = SqliteSnapshot::open(config.cache.snapshot_path.as_deref())?;
    builder = builder.snapshot(Arc::new(snapshot));
  }
  Ok(builder.build())
}

fn yes_no(allowed: bool) -> &'static str {
  if allowed {
    "yes"
  } else {
    "no"
  }
}

async fn run(data: &DataAccess, command: Command) -> Result<()> {
  match command {
    Command::Check {
      role,
      action,
      entity,
    } => {
      let actor = Actor::new("cli", role);
      println!("{}", yes_no(data.authorize(action, entity, Some(&actor))));
    }
    Command::Matrix { role } => {
      if data.policies().role(&role).is_none() {
        return Err(eyre!("Unknown role: {}", role));
      }
      let actor = Actor::new("cli", role);
      println!("{:<12} {:<7} {:<7} {:<7} {:<7}", "ENTITY", "CREATE", "READ", "UPDATE", "DELETE");
      for entity in EntityKind::ALL {
        let cells: Vec<&str> = ActionKind::ALL
          .iter()
          .map(|action| yes_no(data.authorize(*action, entity, Some(&actor))))
          .collect();
        println!(
          "{:<12} {:<7} {:<7} {:<7} {:<7}",
          entity.as_str(),
          cells[0],
          cells[1],
          cells[2],
          cells[3]
        );
      }
    }
    Command::Get { role, entity, id } => {
      let actor = Actor::new("cli", role);
      let fetched = data
        .get_document(Some(&actor), entity, &id, ReadPolicy::default())
        .await?
        .ok_or_else(|| eyre!("{}/{} not found", entity.collection(), id))?;
      println!("{}", serde_json::to_string_pretty(&fetched.data.data)?);
    }
    Command::List {
      role,
      entity,
      filters,
      order,
      desc,
    } => {
      let actor = Actor::new("cli", role);
      let filter = filters
        .into_iter()
        .fold(Filter::new(), |filter, (field, value)| filter.eq(field, value));
      let mut query = ListQuery::all().filtered(filter);
      if let Some(field) = order {
        query = query.ordered(if desc {
          OrderBy::desc(field)
        } else {
          OrderBy::asc(field)
        });
      }

      let fetched = data
        .list_documents(Some(&actor), entity, &query, ReadPolicy::default())
        .await?;
      for doc in &fetched.data {
        println!("{}", serde_json::to_string(&doc.data)?);
      }
      info!(count = fetched.data.len(), "Listed documents");
    }
    Command::Roles => {
      for role in data.policies().roles() {
        println!(
          "{:<12} {:<9} {}",
          role.id,
          format!("{:?}", role.kind).to_lowercase(),
          role.display_name
        );
      }
    }
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let data = build_data_access(&config)?;
  if config.cache.snapshot {
    data.warm_start().await;
  }

  let result = run(&data, args.command).await;
  data.flush_snapshot().await;
  result
}
