use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use rescache::config::Config;
use rescache::transport::{HttpTransport, UrlTable};
use rescache::{Attributes, Collaborators, Params, Resource, ResourceOptions};

#[derive(Parser, Debug)]
#[command(name = "rescache")]
#[command(about = "Query a REST backend through the rescache cache layer")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rescache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Resource name, as configured under `resources`
  resource: String,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch one record by identity
  Get { id: String },
  /// Fetch the collection matching the given parameters
  List {
    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
  /// Delete one record by identity
  Delete { id: String },
  /// Create or update a record from a JSON object
  Save { json: String },
}

fn parse_param(s: &str) -> std::result::Result<(String, String), String> {
  s.split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got {}", s))
}

/// Log to a daily file under the data directory so stdout stays parseable.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
  let dir = dirs::data_dir()?.join("rescache").join("logs");
  std::fs::create_dir_all(&dir).ok()?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "rescache.log"));
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rescache=info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_logging();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let options = config
    .resource(&args.resource)
    .cloned()
    .unwrap_or_else(|| ResourceOptions::new(&args.resource));
  let transport = HttpTransport::new(&config.client)?;
  let routes = UrlTable::from_templates(config.routes.clone());
  let resource = Resource::new(
    options,
    Collaborators::new(Arc::new(transport), Arc::new(routes)),
  )?;

  let output = match args.command {
    Command::Get { id } => Value::Object(resource.fetch(&id, &Params::new(), true).await?),
    Command::List { params } => {
      let params: Params = params.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
      resource.fetch_collection(&params, true).await?
    }
    Command::Delete { id } => Value::String(resource.delete(&id, &Params::new()).await?),
    Command::Save { json } => {
      let value: Value = serde_json::from_str(&json)?;
      let attributes: Attributes = match value {
        Value::Object(attributes) => attributes,
        other => return Err(eyre!("Expected a JSON object, got {}", other)),
      };
      Value::Object(resource.save(attributes, &Params::new()).await?)
    }
  };

  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}
