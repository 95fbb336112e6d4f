use asset_agent::cache::{CacheStorage, SqliteStorage};
use asset_agent::event::{Event, EventOutcome, FetchDisposition, Registration};
use asset_agent::http::{Request, RequestMode};
use asset_agent::net::HttpFetcher;
use asset_agent::{CacheAgent, Config};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "asset-agent")]
#[command(about = "Offline caching agent for a static asset bundle")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/asset-agent/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the static asset list into the current bucket
  Install,
  /// Delete every bucket except the current one
  Activate,
  /// Resolve a request through the agent
  Fetch {
    /// Absolute URL, or a path relative to the scope
    url: String,
    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat the request as a full-page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// List buckets and their entry counts
  Buckets,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config, args.verbose)?;

  let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);
  let fetcher = Arc::new(HttpFetcher::new(&config.scope_url()?)?);
  let agent = CacheAgent::new(&config, Arc::clone(&storage), fetcher)?;
  let registration = Registration::new();

  match args.command {
    Command::Install => {
      registration.run(&agent, Event::Install).await?;
      println!(
        "installed {} ({} assets)",
        agent.version(),
        storage.len(agent.version())?
      );
    }
    Command::Activate => {
      registration.run(&agent, Event::Activate).await?;
      println!("activated {}", agent.version());
    }
    Command::Fetch {
      url,
      method,
      navigate,
    } => {
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mode = if navigate {
        RequestMode::Navigate
      } else {
        RequestMode::SameOrigin
      };
      let request = Request::new(method, config.resolve(&url)?).with_mode(mode);

      match registration.run(&agent, Event::Fetch(request)).await? {
        EventOutcome::Fetch(FetchDisposition::RespondWith(intercepted)) => {
          let intercepted = intercepted.settled().await;
          println!(
            "{} {} ({} bytes)",
            intercepted.response.status,
            intercepted.source,
            intercepted.response.body.len()
          );
        }
        EventOutcome::Fetch(FetchDisposition::Passthrough) => {
          println!("not intercepted");
        }
        other => return Err(eyre!("Unexpected outcome: {:?}", other)),
      }
    }
    Command::Buckets => {
      for name in storage.keys()? {
        let marker = if name == agent.version() { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.len(&name)?);
      }
    }
  }

  Ok(())
}

/// Initialize tracing: stderr by default, or a file when configured.
fn init_logging(config: &Config, verbose: u8) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
    0 => EnvFilter::new("asset_agent=warn"),
    1 => EnvFilter::new("asset_agent=info"),
    _ => EnvFilter::new("asset_agent=debug"),
  });

  match &config.log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
      Ok(None)
    }
  }
}
