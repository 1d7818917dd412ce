use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

// `#[zbus::proxy]` generates `PipelineProxy` (async) from this trait.
#[zbus::proxy(
    interface = "org.facetag.Pipeline1",
    default_service = "org.facetag.Pipeline1",
    default_path = "/org/facetag/Pipeline1"
)]
trait Pipeline {
    async fn submit_photo(&self, owner_id: &str, storage_path: &str) -> zbus::Result<String>;
    async fn process_photo(&self, file_path: &str, owner_id: &str, photo_id: &str) -> zbus::Result<String>;
    async fn identify(&self, file_path: &str, owner_id: &str) -> zbus::Result<String>;
    async fn list_identities(&self, owner_id: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facetag", about = "facetag face-identity pipeline CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    /// Seconds to wait for the daemon before giving up
    #[arg(long, global = true, default_value_t = 120)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record an uploaded photo and print its id
    Submit {
        #[arg(short, long)]
        owner: String,
        /// Storage path of the uploaded photo
        storage_path: String,
    },
    /// Resolve the faces of a submitted photo
    Process {
        /// Local file holding the photo's bytes
        file: PathBuf,
        #[arg(short, long)]
        owner: String,
        #[arg(short, long)]
        photo: String,
    },
    /// Match a photo against known identities without recording anything
    Identify {
        file: PathBuf,
        #[arg(short, long)]
        owner: String,
    },
    /// List an owner's identities
    Identities {
        #[arg(short, long)]
        owner: String,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(cli.timeout))
        .build()
        .await
        .context("connecting to D-Bus")?;
    let proxy = PipelineProxy::new(&conn).await?;
    tracing::debug!(system = cli.system, "connected to facetagd");

    match cli.command {
        Commands::Submit { owner, storage_path } => {
            let photo_id = proxy.submit_photo(&owner, &storage_path).await?;
            println!("{photo_id}");
        }
        Commands::Process { file, owner, photo } => {
            let file = absolute(file)?;
            let reply = proxy.process_photo(&file.to_string_lossy(), &owner, &photo).await?;
            let value = print_json(&reply)?;
            if value["state"] == "failed" {
                bail!("job failed during {}", value["stage"].as_str().unwrap_or("unknown stage"));
            }
        }
        Commands::Identify { file, owner } => {
            let file = absolute(file)?;
            let reply = proxy.identify(&file.to_string_lossy(), &owner).await?;
            print_json(&reply)?;
        }
        Commands::Identities { owner } => {
            let reply = proxy.list_identities(&owner).await?;
            print_json(&reply)?;
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            print_json(&reply)?;
        }
    }

    Ok(())
}

/// The daemon resolves paths in its own working directory.
fn absolute(file: PathBuf) -> Result<PathBuf> {
    if file.is_absolute() {
        return Ok(file);
    }
    Ok(std::env::current_dir()?.join(file))
}

fn print_json(reply: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_process() {
        let cli = Cli::try_parse_from([
            "facetag", "process", "photo.jpg", "--owner", "o", "--photo", "p", "--system",
        ])
        .unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::Process { file, owner, photo } => {
                assert_eq!(file, PathBuf::from("photo.jpg"));
                assert_eq!(owner, "o");
                assert_eq!(photo, "p");
            }
            _ => panic!("expected process"),
        }
    }

    #[test]
    fn test_identify_requires_owner() {
        assert!(Cli::try_parse_from(["facetag", "identify", "photo.jpg"]).is_err());
    }

    #[test]
    fn test_absolute_keeps_absolute_paths() {
        assert_eq!(absolute(PathBuf::from("/a/b.jpg")).unwrap(), PathBuf::from("/a/b.jpg"));
        assert!(absolute(PathBuf::from("b.jpg")).unwrap().is_absolute());
    }
}
