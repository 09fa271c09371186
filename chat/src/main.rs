use std::error::Error;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shmem::{remove_segment, ChatConfig, Participant, Removal};

#[derive(Parser)]
#[clap(about = "Chat with other processes on this host through shared memory")]
struct Opts {
    /// TOML file with a `[segment]` table and chat settings.
    #[clap(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Shared memory segment name, e.g. `/shmem-chat`.
    #[clap(short = 'n', long = "name")]
    name: Option<String>,
    #[clap(long = "capacity")]
    capacity: Option<usize>,
    /// Unlink the segment left behind by a crashed participant, then exit.
    #[clap(long = "remove")]
    remove: bool,
}

fn load_config(opts: &Opts) -> Result<ChatConfig, Box<dyn Error>> {
    let mut cfg: ChatConfig = match &opts.config {
        Some(path) => confy::load_path(path)?,
        None => ChatConfig::default(),
    };
    if let Some(name) = &opts.name {
        cfg.segment.name = name.clone();
    }
    if let Some(capacity) = opts.capacity {
        cfg.segment.capacity = capacity;
    }
    Ok(cfg)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(opts: Opts) -> Result<(), Box<dyn Error>> {
    let cfg = load_config(&opts)?;
    init_logging(&cfg.log_level);

    if opts.remove {
        match remove_segment(&cfg.segment.name)? {
            Removal::Removed => println!("removed {}", cfg.segment.name),
            Removal::AlreadyGone => println!("{} does not exist", cfg.segment.name),
        }
        return Ok(());
    }

    let sentinel = cfg.exit_sentinel.clone();
    let participant = Participant::join(cfg)?;
    info!(participant = participant.id(), "type `{}` to leave", sentinel);
    participant.run(BufReader::new(io::stdin()), io::stdout())?;
    Ok(())
}

fn main() -> ExitCode {
    let opts: Opts = Opts::parse();
    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("chat: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn opts(args: &[&str]) -> Opts {
        Opts::try_parse_from(std::iter::once("chat").chain(args.iter().copied()))
            .expect("invalid arguments")
    }

    #[test]
    fn defaults_without_a_config_file() -> Result<(), Box<dyn Error>> {
        let cfg = load_config(&opts(&[]))?;
        assert_eq!(cfg, ChatConfig::default());
        Ok(())
    }

    #[test]
    fn command_line_overrides_the_config_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chat.toml");
        fs::write(
            &path,
            "exit_sentinel = \"/quit\"\n\n[segment]\nname = \"/from-file\"\ncapacity = 4096\n",
        )?;
        let path = path.to_str().expect("temp path is not UTF-8");

        let cfg = load_config(&opts(&["-c", path]))?;
        assert_eq!(cfg.segment.name, "/from-file");
        assert_eq!(cfg.segment.capacity, 4096);
        assert_eq!(cfg.exit_sentinel, "/quit");
        assert!(cfg.replay_history);

        let cfg = load_config(&opts(&["-c", path, "-n", "/from-cli", "--capacity", "8192"]))?;
        assert_eq!(cfg.segment.name, "/from-cli");
        assert_eq!(cfg.segment.capacity, 8192);
        assert_eq!(cfg.exit_sentinel, "/quit");
        Ok(())
    }

    #[test]
    fn overrides_apply_to_defaults() -> Result<(), Box<dyn Error>> {
        let cfg = load_config(&opts(&["--capacity", "1024"]))?;
        assert_eq!(cfg.segment.name, ChatConfig::default().segment.name);
        assert_eq!(cfg.segment.capacity, 1024);
        assert!(!opts(&[]).remove);
        assert!(opts(&["--remove"]).remove);
        Ok(())
    }
}
