//! keyward command-line interface for forging keys and managing their actions.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keyward_core::{
    config::{KeyConfiguration, KeywardConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    dispatch::{CommandLauncher, Dispatcher},
    engine::{Engine, LogSink},
    identity::{normalize_identity, resolve, KeyIdentity},
    logging,
    marker::{forge_marker, read_marker_bounded, DEFAULT_MARKER_LEN},
    volumes::{MountTable, VolumeSource},
    KeywardResult, MarkerClassifier,
};
use log::debug;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn load_cli_config(path: &Path) -> Result<KeywardConfig> {
    let config = KeywardConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {} (set {CONFIG_PATH_ENV} to replace).",
            config.path.display()
        );
    }

    Ok(config)
}

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "keyward",
    version,
    about = "Forge USB security keys and bind commands to their arrival and removal."
)]
struct Cli {
    /// Path to the keyward configuration file.
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a new random marker to a mounted volume, turning it into a security key.
    Forge {
        /// Root directory of the mounted volume.
        mount: PathBuf,

        /// Replace an existing marker (its old identity stops matching).
        #[arg(long)]
        force: bool,

        /// Number of random bytes to write.
        #[arg(long, default_value_t = DEFAULT_MARKER_LEN)]
        size: usize,
    },

    /// Print the identity of a security key (volume root or marker file).
    Identify { path: PathBuf },

    /// Scan mounted volumes once and list the security keys present.
    Status,

    /// Inspect or edit the commands bound to key identities.
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// Turn desktop notifications on or off.
    Notifications {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

#[derive(Subcommand, Debug)]
enum KeyCommands {
    /// List configured keys.
    List,

    /// Register a key, or replace the entry with the same identity.
    Add {
        /// 64-digit hex identity, or a volume/marker path to read it from.
        key: String,

        /// Friendly name shown in logs and status output.
        #[arg(long, default_value = "")]
        name: String,

        /// Command run when the key is plugged in; `%s` becomes the identity.
        #[arg(long = "on-arrival", default_value = "")]
        on_arrival: String,

        /// Command run when the key is removed; `%s` becomes the identity.
        #[arg(long = "on-removal", default_value = "")]
        on_removal: String,
    },

    /// Forget a key.
    Remove {
        /// Identity of the key to remove.
        id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

/// Status scans must never run user commands.
struct SuppressedLauncher;

impl CommandLauncher for SuppressedLauncher {
    fn launch(&self, command_line: &str) -> KeywardResult<u32> {
        debug!("status scan: not running `{command_line}`");
        Ok(0)
    }
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    match cli.command {
        Commands::Forge { mount, force, size } => {
            ensure!(size > 0, "--size must be greater than 0");
            let config = load_cli_config(&config_path)?;
            ensure!(
                size as u64 <= config.watch.max_marker_bytes,
                "--size {size} exceeds watch.max_marker_bytes ({})",
                config.watch.max_marker_bytes
            );

            let forged = forge_marker(
                &mount,
                Path::new(config.watch.marker_file.trim()),
                size,
                force,
            )
            .with_context(|| format!("failed to forge a key on {}", mount.display()))?;

            if forged.replaced {
                println!("Replaced security key at {}", forged.path.display());
            } else {
                println!("Created security key at {}", forged.path.display());
            }
            println!("Identity: {}", forged.identity);
            println!(
                "Bind commands with: keyward keys add {} --name <NAME> --on-arrival <CMD>",
                forged.identity
            );
        }
        Commands::Identify { path } => {
            let config = load_cli_config(&config_path)?;
            let identity = identify(&path, &config)?;
            println!("{identity}");
            match config.find_key(&identity.to_hex()) {
                Some(key) => println!("Configured as: {}", display_name(key)),
                None => println!("Not configured."),
            }
        }
        Commands::Status => {
            let config = Arc::new(load_cli_config(&config_path)?);
            let volumes = Arc::new(MountTable::from_config(&config.watch));
            let engine = Engine::new(
                Arc::new(MarkerClassifier::from_config(volumes.clone(), &config.watch)),
                Dispatcher::new(config.clone(), Arc::new(SuppressedLauncher)),
                Arc::new(LogSink),
            );
            let mounts = volumes
                .removable_mounts()
                .context("failed to enumerate removable volumes")?;
            engine.poll_once(volumes.as_ref());

            println!("Removable volumes: {}", mounts.len());
            println!("Connected Security Keys");
            let present = engine.snapshot();
            if present.is_empty() {
                println!("  (none)");
            }
            for entry in present {
                let name = config
                    .find_key(&entry.identity.to_hex())
                    .map(display_name)
                    .unwrap_or_else(|| "unconfigured".to_string());
                println!("  {}  {}  [{name}]", entry.mount, short_id(&entry.identity));
            }
        }
        Commands::Keys { command } => {
            let mut config = load_cli_config(&config_path)?;
            match command {
                KeyCommands::List => print_key_table(&config),
                KeyCommands::Add {
                    key,
                    name,
                    on_arrival,
                    on_removal,
                } => {
                    let id = parse_key_reference(&key, &config)?;
                    let entry = KeyConfiguration::new(
                        id.clone(),
                        name.trim(),
                        on_arrival.trim(),
                        on_removal.trim(),
                    );
                    let replaced = config.upsert_key(entry).is_some();
                    config
                        .save()
                        .with_context(|| format!("failed to write {}", config.path.display()))?;
                    if replaced {
                        println!("Updated key {id}");
                    } else {
                        println!("Added key {id}");
                    }
                    if on_arrival.trim().is_empty() && on_removal.trim().is_empty() {
                        println!("Note: no commands configured; the key will only be tracked.");
                    }
                }
                KeyCommands::Remove { id } => {
                    let Some(removed) = config.remove_key(&id) else {
                        bail!("no key with identity {id} is configured");
                    };
                    config
                        .save()
                        .with_context(|| format!("failed to write {}", config.path.display()))?;
                    println!("Removed key {}", display_name(&removed));
                }
            }
        }
        Commands::Notifications { state } => {
            let mut config = load_cli_config(&config_path)?;
            config.notifications.enabled = state == Toggle::On;
            config
                .save()
                .with_context(|| format!("failed to write {}", config.path.display()))?;
            println!(
                "Desktop notifications {}.",
                if config.notifications.enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
        }
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(KeywardConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }

            let cfg = KeywardConfig::load(&file)
                .with_context(|| format!("failed to load configuration from {}", file.display()))?;

            let issues = cfg.validate();
            if issues.is_empty() {
                println!(
                    "Configuration valid ({} key(s), marker {}).",
                    cfg.keys.len(),
                    cfg.watch.marker_file
                );
            } else {
                eprintln!("Configuration validation failed:");
                for issue in issues {
                    eprintln!("  - {issue}");
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Resolve the identity of a volume root or a marker file.
fn identify(path: &Path, config: &KeywardConfig) -> Result<KeyIdentity> {
    let marker = if path.is_dir() {
        path.join(config.watch.marker_file.trim())
    } else {
        path.to_path_buf()
    };
    let material = read_marker_bounded(
        &marker,
        config.watch.max_marker_bytes,
        config.watch.read_timeout(),
    )
        .with_context(|| format!("failed to read security key {}", marker.display()))?;
    Ok(resolve(&material))
}

/// Accept either a literal identity or a path holding a key.
fn parse_key_reference(reference: &str, config: &KeywardConfig) -> Result<String> {
    if let Some(id) = normalize_identity(reference) {
        return Ok(id);
    }
    let path = Path::new(reference);
    if path.exists() {
        return Ok(identify(path, config)?.to_hex());
    }
    bail!("`{reference}` is neither a 64-digit hex identity nor a path to a security key")
}

fn display_name(key: &KeyConfiguration) -> String {
    if key.name.trim().is_empty() {
        short_hex(&key.id)
    } else {
        key.name.clone()
    }
}

fn short_id(identity: &KeyIdentity) -> String {
    short_hex(&identity.to_hex())
}

fn short_hex(id: &str) -> String {
    match normalize_identity(id) {
        Some(hex) => format!("{}…", &hex[..12]),
        None => id.to_string(),
    }
}

fn print_key_table(config: &KeywardConfig) {
    println!("Configured Security Keys ({})", config.path.display());
    if config.keys.is_empty() {
        println!("  (none configured)");
        return;
    }
    for key in &config.keys {
        println!("  {}  {}", short_hex(&key.id), display_name(key));
        println!("    on arrival: {}", or_dash(&key.command_on_arrival));
        println!("    on removal: {}", or_dash(&key.command_on_removal));
    }
}

fn or_dash(value: &str) -> &str {
    if value.trim().is_empty() {
        "-"
    } else {
        value
    }
}
