//! Masq CLI
//!
//! Thin wrapper around masq-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Create a profile and list profiles
//! masq profile add alice --password secret
//! masq profile list
//!
//! # Register this device in a profile
//! masq device add laptop --profile <id> --password secret
//!
//! # Give an app its own database
//! masq app sync notes --profile <id> --password secret
//!
//! # Copy a profile onto another device
//! masq pair key
//! masq pair push --profile <id> --password secret --channel pair-1 --key <key> --new-id <new id>
//! masq pair pull --password secret --channel pair-1 --key <key>
//!
//! # Answer an app's request
//! masq app request <link> accept --profile <id> --password secret
//!
//! # Keep replicating until Ctrl+C
//! masq serve --profile <id> --password secret
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use masq_core::{
    AppRequest, ChannelKey, EngineEvent, MasqConfig, MasqEngine, NewApp, NewDevice, NewProfile,
    ProfileUpdate,
};

/// Masq - personal data vault
#[derive(Parser)]
#[command(name = "masq")]
#[command(version = "0.1.0")]
#[command(about = "Masq - personal data vault")]
#[command(
    long_about = "Keeps password-protected profiles and per-app databases, replicated between your devices without a server."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: from config, ~/.masq/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: ~/.masq/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show vault information
    Info,

    /// Profile management
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Device records of a profile
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },

    /// App registry and app databases
    App {
        #[command(subcommand)]
        action: AppAction,
    },

    /// Copy a profile between devices
    Pair {
        #[command(subcommand)]
        action: PairAction,
    },

    /// Open a profile and keep replicating until Ctrl+C
    Serve {
        #[command(flatten)]
        unlock: Unlock,
    },
}

/// Credentials of the profile a command works on.
#[derive(Args)]
struct Unlock {
    /// Profile ID
    #[arg(long)]
    profile: String,
    /// Profile password
    #[arg(long)]
    password: String,
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Create a new profile
    Add {
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "")]
        firstname: String,
        #[arg(long, default_value = "")]
        lastname: String,
        #[arg(long, default_value = "")]
        image: String,
    },
    /// List all profiles on this device
    List,
    /// Unlock a profile and show its details
    Show {
        profile: String,
        #[arg(long)]
        password: String,
    },
    /// Change profile fields (private fields need --password)
    Update {
        profile: String,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        firstname: Option<String>,
        #[arg(long)]
        lastname: Option<String>,
        #[arg(long)]
        image: Option<String>,
    },
}

#[derive(Subcommand)]
enum DeviceAction {
    /// Create or update this device's record
    Add {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        color: String,
        #[command(flatten)]
        unlock: Unlock,
    },
    /// List every device of the profile
    List {
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Show this device's record
    Show {
        #[command(flatten)]
        unlock: Unlock,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Decision {
    Accept,
    Refuse,
}

#[derive(Subcommand)]
enum AppAction {
    /// Register an app in the profile
    Add {
        app_id: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        url: String,
        #[command(flatten)]
        unlock: Unlock,
    },
    /// List registered apps
    List {
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Create (or reopen) an app database on this device
    Sync {
        name: String,
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Build a request link as an app would
    Link {
        app_id: String,
        #[arg(long)]
        channel: String,
        #[arg(long, default_value = "")]
        message: String,
        #[arg(long, default_value = "masq:")]
        base_url: String,
    },
    /// Answer an app's request link
    Request {
        link: String,
        decision: Decision,
        #[command(flatten)]
        unlock: Unlock,
    },
    /// Wait for the vault to grant a request link (app side)
    Wait { link: String },
}

#[derive(Subcommand)]
enum PairAction {
    /// Generate a pairing key to share with the other device
    Key,
    /// Send a profile to a new device
    Push {
        #[command(flatten)]
        unlock: Unlock,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        key: String,
        /// Profile id on the new device
        #[arg(long)]
        new_id: String,
    },
    /// Receive a profile from another device
    Pull {
        #[arg(long)]
        password: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        key: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<MasqConfig> {
    let path = cli.config.clone().unwrap_or_else(MasqConfig::default_path);
    let mut config = MasqConfig::load(&path)?;
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn parse_key(s: &str) -> Result<ChannelKey> {
    ChannelKey::from_base64(s).map_err(|e| anyhow::anyhow!("Invalid pairing key '{}': {}", s, e))
}

/// Whether `command` talks to other devices.
fn needs_network(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Serve { .. }
            | Commands::Pair {
                action: PairAction::Push { .. } | PairAction::Pull { .. }
            }
            | Commands::App {
                action: AppAction::Request { .. } | AppAction::Wait { .. }
            }
    )
}

async fn unlock(engine: &MasqEngine, unlock: &Unlock) -> Result<()> {
    engine.open_profile(&unlock.profile, &unlock.password).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    let engine = if needs_network(&cli.command) {
        MasqEngine::open(config).await?
    } else {
        MasqEngine::open_offline(config)?
    };

    let result = run(&engine, cli.command).await;
    engine.shutdown().await;
    result
}

async fn run(engine: &MasqEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Info => {
            let profiles = engine.get_profiles()?;
            println!("Masq v0.1.0");
            println!();
            println!("Data directory: {}", engine.config().data_dir.display());
            println!("Profiles: {}", profiles.len());
            println!(
                "Handshake timeout: {}s",
                engine.config().handshake_timeout_secs
            );
        }

        Commands::Profile { action } => match action {
            ProfileAction::Add {
                username,
                password,
                firstname,
                lastname,
                image,
            } => {
                let id = engine
                    .add_profile(NewProfile {
                        username: username.clone(),
                        password,
                        firstname,
                        lastname,
                        image,
                    })
                    .await?;
                println!("Created profile: {}", username);
                println!("  ID: {}", id);
            }

            ProfileAction::List => {
                let profiles = engine.get_profiles()?;
                if profiles.is_empty() {
                    println!("No profiles found.");
                } else {
                    println!("Profiles:");
                    for profile in profiles {
                        println!("  {} ({})", profile.username, profile.id);
                    }
                }
            }

            ProfileAction::Show { profile, password } => {
                let details = engine.open_profile(&profile, &password).await?;
                println!("Profile: {}", details.username);
                println!("  ID: {}", details.id);
                println!("  First name: {}", details.firstname);
                println!("  Last name: {}", details.lastname);
                println!("  Created: {}", details.created_at.format("%Y-%m-%d %H:%M"));
            }

            ProfileAction::Update {
                profile,
                password,
                username,
                firstname,
                lastname,
                image,
            } => {
                if let Some(password) = &password {
                    engine.open_profile(&profile, password).await?;
                }
                engine
                    .update_profile(ProfileUpdate {
                        id: Some(profile.clone()),
                        username,
                        firstname,
                        lastname,
                        image,
                    })
                    .await?;
                println!("Updated profile {}", profile);
            }
        },

        Commands::Device { action } => match action {
            DeviceAction::Add {
                name,
                description,
                color,
                unlock: creds,
            } => {
                unlock(engine, &creds).await?;
                let device = engine
                    .add_device(NewDevice {
                        name,
                        description,
                        color,
                    })
                    .await?;
                println!("Saved device: {}", device.name);
                println!("  ID: {}", device.id);
                println!("  Writer: {}", device.local_key);
            }

            DeviceAction::List { unlock: creds } => {
                unlock(engine, &creds).await?;
                let devices = engine.get_devices()?;
                if devices.is_empty() {
                    println!("No devices found.");
                } else {
                    println!("Devices:");
                    for device in devices {
                        println!(
                            "  {} ({}) - {} app(s)",
                            device.name,
                            device.id,
                            device.apps.len()
                        );
                    }
                }
            }

            DeviceAction::Show { unlock: creds } => {
                unlock(engine, &creds).await?;
                let device = engine.get_device()?;
                println!("Device: {}", device.name);
                println!("  ID: {}", device.id);
                println!("  Writer: {}", device.local_key);
                for grant in &device.apps {
                    let role = if grant.is_creator() { "creator" } else { "member" };
                    println!("  App {}: {} ({})", grant.app_id, grant.key, role);
                }
            }
        },

        Commands::App { action } => match action {
            AppAction::Add {
                app_id,
                name,
                description,
                url,
                unlock: creds,
            } => {
                unlock(engine, &creds).await?;
                let mut new = NewApp::new(app_id, name);
                new.description = description;
                new.url = url;
                let app = engine.add_app(new).await?;
                println!("Added app: {}", app.name);
                println!("  ID: {}", app.app_id);
            }

            AppAction::List { unlock: creds } => {
                unlock(engine, &creds).await?;
                let apps = engine.get_apps()?;
                if apps.is_empty() {
                    println!("No apps found.");
                } else {
                    println!("Apps:");
                    for app in apps {
                        println!("  {} ({})", app.name, app.app_id);
                    }
                }
            }

            AppAction::Sync {
                name,
                unlock: creds,
            } => {
                unlock(engine, &creds).await?;
                let grant = engine.create_app_sync(&name).await?;
                println!("App database: {}", grant.app_id);
                println!("  Key: {}", grant.key);
                println!("  Local key: {}", grant.local_key);
            }

            AppAction::Link {
                app_id,
                channel,
                message,
                base_url,
            } => {
                let request = AppRequest::new(app_id, message, channel, ChannelKey::generate())?;
                println!("{}", request.to_link(&base_url)?);
            }

            AppAction::Request {
                link,
                decision,
                unlock: creds,
            } => {
                unlock(engine, &creds).await?;
                let request = AppRequest::from_link(&link)?;
                let app_id = request.app_id.clone();
                println!("App {} asks: {}", app_id, request.message);
                engine.handle_app_request(request).await?;

                match decision {
                    Decision::Accept => {
                        let grant = engine.accept(&app_id).await?;
                        println!("Connected {}", app_id);
                        println!("  Key: {}", grant.key);
                    }
                    Decision::Refuse => {
                        engine.refuse(&app_id).await?;
                        println!("Refused {}", app_id);
                    }
                }
                engine.acknowledge(&app_id).await?;
            }

            AppAction::Wait { link } => {
                let request = AppRequest::from_link(&link)?;
                println!("Waiting for the vault on channel {}...", request.channel);
                let db = engine
                    .requester()
                    .request_access(&request, engine.config().handshake_timeout())
                    .await?;
                println!("Access granted: {}", db.name());
                println!("  Key: {}", db.key());
                println!("  Writer: {}", db.local_key());
            }
        },

        Commands::Pair { action } => match action {
            PairAction::Key => {
                println!("{}", ChannelKey::generate().to_base64());
            }

            PairAction::Push {
                unlock: creds,
                channel,
                key,
                new_id,
            } => {
                let key = parse_key(&key)?;
                unlock(engine, &creds).await?;
                println!("Waiting for the other device on channel {}...", channel);
                let writer = engine.push_profile(&channel, &key, &new_id).await?;
                println!("Profile pushed as {}", new_id);
                println!("  Device writer: {}", writer);
            }

            PairAction::Pull {
                password,
                channel,
                key,
            } => {
                let key = parse_key(&key)?;
                println!("Waiting for a profile on channel {}...", channel);
                let id = engine.pull_profile(&channel, &key, &password).await?;
                println!("Profile pulled");
                println!("  ID: {}", id);
            }
        },

        Commands::Serve { unlock: creds } => {
            unlock(engine, &creds).await?;
            println!("Serving profile {}", creds.profile);
            if let Some(endpoint) = engine.endpoint_id() {
                println!("  Endpoint: {}", endpoint);
            }
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            let mut events = engine.subscribe_events();
            let status_interval = Duration::from_secs(60);
            let mut status = tokio::time::interval(status_interval);
            status.tick().await;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(EngineEvent::AppsReconciled { pulled, authorized, .. }) => {
                            println!(
                                "Apps reconciled: {} pulled, {} authorized",
                                pulled.len(),
                                authorized
                            );
                        }
                        Ok(EngineEvent::DevicesChanged { .. }) => {
                            println!("Devices changed");
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = status.tick() => {
                        let devices = engine.get_devices()?;
                        let apps = engine.get_apps()?;
                        println!("Status: {} device(s), {} app(s)", devices.len(), apps.len());
                    }
                }
            }
        }
    }

    Ok(())
}
