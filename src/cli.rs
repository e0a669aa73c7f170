//! Command-line front end. Parses arguments and calls into [`crate::commands`].

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;

use crate::commands::{self, format_remaining, AppState, Designation};
use crate::config::Config;
use crate::core::{AppRule, PackagesList, ProtocolClass, Transport};
use crate::error::AppError;
use crate::firewall::{BypassEvent, ShellExecutor};

#[derive(Parser)]
#[command(name = "onionwall")]
#[command(about = "Per-application routing through onion and overlay networks")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the rule database and state (overrides config)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log filter (error, warn, info, debug, trace or a full directive)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    fn enabled(self) -> bool {
        matches!(self, Switch::On)
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Role {
    Browser,
    Sip,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Detect device capabilities (root, iptables, comment matches, init script, onion client)
    Init,

    /// Show policy state and device capabilities
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Rebuild the policy from scratch
    Apply {
        /// Print the command batch instead of running it
        #[arg(long)]
        dry_run: bool,
    },

    /// Turn the policy on
    Enable,

    /// Turn the policy off and restore default routing
    Disable {
        /// Confirm that applications will bypass the anonymity network
        #[arg(long)]
        yes: bool,
    },

    /// Manage per-application rules
    #[command(subcommand)]
    Rule(RuleCommand),

    /// Import rules from a legacy preferences dump
    ImportLegacy {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Let private-range destinations bypass redirection
    Lan { state: Switch },

    /// Route tethered clients through the onion proxy
    Tether { state: Switch },

    /// Redirect the SIP application's datagrams to the overlay proxy
    Sip {
        state: Switch,
        /// uid to toggle (defaults to the designated SIP application)
        #[arg(long)]
        uid: Option<u32>,
    },

    /// Set or clear the designated browser or SIP application
    Designate { role: Role, uid: Option<u32> },

    /// Let the designated browser reach a captive portal for a while
    Bypass {
        /// Window length in minutes (defaults to the configured grace time)
        #[arg(short, long)]
        minutes: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum RuleCommand {
    /// Add a rule for an application
    Add {
        uid: u32,
        package: String,
        #[arg(short, long)]
        transport: Option<Transport>,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        class: Option<ProtocolClass>,
    },
    /// Change fields of an existing rule
    Update {
        uid: u32,
        #[arg(short, long)]
        transport: Option<Transport>,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        class: Option<ProtocolClass>,
    },
    /// Remove the rule for an application
    Remove { uid: u32 },
    /// Show one rule
    Show { uid: u32 },
    /// List all rules
    List {
        #[arg(long)]
        json: bool,
    },
}

/// Load the configuration file (or defaults) and apply command-line overrides.
pub fn load_config(cli: &Cli) -> Result<Config, AppError> {
    let mut config = match &cli.config {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading configuration");
            Config::from_file(path)?
        }
        None => Config::parse("")?,
    };
    if let Some(dir) = &cli.data_dir {
        config.paths.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

pub fn dispatch(cli: Cli) -> Result<(), AppError> {
    let config = load_config(&cli)?;
    let executor = Arc::new(ShellExecutor::new(config.privilege.wrapper.clone()));
    let registry = Arc::new(PackagesList::new(config.paths.packages_list.clone()));
    let state = AppState::open(config, executor, registry)?;
    // A bypass whose countdown died with its process must not stay open.
    if let Err(e) = state.engine.expire_lapsed_bypass() {
        tracing::warn!("Withdrawing a lapsed captive bypass failed: {e}");
    }

    match cli.command {
        Commands::Init => {
            let caps = commands::system::initialize(&state)?;
            println!("root:              {}", yes_no(caps.root_available));
            println!("iptables:          {}", yes_no(caps.filter_binary_present));
            println!("comment matches:   {}", yes_no(caps.comment_annotations_supported));
            println!("init script:       {}", yes_no(caps.init_script_installed));
            println!("onion client:      {}", yes_no(caps.onion_client_installed));
        }
        Commands::Status { json } => {
            let status = commands::system::status(&state)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("policy:    {}", on_off(status.master_enabled));
                println!("active:    {}", yes_no(status.active));
                println!("applied:   {}", yes_no(status.policy_applied));
                println!("rules:     {}", status.rule_count);
                println!("lan:       {}", on_off(status.lan_bypass_enabled));
                println!("tether:    {}", on_off(status.tether_enabled));
                println!("sip:       {}", on_off(status.sip_enabled));
                println!("browser:   {}", uid_or_none(status.designated_browser_uid));
                println!("sip app:   {}", uid_or_none(status.designated_sip_uid));
                println!("bypassing: {}", uid_or_none(status.captive_bypass_uid));
            }
        }
        Commands::Apply { dry_run } => {
            if dry_run {
                for line in commands::system::plan_policy(&state)? {
                    println!("{line}");
                }
            } else {
                commands::system::initialize(&state)?;
                commands::system::apply_policy(&state)?;
                println!("Policy applied");
            }
        }
        Commands::Enable => {
            commands::system::initialize(&state)?;
            commands::system::set_master_enabled(&state, true, false)?;
            println!("Policy enabled");
        }
        Commands::Disable { yes } => {
            commands::system::set_master_enabled(&state, false, yes)?;
            println!("Policy disabled; applications use the network directly");
        }
        Commands::Rule(command) => run_rule_command(&state, command)?,
        Commands::ImportLegacy { file } => {
            let imported = commands::rules::import_legacy(&state, &file)?;
            println!("Imported {imported} rules");
        }
        Commands::Lan { state: switch } => {
            commands::system::toggle_lan(&state, switch.enabled())?;
            println!("LAN bypass {}", on_off(switch.enabled()));
        }
        Commands::Tether { state: switch } => {
            commands::system::toggle_tether(&state, switch.enabled())?;
            println!("Tethering {}", on_off(switch.enabled()));
        }
        Commands::Sip { state: switch, uid } => {
            let uid = commands::system::toggle_sip(&state, switch.enabled(), uid)?;
            println!("SIP redirection {} for uid {uid}", on_off(switch.enabled()));
        }
        Commands::Designate { role, uid } => {
            let role = match role {
                Role::Browser => Designation::Browser,
                Role::Sip => Designation::Sip,
            };
            commands::system::designate(&state, role, uid)?;
        }
        Commands::Bypass { minutes } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_bypass(&state, minutes))?;
        }
    }
    Ok(())
}

fn run_rule_command(state: &AppState, command: RuleCommand) -> Result<(), AppError> {
    match command {
        RuleCommand::Add {
            uid,
            package,
            transport,
            port,
            class,
        } => {
            let rule = commands::rules::add_rule(state, uid, &package, transport, port, class)?;
            println!("Added {}", describe(&rule));
        }
        RuleCommand::Update {
            uid,
            transport,
            port,
            class,
        } => {
            let rule = commands::rules::update_rule(state, uid, transport, port, class)?;
            println!("Updated {}", describe(&rule));
        }
        RuleCommand::Remove { uid } => {
            commands::rules::remove_rule(state, uid)?;
            println!("Removed rule for uid {uid}");
        }
        RuleCommand::Show { uid } => {
            println!("{}", describe(&commands::rules::show_rule(state, uid)?));
        }
        RuleCommand::List { json } => {
            let rules = commands::rules::list_rules(state)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else {
                for rule in &rules {
                    println!("{}", describe(rule));
                }
            }
        }
    }
    Ok(())
}

/// Hold the bypass window open, printing the countdown. Ctrl-C reverts early.
async fn run_bypass(state: &AppState, minutes: Option<u64>) -> Result<(), AppError> {
    commands::system::initialize(state)?;
    let mut events = state.engine.scheduler().subscribe();
    let (uid, duration) =
        tokio::task::block_in_place(|| commands::system::start_captive_bypass(state, minutes))?;
    println!("Bypass open for uid {uid}: {}", format_remaining(duration));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(BypassEvent::Tick { remaining, .. }) => {
                    println!("{} remaining", format_remaining(remaining));
                }
                Ok(BypassEvent::Expired { uid }) => {
                    println!("Bypass for uid {uid} expired");
                    return Ok(());
                }
                Ok(BypassEvent::Cancelled { uid: cancelled }) if cancelled == uid => return Ok(()),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                tokio::task::block_in_place(|| commands::system::stop_captive_bypass(state))?;
                println!("Bypass cancelled");
                return Ok(());
            }
        }
    }
}

fn describe(rule: &AppRule) -> String {
    format!(
        "{} {} {} {} {}",
        rule.uid, rule.package_name, rule.transport, rule.target_port, rule.protocol_class
    )
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

fn uid_or_none(uid: Option<u32>) -> String {
    uid.map_or_else(|| "-".to_string(), |u| u.to_string())
}
