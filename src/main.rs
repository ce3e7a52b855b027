use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod clock;
mod config;
mod errors;
mod firewall_manager;
mod lifecycle;
mod notifier;
mod players;
mod rcon;
mod update_manager;

pub use clock::{CancelSignal, TokioSleeper};
pub use config::AgentConfig;
pub use errors::{AgentError, AgentResult};
pub use firewall_manager::{apply_port_change, FirewallManager, PortBinding};
pub use lifecycle::{LifecycleOrchestrator, StartOutcome};
pub use notifier::{ConsoleBroadcast, DiscordWebhook, LogOnlySink, NotificationSink};
pub use players::PlayerStatusReader;
pub use rcon::{RconClient, ServerEndpoint};
pub use update_manager::UpdateManager;

const USAGE: &str = "usage: warden-agent [--config <path>] \
<post-start | pre-stop | status | check-update | update | set-port <option> <new> [<previous>]>";

enum Command {
    PostStart,
    PreStop,
    Status,
    CheckUpdate,
    Update,
    SetPort {
        option: String,
        new_port: u16,
        previous_port: Option<u16>,
    },
}

impl Command {
    fn parse(args: &[String]) -> AgentResult<Self> {
        let port = |value: &str| -> AgentResult<u16> {
            value
                .parse()
                .map_err(|_| AgentError::InvalidRequest(format!("Invalid port '{}'", value)))
        };
        match args {
            [cmd] if cmd == "post-start" => Ok(Command::PostStart),
            [cmd] if cmd == "pre-stop" => Ok(Command::PreStop),
            [cmd] if cmd == "status" => Ok(Command::Status),
            [cmd] if cmd == "check-update" => Ok(Command::CheckUpdate),
            [cmd] if cmd == "update" => Ok(Command::Update),
            [cmd, option, new, rest @ ..] if cmd == "set-port" && rest.len() <= 1 => {
                Ok(Command::SetPort {
                    option: option.clone(),
                    new_port: port(new.as_str())?,
                    previous_port: rest
                        .first()
                        .filter(|p| !p.is_empty())
                        .map(|p| port(p.as_str()))
                        .transpose()?,
                })
            }
            _ => Err(AgentError::InvalidRequest(USAGE.to_string())),
        }
    }
}

/// Warden Agent - lifecycle hooks for one game server instance
pub struct WardenAgent {
    pub config: Arc<AgentConfig>,
    pub orchestrator: LifecycleOrchestrator,
    pub players: PlayerStatusReader,
    pub update_manager: Option<UpdateManager>,
    pub firewall: FirewallManager,
}

impl WardenAgent {
    pub fn new(config: AgentConfig) -> AgentResult<Self> {
        info!("Initializing Warden Agent for {}", config.instance.display_name);

        let config = Arc::new(config);
        let console = Arc::new(RconClient::new(config.rcon.timeout()));
        let players = PlayerStatusReader::new(console.clone(), config.instance.max_players);

        let notifier: Arc<dyn NotificationSink> = match &config.notifications.discord_webhook_url {
            Some(url) if !url.trim().is_empty() => Arc::new(DiscordWebhook::new(
                url.clone(),
                Duration::from_secs(config.notifications.timeout_secs),
            )?),
            _ => Arc::new(LogOnlySink),
        };

        let orchestrator = LifecycleOrchestrator::new(
            config.instance.display_name.clone(),
            config.messages.clone(),
            console.clone(),
            players.clone(),
            notifier,
            Arc::new(ConsoleBroadcast::new(console)),
            Arc::new(TokioSleeper),
        );

        let update_manager = match &config.update {
            Some(update) => Some(UpdateManager::new(update.clone())?),
            None => None,
        };

        Ok(Self {
            config,
            orchestrator,
            players,
            update_manager,
            firewall: FirewallManager,
        })
    }

    /// Endpoint for console calls, or `None` when the API is disabled.
    fn endpoint(&self) -> Option<ServerEndpoint> {
        if self.config.rcon.is_api_enabled() {
            self.config.rcon.endpoint()
        } else {
            None
        }
    }

    fn updates(&self) -> AgentResult<&UpdateManager> {
        self.update_manager.as_ref().ok_or_else(|| {
            AgentError::ConfigError("no [update] section configured".to_string())
        })
    }

    async fn run(&self, command: Command, cancel: &CancelSignal) -> AgentResult<bool> {
        let endpoint = self.endpoint();
        match command {
            Command::PostStart => {
                let outcome = self.orchestrator.post_start(endpoint.as_ref(), cancel).await;
                match outcome {
                    StartOutcome::ApiDisabled => info!("Console API disabled, start not monitored"),
                    StartOutcome::ApiAvailable { attempts, players } => info!(
                        "Console up after {} attempts, {} players online",
                        attempts, players
                    ),
                    StartOutcome::ApiUnavailable { attempts } => {
                        error!("Console unreachable after {} attempts", attempts)
                    }
                    StartOutcome::Cancelled { attempts } => {
                        warn!("Start check cancelled after {} attempts", attempts)
                    }
                }
                Ok(outcome.is_success())
            }
            Command::PreStop => {
                let report = self.orchestrator.pre_stop(endpoint.as_ref(), cancel).await;
                info!(
                    "Pre-stop finished: {} warnings sent, save attempted: {}, saved: {}, cancelled: {}",
                    report.warnings_sent, report.save_attempted, report.saved, report.cancelled
                );
                Ok(true)
            }
            Command::Status => {
                let count = match &endpoint {
                    Some(endpoint) => self.players.get_player_count(endpoint).await,
                    None => None,
                };
                let count = count.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                println!(
                    "{}: {} / {} players",
                    self.config.instance.display_name,
                    count,
                    self.players.get_player_max()
                );
                Ok(true)
            }
            Command::CheckUpdate => {
                let available = self.updates()?.check_update_available().await;
                println!(
                    "{}",
                    if available {
                        "Update available"
                    } else {
                        "Up to date"
                    }
                );
                Ok(true)
            }
            Command::Update => Ok(self.updates()?.update().await),
            Command::SetPort {
                option,
                new_port,
                previous_port,
            } => {
                let previous_port =
                    previous_port.or_else(|| self.config.instance.configured_port(&option));
                let Some(binding) = PortBinding::for_option(&option, previous_port, new_port)
                else {
                    warn!("Option '{}' has no firewall rule, nothing to do", option);
                    return Ok(true);
                };
                apply_port_change(
                    &self.firewall,
                    &binding,
                    &self.config.instance.description,
                )
                .await?;
                Ok(true)
            }
        }
    }
}

fn init_logging(config: &AgentConfig) {
    let filter = format!("warden_agent={}", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Raise `cancel` on Ctrl-C or SIGTERM so the supervisor can cut a wait short.
fn spawn_signal_listener(cancel: CancelSignal) {
    tokio::spawn(async move {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
        warn!("Signal received, cancelling");
        cancel.cancel();
    });
}

async fn run_cli() -> AgentResult<bool> {
    let mut config_path: Option<String> = None;
    let mut rest = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        } else {
            rest.push(arg);
        }
    }

    let command = Command::parse(&rest)?;

    let config = AgentConfig::load(config_path.as_deref()).map_err(AgentError::ConfigError)?;

    init_logging(&config);
    info!("Configuration loaded: {:?}", config);

    let cancel = CancelSignal::new();
    spawn_signal_listener(cancel.clone());

    let agent = WardenAgent::new(config)?;
    agent.run(command, &cancel).await
}

#[tokio::main]
async fn main() -> ExitCode {
    match run_cli().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            eprintln!("warden-agent: {}", e);
            ExitCode::FAILURE
        }
    }
}
