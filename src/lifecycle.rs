use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::{CancelSignal, Sleeper};
use crate::config::MessagesConfig;
use crate::notifier::{NotificationSink, PlayerBroadcast};
use crate::players::PlayerStatusReader;
use crate::rcon::{ConsoleTransport, ServerEndpoint};

pub const INSTANCE_PLACEHOLDER: &str = "{instance}";
pub const SAVE_COMMAND: &str = "save-all flush";

const POST_START_ATTEMPTS: u32 = 24;
const POST_START_INTERVAL: Duration = Duration::from_secs(10);
const SAVE_SETTLE: Duration = Duration::from_secs(5);

/// Substitute the instance display name into an operator message.
pub fn render_template(template: &str, instance: &str) -> String {
    if template.contains(INSTANCE_PLACEHOLDER) {
        template.replace(INSTANCE_PLACEHOLDER, instance)
    } else {
        template.to_string()
    }
}

/// One entry of the shutdown warning schedule. `lead_time` is the wait
/// before the next step; the last step has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningStep {
    pub message: String,
    pub lead_time: Duration,
}

pub fn warning_schedule(messages: &MessagesConfig) -> Vec<WarningStep> {
    let step = |message: &str, secs: u64| WarningStep {
        message: message.to_string(),
        lead_time: Duration::from_secs(secs),
    };
    vec![
        step(&messages.warning_5_minutes, 60),
        step(&messages.warning_4_minutes, 60),
        step(&messages.warning_3_minutes, 60),
        step(&messages.warning_2_minutes, 60),
        step(&messages.warning_1_minute, 30),
        step(&messages.warning_30_seconds, 30),
        step(&messages.warning_now, 0),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Console API is disabled, nothing to wait for.
    ApiDisabled,
    ApiAvailable { attempts: u32, players: u32 },
    ApiUnavailable { attempts: u32 },
    Cancelled { attempts: u32 },
}

impl StartOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StartOutcome::ApiDisabled | StartOutcome::ApiAvailable { .. })
    }
}

/// What `pre_stop` did. Stopping always proceeds regardless of its contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    pub warnings_sent: usize,
    pub save_attempted: bool,
    pub saved: bool,
    pub cancelled: bool,
}

/// Runs the post-start availability check and the pre-stop warn-and-save
/// sequence. Holds no state between invocations.
pub struct LifecycleOrchestrator {
    instance_name: String,
    messages: MessagesConfig,
    schedule: Vec<WarningStep>,
    console: Arc<dyn ConsoleTransport>,
    players: PlayerStatusReader,
    notifier: Arc<dyn NotificationSink>,
    broadcast: Arc<dyn PlayerBroadcast>,
    sleeper: Arc<dyn Sleeper>,
}

impl LifecycleOrchestrator {
    pub fn new(
        instance_name: String,
        messages: MessagesConfig,
        console: Arc<dyn ConsoleTransport>,
        players: PlayerStatusReader,
        notifier: Arc<dyn NotificationSink>,
        broadcast: Arc<dyn PlayerBroadcast>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let schedule = warning_schedule(&messages);
        Self {
            instance_name,
            messages,
            schedule,
            console,
            players,
            notifier,
            broadcast,
            sleeper,
        }
    }

    /// Wait for the console to answer after the process was launched.
    ///
    /// `endpoint` is `None` when the console API is disabled. Failure here
    /// means the server is running but unmonitored.
    pub async fn post_start(
        &self,
        endpoint: Option<&ServerEndpoint>,
        cancel: &CancelSignal,
    ) -> StartOutcome {
        let Some(endpoint) = endpoint else {
            debug!("Console API disabled, skipping availability check");
            return StartOutcome::ApiDisabled;
        };

        if cancel.is_cancelled() {
            warn!("Availability check cancelled before the first attempt");
            return StartOutcome::Cancelled { attempts: 0 };
        }

        info!("Waiting for API to become available...");
        for attempt in 1..=POST_START_ATTEMPTS {
            if attempt > 1 && self.sleeper.sleep(POST_START_INTERVAL, cancel).await.is_err() {
                warn!("Availability check cancelled after {} attempts", attempt - 1);
                return StartOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }

            if let Some(players) = self.players.get_player_count(endpoint).await {
                info!(
                    "API available after {} attempts, {} players online",
                    attempt, players
                );
                let msg = render_template(&self.messages.instance_started, &self.instance_name);
                self.notifier.send(&msg).await;
                return StartOutcome::ApiAvailable { attempts: attempt, players };
            }

            info!("API not available yet ({}/{})", attempt, POST_START_ATTEMPTS);
        }

        error!("API did not reply within the allowed time!");
        StartOutcome::ApiUnavailable {
            attempts: POST_START_ATTEMPTS,
        }
    }

    /// Warn connected players, then force a world save before the process
    /// is terminated.
    pub async fn pre_stop(
        &self,
        endpoint: Option<&ServerEndpoint>,
        cancel: &CancelSignal,
    ) -> StopReport {
        let msg = render_template(&self.messages.instance_stopping, &self.instance_name);
        self.notifier.send(&msg).await;

        let mut report = StopReport::default();
        let Some(endpoint) = endpoint else {
            debug!("Console API disabled, no warnings or save possible");
            return report;
        };

        for step in &self.schedule {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.players.get_player_count(endpoint).await {
                Some(players) if players > 0 => {
                    info!(
                        "{} players online, sending warning message: {}",
                        players, step.message
                    );
                    match self.broadcast.broadcast(endpoint, &step.message).await {
                        Ok(()) => report.warnings_sent += 1,
                        Err(e) => warn!("Failed to send shutdown warning: {}", e),
                    }
                    if !step.lead_time.is_zero()
                        && self.sleeper.sleep(step.lead_time, cancel).await.is_err()
                    {
                        warn!("Shutdown warnings cancelled");
                        report.cancelled = true;
                        break;
                    }
                }
                Some(_) => {
                    info!("No players online, skipping remaining warnings");
                    break;
                }
                None => {
                    info!("Player count unknown, skipping remaining warnings");
                    break;
                }
            }
        }

        info!("Forcing server save");
        report.save_attempted = true;
        match self.console.execute(endpoint, SAVE_COMMAND).await {
            Ok(_) => report.saved = true,
            Err(e) => warn!("Forced save failed: {}", e),
        }

        if !report.cancelled && self.sleeper.sleep(SAVE_SETTLE, cancel).await.is_err() {
            report.cancelled = true;
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Cancelled;
    use crate::errors::ConsoleError;
    use crate::players::LIST_PLAYERS_COMMAND;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Console(String),
        Notify(String),
        Broadcast(String),
        Sleep(Duration),
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    /// Answers `list` from a scripted sequence of counts; `None` or an
    /// exhausted script means the console is unreachable.
    struct ScriptedConsole {
        events: Events,
        counts: Mutex<VecDeque<Option<u32>>>,
    }

    #[async_trait]
    impl ConsoleTransport for ScriptedConsole {
        async fn execute(
            &self,
            _endpoint: &ServerEndpoint,
            command: &str,
        ) -> Result<String, ConsoleError> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Console(command.to_string()));
            if command != LIST_PLAYERS_COMMAND {
                return Ok("Saved the game".to_string());
            }
            match self.counts.lock().unwrap().pop_front().flatten() {
                Some(n) => Ok(format!("There are {} of a max of 20 players online:", n)),
                None => Err(ConsoleError::ConnectionUnavailable("refused".to_string())),
            }
        }
    }

    struct Recorder {
        events: Events,
        cancel_after_sleeps: Option<usize>,
    }

    #[async_trait]
    impl NotificationSink for Recorder {
        async fn send(&self, text: &str) {
            self.events.lock().unwrap().push(Event::Notify(text.to_string()));
        }
    }

    #[async_trait]
    impl PlayerBroadcast for Recorder {
        async fn broadcast(
            &self,
            _endpoint: &ServerEndpoint,
            text: &str,
        ) -> Result<(), ConsoleError> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Broadcast(text.to_string()));
            Ok(())
        }
    }

    #[async_trait]
    impl Sleeper for Recorder {
        async fn sleep(&self, duration: Duration, cancel: &CancelSignal) -> Result<(), Cancelled> {
            let mut events = self.events.lock().unwrap();
            events.push(Event::Sleep(duration));
            let sleeps = events.iter().filter(|e| matches!(e, Event::Sleep(_))).count();
            if self.cancel_after_sleeps == Some(sleeps) {
                cancel.cancel();
            }
            if cancel.is_cancelled() {
                Err(Cancelled)
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        events: Events,
        orchestrator: LifecycleOrchestrator,
    }

    impl Harness {
        fn new(counts: Vec<Option<u32>>) -> Self {
            Self::with_cancel(counts, None)
        }

        fn with_cancel(counts: Vec<Option<u32>>, cancel_after_sleeps: Option<usize>) -> Self {
            let events: Events = Arc::new(Mutex::new(Vec::new()));
            let console = Arc::new(ScriptedConsole {
                events: events.clone(),
                counts: Mutex::new(counts.into()),
            });
            let recorder = Arc::new(Recorder {
                events: events.clone(),
                cancel_after_sleeps,
            });
            let messages = MessagesConfig {
                instance_started: "{instance} started".to_string(),
                instance_stopping: "{instance} stopping".to_string(),
                ..MessagesConfig::default()
            };
            let orchestrator = LifecycleOrchestrator::new(
                "world".to_string(),
                messages,
                console.clone(),
                PlayerStatusReader::new(console, 20),
                recorder.clone(),
                recorder.clone(),
                recorder,
            );
            Self {
                events,
                orchestrator,
            }
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
            self.events().iter().filter(|e| pred(e)).count()
        }
    }

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint {
            host: "127.0.0.1".to_string(),
            port: 25575,
            password: "pw".to_string(),
        }
    }

    fn list() -> Event {
        Event::Console(LIST_PLAYERS_COMMAND.to_string())
    }

    #[test]
    fn test_render_template() {
        assert_eq!(render_template("{instance} is up", "world"), "world is up");
        assert_eq!(render_template("server is up", "world"), "server is up");
        assert_eq!(render_template("", "world"), "");
    }

    #[test]
    fn test_warning_schedule_shape() {
        let schedule = warning_schedule(&MessagesConfig::default());
        let waits: Vec<u64> = schedule.iter().map(|s| s.lead_time.as_secs()).collect();
        assert_eq!(waits, vec![60, 60, 60, 60, 30, 30, 0]);
        assert_eq!(schedule[6].message, MessagesConfig::default().warning_now);
    }

    #[tokio::test]
    async fn test_post_start_api_disabled() {
        let h = Harness::new(vec![Some(1)]);
        let outcome = h.orchestrator.post_start(None, &CancelSignal::new()).await;
        assert_eq!(outcome, StartOutcome::ApiDisabled);
        assert!(outcome.is_success());
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn test_post_start_succeeds_on_fifth_poll() {
        let h = Harness::new(vec![None, None, None, None, Some(0)]);
        let outcome = h
            .orchestrator
            .post_start(Some(&endpoint()), &CancelSignal::new())
            .await;
        assert_eq!(outcome, StartOutcome::ApiAvailable { attempts: 5, players: 0 });

        let wait = Event::Sleep(Duration::from_secs(10));
        let expected = vec![
            list(),
            wait.clone(),
            list(),
            wait.clone(),
            list(),
            wait.clone(),
            list(),
            wait,
            list(),
            Event::Notify("world started".to_string()),
        ];
        assert_eq!(h.events(), expected);
    }

    #[tokio::test]
    async fn test_post_start_gives_up_after_24_polls() {
        let h = Harness::new(vec![]);
        let outcome = h
            .orchestrator
            .post_start(Some(&endpoint()), &CancelSignal::new())
            .await;
        assert_eq!(outcome, StartOutcome::ApiUnavailable { attempts: 24 });
        assert!(!outcome.is_success());
        assert_eq!(h.count(|e| *e == list()), 24);
        assert_eq!(h.count(|e| matches!(e, Event::Notify(_))), 0);
    }

    #[tokio::test]
    async fn test_post_start_cancelled_mid_poll() {
        let h = Harness::with_cancel(vec![], Some(3));
        let outcome = h
            .orchestrator
            .post_start(Some(&endpoint()), &CancelSignal::new())
            .await;
        assert_eq!(outcome, StartOutcome::Cancelled { attempts: 3 });
        assert_eq!(h.count(|e| *e == list()), 3);
    }

    #[tokio::test]
    async fn test_post_start_already_cancelled_does_not_poll() {
        let h = Harness::new(vec![Some(2)]);
        let cancel = CancelSignal::new();
        cancel.cancel();
        let outcome = h.orchestrator.post_start(Some(&endpoint()), &cancel).await;
        assert_eq!(outcome, StartOutcome::Cancelled { attempts: 0 });
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn test_pre_stop_stops_warning_when_players_leave() {
        let h = Harness::new(vec![Some(5), Some(3), Some(0)]);
        let report = h
            .orchestrator
            .pre_stop(Some(&endpoint()), &CancelSignal::new())
            .await;

        let schedule = warning_schedule(&MessagesConfig::default());
        let expected = vec![
            Event::Notify("world stopping".to_string()),
            list(),
            Event::Broadcast(schedule[0].message.clone()),
            Event::Sleep(Duration::from_secs(60)),
            list(),
            Event::Broadcast(schedule[1].message.clone()),
            Event::Sleep(Duration::from_secs(60)),
            list(),
            Event::Console(SAVE_COMMAND.to_string()),
            Event::Sleep(Duration::from_secs(5)),
        ];
        assert_eq!(h.events(), expected);
        assert_eq!(
            report,
            StopReport {
                warnings_sent: 2,
                save_attempted: true,
                saved: true,
                cancelled: false,
            }
        );
    }

    #[tokio::test]
    async fn test_pre_stop_runs_full_schedule() {
        let h = Harness::new(vec![Some(1); 7]);
        let report = h
            .orchestrator
            .pre_stop(Some(&endpoint()), &CancelSignal::new())
            .await;
        assert_eq!(report.warnings_sent, 7);
        let waited: Duration = h
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Sleep(d) => Some(*d),
                _ => None,
            })
            .sum();
        // five minutes of warnings plus the save settle
        assert_eq!(waited, Duration::from_secs(300 + 5));
    }

    #[tokio::test]
    async fn test_pre_stop_unknown_count_still_saves() {
        let h = Harness::new(vec![None]);
        let report = h
            .orchestrator
            .pre_stop(Some(&endpoint()), &CancelSignal::new())
            .await;
        assert_eq!(report.warnings_sent, 0);
        assert!(report.saved);
        assert_eq!(h.count(|e| *e == Event::Console(SAVE_COMMAND.to_string())), 1);
    }

    #[tokio::test]
    async fn test_pre_stop_api_disabled() {
        let h = Harness::new(vec![Some(5)]);
        let report = h.orchestrator.pre_stop(None, &CancelSignal::new()).await;
        assert_eq!(h.events(), vec![Event::Notify("world stopping".to_string())]);
        assert_eq!(report, StopReport::default());
    }

    #[tokio::test]
    async fn test_pre_stop_cancel_skips_warnings_but_saves() {
        let h = Harness::with_cancel(vec![Some(2); 7], Some(1));
        let report = h
            .orchestrator
            .pre_stop(Some(&endpoint()), &CancelSignal::new())
            .await;
        assert!(report.cancelled);
        assert_eq!(report.warnings_sent, 1);
        assert!(report.saved);
        assert_eq!(h.events().last(), Some(&Event::Console(SAVE_COMMAND.to_string())));
    }
}
