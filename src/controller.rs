//! Server lifecycle state machine and status polling

use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{ApiClient, ServerStatus, StatusResponse};
use crate::auth::SessionManager;
use crate::error::Error;

/// What the controller is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Polling,
    Starting,
    Stopping,
    Deleting,
}

/// The UI-facing view of the panel
///
/// Published on every change through the watch channel returned by
/// [`LifecycleController::subscribe`]. Readers never mutate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelState {
    /// Whether a session is active; `false` forces the login view
    pub signed_in: bool,

    /// Last authoritative server status
    pub status: ServerStatus,

    /// Joinable address (`ip:port`), present only while running
    pub ip_address: Option<String>,

    /// Whether the start action is available
    pub start_enabled: bool,

    /// Whether the stop action is available
    pub stop_enabled: bool,

    /// Whether the delete action is available
    pub delete_enabled: bool,

    /// Retryable failure message, cleared by the next successful poll
    pub error_message: Option<String>,
}

impl PanelState {
    /// The state before login and after teardown
    pub fn signed_out() -> Self {
        Self {
            signed_in: false,
            status: ServerStatus::Unknown,
            ip_address: None,
            start_enabled: false,
            stop_enabled: false,
            delete_enabled: false,
            error_message: None,
        }
    }
}

/// Button enablement derived from the observed status
fn flags(status: ServerStatus, ever_started: bool) -> (bool, bool, bool) {
    let running = status == ServerStatus::Running;
    (!running, running, ever_started || running)
}

/// Drives the observable server state machine on top of [`ApiClient`]
///
/// The controller is the sole writer of the published [`PanelState`]. It
/// polls the status endpoint on a fixed cadence and on every user command,
/// and trusts the most recently started poll over anything else.
pub struct LifecycleController {
    api: Arc<ApiClient>,
    session: Arc<SessionManager>,

    /// Cadence of the periodic poll
    poll_interval: Duration,

    /// Port appended to the reported server address
    game_port: u16,

    /// True once RUNNING has been observed; reset only by a successful delete
    ever_started: AtomicBool,

    /// Ticket handed to each poll as it starts
    poll_seq: AtomicU64,

    /// Highest ticket whose result has been applied
    applied_seq: AtomicU64,

    /// Current command phase; commands are not reentrant
    phase: Mutex<Phase>,

    state_tx: watch::Sender<PanelState>,

    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleController {
    /// Create a new controller in the signed-out state
    pub fn new(
        api: Arc<ApiClient>,
        session: Arc<SessionManager>,
        poll_interval: Duration,
        game_port: u16,
    ) -> Self {
        let (state_tx, _) = watch::channel(PanelState::signed_out());

        Self {
            api,
            session,
            poll_interval,
            game_port,
            ever_started: AtomicBool::new(false),
            poll_seq: AtomicU64::new(0),
            applied_seq: AtomicU64::new(0),
            phase: Mutex::new(Phase::Idle),
            state_tx,
            poll_task: Mutex::new(None),
        }
    }

    /// Subscribe to published state changes
    pub fn subscribe(&self) -> watch::Receiver<PanelState> {
        self.state_tx.subscribe()
    }

    /// The most recently published state
    pub fn current_state(&self) -> PanelState {
        self.state_tx.borrow().clone()
    }

    /// Read the current status and publish the resulting state
    ///
    /// Idempotent and safe to call while a command is in flight. A failed
    /// poll keeps the previous status on screen, sets the error message and
    /// leaves the buttons enabled so the user can retry. Only an expired
    /// session makes this return an error, after tearing the view down.
    pub async fn poll(&self) -> Result<(), Error> {
        let ticket = self.poll_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.begin_poll();

        let result = match self.api.server_status().await {
            Ok(response) => {
                self.apply_status(ticket, response);
                Ok(())
            }
            Err(err) if err.is_auth_expired() => {
                self.handle_auth_expired();
                Err(Error::AuthExpired)
            }
            Err(err) => {
                self.apply_poll_error(ticket, &err);
                Ok(())
            }
        };

        self.end_poll();
        result
    }

    /// Start the server
    ///
    /// Guarded: a no-op while the server is already running or another
    /// command is in flight. The re-poll issued afterwards, not the command
    /// response, decides what the UI shows.
    pub async fn start(&self) -> Result<(), Error> {
        if self.current_state().status == ServerStatus::Running {
            return Ok(());
        }
        if !self.enter(Phase::Starting) {
            return Ok(());
        }

        let outcome = self.api.start_server().await;
        let result = self.finish_command(outcome).await;
        self.leave();
        result
    }

    /// Stop the server
    ///
    /// Guarded: a no-op unless the server is running.
    pub async fn stop(&self) -> Result<(), Error> {
        if self.current_state().status != ServerStatus::Running {
            return Ok(());
        }
        if !self.enter(Phase::Stopping) {
            return Ok(());
        }

        let outcome = self.api.stop_server().await;
        let result = self.finish_command(outcome).await;
        self.leave();
        result
    }

    /// Delete the server after the user has confirmed
    ///
    /// This is the only delete entry point; the confirmation dialog itself
    /// belongs to the UI, which must not call this without an explicit yes.
    /// Guarded by the server having been observed running since the last
    /// deletion. Success resets that observation.
    pub async fn confirmed_delete(&self) -> Result<(), Error> {
        let deletable = self.ever_started.load(Ordering::SeqCst)
            || self.current_state().status == ServerStatus::Running;
        if !deletable {
            return Ok(());
        }
        if !self.enter(Phase::Deleting) {
            return Ok(());
        }

        let outcome = self.api.delete_server().await;
        if outcome.is_ok() {
            self.ever_started.store(false, Ordering::SeqCst);
        }
        let result = self.finish_command(outcome).await;
        self.leave();
        result
    }

    /// Begin polling on the configured cadence
    ///
    /// The first poll fires immediately. Replaces any previous poll task.
    pub fn start_polling(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if controller.poll().await.is_err() {
                    break;
                }
            }
        });

        let mut guard = self.poll_task.lock().unwrap();
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the periodic poll task, if any
    pub fn stop_polling(&self) {
        let mut guard = self.poll_task.lock().unwrap();
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    /// Whether a periodic poll task is installed
    pub fn is_polling(&self) -> bool {
        self.poll_task.lock().unwrap().is_some()
    }

    /// Publish the signed-out view and cancel the poll timer
    pub(crate) fn reset_to_signed_out(&self) {
        self.state_tx.send_replace(PanelState::signed_out());
        self.stop_polling();
    }

    /// The controller's current phase
    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    fn handle_auth_expired(&self) {
        warn!("session expired, returning to the login view");
        self.reset_to_signed_out();
    }

    /// Claim the phase for a command
    ///
    /// Commands are not reentrant, but an in-flight poll never blocks one;
    /// its button was enabled against the most recently published status.
    fn enter(&self, phase: Phase) -> bool {
        let mut guard = self.phase.lock().unwrap();
        match *guard {
            Phase::Idle | Phase::Polling => {
                *guard = phase;
                true
            }
            _ => false,
        }
    }

    fn leave(&self) {
        *self.phase.lock().unwrap() = Phase::Idle;
    }

    fn begin_poll(&self) {
        let mut guard = self.phase.lock().unwrap();
        if *guard == Phase::Idle {
            *guard = Phase::Polling;
        }
    }

    fn end_poll(&self) {
        let mut guard = self.phase.lock().unwrap();
        if *guard == Phase::Polling {
            *guard = Phase::Idle;
        }
    }

    /// Re-poll after a command and keep a command failure visible
    async fn finish_command(&self, outcome: Result<(), Error>) -> Result<(), Error> {
        if let Err(err) = &outcome {
            if err.is_auth_expired() {
                self.handle_auth_expired();
                return Err(Error::AuthExpired);
            }
        }

        self.poll().await?;

        if let Err(err) = outcome {
            self.state_tx
                .send_modify(|state| state.error_message = Some(err.to_string()));
        }

        Ok(())
    }

    /// Take ownership of a poll ticket's result
    ///
    /// The most recently started poll wins; a result superseded by a newer
    /// one is discarded so it cannot overwrite fresher state.
    fn claim(&self, ticket: u64) -> bool {
        let previous = self.applied_seq.fetch_max(ticket, Ordering::SeqCst);
        if previous >= ticket {
            debug!("discarding stale poll result (ticket {})", ticket);
            return false;
        }
        true
    }

    fn apply_status(&self, ticket: u64, response: StatusResponse) {
        // an orphaned completion must not touch a torn-down view
        if !self.session.is_authenticated() || !self.claim(ticket) {
            return;
        }

        if response.status == ServerStatus::Running {
            self.ever_started.store(true, Ordering::SeqCst);
        }
        let ever_started = self.ever_started.load(Ordering::SeqCst);
        let (start_enabled, stop_enabled, delete_enabled) = flags(response.status, ever_started);

        let ip_address = response
            .ip_address
            .map(|ip| format!("{}:{}", ip, self.game_port));

        self.state_tx.send_replace(PanelState {
            signed_in: true,
            status: response.status,
            ip_address,
            start_enabled,
            stop_enabled,
            delete_enabled,
            error_message: None,
        });
    }

    fn apply_poll_error(&self, ticket: u64, err: &Error) {
        if !self.session.is_authenticated() || !self.claim(ticket) {
            return;
        }

        let ever_started = self.ever_started.load(Ordering::SeqCst);
        self.state_tx.send_modify(|state| {
            // previous status stays on screen; buttons re-enable for retry
            let (start_enabled, stop_enabled, delete_enabled) = flags(state.status, ever_started);
            state.signed_in = true;
            state.start_enabled = start_enabled;
            state.stop_enabled = stop_enabled;
            state.delete_enabled = delete_enabled;
            state.error_message = Some(err.to_string());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::auth::{MemoryTokenStore, StoredTokens, TokenStore};
    use crate::config::{ApiConfig, IdentityConfig};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use reqwest::Client;
    use std::time::{SystemTime, UNIX_EPOCH};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_token(exp_offset: i64) -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
            + exp_offset;
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
        format!("header.{}.signature", payload)
    }

    fn controller_over(
        base_url: &str,
        refresh_token: Option<&str>,
    ) -> (Arc<LifecycleController>, Arc<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::new());
        store.save(&StoredTokens {
            id_token: make_token(3600),
            refresh_token: refresh_token.map(str::to_string),
        });
        let session = Arc::new(SessionManager::new(
            IdentityConfig::new(base_url, "client-1", "https://panel.example.com"),
            Client::new(),
            store.clone(),
        ));
        let api = Arc::new(ApiClient::new(
            ApiConfig::new(base_url),
            Client::new(),
            session.clone(),
        ));
        let controller = Arc::new(LifecycleController::new(
            api,
            session,
            Duration::from_secs(30),
            25565,
        ));
        (controller, store)
    }

    #[test]
    fn stopped_status_enables_start_only() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "STOPPED"
                })))
                .mount(&mock_server)
                .await;

            let (controller, _store) = controller_over(&mock_server.uri(), None);
            controller.poll().await.unwrap();

            let state = controller.current_state();
            assert!(state.signed_in);
            assert_eq!(state.status, ServerStatus::Stopped);
            assert!(state.start_enabled);
            assert!(!state.stop_enabled);
            // never observed running, so nothing to delete
            assert!(!state.delete_enabled);
            assert_eq!(state.error_message, None);
        });
    }

    #[test]
    fn running_status_sets_ever_started_and_surfaces_address() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "RUNNING",
                    "ip_address": "1.2.3.4"
                })))
                .mount(&mock_server)
                .await;

            let (controller, _store) = controller_over(&mock_server.uri(), None);
            controller.poll().await.unwrap();

            let state = controller.current_state();
            assert_eq!(state.status, ServerStatus::Running);
            assert_eq!(state.ip_address.as_deref(), Some("1.2.3.4:25565"));
            assert!(!state.start_enabled);
            assert!(state.stop_enabled);
            assert!(state.delete_enabled);
        });
    }

    #[test]
    fn repeated_polls_with_unchanged_status_are_idempotent() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "STOPPED"
                })))
                .mount(&mock_server)
                .await;

            let (controller, _store) = controller_over(&mock_server.uri(), None);
            controller.poll().await.unwrap();
            let first = controller.current_state();
            controller.poll().await.unwrap();
            let second = controller.current_state();

            assert_eq!(first, second);
        });
    }

    #[test]
    fn failed_poll_keeps_previous_status_and_reenables_buttons() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "RUNNING",
                    "ip_address": "1.2.3.4"
                })))
                .up_to_n_times(1)
                .mount(&mock_server)
                .await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
                .mount(&mock_server)
                .await;

            let (controller, _store) = controller_over(&mock_server.uri(), None);
            controller.poll().await.unwrap();
            controller.poll().await.unwrap();

            let state = controller.current_state();
            // the blip is shown but the last good status stays usable
            assert_eq!(state.status, ServerStatus::Running);
            assert!(state.error_message.is_some());
            assert!(state.stop_enabled);
            assert!(state.delete_enabled);
        });
    }

    #[test]
    fn unauthorized_poll_tears_down_the_view() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(401))
                .mount(&mock_server)
                .await;

            let (controller, store) = controller_over(&mock_server.uri(), None);
            controller.start_polling();
            assert!(controller.is_polling());

            assert!(matches!(controller.poll().await, Err(Error::AuthExpired)));
            assert_eq!(store.load(), None);
            assert_eq!(controller.current_state(), PanelState::signed_out());
            assert!(!controller.is_polling());
        });
    }

    #[test]
    fn start_command_repolls_for_the_truth() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "STOPPED"
                })))
                .up_to_n_times(1)
                .mount(&mock_server)
                .await;
            Mock::given(method("POST"))
                .and(path("/start-server"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
                .expect(1)
                .mount(&mock_server)
                .await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "RUNNING",
                    "ip_address": "5.6.7.8"
                })))
                .mount(&mock_server)
                .await;

            let (controller, _store) = controller_over(&mock_server.uri(), None);
            controller.poll().await.unwrap();
            controller.start().await.unwrap();

            let state = controller.current_state();
            assert_eq!(state.status, ServerStatus::Running);
            assert_eq!(state.ip_address.as_deref(), Some("5.6.7.8:25565"));
        });
    }

    #[test]
    fn start_is_a_noop_while_running() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "RUNNING",
                    "ip_address": "1.2.3.4"
                })))
                .mount(&mock_server)
                .await;
            Mock::given(method("POST"))
                .and(path("/start-server"))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(&mock_server)
                .await;

            let (controller, _store) = controller_over(&mock_server.uri(), None);
            controller.poll().await.unwrap();
            controller.start().await.unwrap();
        });
    }

    #[test]
    fn failed_command_stays_visible_after_the_repoll() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "STOPPED"
                })))
                .mount(&mock_server)
                .await;
            Mock::given(method("POST"))
                .and(path("/start-server"))
                .respond_with(ResponseTemplate::new(503).set_body_string("no capacity"))
                .mount(&mock_server)
                .await;

            let (controller, _store) = controller_over(&mock_server.uri(), None);
            controller.poll().await.unwrap();
            controller.start().await.unwrap();

            let state = controller.current_state();
            assert_eq!(state.status, ServerStatus::Stopped);
            assert!(state.error_message.as_deref().unwrap().contains("503"));
            // still retryable
            assert!(state.start_enabled);
        });
    }

    #[test]
    fn successful_delete_resets_ever_started() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "RUNNING",
                    "ip_address": "1.2.3.4"
                })))
                .up_to_n_times(1)
                .mount(&mock_server)
                .await;
            Mock::given(method("DELETE"))
                .and(path("/delete-server"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
                .expect(1)
                .mount(&mock_server)
                .await;
            Mock::given(method("GET"))
                .and(path("/server-status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "status": "STOPPED"
                })))
                .mount(&mock_server)
                .await;

            let (controller, _store) = controller_over(&mock_server.uri(), None);
            controller.poll().await.unwrap();
            assert!(controller.current_state().delete_enabled);

            controller.confirmed_delete().await.unwrap();

            let state = controller.current_state();
            assert_eq!(state.status, ServerStatus::Stopped);
            // nothing left to delete until the next RUNNING observation
            assert!(!state.delete_enabled);
        });
    }

    #[test]
    fn delete_is_a_noop_before_any_running_observation() {
        tokio_test::block_on(async {
            let mock_server = MockServer::start().await;
            Mock::given(method("DELETE"))
                .and(path("/delete-server"))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(&mock_server)
                .await;

            let (controller, _store) = controller_over(&mock_server.uri(), None);
            controller.confirmed_delete().await.unwrap();
        });
    }

    #[test]
    fn stale_poll_results_are_discarded() {
        tokio_test::block_on(async {
            let (controller, _store) = controller_over("http://127.0.0.1:9", None);
            // make the view live so results apply
            controller.session.available_credential();

            controller.apply_status(
                2,
                StatusResponse {
                    status: ServerStatus::Running,
                    ip_address: Some("1.2.3.4".to_string()),
                },
            );
            // an older poll resolving late must not overwrite newer state
            controller.apply_status(
                1,
                StatusResponse {
                    status: ServerStatus::Stopped,
                    ip_address: None,
                },
            );

            assert_eq!(controller.current_state().status, ServerStatus::Running);

            // the same rule applies to late errors
            controller.apply_poll_error(1, &Error::api(500, "late failure".to_string()));
            assert_eq!(controller.current_state().error_message, None);
        });
    }
}
