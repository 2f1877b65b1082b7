//! WiFi provisioning over BLE
//!
//! A phone writes the SSID, the passphrase and the user's auth token to
//! three separate characteristics, in any order. Once all three are present
//! and the phone is subscribed to status notifications, one session runs:
//!
//! 1. join the WiFi network
//! 2. claim this homebase with the backend using the user's token
//! 3. report the terminal status and clear the credentials
//!
//! Only one session can be in flight; completeness triggers that arrive
//! meanwhile are ignored.

pub mod channel;
pub mod claim;
pub mod joiner;
pub mod status;

pub use channel::CredentialChannel;
pub use claim::{BackendClaimer, HttpClaimer};
pub use joiner::{NetworkJoiner, NmcliJoiner};
pub use status::{StatusCode, StatusReporter};

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialField {
    Ssid,
    Passphrase,
    Token,
}

impl fmt::Display for CredentialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialField::Ssid => write!(f, "SSID"),
            CredentialField::Passphrase => write!(f, "passphrase"),
            CredentialField::Token => write!(f, "user token"),
        }
    }
}

/// Credentials received so far for the next session
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    pub ssid: Option<String>,
    pub passphrase: Option<String>,
    pub token: Option<String>,
}

impl CredentialSet {
    pub fn set(&mut self, field: CredentialField, value: String) {
        let slot = match field {
            CredentialField::Ssid => &mut self.ssid,
            CredentialField::Passphrase => &mut self.passphrase,
            CredentialField::Token => &mut self.token,
        };
        *slot = Some(value);
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.ssid.is_some() && self.passphrase.is_some() && self.token.is_some()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ssid.is_none() && self.passphrase.is_none() && self.token.is_none()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn snapshot(&self) -> Option<Credentials> {
        Some(Credentials {
            ssid: self.ssid.clone()?,
            passphrase: self.passphrase.clone()?,
            token: self.token.clone()?,
        })
    }
}

// Secrets stay out of logs
impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("ssid", &self.ssid)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<set>"))
            .field("token", &self.token.as_ref().map(|_| "<set>"))
            .finish()
    }
}

struct Credentials {
    ssid: String,
    passphrase: String,
    token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Collecting,
    JoiningNetwork,
    NetworkJoined,
    NetworkFailed,
    Claiming,
    ClaimSucceeded,
    ClaimFailed,
}

impl SessionState {
    /// A session task owns the credentials from `JoiningNetwork` until finish
    pub fn is_in_flight(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Collecting)
    }
}

/// Summary of one finished session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub status: StatusCode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SessionOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == StatusCode::ClaimSucceeded
    }
}

/// Sent after a successful claim: the relay connection may now use this token
#[derive(Clone)]
pub struct ClaimHandoff {
    pub token: String,
}

struct SessionCore {
    credentials: CredentialSet,
    state: SessionState,
}

struct Shared<J, C> {
    device_id: String,
    joiner: J,
    claimer: C,
    reporter: StatusReporter,
    core: Mutex<SessionCore>,
    handoff: mpsc::UnboundedSender<ClaimHandoff>,
}

impl<J, C> Shared<J, C> {
    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        self.lock().state = state;
        debug!("Session state: {:?}", state);
    }

    fn finish(&self, handoff: Option<ClaimHandoff>) {
        {
            let mut core = self.lock();
            core.credentials.clear();
            core.state = SessionState::Idle;
        }

        if let Some(handoff) = handoff {
            if self.handoff.send(handoff).is_err() {
                debug!("No claim hand-off receiver");
            }
        }
    }
}

/// Handle to the single provisioning session of this process.
/// Cloned into every credential channel.
pub struct ProvisioningSession<J, C> {
    shared: Arc<Shared<J, C>>,
}

impl<J, C> Clone for ProvisioningSession<J, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<J: NetworkJoiner, C: BackendClaimer> ProvisioningSession<J, C> {
    /// Returns the session and the receiving end of claim hand-offs
    pub fn new(
        device_id: impl Into<String>,
        joiner: J,
        claimer: C,
        reporter: StatusReporter,
    ) -> (Self, mpsc::UnboundedReceiver<ClaimHandoff>) {
        let (handoff, handoff_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            device_id: device_id.into(),
            joiner,
            claimer,
            reporter,
            core: Mutex::new(SessionCore {
                credentials: CredentialSet::default(),
                state: SessionState::Idle,
            }),
            handoff,
        };

        let session = Self {
            shared: Arc::new(shared),
        };
        (session, handoff_rx)
    }

    /// Record one credential and start a session if that completed the set.
    /// Returns the session task when one was started.
    pub fn submit(&self, field: CredentialField, value: String) -> Option<JoinHandle<SessionOutcome>> {
        if value.is_empty() {
            warn!("Ignoring empty {}", field);
            return None;
        }

        {
            let mut core = self.shared.lock();
            core.credentials.set(field, value);
            if core.state == SessionState::Idle {
                core.state = SessionState::Collecting;
            }
        }
        info!("Received {}", field);

        self.try_start()
    }

    /// Forward a subscribe/unsubscribe event. A subscriber arriving after
    /// the credentials may start the session.
    pub fn set_subscribed(&self, subscribed: bool) -> Option<JoinHandle<SessionOutcome>> {
        self.shared.reporter.set_subscribed(subscribed);
        if subscribed {
            self.try_start()
        } else {
            None
        }
    }

    /// Start a session if the credentials are complete, a subscriber is
    /// attached and no session is in flight
    pub fn try_start(&self) -> Option<JoinHandle<SessionOutcome>> {
        let credentials = {
            let mut core = self.shared.lock();
            if core.state.is_in_flight() {
                debug!("Session already in flight ({:?})", core.state);
                return None;
            }
            if !self.shared.reporter.is_subscribed() {
                debug!("Waiting for a status subscriber");
                return None;
            }
            let credentials = core.credentials.snapshot()?;
            core.state = SessionState::JoiningNetwork;
            credentials
        };

        let shared = Arc::clone(&self.shared);
        Some(tokio::spawn(run_session(shared, credentials)))
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    #[cfg(test)]
    pub fn credentials(&self) -> CredentialSet {
        self.shared.lock().credentials.clone()
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }
}

/// Resets the session if the task unwinds before finishing
struct FinishGuard<'a, J, C> {
    shared: &'a Shared<J, C>,
    done: bool,
}

impl<J, C> FinishGuard<'_, J, C> {
    fn finish(mut self, handoff: Option<ClaimHandoff>) {
        self.done = true;
        self.shared.finish(handoff);
    }
}

impl<J, C> Drop for FinishGuard<'_, J, C> {
    fn drop(&mut self) {
        if !self.done {
            warn!("Provisioning session aborted, resetting");
            self.shared.reporter.report(StatusCode::Idle);
            self.shared.finish(None);
        }
    }
}

async fn run_session<J: NetworkJoiner, C: BackendClaimer>(
    shared: Arc<Shared<J, C>>,
    credentials: Credentials,
) -> SessionOutcome {
    let session_id = Uuid::new_v4();
    let started_at = Utc::now();
    let guard = FinishGuard {
        shared: &*shared,
        done: false,
    };

    info!(
        "Provisioning session {} started for SSID {:?}",
        session_id, credentials.ssid
    );
    shared.reporter.report(StatusCode::Connecting);

    let joined = match shared
        .joiner
        .join(&credentials.ssid, &credentials.passphrase)
        .await
    {
        Ok(joined) => joined,
        Err(e) => {
            warn!("WiFi join error: {:#}", e);
            false
        }
    };

    let status = if joined {
        shared.set_state(SessionState::NetworkJoined);
        shared.reporter.report(StatusCode::JoinSucceeded);

        shared.set_state(SessionState::Claiming);
        let claimed = match shared
            .claimer
            .claim(&shared.device_id, &credentials.token)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Claim error: {:#}", e);
                false
            }
        };

        if claimed {
            shared.set_state(SessionState::ClaimSucceeded);
            StatusCode::ClaimSucceeded
        } else {
            shared.set_state(SessionState::ClaimFailed);
            StatusCode::ClaimFailed
        }
    } else {
        shared.set_state(SessionState::NetworkFailed);
        StatusCode::JoinFailed
    };

    shared.reporter.report(status);

    let handoff = (status == StatusCode::ClaimSucceeded).then(|| ClaimHandoff {
        token: credentials.token.clone(),
    });
    guard.finish(handoff);

    let outcome = SessionOutcome {
        session_id,
        status,
        started_at,
        finished_at: Utc::now(),
    };
    let elapsed_ms = (outcome.finished_at - outcome.started_at).num_milliseconds();
    if outcome.succeeded() {
        info!(
            "Provisioning session {} succeeded after {} ms",
            outcome.session_id, elapsed_ms
        );
    } else {
        warn!(
            "Provisioning session {} failed: {} after {} ms",
            outcome.session_id, outcome.status, elapsed_ms
        );
    }
    outcome
}
