//! One write-only BLE characteristic feeding one credential field

use super::{BackendClaimer, CredentialField, NetworkJoiner, ProvisioningSession, SessionOutcome};
use tokio::task::JoinHandle;
use tracing::warn;

pub struct CredentialChannel<J, C> {
    field: CredentialField,
    session: ProvisioningSession<J, C>,
}

impl<J: NetworkJoiner, C: BackendClaimer> CredentialChannel<J, C> {
    pub fn new(field: CredentialField, session: ProvisioningSession<J, C>) -> Self {
        Self { field, session }
    }

    /// Handle a raw characteristic write. Payloads that are not UTF-8 are
    /// dropped.
    pub fn on_write(&self, payload: &[u8]) -> Option<JoinHandle<SessionOutcome>> {
        match std::str::from_utf8(payload) {
            Ok(value) => self.session.submit(self.field, value.to_string()),
            Err(e) => {
                warn!("Dropping {} write: invalid UTF-8 ({})", self.field, e);
                None
            }
        }
    }
}
