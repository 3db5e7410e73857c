// Per-characteristic indication subscriptions
//
// One record per characteristic holding the connection that last wrote the
// client configuration descriptor and whether it asked for indications.

use log::{debug, info};

use crate::attribute::CharacteristicId;
use crate::link::ConnHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionState {
    pub connection: Option<ConnHandle>,
    pub indication_enabled: bool,
}

/// What to do with records that reference a connection which just went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPolicy {
    /// Leave records untouched; sends to the dead handle are rejected by the
    /// stack and tolerated by the indication pump.
    RetainStale,
    /// Reset every record that references the disconnected handle.
    ClearMatching,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRegistry {
    policy: DisconnectPolicy,
    states: [SubscriptionState; CharacteristicId::COUNT],
}

impl SubscriptionRegistry {
    pub fn new(policy: DisconnectPolicy) -> Self {
        Self {
            policy,
            states: [SubscriptionState::default(); CharacteristicId::COUNT],
        }
    }

    pub fn policy(&self) -> DisconnectPolicy {
        self.policy
    }

    pub fn on_subscribe(
        &mut self,
        characteristic: CharacteristicId,
        conn: ConnHandle,
        indication_enabled: bool,
    ) {
        self.states[characteristic.index()] = SubscriptionState {
            connection: Some(conn),
            indication_enabled,
        };
        info!(
            "🔔 {} subscription: conn_handle={}, indicate={}",
            characteristic, conn, indication_enabled
        );
    }

    /// Returns how many records were cleared.
    pub fn on_disconnect(&mut self, conn: ConnHandle) -> usize {
        match self.policy {
            DisconnectPolicy::RetainStale => 0,
            DisconnectPolicy::ClearMatching => {
                let mut cleared = 0;
                for state in self
                    .states
                    .iter_mut()
                    .filter(|s| s.connection == Some(conn))
                {
                    *state = SubscriptionState::default();
                    cleared += 1;
                }
                if cleared > 0 {
                    debug!(
                        "Cleared {} subscription(s) for disconnected conn_handle={}",
                        cleared, conn
                    );
                }
                cleared
            }
        }
    }

    pub fn is_subscribed(&self, characteristic: CharacteristicId) -> bool {
        self.states[characteristic.index()].indication_enabled
    }

    pub fn target_connection(&self, characteristic: CharacteristicId) -> Option<ConnHandle> {
        self.states[characteristic.index()].connection
    }

    pub fn state(&self, characteristic: CharacteristicId) -> SubscriptionState {
        self.states[characteristic.index()]
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DisconnectPolicy::ClearMatching)
    }
}
