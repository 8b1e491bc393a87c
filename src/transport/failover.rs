//! Reconnect policy and entity state replay.
//!
//! When failover is enabled, the transport supervisor re-dials after a
//! fatal I/O error and replays the recorded lifecycle commands so the
//! broker rebuilds the same logical entities under the same ids. The
//! recording lives here: the connection registers each successful
//! `*Info` command and forgets it again when the entity is removed.

use std::sync::Mutex;

use tokio::time::Duration;

use crate::command::{Command, CommandBody, RemovedEntity};
use crate::uri::UriOptions;

/// Upper bound on the delay between reconnect attempts.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Lifecycle commands to replay after a reconnect, in registration order.
#[derive(Debug, Default)]
pub(crate) struct RecoveryState {
    commands: Mutex<Vec<Command>>,
}

impl RecoveryState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a registration command for replay.
    pub(crate) fn record(&self, command: Command) {
        let mut commands = self.commands.lock().expect("recovery state poisoned");
        commands.push(command);
    }

    /// Forget the registration matching a removed entity.
    pub(crate) fn forget(&self, entity: &RemovedEntity) {
        let mut commands = self.commands.lock().expect("recovery state poisoned");
        commands.retain(|command| !registers(command, entity));
    }

    /// The commands to replay, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<Command> {
        self.commands.lock().expect("recovery state poisoned").clone()
    }
}

fn registers(command: &Command, entity: &RemovedEntity) -> bool {
    match (&command.body, entity) {
        (CommandBody::ConnectionInfo(info), RemovedEntity::Connection(id)) => {
            info.connection_id == *id
        }
        (CommandBody::SessionInfo(info), RemovedEntity::Session(id)) => info.session_id == *id,
        (CommandBody::ConsumerInfo(info), RemovedEntity::Consumer(id)) => info.consumer_id == *id,
        (CommandBody::ProducerInfo(info), RemovedEntity::Producer(id)) => info.producer_id == *id,
        _ => false,
    }
}

/// Reconnect schedule derived from the failover URI options.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FailoverPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) initial_delay: Duration,
}

impl FailoverPolicy {
    /// Build the policy, or `None` when failover is off.
    pub(crate) fn from_options(options: &UriOptions) -> Option<Self> {
        options.failover_enabled().then_some(Self {
            max_attempts: options.max_reconnect_attempts,
            initial_delay: options.initial_reconnect_delay,
        })
    }

    /// Delay before `attempt` (1-based), doubling up to a fixed ceiling.
    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (self.initial_delay * factor).min(MAX_RECONNECT_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use crate::command::{ConsumerId, ConsumerInfo, SessionId, SessionInfo};
    use crate::destination::Destination;

    use super::*;

    fn session_info(value: i64) -> Command {
        Command::new(CommandBody::SessionInfo(SessionInfo {
            session_id: SessionId {
                connection_id: "ID:c-1".into(),
                value,
            },
        }))
    }

    #[test]
    fn forgetting_removes_only_the_matching_registration() {
        let state = RecoveryState::new();
        state.record(session_info(1));
        state.record(session_info(2));
        state.record(Command::new(CommandBody::ConsumerInfo(ConsumerInfo {
            consumer_id: ConsumerId {
                connection_id: "ID:c-1".into(),
                session_id: 1,
                value: 9,
            },
            destination: Destination::queue("q"),
            prefetch_size: 100,
            selector: None,
            no_local: false,
        })));

        state.forget(&RemovedEntity::Session(SessionId {
            connection_id: "ID:c-1".into(),
            value: 1,
        }));

        let left = state.snapshot();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0], session_info(2));
    }

    #[test]
    fn delays_double_up_to_the_ceiling() {
        let policy = FailoverPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(30), MAX_RECONNECT_DELAY);
    }

    #[test]
    fn policy_is_absent_when_failover_is_off() {
        assert!(FailoverPolicy::from_options(&UriOptions::default()).is_none());
    }
}
