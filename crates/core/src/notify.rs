use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::domain::identity::IdentityKey;
use crate::domain::workflow::ChainId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    StepActivated,
    ChainApproved,
    ChainRejected,
    GradingRestarted,
    GradingCompleted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepActivated => "step_activated",
            Self::ChainApproved => "chain_approved",
            Self::ChainRejected => "chain_rejected",
            Self::GradingRestarted => "grading_restarted",
            Self::GradingCompleted => "grading_completed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub chain_id: ChainId,
    pub request_ref: String,
    pub title: String,
    pub kind: NotificationKind,
    pub recipient: IdentityKey,
    pub recipient_name: String,
    /// Level the message is about; `None` for whole-chain outcomes.
    pub level: Option<u32>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("delivery to `{recipient}` failed: {reason}")]
    Delivery { recipient: IdentityKey, reason: String },
}

/// Delivery side of the engine. Implementations decide how a message travels;
/// the engine only decides when one is due.
pub trait NotificationPort: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotificationError>;
}

#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    delivered: Arc<Mutex<Vec<Notification>>>,
    failing: Arc<Mutex<HashSet<IdentityKey>>>,
    fail_all: Arc<Mutex<bool>>,
}

impl InMemoryNotifier {
    /// Every delivery fails until [`InMemoryNotifier::recover`] is called.
    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.set_fail_all(true);
        notifier
    }

    pub fn fail_for(&self, recipient: impl AsRef<str>) {
        match self.failing.lock() {
            Ok(mut failing) => failing.insert(IdentityKey::new(recipient)),
            Err(poisoned) => poisoned.into_inner().insert(IdentityKey::new(recipient)),
        };
    }

    pub fn recover(&self) {
        self.set_fail_all(false);
        match self.failing.lock() {
            Ok(mut failing) => failing.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    pub fn delivered(&self) -> Vec<Notification> {
        match self.delivered.lock() {
            Ok(delivered) => delivered.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_fail_all(&self, value: bool) {
        match self.fail_all.lock() {
            Ok(mut fail_all) => *fail_all = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    fn should_fail(&self, recipient: &IdentityKey) -> bool {
        let fail_all = match self.fail_all.lock() {
            Ok(fail_all) => *fail_all,
            Err(poisoned) => *poisoned.into_inner(),
        };
        let targeted = match self.failing.lock() {
            Ok(failing) => failing.contains(recipient),
            Err(poisoned) => poisoned.into_inner().contains(recipient),
        };
        fail_all || targeted
    }
}

impl NotificationPort for InMemoryNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        if self.should_fail(&notification.recipient) {
            return Err(NotificationError::Delivery {
                recipient: notification.recipient.clone(),
                reason: "simulated outage".to_string(),
            });
        }
        match self.delivered.lock() {
            Ok(mut delivered) => delivered.push(notification.clone()),
            Err(poisoned) => poisoned.into_inner().push(notification.clone()),
        }
        Ok(())
    }
}

/// Delivers by writing a structured log line.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl NotificationPort for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            event_name = "notification.delivered",
            chain_id = %notification.chain_id,
            request_ref = %notification.request_ref,
            kind = notification.kind.as_str(),
            recipient = %notification.recipient,
            level = notification.level,
            "notifying {} about `{}`",
            notification.recipient_name,
            notification.title
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryNotifier, Notification, NotificationKind, NotificationPort};
    use crate::domain::identity::IdentityKey;
    use crate::domain::workflow::ChainId;

    fn notification(recipient: &str) -> Notification {
        Notification {
            chain_id: ChainId("chain-1".into()),
            request_ref: "PO-1".into(),
            title: "Laptops".into(),
            kind: NotificationKind::StepActivated,
            recipient: IdentityKey::new(recipient),
            recipient_name: recipient.into(),
            level: Some(1),
        }
    }

    #[test]
    fn in_memory_notifier_records_deliveries() {
        let notifier = InMemoryNotifier::default();
        notifier.notify(&notification("ann@corp.test")).expect("delivered");

        let delivered = notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].recipient.as_str(), "ann@corp.test");
    }

    #[test]
    fn targeted_failures_only_affect_that_recipient() {
        let notifier = InMemoryNotifier::default();
        notifier.fail_for("BOB@corp.test");

        assert!(notifier.notify(&notification("bob@corp.test")).is_err());
        assert!(notifier.notify(&notification("ann@corp.test")).is_ok());

        notifier.recover();
        assert!(notifier.notify(&notification("bob@corp.test")).is_ok());
        assert_eq!(notifier.delivered().len(), 2);
    }

    #[test]
    fn failing_notifier_refuses_everything_until_recovered() {
        let notifier = InMemoryNotifier::failing();
        let error = notifier.notify(&notification("ann@corp.test")).expect_err("outage");
        assert!(error.to_string().contains("ann@corp.test"));
        assert!(notifier.delivered().is_empty());
    }
}
