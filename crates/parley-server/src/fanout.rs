//! Post-commit notification fan-out.
//!
//! Runs on a spawned task after a message's durable commit, so the send
//! path never waits on it and its failures never convert a successful send
//! into a failed response. The batch insert is deduplicated on
//! `(message_id, receiver_id)` in the store, which makes the bounded retry
//! loop safe.

use std::sync::Arc;
use std::time::Duration;

use parley_shared::{profile::ANONYMOUS_LABEL, SubjectKey};
use parley_store::{Database, Message};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::dispatch::{Dispatcher, Event};

/// Materialize and deliver the per-recipient notifications for one message.
pub async fn run_message_fanout(
    db: Arc<Mutex<Database>>,
    dispatcher: Dispatcher,
    message: Message,
    max_retries: u32,
) {
    // Resolve the audience and the sender's label up front. A failure here
    // is retried together with the insert below.
    let prepared = {
        let db = db.lock().await;
        prepare(&db, &message)
    };

    let (recipients, sender_label) = match prepared {
        Ok(Some(p)) => p,
        Ok(None) => {
            // Sender is the only remaining participant: a valid no-op.
            debug!(message = %message.id, "fan-out audience empty, skipping");
            return;
        }
        Err(e) => {
            warn!(message = %message.id, error = %e, "fan-out audience resolution failed");
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = {
            let db = db.lock().await;
            db.insert_message_fanout(&message, &sender_label, &recipients)
        };

        match result {
            Ok(inserted) => {
                for notification in inserted {
                    if let Some(receiver) = notification.receiver_id {
                        dispatcher
                            .publish(SubjectKey::User(receiver), Event::Notification(notification))
                            .await;
                    }
                }
                return;
            }
            Err(e) if attempt <= max_retries => {
                warn!(
                    message = %message.id,
                    attempt,
                    error = %e,
                    "notification fan-out failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
            Err(e) => {
                // The message itself was already sent; delivery of the
                // notifications degrades, nothing else.
                warn!(
                    message = %message.id,
                    error = %e,
                    "notification fan-out gave up; message delivery unaffected"
                );
                return;
            }
        }
    }
}

type PreparedFanout = (Vec<uuid::Uuid>, String);

fn prepare(
    db: &Database,
    message: &Message,
) -> Result<Option<PreparedFanout>, parley_store::StoreError> {
    let recipients: Vec<uuid::Uuid> = db
        .participants_unchecked(message.channel_id)?
        .into_iter()
        .filter(|id| *id != message.sender_id)
        .collect();

    if recipients.is_empty() {
        return Ok(None);
    }

    let sender_label = db
        .get_user(message.sender_id)
        .map(|profile| profile.display_label())
        .unwrap_or_else(|_| ANONYMOUS_LABEL.to_string());

    Ok(Some((recipients, sender_label)))
}
