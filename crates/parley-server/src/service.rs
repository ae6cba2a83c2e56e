//! Send and broadcast pipelines.
//!
//! The send pipeline is strictly ordered: durable append first, then live
//! delivery to the channel's subscribers, then notification fan-out on a
//! detached task. A subscriber can therefore never observe a message that
//! the backfill query does not yet return.

use std::sync::Arc;

use parley_shared::{Role, RoleSet, SubjectKey};
use parley_store::{Attachment, Database, Message, Notification, StoreError};
use tokio::sync::Mutex;

use crate::dispatch::{Dispatcher, Event};
use crate::fanout;

#[derive(Clone)]
pub struct ChatService {
    db: Arc<Mutex<Database>>,
    dispatcher: Dispatcher,
    fanout_max_retries: u32,
}

impl ChatService {
    pub fn new(db: Arc<Mutex<Database>>, dispatcher: Dispatcher, fanout_max_retries: u32) -> Self {
        Self {
            db,
            dispatcher,
            fanout_max_retries,
        }
    }

    /// Append a message, deliver it live, and kick off notification
    /// fan-out.
    ///
    /// Returns as soon as the message is durable and published to the
    /// channel's subscribers; the fan-out runs fire-and-forget relative to
    /// this call and its failure degrades notification delivery only.
    pub async fn send_message(
        &self,
        channel_id: uuid::Uuid,
        sender_id: uuid::Uuid,
        content: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Message, StoreError> {
        let message = {
            let db = self.db.lock().await;
            db.append(channel_id, sender_id, content.as_deref(), attachments)?
        };

        // Live delivery only after the commit above.
        self.dispatcher
            .publish(
                SubjectKey::Channel(channel_id),
                Event::Message(message.clone()),
            )
            .await;

        tokio::spawn(fanout::run_message_fanout(
            self.db.clone(),
            self.dispatcher.clone(),
            message.clone(),
            self.fanout_max_retries,
        ));

        Ok(message)
    }

    /// Store a role broadcast and notify every current holder of the
    /// flagged roles over their personal subscription.
    pub async fn broadcast(
        &self,
        title: &str,
        content: Option<&str>,
        role_flags: RoleSet,
        image_url: Option<&str>,
        action_url: Option<&str>,
    ) -> Result<Notification, StoreError> {
        let (notification, holders) = {
            let db = self.db.lock().await;
            let notification = db.broadcast(title, content, role_flags, image_url, action_url)?;

            let mut holders = Vec::new();
            for role in [Role::Admin, Role::Coordinator, Role::Member] {
                if role_flags.contains(role) {
                    holders.extend(db.list_user_ids_with_role(role)?);
                }
            }
            holders.sort();
            holders.dedup();
            (notification, holders)
        };

        for user in holders {
            self.dispatcher
                .publish(SubjectKey::User(user), Event::Notification(notification.clone()))
                .await;
        }

        Ok(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SubsecRound, Utc};
    use parley_shared::UserProfile;
    use std::time::Duration;
    use uuid::Uuid;

    fn service() -> (ChatService, Arc<Mutex<Database>>, Dispatcher) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let dispatcher = Dispatcher::new(16);
        let service = ChatService::new(db.clone(), dispatcher.clone(), 2);
        (service, db, dispatcher)
    }

    async fn add_user(db: &Arc<Mutex<Database>>, name: &str, role: Role) -> UserProfile {
        let profile = UserProfile {
            id: Uuid::new_v4(),
            display_name: Some(name.to_string()),
            full_name: None,
            handle: None,
            avatar_url: None,
            role,
            created_at: Utc::now().trunc_subsecs(6),
        };
        db.lock().await.upsert_user(&profile).unwrap();
        profile
    }

    async fn recv_timeout(sub: &mut crate::dispatch::Subscription) -> Option<Event> {
        tokio::time::timeout(Duration::from_millis(500), sub.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn send_pipeline_delivers_live_and_backfillable() {
        let (service, db, dispatcher) = service();
        let u1 = add_user(&db, "U1", Role::Member).await;
        let u2 = add_user(&db, "U2", Role::Member).await;
        let channel = db
            .lock()
            .await
            .find_or_create_direct_channel(u1.id, u2.id)
            .unwrap();

        let mut live = dispatcher.subscribe(SubjectKey::Channel(channel.id)).await;

        let sent = service
            .send_message(channel.id, u1.id, Some("hello".into()), Vec::new())
            .await
            .unwrap();

        let event = recv_timeout(&mut live).await.expect("live message event");
        assert_eq!(event.row_id(), sent.id);

        // The live event was never ahead of the log: the row is queryable.
        let page = db.lock().await.list_range(channel.id, u2.id, None, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, sent.id);
    }

    #[tokio::test]
    async fn first_message_creates_notification_and_unread() {
        // Scenario: U1 and U2 have a fresh channel; U1 sends "hello".
        let (service, db, dispatcher) = service();
        let u1 = add_user(&db, "Ada", Role::Member).await;
        let u2 = add_user(&db, "U2", Role::Member).await;
        let channel = db
            .lock()
            .await
            .find_or_create_direct_channel(u1.id, u2.id)
            .unwrap();

        let mut personal = dispatcher.subscribe(SubjectKey::User(u2.id)).await;

        service
            .send_message(channel.id, u1.id, Some("hello".into()), Vec::new())
            .await
            .unwrap();

        let event = recv_timeout(&mut personal).await.expect("notification event");
        let Event::Notification(notification) = event else {
            panic!("expected a notification event");
        };
        assert_eq!(notification.receiver_id, Some(u2.id));
        assert_eq!(notification.title, "Ada sent you a message");

        let db = db.lock().await;
        assert_eq!(db.get_membership(channel.id, u2.id).unwrap().unread_count, 1);
        let visible = db
            .list_notifications_for_viewer(u2.id, Role::Member, 10)
            .unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn group_fanout_skips_the_sender() {
        let (service, db, dispatcher) = service();
        let a = add_user(&db, "A", Role::Member).await;
        let b = add_user(&db, "B", Role::Member).await;
        let c = add_user(&db, "C", Role::Member).await;
        let group = db
            .lock()
            .await
            .create_group_channel("Team", a.id, &[b.id, c.id])
            .unwrap();

        let mut sender_sub = dispatcher.subscribe(SubjectKey::User(b.id)).await;
        let mut a_sub = dispatcher.subscribe(SubjectKey::User(a.id)).await;
        let mut c_sub = dispatcher.subscribe(SubjectKey::User(c.id)).await;

        service
            .send_message(group.id, b.id, Some("ship it".into()), Vec::new())
            .await
            .unwrap();

        assert!(recv_timeout(&mut a_sub).await.is_some());
        assert!(recv_timeout(&mut c_sub).await.is_some());

        // B authored the message: no notification row, no personal event.
        let nothing =
            tokio::time::timeout(Duration::from_millis(50), sender_sub.recv()).await;
        assert!(nothing.is_err());
        let db = db.lock().await;
        assert!(db
            .list_notifications_for_viewer(b.id, Role::Member, 10)
            .unwrap()
            .is_empty());
        assert_eq!(
            db.list_notifications_for_viewer(a.id, Role::Member, 10)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_current_role_holders_live() {
        let (service, db, dispatcher) = service();
        let admin = add_user(&db, "Root", Role::Admin).await;
        let member = add_user(&db, "Plain", Role::Member).await;

        let mut admin_sub = dispatcher.subscribe(SubjectKey::User(admin.id)).await;
        let mut member_sub = dispatcher.subscribe(SubjectKey::User(member.id)).await;

        let notification = service
            .broadcast("Maintenance", Some("Sunday"), RoleSet::only(Role::Admin), None, None)
            .await
            .unwrap();

        let event = recv_timeout(&mut admin_sub).await.expect("admin event");
        assert_eq!(event.row_id(), notification.id);

        let nothing =
            tokio::time::timeout(Duration::from_millis(50), member_sub.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn broadcast_with_no_roles_is_rejected() {
        let (service, _db, _dispatcher) = service();
        let result = service
            .broadcast("Empty", None, RoleSet::default(), None, None)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidAudience(_))));
    }
}
