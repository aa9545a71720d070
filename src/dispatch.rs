use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::error::AppResult;
use crate::models::{NotificationCategory, NotificationRecord};
use crate::push::PushTransport;
use crate::store::ConversationStore;

/// Whether a dispatch reached the user on at least one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    NotSent,
}

/// Fans a notification out to all of a user's registered push endpoints.
///
/// Dispatch runs only after the triggering state change has committed, and
/// the caller absorbs every dispatcher failure: a send, like or comment
/// never fails because a push did.
pub struct NotificationDispatcher {
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn PushTransport>,
    clock: SharedClock,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn PushTransport>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
        }
    }

    pub async fn dispatch(
        &self,
        user_id: Uuid,
        category: NotificationCategory,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> AppResult<DispatchOutcome> {
        let preferences = self.store.notification_preferences(user_id).await?;
        if !preferences.allows(category) {
            // Disabled category: no attempt, no audit row.
            debug!(%user_id, category = category.as_str(), "notification category disabled");
            return Ok(DispatchOutcome::NotSent);
        }

        let endpoints = self.store.push_endpoints(user_id).await?;
        if endpoints.is_empty() {
            return Ok(DispatchOutcome::NotSent);
        }

        let mut payload = serde_json::json!({
            "type": category.as_str(),
            "title": title,
            "body": body,
        });
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), data.as_object()) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }

        let mut delivered_any = false;
        for endpoint in endpoints {
            let result = self
                .transport
                .deliver(&endpoint.endpoint, &endpoint.keys, &payload)
                .await;

            let (delivered, error) = match &result {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            self.store
                .record_notification(&NotificationRecord {
                    id: Uuid::new_v4(),
                    user_id,
                    category,
                    title: title.to_string(),
                    body: body.to_string(),
                    payload: payload.clone(),
                    delivered,
                    error,
                    created_at: self.clock.now(),
                    read_at: None,
                })
                .await?;

            match result {
                Ok(()) => delivered_any = true,
                Err(e) if e.is_permanent() => {
                    // The browser dropped the subscription; forget it.
                    info!(%user_id, endpoint = %endpoint.endpoint, error = %e,
                        "deregistering dead push endpoint");
                    self.store.remove_push_endpoint(&endpoint.endpoint).await?;
                }
                Err(e) => {
                    warn!(%user_id, endpoint = %endpoint.endpoint, error = %e,
                        "push delivery failed, endpoint kept");
                }
            }
        }

        Ok(if delivered_any {
            DispatchOutcome::Sent
        } else {
            DispatchOutcome::NotSent
        })
    }
}
