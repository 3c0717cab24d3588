// es-test-utils: Shared test utilities for the bridge integration suite.
//
// Provides in-process stand-ins for the two upstream surfaces the bridge
// talks to — the Twitch OAuth/Helix HTTP API and the EventSub websocket —
// plus a polling helper for asserting on asynchronously-updated state.

pub mod mock_eventsub;
pub mod mock_twitch;

pub use mock_eventsub::MockEventSub;
pub use mock_twitch::MockTwitch;

use std::future::Future;
use std::time::Duration;

/// Poll `check` every 100 ms until it returns true or `timeout` elapses.
/// Returns whether the condition was observed.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn mock_twitch_serves_tokens_and_records_subscription_calls() {
        let mock = MockTwitch::start().await.unwrap();
        let client = reqwest::Client::new();

        let token: Value = client
            .post(mock.token_url())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(token["access_token"].as_str(), Some("mock-app-token"));

        let created: Value = client
            .post(format!("{}/eventsub/subscriptions", mock.helix_base()))
            .json(&json!({
                "type": "stream.online",
                "version": "1",
                "condition": {"broadcaster_user_id": "222"},
                "transport": {"method": "websocket", "session_id": "sess-a"},
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["data"][0]["id"].as_str().unwrap().to_owned();
        assert!(id.starts_with("mock-sub-"));
        assert_eq!(mock.created().len(), 1);
        assert_eq!(mock.subscriptions().len(), 1);

        let listing: Value = client
            .get(format!("{}/eventsub/subscriptions", mock.helix_base()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listing["data"].as_array().unwrap().len(), 1);

        let delete = client
            .delete(format!("{}/eventsub/subscriptions", mock.helix_base()))
            .query(&[("id", id.as_str())])
            .send()
            .await
            .unwrap();
        assert_eq!(delete.status(), 204);
        assert_eq!(mock.deleted(), vec![id]);
        assert!(mock.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn mock_eventsub_welcomes_each_connection_with_a_fresh_session() {
        let mock = MockEventSub::start().await.unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(mock.url()).await.unwrap();
        let frame = ws.next().await.unwrap().unwrap();
        let parsed: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(
            parsed["metadata"]["message_type"].as_str(),
            Some("session_welcome")
        );
        assert_eq!(
            parsed["payload"]["session"]["id"].as_str(),
            Some(MockEventSub::session_id(1).as_str())
        );
        assert_eq!(mock.connections(), 1);

        ws.close(None).await.unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || async { mock.closed() == 1 }).await,
            "server should observe the close"
        );
    }
}
