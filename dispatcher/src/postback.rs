//! Conversion ingest: `GET /postback?click_id=...` links a reported
//! conversion back to the click it came from.

use crate::events::EventEmitter;
use crate::fingerprint;
use chrono::Utc;
use http::StatusCode;
use hyper::Response;
use shared::http::{SvcBody, make_boxed_error_response};
use std::collections::HashMap;
use std::sync::Arc;
use stores::events::EventStore;

/// Looks up the click, mints a conversion row carrying the click's
/// attribution, and answers 200. Unknown click ids answer 404.
pub async fn handle(
    query: &HashMap<String, String>,
    events: &Arc<dyn EventStore>,
    emitter: &EventEmitter,
) -> Response<SvcBody> {
    let Some(click_id) = query.get("click_id").filter(|v| !v.is_empty()) else {
        return make_boxed_error_response(StatusCode::NOT_FOUND);
    };

    let click = match events.find_click(click_id).await {
        Ok(Some(click)) => click,
        Ok(None) => return make_boxed_error_response(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(click_id, error = %e, "postback click lookup failed");
            return make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    // The conversion inherits the click's context and attribution.
    let mut conversion = click.clone();
    conversion.event_id = fingerprint::new_event_id();
    conversion.is_impression = false;
    conversion.is_click = false;
    conversion.is_conversion = true;
    conversion.click_id = Some(click.event_id.clone());
    conversion.payout = query.get("payout").and_then(|v| v.parse().ok());
    conversion.conversion_type = query.get("conversion_type").cloned();
    conversion.postback_data = Some(query.clone());
    conversion.created_at = Some(Utc::now());
    emitter.emit(conversion);

    Response::new(shared::http::full_body("ok"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::query_map;
    use stores::events::{Event, MemoryEventStore};

    fn stores() -> (Arc<MemoryEventStore>, Arc<dyn EventStore>, EventEmitter) {
        let store = Arc::new(MemoryEventStore::new());
        let events: Arc<dyn EventStore> = store.clone();
        let emitter = EventEmitter::new(store.clone());
        (store, events, emitter)
    }

    async fn settle(store: &MemoryEventStore, expected: usize) {
        for _ in 0..100 {
            if store.len() >= expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn conversion_links_back_to_the_click() {
        let (store, events, emitter) = stores();
        let click = Event {
            event_id: "CL".into(),
            session_id: "S".into(),
            campaign_id: "K".into(),
            is_click: true,
            ..Default::default()
        };
        store.insert(&click).await.unwrap();

        let query = query_map(&[
            ("click_id", "CL"),
            ("payout", "12.50"),
            ("conversion_type", "sale"),
            ("txid", "t-9"),
        ]);
        let response = handle(&query, &events, &emitter).await;
        assert_eq!(response.status(), StatusCode::OK);

        settle(&store, 2).await;
        let conversion = store
            .all()
            .into_iter()
            .find(|e| e.is_conversion)
            .expect("conversion row");
        assert!(!conversion.is_click);
        assert_eq!(conversion.click_id.as_deref(), Some("CL"));
        assert_eq!(conversion.session_id, "S");
        assert_eq!(conversion.campaign_id, "K");
        assert_eq!(conversion.payout, Some(12.50));
        assert_eq!(conversion.conversion_type.as_deref(), Some("sale"));
        assert_eq!(
            conversion.postback_data.as_ref().unwrap()["txid"],
            "t-9"
        );
        assert_ne!(conversion.event_id, "CL");
    }

    #[tokio::test]
    async fn unknown_click_answers_404() {
        let (store, events, emitter) = stores();
        let query = query_map(&[("click_id", "missing")]);
        let response = handle(&query, &events, &emitter).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        tokio::task::yield_now().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn missing_click_id_answers_404() {
        let (_, events, emitter) = stores();
        let response = handle(&HashMap::new(), &events, &emitter).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn impression_rows_do_not_satisfy_the_lookup() {
        let (store, events, emitter) = stores();
        let impression = Event {
            event_id: "IMP".into(),
            campaign_id: "K".into(),
            is_impression: true,
            ..Default::default()
        };
        store.insert(&impression).await.unwrap();

        let query = query_map(&[("click_id", "IMP")]);
        let response = handle(&query, &events, &emitter).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
