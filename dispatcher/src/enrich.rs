//! `POST /t/enrich`: the in-page probe reports late device signals for
//! an impression. Best effort by contract — the endpoint always answers
//! 204, whatever the body looked like.

use crate::events::EventEmitter;
use http::StatusCode;
use hyper::Response;
use serde::Deserialize;
use shared::http::{SvcBody, full_body};
use stores::events::Enrichment;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EnrichPayload {
    impression_id: String,
    screen: Option<String>,
    dpr: Option<f64>,
    gpu: Option<String>,
    tz: Option<String>,
    model: Option<String>,
    os_version: Option<String>,
    arch: Option<String>,
}

pub fn handle(body: &[u8], emitter: &EventEmitter) -> Response<SvcBody> {
    match serde_json::from_slice::<EnrichPayload>(body) {
        Ok(payload) if !payload.impression_id.is_empty() => {
            emitter.enrich(
                payload.impression_id,
                Enrichment {
                    screen: payload.screen,
                    dpr: payload.dpr,
                    gpu: payload.gpu,
                    tz: payload.tz,
                    model: payload.model,
                    os_version: payload.os_version,
                    arch: payload.arch,
                },
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(error = %e, "undecodable enrichment payload");
        }
    }

    let mut response = Response::new(full_body(Vec::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}
