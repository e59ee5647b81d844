//! Credential extraction for WebSocket upgrade requests

use std::collections::HashMap;

use crate::auth::token::extract_bearer_token;
use crate::core::engine::ConnectParams;

/// Build connect parameters from the upgrade request.
///
/// The token comes from `Authorization: Bearer <token>` when that header is
/// present, otherwise from the `token` query parameter. `roomId` is passed
/// through raw and validated by the engine.
pub fn connect_params(query: &HashMap<String, String>, authorization: Option<&str>) -> ConnectParams {
    let header_token = authorization.and_then(|header| {
        let token = extract_bearer_token(header);
        if token.is_none() {
            log::debug!("Ignoring Authorization header without a bearer token");
        }
        token
    });

    let token = header_token.or_else(|| query.get("token").cloned());
    let room_id = query
        .get("roomId")
        .filter(|raw| !raw.is_empty())
        .cloned();

    ConnectParams { token, room_id }
}
