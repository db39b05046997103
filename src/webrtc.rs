//! Relays WebRTC signaling between the cloud and the local camera streamer.

use std::sync::Arc;

use log::{info, warn};
use serde_json::{Value, json};

use crate::config::constants;
use crate::settings::SettingsStore;
use crate::transport::HttpTransport;

const REQUEST_FAILED: &str = "WebRTC request failed. Couldn't connect to the camera streamer.";
const REMOTE_FAILED: &str =
    "WebRTC remote handshake failed. Couldn't connect to the camera streamer.";
const OFFER_FAILED: &str =
    "WebRTC connection completion failed. Couldn't connect to the camera streamer.";

pub struct WebrtcRelay {
    transport: Arc<dyn HttpTransport>,
    settings: Arc<SettingsStore>,
}

impl WebrtcRelay {
    pub fn new(transport: Arc<dyn HttpTransport>, settings: Arc<SettingsStore>) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Ask the streamer for a new stream.
    ///
    /// Requests repeating the last auth key seen, or carrying none, are
    /// ignored and yield `None`. A new key is persisted before the streamer
    /// is contacted.
    pub async fn request(&self, auth_key: Option<&str>) -> Option<Value> {
        let key = auth_key?;
        if self.settings.get().webrtc_auth_key.as_deref() == Some(key) {
            return None;
        }
        if let Err(e) = self
            .settings
            .update(|s| s.webrtc_auth_key = Some(key.to_string()))
        {
            warn!("Could not persist WebRTC auth key: {}", e);
        }

        info!("Requesting WebRTC stream");
        let body = json!({
            "type": "request",
            "res": null,
            "iceServers": [{"urls": [constants::STUN_SERVER]}],
        });
        let mut reply = self.relay(body, REQUEST_FAILED).await;
        inject_auth_key(&mut reply, Some(key));
        Some(reply)
    }

    /// Forward the viewer's ICE candidates.
    pub async fn remote_candidate(&self, data: &Value, auth_key: Option<&str>) -> Value {
        let body = json!({
            "type": data["type"],
            "id": data["id"],
            "candidates": data["candidates"],
        });
        let mut reply = self.relay(body, REMOTE_FAILED).await;
        inject_auth_key(&mut reply, auth_key);
        reply
    }

    /// Forward the viewer's SDP offer.
    pub async fn offer(&self, data: &Value, auth_key: Option<&str>) -> Value {
        let body = json!({
            "type": data["type"],
            "id": data["id"],
            "sdp": data["sdp"],
        });
        let mut reply = self.relay(body, OFFER_FAILED).await;
        inject_auth_key(&mut reply, auth_key);
        reply
    }

    /// `{"webrtc_data": <streamer reply>}` on success, else `{"webrtc_error": failure}`.
    async fn relay(&self, body: Value, failure: &str) -> Value {
        let url = self.settings.get().webrtc_url;
        match self
            .transport
            .post_json(&url, &body, Some(constants::SHORT_REQUEST_TIMEOUT))
            .await
        {
            Ok(response) if response.status == 200 => match response.json() {
                Some(data) => return json!({ "webrtc_data": data }),
                None => warn!("Camera streamer at {} sent a non-JSON reply", url),
            },
            Ok(response) => warn!("Camera streamer at {} answered HTTP {}", url, response.status),
            Err(e) => warn!("Camera streamer at {} unreachable: {}", url, e),
        }
        json!({ "webrtc_error": failure })
    }
}

/// Attach the viewer's auth key to a successful signaling reply.
pub fn inject_auth_key(reply: &mut Value, auth_key: Option<&str>) {
    if let (Some(key), Some(data)) = (auth_key, reply.get_mut("webrtc_data")) {
        if let Some(data) = data.as_object_mut() {
            data.insert("auth_key".to_string(), Value::from(key));
        }
    }
}
