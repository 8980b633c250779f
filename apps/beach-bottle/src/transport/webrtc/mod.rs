use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::config::Config;
use crate::transport::{TransportError, TransportStatus, to_setup_error};

pub mod descriptor;
pub mod gather;

fn build_api(config: &Config) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    let mut setting = SettingEngine::default();
    setting.set_include_loopback_candidate(config.include_loopback);

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub async fn new_peer_connection(config: &Config) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let api = build_api(config)?;
    let rtc_config = RTCConfiguration {
        ice_servers: config.ice_servers.clone(),
        ..Default::default()
    };
    tracing::trace!(
        target = "beach_bottle::transport::webrtc",
        await = "api.new_peer_connection",
        state = "start",
        ice_servers = config.ice_servers.len()
    );
    let pc = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(to_setup_error)?;
    tracing::trace!(
        target = "beach_bottle::transport::webrtc",
        await = "api.new_peer_connection",
        state = "end"
    );
    Ok(Arc::new(pc))
}

/// Chat needs in-order, fully reliable delivery.
pub fn chat_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    }
}

/// Peer-connection `Connected` is not mapped: the chat is usable only once
/// the data channel opens, which is reported separately.
pub fn status_from_peer_state(state: RTCPeerConnectionState) -> Option<TransportStatus> {
    match state {
        RTCPeerConnectionState::Connecting => Some(TransportStatus::Connecting),
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
            Some(TransportStatus::Disconnected)
        }
        RTCPeerConnectionState::Failed => Some(TransportStatus::Failed),
        RTCPeerConnectionState::Unspecified
        | RTCPeerConnectionState::New
        | RTCPeerConnectionState::Connected => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_states_map_to_transport_status() {
        assert_eq!(
            status_from_peer_state(RTCPeerConnectionState::Failed),
            Some(TransportStatus::Failed)
        );
        assert_eq!(
            status_from_peer_state(RTCPeerConnectionState::Closed),
            Some(TransportStatus::Disconnected)
        );
        assert_eq!(
            status_from_peer_state(RTCPeerConnectionState::Connecting),
            Some(TransportStatus::Connecting)
        );
        assert_eq!(status_from_peer_state(RTCPeerConnectionState::Connected), None);
        assert_eq!(status_from_peer_state(RTCPeerConnectionState::New), None);
    }

    #[test]
    fn chat_channel_is_ordered_and_reliable() {
        let init = chat_channel_init();
        assert_eq!(init.ordered, Some(true));
        assert!(init.max_retransmits.is_none());
        assert!(init.max_packet_life_time.is_none());
    }

    #[tokio::test]
    async fn localhost_peer_connection_builds() {
        let pc = match new_peer_connection(&Config::localhost()).await {
            Ok(pc) => pc,
            Err(err) => {
                tracing::trace!(target = "beach_bottle::transport::webrtc", error = %err, "skipping localhost_peer_connection_builds");
                return;
            }
        };
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::New);
        let _ = pc.close().await;
    }
}
