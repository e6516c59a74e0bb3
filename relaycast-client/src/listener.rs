use async_trait::async_trait;
use relaycast_proto::{
    AppData, ConnectRecvTransport, ConnectTransport, DtlsParameters, MediaKind, Produce,
    RtpParameters, StateReason,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::channel::SignalingClient;
use crate::error::{NegotiationError, Result};
use crate::media::{Direction, TransportListener};

/// Relays local transport callbacks over the signaling channel
pub struct SignalingListener {
    client: Arc<SignalingClient>,
    direction: Direction,
    transport_id: String,
    connected: AtomicBool,
}

impl SignalingListener {
    pub fn new(client: Arc<SignalingClient>, direction: Direction, transport_id: String) -> Self {
        Self {
            client,
            direction,
            transport_id,
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TransportListener for SignalingListener {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(NegotiationError::state(
                StateReason::AlreadyConnected,
                format!("{} transport {} already connected", self.direction, self.transport_id),
            ));
        }

        let reply = match self.direction {
            Direction::Send => {
                self.client
                    .request(&ConnectTransport { dtls_parameters })
                    .await?
            }
            Direction::Recv => {
                self.client
                    .request(&ConnectRecvTransport { dtls_parameters })
                    .await?
            }
        };

        reply.into_result().map_err(|payload| {
            warn!(transport_id = %self.transport_id, error = %payload, "Server refused transport connect");
            NegotiationError::from(payload)
        })?;
        debug!(transport_id = %self.transport_id, direction = %self.direction, "Transport connect acknowledged");
        Ok(())
    }

    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<String> {
        if self.direction != Direction::Send {
            return Err(NegotiationError::state(
                StateReason::TransportMismatch,
                format!("transport {} cannot produce", self.transport_id),
            ));
        }

        let reply = self
            .client
            .request(&Produce {
                transport_id: Some(self.transport_id.clone()),
                kind,
                rtp_parameters,
                app_data,
            })
            .await?;
        let produced = reply.into_result().map_err(NegotiationError::from)?;
        debug!(transport_id = %self.transport_id, producer_id = %produced.id, "Server assigned producer id");
        Ok(produced.id)
    }
}
