use anyhow::Result;
use relaycast_client::{
    ws, LoopbackDevice, LoopbackSource, MediaConstraints, ProduceOptions, RecordingView,
    SessionNegotiator,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Reply deadline for every probe request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Walk a full publish-and-subscribe negotiation against a running server
///
/// Publishes one synthetic video track, then consumes the room's latest
/// producer on a second transport of the same connection.
pub async fn run(url: &str) -> Result<()> {
    let client = ws::connect(url).await?.with_timeout(REQUEST_TIMEOUT);
    let socket_id = client.wait_connected().await?;
    info!(socket_id = %socket_id, url = %url, "Probe connected");

    let mut negotiator = SessionNegotiator::new(
        Arc::new(client),
        Arc::new(LoopbackDevice::default()),
        Arc::new(LoopbackSource::default()),
        Arc::new(RecordingView::default()),
    );

    negotiator.request_capabilities().await?;
    let track = negotiator
        .acquire_local_media(&MediaConstraints::default())
        .await?;
    negotiator.open_send_transport().await?;
    let producer = negotiator.produce(&ProduceOptions::simulcast_video()).await?;
    info!(track_id = %track.id, producer_id = %producer.id, "Probe producing");

    negotiator.open_receive_transport().await?;
    let consumer = negotiator.consume().await?;
    info!(
        consumer_id = %consumer.id,
        producer_id = %consumer.producer_id,
        phase = %negotiator.phase(),
        "Probe consuming"
    );

    negotiator.close_producer().await?;
    negotiator.close();
    info!("Probe finished");
    Ok(())
}
