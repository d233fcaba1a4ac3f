//! Periodic no-op call that keeps an idle transport alive.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::{ConnectionState, Shared};
use crate::registry::Consumer;

/// Call `method` every `interval` until the connection stops being open.
///
/// Failures are logged and retried on the next tick. The loop exits as soon
/// as it observes the connection closing, so no timer outlives the socket.
/// At most one keepalive is registered at a time: a ping still unanswered
/// when the next one is due is withdrawn.
pub(crate) async fn run(shared: Arc<Shared>, interval: Duration, method: String) {
    let mut state_rx = shared.state.subscribe();
    let mut outstanding: Option<u64> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = state_rx.wait_for(|state| *state != ConnectionState::Open) => break,
        }

        if let Some(id) = outstanding.take() {
            if shared.registry.cancel(id).is_some() {
                debug!(id, method = %method, "previous keepalive unanswered, withdrawn");
            }
        }

        let name = method.clone();
        let consumer = Consumer::callback(move |outcome| match outcome {
            Ok(_) => debug!(method = %name, "keepalive acknowledged"),
            Err(e) if e.is_connection_lost() => {
                debug!(method = %name, "keepalive abandoned: {}", e)
            }
            Err(e) => warn!(method = %name, "Keepalive call failed: {}", e),
        });

        match shared.send_call(&method, None, consumer).await {
            Ok(id) => {
                debug!(id, "sent keepalive");
                outstanding = Some(id);
            }
            Err(e) if e.is_connection_lost() => break,
            Err(e) => warn!("Failed to send keepalive: {}", e),
        }
    }

    debug!("Keepalive loop stopped");
}
