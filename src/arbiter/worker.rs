//! Write worker of the input arbiter.

use super::{ArbiterError, Counters, Request};
use crate::transport::SerialTransport;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Serves write requests until shutdown, then fails whatever is still queued
/// and returns the closed transport.
pub(super) fn run(
    mut transport: SerialTransport,
    mut rx: mpsc::UnboundedReceiver<Request>,
    closed: CancellationToken,
    counters: Arc<Counters>,
) -> SerialTransport {
    debug!("Arbiter worker running");

    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Shutdown => break,
            Request::Write {
                source,
                frame,
                reply,
            } => {
                if closed.is_cancelled() {
                    let _ = reply.send(Err(ArbiterError::Closed));
                    continue;
                }

                let result = transport.write_frame(&frame);
                let failed = result.is_err();
                match &result {
                    Ok(()) => counters.written(source),
                    Err(e) => error!("Write from {} failed, closing arbiter: {}", source, e),
                }

                if reply.send(result.map_err(ArbiterError::from)).is_err() {
                    debug!("Submitter from {} stopped waiting for its reply", source);
                }
                // The failing submitter gets the write error before the close.
                if failed {
                    closed.cancel();
                }
            }
        }
    }

    rx.close();
    let mut dropped = 0;
    while let Ok(request) = rx.try_recv() {
        if let Request::Write { reply, .. } = request {
            let _ = reply.send(Err(ArbiterError::Closed));
            dropped += 1;
        }
    }
    if dropped > 0 {
        info!("Failed {} pending submits on close", dropped);
    }

    transport.close();
    transport
}
