//! Error taxonomy for the transport layers. Frame errors are recovered per
//! register group by the caller in [`crate::client`]; rendezvous and session
//! errors abort the current poll, which the coordinator turns into backoff.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("UDP discovery got no acknowledgement from the inverter after retries")]
    DiscoveryFailed,
    #[error("UDP acknowledged but no TCP connection arrived within the accept window")]
    AcceptTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("read timed out waiting for a response")]
    ReadTimeout,
}
