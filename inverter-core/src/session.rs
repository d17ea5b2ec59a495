//! Bulk session: send N framed requests and collect N responses over one
//! accepted connection, tolerating per-request read failures.
//!
//! The inverter's firmware corrupts responses if requests overlap in
//! flight, so writes are strictly sequential with an empirically required
//! pacing delay between them -- this is deliberately not pipelined.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::frame::declared_total_len;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const INTER_REQUEST_PACING: Duration = Duration::from_millis(100);

/// Runs every request in `requests` over `stream`, in order, returning one
/// slot per request. A slot is `None` if its read failed or returned
/// nothing; once a read fails, every remaining slot is `None` too (the loop
/// stops issuing further requests on the broken connection).
pub async fn run_bulk_session(mut stream: TcpStream, requests: &[Vec<u8>]) -> Vec<Option<Vec<u8>>> {
    let mut responses = vec![None; requests.len()];

    for (i, request) in requests.iter().enumerate() {
        match exchange_one(&mut stream, request).await {
            Ok(response) => {
                debug!(index = i, bytes = response.len(), "received response");
                responses[i] = Some(response);
            }
            Err(e) => {
                warn!(index = i, error = %e, "bulk session read failed, aborting remaining requests");
                break;
            }
        }
        tokio::time::sleep(INTER_REQUEST_PACING).await;
    }

    responses
}

async fn exchange_one(stream: &mut TcpStream, request: &[u8]) -> Result<Vec<u8>, SessionError> {
    stream.write_all(request).await?;
    stream.flush().await?;

    let mut header = [0u8; 6];
    timeout(READ_TIMEOUT, stream.read_exact(&mut header))
        .await
        .map_err(|_| SessionError::ReadTimeout)??;

    let total_len = declared_total_len(&header);
    let mut buf = header.to_vec();
    buf.reserve(total_len.saturating_sub(6));

    while buf.len() < total_len {
        let mut chunk = vec![0u8; total_len - buf.len()];
        let n = timeout(READ_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| SessionError::ReadTimeout)??;
        if n == 0 {
            break; // EOF before the declared length arrived
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Ok(buf)
}
