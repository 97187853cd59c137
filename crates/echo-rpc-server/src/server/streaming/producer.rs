use echo_rpc_core::{Error, proto::Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

pub type ResponseSender = mpsc::Sender<Result<Message, Status>>;

/// Sends every value from `values` to `resp_tx`, in order.
///
/// Stops early, without sending anything further, when the receiver is
/// dropped or `shutdown` is cancelled. On shutdown the client is sent an
/// `Unavailable` status on a best-effort basis.
///
/// Returns the number of units delivered.
///
/// # Errors
///
/// - [`Error::RequestCancelled`] if the receiver went away.
/// - [`Error::ServiceShutdown`] if the service stopped mid-stream.
pub async fn emit_all<I>(
    values: I,
    resp_tx: ResponseSender,
    shutdown: CancellationToken,
) -> echo_rpc_core::Result<u64>
where
    I: IntoIterator<Item = f64>,
{
    let mut sent = 0_u64;

    for value in values {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                if let Err(e) = resp_tx.try_send(Err(Error::ServiceShutdown.into())) {
                    tracing::debug!("Failed to forward shutdown status: {e}");
                }
                return Err(Error::ServiceShutdown);
            }
            res = resp_tx.send(Ok(Message { value })) => {
                if res.is_err() {
                    return Err(Error::RequestCancelled);
                }
            }
        }
        sent += 1;
    }

    Ok(sent)
}
