use echo_rpc_core::{Error, proto::Message};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Reads `inbound` to its end, handing each value to `f` in arrival order.
///
/// Returns the number of values read. A failed inbound stream surfaces its
/// status unchanged; a cancelled `shutdown` ends the read with
/// `Unavailable`.
pub async fn for_each_value<S, F>(
    inbound: &mut S,
    shutdown: &CancellationToken,
    mut f: F,
) -> Result<u64, Status>
where
    S: Stream<Item = Result<Message, Status>> + Unpin,
    F: FnMut(f64),
{
    let mut count = 0_u64;
    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Err(Error::ServiceShutdown.into()),
            next = inbound.next() => next,
        };
        match next {
            Some(msg) => {
                f(msg?.value);
                count += 1;
            }
            None => return Ok(count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    fn messages(values: &[f64]) -> Vec<Result<Message, Status>> {
        values.iter().map(|&value| Ok(Message { value })).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reads_until_end_of_stream() {
        let mut inbound = futures::stream::iter(messages(&[1.0, 2.0, 3.0]));
        let mut seen = Vec::new();
        let count = for_each_value(&mut inbound, &CancellationToken::new(), |v| seen.push(v))
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(seen, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inbound_failure_propagates() {
        let mut items = messages(&[1.0]);
        items.push(Err(Status::data_loss("truncated")));
        items.extend(messages(&[2.0]));
        let mut inbound = futures::stream::iter(items);

        let mut seen = Vec::new();
        let err = for_each_value(&mut inbound, &CancellationToken::new(), |v| seen.push(v))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DataLoss);
        assert_eq!(seen, vec![1.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_interrupts_a_pending_stream() {
        let mut inbound = futures::stream::pending::<Result<Message, Status>>();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let err = for_each_value(&mut inbound, &shutdown, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }
}
