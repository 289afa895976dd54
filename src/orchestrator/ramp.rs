use futures::future;
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tracing::{debug, error, info};

use crate::client::ClientId;
use crate::clock;
use crate::config::{Config, RampUpPolicy};
use crate::error::{ConnectError, RunError};
use crate::metrics::{MetricSink, Record};
use crate::transport::{self, LifecycleSender, Opened, TransportConfig};

type Attempt = (ClientId, Result<Opened, ConnectError>);

/// Opens `num_clients` connections under the configured policy.
///
/// Either every connection is open when this returns, ordered by id, or the
/// first failure is returned after the connections that did open have been
/// closed again.
pub async fn ramp_up(
    config: &Config,
    transport: &TransportConfig,
    sink: &MetricSink,
    lifecycle: LifecycleSender,
) -> Result<Vec<Opened>, RunError> {
    let expected = config.run.num_clients as usize;
    let policy = config.ramp_up.policy;
    debug!("Ramping up {} clients ({:?})", expected, policy);

    let mut attempts: JoinSet<Attempt> = JoinSet::new();
    let mut opened = Vec::with_capacity(expected);
    let mut failure = None;

    for n in 0..config.run.num_clients {
        let id = ClientId(n);
        let transport = transport.clone();
        let lifecycle = lifecycle.clone();
        attempts.spawn(async move {
            let result = transport::connect(id, &transport, Some(lifecycle)).await;
            (id, result)
        });

        if policy == RampUpPolicy::Paced {
            time::sleep(config.ramp_interval()).await;

            // stop issuing attempts as soon as one fails
            while let Some(joined) = attempts.try_join_next() {
                if let Err(e) = settle(joined, sink, &mut opened) {
                    failure.get_or_insert(e);
                }
            }
            if failure.is_some() {
                break;
            }
        }
    }
    drop(lifecycle);

    while let Some(joined) = attempts.join_next().await {
        if let Err(e) = settle(joined, sink, &mut opened) {
            failure.get_or_insert(e);
        }
    }

    let failure = match failure {
        Some(e) => Some(e),
        None if opened.len() != expected => Some(RunError::PartialPool {
            connected: opened.len(),
            expected,
        }),
        None => None,
    };
    if let Some(e) = failure {
        info!("Closing {} connections opened before the failure", opened.len());
        let grace = config.grace_period();
        future::join_all(opened.into_iter().map(|o| o.connection.finish(grace))).await;
        return Err(e);
    }

    opened.sort_by_key(|o| o.connection.id());
    Ok(opened)
}

fn settle(
    joined: Result<Attempt, JoinError>,
    sink: &MetricSink,
    opened: &mut Vec<Opened>,
) -> Result<(), RunError> {
    match joined {
        Ok((id, Ok(connection))) => {
            let ms = clock::duration_ms(connection.connect_time);
            sink.record(Record::connection_time(id, ms));
            opened.push(connection);
            Ok(())
        }
        Ok((id, Err(source))) => Err(RunError::RampUp { id, source }),
        Err(e) => {
            // counted as missing by the pool size check
            error!("Connect task failed: {}", e);
            Ok(())
        }
    }
}
