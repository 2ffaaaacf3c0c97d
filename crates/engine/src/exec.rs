//! Quorum fan-out executor
//!
//! Runs one operation against every peer in a set concurrently and
//! returns once "enough" of them answered. The DHT routinely contains
//! slow and dead peers; waiting for all of them is both slow and
//! pointless. Completion heuristic:
//!
//!   1. threshold = floor(len(peers) * wait_frac)
//!   2. once successes reach the threshold, arm a 500 ms grace ticker
//!   3. any new success before a tick re-arms it; a silent tick cancels
//!   4. independently, successes + completions >= len(peers) cancels at
//!      once, so half-success/half-failure sets never sit out the grace
//!      window

use std::future::Future;
use std::time::Duration;

use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::HostError;

/// Grace window granted for stragglers once the success threshold is met.
const GRACE_TICK: Duration = Duration::from_millis(500);

/// Invoke `op` once per peer in parallel and return the number of
/// successes once the completion heuristic fires.
///
/// Every invocation shares the `per_op_timeout` deadline and a child of
/// `cancel`; canceling the parent aborts the whole fan-out. With
/// `sloppy_exit` the function returns as soon as the heuristic fires,
/// leaving stragglers to finish on their own: each task writes its result
/// into a buffer sized for the full peer set, so late completions are
/// harmless. Without it, all completions are drained before returning.
///
/// `wait_frac` must be in (0, 1]; an empty peer set returns 0 at once.
pub async fn exec_on_many<F, Fut>(
    cancel: &CancellationToken,
    wait_frac: f64,
    per_op_timeout: Duration,
    op: F,
    peers: Vec<PeerId>,
    sloppy_exit: bool,
) -> usize
where
    F: Fn(CancellationToken, PeerId) -> Fut,
    Fut: Future<Output = Result<(), HostError>> + Send + 'static,
{
    if peers.is_empty() {
        return 0;
    }

    let total = peers.len();
    let threshold = (total as f64 * wait_frac) as usize;
    let shared = cancel.child_token();

    // Buffer holds one slot per peer so sloppy exits never strand a task
    // on a full channel.
    let (tx, mut rx) = mpsc::channel::<bool>(total);
    for peer in peers {
        let fut = op(shared.clone(), peer);
        let token = shared.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let ok = tokio::select! {
                _ = token.cancelled() => false,
                res = tokio::time::timeout(per_op_timeout, fut) => {
                    matches!(res, Ok(Ok(())))
                }
            };
            let _ = tx.try_send(ok);
        });
    }
    drop(tx);

    let mut num_done = 0usize;
    let mut num_success = 0usize;
    let mut success_since_tick = 0usize;
    let mut ticker: Option<tokio::time::Interval> = None;

    while num_done < total {
        tokio::select! {
            res = rx.recv() => {
                let Some(ok) = res else { break };
                num_done += 1;
                if ok {
                    num_success += 1;
                    if num_success >= threshold && ticker.is_none() {
                        // Enough successes: give stragglers a short grace
                        // window instead of an open-ended wait.
                        ticker = Some(tokio::time::interval_at(
                            tokio::time::Instant::now() + GRACE_TICK,
                            GRACE_TICK,
                        ));
                        success_since_tick = num_success;
                    }
                    if num_success + num_done >= total {
                        trace!(num_success, num_done, total, "fan-out cutoff reached");
                        shared.cancel();
                        if sloppy_exit {
                            return num_success;
                        }
                    }
                }
            }
            _ = async { ticker.as_mut().unwrap().tick().await }, if ticker.is_some() => {
                if num_success > success_since_tick {
                    success_since_tick = num_success;
                } else {
                    trace!(num_success, num_done, total, "grace window closed");
                    shared.cancel();
                    if sloppy_exit {
                        return num_success;
                    }
                }
            }
        }
    }
    num_success
}
