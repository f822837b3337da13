//! The core state machine: the claim table and the READ / WRIT / DONE
//! transitions, plus the connection-loss recovery rule.
//!
//! [`ArbiterState`] is plain synchronous logic with no I/O and no locking —
//! it is designed to be driven from a single task (see [`run`]), matching
//! the "arbiter's state is accessed only from the dispatcher executor"
//! concurrency rule.

use crate::wire::{Op, Response};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advised {
    Read,
    Writ,
    Wait,
}

#[derive(Debug, Clone)]
struct Claim {
    pid: u64,
    conn: ConnId,
    target: String,
    advised: Advised,
}

/// A notification the arbiter needs delivered to a connection that did not
/// itself send the request that caused it — a promotion, or `EXIT` at
/// shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promotion {
    pub conn: ConnId,
    pub response: Response,
}

/// The claim table. Insertion order is preserved (a plain `Vec`) since it is
/// significant for breaking ties between waiters on the same target.
#[derive(Debug, Default)]
pub struct ArbiterState {
    claims: Vec<Claim>,
}

impl ArbiterState {
    pub fn new() -> Self {
        Self { claims: Vec::new() }
    }

    #[cfg(test)]
    fn claim_count(&self) -> usize {
        self.claims.len()
    }

    /// Handle a `READ` or `WRIT` request, returning the immediate answer and
    /// recording the new claim.
    pub fn handle_request(&mut self, pid: u64, conn: ConnId, target: &str, op: Op) -> Response {
        debug_assert!(matches!(op, Op::Read | Op::Writ));

        let has_writ_or_wait = self
            .claims
            .iter()
            .any(|c| c.target == target && matches!(c.advised, Advised::Writ | Advised::Wait));
        let has_read = self
            .claims
            .iter()
            .any(|c| c.target == target && c.advised == Advised::Read);

        let (response, advised) = match op {
            Op::Read => {
                if has_writ_or_wait {
                    (Response::Wait, Advised::Wait)
                } else {
                    // Whether or not a READ claim already exists, an
                    // uncontended READ is always answered READ — including
                    // when no claim exists yet at all.
                    (Response::Read, Advised::Read)
                }
            }
            Op::Writ => {
                if has_writ_or_wait {
                    (Response::Wait, Advised::Wait)
                } else if has_read {
                    (Response::Read, Advised::Read)
                } else {
                    (Response::Writ, Advised::Writ)
                }
            }
            Op::Done => unreachable!("DONE is handled by handle_done"),
        };

        self.claims.push(Claim {
            pid,
            conn,
            target: target.to_string(),
            advised,
        });

        response
    }

    /// Handle a `DONE` for `(pid, target)`. Removes the producer's claim
    /// (if any — a second `DONE` for an already-removed claim is a no-op,
    /// satisfying idempotence) and promotes every other waiter on the same
    /// target from `WAIT` to `READ`.
    pub fn handle_done(&mut self, pid: u64, target: &str) -> Vec<Promotion> {
        let own_idx = self
            .claims
            .iter()
            .position(|c| c.pid == pid && c.target == target);

        let Some(own_idx) = own_idx else {
            return Vec::new();
        };
        self.claims.remove(own_idx);

        let mut promotions = Vec::new();
        for claim in self.claims.iter_mut() {
            if claim.target == target && claim.advised == Advised::Wait {
                claim.advised = Advised::Read;
                promotions.push(Promotion {
                    conn: claim.conn,
                    response: Response::Read,
                });
            }
        }
        promotions
    }

    /// Connection-loss recovery. Removes every claim that referred to
    /// `conn`. For each removed `WRIT` claim, the earliest remaining `WAIT`
    /// claim on the same target is promoted to `WRIT` so a crashed
    /// producer's waiters are never stuck.
    pub fn handle_disconnect(&mut self, conn: ConnId) -> Vec<Promotion> {
        let lost: Vec<Claim> = {
            let mut lost = Vec::new();
            self.claims.retain(|c| {
                if c.conn == conn {
                    lost.push(c.clone());
                    false
                } else {
                    true
                }
            });
            lost
        };

        let mut promotions = Vec::new();
        for claim in lost {
            if claim.advised != Advised::Writ {
                continue;
            }
            if let Some(waiter) = self
                .claims
                .iter_mut()
                .find(|c| c.target == claim.target && c.advised == Advised::Wait)
            {
                waiter.advised = Advised::Writ;
                promotions.push(Promotion {
                    conn: waiter.conn,
                    response: Response::Writ,
                });
            }
        }
        promotions
    }
}

/// Messages the connection tasks and the lifecycle controller send to the
/// single arbiter task.
#[derive(Debug)]
pub enum ArbiterMsg {
    /// A newly accepted connection registers its outbox so the arbiter can
    /// deliver unsolicited promotions (and, on shutdown, `EXIT`) to it.
    Connect { conn: ConnId, outbox: mpsc::UnboundedSender<Response> },
    /// `conn` has gone away; run connection-loss recovery for any claims it
    /// held.
    Disconnect { conn: ConnId },
    /// A `READ` or `WRIT` request awaiting its one direct answer.
    Request {
        pid: u64,
        conn: ConnId,
        target: String,
        op: Op,
        reply: oneshot::Sender<Response>,
    },
    /// A `DONE` notification. No direct reply is ever sent for it.
    Done { pid: u64, target: String },
}

/// Runs the arbiter task to completion. Exits once every sender handle for
/// `rx` has been dropped (i.e. the server is shutting down and every
/// connection task, plus the acceptor, has gone away).
pub async fn run(mut rx: mpsc::UnboundedReceiver<ArbiterMsg>) {
    let mut state = ArbiterState::new();
    let mut registry: HashMap<ConnId, mpsc::UnboundedSender<Response>> = HashMap::new();

    info!("arbiter task started");

    while let Some(msg) = rx.recv().await {
        match msg {
            ArbiterMsg::Connect { conn, outbox } => {
                registry.insert(conn, outbox);
            }
            ArbiterMsg::Disconnect { conn } => {
                registry.remove(&conn);
                let promotions = state.handle_disconnect(conn);
                deliver(&registry, promotions);
            }
            ArbiterMsg::Request { pid, conn, target, op, reply } => {
                let response = state.handle_request(pid, conn, &target, op);
                debug!(pid, conn, %target, ?op, ?response, "request answered");
                let _ = reply.send(response);
            }
            ArbiterMsg::Done { pid, target } => {
                let promotions = state.handle_done(pid, &target);
                debug!(pid, %target, promoted = promotions.len(), "done processed");
                deliver(&registry, promotions);
            }
        }
    }

    info!("arbiter task exiting");
}

fn deliver(registry: &HashMap<ConnId, mpsc::UnboundedSender<Response>>, promotions: Vec<Promotion>) {
    for promotion in promotions {
        if let Some(outbox) = registry.get(&promotion.conn) {
            // The connection may have disconnected between recovery running
            // and this send; a closed channel is not an error here.
            let _ = outbox.send(promotion.response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(state: &mut ArbiterState, pid: u64, conn: ConnId, target: &str, op: Op) -> Response {
        state.handle_request(pid, conn, target, op)
    }

    // At most one WRIT claim per target.
    #[test]
    fn uniqueness_of_producer() {
        let mut s = ArbiterState::new();
        assert_eq!(req(&mut s, 1, 1, "a", Op::Writ), Response::Writ);
        assert_eq!(req(&mut s, 2, 2, "a", Op::Writ), Response::Wait);
        assert_eq!(req(&mut s, 3, 3, "a", Op::Writ), Response::Wait);
    }

    // A WRIT or WAIT already in flight forces new READs to WAIT.
    #[test]
    fn no_reader_during_production() {
        let mut s = ArbiterState::new();
        assert_eq!(req(&mut s, 1, 1, "a", Op::Writ), Response::Writ);
        assert_eq!(req(&mut s, 2, 2, "a", Op::Read), Response::Wait);
        assert_eq!(req(&mut s, 3, 3, "a", Op::Read), Response::Wait);
    }

    // A second DONE for an already-removed claim is a no-op.
    #[test]
    fn done_is_idempotent() {
        let mut s = ArbiterState::new();
        req(&mut s, 1, 1, "a", Op::Writ);
        let first = s.handle_done(1, "a");
        assert!(first.is_empty());
        assert_eq!(s.claim_count(), 0);
        let second = s.handle_done(1, "a");
        assert!(second.is_empty());
        assert_eq!(s.claim_count(), 0);
    }

    // A producer's connection loss promotes exactly one waiter.
    #[test]
    fn liveness_under_producer_failure() {
        let mut s = ArbiterState::new();
        req(&mut s, 1, 1, "d", Op::Writ);
        req(&mut s, 2, 2, "d", Op::Read);
        req(&mut s, 3, 3, "d", Op::Read);

        let promotions = s.handle_disconnect(1);
        assert_eq!(promotions, vec![Promotion { conn: 2, response: Response::Writ }]);
    }

    // First producer, late reader.
    #[test]
    fn first_producer_late_reader() {
        let mut s = ArbiterState::new();
        assert_eq!(req(&mut s, 7, 1, "a", Op::Writ), Response::Writ);
        assert_eq!(req(&mut s, 8, 2, "a", Op::Read), Response::Wait);
        let promotions = s.handle_done(7, "a");
        assert_eq!(promotions, vec![Promotion { conn: 2, response: Response::Read }]);
    }

    // Two writers race; the waiter becomes a reader, not a writer.
    #[test]
    fn two_writers_race() {
        let mut s = ArbiterState::new();
        assert_eq!(req(&mut s, 1, 1, "b", Op::Writ), Response::Writ);
        assert_eq!(req(&mut s, 2, 2, "b", Op::Writ), Response::Wait);
        let promotions = s.handle_done(1, "b");
        assert_eq!(promotions, vec![Promotion { conn: 2, response: Response::Read }]);
    }

    // A READ after production has completed is answered READ directly.
    #[test]
    fn reader_after_production_completes() {
        let mut s = ArbiterState::new();
        assert_eq!(req(&mut s, 1, 1, "c", Op::Writ), Response::Writ);
        assert!(s.handle_done(1, "c").is_empty());
        assert_eq!(req(&mut s, 2, 2, "c", Op::Read), Response::Read);
    }

    // The producer dies; the earliest waiter is promoted to WRIT, and its
    // own DONE later promotes the remaining waiter to READ.
    #[test]
    fn producer_dies() {
        let mut s = ArbiterState::new();
        assert_eq!(req(&mut s, 1, 1, "d", Op::Writ), Response::Writ);
        assert_eq!(req(&mut s, 2, 2, "d", Op::Read), Response::Wait);
        assert_eq!(req(&mut s, 3, 3, "d", Op::Read), Response::Wait);

        let promotions = s.handle_disconnect(1);
        assert_eq!(promotions, vec![Promotion { conn: 2, response: Response::Writ }]);

        let promotions = s.handle_done(2, "d");
        assert_eq!(promotions, vec![Promotion { conn: 3, response: Response::Read }]);
    }

    #[test]
    fn read_with_no_existing_claim_answers_read() {
        let mut s = ArbiterState::new();
        assert_eq!(req(&mut s, 1, 1, "never-produced", Op::Read), Response::Read);
    }

    #[test]
    fn disconnect_of_a_reader_needs_no_promotion() {
        let mut s = ArbiterState::new();
        req(&mut s, 1, 1, "a", Op::Writ);
        req(&mut s, 2, 2, "a", Op::Read);
        assert!(s.handle_disconnect(2).is_empty());
        assert_eq!(s.claim_count(), 1);
    }

    #[test]
    fn disconnect_of_a_waiter_needs_no_promotion() {
        let mut s = ArbiterState::new();
        req(&mut s, 1, 1, "a", Op::Writ);
        req(&mut s, 2, 2, "a", Op::Writ); // answered WAIT, since a is already being produced
        assert!(s.handle_disconnect(2).is_empty());
        assert_eq!(s.claim_count(), 1);
    }
}
