//! Outbound message flow
//!
//! Two tasks per peer. The queue multiplexer accepts messages and inventory
//! hints from any producer, so neither the object manager nor the server
//! ever blocks on a peer that is busy sending; it acts as the traffic cop
//! between the external world and the writer. The writer serializes one
//! message at a time to the transport and acknowledges each hand-off.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::network::peer::{OutMessage, Peer};
use crate::network::protocol::{InvMessage, InvVect, Message};

impl Peer {
    /// Multiplex outbound messages and trickled inventory into the writer's
    /// single hand-off slot. Runs as its own task.
    ///
    /// The `waiting` flag tracks whether the writer holds an unacknowledged
    /// message. The pending queue only ever contains messages not yet handed
    /// off, so at drain time there is never a doubt about who signals a
    /// message's completion.
    pub(crate) async fn queue_loop(
        self: Arc<Self>,
        mut output_rx: mpsc::Receiver<OutMessage>,
        mut inv_rx: mpsc::Receiver<InvVect>,
        send_tx: mpsc::Sender<OutMessage>,
        mut send_done_rx: mpsc::Receiver<()>,
    ) {
        let mut pending: VecDeque<OutMessage> = VecDeque::new();
        let mut inv_pending: VecDeque<InvVect> = VecDeque::new();
        let mut waiting = false;

        let interval = self.ctx.config.trickle_interval();
        let mut trickle = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        trickle.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(msg) = output_rx.recv() => {
                    waiting = Self::hand_off(&send_tx, msg, &mut pending, waiting).await;
                }

                // The writer notifies here once a message has gone out over
                // the network socket.
                Some(()) = send_done_rx.recv() => {
                    match pending.pop_front() {
                        Some(next) => {
                            let _ = send_tx.send(next).await;
                        }
                        None => waiting = false,
                    }
                }

                Some(inv) = inv_rx.recv() => {
                    // No handshake? They'll find out soon enough.
                    if self.version_known() {
                        inv_pending.push_back(inv);
                    }
                }

                _ = trickle.tick() => {
                    // Don't send anything if we're disconnecting or there is
                    // no queued inventory.
                    if self.disconnected() || inv_pending.is_empty() {
                        continue;
                    }

                    // Create and queue as many inv messages as needed to
                    // drain the inventory send queue.
                    let mut batch: Vec<InvVect> = Vec::new();
                    while let Some(inv) = inv_pending.pop_front() {
                        // Don't send inventory that became known after the
                        // initial check.
                        if self.is_known_inventory(&inv) {
                            continue;
                        }

                        batch.push(inv);

                        // The inventory being relayed is now known to the
                        // peer.
                        self.add_known_inventory(inv);

                        if batch.len() >= self.ctx.config.max_inv_trickle_size {
                            let inventory = std::mem::take(&mut batch);
                            let msg = OutMessage {
                                msg: Message::Inv(InvMessage { inventory }),
                                done: None,
                            };
                            waiting = Self::hand_off(&send_tx, msg, &mut pending, waiting).await;
                        }
                    }

                    if !batch.is_empty() {
                        let msg = OutMessage {
                            msg: Message::Inv(InvMessage { inventory: batch }),
                            done: None,
                        };
                        waiting = Self::hand_off(&send_tx, msg, &mut pending, waiting).await;
                    }
                }

                _ = self.quit.cancelled() => break,
            }
        }

        // Drain the queues before we go away so nothing is left waiting on
        // us. Messages already handed to the writer are its to signal.
        for msg in pending.drain(..) {
            msg.complete();
        }

        output_rx.close();
        while let Ok(msg) = output_rx.try_recv() {
            msg.complete();
        }

        inv_rx.close();
        while inv_rx.try_recv().is_ok() {}

        debug!("Peer queue handler done for {}", self);
        // Dropping send_tx is what lets the writer finish its own drain.
    }

    /// Give the message to the writer if it is free, otherwise queue it.
    /// Either way the writer now owes an acknowledgement, so the caller is
    /// waiting.
    async fn hand_off(
        send_tx: &mpsc::Sender<OutMessage>,
        msg: OutMessage,
        pending: &mut VecDeque<OutMessage>,
        waiting: bool,
    ) -> bool {
        if waiting {
            pending.push_back(msg);
        } else {
            let _ = send_tx.send(msg).await;
        }
        true
    }

    /// Write messages to the transport one at a time. Runs as its own task.
    pub(crate) async fn write_loop(
        self: Arc<Self>,
        mut send_rx: mpsc::Receiver<OutMessage>,
        send_done_tx: mpsc::Sender<()>,
    ) {
        loop {
            tokio::select! {
                Some(out) = send_rx.recv() => {
                    if out.msg.expects_reply() {
                        trace!("Sending {} to {}; expecting an answer", out.msg.command(), self);
                    }

                    if let Some(conn) = self.connection() {
                        match conn.write_message(&out.msg).await {
                            Ok(()) => {
                                self.stats.lock().bytes_written = conn.bytes_written();
                            }
                            Err(e) => {
                                debug!("Write to {} failed: {}", self, e);
                                self.disconnect();
                            }
                        }
                    }

                    // The completion signal fires whether or not the write
                    // succeeded; senders only care that the message left our
                    // hands.
                    out.complete();
                    let _ = send_done_tx.send(()).await;
                }

                _ = self.quit.cancelled() => break,
            }
        }

        // The multiplexer holds the sending half of our channel and drains
        // its own queues before exiting; once it is gone, recv returns None
        // and we know no further message can arrive mid-drain.
        while let Some(out) = send_rx.recv().await {
            out.complete();
        }

        debug!("Peer output handler done for {}", self);
    }
}
