// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Packet reassembly: `AddPacket`, `CopyToUser`, `GetResendRange`.

use crate::collab::BufferPool;
use crate::error::Error;
use crate::gap::Placement;
use crate::rpc::{PacketBuf, Rpc};

/// Maximum packets copied to user buffers per `CopyToUser` batch, so no
/// RPC lock is held across an unbounded amount of copying.
const COPY_BATCH_SIZE: usize = 20;

/// Result of attempting to place one received packet into a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Packet accepted; `bytes_remaining` decreased by the payload size.
    Kept,
    /// Packet's range exceeds the message's known length
    /// (`packet_discards`).
    DiscardedTooLong,
    /// Same as `DiscardedTooLong`, but the retransmit bit was set
    /// (`resent_discards`).
    DiscardedTooLongRetransmit,
    /// Packet crossed a gap boundary without full alignment or full
    /// interior containment.
    DiscardedViolation,
    /// Packet's range fell entirely over already-received bytes: a true
    /// duplicate, touching no gap.
    DiscardedDuplicate,
}

impl AddOutcome {
    pub fn is_kept(self) -> bool {
        matches!(self, AddOutcome::Kept)
    }
}

/// Add one received packet buffer to `rpc`'s incoming message
/// (`AddPacket`). Returns the net change to
/// `bytes_remaining` the caller should fold into the dispatcher's
/// `*delta` accumulator (positive on keep, zero otherwise).
pub fn add_packet(rpc: &Rpc, packet: PacketBuf, retransmit: bool) -> (AddOutcome, i64) {
    let mut msgin = rpc.msgin.lock();
    let s = packet.offset;
    let l = packet.data.len() as u32;
    let e = s + l;

    if msgin.length >= 0 && e > msgin.length as u32 {
        let outcome = if retransmit {
            AddOutcome::DiscardedTooLongRetransmit
        } else {
            AddOutcome::DiscardedTooLong
        };
        return (outcome, 0);
    }

    if s == msgin.recv_end {
        msgin.recv_end = e;
    } else if s > msgin.recv_end {
        let old_recv_end = msgin.recv_end;
        msgin.gaps.push_new_gap(old_recv_end, s);
        msgin.recv_end = e;
    } else {
        match msgin.gaps.place(s, e) {
            Placement::Violation => return (AddOutcome::DiscardedViolation, 0),
            Placement::Duplicate => return (AddOutcome::DiscardedDuplicate, 0),
            Placement::Accepted => {}
        }
    }

    msgin.packets.push(packet);
    msgin.bytes_remaining = msgin.bytes_remaining.saturating_sub(l);
    (AddOutcome::Kept, l as i64)
}

/// Drain the message's packet queue into `pool`, honoring the
/// no-RPC-lock-during-copy discipline (`CopyToUser`).
pub fn copy_to_user(rpc: &Rpc, pool: &dyn BufferPool) -> Result<usize, Error> {
    let mut total_copied = 0usize;
    loop {
        let batch: Vec<PacketBuf> = {
            let mut msgin = rpc.msgin.lock();
            if msgin.packets.is_empty() {
                break;
            }
            let take = COPY_BATCH_SIZE.min(msgin.packets.len());
            msgin.packets.drain(..take).collect()
        };
        if batch.is_empty() {
            break;
        }
        rpc.set_copying_to_user();

        let mut batch_err = None;
        for pkt in &batch {
            match pool.copy_in(rpc.id, pkt.offset, &pkt.data) {
                Ok(n) => total_copied += n,
                Err(e) => {
                    batch_err = Some(e);
                    break;
                }
            }
        }
        // Packet buffers are freed whether or not the batch succeeded;
        // dropping `batch` here does that (single-owner semantics,
        // ).
        drop(batch);
        rpc.clear_copying_to_user();

        if let Some(e) = batch_err {
            return Err(e);
        }
    }
    Ok(total_copied)
}

/// Compute the retransmit request this RPC should emit next
/// (`GetResendRange`). Returns `(offset, length)`;
/// `length == 0` means "nothing to resend".
pub fn get_resend_range(rpc: &Rpc) -> (u32, u32) {
    let msgin = rpc.msgin.lock();
    if msgin.length < 0 {
        return (0, 100);
    }
    if let Some(gap) = msgin.gaps.first() {
        return (gap.start, gap.end - gap.start);
    }
    if msgin.granted > msgin.recv_end {
        return (msgin.recv_end, msgin.granted - msgin.recv_end);
    }
    (0, 0)
}
