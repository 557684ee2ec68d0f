// SPDX-License-Identifier: Apache-2.0 OR MIT

//! BUSY packet handling ("BUSY").
//!
//! Nothing to do beyond what the dispatcher already performs for every
//! recognized packet (clearing `silent_ticks`): BUSY's only purpose is
//! to tell us the peer is alive, with no retransmission obligation.

use crate::rpc::Rpc;

pub fn handle(rpc: &Rpc) {
    rpc.clear_silent_ticks();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Peer, PeerId};
    use crate::rpc::{Role, RpcState};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    #[test]
    fn busy_clears_silent_ticks() {
        let rpc = Rpc::new(2, Role::Client, Arc::new(Peer::new(PeerId(1))), 1, 2, RpcState::Outgoing);
        rpc.silent_ticks.store(5, Ordering::Relaxed);
        handle(&rpc);
        assert_eq!(rpc.silent_ticks.load(Ordering::Relaxed), 0);
    }
}
