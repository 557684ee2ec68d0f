// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CUTOFFS packet handling ("CUTOFFS").

use crate::peer::Peer;
use crate::wire::CutoffsPacket;

pub fn handle(peer: &Peer, pkt: &CutoffsPacket) {
    peer.apply_cutoffs(pkt.unsched_cutoffs, pkt.cutoff_version);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerId, HOMA_MAX_PRIORITIES};
    use crate::wire::CommonHeader;

    #[test]
    fn applies_cutoffs_and_bumps_version() {
        let peer = Peer::new(PeerId(1));
        let mut cutoffs = [500u32; HOMA_MAX_PRIORITIES];
        cutoffs[0] = 0;
        handle(&peer, &CutoffsPacket {
            common: CommonHeader { sport: 1, dport: 2, sender_id: 2 },
            unsched_cutoffs: cutoffs,
            cutoff_version: 9,
        });
        assert_eq!(peer.cutoff_version(), 9);
        assert_eq!(peer.unsched_cutoffs()[0], u32::MAX);
        assert_eq!(peer.unsched_cutoffs()[1], 500);
    }
}
