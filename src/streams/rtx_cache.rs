use std::collections::BTreeMap;

use crate::rtp::RtpPacket;

/// Cache of sent packets to be able to answer NACKs.
///
/// Keyed by the rewritten (outgoing) sequence number. Bounded both by
/// packet count and packet age.
#[derive(Debug)]
pub(crate) struct RtxCache {
    max_packet_count: usize,
    max_packet_age_ms: u64,
    packet_by_seq: BTreeMap<u16, (u64, RtpPacket)>,
}

impl RtxCache {
    pub fn new(max_packet_count: usize, max_packet_age_ms: u64) -> Self {
        RtxCache {
            max_packet_count,
            max_packet_age_ms,
            packet_by_seq: BTreeMap::new(),
        }
    }

    pub fn cache_sent_packet(&mut self, packet: RtpPacket, now_ms: u64) {
        if self.max_packet_count == 0 {
            return;
        }

        self.packet_by_seq
            .insert(packet.sequence_number, (now_ms, packet));

        self.evict(now_ms);
    }

    pub fn get(&self, seq: u16) -> Option<&RtpPacket> {
        self.packet_by_seq.get(&seq).map(|(_, p)| p)
    }

    pub fn clear(&mut self) {
        self.packet_by_seq.clear();
    }

    fn evict(&mut self, now_ms: u64) {
        while self.packet_by_seq.len() > self.max_packet_count {
            self.packet_by_seq.pop_first();
        }

        self.packet_by_seq
            .retain(|_, (t, _)| now_ms.saturating_sub(*t) <= self.max_packet_age_ms);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket::new(1.into(), 96.into(), seq, 0, vec![0; 10])
    }

    #[test]
    fn caches_and_answers_by_seq() {
        let mut cache = RtxCache::new(10, 3000);

        cache.cache_sent_packet(packet(5), 0);
        assert_eq!(cache.get(5).map(|p| p.sequence_number), Some(5));
        assert!(cache.get(6).is_none());
    }

    #[test]
    fn evicts_by_count() {
        let mut cache = RtxCache::new(2, 3000);

        cache.cache_sent_packet(packet(1), 0);
        cache.cache_sent_packet(packet(2), 0);
        cache.cache_sent_packet(packet(3), 0);

        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn evicts_by_age() {
        let mut cache = RtxCache::new(10, 1000);

        cache.cache_sent_packet(packet(1), 0);
        cache.cache_sent_packet(packet(2), 1500);

        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn zero_sized_caches_nothing() {
        let mut cache = RtxCache::new(0, 3000);

        cache.cache_sent_packet(packet(1), 0);
        assert!(cache.get(1).is_none());
    }
}
