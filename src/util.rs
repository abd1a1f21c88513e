use std::collections::VecDeque;
use std::iter::Sum;
use std::ops::{AddAssign, SubAssign};

/// Offset between the unix epoch and the NTP epoch (1900-01-01), in seconds.
const UNIX_NTP_OFFSET_SECS: u64 = 2_208_988_800;

/// Holds a history of values of type T for up to a window of milliseconds,
/// as well as the cumulated (total) value.
#[derive(Debug)]
pub(crate) struct ValueHistory<T> {
    value: T,
    history: VecDeque<(u64, T)>,
    window_ms: u64,
}

const DEFAULT_VALUE_HISTORY_WINDOW_MS: u64 = 1000;

impl<T: Default> Default for ValueHistory<T> {
    fn default() -> Self {
        Self {
            value: Default::default(),
            history: Default::default(),
            window_ms: DEFAULT_VALUE_HISTORY_WINDOW_MS,
        }
    }
}

impl<T> ValueHistory<T>
where
    T: Copy + AddAssign + SubAssign + Sum,
{
    /// Adds a timed value.
    /// Note: time should always monotonically increase in subsequent calls to add()
    pub fn push(&mut self, now_ms: u64, v: T) {
        self.value += v;
        self.history.push_back((now_ms, v));
    }

    /// Returns the sum of all values in the history within the window. Might
    /// return a stale value unless [`ValueHistory::purge_old`] is called before.
    pub fn sum(&self) -> T {
        self.value
    }

    /// Recalculates the sum purging values older than `now_ms - window_ms`.
    pub fn purge_old(&mut self, now_ms: u64) {
        while {
            let Some(front_t) = self.history.front().map(|v| v.0) else {
                return;
            };
            now_ms.saturating_sub(front_t) > self.window_ms
        } {
            if let Some((_, v)) = self.history.pop_front() {
                self.value -= v;
            }
        }
    }
}

/// RTP timestamp offset aligning a stream onto the timestamp reference
/// stream, from the NTP/RTP pairs of both streams' sender reports.
///
/// The returned value is what must be subtracted from an inbound timestamp
/// of the `(ntp2, ts2)` stream to place it on the reference timeline.
pub(crate) fn ntp_ts_offset(ntp1_ms: u64, ts1: u32, ntp2_ms: u64, ts2: u32, clock_rate: u32) -> u32 {
    let diff_ms = ntp2_ms as i64 - ntp1_ms as i64;
    let diff_ts = diff_ms * clock_rate as i64 / 1000;

    // All arithmetic deliberately wraps mod 2^32.
    let new_ts2 = (ts2 as i64).wrapping_sub(diff_ts) as u32;

    new_ts2.wrapping_sub(ts1)
}

/// Splits a millisecond wallclock into the NTP seconds/fraction pair carried
/// in an RTCP sender report.
pub(crate) fn ms_to_ntp(now_ms: u64) -> (u32, u32) {
    let secs = now_ms / 1000 + UNIX_NTP_OFFSET_SECS;
    let fraction = ((now_ms % 1000) << 32) / 1000;

    (secs as u32, fraction as u32)
}

/// Calculate the round trip time as described in
/// [RFC3550 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
///
/// ## Params
/// - `now_ms` the local wallclock.
/// - `delay` the delay (`DLSR`) since the last sender report expressed as fractions of a second in 32 bits.
/// - `last_report` the middle 32 bits of an NTP timestamp for the most recent sender report (LSR).
pub(crate) fn calculate_rtt_ms(now_ms: u64, delay: u32, last_report: u32) -> Option<f32> {
    if last_report == 0 {
        return None;
    }

    // We want the middle 32 bits of an NTP timestamp for the current time:
    // [16 bit seconds].[16 bit fraction]
    let (secs, fraction) = ms_to_ntp(now_ms);
    let now = ((secs & 0xffff) << 16) | (fraction >> 16);

    let rtt = now.wrapping_sub(delay).wrapping_sub(last_report);

    // A negative difference means clocks misbehaving. No RTT then.
    if rtt > u32::MAX / 2 {
        return None;
    }

    let rtt_seconds = rtt >> 16;
    let rtt_fraction = (rtt & 0xffff) as f32 / u16::MAX as f32;

    Some(rtt_seconds as f32 * 1000.0 + rtt_fraction * 1000.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn value_history_window() {
        let mut h = ValueHistory::default();

        assert_eq!(h.sum(), 0);
        h.push(0, 22);
        h.push(800, 33);
        assert_eq!(h.sum(), 22 + 33);
        h.purge_old(1500);
        assert_eq!(h.sum(), 33);
        h.purge_old(2000);
        assert_eq!(h.sum(), 0);
    }

    #[test]
    fn ntp_ts_offset_aligns_streams() {
        // Both sender reports taken at the same wallclock instant: the
        // offset is simply the timestamp difference.
        assert_eq!(ntp_ts_offset(1000, 90_000, 1000, 180_000, 90_000), 90_000);

        // The second stream's SR is 1s later; at 90kHz its timestamp is
        // 90_000 ahead of where it was at the reference instant.
        assert_eq!(ntp_ts_offset(1000, 90_000, 2000, 270_000, 90_000), 90_000);

        // Negative NTP difference works too.
        assert_eq!(ntp_ts_offset(2000, 90_000, 1000, 90_000, 90_000), 90_000);
    }

    #[test]
    fn ntp_fraction_is_proportional() {
        let (_, f0) = ms_to_ntp(10_000);
        assert_eq!(f0, 0);

        let (_, f500) = ms_to_ntp(10_500);
        // Half a second is half the 32 bit range.
        assert_eq!(f500, 1 << 31);
    }

    #[test]
    fn rtt_from_compact_ntp() {
        // Now is 100s into NTP-fraction territory. LSR was at 98s, DLSR 1s.
        let now_ms = 100_000;
        let (secs, _) = ms_to_ntp(98_000);
        let lsr = (secs & 0xffff) << 16;
        let dlsr = 1 << 16;

        let rtt = calculate_rtt_ms(now_ms, dlsr, lsr).unwrap();
        assert!((rtt - 1000.0).abs() < 1.0);
    }
}
