//! Layer selection: which spatial/temporal layer should be forwarded,
//! given producer stream health, the bitrate budget and the preference.

use super::{ConsumerListener, SimulcastConsumer};

/// Score at or above which a producer stream counts as good.
pub(crate) const STREAM_GOOD_SCORE: u8 = 5;

/// A stream must have been active this long before we switch up onto it
/// while something else is already flowing. Guards against flapping.
pub(crate) const STREAM_MIN_ACTIVE_TIME_MS: u64 = 2000;

impl SimulcastConsumer {
    /// Priority for the external bitrate allocator: the highest usable
    /// spatial layer plus one, capped just above the preferred layer.
    pub fn get_bitrate_priority(&self) -> u16 {
        debug_assert!(self.externally_managed_bitrate, "bitrate is not externally managed");

        if !self.is_active() {
            return 0;
        }

        let mut priority_spatial_layer: i16 = -1;

        for (s_idx, producer_stream) in self.producer_streams().iter().enumerate() {
            let spatial_layer = s_idx as i16;

            // Do not choose a layer greater than the preferred one if we
            // already found an available layer equal or less than it.
            if spatial_layer > self.preferred_spatial_layer && priority_spatial_layer != -1 {
                break;
            }

            // Ignore spatial layers with no producer stream or score 0.
            let Some(producer_stream) = producer_stream else {
                continue;
            };
            if producer_stream.score() == 0 {
                continue;
            }

            priority_spatial_layer = spatial_layer;
        }

        // If nothing was chosen we still have to return > 0. Otherwise the
        // allocator would never call `use_available_bitrate` and we could
        // never switch to target and current spatial -1.
        if priority_spatial_layer == -1 {
            return 1;
        }

        (priority_spatial_layer + 1) as u16
    }

    /// Pick the best layers affordable within `bitrate`, storing them as
    /// provisional targets. Returns the bitrate the chosen layers consume,
    /// reshaped against the loss-adjusted virtual bitrate.
    pub fn use_available_bitrate(&mut self, bitrate: u32, consider_loss: bool, now_ms: u64) -> u32 {
        debug_assert!(self.externally_managed_bitrate, "bitrate is not externally managed");

        self.provisional_target_spatial_layer = -1;
        self.provisional_target_temporal_layer = -1;

        if !self.is_active() {
            return 0;
        }

        let virtual_bitrate = self.virtual_bitrate(bitrate, consider_loss);

        let mut used_bitrate: u32 = 0;
        let mut max_producer_score: u8 = 0;

        'spatial: for s_idx in 0..self.producer_streams().len() {
            let spatial_layer = s_idx as i16;

            let Some(producer_stream) = self.producer_streams()[s_idx].clone() else {
                continue;
            };
            let producer_score = producer_stream.score();

            // Ignore dead streams.
            if producer_score == 0 {
                continue;
            }

            // If the stream has not been active long enough and we have an
            // active one already, move to the next spatial layer.
            if used_bitrate > 0 && producer_stream.active_time() < STREAM_MIN_ACTIVE_TIME_MS {
                continue;
            }

            // We may not yet switch to this spatial layer.
            if !self.can_switch_to_spatial_layer(spatial_layer) {
                continue;
            }

            // If the stream score is worse than the best seen and not good
            // enough, ignore this stream.
            if producer_score < max_producer_score && producer_score < STREAM_GOOD_SCORE {
                continue;
            }

            max_producer_score = producer_score;

            // Check the bitrate of every temporal layer.
            for temporal_layer in 0..producer_stream.temporal_layers() {
                let required_bitrate = producer_stream.bitrate(now_ms, 0, temporal_layer);

                trace!(
                    "testing layers {}:{} [virtual bitrate:{}, required bitrate:{}]",
                    spatial_layer,
                    temporal_layer,
                    virtual_bitrate,
                    required_bitrate
                );

                // If the layer is not active move to the next spatial layer.
                if required_bitrate == 0 {
                    break;
                }

                // If this layer requires more bitrate than given, keep the
                // previously chosen layers, if any.
                if required_bitrate > virtual_bitrate {
                    break 'spatial;
                }

                self.provisional_target_spatial_layer = spatial_layer;
                self.provisional_target_temporal_layer = temporal_layer;
                used_bitrate = required_bitrate;

                // If this is the preferred spatial and temporal layer on a
                // good stream, we are done.
                if self.provisional_target_spatial_layer == self.preferred_spatial_layer
                    && self.provisional_target_temporal_layer == self.preferred_temporal_layer
                    && producer_score >= STREAM_GOOD_SCORE
                {
                    break 'spatial;
                }
            }

            // If this is the preferred or a higher spatial layer with good
            // score, take it and exit.
            if self.provisional_target_spatial_layer >= self.preferred_spatial_layer
                && producer_score >= STREAM_GOOD_SCORE
            {
                break;
            }
        }

        debug!(
            "choosing layers {}:{} [bitrate:{}, virtual bitrate:{}, used bitrate:{}, consumerId:{}]",
            self.provisional_target_spatial_layer,
            self.provisional_target_temporal_layer,
            bitrate,
            virtual_bitrate,
            used_bitrate,
            self.id()
        );

        // Recompute the used bitrate against the given and virtual ones.
        if used_bitrate <= bitrate {
            used_bitrate
        } else if used_bitrate <= virtual_bitrate {
            bitrate
        } else {
            used_bitrate
        }
    }

    /// Try to bump the provisional temporal layer one step. Returns the
    /// extra bitrate the step consumes, 0 if no step was possible.
    pub fn increase_temporal_layer(&mut self, bitrate: u32, consider_loss: bool, now_ms: u64) -> u32 {
        debug_assert!(self.externally_managed_bitrate, "bitrate is not externally managed");

        if !self.is_active() {
            return 0;
        }

        if self.provisional_target_spatial_layer == -1 {
            return 0;
        }

        // If already in the preferred layers, do nothing.
        if self.provisional_target_spatial_layer == self.preferred_spatial_layer
            && self.provisional_target_temporal_layer == self.preferred_temporal_layer
        {
            return 0;
        }

        let virtual_bitrate = self.virtual_bitrate(bitrate, consider_loss);

        let producer_stream = self
            .producer_provisional_target_rtp_stream()
            .expect("no producer stream for the provisional target")
            .clone();

        let mut required_bitrate: u32 = 0;
        let mut chosen_temporal_layer = self.provisional_target_temporal_layer;

        for temporal_layer in
            (self.provisional_target_temporal_layer + 1)..producer_stream.temporal_layers()
        {
            // Never step above the preferred layers.
            if self.provisional_target_spatial_layer >= self.preferred_spatial_layer
                && temporal_layer > self.preferred_temporal_layer
            {
                break;
            }

            required_bitrate = producer_stream.layer_bitrate(now_ms, 0, temporal_layer);

            // First active layer ends the search.
            if required_bitrate != 0 {
                chosen_temporal_layer = temporal_layer;
                break;
            }
        }

        // No higher active layers found.
        if required_bitrate == 0 {
            return 0;
        }

        // No luck.
        if required_bitrate > virtual_bitrate {
            return 0;
        }

        self.provisional_target_temporal_layer = chosen_temporal_layer;

        debug!(
            "upgrading to layers {}:{} [virtual bitrate:{}, required bitrate:{}]",
            self.provisional_target_spatial_layer,
            self.provisional_target_temporal_layer,
            virtual_bitrate,
            required_bitrate
        );

        if required_bitrate <= bitrate {
            required_bitrate
        } else if required_bitrate <= virtual_bitrate {
            bitrate
        } else {
            // Unreachable: anything above the virtual bitrate returned 0
            // above.
            debug_assert!(false, "required bitrate above virtual bitrate");
            required_bitrate
        }
    }

    /// Commit the provisional layers chosen by the allocator pass.
    pub fn apply_layers(&mut self, listener: &mut dyn ConsumerListener) {
        debug_assert!(self.externally_managed_bitrate, "bitrate is not externally managed");

        let provisional_target_spatial_layer = self.provisional_target_spatial_layer;
        let provisional_target_temporal_layer = self.provisional_target_temporal_layer;

        // Reset provisional target layers.
        self.provisional_target_spatial_layer = -1;
        self.provisional_target_temporal_layer = -1;

        if !self.is_active() {
            return;
        }

        if provisional_target_spatial_layer != self.target_spatial_layer
            || provisional_target_temporal_layer != self.target_temporal_layer
        {
            self.update_target_layers(
                provisional_target_spatial_layer,
                provisional_target_temporal_layer,
                listener,
            );
        }
    }

    /// The bitrate the best reachable layers would consume, budget ignored.
    pub fn get_desired_bitrate(&self, now_ms: u64) -> u32 {
        debug_assert!(self.externally_managed_bitrate, "bitrate is not externally managed");

        if !self.is_active() {
            return 0;
        }

        let mut desired_spatial_layer: i16 = -1;
        let mut desired_temporal_layer: i16 = -1;
        let mut desired_bitrate: u32 = 0;
        let mut max_producer_score: u8 = 0;

        'spatial: for s_idx in 0..self.producer_streams().len() {
            let spatial_layer = s_idx as i16;

            let Some(producer_stream) = self.producer_streams()[s_idx].as_ref() else {
                continue;
            };
            let producer_score = producer_stream.score();

            if producer_score == 0 {
                continue;
            }

            if desired_bitrate > 0 && producer_stream.active_time() < STREAM_MIN_ACTIVE_TIME_MS {
                continue;
            }

            if !self.can_switch_to_spatial_layer(spatial_layer) {
                continue;
            }

            if producer_score < max_producer_score && producer_score < STREAM_GOOD_SCORE {
                continue;
            }

            max_producer_score = producer_score;

            for temporal_layer in 0..producer_stream.temporal_layers() {
                let layer_bitrate = producer_stream.bitrate(now_ms, 0, temporal_layer);

                // If the layer is not active move to the next spatial layer.
                if layer_bitrate == 0 {
                    break;
                }

                desired_spatial_layer = spatial_layer;
                desired_temporal_layer = temporal_layer;
                desired_bitrate = layer_bitrate;

                if desired_spatial_layer == self.preferred_spatial_layer
                    && desired_temporal_layer == self.preferred_temporal_layer
                    && producer_score >= STREAM_GOOD_SCORE
                {
                    break 'spatial;
                }
            }

            if desired_spatial_layer >= self.preferred_spatial_layer
                && producer_score >= STREAM_GOOD_SCORE
            {
                break;
            }
        }

        // No luck.
        if desired_spatial_layer == -1 {
            return 0;
        }

        debug!(
            "desired layers {}:{} [desired bitrate:{}, consumerId:{}]",
            desired_spatial_layer,
            desired_temporal_layer,
            desired_bitrate,
            self.id()
        );

        desired_bitrate
    }

    /// Re-evaluate the target layers and either apply them (locally
    /// managed) or poke the allocator (externally managed).
    pub(crate) fn may_change_layers(&mut self, force: bool, listener: &mut dyn ConsumerListener) {
        let (new_target_spatial_layer, new_target_temporal_layer, changed) =
            self.recalculate_target_layers();

        if !changed {
            return;
        }

        if self.externally_managed_bitrate {
            // Don't bother the transport unless the spatial layer changed
            // (or force). Temporal adjustments ride along with the next
            // allocation pass.
            if new_target_spatial_layer != self.target_spatial_layer || force {
                listener.on_consumer_need_bitrate_change(self.id());
            }
        } else {
            self.update_target_layers(new_target_spatial_layer, new_target_temporal_layer, listener);
        }
    }

    /// Local, bitrate-unaware pick of the best target layers.
    pub(crate) fn recalculate_target_layers(&self) -> (i16, i16, bool) {
        // Start with no layers.
        let mut new_target_spatial_layer: i16 = -1;
        let mut new_target_temporal_layer: i16 = -1;

        let mut max_producer_score: u8 = 0;

        for (s_idx, producer_stream) in self.producer_streams().iter().enumerate() {
            let spatial_layer = s_idx as i16;

            let Some(producer_stream) = producer_stream else {
                continue;
            };
            let producer_score = producer_stream.score();

            if producer_score == 0 {
                continue;
            }

            // The anti-flapping guard only applies when an external
            // allocator owns the bitrate.
            if self.externally_managed_bitrate
                && new_target_spatial_layer != -1
                && producer_stream.active_time() < STREAM_MIN_ACTIVE_TIME_MS
            {
                continue;
            }

            if !self.can_switch_to_spatial_layer(spatial_layer) {
                continue;
            }

            if producer_score < max_producer_score && producer_score < STREAM_GOOD_SCORE {
                continue;
            }

            new_target_spatial_layer = spatial_layer;
            max_producer_score = producer_score;

            // If this is the preferred or a higher spatial layer with good
            // score, take it and exit.
            if spatial_layer >= self.preferred_spatial_layer && producer_score >= STREAM_GOOD_SCORE {
                break;
            }
        }

        if new_target_spatial_layer != -1 {
            new_target_temporal_layer = if new_target_spatial_layer == self.preferred_spatial_layer
            {
                self.preferred_temporal_layer
            } else if new_target_spatial_layer < self.preferred_spatial_layer {
                // Degrading spatial: keep the frame rate up.
                self.rtp_stream.temporal_layers() - 1
            } else {
                // Overshooting spatial: minimise the frame rate.
                0
            };
        }

        let changed = new_target_spatial_layer != self.target_spatial_layer
            || new_target_temporal_layer != self.target_temporal_layer;

        (new_target_spatial_layer, new_target_temporal_layer, changed)
    }

    /// Loss-adjusted available bitrate.
    fn virtual_bitrate(&self, bitrate: u32, consider_loss: bool) -> u32 {
        if !consider_loss {
            return bitrate;
        }

        let loss_percentage = self.rtp_stream.loss_percentage();

        if loss_percentage < 2 {
            (1.08 * bitrate as f64) as u32
        } else if loss_percentage > 10 {
            ((1.0 - 0.5 * (loss_percentage as f64 / 100.0)) * bitrate as f64) as u32
        } else {
            bitrate
        }
    }
}
