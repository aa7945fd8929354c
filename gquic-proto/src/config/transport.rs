use std::{fmt, sync::Arc};

use crate::{
    congestion::{self, CongestionControllerFactory},
    Duration, GuidLength, Version, DEFAULT_SUPPORTED_VERSIONS, MAX_PACKET_SIZE,
};

/// Parameters governing the connection state machine
///
/// Default values should be suitable for most applications. Forward error correction is off by
/// default; enable it with [`max_packets_per_fec_group`](Self::max_packets_per_fec_group).
pub struct TransportConfig {
    pub(crate) idle_timeout: Duration,
    pub(crate) max_packet_length: usize,
    pub(crate) max_packets_per_fec_group: usize,
    pub(crate) delayed_ack_time: Duration,
    pub(crate) supported_versions: Vec<Version>,
    pub(crate) send_guid_length: GuidLength,
    pub(crate) max_undecryptable_packets: usize,
    pub(crate) rng_seed: Option<[u8; 32]>,

    pub(crate) congestion_controller_factory: Arc<dyn CongestionControllerFactory>,
}

impl TransportConfig {
    /// Maximum duration of inactivity to accept before timing out the connection
    ///
    /// Defaults to 600 seconds.
    pub fn idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.idle_timeout = value;
        self
    }

    /// Size of the largest packet built, before encryption
    ///
    /// Capped at [`MAX_PACKET_SIZE`].
    pub fn max_packet_length(&mut self, value: usize) -> &mut Self {
        self.max_packet_length = value.min(MAX_PACKET_SIZE);
        self
    }

    /// Number of data packets protected by each FEC packet; zero disables FEC
    ///
    /// Capped at 255, the largest FEC group offset a packet header can carry.
    pub fn max_packets_per_fec_group(&mut self, value: usize) -> &mut Self {
        self.max_packets_per_fec_group = value.min(usize::from(u8::MAX));
        self
    }

    /// How long an ack may be held back hoping to bundle it with data
    pub fn delayed_ack_time(&mut self, value: Duration) -> &mut Self {
        self.delayed_ack_time = value;
        self
    }

    /// Versions to offer and accept, most preferred first
    ///
    /// Must not be empty.
    pub fn supported_versions(&mut self, value: Vec<Version>) -> &mut Self {
        debug_assert!(!value.is_empty());
        self.supported_versions = value;
        self
    }

    /// How many guid bytes outgoing packets carry
    ///
    /// Shorter guids save space but need the peer to recognize the connection by address.
    pub fn send_guid_length(&mut self, value: GuidLength) -> &mut Self {
        self.send_guid_length = value;
        self
    }

    /// Packets that failed to decrypt kept for retrying once new keys are installed
    pub fn max_undecryptable_packets(&mut self, value: usize) -> &mut Self {
        self.max_undecryptable_packets = value;
        self
    }

    /// Seed for the random number generator choosing entropy bits
    ///
    /// Intended for deterministic tests. Defaults to a seed drawn from the operating system.
    pub fn rng_seed(&mut self, value: Option<[u8; 32]>) -> &mut Self {
        self.rng_seed = value;
        self
    }

    /// How to construct new `congestion::SendAlgorithm`s and `congestion::ReceiveAlgorithm`s
    ///
    /// Typically the refcounted configuration of a congestion controller. See for example
    /// [`congestion::FixRateConfig`].
    ///
    /// # Example
    /// ```
    /// # use gquic_proto::*; use std::sync::Arc;
    /// let mut config = TransportConfig::default();
    /// config.congestion_controller_factory(Arc::new(congestion::FixRateConfig::default()));
    /// ```
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn CongestionControllerFactory>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            max_packet_length: MAX_PACKET_SIZE,
            max_packets_per_fec_group: 0,
            delayed_ack_time: Duration::from_millis(25),
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.to_vec(),
            send_guid_length: GuidLength::Eight,
            max_undecryptable_packets: 10,
            rng_seed: None,

            congestion_controller_factory: Arc::new(congestion::FixRateConfig::default()),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            idle_timeout,
            max_packet_length,
            max_packets_per_fec_group,
            delayed_ack_time,
            supported_versions,
            send_guid_length,
            max_undecryptable_packets,
            rng_seed: _,
            congestion_controller_factory: _,
        } = self;
        fmt.debug_struct("TransportConfig")
            .field("idle_timeout", idle_timeout)
            .field("max_packet_length", max_packet_length)
            .field("max_packets_per_fec_group", max_packets_per_fec_group)
            .field("delayed_ack_time", delayed_ack_time)
            .field("supported_versions", supported_versions)
            .field("send_guid_length", send_guid_length)
            .field("max_undecryptable_packets", max_undecryptable_packets)
            // congestion_controller_factory not debug
            .finish_non_exhaustive()
    }
}
