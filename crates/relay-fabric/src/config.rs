use std::time::Duration;

/// Tuning knobs for the fabric. Defaults match the deployed HIS contract:
/// terminals heartbeat every 30 seconds and are written off after three
/// consecutive misses.
#[derive(Clone, Debug)]
pub struct FabricConfig {
    /// Expected interval between terminal heartbeats.
    pub heartbeat_interval: Duration,
    /// Consecutive missed intervals before a terminal is disconnected.
    pub miss_threshold: u32,
    /// Period of the registry liveness sweep.
    pub sweep_period: Duration,
    /// Per-destination queue capacity for undeliverable events.
    pub queue_capacity: usize,
    /// How long a queued event stays deliverable.
    pub queue_ttl: Duration,
    /// Deadline for one upstream recommendation call.
    pub upstream_timeout: Duration,
    /// Period of the ACL snapshot refresh task.
    pub acl_refresh_interval: Duration,
    /// Open traces older than this are swept as timed out.
    pub trace_grace: Duration,
    /// Sessions older than this many days are closed by the sweep.
    pub session_expiry_days: i64,
    /// Service id the gate checks for recommendation calls.
    pub recommend_service_id: String,
    /// Service id the gate checks before forwarding pushed events.
    pub push_service_id: String,
    /// `source` tag sent to the recommendation upstream.
    pub ai_source: String,
    /// Number of recommendations requested per call.
    pub recommend_count: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            miss_threshold: 3,
            sweep_period: Duration::from_secs(10),
            queue_capacity: 64,
            queue_ttl: Duration::from_secs(120),
            upstream_timeout: Duration::from_secs(30),
            acl_refresh_interval: Duration::from_secs(60),
            trace_grace: Duration::from_secs(300),
            session_expiry_days: 30,
            recommend_service_id: "ai_recommend".to_string(),
            push_service_id: "patient_data_push".to_string(),
            ai_source: "lip".to_string(),
            recommend_count: 3,
        }
    }
}
