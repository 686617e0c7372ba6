//! Prometheus metrics and structured event logging for the node agent

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Admission latency buckets, in seconds
const LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
];

static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    admissions_total: IntCounterVec,
    admission_latency_seconds: Histogram,
    exclusive_cpus: IntGauge,
    shared_pool_cpus: IntGauge,
    allocated_devices: IntGaugeVec,
    pods_removed_total: IntCounter,
    allocation_errors_total: IntCounter,
    checkpoint_errors_total: IntCounter,
    policy_info: IntGaugeVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            admissions_total: register_int_counter_vec!(
                "pinning_agent_admissions_total",
                "Pod admission attempts by result",
                &["result"]
            )
            .expect("Failed to register admissions_total"),

            admission_latency_seconds: register_histogram!(
                "pinning_agent_admission_latency_seconds",
                "Time spent merging hints and allocating resources for one pod",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register admission_latency_seconds"),

            exclusive_cpus: register_int_gauge!(
                "pinning_agent_exclusive_cpus",
                "CPUs currently assigned exclusively to containers"
            )
            .expect("Failed to register exclusive_cpus"),

            shared_pool_cpus: register_int_gauge!(
                "pinning_agent_shared_pool_cpus",
                "CPUs in the shared pool"
            )
            .expect("Failed to register shared_pool_cpus"),

            allocated_devices: register_int_gauge_vec!(
                "pinning_agent_allocated_devices",
                "Devices currently allocated, per resource",
                &["resource"]
            )
            .expect("Failed to register allocated_devices"),

            pods_removed_total: register_int_counter!(
                "pinning_agent_pods_removed_total",
                "Pods whose resources were released"
            )
            .expect("Failed to register pods_removed_total"),

            allocation_errors_total: register_int_counter!(
                "pinning_agent_allocation_errors_total",
                "Allocations that failed after the pod was admitted"
            )
            .expect("Failed to register allocation_errors_total"),

            checkpoint_errors_total: register_int_counter!(
                "pinning_agent_checkpoint_errors_total",
                "Checkpoint writes that failed"
            )
            .expect("Failed to register checkpoint_errors_total"),

            policy_info: register_int_gauge_vec!(
                "pinning_agent_policy_info",
                "Configured policies",
                &["cpu_policy", "topology_policy", "scope"]
            )
            .expect("Failed to register policy_info"),
        }
    }
}

/// Handle to the process-wide metrics. Clones share the same metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    /// `result` is `admitted`, `rejected` or `error`.
    pub fn observe_admission(&self, result: &str, duration_secs: f64) {
        let inner = self.inner();
        inner.admissions_total.with_label_values(&[result]).inc();
        inner.admission_latency_seconds.observe(duration_secs);
    }

    pub fn set_cpu_pools(&self, exclusive: usize, shared: usize) {
        self.inner().exclusive_cpus.set(exclusive as i64);
        self.inner().shared_pool_cpus.set(shared as i64);
    }

    pub fn set_allocated_devices(&self, counts: &BTreeMap<String, usize>) {
        let gauge = &self.inner().allocated_devices;
        gauge.reset();
        for (resource, count) in counts {
            gauge.with_label_values(&[resource]).set(*count as i64);
        }
    }

    pub fn inc_pods_removed(&self) {
        self.inner().pods_removed_total.inc();
    }

    pub fn inc_allocation_errors(&self) {
        self.inner().allocation_errors_total.inc();
    }

    pub fn inc_checkpoint_errors(&self) {
        self.inner().checkpoint_errors_total.inc();
    }

    pub fn set_policy_info(&self, cpu_policy: &str, topology_policy: &str, scope: &str) {
        let info = &self.inner().policy_info;
        info.reset();
        info.with_label_values(&[cpu_policy, topology_policy, scope])
            .set(1);
    }
}

/// Event-typed log records for significant agent events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, cpu_policy: &str, topology_policy: &str, scope: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            cpu_policy = %cpu_policy,
            topology_policy = %topology_policy,
            scope = %scope,
            "Pinning agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Pinning agent shutting down"
        );
    }

    pub fn log_pod_admitted(&self, pod_uid: &str, pod_name: &str, namespace: &str, containers: usize) {
        info!(
            event = "pod_admitted",
            node = %self.node_name,
            pod_uid = %pod_uid,
            pod_name = %pod_name,
            namespace = %namespace,
            containers = containers,
            "Pod admitted"
        );
    }

    /// Logs a rejection; post-admission allocation failures go to error level.
    pub fn log_pod_rejected(&self, pod_uid: &str, pod_name: &str, reason: &str, message: &str) {
        if reason == crate::topologymanager::ERR_UNEXPECTED_ADMISSION {
            error!(
                event = "pod_allocation_failed",
                node = %self.node_name,
                pod_uid = %pod_uid,
                pod_name = %pod_name,
                reason = %reason,
                message = %message,
                "Allocation failed after admission"
            );
        } else {
            warn!(
                event = "pod_rejected",
                node = %self.node_name,
                pod_uid = %pod_uid,
                pod_name = %pod_name,
                reason = %reason,
                message = %message,
                "Pod rejected"
            );
        }
    }

    pub fn log_pod_removed(&self, pod_uid: &str) {
        info!(
            event = "pod_removed",
            node = %self.node_name,
            pod_uid = %pod_uid,
            "Pod resources released"
        );
    }

    pub fn log_devices_registered(&self, resource: &str, devices: usize) {
        info!(
            event = "devices_registered",
            node = %self.node_name,
            resource = %resource,
            devices = devices,
            "Device plugin registered devices"
        );
    }

    pub fn log_state_invalid(&self, component: &str, error: &str) {
        error!(
            event = "state_invalid",
            node = %self.node_name,
            component = %component,
            error = %error,
            "Checkpointed state is invalid, refusing to start"
        );
    }
}
