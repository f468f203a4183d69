//! Simulation harness for Herald clusters.
//!
//! [`SimNetwork`] delivers protocol messages in memory and can refuse
//! requests per node or per directed link. [`TestCluster`] starts nodes on
//! top of it and exposes the fault controls used by the integration tests.

pub mod cluster;
pub mod network_sim;

pub use cluster::{until_pass, ClusterStatus, SimNode, TestCluster};
pub use network_sim::{NetworkConditions, NetworkStats, SimNetwork, SimTransport};

/// Installs a quiet test subscriber. Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}
