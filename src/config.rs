//! Configuration for a corral controller.

use std::path::PathBuf;

/// How many one-second-spaced attempts to make when (re)connecting to the
/// fencing daemon before giving up.
pub const FENCER_CONNECT_ATTEMPTS: u32 = 30;

/// Configuration for one controller instance.
#[derive(Clone, Debug)]
pub struct CorralConfig {
    /// This node's name as known to the cluster.
    pub node_name: String,

    /// This node's numeric id on the messaging bus.
    pub node_id: u32,

    /// Stable identifier stamped into transition keys while this node is
    /// leader.
    pub dc_uuid: String,

    /// Upper bound on actions in flight per trigger pass (0 = unlimited).
    /// The effective limit is further reduced by the load governor.
    pub batch_limit: u32,

    /// Debounce before re-planning when an already-complete transition is
    /// aborted. Zero re-plans immediately.
    pub transition_delay_ms: u64,

    /// Where the pre-shared key for remote executor connections lives.
    pub psk_path: PathBuf,

    /// Fallback location consulted when the primary path is unreadable.
    pub psk_fallback_path: Option<PathBuf>,

    /// Automatically reap departed peers from the cache.
    pub autoreap: bool,
}

impl CorralConfig {
    pub fn new(node_name: &str, node_id: u32) -> Self {
        CorralConfig {
            node_name: node_name.to_string(),
            node_id,
            dc_uuid: uuid::Uuid::new_v4().to_string(),
            batch_limit: 0,
            transition_delay_ms: 0,
            psk_path: PathBuf::from("/etc/corral/authkey"),
            psk_fallback_path: Some(PathBuf::from("/etc/sysconfig/corral/authkey")),
            autoreap: true,
        }
    }

    /// Use a fixed leader identifier instead of a generated one.
    pub fn with_dc_uuid(mut self, dc_uuid: &str) -> Self {
        self.dc_uuid = dc_uuid.to_string();
        self
    }

    pub fn with_batch_limit(mut self, batch_limit: u32) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    pub fn with_transition_delay_ms(mut self, delay_ms: u64) -> Self {
        self.transition_delay_ms = delay_ms;
        self
    }

    pub fn with_psk_path(mut self, path: PathBuf) -> Self {
        self.psk_path = path;
        self
    }

    pub fn with_psk_fallback(mut self, path: Option<PathBuf>) -> Self {
        self.psk_fallback_path = path;
        self
    }

    pub fn with_autoreap(mut self, autoreap: bool) -> Self {
        self.autoreap = autoreap;
        self
    }

    /// Client id used to tag fencing requests originated by this
    /// controller, so externally-initiated fencing can be told apart.
    pub fn client_id(&self) -> String {
        format!("corral-te.{}", std::process::id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = CorralConfig::new("node1", 1);
        assert_eq!(config.node_name, "node1");
        assert_eq!(config.batch_limit, 0);
        assert!(config.autoreap);
        assert!(!config.dc_uuid.is_empty());
    }

    #[test]
    fn test_builder_overrides() {
        let config = CorralConfig::new("node1", 1)
            .with_dc_uuid("fixed-uuid")
            .with_batch_limit(30)
            .with_transition_delay_ms(5000)
            .with_autoreap(false);
        assert_eq!(config.dc_uuid, "fixed-uuid");
        assert_eq!(config.batch_limit, 30);
        assert_eq!(config.transition_delay_ms, 5000);
        assert!(!config.autoreap);
    }

    #[test]
    fn test_client_id_embeds_pid() {
        let config = CorralConfig::new("node1", 1);
        assert!(config.client_id().starts_with("corral-te."));
    }
}
