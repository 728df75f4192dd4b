//! Fencing devices.
//!
//! A device wraps one fencing agent plus its parameters, the mapping from
//! cluster node names to device-local ports, and the policy by which it
//! decides whether a given target is within its power to fence.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use slog::{debug, error, info, Logger};

use crate::agent::{run_agent, AgentInvocation, AgentVictim};

use super::FencingError;

/// Well-known device parameters.
pub const ATTR_HOST_LIST: &str = "pcmk_host_list";
pub const ATTR_HOST_MAP: &str = "pcmk_host_map";
pub const ATTR_HOST_CHECK: &str = "pcmk_host_check";
pub const ATTR_PRIORITY: &str = "priority";

/// How long a cached `list` output stays fresh.
const LIST_CACHE_TTL: Duration = Duration::from_secs(60);

/// How a device decides whether it can fence a host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostCheck {
    /// Always claims the target.
    None,
    /// Target (or its alias) must appear in the configured host list.
    StaticList,
    /// Target must appear in the agent's `list` output, cached for a
    /// minute. A failed `list` disables this device's queries for good.
    DynamicList,
    /// Ask the agent's `status` action about the specific target.
    Status,
}

impl HostCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostCheck::None => "none",
            HostCheck::StaticList => "static-list",
            HostCheck::DynamicList => "dynamic-list",
            HostCheck::Status => "status",
        }
    }
}

/// Errors from the host-map parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMapError {
    pub offset: usize,
    pub near: String,
}

impl std::fmt::Display for HostMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Host map entry without '=' separator at offset {} near '{}'",
            self.offset, self.near
        )
    }
}

impl std::error::Error for HostMapError {}

/// Parse a host map: `NAME(=|:)VALUE` pairs separated by whitespace, comma
/// or semicolon. Trailing separators are tolerated; a name token with no
/// assignment is rejected.
pub fn parse_host_map(hostmap: &str) -> Result<HashMap<String, String>, HostMapError> {
    let mut aliases = HashMap::new();
    let mut name: Option<String> = None;
    let mut last = 0usize;

    let bytes: Vec<char> = hostmap.chars().collect();
    let max = bytes.len();
    let mut lpc = 0usize;
    while lpc <= max {
        let ch = if lpc < max { bytes[lpc] } else { '\0' };
        match ch {
            '=' | ':' => {
                if lpc > last {
                    name = Some(bytes[last..lpc].iter().collect());
                }
                last = lpc + 1;
            }
            '\0' | ';' | ',' | ' ' | '\t' => {
                if let Some(taken) = name.take() {
                    let value: String = bytes[last..lpc].iter().collect();
                    aliases.insert(taken, value);
                } else if lpc > last {
                    return Err(HostMapError {
                        offset: last,
                        near: bytes[last..lpc].iter().collect(),
                    });
                }
                last = lpc + 1;
            }
            _ => {}
        }
        lpc += 1;
    }
    Ok(aliases)
}

/// Parse an agent's host list output: names separated by whitespace or
/// commas, possibly across lines. Lines complaining about unknown
/// parameters and bare `on`/`off` tokens are skipped.
pub fn parse_host_list(output: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    for line in output.lines() {
        if line.contains("invalid") || line.contains("variable") {
            continue;
        }
        for token in line.split(|c: char| c.is_whitespace() || c == ',') {
            let entry: String = token
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
                .collect();
            if entry.is_empty() || entry == "on" || entry == "off" {
                continue;
            }
            hosts.push(entry);
        }
    }
    hosts
}

enum ListCache {
    Empty,
    Cached { targets: Vec<String>, at: Instant },
    /// A failed `list` run disables dynamic queries permanently.
    Disabled,
}

/// One registered fencing device.
pub struct FencingDevice {
    pub id: String,
    pub agent: String,
    pub namespace: Option<String>,
    pub params: HashMap<String, String>,
    /// Cluster node name → device-local port.
    pub aliases: HashMap<String, String>,
    /// Pre-parsed static host list (host-list param plus map values).
    pub targets: Vec<String>,
    pub host_check: HostCheck,
    pub priority: i32,
    list_cache: ListCache,
}

impl FencingDevice {
    /// Build a device from its configuration parameters.
    pub fn from_params(
        id: &str,
        agent: &str,
        namespace: Option<&str>,
        params: HashMap<String, String>,
    ) -> Result<Self, HostMapError> {
        let mut targets = Vec::new();
        if let Some(list) = params.get(ATTR_HOST_LIST) {
            targets = parse_host_list(list);
        }
        let aliases = match params.get(ATTR_HOST_MAP) {
            Some(map) => {
                let aliases = parse_host_map(map)?;
                // Mapped ports are fenceable targets too.
                targets.extend(aliases.values().cloned());
                aliases
            }
            None => HashMap::new(),
        };

        let host_check = match params.get(ATTR_HOST_CHECK).map(String::as_str) {
            Some("none") => HostCheck::None,
            Some("static-list") => HostCheck::StaticList,
            Some("dynamic-list") => HostCheck::DynamicList,
            Some("status") => HostCheck::Status,
            // Unset: a configured host list implies static, otherwise ask
            // the agent.
            _ if params.contains_key(ATTR_HOST_LIST) => HostCheck::StaticList,
            _ => HostCheck::DynamicList,
        };

        let priority = params
            .get(ATTR_PRIORITY)
            .and_then(|p| p.parse::<i32>().ok())
            .unwrap_or(0);

        Ok(FencingDevice {
            id: id.to_string(),
            agent: agent.to_string(),
            namespace: namespace.map(str::to_string),
            params,
            aliases,
            targets,
            host_check,
            priority,
            list_cache: ListCache::Empty,
        })
    }

    /// The device-local name for a cluster node.
    pub fn port_for(&self, host: &str) -> String {
        self.aliases
            .get(host)
            .cloned()
            .unwrap_or_else(|| host.to_string())
    }

    fn base_invocation(&self, action: &str, timeout: Duration) -> AgentInvocation {
        AgentInvocation {
            agent: self.agent.clone(),
            action: action.to_string(),
            params: self.params.clone(),
            victim: None,
            timeout,
            device_id: Some(self.id.clone()),
        }
    }

    /// Invocation for a fencing action against a victim, with host-map
    /// substitution applied.
    pub fn victim_invocation(
        &self,
        action: &str,
        victim: &str,
        timeout: Duration,
    ) -> AgentInvocation {
        let mut invocation = self.base_invocation(action, timeout);
        invocation.victim = Some(AgentVictim {
            port: self.port_for(victim),
            nodename: victim.to_string(),
        });
        invocation
    }

    /// Invocation for any device action, with or without a victim.
    pub fn invocation_for(
        &self,
        action: &str,
        victim: Option<&str>,
        timeout: Duration,
    ) -> AgentInvocation {
        match victim {
            Some(victim) => self.victim_invocation(action, victim, timeout),
            None => self.base_invocation(action, timeout),
        }
    }

    /// Can this device fence the given host? May run the agent for the
    /// dynamic-list and status policies.
    pub async fn can_fence(&mut self, host: &str, log: &Logger) -> Result<bool, FencingError> {
        let alias = self.port_for(host);
        let can = match self.host_check {
            HostCheck::None => true,
            HostCheck::StaticList => {
                self.targets.iter().any(|t| t == host || t == &alias)
            }
            HostCheck::DynamicList => self.dynamic_list_contains(&alias, log).await,
            HostCheck::Status => self.status_check(host, log).await?,
        };

        if host == alias {
            info!(log, "Host check";
                "device" => &self.id, "host" => host,
                "policy" => self.host_check.as_str(), "can_fence" => can);
        } else {
            info!(log, "Host check";
                "device" => &self.id, "host" => host, "alias" => alias,
                "policy" => self.host_check.as_str(), "can_fence" => can);
        }
        Ok(can)
    }

    async fn dynamic_list_contains(&mut self, alias: &str, log: &Logger) -> bool {
        match &self.list_cache {
            ListCache::Disabled => {
                debug!(log, "Port list queries disabled"; "device" => &self.id);
                return false;
            }
            ListCache::Cached { at, .. } if at.elapsed() < LIST_CACHE_TTL => {}
            _ => {
                let invocation = self.base_invocation("list", Duration::from_secs(10));
                let outcome = run_agent(&invocation, log).await;
                if !outcome.succeeded() {
                    info!(log, "Disabling port list queries";
                        "device" => &self.id, "rc" => outcome.rc.as_i32());
                    self.list_cache = ListCache::Disabled;
                    return false;
                }
                info!(log, "Refreshed port list"; "device" => &self.id);
                self.list_cache = ListCache::Cached {
                    targets: parse_host_list(&outcome.stdout),
                    at: Instant::now(),
                };
            }
        }

        match &self.list_cache {
            ListCache::Cached { targets, .. } => targets.iter().any(|t| t == alias),
            _ => false,
        }
    }

    async fn status_check(&self, host: &str, log: &Logger) -> Result<bool, FencingError> {
        let invocation = self.victim_invocation("status", host, Duration::from_secs(10));
        let outcome = run_agent(&invocation, log).await;
        match outcome.raw_exit_code {
            // 0: target active on this device; 2: inactive but known.
            Some(0) | Some(2) => Ok(true),
            // 1: target unknown to this device.
            Some(1) => Ok(false),
            other => {
                error!(log, "Unexpected status result";
                    "device" => &self.id, "host" => host,
                    "rc" => other.unwrap_or(-1));
                Err(FencingError::HostCheckFailed {
                    device: self.id.clone(),
                    rc: outcome.rc,
                })
            }
        }
    }

    /// Seed the dynamic-list cache (tests and warm-up).
    #[cfg(test)]
    pub(crate) fn seed_list_cache(&mut self, targets: Vec<String>) {
        self.list_cache = ListCache::Cached { targets, at: Instant::now() };
    }

    #[cfg(test)]
    pub(crate) fn dynamic_queries_disabled(&self) -> bool {
        matches!(self.list_cache, ListCache::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Drain};
    use std::io::Write as IoWrite;
    use std::os::unix::fs::PermissionsExt;

    fn create_test_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!())
    }

    fn script(body: &str) -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        let path = file.into_temp_path();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn device_with(params: Vec<(&str, &str)>, agent: &str) -> FencingDevice {
        let params: HashMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FencingDevice::from_params("fence1", agent, Some("stonith-ng"), params).unwrap()
    }

    #[test]
    fn test_parse_host_map_variants() {
        let map = parse_host_map("node1=plug1 node2:plug2;node3=plug3, ").unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("node1").map(String::as_str), Some("plug1"));
        assert_eq!(map.get("node2").map(String::as_str), Some("plug2"));
        assert_eq!(map.get("node3").map(String::as_str), Some("plug3"));
    }

    #[test]
    fn test_parse_host_map_rejects_bare_token() {
        let err = parse_host_map("node1=plug1 nodeX node2=plug2").unwrap_err();
        assert_eq!(err.near, "nodeX");
    }

    #[test]
    fn test_parse_host_map_empty() {
        assert!(parse_host_map("").unwrap().is_empty());
        assert!(parse_host_map("   ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_host_list_skips_noise() {
        let hosts = parse_host_list("node1 node2,node3\ninvalid option foo\non off node4\n");
        assert_eq!(hosts, vec!["node1", "node2", "node3", "node4"]);
    }

    #[test]
    fn test_default_host_check_inference() {
        let dev = device_with(vec![(ATTR_HOST_LIST, "node1 node2")], "fence_x");
        assert_eq!(dev.host_check, HostCheck::StaticList);

        let dev = device_with(vec![], "fence_x");
        assert_eq!(dev.host_check, HostCheck::DynamicList);

        let dev = device_with(vec![(ATTR_HOST_CHECK, "none")], "fence_x");
        assert_eq!(dev.host_check, HostCheck::None);
    }

    #[tokio::test]
    async fn test_static_list_check() {
        let log = create_test_logger();
        let mut dev = device_with(
            vec![(ATTR_HOST_LIST, "node1 node2"), (ATTR_HOST_MAP, "node9=plug9")],
            "fence_x",
        );
        assert!(dev.can_fence("node1", &log).await.unwrap());
        assert!(!dev.can_fence("node5", &log).await.unwrap());
        // Mapped nodes are claimable through their alias.
        assert!(dev.can_fence("node9", &log).await.unwrap());
    }

    #[tokio::test]
    async fn test_none_policy_always_claims() {
        let log = create_test_logger();
        let mut dev = device_with(vec![(ATTR_HOST_CHECK, "none")], "fence_x");
        assert!(dev.can_fence("anything", &log).await.unwrap());
    }

    #[tokio::test]
    async fn test_dynamic_list_queries_agent() {
        let log = create_test_logger();
        let path = script("echo node1\necho node2");
        let mut dev = device_with(
            vec![(ATTR_HOST_CHECK, "dynamic-list")],
            path.to_str().unwrap(),
        );

        assert!(dev.can_fence("node1", &log).await.unwrap());
        assert!(!dev.can_fence("node7", &log).await.unwrap());
    }

    #[tokio::test]
    async fn test_dynamic_list_failure_disables_queries() {
        let log = create_test_logger();
        let path = script("exit 1");
        let mut dev = device_with(
            vec![(ATTR_HOST_CHECK, "dynamic-list")],
            path.to_str().unwrap(),
        );

        assert!(!dev.can_fence("node1", &log).await.unwrap());
        assert!(dev.dynamic_queries_disabled());
        // Stays disabled even for hosts the agent might have listed.
        assert!(!dev.can_fence("node1", &log).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_policy_rcs() {
        let log = create_test_logger();

        let active = script("exit 0");
        let mut dev =
            device_with(vec![(ATTR_HOST_CHECK, "status")], active.to_str().unwrap());
        assert!(dev.can_fence("node1", &log).await.unwrap());

        let inactive = script("exit 2");
        let mut dev =
            device_with(vec![(ATTR_HOST_CHECK, "status")], inactive.to_str().unwrap());
        assert!(dev.can_fence("node1", &log).await.unwrap());

        let unknown = script("exit 1");
        let mut dev =
            device_with(vec![(ATTR_HOST_CHECK, "status")], unknown.to_str().unwrap());
        assert!(!dev.can_fence("node1", &log).await.unwrap());

        let weird = script("exit 7");
        let mut dev = device_with(vec![(ATTR_HOST_CHECK, "status")], weird.to_str().unwrap());
        assert!(dev.can_fence("node1", &log).await.is_err());
    }

    #[test]
    fn test_victim_invocation_uses_alias() {
        let dev = device_with(vec![(ATTR_HOST_MAP, "node4=plug4")], "fence_x");
        let inv = dev.victim_invocation("off", "node4", Duration::from_secs(20));
        let victim = inv.victim.unwrap();
        assert_eq!(victim.port, "plug4");
        assert_eq!(victim.nodename, "node4");
        assert_eq!(inv.device_id.as_deref(), Some("fence1"));
    }
}
