//! Role selection at process start
//!
//! The only place that reads the process environment. Everything is read
//! once into an [`Environment`] and resolved into a [`Role`].

use crate::bridge::BridgeEndpoint;
use crate::config::{ControlEndpoint, SwitchConfig};
use crate::error::ConfigError;
use crate::types::VersionToken;
use crate::worker::WorkerAssignment;
use std::net::SocketAddr;

/// Version assigned to a worker at spawn
pub const VERSION_VAR: &str = "AUTO_VERSION_SWITCH";
/// Bridge address of the supervisor
pub const SUPERVISOR_VAR: &str = "AUTO_VERSION_SWITCH_SUPERVISOR";
/// Supervisor-assigned worker id
pub const WORKER_ID_VAR: &str = "AUTO_VERSION_SWITCH_WORKER_ID";
/// Bridge session token
pub const TOKEN_VAR: &str = "AUTO_VERSION_SWITCH_TOKEN";
/// Opt-in flag for host-delegated mode
pub const HOST_MODE_VAR: &str = "AUTO_VERSION_SWITCH_IISNODE_MODE";
/// Host manager control endpoint
pub const CONTROL_PIPE_VAR: &str = "IISNODE_CONTROL_PIPE";

/// Snapshot of the variables this crate understands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    /// `AUTO_VERSION_SWITCH`
    pub version: Option<String>,
    /// `AUTO_VERSION_SWITCH_SUPERVISOR`
    pub supervisor: Option<String>,
    /// `AUTO_VERSION_SWITCH_WORKER_ID`
    pub worker_id: Option<String>,
    /// `AUTO_VERSION_SWITCH_TOKEN`
    pub token: Option<String>,
    /// `AUTO_VERSION_SWITCH_IISNODE_MODE`
    pub host_mode: Option<String>,
    /// `IISNODE_CONTROL_PIPE`
    pub control_pipe: Option<String>,
}

/// What this process is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Top of the tree: runs the control loop
    Supervisor,
    /// Spawned by a supervisor over the bridge
    Worker(WorkerAssignment),
    /// Managed by an external host; runs the worker directly
    HostDelegated(ControlEndpoint),
}

impl Environment {
    /// Read the process environment
    #[must_use]
    pub fn capture() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            version: lookup(VERSION_VAR),
            supervisor: lookup(SUPERVISOR_VAR),
            worker_id: lookup(WORKER_ID_VAR),
            token: lookup(TOKEN_VAR),
            host_mode: lookup(HOST_MODE_VAR),
            control_pipe: lookup(CONTROL_PIPE_VAR),
        }
    }

    /// Whether the host-mode flag is set to a truthy value
    #[must_use]
    pub fn host_mode_requested(&self) -> bool {
        self.host_mode.as_deref().is_some_and(is_truthy)
    }

    /// Resolve the role of this process
    ///
    /// An explicit `host_delegated` setting in `config` wins over the
    /// environment flag, in both directions.
    ///
    /// # Errors
    /// `ConfigError::MissingControlEndpoint` in host-delegated mode without
    /// an endpoint; `ConfigError::InvalidBootstrap` when worker variables are
    /// present but malformed.
    pub fn role(&self, config: &SwitchConfig) -> Result<Role, ConfigError> {
        let host_delegated = config
            .host_delegated
            .unwrap_or_else(|| self.host_mode_requested());

        if host_delegated {
            let raw = config
                .control_endpoint
                .as_deref()
                .or(self.control_pipe.as_deref())
                .filter(|s| !s.trim().is_empty())
                .ok_or(ConfigError::MissingControlEndpoint)?;
            return Ok(Role::HostDelegated(raw.parse()?));
        }

        let Some(supervisor) = self.supervisor.as_deref() else {
            return Ok(Role::Supervisor);
        };

        let addr: SocketAddr = supervisor.parse().map_err(|_| invalid(SUPERVISOR_VAR, supervisor))?;
        let raw_id = self.worker_id.as_deref().unwrap_or_default();
        let worker_id = raw_id.parse().map_err(|_| invalid(WORKER_ID_VAR, raw_id))?;
        let token = self
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| invalid(TOKEN_VAR, ""))?;

        Ok(Role::Worker(WorkerAssignment {
            worker_id,
            bridge: BridgeEndpoint { addr, token },
            assigned_version: self.version.as_deref().map(VersionToken::from),
        }))
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidBootstrap {
        name,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkerId;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Environment::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn empty_environment_is_supervisor() {
        assert_eq!(env(&[]).role(&SwitchConfig::new()).unwrap(), Role::Supervisor);
    }

    #[test]
    fn bridge_variables_make_a_worker() {
        let role = env(&[
            (VERSION_VAR, "1.0"),
            (SUPERVISOR_VAR, "127.0.0.1:4100"),
            (WORKER_ID_VAR, "12"),
            (TOKEN_VAR, "abc"),
        ])
        .role(&SwitchConfig::new())
        .unwrap();

        let assignment = match role {
            Role::Worker(assignment) => assignment,
            other => panic!("expected worker role, got {other:?}"),
        };
        assert_eq!(assignment.worker_id, WorkerId(12));
        assert_eq!(assignment.bridge.token, "abc");
        assert_eq!(assignment.assigned_version, Some(VersionToken::from("1.0")));
    }

    #[test]
    fn malformed_worker_id_is_rejected() {
        let err = env(&[
            (SUPERVISOR_VAR, "127.0.0.1:4100"),
            (WORKER_ID_VAR, "twelve"),
            (TOKEN_VAR, "abc"),
        ])
        .role(&SwitchConfig::new())
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidBootstrap { name: WORKER_ID_VAR, .. }
        ));
    }

    #[test]
    fn env_flag_selects_host_mode() {
        for flag in ["1", "true", "YES", "on"] {
            let role = env(&[(HOST_MODE_VAR, flag), (CONTROL_PIPE_VAR, "127.0.0.1:7001")])
                .role(&SwitchConfig::new())
                .unwrap();
            assert!(matches!(role, Role::HostDelegated(ControlEndpoint::Tcp(_))));
        }

        let role = env(&[(HOST_MODE_VAR, "0"), (CONTROL_PIPE_VAR, "127.0.0.1:7001")])
            .role(&SwitchConfig::new())
            .unwrap();
        assert_eq!(role, Role::Supervisor);
    }

    #[test]
    fn explicit_option_wins_over_env_flag() {
        let environment = env(&[(HOST_MODE_VAR, "true"), (CONTROL_PIPE_VAR, "127.0.0.1:7001")]);
        let role = environment
            .role(&SwitchConfig::new().with_host_delegated(false))
            .unwrap();
        assert_eq!(role, Role::Supervisor);

        let role = env(&[])
            .role(
                &SwitchConfig::new()
                    .with_host_delegated(true)
                    .with_control_endpoint("127.0.0.1:7002"),
            )
            .unwrap();
        assert_eq!(
            role,
            Role::HostDelegated("127.0.0.1:7002".parse().unwrap())
        );
    }

    #[test]
    fn host_mode_requires_endpoint() {
        let err = env(&[(HOST_MODE_VAR, "1")])
            .role(&SwitchConfig::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingControlEndpoint));
    }
}
