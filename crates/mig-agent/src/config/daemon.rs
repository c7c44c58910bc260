use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mig_core::DEFAULT_ANNOTATION_PREFIX;
use mig_core::DEFAULT_PROFILE_PATTERN;

use crate::api::server::DEFAULT_HEALTH_ADDR;
use crate::platform::k8s::device_plugin::DEFAULT_DEVICE_PLUGIN_SELECTOR;
use crate::platform::nvml::DEFAULT_NVML_LIBRARY;
use crate::platform::pod_resources::DEFAULT_POD_RESOURCES_SOCKET;

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node whose GPUs this agent manages"
    )]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "POD_RESOURCES_SOCKET",
        value_hint = clap::ValueHint::AnyPath,
        default_value = DEFAULT_POD_RESOURCES_SOCKET,
        help = "Kubelet pod-resources socket, or the directory containing kubelet.sock"
    )]
    pub pod_resources_socket: PathBuf,

    #[arg(
        long,
        default_value = "10",
        help = "Timeout in seconds of each pod-resources request"
    )]
    pub pod_resources_timeout: u64,

    #[arg(
        long,
        env = "REFRESH_INTERVAL",
        default_value = "10",
        help = "Seconds between two periodic MIG status reports"
    )]
    pub refresh_interval: u64,

    #[arg(
        long,
        env = "ANNOTATION_PREFIX",
        default_value = DEFAULT_ANNOTATION_PREFIX,
        help = "Prefix of the spec and status node annotations"
    )]
    pub annotation_prefix: String,

    #[arg(
        long,
        default_value = DEFAULT_PROFILE_PATTERN,
        help = "Regular expression a MIG profile name must match"
    )]
    pub profile_pattern: String,

    #[arg(
        long,
        env = "KNOWN_MIG_GEOMETRIES_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML file of allowed MIG geometries merged over the built-in ones"
    )]
    pub known_geometries_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = DEFAULT_DEVICE_PLUGIN_SELECTOR,
        help = "Label selector of the device plugin pods"
    )]
    pub device_plugin_label_selector: String,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_NAMESPACE",
        help = "Namespace of the device plugin pods (empty for all namespaces)"
    )]
    pub device_plugin_namespace: Option<String>,

    #[arg(
        long,
        default_value = "60",
        help = "Seconds to wait for a restarted device plugin pod to be running"
    )]
    pub device_plugin_restart_timeout: u64,

    #[arg(
        long,
        env = "CLEANUP_ON_STARTUP",
        help = "Delete every MIG device not used by a pod before starting",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub cleanup_on_startup: bool,

    #[arg(
        long,
        env = "HEALTH_ADDR",
        default_value = DEFAULT_HEALTH_ADDR,
        help = "Listen address of the health and readiness endpoints"
    )]
    pub health_addr: String,

    #[arg(
        long,
        default_value = "300",
        help = "Seconds after which a single reconciliation is abandoned"
    )]
    pub reconcile_timeout: u64,

    #[arg(
        long,
        env = "MIG_AGENT_LOG_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,

    #[arg(
        long,
        env = "NVML_LIBRARY",
        default_value = DEFAULT_NVML_LIBRARY,
        help = "NVML shared library to load"
    )]
    pub nvml_library: String,
}

impl DaemonArgs {
    pub fn pod_resources_timeout(&self) -> Duration {
        Duration::from_secs(self.pod_resources_timeout)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval.max(1))
    }

    pub fn device_plugin_restart_timeout(&self) -> Duration {
        Duration::from_secs(self.device_plugin_restart_timeout)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use similar_asserts::assert_eq;

    use crate::config::Cli;
    use crate::config::Commands;

    fn daemon_args(extra: &[&str]) -> super::DaemonArgs {
        let args = ["mig-agent", "daemon", "--node-name", "gpu-node-1"]
            .into_iter()
            .chain(extra.iter().copied());
        match Cli::try_parse_from(args).expect("valid arguments").command {
            Commands::Daemon(args) => *args,
            Commands::ValidateCatalog(_) => panic!("expected daemon subcommand"),
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = daemon_args(&[]);
        assert_eq!(args.node_name, "gpu-node-1");
        assert_eq!(args.annotation_prefix, "n8s.nebuly.ai");
        assert_eq!(args.refresh_interval().as_secs(), 10);
        assert_eq!(args.pod_resources_timeout().as_secs(), 10);
        assert_eq!(args.reconcile_timeout().as_secs(), 300);
        assert_eq!(args.device_plugin_label_selector, "app=nvidia-device-plugin-daemonset");
        assert_eq!(args.health_addr, "0.0.0.0:8081");
        assert!(!args.cleanup_on_startup);
    }

    #[test]
    fn cleanup_flag_takes_a_value() {
        let args = daemon_args(&["--cleanup-on-startup", "true", "--refresh-interval", "30"]);
        assert!(args.cleanup_on_startup);
        assert_eq!(args.refresh_interval().as_secs(), 30);
    }
}
