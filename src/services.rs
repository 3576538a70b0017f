//! Auxiliary service declarations.
//!
//! A family declares containers the deployment layer runs next to the
//! network. The engine only describes them; it never starts them.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::Network;
use crate::render::ConfigRenderer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Port the Prometheus UI is published on by default.
pub const PROMETHEUS_PORT: u16 = 9090;

/// Port each node exposes its metrics on by default.
pub const PROMETHEUS_INSTRUMENTATION_PORT: u16 = 8088;

const SCRAPE_JOB: &str = "
- job_name:       '{{family}}-{{index}}-{{address}}'
  scrape_interval: 5s
  metrics_path: /metrics
  static_configs:
    - targets: ['{{address}}:{{port}}']
      labels:
        group: '{{family}}'
";

/// Prometheus container reading its config from `config_path` on the host.
pub fn prometheus_service(port: u16, config_path: &str) -> Service {
    Service {
        name: "prometheus".to_string(),
        image: "prom/prometheus".to_string(),
        ports: vec![format!("{}:9090", port)],
        volumes: vec![format!("{}:/etc/prometheus/prometheus.yml", config_path)],
        environment: BTreeMap::new(),
    }
}

/// Scrape configuration with one job per node of the network.
pub fn prometheus_scrape_config(
    network: &Network,
    renderer: &dyn ConfigRenderer,
    instrumentation_port: u16,
) -> Result<String> {
    let mut config = String::from("scrape_configs:\n");
    for node in network.nodes() {
        let ctx = json!({
            "family": network.family(),
            "index": node.absolute_index,
            "address": node.address,
            "port": instrumentation_port,
        });
        let job = renderer.render(SCRAPE_JOB, &ctx)?;
        config.push_str(&String::from_utf8_lossy(&job));
    }
    log::debug!("prometheus scrape config:\n{}", config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HostId, ParameterSet};
    use crate::render::TemplateRenderer;

    #[test]
    fn test_prometheus_service_declaration() {
        let svc = prometheus_service(PROMETHEUS_PORT, "/tmp/prometheus.yml");
        assert_eq!(svc.ports, vec!["9090:9090"]);
        assert_eq!(svc.volumes, vec!["/tmp/prometheus.yml:/etc/prometheus/prometheus.yml"]);
    }

    #[test]
    fn test_scrape_config_has_one_job_per_node() {
        let mut net = Network::new(ParameterSet::new("ethclassic", 2));
        net.push_node("10.0.0.2", HostId::new("h"));
        net.push_node("10.0.0.3", HostId::new("h"));

        let config = prometheus_scrape_config(&net, &TemplateRenderer, 8088).unwrap();
        assert!(config.starts_with("scrape_configs:\n"));
        assert!(config.contains("job_name:       'ethclassic-0-10.0.0.2'"));
        assert!(config.contains("targets: ['10.0.0.3:8088']"));
        assert_eq!(config.matches("job_name").count(), 2);
    }
}
