//! View configuration: which nodes, routes and elements take part in a session

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::ElementId;

/// Configuration of one dashboard view
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewConfig {
    #[serde(default)]
    pub name: String,
    /// Bus the client is connected to
    pub active_bus: u8,
    /// Node indices taking part in the session
    pub active_nodes: Vec<usize>,
    /// Active nodes only kept alive for routing, without diagnostics
    #[serde(default)]
    pub no_diagnostics: Vec<usize>,
    /// Routes to nodes not directly on the active bus
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Cyclic and change-driven read assignments
    #[serde(default)]
    pub read_rails: Vec<ReadRailAssignment>,
    /// Elements written from the dashboard
    #[serde(default)]
    pub write_elements: Vec<ElementId>,
    /// Elements shown on dashboards without a rail assignment
    #[serde(default)]
    pub dashboard_elements: Vec<ElementId>,
    #[serde(default)]
    pub rates: UpdateRates,
}

/// Hop list from the client to one target node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub node: usize,
    pub hops: Vec<RouteHop>,
}

/// An intermediate node and the interface it forwards on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    pub node: usize,
    pub out_interface: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionMode {
    Cyclic,
    OnChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRailAssignment {
    pub element: ElementId,
    pub mode: TransmissionMode,
    /// Rail index 0 (fast), 1 (medium) or 2 (slow)
    pub rail: u8,
    /// Change threshold for on-change transmissions
    #[serde(default)]
    pub threshold: u32,
}

/// Update rates of the three transmission rails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRates {
    #[serde(default = "default_fast_ms")]
    pub fast_ms: u16,
    #[serde(default = "default_medium_ms")]
    pub medium_ms: u16,
    #[serde(default = "default_slow_ms")]
    pub slow_ms: u16,
}

fn default_fast_ms() -> u16 {
    100
}

fn default_medium_ms() -> u16 {
    500
}

fn default_slow_ms() -> u16 {
    1000
}

impl Default for UpdateRates {
    fn default() -> Self {
        Self {
            fast_ms: default_fast_ms(),
            medium_ms: default_medium_ms(),
            slow_ms: default_slow_ms(),
        }
    }
}

impl UpdateRates {
    /// Rates in rail order
    pub fn by_rail(&self) -> [u16; 3] {
        [self.fast_ms, self.medium_ms, self.slow_ms]
    }
}

impl ViewConfig {
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Hops towards `node`; empty when the node is on the active bus
    pub fn route_to(&self, node: usize) -> &[RouteHop] {
        self.routes
            .iter()
            .find(|r| r.node == node)
            .map(|r| r.hops.as_slice())
            .unwrap_or(&[])
    }

    pub fn requires_diagnostics(&self, node: usize) -> bool {
        !self.no_diagnostics.contains(&node)
    }

    /// Every element referenced by rails, writes or dashboards
    pub fn used_elements(&self) -> impl Iterator<Item = &ElementId> {
        self.read_rails
            .iter()
            .map(|a| &a.element)
            .chain(self.write_elements.iter())
            .chain(self.dashboard_elements.iter())
    }

    /// Data pool indices of `node` referenced by the view
    pub fn used_data_pools(&self, node: usize) -> BTreeSet<usize> {
        self.used_elements()
            .filter(|e| e.node == node)
            .map(|e| e.data_pool)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const VIEW: &str = r#"
        name = "Dashboard"
        active_bus = 0
        active_nodes = [0, 1, 2]
        no_diagnostics = [2]

        [[routes]]
        node = 1
        hops = [{ node = 0, out_interface = 1 }]

        [[read_rails]]
        element = { node = 1, data_pool = 0, list = 0, element = 2 }
        mode = "on_change"
        rail = 1
        threshold = 5

        [rates]
        fast_ms = 50
    "#;

    #[test]
    fn test_parse_view() {
        let view = ViewConfig::from_toml_str(VIEW).unwrap();
        assert_eq!(view.active_nodes, vec![0, 1, 2]);
        assert_eq!(view.route_to(1).len(), 1);
        assert!(view.route_to(0).is_empty());
        assert!(!view.requires_diagnostics(2));
        assert_eq!(view.rates.by_rail(), [50, 500, 1000]);
        assert_eq!(view.read_rails[0].mode, TransmissionMode::OnChange);
    }

    #[test]
    fn test_used_data_pools() {
        let mut view = ViewConfig::from_toml_str(VIEW).unwrap();
        view.write_elements.push(ElementId::new(1, 3, 0, 0));
        view.dashboard_elements.push(ElementId::new(0, 1, 0, 0));
        assert_eq!(view.used_data_pools(1).into_iter().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(view.used_data_pools(0).len(), 1);
    }
}
