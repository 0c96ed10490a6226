//! System configuration consumed by the coordinator.
//!
//! The entire federation is described by one immutable [`SystemConfig`]
//! value handed to the coordinator at construction: node declarations with
//! their block catalogs, the connections between ports, the global time
//! unit, the final time and the per-phase deadlines.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! workspace: plant
//! time_unit_us: 1
//! final_time: 5000
//!
//! nodes:
//!   - name: motor
//!     outputs: [velocity]
//!     blocks:
//!       - period: 1000
//!         output_ports: [velocity]
//!   - name: ctrl
//!     inputs: [velocity]
//!     outputs: [command]
//!     blocks:
//!       - period: 1000
//!         feedthrough_inputs: [velocity]
//!         output_ports: [command]
//!
//! connections:
//!   - { src_node: motor, src_port: velocity, dst_node: ctrl, dst_port: velocity }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::types::{BlockId, PortId, SimTime, MAX_BLOCKS_PER_NODE};

/// Errors that can occur while loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),

    #[error("Dependency cycle: {0}")]
    DependencyCycle(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Declaration of one schedulable block inside a node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockDecl {
    /// Firing period in time atoms; 0 means event-only (fires only when
    /// triggered or requested).
    #[serde(default)]
    pub period: SimTime,

    /// Output ports produced when this block fires.
    #[serde(default)]
    pub output_ports: Vec<PortId>,

    /// Input ports whose value must be fresh before the output computation.
    #[serde(default)]
    pub feedthrough_inputs: Vec<PortId>,

    /// Input ports whose arrival fires this block at the current time.
    #[serde(default)]
    pub triggering_inputs: Vec<PortId>,

    /// Local ids of same-node blocks that must complete first.
    #[serde(default)]
    pub internal_deps: Vec<BlockId>,
}

impl BlockDecl {
    /// Creates a periodic block with the given period in atoms.
    pub fn periodic(period: SimTime) -> Self {
        Self { period, ..Self::default() }
    }

    /// Creates an event-only block (period 0).
    pub fn event_only() -> Self {
        Self::default()
    }

    /// Adds an output port.
    pub fn with_output(mut self, port: impl Into<PortId>) -> Self {
        self.output_ports.push(port.into());
        self
    }

    /// Adds a feedthrough input.
    pub fn with_feedthrough(mut self, port: impl Into<PortId>) -> Self {
        self.feedthrough_inputs.push(port.into());
        self
    }

    /// Adds a triggering input.
    pub fn with_trigger(mut self, port: impl Into<PortId>) -> Self {
        self.triggering_inputs.push(port.into());
        self
    }

    /// Adds an internal dependency on another block of the same node.
    pub fn with_internal_dep(mut self, block: BlockId) -> Self {
        self.internal_deps.push(block);
        self
    }
}

fn default_true() -> bool {
    true
}

/// Declaration of one node in the federation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDecl {
    /// Unique node name within the workspace.
    pub name: String,

    /// Declared input ports.
    #[serde(default)]
    pub inputs: Vec<PortId>,

    /// Declared output ports.
    #[serde(default)]
    pub outputs: Vec<PortId>,

    /// Block catalog, indexed by local id in declaration order.
    #[serde(default)]
    pub blocks: Vec<BlockDecl>,

    /// Whether the node participates in the state-update phase.
    #[serde(default = "default_true")]
    pub needs_state_update: bool,
}

impl NodeDecl {
    /// Creates a node declaration with no ports or blocks.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            blocks: Vec::new(),
            needs_state_update: true,
        }
    }

    /// Adds an input port.
    pub fn with_input(mut self, port: impl Into<PortId>) -> Self {
        self.inputs.push(port.into());
        self
    }

    /// Adds an output port.
    pub fn with_output(mut self, port: impl Into<PortId>) -> Self {
        self.outputs.push(port.into());
        self
    }

    /// Adds a block to the catalog; its local id is its position.
    pub fn with_block(mut self, block: BlockDecl) -> Self {
        self.blocks.push(block);
        self
    }

    /// Disables the state-update phase for this node.
    pub fn without_state_update(mut self) -> Self {
        self.needs_state_update = false;
        self
    }
}

/// A directed connection from an output port to an input port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub src_node: String,
    pub src_port: PortId,
    pub dst_node: String,
    pub dst_port: PortId,
}

fn default_init_ms() -> u64 {
    5000
}

fn default_phase_ms() -> u64 {
    1000
}

/// Per-phase wall-clock deadlines, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deadlines {
    #[serde(default = "default_init_ms")]
    pub init_ms: u64,
    #[serde(default = "default_phase_ms")]
    pub update_y_ms: u64,
    #[serde(default = "default_phase_ms")]
    pub update_x_ms: u64,
    #[serde(default = "default_phase_ms")]
    pub term_ms: u64,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            init_ms: default_init_ms(),
            update_y_ms: default_phase_ms(),
            update_x_ms: default_phase_ms(),
            term_ms: default_phase_ms(),
        }
    }
}

impl Deadlines {
    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    pub fn update_y(&self) -> Duration {
        Duration::from_millis(self.update_y_ms)
    }

    pub fn update_x(&self) -> Duration {
        Duration::from_millis(self.update_x_ms)
    }

    pub fn term(&self) -> Duration {
        Duration::from_millis(self.term_ms)
    }
}

fn default_time_unit() -> u64 {
    1
}

/// Complete, immutable description of one simulation run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Workspace name scoping node registrations.
    #[serde(default)]
    pub workspace: String,

    /// Wall-clock microseconds per time atom.
    #[serde(default = "default_time_unit")]
    pub time_unit_us: u64,

    /// Virtual time at which the run stops.
    pub final_time: SimTime,

    /// Node declarations; ids are assigned in this order.
    #[serde(default)]
    pub nodes: Vec<NodeDecl>,

    /// Output-to-input port connections.
    #[serde(default)]
    pub connections: Vec<Connection>,

    /// Per-phase deadlines.
    #[serde(default)]
    pub deadlines: Deadlines,

    /// When set, one atom is paced to `time_unit_us * pacing_scale`
    /// microseconds of wall time between ticks. Unset runs as fast as the
    /// federation acks.
    #[serde(default)]
    pub pacing_scale: Option<f64>,
}

impl SystemConfig {
    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: SystemConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: SystemConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting the format from the
    /// extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Validates node declarations and connections.
    ///
    /// The acyclicity of the dependency projection is checked separately
    /// when the coordinator builds its update graph.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate node name: {}",
                    node.name
                )));
            }
            node_checks(node)?;
        }

        for conn in &self.connections {
            let src = self.node(&conn.src_node).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "connection references unknown node: {}",
                    conn.src_node
                ))
            })?;
            let dst = self.node(&conn.dst_node).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "connection references unknown node: {}",
                    conn.dst_node
                ))
            })?;
            if !src.outputs.contains(&conn.src_port) {
                return Err(ConfigError::Validation(format!(
                    "connection source {}.{} is not a declared output",
                    conn.src_node, conn.src_port
                )));
            }
            if !dst.inputs.contains(&conn.dst_port) {
                return Err(ConfigError::Validation(format!(
                    "connection destination {}.{} is not a declared input",
                    conn.dst_node, conn.dst_port
                )));
            }
        }

        Ok(())
    }

    /// Finds a node declaration by name.
    pub fn node(&self, name: &str) -> Option<&NodeDecl> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Returns the number of declared nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of declared blocks across the federation.
    pub fn block_count(&self) -> usize {
        self.nodes.iter().map(|n| n.blocks.len()).sum()
    }
}

fn node_checks(node: &NodeDecl) -> ConfigResult<()> {
    if node.blocks.len() > MAX_BLOCKS_PER_NODE {
        return Err(ConfigError::Validation(format!(
            "node {} declares {} blocks; the update mask allows at most {}",
            node.name,
            node.blocks.len(),
            MAX_BLOCKS_PER_NODE
        )));
    }

    let inputs: HashSet<&str> = node.inputs.iter().map(String::as_str).collect();
    let outputs: HashSet<&str> = node.outputs.iter().map(String::as_str).collect();

    for (local_id, block) in node.blocks.iter().enumerate() {
        for port in &block.output_ports {
            if !outputs.contains(port.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "node {} block {} outputs unknown port {}",
                    node.name, local_id, port
                )));
            }
        }
        for port in block.feedthrough_inputs.iter().chain(&block.triggering_inputs) {
            if !inputs.contains(port.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "node {} block {} references unknown input {}",
                    node.name, local_id, port
                )));
            }
        }
        for &dep in &block.internal_deps {
            if dep as usize >= node.blocks.len() {
                return Err(ConfigError::Validation(format!(
                    "node {} block {} depends on unknown block {}",
                    node.name, local_id, dep
                )));
            }
            if dep as usize == local_id {
                return Err(ConfigError::Validation(format!(
                    "node {} block {} depends on itself",
                    node.name, local_id
                )));
            }
        }
    }

    Ok(())
}

/// Builder for creating a [`SystemConfig`] programmatically.
#[derive(Debug)]
pub struct SystemConfigBuilder {
    config: SystemConfig,
}

impl SystemConfigBuilder {
    /// Creates a builder with the given final time.
    pub fn new(final_time: SimTime) -> Self {
        Self {
            config: SystemConfig {
                workspace: String::new(),
                time_unit_us: default_time_unit(),
                final_time,
                nodes: Vec::new(),
                connections: Vec::new(),
                deadlines: Deadlines::default(),
                pacing_scale: None,
            },
        }
    }

    /// Sets the workspace name.
    pub fn workspace(mut self, ws: impl Into<String>) -> Self {
        self.config.workspace = ws.into();
        self
    }

    /// Sets the time unit in microseconds per atom.
    pub fn time_unit_us(mut self, us: u64) -> Self {
        self.config.time_unit_us = us;
        self
    }

    /// Sets all per-phase deadlines.
    pub fn deadlines(mut self, deadlines: Deadlines) -> Self {
        self.config.deadlines = deadlines;
        self
    }

    /// Adds a node declaration.
    pub fn node(mut self, node: NodeDecl) -> Self {
        self.config.nodes.push(node);
        self
    }

    /// Connects an output port to an input port.
    pub fn connect(
        mut self,
        src_node: impl Into<String>,
        src_port: impl Into<PortId>,
        dst_node: impl Into<String>,
        dst_port: impl Into<PortId>,
    ) -> Self {
        self.config.connections.push(Connection {
            src_node: src_node.into(),
            src_port: src_port.into(),
            dst_node: dst_node.into(),
            dst_port: dst_port.into(),
        });
        self
    }

    /// Enables wall-clock pacing.
    pub fn pacing_scale(mut self, scale: f64) -> Self {
        self.config.pacing_scale = Some(scale);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> ConfigResult<SystemConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
