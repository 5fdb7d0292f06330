use serde::{Deserialize, Serialize};

/// How the source and destination libraries were matched against metadata agents.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Both servers use the same agent generation; every identifier namespace is comparable.
    #[default]
    Uniform,
    /// One side uses the legacy agents; only portable namespaces are comparable.
    Mixed,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Uniform => "uniform",
            AgentMode::Mixed => "mixed",
        }
    }
}
