//! The closed enumeration of delegate models (spec §9 "Dynamic dispatch over
//! model"). Adding a model is a configuration edit against [`ModelProfile`],
//! not a structural change to the enum — the enum itself only needs to grow
//! when the fixed fallback chain (spec §4.8) does.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Claude,
    Codex,
    Gemini,
}

impl Model {
    pub const ALL: [Model; 3] = [Model::Claude, Model::Codex, Model::Gemini];

    /// The fixed fallback chain, cyclic and truncated at length 3 (spec
    /// §4.8): `claude -> codex -> gemini -> claude`.
    pub fn fallback_chain(self) -> [Model; 3] {
        match self {
            Model::Claude => [Model::Claude, Model::Codex, Model::Gemini],
            Model::Codex => [Model::Codex, Model::Gemini, Model::Claude],
            Model::Gemini => [Model::Gemini, Model::Claude, Model::Codex],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Model::Claude => "claude",
            Model::Codex => "codex",
            Model::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Model> {
        match s {
            "claude" => Some(Model::Claude),
            "codex" => Some(Model::Codex),
            "gemini" => Some(Model::Gemini),
            _ => None,
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-model strategy: the command used to invoke the delegate (spec §6.2)
/// and its weight for weighted consensus (spec §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Dollars per 1000 input/output tokens, used by the Cost Tracker to
    /// turn a token count into a spend sample.
    #[serde(default = "default_cost_per_1k_input")]
    pub cost_per_1k_input: f64,
    #[serde(default = "default_cost_per_1k_output")]
    pub cost_per_1k_output: f64,
}

fn default_weight() -> f64 {
    1.0
}

fn default_cost_per_1k_input() -> f64 {
    0.003
}

fn default_cost_per_1k_output() -> f64 {
    0.015
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            weight: 1.0,
            cost_per_1k_input: default_cost_per_1k_input(),
            cost_per_1k_output: default_cost_per_1k_output(),
        }
    }
}

pub type ModelTable = HashMap<Model, ModelProfile>;

pub fn default_model_table() -> ModelTable {
    Model::ALL
        .into_iter()
        .map(|m| {
            (
                m,
                ModelProfile {
                    command: m.as_str().to_string(),
                    args: Vec::new(),
                    weight: 1.0,
                    cost_per_1k_input: default_cost_per_1k_input(),
                    cost_per_1k_output: default_cost_per_1k_output(),
                },
            )
        })
        .collect()
}
