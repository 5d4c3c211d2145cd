use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque element identifier minted by the page-snapshot collaborator.
///
/// It is only meaningful for the snapshot it came from and is re-resolved to a
/// live element on every use.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetRef(String);

impl TargetRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for TargetRef {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Top,
    Bottom,
}

impl ScrollDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "top" => Some(Self::Top),
            "bottom" => Some(Self::Bottom),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "camelCase")]
pub enum Action {
    Click {
        #[serde(rename = "targetId")]
        target_id: TargetRef,
    },
    SetValue {
        #[serde(rename = "targetId")]
        target_id: TargetRef,
        value: String,
    },
    SetValueAndEnter {
        #[serde(rename = "targetId")]
        target_id: TargetRef,
        value: String,
    },
    Navigate { url: String },
    Scroll { direction: ScrollDirection },
    Wait,
    Finish,
    Fail,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::SetValue { .. } => "setValue",
            Action::SetValueAndEnter { .. } => "setValueAndEnter",
            Action::Navigate { .. } => "navigate",
            Action::Scroll { .. } => "scroll",
            Action::Wait => "wait",
            Action::Finish => "finish",
            Action::Fail => "fail",
        }
    }

    /// `finish` and `fail` end the task; nothing is executed for them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Finish | Action::Fail)
    }

    /// Compact `{"name":..,"args":{..}}` form used in transcripts.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"name\":\"{}\"}}", self.name()))
    }
}

/// One `{thought, action}` unit produced by a model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTurn {
    pub thought: String,
    pub action: Action,
}

impl ModelTurn {
    pub fn new(thought: impl Into<String>, action: Action) -> Self {
        Self {
            thought: thought.into(),
            action,
        }
    }

    /// Terminal turn rendered when no valid turn could be obtained.
    pub fn max_retries() -> Self {
        Self::new("reached max retries", Action::Fail)
    }
}

// ========================= Vocabulary =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// A target id; accepts string or integer literals.
    Target,
    String,
    Direction,
}

impl ArgKind {
    fn label(self) -> &'static str {
        match self {
            ArgKind::Target | ArgKind::String | ArgKind::Direction => "string",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ArgKind,
}

#[derive(Clone, Copy, Debug)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
}

const TARGET: ParamSpec = ParamSpec {
    name: "targetId",
    kind: ArgKind::Target,
};
const VALUE: ParamSpec = ParamSpec {
    name: "value",
    kind: ArgKind::String,
};

pub const ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "click",
        description: "Click on an element",
        params: &[TARGET],
    },
    ActionSpec {
        name: "setValue",
        description: "Focus on and set the value of an input element",
        params: &[TARGET, VALUE],
    },
    ActionSpec {
        name: "scroll",
        description: "Scroll the page to see the other parts. Use \"up\" or \"down\" to scroll 2/3 of the window height. Use \"top\" or \"bottom\" to jump to the top or bottom of the page.",
        params: &[ParamSpec {
            name: "direction",
            kind: ArgKind::Direction,
        }],
    },
    ActionSpec {
        name: "navigate",
        description: "Navigate to a new page",
        params: &[ParamSpec {
            name: "url",
            kind: ArgKind::String,
        }],
    },
    ActionSpec {
        name: "setValueAndEnter",
        description: "Like \"setValue\", then presses ENTER. Use it to submit a form that has no submit button.",
        params: &[TARGET, VALUE],
    },
    ActionSpec {
        name: "wait",
        description: "Wait for 3 seconds before the next action. Useful when the page is loading.",
        params: &[],
    },
    ActionSpec {
        name: "finish",
        description: "Indicate the task is finished",
        params: &[],
    },
    ActionSpec {
        name: "fail",
        description: "Indicate that you are unable to complete the task",
        params: &[],
    },
];

/// Case-sensitive exact lookup.
pub fn lookup(name: &str) -> Option<&'static ActionSpec> {
    ACTIONS.iter().find(|a| a.name == name)
}

/// Numbered `name(arg: type, ..): description` listing for prompts.
pub fn format_vocabulary() -> String {
    ACTIONS
        .iter()
        .enumerate()
        .map(|(i, a)| {
            let args = a
                .params
                .iter()
                .map(|p| format!("{}: {}", p.name, p.kind.label()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}. {}({}): {}", i + 1, a.name, args, a.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
