use std::collections::BTreeMap;
use std::fmt;

use keel_fingerprint::{Change, FileCollectionFingerprint};
use keel_history::{HistoricalExecution, ImplementationSnapshot, TaskExecution};

/// Why a task is out of date with respect to a recorded execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeReason {
    PreviousFailed,
    /// The task or one of its actions comes from a module whose content is
    /// unknown, so it can never be compared.
    UnknownImplementation { type_name: String },
    TaskImplementation {
        previous: ImplementationSnapshot,
        current: ImplementationSnapshot,
    },
    ActionImplementations,
    InputPropertyAdded { name: String },
    InputPropertyRemoved { name: String },
    InputPropertyChanged { name: String },
    /// A file property is declared now but was not recorded; `kind` is
    /// `"Input"` or `"Output"`.
    FilePropertyAdded { kind: &'static str, name: String },
    FilePropertyRemoved { kind: &'static str, name: String },
    InputFile(Change),
    OutputFile(Change),
    DiscoveredInput(Change),
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeReason::PreviousFailed => f.write_str("Task has failed previously."),
            ChangeReason::UnknownImplementation { type_name } => {
                write!(f, "Implementation of {type_name} was loaded from an unknown module.")
            }
            ChangeReason::TaskImplementation { previous, current } => {
                write!(f, "Task implementation has changed from {previous} to {current}.")
            }
            ChangeReason::ActionImplementations => {
                f.write_str("Task action implementations have changed.")
            }
            ChangeReason::InputPropertyAdded { name } => {
                write!(f, "Input property '{name}' has been added.")
            }
            ChangeReason::InputPropertyRemoved { name } => {
                write!(f, "Input property '{name}' has been removed.")
            }
            ChangeReason::InputPropertyChanged { name } => {
                write!(f, "Value of input property '{name}' has changed.")
            }
            ChangeReason::FilePropertyAdded { kind, name } => {
                write!(f, "{kind} file property '{name}' has been added.")
            }
            ChangeReason::FilePropertyRemoved { kind, name } => {
                write!(f, "{kind} file property '{name}' has been removed.")
            }
            ChangeReason::InputFile(change)
            | ChangeReason::OutputFile(change)
            | ChangeReason::DiscoveredInput(change) => fmt::Display::fmt(change, f),
        }
    }
}

struct Reasons {
    reasons: Vec<ChangeReason>,
    limit: usize,
}

impl Reasons {
    /// Returns whether more reasons are wanted.
    fn push(&mut self, reason: ChangeReason) -> bool {
        if self.reasons.len() < self.limit {
            self.reasons.push(reason);
        }
        self.reasons.len() < self.limit
    }

    fn full(&self) -> bool {
        self.reasons.len() >= self.limit
    }

    /// Reports file properties that were dropped or added, then the file
    /// changes of the properties present on both sides.
    fn push_file_changes(
        &mut self,
        current: &BTreeMap<String, FileCollectionFingerprint>,
        previous: &BTreeMap<String, FileCollectionFingerprint>,
        kind: &'static str,
        include_added: bool,
        wrap: fn(Change) -> ChangeReason,
    ) {
        for property in previous.keys() {
            if !current.contains_key(property)
                && !self.push(ChangeReason::FilePropertyRemoved {
                    kind,
                    name: property.clone(),
                })
            {
                return;
            }
        }
        for (property, fingerprint) in current {
            if self.full() {
                return;
            }
            let Some(previous) = previous.get(property) else {
                self.push(ChangeReason::FilePropertyAdded {
                    kind,
                    name: property.clone(),
                });
                continue;
            };
            let title = format!("{kind} property '{property}'");
            fingerprint.visit_changes(previous, &title, include_added, &mut |change| {
                self.push(wrap(change))
            });
        }
    }
}

/// Up to `limit` reasons why `current` cannot reuse `previous`, most
/// fundamental first. An empty result means the task is up to date.
///
/// `current.output_files` are the outputs as found before executing; added
/// output files are not reported since other tasks may produce them.
pub fn changes_since(
    previous: &HistoricalExecution,
    current: &TaskExecution,
    limit: usize,
) -> keel_history::Result<Vec<ChangeReason>> {
    let mut reasons = Reasons {
        reasons: Vec::new(),
        limit: limit.max(1),
    };

    if !previous.successful() && !reasons.push(ChangeReason::PreviousFailed) {
        return Ok(reasons.reasons);
    }
    if !push_implementation_changes(&mut reasons, previous, current) {
        return Ok(reasons.reasons);
    }
    if !push_property_changes(&mut reasons, previous, current) {
        return Ok(reasons.reasons);
    }

    reasons.push_file_changes(
        &current.output_files,
        previous.output_files()?,
        "Output",
        false,
        ChangeReason::OutputFile,
    );
    reasons.push_file_changes(
        &current.input_files,
        previous.input_files()?,
        "Input",
        true,
        ChangeReason::InputFile,
    );
    if !reasons.full() {
        let discovered = previous.discovered_inputs()?;
        current
            .discovered_inputs
            .visit_changes(&discovered, "Discovered input", true, &mut |change| {
                reasons.push(ChangeReason::DiscoveredInput(change))
            });
    }
    Ok(reasons.reasons)
}

fn push_implementation_changes(
    reasons: &mut Reasons,
    previous: &HistoricalExecution,
    current: &TaskExecution,
) -> bool {
    let current_task = &current.task_implementation;
    let previous_task = previous.task_implementation();
    if current_task.is_unknown() || previous_task.is_unknown() {
        return reasons.push(ChangeReason::UnknownImplementation {
            type_name: current_task.type_name.clone(),
        });
    }
    if current_task != previous_task {
        return reasons.push(ChangeReason::TaskImplementation {
            previous: previous_task.clone(),
            current: current_task.clone(),
        });
    }
    let unknown_action = current
        .action_implementations
        .iter()
        .chain(previous.action_implementations())
        .find(|action| action.is_unknown());
    if let Some(action) = unknown_action {
        return reasons.push(ChangeReason::UnknownImplementation {
            type_name: action.type_name.clone(),
        });
    }
    if current.action_implementations != previous.action_implementations() {
        return reasons.push(ChangeReason::ActionImplementations);
    }
    true
}

fn push_property_changes(
    reasons: &mut Reasons,
    previous: &HistoricalExecution,
    current: &TaskExecution,
) -> bool {
    let previous_properties = previous.input_properties();
    for name in previous_properties.keys() {
        if !current.input_properties.contains_key(name)
            && !reasons.push(ChangeReason::InputPropertyRemoved { name: name.clone() })
        {
            return false;
        }
    }
    for (name, value) in &current.input_properties {
        let reason = match previous_properties.get(name) {
            None => ChangeReason::InputPropertyAdded { name: name.clone() },
            Some(previous) if previous != value => {
                ChangeReason::InputPropertyChanged { name: name.clone() }
            }
            Some(_) => continue,
        };
        if !reasons.push(reason) {
            return false;
        }
    }
    true
}
