mod machine;
mod types;
mod window;

pub use machine::CycleStateMachine;
pub use types::{
    ClosedCycle, CycleSummary, CycleTotals, DowntimeEvent, DowntimeKind, ImpulseOutcome,
    LineState, ProductionCycle, Transition,
};
pub use window::ElementWindow;
