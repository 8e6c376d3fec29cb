//! Gating: whether a series measures right now

use tally_api::{GatingState, MeterKind};

/// Inputs the gate decides on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInputs {
    pub kind: MeterKind,
    pub has_source_value: bool,
    pub condition_active: bool,
    pub time_window_active: bool,
}

impl GateInputs {
    /// Compute the gating state.
    ///
    /// A source meter waits for its first reading before anything else.
    pub fn evaluate(&self) -> GatingState {
        if self.kind == MeterKind::Source && !self.has_source_value {
            GatingState::InitializingSource
        } else if self.condition_active && self.time_window_active {
            GatingState::Measuring
        } else if !self.time_window_active {
            GatingState::WaitingForTimeWindow
        } else if !self.condition_active {
            GatingState::WaitingForCondition
        } else {
            unreachable!("gating fell through with inputs {self:?}")
        }
    }
}

/// A change of gating state and what it means for the meter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: GatingState,
    pub to: GatingState,
}

impl Transition {
    /// `None` when nothing changes
    pub fn between(from: GatingState, to: GatingState) -> Option<Self> {
        (from != to).then_some(Self { from, to })
    }

    pub fn starts_measuring(&self) -> bool {
        self.to == GatingState::Measuring
    }

    pub fn stops_measuring(&self) -> bool {
        self.from == GatingState::Measuring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(kind: MeterKind, has_source: bool, condition: bool, window: bool) -> GateInputs {
        GateInputs {
            kind,
            has_source_value: has_source,
            condition_active: condition,
            time_window_active: window,
        }
    }

    #[test]
    fn source_without_reading_is_initializing() {
        for (condition, window) in [(true, true), (false, true), (true, false), (false, false)] {
            assert_eq!(
                inputs(MeterKind::Source, false, condition, window).evaluate(),
                GatingState::InitializingSource
            );
        }
        // Other kinds do not care about a source
        assert_eq!(
            inputs(MeterKind::Counter, false, true, true).evaluate(),
            GatingState::Measuring
        );
    }

    #[test]
    fn time_window_takes_precedence_over_condition() {
        assert_eq!(
            inputs(MeterKind::Time, true, false, false).evaluate(),
            GatingState::WaitingForTimeWindow
        );
        assert_eq!(
            inputs(MeterKind::Time, true, true, false).evaluate(),
            GatingState::WaitingForTimeWindow
        );
        assert_eq!(
            inputs(MeterKind::Time, true, false, true).evaluate(),
            GatingState::WaitingForCondition
        );
        assert_eq!(
            inputs(MeterKind::Source, true, true, true).evaluate(),
            GatingState::Measuring
        );
    }

    #[test]
    fn transitions() {
        assert!(Transition::between(GatingState::Measuring, GatingState::Measuring).is_none());

        let start = Transition::between(GatingState::WaitingForCondition, GatingState::Measuring)
            .unwrap();
        assert!(start.starts_measuring() && !start.stops_measuring());

        let stop = Transition::between(GatingState::Measuring, GatingState::WaitingForTimeWindow)
            .unwrap();
        assert!(stop.stops_measuring() && !stop.starts_measuring());

        let idle = Transition::between(
            GatingState::WaitingForTimeWindow,
            GatingState::WaitingForCondition,
        )
        .unwrap();
        assert!(!idle.starts_measuring() && !idle.stops_measuring());
    }
}
