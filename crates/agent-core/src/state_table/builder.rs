use super::types::*;

/// Builder for constructing the channel transition table
pub struct StateTableBuilder {
    table: ChannelStateTable,
}

impl StateTableBuilder {
    pub fn new() -> Self {
        Self {
            table: ChannelStateTable::new(),
        }
    }

    /// Add a candidate transition for a `(state, input)` pair. Candidates
    /// are tried in insertion order.
    pub fn add_transition(
        &mut self,
        state: ChannelState,
        input: InputKind,
        transition: Transition,
    ) -> &mut Self {
        self.table.insert(StateKey { state, input }, transition);
        self
    }

    /// Add an unconditional state change with the given effects.
    pub fn add_state_change(
        &mut self,
        state: ChannelState,
        input: InputKind,
        next: ChannelState,
        effects: Vec<Effect>,
    ) -> &mut Self {
        self.add_transition(
            state,
            input,
            Transition {
                guards: vec![Guard::Always],
                effects,
                next_state: Some(next),
            },
        )
    }

    /// Add an unconditional terminal transition.
    pub fn add_terminal(
        &mut self,
        state: ChannelState,
        input: InputKind,
        mut effects: Vec<Effect>,
    ) -> &mut Self {
        if !effects.contains(&Effect::Terminate) {
            effects.push(Effect::Terminate);
        }
        self.add_transition(
            state,
            input,
            Transition {
                guards: vec![Guard::Always],
                effects,
                next_state: None,
            },
        )
    }

    pub fn build(self) -> ChannelStateTable {
        self.table
    }
}
