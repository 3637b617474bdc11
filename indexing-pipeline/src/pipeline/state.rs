use state_machines::state_machine;

state_machine! {
    name: IndexingMachine,
    state: IndexingState,
    initial: Idle,
    states: [Idle, Enumerated, Classified, Embedded, Merged, Failed],
    events {
        enumerate { transition: { from: Idle, to: Enumerated } }
        classify { transition: { from: Enumerated, to: Classified } }
        embed { transition: { from: Classified, to: Embedded } }
        merge { transition: { from: Embedded, to: Merged } }
        abort {
            transition: { from: Idle, to: Failed }
            transition: { from: Enumerated, to: Failed }
            transition: { from: Classified, to: Failed }
            transition: { from: Embedded, to: Failed }
            transition: { from: Merged, to: Failed }
        }
    }
}

pub fn idle() -> IndexingMachine<(), Idle> {
    IndexingMachine::new(())
}
