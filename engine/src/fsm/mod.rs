//! A small reusable finite-state-machine kernel.
//!
//! A machine is assembled once from a list of event descriptors plus a set of
//! callbacks, then driven with [`Fsm::do_event`]. Events may be internal
//! (only reachable through callbacks returning them), or auto events that the
//! kernel fires by itself before or after a user-triggered transition —
//! protocol validators are auto events in `After` mode. Deadline checks never
//! read the wall clock: callers re-evaluate the current state's validator
//! through [`Fsm::tick`] with an explicit timestamp.

mod error;

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

pub use error::{BuildError, ErrorLevel, FsmError};

pub const STATE_GLOBAL_IDLE: State = State::new("__idle");
pub const STATE_GLOBAL_DONE: State = State::new("__done");

/// A machine state, comparable by its string tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct State(pub Cow<'static, str>);

impl State {
    pub const fn new(s: &'static str) -> Self {
        State(Cow::Borrowed(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for State {
    fn from(s: &str) -> Self {
        State(Cow::Owned(s.trim().to_owned()))
    }
}

impl From<String> for State {
    fn from(s: String) -> Self {
        State(Cow::Owned(s.trim().to_owned()))
    }
}

/// A machine event, comparable by its string tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Event(pub Cow<'static, str>);

impl Event {
    pub const fn new(s: &'static str) -> Self {
        Event(Cow::Borrowed(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Event {
    fn from(s: &str) -> Self {
        Event(Cow::Owned(s.trim().to_owned()))
    }
}

/// When the kernel fires an auto event relative to the main transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventRunMode {
    /// Placeholder for non-auto events.
    Default,
    Before,
    After,
}

/// Declarative description of one event and its transitions.
#[derive(Debug, Clone)]
pub struct EventDesc {
    pub name: Event,
    pub src_states: Vec<State>,
    pub dst_state: State,
    pub is_internal: bool,
    pub is_auto: bool,
    pub auto_run_mode: EventRunMode,
}

impl EventDesc {
    pub fn new(name: Event, src_states: Vec<State>, dst_state: State) -> Self {
        Self {
            name,
            src_states,
            dst_state,
            is_internal: false,
            is_auto: false,
            auto_run_mode: EventRunMode::Default,
        }
    }

    /// Internal events cannot be emitted from an external `do_event` call.
    pub fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }

    /// Auto events run without a manual call, before or after the triggering
    /// transition.
    pub fn auto(mut self, mode: EventRunMode) -> Self {
        self.is_auto = true;
        self.auto_run_mode = mode;
        self
    }
}

/// Result of a successfully executed transition.
#[derive(Debug)]
pub struct Response<D> {
    /// Machine state after the transition (including any auto events).
    pub state: State,
    /// Data produced by the last callback that returned any.
    pub data: Option<D>,
}

/// What an action callback hands back to the kernel.
///
/// An empty `out_event` (or one equal to the input event) lets the declared
/// transition fire; a different event reroutes the machine, which is how
/// validators choose between success and cancellation branches. A `warning`
/// is logged and does not stop the transition; the same holds for a callback
/// that fails outright with a warn-level [`FsmError`]. Only error- and
/// fatal-level failures abort with no state change.
#[derive(Debug)]
pub struct CallbackResult<D> {
    pub out_event: Option<Event>,
    pub data: Option<D>,
    pub warning: Option<FsmError>,
}

impl<D> Default for CallbackResult<D> {
    fn default() -> Self {
        Self {
            out_event: None,
            data: None,
            warning: None,
        }
    }
}

impl<D> CallbackResult<D> {
    pub fn stay() -> Self {
        Self::default()
    }

    pub fn with_data(data: D) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn reroute(event: Event) -> Self {
        Self {
            out_event: Some(event),
            ..Self::default()
        }
    }

    pub fn reroute_with_data(event: Event, data: D) -> Self {
        Self {
            out_event: Some(event),
            data: Some(data),
            warning: None,
        }
    }
}

pub type Callback<A, D> =
    Arc<dyn Fn(&Event, &A) -> Result<CallbackResult<D>, FsmError> + Send + Sync>;

pub type Callbacks<A, D> = HashMap<Event, Callback<A, D>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TrKey(State, Event);

#[derive(Debug, Clone)]
struct TrEvent {
    event: Event,
    dst_state: State,
    is_internal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AutoKey(State, EventRunMode);

/// A deterministic transition engine over `(state, event) -> state`.
///
/// All fields except the current state are immutable after construction; the
/// current state sits behind a read/write lock so concurrent readers are
/// cheap and a stale `do_event` fails instead of racing.
pub struct Fsm<A, D> {
    name: String,
    initial_state: State,
    current_state: RwLock<State>,
    transitions: HashMap<TrKey, TrEvent>,
    auto_transitions: HashMap<AutoKey, TrEvent>,
    callbacks: Callbacks<A, D>,
    initial_event: Option<Event>,
    fin_states: HashSet<State>,
    all_states: HashSet<State>,
}

impl<A, D> std::fmt::Debug for Fsm<A, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("name", &self.name)
            .field("initial_state", &self.initial_state)
            .field("current_state", &self.current_state)
            .field("transitions", &self.transitions)
            .field("auto_transitions", &self.auto_transitions)
            .field("callbacks", &self.callbacks.keys().collect::<Vec<_>>())
            .field("initial_event", &self.initial_event)
            .field("fin_states", &self.fin_states)
            .field("all_states", &self.all_states)
            .finish()
    }
}

impl<A, D> Fsm<A, D> {
    pub fn new(
        name: impl Into<String>,
        initial_state: State,
        events: Vec<EventDesc>,
        callbacks: Callbacks<A, D>,
    ) -> Result<Self, BuildError> {
        let name = name.into().trim().to_owned();
        if name.is_empty() {
            return Err(BuildError::EmptyMachineName);
        }
        if initial_state.is_empty() {
            return Err(BuildError::EmptyInitialState);
        }
        if events.is_empty() {
            return Err(BuildError::NoEvents);
        }

        let mut transitions = HashMap::new();
        let mut auto_transitions = HashMap::new();
        let mut initial_event = None;

        let mut all_events = HashSet::new();
        // Destination states; sources are tracked separately to find the
        // final states below.
        let mut all_states = HashSet::new();
        let mut all_sources = HashSet::new();

        for event in &events {
            if event.name.is_empty() {
                return Err(BuildError::EmptyEventName);
            }
            if event.dst_state.is_empty() {
                return Err(BuildError::EmptyDstState(event.name.clone()));
            }
            if !all_events.insert(event.name.clone()) {
                return Err(BuildError::DuplicateEvent(event.name.clone()));
            }
            all_states.insert(event.dst_state.clone());

            if event.is_auto && event.auto_run_mode == EventRunMode::Default {
                return Err(BuildError::AutoRunModeNotSet(event.name.clone()));
            }

            let mut sources = 0;
            for src in &event.src_states {
                if src.is_empty() {
                    continue;
                }
                if *src == STATE_GLOBAL_DONE {
                    return Err(BuildError::DoneAsSource(src.clone()));
                }

                let tr = TrEvent {
                    event: event.name.clone(),
                    dst_state: event.dst_state.clone(),
                    is_internal: event.is_internal,
                };

                let key = TrKey(src.clone(), event.name.clone());
                if transitions.insert(key, tr.clone()).is_some() {
                    return Err(BuildError::DuplicateTransition {
                        state: src.clone(),
                        event: event.name.clone(),
                    });
                }

                if *src == initial_state && initial_event.is_none() {
                    initial_event = Some(event.name.clone());
                }

                if event.is_auto {
                    let auto_key = AutoKey(src.clone(), event.auto_run_mode);
                    if auto_transitions.insert(auto_key, tr).is_some() {
                        return Err(BuildError::DuplicateAutoTransition {
                            state: src.clone(),
                            event: event.name.clone(),
                        });
                    }
                }

                all_sources.insert(src.clone());
                sources += 1;
            }

            if sources == 0 {
                return Err(BuildError::NoSourceStates(event.name.clone()));
            }
        }

        if all_states.len() < 2 {
            return Err(BuildError::TooFewStates);
        }

        for event in callbacks.keys() {
            if !all_events.contains(event) {
                return Err(BuildError::UnknownCallbackEvent(event.clone()));
            }
        }

        // A state is final if it is a destination that never appears as a
        // source, or the shared done state.
        let mut fin_states = HashSet::new();
        for state in &all_states {
            if *state == STATE_GLOBAL_IDLE {
                continue;
            }
            if !all_sources.contains(state) || *state == STATE_GLOBAL_DONE {
                fin_states.insert(state.clone());
            }
        }
        if fin_states.is_empty() {
            return Err(BuildError::NoFinalStates);
        }

        all_states.extend(all_sources);

        Ok(Self {
            name,
            current_state: RwLock::new(initial_state.clone()),
            initial_state,
            transitions,
            auto_transitions,
            callbacks,
            initial_event,
            fin_states,
            all_states,
        })
    }

    /// Snapshot of this machine positioned at `state`, for resuming a
    /// suspended execution from a dump.
    pub fn copy_with_state(&self, state: State) -> Result<Self, BuildError> {
        if !state.is_empty() && !self.all_states.contains(&state) {
            return Err(BuildError::UnknownState {
                machine: self.name.clone(),
                state,
            });
        }
        let current = if state.is_empty() {
            self.initial_state.clone()
        } else {
            state
        };
        Ok(Self {
            name: self.name.clone(),
            initial_state: self.initial_state.clone(),
            current_state: RwLock::new(current),
            transitions: self.transitions.clone(),
            auto_transitions: self.auto_transitions.clone(),
            callbacks: self.callbacks.clone(),
            initial_event: self.initial_event.clone(),
            fin_states: self.fin_states.clone(),
            all_states: self.all_states.clone(),
        })
    }

    /// Execute an externally-triggered event from the current state.
    pub fn do_event(&self, event: &Event, args: &A) -> Result<Response<D>, FsmError> {
        let current = self.state();
        let tr = self
            .transitions
            .get(&TrKey(current.clone(), event.clone()))
            .cloned()
            .ok_or_else(|| {
                FsmError::fatal(format!(
                    "cannot execute event \"{}\" for state \"{}\"",
                    event, current
                ))
            })?;
        if tr.is_internal {
            return Err(FsmError::fatal(format!("event \"{}\" is internal", event)));
        }

        self.run(&tr, args)
    }

    /// Re-evaluate the current state's `After` auto event (the validator)
    /// without an external event. `args` carries the caller's clock.
    pub fn tick(&self, args: &A) -> Result<Response<D>, FsmError> {
        let mut resp = Response {
            state: self.state(),
            data: None,
        };
        let key = AutoKey(self.state(), EventRunMode::After);
        if let Some(auto) = self.auto_transitions.get(&key).cloned() {
            resp.data = self.exec_auto(&auto, args)?;
            resp.state = self.state();
        }
        Ok(resp)
    }

    fn run(&self, tr: &TrEvent, args: &A) -> Result<Response<D>, FsmError> {
        let mut resp = Response {
            state: self.state(),
            data: None,
        };

        let before = AutoKey(self.state(), EventRunMode::Before);
        if let Some(auto) = self.auto_transitions.get(&before).cloned() {
            resp.data = self.exec_auto(&auto, args)?;
            resp.state = self.state();
        }

        let mut out_event = None;
        if let Some(cb) = self.callbacks.get(&tr.event) {
            match cb(&tr.event, args) {
                Ok(result) => {
                    if let Some(warning) = &result.warning {
                        tracing::warn!(machine = %self.name, event = %tr.event, "{}", warning);
                    }
                    if result.data.is_some() {
                        resp.data = result.data;
                    }
                    out_event = result.out_event;
                }
                // A warn-level failure is reported but the declared
                // transition still fires.
                Err(err) if err.is_warn() => {
                    tracing::warn!(machine = %self.name, event = %tr.event, "{}", err);
                }
                Err(err) => return Err(err),
            }
        }

        match out_event {
            Some(out) if out != tr.event => self.set_state(&out)?,
            _ => self.set_state(&tr.event)?,
        }
        resp.state = self.state();

        let after = AutoKey(self.state(), EventRunMode::After);
        if let Some(auto) = self.auto_transitions.get(&after).cloned() {
            if let Some(data) = self.exec_auto(&auto, args)? {
                resp.data = Some(data);
            }
            resp.state = self.state();
        }

        Ok(resp)
    }

    fn exec_auto(&self, auto: &TrEvent, args: &A) -> Result<Option<D>, FsmError> {
        let mut out_event = None;
        let mut data = None;
        if let Some(cb) = self.callbacks.get(&auto.event) {
            match cb(&auto.event, args) {
                Ok(result) => {
                    if let Some(warning) = &result.warning {
                        tracing::warn!(machine = %self.name, event = %auto.event, "{}", warning);
                    }
                    data = result.data;
                    out_event = result.out_event;
                }
                Err(err) if err.is_warn() => {
                    tracing::warn!(machine = %self.name, event = %auto.event, "{}", err);
                }
                Err(err) => return Err(err),
            }
        }

        match out_event {
            Some(out) if out != auto.event => self.set_state(&out)?,
            _ => self.set_state(&auto.event)?,
        }

        Ok(data)
    }

    /// Move to the destination of `(current, event)` without callbacks.
    pub fn set_state(&self, event: &Event) -> Result<(), FsmError> {
        let mut current = self
            .current_state
            .write()
            .map_err(|_| FsmError::fatal("state lock poisoned"))?;
        let tr = self
            .transitions
            .get(&TrKey(current.clone(), event.clone()))
            .ok_or_else(|| {
                FsmError::fatal(format!(
                    "cannot set state by event \"{}\" for state \"{}\"",
                    event, current
                ))
            })?;
        *current = tr.dst_state.clone();
        Ok(())
    }

    pub fn state(&self) -> State {
        self.current_state
            .read()
            .expect("state lock poisoned")
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &State {
        &self.initial_state
    }

    /// The entry event, if it can be emitted from the global idle state.
    pub fn global_initial_event(&self) -> Option<Event> {
        let initial = self.initial_event.clone()?;
        let tr = self
            .transitions
            .get(&TrKey(STATE_GLOBAL_IDLE, initial.clone()))?;
        (!tr.is_internal).then_some(initial)
    }

    /// The entry event, if it can be emitted from this machine's own initial
    /// state.
    pub fn entry_event(&self) -> Option<Event> {
        let initial = self.initial_event.clone()?;
        let tr = self
            .transitions
            .get(&TrKey(self.initial_state.clone(), initial.clone()))?;
        (!tr.is_internal).then_some(initial)
    }

    /// Externally-triggerable events.
    pub fn events_list(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .transitions
            .values()
            .filter(|tr| !tr.is_internal)
            .map(|tr| tr.event.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        events.sort();
        events
    }

    /// States this machine can transition out of.
    pub fn states_list(&self) -> Vec<State> {
        let mut states: Vec<State> = self
            .transitions
            .keys()
            .map(|key| key.0.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        states.sort();
        states
    }

    pub fn is_fin_state(&self, state: &State) -> bool {
        self.fin_states.contains(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE_INIT: State = STATE_GLOBAL_IDLE;
    const STATE_STAGE1: State = State::new("state_stage1");
    const STATE_STAGE2: State = State::new("state_stage2");
    const STATE_CANCELED_BY_INTERNAL: State = State::new("state_canceled");
    const STATE_CANCELED2: State = State::new("state_canceled2");
    const STATE_OUT: State = State::new("state_out_to_fsm2");

    const EVENT_INIT: Event = Event::new("event_init");
    const EVENT_CANCEL: Event = Event::new("event_cancel");
    const EVENT_PROCESS: Event = Event::new("event_process");
    const EVENT_INTERNAL: Event = Event::new("event_internal");
    const EVENT_CANCEL_BY_INTERNAL: Event = Event::new("event_internal_cancel");
    const EVENT_INTERNAL_OUT: Event = Event::new("event_internal_out");

    fn testing_events() -> Vec<EventDesc> {
        vec![
            EventDesc::new(EVENT_INIT, vec![STATE_INIT], STATE_STAGE1),
            EventDesc::new(EVENT_INTERNAL, vec![STATE_STAGE1], STATE_STAGE2).internal(),
            EventDesc::new(
                EVENT_CANCEL_BY_INTERNAL,
                vec![STATE_STAGE2],
                STATE_CANCELED_BY_INTERNAL,
            )
            .internal(),
            EventDesc::new(EVENT_CANCEL, vec![STATE_STAGE2], STATE_CANCELED2),
            EventDesc::new(EVENT_PROCESS, vec![STATE_STAGE2], STATE_OUT),
            EventDesc::new(EVENT_INTERNAL_OUT, vec![STATE_STAGE2], STATE_OUT).internal(),
        ]
    }

    fn passthrough() -> Callback<(), ()> {
        Arc::new(|_, _| Ok(CallbackResult::stay()))
    }

    fn testing_fsm() -> Fsm<(), ()> {
        let mut callbacks: Callbacks<(), ()> = HashMap::new();
        callbacks.insert(EVENT_INIT, passthrough());
        callbacks.insert(EVENT_INTERNAL_OUT, passthrough());
        callbacks.insert(EVENT_PROCESS, passthrough());
        Fsm::new("fsm_test", STATE_INIT, testing_events(), callbacks).expect("build")
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = Fsm::<(), ()>::new("", State::new("init_state"), vec![], HashMap::new())
            .unwrap_err();
        assert_eq!(err, BuildError::EmptyMachineName);
    }

    #[test]
    fn empty_initial_state_is_rejected() {
        let err = Fsm::<(), ()>::new("fsm", State::new(""), vec![], HashMap::new()).unwrap_err();
        assert_eq!(err, BuildError::EmptyInitialState);
    }

    #[test]
    fn empty_events_are_rejected() {
        let err =
            Fsm::<(), ()>::new("fsm", State::new("init_state"), vec![], HashMap::new())
                .unwrap_err();
        assert_eq!(err, BuildError::NoEvents);
    }

    #[test]
    fn empty_event_name_is_rejected() {
        let events = vec![EventDesc::new(
            Event::new(""),
            vec![State::new("init_state")],
            STATE_GLOBAL_DONE,
        )];
        let err = Fsm::<(), ()>::new("fsm", State::new("init_state"), events, HashMap::new())
            .unwrap_err();
        assert_eq!(err, BuildError::EmptyEventName);
    }

    #[test]
    fn event_without_sources_is_rejected() {
        let events = vec![EventDesc::new(
            Event::new("event"),
            vec![],
            STATE_GLOBAL_DONE,
        )];
        let err = Fsm::<(), ()>::new("fsm", State::new("init_state"), events, HashMap::new())
            .unwrap_err();
        assert_eq!(err, BuildError::NoSourceStates(Event::new("event")));
    }

    #[test]
    fn duplicate_event_name_is_rejected() {
        let events = vec![
            EventDesc::new(
                Event::new("event"),
                vec![State::new("init_state")],
                State::new("state"),
            ),
            EventDesc::new(
                Event::new("event"),
                vec![State::new("state")],
                STATE_GLOBAL_DONE,
            ),
        ];
        let err = Fsm::<(), ()>::new("fsm", State::new("init_state"), events, HashMap::new())
            .unwrap_err();
        assert_eq!(err, BuildError::DuplicateEvent(Event::new("event")));
    }

    #[test]
    fn single_destination_state_is_rejected() {
        let events = vec![
            EventDesc::new(
                Event::new("event1"),
                vec![State::new("init_state")],
                State::new("state"),
            ),
            EventDesc::new(
                Event::new("event2"),
                vec![State::new("init_state")],
                State::new("state"),
            ),
        ];
        let err = Fsm::<(), ()>::new("fsm", State::new("init_state"), events, HashMap::new())
            .unwrap_err();
        assert_eq!(err, BuildError::TooFewStates);
    }

    #[test]
    fn done_as_source_is_rejected() {
        let events = vec![EventDesc::new(
            Event::new("event"),
            vec![STATE_GLOBAL_DONE],
            State::new("state"),
        )];
        let err = Fsm::<(), ()>::new("fsm", State::new("init_state"), events, HashMap::new())
            .unwrap_err();
        assert_eq!(err, BuildError::DoneAsSource(STATE_GLOBAL_DONE));
    }

    #[test]
    fn auto_event_without_mode_is_rejected() {
        let events = vec![EventDesc::new(
            Event::new("event"),
            vec![State::new("init_state")],
            STATE_GLOBAL_DONE,
        )
        .auto(EventRunMode::Default)];
        let err = Fsm::<(), ()>::new("fsm", State::new("init_state"), events, HashMap::new())
            .unwrap_err();
        assert_eq!(err, BuildError::AutoRunModeNotSet(Event::new("event")));
    }

    #[test]
    fn callback_for_unknown_event_is_rejected() {
        let mut callbacks: Callbacks<(), ()> = HashMap::new();
        callbacks.insert(Event::new("missing"), passthrough());
        let err = Fsm::new("fsm_test", STATE_INIT, testing_events(), callbacks).unwrap_err();
        assert_eq!(err, BuildError::UnknownCallbackEvent(Event::new("missing")));
    }

    #[test]
    fn name_and_initial_state() {
        let fsm = testing_fsm();
        assert_eq!(fsm.name(), "fsm_test");
        assert_eq!(*fsm.initial_state(), STATE_INIT);
        assert_eq!(fsm.global_initial_event(), Some(EVENT_INIT));
        assert_eq!(fsm.entry_event(), Some(EVENT_INIT));
    }

    #[test]
    fn fin_states_are_destinations_without_exits() {
        let fsm = testing_fsm();
        assert!(fsm.is_fin_state(&STATE_OUT));
        assert!(fsm.is_fin_state(&STATE_CANCELED_BY_INTERNAL));
        assert!(fsm.is_fin_state(&STATE_CANCELED2));
        assert!(!fsm.is_fin_state(&STATE_STAGE2));
    }

    #[test]
    fn events_list_excludes_internal() {
        let fsm = testing_fsm();
        let mut expected = vec![EVENT_INIT, EVENT_CANCEL, EVENT_PROCESS];
        expected.sort();
        assert_eq!(fsm.events_list(), expected);
    }

    #[test]
    fn states_list_contains_sources_only() {
        let fsm = testing_fsm();
        let mut expected = vec![STATE_INIT, STATE_STAGE1, STATE_STAGE2];
        expected.sort();
        assert_eq!(fsm.states_list(), expected);
    }

    #[test]
    fn copy_with_state_leaves_source_untouched() {
        let fsm = testing_fsm();
        let copy = fsm.copy_with_state(STATE_STAGE2).expect("copy");
        assert_eq!(fsm.state(), STATE_INIT);
        assert_eq!(copy.state(), STATE_STAGE2);
    }

    #[test]
    fn copy_with_unknown_state_fails() {
        let fsm = testing_fsm();
        let err = fsm.copy_with_state(State::new("nope")).unwrap_err();
        assert!(matches!(err, BuildError::UnknownState { .. }));
    }

    #[test]
    fn do_event_moves_to_destination() {
        let fsm = testing_fsm();
        let resp = fsm.do_event(&EVENT_INIT, &()).expect("do");
        assert_eq!(resp.state, STATE_STAGE1);
        assert_eq!(fsm.state(), STATE_STAGE1);
    }

    #[test]
    fn internal_event_cannot_be_triggered_externally() {
        let fsm = testing_fsm();
        fsm.do_event(&EVENT_INIT, &()).expect("do");
        let err = fsm.do_event(&EVENT_INTERNAL, &()).unwrap_err();
        assert_eq!(err.level, ErrorLevel::Fatal);
    }

    #[test]
    fn stale_event_fails_without_state_change() {
        let fsm = testing_fsm();
        let err = fsm.do_event(&EVENT_CANCEL, &()).unwrap_err();
        assert!(err.message.contains("cannot execute event"));
        assert_eq!(fsm.state(), STATE_INIT);
    }

    #[test]
    fn callback_reroute_overrides_declared_destination() {
        let mut callbacks: Callbacks<(), ()> = HashMap::new();
        callbacks.insert(
            EVENT_PROCESS,
            Arc::new(|_, _| Ok(CallbackResult::reroute(EVENT_CANCEL))),
        );
        let fsm = Fsm::new("fsm_test", STATE_INIT, testing_events(), callbacks).expect("build");
        fsm.do_event(&EVENT_INIT, &()).expect("init");
        fsm.set_state(&EVENT_INTERNAL).expect("internal");
        let resp = fsm.do_event(&EVENT_PROCESS, &()).expect("process");
        assert_eq!(resp.state, STATE_CANCELED2);
    }

    #[test]
    fn warn_level_callback_error_does_not_abort() {
        let mut callbacks: Callbacks<(), ()> = HashMap::new();
        callbacks.insert(
            EVENT_INIT,
            Arc::new(|_, _| Err(FsmError::warn("soft failure"))),
        );
        let fsm = Fsm::new("fsm_test", STATE_INIT, testing_events(), callbacks).expect("build");
        let resp = fsm.do_event(&EVENT_INIT, &()).expect("warn must not abort");
        assert_eq!(resp.state, STATE_STAGE1);
        assert_eq!(fsm.state(), STATE_STAGE1);
    }

    #[test]
    fn callback_warning_rides_a_successful_transition() {
        let mut callbacks: Callbacks<(), ()> = HashMap::new();
        callbacks.insert(
            EVENT_INIT,
            Arc::new(|_, _| {
                Ok(CallbackResult {
                    out_event: None,
                    data: None,
                    warning: Some(FsmError::warn("lagging participant")),
                })
            }),
        );
        let fsm = Fsm::new("fsm_test", STATE_INIT, testing_events(), callbacks).expect("build");
        let resp = fsm.do_event(&EVENT_INIT, &()).expect("warning must not abort");
        assert_eq!(resp.state, STATE_STAGE1);
    }

    #[test]
    fn callback_error_aborts_without_state_change() {
        let mut callbacks: Callbacks<(), ()> = HashMap::new();
        callbacks.insert(
            EVENT_INIT,
            Arc::new(|_, _| Err(FsmError::error("boom"))),
        );
        let fsm = Fsm::new("fsm_test", STATE_INIT, testing_events(), callbacks).expect("build");
        let err = fsm.do_event(&EVENT_INIT, &()).unwrap_err();
        assert_eq!(err.level, ErrorLevel::Error);
        assert_eq!(fsm.state(), STATE_INIT);
    }

    #[test]
    fn auto_after_event_fires_on_entry() {
        // An After-auto validator on stage1 that reroutes into stage2.
        let events = vec![
            EventDesc::new(EVENT_INIT, vec![STATE_INIT], STATE_STAGE1),
            EventDesc::new(EVENT_INTERNAL, vec![STATE_STAGE1], STATE_STAGE1)
                .internal()
                .auto(EventRunMode::After),
            EventDesc::new(EVENT_CANCEL_BY_INTERNAL, vec![STATE_STAGE1], STATE_STAGE2)
                .internal(),
            EventDesc::new(EVENT_CANCEL, vec![STATE_STAGE2], STATE_CANCELED2),
        ];
        let mut callbacks: Callbacks<(), ()> = HashMap::new();
        callbacks.insert(
            EVENT_INTERNAL,
            Arc::new(|_, _| Ok(CallbackResult::reroute(EVENT_CANCEL_BY_INTERNAL))),
        );
        let fsm = Fsm::new("fsm_test", STATE_INIT, events, callbacks).expect("build");
        let resp = fsm.do_event(&EVENT_INIT, &()).expect("do");
        assert_eq!(resp.state, STATE_STAGE2);
    }

    #[test]
    fn tick_runs_the_current_validator() {
        let events = vec![
            EventDesc::new(EVENT_INIT, vec![STATE_INIT], STATE_STAGE1),
            EventDesc::new(EVENT_INTERNAL, vec![STATE_STAGE1], STATE_STAGE1)
                .internal()
                .auto(EventRunMode::After),
            EventDesc::new(EVENT_CANCEL_BY_INTERNAL, vec![STATE_STAGE1], STATE_STAGE2)
                .internal(),
            EventDesc::new(EVENT_CANCEL, vec![STATE_STAGE2], STATE_CANCELED2),
        ];
        let fsm = Fsm::<(), ()>::new("fsm_test", STATE_INIT, events, HashMap::new())
            .expect("build");
        fsm.set_state(&EVENT_INIT).expect("enter stage1");

        // Without a callback the validator stays put.
        let resp = fsm.tick(&()).expect("tick");
        assert_eq!(resp.state, STATE_STAGE1);
    }
}
