//! Saga definitions: states, correlated events, bindings and transition rules.
//!
//! A definition is assembled once with [`SagaDefinition::builder`] and is
//! immutable afterwards. [`SagaDefinitionBuilder::build`] rejects
//! inconsistent definitions so that mistakes surface at startup instead of on
//! the first unlucky event.
//!
//! # Example
//!
//! ```ignore
//! let definition = SagaDefinition::<OrderData>::builder("order")
//!     .states([SUBMITTED, AWAITING_PAYMENT])
//!     .event::<OrderSubmitted>(|e| e.order_id.clone())
//!     .event::<PaymentReceived>(|e| e.order_id.clone())
//!     .initially(ActivityChain::<OrderSubmitted, _>::new().transition_to(SUBMITTED))
//!     .during(SUBMITTED, ActivityChain::<PaymentReceived, _>::new().finalize())
//!     .allow_transition(State::INITIAL, SUBMITTED)
//!     .build()?;
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use courier_core::{AnyMessage, Message};

use crate::activity::{ActivityChain, ErasedChain};
use crate::error::SagaError;
use crate::state::{SagaData, State};

type Correlator = Box<dyn Fn(&dyn AnyMessage) -> Option<String> + Send + Sync>;
type Bindings<D> = HashMap<&'static str, Box<dyn ErasedChain<D>>>;

/// Allowed `from -> to` transitions, consulted in strict mode.
///
/// A state with no entry may transition anywhere.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    allowed: HashMap<&'static str, HashSet<State>>,
}

impl TransitionTable {
    pub(crate) fn allow(&mut self, from: State, to: State) {
        self.allowed.entry(from.name()).or_default().insert(to);
    }

    pub fn permits(&self, from: &str, to: State) -> bool {
        self.allowed
            .get(from)
            .map_or(true, |targets| targets.contains(&to))
    }

    /// Targets registered for `from`, or `None` when `from` is unrestricted.
    pub fn allowed_from(&self, from: State) -> Option<&HashSet<State>> {
        self.allowed.get(from.name())
    }
}

/// An immutable saga state machine over data `D`.
pub struct SagaDefinition<D> {
    name: &'static str,
    states: HashSet<State>,
    correlators: HashMap<&'static str, Correlator>,
    bindings: HashMap<&'static str, Bindings<D>>,
    any_state: Bindings<D>,
    transitions: TransitionTable,
}

impl<D: SagaData> SagaDefinition<D> {
    pub fn builder(name: &'static str) -> SagaDefinitionBuilder<D> {
        SagaDefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registered states, built-in ones included.
    pub fn states(&self) -> impl Iterator<Item = State> + '_ {
        self.states.iter().copied()
    }

    /// Routing names of every correlated event.
    pub fn events(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.correlators.keys().copied()
    }

    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }

    /// Correlation key of `message`, or `None` when the event is not part of this saga.
    pub(crate) fn correlate(&self, message: &dyn AnyMessage) -> Option<String> {
        self.correlators
            .get(message.message_type())
            .and_then(|correlate| correlate(message))
    }

    pub(crate) fn starts_with(&self, event_type: &str) -> bool {
        self.bindings
            .get(State::INITIAL.name())
            .is_some_and(|events| events.contains_key(event_type))
    }

    /// Chain for `event_type` in `state`, falling back to `during_any` outside
    /// the initial state.
    pub(crate) fn binding(&self, state: &str, event_type: &str) -> Option<&dyn ErasedChain<D>> {
        if let Some(chain) = self
            .bindings
            .get(state)
            .and_then(|events| events.get(event_type))
        {
            return Some(chain.as_ref());
        }
        if state == State::INITIAL.name() {
            return None;
        }
        self.any_state.get(event_type).map(|chain| chain.as_ref())
    }
}

impl<D> fmt::Debug for SagaDefinition<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: BTreeSet<_> = self.states.iter().map(State::name).collect();
        let events: BTreeSet<_> = self.correlators.keys().collect();
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("states", &states)
            .field("events", &events)
            .field("transitions", &self.transitions)
            .finish()
    }
}

/// Fluent builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder<D> {
    name: &'static str,
    states: HashSet<State>,
    correlators: HashMap<&'static str, Correlator>,
    bindings: HashMap<&'static str, Bindings<D>>,
    any_state: Bindings<D>,
    transitions: TransitionTable,
    problems: Vec<String>,
}

impl<D: SagaData> SagaDefinitionBuilder<D> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            states: [State::INITIAL, State::COMPLETED, State::CANCELLED]
                .into_iter()
                .collect(),
            correlators: HashMap::new(),
            bindings: HashMap::new(),
            any_state: HashMap::new(),
            transitions: TransitionTable::default(),
            problems: Vec::new(),
        }
    }

    pub fn state(mut self, state: State) -> Self {
        self.states.insert(state);
        self
    }

    pub fn states(mut self, states: impl IntoIterator<Item = State>) -> Self {
        self.states.extend(states);
        self
    }

    /// Declare an event and how to extract its correlation key.
    pub fn event<E: Message>(mut self, correlate: impl Fn(&E) -> String + Send + Sync + 'static) -> Self {
        let correlator: Correlator = Box::new(move |message: &dyn AnyMessage| {
            message.downcast_ref::<E>().map(|event| correlate(event))
        });
        if self.correlators.insert(E::MESSAGE_TYPE, correlator).is_some() {
            self.problems
                .push(format!("event '{}' declared twice", E::MESSAGE_TYPE));
        }
        self
    }

    /// Bind a chain that may create a new instance.
    pub fn initially<E: Message>(self, chain: ActivityChain<E, D>) -> Self {
        self.bind(State::INITIAL, chain)
    }

    pub fn during<E: Message>(self, state: State, chain: ActivityChain<E, D>) -> Self {
        self.bind(state, chain)
    }

    /// Bind a chain for every state except the initial one.
    ///
    /// A `during` binding for the same event takes precedence. These chains
    /// never create an instance: an event bound only here that arrives before
    /// its saga exists is treated as not yet created and retried under the
    /// missing-saga budget. Bind the event with [`initially`] as well if it
    /// should be able to start a saga.
    ///
    /// [`initially`]: SagaDefinitionBuilder::initially
    pub fn during_any<E: Message>(mut self, chain: ActivityChain<E, D>) -> Self {
        if self.any_state.insert(E::MESSAGE_TYPE, Box::new(chain)).is_some() {
            self.problems.push(format!(
                "event '{}' bound twice with during_any",
                E::MESSAGE_TYPE
            ));
        }
        self
    }

    pub fn allow_transition(mut self, from: State, to: State) -> Self {
        self.transitions.allow(from, to);
        self
    }

    pub fn allow_transitions(mut self, from: State, to: impl IntoIterator<Item = State>) -> Self {
        for target in to {
            self.transitions.allow(from, target);
        }
        self
    }

    fn bind<E: Message>(mut self, state: State, chain: ActivityChain<E, D>) -> Self {
        let events = self.bindings.entry(state.name()).or_default();
        if events.insert(E::MESSAGE_TYPE, Box::new(chain)).is_some() {
            self.problems.push(format!(
                "event '{}' bound twice in state '{}'",
                E::MESSAGE_TYPE,
                state
            ));
        }
        self
    }

    /// Validate and freeze the definition.
    ///
    /// # Errors
    ///
    /// [`SagaError::Definition`] when an event is bound but never declared,
    /// a binding or transition names an unregistered state, or a binding is
    /// declared twice.
    pub fn build(self) -> Result<SagaDefinition<D>, SagaError> {
        let mut problems = self.problems;
        let registered = |state: &str| self.states.iter().any(|known| known.name() == state);

        let bound = self
            .bindings
            .iter()
            .flat_map(|(state, events)| events.iter().map(move |(event, chain)| (Some(*state), *event, chain)))
            .chain(self.any_state.iter().map(|(event, chain)| (None, *event, chain)));

        for (state, event, chain) in bound {
            if !self.correlators.contains_key(event) {
                problems.push(format!("event '{event}' is bound but never declared"));
            }
            if let Some(state) = state {
                if !registered(state) {
                    problems.push(format!("binding for '{event}' uses unknown state '{state}'"));
                }
            }
            for target in chain.targets() {
                if !registered(target.name()) {
                    problems.push(format!(
                        "binding for '{event}' transitions to unknown state '{target}'"
                    ));
                }
            }
        }

        for (from, targets) in &self.transitions.allowed {
            for state in std::iter::once(*from).chain(targets.iter().map(State::name)) {
                if !registered(state) {
                    problems.push(format!("allowed transition uses unknown state '{state}'"));
                }
            }
        }

        if !problems.is_empty() {
            problems.sort();
            problems.dedup();
            return Err(SagaError::Definition(format!(
                "{}: {}",
                self.name,
                problems.join("; ")
            )));
        }

        Ok(SagaDefinition {
            name: self.name,
            states: self.states,
            correlators: self.correlators,
            bindings: self.bindings,
            any_state: self.any_state,
            transitions: self.transitions,
        })
    }
}
