use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::squash::Squash;

/// Process-unique neuron identifier.
pub type NeuronId = u64;

static NEXT_NEURON_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh identifier. Identifiers are never reused within a process.
pub(crate) fn next_neuron_id() -> NeuronId {
    NEXT_NEURON_ID.fetch_add(1, Ordering::Relaxed)
}

/// Connection identity is the ordered endpoint pair, so asking for the same
/// `(from, to)` twice always resolves to the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    pub from: NeuronId,
    pub to: NeuronId,
}

impl ConnectionId {
    #[inline]
    pub fn new(from: NeuronId, to: NeuronId) -> Self {
        Self { from, to }
    }

    #[inline]
    pub fn is_self(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.from, self.to)
    }
}

/// Directed weighted edge. Endpoints and gater are ids into the owning graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub from: NeuronId,
    pub to: NeuronId,
    pub weight: f64,
    /// Multiplier driven by the gater's activation; 1.0 while ungated.
    pub gain: f64,
    pub gater: Option<NeuronId>,
}

impl Connection {
    pub fn new(from: NeuronId, to: NeuronId, weight: f64) -> Self {
        Self {
            from,
            to,
            weight,
            gain: 1.0,
            gater: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        ConnectionId::new(self.from, self.to)
    }
}

/// Learning traces kept per neuron.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    /// One entry per input connection.
    pub eligibility: BTreeMap<ConnectionId, f64>,
    /// Keyed by a neuron whose incoming connections this neuron gates, then
    /// by this neuron's own input connections.
    pub extended: BTreeMap<NeuronId, BTreeMap<ConnectionId, f64>>,
    /// Influence of this neuron's activation on each gated neuron's state.
    /// Refreshed at activation for the extended traces, then recomputed by
    /// the backward pass once every neuron has fired.
    pub influences: BTreeMap<NeuronId, f64>,
}

impl Trace {
    pub fn clear(&mut self) {
        for v in self.eligibility.values_mut() {
            *v = 0.0;
        }
        for xtrace in self.extended.values_mut() {
            for v in xtrace.values_mut() {
                *v = 0.0;
            }
        }
        for v in self.influences.values_mut() {
            *v = 0.0;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorTerms {
    pub responsibility: f64,
    pub projected: f64,
    pub gated: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neuron {
    pub id: NeuronId,

    pub activation: f64,
    /// Pre-activation input of the current step.
    pub state: f64,
    /// Previous step's `state`.
    pub old: f64,
    /// `squash'(state)` from the last activation.
    pub derivative: f64,
    pub bias: f64,
    pub squash: Squash,

    pub inputs: BTreeSet<ConnectionId>,
    pub projected: BTreeSet<ConnectionId>,
    pub gated: BTreeSet<ConnectionId>,

    /// Always present. Its weight stays zero while disabled.
    pub selfconnection: Connection,
    /// Whether `selfconnection` takes part in the network.
    pub selfconnected: bool,

    pub trace: Trace,
    pub error: ErrorTerms,
}

impl Neuron {
    pub fn new(squash: Squash, bias: f64) -> Self {
        Self::with_id(next_neuron_id(), squash, bias)
    }

    pub(crate) fn with_id(id: NeuronId, squash: Squash, bias: f64) -> Self {
        Self {
            id,
            activation: 0.0,
            state: 0.0,
            old: 0.0,
            derivative: 0.0,
            bias,
            squash,
            inputs: BTreeSet::new(),
            projected: BTreeSet::new(),
            gated: BTreeSet::new(),
            selfconnection: Connection::new(id, id, 0.0),
            selfconnected: false,
            trace: Trace::default(),
            error: ErrorTerms::default(),
        }
    }

    #[inline]
    pub fn is_selfconnected(&self) -> bool {
        self.selfconnected
    }

    /// Forget the running context; learned weights and bias stay.
    pub fn clear(&mut self) {
        self.activation = 0.0;
        self.state = 0.0;
        self.old = 0.0;
        self.derivative = 0.0;
        self.trace.clear();
        self.error = ErrorTerms::default();
    }
}
