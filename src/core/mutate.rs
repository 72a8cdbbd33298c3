//! Primitive perturbations for neuroevolution.
//!
//! Operators are applied one at a time through [`Network::mutate`]; nothing
//! here schedules them. Every operator goes through the network's structural
//! API, so an active flat program is restored first and the graph invariants
//! (no dangling ids, traces only for live connections) hold afterwards.

use rand::seq::SliceRandom;
use rand::Rng;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{NetworkError, Result};
use crate::layer::LayerRef;
use crate::network::{sample, Network};
use crate::neuron::{ConnectionId, NeuronId};
use crate::squash::Squash;

/// Bounds of the uniform noise added by the `ModifyRandom*` operators.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Perturbation {
    pub min: f64,
    pub max: f64,
}

impl Default for Perturbation {
    fn default() -> Self {
        Self {
            min: -1.0,
            max: 1.0,
        }
    }
}

impl Perturbation {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn validate(&self) -> core::result::Result<(), &'static str> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err("perturbation must be a finite range with min <= max");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Mutation {
    /// Exchange the weights of two distinct connections.
    SwapWeight,
    /// Exchange the biases of two distinct non-input neurons.
    SwapBias,
    /// Add noise to the bias of one non-input neuron.
    ModifyRandomBias(Perturbation),
    /// Add noise to the weight of one connection.
    ModifyRandomWeight(Perturbation),
    /// Add or remove a neuron in a random hidden layer.
    ModifyNeurons,
    /// Add a forward connection or remove an existing one.
    ModifyConnections,
    /// Give a non-input neuron a different squash from `allowed`.
    ModifySquash { allowed: Vec<Squash> },
}

impl Mutation {
    /// Every operator with its default configuration.
    pub fn all() -> Vec<Mutation> {
        vec![
            Mutation::SwapWeight,
            Mutation::SwapBias,
            Mutation::ModifyRandomBias(Perturbation::default()),
            Mutation::ModifyRandomWeight(Perturbation::default()),
            Mutation::ModifyNeurons,
            Mutation::ModifyConnections,
            Mutation::modify_squash(),
        ]
    }

    pub fn modify_squash() -> Self {
        Mutation::ModifySquash {
            allowed: Squash::ALL.to_vec(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Mutation::SwapWeight => "swap_weight",
            Mutation::SwapBias => "swap_bias",
            Mutation::ModifyRandomBias(_) => "modify_random_bias",
            Mutation::ModifyRandomWeight(_) => "modify_random_weight",
            Mutation::ModifyNeurons => "modify_neurons",
            Mutation::ModifyConnections => "modify_connections",
            Mutation::ModifySquash { .. } => "modify_squash",
        }
    }
}

fn unavailable(mutation: &Mutation, reason: &'static str) -> NetworkError {
    warn!(mutation = mutation.name(), reason, "mutation unavailable");
    NetworkError::MutationUnavailable(reason)
}

impl Network {
    /// Apply one mutation operator, drawing choices from the network's RNG.
    ///
    /// Returns [`NetworkError::MutationUnavailable`] when the topology has
    /// nothing the operator could act on; the network is then unchanged.
    pub fn mutate(&mut self, mutation: &Mutation) -> Result<()> {
        self.restore()?;
        match mutation {
            Mutation::SwapWeight => self.swap_weight(mutation),
            Mutation::SwapBias => self.swap_bias(mutation),
            Mutation::ModifyRandomBias(p) => {
                p.validate().map_err(NetworkError::InvalidConfig)?;
                let id = self.pick_non_input(mutation)?;
                let delta = sample(&mut self.rng, (p.min, p.max));
                let bias = self.graph.neuron(id)?.bias + delta;
                self.set_bias(id, bias)
            }
            Mutation::ModifyRandomWeight(p) => {
                p.validate().map_err(NetworkError::InvalidConfig)?;
                let c = *self
                    .connections()
                    .choose(&mut self.rng)
                    .ok_or_else(|| unavailable(mutation, "network has no connections"))?;
                let delta = sample(&mut self.rng, (p.min, p.max));
                let weight = self.graph.connection(c)?.weight + delta;
                self.set_weight(c, weight)
            }
            Mutation::ModifyNeurons => self.modify_neurons(mutation),
            Mutation::ModifyConnections => self.modify_connections(mutation),
            Mutation::ModifySquash { allowed } => {
                let id = self.pick_non_input(mutation)?;
                let current = self.graph.neuron(id)?.squash;
                let choices: Vec<Squash> = allowed.iter().copied().filter(|&s| s != current).collect();
                let squash = *choices
                    .choose(&mut self.rng)
                    .ok_or_else(|| unavailable(mutation, "no alternative squash allowed"))?;
                self.set_squash(id, squash)
            }
        }
    }

    fn non_input_neurons(&self) -> Vec<NeuronId> {
        self.neurons()
            .into_iter()
            .filter(|&(_, layer)| layer != LayerRef::Input)
            .map(|(id, _)| id)
            .collect()
    }

    fn pick_non_input(&mut self, mutation: &Mutation) -> Result<NeuronId> {
        let candidates = self.non_input_neurons();
        candidates
            .choose(&mut self.rng)
            .copied()
            .ok_or_else(|| unavailable(mutation, "network has no non-input neurons"))
    }

    fn swap_weight(&mut self, mutation: &Mutation) -> Result<()> {
        let connections = self.connections();
        if connections.len() < 2 {
            return Err(unavailable(mutation, "fewer than two connections"));
        }
        let pair: Vec<ConnectionId> = connections.choose_multiple(&mut self.rng, 2).copied().collect();
        let (a, b) = (pair[0], pair[1]);
        let wa = self.graph.connection(a)?.weight;
        let wb = self.graph.connection(b)?.weight;
        self.set_weight(a, wb)?;
        self.set_weight(b, wa)?;
        trace!(%a, %b, "swapped weights");
        Ok(())
    }

    fn swap_bias(&mut self, mutation: &Mutation) -> Result<()> {
        let candidates = self.non_input_neurons();
        if candidates.len() < 2 {
            return Err(unavailable(mutation, "fewer than two non-input neurons"));
        }
        let pair: Vec<NeuronId> = candidates.choose_multiple(&mut self.rng, 2).copied().collect();
        let (a, b) = (pair[0], pair[1]);
        let ba = self.graph.neuron(a)?.bias;
        let bb = self.graph.neuron(b)?.bias;
        self.set_bias(a, bb)?;
        self.set_bias(b, ba)?;
        trace!(a, b, "swapped biases");
        Ok(())
    }

    /// Layers on either side of hidden layer `i`.
    fn neighbours(&self, i: usize) -> (LayerRef, LayerRef) {
        let before = if i == 0 {
            LayerRef::Input
        } else {
            LayerRef::Hidden(i - 1)
        };
        let after = if i + 1 == self.hidden_count() {
            LayerRef::Output
        } else {
            LayerRef::Hidden(i + 1)
        };
        (before, after)
    }

    fn modify_neurons(&mut self, mutation: &Mutation) -> Result<()> {
        if self.hidden_count() == 0 {
            return Err(unavailable(mutation, "network has no hidden layers"));
        }
        let i = self.rng.gen_range(0..self.hidden_count());
        let layer = LayerRef::Hidden(i);
        let size = self.layer(layer)?.size();

        // A layer is never emptied; its last neuron can only gain a sibling.
        if size > 1 && self.rng.gen_bool(0.5) {
            let idx = self.rng.gen_range(0..size);
            let id = self.layer(layer)?.neurons()[idx];
            self.remove_neuron(id)?;
            trace!(id, layer = i, "removed hidden neuron");
            return Ok(());
        }

        let (before, after) = self.neighbours(i);
        let id = self.add_neuron(layer)?;
        for from in self.layer(before)?.neurons().to_vec() {
            self.project_neuron(from, id, None)?;
        }
        for to in self.layer(after)?.neurons().to_vec() {
            self.project_neuron(id, to, None)?;
        }
        trace!(id, layer = i, "added hidden neuron");
        Ok(())
    }

    fn modify_connections(&mut self, mutation: &Mutation) -> Result<()> {
        let removable: Vec<ConnectionId> = self
            .connections()
            .into_iter()
            .filter(|c| !c.is_self())
            .collect();
        let addable = self.forward_gaps();

        let remove = match (removable.is_empty(), addable.is_empty()) {
            (true, true) => return Err(unavailable(mutation, "no connection to add or remove")),
            (false, true) => true,
            (true, false) => false,
            (false, false) => self.rng.gen_bool(0.5),
        };

        if remove {
            let c = *removable
                .choose(&mut self.rng)
                .ok_or_else(|| unavailable(mutation, "no connection to remove"))?;
            self.disconnect(c.from, c.to)?;
            trace!(%c, "removed connection");
        } else {
            let (from, to) = *addable
                .choose(&mut self.rng)
                .ok_or_else(|| unavailable(mutation, "no connection to add"))?;
            let c = self.project_neuron(from, to, None)?;
            trace!(%c, "added connection");
        }
        Ok(())
    }

    /// Unconnected pairs `(a, b)` where `a` precedes `b` in enumeration
    /// order, `a` is not an output and `b` is not an input. Backward and
    /// self connections are never added implicitly.
    fn forward_gaps(&self) -> Vec<(NeuronId, NeuronId)> {
        let neurons = self.neurons();
        let mut gaps = Vec::new();
        for (i, &(from, from_layer)) in neurons.iter().enumerate() {
            if from_layer == LayerRef::Output {
                continue;
            }
            for &(to, to_layer) in &neurons[i + 1..] {
                if to_layer == LayerRef::Input {
                    continue;
                }
                if !self.graph.contains_connection(ConnectionId::new(from, to)) {
                    gaps.push((from, to));
                }
            }
        }
        gaps
    }
}
