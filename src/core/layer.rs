#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use rand::Rng;

use crate::error::{NetworkError, Result};
use crate::graph::Graph;
use crate::network::sample;
use crate::neuron::{ConnectionId, NeuronId};
use crate::squash::Squash;

/// Position of a layer inside a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LayerRef {
    Input,
    Hidden(usize),
    Output,
}

/// How two layers are wired by `project`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Every source neuron to every target neuron.
    AllToAll,
    /// Source `i` to target `i`; layers must be the same size.
    OneToOne,
    /// Like `AllToAll` but skipping a neuron's connection to itself.
    AllToElse,
}

/// How a gater layer is matched against a [`LayerConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// Gater `i` gates the connections entering target neuron `i`.
    Input,
    /// Gater `i` gates the connections leaving source neuron `i`.
    Output,
    /// Gater `i` gates the `i`-th connection of the projection.
    OneToOne,
}

/// Record of a layer-to-layer projection.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConnection {
    pub from: LayerRef,
    pub to: LayerRef,
    pub kind: ConnectionKind,
    pub connections: Vec<ConnectionId>,
}

impl LayerConnection {
    pub fn size(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains(id)
    }
}

/// Ordered group of neurons. Pure grouping: all state lives in the graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layer {
    neurons: Vec<NeuronId>,
    connected_to: Vec<LayerRef>,
}

impl Layer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_neurons(graph: &mut Graph, size: usize, squash: Squash, bias: f64) -> Self {
        let neurons = (0..size).map(|_| graph.add_neuron(squash, bias)).collect();
        Self {
            neurons,
            connected_to: Vec::new(),
        }
    }

    pub fn neurons(&self) -> &[NeuronId] {
        &self.neurons
    }

    pub fn size(&self) -> usize {
        self.neurons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neurons.is_empty()
    }

    pub fn contains(&self, id: NeuronId) -> bool {
        self.neurons.contains(&id)
    }

    /// Layers this one has projected onto.
    pub fn connected_to(&self) -> &[LayerRef] {
        &self.connected_to
    }

    pub(crate) fn add(&mut self, id: NeuronId) {
        self.neurons.push(id);
    }

    pub(crate) fn remove(&mut self, id: NeuronId) -> bool {
        match self.neurons.iter().position(|&n| n == id) {
            Some(pos) => {
                self.neurons.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn note_projection(&mut self, to: LayerRef) {
        if !self.connected_to.contains(&to) {
            self.connected_to.push(to);
        }
    }

    /// Forward pass over the layer. With `input`, neurons are clamped.
    pub fn activate(&self, graph: &mut Graph, input: Option<&[f64]>) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.neurons.len());
        match input {
            Some(values) => {
                if values.len() != self.neurons.len() {
                    return Err(NetworkError::InputSize {
                        expected: self.neurons.len(),
                        actual: values.len(),
                    });
                }
                for (&id, &x) in self.neurons.iter().zip(values) {
                    out.push(graph.activate_input(id, x)?);
                }
            }
            None => {
                for &id in &self.neurons {
                    out.push(graph.activate(id)?);
                }
            }
        }
        Ok(out)
    }

    /// Backward pass. Neurons are visited last to first, with `target`
    /// marking an output layer.
    pub fn propagate(&self, graph: &mut Graph, rate: f64, target: Option<&[f64]>) -> Result<()> {
        if let Some(values) = target {
            if values.len() != self.neurons.len() {
                return Err(NetworkError::TargetSize {
                    expected: self.neurons.len(),
                    actual: values.len(),
                });
            }
        }
        for (i, &id) in self.neurons.iter().enumerate().rev() {
            graph.propagate(id, rate, target.map(|t| t[i]))?;
        }
        Ok(())
    }

    /// Wire this layer onto `target` neurons.
    pub(crate) fn project_onto(
        &self,
        graph: &mut Graph,
        target: &[NeuronId],
        kind: ConnectionKind,
        weight: Option<f64>,
        mut init: impl FnMut() -> f64,
    ) -> Result<Vec<ConnectionId>> {
        let mut connections = Vec::new();
        match kind {
            ConnectionKind::OneToOne => {
                if target.len() != self.neurons.len() {
                    return Err(NetworkError::LayerSizeMismatch {
                        expected: self.neurons.len(),
                        actual: target.len(),
                    });
                }
                for (&from, &to) in self.neurons.iter().zip(target) {
                    connections.push(graph.project(from, to, weight, &mut init)?);
                }
            }
            ConnectionKind::AllToAll | ConnectionKind::AllToElse => {
                for &from in &self.neurons {
                    for &to in target {
                        if kind == ConnectionKind::AllToElse && from == to {
                            continue;
                        }
                        connections.push(graph.project(from, to, weight, &mut init)?);
                    }
                }
            }
        }
        Ok(connections)
    }

    /// Is any neuron of this layer connected to any of `other`?
    pub fn is_connected(&self, graph: &Graph, other: &[NeuronId]) -> bool {
        self.neurons.iter().any(|&from| {
            other
                .iter()
                .any(|&to| graph.contains_connection(ConnectionId::new(from, to)))
        })
    }

    pub fn set_squash(&self, graph: &mut Graph, squash: Squash) -> Result<()> {
        for &id in &self.neurons {
            graph.neuron_mut(id)?.squash = squash;
        }
        Ok(())
    }

    pub fn set_bias(&self, graph: &mut Graph, bias: f64) -> Result<()> {
        for &id in &self.neurons {
            graph.neuron_mut(id)?.bias = bias;
        }
        Ok(())
    }

    pub fn clear(&self, graph: &mut Graph) -> Result<()> {
        for &id in &self.neurons {
            graph.neuron_mut(id)?.clear();
        }
        Ok(())
    }

    /// Clear, then redraw every bias and every incoming weight uniformly
    /// from the given ranges.
    pub fn reset<R: Rng + ?Sized>(
        &self,
        graph: &mut Graph,
        rng: &mut R,
        weight_init: (f64, f64),
        bias_init: (f64, f64),
    ) -> Result<()> {
        self.clear(graph)?;
        for &id in &self.neurons {
            let neuron = graph.neuron_mut(id)?;
            neuron.bias = sample(rng, bias_init);
            let inputs: Vec<ConnectionId> = neuron.inputs.iter().copied().collect();
            for c in inputs {
                graph.connection_mut(c)?.weight = sample(rng, weight_init);
            }
        }
        Ok(())
    }
}
