//! Arena of neurons and connections plus the graph-walking algorithms.
//!
//! Connections refer to neurons by id and every neuron keeps ordered id sets
//! for its `inputs`, `projected` and `gated` connections. Ordered sets matter:
//! the flattening compiler emits instructions in exactly the iteration order
//! used here, which is what makes both execution modes agree bit for bit.

use hashbrown::HashMap;
use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{NetworkError, Result};
use crate::neuron::{Connection, ConnectionId, Neuron, NeuronId};
use crate::squash::Squash;

#[derive(Debug, Default)]
pub struct Graph {
    neurons: HashMap<NeuronId, Neuron>,
    connections: HashMap<ConnectionId, Connection>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_neuron(&mut self, squash: Squash, bias: f64) -> NeuronId {
        let neuron = Neuron::new(squash, bias);
        let id = neuron.id;
        self.neurons.insert(id, neuron);
        id
    }

    pub fn neuron_count(&self) -> usize {
        self.neurons.len()
    }

    /// Regular (non-self) connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains_neuron(&self, id: NeuronId) -> bool {
        self.neurons.contains_key(&id)
    }

    pub fn neuron(&self, id: NeuronId) -> Result<&Neuron> {
        self.neurons.get(&id).ok_or(NetworkError::UnknownNeuron(id))
    }

    pub fn neuron_mut(&mut self, id: NeuronId) -> Result<&mut Neuron> {
        self.neurons
            .get_mut(&id)
            .ok_or(NetworkError::UnknownNeuron(id))
    }

    /// Resolve a connection, including self-connections which live on the neuron.
    pub fn connection(&self, id: ConnectionId) -> Result<&Connection> {
        if id.is_self() {
            return Ok(&self.neuron(id.from)?.selfconnection);
        }
        self.connections
            .get(&id)
            .ok_or(NetworkError::UnknownConnection(id))
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection> {
        if id.is_self() {
            return Ok(&mut self.neuron_mut(id.from)?.selfconnection);
        }
        self.connections
            .get_mut(&id)
            .ok_or(NetworkError::UnknownConnection(id))
    }

    /// Regular connections, plus self-connections that are enabled.
    pub fn contains_connection(&self, id: ConnectionId) -> bool {
        if id.is_self() {
            return self
                .neurons
                .get(&id.from)
                .is_some_and(Neuron::is_selfconnected);
        }
        self.connections.contains_key(&id)
    }

    /// Regular connections in arbitrary order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub(crate) fn neurons_mut(&mut self) -> impl Iterator<Item = &mut Neuron> {
        self.neurons.values_mut()
    }

    pub(crate) fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    // ---------------------------------------------------------------------
    // Structural mutation
    // ---------------------------------------------------------------------

    /// Connect `from -> to`.
    ///
    /// An existing connection is returned as-is, with its weight overwritten
    /// only when `weight` is given. Projecting a neuron onto itself enables
    /// its self-connection (weight 1 unless given).
    pub fn project(
        &mut self,
        from: NeuronId,
        to: NeuronId,
        weight: Option<f64>,
        init: impl FnOnce() -> f64,
    ) -> Result<ConnectionId> {
        self.neuron(from)?;
        self.neuron(to)?;
        let id = ConnectionId::new(from, to);

        if id.is_self() {
            let neuron = self.neuron_mut(from)?;
            neuron.selfconnection.weight = weight.unwrap_or(1.0);
            neuron.selfconnected = true;
            return Ok(id);
        }

        if let Some(existing) = self.connections.get_mut(&id) {
            if let Some(w) = weight {
                existing.weight = w;
            }
            return Ok(id);
        }

        let w = weight.unwrap_or_else(init);
        self.connections.insert(id, Connection::new(from, to, w));
        self.neuron_mut(from)?.projected.insert(id);

        let target = self.neuron_mut(to)?;
        target.inputs.insert(id);
        target.trace.eligibility.insert(id, 0.0);
        for xtrace in target.trace.extended.values_mut() {
            xtrace.insert(id, 0.0);
        }
        trace!(%id, weight = w, "projected connection");
        Ok(id)
    }

    /// Let `gater` drive the gain of `connection`.
    pub fn gate(&mut self, gater: NeuronId, connection: ConnectionId) -> Result<()> {
        self.neuron(gater)?;
        if !self.contains_connection(connection) {
            return Err(NetworkError::UnknownConnection(connection));
        }
        let previous = self.connection(connection)?.gater;
        match previous {
            Some(g) if g == gater => return Ok(()),
            Some(_) => self.ungate(connection)?,
            None => {}
        }

        self.connection_mut(connection)?.gater = Some(gater);
        let gated = connection.to;
        let neuron = self.neuron_mut(gater)?;
        neuron.gated.insert(connection);
        if !neuron.trace.extended.contains_key(&gated) {
            let xtrace: BTreeMap<ConnectionId, f64> =
                neuron.inputs.iter().map(|&c| (c, 0.0)).collect();
            neuron.trace.extended.insert(gated, xtrace);
            neuron.trace.influences.insert(gated, 0.0);
        }
        trace!(gater, %connection, "gated connection");
        Ok(())
    }

    /// Remove the gater of `connection`, if any, and restore its gain to 1.
    pub fn ungate(&mut self, connection: ConnectionId) -> Result<()> {
        let conn = self.connection_mut(connection)?;
        let Some(gater) = conn.gater.take() else {
            return Ok(());
        };
        conn.gain = 1.0;

        let neuron = self.neuron_mut(gater)?;
        neuron.gated.remove(&connection);
        let still_gating = neuron.gated.iter().any(|c| c.to == connection.to);
        if !still_gating {
            neuron.trace.extended.remove(&connection.to);
            neuron.trace.influences.remove(&connection.to);
        }
        Ok(())
    }

    /// Remove `from -> to` from both endpoints. Disconnecting a neuron from
    /// itself disables the self-connection.
    pub fn disconnect(&mut self, from: NeuronId, to: NeuronId) -> Result<()> {
        let id = ConnectionId::new(from, to);
        if !self.contains_connection(id) {
            return Err(NetworkError::NotConnected { from, to });
        }
        if id.is_self() {
            self.ungate(id)?;
            let neuron = self.neuron_mut(from)?;
            neuron.selfconnection.weight = 0.0;
            neuron.selfconnected = false;
            trace!(%id, "disabled self-connection");
            return Ok(());
        }

        self.ungate(id)?;
        self.connections.remove(&id);
        if let Some(source) = self.neurons.get_mut(&from) {
            source.projected.remove(&id);
        }
        if let Some(target) = self.neurons.get_mut(&to) {
            target.inputs.remove(&id);
            target.trace.eligibility.remove(&id);
            for xtrace in target.trace.extended.values_mut() {
                xtrace.remove(&id);
            }
        }
        trace!(%id, "disconnected");
        Ok(())
    }

    /// Drop a neuron along with every connection touching it and every gate it holds.
    pub fn remove_neuron(&mut self, id: NeuronId) -> Result<Neuron> {
        let neuron = self.neuron(id)?;
        let inputs: Vec<ConnectionId> = neuron.inputs.iter().copied().collect();
        let projected: Vec<ConnectionId> = neuron.projected.iter().copied().collect();
        let gated: Vec<ConnectionId> = neuron.gated.iter().copied().collect();

        for c in inputs.into_iter().chain(projected) {
            self.disconnect(c.from, c.to)?;
        }
        for c in gated {
            self.ungate(c)?;
        }
        self.ungate(ConnectionId::new(id, id))?;

        self.neurons
            .remove(&id)
            .ok_or(NetworkError::UnknownNeuron(id))
    }

    // ---------------------------------------------------------------------
    // Forward pass
    // ---------------------------------------------------------------------

    /// Clamp an input neuron to an external value.
    pub fn activate_input(&mut self, id: NeuronId, value: f64) -> Result<f64> {
        let neuron = self.neuron_mut(id)?;
        neuron.activation = value;
        neuron.derivative = 0.0;
        for e in neuron.trace.eligibility.values_mut() {
            *e = 0.0;
        }
        self.update_gains(id, value)?;
        Ok(value)
    }

    /// Recompute state, activation and traces of a non-input neuron.
    pub fn activate(&mut self, id: NeuronId) -> Result<f64> {
        // State and activation first; traces below read the fresh values.
        let neuron = self.neuron(id)?;
        let old = neuron.state;
        let self_conn = &neuron.selfconnection;
        let mut state = self_conn.gain * self_conn.weight * old + neuron.bias;
        for &c in &neuron.inputs {
            let conn = self.connection(c)?;
            state += self.neuron(conn.from)?.activation * conn.weight * conn.gain;
        }
        let (activation, derivative) = neuron.squash.eval(state);

        let neuron = self.neuron_mut(id)?;
        neuron.old = old;
        neuron.state = state;
        neuron.activation = activation;
        neuron.derivative = derivative;

        let influences = self.influences(id)?;

        let neuron = self.neuron(id)?;
        let self_conn = &neuron.selfconnection;
        let mut eligibility = Vec::with_capacity(neuron.inputs.len());
        let mut extended = Vec::with_capacity(neuron.inputs.len() * influences.len());
        for &c in &neuron.inputs {
            let conn = self.connection(c)?;
            let from = self.neuron(conn.from)?;
            let e = trace_value(&neuron.trace.eligibility, c);
            let e = self_conn.gain * self_conn.weight * e + conn.gain * from.activation;
            eligibility.push((c, e));

            for &(k, influence) in &influences {
                let gated = &self.neuron(k)?.selfconnection;
                let x = neuron
                    .trace
                    .extended
                    .get(&k)
                    .map_or(0.0, |xtrace| trace_value(xtrace, c));
                let x = gated.gain * gated.weight * x + derivative * e * influence;
                extended.push((k, c, x));
            }
        }

        let neuron = self.neuron_mut(id)?;
        for (c, e) in eligibility {
            neuron.trace.eligibility.insert(c, e);
        }
        for (k, c, x) in extended {
            neuron.trace.extended.entry(k).or_default().insert(c, x);
        }
        for (k, influence) in influences {
            neuron.trace.influences.insert(k, influence);
        }

        self.update_gains(id, activation)?;
        Ok(activation)
    }

    /// `ds_k / d(gain)` for every neuron `k` this neuron gates into.
    ///
    /// A gated self-connection contributes `w_kk * old_k`; every other gated
    /// connection into `k` contributes `w * from.activation`. Only exact for
    /// step `t` once `k` itself has fired, which `propagate` relies on.
    fn influences(&self, id: NeuronId) -> Result<Vec<(NeuronId, f64)>> {
        let neuron = self.neuron(id)?;
        let mut out = Vec::with_capacity(neuron.trace.extended.len());
        for &k in neuron.trace.extended.keys() {
            let gated = self.neuron(k)?;
            let mut influence = if gated.selfconnection.gater == Some(id) {
                gated.selfconnection.weight * gated.old
            } else {
                0.0
            };
            for &c in neuron.gated.iter().filter(|c| c.to == k && !c.is_self()) {
                let conn = self.connection(c)?;
                influence += conn.weight * self.neuron(conn.from)?.activation;
            }
            out.push((k, influence));
        }
        Ok(out)
    }

    fn update_gains(&mut self, id: NeuronId, activation: f64) -> Result<()> {
        let gated: Vec<ConnectionId> = self.neuron(id)?.gated.iter().copied().collect();
        for c in gated {
            self.connection_mut(c)?.gain = activation;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Backward pass
    // ---------------------------------------------------------------------

    /// Compute error responsibilities and adjust incoming weights and bias.
    ///
    /// `target` marks an output neuron. Every neuron downstream (and every
    /// neuron this one gates) must already have been propagated this step.
    pub fn propagate(&mut self, id: NeuronId, rate: f64, target: Option<f64>) -> Result<()> {
        let neuron = self.neuron(id)?;
        let mut terms = neuron.error;
        match target {
            Some(t) => {
                terms.responsibility = t - neuron.activation;
                terms.projected = terms.responsibility;
            }
            None => {
                let mut error = 0.0;
                for &c in &neuron.projected {
                    let conn = self.connection(c)?;
                    let to = self.neuron(conn.to)?;
                    error += to.error.responsibility * conn.gain * conn.weight;
                }
                terms.projected = neuron.derivative * error;

                let influences = self.influences(id)?;
                let mut error = 0.0;
                for &(k, influence) in &influences {
                    error += self.neuron(k)?.error.responsibility * influence;
                }
                let neuron = self.neuron_mut(id)?;
                for (k, influence) in influences {
                    neuron.trace.influences.insert(k, influence);
                }
                terms.gated = neuron.derivative * error;
                terms.responsibility = terms.projected + terms.gated;
            }
        }
        self.neuron_mut(id)?.error = terms;

        let neuron = self.neuron(id)?;
        let mut updates = Vec::with_capacity(neuron.inputs.len());
        for &c in &neuron.inputs {
            let mut gradient = terms.projected * trace_value(&neuron.trace.eligibility, c);
            for (&k, xtrace) in &neuron.trace.extended {
                gradient += self.neuron(k)?.error.responsibility * trace_value(xtrace, c);
            }
            updates.push((c, gradient));
        }
        for (c, gradient) in updates {
            self.connection_mut(c)?.weight += rate * gradient;
        }
        self.neuron_mut(id)?.bias += rate * terms.responsibility;
        Ok(())
    }
}

#[inline]
fn trace_value(map: &BTreeMap<ConnectionId, f64>, c: ConnectionId) -> f64 {
    map.get(&c).copied().unwrap_or(0.0)
}
