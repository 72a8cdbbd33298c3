use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::compiler;
use crate::error::{NetworkError, Result};
use crate::flat::FlatProgram;
use crate::graph::Graph;
use crate::layer::{ConnectionKind, GateKind, Layer, LayerConnection, LayerRef};
use crate::neuron::{Connection, ConnectionId, Neuron, NeuronId};
use crate::squash::Squash;

/// Which engine runs `activate`/`propagate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionMode {
    /// Compile on first use and run the flat program until the next
    /// structural edit (default).
    #[default]
    Flat,
    /// Always walk the object graph.
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkConfig {
    // If set, makes weight init and mutation choices reproducible.
    pub seed: Option<u64>,

    /// Uniform range `[lo, hi)` for fresh connection weights.
    pub weight_init: (f64, f64),

    /// Uniform range `[lo, hi)` for fresh biases.
    pub bias_init: (f64, f64),

    /// Activation of newly created neurons.
    pub squash: Squash,

    pub mode: ExecutionMode,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            seed: None,
            weight_init: (-0.1, 0.1),
            bias_init: (-0.1, 0.1),
            squash: Squash::Logistic,
            mode: ExecutionMode::Flat,
        }
    }
}

impl NetworkConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_squash(mut self, squash: Squash) -> Self {
        self.squash = squash;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_weight_init(mut self, lo: f64, hi: f64) -> Self {
        self.weight_init = (lo, hi);
        self
    }

    pub fn with_bias_init(mut self, lo: f64, hi: f64) -> Self {
        self.bias_init = (lo, hi);
        self
    }

    /// Validate the configuration, returning an error message if invalid.
    pub fn validate(&self) -> core::result::Result<(), &'static str> {
        let (lo, hi) = self.weight_init;
        if !lo.is_finite() || !hi.is_finite() || lo > hi {
            return Err("weight_init must be a finite range with lo <= hi");
        }
        let (lo, hi) = self.bias_init;
        if !lo.is_finite() || !hi.is_finite() || lo > hi {
            return Err("bias_init must be a finite range with lo <= hi");
        }
        Ok(())
    }
}

/// Uniform sample from `[lo, hi)`, or `lo` for an empty range.
pub(crate) fn sample<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (f64, f64)) -> f64 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

/// Input layer, ordered hidden layers and output layer over one neuron arena.
///
/// While a flat program is held, it is the authoritative copy of every
/// numeric value; the graph fields are stale until [`Network::restore`].
/// Every structural edit restores and drops the program first, and so does
/// graph-mode execution.
///
/// Not `Clone`: a copy must carry fresh neuron ids, see `Network::try_clone`.
#[derive(Debug)]
pub struct Network {
    pub(crate) cfg: NetworkConfig,
    pub(crate) graph: Graph,
    pub(crate) input: Layer,
    pub(crate) hidden: Vec<Layer>,
    pub(crate) output: Layer,
    pub(crate) program: Option<FlatProgram>,
    pub(crate) rng: StdRng,
}

impl Network {
    /// Unconnected network with the given layer sizes.
    pub fn new(input: usize, hidden: &[usize], output: usize, cfg: NetworkConfig) -> Result<Self> {
        let mut net = Self::empty(cfg)?;
        net.input = Layer::with_neurons(&mut net.graph, input, cfg.squash, 0.0);
        for &size in hidden {
            let layer = net.fresh_layer(size);
            net.hidden.push(layer);
        }
        net.output = net.fresh_layer(output);
        Ok(net)
    }

    /// Layered perceptron: `new` followed by [`Network::connect`].
    pub fn perceptron(input: usize, hidden: &[usize], output: usize, cfg: NetworkConfig) -> Result<Self> {
        let mut net = Self::new(input, hidden, output, cfg)?;
        net.connect()?;
        Ok(net)
    }

    pub(crate) fn empty(cfg: NetworkConfig) -> Result<Self> {
        cfg.validate().map_err(NetworkError::InvalidConfig)?;
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            cfg,
            graph: Graph::new(),
            input: Layer::new(),
            hidden: Vec::new(),
            output: Layer::new(),
            program: None,
            rng,
        })
    }

    fn fresh_layer(&mut self, size: usize) -> Layer {
        let mut layer = Layer::new();
        for _ in 0..size {
            let bias = sample(&mut self.rng, self.cfg.bias_init);
            layer.add(self.graph.add_neuron(self.cfg.squash, bias));
        }
        layer
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.cfg
    }

    pub fn input_size(&self) -> usize {
        self.input.size()
    }

    pub fn output_size(&self) -> usize {
        self.output.size()
    }

    pub fn hidden_count(&self) -> usize {
        self.hidden.len()
    }

    pub fn layer(&self, layer: LayerRef) -> Result<&Layer> {
        match layer {
            LayerRef::Input => Ok(&self.input),
            LayerRef::Output => Ok(&self.output),
            LayerRef::Hidden(i) => self.hidden.get(i).ok_or(NetworkError::UnknownLayer(layer)),
        }
    }

    pub(crate) fn layer_mut(&mut self, layer: LayerRef) -> Result<&mut Layer> {
        match layer {
            LayerRef::Input => Ok(&mut self.input),
            LayerRef::Output => Ok(&mut self.output),
            LayerRef::Hidden(i) => self
                .hidden
                .get_mut(i)
                .ok_or(NetworkError::UnknownLayer(layer)),
        }
    }

    /// Layer holding `id`, if any.
    pub fn layer_of(&self, id: NeuronId) -> Option<LayerRef> {
        if self.input.contains(id) {
            return Some(LayerRef::Input);
        }
        if let Some(i) = self.hidden.iter().position(|l| l.contains(id)) {
            return Some(LayerRef::Hidden(i));
        }
        self.output.contains(id).then_some(LayerRef::Output)
    }

    /// All neurons input → hidden → output with their layer.
    pub fn neurons(&self) -> Vec<(NeuronId, LayerRef)> {
        let mut out = Vec::with_capacity(self.graph.neuron_count());
        out.extend(self.input.neurons().iter().map(|&id| (id, LayerRef::Input)));
        for (i, layer) in self.hidden.iter().enumerate() {
            out.extend(layer.neurons().iter().map(|&id| (id, LayerRef::Hidden(i))));
        }
        out.extend(self.output.neurons().iter().map(|&id| (id, LayerRef::Output)));
        out
    }

    /// Every regular connection plus every enabled self-connection, in
    /// neuron enumeration order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut out = Vec::with_capacity(self.graph.connection_count());
        for (id, _) in self.neurons() {
            if let Ok(neuron) = self.graph.neuron(id) {
                out.extend(neuron.projected.iter().copied());
                if neuron.is_selfconnected() {
                    out.push(neuron.selfconnection.id());
                }
            }
        }
        out
    }

    /// Graph view of a neuron. Stale while a flat program is active.
    pub fn neuron(&self, id: NeuronId) -> Result<&Neuron> {
        self.graph.neuron(id)
    }

    /// Graph view of a connection. Stale while a flat program is active.
    pub fn connection(&self, id: ConnectionId) -> Result<&Connection> {
        self.graph.connection(id)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    pub fn mode(&self) -> ExecutionMode {
        self.cfg.mode
    }

    pub fn is_compiled(&self) -> bool {
        self.program.is_some()
    }

    pub fn program(&self) -> Option<&FlatProgram> {
        self.program.as_ref()
    }

    /// Toggle lazily compiled flat execution. Always restores first.
    pub fn set_optimize(&mut self, enabled: bool) -> Result<()> {
        self.restore()?;
        self.cfg.mode = if enabled {
            ExecutionMode::Flat
        } else {
            ExecutionMode::Graph
        };
        Ok(())
    }

    /// Compile the network into a fresh flat program, replacing any previous one.
    ///
    /// In graph mode the program is only held until the next `activate` or
    /// `propagate`, which restore it before walking the graph.
    pub fn optimize(&mut self) -> Result<&FlatProgram> {
        self.restore()?;
        let program = compiler::compile(&self.graph, &self.input, &self.hidden, &self.output)?;
        Ok(self.program.insert(program))
    }

    /// Write the flat program's memory back into the graph and drop it.
    /// A no-op when nothing is compiled.
    pub fn restore(&mut self) -> Result<()> {
        if let Some(program) = self.program.take() {
            if let Err(e) = program.restore_into(&mut self.graph) {
                self.program = Some(program);
                return Err(e);
            }
        }
        Ok(())
    }

    /// The active flat program, compiling one if none is held.
    fn compiled(&mut self) -> Result<&mut FlatProgram> {
        let program = match self.program.take() {
            Some(program) => program,
            None => compiler::compile(&self.graph, &self.input, &self.hidden, &self.output)?,
        };
        Ok(self.program.insert(program))
    }

    /// Restore-then-invalidate before any structural edit.
    fn invalidate(&mut self) -> Result<()> {
        if self.program.is_some() {
            debug!("structural edit: invalidating flat program");
        }
        self.restore()
    }

    /// Feed `input` forward and return the output layer's activations.
    pub fn activate(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        if input.len() != self.input.size() {
            return Err(NetworkError::InputSize {
                expected: self.input.size(),
                actual: input.len(),
            });
        }
        match self.cfg.mode {
            ExecutionMode::Graph => {
                self.restore()?;
                self.input.activate(&mut self.graph, Some(input))?;
                for layer in &self.hidden {
                    layer.activate(&mut self.graph, None)?;
                }
                self.output.activate(&mut self.graph, None)
            }
            ExecutionMode::Flat => self.compiled()?.activate(input),
        }
    }

    /// Backpropagate `target` through the network with learning `rate`,
    /// output layer first, then hidden layers last to first.
    pub fn propagate(&mut self, rate: f64, target: &[f64]) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(NetworkError::InvalidRate(rate));
        }
        if target.len() != self.output.size() {
            return Err(NetworkError::TargetSize {
                expected: self.output.size(),
                actual: target.len(),
            });
        }
        match self.cfg.mode {
            ExecutionMode::Graph => {
                self.restore()?;
                self.output.propagate(&mut self.graph, rate, Some(target))?;
                for layer in self.hidden.iter().rev() {
                    layer.propagate(&mut self.graph, rate, None)?;
                }
                Ok(())
            }
            ExecutionMode::Flat => self.compiled()?.propagate(rate, target),
        }
    }

    /// Forget traces and running state; weights and biases are kept.
    pub fn clear(&mut self) -> Result<()> {
        self.restore()?;
        for neuron in self.graph.neurons_mut() {
            neuron.clear();
            if neuron.selfconnection.gater.is_some() {
                neuron.selfconnection.gain = 1.0;
            }
        }
        for conn in self.graph.connections_mut() {
            if conn.gater.is_some() {
                conn.gain = 1.0;
            }
        }
        Ok(())
    }

    /// Clear, then draw fresh weights and biases from the configured ranges.
    pub fn reset(&mut self) -> Result<()> {
        self.clear()?;
        let Self {
            graph,
            rng,
            cfg,
            input,
            hidden,
            output,
            ..
        } = self;
        for layer in core::iter::once(&*input).chain(hidden.iter()).chain(core::iter::once(&*output)) {
            layer.reset(graph, rng, cfg.weight_init, cfg.bias_init)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Structural mutation
    // ---------------------------------------------------------------------

    /// Project layer `from` onto layer `to`.
    ///
    /// `kind` defaults to `OneToOne` for a layer projecting onto itself and
    /// `AllToAll` otherwise. `weight` defaults to a random draw per connection.
    pub fn project(
        &mut self,
        from: LayerRef,
        to: LayerRef,
        kind: Option<ConnectionKind>,
        weight: Option<f64>,
    ) -> Result<LayerConnection> {
        self.layer(from)?;
        let target = self.layer(to)?.neurons().to_vec();
        self.invalidate()?;

        let kind = kind.unwrap_or(if from == to {
            ConnectionKind::OneToOne
        } else {
            ConnectionKind::AllToAll
        });
        let Self {
            graph,
            rng,
            cfg,
            input,
            hidden,
            output,
            ..
        } = self;
        let source = match from {
            LayerRef::Input => &*input,
            LayerRef::Output => &*output,
            LayerRef::Hidden(i) => hidden.get(i).ok_or(NetworkError::UnknownLayer(from))?,
        };
        let connections =
            source.project_onto(graph, &target, kind, weight, || sample(rng, cfg.weight_init))?;

        self.layer_mut(from)?.note_projection(to);
        trace!(?from, ?to, ?kind, count = connections.len(), "projected layer");
        Ok(LayerConnection {
            from,
            to,
            kind,
            connections,
        })
    }

    /// Connect two neurons directly. `weight` defaults to a random draw
    /// (1.0 for a self-connection).
    pub fn project_neuron(&mut self, from: NeuronId, to: NeuronId, weight: Option<f64>) -> Result<ConnectionId> {
        self.graph.neuron(from)?;
        self.graph.neuron(to)?;
        self.invalidate()?;
        let Self { graph, rng, cfg, .. } = self;
        graph.project(from, to, weight, || sample(rng, cfg.weight_init))
    }

    /// Let the neurons of `gater` gate the connections of a layer projection.
    pub fn gate(&mut self, gater: LayerRef, connection: &LayerConnection, kind: GateKind) -> Result<()> {
        let gaters = self.layer(gater)?.neurons().to_vec();

        let mut pairs: Vec<(NeuronId, ConnectionId)> = Vec::new();
        match kind {
            GateKind::Input => {
                let to = self.layer(connection.to)?.neurons();
                if to.len() != gaters.len() {
                    return Err(NetworkError::LayerSizeMismatch {
                        expected: to.len(),
                        actual: gaters.len(),
                    });
                }
                for (&neuron, &g) in to.iter().zip(&gaters) {
                    for &c in &self.graph.neuron(neuron)?.inputs {
                        if connection.contains(&c) {
                            pairs.push((g, c));
                        }
                    }
                }
            }
            GateKind::Output => {
                let from = self.layer(connection.from)?.neurons();
                if from.len() != gaters.len() {
                    return Err(NetworkError::LayerSizeMismatch {
                        expected: from.len(),
                        actual: gaters.len(),
                    });
                }
                for (&neuron, &g) in from.iter().zip(&gaters) {
                    let source = self.graph.neuron(neuron)?;
                    let self_id = source.selfconnection.id();
                    for &c in source.projected.iter().chain(core::iter::once(&self_id)) {
                        if connection.contains(&c) {
                            pairs.push((g, c));
                        }
                    }
                }
            }
            GateKind::OneToOne => {
                if connection.size() != gaters.len() {
                    return Err(NetworkError::LayerSizeMismatch {
                        expected: connection.size(),
                        actual: gaters.len(),
                    });
                }
                pairs.extend(gaters.iter().copied().zip(connection.connections.iter().copied()));
            }
        }
        for &(_, c) in &pairs {
            if !self.graph.contains_connection(c) {
                return Err(NetworkError::UnknownConnection(c));
            }
        }

        self.invalidate()?;
        for (g, c) in pairs {
            self.graph.gate(g, c)?;
        }
        Ok(())
    }

    /// Let one neuron gate one existing connection.
    pub fn gate_connection(&mut self, gater: NeuronId, connection: ConnectionId) -> Result<()> {
        self.graph.neuron(gater)?;
        if !self.graph.contains_connection(connection) {
            return Err(NetworkError::UnknownConnection(connection));
        }
        self.invalidate()?;
        self.graph.gate(gater, connection)
    }

    /// Remove the connection `from -> to`.
    pub fn disconnect(&mut self, from: NeuronId, to: NeuronId) -> Result<()> {
        if !self.graph.contains_connection(ConnectionId::new(from, to)) {
            return Err(NetworkError::NotConnected { from, to });
        }
        self.invalidate()?;
        self.graph.disconnect(from, to)
    }

    /// Connect input → hidden… → output all-to-all.
    pub fn connect(&mut self) -> Result<()> {
        let mut chain = vec![LayerRef::Input];
        chain.extend((0..self.hidden.len()).map(LayerRef::Hidden));
        chain.push(LayerRef::Output);
        for pair in chain.windows(2) {
            self.project(pair[0], pair[1], Some(ConnectionKind::AllToAll), None)?;
        }
        Ok(())
    }

    /// Break every connection (and self-connection) in the network.
    pub fn disconnect_all(&mut self) -> Result<()> {
        self.invalidate()?;
        for c in self.connections() {
            self.graph.disconnect(c.from, c.to)?;
        }
        Ok(())
    }

    /// Append an unconnected hidden layer.
    pub fn add_hidden_layer(&mut self, size: usize) -> Result<LayerRef> {
        self.invalidate()?;
        let layer = self.fresh_layer(size);
        self.hidden.push(layer);
        Ok(LayerRef::Hidden(self.hidden.len() - 1))
    }

    /// Append an unconnected neuron to `layer`.
    pub fn add_neuron(&mut self, layer: LayerRef) -> Result<NeuronId> {
        self.layer(layer)?;
        self.invalidate()?;
        let bias = sample(&mut self.rng, self.cfg.bias_init);
        let id = self.graph.add_neuron(self.cfg.squash, bias);
        self.layer_mut(layer)?.add(id);
        Ok(id)
    }

    /// Remove a neuron and every connection and gate touching it.
    pub fn remove_neuron(&mut self, id: NeuronId) -> Result<()> {
        let layer = self.layer_of(id).ok_or(NetworkError::UnknownNeuron(id))?;
        self.invalidate()?;
        self.graph.remove_neuron(id)?;
        self.layer_mut(layer)?.remove(id);
        Ok(())
    }

    pub fn set_bias(&mut self, id: NeuronId, bias: f64) -> Result<()> {
        self.graph.neuron(id)?;
        self.invalidate()?;
        self.graph.neuron_mut(id)?.bias = bias;
        Ok(())
    }

    pub fn set_squash(&mut self, id: NeuronId, squash: Squash) -> Result<()> {
        self.graph.neuron(id)?;
        self.invalidate()?;
        self.graph.neuron_mut(id)?.squash = squash;
        Ok(())
    }

    pub fn set_weight(&mut self, id: ConnectionId, weight: f64) -> Result<()> {
        if !self.graph.contains_connection(id) {
            return Err(NetworkError::UnknownConnection(id));
        }
        self.invalidate()?;
        self.graph.connection_mut(id)?.weight = weight;
        Ok(())
    }

    pub fn set_layer_squash(&mut self, layer: LayerRef, squash: Squash) -> Result<()> {
        self.layer(layer)?;
        self.invalidate()?;
        let Self {
            graph,
            input,
            hidden,
            output,
            ..
        } = self;
        let target = match layer {
            LayerRef::Input => &*input,
            LayerRef::Output => &*output,
            LayerRef::Hidden(i) => hidden.get(i).ok_or(NetworkError::UnknownLayer(layer))?,
        };
        target.set_squash(graph, squash)
    }

    pub fn set_layer_bias(&mut self, layer: LayerRef, bias: f64) -> Result<()> {
        self.layer(layer)?;
        self.invalidate()?;
        let Self {
            graph,
            input,
            hidden,
            output,
            ..
        } = self;
        let target = match layer {
            LayerRef::Input => &*input,
            LayerRef::Output => &*output,
            LayerRef::Hidden(i) => hidden.get(i).ok_or(NetworkError::UnknownLayer(layer))?,
        };
        target.set_bias(graph, bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn graph_cfg(seed: u64) -> NetworkConfig {
        NetworkConfig::default()
            .with_seed(seed)
            .with_mode(ExecutionMode::Graph)
    }

    fn flat_cfg(seed: u64) -> NetworkConfig {
        NetworkConfig::default().with_seed(seed)
    }

    /// Two structurally identical networks built from the same seed.
    fn twins(build: impl Fn(NetworkConfig) -> Network, seed: u64) -> (Network, Network) {
        (build(graph_cfg(seed)), build(flat_cfg(seed)))
    }

    fn assert_close(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() <= tol, "{x} != {y}");
        }
    }

    fn perceptron(cfg: NetworkConfig) -> Network {
        Network::perceptron(3, &[4, 3], 2, cfg).unwrap()
    }

    /// Recurrent hidden layer with self-connections and lateral links.
    fn recurrent(cfg: NetworkConfig) -> Network {
        let mut net = Network::new(2, &[3], 2, cfg.with_squash(Squash::Tanh)).unwrap();
        net.connect().unwrap();
        let h = LayerRef::Hidden(0);
        net.project(h, h, Some(ConnectionKind::OneToOne), Some(0.6)).unwrap();
        net.project(h, h, Some(ConnectionKind::AllToElse), None).unwrap();
        net
    }

    /// LSTM-style block: gates driving input, forget (self) and output connections.
    fn memory_block(cfg: NetworkConfig) -> Network {
        let mut net = Network::new(2, &[2, 2, 2, 2], 1, cfg).unwrap();
        let (input_gate, forget_gate, cell, output_gate) = (
            LayerRef::Hidden(0),
            LayerRef::Hidden(1),
            LayerRef::Hidden(2),
            LayerRef::Hidden(3),
        );
        net.set_layer_squash(cell, Squash::Tanh).unwrap();
        for gate in [input_gate, forget_gate, output_gate] {
            net.project(LayerRef::Input, gate, None, None).unwrap();
        }
        let feed = net.project(LayerRef::Input, cell, None, None).unwrap();
        let memory = net.project(cell, cell, None, None).unwrap();
        let out = net.project(cell, LayerRef::Output, None, None).unwrap();
        net.project(cell, input_gate, None, None).unwrap();
        net.project(cell, forget_gate, None, None).unwrap();

        net.gate(input_gate, &feed, GateKind::Input).unwrap();
        net.gate(forget_gate, &memory, GateKind::OneToOne).unwrap();
        net.gate(output_gate, &out, GateKind::Output).unwrap();
        net
    }

    fn inputs(step: usize, n: usize) -> Vec<f64> {
        (0..n).map(|i| (((step * 7 + i * 3) % 11) as f64) / 10.0 - 0.5).collect()
    }

    fn run_equivalence(build: impl Fn(NetworkConfig) -> Network, seed: u64) {
        let (mut graph, mut flat) = twins(build, seed);
        let n_in = graph.input_size();
        let n_out = graph.output_size();
        for step in 0..25 {
            let x = inputs(step, n_in);
            let target: Vec<f64> = inputs(step + 3, n_out).iter().map(|v| v + 0.5).collect();
            let a = graph.activate(&x).unwrap();
            let b = flat.activate(&x).unwrap();
            assert_close(&a, &b, EPS);
            graph.propagate(0.3, &target).unwrap();
            flat.propagate(0.3, &target).unwrap();
        }
        assert!(flat.is_compiled());
        flat.restore().unwrap();
        for ((id, _), (other, _)) in graph.neurons().into_iter().zip(flat.neurons()) {
            let g = graph.neuron(id).unwrap();
            let f = flat.neuron(other).unwrap();
            assert!((g.bias - f.bias).abs() <= EPS);
            assert!((g.activation - f.activation).abs() <= EPS);
        }
    }

    #[test]
    fn flat_matches_graph_on_perceptron() {
        for seed in 0..4 {
            run_equivalence(perceptron, seed);
        }
    }

    #[test]
    fn flat_matches_graph_on_recurrent_layer() {
        for seed in 10..13 {
            run_equivalence(recurrent, seed);
        }
    }

    #[test]
    fn flat_matches_graph_on_gated_memory_block() {
        for seed in 20..23 {
            run_equivalence(memory_block, seed);
        }
    }

    #[test]
    fn restore_is_lossless_and_idempotent() {
        let mut net = memory_block(graph_cfg(5));
        for step in 0..5 {
            net.activate(&inputs(step, 2)).unwrap();
            net.propagate(0.2, &[0.7]).unwrap();
        }
        let before: Vec<Neuron> = net
            .neurons()
            .iter()
            .map(|&(id, _)| net.neuron(id).unwrap().clone())
            .collect();
        let weights: Vec<f64> = net
            .connections()
            .iter()
            .map(|&c| net.connection(c).unwrap().weight)
            .collect();

        net.optimize().unwrap();
        net.restore().unwrap();
        net.restore().unwrap();
        assert!(!net.is_compiled());

        for (old, &(id, _)) in before.iter().zip(&net.neurons()) {
            assert_eq!(old, net.neuron(id).unwrap());
        }
        let after: Vec<f64> = net
            .connections()
            .iter()
            .map(|&c| net.connection(c).unwrap().weight)
            .collect();
        assert_eq!(weights, after);
    }

    #[test]
    fn restore_without_compiling_is_noop() {
        let mut net = perceptron(graph_cfg(1));
        net.restore().unwrap();
        assert!(!net.is_compiled());
    }

    #[test]
    fn structural_edit_restores_learned_state() {
        let mut net = perceptron(flat_cfg(3));
        for step in 0..10 {
            net.activate(&inputs(step, 3)).unwrap();
            net.propagate(0.5, &[1.0, 0.0]).unwrap();
        }
        let program = net.program().unwrap();
        let out_id = net.output.neurons()[0];
        let compiled_bias = program.value(crate::flat::VarKey::Bias(out_id)).unwrap();

        let extra = net.add_neuron(LayerRef::Hidden(1)).unwrap();
        assert!(!net.is_compiled());
        assert_eq!(net.neuron(out_id).unwrap().bias, compiled_bias);
        net.project_neuron(extra, out_id, Some(0.2)).unwrap();
        net.activate(&inputs(0, 3)).unwrap();
        assert!(net.is_compiled());
    }

    #[test]
    fn shape_errors_fail_fast() {
        let mut net = perceptron(flat_cfg(0));
        assert!(matches!(
            net.activate(&[1.0]),
            Err(NetworkError::InputSize { expected: 3, actual: 1 })
        ));
        assert!(matches!(
            net.propagate(0.1, &[1.0]),
            Err(NetworkError::TargetSize { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            net.propagate(0.0, &[1.0, 1.0]),
            Err(NetworkError::InvalidRate(_))
        ));
        assert!(!net.is_compiled());
    }

    #[test]
    fn self_connection_decays_geometrically() {
        let cfg = graph_cfg(0).with_squash(Squash::Identity);
        let mut net = Network::new(1, &[1], 1, cfg).unwrap();
        let input = net.input.neurons()[0];
        let hidden = net.hidden[0].neurons()[0];
        let out = net.output.neurons()[0];
        net.set_bias(hidden, 0.0).unwrap();
        net.set_bias(out, 0.0).unwrap();
        let feed = net.project_neuron(input, hidden, Some(1.0)).unwrap();
        net.project_neuron(hidden, out, Some(1.0)).unwrap();
        net.project_neuron(hidden, hidden, Some(0.5)).unwrap();

        let first = net.activate(&[2.0]).unwrap()[0];
        assert_eq!(first, 2.0);
        net.disconnect(feed.from, feed.to).unwrap();

        let mut prev = first;
        for _ in 0..5 {
            let next = net.activate(&[0.0]).unwrap()[0];
            assert!((next - 0.5 * prev).abs() < EPS);
            prev = next;
        }
    }

    #[test]
    fn gated_gain_tracks_gater_activation() {
        let mut net = Network::new(2, &[1, 1], 1, graph_cfg(9)).unwrap();
        let x = net.input.neurons()[0];
        let gate_neuron = net.hidden[0].neurons()[0];
        let target = net.hidden[1].neurons()[0];
        net.project_neuron(net.input.neurons()[1], gate_neuron, Some(0.8)).unwrap();
        let gated = net.project_neuron(x, target, Some(1.0)).unwrap();
        assert_eq!(net.connection(gated).unwrap().gain, 1.0);

        net.gate_connection(gate_neuron, gated).unwrap();
        assert_eq!(net.connection(gated).unwrap().gain, 1.0);
        net.activate(&[0.3, 0.9]).unwrap();
        let gater_activation = net.neuron(gate_neuron).unwrap().activation;
        assert_eq!(net.connection(gated).unwrap().gain, gater_activation);
    }

    #[test]
    fn clear_keeps_weights_and_reset_redraws_them() {
        let mut net = perceptron(graph_cfg(4));
        net.activate(&[0.1, 0.2, 0.3]).unwrap();
        net.propagate(0.1, &[1.0, 0.0]).unwrap();
        let c = net.connections()[0];
        let w = net.connection(c).unwrap().weight;

        net.clear().unwrap();
        assert_eq!(net.connection(c).unwrap().weight, w);
        for (id, _) in net.neurons() {
            let n = net.neuron(id).unwrap();
            assert_eq!(n.activation, 0.0);
            assert!(n.trace.eligibility.values().all(|&e| e == 0.0));
        }

        net.reset().unwrap();
        let (lo, hi) = net.config().weight_init;
        for c in net.connections() {
            let w = net.connection(c).unwrap().weight;
            assert!(w >= lo && w < hi);
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = NetworkConfig::default().with_weight_init(1.0, -1.0);
        assert!(matches!(
            Network::new(1, &[], 1, cfg),
            Err(NetworkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn graph_mode_training_survives_explicit_compile() {
        let mut net = Network::perceptron(2, &[2], 1, graph_cfg(6)).unwrap();
        let c = net.connections()[0];
        net.optimize().unwrap();
        let compiled = net.connection(c).unwrap().weight;

        for step in 0..20 {
            net.activate(&inputs(step, 2)).unwrap();
            assert!(!net.is_compiled());
            net.propagate(0.5, &[1.0]).unwrap();
        }
        let trained = net.connection(c).unwrap().weight;
        assert_ne!(trained, compiled);

        net.restore().unwrap();
        assert_eq!(net.connection(c).unwrap().weight, trained);
        net.add_neuron(LayerRef::Hidden(0)).unwrap();
        assert_eq!(net.connection(c).unwrap().weight, trained);
    }

    #[test]
    fn switching_modes_keeps_learned_values() {
        let (mut graph, mut flat) = twins(memory_block, 31);
        let step = |net: &mut Network, s: usize| {
            let out = net.activate(&inputs(s, 2)).unwrap();
            net.propagate(0.2, &[0.6]).unwrap();
            out
        };

        for s in 0..8 {
            assert_close(&step(&mut graph, s), &step(&mut flat, s), EPS);
        }
        flat.set_optimize(false).unwrap();
        assert_eq!(flat.mode(), ExecutionMode::Graph);
        assert!(!flat.is_compiled());
        for s in 8..16 {
            assert_close(&step(&mut graph, s), &step(&mut flat, s), EPS);
        }
        flat.set_optimize(true).unwrap();
        assert_eq!(flat.mode(), ExecutionMode::Flat);
        for s in 16..24 {
            assert_close(&step(&mut graph, s), &step(&mut flat, s), EPS);
        }
        assert!(flat.is_compiled());
    }

    #[test]
    fn disconnect_all_leaves_isolated_neurons() {
        let mut net = memory_block(flat_cfg(8));
        net.activate(&[0.2, 0.4]).unwrap();
        net.disconnect_all().unwrap();

        assert!(net.connections().is_empty());
        assert_eq!(net.graph().connection_count(), 0);
        for (id, _) in net.neurons() {
            let n = net.neuron(id).unwrap();
            assert!(n.inputs.is_empty() && n.projected.is_empty() && n.gated.is_empty());
            assert!(!n.is_selfconnected());
            assert!(n.trace.extended.is_empty());
        }

        let out = net.output.neurons()[0];
        let bias = net.neuron(out).unwrap().bias;
        let y = net.activate(&[0.9, -0.9]).unwrap()[0];
        assert_eq!(y, Squash::Logistic.apply(bias));
    }

    #[test]
    fn disconnecting_missing_selfconnection_is_reported() {
        let mut net = perceptron(flat_cfg(2));
        let h = net.hidden[0].neurons()[0];
        assert!(matches!(
            net.disconnect(h, h),
            Err(NetworkError::NotConnected { .. })
        ));
        net.project_neuron(h, h, Some(0.4)).unwrap();
        net.disconnect(h, h).unwrap();
        assert!(!net.neuron(h).unwrap().is_selfconnected());
    }

    #[test]
    fn failed_restore_writes_nothing() {
        let mut net = perceptron(flat_cfg(12));
        net.activate(&[0.3, 0.6, 0.9]).unwrap();
        let input = net.input.neurons()[0];
        assert_eq!(net.neuron(input).unwrap().activation, 0.0);

        // Bypass the structural API so the held program goes stale.
        let hidden = net.hidden[0].neurons()[0];
        net.graph.remove_neuron(hidden).unwrap();

        assert!(matches!(net.restore(), Err(NetworkError::UnknownNeuron(_))));
        assert!(net.is_compiled());
        assert_eq!(net.neuron(input).unwrap().activation, 0.0);
    }

    /// Input → gate → cell → output, the gate driving the cell's self-connection.
    fn forget_gate_cell(cfg: NetworkConfig) -> (Network, NeuronId, NeuronId) {
        let mut net = Network::new(1, &[1, 1], 1, cfg).unwrap();
        let input = net.input.neurons()[0];
        let gate = net.hidden[0].neurons()[0];
        let cell = net.hidden[1].neurons()[0];
        let out = net.output.neurons()[0];
        net.set_squash(cell, Squash::Tanh).unwrap();
        net.set_squash(out, Squash::Identity).unwrap();
        net.set_bias(gate, 0.1).unwrap();
        net.set_bias(cell, 0.0).unwrap();
        net.set_bias(out, 0.0).unwrap();
        net.project_neuron(input, gate, Some(0.7)).unwrap();
        net.project_neuron(input, cell, Some(0.9)).unwrap();
        let memory = net.project_neuron(cell, cell, Some(0.8)).unwrap();
        net.project_neuron(cell, out, Some(1.2)).unwrap();
        net.gate_connection(gate, memory).unwrap();
        (net, gate, cell)
    }

    const WARMUP: [f64; 3] = [0.5, -0.3, 0.8];

    #[test]
    fn gate_influence_uses_previous_cell_state() {
        for cfg in [graph_cfg(0), flat_cfg(0)] {
            let (mut net, gate, cell) = forget_gate_cell(cfg);
            for x in WARMUP {
                net.activate(&[x]).unwrap();
                net.propagate(0.1, &[0.3]).unwrap();
            }
            net.restore().unwrap();
            let influence = net.neuron(gate).unwrap().trace.influences[&cell];
            let cell = net.neuron(cell).unwrap();
            assert!(cell.old != 0.0);
            assert!((influence - cell.selfconnection.weight * cell.old).abs() < EPS);
        }
    }

    #[test]
    fn gate_responsibility_matches_finite_difference() {
        let (x, target) = (0.4, 0.3);
        let loss = |shift: f64| {
            let (mut net, gate, _) = forget_gate_cell(graph_cfg(0));
            for v in WARMUP {
                net.activate(&[v]).unwrap();
            }
            let bias = net.neuron(gate).unwrap().bias;
            net.set_bias(gate, bias + shift).unwrap();
            let y = net.activate(&[x]).unwrap()[0];
            0.5 * (target - y).powi(2)
        };
        let h = 1e-6;
        let numeric = -(loss(h) - loss(-h)) / (2.0 * h);

        let (mut net, gate, _) = forget_gate_cell(graph_cfg(0));
        for v in WARMUP {
            net.activate(&[v]).unwrap();
        }
        net.activate(&[x]).unwrap();
        net.propagate(1e-9, &[target]).unwrap();
        let analytic = net.neuron(gate).unwrap().error.responsibility;

        assert!(analytic.abs() > 1e-4);
        assert!((analytic - numeric).abs() < 1e-7, "{analytic} != {numeric}");
    }

    mod properties {
        use super::*;
        use crate::flat::VarKey;
        use proptest::prelude::*;

        /// Perceptron plus extra links, self-connections and gates, all
        /// addressed by index so any draw maps onto a valid network.
        #[derive(Debug, Clone)]
        struct Topology {
            input: usize,
            hidden: Vec<usize>,
            output: usize,
            links: Vec<(usize, usize)>,
            loops: Vec<(usize, f64)>,
            gates: Vec<(usize, usize)>,
        }

        fn topology() -> impl Strategy<Value = Topology> {
            (
                1usize..4,
                prop::collection::vec(1usize..4, 0..3),
                1usize..3,
                prop::collection::vec((0usize..64, 0usize..64), 0..6),
                prop::collection::vec((0usize..64, -0.9f64..0.9), 0..3),
                prop::collection::vec((0usize..64, 0usize..64), 0..4),
            )
                .prop_map(|(input, hidden, output, links, loops, gates)| Topology {
                    input,
                    hidden,
                    output,
                    links,
                    loops,
                    gates,
                })
        }

        fn build(topology: &Topology, cfg: NetworkConfig) -> Network {
            let mut net = Network::perceptron(
                topology.input,
                &topology.hidden,
                topology.output,
                cfg.with_squash(Squash::Tanh),
            )
            .unwrap();
            let neurons: Vec<NeuronId> = net.neurons().iter().map(|&(id, _)| id).collect();
            let inner = &neurons[topology.input..];
            for &(a, b) in &topology.links {
                net.project_neuron(neurons[a % neurons.len()], inner[b % inner.len()], None)
                    .unwrap();
            }
            for &(a, w) in &topology.loops {
                let id = inner[a % inner.len()];
                net.project_neuron(id, id, Some(w)).unwrap();
            }
            for &(g, c) in &topology.gates {
                let connections = net.connections();
                net.gate_connection(neurons[g % neurons.len()], connections[c % connections.len()])
                    .unwrap();
            }
            net
        }

        type Step = (Vec<f64>, Vec<f64>, f64);

        fn steps() -> impl Strategy<Value = Vec<Step>> {
            prop::collection::vec(
                (
                    prop::collection::vec(-1.0f64..1.0, 3),
                    prop::collection::vec(0.0f64..1.0, 2),
                    0.01f64..0.5,
                ),
                1..12,
            )
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn flat_matches_graph_on_random_topologies(
                topology in topology(),
                seed in any::<u64>(),
                steps in steps(),
            ) {
                let mut graph = build(&topology, graph_cfg(seed));
                let mut flat = build(&topology, flat_cfg(seed));
                for (x, target, rate) in &steps {
                    let x = &x[..topology.input];
                    let target = &target[..topology.output];
                    let a = graph.activate(x).unwrap();
                    let b = flat.activate(x).unwrap();
                    for (p, q) in a.iter().zip(&b) {
                        prop_assert!((p - q).abs() <= EPS, "{} != {}", p, q);
                    }
                    graph.propagate(*rate, target).unwrap();
                    flat.propagate(*rate, target).unwrap();
                }

                let program = flat.program().unwrap().clone();
                flat.restore().unwrap();
                flat.restore().unwrap();
                for ((id, _), (other, _)) in graph.neurons().into_iter().zip(flat.neurons()) {
                    let g = graph.neuron(id).unwrap();
                    let f = flat.neuron(other).unwrap();
                    prop_assert_eq!(Some(f.bias), program.value(VarKey::Bias(other)));
                    prop_assert_eq!(Some(f.state), program.value(VarKey::State(other)));
                    prop_assert!((g.bias - f.bias).abs() <= EPS);
                    prop_assert!((g.state - f.state).abs() <= EPS);
                }
                for (c, d) in graph.connections().into_iter().zip(flat.connections()) {
                    let w = flat.connection(d).unwrap().weight;
                    prop_assert_eq!(Some(w), program.value(VarKey::Weight(d)));
                    prop_assert!((graph.connection(c).unwrap().weight - w).abs() <= EPS);
                }
            }
        }
    }

    #[test]
    fn gating_layers_of_wrong_size_fails() {
        let mut net = Network::new(2, &[3], 2, graph_cfg(0)).unwrap();
        let conn = net.project(LayerRef::Input, LayerRef::Hidden(0), None, None).unwrap();
        let err = net.gate(LayerRef::Output, &conn, GateKind::Input).unwrap_err();
        assert!(matches!(err, NetworkError::LayerSizeMismatch { .. }));
    }
}
