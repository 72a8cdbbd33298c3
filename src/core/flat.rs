//! Flat execution form of a network.
//!
//! A [`FlatProgram`] owns one contiguous `f64` memory block. Every value the
//! graph algorithms read or write (biases, states, weights, gains, traces,
//! error terms) has a slot, and activation/propagation are lists of typed
//! instructions addressing those slots. No graph traversal happens at run time.

use std::fmt;

use hashbrown::HashMap;
use tracing::debug;

use crate::error::{NetworkError, Result};
use crate::graph::Graph;
use crate::neuron::{ConnectionId, NeuronId};
use crate::squash::Squash;

/// Index into [`FlatProgram::memory`].
pub type Slot = usize;

/// Symbolic name of a memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKey {
    Rate,
    /// Target value for the `n`-th output neuron.
    Target(usize),
    State(NeuronId),
    Old(NeuronId),
    Activation(NeuronId),
    Derivative(NeuronId),
    Bias(NeuronId),
    Responsibility(NeuronId),
    Projected(NeuronId),
    Gated(NeuronId),
    /// Scratch accumulator for the backward pass.
    Error(NeuronId),
    /// Scratch accumulator for a weight gradient.
    Gradient(NeuronId),
    Weight(ConnectionId),
    Gain(ConnectionId),
    /// `(owner, input connection)`
    Eligibility(NeuronId, ConnectionId),
    /// `(owner, gated neuron, input connection)`
    Extended(NeuronId, NeuronId, ConnectionId),
    /// `(gater, gated neuron)`
    Influence(NeuronId, NeuronId),
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarKey::Rate => write!(f, "rate"),
            VarKey::Target(i) => write!(f, "target_{i}"),
            VarKey::State(n) => write!(f, "state_{n}"),
            VarKey::Old(n) => write!(f, "old_{n}"),
            VarKey::Activation(n) => write!(f, "activation_{n}"),
            VarKey::Derivative(n) => write!(f, "derivative_{n}"),
            VarKey::Bias(n) => write!(f, "bias_{n}"),
            VarKey::Responsibility(n) => write!(f, "responsibility_{n}"),
            VarKey::Projected(n) => write!(f, "projected_{n}"),
            VarKey::Gated(n) => write!(f, "gated_{n}"),
            VarKey::Error(n) => write!(f, "error_{n}"),
            VarKey::Gradient(n) => write!(f, "gradient_{n}"),
            VarKey::Weight(c) => write!(f, "weight_{c}"),
            VarKey::Gain(c) => write!(f, "gain_{c}"),
            VarKey::Eligibility(n, c) => write!(f, "eligibility_{c}_{n}"),
            VarKey::Extended(n, k, c) => write!(f, "extended_{k}_{c}_{n}"),
            VarKey::Influence(n, k) => write!(f, "influence_{k}_{n}"),
        }
    }
}

/// A named slot and the value it was initialized with at compile time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Variable {
    pub slot: Slot,
    pub default: f64,
}

/// One arithmetic step over memory slots. `F` below is the memory block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// `F[dst] = 0`
    Zero { dst: Slot },
    /// `F[dst] = F[src]`
    Copy { dst: Slot, src: Slot },
    /// `F[dst] = F[a] + F[b]`
    Add { dst: Slot, a: Slot, b: Slot },
    /// `F[dst] = F[a] - F[b]`
    Sub { dst: Slot, a: Slot, b: Slot },
    /// `F[dst] = F[a] * F[b]`
    Mul { dst: Slot, a: Slot, b: Slot },
    /// `F[dst] += F[a] * F[b]`
    MulAcc { dst: Slot, a: Slot, b: Slot },
    /// `F[dst] += F[a] * F[b] * F[c]`
    MulAcc3 { dst: Slot, a: Slot, b: Slot, c: Slot },
    /// `F[dst] = F[gain] * F[weight] * F[src] + F[add]`
    Recur {
        dst: Slot,
        gain: Slot,
        weight: Slot,
        src: Slot,
        add: Slot,
    },
    /// `F[dst] = F[gain] * F[weight] * F[dst] + F[a] * F[b]`
    Trace {
        dst: Slot,
        gain: Slot,
        weight: Slot,
        a: Slot,
        b: Slot,
    },
    /// `F[dst] = F[gain] * F[weight] * F[dst] + F[a] * F[b] * F[c]`
    Extended {
        dst: Slot,
        gain: Slot,
        weight: Slot,
        a: Slot,
        b: Slot,
        c: Slot,
    },
    /// `F[activation] = f(F[state]); F[derivative] = f'(F[state])`
    Squash {
        kind: Squash,
        state: Slot,
        activation: Slot,
        derivative: Slot,
    },
}

impl Op {
    #[inline]
    fn exec(&self, f: &mut [f64]) {
        match *self {
            Op::Zero { dst } => f[dst] = 0.0,
            Op::Copy { dst, src } => f[dst] = f[src],
            Op::Add { dst, a, b } => f[dst] = f[a] + f[b],
            Op::Sub { dst, a, b } => f[dst] = f[a] - f[b],
            Op::Mul { dst, a, b } => f[dst] = f[a] * f[b],
            Op::MulAcc { dst, a, b } => f[dst] += f[a] * f[b],
            Op::MulAcc3 { dst, a, b, c } => f[dst] += f[a] * f[b] * f[c],
            Op::Recur {
                dst,
                gain,
                weight,
                src,
                add,
            } => f[dst] = f[gain] * f[weight] * f[src] + f[add],
            Op::Trace {
                dst,
                gain,
                weight,
                a,
                b,
            } => f[dst] = f[gain] * f[weight] * f[dst] + f[a] * f[b],
            Op::Extended {
                dst,
                gain,
                weight,
                a,
                b,
                c,
            } => f[dst] = f[gain] * f[weight] * f[dst] + f[a] * f[b] * f[c],
            Op::Squash {
                kind,
                state,
                activation,
                derivative,
            } => {
                let (fx, dfx) = kind.eval(f[state]);
                f[activation] = fx;
                f[derivative] = dfx;
            }
        }
    }
}

/// Instruction list of one neuron.
pub type Block = Vec<Op>;

/// Compiled network: memory block, symbol table and per-layer instruction lists.
///
/// `activation` and `trace` are indexed `[layer][neuron]` in forward order.
/// `propagation` is already reversed (layers and neurons within a layer) so
/// running it front to back is the output-first backward pass.
#[derive(Debug, Clone)]
pub struct FlatProgram {
    pub(crate) memory: Vec<f64>,
    pub(crate) variables: HashMap<VarKey, Variable>,
    pub(crate) activation: Vec<Vec<Block>>,
    pub(crate) trace: Vec<Vec<Block>>,
    pub(crate) propagation: Vec<Vec<Block>>,
    pub(crate) inputs: Vec<Slot>,
    pub(crate) outputs: Vec<Slot>,
    pub(crate) targets: Vec<Slot>,
    pub(crate) rate: Slot,
    /// Neurons covered by the program, in enumeration order.
    pub(crate) neurons: Vec<NeuronId>,
}

impl FlatProgram {
    pub fn memory(&self) -> &[f64] {
        &self.memory
    }

    pub fn variable(&self, key: VarKey) -> Option<Variable> {
        self.variables.get(&key).copied()
    }

    /// Current value of a named slot.
    pub fn value(&self, key: VarKey) -> Option<f64> {
        self.variables.get(&key).map(|v| self.memory[v.slot])
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    pub fn input_slots(&self) -> &[Slot] {
        &self.inputs
    }

    pub fn output_slots(&self) -> &[Slot] {
        &self.outputs
    }

    pub fn target_slots(&self) -> &[Slot] {
        &self.targets
    }

    pub fn activation_blocks(&self) -> &[Vec<Block>] {
        &self.activation
    }

    pub fn trace_blocks(&self) -> &[Vec<Block>] {
        &self.trace
    }

    pub fn propagation_blocks(&self) -> &[Vec<Block>] {
        &self.propagation
    }

    pub fn instruction_count(&self) -> usize {
        let count = |blocks: &[Vec<Block>]| -> usize {
            blocks
                .iter()
                .flat_map(|layer| layer.iter())
                .map(Vec::len)
                .sum()
        };
        count(&self.activation) + count(&self.trace) + count(&self.propagation)
    }

    /// Forward pass against the memory block.
    pub fn activate(&mut self, input: &[f64]) -> Result<Vec<f64>> {
        if input.len() != self.inputs.len() {
            return Err(NetworkError::InputSize {
                expected: self.inputs.len(),
                actual: input.len(),
            });
        }
        for (&slot, &x) in self.inputs.iter().zip(input) {
            self.memory[slot] = x;
        }
        for (layer, traces) in self.activation.iter().zip(&self.trace) {
            for (block, trace) in layer.iter().zip(traces) {
                run(&mut self.memory, block);
                run(&mut self.memory, trace);
            }
        }
        Ok(self.outputs.iter().map(|&slot| self.memory[slot]).collect())
    }

    /// Backward pass against the memory block.
    pub fn propagate(&mut self, rate: f64, target: &[f64]) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(NetworkError::InvalidRate(rate));
        }
        if target.len() != self.targets.len() {
            return Err(NetworkError::TargetSize {
                expected: self.targets.len(),
                actual: target.len(),
            });
        }
        self.memory[self.rate] = rate;
        for (&slot, &t) in self.targets.iter().zip(target) {
            self.memory[slot] = t;
        }
        for layer in &self.propagation {
            for block in layer {
                run(&mut self.memory, block);
            }
        }
        Ok(())
    }

    /// Copy every slot back into the graph fields it was compiled from.
    ///
    /// Fields without a slot keep their current value, so restoring is lossless
    /// and repeating it changes nothing. Nothing is written unless every
    /// neuron and projected connection still resolves.
    pub(crate) fn restore_into(&self, graph: &mut Graph) -> Result<()> {
        for &id in &self.neurons {
            for &c in &graph.neuron(id)?.projected {
                graph.connection(c)?;
            }
        }

        let read = |key: VarKey, current: f64| -> f64 {
            self.variables
                .get(&key)
                .map_or(current, |v| self.memory[v.slot])
        };

        for &id in &self.neurons {
            let neuron = graph.neuron_mut(id)?;
            neuron.state = read(VarKey::State(id), neuron.state);
            neuron.old = read(VarKey::Old(id), neuron.old);
            neuron.activation = read(VarKey::Activation(id), neuron.activation);
            neuron.derivative = read(VarKey::Derivative(id), neuron.derivative);
            neuron.bias = read(VarKey::Bias(id), neuron.bias);
            neuron.error.responsibility =
                read(VarKey::Responsibility(id), neuron.error.responsibility);
            neuron.error.projected = read(VarKey::Projected(id), neuron.error.projected);
            neuron.error.gated = read(VarKey::Gated(id), neuron.error.gated);

            for (&c, e) in neuron.trace.eligibility.iter_mut() {
                *e = read(VarKey::Eligibility(id, c), *e);
            }
            for (&k, xtrace) in neuron.trace.extended.iter_mut() {
                for (&c, x) in xtrace.iter_mut() {
                    *x = read(VarKey::Extended(id, k, c), *x);
                }
            }
            for (&k, influence) in neuron.trace.influences.iter_mut() {
                *influence = read(VarKey::Influence(id, k), *influence);
            }

            let self_id = neuron.selfconnection.id();
            neuron.selfconnection.weight = read(VarKey::Weight(self_id), neuron.selfconnection.weight);
            neuron.selfconnection.gain = read(VarKey::Gain(self_id), neuron.selfconnection.gain);

            let projected: Vec<ConnectionId> = neuron.projected.iter().copied().collect();
            for c in projected {
                let conn = graph.connection_mut(c)?;
                conn.weight = read(VarKey::Weight(c), conn.weight);
                conn.gain = read(VarKey::Gain(c), conn.gain);
            }
        }
        debug!(neurons = self.neurons.len(), "restored graph from flat program");
        Ok(())
    }
}

#[inline]
fn run(memory: &mut [f64], block: &[Op]) {
    for op in block {
        op.exec(memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_follow_their_formulas() {
        let mut f = vec![2.0, 3.0, 5.0, 7.0, 0.0];
        Op::Mul { dst: 4, a: 0, b: 1 }.exec(&mut f);
        assert_eq!(f[4], 6.0);
        Op::MulAcc3 { dst: 4, a: 0, b: 1, c: 2 }.exec(&mut f);
        assert_eq!(f[4], 36.0);
        Op::Recur { dst: 4, gain: 0, weight: 1, src: 2, add: 3 }.exec(&mut f);
        assert_eq!(f[4], 37.0);
        Op::Trace { dst: 4, gain: 0, weight: 0, a: 1, b: 1 }.exec(&mut f);
        assert_eq!(f[4], 4.0 * 37.0 + 9.0);
        Op::Sub { dst: 4, a: 0, b: 1 }.exec(&mut f);
        assert_eq!(f[4], -1.0);
        Op::Squash { kind: Squash::Relu, state: 4, activation: 0, derivative: 1 }.exec(&mut f);
        assert_eq!((f[0], f[1]), (0.0, 0.0));
    }

    #[test]
    fn var_keys_have_readable_names() {
        assert_eq!(VarKey::Bias(4).to_string(), "bias_4");
        assert_eq!(VarKey::Weight(ConnectionId::new(1, 2)).to_string(), "weight_1_2");
        assert_eq!(
            VarKey::Extended(9, 5, ConnectionId::new(1, 9)).to_string(),
            "extended_5_1_9_9"
        );
    }
}
