//! Flattening compiler: lowers the live graph into a [`FlatProgram`].
//!
//! Each neuron is emitted once, in layer order, as three instruction blocks
//! (activation, trace update, propagation). The arithmetic in every block is
//! a one-to-one transcription of the corresponding graph algorithm in
//! `graph.rs`, in the same operand and iteration order, so a compiled program
//! follows exactly the trajectory the graph walker would.

use hashbrown::HashMap;
use tracing::debug;

use crate::error::Result;
use crate::flat::{Block, FlatProgram, Op, Slot, VarKey, Variable};
use crate::graph::Graph;
use crate::layer::Layer;
use crate::neuron::{ConnectionId, NeuronId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Input,
    Hidden,
    /// Position within the output layer.
    Output(usize),
}

struct Emitter<'g> {
    graph: &'g Graph,
    memory: Vec<f64>,
    variables: HashMap<VarKey, Variable>,
}

impl<'g> Emitter<'g> {
    fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            memory: Vec::new(),
            variables: HashMap::new(),
        }
    }

    /// Slot for `key`, reserving it (seeded with the live field value) on first use.
    fn var(&mut self, key: VarKey) -> Result<Slot> {
        if let Some(v) = self.variables.get(&key) {
            return Ok(v.slot);
        }
        let default = self.current(key)?;
        let slot = self.memory.len();
        self.memory.push(default);
        self.variables.insert(key, Variable { slot, default });
        Ok(slot)
    }

    fn current(&self, key: VarKey) -> Result<f64> {
        let g = self.graph;
        Ok(match key {
            VarKey::Rate | VarKey::Target(_) | VarKey::Error(_) | VarKey::Gradient(_) => 0.0,
            VarKey::State(n) => g.neuron(n)?.state,
            VarKey::Old(n) => g.neuron(n)?.old,
            VarKey::Activation(n) => g.neuron(n)?.activation,
            VarKey::Derivative(n) => g.neuron(n)?.derivative,
            VarKey::Bias(n) => g.neuron(n)?.bias,
            VarKey::Responsibility(n) => g.neuron(n)?.error.responsibility,
            VarKey::Projected(n) => g.neuron(n)?.error.projected,
            VarKey::Gated(n) => g.neuron(n)?.error.gated,
            VarKey::Weight(c) => g.connection(c)?.weight,
            VarKey::Gain(c) => g.connection(c)?.gain,
            VarKey::Eligibility(n, c) => g
                .neuron(n)?
                .trace
                .eligibility
                .get(&c)
                .copied()
                .unwrap_or(0.0),
            VarKey::Extended(n, k, c) => g
                .neuron(n)?
                .trace
                .extended
                .get(&k)
                .and_then(|x| x.get(&c))
                .copied()
                .unwrap_or(0.0),
            VarKey::Influence(n, k) => g
                .neuron(n)?
                .trace
                .influences
                .get(&k)
                .copied()
                .unwrap_or(0.0),
        })
    }

    /// Reserve every slot the restore path reads for this neuron.
    fn reserve_neuron(&mut self, id: NeuronId) -> Result<()> {
        let graph = self.graph;
        let neuron = graph.neuron(id)?;
        let self_id = ConnectionId::new(id, id);
        for key in [
            VarKey::State(id),
            VarKey::Old(id),
            VarKey::Activation(id),
            VarKey::Derivative(id),
            VarKey::Bias(id),
            VarKey::Responsibility(id),
            VarKey::Projected(id),
            VarKey::Gated(id),
            VarKey::Weight(self_id),
            VarKey::Gain(self_id),
        ] {
            self.var(key)?;
        }
        for &c in &neuron.inputs {
            self.var(VarKey::Eligibility(id, c))?;
        }
        for (&k, xtrace) in &neuron.trace.extended {
            self.var(VarKey::Influence(id, k))?;
            for &c in xtrace.keys() {
                self.var(VarKey::Extended(id, k, c))?;
            }
        }
        for &c in &neuron.projected {
            self.var(VarKey::Weight(c))?;
            self.var(VarKey::Gain(c))?;
        }
        Ok(())
    }

    fn emit_input(&mut self, id: NeuronId) -> Result<Block> {
        let graph = self.graph;
        let neuron = graph.neuron(id)?;
        let activation = self.var(VarKey::Activation(id))?;
        let mut block = vec![Op::Zero {
            dst: self.var(VarKey::Derivative(id))?,
        }];
        for &c in &neuron.inputs {
            block.push(Op::Zero {
                dst: self.var(VarKey::Eligibility(id, c))?,
            });
        }
        for &g in &neuron.gated {
            block.push(Op::Copy {
                dst: self.var(VarKey::Gain(g))?,
                src: activation,
            });
        }
        Ok(block)
    }

    fn emit_activation(&mut self, id: NeuronId) -> Result<Block> {
        let graph = self.graph;
        let neuron = graph.neuron(id)?;
        let self_id = ConnectionId::new(id, id);
        let state = self.var(VarKey::State(id))?;
        let old = self.var(VarKey::Old(id))?;

        let mut block = vec![
            Op::Copy { dst: old, src: state },
            Op::Recur {
                dst: state,
                gain: self.var(VarKey::Gain(self_id))?,
                weight: self.var(VarKey::Weight(self_id))?,
                src: old,
                add: self.var(VarKey::Bias(id))?,
            },
        ];
        for &c in &neuron.inputs {
            block.push(Op::MulAcc3 {
                dst: state,
                a: self.var(VarKey::Activation(c.from))?,
                b: self.var(VarKey::Weight(c))?,
                c: self.var(VarKey::Gain(c))?,
            });
        }
        block.push(Op::Squash {
            kind: neuron.squash,
            state,
            activation: self.var(VarKey::Activation(id))?,
            derivative: self.var(VarKey::Derivative(id))?,
        });
        Ok(block)
    }

    fn emit_trace(&mut self, id: NeuronId) -> Result<Block> {
        let graph = self.graph;
        let neuron = graph.neuron(id)?;
        let self_id = ConnectionId::new(id, id);
        let mut block = Block::new();

        self.emit_influences(id, &mut block)?;

        let self_gain = self.var(VarKey::Gain(self_id))?;
        let self_weight = self.var(VarKey::Weight(self_id))?;
        let derivative = self.var(VarKey::Derivative(id))?;
        for &c in &neuron.inputs {
            let eligibility = self.var(VarKey::Eligibility(id, c))?;
            block.push(Op::Trace {
                dst: eligibility,
                gain: self_gain,
                weight: self_weight,
                a: self.var(VarKey::Gain(c))?,
                b: self.var(VarKey::Activation(c.from))?,
            });
            for &k in neuron.trace.extended.keys() {
                let gated_self = ConnectionId::new(k, k);
                block.push(Op::Extended {
                    dst: self.var(VarKey::Extended(id, k, c))?,
                    gain: self.var(VarKey::Gain(gated_self))?,
                    weight: self.var(VarKey::Weight(gated_self))?,
                    a: derivative,
                    b: eligibility,
                    c: self.var(VarKey::Influence(id, k))?,
                });
            }
        }

        let activation = self.var(VarKey::Activation(id))?;
        for &g in &neuron.gated {
            block.push(Op::Copy {
                dst: self.var(VarKey::Gain(g))?,
                src: activation,
            });
        }
        Ok(block)
    }

    /// Recompute `Influence(id, k)` for every neuron `k` that `id` gates.
    fn emit_influences(&mut self, id: NeuronId, block: &mut Block) -> Result<()> {
        let graph = self.graph;
        let neuron = graph.neuron(id)?;
        for &k in neuron.trace.extended.keys() {
            let gated = graph.neuron(k)?;
            let influence = self.var(VarKey::Influence(id, k))?;
            if gated.selfconnection.gater == Some(id) {
                block.push(Op::Mul {
                    dst: influence,
                    a: self.var(VarKey::Weight(ConnectionId::new(k, k)))?,
                    b: self.var(VarKey::Old(k))?,
                });
            } else {
                block.push(Op::Zero { dst: influence });
            }
            for &c in neuron.gated.iter().filter(|c| c.to == k && !c.is_self()) {
                block.push(Op::MulAcc {
                    dst: influence,
                    a: self.var(VarKey::Weight(c))?,
                    b: self.var(VarKey::Activation(c.from))?,
                });
            }
        }
        Ok(())
    }

    fn emit_propagation(&mut self, id: NeuronId, role: Role, targets: &mut Vec<Slot>) -> Result<Block> {
        let graph = self.graph;
        let neuron = graph.neuron(id)?;
        let responsibility = self.var(VarKey::Responsibility(id))?;
        let projected = self.var(VarKey::Projected(id))?;
        let mut block = Block::new();

        match role {
            Role::Output(i) => {
                let target = self.var(VarKey::Target(i))?;
                targets.push(target);
                block.push(Op::Sub {
                    dst: responsibility,
                    a: target,
                    b: self.var(VarKey::Activation(id))?,
                });
                block.push(Op::Copy {
                    dst: projected,
                    src: responsibility,
                });
            }
            Role::Hidden => {
                let error = self.var(VarKey::Error(id))?;
                let derivative = self.var(VarKey::Derivative(id))?;
                let gated = self.var(VarKey::Gated(id))?;

                block.push(Op::Zero { dst: error });
                for &c in &neuron.projected {
                    block.push(Op::MulAcc3 {
                        dst: error,
                        a: self.var(VarKey::Responsibility(c.to))?,
                        b: self.var(VarKey::Gain(c))?,
                        c: self.var(VarKey::Weight(c))?,
                    });
                }
                block.push(Op::Mul {
                    dst: projected,
                    a: derivative,
                    b: error,
                });

                self.emit_influences(id, &mut block)?;
                block.push(Op::Zero { dst: error });
                for &k in neuron.trace.extended.keys() {
                    block.push(Op::MulAcc {
                        dst: error,
                        a: self.var(VarKey::Responsibility(k))?,
                        b: self.var(VarKey::Influence(id, k))?,
                    });
                }
                block.push(Op::Mul {
                    dst: gated,
                    a: derivative,
                    b: error,
                });
                block.push(Op::Add {
                    dst: responsibility,
                    a: projected,
                    b: gated,
                });
            }
            Role::Input => return Ok(block),
        }

        let rate = self.var(VarKey::Rate)?;
        let gradient = self.var(VarKey::Gradient(id))?;
        for &c in &neuron.inputs {
            block.push(Op::Mul {
                dst: gradient,
                a: projected,
                b: self.var(VarKey::Eligibility(id, c))?,
            });
            for &k in neuron.trace.extended.keys() {
                block.push(Op::MulAcc {
                    dst: gradient,
                    a: self.var(VarKey::Responsibility(k))?,
                    b: self.var(VarKey::Extended(id, k, c))?,
                });
            }
            block.push(Op::MulAcc {
                dst: self.var(VarKey::Weight(c))?,
                a: rate,
                b: gradient,
            });
        }
        block.push(Op::MulAcc {
            dst: self.var(VarKey::Bias(id))?,
            a: rate,
            b: responsibility,
        });
        Ok(block)
    }
}

/// Compile the network made of `input`, `hidden` and `output` over `graph`.
///
/// This is a full rebuild; slot defaults are the graph's current values.
pub fn compile(graph: &Graph, input: &Layer, hidden: &[Layer], output: &Layer) -> Result<FlatProgram> {
    let mut emitter = Emitter::new(graph);
    let rate = emitter.var(VarKey::Rate)?;

    let layers: Vec<&Layer> = core::iter::once(input)
        .chain(hidden.iter())
        .chain(core::iter::once(output))
        .collect();
    let last = layers.len() - 1;

    let mut activation = Vec::with_capacity(layers.len());
    let mut traces = Vec::with_capacity(layers.len());
    let mut propagation = Vec::with_capacity(layers.len());
    let mut inputs = Vec::with_capacity(input.size());
    let mut outputs = Vec::with_capacity(output.size());
    let mut targets = Vec::with_capacity(output.size());
    let mut neurons = Vec::with_capacity(graph.neuron_count());

    for (l, layer) in layers.iter().enumerate() {
        let mut layer_activation = Vec::with_capacity(layer.size());
        let mut layer_trace = Vec::with_capacity(layer.size());
        let mut layer_propagation = Vec::with_capacity(layer.size());

        for (i, &id) in layer.neurons().iter().enumerate() {
            let role = if l == 0 {
                Role::Input
            } else if l == last {
                Role::Output(i)
            } else {
                Role::Hidden
            };
            emitter.reserve_neuron(id)?;
            neurons.push(id);

            if role == Role::Input {
                inputs.push(emitter.var(VarKey::Activation(id))?);
                layer_activation.push(emitter.emit_input(id)?);
                layer_trace.push(Block::new());
                continue;
            }

            layer_activation.push(emitter.emit_activation(id)?);
            layer_trace.push(emitter.emit_trace(id)?);
            layer_propagation.push(emitter.emit_propagation(id, role, &mut targets)?);
            if let Role::Output(_) = role {
                outputs.push(emitter.var(VarKey::Activation(id))?);
            }
        }

        activation.push(layer_activation);
        traces.push(layer_trace);
        propagation.push(layer_propagation);
    }

    for layer in &mut propagation {
        layer.reverse();
    }
    propagation.reverse();

    let program = FlatProgram {
        memory: emitter.memory,
        variables: emitter.variables,
        activation,
        trace: traces,
        propagation,
        inputs,
        outputs,
        targets,
        rate,
        neurons,
    };
    debug!(
        slots = program.memory.len(),
        instructions = program.instruction_count(),
        neurons = program.neurons.len(),
        "compiled flat program"
    );
    Ok(program)
}
