//! Serializable network description: neurons and connections by position.
//!
//! Neurons are listed input → hidden → output; connections refer to them by
//! index so a snapshot is independent of the process-local neuron ids. Trace
//! state is not persisted.

use std::io::Cursor;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NetworkError, Result};
use crate::flat::VarKey;
use crate::layer::{Layer, LayerRef};
use crate::network::{Network, NetworkConfig};
use crate::neuron::NeuronId;
use crate::squash::Squash;
use crate::storage;

/// Serialized layer membership: `"input"`, `"output"` or `{"hidden": n}`.
pub type LayerTag = LayerRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronRecord {
    pub bias: f64,
    pub squash: Squash,
    pub layer: LayerTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub from: usize,
    pub to: usize,
    pub weight: f64,
    pub gater: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub neurons: Vec<NeuronRecord>,
    pub connections: Vec<ConnectionRecord>,
}

impl NetworkSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Compact binary image: magic, version and one LZ4-compressed JSON chunk.
    pub fn to_image_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(json.len() / 2 + 32);
        storage::write_header(&mut out)?;
        storage::write_chunk_lz4(&mut out, storage::TAG_SNAPSHOT, &json)?;
        Ok(out)
    }

    /// Inverse of [`NetworkSnapshot::to_image_bytes`]. Unknown chunks are skipped.
    pub fn from_image_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(bytes);
        storage::read_header(&mut r)?;
        while let Some((tag, payload)) = storage::read_chunk_lz4(&mut r)? {
            if tag == storage::TAG_SNAPSHOT {
                return Ok(serde_json::from_slice(&payload)?);
            }
        }
        Err(NetworkError::InvalidSnapshot("image has no snapshot chunk".into()))
    }

    /// Check every index and return the number of hidden layers referenced.
    fn validate(&self) -> Result<usize> {
        let n = self.neurons.len();
        let mut hidden = 0;
        for record in &self.neurons {
            if let LayerRef::Hidden(i) = record.layer {
                hidden = hidden.max(i + 1);
            }
        }
        for (i, c) in self.connections.iter().enumerate() {
            let gater_ok = c.gater.map_or(true, |g| g < n);
            if c.from >= n || c.to >= n || !gater_ok {
                return Err(NetworkError::InvalidSnapshot(format!(
                    "connection {i} references a neuron outside 0..{n}"
                )));
            }
        }
        Ok(hidden)
    }
}

impl Network {
    /// Describe the network by position. Reads through an active flat
    /// program, so the snapshot always reflects learned values.
    pub fn to_snapshot(&self) -> Result<NetworkSnapshot> {
        let neurons = self.neurons();
        let index: HashMap<NeuronId, usize> = neurons
            .iter()
            .enumerate()
            .map(|(i, &(id, _))| (id, i))
            .collect();

        let mut records = Vec::with_capacity(neurons.len());
        for &(id, layer) in &neurons {
            let neuron = self.graph.neuron(id)?;
            records.push(NeuronRecord {
                bias: self.live(VarKey::Bias(id), neuron.bias),
                squash: neuron.squash,
                layer,
            });
        }

        let lookup = |id: NeuronId| {
            index
                .get(&id)
                .copied()
                .ok_or(NetworkError::UnknownNeuron(id))
        };
        let mut connections = Vec::new();
        for c in self.connections() {
            let conn = self.graph.connection(c)?;
            connections.push(ConnectionRecord {
                from: lookup(c.from)?,
                to: lookup(c.to)?,
                weight: self.live(VarKey::Weight(c), conn.weight),
                gater: conn.gater.map(lookup).transpose()?,
            });
        }

        Ok(NetworkSnapshot {
            neurons: records,
            connections,
        })
    }

    /// Rebuild a network from a snapshot with fresh neuron ids.
    pub fn from_snapshot(snapshot: &NetworkSnapshot, cfg: NetworkConfig) -> Result<Self> {
        let hidden = snapshot.validate()?;
        let mut net = Network::empty(cfg)?;
        net.hidden = vec![Layer::new(); hidden];

        let mut ids = Vec::with_capacity(snapshot.neurons.len());
        for record in &snapshot.neurons {
            let id = net.graph.add_neuron(record.squash, record.bias);
            let layer = match record.layer {
                LayerRef::Input => &mut net.input,
                LayerRef::Output => &mut net.output,
                LayerRef::Hidden(i) => net
                    .hidden
                    .get_mut(i)
                    .ok_or(NetworkError::UnknownLayer(record.layer))?,
            };
            layer.add(id);
            ids.push(id);
        }

        for record in &snapshot.connections {
            let (from, to) = (ids[record.from], ids[record.to]);
            let id = net.graph.project(from, to, Some(record.weight), || record.weight)?;
            if let Some(g) = record.gater {
                net.graph.gate(ids[g], id)?;
            }
            let to_layer = snapshot.neurons[record.to].layer;
            net.layer_mut(snapshot.neurons[record.from].layer)?
                .note_projection(to_layer);
        }
        debug!(
            neurons = ids.len(),
            connections = snapshot.connections.len(),
            "rebuilt network from snapshot"
        );
        Ok(net)
    }

    /// Copy with fresh neuron ids, rebuilt from a snapshot of `self`.
    /// Learned weights and biases carry over; running state starts cleared.
    pub fn try_clone(&self) -> Result<Network> {
        Network::from_snapshot(&self.to_snapshot()?, self.cfg)
    }

    /// Chain two networks: `first`'s outputs replace `second`'s inputs, and
    /// `first`'s output layer becomes a hidden layer of the result.
    pub fn merge(first: &Network, second: &Network, cfg: NetworkConfig) -> Result<Network> {
        if first.output_size() != second.input_size() {
            return Err(NetworkError::LayerSizeMismatch {
                expected: first.output_size(),
                actual: second.input_size(),
            });
        }
        let a = first.to_snapshot()?;
        let b = second.to_snapshot()?;
        let a_hidden = first.hidden_count();

        let mut merged = NetworkSnapshot::default();
        let mut a_outputs = Vec::with_capacity(first.output_size());
        for record in a.neurons {
            let mut record = record;
            if record.layer == LayerRef::Output {
                a_outputs.push(merged.neurons.len());
                record.layer = LayerRef::Hidden(a_hidden);
            }
            merged.neurons.push(record);
        }
        merged.connections = a.connections;

        // `second`'s input neuron i becomes `first`'s output neuron i.
        let mut remap = Vec::with_capacity(b.neurons.len());
        let mut inputs_seen = 0;
        for record in b.neurons {
            match record.layer {
                LayerRef::Input => {
                    remap.push(a_outputs[inputs_seen]);
                    inputs_seen += 1;
                }
                LayerRef::Hidden(i) => {
                    remap.push(merged.neurons.len());
                    merged.neurons.push(NeuronRecord {
                        layer: LayerRef::Hidden(a_hidden + 1 + i),
                        ..record
                    });
                }
                LayerRef::Output => {
                    remap.push(merged.neurons.len());
                    merged.neurons.push(record);
                }
            }
        }
        for c in b.connections {
            merged.connections.push(ConnectionRecord {
                from: remap[c.from],
                to: remap[c.to],
                weight: c.weight,
                gater: c.gater.map(|g| remap[g]),
            });
        }
        Network::from_snapshot(&merged, cfg)
    }

    fn live(&self, key: VarKey, stale: f64) -> f64 {
        self.program
            .as_ref()
            .and_then(|p| p.value(key))
            .unwrap_or(stale)
    }
}
