//! # gatenet
//!
//! Layered neural networks with gated connections, self-connections and
//! LSTM-g style eligibility traces, plus a flattening compiler that lowers a
//! network into one contiguous `f64` memory block and a list of typed
//! instructions.
//!
//! ## Quick Start
//!
//! ```
//! use gatenet::prelude::*;
//!
//! let cfg = NetworkConfig::default().with_seed(7);
//! let mut net = Network::perceptron(2, &[3], 1, cfg).unwrap();
//!
//! // The first call compiles the network into a flat program.
//! let out = net.activate(&[0.0, 1.0]).unwrap();
//! assert_eq!(out.len(), 1);
//! net.propagate(0.3, &[1.0]).unwrap();
//! assert!(net.is_compiled());
//!
//! // Structural edits restore the graph and drop the program.
//! let extra = net.add_neuron(LayerRef::Hidden(0)).unwrap();
//! assert!(!net.is_compiled());
//! assert!(net.neuron(extra).is_ok());
//! ```
//!
//! ## Execution Modes
//!
//! - [`ExecutionMode::Flat`] (default): compile on first use, run the flat
//!   program until the next structural edit.
//! - [`ExecutionMode::Graph`]: always walk the neuron graph.
//!
//! Both produce the same numbers; the flat program replays the graph
//! algorithms instruction for instruction.
//!
//! ## Feature Flags
//!
//! - `serde` (default): snapshots, binary images and serde derives
//!
//! ## Modules
//!
//! - [`graph`]: neuron arena and the per-neuron activate/propagate algorithms
//! - [`network`]: layers, execution modes and the structural API
//! - [`compiler`] / [`flat`]: flattening and the flat executor
//! - [`mutate`]: perturbation operators for neuroevolution
//! - [`snapshot`]: positional JSON snapshots and compressed images

#[path = "core/error.rs"]
pub mod error;

#[path = "core/squash.rs"]
pub mod squash;

#[path = "core/neuron.rs"]
pub mod neuron;

#[path = "core/graph.rs"]
pub mod graph;

#[path = "core/layer.rs"]
pub mod layer;

#[path = "core/flat.rs"]
pub mod flat;

#[path = "core/compiler.rs"]
pub mod compiler;

#[path = "core/network.rs"]
pub mod network;

#[path = "core/mutate.rs"]
pub mod mutate;

#[path = "core/storage.rs"]
pub mod storage;

#[cfg(feature = "serde")]
#[path = "core/snapshot.rs"]
pub mod snapshot;

pub use error::{NetworkError, Result};
pub use network::{ExecutionMode, Network, NetworkConfig};

/// Prelude module for convenient imports.
///
/// ```
/// use gatenet::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{NetworkError, Result};
    pub use crate::flat::{FlatProgram, Op, VarKey};
    pub use crate::layer::{ConnectionKind, GateKind, Layer, LayerConnection, LayerRef};
    pub use crate::mutate::{Mutation, Perturbation};
    pub use crate::network::{ExecutionMode, Network, NetworkConfig};
    pub use crate::neuron::{Connection, ConnectionId, Neuron, NeuronId};
    #[cfg(feature = "serde")]
    pub use crate::snapshot::{ConnectionRecord, LayerTag, NetworkSnapshot, NeuronRecord};
    pub use crate::squash::Squash;
}
