use std::io;

use thiserror::Error;

use crate::layer::LayerRef;
use crate::neuron::{ConnectionId, NeuronId};

pub type Result<T> = core::result::Result<T, NetworkError>;

/// Everything that can go wrong when building, running or persisting a network.
///
/// None of these are retried internally. An operation that returns an error
/// has not mutated the network.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("input length {actual} does not match input layer size {expected}")]
    InputSize { expected: usize, actual: usize },

    #[error("target length {actual} does not match output layer size {expected}")]
    TargetSize { expected: usize, actual: usize },

    #[error("learning rate must be finite and > 0, got {0}")]
    InvalidRate(f64),

    #[error("neuron {0} does not exist")]
    UnknownNeuron(NeuronId),

    #[error("connection {0} does not exist")]
    UnknownConnection(ConnectionId),

    #[error("layer {0:?} does not exist")]
    UnknownLayer(LayerRef),

    #[error("neuron {from} is not connected to neuron {to}")]
    NotConnected { from: NeuronId, to: NeuronId },

    #[error("layer size mismatch: expected {expected}, got {actual}")]
    LayerSizeMismatch { expected: usize, actual: usize },

    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    #[error("mutation not applicable: {0}")]
    MutationUnavailable(&'static str),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("snapshot json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image i/o: {0}")]
    Io(#[from] io::Error),
}
