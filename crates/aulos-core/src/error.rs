//! Engine error types

use thiserror::Error;

/// Errors that can occur while configuring the playback engine
///
/// Nothing here is fatal to playback: converter and stretcher construction
/// failures degrade to unconverted/unstretched output, and registration
/// conflicts leave the previously negotiated configuration in place.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Sample rate converter could not be constructed
    #[error("Failed to create sample rate converter: {0}")]
    ConverterInit(String),

    /// Time stretcher could not be constructed
    #[error("Failed to create time stretcher: {0}")]
    StretcherInit(String),

    /// A registered model disagrees with the negotiated sample rate
    #[error("Sample rate mismatch: model is {model} Hz, engine negotiated {negotiated} Hz")]
    SampleRateMismatch { model: u32, negotiated: u32 },

    /// A model with no audio channels was registered
    #[error("Model has no audio channels")]
    EmptyModel,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
