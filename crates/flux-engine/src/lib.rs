//! Task-completion core for the Flux image API: the authenticated request
//! facade, the retrying task poller and the origin validator that screens
//! caller-supplied image references.

pub mod client;
pub mod error;
pub mod inputs;
pub mod origin;
pub mod payload;
pub mod poller;
pub mod transport;

pub use client::{ClientConfig, FluxClient};
pub use error::{ApiError, PollError, PollFailureKind};
pub use inputs::{resolve_image_reference, ImageReference, InputError};
pub use origin::{
    OriginClassification, OriginRejection, OriginValidator, RejectionReason, Resolver,
    SystemResolver,
};
pub use payload::{GenerationRequest, OutputFormat};
pub use poller::{CancellationToken, Clock, PollOptions, SystemClock, TaskPoller, TaskSource};
pub use transport::{HttpTransport, ReqwestTransport, TransportError, TransportErrorKind};
