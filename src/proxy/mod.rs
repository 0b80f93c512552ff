//! Proxy lifecycle: sourcing, validation, scoring, and supervision
//!
//! The pool is exposed to the fetch layer as a single rotating front-door
//! (the supervised rotator binary). Three collaborators communicate
//! exclusively through the endpoint file, the routing header, and explicit
//! success/failure feedback into the scorer:
//!
//! - [`scorer::ProxyScorer`] owns the ordered live list and its on-disk view
//! - [`supervisor::RotatorSupervisor`] runs the rotator, which watches that
//!   file and reloads on change
//! - the dispatcher reports fetch outcomes back into the scorer

pub mod endpoint;
pub mod refresh;
pub mod scorer;
pub mod supervisor;
pub mod validator;

pub use endpoint::{Anonymity, ProxyEndpoint, Protocol};
pub use refresh::{RefreshConfig, RefreshPipeline};
pub use scorer::{ProxyScorer, ScorerConfig, Selection};
pub use supervisor::{RotatorConfig, RotatorSupervisor, SupervisorEvent};
pub use validator::{ProxyValidator, ValidatedProxy, ValidatorConfig};
