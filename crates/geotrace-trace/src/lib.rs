//! Traceroute orchestration: parsing, process running, geolocation and
//! per-client trace sessions.

pub mod emitter;
pub mod error;
pub mod geo;
pub mod parser;
pub mod runner;
pub mod session;
pub mod stream;

pub use emitter::SessionEmitter;
pub use error::TraceError;
pub use geo::{GeoLocator, IpApiLocator, NoopLocator, DEFAULT_GEO_URL};
pub use parser::{classify_line, parse_hop_line, parse_output, Dialect, LineKind};
pub use runner::{
    run_batch, run_traceroute, validate_target, RunnerEvent, TraceCommand, TraceSettings,
};
pub use session::{drive, TraceMode, TraceOutcome, TraceSession, Tracer};
pub use stream::{run_streaming, stream_for_target, LineBuffer};
