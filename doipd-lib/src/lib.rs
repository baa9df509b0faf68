pub mod connection;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod header;
pub mod identity;
pub mod parser;
pub mod payload;
pub mod server;
pub mod transfer;
pub mod uds;

// Re-export commonly used types
pub use connection::{Connection, Phase};
pub use error::DoipError;
pub use header::{DoipHeader, ProtocolVersion, encode_frame};
pub use identity::EntityIdentity;
pub use parser::{DoipMessage, ParserEvent, StreamParser, parse_datagram};
pub use payload::{ActivationCode, DiagnosticNackCode, DoipPayload, HeaderNackCode, PayloadType};
pub use server::{DoipServer, ServerConfig, SharedState};
pub use transfer::{MemorySink, TransferExitPolicy, TransferSink};
pub use uds::{IdentityKey, KeyAlgorithm, Nrc, ServiceId, ServicePolicy, SessionType, UdsDispatcher, UdsSession};
