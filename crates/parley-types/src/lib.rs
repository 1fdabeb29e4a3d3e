//! Shared data model for parley.
//!
//! These types mirror the session service's JSON shapes. They carry no
//! behaviour beyond constructors and read-only helpers; ordering, correlation
//! and lifecycle rules live in `parley-core`.

pub mod message;
pub mod service;
pub mod session;

pub use message::{
    ContentKind, Message, MessageContent, MessageMetadata, Role, ToolConfirmationRequest,
    ToolRequest, ToolResponse, ToolResult,
};
pub use service::{Envelope, ServiceError, ServiceErrorKind};
pub use session::{ManageAction, Session, SummarizeResponse};
