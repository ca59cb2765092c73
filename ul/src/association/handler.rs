//! Service handlers, which answer DIMSE requests
//! on behalf of an association acceptor.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::dimse::commands::{self, status};
use crate::dimse::DimseMessage;

/// What a handler knows about the request it is handling.
#[derive(Debug, Clone, Copy)]
pub struct ServiceContext<'a> {
    pub presentation_context_id: u8,
    pub abstract_syntax: &'a str,
    pub transfer_syntax: &'a str,
    pub calling_ae_title: &'a str,
    pub called_ae_title: &'a str,
}

/// The answer of a handler to a request.
pub enum ServiceResponse {
    /// a single response with this status and no data set
    Status(u16),
    /// a finite sequence of response messages,
    /// sent in order as they are produced
    Stream(Box<dyn Iterator<Item = DimseMessage> + Send>),
}

impl fmt::Debug for ServiceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceResponse::Status(status) => write!(f, "Status({:#06x})", status),
            ServiceResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A service class provider for one or more abstract syntaxes.
///
/// Implementations receive their collaborators when constructed,
/// and are shared by all associations of a server.
pub trait ServiceHandler: Send + Sync {
    fn handle(&self, request: &DimseMessage, context: &ServiceContext<'_>) -> ServiceResponse;
}

/// Handlers by abstract syntax UID.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an abstract syntax,
    /// replacing any previous one.
    pub fn register<H>(&mut self, abstract_syntax: impl Into<String>, handler: H)
    where
        H: ServiceHandler + 'static,
    {
        self.register_shared(abstract_syntax, Arc::new(handler));
    }

    pub fn register_shared(
        &mut self,
        abstract_syntax: impl Into<String>,
        handler: Arc<dyn ServiceHandler>,
    ) {
        let abstract_syntax = abstract_syntax.into();
        debug!("Registering handler for {}", abstract_syntax);
        self.handlers.insert(abstract_syntax, handler);
    }

    pub fn with<H>(mut self, abstract_syntax: impl Into<String>, handler: H) -> Self
    where
        H: ServiceHandler + 'static,
    {
        self.register(abstract_syntax, handler);
        self
    }

    pub fn get(&self, abstract_syntax: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(abstract_syntax).cloned()
    }

    pub fn contains(&self, abstract_syntax: &str) -> bool {
        self.handlers.contains_key(abstract_syntax)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// The Verification service class provider, answering C-ECHO.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct VerificationService;

impl ServiceHandler for VerificationService {
    fn handle(&self, request: &DimseMessage, context: &ServiceContext<'_>) -> ServiceResponse {
        match request.command_field() {
            Ok(commands::C_ECHO_RQ) => {
                debug!("C-ECHO from {}", context.calling_ae_title);
                ServiceResponse::Status(status::SUCCESS)
            }
            _ => ServiceResponse::Status(status::UNRECOGNIZED_OPERATION),
        }
    }
}
