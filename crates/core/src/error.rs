//! Tagged error type shared across all crates
//!
//! Every error carries a [`Kind`], the operation that produced it, a human
//! message, and an optional cause. Wrapping an already-tagged error keeps the
//! innermost tag, so double-wrapping is idempotent.

use std::fmt;

/// Error classification used for propagation policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Bad or missing configuration
    Config,
    /// Domain rule violation (activation, validation, state machine)
    Domain,
    /// Network / upstream transport failure
    Transport,
    /// Upstream platform rejected the request (auth, quota, protocol)
    Platform,
    /// Bootstrap step failure
    Bootstrap,
    /// Persistent storage failure
    Storage,
    /// Vision upload policy or decode failure
    Vision,
    /// Anything unclassified
    Unknown,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Config => "config",
            Kind::Domain => "domain",
            Kind::Transport => "transport",
            Kind::Platform => "platform",
            Kind::Bootstrap => "bootstrap",
            Kind::Storage => "storage",
            Kind::Vision => "vision",
            Kind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The workspace-wide error type.
pub struct Error {
    kind: Kind,
    op: String,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: Kind, op: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            op: op.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach a cause. If the cause is itself an [`Error`], its kind wins —
    /// the innermost tag is the one that matters for policy.
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let source = source.into();
        if let Some(inner) = source.downcast_ref::<Error>() {
            self.kind = inner.kind;
        }
        self.source = Some(source);
        self
    }

    /// Wrap an arbitrary error under this kind and operation.
    pub fn wrap(
        kind: Kind,
        op: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let source = source.into();
        let message = source.to_string();
        Self::new(kind, op, message).with_source(source)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_kind(&self, kind: Kind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.op, self.kind, self.message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("kind", &self.kind)
            .field("op", &self.op)
            .field("message", &self.message);
        if let Some(src) = &self.source {
            d.field("source", &src.to_string());
        }
        d.finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shorthand constructors, one per kind.
macro_rules! kind_ctor {
    ($name:ident, $kind:expr) => {
        pub fn $name(op: impl Into<String>, message: impl Into<String>) -> Error {
            Error::new($kind, op, message)
        }
    };
}

impl Error {
    kind_ctor!(config, Kind::Config);
    kind_ctor!(domain, Kind::Domain);
    kind_ctor!(transport, Kind::Transport);
    kind_ctor!(platform, Kind::Platform);
    kind_ctor!(bootstrap, Kind::Bootstrap);
    kind_ctor!(storage, Kind::Storage);
    kind_ctor!(vision, Kind::Vision);
    kind_ctor!(unknown, Kind::Unknown);
}
